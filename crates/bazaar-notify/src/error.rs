use thiserror::Error;

#[derive(Error, Debug)]
pub enum PushError {
    #[error("push notifications are not supported on this platform")]
    Unsupported,

    /// The user refused permission. Terminal until re-triggered from settings.
    #[error("push permission denied")]
    Denied,

    #[error("push platform error: {0}")]
    Platform(String),

    #[error("failed to persist push registration: {0}")]
    Persist(#[from] anyhow::Error),
}
