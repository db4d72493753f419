use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Network or data-service failure. Not retried; the user re-submits.
    #[error("delivery failed: {0}")]
    Delivery(#[from] anyhow::Error),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, Uuid),

    #[error("user {user} is not part of conversation {conversation}")]
    NotParticipant { user: Uuid, conversation: Uuid },

    #[error("conversation is blocked")]
    Blocked,

    #[error("conversation was deleted")]
    Closed,

    #[error("conversation is still loading")]
    NotReady,

    #[error("invalid message: {0}")]
    InvalidPayload(String),

    #[error("invalid offer transition: {0}")]
    InvalidTransition(String),
}

impl ChatError {
    /// Text for the non-fatal toast shown at the operation boundary.
    pub fn user_message(&self) -> String {
        match self {
            Self::Delivery(_) => "Couldn't reach the server. Please try again.".to_string(),
            Self::NotFound(what, _) => format!("That {what} no longer exists."),
            Self::NotParticipant { .. } => "You're not part of this conversation.".to_string(),
            Self::Blocked => "You can't send messages in this conversation.".to_string(),
            Self::Closed => "This conversation was deleted.".to_string(),
            Self::NotReady => "Still loading, try again in a moment.".to_string(),
            Self::InvalidPayload(reason) => reason.clone(),
            Self::InvalidTransition(reason) => reason.clone(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }
}
