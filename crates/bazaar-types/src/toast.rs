use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Error,
}

/// A non-fatal, user-facing notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub title: String,
    pub body: String,
}

/// Sending half of the UI toast queue. Cheap to clone; sends never block
/// and never fail loudly once the UI side has gone away.
#[derive(Debug, Clone)]
pub struct Toasts {
    tx: Option<mpsc::UnboundedSender<Toast>>,
}

impl Toasts {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Toast>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything, for headless use.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn info(&self, title: impl Into<String>, body: impl Into<String>) {
        self.push(Toast {
            level: ToastLevel::Info,
            title: title.into(),
            body: body.into(),
        });
    }

    pub fn error(&self, body: impl Into<String>) {
        self.push(Toast {
            level: ToastLevel::Error,
            title: "Something went wrong".to_string(),
            body: body.into(),
        });
    }

    fn push(&self, toast: Toast) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(toast).is_err() {
            debug!("Toast dropped, UI receiver closed");
        }
    }
}
