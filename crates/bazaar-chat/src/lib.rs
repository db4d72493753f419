//! Real-time conversation engine.
//!
//! [`MessageStore`], [`PresenceTracker`] and [`ReactionLedger`] wrap the data
//! service; [`ConversationSession`] composes them into the controller for one
//! open chat window.

pub mod error;
pub mod message_store;
pub mod presence;
pub mod reactions;
mod rows;
pub mod session;
pub mod typing;

use std::sync::Arc;

use bazaar_db::Database;
use bazaar_realtime::ChangeFeed;
use bazaar_types::toast::Toasts;

pub use error::ChatError;
pub use message_store::MessageStore;
pub use presence::PresenceTracker;
pub use reactions::{ReactionLedger, ReactionToggle};
pub use session::{ConversationSession, MessageView, SessionState, SessionView};
pub use typing::{TYPING_WINDOW, TypingDebouncer};

/// Everything a conversation session needs, shared by all sessions of one
/// signed-in user.
#[derive(Clone)]
pub struct ChatServices {
    pub store: MessageStore,
    pub reactions: ReactionLedger,
    pub presence: Arc<PresenceTracker>,
    pub feed: ChangeFeed,
    pub toasts: Toasts,
}

impl ChatServices {
    pub fn new(db: Arc<Database>, presence: Arc<PresenceTracker>, toasts: Toasts) -> Self {
        Self {
            feed: db.feed().clone(),
            store: MessageStore::new(db.clone()),
            reactions: ReactionLedger::new(db),
            presence,
            toasts,
        }
    }
}
