use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Profiles / presence --

/// Presence is a single mutable record per user, last writer wins.
/// `typing_in_conversation` is one field shared across all of the user's
/// conversations, so only the most recent conversation is ever reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub typing_in_conversation: Option<Uuid>,
}

impl PresenceState {
    pub fn is_typing_in(&self, conversation_id: Uuid) -> bool {
        self.typing_in_conversation == Some(conversation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub presence: PresenceState,
}

// -- Conversations --

/// A thread between exactly two users, anchored to one listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub listing_id: Uuid,
    pub muted_by: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        user_id == self.buyer_id || user_id == self.seller_id
    }

    /// The other party of the conversation, or `None` if `user_id` is not in it.
    pub fn counterpart_of(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.buyer_id {
            Some(self.seller_id)
        } else if user_id == self.seller_id {
            Some(self.buyer_id)
        } else {
            None
        }
    }
}

// -- Messages --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Location,
    PriceOffer,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Location => "location",
            Self::PriceOffer => "price_offer",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "location" => Ok(Self::Location),
            "price_offer" => Ok(Self::PriceOffer),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Type-specific part of a stored message. Exactly one variant per kind,
/// so a message can never carry two payloads at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text,
    Image { media_url: String },
    Location { latitude: f64, longitude: f64, name: String },
    PriceOffer { offer_id: Uuid },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::Location { .. } => MessageKind::Location,
            Self::PriceOffer { .. } => MessageKind::PriceOffer,
        }
    }
}

/// Messages are never content-edited; only `is_read` changes after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub payload: MessagePayload,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// What a caller hands to `send`. The receiver is never part of it: it is
/// resolved from the conversation's buyer/seller pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Text { content: String },
    Image { media_url: String, caption: String },
    Location { latitude: f64, longitude: f64, name: String },
    /// Amount in minor currency units.
    PriceOffer { amount: i64 },
}

impl OutgoingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::Location { .. } => MessageKind::Location,
            Self::PriceOffer { .. } => MessageKind::PriceOffer,
        }
    }
}

// -- Price offers --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceOfferStatus {
    Pending,
    Accepted,
    Rejected,
}

impl PriceOfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    /// Monotonic: only `Pending` may move, and only forward.
    pub fn respond(self, accept: bool) -> Option<Self> {
        match self {
            Self::Pending if accept => Some(Self::Accepted),
            Self::Pending => Some(Self::Rejected),
            Self::Accepted | Self::Rejected => None,
        }
    }
}

impl FromStr for PriceOfferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown offer status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceOffer {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub listing_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub amount: i64,
    pub status: PriceOfferStatus,
    pub created_at: DateTime<Utc>,
}

// -- Reactions --

/// Identity is the (message_id, user_id, emoji) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

// -- Push registration --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Prompt,
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }
}

impl FromStr for PermissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(Self::Prompt),
            "granted" => Ok(Self::Granted),
            "denied" => Ok(Self::Denied),
            other => Err(format!("unknown permission status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRegistration {
    pub user_id: Uuid,
    pub token: String,
    pub permission: PermissionStatus,
    pub updated_at: DateTime<Utc>,
}
