/// Row types, one field per SQLite column. Ids and timestamps stay strings here.
/// Distinct from bazaar-types models to keep the DB layer independent.

pub struct ProfileRow {
    pub id: String,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen: Option<String>,
    pub typing_in_conversation: Option<String>,
}

pub struct ConversationRow {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub listing_id: String,
    pub created_at: String,
    pub muted_by: Vec<String>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub kind: String,
    pub media_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_name: Option<String>,
    pub offer_id: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

pub struct PriceOfferRow {
    pub id: String,
    pub conversation_id: String,
    pub listing_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub amount: i64,
    pub status: String,
    pub created_at: String,
}

pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct PushRegistrationRow {
    pub user_id: String,
    pub token: String,
    pub permission: String,
    pub updated_at: String,
}

/// Outcome of a conditional reaction write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionSwap {
    Added,
    Removed,
    /// The row was already in the requested state, a concurrent toggle won.
    Unchanged,
}
