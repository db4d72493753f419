//! Row -> model conversion. Corrupt rows are logged and skipped rather than
//! failing the whole fetch.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use bazaar_db::models::{ConversationRow, MessageRow, PriceOfferRow, ProfileRow, ReactionRow};
use bazaar_types::models::{
    Conversation, Message, MessageKind, MessagePayload, PresenceState, PriceOffer, Profile,
    Reaction,
};

fn uuid(value: &str, what: &str, row_id: &str) -> Option<Uuid> {
    value
        .parse()
        .map_err(|e| warn!("Corrupt {} '{}' on row '{}': {}", what, value, row_id, e))
        .ok()
}

fn ts(value: &str, row_id: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|e| warn!("Corrupt timestamp '{}' on row '{}': {}", value, row_id, e))
        .ok()
}

pub(crate) fn profile(row: ProfileRow) -> Option<Profile> {
    Some(Profile {
        id: uuid(&row.id, "id", &row.id)?,
        display_name: row.display_name.clone(),
        presence: PresenceState {
            is_online: row.is_online,
            last_seen: row.last_seen.as_deref().and_then(|v| ts(v, &row.id)),
            typing_in_conversation: row
                .typing_in_conversation
                .as_deref()
                .and_then(|v| uuid(v, "typing_in_conversation", &row.id)),
        },
    })
}

pub(crate) fn conversation(row: ConversationRow) -> Option<Conversation> {
    let muted_by: BTreeSet<Uuid> = row
        .muted_by
        .iter()
        .filter_map(|u| uuid(u, "muted user", &row.id))
        .collect();
    Some(Conversation {
        id: uuid(&row.id, "id", &row.id)?,
        buyer_id: uuid(&row.buyer_id, "buyer_id", &row.id)?,
        seller_id: uuid(&row.seller_id, "seller_id", &row.id)?,
        listing_id: uuid(&row.listing_id, "listing_id", &row.id)?,
        muted_by,
        created_at: ts(&row.created_at, &row.id)?,
    })
}

pub(crate) fn message(row: MessageRow) -> Option<Message> {
    let kind: MessageKind = row
        .kind
        .parse()
        .map_err(|e| warn!("Corrupt message '{}': {}", row.id, e))
        .ok()?;

    let payload = match kind {
        MessageKind::Text => MessagePayload::Text,
        MessageKind::Image => MessagePayload::Image {
            media_url: row.media_url.clone()?,
        },
        MessageKind::Location => MessagePayload::Location {
            latitude: row.latitude?,
            longitude: row.longitude?,
            name: row.location_name.clone().unwrap_or_default(),
        },
        MessageKind::PriceOffer => MessagePayload::PriceOffer {
            offer_id: uuid(row.offer_id.as_deref()?, "offer_id", &row.id)?,
        },
    };

    Some(Message {
        id: uuid(&row.id, "id", &row.id)?,
        conversation_id: uuid(&row.conversation_id, "conversation_id", &row.id)?,
        sender_id: uuid(&row.sender_id, "sender_id", &row.id)?,
        receiver_id: uuid(&row.receiver_id, "receiver_id", &row.id)?,
        content: row.content,
        payload,
        is_read: row.is_read,
        created_at: ts(&row.created_at, &row.id)?,
    })
}

pub(crate) fn offer(row: PriceOfferRow) -> Option<PriceOffer> {
    Some(PriceOffer {
        id: uuid(&row.id, "id", &row.id)?,
        conversation_id: uuid(&row.conversation_id, "conversation_id", &row.id)?,
        listing_id: uuid(&row.listing_id, "listing_id", &row.id)?,
        sender_id: uuid(&row.sender_id, "sender_id", &row.id)?,
        receiver_id: uuid(&row.receiver_id, "receiver_id", &row.id)?,
        amount: row.amount,
        status: row
            .status
            .parse()
            .map_err(|e| warn!("Corrupt offer '{}': {}", row.id, e))
            .ok()?,
        created_at: ts(&row.created_at, &row.id)?,
    })
}

pub(crate) fn reaction(row: ReactionRow) -> Option<Reaction> {
    Some(Reaction {
        message_id: uuid(&row.message_id, "message_id", &row.message_id)?,
        user_id: uuid(&row.user_id, "user_id", &row.message_id)?,
        emoji: row.emoji.clone(),
        created_at: ts(&row.created_at, &row.message_id)?,
    })
}
