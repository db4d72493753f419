use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use bazaar_db::models::{MessageRow, PriceOfferRow};
use bazaar_db::{Database, timestamp};
use bazaar_types::models::{
    Conversation, Message, OutgoingMessage, PriceOffer, PriceOfferStatus, Profile,
};

use crate::error::ChatError;
use crate::rows;

/// Longest text body accepted by `send`, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Fetch/insert/mark-read operations on conversations and messages.
///
/// Every call is an awaited suspension point: the blocking SQLite work runs
/// on the blocking pool, off the async runtime. Failures surface as
/// [`ChatError::Delivery`]; nothing here retries.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> Result<T, ChatError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ChatError::Delivery(anyhow::anyhow!("task join error: {}", e))
            })?
    }

    // -- Conversations --

    /// Return the conversation for (listing, buyer, seller), creating it on
    /// first contact.
    pub async fn open_conversation(
        &self,
        listing_id: Uuid,
        buyer_id: Uuid,
        seller_id: Uuid,
    ) -> Result<Conversation, ChatError> {
        if buyer_id == seller_id {
            return Err(ChatError::InvalidPayload(
                "You can't start a conversation with yourself.".to_string(),
            ));
        }

        self.blocking(move |db| {
            let (lid, bid, sid) = (listing_id.to_string(), buyer_id.to_string(), seller_id.to_string());
            if let Some(row) = db.find_conversation(&lid, &bid, &sid)? {
                return rows::conversation(row).ok_or(ChatError::NotFound("conversation", listing_id));
            }

            let id = Uuid::new_v4();
            db.create_conversation(&id.to_string(), &lid, &bid, &sid)?;
            info!("Conversation {} created for listing {}", id, listing_id);

            db.get_conversation(&id.to_string())?
                .and_then(rows::conversation)
                .ok_or(ChatError::NotFound("conversation", id))
        })
        .await
    }

    pub async fn conversation(&self, conversation_id: Uuid) -> Result<Conversation, ChatError> {
        self.blocking(move |db| load_conversation(db, conversation_id)).await
    }

    /// Explicit user deletion. Messages, offers and reactions go with it.
    pub async fn delete_conversation(&self, conversation_id: Uuid, caller: Uuid) -> Result<(), ChatError> {
        self.blocking(move |db| {
            let conversation = load_conversation(db, conversation_id)?;
            ensure_participant(&conversation, caller)?;
            db.delete_conversation(&conversation_id.to_string())?;
            info!("Conversation {} deleted by {}", conversation_id, caller);
            Ok(())
        })
        .await
    }

    pub async fn set_muted(&self, conversation_id: Uuid, caller: Uuid, muted: bool) -> Result<(), ChatError> {
        self.blocking(move |db| {
            let conversation = load_conversation(db, conversation_id)?;
            ensure_participant(&conversation, caller)?;
            db.set_muted(&conversation_id.to_string(), &caller.to_string(), muted)?;
            Ok(())
        })
        .await
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<Profile, ChatError> {
        self.blocking(move |db| {
            db.get_profile(&user_id.to_string())?
                .and_then(rows::profile)
                .ok_or(ChatError::NotFound("profile", user_id))
        })
        .await
    }

    /// True if either party has blocked the other.
    pub async fn is_blocked(&self, a: Uuid, b: Uuid) -> Result<bool, ChatError> {
        self.blocking(move |db| Ok(db.is_blocked_either(&a.to_string(), &b.to_string())?))
            .await
    }

    // -- Messages --

    /// All messages of the conversation, oldest first.
    ///
    /// Side effect: every unread message addressed to `caller` is marked
    /// read before the list is fetched.
    pub async fn list_messages(&self, conversation_id: Uuid, caller: Uuid) -> Result<Vec<Message>, ChatError> {
        self.blocking(move |db| {
            let conversation = load_conversation(db, conversation_id)?;
            ensure_participant(&conversation, caller)?;

            let cid = conversation_id.to_string();
            match db.mark_conversation_read(&cid, &caller.to_string()) {
                Ok(0) => {}
                Ok(n) => debug!("Marked {} messages read in {}", n, conversation_id),
                Err(e) => warn!("mark read failed for {}: {}", conversation_id, e),
            }

            let mut messages: Vec<Message> = db
                .get_messages(&cid)?
                .into_iter()
                .filter_map(rows::message)
                .collect();
            messages.sort_by_key(|m| m.created_at);
            Ok(messages)
        })
        .await
    }

    /// Send a message as `sender`. The receiver is always the other party
    /// of the conversation, never caller input.
    pub async fn send(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        outgoing: OutgoingMessage,
    ) -> Result<Message, ChatError> {
        validate(&outgoing)?;

        self.blocking(move |db| {
            let conversation = load_conversation(db, conversation_id)?;
            let receiver = conversation
                .counterpart_of(sender)
                .ok_or(ChatError::NotParticipant { user: sender, conversation: conversation_id })?;

            if db.is_blocked_either(&sender.to_string(), &receiver.to_string())? {
                debug!("Send in {} refused, parties are blocked", conversation_id);
                return Err(ChatError::Blocked);
            }

            let now = Utc::now();
            let mut row = MessageRow {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: sender.to_string(),
                receiver_id: receiver.to_string(),
                content: String::new(),
                kind: outgoing.kind().as_str().to_string(),
                media_url: None,
                latitude: None,
                longitude: None,
                location_name: None,
                offer_id: None,
                is_read: false,
                created_at: timestamp(now),
            };

            match outgoing {
                OutgoingMessage::Text { content } => {
                    row.content = content.trim().to_string();
                    db.insert_message(&row)?;
                }
                OutgoingMessage::Image { media_url, caption } => {
                    row.content = caption.trim().to_string();
                    row.media_url = Some(media_url);
                    db.insert_message(&row)?;
                }
                OutgoingMessage::Location { latitude, longitude, name } => {
                    row.content = name.clone();
                    row.latitude = Some(latitude);
                    row.longitude = Some(longitude);
                    row.location_name = Some(name);
                    db.insert_message(&row)?;
                }
                OutgoingMessage::PriceOffer { amount } => {
                    let offer = PriceOfferRow {
                        id: Uuid::new_v4().to_string(),
                        conversation_id: conversation_id.to_string(),
                        listing_id: conversation.listing_id.to_string(),
                        sender_id: sender.to_string(),
                        receiver_id: receiver.to_string(),
                        amount,
                        status: PriceOfferStatus::Pending.as_str().to_string(),
                        created_at: timestamp(now),
                    };
                    row.content = format!("Offered {}", format_amount(amount));
                    row.offer_id = Some(offer.id.clone());
                    db.insert_offer_message(&offer, &row)?;
                }
            }

            let id = row.id.clone();
            rows::message(row).ok_or_else(|| ChatError::Delivery(anyhow::anyhow!("unreadable message {}", id)))
        })
        .await
    }

    pub async fn mark_read(&self, message_ids: &[Uuid]) -> Result<usize, ChatError> {
        let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        self.blocking(move |db| Ok(db.mark_messages_read(&ids)?)).await
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<u64, ChatError> {
        self.blocking(move |db| Ok(db.unread_count(&user_id.to_string())?))
            .await
    }

    // -- Price offers --

    pub async fn offers(&self, conversation_id: Uuid) -> Result<Vec<PriceOffer>, ChatError> {
        self.blocking(move |db| {
            Ok(db
                .get_offers_for_conversation(&conversation_id.to_string())?
                .into_iter()
                .filter_map(rows::offer)
                .collect())
        })
        .await
    }

    /// Accept or reject a pending offer. Only the receiver may respond and
    /// an offer moves out of `Pending` at most once.
    pub async fn respond_to_offer(
        &self,
        offer_id: Uuid,
        responder: Uuid,
        accept: bool,
    ) -> Result<PriceOffer, ChatError> {
        self.blocking(move |db| {
            let id = offer_id.to_string();
            let offer = db
                .get_offer(&id)?
                .and_then(rows::offer)
                .ok_or(ChatError::NotFound("offer", offer_id))?;

            if offer.receiver_id != responder {
                return Err(ChatError::NotParticipant {
                    user: responder,
                    conversation: offer.conversation_id,
                });
            }

            let next = offer.status.respond(accept).ok_or_else(|| {
                ChatError::InvalidTransition(format!("This offer was already {}.", offer.status.as_str()))
            })?;

            if !db.update_offer_status(&id, offer.status.as_str(), next.as_str())? {
                return Err(ChatError::InvalidTransition(
                    "This offer was answered in the meantime.".to_string(),
                ));
            }

            info!("Offer {} {}", offer_id, next.as_str());
            Ok(PriceOffer { status: next, ..offer })
        })
        .await
    }
}

pub(crate) fn load_conversation(db: &Database, conversation_id: Uuid) -> Result<Conversation, ChatError> {
    db.get_conversation(&conversation_id.to_string())?
        .and_then(rows::conversation)
        .ok_or(ChatError::NotFound("conversation", conversation_id))
}

pub(crate) fn ensure_participant(conversation: &Conversation, user: Uuid) -> Result<(), ChatError> {
    if conversation.is_participant(user) {
        Ok(())
    } else {
        Err(ChatError::NotParticipant { user, conversation: conversation.id })
    }
}

fn validate(outgoing: &OutgoingMessage) -> Result<(), ChatError> {
    let invalid = |reason: &str| Err(ChatError::InvalidPayload(reason.to_string()));
    match outgoing {
        OutgoingMessage::Text { content } => {
            if content.trim().is_empty() {
                return invalid("Message is empty.");
            }
            if content.chars().count() > MAX_CONTENT_CHARS {
                return invalid("Message is too long.");
            }
        }
        OutgoingMessage::Image { media_url, .. } => {
            if media_url.trim().is_empty() {
                return invalid("Image is missing.");
            }
        }
        OutgoingMessage::Location { latitude, longitude, .. } => {
            if !(-90.0..=90.0).contains(latitude) || !(-180.0..=180.0).contains(longitude) {
                return invalid("Location is out of range.");
            }
        }
        OutgoingMessage::PriceOffer { amount } => {
            if *amount <= 0 {
                return invalid("Offer must be more than zero.");
            }
        }
    }
    Ok(())
}

/// Minor units to a two-decimal display string.
pub fn format_amount(amount: i64) -> String {
    format!("{}.{:02}", amount / 100, amount % 100)
}
