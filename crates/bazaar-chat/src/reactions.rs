use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use bazaar_db::Database;
use bazaar_db::models::ReactionSwap;
use bazaar_types::models::{Reaction, ReactionGroup};

use crate::error::ChatError;
use crate::message_store::{ensure_participant, load_conversation};
use crate::rows;

const MAX_EMOJI_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    Added,
    Removed,
    /// A concurrent toggle from the same user already flipped the row.
    Unchanged,
}

/// Per-message emoji reactions with idempotent toggle semantics.
#[derive(Clone)]
pub struct ReactionLedger {
    db: Arc<Database>,
}

impl ReactionLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Remove the (message, user, emoji) reaction if present, add it if not.
    ///
    /// The message must belong to `conversation_id` and `user_id` must take
    /// part in it. The current state is read first and the write is
    /// conditional on that observation still holding, so a double tap can
    /// never leave two rows.
    pub async fn toggle(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> Result<ReactionToggle, ChatError> {
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
            return Err(ChatError::InvalidPayload("That reaction isn't supported.".to_string()));
        }

        let db = self.db.clone();
        let swap = tokio::task::spawn_blocking(move || -> Result<ReactionSwap, ChatError> {
            let conversation = load_conversation(&db, conversation_id)?;
            ensure_participant(&conversation, user_id)?;

            let mid = message_id.to_string();
            let message = db
                .get_message(&mid)?
                .ok_or(ChatError::NotFound("message", message_id))?;
            if message.conversation_id != conversation_id.to_string() {
                warn!("Reaction on {} refused, it belongs to another conversation", message_id);
                return Err(ChatError::NotParticipant {
                    user: user_id,
                    conversation: conversation_id,
                });
            }

            let uid = user_id.to_string();
            let present = db
                .get_reactions_for_message(&mid)?
                .iter()
                .any(|r| r.user_id == uid && r.emoji == emoji);
            Ok(db.swap_reaction(&mid, &uid, &emoji, present)?)
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ChatError::Delivery(anyhow::anyhow!("task join error: {}", e))
        })??;

        let outcome = match swap {
            ReactionSwap::Added => ReactionToggle::Added,
            ReactionSwap::Removed => ReactionToggle::Removed,
            ReactionSwap::Unchanged => ReactionToggle::Unchanged,
        };
        debug!("Reaction toggle on {} by {}: {:?}", message_id, user_id, outcome);
        Ok(outcome)
    }

    /// Grouped reactions per message for display.
    pub async fn reactions_for(&self, message_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<ReactionGroup>>, ChatError> {
        let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        let db = self.db.clone();
        let rows = tokio::task::spawn_blocking(move || db.get_reactions_for_messages(&ids))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ChatError::Delivery(anyhow::anyhow!("task join error: {}", e))
            })??;

        let mut by_message: HashMap<Uuid, Vec<Reaction>> = HashMap::new();
        for reaction in rows.into_iter().filter_map(rows::reaction) {
            by_message.entry(reaction.message_id).or_default().push(reaction);
        }

        Ok(by_message
            .into_iter()
            .map(|(id, reactions)| (id, group_reactions(&reactions)))
            .collect())
    }
}

/// Group by emoji with a count and the reacting users. Groups keep the
/// order in which each emoji was first used.
pub fn group_reactions(reactions: &[Reaction]) -> Vec<ReactionGroup> {
    let mut order: Vec<&str> = Vec::new();
    let mut users: HashMap<&str, BTreeSet<Uuid>> = HashMap::new();

    for r in reactions {
        let set = users.entry(r.emoji.as_str()).or_insert_with(|| {
            order.push(r.emoji.as_str());
            BTreeSet::new()
        });
        set.insert(r.user_id);
    }

    order
        .into_iter()
        .map(|emoji| {
            let user_ids: Vec<Uuid> = users.remove(emoji).unwrap_or_default().into_iter().collect();
            ReactionGroup {
                emoji: emoji.to_string(),
                count: user_ids.len(),
                user_ids,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reaction(user: Uuid, emoji: &str) -> Reaction {
        Reaction {
            message_id: Uuid::nil(),
            user_id: user,
            emoji: emoji.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn groups_by_emoji_in_first_use_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let groups = group_reactions(&[
            reaction(a, "❤️"),
            reaction(b, "👍"),
            reaction(b, "❤️"),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].emoji, "❤️");
        assert_eq!(groups[0].count, 2);
        assert!(groups[0].user_ids.contains(&a) && groups[0].user_ids.contains(&b));
        assert_eq!(groups[1].emoji, "👍");
        assert_eq!(groups[1].user_ids, vec![b]);
    }

    #[test]
    fn no_reactions_no_groups() {
        assert!(group_reactions(&[]).is_empty());
    }
}
