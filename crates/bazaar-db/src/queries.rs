use crate::models::{
    ConversationRow, MessageRow, PriceOfferRow, ProfileRow, PushRegistrationRow, ReactionRow,
    ReactionSwap,
};
use crate::{Database, timestamp};
use anyhow::{Result, anyhow};
use bazaar_types::events::{ChangeEvent, ChangeKind, Table};
use chrono::Utc;
use rusqlite::{Connection, Row, TransactionBehavior};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, receiver_id, content, kind, \
     media_url, latitude, longitude, location_name, offer_id, is_read, created_at";

const OFFER_COLUMNS: &str =
    "id, conversation_id, listing_id, sender_id, receiver_id, amount, status, created_at";

impl Database {
    // -- Profiles --

    pub fn create_profile(&self, id: &str, display_name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, created_at) VALUES (?1, ?2, ?3)",
                (id, display_name, timestamp(Utc::now())),
            )?;
            Ok(())
        })?;
        self.publish(ChangeEvent::new(Table::Profiles, ChangeKind::Insert).with_key("id", id));
        Ok(())
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, display_name, is_online, last_seen, typing_in_conversation
                 FROM profiles WHERE id = ?1",
                [id],
                |row| {
                    Ok(ProfileRow {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        is_online: row.get(2)?,
                        last_seen: row.get(3)?,
                        typing_in_conversation: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Heartbeat write: online flag plus last-seen stamp.
    pub fn set_online(&self, id: &str, online: bool) -> Result<()> {
        self.update_profile(id, |conn| {
            if online {
                conn.execute(
                    "UPDATE profiles SET is_online = 1, last_seen = ?2 WHERE id = ?1",
                    (id, timestamp(Utc::now())),
                )
            } else {
                conn.execute(
                    "UPDATE profiles SET is_online = 0, last_seen = ?2, typing_in_conversation = NULL
                     WHERE id = ?1",
                    (id, timestamp(Utc::now())),
                )
            }
        })
    }

    /// Last writer wins; `None` clears the field.
    pub fn set_typing(&self, id: &str, conversation_id: Option<&str>) -> Result<()> {
        self.update_profile(id, |conn| {
            conn.execute(
                "UPDATE profiles SET typing_in_conversation = ?2 WHERE id = ?1",
                (id, conversation_id),
            )
        })
    }

    fn update_profile<F>(&self, id: &str, write: F) -> Result<()>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<usize>,
    {
        let changed = self.with_conn(|conn| Ok(write(conn)?))?;
        if changed == 0 {
            return Err(anyhow!("Profile not found: {}", id));
        }
        self.publish(ChangeEvent::new(Table::Profiles, ChangeKind::Update).with_key("id", id));
        Ok(())
    }

    // -- Conversations --

    pub fn find_conversation(
        &self,
        listing_id: &str,
        buyer_id: &str,
        seller_id: &str,
    ) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM conversations
                     WHERE listing_id = ?1 AND buyer_id = ?2 AND seller_id = ?3",
                    (listing_id, buyer_id, seller_id),
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(id) => query_conversation(conn, &id),
                None => Ok(None),
            }
        })
    }

    pub fn create_conversation(
        &self,
        id: &str,
        listing_id: &str,
        buyer_id: &str,
        seller_id: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, buyer_id, seller_id, listing_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, buyer_id, seller_id, listing_id, timestamp(Utc::now())),
            )?;
            Ok(())
        })?;
        self.publish(conversation_event(ChangeKind::Insert, id, buyer_id, seller_id));
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Hard delete. Messages, offers, mutes and reactions cascade.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let deleted = self.with_conn(|conn| {
            let Some(row) = query_conversation(conn, id)? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
            Ok(Some(row))
        })?;

        match deleted {
            Some(row) => {
                self.publish(conversation_event(
                    ChangeKind::Delete,
                    &row.id,
                    &row.buyer_id,
                    &row.seller_id,
                ));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_muted(&self, conversation_id: &str, user_id: &str, muted: bool) -> Result<bool> {
        let (changed, row) = self.with_conn(|conn| {
            let changed = if muted {
                conn.execute(
                    "INSERT OR IGNORE INTO conversation_mutes (conversation_id, user_id) VALUES (?1, ?2)",
                    (conversation_id, user_id),
                )?
            } else {
                conn.execute(
                    "DELETE FROM conversation_mutes WHERE conversation_id = ?1 AND user_id = ?2",
                    (conversation_id, user_id),
                )?
            };
            Ok((changed, query_conversation(conn, conversation_id)?))
        })?;

        if let (true, Some(row)) = (changed > 0, row) {
            self.publish(conversation_event(
                ChangeKind::Update,
                &row.id,
                &row.buyer_id,
                &row.seller_id,
            ));
        }
        Ok(changed > 0)
    }

    // -- Blocks --

    pub fn block_user(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        let inserted = self.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO blocked_users (blocker_id, blocked_id, created_at)
                 VALUES (?1, ?2, ?3)",
                (blocker_id, blocked_id, timestamp(Utc::now())),
            )?)
        })?;
        if inserted > 0 {
            self.publish(
                ChangeEvent::new(Table::BlockedUsers, ChangeKind::Insert)
                    .with_key("blocker_id", blocker_id)
                    .with_key("blocked_id", blocked_id),
            );
        }
        Ok(())
    }

    pub fn unblock_user(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM blocked_users WHERE blocker_id = ?1 AND blocked_id = ?2",
                (blocker_id, blocked_id),
            )?)
        })?;
        if removed > 0 {
            self.publish(
                ChangeEvent::new(Table::BlockedUsers, ChangeKind::Delete)
                    .with_key("blocker_id", blocker_id)
                    .with_key("blocked_id", blocked_id),
            );
        }
        Ok(())
    }

    /// True if either user has blocked the other.
    pub fn is_blocked_either(&self, a: &str, b: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM blocked_users
                 WHERE (blocker_id = ?1 AND blocked_id = ?2)
                    OR (blocker_id = ?2 AND blocked_id = ?1)",
                (a, b),
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &MessageRow) -> Result<()> {
        self.with_conn(|conn| insert_message_row(conn, message))?;
        self.publish(message_event(ChangeKind::Insert, message));
        Ok(())
    }

    /// Offer row and the message that carries it, in one transaction.
    pub fn insert_offer_message(&self, offer: &PriceOfferRow, message: &MessageRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO price_offers ({OFFER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                rusqlite::params![
                    offer.id,
                    offer.conversation_id,
                    offer.listing_id,
                    offer.sender_id,
                    offer.receiver_id,
                    offer.amount,
                    offer.status,
                    offer.created_at,
                ],
            )?;
            insert_message_row(&tx, message)?;
            tx.commit()?;
            Ok(())
        })?;
        self.publish(
            ChangeEvent::new(Table::PriceOffers, ChangeKind::Insert)
                .with_key("id", &offer.id)
                .with_key("conversation_id", &offer.conversation_id),
        );
        self.publish(message_event(ChangeKind::Insert, message));
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [id],
                    message_from_row,
                )
                .optional()?)
        })
    }

    /// All messages of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map([conversation_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Mark everything in the conversation addressed to `reader_id` as read.
    /// Publishes only when a row actually changed.
    pub fn mark_conversation_read(&self, conversation_id: &str, reader_id: &str) -> Result<usize> {
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                (conversation_id, reader_id),
            )?)
        })?;
        if changed > 0 {
            self.publish(
                ChangeEvent::new(Table::Messages, ChangeKind::Update)
                    .with_key("conversation_id", conversation_id)
                    .with_key("receiver_id", reader_id),
            );
        }
        Ok(changed)
    }

    pub fn mark_messages_read(&self, message_ids: &[String]) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let (changed, conversations) = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let placeholders = placeholders(message_ids.len());
            let params = as_params(message_ids);

            let conversations: Vec<String> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT DISTINCT conversation_id FROM messages
                     WHERE is_read = 0 AND id IN ({placeholders})"
                ))?;
                stmt.query_map(params.as_slice(), |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let changed = tx.execute(
                &format!("UPDATE messages SET is_read = 1 WHERE is_read = 0 AND id IN ({placeholders})"),
                params.as_slice(),
            )?;
            tx.commit()?;
            Ok((changed, conversations))
        })?;

        for conversation_id in conversations {
            self.publish(
                ChangeEvent::new(Table::Messages, ChangeKind::Update)
                    .with_key("conversation_id", conversation_id),
            );
        }
        Ok(changed)
    }

    pub fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // -- Price offers --

    pub fn get_offer(&self, id: &str) -> Result<Option<PriceOfferRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {OFFER_COLUMNS} FROM price_offers WHERE id = ?1"),
                [id],
                offer_from_row,
            )
            .optional()
        })
    }

    pub fn get_offers_for_conversation(&self, conversation_id: &str) -> Result<Vec<PriceOfferRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OFFER_COLUMNS} FROM price_offers WHERE conversation_id = ?1"
            ))?;
            let rows = stmt
                .query_map([conversation_id], offer_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Conditional status write: succeeds only if the stored status still
    /// equals `expected`. Returns whether the row moved.
    pub fn update_offer_status(&self, id: &str, expected: &str, next: &str) -> Result<bool> {
        let conversation_id = self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE price_offers SET status = ?3 WHERE id = ?1 AND status = ?2",
                (id, expected, next),
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let conversation_id: String = conn.query_row(
                "SELECT conversation_id FROM price_offers WHERE id = ?1",
                [id],
                |row| row.get(0),
            )?;
            Ok(Some(conversation_id))
        })?;

        match conversation_id {
            Some(conversation_id) => {
                self.publish(
                    ChangeEvent::new(Table::PriceOffers, ChangeKind::Update)
                        .with_key("id", id)
                        .with_key("conversation_id", conversation_id),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -- Reactions --

    /// Compare-and-swap on the existence of the (message, user, emoji) row.
    ///
    /// `expect_present` is what the caller last observed. If it still holds,
    /// the row is removed (present) or inserted (absent); if another toggle
    /// got there first the call is a no-op and reports `Unchanged`. The
    /// primary key makes a second row impossible either way.
    pub fn swap_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        expect_present: bool,
    ) -> Result<ReactionSwap> {
        let (swap, conversation_id) = self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let conversation_id: String = tx
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1",
                    [message_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| anyhow!("Message not found: {}", message_id))?;

            let swap = if expect_present {
                let removed = tx.execute(
                    "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    (message_id, user_id, emoji),
                )?;
                if removed > 0 { ReactionSwap::Removed } else { ReactionSwap::Unchanged }
            } else {
                let inserted = tx.execute(
                    "INSERT INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (message_id, user_id, emoji) DO NOTHING",
                    (message_id, user_id, emoji, timestamp(Utc::now())),
                )?;
                if inserted > 0 { ReactionSwap::Added } else { ReactionSwap::Unchanged }
            };
            tx.commit()?;
            Ok((swap, conversation_id))
        })?;

        let kind = match swap {
            ReactionSwap::Added => ChangeKind::Insert,
            ReactionSwap::Removed => ChangeKind::Delete,
            ReactionSwap::Unchanged => return Ok(swap),
        };
        self.publish(
            ChangeEvent::new(Table::Reactions, kind)
                .with_key("message_id", message_id)
                .with_key("user_id", user_id)
                .with_key("emoji", emoji)
                .with_key("conversation_id", conversation_id),
        );
        Ok(swap)
    }

    pub fn get_reactions_for_message(&self, message_id: &str) -> Result<Vec<ReactionRow>> {
        self.get_reactions_for_messages(&[message_id.to_string()])
    }

    /// Batch-fetch reactions for a set of message IDs, oldest first.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT message_id, user_id, emoji, created_at FROM reactions
                 WHERE message_id IN ({})
                 ORDER BY created_at ASC, rowid ASC",
                placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let params = as_params(message_ids);

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        emoji: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Push registrations --

    /// Overwrites any previous token for the user.
    pub fn upsert_push_registration(&self, user_id: &str, token: &str, permission: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO push_registrations (user_id, token, permission, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id) DO UPDATE SET
                    token = excluded.token,
                    permission = excluded.permission,
                    updated_at = excluded.updated_at",
                (user_id, token, permission, timestamp(Utc::now())),
            )?;
            Ok(())
        })?;
        self.publish(
            ChangeEvent::new(Table::PushRegistrations, ChangeKind::Update).with_key("user_id", user_id),
        );
        Ok(())
    }

    pub fn get_push_registration(&self, user_id: &str) -> Result<Option<PushRegistrationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_id, token, permission, updated_at FROM push_registrations WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(PushRegistrationRow {
                        user_id: row.get(0)?,
                        token: row.get(1)?,
                        permission: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Returns whether a row existed. Deleting a missing row is not an error.
    pub fn delete_push_registration(&self, user_id: &str) -> Result<bool> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM push_registrations WHERE user_id = ?1", [user_id])?)
        })?;
        if removed > 0 {
            self.publish(
                ChangeEvent::new(Table::PushRegistrations, ChangeKind::Delete).with_key("user_id", user_id),
            );
        }
        Ok(removed > 0)
    }
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            "SELECT id, buyer_id, seller_id, listing_id, created_at FROM conversations WHERE id = ?1",
            [id],
            |row| {
                Ok(ConversationRow {
                    id: row.get(0)?,
                    buyer_id: row.get(1)?,
                    seller_id: row.get(2)?,
                    listing_id: row.get(3)?,
                    created_at: row.get(4)?,
                    muted_by: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare("SELECT user_id FROM conversation_mutes WHERE conversation_id = ?1")?;
    row.muted_by = stmt
        .query_map([id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(row))
}

fn insert_message_row(conn: &Connection, m: &MessageRow) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        rusqlite::params![
            m.id,
            m.conversation_id,
            m.sender_id,
            m.receiver_id,
            m.content,
            m.kind,
            m.media_url,
            m.latitude,
            m.longitude,
            m.location_name,
            m.offer_id,
            m.is_read,
            m.created_at,
        ],
    )?;
    Ok(())
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        content: row.get(4)?,
        kind: row.get(5)?,
        media_url: row.get(6)?,
        latitude: row.get(7)?,
        longitude: row.get(8)?,
        location_name: row.get(9)?,
        offer_id: row.get(10)?,
        is_read: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn offer_from_row(row: &Row<'_>) -> rusqlite::Result<PriceOfferRow> {
    Ok(PriceOfferRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        listing_id: row.get(2)?,
        sender_id: row.get(3)?,
        receiver_id: row.get(4)?,
        amount: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn message_event(kind: ChangeKind, m: &MessageRow) -> ChangeEvent {
    ChangeEvent::new(Table::Messages, kind)
        .with_key("id", &m.id)
        .with_key("conversation_id", &m.conversation_id)
        .with_key("sender_id", &m.sender_id)
        .with_key("receiver_id", &m.receiver_id)
}

fn conversation_event(kind: ChangeKind, id: &str, buyer_id: &str, seller_id: &str) -> ChangeEvent {
    ChangeEvent::new(Table::Conversations, kind)
        .with_key("id", id)
        .with_key("buyer_id", buyer_id)
        .with_key("seller_id", seller_id)
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

fn as_params(values: &[String]) -> Vec<&dyn rusqlite::types::ToSql> {
    values
        .iter()
        .map(|v| v as &dyn rusqlite::types::ToSql)
        .collect()
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
