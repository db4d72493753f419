use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profiles (
            id                      TEXT PRIMARY KEY,
            display_name            TEXT NOT NULL,
            is_online               INTEGER NOT NULL DEFAULT 0,
            last_seen               TEXT,
            typing_in_conversation  TEXT,
            created_at              TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            buyer_id    TEXT NOT NULL REFERENCES profiles(id),
            seller_id   TEXT NOT NULL REFERENCES profiles(id),
            listing_id  TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(listing_id, buyer_id, seller_id)
        );

        CREATE TABLE IF NOT EXISTS conversation_mutes (
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL REFERENCES profiles(id),
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS price_offers (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            listing_id      TEXT NOT NULL,
            sender_id       TEXT NOT NULL REFERENCES profiles(id),
            receiver_id     TEXT NOT NULL REFERENCES profiles(id),
            amount          INTEGER NOT NULL CHECK (amount > 0),
            status          TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'accepted', 'rejected')),
            created_at      TEXT NOT NULL
        );

        -- Exactly one type-specific payload per message kind.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id       TEXT NOT NULL REFERENCES profiles(id),
            receiver_id     TEXT NOT NULL REFERENCES profiles(id),
            content         TEXT NOT NULL,
            kind            TEXT NOT NULL,
            media_url       TEXT,
            latitude        REAL,
            longitude       REAL,
            location_name   TEXT,
            offer_id        TEXT REFERENCES price_offers(id) ON DELETE CASCADE,
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            CHECK (
                (kind = 'text'
                    AND media_url IS NULL AND latitude IS NULL AND offer_id IS NULL)
                OR (kind = 'image'
                    AND media_url IS NOT NULL AND latitude IS NULL AND offer_id IS NULL)
                OR (kind = 'location'
                    AND latitude IS NOT NULL AND longitude IS NOT NULL
                    AND media_url IS NULL AND offer_id IS NULL)
                OR (kind = 'price_offer'
                    AND offer_id IS NOT NULL AND media_url IS NULL AND latitude IS NULL)
            )
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(receiver_id, is_read);

        -- The primary key is the reaction identity; a duplicate row is impossible.
        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL REFERENCES profiles(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id, emoji)
        );

        CREATE TABLE IF NOT EXISTS blocked_users (
            blocker_id  TEXT NOT NULL REFERENCES profiles(id),
            blocked_id  TEXT NOT NULL REFERENCES profiles(id),
            created_at  TEXT NOT NULL,
            PRIMARY KEY (blocker_id, blocked_id)
        );

        CREATE TABLE IF NOT EXISTS push_registrations (
            user_id     TEXT PRIMARY KEY REFERENCES profiles(id),
            token       TEXT NOT NULL,
            permission  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
