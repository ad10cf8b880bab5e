//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Users, keyed by channel address
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            phone TEXT NOT NULL UNIQUE,
            display_name TEXT,
            locale TEXT,
            timezone TEXT,
            blocked INTEGER NOT NULL DEFAULT 0,
            vip INTEGER NOT NULL DEFAULT 0,
            preferences TEXT NOT NULL DEFAULT '{}',
            message_count INTEGER NOT NULL DEFAULT 0,
            last_contact_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Conversations
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id),
            status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active', 'closed')),
            bot_mode TEXT NOT NULL DEFAULT 'auto' CHECK(bot_mode IN ('auto', 'manual')),
            is_unread INTEGER NOT NULL DEFAULT 0,
            sentiment TEXT,
            assigned_operator TEXT,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);

        -- At most one active conversation per user
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_one_active
            ON conversations(user_id) WHERE status = 'active';

        -- Messages
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id TEXT NOT NULL REFERENCES users(id),
            direction TEXT NOT NULL CHECK(direction IN ('inbound', 'outbound')),
            content TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'text',
            kind TEXT NOT NULL DEFAULT 'standard',
            channel_message_id TEXT,
            sender TEXT NOT NULL CHECK(sender IN ('user', 'bot', 'human')),
            intent TEXT,
            entities TEXT NOT NULL DEFAULT '[]',
            ai_processed INTEGER NOT NULL DEFAULT 0,
            media_id TEXT,
            media_mime TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);

        -- Idempotency key for duplicate webhook delivery
        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_channel_id
            ON messages(channel_message_id) WHERE channel_message_id IS NOT NULL;

        -- Audit of every inbound delivery
        CREATE TABLE IF NOT EXISTS webhook_logs (
            id TEXT PRIMARY KEY,
            event TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'processed', 'failed')),
            error TEXT,
            created_at TEXT NOT NULL,
            processed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_webhook_logs_status ON webhook_logs(status);

        -- Canned command responses
        CREATE TABLE IF NOT EXISTS commands (
            id TEXT PRIMARY KEY,
            trigger_text TEXT NOT NULL UNIQUE,
            response TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        -- Runtime settings edited by operators
        CREATE TABLE IF NOT EXISTS system_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Delivery receipts reported by the channel
        ALTER TABLE messages ADD COLUMN delivery_status TEXT;

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (delivery status)");
    Ok(())
}
