//! Conversation repository
//!
//! A user has at most one `active` conversation. Closed conversations are
//! never reopened; the next inbound event starts a fresh one.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbPool, format_datetime, parse_datetime, parse_optional_datetime};
use crate::{Error, Result};

/// Conversation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Closed,
}

impl ConversationStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Who owns replies in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    /// Automated replies are generated
    Auto,
    /// A human operator responds; automation stays silent
    Manual,
}

impl BotMode {
    /// Database representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// A conversation with one user
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub status: ConversationStatus,
    pub bot_mode: BotMode,
    pub is_unread: bool,
    pub sentiment: Option<String>,
    pub assigned_operator: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of conversation fields (last write wins)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationPatch {
    pub bot_mode: Option<BotMode>,
    pub is_unread: Option<bool>,
    pub sentiment: Option<String>,
    /// `Some(None)` clears the assignment
    #[serde(default, with = "double_option")]
    pub assigned_operator: Option<Option<String>>,
}

impl ConversationPatch {
    /// Patch that only flips the unread flag
    #[must_use]
    pub fn unread(is_unread: bool) -> Self {
        Self {
            is_unread: Some(is_unread),
            ..Self::default()
        }
    }

    /// Patch that only records a sentiment label
    #[must_use]
    pub fn sentiment(sentiment: impl Into<String>) -> Self {
        Self {
            sentiment: Some(sentiment.into()),
            ..Self::default()
        }
    }
}

/// Distinguish an absent field from an explicit `null`
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

const CONVERSATION_COLUMNS: &str = "id, user_id, status, bot_mode, is_unread, sentiment,
     assigned_operator, started_at, ended_at, updated_at";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        status: ConversationStatus::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(ConversationStatus::Active),
        bot_mode: BotMode::from_str(&row.get::<_, String>(3)?).unwrap_or(BotMode::Auto),
        is_unread: row.get(4)?,
        sentiment: row.get(5)?,
        assigned_operator: row.get(6)?,
        started_at: parse_datetime(&row.get::<_, String>(7)?),
        ended_at: parse_optional_datetime(row.get(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find a conversation by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation = conn
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                [id],
                conversation_from_row,
            )
            .optional()?;

        Ok(conversation)
    }

    /// Find the user's active conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_active(&self, user_id: &str) -> Result<Option<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation = conn
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE user_id = ?1 AND status = 'active'"
                ),
                [user_id],
                conversation_from_row,
            )
            .optional()?;

        Ok(conversation)
    }

    /// Create a new active conversation in `auto` mode
    ///
    /// # Errors
    ///
    /// Returns error if the user already has an active conversation or the
    /// insert fails
    pub fn create(&self, user_id: &str, now: DateTime<Utc>) -> Result<Conversation> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now_str = format_datetime(now);

        conn.execute(
            "INSERT INTO conversations (id, user_id, status, bot_mode, is_unread, started_at, updated_at)
             VALUES (?1, ?2, 'active', 'auto', 0, ?3, ?3)",
            [&id, user_id, &now_str],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Conversation {
            id,
            user_id: user_id.to_string(),
            status: ConversationStatus::Active,
            bot_mode: BotMode::Auto,
            is_unread: false,
            sentiment: None,
            assigned_operator: None,
            started_at: now,
            ended_at: None,
            updated_at: now,
        })
    }

    /// Return the user's active conversation, creating one if needed
    ///
    /// When two deliveries race to create the conversation, the loser of the
    /// unique-index race re-reads the winner's row.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_or_create_active(&self, user_id: &str, now: DateTime<Utc>) -> Result<Conversation> {
        if let Some(conversation) = self.find_active(user_id)? {
            return Ok(conversation);
        }

        match self.create(user_id, now) {
            Ok(conversation) => Ok(conversation),
            Err(create_err) => self.find_active(user_id)?.ok_or(create_err),
        }
    }

    /// Apply a partial update
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn update(&self, id: &str, patch: &ConversationPatch, now: DateTime<Utc>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let (set_operator, operator) = match &patch.assigned_operator {
            Some(op) => (true, op.clone()),
            None => (false, None),
        };

        conn.execute(
            "UPDATE conversations
             SET bot_mode = COALESCE(?1, bot_mode),
                 is_unread = COALESCE(?2, is_unread),
                 sentiment = COALESCE(?3, sentiment),
                 assigned_operator = CASE WHEN ?4 THEN ?5 ELSE assigned_operator END,
                 updated_at = ?6
             WHERE id = ?7",
            rusqlite::params![
                patch.bot_mode.map(BotMode::as_str),
                patch.is_unread,
                patch.sentiment,
                set_operator,
                operator,
                format_datetime(now),
                id
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Close an active conversation
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no active conversation with this ID
    pub fn close(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now_str = format_datetime(now);
        let changed = conn
            .execute(
                "UPDATE conversations SET status = 'closed', ended_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                [&now_str, id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if changed == 0 {
            return Err(Error::NotFound(format!("active conversation {id}")));
        }
        Ok(())
    }

    /// List conversations, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, status: Option<ConversationStatus>, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY updated_at DESC LIMIT ?2"
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let conversations = stmt
            .query_map(
                rusqlite::params![status.map(ConversationStatus::as_str), limit as i64],
                conversation_from_row,
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(conversations)
    }
}
