//! Message repository
//!
//! Messages are immutable apart from two narrow updates: appending a
//! transcript to an audio message and recording channel delivery status.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbPool, format_datetime, parse_datetime};
use crate::{Error, Result};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Database representation
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            /// Parse the database representation
            #[must_use]
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Message direction relative to the business
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

text_enum!(Direction { Inbound => "inbound", Outbound => "outbound" });

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderClass {
    User,
    Bot,
    Human,
}

text_enum!(SenderClass { User => "user", Bot => "bot", Human => "human" });

/// Purpose of a message, used instead of matching on its text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Standard,
    OutOfHoursNotice,
    CommandReply,
    MediaAck,
    Fallback,
}

text_enum!(MessageKind {
    Standard => "standard",
    OutOfHoursNotice => "out_of_hours_notice",
    CommandReply => "command_reply",
    MediaAck => "media_ack",
    Fallback => "fallback",
});

/// Delivery receipt reported by the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

text_enum!(DeliveryStatus {
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});

/// A persisted message
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub direction: Direction,
    pub content: String,
    pub content_type: String,
    pub kind: MessageKind,
    pub channel_message_id: Option<String>,
    pub sender: SenderClass,
    pub intent: Option<String>,
    pub entities: serde_json::Value,
    pub ai_processed: bool,
    pub media_id: Option<String>,
    pub media_mime: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a message about to be inserted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub user_id: String,
    pub direction: Direction,
    pub content: String,
    pub content_type: String,
    pub kind: MessageKind,
    pub channel_message_id: Option<String>,
    pub sender: SenderClass,
    pub intent: Option<String>,
    pub entities: serde_json::Value,
    pub ai_processed: bool,
    pub media_id: Option<String>,
    pub media_mime: Option<String>,
    pub delivery_status: Option<DeliveryStatus>,
}

impl NewMessage {
    /// An inbound message from the user
    #[must_use]
    pub fn inbound(
        conversation_id: &str,
        user_id: &str,
        content: impl Into<String>,
        content_type: impl Into<String>,
        channel_message_id: Option<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            direction: Direction::Inbound,
            content: content.into(),
            content_type: content_type.into(),
            kind: MessageKind::Standard,
            channel_message_id,
            sender: SenderClass::User,
            intent: None,
            entities: serde_json::json!([]),
            ai_processed: false,
            media_id: None,
            media_mime: None,
            delivery_status: None,
        }
    }

    /// An outbound text message from the bot
    #[must_use]
    pub fn outbound(
        conversation_id: &str,
        user_id: &str,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            direction: Direction::Outbound,
            content: content.into(),
            content_type: "text".to_string(),
            kind,
            channel_message_id: None,
            sender: SenderClass::Bot,
            intent: None,
            entities: serde_json::json!([]),
            ai_processed: false,
            media_id: None,
            media_mime: None,
            delivery_status: None,
        }
    }

    /// Attach a media pointer
    #[must_use]
    pub fn with_media(mut self, media_id: Option<String>, media_mime: Option<String>) -> Self {
        self.media_id = media_id;
        self.media_mime = media_mime;
        self
    }

    /// Record the outcome of sending over the channel
    #[must_use]
    pub fn with_receipt(mut self, channel_message_id: Option<String>, status: DeliveryStatus) -> Self {
        self.channel_message_id = channel_message_id;
        self.delivery_status = Some(status);
        self
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, user_id, direction, content, content_type,
     kind, channel_message_id, sender, intent, entities, ai_processed, media_id, media_mime,
     delivery_status, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let entities: String = row.get(10)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        direction: Direction::parse(&row.get::<_, String>(3)?).unwrap_or(Direction::Inbound),
        content: row.get(4)?,
        content_type: row.get(5)?,
        kind: MessageKind::parse(&row.get::<_, String>(6)?).unwrap_or(MessageKind::Standard),
        channel_message_id: row.get(7)?,
        sender: SenderClass::parse(&row.get::<_, String>(8)?).unwrap_or(SenderClass::User),
        intent: row.get(9)?,
        entities: serde_json::from_str(&entities).unwrap_or_else(|_| serde_json::json!([])),
        ai_processed: row.get(11)?,
        media_id: row.get(12)?,
        media_mime: row.get(13)?,
        delivery_status: row
            .get::<_, Option<String>>(14)?
            .as_deref()
            .and_then(DeliveryStatus::parse),
        created_at: parse_datetime(&row.get::<_, String>(15)?),
    })
}

/// Message repository
#[derive(Clone)]
pub struct MessageRepo {
    pool: DbPool,
}

impl MessageRepo {
    /// Create a new message repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a message unless its channel message ID is already stored
    ///
    /// Returns `None` when another row already holds the same channel
    /// message ID. The check is the unique index itself, so two concurrent
    /// deliveries of the same ID can never both insert.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create_if_absent(&self, msg: &NewMessage, now: DateTime<Utc>) -> Result<Option<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let entities = serde_json::to_string(&msg.entities)?;

        let inserted = conn
            .execute(
                "INSERT INTO messages (id, conversation_id, user_id, direction, content, content_type,
                     kind, channel_message_id, sender, intent, entities, ai_processed, media_id,
                     media_mime, delivery_status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT DO NOTHING",
                rusqlite::params![
                    id,
                    msg.conversation_id,
                    msg.user_id,
                    msg.direction.as_str(),
                    msg.content,
                    msg.content_type,
                    msg.kind.as_str(),
                    msg.channel_message_id,
                    msg.sender.as_str(),
                    msg.intent,
                    entities,
                    msg.ai_processed,
                    msg.media_id,
                    msg.media_mime,
                    msg.delivery_status.map(DeliveryStatus::as_str),
                    format_datetime(now),
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(Message {
            id,
            conversation_id: msg.conversation_id.clone(),
            user_id: msg.user_id.clone(),
            direction: msg.direction,
            content: msg.content.clone(),
            content_type: msg.content_type.clone(),
            kind: msg.kind,
            channel_message_id: msg.channel_message_id.clone(),
            sender: msg.sender,
            intent: msg.intent.clone(),
            entities: msg.entities.clone(),
            ai_processed: msg.ai_processed,
            media_id: msg.media_id.clone(),
            media_mime: msg.media_mime.clone(),
            delivery_status: msg.delivery_status,
            created_at: now,
        }))
    }

    /// Insert a message that carries no idempotency key
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or unexpectedly collides
    pub fn create(&self, msg: &NewMessage, now: DateTime<Utc>) -> Result<Message> {
        self.create_if_absent(msg, now)?.ok_or_else(|| {
            Error::Database(format!(
                "message {} already stored",
                msg.channel_message_id.as_deref().unwrap_or_default()
            ))
        })
    }

    /// Find a message by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                message_from_row,
            )
            .optional()?;

        Ok(message)
    }

    /// Most recent outbound message in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_last_outbound(&self, conversation_id: &str) -> Result<Option<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let message = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 AND direction = 'outbound'
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                [conversation_id],
                message_from_row,
            )
            .optional()?;

        Ok(message)
    }

    /// Most recent outbound message of a given kind in a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_last_outbound_of_kind(
        &self,
        conversation_id: &str,
        kind: MessageKind,
    ) -> Result<Option<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let message = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 AND direction = 'outbound' AND kind = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                [conversation_id, kind.as_str()],
                message_from_row,
            )
            .optional()?;

        Ok(message)
    }

    /// Replace a message's content (used to store an audio transcript)
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the message does not exist
    pub fn update_content(&self, id: &str, content: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let changed = conn
            .execute(
                "UPDATE messages SET content = ?1 WHERE id = ?2",
                [content, id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if changed == 0 {
            return Err(Error::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    /// Record a delivery receipt by channel message ID
    ///
    /// Returns whether a stored message matched.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn update_status_by_channel_id(
        &self,
        channel_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let changed = conn
            .execute(
                "UPDATE messages SET delivery_status = ?1 WHERE channel_message_id = ?2",
                [status.as_str(), channel_message_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(changed > 0)
    }

    /// Recent messages in a conversation, oldest first
    ///
    /// `exclude_id` drops one message from the window (the message currently
    /// being answered).
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Message>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND (?2 IS NULL OR id != ?2)
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3"
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let mut messages: Vec<Message> = stmt
            .query_map(
                rusqlite::params![conversation_id, exclude_id, limit as i64],
                message_from_row,
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        messages.reverse();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConversationRepo, UserRepo, init_memory};

    struct Fixture {
        repo: MessageRepo,
        conversation_id: String,
        user_id: String,
    }

    fn setup() -> Fixture {
        let pool = init_memory().unwrap();
        let user = UserRepo::new(pool.clone())
            .create("5215550001", None, Utc::now())
            .unwrap();
        let conversation = ConversationRepo::new(pool.clone())
            .create(&user.id, Utc::now())
            .unwrap();
        Fixture {
            repo: MessageRepo::new(pool),
            conversation_id: conversation.id,
            user_id: user.id,
        }
    }

    #[test]
    fn test_duplicate_channel_id_returns_none() {
        let f = setup();
        let msg = NewMessage::inbound(
            &f.conversation_id,
            &f.user_id,
            "Hola",
            "text",
            Some("wamid.1".to_string()),
        );

        assert!(f.repo.create_if_absent(&msg, Utc::now()).unwrap().is_some());
        assert!(f.repo.create_if_absent(&msg, Utc::now()).unwrap().is_none());
        assert_eq!(f.repo.recent(&f.conversation_id, 10, None).unwrap().len(), 1);
    }

    #[test]
    fn test_messages_without_channel_id_never_collide() {
        let f = setup();
        let msg = NewMessage::outbound(&f.conversation_id, &f.user_id, "hi", MessageKind::Standard);

        f.repo.create(&msg, Utc::now()).unwrap();
        f.repo.create(&msg, Utc::now()).unwrap();
        assert_eq!(f.repo.recent(&f.conversation_id, 10, None).unwrap().len(), 2);
    }

    #[test]
    fn test_last_outbound_of_kind() {
        let f = setup();
        let base = Utc::now();

        let notice = NewMessage::outbound(
            &f.conversation_id,
            &f.user_id,
            "closed",
            MessageKind::OutOfHoursNotice,
        );
        f.repo.create(&notice, base).unwrap();

        let reply = NewMessage::outbound(&f.conversation_id, &f.user_id, "reply", MessageKind::Standard);
        f.repo
            .create(&reply, base + chrono::Duration::minutes(1))
            .unwrap();

        let last = f.repo.find_last_outbound(&f.conversation_id).unwrap().unwrap();
        assert_eq!(last.content, "reply");

        let last_notice = f
            .repo
            .find_last_outbound_of_kind(&f.conversation_id, MessageKind::OutOfHoursNotice)
            .unwrap()
            .unwrap();
        assert_eq!(last_notice.content, "closed");
        assert!(last_notice.created_at < last.created_at);

        assert!(
            f.repo
                .find_last_outbound_of_kind(&f.conversation_id, MessageKind::MediaAck)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_update_content_and_status() {
        let f = setup();
        let msg = NewMessage::inbound(
            &f.conversation_id,
            &f.user_id,
            "[audio]",
            "audio",
            Some("wamid.audio".to_string()),
        );
        let stored = f.repo.create(&msg, Utc::now()).unwrap();

        f.repo.update_content(&stored.id, "hola, quiero pedir").unwrap();
        assert!(f.repo.update_status_by_channel_id("wamid.audio", DeliveryStatus::Read).unwrap());
        assert!(!f.repo.update_status_by_channel_id("wamid.unknown", DeliveryStatus::Read).unwrap());

        let updated = f.repo.find(&stored.id).unwrap().unwrap();
        assert_eq!(updated.content, "hola, quiero pedir");
        assert_eq!(updated.delivery_status, Some(DeliveryStatus::Read));

        assert!(matches!(
            f.repo.update_content("missing", "x"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_recent_is_oldest_first_and_bounded() {
        let f = setup();
        let base = Utc::now();

        let mut ids = Vec::new();
        for i in 0..5 {
            let msg = NewMessage::inbound(&f.conversation_id, &f.user_id, format!("m{i}"), "text", None);
            ids.push(
                f.repo
                    .create(&msg, base + chrono::Duration::seconds(i))
                    .unwrap()
                    .id,
            );
        }

        let window = f.repo.recent(&f.conversation_id, 3, None).unwrap();
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m2", "m3", "m4"]);

        let window = f.repo.recent(&f.conversation_id, 3, Some(&ids[4])).unwrap();
        let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m1", "m2", "m3"]);
    }

    #[test]
    fn test_kind_round_trips_through_text() {
        for kind in [
            MessageKind::Standard,
            MessageKind::OutOfHoursNotice,
            MessageKind::CommandReply,
            MessageKind::MediaAck,
            MessageKind::Fallback,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert!(MessageKind::parse("closed").is_none());
    }
}
