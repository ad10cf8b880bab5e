//! Append-only audit of inbound webhook deliveries

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;
use uuid::Uuid;

use super::{DbPool, format_datetime, parse_datetime, parse_optional_datetime};
use crate::{Error, Result};

/// Processing state of a logged delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Processed,
    Failed,
}

impl WebhookStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "processed" => Self::Processed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One logged delivery
#[derive(Debug, Clone, Serialize)]
pub struct WebhookLog {
    pub id: String,
    pub event: String,
    pub payload: String,
    pub status: WebhookStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Webhook log repository
#[derive(Clone)]
pub struct WebhookLogRepo {
    pool: DbPool,
}

impl WebhookLogRepo {
    /// Create a new webhook log repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a delivery as `pending` and return its ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn create(&self, event: &str, payload: &str, now: DateTime<Utc>) -> Result<String> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO webhook_logs (id, event, payload, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            [&id, event, payload, &format_datetime(now)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(id)
    }

    /// Resolve a logged delivery to its final status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn update_status(
        &self,
        id: &str,
        status: WebhookStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE webhook_logs SET status = ?1, error = ?2, processed_at = ?3 WHERE id = ?4",
            rusqlite::params![status.as_str(), error, format_datetime(now), id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Find a logged delivery by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<WebhookLog>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let log = conn
            .query_row(
                "SELECT id, event, payload, status, error, created_at, processed_at
                 FROM webhook_logs WHERE id = ?1",
                [id],
                |row| {
                    Ok(WebhookLog {
                        id: row.get(0)?,
                        event: row.get(1)?,
                        payload: row.get(2)?,
                        status: WebhookStatus::from_str(&row.get::<_, String>(3)?),
                        error: row.get(4)?,
                        created_at: parse_datetime(&row.get::<_, String>(5)?),
                        processed_at: parse_optional_datetime(row.get(6)?),
                    })
                },
            )
            .optional()?;

        Ok(log)
    }

    /// Count deliveries in a given status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count_by_status(&self, status: WebhookStatus) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM webhook_logs WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}
