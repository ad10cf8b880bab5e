//! User repository, keyed by channel address

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;

use super::{DbPool, format_datetime, parse_datetime, parse_optional_datetime};
use crate::{Error, Result};

/// A channel user (one per phone number)
#[derive(Debug, Clone, serde::Serialize)]
pub struct User {
    pub id: String,
    pub phone: String,
    pub display_name: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub blocked: bool,
    pub vip: bool,
    pub preferences: serde_json::Value,
    pub message_count: i64,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, phone, display_name, locale, timezone, blocked, vip, preferences,
     message_count, last_contact_at, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let preferences: String = row.get(7)?;
    Ok(User {
        id: row.get(0)?,
        phone: row.get(1)?,
        display_name: row.get(2)?,
        locale: row.get(3)?,
        timezone: row.get(4)?,
        blocked: row.get(5)?,
        vip: row.get(6)?,
        preferences: serde_json::from_str(&preferences).unwrap_or_default(),
        message_count: row.get(8)?,
        last_contact_at: parse_optional_datetime(row.get(9)?),
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        updated_at: parse_datetime(&row.get::<_, String>(11)?),
    })
}

/// User repository
#[derive(Clone)]
pub struct UserRepo {
    pool: DbPool,
}

impl UserRepo {
    /// Create a new user repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find a user by channel address (phone number)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_address(&self, phone: &str) -> Result<Option<User>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE phone = ?1"),
                [phone],
                user_from_row,
            )
            .optional()?;

        Ok(user)
    }

    /// Find a user by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<User>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                [id],
                user_from_row,
            )
            .optional()?;

        Ok(user)
    }

    /// Create a user for a channel address seen for the first time
    ///
    /// # Errors
    ///
    /// Returns error if the address already exists or the insert fails
    pub fn create(
        &self,
        phone: &str,
        display_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<User> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now_str = format_datetime(now);

        conn.execute(
            "INSERT INTO users (id, phone, display_name, last_contact_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4, ?4)",
            rusqlite::params![id, phone, display_name, now_str],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(User {
            id,
            phone: phone.to_string(),
            display_name: display_name.map(String::from),
            locale: None,
            timezone: None,
            blocked: false,
            vip: false,
            preferences: serde_json::json!({}),
            message_count: 0,
            last_contact_at: Some(now),
            created_at: now,
            updated_at: now,
        })
    }

    /// Record contact from a known user
    ///
    /// Refreshes the last-contact time and fills in the display name only
    /// when none is stored yet.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch(&self, id: &str, display_name: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE users
             SET last_contact_at = ?1,
                 display_name = COALESCE(display_name, ?2),
                 updated_at = ?1
             WHERE id = ?3",
            rusqlite::params![format_datetime(now), display_name, id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Increment the running message counter
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn increment_message_count(&self, id: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE users SET message_count = message_count + 1 WHERE id = ?1",
            [id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Set or clear the blocked flag
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_blocked(&self, id: &str, blocked: bool) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE users SET blocked = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![blocked, format_datetime(Utc::now()), id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Set or clear the VIP flag
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_vip(&self, id: &str, vip: bool) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE users SET vip = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![vip, format_datetime(Utc::now()), id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
