//! Key/value settings editable at runtime

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use super::{DbPool, format_datetime};
use crate::{Error, Result};

/// System config repository
#[derive(Clone)]
pub struct SystemConfigRepo {
    pool: DbPool,
}

impl SystemConfigRepo {
    /// Create a new system config repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Read every stored setting
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_all(&self) -> Result<HashMap<String, String>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare("SELECT key, value FROM system_config")
            .map_err(|e| Error::Database(e.to_string()))?;

        let values = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(values)
    }

    /// Read one setting
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let value = conn
            .query_row(
                "SELECT value FROM system_config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    /// Write one setting
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO system_config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            [key, value, &format_datetime(now)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}
