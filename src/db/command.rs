//! Canned command responses, matched on an exact trigger

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;
use uuid::Uuid;

use super::{DbPool, format_datetime};
use crate::{Error, Result};

/// A command and its canned response
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: String,
    pub trigger: String,
    pub response: String,
    pub enabled: bool,
}

/// Command repository
#[derive(Clone)]
pub struct CommandRepo {
    pool: DbPool,
}

impl CommandRepo {
    /// Create a new command repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find an enabled command by its exact trigger
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_trigger(&self, trigger: &str) -> Result<Option<Command>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let command = conn
            .query_row(
                "SELECT id, trigger_text, response, enabled FROM commands
                 WHERE trigger_text = ?1 AND enabled = 1",
                [trigger],
                |row| {
                    Ok(Command {
                        id: row.get(0)?,
                        trigger: row.get(1)?,
                        response: row.get(2)?,
                        enabled: row.get(3)?,
                    })
                },
            )
            .optional()?;

        Ok(command)
    }

    /// Create or replace the response for a trigger
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, trigger: &str, response: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO commands (id, trigger_text, response, enabled, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(trigger_text) DO UPDATE SET response = excluded.response, enabled = 1",
            [&Uuid::new_v4().to_string(), trigger, response, &format_datetime(now)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Enable or disable a command
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no command has this trigger
    pub fn set_enabled(&self, trigger: &str, enabled: bool) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let changed = conn
            .execute(
                "UPDATE commands SET enabled = ?1 WHERE trigger_text = ?2",
                rusqlite::params![enabled, trigger],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if changed == 0 {
            return Err(Error::NotFound(format!("command {trigger}")));
        }
        Ok(())
    }
}
