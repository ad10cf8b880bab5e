//! Disk-resident synthesis cache
//!
//! Each entry is a single file `<key>.<ext>` in the cache directory. Files
//! are written to a temp file in the same directory and renamed into place,
//! so readers only ever see complete audio. An entry's age is its
//! modification time, stamped from the injected clock on write.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use super::Clock;
use crate::{Error, Result};

/// Extensions probed on lookup, in order
const AUDIO_EXTENSIONS: &[&str] = &["ogg", "mp3", "wav"];

/// MIME type for a cached audio file extension
#[must_use]
pub fn audio_mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "ogg" | "opus" => "audio/ogg",
        "wav" => "audio/wav",
        _ => "audio/mpeg",
    }
}

/// File cache of synthesized speech
#[derive(Clone)]
pub struct SynthesisCache {
    dir: PathBuf,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl SynthesisCache {
    /// Open (and create if needed) a cache directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        })
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a fresh cached file for `key`, if any
    ///
    /// An expired file found on lookup is removed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        for ext in AUDIO_EXTENSIONS {
            let path = self.dir.join(format!("{key}.{ext}"));
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };

            if self.is_expired(&metadata) {
                tracing::debug!(path = %path.display(), "synthesis cache entry expired");
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove expired entry");
                }
                return None;
            }

            return Some(path);
        }
        None
    }

    /// Store audio for `key` and return the cached path
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn put(&self, key: &str, audio: &[u8], ext: &str) -> Result<PathBuf> {
        if !AUDIO_EXTENSIONS.contains(&ext) {
            return Err(Error::Cache(format!("unsupported audio extension: {ext}")));
        }

        let target = self.dir.join(format!("{key}.{ext}"));

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(audio)?;
        tmp.as_file()
            .set_modified(SystemTime::from(self.clock.now()))?;
        tmp.persist(&target)
            .map_err(|e| Error::Cache(format!("failed to persist {}: {}", target.display(), e.error)))?;

        tracing::debug!(path = %target.display(), bytes = audio.len(), "cached synthesized audio");
        Ok(target)
    }

    /// Remove every expired entry; returns the number removed
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be read
    pub fn purge_expired(&self) -> Result<usize> {
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_audio = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e));
            if !is_audio {
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_file() && self.is_expired(&metadata) {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to purge cache entry");
                    }
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, dir = %self.dir.display(), "purged expired synthesis cache entries");
        }
        Ok(removed)
    }

    fn is_expired(&self, metadata: &std::fs::Metadata) -> bool {
        let Ok(modified) = metadata.modified() else {
            return true;
        };
        let written: DateTime<Utc> = modified.into();
        self.clock.now() - written >= self.ttl
    }
}
