//! Memory-resident transcription cache

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;

use super::{Clock, content_hash};
use crate::speech::Transcription;

#[derive(Clone, Debug)]
struct Entry {
    transcription: Transcription,
    created_at: DateTime<Utc>,
}

/// TTL cache of transcripts keyed by a hash of the audio bytes
#[derive(Clone)]
pub struct TranscriptionCache {
    entries: Cache<String, Entry>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl TranscriptionCache {
    /// Create a cache holding up to `capacity` transcripts for `ttl`
    #[must_use]
    pub fn new(capacity: u64, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    /// Cache key for audio content
    #[must_use]
    pub fn key(audio: &[u8]) -> String {
        content_hash(audio)
    }

    /// Look up a transcript; expired entries are evicted and reported as misses
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Transcription> {
        let entry = self.entries.get(&key.to_string())?;

        if self.clock.now() - entry.created_at >= self.ttl {
            self.entries.invalidate(&key.to_string());
            tracing::debug!(key, "transcription cache entry expired");
            return None;
        }

        Some(entry.transcription)
    }

    /// Store a transcript
    pub fn put(&self, key: &str, transcription: Transcription) {
        self.entries.insert(
            key.to_string(),
            Entry {
                transcription,
                created_at: self.clock.now(),
            },
        );
    }

    /// Number of live entries (approximate)
    #[must_use]
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Whether the cache holds no entries (approximate)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
