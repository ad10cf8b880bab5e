//! Error types for the chatdesk pipeline

use thiserror::Error;

/// Result type alias for chatdesk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the message pipeline and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Channel (messaging provider) error
    #[error("channel error: {0}")]
    Channel(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// A synthesis engine lacks the reference sample it needs for a voice
    #[error("missing voice reference: {0}")]
    MissingReference(String),

    /// Content cache error
    #[error("cache error: {0}")]
    Cache(String),

    /// Text generation backend error
    #[error("generation error: {0}")]
    Generation(String),

    /// An external call exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected input (bad payload, unknown enum value)
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

