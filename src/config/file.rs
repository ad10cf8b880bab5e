//! TOML configuration file loading
//!
//! Supports `~/.config/chatdesk/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ChatdeskConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// `WhatsApp` Cloud API configuration
    #[serde(default)]
    pub whatsapp: WhatsAppFileConfig,

    /// Text generation backend
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Transcription and synthesis backends
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Content cache tuning
    #[serde(default)]
    pub cache: CacheFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Data directory (database, synthesis cache)
    pub data_dir: Option<String>,

    /// Database file path
    pub db_path: Option<String>,

    /// Timeout for every external backend call, in seconds
    pub backend_timeout_secs: Option<u64>,
}

/// `WhatsApp` channel configuration
#[derive(Debug, Default, Deserialize)]
pub struct WhatsAppFileConfig {
    pub phone_number_id: Option<String>,
    pub verify_token: Option<String>,
    pub api_base: Option<String>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL (e.g. `https://api.openai.com/v1`)
    pub base_url: Option<String>,

    /// Model used when no runtime setting overrides it
    pub model: Option<String>,
}

/// Speech backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// "openai", "deepgram", "http" or "local"
    pub transcription: Option<String>,

    /// "openai", "elevenlabs" or "cloned"
    pub synthesis: Option<String>,

    /// Engines tried in order when the primary one cannot serve a request
    pub synthesis_fallbacks: Option<Vec<String>>,

    pub stt_model: Option<String>,
    pub tts_model: Option<String>,
    pub default_voice: Option<String>,
    pub transcription_service_url: Option<String>,
    pub local_whisper_command: Option<String>,
    pub local_whisper_model: Option<String>,
    pub cloned_voice_url: Option<String>,
    pub reference_dir: Option<String>,
}

/// Cache configuration
#[derive(Debug, Default, Deserialize)]
pub struct CacheFileConfig {
    pub transcription_ttl_secs: Option<u64>,
    pub transcription_capacity: Option<u64>,
    pub synthesis_ttl_secs: Option<u64>,
    pub synthesis_dir: Option<String>,
    pub purge_interval_secs: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub admin: Option<String>,
    pub openai: Option<String>,
    pub llm: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
    pub whatsapp: Option<String>,
    pub whatsapp_app_secret: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ChatdeskConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ChatdeskConfigFile {
    let Some(path) = config_file_path() else {
        return ChatdeskConfigFile::default();
    };

    if !path.exists() {
        return ChatdeskConfigFile::default();
    }

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_from(path: &Path) -> ChatdeskConfigFile {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ChatdeskConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ChatdeskConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/chatdesk/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("chatdesk").join("config.toml"))
}
