//! Configuration management for chatdesk
//!
//! Process configuration is resolved once at startup (env > toml > default).
//! Runtime pipeline settings live in [`settings`] and are re-read per event.

pub mod file;
pub mod settings;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

pub use settings::PipelineSettings;

use crate::{Error, Result};

/// Default OpenAI-compatible endpoint
const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Graph API base for the `WhatsApp` Cloud API
const DEFAULT_WHATSAPP_API_BASE: &str = "https://graph.facebook.com/v18.0";

/// Chatdesk configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database, synthesis cache)
    pub data_dir: PathBuf,

    /// `SQLite` database file
    pub db_path: PathBuf,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// `WhatsApp` Cloud API credentials
    pub whatsapp: WhatsAppConfig,

    /// Text generation backend
    pub generation: GenerationConfig,

    /// Transcription and synthesis backends
    pub speech: SpeechConfig,

    /// Content cache tuning
    pub cache: CacheConfig,

    /// Deadline for every external backend call
    pub backend_timeout: Duration,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for operator endpoints (from `CHATDESK_API_KEY` env)
    pub api_key: Option<SecretString>,
}

/// `WhatsApp` Cloud API configuration
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    /// Business API access token
    pub access_token: Option<SecretString>,

    /// Sending phone number ID
    pub phone_number_id: Option<String>,

    /// Token echoed during webhook verification
    pub verify_token: Option<String>,

    /// App secret used to sign webhook deliveries (`X-Hub-Signature-256`)
    pub app_secret: Option<SecretString>,

    /// Graph API base URL
    pub api_base: String,
}

/// OpenAI-compatible text generation backend
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Model used when the runtime settings do not name one
    pub default_model: String,
}

/// Which transcription engine serves requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionBackendKind {
    /// `OpenAI` Whisper API
    OpenAi,
    /// Deepgram API
    Deepgram,
    /// Self-hosted HTTP microservice
    Http,
    /// Local whisper binary
    Local,
}

impl FromStr for TranscriptionBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "whisper" => Ok(Self::OpenAi),
            "deepgram" => Ok(Self::Deepgram),
            "http" | "service" => Ok(Self::Http),
            "local" => Ok(Self::Local),
            other => Err(Error::Config(format!("unknown transcription backend: {other}"))),
        }
    }
}

/// Which synthesis engine serves requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisBackendKind {
    /// `OpenAI` TTS API
    OpenAi,
    /// `ElevenLabs` API
    ElevenLabs,
    /// Cloned-voice microservice (needs a reference sample per voice)
    Cloned,
}

impl FromStr for SynthesisBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            "cloned" | "clone" => Ok(Self::Cloned),
            other => Err(Error::Config(format!("unknown synthesis backend: {other}"))),
        }
    }
}

/// Speech backend configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub transcription: TranscriptionBackendKind,
    pub synthesis: SynthesisBackendKind,
    /// Engines tried in order after the primary one
    pub synthesis_fallbacks: Vec<SynthesisBackendKind>,

    pub openai_api_key: Option<SecretString>,
    pub deepgram_api_key: Option<SecretString>,
    pub elevenlabs_api_key: Option<SecretString>,

    /// STT model for the Whisper API (e.g. "whisper-1")
    pub stt_model: String,
    /// TTS model for the `OpenAI` API (e.g. "tts-1")
    pub tts_model: String,
    /// Voice used when the runtime settings do not name one
    pub default_voice: String,

    pub transcription_service_url: Option<String>,
    pub local_whisper_command: String,
    pub local_whisper_model: String,
    pub cloned_voice_url: Option<String>,
    /// Directory holding `<voice_id>.wav` reference samples
    pub reference_dir: PathBuf,
}

/// Content cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub transcription_ttl: Duration,
    pub transcription_capacity: u64,
    pub synthesis_ttl: Duration,
    pub synthesis_dir: PathBuf,
    /// How often the server sweeps expired synthesis files
    pub purge_interval: Duration,
}

/// Default data directory: `~/.local/share/chatdesk`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("chatdesk"))
}

impl Config {
    /// Load configuration from the environment and the TOML config file
    ///
    /// # Errors
    ///
    /// Returns error if a backend selection names an unknown engine
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::resolve(fc, |key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir).ok();
        Ok(config)
    }

    /// Resolve configuration from a parsed config file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a backend selection names an unknown engine
    pub fn resolve(
        fc: file::ChatdeskConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let secret = |value: Option<String>| value.map(SecretString::from);

        let data_dir = env("CHATDESK_DATA_DIR")
            .or(fc.server.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let db_path = env("CHATDESK_DB_PATH")
            .or(fc.server.db_path)
            .map_or_else(|| data_dir.join("chatdesk.db"), PathBuf::from);

        let api_server = ApiServerConfig {
            port: env("CHATDESK_API_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(18800),
            api_key: secret(env("CHATDESK_API_KEY").or(fc.api_keys.admin)),
        };

        let whatsapp = WhatsAppConfig {
            access_token: secret(env("WHATSAPP_TOKEN").or(fc.api_keys.whatsapp)),
            phone_number_id: env("WHATSAPP_PHONE_ID").or(fc.whatsapp.phone_number_id),
            verify_token: env("WHATSAPP_VERIFY_TOKEN").or(fc.whatsapp.verify_token),
            app_secret: secret(env("WHATSAPP_APP_SECRET").or(fc.api_keys.whatsapp_app_secret)),
            api_base: env("WHATSAPP_API_BASE")
                .or(fc.whatsapp.api_base)
                .unwrap_or_else(|| DEFAULT_WHATSAPP_API_BASE.to_string()),
        };

        let openai_key = env("OPENAI_API_KEY").or(fc.api_keys.openai);

        let generation = GenerationConfig {
            base_url: env("CHATDESK_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            api_key: secret(
                env("CHATDESK_LLM_API_KEY")
                    .or(fc.api_keys.llm)
                    .or_else(|| openai_key.clone()),
            ),
            default_model: env("CHATDESK_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
        };

        let transcription = env("CHATDESK_STT_BACKEND")
            .or(fc.speech.transcription)
            .map_or(Ok(TranscriptionBackendKind::OpenAi), |s| s.parse())?;
        let synthesis = env("CHATDESK_TTS_BACKEND")
            .or(fc.speech.synthesis)
            .map_or(Ok(SynthesisBackendKind::OpenAi), |s| s.parse())?;
        let synthesis_fallbacks = match env("CHATDESK_TTS_FALLBACKS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<_>>>()?,
            None => fc
                .speech
                .synthesis_fallbacks
                .unwrap_or_default()
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<_>>>()?,
        };

        let speech = SpeechConfig {
            transcription,
            synthesis,
            synthesis_fallbacks,
            openai_api_key: secret(openai_key),
            deepgram_api_key: secret(env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram)),
            elevenlabs_api_key: secret(env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs)),
            stt_model: env("CHATDESK_STT_MODEL")
                .or(fc.speech.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_model: env("CHATDESK_TTS_MODEL")
                .or(fc.speech.tts_model)
                .unwrap_or_else(|| "tts-1".to_string()),
            default_voice: fc.speech.default_voice.unwrap_or_else(|| "alloy".to_string()),
            transcription_service_url: env("CHATDESK_STT_URL").or(fc.speech.transcription_service_url),
            local_whisper_command: fc
                .speech
                .local_whisper_command
                .unwrap_or_else(|| "whisper".to_string()),
            local_whisper_model: fc
                .speech
                .local_whisper_model
                .unwrap_or_else(|| "base".to_string()),
            cloned_voice_url: env("CHATDESK_CLONED_VOICE_URL").or(fc.speech.cloned_voice_url),
            reference_dir: fc
                .speech
                .reference_dir
                .map_or_else(|| data_dir.join("voices"), PathBuf::from),
        };

        let cache = CacheConfig {
            transcription_ttl: Duration::from_secs(fc.cache.transcription_ttl_secs.unwrap_or(3600)),
            transcription_capacity: fc.cache.transcription_capacity.unwrap_or(1000),
            synthesis_ttl: Duration::from_secs(
                fc.cache.synthesis_ttl_secs.unwrap_or(7 * 24 * 3600),
            ),
            synthesis_dir: fc
                .cache
                .synthesis_dir
                .map_or_else(|| data_dir.join("tts-cache"), PathBuf::from),
            purge_interval: Duration::from_secs(fc.cache.purge_interval_secs.unwrap_or(3600)),
        };

        let backend_timeout = Duration::from_secs(
            env("CHATDESK_BACKEND_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .or(fc.server.backend_timeout_secs)
                .unwrap_or(30),
        );

        Ok(Self {
            data_dir,
            db_path,
            api_server,
            whatsapp,
            generation,
            speech,
            cache,
            backend_timeout,
        })
    }
}
