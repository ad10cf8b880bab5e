//! Text-to-speech (TTS) backends and the fallback chain

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{AudioClip, SynthesisBackend};
use crate::{Error, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

async fn audio_body(response: reqwest::Response, engine: &str) -> Result<Vec<u8>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Tts(format!("{engine} TTS error {status}: {body}")));
    }

    let audio = response.bytes().await?;
    if audio.is_empty() {
        return Err(Error::Tts(format!("{engine} returned no audio")));
    }
    Ok(audio.to_vec())
}

/// `OpenAI` speech API, producing Ogg/Opus voice notes
pub struct OpenAiTtsBackend {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenAiTtsBackend {
    /// Create an `OpenAI` TTS backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
        })
    }

    /// Point the backend at another OpenAI-compatible endpoint
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SynthesisBackend for OpenAiTtsBackend {
    fn name(&self) -> &'static str {
        "openai-tts"
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<AudioClip> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: voice_id,
            response_format: "opus",
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        Ok(AudioClip {
            bytes: audio_body(response, "OpenAI").await?,
            extension: "ogg",
        })
    }
}

/// `ElevenLabs` API
pub struct ElevenLabsBackend {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl ElevenLabsBackend {
    /// Create an `ElevenLabs` backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("ElevenLabs API key required for TTS".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            model: "eleven_multilingual_v2".to_string(),
            base_url: "https://api.elevenlabs.io/v1".to_string(),
        })
    }

    /// Point the backend at another endpoint
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SynthesisBackend for ElevenLabsBackend {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<AudioClip> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let response = self
            .client
            .post(format!("{}/text-to-speech/{voice_id}", self.base_url))
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.model,
            })
            .send()
            .await?;

        Ok(AudioClip {
            bytes: audio_body(response, "ElevenLabs").await?,
            extension: "mp3",
        })
    }
}

/// Cloned-voice microservice
///
/// Each voice needs a reference recording at `<reference_dir>/<voice_id>.wav`.
/// Without one the engine reports `MissingReference` so the chain can move on.
pub struct ClonedVoiceBackend {
    client: reqwest::Client,
    url: String,
    reference_dir: PathBuf,
}

impl ClonedVoiceBackend {
    /// Create a backend posting to `url`
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty
    pub fn new(url: String, reference_dir: PathBuf) -> Result<Self> {
        if url.is_empty() {
            return Err(Error::Config("cloned voice service URL required".to_string()));
        }
        Ok(Self {
            client: http_client()?,
            url,
            reference_dir,
        })
    }

    fn reference_path(&self, voice_id: &str) -> Result<PathBuf> {
        // Voice ids are file stems; refuse anything that could leave the directory
        if voice_id.is_empty() || voice_id.contains(['/', '\\']) || voice_id.starts_with('.') {
            return Err(Error::MissingReference(format!("invalid voice id {voice_id:?}")));
        }
        Ok(self.reference_dir.join(format!("{voice_id}.wav")))
    }
}

#[async_trait]
impl SynthesisBackend for ClonedVoiceBackend {
    fn name(&self) -> &'static str {
        "cloned-voice"
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<AudioClip> {
        let reference_path = self.reference_path(voice_id)?;
        let reference = match tokio::fs::read(&reference_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingReference(reference_path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let form = reqwest::multipart::Form::new()
            .text("text", text.to_string())
            .part(
                "reference",
                reqwest::multipart::Part::bytes(reference)
                    .file_name(format!("{voice_id}.wav"))
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Tts(e.to_string()))?,
            );

        let response = self.client.post(&self.url).multipart(form).send().await?;

        Ok(AudioClip {
            bytes: audio_body(response, "cloned voice").await?,
            extension: "wav",
        })
    }
}

/// Ordered list of engines; the first one that succeeds wins
pub struct SynthesisChain {
    engines: Vec<Arc<dyn SynthesisBackend>>,
    timeout: Duration,
}

impl SynthesisChain {
    /// Create a chain; each engine call runs under `timeout`
    #[must_use]
    pub fn new(engines: Vec<Arc<dyn SynthesisBackend>>, timeout: Duration) -> Self {
        Self { engines, timeout }
    }

    /// Engine names in order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    /// Synthesize with the first engine able to serve the request
    ///
    /// # Errors
    ///
    /// Returns the last engine's error if every engine fails
    pub async fn synthesize(&self, text: &str, voice_id: &str) -> Result<AudioClip> {
        let mut last_error = Error::Tts("no synthesis engine configured".to_string());

        for engine in &self.engines {
            let attempt = tokio::time::timeout(self.timeout, engine.synthesize(text, voice_id))
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(format!("{} synthesis", engine.name()))));

            match attempt {
                Ok(clip) => {
                    tracing::debug!(engine = engine.name(), bytes = clip.bytes.len(), "speech synthesized");
                    return Ok(clip);
                }
                Err(e @ Error::MissingReference(_)) => {
                    tracing::warn!(engine = engine.name(), error = %e, "engine cannot serve voice, trying next");
                    last_error = e;
                }
                Err(e) => {
                    tracing::warn!(engine = engine.name(), error = %e, "synthesis failed, trying next");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}
