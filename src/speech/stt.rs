//! Speech-to-text (STT) backends

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{Transcription, TranscriptionBackend};
use crate::{Error, Result};

/// Upper bound on any single STT HTTP request, independent of the bridge deadline
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// File extension for an audio MIME type
fn extension_for_mime(mime: &str) -> &'static str {
    match mime.split(';').next().map(str::trim).unwrap_or_default() {
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/aac" => "m4a",
        "audio/amr" => "amr",
        "audio/webm" => "webm",
        _ => "wav",
    }
}

/// Response from `OpenAI` Whisper with `response_format=verbose_json`
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

/// `OpenAI` Whisper API
pub struct WhisperApiBackend {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl WhisperApiBackend {
    /// Create a Whisper backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for Whisper".to_string()));
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
impl TranscriptionBackend for WhisperApiBackend {
    fn name(&self) -> &'static str {
        "whisper-api"
    }

    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcription> {
        tracing::debug!(audio_bytes = audio.len(), mime, "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name(format!("audio.{}", extension_for_mime(mime)))
                    .mime_str(mime)
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;

        Ok(Transcription {
            text: result.text,
            language: result.language,
            duration_seconds: result.duration,
            cached: false,
        })
    }
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    #[serde(default)]
    metadata: Option<DeepgramMetadata>,
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramMetadata {
    duration: Option<f64>,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    detected_language: Option<String>,
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Deepgram API
pub struct DeepgramBackend {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl DeepgramBackend {
    /// Create a Deepgram backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: http_client()?,
            api_key,
            model,
            base_url: "https://api.deepgram.com/v1".to_string(),
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
impl TranscriptionBackend for DeepgramBackend {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcription> {
        tracing::debug!(audio_bytes = audio.len(), mime, "starting Deepgram transcription");

        let url = format!(
            "{}/listen?model={}&punctuate=true&detect_language=true",
            self.base_url, self.model
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key.expose_secret()))
            .header("Content-Type", mime)
            .body(audio.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;
        let channel = result.results.channels.first();

        Ok(Transcription {
            text: channel
                .and_then(|c| c.alternatives.first())
                .map(|a| a.transcript.clone())
                .unwrap_or_default(),
            language: channel.and_then(|c| c.detected_language.clone()),
            duration_seconds: result.metadata.and_then(|m| m.duration),
            cached: false,
        })
    }
}

/// Response from a self-hosted transcription service
#[derive(serde::Deserialize)]
struct ServiceResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default, alias = "duration_seconds")]
    duration: Option<f64>,
}

/// Self-hosted HTTP microservice accepting raw audio
pub struct HttpServiceBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpServiceBackend {
    /// Create a backend posting to `url`
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty
    pub fn new(url: String) -> Result<Self> {
        if url.is_empty() {
            return Err(Error::Config("transcription service URL required".to_string()));
        }
        Ok(Self {
            client: http_client()?,
            url,
        })
    }
}

#[async_trait]
impl TranscriptionBackend for HttpServiceBackend {
    fn name(&self) -> &'static str {
        "http-service"
    }

    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcription> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", mime)
            .body(audio.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "transcription service error");
            return Err(Error::Stt(format!("transcription service error {status}: {body}")));
        }

        let result: ServiceResponse = response.json().await?;
        Ok(Transcription {
            text: result.text,
            language: result.language,
            duration_seconds: result.duration,
            cached: false,
        })
    }
}

/// JSON written by the whisper CLI with `--output_format json`
#[derive(serde::Deserialize)]
struct WhisperCliOutput {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<WhisperCliSegment>,
}

#[derive(serde::Deserialize)]
struct WhisperCliSegment {
    end: f64,
}

/// Local whisper binary run as a child process
pub struct LocalCommandBackend {
    binary: PathBuf,
    model: String,
}

impl LocalCommandBackend {
    /// Locate `command` on `PATH`
    ///
    /// # Errors
    ///
    /// Returns error if the binary cannot be found
    pub fn new(command: &str, model: String) -> Result<Self> {
        let binary = which::which(command)
            .map_err(|e| Error::Config(format!("whisper binary {command:?} not found: {e}")))?;
        Ok(Self { binary, model })
    }
}

#[async_trait]
impl TranscriptionBackend for LocalCommandBackend {
    fn name(&self) -> &'static str {
        "local-whisper"
    }

    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcription> {
        // Input and output both live in a scratch dir removed on every exit path
        let scratch = tempfile::tempdir()?;
        let input = scratch
            .path()
            .join(format!("input.{}", extension_for_mime(mime)));
        tokio::fs::write(&input, audio).await?;

        let output = tokio::process::Command::new(&self.binary)
            .arg(&input)
            .args(["--model", self.model.as_str(), "--output_format", "json", "--output_dir"])
            .arg(scratch.path())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(status = %output.status, stderr = %stderr, "local whisper failed");
            return Err(Error::Stt(format!("local whisper exited with {}", output.status)));
        }

        let json = tokio::fs::read_to_string(scratch.path().join("input.json")).await?;
        let result: WhisperCliOutput = serde_json::from_str(&json)?;

        Ok(Transcription {
            text: result.text,
            language: result.language,
            duration_seconds: result.segments.last().map(|s| s.end),
            cached: false,
        })
    }
}
