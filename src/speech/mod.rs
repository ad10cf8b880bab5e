//! Speech bridge: transcription and synthesis behind pluggable backends
//!
//! Both directions consult a content-addressable cache before calling a
//! backend, and every backend call runs under a deadline. Synthesis returns
//! a [`SynthesizedAudio`] whose transient file (if any) must be released by
//! the caller once the audio has been sent.

pub mod stt;
pub mod tts;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use stt::{DeepgramBackend, HttpServiceBackend, LocalCommandBackend, WhisperApiBackend};
pub use tts::{ClonedVoiceBackend, ElevenLabsBackend, OpenAiTtsBackend, SynthesisChain};

use crate::cache::{SynthesisCache, TranscriptionCache, audio_mime_for_extension, synthesis_key};
use crate::config::{Config, SynthesisBackendKind, TranscriptionBackendKind};
use crate::{Error, Result};

/// A transcript of one audio clip
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcription {
    pub text: String,
    pub language: Option<String>,
    pub duration_seconds: Option<f64>,
    /// Served from the transcription cache
    pub cached: bool,
}

/// Speech-to-text engine
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Transcribe audio bytes of the given MIME type
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails or is unreachable
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcription>;
}

/// Synthesized audio bytes and their container format
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    /// File extension (`ogg`, `mp3`, `wav`)
    pub extension: &'static str,
}

/// Text-to-speech engine
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Synthesize `text` in `voice_id`
    ///
    /// # Errors
    ///
    /// Returns `MissingReference` when the engine cannot serve this voice,
    /// or another error if the engine fails
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<AudioClip>;
}

/// Audio ready to send, plus ownership of any transient file backing it
#[derive(Debug)]
pub struct SynthesizedAudio {
    pub path: PathBuf,
    pub mime: String,
    /// Served from the synthesis cache
    pub cached: bool,
    transient: Option<tempfile::TempPath>,
}

impl SynthesizedAudio {
    /// Whether `path` is a transient file owned by this handle
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.transient.is_some()
    }

    /// Delete the transient file, if any
    ///
    /// Safe to call more than once; a no-op when `path` is the cache copy.
    pub fn release(&mut self) {
        if let Some(tmp) = self.transient.take() {
            let path = tmp.to_path_buf();
            if let Err(e) = tmp.close() {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove transient audio");
            }
        }
    }
}

/// Transcription and synthesis with caching, deadlines and fallback
pub struct SpeechBridge {
    transcriber: Arc<dyn TranscriptionBackend>,
    synthesizer: SynthesisChain,
    transcription_cache: TranscriptionCache,
    synthesis_cache: SynthesisCache,
    timeout: Duration,
    default_voice: String,
}

impl SpeechBridge {
    /// Assemble a bridge from its parts
    #[must_use]
    pub fn new(
        transcriber: Arc<dyn TranscriptionBackend>,
        synthesizer: SynthesisChain,
        transcription_cache: TranscriptionCache,
        synthesis_cache: SynthesisCache,
        timeout: Duration,
    ) -> Self {
        Self {
            transcriber,
            synthesizer,
            transcription_cache,
            synthesis_cache,
            timeout,
            default_voice: "alloy".to_string(),
        }
    }

    /// Voice used when a request names none
    #[must_use]
    pub fn with_default_voice(mut self, voice: impl Into<String>) -> Self {
        self.default_voice = voice.into();
        self
    }

    /// Build the configured backends and wire them to the caches
    ///
    /// # Errors
    ///
    /// Returns error if a selected backend lacks its credentials or binary
    pub fn from_config(
        config: &Config,
        transcription_cache: TranscriptionCache,
        synthesis_cache: SynthesisCache,
    ) -> Result<Self> {
        let transcriber = build_transcriber(config)?;

        let mut engines: Vec<Arc<dyn SynthesisBackend>> = Vec::new();
        for kind in std::iter::once(config.speech.synthesis).chain(config.speech.synthesis_fallbacks.iter().copied()) {
            match build_synthesizer(config, kind) {
                Ok(engine) => engines.push(engine),
                Err(e) => tracing::warn!(?kind, error = %e, "synthesis engine unavailable"),
            }
        }
        if engines.is_empty() {
            return Err(Error::Config("no synthesis engine could be configured".to_string()));
        }

        tracing::info!(
            transcription = transcriber.name(),
            synthesis = ?engines.iter().map(|e| e.name()).collect::<Vec<_>>(),
            "speech backends ready"
        );

        Ok(Self::new(
            transcriber,
            SynthesisChain::new(engines, config.backend_timeout),
            transcription_cache,
            synthesis_cache,
            config.backend_timeout,
        )
        .with_default_voice(config.speech.default_voice.clone()))
    }

    /// Transcribe audio, consulting the cache first
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails, times out, or hears nothing
    pub async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcription> {
        let key = TranscriptionCache::key(audio);

        if let Some(mut hit) = self.transcription_cache.get(&key) {
            tracing::debug!(key = %key, "transcription cache hit");
            hit.cached = true;
            return Ok(hit);
        }

        let mut transcription =
            tokio::time::timeout(self.timeout, self.transcriber.transcribe(audio, mime))
                .await
                .map_err(|_| {
                    Error::Timeout(format!("{} transcription", self.transcriber.name()))
                })??;

        transcription.text = transcription.text.trim().to_string();
        if transcription.text.is_empty() {
            return Err(Error::Stt("empty transcript".to_string()));
        }

        transcription.cached = false;
        self.transcription_cache.put(&key, transcription.clone());

        tracing::info!(
            backend = self.transcriber.name(),
            chars = transcription.text.len(),
            language = ?transcription.language,
            "audio transcribed"
        );
        Ok(transcription)
    }

    /// Synthesize speech, consulting the cache first
    ///
    /// An empty `voice_id` selects the default voice.
    ///
    /// # Errors
    ///
    /// Returns error if every synthesis engine fails
    pub async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SynthesizedAudio> {
        let voice = if voice_id.is_empty() {
            self.default_voice.as_str()
        } else {
            voice_id
        };
        let key = synthesis_key(voice, text);

        if let Some(path) = self.synthesis_cache.get(&key) {
            tracing::debug!(key = %key, "synthesis cache hit");
            let mime = mime_for_path(&path);
            return Ok(SynthesizedAudio {
                path,
                mime,
                cached: true,
                transient: None,
            });
        }

        let clip = self.synthesizer.synthesize(text, voice).await?;
        let mime = audio_mime_for_extension(clip.extension).to_string();

        match self.synthesis_cache.put(&key, &clip.bytes, clip.extension) {
            Ok(path) => Ok(SynthesizedAudio {
                path,
                mime,
                cached: false,
                transient: None,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "synthesis cache write failed, using transient file");
                let transient = write_transient(&clip)?;
                Ok(SynthesizedAudio {
                    path: transient.to_path_buf(),
                    mime,
                    cached: false,
                    transient: Some(transient),
                })
            }
        }
    }

    /// Remove expired synthesis cache files
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be read
    pub fn purge_synthesis_cache(&self) -> Result<usize> {
        self.synthesis_cache.purge_expired()
    }
}

fn mime_for_path(path: &std::path::Path) -> String {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    audio_mime_for_extension(ext).to_string()
}

fn write_transient(clip: &AudioClip) -> Result<tempfile::TempPath> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("chatdesk-tts-")
        .suffix(&format!(".{}", clip.extension))
        .tempfile()?;
    file.write_all(&clip.bytes)?;
    Ok(file.into_temp_path())
}

fn build_transcriber(config: &Config) -> Result<Arc<dyn TranscriptionBackend>> {
    let speech = &config.speech;
    let backend: Arc<dyn TranscriptionBackend> = match speech.transcription {
        TranscriptionBackendKind::OpenAi => Arc::new(WhisperApiBackend::new(
            speech
                .openai_api_key
                .clone()
                .ok_or_else(|| Error::Config("OpenAI API key required for Whisper".to_string()))?,
            speech.stt_model.clone(),
        )?),
        TranscriptionBackendKind::Deepgram => Arc::new(DeepgramBackend::new(
            speech
                .deepgram_api_key
                .clone()
                .ok_or_else(|| Error::Config("Deepgram API key required".to_string()))?,
            "nova-2".to_string(),
        )?),
        TranscriptionBackendKind::Http => Arc::new(HttpServiceBackend::new(
            speech
                .transcription_service_url
                .clone()
                .ok_or_else(|| Error::Config("transcription service URL required".to_string()))?,
        )?),
        TranscriptionBackendKind::Local => Arc::new(LocalCommandBackend::new(
            &speech.local_whisper_command,
            speech.local_whisper_model.clone(),
        )?),
    };
    Ok(backend)
}

fn build_synthesizer(config: &Config, kind: SynthesisBackendKind) -> Result<Arc<dyn SynthesisBackend>> {
    let speech = &config.speech;
    let backend: Arc<dyn SynthesisBackend> = match kind {
        SynthesisBackendKind::OpenAi => Arc::new(OpenAiTtsBackend::new(
            speech
                .openai_api_key
                .clone()
                .ok_or_else(|| Error::Config("OpenAI API key required for TTS".to_string()))?,
            speech.tts_model.clone(),
        )?),
        SynthesisBackendKind::ElevenLabs => Arc::new(ElevenLabsBackend::new(
            speech
                .elevenlabs_api_key
                .clone()
                .ok_or_else(|| Error::Config("ElevenLabs API key required for TTS".to_string()))?,
        )?),
        SynthesisBackendKind::Cloned => Arc::new(ClonedVoiceBackend::new(
            speech
                .cloned_voice_url
                .clone()
                .ok_or_else(|| Error::Config("cloned voice service URL required".to_string()))?,
            speech.reference_dir.clone(),
        )?),
    };
    Ok(backend)
}
