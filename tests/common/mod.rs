//! Shared test utilities
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatdesk::cache::{Clock, ManualClock, SynthesisCache, TranscriptionCache};
use chatdesk::channels::{ChannelSender, MediaDownload, SendReceipt};
use chatdesk::db::{self, SystemConfigRepo};
use chatdesk::engine::{GenerationRequest, ResponseEngine, TextGenerator};
use chatdesk::pipeline::{InboundEvent, InboundPayload, MediaRef};
use chatdesk::speech::{
    AudioClip, SpeechBridge, SynthesisBackend, SynthesisChain, SynthesizedAudio, Transcription,
    TranscriptionBackend,
};
use chatdesk::{DbPool, Error, Orchestrator, Result};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

/// Wednesday 2025-01-15 12:00 UTC: open under the default schedule
pub fn open_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
}

/// Wednesday 2025-01-15 22:00 UTC: closed under the default schedule
pub fn closed_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 22, 0, 0).unwrap()
}

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Set up a file-backed database that tolerates concurrent writers
pub fn setup_file_db(dir: &Path) -> DbPool {
    db::init(dir.join("chatdesk.db")).expect("failed to init file db")
}

/// Generator answering every reply request with a fixed text
pub struct FakeGenerator {
    reply: Option<String>,
    classification: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeGenerator {
    pub fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            classification: r#"{"intent": "saludo", "sentiment": "positive", "entities": []}"#
                .to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Generator whose backend is always unreachable
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            classification: String::new(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Reply requests seen so far (classification requests excluded)
    pub fn reply_requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.temperature > 0.0)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        match &self.reply {
            None => Err(Error::Generation("connection refused".to_string())),
            // The classification pass runs at temperature zero
            Some(_) if request.temperature < f32::EPSILON => Ok(self.classification.clone()),
            Some(reply) => Ok(reply.clone()),
        }
    }
}

/// Something the fake channel was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { to: String, body: String },
    Audio { to: String, mime: String, file_existed: bool },
}

/// Channel recording sends in memory
#[derive(Default)]
pub struct FakeChannel {
    sent: Mutex<Vec<Sent>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
    fail_sends: AtomicBool,
    counter: AtomicUsize,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { body, .. } => Some(body),
                Sent::Audio { .. } => None,
            })
            .collect()
    }

    pub fn add_media(&self, id: &str, bytes: &[u8]) {
        self.media.lock().unwrap().insert(id.to_string(), bytes.to_vec());
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn receipt(&self) -> Result<SendReceipt> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Channel("WhatsApp API error: 503".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendReceipt {
            message_id: Some(format!("wamid.out{n}")),
        })
    }
}

#[async_trait]
impl ChannelSender for FakeChannel {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt> {
        let receipt = self.receipt()?;
        self.sent.lock().unwrap().push(Sent::Text {
            to: to.to_string(),
            body: body.to_string(),
        });
        Ok(receipt)
    }

    async fn send_audio(&self, to: &str, audio: &SynthesizedAudio) -> Result<SendReceipt> {
        let receipt = self.receipt()?;
        self.sent.lock().unwrap().push(Sent::Audio {
            to: to.to_string(),
            mime: audio.mime.clone(),
            file_existed: audio.path.exists(),
        });
        Ok(receipt)
    }

    async fn download_media(&self, media_id: &str) -> Result<MediaDownload> {
        self.media
            .lock()
            .unwrap()
            .get(media_id)
            .map(|bytes| MediaDownload {
                bytes: bytes.clone(),
                mime: "audio/ogg".to_string(),
            })
            .ok_or_else(|| Error::Channel(format!("unknown media {media_id}")))
    }
}

/// Transcriber returning a fixed transcript, or failing when it has none
pub struct FakeTranscriber {
    text: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(text: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            text: Mutex::new(text.map(String::from)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_text(&self, text: Option<&str>) {
        *self.text.lock().unwrap() = text.map(String::from);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionBackend for FakeTranscriber {
    fn name(&self) -> &'static str {
        "fake-stt"
    }

    async fn transcribe(&self, audio: &[u8], _mime: &str) -> Result<Transcription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .text
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Stt("engine crashed".to_string()))?;
        #[allow(clippy::cast_precision_loss)]
        let duration = audio.len() as f64 / 1000.0;
        Ok(Transcription {
            text,
            language: Some("es".to_string()),
            duration_seconds: Some(duration),
            cached: false,
        })
    }
}

/// Synthesizer producing a tiny ogg clip, or refusing voices it lacks
pub struct FakeSynthesizer {
    name: &'static str,
    missing_reference: bool,
    calls: AtomicUsize,
}

impl FakeSynthesizer {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            missing_reference: false,
            calls: AtomicUsize::new(0),
        })
    }

    /// A cloned-voice style engine without reference samples
    pub fn without_reference(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            missing_reference: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisBackend for FakeSynthesizer {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<AudioClip> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_reference {
            return Err(Error::MissingReference(voice_id.to_string()));
        }
        let mut bytes = b"OggS".to_vec();
        bytes.extend_from_slice(text.as_bytes());
        Ok(AudioClip {
            bytes,
            extension: "ogg",
        })
    }
}

/// Speech bridge over fakes, caching into `cache_dir`
pub fn fake_speech(
    transcriber: Arc<FakeTranscriber>,
    synthesizers: Vec<Arc<FakeSynthesizer>>,
    cache_dir: &Path,
    clock: Arc<dyn Clock>,
) -> SpeechBridge {
    let engines: Vec<Arc<dyn SynthesisBackend>> = synthesizers
        .into_iter()
        .map(|s| s as Arc<dyn SynthesisBackend>)
        .collect();

    SpeechBridge::new(
        transcriber,
        SynthesisChain::new(engines, Duration::from_secs(5)),
        TranscriptionCache::new(100, Duration::from_secs(3600), clock.clone()),
        SynthesisCache::new(cache_dir, Duration::from_secs(7 * 24 * 3600), clock)
            .expect("failed to create synthesis cache"),
        Duration::from_secs(5),
    )
}

/// An orchestrator wired to fakes and a manual clock
pub struct Harness {
    pub pool: DbPool,
    pub clock: Arc<ManualClock>,
    pub channel: Arc<FakeChannel>,
    pub generator: Arc<FakeGenerator>,
    pub transcriber: Arc<FakeTranscriber>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub orchestrator: Arc<Orchestrator>,
    _cache_dir: TempDir,
}

impl Harness {
    pub fn new(generator: Arc<FakeGenerator>) -> Self {
        Self::with_pool(setup_test_db(), generator)
    }

    pub fn with_pool(pool: DbPool, generator: Arc<FakeGenerator>) -> Self {
        let clock = Arc::new(ManualClock::new(open_instant()));
        let channel = FakeChannel::new();
        let transcriber = FakeTranscriber::new(Some("Quiero una pizza"));
        let synthesizer = FakeSynthesizer::new("fake-tts");
        let cache_dir = tempfile::tempdir().expect("failed to create cache dir");

        let speech = fake_speech(
            transcriber.clone(),
            vec![synthesizer.clone()],
            cache_dir.path(),
            clock.clone(),
        );
        let engine = ResponseEngine::new(generator.clone(), "test-model", Duration::from_secs(5));

        let orchestrator = Orchestrator::new(pool.clone(), Arc::new(engine), channel.clone(), clock.clone())
            .with_speech(Arc::new(speech))
            .with_send_timeout(Duration::from_secs(5));

        Self {
            pool,
            clock,
            channel,
            generator,
            transcriber,
            synthesizer,
            orchestrator: Arc::new(orchestrator),
            _cache_dir: cache_dir,
        }
    }

    /// Write a runtime setting
    pub fn set_config(&self, key: &str, value: &str) {
        SystemConfigRepo::new(self.pool.clone())
            .set(key, value, Utc::now())
            .expect("failed to write setting");
    }
}

pub fn text_event(from: &str, id: &str, body: &str) -> InboundEvent {
    InboundEvent::text(from, id, body)
}

pub fn audio_event(from: &str, id: &str, media_id: &str) -> InboundEvent {
    InboundEvent {
        channel_address: from.to_string(),
        channel_message_id: id.to_string(),
        sender_display_name: None,
        payload: InboundPayload::Audio(MediaRef::new(media_id, Some("audio/ogg".to_string()))),
    }
}

pub fn image_event(from: &str, id: &str) -> InboundEvent {
    InboundEvent {
        channel_address: from.to_string(),
        channel_message_id: id.to_string(),
        sender_display_name: None,
        payload: InboundPayload::Image(MediaRef::new("img-1", Some("image/jpeg".to_string()))),
    }
}
