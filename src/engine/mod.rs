//! Response engine
//!
//! Turns a user message plus recent history into a reply, then runs a cheap
//! classification pass for intent and sentiment. Backend failures never
//! escape: the engine answers with the configured fallback reply instead.

pub mod classify;
pub mod prompt;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use classify::{Classification, Intent, Sentiment};
pub use prompt::{DEFAULT_PERSONA, UserProfile};
pub use provider::OpenAiCompatibleGenerator;

use crate::config::PipelineSettings;
use crate::db::Message;
use crate::{Error, Result};

/// Chat role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat turn
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Generative text backend
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Return the completion text for a request
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unreachable or answers with nothing
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;
}

/// What the engine produced for one user message
#[derive(Debug, Clone, Serialize)]
pub struct EngineReply {
    /// Reply text, signature included
    pub reply: String,
    pub intent: Option<Intent>,
    pub sentiment: Option<Sentiment>,
    pub entities: Vec<String>,
    /// False when the fallback reply stood in for the backend
    pub generated: bool,
}

/// Reply generation over a [`TextGenerator`]
pub struct ResponseEngine {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    default_model: String,
    persona: String,
}

impl ResponseEngine {
    /// Create an engine; each backend call runs under `timeout`
    #[must_use]
    pub fn new(generator: Arc<dyn TextGenerator>, default_model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            generator,
            timeout,
            default_model: default_model.into(),
            persona: DEFAULT_PERSONA.to_string(),
        }
    }

    /// Replace the persona block
    #[must_use]
    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    fn model<'a>(&'a self, settings: &'a PipelineSettings) -> &'a str {
        if settings.model.is_empty() {
            &self.default_model
        } else {
            &settings.model
        }
    }

    async fn call(&self, request: &GenerationRequest) -> Result<String> {
        tokio::time::timeout(self.timeout, self.generator.complete(request))
            .await
            .map_err(|_| Error::Timeout(format!("{} generation", self.generator.name())))?
    }

    /// Generate a reply to `text`
    ///
    /// `history` is the recent conversation, oldest first, without `text`.
    pub async fn generate(
        &self,
        text: &str,
        history: &[Message],
        profile: &UserProfile,
        settings: &PipelineSettings,
    ) -> EngineReply {
        let request = GenerationRequest {
            model: self.model(settings).to_string(),
            messages: prompt::build_messages(&self.persona, profile, history, text),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        };

        let reply = match self.call(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(backend = self.generator.name(), error = %e, "generation failed, using fallback reply");
                return EngineReply {
                    reply: sign(&settings.fallback_reply, &settings.signature),
                    intent: None,
                    sentiment: None,
                    entities: Vec::new(),
                    generated: false,
                };
            }
        };

        let classification = if settings.intent_detection || settings.sentiment_analysis {
            Some(self.classify(text, settings).await)
        } else {
            None
        };

        EngineReply {
            reply: sign(&reply, &settings.signature),
            intent: classification
                .as_ref()
                .filter(|_| settings.intent_detection)
                .map(|c| c.intent),
            sentiment: classification
                .as_ref()
                .filter(|_| settings.sentiment_analysis)
                .map(|c| c.sentiment),
            entities: classification.map(|c| c.entities).unwrap_or_default(),
            generated: true,
        }
    }

    /// Classify a user message; failures yield the default labels
    pub async fn classify(&self, text: &str, settings: &PipelineSettings) -> Classification {
        let request = classify::classification_request(text, self.model(settings));
        match self.call(&request).await {
            Ok(raw) => classify::parse_classification(&raw),
            Err(e) => {
                tracing::warn!(error = %e, "classification failed, using defaults");
                Classification::default()
            }
        }
    }
}

/// Append the signature unless it is already there
#[must_use]
pub fn sign(reply: &str, signature: &str) -> String {
    if signature.is_empty() || reply.ends_with(signature) {
        reply.to_string()
    } else {
        format!("{reply}{signature}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Answers generation calls from a script, recording each request
    struct Scripted {
        replies: Mutex<Vec<Result<String>>>,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, request: &GenerationRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Err(Error::Generation("script exhausted".to_string()))
            } else {
                replies.remove(0)
            }
        }
    }

    struct Hanging;

    #[async_trait]
    impl TextGenerator for Hanging {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn complete(&self, _request: &GenerationRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            signature: "\n-- bot".to_string(),
            ..PipelineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_reply_with_classification() {
        let generator = Scripted::new(vec![
            Ok("¡Hola! ¿Qué deseas ordenar?".to_string()),
            Ok(r#"{"intent": "saludo", "sentiment": "positive", "entities": []}"#.to_string()),
        ]);
        let engine = ResponseEngine::new(generator.clone(), "gpt-4o-mini", Duration::from_secs(5));

        let reply = engine
            .generate("Hola", &[], &UserProfile::default(), &settings())
            .await;

        assert!(reply.generated);
        assert_eq!(reply.reply, "¡Hola! ¿Qué deseas ordenar?\n-- bot");
        assert_eq!(reply.intent, Some(Intent::Saludo));
        assert_eq!(reply.sentiment, Some(Sentiment::Positive));

        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].model, "gpt-4o-mini");
        assert!(seen[1].temperature < seen[0].temperature);
    }

    #[tokio::test]
    async fn test_backend_failure_uses_fallback() {
        let generator = Scripted::new(vec![Err(Error::Generation("connection refused".to_string()))]);
        let engine = ResponseEngine::new(generator, "gpt-4o-mini", Duration::from_secs(5));
        let settings = settings();

        let reply = engine.generate("Hola", &[], &UserProfile::default(), &settings).await;

        assert!(!reply.generated);
        assert_eq!(reply.reply, format!("{}\n-- bot", settings.fallback_reply));
        assert!(reply.intent.is_none());
    }

    #[tokio::test]
    async fn test_timeout_uses_fallback() {
        let engine = ResponseEngine::new(Arc::new(Hanging), "m", Duration::from_millis(50));
        let reply = engine
            .generate("Hola", &[], &UserProfile::default(), &settings())
            .await;
        assert!(!reply.generated);
    }

    #[tokio::test]
    async fn test_classification_failure_defaults() {
        let generator = Scripted::new(vec![Ok("Claro".to_string()), Ok("no idea".to_string())]);
        let engine = ResponseEngine::new(generator, "m", Duration::from_secs(5));

        let reply = engine
            .generate("¿Tienen envío?", &[], &UserProfile::default(), &settings())
            .await;

        assert_eq!(reply.intent, Some(Intent::Consulta));
        assert_eq!(reply.sentiment, Some(Sentiment::Neutral));
    }

    #[tokio::test]
    async fn test_classification_skipped_when_disabled() {
        let generator = Scripted::new(vec![Ok("Claro".to_string())]);
        let engine = ResponseEngine::new(generator.clone(), "m", Duration::from_secs(5));
        let settings = PipelineSettings {
            intent_detection: false,
            sentiment_analysis: false,
            model: "override".to_string(),
            ..settings()
        };

        let reply = engine.generate("x", &[], &UserProfile::default(), &settings).await;

        assert!(reply.intent.is_none());
        assert!(reply.sentiment.is_none());
        let seen = generator.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model, "override");
    }

    #[test]
    fn test_sign_is_idempotent() {
        assert_eq!(sign("hola", " ~bot"), "hola ~bot");
        assert_eq!(sign("hola ~bot", " ~bot"), "hola ~bot");
        assert_eq!(sign("hola", ""), "hola");
    }
}
