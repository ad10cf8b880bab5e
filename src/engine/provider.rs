//! OpenAI-compatible chat completions client

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{GenerationRequest, TextGenerator};
use crate::{Error, Result};

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Any server speaking the `/chat/completions` protocol
pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleGenerator {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`)
    ///
    /// # Errors
    ///
    /// Returns error if the URL is not http(s) or the client cannot be built
    pub fn new(base_url: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(Error::Config(format!("invalid generation base URL: {base_url}")));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(model = %request.model, url = %url, turns = request.messages.len(), "calling generation API");

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("generation API error {status}: {body}")));
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Generation("empty completion".to_string()))
    }
}
