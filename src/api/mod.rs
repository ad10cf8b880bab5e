//! HTTP API server: channel webhooks, operator endpoints, health probes

mod auth;
pub mod conversations;
pub mod health;
pub mod webhooks;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::{ConversationRepo, DbPool, MessageRepo};
use crate::pipeline::Orchestrator;
use crate::speech::SpeechBridge;
use crate::Result;

/// Shared state for API handlers
pub struct ApiState {
    pub db: DbPool,
    /// Bearer key for operator endpoints; `None` leaves them open
    pub api_key: Option<SecretString>,
    /// Token echoed back during the webhook handshake
    pub verify_token: Option<String>,
    /// Secret for `X-Hub-Signature-256`; `None` skips the check
    pub app_secret: Option<SecretString>,
    pub orchestrator: Arc<Orchestrator>,
    pub conversation_repo: ConversationRepo,
    pub message_repo: MessageRepo,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    orchestrator: Arc<Orchestrator>,
    port: u16,
    api_key: Option<SecretString>,
    verify_token: Option<String>,
    app_secret: Option<SecretString>,
    speech: Option<Arc<SpeechBridge>>,
    purge_interval: Duration,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(db: DbPool, orchestrator: Arc<Orchestrator>, port: u16) -> Self {
        Self {
            db,
            orchestrator,
            port,
            api_key: None,
            verify_token: None,
            app_secret: None,
            speech: None,
            purge_interval: Duration::from_secs(3600),
        }
    }

    /// Set the API key for operator endpoints
    #[must_use]
    pub fn api_key(mut self, key: Option<SecretString>) -> Self {
        self.api_key = key;
        self
    }

    /// Set the webhook verification token
    #[must_use]
    pub fn verify_token(mut self, token: Option<String>) -> Self {
        self.verify_token = token;
        self
    }

    /// Set the app secret used to check webhook signatures
    #[must_use]
    pub fn app_secret(mut self, secret: Option<SecretString>) -> Self {
        self.app_secret = secret;
        self
    }

    /// Sweep the synthesis cache of this bridge while serving
    #[must_use]
    pub fn speech(mut self, speech: Arc<SpeechBridge>, purge_interval: Duration) -> Self {
        self.speech = Some(speech);
        self.purge_interval = purge_interval;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let state = Arc::new(ApiState {
            conversation_repo: ConversationRepo::new(self.db.clone()),
            message_repo: MessageRepo::new(self.db.clone()),
            db: self.db,
            api_key: self.api_key,
            verify_token: self.verify_token,
            app_secret: self.app_secret,
            orchestrator: self.orchestrator,
        });

        ApiServer {
            state,
            port: self.port,
            speech: self.speech,
            purge_interval: self.purge_interval,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    speech: Option<Arc<SpeechBridge>>,
    purge_interval: Duration,
}

impl ApiServer {
    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .nest("/api/webhooks", webhooks::router(self.state.clone()))
            .nest("/api/conversations", conversations::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        if let Some(speech) = self.speech.clone() {
            spawn_cache_sweeper(speech, self.purge_interval);
        }
        if self.state.api_key.is_none() {
            tracing::warn!("no API key configured, operator endpoints are unauthenticated");
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

/// Periodically remove expired synthesis cache files
fn spawn_cache_sweeper(speech: Arc<SpeechBridge>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let speech = speech.clone();
            match tokio::task::spawn_blocking(move || speech.purge_synthesis_cache()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(removed)) => tracing::info!(removed, "purged expired synthesis cache files"),
                Ok(Err(e)) => tracing::warn!(error = %e, "synthesis cache sweep failed"),
                Err(e) => tracing::warn!(error = %e, "synthesis cache sweep task panicked"),
            }
        }
    })
}
