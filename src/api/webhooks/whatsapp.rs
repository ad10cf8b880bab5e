//! `WhatsApp` webhook handler
//!
//! Acknowledges every signed delivery with 200 so the provider never
//! retries. The raw body is logged first; message events run through the
//! orchestrator in the background and the log resolves once they finish.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::api::ApiState;
use crate::channels::WhatsAppWebhook;
use crate::channels::whatsapp::verify_signature;
use crate::pipeline::Outcome;

/// `WhatsApp` webhook response
#[derive(Serialize)]
pub struct WebhookResponse {
    pub ok: bool,
}

/// Subscription handshake parameters
#[derive(Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Answer the subscription handshake by echoing the challenge
pub async fn verify_subscription(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, String) {
    let token_matches = matches!(
        (&state.verify_token, &params.verify_token),
        (Some(expected), Some(provided)) if expected == provided
    );

    if params.mode.as_deref() == Some("subscribe") && token_matches {
        tracing::info!("WhatsApp webhook verified");
        (StatusCode::OK, params.challenge.unwrap_or_default())
    } else {
        tracing::warn!(mode = ?params.mode, "WhatsApp webhook verification rejected");
        (StatusCode::FORBIDDEN, String::new())
    }
}

/// Handle a webhook delivery
///
/// Returns 200 immediately after the signature check; message processing
/// happens in a background task.
#[allow(clippy::unused_async)]
pub async fn handle_delivery(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    if let Some(secret) = &state.app_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());

        if !verify_signature(secret, &body, signature) {
            tracing::warn!("WhatsApp webhook signature mismatch");
            return (StatusCode::FORBIDDEN, Json(WebhookResponse { ok: false }));
        }
    }

    let orchestrator = state.orchestrator.clone();
    let log_id = orchestrator.record_delivery(&String::from_utf8_lossy(&body));

    let payload: WhatsAppWebhook = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "unparseable WhatsApp webhook payload");
            orchestrator.finish_delivery(log_id.as_deref(), Some(&format!("unparseable payload: {e}")));
            return (StatusCode::OK, Json(WebhookResponse { ok: true }));
        }
    };

    for status in payload.status_events() {
        orchestrator.apply_status(&status);
    }

    let events = payload.inbound_events();
    if events.is_empty() {
        orchestrator.finish_delivery(log_id.as_deref(), None);
    } else {
        tracing::debug!(count = events.len(), "received WhatsApp messages");
        tokio::spawn(async move {
            let mut failed = 0usize;
            for event in &events {
                if orchestrator.process(event).await == Outcome::Failed {
                    failed += 1;
                }
            }
            let failure = (failed > 0).then(|| format!("{failed} of {} message(s) failed", events.len()));
            orchestrator.finish_delivery(log_id.as_deref(), failure.as_deref());
        });
    }

    (StatusCode::OK, Json(WebhookResponse { ok: true }))
}
