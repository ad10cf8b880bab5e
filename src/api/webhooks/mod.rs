//! Webhook endpoints for channel integrations

use std::sync::Arc;

use axum::{Router, routing::get};

use super::ApiState;

pub mod whatsapp;

/// Build webhooks router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(
            "/whatsapp",
            get(whatsapp::verify_subscription).post(whatsapp::handle_delivery),
        )
        .with_state(state)
}
