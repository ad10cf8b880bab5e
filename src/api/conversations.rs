//! Operator endpoints over conversation state

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, patch, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{ApiState, auth::require_operator_key};
use crate::Error;
use crate::db::{BotMode, Conversation, ConversationPatch, ConversationStatus, Message};

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<ConversationStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct ReplyRequest {
    pub body: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(code: &str, message: &str) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
        },
    })
}

fn api_error(e: &Error) -> ApiError {
    let (status, code) = match e {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        Error::Channel(_) | Error::Timeout(_) | Error::Http(_) => (StatusCode::BAD_GATEWAY, "channel_error"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "operator request failed");
    }
    (status, error_response(code, &e.to_string()))
}

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

// --- Handlers ---

/// List conversations, optionally filtered by status
async fn list_conversations(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIMIT);
    state
        .conversation_repo
        .list(query.status, limit)
        .map(Json)
        .map_err(|e| api_error(&e))
}

fn find_conversation(state: &ApiState, id: &str) -> Result<Conversation, ApiError> {
    state
        .conversation_repo
        .find(id)
        .map_err(|e| api_error(&e))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, error_response("not_found", "Conversation not found")))
}

/// Recent messages of a conversation, oldest first
async fn list_messages(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    find_conversation(&state, &id)?;

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIMIT);
    state
        .message_repo
        .recent(&id, limit, None)
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Assigning an operator takes the conversation to manual mode and
/// releasing it returns to auto, unless the patch names a mode itself
fn with_operator_mode(mut patch: ConversationPatch) -> ConversationPatch {
    if patch.bot_mode.is_none() {
        patch.bot_mode = match &patch.assigned_operator {
            Some(Some(_)) => Some(BotMode::Manual),
            Some(None) => Some(BotMode::Auto),
            None => None,
        };
    }
    patch
}

/// Change bot mode, operator assignment or unread flag
async fn update_conversation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(patch): Json<ConversationPatch>,
) -> Result<Json<Conversation>, ApiError> {
    find_conversation(&state, &id)?;

    let patch = with_operator_mode(patch);
    state
        .conversation_repo
        .update(&id, &patch, Utc::now())
        .map_err(|e| api_error(&e))?;

    tracing::info!(conversation_id = %id, bot_mode = ?patch.bot_mode, "conversation updated by operator");
    find_conversation(&state, &id).map(Json)
}

/// Close an active conversation
async fn close_conversation(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    state
        .conversation_repo
        .close(&id, Utc::now())
        .map_err(|e| api_error(&e))?;

    tracing::info!(conversation_id = %id, "conversation closed");
    find_conversation(&state, &id).map(Json)
}

/// Send a reply from a human operator
async fn send_reply(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<ReplyRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let message = state
        .orchestrator
        .send_operator_reply(&id, &req.body)
        .await
        .map_err(|e| api_error(&e))?;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Build conversations router with auth middleware
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_conversations))
        .route("/{id}", patch(update_conversation))
        .route("/{id}/close", post(close_conversation))
        .route("/{id}/messages", get(list_messages).post(send_reply))
        .layer(middleware::from_fn_with_state(state.clone(), require_operator_key))
        .with_state(state)
}
