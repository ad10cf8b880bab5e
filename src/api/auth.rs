//! Operator authentication for the conversation endpoints
//!
//! Operators present the admin key as `Authorization: Bearer <key>`. Keys
//! are compared through their SHA-256 digests so the comparison time does
//! not depend on how much of the key matched. With no key configured the
//! operator surface runs open, which only makes sense on a trusted network.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use super::ApiState;

/// Bearer token from the request, if any
fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn key_matches(expected: &SecretString, provided: &str) -> bool {
    let expected = Sha256::digest(expected.expose_secret().as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    expected
        .iter()
        .zip(provided.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Reject operator requests without the admin key
pub async fn require_operator_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    match bearer_token(&req) {
        Some(token) if key_matches(expected, token) => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!(method = %req.method(), path = %req.uri().path(), "operator request with wrong key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!(path = %req.uri().path(), "operator request without key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
