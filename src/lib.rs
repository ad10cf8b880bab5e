//! Chatdesk - messaging pipeline for automated and operator-assisted conversations
//!
//! This library provides the core functionality for the chatdesk server:
//! - Channel webhook ingestion with duplicate-delivery safety
//! - Conversation state with automated and manual (operator) reply modes
//! - Business-hours gating
//! - Voice notes: transcription and synthesis with content caches
//! - Reply generation via an OpenAI-compatible backend
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          WhatsApp webhook  │  Operator API           │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Orchestrator                        │
//! │  Schedule gate │ Response engine │ Speech bridge     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   SQLite store  │  Transcription / synthesis caches  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod cache;
pub mod channels;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod schedule;
pub mod speech;

pub use config::{Config, PipelineSettings};
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use pipeline::{InboundEvent, Orchestrator, Outcome};
