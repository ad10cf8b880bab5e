//! Messaging channel adapters
//!
//! A channel delivers inbound events through its webhook and exposes
//! [`ChannelSender`] for the outbound side.

pub mod whatsapp;

use async_trait::async_trait;

pub use whatsapp::{WhatsAppChannel, WhatsAppWebhook};

use crate::Result;
use crate::speech::SynthesizedAudio;

/// Provider acknowledgement of a sent message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-assigned message ID, when the provider returns one
    pub message_id: Option<String>,
}

/// Media fetched from the channel
#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Outbound side of a messaging channel
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Channel name for logs
    fn name(&self) -> &'static str;

    /// Send a text message to `to`
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects the message or is unreachable
    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt>;

    /// Send a voice note to `to`
    ///
    /// # Errors
    ///
    /// Returns error if the upload or the send fails
    async fn send_audio(&self, to: &str, audio: &SynthesizedAudio) -> Result<SendReceipt>;

    /// Download media referenced by an inbound event
    ///
    /// # Errors
    ///
    /// Returns error if the media cannot be resolved or fetched
    async fn download_media(&self, media_id: &str) -> Result<MediaDownload>;
}
