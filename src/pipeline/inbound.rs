//! Normalized inbound events
//!
//! Channel adapters convert their webhook payloads into these types; the
//! orchestrator never sees provider-specific JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::DeliveryStatus;

/// Kind of content carried by an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Audio,
    Image,
    Video,
    Document,
    Location,
    Unsupported,
}

impl ContentType {
    /// Label stored on messages
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Location => "location",
            Self::Unsupported => "unsupported",
        }
    }

    /// Whether the content can be answered by the response engine
    #[must_use]
    pub const fn is_conversational(self) -> bool {
        matches!(self, Self::Text | Self::Audio)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to media hosted by the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    pub mime: Option<String>,
    pub caption: Option<String>,
    pub filename: Option<String>,
}

impl MediaRef {
    /// Media reference with only an ID and MIME type
    #[must_use]
    pub fn new(id: impl Into<String>, mime: Option<String>) -> Self {
        Self {
            id: id.into(),
            mime,
            caption: None,
            filename: None,
        }
    }
}

/// Content of an inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundPayload {
    Text {
        body: String,
    },
    Audio(MediaRef),
    Image(MediaRef),
    Video(MediaRef),
    Document(MediaRef),
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Unsupported {
        kind: String,
    },
}

/// One message delivered by the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Sender address (phone number)
    pub channel_address: String,
    /// Provider message ID, the idempotency key
    pub channel_message_id: String,
    pub sender_display_name: Option<String>,
    pub payload: InboundPayload,
}

impl InboundEvent {
    /// A plain text event
    #[must_use]
    pub fn text(address: &str, message_id: &str, body: &str) -> Self {
        Self {
            channel_address: address.to_string(),
            channel_message_id: message_id.to_string(),
            sender_display_name: None,
            payload: InboundPayload::Text {
                body: body.to_string(),
            },
        }
    }

    /// Attach the sender's profile name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.sender_display_name = Some(name.into());
        self
    }

    /// Content type of the payload
    #[must_use]
    pub const fn content_type(&self) -> ContentType {
        match &self.payload {
            InboundPayload::Text { .. } => ContentType::Text,
            InboundPayload::Audio(_) => ContentType::Audio,
            InboundPayload::Image(_) => ContentType::Image,
            InboundPayload::Video(_) => ContentType::Video,
            InboundPayload::Document(_) => ContentType::Document,
            InboundPayload::Location { .. } => ContentType::Location,
            InboundPayload::Unsupported { .. } => ContentType::Unsupported,
        }
    }

    /// Plain-text content and media pointer for persistence
    #[must_use]
    pub fn normalize(&self) -> NormalizedContent {
        let content_type = self.content_type();
        let (content, media) = match &self.payload {
            InboundPayload::Text { body } => (body.trim().to_string(), None),
            InboundPayload::Audio(media) => ("[audio]".to_string(), Some(media.clone())),
            InboundPayload::Image(media) => (with_caption("[imagen]", media), Some(media.clone())),
            InboundPayload::Video(media) => (with_caption("[video]", media), Some(media.clone())),
            InboundPayload::Document(media) => {
                let label = media
                    .filename
                    .as_deref()
                    .map_or_else(|| "[documento]".to_string(), |f| format!("[documento: {f}]"));
                (with_caption(&label, media), Some(media.clone()))
            }
            InboundPayload::Location {
                latitude,
                longitude,
                name,
                address,
            } => {
                let mut text = format!("[ubicación] {latitude}, {longitude}");
                let place: Vec<&str> = [name.as_deref(), address.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect();
                if !place.is_empty() {
                    text.push_str(&format!(" ({})", place.join(", ")));
                }
                (text, None)
            }
            InboundPayload::Unsupported { kind } => (format!("[tipo no soportado: {kind}]"), None),
        };

        NormalizedContent {
            content,
            content_type,
            media,
        }
    }
}

fn with_caption(label: &str, media: &MediaRef) -> String {
    match media.caption.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(caption) => format!("{label} {caption}"),
        None => label.to_string(),
    }
}

/// Inbound content reduced to what gets stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedContent {
    pub content: String,
    pub content_type: ContentType,
    pub media: Option<MediaRef>,
}

/// Delivery receipt for a message we sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub channel_message_id: String,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
}
