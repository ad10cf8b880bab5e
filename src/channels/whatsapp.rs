//! `WhatsApp` channel adapter
//!
//! Uses the `WhatsApp` Business (Graph) API for sending and media, and
//! converts webhook payloads into normalized inbound and status events.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;

use super::{ChannelSender, MediaDownload, SendReceipt};
use crate::config::WhatsAppConfig;
use crate::db::DeliveryStatus;
use crate::pipeline::{InboundEvent, InboundPayload, MediaRef, StatusEvent};
use crate::speech::SynthesizedAudio;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// `WhatsApp` channel adapter
pub struct WhatsAppChannel {
    /// `WhatsApp` Business API access token
    access_token: SecretString,
    /// Phone number ID for sending messages
    phone_number_id: String,
    api_base: String,
    client: Client,
}

impl WhatsAppChannel {
    /// Create a new `WhatsApp` channel adapter
    ///
    /// # Arguments
    ///
    /// * `access_token` - `WhatsApp` Business API access token
    /// * `phone_number_id` - Phone number ID registered with `WhatsApp` Business
    /// * `api_base` - Graph API base, e.g. `https://graph.facebook.com/v18.0`
    /// * `timeout` - Deadline for every API call
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        access_token: SecretString,
        phone_number_id: String,
        api_base: &str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            access_token,
            phone_number_id,
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Build from resolved configuration
    ///
    /// # Errors
    ///
    /// Returns error if the access token or phone number ID is missing
    pub fn from_config(config: &WhatsAppConfig, timeout: std::time::Duration) -> Result<Self> {
        let token = config
            .access_token
            .clone()
            .ok_or_else(|| Error::Config("WhatsApp access token not configured".to_string()))?;
        let phone_id = config
            .phone_number_id
            .clone()
            .ok_or_else(|| Error::Config("WhatsApp phone number ID not configured".to_string()))?;
        Self::new(token, phone_id, &config.api_base, timeout)
    }

    async fn post_message(&self, body: &serde_json::Value) -> Result<SendReceipt> {
        let url = format!("{}/{}/messages", self.api_base, self.phone_number_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!("WhatsApp API error: {status} - {body}")));
        }

        let sent: SendResponse = response.json().await.unwrap_or_default();
        Ok(SendReceipt {
            message_id: sent.messages.into_iter().next().map(|m| m.id),
        })
    }

    /// Upload media and return its `WhatsApp` media ID
    async fn upload_media(&self, bytes: Vec<u8>, mime: &str, filename: String) -> Result<String> {
        let url = format!("{}/{}/media", self.api_base, self.phone_number_id);

        let part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str(mime)
            .map_err(|e| Error::Channel(format!("invalid media type {mime}: {e}")))?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", mime.to_string())
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.access_token.expose_secret())
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!("WhatsApp media upload error: {status} - {body}")));
        }

        let uploaded: UploadResponse = response.json().await?;
        Ok(uploaded.id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    url: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[async_trait]
impl ChannelSender for WhatsAppChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt> {
        // Link previews mangle code blocks
        let has_code = body.contains("```");

        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": {
                "body": body,
                "preview_url": !has_code
            }
        });

        let receipt = self.post_message(&payload).await?;
        tracing::debug!(to, message_id = ?receipt.message_id, "WhatsApp text sent");
        Ok(receipt)
    }

    async fn send_audio(&self, to: &str, audio: &SynthesizedAudio) -> Result<SendReceipt> {
        let bytes = tokio::fs::read(&audio.path).await?;
        let filename = audio
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("voice")
            .to_string();

        let media_id = self.upload_media(bytes, &audio.mime, filename).await?;

        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "audio",
            "audio": { "id": media_id }
        });

        let receipt = self.post_message(&payload).await?;
        tracing::debug!(to, message_id = ?receipt.message_id, "WhatsApp voice note sent");
        Ok(receipt)
    }

    async fn download_media(&self, media_id: &str) -> Result<MediaDownload> {
        let url = format!("{}/{media_id}", self.api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Channel(format!("WhatsApp media lookup failed: {status}")));
        }
        let info: MediaInfo = response.json().await?;

        let response = self
            .client
            .get(&info.url)
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Channel(format!("WhatsApp media download failed: {status}")));
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().await?.to_vec();

        Ok(MediaDownload {
            bytes,
            mime: info
                .mime_type
                .or(header_mime)
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        })
    }
}

/// Check an `X-Hub-Signature-256` header against the raw request body
#[must_use]
pub fn verify_signature(app_secret: &SecretString, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.expose_secret().as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `WhatsApp` webhook payload
#[derive(Debug, Default, Deserialize)]
pub struct WhatsAppWebhook {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WhatsAppWebhookEntry>,
}

/// `WhatsApp` webhook entry
#[derive(Debug, Default, Deserialize)]
pub struct WhatsAppWebhookEntry {
    #[serde(default)]
    pub changes: Vec<WhatsAppWebhookChange>,
}

/// `WhatsApp` webhook change
#[derive(Debug, Default, Deserialize)]
pub struct WhatsAppWebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: WhatsAppWebhookValue,
}

/// `WhatsApp` webhook value
#[derive(Debug, Default, Deserialize)]
pub struct WhatsAppWebhookValue {
    #[serde(default)]
    pub contacts: Vec<WhatsAppContact>,
    #[serde(default)]
    pub messages: Vec<WhatsAppMessage>,
    #[serde(default)]
    pub statuses: Vec<WhatsAppStatus>,
}

/// Sender profile attached to inbound messages
#[derive(Debug, Deserialize)]
pub struct WhatsAppContact {
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<WhatsAppProfile>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppProfile {
    #[serde(default)]
    pub name: Option<String>,
}

/// `WhatsApp` message
#[derive(Debug, Deserialize)]
pub struct WhatsAppMessage {
    pub from: String,
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<WhatsAppTextContent>,
    #[serde(default)]
    pub image: Option<WhatsAppMedia>,
    #[serde(default)]
    pub document: Option<WhatsAppDocument>,
    #[serde(default)]
    pub audio: Option<WhatsAppMedia>,
    #[serde(default)]
    pub video: Option<WhatsAppMedia>,
    #[serde(default)]
    pub location: Option<WhatsAppLocation>,
    #[serde(default)]
    pub button: Option<WhatsAppButton>,
    #[serde(default)]
    pub interactive: Option<WhatsAppInteractive>,
}

/// `WhatsApp` media (image, audio, video)
#[derive(Debug, Deserialize)]
pub struct WhatsAppMedia {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// `WhatsApp` document
#[derive(Debug, Deserialize)]
pub struct WhatsAppDocument {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppTextContent {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Quick-reply button press
#[derive(Debug, Deserialize)]
pub struct WhatsAppButton {
    #[serde(default)]
    pub text: String,
}

/// Interactive list or button reply
#[derive(Debug, Deserialize)]
pub struct WhatsAppInteractive {
    #[serde(default)]
    pub button_reply: Option<WhatsAppReply>,
    #[serde(default)]
    pub list_reply: Option<WhatsAppReply>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppReply {
    #[serde(default)]
    pub title: String,
}

/// Delivery status update for a message we sent
#[derive(Debug, Deserialize)]
pub struct WhatsAppStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub errors: Vec<WhatsAppStatusError>,
}

#[derive(Debug, Deserialize)]
pub struct WhatsAppStatusError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
}

fn media_ref(media: &WhatsAppMedia) -> MediaRef {
    MediaRef {
        id: media.id.clone(),
        mime: media.mime_type.clone(),
        caption: media.caption.clone(),
        filename: None,
    }
}

impl WhatsAppMessage {
    fn payload(&self) -> InboundPayload {
        let unsupported = || InboundPayload::Unsupported {
            kind: self.message_type.clone(),
        };

        match self.message_type.as_str() {
            "text" => self.text.as_ref().map_or_else(unsupported, |t| InboundPayload::Text {
                body: t.body.clone(),
            }),
            "audio" | "voice" => self
                .audio
                .as_ref()
                .map_or_else(unsupported, |m| InboundPayload::Audio(media_ref(m))),
            "image" => self
                .image
                .as_ref()
                .map_or_else(unsupported, |m| InboundPayload::Image(media_ref(m))),
            "video" => self
                .video
                .as_ref()
                .map_or_else(unsupported, |m| InboundPayload::Video(media_ref(m))),
            "document" => self.document.as_ref().map_or_else(unsupported, |d| {
                InboundPayload::Document(MediaRef {
                    id: d.id.clone(),
                    mime: d.mime_type.clone(),
                    caption: d.caption.clone(),
                    filename: d.filename.clone(),
                })
            }),
            "location" => self.location.as_ref().map_or_else(unsupported, |l| InboundPayload::Location {
                latitude: l.latitude,
                longitude: l.longitude,
                name: l.name.clone(),
                address: l.address.clone(),
            }),
            "button" => self.button.as_ref().map_or_else(unsupported, |b| InboundPayload::Text {
                body: b.text.clone(),
            }),
            "interactive" => self
                .interactive
                .as_ref()
                .and_then(|i| i.button_reply.as_ref().or(i.list_reply.as_ref()))
                .map_or_else(unsupported, |r| InboundPayload::Text {
                    body: r.title.clone(),
                }),
            _ => unsupported(),
        }
    }
}

impl WhatsAppWebhook {
    /// Inbound messages carried by this payload, in delivery order
    #[must_use]
    pub fn inbound_events(&self) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        for change in self.entry.iter().flat_map(|e| &e.changes) {
            let value = &change.value;
            for msg in &value.messages {
                let display_name = value
                    .contacts
                    .iter()
                    .find(|c| c.wa_id == msg.from)
                    .and_then(|c| c.profile.as_ref())
                    .and_then(|p| p.name.clone());

                events.push(InboundEvent {
                    channel_address: msg.from.clone(),
                    channel_message_id: msg.id.clone(),
                    sender_display_name: display_name,
                    payload: msg.payload(),
                });
            }
        }
        events
    }

    /// Delivery receipts carried by this payload
    ///
    /// Statuses outside sent/delivered/read/failed are skipped.
    #[must_use]
    pub fn status_events(&self) -> Vec<StatusEvent> {
        self.entry
            .iter()
            .flat_map(|e| &e.changes)
            .flat_map(|c| &c.value.statuses)
            .filter_map(|s| {
                let Some(status) = DeliveryStatus::parse(&s.status) else {
                    tracing::debug!(status = %s.status, "ignoring WhatsApp status");
                    return None;
                };
                let error = s.errors.first().map(|e| {
                    format!(
                        "{}{}",
                        e.code.map(|c| format!("{c}: ")).unwrap_or_default(),
                        e.title.clone().unwrap_or_default()
                    )
                });
                Some(StatusEvent {
                    channel_message_id: s.id.clone(),
                    recipient: s.recipient_id.clone(),
                    status,
                    error,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::pipeline::ContentType;

    fn channel(base: &str) -> WhatsAppChannel {
        WhatsAppChannel::new(
            SecretString::from("wa-token".to_string()),
            "1234".to_string(),
            base,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_text_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/1234/messages"))
            .and(header("authorization", "Bearer wa-token"))
            .and(body_partial_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "to": "5215550001",
                "type": "text",
                "text": {"body": "Hola"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "messages": [{"id": "wamid.OUT1"}]
            })))
            .mount(&server)
            .await;

        let receipt = channel(&server.uri()).send_text("5215550001", "Hola").await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("wamid.OUT1"));
    }

    #[tokio::test]
    async fn test_send_text_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let err = channel(&server.uri()).send_text("1", "x").await.unwrap_err();
        assert!(matches!(err, Error::Channel(m) if m.contains("401")));
    }

    #[tokio::test]
    async fn test_download_media_resolves_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": format!("{}/files/media-9", server.uri()),
                "mime_type": "audio/ogg"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/media-9"))
            .and(header("authorization", "Bearer wa-token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"OggS".to_vec()))
            .mount(&server)
            .await;

        let media = channel(&server.uri()).download_media("media-9").await.unwrap();
        assert_eq!(media.bytes, b"OggS");
        assert_eq!(media.mime, "audio/ogg");
    }

    #[test]
    fn test_signature_verification() {
        let secret = SecretString::from("app-secret".to_string());
        let body = br#"{"entry":[]}"#;

        let mut mac = HmacSha256::new_from_slice(b"app-secret").unwrap();
        mac.update(body);
        let good = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(&secret, body, Some(&good)));
        assert!(!verify_signature(&secret, b"tampered", Some(&good)));
        assert!(!verify_signature(&secret, body, Some("sha256=zz")));
        assert!(!verify_signature(&secret, body, None));
    }

    #[test]
    fn test_webhook_to_events() {
        let payload: WhatsAppWebhook = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "changes": [{
                    "field": "messages",
                    "value": {
                        "contacts": [{"wa_id": "5215550001", "profile": {"name": "Ana"}}],
                        "messages": [
                            {"from": "5215550001", "id": "wamid.A", "timestamp": "1", "type": "text", "text": {"body": "Hola"}},
                            {"from": "5215550001", "id": "wamid.B", "type": "audio", "audio": {"id": "m1", "mime_type": "audio/ogg; codecs=opus"}},
                            {"from": "5215550001", "id": "wamid.C", "type": "sticker", "sticker": {"id": "s1"}},
                            {"from": "5215550001", "id": "wamid.D", "type": "interactive", "interactive": {"type": "button_reply", "button_reply": {"id": "b", "title": "Sí"}}}
                        ],
                        "statuses": [
                            {"id": "wamid.OUT1", "status": "read", "recipient_id": "5215550001"},
                            {"id": "wamid.OUT2", "status": "deleted", "recipient_id": "5215550001"},
                            {"id": "wamid.OUT3", "status": "failed", "recipient_id": "5215550001", "errors": [{"code": 131047, "title": "Re-engagement message"}]}
                        ]
                    }
                }]
            }]
        }))
        .unwrap();

        let events = payload.inbound_events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].sender_display_name.as_deref(), Some("Ana"));
        assert_eq!(events[0].content_type(), ContentType::Text);
        assert_eq!(events[1].content_type(), ContentType::Audio);
        assert_eq!(events[2].content_type(), ContentType::Unsupported);
        assert_eq!(
            events[3].payload,
            InboundPayload::Text {
                body: "Sí".to_string()
            }
        );

        let statuses = payload.status_events();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status, DeliveryStatus::Read);
        assert_eq!(statuses[1].status, DeliveryStatus::Failed);
        assert_eq!(statuses[1].error.as_deref(), Some("131047: Re-engagement message"));
    }

    #[test]
    fn test_lenient_payload() {
        let payload: WhatsAppWebhook = serde_json::from_str(r#"{"entry":[{"changes":[{"value":{}}]}]}"#).unwrap();
        assert!(payload.inbound_events().is_empty());
        assert!(payload.status_events().is_empty());
    }
}
