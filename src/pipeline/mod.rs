//! Conversation orchestrator
//!
//! Runs one inbound event through the pipeline: audit log, user and
//! conversation resolution, idempotent insert, schedule gate, bot-mode
//! check, commands, and finally the response engine (with the speech
//! bridge for audio). Every event ends in exactly one [`Outcome`]; errors
//! are recorded in the webhook log and never returned to the caller.

pub mod inbound;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

pub use inbound::{ContentType, InboundEvent, InboundPayload, MediaRef, NormalizedContent, StatusEvent};

use crate::cache::Clock;
use crate::channels::{ChannelSender, SendReceipt};
use crate::config::PipelineSettings;
use crate::db::{
    BotMode, CommandRepo, Conversation, ConversationPatch, ConversationRepo, DbPool,
    DeliveryStatus, Message, MessageKind, MessageRepo, NewMessage, SenderClass, SystemConfigRepo,
    User, UserRepo, WebhookLogRepo, WebhookStatus,
};
use crate::engine::{ResponseEngine, UserProfile};
use crate::schedule::GateStatus;
use crate::speech::SpeechBridge;
use crate::{Error, Result};

/// Terminal result of processing one inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The channel message ID was already stored
    Duplicate,
    OutOfHours,
    ManualMode,
    Blocked,
    Command,
    AiResponse,
    AudioAiResponse,
    /// Audio could not be transcribed; the user was asked to type
    AudioFallback,
    MediaConfirmation,
    AutoResponseDisabled,
    Failed,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::OutOfHours => "out_of_hours",
            Self::ManualMode => "manual_mode",
            Self::Blocked => "blocked",
            Self::Command => "command",
            Self::AiResponse => "ai_response",
            Self::AudioAiResponse => "audio_ai_response",
            Self::AudioFallback => "audio_fallback",
            Self::MediaConfirmation => "media_confirmation",
            Self::AutoResponseDisabled => "auto_response_disabled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The inbound-to-outbound pipeline
pub struct Orchestrator {
    users: UserRepo,
    conversations: ConversationRepo,
    messages: MessageRepo,
    webhook_logs: WebhookLogRepo,
    commands: CommandRepo,
    system_config: SystemConfigRepo,
    engine: Arc<ResponseEngine>,
    speech: Option<Arc<SpeechBridge>>,
    channel: Arc<dyn ChannelSender>,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
}

/// State shared by the steps after the inbound message is stored
struct Turn<'a> {
    user: &'a User,
    conversation: &'a Conversation,
    inbound: &'a Message,
    settings: &'a PipelineSettings,
    gate: &'a GateStatus,
}

impl Orchestrator {
    /// Create an orchestrator over a database pool
    #[must_use]
    pub fn new(
        pool: DbPool,
        engine: Arc<ResponseEngine>,
        channel: Arc<dyn ChannelSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users: UserRepo::new(pool.clone()),
            conversations: ConversationRepo::new(pool.clone()),
            messages: MessageRepo::new(pool.clone()),
            webhook_logs: WebhookLogRepo::new(pool.clone()),
            commands: CommandRepo::new(pool.clone()),
            system_config: SystemConfigRepo::new(pool),
            engine,
            speech: None,
            channel,
            clock,
            send_timeout: Duration::from_secs(30),
        }
    }

    /// Enable audio handling
    #[must_use]
    pub fn with_speech(mut self, speech: Arc<SpeechBridge>) -> Self {
        self.speech = Some(speech);
        self
    }

    /// Deadline for channel sends and media downloads
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Process one inbound event to its terminal outcome
    pub async fn process(&self, event: &InboundEvent) -> Outcome {
        let payload = serde_json::to_string(event).unwrap_or_default();
        let log_id = match self.webhook_logs.create("message", &payload, self.clock.now()) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "failed to record webhook log, continuing");
                None
            }
        };

        let (outcome, status, error) = match self.run(event).await {
            Ok(outcome) => (outcome, WebhookStatus::Processed, None),
            Err(e) => {
                tracing::error!(
                    channel_message_id = %event.channel_message_id,
                    error = %e,
                    "pipeline failed"
                );
                (Outcome::Failed, WebhookStatus::Failed, Some(e.to_string()))
            }
        };

        self.finalize_log(log_id.as_deref(), status, error.as_deref());

        tracing::info!(
            channel_message_id = %event.channel_message_id,
            content_type = %event.content_type(),
            outcome = outcome.as_str(),
            "inbound event processed"
        );
        outcome
    }

    async fn run(&self, event: &InboundEvent) -> Result<Outcome> {
        let settings = PipelineSettings::load(&self.system_config)?;
        let now = self.clock.now();

        let user = self.resolve_user(event)?;
        let conversation = self.conversations.find_or_create_active(&user.id, now)?;
        let normalized = event.normalize();

        let new_message = NewMessage::inbound(
            &conversation.id,
            &user.id,
            normalized.content.clone(),
            normalized.content_type.as_str(),
            Some(event.channel_message_id.clone()),
        )
        .with_media(
            normalized.media.as_ref().map(|m| m.id.clone()),
            normalized.media.as_ref().and_then(|m| m.mime.clone()),
        );

        let Some(inbound) = self.messages.create_if_absent(&new_message, now)? else {
            tracing::debug!(channel_message_id = %event.channel_message_id, "duplicate delivery");
            return Ok(Outcome::Duplicate);
        };

        self.users.increment_message_count(&user.id)?;
        self.conversations
            .update(&conversation.id, &ConversationPatch::unread(true), now)?;

        if user.blocked {
            return Ok(Outcome::Blocked);
        }

        let gate = settings.schedule_gate().evaluate(now);
        if let GateStatus::Closed { message } = &gate {
            self.notify_closed(&user, &conversation, message, &settings).await?;
            return Ok(Outcome::OutOfHours);
        }

        if conversation.bot_mode == BotMode::Manual {
            return Ok(Outcome::ManualMode);
        }

        let turn = Turn {
            user: &user,
            conversation: &conversation,
            inbound: &inbound,
            settings: &settings,
            gate: &gate,
        };

        if let Some(response) = self.match_command(&normalized.content, &settings)? {
            self.deliver_text(&turn, &response, MessageKind::CommandReply, |m| m)
                .await?;
            return Ok(Outcome::Command);
        }

        match normalized.content_type {
            ContentType::Text | ContentType::Audio
                if !(settings.ai_enabled && settings.auto_respond) =>
            {
                Ok(Outcome::AutoResponseDisabled)
            }
            ContentType::Text => {
                self.answer(&turn, &normalized.content, false).await?;
                Ok(Outcome::AiResponse)
            }
            ContentType::Audio => self.answer_audio(&turn, normalized.media.as_ref()).await,
            _ => {
                self.deliver_text(&turn, &settings.media_ack_message, MessageKind::MediaAck, |m| m)
                    .await?;
                Ok(Outcome::MediaConfirmation)
            }
        }
    }

    /// Find or create the user for the sender address
    fn resolve_user(&self, event: &InboundEvent) -> Result<User> {
        let now = self.clock.now();
        let display_name = event
            .sender_display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());

        if let Some(mut user) = self.users.find_by_address(&event.channel_address)? {
            self.users.touch(&user.id, display_name, now)?;
            if user.display_name.is_none() {
                user.display_name = display_name.map(String::from);
            }
            user.last_contact_at = Some(now);
            return Ok(user);
        }

        match self.users.create(&event.channel_address, display_name, now) {
            Ok(user) => {
                tracing::info!(user_id = %user.id, "new user");
                Ok(user)
            }
            // A concurrent delivery created the same address first
            Err(e) => self
                .users
                .find_by_address(&event.channel_address)?
                .ok_or(e),
        }
    }

    /// Send the closed notice unless one went out within the cool-down
    async fn notify_closed(
        &self,
        user: &User,
        conversation: &Conversation,
        message: &str,
        settings: &PipelineSettings,
    ) -> Result<()> {
        let now = self.clock.now();
        let cooldown = chrono::Duration::try_minutes(settings.closed_notice_cooldown_minutes)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "closed notice cool-down of {} minutes is out of range",
                    settings.closed_notice_cooldown_minutes
                ))
            })?;

        if let Some(last) = self
            .messages
            .find_last_outbound_of_kind(&conversation.id, MessageKind::OutOfHoursNotice)?
        {
            if now - last.created_at < cooldown {
                tracing::debug!(conversation_id = %conversation.id, "closed notice suppressed");
                return Ok(());
            }
        }

        let receipt = self.send_text(&user.phone, message).await;
        self.persist_outbound(
            NewMessage::outbound(&conversation.id, &user.id, message, MessageKind::OutOfHoursNotice),
            receipt,
        )?;
        Ok(())
    }

    /// Look up a command when the content starts with the prefix
    fn match_command(&self, content: &str, settings: &PipelineSettings) -> Result<Option<String>> {
        let prefix = settings.command_prefix.as_str();
        if prefix.is_empty() || !content.starts_with(prefix) {
            return Ok(None);
        }

        let Some(trigger) = content.split_whitespace().next() else {
            return Ok(None);
        };

        let command = self.commands.find_by_trigger(trigger)?;
        if command.is_none() {
            tracing::debug!(trigger = %trigger, "no command for trigger, treating as text");
        }
        Ok(command.map(|c| c.response))
    }

    /// Generate and deliver a reply to `text`
    async fn answer(&self, turn: &Turn<'_>, text: &str, voice: bool) -> Result<()> {
        let settings = turn.settings;
        let history = self.messages.recent(
            &turn.conversation.id,
            settings.history_window,
            Some(&turn.inbound.id),
        )?;

        let reply = self
            .engine
            .generate(text, &history, &UserProfile::from(turn.user), settings)
            .await;

        let mut body = reply.reply.clone();
        if let Some(advisory) = turn.gate.advisory() {
            body.push_str("\n\n");
            body.push_str(advisory);
        }

        let kind = if reply.generated {
            MessageKind::Standard
        } else {
            MessageKind::Fallback
        };
        let annotate = |mut m: NewMessage| {
            m.intent = reply.intent.map(|i| i.as_str().to_string());
            m.entities = serde_json::json!(reply.entities);
            m.ai_processed = reply.generated;
            m
        };

        if voice && reply.generated {
            self.deliver_voice(turn, &body, kind, annotate).await?;
        } else {
            self.deliver_text(turn, &body, kind, annotate).await?;
        }

        if let Some(sentiment) = reply.sentiment {
            self.conversations.update(
                &turn.conversation.id,
                &ConversationPatch::sentiment(sentiment.as_str()),
                self.clock.now(),
            )?;
        }
        Ok(())
    }

    /// Transcribe an audio message and answer its transcript
    async fn answer_audio(&self, turn: &Turn<'_>, media: Option<&MediaRef>) -> Result<Outcome> {
        let transcript = match self.transcribe(media).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(message_id = %turn.inbound.id, error = %e, "audio transcription failed");
                self.deliver_text(
                    turn,
                    &turn.settings.transcription_failed_message,
                    MessageKind::Fallback,
                    |m| m,
                )
                .await?;
                return Ok(Outcome::AudioFallback);
            }
        };

        self.messages
            .update_content(&turn.inbound.id, &format!("[audio] {transcript}"))?;
        self.answer(turn, &transcript, turn.settings.voice_replies).await?;
        Ok(Outcome::AudioAiResponse)
    }

    async fn transcribe(&self, media: Option<&MediaRef>) -> Result<String> {
        let speech = self
            .speech
            .as_ref()
            .ok_or_else(|| Error::Stt("speech bridge not configured".to_string()))?;
        let media = media.ok_or_else(|| Error::InvalidInput("audio without media id".to_string()))?;

        let download = tokio::time::timeout(self.send_timeout, self.channel.download_media(&media.id))
            .await
            .map_err(|_| Error::Timeout("media download".to_string()))??;
        let mime = media.mime.as_deref().unwrap_or(&download.mime);

        let transcription = speech.transcribe(&download.bytes, mime).await?;
        Ok(transcription.text)
    }

    /// Send text over the channel and persist it as outbound
    async fn deliver_text(
        &self,
        turn: &Turn<'_>,
        body: &str,
        kind: MessageKind,
        annotate: impl FnOnce(NewMessage) -> NewMessage,
    ) -> Result<Message> {
        let receipt = self.send_text(&turn.user.phone, body).await;
        let message = annotate(NewMessage::outbound(
            &turn.conversation.id,
            &turn.user.id,
            body,
            kind,
        ));
        self.persist_outbound(message, receipt)
    }

    /// Synthesize and send a voice reply, falling back to text
    async fn deliver_voice(
        &self,
        turn: &Turn<'_>,
        body: &str,
        kind: MessageKind,
        annotate: impl FnOnce(NewMessage) -> NewMessage,
    ) -> Result<Message> {
        let Some(speech) = &self.speech else {
            return self.deliver_text(turn, body, kind, annotate).await;
        };

        let mut audio = match speech.synthesize(body, &turn.settings.voice_id).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(error = %e, "voice synthesis failed, replying with text");
                return self.deliver_text(turn, body, kind, annotate).await;
            }
        };

        let sent = tokio::time::timeout(
            self.send_timeout,
            self.channel.send_audio(&turn.user.phone, &audio),
        )
        .await
        .map_err(|_| Error::Timeout(format!("{} audio send", self.channel.name())))
        .and_then(|r| r);
        let mime = audio.mime.clone();
        audio.release();

        match sent {
            Ok(receipt) => {
                let mut message = annotate(NewMessage::outbound(
                    &turn.conversation.id,
                    &turn.user.id,
                    body,
                    kind,
                ));
                message.content_type = ContentType::Audio.as_str().to_string();
                message.media_mime = Some(mime);
                self.persist_outbound(message, Ok(receipt))
            }
            Err(e) => {
                tracing::warn!(error = %e, "voice send failed, replying with text");
                self.deliver_text(turn, body, kind, annotate).await
            }
        }
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt> {
        tokio::time::timeout(self.send_timeout, self.channel.send_text(to, body))
            .await
            .map_err(|_| Error::Timeout(format!("{} send", self.channel.name())))?
    }

    /// Store an outbound message with the result of sending it
    ///
    /// A failed send is still stored, marked `failed`, so the history
    /// shows what the user should have received.
    fn persist_outbound(&self, message: NewMessage, receipt: Result<SendReceipt>) -> Result<Message> {
        let message = match receipt {
            Ok(receipt) => message.with_receipt(receipt.message_id, DeliveryStatus::Sent),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %message.conversation_id,
                    channel = self.channel.name(),
                    error = %e,
                    "channel send failed"
                );
                message.with_receipt(None, DeliveryStatus::Failed)
            }
        };
        self.messages.create(&message, self.clock.now())
    }

    /// Record a raw webhook body before it is parsed
    ///
    /// Returns the log id, or `None` when the log could not be written.
    pub fn record_delivery(&self, raw_body: &str) -> Option<String> {
        self.webhook_logs
            .create("delivery", raw_body, self.clock.now())
            .map_err(|e| tracing::warn!(error = %e, "failed to record webhook delivery"))
            .ok()
    }

    /// Resolve a delivery log to `processed`, or `failed` with the reason
    pub fn finish_delivery(&self, log_id: Option<&str>, failure: Option<&str>) {
        let status = if failure.is_some() {
            WebhookStatus::Failed
        } else {
            WebhookStatus::Processed
        };
        self.finalize_log(log_id, status, failure);
    }

    fn finalize_log(&self, log_id: Option<&str>, status: WebhookStatus, error: Option<&str>) {
        let Some(id) = log_id else {
            return;
        };
        if let Err(e) = self
            .webhook_logs
            .update_status(id, status, error, self.clock.now())
        {
            tracing::warn!(log_id = %id, error = %e, "failed to finalize webhook log");
        }
    }

    /// Apply a delivery receipt to the matching outbound message
    ///
    /// Returns whether a stored message matched. Failures are logged.
    pub fn apply_status(&self, status: &StatusEvent) -> bool {
        let payload = serde_json::to_string(status).unwrap_or_default();
        let log_id = self
            .webhook_logs
            .create("message_status", &payload, self.clock.now())
            .map_err(|e| tracing::warn!(error = %e, "failed to record status webhook"))
            .ok();

        let result = self
            .messages
            .update_status_by_channel_id(&status.channel_message_id, status.status);

        let (matched, log_status, error) = match result {
            Ok(matched) => (matched, WebhookStatus::Processed, None),
            Err(e) => {
                tracing::error!(channel_message_id = %status.channel_message_id, error = %e, "status update failed");
                (false, WebhookStatus::Failed, Some(e.to_string()))
            }
        };

        self.finalize_log(log_id.as_deref(), log_status, error.as_deref());

        tracing::debug!(
            channel_message_id = %status.channel_message_id,
            status = %status.status,
            matched,
            "delivery status applied"
        );
        matched
    }

    /// Send an operator's reply into a conversation
    ///
    /// Persists the message with sender class `human` and clears the
    /// unread flag.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown conversation, or the channel error
    /// if the send fails (nothing is stored in that case)
    pub async fn send_operator_reply(&self, conversation_id: &str, body: &str) -> Result<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(Error::InvalidInput("reply body is empty".to_string()));
        }

        let conversation = self
            .conversations
            .find(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))?;
        let user = self
            .users
            .find(&conversation.user_id)?
            .ok_or_else(|| Error::NotFound(format!("user {}", conversation.user_id)))?;

        let receipt = self.send_text(&user.phone, body).await?;

        let mut message = NewMessage::outbound(&conversation.id, &user.id, body, MessageKind::Standard)
            .with_receipt(receipt.message_id, DeliveryStatus::Sent);
        message.sender = SenderClass::Human;
        let message = self.messages.create(&message, self.clock.now())?;

        self.conversations
            .update(&conversation.id, &ConversationPatch::unread(false), self.clock.now())?;

        tracing::info!(conversation_id = %conversation.id, "operator reply sent");
        Ok(message)
    }
}
