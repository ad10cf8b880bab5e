//! Runtime pipeline settings
//!
//! Operators edit these as key/value rows in `system_config`. They are read
//! into one typed struct at the start of every inbound event; missing keys
//! take the defaults below and unparseable values are logged and ignored.

use std::collections::HashMap;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{FixedOffset, Offset, Utc};

use crate::db::SystemConfigRepo;
use crate::schedule::{ScheduleGate, WeeklySchedule};
use crate::Result;

/// One year; longer cool-downs are treated as configuration mistakes
const MAX_COOLDOWN_MINUTES: i64 = 525_600;

/// A fixed offset must stay strictly inside one day
const MAX_UTC_OFFSET_MINUTES: i32 = 1439;

/// Typed view of the `system_config` table
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Master switch for the generative backend
    pub ai_enabled: bool,
    /// Model name; empty means the process default
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Whether text and audio get automated replies at all
    pub auto_respond: bool,
    /// Run the classification pass for sentiment
    pub sentiment_analysis: bool,
    /// Run the classification pass for intent
    pub intent_detection: bool,
    /// Answer audio with synthesized audio
    pub voice_replies: bool,
    /// Voice for synthesized replies; empty means the process default
    pub voice_id: String,
    /// How many earlier messages go into the prompt
    pub history_window: usize,
    pub command_prefix: String,
    pub schedule: WeeklySchedule,
    pub closing_warning_minutes: u16,
    pub utc_offset_minutes: i32,
    /// Minimum gap between two closed notices to one conversation
    pub closed_notice_cooldown_minutes: i64,
    pub closed_message: String,
    /// `{minutes}` is replaced with the minutes left
    pub closing_soon_message: String,
    pub media_ack_message: String,
    pub transcription_failed_message: String,
    pub fallback_reply: String,
    /// Appended to every automated reply
    pub signature: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            model: String::new(),
            temperature: 0.7,
            max_tokens: 500,
            auto_respond: true,
            sentiment_analysis: true,
            intent_detection: true,
            voice_replies: false,
            voice_id: String::new(),
            history_window: 10,
            command_prefix: "/".to_string(),
            schedule: WeeklySchedule::business_default(),
            closing_warning_minutes: 30,
            utc_offset_minutes: 0,
            closed_notice_cooldown_minutes: 240,
            closed_message: "Estamos cerrados en este momento. Te responderemos en cuanto abramos."
                .to_string(),
            closing_soon_message: "Te recordamos que cerraremos en {minutes} minutos.".to_string(),
            media_ack_message: "Recibimos tu archivo. Un asesor lo revisará en breve.".to_string(),
            transcription_failed_message:
                "No pude entender tu mensaje de voz. ¿Podrías escribirlo, por favor?".to_string(),
            fallback_reply: "En este momento no puedo responder. Por favor intenta de nuevo más \
                             tarde o escribe /ayuda para ver las opciones disponibles."
                .to_string(),
            signature: "\n\n_Asistente virtual_".to_string(),
        }
    }
}

impl PipelineSettings {
    /// Load settings from the database
    ///
    /// # Errors
    ///
    /// Returns error if the settings table cannot be read
    pub fn load(repo: &SystemConfigRepo) -> Result<Self> {
        Ok(Self::from_map(&repo.get_all()?))
    }

    /// Build settings from raw key/value pairs
    #[must_use]
    pub fn from_map(values: &HashMap<String, String>) -> Self {
        let mut s = Self::default();

        apply_bool(values, "ai_enabled", &mut s.ai_enabled);
        apply_text(values, "model", &mut s.model);
        apply_parsed(values, "temperature", &mut s.temperature);
        apply_parsed(values, "max_tokens", &mut s.max_tokens);
        apply_bool(values, "auto_respond", &mut s.auto_respond);
        apply_bool(values, "sentiment_analysis", &mut s.sentiment_analysis);
        apply_bool(values, "intent_detection", &mut s.intent_detection);
        apply_bool(values, "voice_replies", &mut s.voice_replies);
        apply_text(values, "voice_id", &mut s.voice_id);
        apply_parsed(values, "history_window", &mut s.history_window);
        apply_text(values, "command_prefix", &mut s.command_prefix);
        apply_parsed(values, "closing_warning_minutes", &mut s.closing_warning_minutes);
        apply_ranged(
            values,
            "utc_offset_minutes",
            &mut s.utc_offset_minutes,
            -MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES,
        );
        apply_ranged(
            values,
            "closed_notice_cooldown_minutes",
            &mut s.closed_notice_cooldown_minutes,
            0..=MAX_COOLDOWN_MINUTES,
        );
        apply_text(values, "closed_message", &mut s.closed_message);
        apply_text(values, "closing_soon_message", &mut s.closing_soon_message);
        apply_text(values, "media_ack_message", &mut s.media_ack_message);
        apply_text(
            values,
            "transcription_failed_message",
            &mut s.transcription_failed_message,
        );
        apply_text(values, "fallback_reply", &mut s.fallback_reply);
        apply_text(values, "signature", &mut s.signature);

        if let Some(raw) = values.get("schedule") {
            match serde_json::from_str(raw) {
                Ok(schedule) => s.schedule = schedule,
                Err(e) => tracing::warn!(error = %e, "invalid schedule setting, using default"),
            }
        }

        s.temperature = s.temperature.clamp(0.0, 2.0);
        s
    }

    /// Business-hours gate built from these settings
    #[must_use]
    pub fn schedule_gate(&self) -> ScheduleGate {
        let offset = self
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                tracing::warn!(
                    utc_offset_minutes = self.utc_offset_minutes,
                    "utc offset out of range, using UTC"
                );
                Utc.fix()
            });

        ScheduleGate {
            schedule: self.schedule.clone(),
            warning_minutes: self.closing_warning_minutes,
            offset,
            closed_message: self.closed_message.clone(),
            closing_soon_message: self.closing_soon_message.clone(),
        }
    }
}

fn apply_text(values: &HashMap<String, String>, key: &str, target: &mut String) {
    if let Some(raw) = values.get(key) {
        target.clone_from(raw);
    }
}

fn apply_parsed<T: FromStr>(values: &HashMap<String, String>, key: &str, target: &mut T) {
    let Some(raw) = values.get(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "unparseable setting, using default"),
    }
}

fn apply_ranged<T>(
    values: &HashMap<String, String>,
    key: &str,
    target: &mut T,
    range: RangeInclusive<T>,
) where
    T: FromStr + PartialOrd + Display,
{
    let Some(raw) = values.get(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if range.contains(&value) => *target = value,
        Ok(_) => tracing::warn!(
            key,
            value = %raw,
            min = %range.start(),
            max = %range.end(),
            "setting out of range, using default"
        ),
        Err(_) => tracing::warn!(key, value = %raw, "unparseable setting, using default"),
    }
}

fn apply_bool(values: &HashMap<String, String>, key: &str, target: &mut bool) {
    let Some(raw) = values.get(key) else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => *target = true,
        "false" | "0" | "no" | "off" => *target = false,
        _ => tracing::warn!(key, value = %raw, "unparseable setting, using default"),
    }
}
