//! Orchestrator integration tests

use std::sync::Arc;

use chatdesk::db::{
    BotMode, CommandRepo, ConversationPatch, ConversationRepo, ConversationStatus, DeliveryStatus,
    Direction, MessageKind, MessageRepo, SenderClass, UserRepo, WebhookStatus, WebhookLogRepo,
};
use chatdesk::pipeline::StatusEvent;
use chatdesk::Outcome;
use chrono::{Duration, TimeZone, Utc};

mod common;
use common::{
    FakeGenerator, Harness, Sent, audio_event, closed_instant, image_event, setup_file_db,
    text_event,
};

const USER: &str = "5215550001111";

fn conversation_of(harness: &Harness, phone: &str) -> chatdesk::db::Conversation {
    let user = UserRepo::new(harness.pool.clone())
        .find_by_address(phone)
        .unwrap()
        .expect("user should exist");
    ConversationRepo::new(harness.pool.clone())
        .find_active(&user.id)
        .unwrap()
        .expect("active conversation should exist")
}

fn messages_of(harness: &Harness, conversation_id: &str) -> Vec<chatdesk::db::Message> {
    MessageRepo::new(harness.pool.clone())
        .recent(conversation_id, 100, None)
        .unwrap()
}

#[tokio::test]
async fn test_first_greeting_end_to_end() {
    let harness = Harness::new(FakeGenerator::replying("¡Hola! ¿En qué te ayudo?"));

    let event = text_event(USER, "wamid.in1", "Hola").with_display_name("Ana");
    let outcome = harness.orchestrator.process(&event).await;
    assert_eq!(outcome, Outcome::AiResponse);

    let user = UserRepo::new(harness.pool.clone())
        .find_by_address(USER)
        .unwrap()
        .unwrap();
    assert_eq!(user.display_name.as_deref(), Some("Ana"));
    assert_eq!(user.message_count, 1);

    let conversation = conversation_of(&harness, USER);
    assert_eq!(conversation.status, ConversationStatus::Active);
    assert_eq!(conversation.bot_mode, BotMode::Auto);
    assert_eq!(conversation.sentiment.as_deref(), Some("positive"));

    let messages = messages_of(&harness, &conversation.id);
    assert_eq!(messages.len(), 2);

    let inbound = &messages[0];
    assert_eq!(inbound.direction, Direction::Inbound);
    assert_eq!(inbound.content, "Hola");
    assert_eq!(inbound.channel_message_id.as_deref(), Some("wamid.in1"));

    let reply = &messages[1];
    assert_eq!(reply.direction, Direction::Outbound);
    assert_eq!(reply.sender, SenderClass::Bot);
    assert_eq!(reply.kind, MessageKind::Standard);
    assert_eq!(reply.intent.as_deref(), Some("saludo"));
    assert!(reply.ai_processed);
    assert!(reply.content.ends_with("_Asistente virtual_"));
    assert_eq!(reply.delivery_status, Some(DeliveryStatus::Sent));
    assert_eq!(reply.channel_message_id.as_deref(), Some("wamid.out1"));

    assert_eq!(
        harness.channel.sent(),
        vec![Sent::Text {
            to: USER.to_string(),
            body: reply.content.clone(),
        }]
    );

    let logs = WebhookLogRepo::new(harness.pool.clone());
    assert_eq!(logs.count_by_status(WebhookStatus::Processed).unwrap(), 1);
    assert_eq!(logs.count_by_status(WebhookStatus::Pending).unwrap(), 0);
}

#[tokio::test]
async fn test_replayed_delivery_is_processed_once() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    let event = text_event(USER, "wamid.replay", "¿Tienen envío?");

    assert_eq!(harness.orchestrator.process(&event).await, Outcome::AiResponse);
    assert_eq!(harness.orchestrator.process(&event).await, Outcome::Duplicate);
    assert_eq!(harness.orchestrator.process(&event).await, Outcome::Duplicate);

    let conversation = conversation_of(&harness, USER);
    assert_eq!(messages_of(&harness, &conversation.id).len(), 2);
    assert_eq!(harness.channel.sent().len(), 1);

    let user = UserRepo::new(harness.pool.clone())
        .find_by_address(USER)
        .unwrap()
        .unwrap();
    assert_eq!(user.message_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_store_one_message() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::with_pool(setup_file_db(dir.path()), FakeGenerator::replying("Claro"));
    let event = text_event(USER, "wamid.race", "Hola");

    let first = {
        let orchestrator = harness.orchestrator.clone();
        let event = event.clone();
        tokio::spawn(async move { orchestrator.process(&event).await })
    };
    let second = {
        let orchestrator = harness.orchestrator.clone();
        let event = event.clone();
        tokio::spawn(async move { orchestrator.process(&event).await })
    };

    let outcomes = [first.await.unwrap(), second.await.unwrap()];
    let duplicates = outcomes.iter().filter(|o| **o == Outcome::Duplicate).count();
    assert_eq!(duplicates, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&Outcome::AiResponse));

    let conversation = conversation_of(&harness, USER);
    let inbound = messages_of(&harness, &conversation.id)
        .into_iter()
        .filter(|m| m.direction == Direction::Inbound)
        .count();
    assert_eq!(inbound, 1);
    assert_eq!(harness.channel.sent().len(), 1);
}

#[tokio::test]
async fn test_manual_mode_silences_automation() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.m1", "Hola"))
        .await;
    let conversation = conversation_of(&harness, USER);
    let conversations = ConversationRepo::new(harness.pool.clone());

    let manual = ConversationPatch {
        bot_mode: Some(BotMode::Manual),
        ..ConversationPatch::default()
    };
    conversations.update(&conversation.id, &manual, Utc::now()).unwrap();

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.m2", "¿Sigue ahí?"))
        .await;
    assert_eq!(outcome, Outcome::ManualMode);
    assert_eq!(harness.channel.sent().len(), 1);

    // The message is still stored and flagged for the operator
    let conversation = conversations.find(&conversation.id).unwrap().unwrap();
    assert!(conversation.is_unread);
    assert_eq!(messages_of(&harness, &conversation.id).len(), 3);

    let auto = ConversationPatch {
        bot_mode: Some(BotMode::Auto),
        ..ConversationPatch::default()
    };
    conversations.update(&conversation.id, &auto, Utc::now()).unwrap();

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.m3", "Hola otra vez"))
        .await;
    assert_eq!(outcome, Outcome::AiResponse);
    assert_eq!(harness.channel.sent().len(), 2);
}

#[tokio::test]
async fn test_closed_notice_respects_cooldown() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness.clock.set(closed_instant());

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.c1", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::OutOfHours);
    assert_eq!(harness.channel.sent().len(), 1);

    harness.clock.advance(Duration::minutes(10));
    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.c2", "¿Hay alguien?"))
        .await;
    assert_eq!(outcome, Outcome::OutOfHours);
    assert_eq!(harness.channel.sent().len(), 1);

    // Thursday 03:10, still before opening
    harness.clock.advance(Duration::hours(5));
    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.c3", "Hola de nuevo"))
        .await;
    assert_eq!(outcome, Outcome::OutOfHours);
    assert_eq!(harness.channel.sent().len(), 2);

    let conversation = conversation_of(&harness, USER);
    let notices = messages_of(&harness, &conversation.id)
        .into_iter()
        .filter(|m| m.kind == MessageKind::OutOfHoursNotice)
        .count();
    assert_eq!(notices, 2);
    assert_eq!(harness.generator.calls(), 0);
}

#[tokio::test]
async fn test_oversized_cooldown_falls_back_to_default() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness.set_config("closed_notice_cooldown_minutes", "9000000000000000");
    harness.clock.set(closed_instant());

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.big1", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::OutOfHours);

    // The default four-hour cool-down applies
    harness.clock.advance(Duration::minutes(30));
    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.big2", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::OutOfHours);
    assert_eq!(harness.channel.sent().len(), 1);

    let logs = WebhookLogRepo::new(harness.pool.clone());
    assert_eq!(logs.count_by_status(WebhookStatus::Processed).unwrap(), 2);
    assert_eq!(logs.count_by_status(WebhookStatus::Pending).unwrap(), 0);
}

#[tokio::test]
async fn test_closed_notice_reaches_manual_conversations() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.x1", "Hola"))
        .await;
    let conversation = conversation_of(&harness, USER);
    let manual = ConversationPatch {
        bot_mode: Some(BotMode::Manual),
        ..ConversationPatch::default()
    };
    ConversationRepo::new(harness.pool.clone())
        .update(&conversation.id, &manual, Utc::now())
        .unwrap();

    harness.clock.set(closed_instant());
    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.x2", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::OutOfHours);
}

#[tokio::test]
async fn test_closing_soon_appends_advisory() {
    let harness = Harness::new(FakeGenerator::replying("Claro que sí"));
    harness
        .clock
        .set(Utc.with_ymd_and_hms(2025, 1, 15, 17, 45, 0).unwrap());

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.s1", "¿Abren mañana?"))
        .await;
    assert_eq!(outcome, Outcome::AiResponse);

    let texts = harness.channel.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("Claro que sí"));
    assert!(texts[0].ends_with("cerraremos en 15 minutos."));
}

#[tokio::test]
async fn test_generator_failure_sends_fallback() {
    let harness = Harness::new(FakeGenerator::failing());

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.f1", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::AiResponse);

    let conversation = conversation_of(&harness, USER);
    let messages = messages_of(&harness, &conversation.id);
    let reply = messages.last().unwrap();
    assert_eq!(reply.direction, Direction::Outbound);
    assert_eq!(reply.kind, MessageKind::Fallback);
    assert!(!reply.ai_processed);
    assert!(reply.content.starts_with("En este momento no puedo responder"));
    assert_eq!(reply.delivery_status, Some(DeliveryStatus::Sent));

    let logs = WebhookLogRepo::new(harness.pool.clone());
    assert_eq!(logs.count_by_status(WebhookStatus::Processed).unwrap(), 1);
}

#[tokio::test]
async fn test_blocked_user_is_stored_but_not_answered() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    let users = UserRepo::new(harness.pool.clone());
    let user = users.create(USER, None, Utc::now()).unwrap();
    users.set_blocked(&user.id, true).unwrap();

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.b1", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::Blocked);
    assert!(harness.channel.sent().is_empty());

    let conversation = conversation_of(&harness, USER);
    assert_eq!(messages_of(&harness, &conversation.id).len(), 1);
}

#[tokio::test]
async fn test_command_reply() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    CommandRepo::new(harness.pool.clone())
        .upsert("/horario", "Abrimos de lunes a viernes, 9 a 18 h.", Utc::now())
        .unwrap();

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.k1", "/horario por favor"))
        .await;
    assert_eq!(outcome, Outcome::Command);
    assert_eq!(
        harness.channel.texts(),
        vec!["Abrimos de lunes a viernes, 9 a 18 h.".to_string()]
    );
    assert_eq!(harness.generator.calls(), 0);

    let conversation = conversation_of(&harness, USER);
    let reply = messages_of(&harness, &conversation.id).pop().unwrap();
    assert_eq!(reply.kind, MessageKind::CommandReply);

    // Unknown commands are answered like any other text
    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.k2", "/menu"))
        .await;
    assert_eq!(outcome, Outcome::AiResponse);

    // Triggers match exactly, case included
    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.k3", "/HORARIO"))
        .await;
    assert_eq!(outcome, Outcome::AiResponse);
    assert_eq!(harness.generator.calls(), 2);
}

#[tokio::test]
async fn test_auto_respond_disabled() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness.set_config("auto_respond", "false");

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.d1", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::AutoResponseDisabled);
    assert!(harness.channel.sent().is_empty());
    assert_eq!(harness.generator.calls(), 0);
}

#[tokio::test]
async fn test_image_gets_media_confirmation() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));

    let outcome = harness
        .orchestrator
        .process(&image_event(USER, "wamid.i1"))
        .await;
    assert_eq!(outcome, Outcome::MediaConfirmation);
    assert_eq!(
        harness.channel.texts(),
        vec!["Recibimos tu archivo. Un asesor lo revisará en breve.".to_string()]
    );

    let conversation = conversation_of(&harness, USER);
    let messages = messages_of(&harness, &conversation.id);
    assert_eq!(messages[0].content_type, "image");
    assert_eq!(messages[0].media_id.as_deref(), Some("img-1"));
    assert_eq!(messages[1].kind, MessageKind::MediaAck);
}

#[tokio::test]
async fn test_audio_is_transcribed_and_answered() {
    let harness = Harness::new(FakeGenerator::replying("Con gusto, ¿de qué sabor?"));
    harness.channel.add_media("media-1", b"OggS voice note");

    let outcome = harness
        .orchestrator
        .process(&audio_event(USER, "wamid.a1", "media-1"))
        .await;
    assert_eq!(outcome, Outcome::AudioAiResponse);

    let conversation = conversation_of(&harness, USER);
    let messages = messages_of(&harness, &conversation.id);
    assert_eq!(messages[0].content, "[audio] Quiero una pizza");
    assert_eq!(messages[0].content_type, "audio");

    let requests = harness.generator.reply_requests();
    let last = requests[0].messages.last().unwrap();
    assert_eq!(last.content, "Quiero una pizza");

    // Voice replies are off by default
    assert_eq!(harness.channel.texts().len(), 1);
    assert_eq!(harness.synthesizer.calls(), 0);
}

#[tokio::test]
async fn test_audio_reply_with_voice() {
    let harness = Harness::new(FakeGenerator::replying("Con gusto"));
    harness.set_config("voice_replies", "true");
    harness.channel.add_media("media-1", b"OggS voice note");

    let outcome = harness
        .orchestrator
        .process(&audio_event(USER, "wamid.v1", "media-1"))
        .await;
    assert_eq!(outcome, Outcome::AudioAiResponse);

    let sent = harness.channel.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Sent::Audio {
            mime, file_existed, ..
        } => {
            assert_eq!(mime, "audio/ogg");
            assert!(file_existed);
        }
        other => panic!("expected audio, got {other:?}"),
    }

    let conversation = conversation_of(&harness, USER);
    let reply = messages_of(&harness, &conversation.id).pop().unwrap();
    assert_eq!(reply.content_type, "audio");
    assert!(reply.content.starts_with("Con gusto"));
}

#[tokio::test]
async fn test_failed_transcription_sends_fallback() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness.transcriber.set_text(None);
    harness.channel.add_media("media-1", b"OggS noise");

    let outcome = harness
        .orchestrator
        .process(&audio_event(USER, "wamid.a2", "media-1"))
        .await;
    assert_eq!(outcome, Outcome::AudioFallback);
    assert_eq!(
        harness.channel.texts(),
        vec!["No pude entender tu mensaje de voz. ¿Podrías escribirlo, por favor?".to_string()]
    );
    assert_eq!(harness.generator.calls(), 0);
}

#[tokio::test]
async fn test_missing_media_sends_fallback() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));

    let outcome = harness
        .orchestrator
        .process(&audio_event(USER, "wamid.a3", "gone"))
        .await;
    assert_eq!(outcome, Outcome::AudioFallback);
    assert_eq!(harness.transcriber.calls(), 0);
}

#[tokio::test]
async fn test_failed_send_is_persisted_as_failed() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness.channel.fail_sends(true);

    let outcome = harness
        .orchestrator
        .process(&text_event(USER, "wamid.e1", "Hola"))
        .await;
    assert_eq!(outcome, Outcome::AiResponse);

    let conversation = conversation_of(&harness, USER);
    let reply = messages_of(&harness, &conversation.id).pop().unwrap();
    assert_eq!(reply.direction, Direction::Outbound);
    assert_eq!(reply.delivery_status, Some(DeliveryStatus::Failed));
    assert!(reply.channel_message_id.is_none());
}

#[tokio::test]
async fn test_closed_conversation_is_not_reopened() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.r1", "Hola"))
        .await;
    let first = conversation_of(&harness, USER);

    let conversations = ConversationRepo::new(harness.pool.clone());
    conversations.close(&first.id, Utc::now()).unwrap();

    harness
        .orchestrator
        .process(&text_event(USER, "wamid.r2", "Hola otra vez"))
        .await;
    let second = conversation_of(&harness, USER);

    assert_ne!(first.id, second.id);
    let first = conversations.find(&first.id).unwrap().unwrap();
    assert_eq!(first.status, ConversationStatus::Closed);
    assert_eq!(messages_of(&harness, &second.id).len(), 2);
}

#[tokio::test]
async fn test_history_excludes_current_message() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.h1", "Hola"))
        .await;
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.h2", "¿Tienen pizza?"))
        .await;

    let requests = harness.generator.reply_requests();
    assert_eq!(requests.len(), 2);

    let contents: Vec<&str> = requests[1]
        .messages
        .iter()
        .skip(1)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents.iter().filter(|c| **c == "¿Tienen pizza?").count(), 1);
    assert!(contents.contains(&"Hola"));
}

#[tokio::test]
async fn test_delivery_status_updates() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.st1", "Hola"))
        .await;

    let status = StatusEvent {
        channel_message_id: "wamid.out1".to_string(),
        recipient: USER.to_string(),
        status: DeliveryStatus::Read,
        error: None,
    };
    assert!(harness.orchestrator.apply_status(&status));

    let conversation = conversation_of(&harness, USER);
    let reply = messages_of(&harness, &conversation.id).pop().unwrap();
    assert_eq!(reply.delivery_status, Some(DeliveryStatus::Read));

    let unknown = StatusEvent {
        channel_message_id: "wamid.nope".to_string(),
        ..status
    };
    assert!(!harness.orchestrator.apply_status(&unknown));
}

#[tokio::test]
async fn test_operator_reply() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.o1", "Quiero hablar con alguien"))
        .await;
    let conversation = conversation_of(&harness, USER);
    assert!(conversation.is_unread);

    let message = harness
        .orchestrator
        .send_operator_reply(&conversation.id, "Hola, soy Luis")
        .await
        .unwrap();
    assert_eq!(message.sender, SenderClass::Human);
    assert_eq!(message.content, "Hola, soy Luis");
    assert_eq!(harness.channel.texts().last().unwrap(), "Hola, soy Luis");

    let conversation = ConversationRepo::new(harness.pool.clone())
        .find(&conversation.id)
        .unwrap()
        .unwrap();
    assert!(!conversation.is_unread);

    let err = harness
        .orchestrator
        .send_operator_reply(&conversation.id, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, chatdesk::Error::InvalidInput(_)));

    let err = harness
        .orchestrator
        .send_operator_reply("missing", "Hola")
        .await
        .unwrap_err();
    assert!(matches!(err, chatdesk::Error::NotFound(_)));
}

#[tokio::test]
async fn test_operator_send_failure_is_not_persisted() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    harness
        .orchestrator
        .process(&text_event(USER, "wamid.o2", "Hola"))
        .await;
    let conversation = conversation_of(&harness, USER);
    harness.channel.fail_sends(true);

    let result = harness
        .orchestrator
        .send_operator_reply(&conversation.id, "Hola, soy Luis")
        .await;
    assert!(result.is_err());
    assert_eq!(messages_of(&harness, &conversation.id).len(), 2);
}

#[tokio::test]
async fn test_returning_user_keeps_identity() {
    let harness = Harness::new(FakeGenerator::replying("Claro"));
    let orchestrator = Arc::clone(&harness.orchestrator);

    orchestrator
        .process(&text_event(USER, "wamid.u1", "Hola").with_display_name("Ana"))
        .await;
    orchestrator
        .process(&text_event(USER, "wamid.u2", "Otra pregunta"))
        .await;

    let user = UserRepo::new(harness.pool.clone())
        .find_by_address(USER)
        .unwrap()
        .unwrap();
    assert_eq!(user.message_count, 2);
    assert_eq!(user.display_name.as_deref(), Some("Ana"));
}
