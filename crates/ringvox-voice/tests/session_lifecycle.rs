mod common;

use axum::http::StatusCode;
use common::*;
use ringvox_types::{HostInbound, Speaker};
use ringvox_voice::{
    ErrorKind, MessageStatus, SessionEvent, SessionState, TransportState, VoiceError,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn connect_negotiates_and_disconnect_releases_everything() {
    let harness = Harness::new(MockConfig::default()).await;
    let mut events = harness.session.subscribe();

    let peer = harness.connect().await;
    wait_for_state(&mut events, SessionState::Connecting).await;
    wait_for_state(&mut events, SessionState::Connected).await;

    // The offer went to the realtime endpoint with the ephemeral secret and
    // the model from the backend settings.
    let offers = harness.backend.recorded.offers.lock().unwrap().clone();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].0, "Bearer ek_test");
    assert_eq!(offers[0].1, "gpt-4o-realtime-preview-test");
    assert!(offers[0].2.contains("fake offer"));
    assert_eq!(peer.answer.lock().unwrap().as_deref(), Some(ANSWER_SDP));
    assert_eq!(peer.tracks_added.load(Ordering::SeqCst), 1);

    harness.session.disconnect().await;
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert!(peer.channel.closed.load(Ordering::SeqCst));
    assert_eq!(peer.senders_stopped.load(Ordering::SeqCst), 1);
    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
    assert_eq!(harness.devices.capture_stops.load(Ordering::SeqCst), 1);
    assert!(harness.devices.track().is_stopped());
}

#[tokio::test]
async fn connect_while_connected_is_a_no_op() {
    let harness = Harness::new(MockConfig::default()).await;
    harness.connect().await;

    harness.session.connect().await.unwrap();
    assert_eq!(harness.devices.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(harness.peers.created(), 1);
    assert_eq!(harness.backend.recorded.session_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn double_disconnect_runs_one_cleanup() {
    let harness = Harness::new(MockConfig::default()).await;
    let peer = harness.connect().await;

    tokio::join!(harness.session.disconnect(), harness.session.disconnect());
    eventually(|| harness.session.state() == SessionState::Idle).await;

    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
    assert_eq!(peer.senders_stopped.load(Ordering::SeqCst), 1);
    assert_eq!(harness.devices.capture_stops.load(Ordering::SeqCst), 1);

    // Disconnecting an idle session does nothing either.
    harness.session.disconnect().await;
    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn credential_failure_returns_to_idle_without_touching_the_mic() {
    let harness = Harness::new(MockConfig {
        session_status: StatusCode::INTERNAL_SERVER_ERROR,
        session_body: json!({"error": "no key"}),
        ..MockConfig::default()
    })
    .await;
    let mut events = harness.session.subscribe();

    let err = harness.session.connect().await.unwrap_err();
    assert!(matches!(err, VoiceError::Credential(ref msg) if msg == "no key"));
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert_eq!(harness.devices.acquired.load(Ordering::SeqCst), 0);
    assert_eq!(harness.peers.created(), 0);

    let (kind, message) = next_event(&mut events, |event| match event {
        SessionEvent::Notice { kind, message } => Some((*kind, message.clone())),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::Credential);
    assert!(message.contains("no key"));
}

#[tokio::test]
async fn permission_denied_is_reported_distinctly() {
    let backend = spawn_backend(MockConfig::default()).await;
    let config = backend.voice_config();
    let harness = Harness::with_config(backend, config, FakeDevices::denying());
    let mut events = harness.session.subscribe();

    let err = harness.session.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert_eq!(harness.peers.created(), 0);

    let kind = next_event(&mut events, |event| match event {
        SessionEvent::Notice { kind, .. } => Some(*kind),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn negotiation_rejection_closes_the_peer_and_releases_the_mic() {
    let harness = Harness::new(MockConfig {
        sdp_status: StatusCode::UNAUTHORIZED,
        ..MockConfig::default()
    })
    .await;

    let err = harness.session.connect().await.unwrap_err();
    assert!(matches!(err, VoiceError::Negotiation { status: Some(401), .. }));
    assert!(err.user_message().contains("401"));
    assert_eq!(harness.session.state(), SessionState::Idle);

    let peer = harness.peers.peer();
    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
    assert_eq!(harness.devices.capture_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_during_connect_cancels_it() {
    let harness = Harness::new(MockConfig {
        session_delay: Duration::from_millis(300),
        ..MockConfig::default()
    })
    .await;
    let mut events = harness.session.subscribe();

    let session = harness.session.clone();
    let connecting = tokio::spawn(async move { session.connect().await });
    wait_for_state(&mut events, SessionState::Connecting).await;

    harness.session.disconnect().await;
    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(VoiceError::Cancelled)));
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert_eq!(harness.devices.acquired.load(Ordering::SeqCst), 0);

    // The session can connect again afterwards.
    harness.connect().await;
}

#[tokio::test]
async fn disconnect_while_negotiation_hangs_releases_everything() {
    let harness = Harness::new(MockConfig {
        sdp_delay: Duration::from_secs(30),
        ..MockConfig::default()
    })
    .await;

    let session = harness.session.clone();
    let connecting = tokio::spawn(async move { session.connect().await });
    eventually(|| harness.backend.recorded.offers.lock().unwrap().len() == 1).await;
    assert_eq!(harness.session.state(), SessionState::Connecting);

    harness.session.disconnect().await;
    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(VoiceError::Cancelled)));
    assert_eq!(harness.session.state(), SessionState::Idle);

    let peer = harness.peers.peer();
    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
    assert_eq!(harness.devices.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(harness.devices.capture_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn abandoned_connect_settles_once_disconnected() {
    let harness = Harness::new(MockConfig {
        session_delay: Duration::from_secs(3),
        ..MockConfig::default()
    })
    .await;

    let attempt =
        tokio::time::timeout(Duration::from_millis(200), harness.session.connect()).await;
    assert!(attempt.is_err());
    assert_eq!(harness.session.state(), SessionState::Connecting);

    harness.session.disconnect().await;
    eventually(|| harness.session.state() == SessionState::Idle).await;
    assert_eq!(harness.devices.acquired.load(Ordering::SeqCst), 0);

    // A new attempt starts instead of being ignored.
    let mut events = harness.session.subscribe();
    let session = harness.session.clone();
    let retry = tokio::spawn(async move { session.connect().await });
    wait_for_state(&mut events, SessionState::Connecting).await;
    harness.session.disconnect().await;
    assert!(matches!(retry.await.unwrap(), Err(VoiceError::Cancelled)));
    assert_eq!(harness.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn abandoned_widget_closing_still_tears_down() {
    let backend = spawn_backend(MockConfig::default()).await;
    let mut config = backend.voice_config();
    config.session.graceful_teardown_ms = 300;
    let harness = Harness::with_config(backend, config, FakeDevices::default());
    let peer = harness.connect().await;

    let closing = tokio::time::timeout(
        Duration::from_millis(50),
        harness.session.handle_host_message(HostInbound::WidgetClosing),
    )
    .await;
    assert!(closing.is_err());
    assert_eq!(harness.session.state(), SessionState::Disconnecting);

    eventually(|| harness.session.state() == SessionState::Idle).await;
    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
    assert_eq!(harness.devices.capture_stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_loss_shows_a_notice_and_tears_down() {
    let harness = Harness::new(MockConfig::default()).await;
    let peer = harness.connect().await;
    let mut events = harness.session.subscribe();

    peer.set_state(TransportState::Failed);

    let (kind, message) = next_event(&mut events, |event| match event {
        SessionEvent::Notice { kind, message } => Some((*kind, message.clone())),
        _ => None,
    })
    .await;
    assert_eq!(kind, ErrorKind::TransportLost);
    assert_eq!(message, "Connection lost.");

    wait_for_state(&mut events, SessionState::Idle).await;
    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn widget_closing_tears_down_gracefully() {
    let harness = Harness::new(MockConfig::default()).await;
    let peer = harness.connect().await;

    harness
        .session
        .handle_host_message(HostInbound::Other)
        .await;
    assert_eq!(harness.session.state(), SessionState::Connected);

    harness
        .session
        .handle_host_message(HostInbound::WidgetClosing)
        .await;
    assert_eq!(harness.session.state(), SessionState::Idle);
    assert_eq!(peer.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mute_is_only_available_while_connected() {
    let harness = Harness::new(MockConfig::default()).await;
    assert!(!harness.session.set_muted(true));
    assert_eq!(harness.session.toggle_mute(), None);

    harness.connect().await;
    let track = harness.devices.track();
    assert_eq!(harness.session.toggle_mute(), Some(true));
    assert!(!track.is_enabled());
    assert!(harness.session.set_muted(false));
    assert!(track.is_enabled());

    harness.session.disconnect().await;
    assert_eq!(harness.session.toggle_mute(), None);
}

#[tokio::test]
async fn inactivity_disconnects_after_the_timeout() {
    let backend = spawn_backend(MockConfig::default()).await;
    let mut config = backend.voice_config();
    config.session.inactivity_timeout_ms = 5_000;
    config.session.inactivity_check_interval_ms = 1_000;
    config.session.graceful_teardown_ms = 600;
    let harness = Harness::with_config(backend, config, FakeDevices::default());

    let start = tokio::time::Instant::now();
    harness.connect().await;
    let mut events = harness.session.subscribe();
    tokio::time::pause();

    wait_for_state(&mut events, SessionState::Idle).await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "disconnected after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(7), "disconnected after {elapsed:?}");
}

#[tokio::test]
async fn reported_activity_postpones_the_timeout() {
    let backend = spawn_backend(MockConfig::default()).await;
    let mut config = backend.voice_config();
    config.session.inactivity_timeout_ms = 5_000;
    config.session.inactivity_check_interval_ms = 1_000;
    let harness = Harness::with_config(backend, config, FakeDevices::default());

    let start = tokio::time::Instant::now();
    harness.connect().await;
    let mut events = harness.session.subscribe();
    tokio::time::pause();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(harness.session.state(), SessionState::Connected);
    harness.session.record_user_activity();

    wait_for_state(&mut events, SessionState::Idle).await;
    assert!(start.elapsed() >= Duration::from_secs(8));
}

#[tokio::test]
async fn transcript_streams_through_the_data_channel() {
    let harness = Harness::new(MockConfig::default()).await;
    let peer = harness.connect().await;
    let mut events = harness.session.subscribe();

    peer.deliver(json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "Hel"}));
    peer.deliver(json!({"type": "input_audio_buffer.speech_started"}));
    peer.deliver(json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "Hola"}));
    peer.deliver(json!({"type": "conversation.item.input_audio_transcription.completed"}));
    peer.deliver(json!({"type": "response.audio_transcript.delta", "delta": "Buenos "}));
    peer.deliver(json!({"type": "response.audio_transcript.delta", "delta": "días"}));
    peer.deliver(json!({"type": "response.audio_transcript.done", "transcript": "Buenos días."}));
    // Malformed and unknown payloads are dropped.
    peer.deliver(json!({"type": "rate_limits.updated", "rate_limits": []}));
    peer.hooks.emit(ringvox_voice::TransportEvent::Message {
        channel: peer.channel.clone(),
        payload: "{not json".into(),
    });

    next_event(&mut events, |event| match event {
        SessionEvent::Transcript(ringvox_voice::TranscriptUpdate::Finalized { message })
            if message.speaker == Speaker::Assistant =>
        {
            Some(())
        }
        _ => None,
    })
    .await;

    let transcript = harness.session.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].speaker, Speaker::User);
    assert_eq!(transcript[0].text, "Hola");
    assert_eq!(transcript[0].status, MessageStatus::Final);
    assert_eq!(transcript[1].speaker, Speaker::Assistant);
    assert_eq!(transcript[1].text, "Buenos días.");
}

#[tokio::test]
async fn late_user_transcription_is_placed_before_the_answer() {
    let harness = Harness::new(MockConfig::default()).await;
    let peer = harness.connect().await;

    peer.deliver(json!({"type": "response.audio_transcript.delta", "delta": "Claro"}));
    peer.deliver(json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": "¿Puedes ayudarme?"}));
    peer.deliver(json!({"type": "response.audio_transcript.done"}));

    eventually(|| {
        let transcript = harness.session.transcript();
        transcript.len() == 2 && transcript.iter().all(|m| m.status == MessageStatus::Final)
    })
    .await;
    let transcript = harness.session.transcript();
    assert_eq!(transcript[0].speaker, Speaker::User);
    assert_eq!(transcript[0].text, "¿Puedes ayudarme?");
    assert_eq!(transcript[1].text, "Claro");
}

#[tokio::test]
async fn second_data_channel_is_ignored() {
    let harness = Harness::new(MockConfig::default()).await;
    let peer = harness.connect().await;

    let redundant = FakeChannel::new(2);
    peer.hooks
        .emit(ringvox_voice::TransportEvent::ChannelOpen(redundant.clone()));
    peer.deliver_on(
        redundant,
        json!({"type": "response.audio_transcript.delta", "delta": "ignored"}),
    );
    peer.deliver(json!({"type": "response.audio_transcript.delta", "delta": "kept"}));

    eventually(|| !harness.session.transcript().is_empty()).await;
    settle().await;
    let transcript = harness.session.transcript();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].text, "kept");
}

#[tokio::test]
async fn assistant_audio_drives_the_speaking_indicator() {
    let harness = Harness::new(MockConfig::default()).await;
    let peer = harness.connect().await;
    let mut events = harness.session.subscribe();

    peer.deliver(json!({"type": "response.audio.delta", "delta": "AAAA"}));
    let speaking = next_event(&mut events, |event| match event {
        SessionEvent::AssistantSpeaking(speaking) => Some(*speaking),
        _ => None,
    })
    .await;
    assert!(speaking);

    peer.deliver(json!({"type": "response.done", "response": {}}));
    let speaking = next_event(&mut events, |event| match event {
        SessionEvent::AssistantSpeaking(speaking) => Some(*speaking),
        _ => None,
    })
    .await;
    assert!(!speaking);
}
