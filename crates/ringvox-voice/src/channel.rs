//! The realtime event channel layered on the transport.

use crate::transport::DataChannel;
use ringvox_types::{ClientEvent, ServerEvent, Speaker};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where an inbound event goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Transcript(TranscriptInput),
    /// Assistant audio activity; drives the speaking indicator only.
    Playback(PlaybackSignal),
    Tool(RawToolCall),
    Ignored,
}

/// An input for the transcript aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptInput {
    Delta { speaker: Speaker, text: String },
    Completed { speaker: Speaker, text: Option<String> },
    SpeechStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    AudioDelta,
    AudioDone,
    ResponseDone,
}

/// A function call as announced by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// Parses one data-channel payload. Malformed payloads yield `None`.
pub fn parse(payload: &str) -> Option<ServerEvent> {
    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, "dropping malformed realtime event");
            None
        }
    }
}

/// Sends each recognized event to exactly one consumer.
pub fn route(event: ServerEvent) -> Route {
    match event {
        ServerEvent::InputTranscriptionDelta { delta } => Route::Transcript(TranscriptInput::Delta {
            speaker: Speaker::User,
            text: delta,
        }),
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            Route::Transcript(TranscriptInput::Completed {
                speaker: Speaker::User,
                text: transcript,
            })
        }
        ServerEvent::OutputTranscriptDelta { delta } => Route::Transcript(TranscriptInput::Delta {
            speaker: Speaker::Assistant,
            text: delta,
        }),
        ServerEvent::OutputTranscriptDone { transcript } => {
            Route::Transcript(TranscriptInput::Completed {
                speaker: Speaker::Assistant,
                text: transcript,
            })
        }
        ServerEvent::SpeechStarted => Route::Transcript(TranscriptInput::SpeechStarted),
        ServerEvent::OutputAudioDelta => Route::Playback(PlaybackSignal::AudioDelta),
        ServerEvent::OutputAudioDone => Route::Playback(PlaybackSignal::AudioDone),
        ServerEvent::ResponseDone => Route::Playback(PlaybackSignal::ResponseDone),
        ServerEvent::FunctionCallArgumentsDone {
            call_id,
            name,
            arguments,
        } => Route::Tool(RawToolCall {
            call_id,
            name,
            arguments,
        }),
        ServerEvent::Unrecognized => Route::Ignored,
    }
}

/// Binds the session to one data channel and serializes outbound events.
///
/// The first channel to open (local or remote-initiated) becomes active.
/// Later channels are redundant: their messages are ignored.
#[derive(Debug)]
pub struct EventChannel {
    session_id: Uuid,
    active: Mutex<Option<Arc<dyn DataChannel>>>,
}

impl EventChannel {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            active: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn DataChannel>>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes `channel` active if none is. Returns whether it is now the
    /// active channel.
    pub fn bind(&self, channel: Arc<dyn DataChannel>) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(active) if active.id() == channel.id() => true,
            Some(active) => {
                info!(
                    session_id = %self.session_id,
                    active = active.id(),
                    redundant = channel.id(),
                    label = channel.label(),
                    "ignoring redundant data channel"
                );
                false
            }
            None => {
                info!(session_id = %self.session_id, channel = channel.id(), label = channel.label(), "data channel open");
                *slot = Some(channel);
                true
            }
        }
    }

    /// Whether messages from `channel` should be processed. A message that
    /// arrives before any open event binds its channel.
    pub fn accepts(&self, channel: &Arc<dyn DataChannel>) -> bool {
        self.bind(Arc::clone(channel))
    }

    pub fn is_bound(&self) -> bool {
        self.slot().is_some()
    }

    /// Serializes and sends `event`. Without an open channel the event is
    /// dropped with a warning; send failures are logged, never returned.
    pub async fn send(&self, event: &ClientEvent) {
        let Some(channel) = self.slot().clone() else {
            warn!(session_id = %self.session_id, event = event.event_type(), "no open data channel, dropping outbound event");
            return;
        };
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "failed to encode outbound event");
                return;
            }
        };
        match channel.send_text(payload).await {
            Ok(()) => debug!(session_id = %self.session_id, event = event.event_type(), "sent realtime event"),
            Err(e) => warn!(session_id = %self.session_id, event = event.event_type(), error = %e, "failed to send realtime event"),
        }
    }

    pub async fn send_tool_result(&self, call_id: &str, output: &str) {
        self.send(&ClientEvent::function_call_output(call_id, output))
            .await;
    }

    pub async fn send_response_create(&self) {
        self.send(&ClientEvent::ResponseCreate).await;
    }

    /// Closes and forgets the active channel.
    pub async fn close(&self) -> Result<(), crate::VoiceError> {
        let channel = self.slot().take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}
