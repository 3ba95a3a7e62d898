//! Realtime data-channel events.
//!
//! Every data-channel message is a single JSON object discriminated by its
//! `type` field. Inbound events form a closed set; anything outside it lands
//! in [`ServerEvent::Unrecognized`] instead of failing to parse.

use serde::{Deserialize, Serialize};

/// An event received from the remote realtime service.
///
/// Only the event kinds the session reacts to are modelled. Extra fields on
/// a recognized event are ignored; a missing text field defaults to empty.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Incremental transcription of the user's speech.
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptionDelta {
        #[serde(default)]
        delta: String,
    },

    /// Final transcription of one user utterance.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: Option<String>,
    },

    /// Incremental transcript of the assistant's spoken reply.
    #[serde(rename = "response.audio_transcript.delta")]
    OutputTranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    /// Final transcript of the assistant's spoken reply.
    #[serde(rename = "response.audio_transcript.done")]
    OutputTranscriptDone {
        #[serde(default)]
        transcript: Option<String>,
    },

    /// A chunk of assistant audio was produced.
    #[serde(rename = "response.audio.delta")]
    OutputAudioDelta,

    /// Assistant audio for the current response is complete.
    #[serde(rename = "response.audio.done")]
    OutputAudioDone,

    /// The whole response (audio, transcript, tool calls) is complete.
    #[serde(rename = "response.done")]
    ResponseDone,

    /// The model finished streaming the arguments of a function call.
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        /// JSON-encoded argument object, exactly as streamed by the model.
        #[serde(default = "empty_arguments")]
        arguments: String,
    },

    /// Server-side voice activity detection heard the user start speaking.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// Any event type outside the recognized set.
    #[serde(other)]
    Unrecognized,
}

fn empty_arguments() -> String {
    "{}".to_string()
}

impl ServerEvent {
    /// Returns the wire `type` of a recognized event, or `"unrecognized"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InputTranscriptionDelta { .. } => {
                "conversation.item.input_audio_transcription.delta"
            }
            Self::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            Self::OutputTranscriptDelta { .. } => "response.audio_transcript.delta",
            Self::OutputTranscriptDone { .. } => "response.audio_transcript.done",
            Self::OutputAudioDelta => "response.audio.delta",
            Self::OutputAudioDone => "response.audio.done",
            Self::ResponseDone => "response.done",
            Self::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::SpeechStarted => "input_audio_buffer.speech_started",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// An event sent to the remote realtime service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Add an item (here: a function call result) to the conversation.
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    /// Ask the model to produce its next turn.
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Builds the `conversation.item.create` event carrying a tool result.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    /// Returns the wire `type` of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
        }
    }
}

/// Conversation items the client creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    /// The result of a function call, correlated by `call_id`.
    FunctionCallOutput { call_id: String, output: String },
}
