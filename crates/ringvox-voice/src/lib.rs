//! Realtime voice sessions for the ringvox widget.
//!
//! A [`VoiceSession`] fetches an ephemeral credential from the application
//! backend, captures the microphone, negotiates a WebRTC peer connection with
//! the realtime speech service and then runs the conversation: streamed
//! transcripts are reassembled into messages, function calls are executed
//! against the backend and answered, and the session tears itself down on
//! user request, transport loss or inactivity.
//!
//! Platform specifics sit behind traits. [`media::MediaDevices`] produces
//! microphone handles (the `cpal` feature provides a real one) and
//! [`transport::PeerFactory`] produces peer connections
//! ([`transport::rtc::WebRtcPeerFactory`] is the `webrtc` implementation).

pub mod activity;
pub mod backend;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod g711;
pub mod level;
pub mod media;
pub mod render;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod transport;

pub use config::{IceServer, VoiceConfig, DEFAULT_DATA_CHANNEL_LABEL, DEFAULT_REALTIME_MODEL};
pub use error::{ErrorKind, VoiceError};
pub use media::{AudioConstraints, AudioFrame, MediaDevices, MicHandle};
pub use render::VisualFrame;
pub use session::{DisconnectReason, SessionEvent, SessionState, VoiceSession};
pub use tools::{ToolCall, ToolCallStatus};
pub use transcript::{Message, MessageStatus, TranscriptUpdate};
pub use transport::rtc::WebRtcPeerFactory;
pub use transport::{DataChannel, PeerConnection, PeerFactory, PeerHooks, TransportEvent, TransportState};
