//! Peer connection and SDP negotiation with the realtime service.
//!
//! The session talks to a peer connection through [`PeerConnection`] and
//! [`DataChannel`], created by a [`PeerFactory`]. Backend callbacks never call
//! into the session directly: channel events go into a bounded queue which
//! the session drains once it is connected, and the connection state goes
//! into a `watch` slot that always holds the latest value.

pub mod rtc;

use crate::config::{IceServer, RealtimeConfig};
use crate::credential::Credential;
use crate::error::VoiceError;
use crate::level::LevelMeter;
use crate::media::{AudioFrame, LocalAudioTrack, MicHandle};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the queue between transport callbacks and the session.
pub const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// Coarse peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// `disconnected`, `failed` and `closed` all mean the session is over.
    pub fn is_lost(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// A message-oriented duplex channel carried by the peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Process-unique identifier assigned when the channel is wrapped.
    fn id(&self) -> u64;
    fn label(&self) -> &str;
    async fn send_text(&self, text: String) -> Result<(), VoiceError>;
    async fn close(&self) -> Result<(), VoiceError>;
}

impl fmt::Debug for dyn DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("id", &self.id())
            .field("label", &self.label())
            .finish()
    }
}

/// Something the transport observed.
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A data channel (local or remote-initiated) became usable.
    ChannelOpen(Arc<dyn DataChannel>),
    /// A text message arrived on `channel`.
    Message {
        channel: Arc<dyn DataChannel>,
        payload: String,
    },
}

/// What a peer backend reports into.
#[derive(Clone)]
pub struct PeerHooks {
    pub session_id: Uuid,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<watch::Sender<TransportState>>,
    /// Raw level of the assistant's audio.
    pub remote_level: Arc<LevelMeter>,
    /// Decoded assistant audio, for playback.
    pub remote_audio: broadcast::Sender<AudioFrame>,
}

impl PeerHooks {
    /// Creates the hooks a peer reports into and the receiving side the
    /// session drains.
    pub fn channel(
        session_id: Uuid,
        remote_level: Arc<LevelMeter>,
        remote_audio: broadcast::Sender<AudioFrame>,
    ) -> (Self, TransportEvents) {
        Self::with_capacity(session_id, TRANSPORT_EVENT_CAPACITY, remote_level, remote_audio)
    }

    fn with_capacity(
        session_id: Uuid,
        capacity: usize,
        remote_level: Arc<LevelMeter>,
        remote_audio: broadcast::Sender<AudioFrame>,
    ) -> (Self, TransportEvents) {
        let (events, messages) = mpsc::channel(capacity);
        let (state, state_rx) = watch::channel(TransportState::New);
        let hooks = Self {
            session_id,
            events,
            state: Arc::new(state),
            remote_level,
            remote_audio,
        };
        (
            hooks,
            TransportEvents {
                messages,
                state: state_rx,
            },
        )
    }

    /// Reports `event` without blocking. State changes replace the previous
    /// state and are never lost; channel events that overflow the queue are
    /// dropped with a warning.
    pub fn emit(&self, event: TransportEvent) {
        if let TransportEvent::StateChanged(state) = event {
            self.state.send_replace(state);
            return;
        }
        if let Err(e) = self.events.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(dropped) => {
                    warn!(session_id = %self.session_id, event = ?dropped, "transport event queue full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(session_id = %self.session_id, "transport event after session ended");
                }
            }
        }
    }
}

/// The receiving side of [`PeerHooks`].
#[derive(Debug)]
pub struct TransportEvents {
    pub messages: mpsc::Receiver<TransportEvent>,
    pub state: watch::Receiver<TransportState>,
}

impl TransportEvents {
    /// Waits for the next event. A state change is reported as
    /// [`TransportEvent::StateChanged`] with the latest state. Returns `None`
    /// once the peer has dropped its hooks.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        tokio::select! {
            biased;
            changed = self.state.changed() => match changed {
                Ok(()) => {
                    let state = *self.state.borrow_and_update();
                    Some(TransportEvent::StateChanged(state))
                }
                Err(_) => self.messages.recv().await,
            },
            message = self.messages.recv() => message,
        }
    }
}

/// A peer connection to the realtime service.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates a local data channel. Its open event arrives as
    /// [`TransportEvent::ChannelOpen`].
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, VoiceError>;

    /// Attaches a local audio track for sending.
    async fn add_track(&self, track: &LocalAudioTrack) -> Result<(), VoiceError>;

    /// Ensures a bidirectional audio transceiver exists, so remote audio is
    /// negotiated even if no local track was attached.
    async fn add_audio_transceiver(&self) -> Result<(), VoiceError>;

    /// Builds the local description and returns it once ICE gathering is
    /// complete.
    async fn create_offer(&self) -> Result<String, VoiceError>;

    async fn set_remote_answer(&self, sdp: String) -> Result<(), VoiceError>;

    /// Stops every outgoing sender.
    async fn stop_senders(&self) -> Result<(), VoiceError>;

    async fn close(&self) -> Result<(), VoiceError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        hooks: PeerHooks,
    ) -> Result<Arc<dyn PeerConnection>, VoiceError>;
}

/// A negotiated transport, owned by the session while connected.
pub struct Transport {
    pub peer: Arc<dyn PeerConnection>,
    pub local_channel: Arc<dyn DataChannel>,
    pub events: TransportEvents,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local_channel", &self.local_channel)
            .finish_non_exhaustive()
    }
}

/// Runs the offer/answer exchange.
pub struct TransportNegotiator {
    factory: Arc<dyn PeerFactory>,
    http: reqwest::Client,
    config: RealtimeConfig,
}

impl fmt::Debug for TransportNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportNegotiator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransportNegotiator {
    pub fn new(factory: Arc<dyn PeerFactory>, config: RealtimeConfig) -> Result<Self, VoiceError> {
        let http = reqwest::Client::builder()
            .timeout(config.negotiation_timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            factory,
            http,
            config,
        })
    }

    /// Builds a peer connection for `mic` and negotiates it with the remote
    /// service. The partially built peer is closed on any failure, including
    /// cancellation through `cancel`.
    pub async fn negotiate(
        &self,
        mic: &MicHandle,
        credential: &Credential,
        hooks: PeerHooks,
        events: TransportEvents,
        cancel: &CancellationToken,
    ) -> Result<Transport, VoiceError> {
        let session_id = hooks.session_id;
        let peer = self.factory.create(&self.config.ice_servers, hooks).await?;

        match self.exchange(&*peer, mic, credential, cancel).await {
            Ok(local_channel) => {
                info!(%session_id, model = %credential.model, "transport negotiated");
                Ok(Transport {
                    peer,
                    local_channel,
                    events,
                })
            }
            Err(e) => {
                if let Err(close_err) = peer.close().await {
                    warn!(%session_id, error = %close_err, "failed to close peer after negotiation error");
                }
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        peer: &dyn PeerConnection,
        mic: &MicHandle,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DataChannel>, VoiceError> {
        let channel = peer
            .create_data_channel(&self.config.data_channel_label)
            .await?;
        for track in mic.tracks() {
            peer.add_track(track).await?;
        }
        peer.add_audio_transceiver().await?;

        let offer = cancellable(cancel, peer.create_offer()).await?;
        let answer = cancellable(cancel, self.post_offer(credential, offer)).await?;
        peer.set_remote_answer(answer).await?;
        Ok(channel)
    }

    async fn post_offer(&self, credential: &Credential, offer: String) -> Result<String, VoiceError> {
        let url = credential.negotiation_url()?;
        debug!(%url, "posting SDP offer");

        let response = self
            .http
            .post(url)
            .bearer_auth(credential.secret())
            .header(CONTENT_TYPE, "application/sdp")
            .header("OpenAI-Beta", "realtime=v1")
            .body(offer)
            .send()
            .await
            .map_err(|e| VoiceError::Negotiation {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| VoiceError::Negotiation {
            status: Some(status.as_u16()),
            message: format!("failed to read answer: {e}"),
        })?;

        if !status.is_success() {
            return Err(VoiceError::Negotiation {
                status: Some(status.as_u16()),
                message: body,
            });
        }
        Ok(body)
    }
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, VoiceError>>,
) -> Result<T, VoiceError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VoiceError::Cancelled),
        result = fut => result,
    }
}
