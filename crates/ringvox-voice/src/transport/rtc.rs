//! Peer connections backed by the `webrtc` crate.
//!
//! Audio is negotiated as G.711 only, so the local track can be encoded
//! without an Opus dependency and the remote track can be decoded for level
//! metering and playback.

use super::{DataChannel, PeerConnection, PeerFactory, PeerHooks, TransportEvent, TransportState};
use crate::config::IceServer;
use crate::error::VoiceError;
use crate::g711::{decode_alaw, decode_ulaw, encode_ulaw, resample_linear, G711_SAMPLE_RATE};
use crate::media::{AudioFrame, LocalAudioTrack};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMA, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Samples per outgoing packet: 20 ms at 8 kHz.
const PACKET_SAMPLES: usize = 160;
const PACKET_DURATION: Duration = Duration::from_millis(20);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

fn g711_codec(mime_type: &str, payload_type: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate: G711_SAMPLE_RATE,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        payload_type,
        ..Default::default()
    }
}

/// Creates `webrtc` peer connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcPeerFactory;

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        hooks: PeerHooks,
    ) -> Result<Arc<dyn PeerConnection>, VoiceError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(g711_codec(MIME_TYPE_PCMU, 0), RTPCodecType::Audio)?;
        media_engine.register_codec(g711_codec(MIME_TYPE_PCMA, 8), RTPCodecType::Audio)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        let session_id = hooks.session_id;

        let state_hooks = hooks.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state = TransportState::from(state);
            info!(session_id = %state_hooks.session_id, ?state, "peer connection state changed");
            state_hooks.emit(TransportEvent::StateChanged(state));
            Box::pin(async {})
        }));

        let channel_hooks = hooks.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            debug!(session_id = %channel_hooks.session_id, label = dc.label(), "remote data channel announced");
            wire_channel(dc, &channel_hooks);
            Box::pin(async {})
        }));

        let track_hooks = hooks.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            if track.kind() == RTPCodecType::Audio {
                let hooks = track_hooks.clone();
                tokio::spawn(read_remote_audio(track, hooks));
            }
            Box::pin(async {})
        }));

        debug!(%session_id, "peer connection created");
        Ok(Arc::new(WebRtcPeer {
            pc,
            hooks,
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

/// Registers open/message handlers on `dc` and returns its wrapper.
fn wire_channel(dc: Arc<RTCDataChannel>, hooks: &PeerHooks) -> Arc<dyn DataChannel> {
    let handle: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel {
        id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
        label: dc.label().to_owned(),
        inner: Arc::clone(&dc),
    });

    let open_hooks = hooks.clone();
    let opened = Arc::clone(&handle);
    dc.on_open(Box::new(move || {
        open_hooks.emit(TransportEvent::ChannelOpen(opened));
        Box::pin(async {})
    }));

    let message_hooks = hooks.clone();
    let source = Arc::clone(&handle);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(payload) => message_hooks.emit(TransportEvent::Message {
                    channel: Arc::clone(&source),
                    payload,
                }),
                Err(e) => debug!(error = %e, "dropping non-UTF-8 data channel message"),
            }
        }
        Box::pin(async {})
    }));

    handle
}

async fn read_remote_audio(track: Arc<TrackRemote>, hooks: PeerHooks) {
    let mime_type = track.codec().capability.mime_type;
    let decode: Option<fn(&[u8]) -> Vec<f32>> = if mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
        Some(decode_ulaw)
    } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMA) {
        Some(decode_alaw)
    } else {
        None
    };
    info!(session_id = %hooks.session_id, mime_type = %mime_type, "remote audio track started");
    if decode.is_none() {
        warn!(session_id = %hooks.session_id, mime_type = %mime_type, "remote codec is not G.711, level metering disabled");
    }

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                let Some(decode) = decode else { continue };
                if packet.payload.is_empty() {
                    continue;
                }
                let samples = decode(&packet.payload);
                hooks.remote_level.observe(&samples);
                let _ = hooks.remote_audio.send(AudioFrame {
                    samples: Arc::from(samples),
                    sample_rate: G711_SAMPLE_RATE,
                });
            }
            Err(e) => {
                debug!(session_id = %hooks.session_id, error = %e, "remote track ended");
                break;
            }
        }
    }
}

/// Feeds local microphone frames into a PCMU sample track.
async fn pump_local_audio(
    session_id: Uuid,
    source: LocalAudioTrack,
    sink: Arc<TrackLocalStaticSample>,
) {
    let mut frames = source.subscribe();
    let mut pending: Vec<f32> = Vec::with_capacity(PACKET_SAMPLES * 4);
    loop {
        match frames.recv().await {
            Ok(frame) => {
                pending.extend(resample_linear(
                    &frame.samples,
                    frame.sample_rate,
                    G711_SAMPLE_RATE,
                ));
                while pending.len() >= PACKET_SAMPLES {
                    let packet: Vec<f32> = pending.drain(..PACKET_SAMPLES).collect();
                    let sample = Sample {
                        data: Bytes::from(encode_ulaw(&packet)),
                        duration: PACKET_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = sink.write_sample(&sample).await {
                        debug!(%session_id, error = %e, "local audio write failed");
                        return;
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(%session_id, skipped, "local audio pump lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    hooks: PeerHooks,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcPeer {
    fn abort_pumps(&self) {
        let pumps = match self.pumps.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for pump in pumps {
            pump.abort();
        }
    }

    fn sendrecv() -> Option<RTCRtpTransceiverInit> {
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendrecv,
            send_encodings: vec![],
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, VoiceError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(wire_channel(dc, &self.hooks))
    }

    async fn add_track(&self, track: &LocalAudioTrack) -> Result<(), VoiceError> {
        let sink = Arc::new(TrackLocalStaticSample::new(
            g711_codec(MIME_TYPE_PCMU, 0).capability,
            track.id().to_owned(),
            format!("ringvox-{}", self.hooks.session_id),
        ));
        self.pc
            .add_transceiver_from_track(
                Arc::clone(&sink) as Arc<dyn TrackLocal + Send + Sync>,
                Self::sendrecv(),
            )
            .await?;

        let pump = tokio::spawn(pump_local_audio(
            self.hooks.session_id,
            track.clone(),
            sink,
        ));
        match self.pumps.lock() {
            Ok(mut guard) => guard.push(pump),
            Err(poisoned) => poisoned.into_inner().push(pump),
        }
        Ok(())
    }

    async fn add_audio_transceiver(&self) -> Result<(), VoiceError> {
        let has_audio = self
            .pc
            .get_transceivers()
            .await
            .iter()
            .any(|t| t.kind() == RTPCodecType::Audio);
        if !has_audio {
            self.pc
                .add_transceiver_from_kind(RTPCodecType::Audio, Self::sendrecv())
                .await?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, VoiceError> {
        let offer = self.pc.create_offer(None).await?;
        let mut gathering = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        let _ = gathering.recv().await;
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| VoiceError::Transport("local description missing after gathering".into()))
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), VoiceError> {
        let answer = RTCSessionDescription::answer(sdp).map_err(|e| VoiceError::Negotiation {
            status: None,
            message: format!("invalid SDP answer: {e}"),
        })?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| VoiceError::Negotiation {
                status: None,
                message: format!("remote description rejected: {e}"),
            })
    }

    async fn stop_senders(&self) -> Result<(), VoiceError> {
        self.abort_pumps();
        let mut first_error = None;
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                warn!(session_id = %self.hooks.session_id, error = %e, "failed to stop sender");
                first_error.get_or_insert(VoiceError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.abort_pumps();
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcDataChannel {
    id: u64,
    label: String,
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: String) -> Result<(), VoiceError> {
        self.inner.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.inner.close().await?;
        Ok(())
    }
}
