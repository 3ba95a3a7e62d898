#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use ringvox_voice::media::{CaptureStream, LocalAudioTrack};
use ringvox_voice::transport::{PeerConnection, PeerFactory, PeerHooks};
use ringvox_voice::{
    AudioConstraints, DataChannel, IceServer, MediaDevices, MicHandle, SessionEvent, SessionState,
    TransportEvent, TransportState, VoiceConfig, VoiceError, VoiceSession,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub const ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=answer\r\n";

/// How the mock backend answers.
#[derive(Clone)]
pub struct MockConfig {
    pub session_status: StatusCode,
    pub session_body: Value,
    pub session_delay: Duration,
    pub settings_body: Value,
    pub sdp_status: StatusCode,
    /// How long the negotiation endpoint waits before answering.
    pub sdp_delay: Duration,
    /// Responses of `/api/execute_tool` keyed by tool name.
    pub tools: HashMap<String, (StatusCode, Value)>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            session_status: StatusCode::OK,
            session_body: json!({"client_secret": {"value": "ek_test", "expires_at": 4102444800i64}}),
            session_delay: Duration::ZERO,
            settings_body: json!({"realtime_model": "gpt-4o-realtime-preview-test"}),
            sdp_status: StatusCode::CREATED,
            sdp_delay: Duration::ZERO,
            tools: HashMap::new(),
        }
    }
}

impl MockConfig {
    pub fn tool(mut self, name: &str, status: StatusCode, body: Value) -> Self {
        self.tools.insert(name.to_string(), (status, body));
        self
    }
}

#[derive(Default)]
pub struct Recorded {
    pub session_hits: AtomicUsize,
    pub tool_requests: Mutex<Vec<Value>>,
    /// `(authorization, model, body)` of each SDP offer.
    pub offers: Mutex<Vec<(String, String, String)>>,
}

struct MockState {
    config: MockConfig,
    recorded: Arc<Recorded>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub recorded: Arc<Recorded>,
}

impl MockBackend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// A session config pointing both the backend and the realtime endpoint
    /// at this mock, with the inactivity watchdog disabled.
    pub fn voice_config(&self) -> VoiceConfig {
        let mut config = VoiceConfig::default();
        config.backend.base_url = self.url();
        config.backend.request_timeout_ms = 5_000;
        config.realtime.base_url = format!("{}/v1/realtime", self.url());
        config.realtime.ice_servers = Vec::<IceServer>::new();
        config.session.inactivity_timeout_ms = 0;
        config.session.disconnect_grace_ms = 50;
        config.session.graceful_teardown_ms = 20;
        config
    }
}

async fn session(State(state): State<Arc<MockState>>) -> (StatusCode, Json<Value>) {
    state.recorded.session_hits.fetch_add(1, Ordering::SeqCst);
    if !state.config.session_delay.is_zero() {
        tokio::time::sleep(state.config.session_delay).await;
    }
    (state.config.session_status, Json(state.config.session_body.clone()))
}

async fn settings(State(state): State<Arc<MockState>>) -> Json<Value> {
    Json(state.config.settings_body.clone())
}

async fn execute_tool(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let name = body["tool_name"].as_str().unwrap_or_default().to_string();
    state.recorded.tool_requests.lock().unwrap().push(body);
    match state.config.tools.get(&name) {
        Some((status, response)) => (*status, Json(response.clone())),
        None => (
            StatusCode::OK,
            Json(json!({"success": true, "result": {"ok": true}})),
        ),
    }
}

async fn realtime(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let model = query.get("model").cloned().unwrap_or_default();
    state.recorded.offers.lock().unwrap().push((auth, model, body));
    if !state.config.sdp_delay.is_zero() {
        tokio::time::sleep(state.config.sdp_delay).await;
    }
    if state.config.sdp_status.is_success() {
        (state.config.sdp_status, ANSWER_SDP.to_string())
    } else {
        (state.config.sdp_status, "upstream rejected offer".to_string())
    }
}

/// Serves the backend and negotiation endpoints on an ephemeral port.
pub async fn spawn_backend(config: MockConfig) -> MockBackend {
    let recorded = Arc::new(Recorded::default());
    let state = Arc::new(MockState {
        config,
        recorded: Arc::clone(&recorded),
    });
    let app = Router::new()
        .route("/api/session", get(session))
        .route("/api/settings", get(settings))
        .route("/api/execute_tool", post(execute_tool))
        .route("/v1/realtime", post(realtime))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockBackend { addr, recorded }
}

struct FakeCapture(Arc<AtomicUsize>);

impl CaptureStream for FakeCapture {
    fn stop(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-memory microphone.
#[derive(Default)]
pub struct FakeDevices {
    pub deny: bool,
    pub acquired: AtomicUsize,
    pub capture_stops: Arc<AtomicUsize>,
    pub tracks: Mutex<Vec<LocalAudioTrack>>,
}

impl FakeDevices {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn track(&self) -> LocalAudioTrack {
        self.tracks.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: AudioConstraints) -> Result<MicHandle, VoiceError> {
        assert!(constraints.echo_cancellation && constraints.noise_suppression);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(VoiceError::PermissionDenied("NotAllowedError".into()));
        }
        let track = LocalAudioTrack::new("fake-mic");
        self.tracks.lock().unwrap().push(track.clone());
        Ok(MicHandle::new(
            vec![track],
            Some(Box::new(FakeCapture(Arc::clone(&self.capture_stops)))),
        ))
    }
}

/// A data channel that records what the session sends.
pub struct FakeChannel {
    pub id: u64,
    pub sent: Mutex<Vec<Value>>,
    pub closed: AtomicBool,
}

impl FakeChannel {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|event| event["type"] == kind)
            .collect()
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> &str {
        "oai-events"
    }

    async fn send_text(&self, text: String) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Transport("channel closed".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push(serde_json::from_str(&text).unwrap());
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePeer {
    pub hooks: PeerHooks,
    pub channel: Arc<FakeChannel>,
    pub tracks_added: AtomicUsize,
    pub answer: Mutex<Option<String>>,
    pub senders_stopped: AtomicUsize,
    pub closed: AtomicUsize,
}

impl FakePeer {
    /// Reports the local channel as open.
    pub fn open_channel(&self) {
        self.hooks
            .emit(TransportEvent::ChannelOpen(self.channel.clone()));
    }

    /// Delivers `event` on the local channel.
    pub fn deliver(&self, event: Value) {
        self.deliver_on(self.channel.clone(), event);
    }

    pub fn deliver_on(&self, channel: Arc<FakeChannel>, event: Value) {
        self.hooks.emit(TransportEvent::Message {
            channel,
            payload: event.to_string(),
        });
    }

    pub fn set_state(&self, state: TransportState) {
        self.hooks.emit(TransportEvent::StateChanged(state));
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_data_channel(&self, _label: &str) -> Result<Arc<dyn DataChannel>, VoiceError> {
        Ok(self.channel.clone())
    }

    async fn add_track(&self, _track: &LocalAudioTrack) -> Result<(), VoiceError> {
        self.tracks_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_audio_transceiver(&self) -> Result<(), VoiceError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, VoiceError> {
        Ok("v=0\r\ns=fake offer\r\n".to_string())
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), VoiceError> {
        *self.answer.lock().unwrap() = Some(sdp);
        Ok(())
    }

    async fn stop_senders(&self) -> Result<(), VoiceError> {
        self.senders_stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn peer(&self) -> Arc<FakePeer> {
        self.peers.lock().unwrap().last().cloned().unwrap()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        hooks: PeerHooks,
    ) -> Result<Arc<dyn PeerConnection>, VoiceError> {
        let peer = Arc::new(FakePeer {
            hooks,
            channel: FakeChannel::new(1),
            tracks_added: AtomicUsize::new(0),
            answer: Mutex::new(None),
            senders_stopped: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        self.peers.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

pub struct Harness {
    pub backend: MockBackend,
    pub devices: Arc<FakeDevices>,
    pub peers: Arc<FakePeerFactory>,
    pub session: VoiceSession,
}

impl Harness {
    pub async fn new(mock: MockConfig) -> Self {
        let backend = spawn_backend(mock).await;
        let config = backend.voice_config();
        Self::with_config(backend, config, FakeDevices::default())
    }

    pub fn with_config(backend: MockBackend, config: VoiceConfig, devices: FakeDevices) -> Self {
        let devices = Arc::new(devices);
        let peers = Arc::new(FakePeerFactory::default());
        let session = VoiceSession::new(config, devices.clone(), peers.clone()).unwrap();
        Self {
            backend,
            devices,
            peers,
            session,
        }
    }

    /// Connects and opens the local data channel.
    pub async fn connect(&self) -> Arc<FakePeer> {
        self.session.connect().await.unwrap();
        assert_eq!(self.session.state(), SessionState::Connected);
        let peer = self.peers.peer();
        peer.open_channel();
        peer
    }
}

/// Polls `condition` until it holds, failing after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Waits for the first event matching `pick`.
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pick: impl FnMut(&SessionEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("session event stream ended");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("event not received in time")
}

pub async fn wait_for_state(events: &mut broadcast::Receiver<SessionEvent>, state: SessionState) {
    next_event(events, |event| match event {
        SessionEvent::StateChanged(s) if *s == state => Some(()),
        _ => None,
    })
    .await
}

/// Lets spawned work run for a moment.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
