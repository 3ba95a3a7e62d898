//! The voice session state machine.
//!
//! A [`VoiceSession`] owns everything a connected conversation needs: the
//! microphone, the audio analysers, the peer connection, the event channel,
//! the tool invoker and the background tasks (event pump, inactivity
//! watchdog, render loop). All lifecycle state sits behind one mutex so that
//! connect and disconnect cannot interleave destructively.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnecting -> Idle
//!           |                           ^
//!           +---- failure --> Idle      |
//!           +---- disconnect -----------+
//! ```
//!
//! Every connect attempt gets a new epoch. Deferred teardown requests carry
//! the epoch they were issued under and are ignored once it is stale.

use crate::activity::{watchdog, ActivityClock};
use crate::backend::BackendClient;
use crate::channel::{self, EventChannel, PlaybackSignal, Route, TranscriptInput};
use crate::config::VoiceConfig;
use crate::credential::CredentialFetcher;
use crate::error::{ErrorKind, VoiceError};
use crate::level::AudioAnalysis;
use crate::media::{AudioConstraints, AudioFrame, MediaDevices, MicHandle};
use crate::render::{AssistantActivity, RenderInputs, RenderLoop, VisualFrame};
use crate::tools::{ToolCall, ToolHost, ToolInvoker};
use crate::transcript::{Message, TranscriptAggregator, TranscriptUpdate};
use crate::transport::{
    cancellable, PeerConnection, PeerFactory, PeerHooks, Transport, TransportEvent,
    TransportEvents, TransportNegotiator,
};
use ringvox_types::{HostInbound, HostMessage, Speaker};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the session event broadcast.
const SESSION_EVENT_CAPACITY: usize = 256;

/// Decoded assistant audio buffered per playback subscriber.
const REMOTE_AUDIO_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    User,
    TransportLost,
    InactivityTimeout,
    ToolRequested,
    HostClosing,
}

impl DisconnectReason {
    /// Reasons that fade out before cleanup.
    fn is_graceful(self) -> bool {
        matches!(self, Self::InactivityTimeout | Self::HostClosing)
    }
}

/// What observers of a session see.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Transcript(TranscriptUpdate),
    AssistantSpeaking(bool),
    MuteChanged(bool),
    /// A message for the embedding host.
    Host(HostMessage),
    ToolCallResolved(ToolCall),
    /// A user-facing notice, usually an error.
    Notice { kind: ErrorKind, message: String },
}

/// Resources held while connected.
struct Active {
    epoch: u64,
    mic: Arc<MicHandle>,
    analysis: Option<AudioAnalysis>,
    peer: Arc<dyn PeerConnection>,
    channel: Arc<EventChannel>,
    tools: ToolInvoker,
    pump: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
    render: Option<RenderLoop>,
}

impl Drop for Active {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
    }
}

struct Lifecycle {
    state: SessionState,
    epoch: u64,
    active: Option<Active>,
    /// Cancels the in-flight connect attempt.
    cancel: Option<CancellationToken>,
}

/// What a successful connect attempt produced, before it is committed.
struct Established {
    mic: Arc<MicHandle>,
    analysis: AudioAnalysis,
    transport: Transport,
}

struct Inner {
    id: Uuid,
    config: VoiceConfig,
    backend: BackendClient,
    credentials: CredentialFetcher,
    negotiator: TransportNegotiator,
    devices: Arc<dyn MediaDevices>,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<SessionEvent>,
    frames: watch::Sender<VisualFrame>,
    remote_audio: broadcast::Sender<AudioFrame>,
    transcript: Mutex<TranscriptAggregator>,
    activity: Arc<ActivityClock>,
    assistant: Arc<AssistantActivity>,
}

/// A voice conversation with the realtime service.
///
/// Cloning yields another handle on the same session.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl VoiceSession {
    pub fn new(
        config: VoiceConfig,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerFactory>,
    ) -> Result<Self, VoiceError> {
        let backend = BackendClient::new(&config.backend)?;
        let credentials = CredentialFetcher::new(backend.clone(), config.realtime.clone());
        let negotiator = TransportNegotiator::new(peers, config.realtime.clone())?;
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (frames, _) = watch::channel(VisualFrame::default());
        let (remote_audio, _) = broadcast::channel(REMOTE_AUDIO_CAPACITY);
        let transcript = TranscriptAggregator::new(config.transcript.max_messages);
        let id = Uuid::new_v4();
        info!(session_id = %id, backend = %backend.base_url(), "voice session created");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                backend,
                credentials,
                negotiator,
                devices,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Idle,
                    epoch: 0,
                    active: None,
                    cancel: None,
                }),
                events,
                frames,
                remote_audio,
                transcript: Mutex::new(transcript),
                activity: Arc::new(ActivityClock::new()),
                assistant: Arc::new(AssistantActivity::default()),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lifecycle().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Visualization frames, published every render tick while connected.
    pub fn frames(&self) -> watch::Receiver<VisualFrame> {
        self.inner.frames.subscribe()
    }

    /// Decoded assistant audio, for a playback sink.
    pub fn remote_audio(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.remote_audio.subscribe()
    }

    /// A snapshot of the visible transcript.
    pub fn transcript(&self) -> Vec<Message> {
        self.inner.transcript().messages().to_vec()
    }

    /// Connects the session. Does nothing unless the session is idle.
    ///
    /// Failures leave the session idle, emit a [`SessionEvent::Notice`] and
    /// are returned. A disconnect issued meanwhile makes this return
    /// [`VoiceError::Cancelled`] once everything acquired so far is released.
    ///
    /// The attempt runs on its own task, so dropping the returned future does
    /// not abandon it halfway and a later [`disconnect`](Self::disconnect)
    /// still settles the session.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        let inner = Arc::clone(&self.inner);
        match tokio::spawn(async move { inner.connect().await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(VoiceError::Cancelled),
        }
    }

    /// Disconnects at the user's request. Idempotent.
    pub async fn disconnect(&self) {
        self.shutdown(DisconnectReason::User).await;
    }

    pub async fn handle_host_message(&self, message: HostInbound) {
        match message {
            HostInbound::WidgetClosing => {
                info!(session_id = %self.inner.id, "host is closing the widget");
                self.shutdown(DisconnectReason::HostClosing).await;
            }
            HostInbound::Other => debug!(session_id = %self.inner.id, "ignoring host message"),
        }
    }

    /// Tears down on a separate task, which finishes even if the caller
    /// stops waiting.
    async fn shutdown(&self, reason: DisconnectReason) {
        let inner = Arc::clone(&self.inner);
        if let Err(e) = tokio::spawn(async move { inner.shutdown(reason, None).await }).await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
            warn!(session_id = %self.inner.id, error = %e, "teardown task did not finish");
        }
    }

    /// Records pointer, keyboard or touch activity reported by the host.
    pub fn record_user_activity(&self) {
        self.inner.activity.touch();
    }

    /// Mutes or unmutes the microphone. Returns false when not connected.
    pub fn set_muted(&self, muted: bool) -> bool {
        let lifecycle = self.inner.lifecycle();
        match (&lifecycle.state, &lifecycle.active) {
            (SessionState::Connected, Some(active)) => {
                active.mic.set_muted(muted);
                self.inner.emit(SessionEvent::MuteChanged(muted));
                true
            }
            _ => false,
        }
    }

    /// Flips the mute state. Returns the new state, or `None` when not
    /// connected.
    pub fn toggle_mute(&self) -> Option<bool> {
        let lifecycle = self.inner.lifecycle();
        match (&lifecycle.state, &lifecycle.active) {
            (SessionState::Connected, Some(active)) => {
                let muted = !active.mic.is_muted();
                active.mic.set_muted(muted);
                self.inner.emit(SessionEvent::MuteChanged(muted));
                Some(muted)
            }
            _ => None,
        }
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn transcript(&self) -> MutexGuard<'_, TranscriptAggregator> {
        match self.transcript.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, state: SessionState) {
        if lifecycle.state == state {
            return;
        }
        info!(session_id = %self.id, epoch = lifecycle.epoch, from = ?lifecycle.state, to = ?state, "session state changed");
        lifecycle.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    /// One connect attempt, from `Idle` to `Connected` or back to `Idle`.
    async fn connect(self: &Arc<Self>) -> Result<(), VoiceError> {
        let (epoch, cancel) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != SessionState::Idle {
                debug!(session_id = %self.id, state = ?lifecycle.state, "connect ignored");
                return Ok(());
            }
            lifecycle.epoch += 1;
            let cancel = CancellationToken::new();
            lifecycle.cancel = Some(cancel.clone());
            self.set_state(&mut lifecycle, SessionState::Connecting);
            (lifecycle.epoch, cancel)
        };

        let established = match self.establish(&cancel).await {
            Ok(established) => established,
            Err(e) => return Err(self.connect_failed(epoch, &cancel, e)),
        };

        {
            let mut lifecycle = self.lifecycle();
            if !cancel.is_cancelled() && lifecycle.epoch == epoch {
                lifecycle.cancel = None;
                let active = self.activate(epoch, established);
                lifecycle.active = Some(active);
                self.set_state(&mut lifecycle, SessionState::Connected);
                return Ok(());
            }
        }

        info!(session_id = %self.id, epoch, "connect cancelled, releasing transport");
        if let Err(e) = established.transport.peer.close().await {
            warn!(session_id = %self.id, error = %e, "failed to close cancelled peer");
        }
        established.mic.release();
        established.analysis.close().await;
        self.settle_cancelled(epoch);
        Err(VoiceError::Cancelled)
    }

    /// Credential, then microphone, then transport. Whatever was acquired is
    /// released before an error is returned.
    async fn establish(&self, cancel: &CancellationToken) -> Result<Established, VoiceError> {
        let credential = cancellable(cancel, self.credentials.fetch()).await?;

        let mic = cancellable(cancel, self.devices.acquire(AudioConstraints::default())).await?;
        let mic = Arc::new(mic);
        if cancel.is_cancelled() {
            mic.release();
            return Err(VoiceError::Cancelled);
        }
        let analysis = AudioAnalysis::start(&mic);

        let (hooks, events) = PeerHooks::channel(
            self.id,
            Arc::clone(&analysis.remote),
            self.remote_audio.clone(),
        );
        match self
            .negotiator
            .negotiate(&mic, &credential, hooks, events, cancel)
            .await
        {
            Ok(transport) => Ok(Established {
                mic,
                analysis,
                transport,
            }),
            Err(e) => {
                mic.release();
                analysis.close().await;
                Err(e)
            }
        }
    }

    /// Starts the background tasks of a fresh connection. Called with the
    /// lifecycle lock held.
    fn activate(self: &Arc<Self>, epoch: u64, established: Established) -> Active {
        let Established {
            mic,
            analysis,
            transport,
        } = established;
        let Transport {
            peer,
            local_channel,
            events,
        } = transport;
        debug!(session_id = %self.id, channel = local_channel.id(), "local data channel created");

        self.transcript().reset_lanes();
        self.assistant.clear();
        self.activity.touch();

        let channel = Arc::new(EventChannel::new(self.id));
        let host: Arc<dyn ToolHost> = Arc::new(SessionToolHost {
            inner: Arc::downgrade(self),
            epoch,
        });
        let tools = ToolInvoker::new(
            self.id,
            self.backend.clone(),
            Arc::clone(&channel),
            host,
            self.config.tools.collections.clone(),
            self.config.session.disconnect_grace(),
        );

        let pump = tokio::spawn(pump(
            Arc::downgrade(self),
            epoch,
            events,
            Arc::clone(&channel),
            tools.clone(),
        ));

        let watchdog = self.config.session.inactivity_timeout().map(|timeout| {
            let clock = Arc::clone(&self.activity);
            let interval = self.config.session.inactivity_check_interval();
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                watchdog(&clock, timeout, interval, move || {
                    request_shutdown(weak, epoch, DisconnectReason::InactivityTimeout, Duration::ZERO)
                })
                .await;
            })
        });

        let render = RenderLoop::spawn(
            RenderInputs {
                mic_level: Arc::clone(&analysis.mic),
                assistant_level: Arc::clone(&analysis.remote),
                assistant: Arc::clone(&self.assistant),
                mic: Arc::clone(&mic),
                activity: Arc::clone(&self.activity),
                mic_activity_threshold: self.config.session.mic_activity_threshold,
            },
            self.config.session.render_interval(),
            self.frames.clone(),
        );

        Active {
            epoch,
            mic,
            analysis: Some(analysis),
            peer,
            channel,
            tools,
            pump,
            watchdog,
            render: Some(render),
        }
    }

    /// Returns the session to idle after a failed connect attempt and
    /// reports the failure.
    fn connect_failed(&self, epoch: u64, cancel: &CancellationToken, error: VoiceError) -> VoiceError {
        if cancel.is_cancelled() {
            info!(session_id = %self.id, epoch, "connect cancelled");
            self.settle_cancelled(epoch);
            return VoiceError::Cancelled;
        }
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.cancel = None;
            self.set_state(&mut lifecycle, SessionState::Idle);
        }
        warn!(session_id = %self.id, epoch, kind = error.kind().as_str(), error = %error, "connect failed");
        self.emit(SessionEvent::Notice {
            kind: error.kind(),
            message: error.user_message(),
        });
        error
    }

    /// Finishes a connect attempt that was cancelled by a disconnect.
    fn settle_cancelled(&self, epoch: u64) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.epoch == epoch && lifecycle.state == SessionState::Disconnecting {
            lifecycle.cancel = None;
            self.set_state(&mut lifecycle, SessionState::Idle);
        }
    }

    /// Moves the session toward idle. With `expected_epoch`, the request is
    /// dropped if it was issued for an earlier connection.
    async fn shutdown(&self, reason: DisconnectReason, expected_epoch: Option<u64>) {
        let mut active = {
            let mut lifecycle = self.lifecycle();
            if let Some(epoch) = expected_epoch {
                if lifecycle.epoch != epoch {
                    debug!(session_id = %self.id, epoch, current = lifecycle.epoch, ?reason, "stale teardown request");
                    return;
                }
            }
            match lifecycle.state {
                SessionState::Idle | SessionState::Disconnecting => {
                    debug!(session_id = %self.id, ?reason, state = ?lifecycle.state, "teardown already done or running");
                    return;
                }
                SessionState::Connecting => {
                    info!(session_id = %self.id, ?reason, "cancelling connect attempt");
                    if let Some(cancel) = lifecycle.cancel.take() {
                        cancel.cancel();
                    }
                    self.set_state(&mut lifecycle, SessionState::Disconnecting);
                    return;
                }
                SessionState::Connected => {
                    info!(session_id = %self.id, ?reason, "disconnecting");
                    self.set_state(&mut lifecycle, SessionState::Disconnecting);
                    match lifecycle.active.take() {
                        Some(active) => active,
                        None => {
                            self.set_state(&mut lifecycle, SessionState::Idle);
                            return;
                        }
                    }
                }
            }
        };

        if reason.is_graceful() {
            tokio::time::sleep(self.config.session.graceful_teardown()).await;
        }
        self.teardown(&mut active).await;

        let mut lifecycle = self.lifecycle();
        if lifecycle.epoch == active.epoch && lifecycle.state == SessionState::Disconnecting {
            self.set_state(&mut lifecycle, SessionState::Idle);
        }
    }

    /// Releases every resource of `active`. Each step logs and swallows its
    /// own failure.
    async fn teardown(&self, active: &mut Active) {
        if let Some(render) = active.render.take() {
            render.stop().await;
        }
        if let Some(watchdog) = active.watchdog.take() {
            watchdog.abort();
        }

        active.pump.abort();
        let aborted = active.tools.abort_all();
        if aborted > 0 {
            info!(session_id = %self.id, aborted, "aborted outstanding tool calls");
        }

        if let Err(e) = active.channel.close().await {
            warn!(session_id = %self.id, error = %e, "failed to close data channel");
        }
        if let Err(e) = active.peer.stop_senders().await {
            warn!(session_id = %self.id, error = %e, "failed to stop senders");
        }
        if let Err(e) = active.peer.close().await {
            warn!(session_id = %self.id, error = %e, "failed to close peer connection");
        }
        active.mic.release();
        if let Some(analysis) = active.analysis.take() {
            analysis.close().await;
        }

        if self.assistant.is_speaking() {
            self.emit(SessionEvent::AssistantSpeaking(false));
        }
        self.assistant.clear();
        info!(session_id = %self.id, epoch = active.epoch, "session resources released");
    }

    fn is_current(&self, epoch: u64) -> bool {
        let lifecycle = self.lifecycle();
        lifecycle.epoch == epoch && lifecycle.state == SessionState::Connected
    }

    fn dispatch(
        self: &Arc<Self>,
        epoch: u64,
        event_channel: &EventChannel,
        tools: &ToolInvoker,
        event: TransportEvent,
    ) {
        match event {
            TransportEvent::StateChanged(state) => {
                debug!(session_id = %self.id, ?state, "transport state");
                if state.is_lost() && self.is_current(epoch) {
                    let lost = VoiceError::Transport(format!("peer connection {state:?}"));
                    warn!(session_id = %self.id, ?state, "transport lost");
                    self.emit(SessionEvent::Notice {
                        kind: lost.kind(),
                        message: lost.user_message(),
                    });
                    request_shutdown(
                        Arc::downgrade(self),
                        epoch,
                        DisconnectReason::TransportLost,
                        Duration::ZERO,
                    );
                }
            }
            TransportEvent::ChannelOpen(dc) => {
                event_channel.bind(dc);
            }
            TransportEvent::Message { channel: dc, payload } => {
                if !event_channel.accepts(&dc) {
                    return;
                }
                let Some(event) = channel::parse(&payload) else {
                    return;
                };
                debug!(session_id = %self.id, event = event.event_type(), "realtime event");
                match channel::route(event) {
                    Route::Transcript(input) => self.apply_transcript(input),
                    Route::Playback(signal) => self.apply_playback(signal),
                    Route::Tool(call) => tools.handle(call),
                    Route::Ignored => {}
                }
            }
        }
    }

    fn apply_transcript(&self, input: TranscriptInput) {
        let updates = {
            let mut transcript = self.transcript();
            match input {
                TranscriptInput::Delta { speaker, text } => {
                    self.activity.touch();
                    transcript.delta(speaker, &text)
                }
                TranscriptInput::Completed { speaker, text } => {
                    if speaker == Speaker::Assistant {
                        self.set_speaking(false);
                    }
                    transcript.completed(speaker, text.as_deref())
                }
                TranscriptInput::SpeechStarted => transcript.speech_started(),
            }
        };
        for update in updates {
            self.emit(SessionEvent::Transcript(update));
        }
    }

    fn apply_playback(&self, signal: PlaybackSignal) {
        match signal {
            PlaybackSignal::AudioDelta => self.set_speaking(true),
            PlaybackSignal::AudioDone | PlaybackSignal::ResponseDone => self.set_speaking(false),
        }
    }

    fn set_speaking(&self, speaking: bool) {
        if self.assistant.set_speaking(speaking) {
            self.emit(SessionEvent::AssistantSpeaking(speaking));
        }
    }
}

/// Drains transport events for one connection.
async fn pump(
    inner: Weak<Inner>,
    epoch: u64,
    mut events: TransportEvents,
    event_channel: Arc<EventChannel>,
    tools: ToolInvoker,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = inner.upgrade() else {
            break;
        };
        session.dispatch(epoch, &event_channel, &tools, event);
    }
    debug!(epoch, "transport event pump finished");
}

/// Schedules a teardown for connection `epoch` after `delay`.
fn request_shutdown(inner: Weak<Inner>, epoch: u64, reason: DisconnectReason, delay: Duration) {
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(inner) = inner.upgrade() {
            inner.shutdown(reason, Some(epoch)).await;
        }
    });
}

struct SessionToolHost {
    inner: Weak<Inner>,
    epoch: u64,
}

impl ToolHost for SessionToolHost {
    fn host_message(&self, message: HostMessage) {
        if let Some(inner) = self.inner.upgrade() {
            inner.emit(SessionEvent::Host(message));
        }
    }

    fn request_disconnect(&self, delay: Duration) {
        info!(epoch = self.epoch, delay_ms = delay.as_millis() as u64, "tool requested disconnect");
        request_shutdown(
            self.inner.clone(),
            self.epoch,
            DisconnectReason::ToolRequested,
            delay,
        );
    }

    fn tool_resolved(&self, call: ToolCall) {
        if let Some(inner) = self.inner.upgrade() {
            inner.emit(SessionEvent::ToolCallResolved(call));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graceful_reasons() {
        assert!(DisconnectReason::InactivityTimeout.is_graceful());
        assert!(DisconnectReason::HostClosing.is_graceful());
        assert!(!DisconnectReason::User.is_graceful());
        assert!(!DisconnectReason::TransportLost.is_graceful());
        assert!(!DisconnectReason::ToolRequested.is_graceful());
    }

    #[test]
    fn state_wire_names() {
        assert_eq!(
            serde_json::to_value(SessionState::Disconnecting).unwrap(),
            "disconnecting"
        );
        assert_eq!(
            serde_json::to_value(DisconnectReason::InactivityTimeout).unwrap(),
            "inactivity_timeout"
        );
    }
}
