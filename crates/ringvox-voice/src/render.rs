//! The visualization loop.
//!
//! While connected, a cooperative task samples the audio analysers on every
//! tick and publishes a [`VisualFrame`] on a watch channel. Drawing is left to
//! the host. The loop must be stopped, and awaited, before the analysers it
//! reads are torn down.

use crate::activity::ActivityClock;
use crate::level::{LevelMeter, Smoother};
use crate::media::MicHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Smoothed assistant level above which the assistant looks like it speaks.
pub const SPEAKING_LEVEL: f32 = 0.015;

/// How long the speaking look persists after the last assistant audio event.
pub const SPEAKING_HOLD: Duration = Duration::from_millis(1_200);

/// One tick of visualization state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VisualFrame {
    pub mic_level: f32,
    pub assistant_level: f32,
    pub assistant_speaking: bool,
    pub muted: bool,
}

/// Assistant playback state driven by realtime audio events.
#[derive(Debug, Default)]
pub struct AssistantActivity {
    speaking: AtomicBool,
    last_event: Mutex<Option<Instant>>,
}

impl AssistantActivity {
    fn stamp(&self) {
        let now = Instant::now();
        match self.last_event.lock() {
            Ok(mut last) => *last = Some(now),
            Err(poisoned) => *poisoned.into_inner() = Some(now),
        }
    }

    /// Sets the speaking flag and stamps the event time. Returns whether the
    /// flag changed.
    pub fn set_speaking(&self, speaking: bool) -> bool {
        self.stamp();
        self.speaking.swap(speaking, Ordering::SeqCst) != speaking
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Whether an assistant audio event happened within [`SPEAKING_HOLD`].
    pub fn within_hold(&self, now: Instant) -> bool {
        let last = match self.last_event.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        };
        last.is_some_and(|at| now.saturating_duration_since(at) < SPEAKING_HOLD)
    }

    pub fn clear(&self) {
        self.speaking.store(false, Ordering::SeqCst);
        match self.last_event.lock() {
            Ok(mut last) => *last = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

/// Everything the loop reads.
#[derive(Debug, Clone)]
pub struct RenderInputs {
    pub mic_level: Arc<LevelMeter>,
    pub assistant_level: Arc<LevelMeter>,
    pub assistant: Arc<AssistantActivity>,
    pub mic: Arc<MicHandle>,
    pub activity: Arc<ActivityClock>,
    /// Raw mic level that counts as user activity.
    pub mic_activity_threshold: f32,
}

#[derive(Debug, Default)]
struct RenderState {
    mic: Smoother,
    assistant: Smoother,
}

impl RenderState {
    fn tick(&mut self, inputs: &RenderInputs, now: Instant) -> VisualFrame {
        let raw_mic = inputs.mic_level.get();
        if raw_mic > inputs.mic_activity_threshold {
            inputs.activity.touch();
        }
        let mic_level = self.mic.update(raw_mic);
        let assistant_level = self.assistant.update(inputs.assistant_level.get());
        VisualFrame {
            mic_level,
            assistant_level,
            assistant_speaking: inputs.assistant.is_speaking()
                || assistant_level > SPEAKING_LEVEL
                || inputs.assistant.within_hold(now),
            muted: inputs.mic.is_muted(),
        }
    }
}

/// Handle on a running render loop.
#[derive(Debug)]
pub struct RenderLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RenderLoop {
    pub fn spawn(
        inputs: RenderInputs,
        interval: Duration,
        frames: watch::Sender<VisualFrame>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut state = RenderState::default();
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = state.tick(&inputs, Instant::now());
                        frames.send_replace(frame);
                    }
                }
            }
            frames.send_replace(VisualFrame::default());
            debug!("render loop stopped");
        });
        Self { cancel, handle }
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.handle).await {
            debug!(error = %e, "render loop ended abnormally");
        }
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
