//! Microphone capture.
//!
//! A [`MediaDevices`] backend turns an acquire request into a [`MicHandle`]
//! that owns one or more [`LocalAudioTrack`]s. Capture backends push frames
//! through a [`TrackWriter`]; the transport and the level analyser subscribe
//! to the track. Muting disables the tracks, which then carry silence, so the
//! transport never has to renegotiate.

#[cfg(feature = "cpal")]
pub mod platform;

use crate::error::VoiceError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Frames buffered per track subscriber before the slowest one lags.
const TRACK_FRAME_CAPACITY: usize = 64;

/// Capture processing the platform must apply. The session always requests
/// all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A block of mono samples in `-1.0..=1.0`.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

/// Source of microphone handles. Each `acquire` call may show a permission
/// prompt exactly once.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: AudioConstraints) -> Result<MicHandle, VoiceError>;
}

/// A running capture owned by a [`MicHandle`]; stopping it releases the
/// device.
pub trait CaptureStream: Send + Sync {
    fn stop(&self);
}

#[derive(Debug)]
struct TrackState {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    frames: broadcast::Sender<AudioFrame>,
}

/// A local audio track fed by a capture backend.
#[derive(Debug, Clone)]
pub struct LocalAudioTrack {
    state: Arc<TrackState>,
}

impl LocalAudioTrack {
    pub fn new(id: impl Into<String>) -> Self {
        let (frames, _) = broadcast::channel(TRACK_FRAME_CAPACITY);
        Self {
            state: Arc::new(TrackState {
                id: id.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                frames,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Ends the track. Writers stop publishing immediately.
    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.state.frames.subscribe()
    }

    /// A handle for the capture side of the track.
    pub fn writer(&self) -> TrackWriter {
        TrackWriter {
            state: Arc::clone(&self.state),
        }
    }
}

/// Producer end of a [`LocalAudioTrack`].
#[derive(Debug, Clone)]
pub struct TrackWriter {
    state: Arc<TrackState>,
}

impl TrackWriter {
    /// Publishes one block of samples. A disabled track publishes silence of
    /// the same length; a stopped track drops the block. Returns `false`
    /// once the track is stopped.
    pub fn push(&self, samples: &[f32], sample_rate: u32) -> bool {
        if self.state.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let samples: Arc<[f32]> = if self.state.enabled.load(Ordering::SeqCst) {
            Arc::from(samples)
        } else {
            Arc::from(vec![0.0; samples.len()])
        };
        // No subscribers is fine: nothing is listening yet.
        let _ = self.state.frames.send(AudioFrame {
            samples,
            sample_rate,
        });
        true
    }
}

/// Exclusive handle on an acquired microphone.
pub struct MicHandle {
    tracks: Vec<LocalAudioTrack>,
    capture: Mutex<Option<Box<dyn CaptureStream>>>,
    muted: AtomicBool,
    released: AtomicBool,
}

impl std::fmt::Debug for MicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicHandle")
            .field("tracks", &self.tracks)
            .field("muted", &self.is_muted())
            .field("released", &self.is_released())
            .finish()
    }
}

impl MicHandle {
    pub fn new(tracks: Vec<LocalAudioTrack>, capture: Option<Box<dyn CaptureStream>>) -> Self {
        Self {
            tracks,
            capture: Mutex::new(capture),
            muted: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn tracks(&self) -> &[LocalAudioTrack] {
        &self.tracks
    }

    /// Toggles the enabled state of every track.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        for track in &self.tracks {
            track.set_enabled(!muted);
        }
        debug!(muted, "microphone mute changed");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stops every track and the capture stream. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        let capture = match self.capture.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(capture) = capture {
            capture.stop();
        }
        info!(tracks = self.tracks.len(), "microphone released");
    }
}

impl Drop for MicHandle {
    fn drop(&mut self) {
        self.release();
    }
}
