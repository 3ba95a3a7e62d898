//! Audio level analysis.
//!
//! Levels are the mean absolute amplitude of a block of samples, in `0.0..=1.0`.
//! Producers store the latest raw level in a [`LevelMeter`]; the render loop
//! smooths it per tick with a [`Smoother`].

use crate::media::MicHandle;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

/// Weight of the previous value in the exponential moving average.
pub const SMOOTHING: f32 = 0.85;

/// Mean absolute amplitude of `samples`; `0.0` for an empty block.
pub fn mean_abs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s.abs()).sum();
    (sum / samples.len() as f32).min(1.0)
}

/// Lock-free holder of the most recent raw level.
#[derive(Debug, Default)]
pub struct LevelMeter {
    bits: AtomicU32,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, level: f32) {
        self.bits.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Computes and stores the level of `samples`, returning it.
    pub fn observe(&self, samples: &[f32]) -> f32 {
        let level = mean_abs(samples);
        self.set(level);
        level
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Exponential moving average with weight [`SMOOTHING`] on the past.
#[derive(Debug, Clone, Copy, Default)]
pub struct Smoother {
    value: f32,
}

impl Smoother {
    pub fn update(&mut self, raw: f32) -> f32 {
        self.value = self.value * SMOOTHING + raw * (1.0 - SMOOTHING);
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// The audio processing context of a connected session: one meter fed from
/// the local microphone track and one fed by the transport's remote track.
#[derive(Debug)]
pub struct AudioAnalysis {
    pub mic: Arc<LevelMeter>,
    pub remote: Arc<LevelMeter>,
    feed: Option<JoinHandle<()>>,
}

impl AudioAnalysis {
    /// Starts analysing the first track of `mic`.
    pub fn start(mic: &MicHandle) -> Self {
        let meter = Arc::new(LevelMeter::new());
        let feed = mic.tracks().first().map(|track| {
            let mut frames = track.subscribe();
            let meter = Arc::clone(&meter);
            tokio::spawn(async move {
                loop {
                    match frames.recv().await {
                        Ok(frame) => {
                            meter.observe(&frame.samples);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "mic analyser lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        });
        Self {
            mic: meter,
            remote: Arc::new(LevelMeter::new()),
            feed,
        }
    }

    /// Stops the analyser feed. Levels read afterwards stay at their last value.
    pub async fn close(mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
            let _ = feed.await;
        }
    }
}

impl Drop for AudioAnalysis {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_abs_of_silence_and_signal() {
        assert_eq!(mean_abs(&[]), 0.0);
        assert_eq!(mean_abs(&[0.0; 64]), 0.0);
        let level = mean_abs(&[0.5, -0.5, 0.25, -0.25]);
        assert!((level - 0.375).abs() < 1e-6);
    }

    #[test]
    fn smoother_converges() {
        let mut smoother = Smoother::default();
        let first = smoother.update(1.0);
        assert!((first - 0.15).abs() < 1e-6);
        for _ in 0..100 {
            smoother.update(1.0);
        }
        assert!(smoother.value() > 0.99);
    }

    #[test]
    fn meter_stores_latest() {
        let meter = LevelMeter::new();
        assert_eq!(meter.get(), 0.0);
        meter.observe(&[0.2, -0.2]);
        assert!((meter.get() - 0.2).abs() < 1e-6);
    }
}
