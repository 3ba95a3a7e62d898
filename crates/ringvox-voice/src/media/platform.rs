//! Capture and playback through the platform audio host.
//!
//! `cpal::Stream` is not `Send`, so each stream lives on its own thread and is
//! dropped there when the owning handle asks it to stop.

use super::{
    AudioConstraints, AudioFrame, CaptureStream, LocalAudioTrack, MediaDevices, MicHandle,
    TrackWriter,
};
use crate::error::VoiceError;
use crate::g711::resample_linear;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Upper bound on buffered playback audio, in seconds.
const MAX_PLAYBACK_SECONDS: usize = 5;

/// Microphone capture on the default (or pattern-matched) input device.
#[derive(Debug, Clone, Default)]
pub struct CpalDevices {
    /// Case-insensitive substring of the input device name. Falls back to the
    /// default input device when nothing matches.
    pub device_pattern: Option<String>,
}

impl CpalDevices {
    pub fn new(device_pattern: Option<String>) -> Self {
        Self { device_pattern }
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire(&self, constraints: AudioConstraints) -> Result<MicHandle, VoiceError> {
        // The OS audio stack applies its own processing; cpal has no knobs.
        debug!(?constraints, "acquiring cpal input device");

        let track = LocalAudioTrack::new("cpal-mic");
        let writer = track.writer();
        let pattern = self.device_pattern.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("ringvox-capture".into())
            .spawn(move || match start_capture(pattern.as_deref(), writer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until the handle stops or is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("capture thread finished");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| VoiceError::Media(format!("failed to spawn capture thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| VoiceError::Media("capture thread exited unexpectedly".into()))??;

        Ok(MicHandle::new(
            vec![track],
            Some(Box::new(CpalCapture {
                stop: Mutex::new(Some(stop_tx)),
            })),
        ))
    }
}

struct CpalCapture {
    stop: Mutex<Option<mpsc::Sender<()>>>,
}

impl CaptureStream for CpalCapture {
    fn stop(&self) {
        let sender = match self.stop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

fn classify_stream_error(context: &str, message: String) -> VoiceError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        VoiceError::PermissionDenied(format!("{context}: {message}"))
    } else {
        VoiceError::Media(format!("{context}: {message}"))
    }
}

fn resolve_input_device(pattern: Option<&str>) -> Result<Device, VoiceError> {
    let host = cpal::default_host();
    if let Some(pattern) = pattern.filter(|p| !p.trim().is_empty()) {
        let pat = pattern.to_lowercase();
        let matched = host
            .input_devices()
            .map_err(|e| classify_stream_error("failed to enumerate input devices", e.to_string()))?
            .find(|d| {
                d.name()
                    .map(|n| n.to_lowercase().contains(&pat))
                    .unwrap_or(false)
            });
        if let Some(device) = matched {
            return Ok(device);
        }
        warn!(pattern, "no input device matches pattern, using default");
    }
    host.default_input_device()
        .ok_or_else(|| VoiceError::Media("no input device available".into()))
}

fn downmix_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = usize::from(channels);
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

fn start_capture(pattern: Option<&str>, writer: TrackWriter) -> Result<cpal::Stream, VoiceError> {
    let device = resolve_input_device(pattern)?;
    let supported = device
        .default_input_config()
        .map_err(|e| classify_stream_error("no usable input config", e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;
    let channels = config.channels;

    let name = device.name().unwrap_or_else(|_| "<unknown>".into());
    info!(
        device = %name,
        rate,
        channels,
        ?sample_format,
        "starting microphone capture"
    );

    let on_error = |err: cpal::StreamError| error!(error = %err, "audio capture error");
    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                writer.push(&downmix_to_mono(data, channels), rate);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|s| f32::from(*s) / 32_768.0).collect();
                writer.push(&downmix_to_mono(&floats, channels), rate);
            },
            on_error,
            None,
        ),
        other => {
            return Err(VoiceError::Media(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(|e| classify_stream_error("failed to open input stream", e.to_string()))?;

    stream
        .play()
        .map_err(|e| classify_stream_error("failed to start input stream", e.to_string()))?;
    Ok(stream)
}

/// Plays remote audio frames on the default output device until dropped.
pub struct CpalPlayback {
    stop: Option<mpsc::Sender<()>>,
    forward: tokio::task::JoinHandle<()>,
}

impl CpalPlayback {
    /// Starts playback of `frames`. Must be called inside a tokio runtime.
    pub fn start(mut frames: broadcast::Receiver<AudioFrame>) -> Result<Self, VoiceError> {
        let buffer = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, VoiceError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let sink = Arc::clone(&buffer);
        std::thread::Builder::new()
            .name("ringvox-playback".into())
            .spawn(move || match start_output(sink) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| VoiceError::Media(format!("failed to spawn playback thread: {e}")))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| VoiceError::Media("playback thread exited unexpectedly".into()))??;

        let forward = tokio::spawn(async move {
            let cap = device_rate as usize * MAX_PLAYBACK_SECONDS;
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        let samples = resample_linear(&frame.samples, frame.sample_rate, device_rate);
                        let mut queue = match buffer.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        queue.extend(samples);
                        let excess = queue.len().saturating_sub(cap);
                        queue.drain(..excess);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "playback lagged behind remote audio");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self {
            stop: Some(stop_tx),
            forward,
        })
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.forward.abort();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn start_output(buffer: Arc<Mutex<VecDeque<f32>>>) -> Result<(cpal::Stream, u32), VoiceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::Media("no output device available".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::Media(format!("no usable output config: {e}")))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(VoiceError::Media(format!(
            "unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = match buffer.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| error!(error = %err, "audio playback error"),
            None,
        )
        .map_err(|e| VoiceError::Media(format!("failed to open output stream: {e}")))?;
    stream
        .play()
        .map_err(|e| VoiceError::Media(format!("failed to start output stream: {e}")))?;
    Ok((stream, rate))
}
