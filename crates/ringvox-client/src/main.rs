//! ringvox terminal client: a voice session driven from stdin.
//!
//! Starts structured logging, builds a session from configuration and relays
//! between stdin/stdout and the session until stdin closes or the process
//! receives SIGINT/SIGTERM.

use ringvox_client::config::{self, Config};
use ringvox_client::host::{parse_command, Command, TerminalHost};
use ringvox_voice::{MediaDevices, SessionEvent, VoiceSession, WebRtcPeerFactory};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("RINGVOX_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[cfg(feature = "cpal")]
fn media_devices(config: &Config) -> Arc<dyn MediaDevices> {
    Arc::new(ringvox_voice::media::platform::CpalDevices::new(
        config.audio.input_device.clone(),
    ))
}

#[cfg(not(feature = "cpal"))]
fn media_devices(_config: &Config) -> Arc<dyn MediaDevices> {
    Arc::new(NoCapture)
}

/// Stands in for a microphone when the client is built without audio
/// support.
#[cfg(not(feature = "cpal"))]
struct NoCapture;

#[cfg(not(feature = "cpal"))]
#[async_trait::async_trait]
impl MediaDevices for NoCapture {
    async fn acquire(
        &self,
        _constraints: ringvox_voice::AudioConstraints,
    ) -> Result<ringvox_voice::MicHandle, ringvox_voice::VoiceError> {
        Err(ringvox_voice::VoiceError::Media(
            "no capture backend; rebuild with the `cpal` feature".into(),
        ))
    }
}

#[cfg(feature = "cpal")]
fn start_playback(config: &Config, session: &VoiceSession) -> Option<ringvox_voice::media::platform::CpalPlayback> {
    if !config.audio.playback {
        return None;
    }
    match ringvox_voice::media::platform::CpalPlayback::start(session.remote_audio()) {
        Ok(playback) => Some(playback),
        Err(e) => {
            tracing::warn!(error = %e, "assistant audio playback unavailable");
            None
        }
    }
}

#[cfg(not(feature = "cpal"))]
fn start_playback(config: &Config, _session: &VoiceSession) -> Option<()> {
    if config.audio.playback {
        tracing::info!("built without the `cpal` feature, assistant audio is not played");
    }
    None
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("ringvox.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; fix or remove the config file");

    // Logs go to stderr; stdout carries the transcript and host messages.
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let session = VoiceSession::new(
        config.voice.clone(),
        media_devices(&config),
        Arc::new(WebRtcPeerFactory),
    )
    .expect("failed to create voice session; check the [backend] and [realtime] sections");
    let _playback = start_playback(&config, &session);

    let printer = tokio::spawn(print_events(session.subscribe(), config.host.clone()));

    tracing::info!(session_id = %session.id(), "ringvox client ready");
    println!("* idle (c to connect)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&session, &line).await,
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    break;
                }
            },
        }
    }

    session.disconnect().await;
    printer.abort();
    tracing::info!("ringvox client shut down");
}

async fn handle_line(session: &VoiceSession, line: &str) {
    session.record_user_activity();
    let Some(command) = parse_command(line) else {
        return;
    };
    match command {
        Command::Connect => {
            // Connect runs in the background so a disconnect can cancel it.
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.connect().await {
                    tracing::debug!(error = %e, "connect did not complete");
                }
            });
        }
        Command::Disconnect => session.disconnect().await,
        Command::ToggleMute => {
            if session.toggle_mute().is_none() {
                println!("* not connected");
            }
        }
        Command::Host(message) => session.handle_host_message(message).await,
        Command::Unknown(input) => {
            tracing::debug!(%input, "unrecognized input");
            println!("* commands: c connect, d disconnect, m mute, or a JSON host message");
        }
    }
}

async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    host_config: ringvox_client::config::HostConfig,
) {
    let mut host = TerminalHost::new(std::io::stdout(), host_config);
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = host.handle_event(&event) {
                    tracing::warn!(error = %e, "failed to write to stdout");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "terminal fell behind session events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, disconnecting"); }
        () = terminate => { tracing::info!("received SIGTERM, disconnecting"); }
    }
}
