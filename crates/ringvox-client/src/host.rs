//! The terminal stand-in for the widget's embedding page.
//!
//! Input lines are commands or inbound host messages; session events are
//! printed as transcript lines, notices and outbound host messages.

use crate::config::HostConfig;
use ringvox_types::{HostInbound, HostMessage, Speaker};
use ringvox_voice::{SessionEvent, SessionState, TranscriptUpdate};
use std::io::{self, Write};

const ESC: &str = "\u{1b}";

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    ToggleMute,
    Host(HostInbound),
    Unknown(String),
}

/// Parses an input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        return Some(match serde_json::from_str::<HostInbound>(trimmed) {
            Ok(message) => Command::Host(message),
            Err(_) => Command::Unknown(trimmed.to_string()),
        });
    }
    Some(match trimmed {
        "c" | "connect" => Command::Connect,
        "d" | "q" | "disconnect" | "quit" | ESC => Command::Disconnect,
        "m" | "mute" => Command::ToggleMute,
        other => Command::Unknown(other.to_string()),
    })
}

/// Opens URLs for `open_url` host messages.
pub type Opener = Box<dyn Fn(&str) -> io::Result<()> + Send>;

/// Writes session events to a terminal.
pub struct TerminalHost<W> {
    out: W,
    config: HostConfig,
    opener: Opener,
}

impl<W: Write> TerminalHost<W> {
    pub fn new(out: W, config: HostConfig) -> Self {
        Self::with_opener(out, config, Box::new(|url: &str| open::that(url)))
    }

    pub fn with_opener(out: W, config: HostConfig, opener: Opener) -> Self {
        Self {
            out,
            config,
            opener,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn handle_event(&mut self, event: &SessionEvent) -> io::Result<()> {
        match event {
            SessionEvent::StateChanged(state) => {
                let label = match state {
                    SessionState::Idle => "idle (c to connect)",
                    SessionState::Connecting => "connecting...",
                    SessionState::Connected => "connected (d to disconnect, m to mute)",
                    SessionState::Disconnecting => "disconnecting...",
                };
                writeln!(self.out, "* {label}")
            }
            SessionEvent::Transcript(TranscriptUpdate::Finalized { message }) => {
                if message.text.is_empty() {
                    return Ok(());
                }
                let who = match message.speaker {
                    Speaker::User => "you",
                    Speaker::Assistant => "assistant",
                };
                writeln!(self.out, "{who}: {}", message.text)
            }
            SessionEvent::Transcript(_) => Ok(()),
            SessionEvent::MuteChanged(muted) => {
                writeln!(self.out, "* {}", if *muted { "muted" } else { "unmuted" })
            }
            SessionEvent::Notice { message, .. } => writeln!(self.out, "! {message}"),
            SessionEvent::Host(message) => self.host_message(message),
            SessionEvent::AssistantSpeaking(_) | SessionEvent::ToolCallResolved(_) => Ok(()),
        }
    }

    fn host_message(&mut self, message: &HostMessage) -> io::Result<()> {
        if self.config.stdio_json {
            let line = serde_json::to_string(message).map_err(io::Error::other)?;
            writeln!(self.out, "{line}")?;
        }
        if let HostMessage::OpenUrl { url } = message {
            if self.config.open_urls {
                if let Err(e) = (self.opener)(url) {
                    tracing::warn!(%url, error = %e, "failed to open url");
                }
            }
        }
        Ok(())
    }
}
