//! Terminal host for ringvox voice sessions.
//!
//! Plays the part of the page embedding the voice widget: it reads commands
//! and host messages from stdin and prints the transcript, notices and
//! outbound host messages.

pub mod config;
pub mod host;

pub use config::{load_config, Config, ConfigError};
pub use host::{parse_command, Command, TerminalHost};
