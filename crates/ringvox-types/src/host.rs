//! Messages exchanged between an embedded voice widget and its host.
//!
//! In a browser these travel over `postMessage`; the terminal client carries
//! them as JSON lines on stdin/stdout. The shapes are identical.

use serde::{Deserialize, Serialize};

/// A message from the widget to its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// A tool call changed records in `collection`; the host should refresh.
    DataChanged { collection: String },
    /// Open `url` in a new browsing context.
    OpenUrl { url: String },
    /// Navigate the host application to `module`.
    OpenModule { module: String },
}

/// A message from the host to the widget.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostInbound {
    /// The host is closing the widget; tear the session down gracefully.
    WidgetClosing,
    /// Any other message type. Hosts may broadcast unrelated messages.
    #[serde(other)]
    Other,
}
