//! Values that flow between the transport, the manager and its listeners.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Close code sent for a normal, caller-initiated closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when a close frame carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// The fixed set of events a [`ConnectionManager`](super::ConnectionManager) dispatches.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Open,
    Close,
    Error,
    Message,
    Reconnect,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        Self::Open,
        Self::Close,
        Self::Error,
        Self::Message,
        Self::Reconnect,
    ];
}

/// A message body, passed through untouched. Parsing is up to the caller.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

/// Error notification raised by a transport, kept verbatim for context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    detail: String,
}

impl TransportError {
    pub fn new<S: Into<String>>(detail: S) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl StdError for TransportError {}

/// Event dispatched to listeners and event subscribers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The transport opened
    Open,
    /// The transport closed
    Close {
        /// Close code reported by the transport
        code: u16,
        /// Close reason reported by the transport
        reason: String,
    },
    /// The transport reported an error
    Error(TransportError),
    /// A message arrived
    Message(Payload),
    /// A reconnection attempt has been scheduled
    Reconnect {
        /// Attempt number, starting at 1 after the last successful open
        attempts: u32,
    },
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Close { .. } => EventKind::Close,
            Self::Error(_) => EventKind::Error,
            Self::Message(_) => EventKind::Message,
            Self::Reconnect { .. } => EventKind::Reconnect,
        }
    }
}

/// Readiness of a transport handle.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}
