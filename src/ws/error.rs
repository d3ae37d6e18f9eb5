#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use super::types::TransportError;

/// Socket connection error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// The transport handle could not be created, e.g. the address is malformed
    Construction(String),
    /// The transport did not open within the configured connect timeout
    ConnectTimeout(Duration),
    /// The underlying transport reported an error while connecting
    Transport(TransportError),
    /// A send was attempted while the transport is not open
    NotConnected,
    /// The connection attempt was abandoned, or the manager is gone
    ConnectionClosed,
    /// Event stream lagged and missed events
    Lagged {
        /// Number of events that were missed
        count: u64,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Construction(reason) => write!(f, "unable to create transport: {reason}"),
            Self::ConnectTimeout(after) => write!(f, "connection timed out after {after:?}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::NotConnected => write!(f, "socket is not connected"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Lagged { count } => write!(f, "event stream lagged, missed {count} events"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}
