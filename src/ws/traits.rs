//! Seams between the connection manager and the raw socket transport.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::types::{Payload, ReadyState, TransportError};
use crate::Result;

/// Notification raised by a transport handle.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Payload),
    Close { code: u16, reason: String },
    Error(TransportError),
}

/// A notification tagged with the handle that produced it.
#[derive(Debug)]
pub(crate) struct Notification {
    pub(crate) generation: u64,
    pub(crate) event: TransportEvent,
}

/// Channel a transport handle reports its notifications through.
///
/// Each handle gets its own [`Notifier`]; once the manager has moved on to a newer
/// handle, notifications from older ones are discarded.
#[derive(Debug, Clone)]
pub struct Notifier {
    generation: u64,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { generation, tx }
    }

    pub fn open(&self) {
        self.notify(TransportEvent::Open);
    }

    pub fn message(&self, payload: Payload) {
        self.notify(TransportEvent::Message(payload));
    }

    pub fn close<S: Into<String>>(&self, code: u16, reason: S) {
        self.notify(TransportEvent::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn error(&self, error: TransportError) {
        self.notify(TransportEvent::Error(error));
    }

    pub fn notify(&self, event: TransportEvent) {
        // The manager may already be gone, in which case nobody is listening.
        _ = self.tx.send(Notification {
            generation: self.generation,
            event,
        });
    }
}

/// A live transport handle.
///
/// Handles are never reused: the manager creates a fresh one for every connect attempt.
pub trait Link: Send + Sync + 'static {
    /// Current readiness of the handle.
    fn ready_state(&self) -> ReadyState;

    /// Hand a payload to the transport. Only called while [`ReadyState::Open`].
    fn send(&self, payload: Payload) -> Result<()>;

    /// Request the transport to close. Must be a no-op once closing or closed.
    fn close(&self, code: Option<u16>, reason: Option<&str>);
}

/// Factory for transport handles.
///
/// # Example
///
/// ```ignore
/// impl Transport for MyTransport {
///     fn open(&self, endpoint: &str, notifier: Notifier) -> Result<Arc<dyn Link>> {
///         let link = MyLink::dial(endpoint)?;
///         link.on_open(move || notifier.open());
///         Ok(Arc::new(link))
///     }
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Create a handle bound to `endpoint`, starting in [`ReadyState::Connecting`].
    ///
    /// An error here means no handle exists at all (e.g. a malformed address); every
    /// later failure is reported through `notifier` instead.
    fn open(&self, endpoint: &str, notifier: Notifier) -> Result<Arc<dyn Link>>;
}
