#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilient_socket::Result;
use resilient_socket::ws::{
    ConnectionManager, Event, EventKind, Link, Notifier, Options, Payload, ReadyState, Transport,
    TransportError, WsError, listener,
};

pub const ENDPOINT: &str = "ws://mock.invalid/socket";

/// Transport whose handles are driven by the test.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    handles: Vec<Arc<MockLink>>,
    reject: Option<String>,
    defer_close: bool,
}

impl MockTransport {
    /// Make every following construction fail with `reason`.
    pub fn reject(&self, reason: &str) {
        self.inner.lock().unwrap().reject = Some(reason.to_owned());
    }

    /// Report requested closes only when the test calls [`MockLink::finish_close`],
    /// the way a real socket waits for the peer.
    pub fn defer_closes(&self) {
        self.inner.lock().unwrap().defer_close = true;
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().handles.len()
    }

    pub fn handle(&self, index: usize) -> Arc<MockLink> {
        Arc::clone(&self.inner.lock().unwrap().handles[index])
    }

    pub fn last(&self) -> Arc<MockLink> {
        Arc::clone(self.inner.lock().unwrap().handles.last().unwrap())
    }
}

impl Transport for MockTransport {
    fn open(&self, endpoint: &str, notifier: Notifier) -> Result<Arc<dyn Link>> {
        let mut state = self.inner.lock().unwrap();
        if let Some(reason) = &state.reject {
            return Err(WsError::Construction(reason.clone()).into());
        }

        let link = Arc::new(MockLink {
            endpoint: endpoint.to_owned(),
            notifier,
            defer_close: state.defer_close,
            ready: Mutex::new(ReadyState::Connecting),
            sent: Mutex::new(Vec::new()),
            close_requests: Mutex::new(Vec::new()),
        });
        state.handles.push(Arc::clone(&link));
        Ok(link)
    }
}

/// A scripted transport handle. A requested close is reported back immediately unless
/// closes are deferred.
pub struct MockLink {
    pub endpoint: String,
    notifier: Notifier,
    defer_close: bool,
    ready: Mutex<ReadyState>,
    sent: Mutex<Vec<Payload>>,
    close_requests: Mutex<Vec<(Option<u16>, Option<String>)>>,
}

impl MockLink {
    pub fn open(&self) {
        *self.ready.lock().unwrap() = ReadyState::Open;
        self.notifier.open();
    }

    pub fn message(&self, text: &str) {
        self.notifier.message(Payload::Text(text.to_owned()));
    }

    pub fn error(&self, detail: &str) {
        self.notifier.error(TransportError::new(detail));
    }

    /// Simulate the transport closing on its own.
    pub fn drop_connection(&self, code: u16) {
        *self.ready.lock().unwrap() = ReadyState::Closed;
        self.notifier.close(code, "");
    }

    /// Complete a deferred close with the requested code.
    pub fn finish_close(&self) {
        *self.ready.lock().unwrap() = ReadyState::Closed;
        let (code, reason) = self
            .close_requests()
            .pop()
            .unwrap_or((None, None));
        self.notifier
            .close(code.unwrap_or(1005), reason.unwrap_or_default());
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_requests(&self) -> Vec<(Option<u16>, Option<String>)> {
        self.close_requests.lock().unwrap().clone()
    }
}

impl Link for MockLink {
    fn ready_state(&self) -> ReadyState {
        *self.ready.lock().unwrap()
    }

    fn send(&self, payload: Payload) -> Result<()> {
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let mut ready = self.ready.lock().unwrap();
        if matches!(*ready, ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        *ready = if self.defer_close {
            ReadyState::Closing
        } else {
            ReadyState::Closed
        };
        drop(ready);

        self.close_requests
            .lock()
            .unwrap()
            .push((code, reason.map(ToOwned::to_owned)));
        if self.defer_close {
            return;
        }
        self.notifier
            .close(code.unwrap_or(1005), reason.unwrap_or_default());
    }
}

pub fn manager(options: Options) -> (ConnectionManager, MockTransport) {
    let transport = MockTransport::default();
    let manager = ConnectionManager::with_transport(ENDPOINT.to_owned(), options, transport.clone());
    (manager, transport)
}

/// Collect every event of `kind` the manager dispatches.
pub fn record(manager: &ConnectionManager, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on(
        kind,
        listener(move |event: &Event| sink.lock().unwrap().push(event.clone())),
    );
    seen
}

/// Let the manager task drain everything that is ready, without moving the clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(millis: u64) {
    tokio::time::advance(Duration::from_millis(millis)).await;
    settle().await;
}

pub fn ws_error(error: &resilient_socket::error::Error) -> &WsError {
    error
        .downcast_ref::<WsError>()
        .expect("error should wrap a WsError")
}
