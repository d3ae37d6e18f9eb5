//! Transport backed by `tokio-tungstenite`.

use std::fmt::Display;
use std::sync::Arc;

use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::error::WsError;
use super::traits::{Link, Notifier, Transport};
use super::types::{
    ABNORMAL_CLOSURE, NO_STATUS_RECEIVED, NORMAL_CLOSURE, Payload, ReadyState, TransportError,
};
use crate::Result;

enum Outgoing {
    Payload(Payload),
    Close { code: u16, reason: String },
}

impl From<Payload> for Message {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(data) => Message::Binary(data.into()),
        }
    }
}

/// Dials `ws://` and `wss://` endpoints with [`connect_async`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn open(&self, endpoint: &str, notifier: Notifier) -> Result<Arc<dyn Link>> {
        let url = Url::parse(endpoint).map_err(|e| WsError::Construction(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WsError::Construction(format!(
                "unsupported scheme `{}`, expected `ws` or `wss`",
                url.scheme()
            ))
            .into());
        }

        let state = Arc::new(watch::channel(ReadyState::Connecting).0);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(url, notifier, Arc::clone(&state), outgoing_rx));

        Ok(Arc::new(TungsteniteLink {
            state,
            outgoing: outgoing_tx,
        }))
    }
}

struct TungsteniteLink {
    state: Arc<watch::Sender<ReadyState>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Link for TungsteniteLink {
    fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    fn send(&self, payload: Payload) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(WsError::NotConnected.into());
        }
        self.outgoing
            .send(Outgoing::Payload(payload))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let requested = self.state.send_if_modified(|state| {
            let active = matches!(state, ReadyState::Connecting | ReadyState::Open);
            if active {
                *state = ReadyState::Closing;
            }
            active
        });

        if requested {
            _ = self.outgoing.send(Outgoing::Close {
                code: code.unwrap_or(NORMAL_CLOSURE),
                reason: reason.unwrap_or_default().to_owned(),
            });
        }
    }
}

/// Mark the handle closed and report it, as the final notification of the handle.
fn finish(state: &watch::Sender<ReadyState>, notifier: &Notifier, code: u16, reason: String) {
    state.send_replace(ReadyState::Closed);
    notifier.close(code, reason);
}

/// Report an error followed by an abnormal close, as browsers do.
fn fail<E: Display>(state: &watch::Sender<ReadyState>, notifier: &Notifier, error: &E) {
    state.send_replace(ReadyState::Closed);
    notifier.error(TransportError::new(error.to_string()));
    notifier.close(ABNORMAL_CLOSURE, String::new());
}

/// Runs one socket from handshake to close, reporting through `notifier`.
async fn drive(
    url: Url,
    notifier: Notifier,
    state: Arc<watch::Sender<ReadyState>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    let handshake = connect_async(url.as_str());
    tokio::pin!(handshake);

    let ws_stream = tokio::select! {
        result = &mut handshake => match result {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%url, "Unable to connect: {e}");
                fail(&state, &notifier, &e);
                return;
            }
        },
        // Closed, or the handle was dropped, before the handshake finished
        _ = outgoing.recv() => {
            finish(&state, &notifier, ABNORMAL_CLOSURE, String::new());
            return;
        }
    };

    let opened = state.send_if_modified(|state| {
        let connecting = *state == ReadyState::Connecting;
        if connecting {
            *state = ReadyState::Open;
        }
        connecting
    });
    if opened {
        notifier.open();
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(text = text.as_str(), "Received text message");
                    notifier.message(Payload::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => {
                    notifier.message(Payload::Binary(data.to_vec()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or_else(
                        || (NO_STATUS_RECEIVED, String::new()),
                        |frame| (u16::from(frame.code), frame.reason.as_str().to_owned()),
                    );
                    // Flush the close reply tungstenite queued for the peer.
                    _ = write.flush().await;
                    finish(&state, &notifier, code, reason);
                    return;
                }
                Some(Ok(_)) => {
                    // Ping/pong frames are answered by tungstenite itself.
                }
                Some(Err(e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%url, "Connection error: {e}");
                    fail(&state, &notifier, &e);
                    return;
                }
                None => {
                    finish(&state, &notifier, ABNORMAL_CLOSURE, String::new());
                    return;
                }
            },

            request = outgoing.recv() => match request {
                Some(Outgoing::Payload(payload)) => {
                    if let Err(e) = write.send(payload.into()).await {
                        fail(&state, &notifier, &e);
                        return;
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    // Keep reading until the peer acknowledges with its own close frame.
                    if write.send(Message::Close(Some(frame))).await.is_err() {
                        finish(&state, &notifier, ABNORMAL_CLOSURE, String::new());
                        return;
                    }
                }
                None => {
                    // The manager let go of this handle without closing it.
                    _ = write.send(Message::Close(None)).await;
                    state.send_replace(ReadyState::Closed);
                    return;
                }
            },
        }
    }
}
