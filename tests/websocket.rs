#![cfg(feature = "tungstenite")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt as _, Stream, StreamExt as _};
use resilient_socket::Result;
use resilient_socket::ws::{ConnectionManager, Event, Options, Payload, WsError};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
enum ServerCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Commands delivered to ALL connected clients
    command_tx: broadcast::Sender<ServerCommand>,
    /// Text frames received from clients
    received_rx: mpsc::UnboundedReceiver<String>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<ServerCommand>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();

        let broadcast_tx = command_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();
                let mut command_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(received_tx.send(text.to_string()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            command = command_rx.recv() => {
                                let message = match command {
                                    Ok(ServerCommand::Text(text)) => Message::Text(text.into()),
                                    Ok(ServerCommand::Close { code, reason }) => {
                                        Message::Close(Some(CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: reason.into(),
                                        }))
                                    }
                                    Err(_) => break,
                                };
                                if write.send(message).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            received_rx,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/socket", self.addr)
    }

    /// Send a text frame to all connected clients.
    fn send(&self, message: &str) {
        drop(self.command_tx.send(ServerCommand::Text(message.to_owned())));
    }

    /// Close every connected client with `code`.
    fn close_all(&self, code: u16, reason: &str) {
        drop(self.command_tx.send(ServerCommand::Close {
            code,
            reason: reason.to_owned(),
        }));
    }

    /// Receive the next text frame sent by a client.
    async fn recv(&mut self) -> Option<String> {
        timeout(WAIT, self.received_rx.recv()).await.ok().flatten()
    }
}

async fn next_event<S>(events: &mut S) -> Event
where
    S: Stream<Item = Result<Event>> + Unpin,
{
    timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for an event")
        .unwrap()
        .unwrap()
}

fn ws_error(error: &resilient_socket::error::Error) -> &WsError {
    error.downcast_ref::<WsError>().unwrap()
}

#[tokio::test]
async fn connects_sends_and_receives() {
    let mut server = MockWsServer::start().await;
    let manager = ConnectionManager::new(server.ws_url(), Options::default());
    let mut events = Box::pin(manager.events());

    manager.connect().await.unwrap();
    assert!(manager.is_connected());
    assert_eq!(next_event(&mut events).await, Event::Open);

    manager.send("hello").unwrap();
    assert_eq!(server.recv().await.as_deref(), Some("hello"));

    server.send(r#"{"type":"greeting"}"#);
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(Payload::Text(r#"{"type":"greeting"}"#.to_owned()))
    );
}

#[tokio::test]
async fn server_close_triggers_reconnect() {
    let server = MockWsServer::start().await;
    let manager = ConnectionManager::new(
        server.ws_url(),
        Options::builder()
            .reconnect_interval(Duration::from_millis(50))
            .build(),
    );
    let mut events = Box::pin(manager.events());

    manager.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Open);

    server.close_all(4000, "bye");
    assert_eq!(
        next_event(&mut events).await,
        Event::Close {
            code: 4000,
            reason: "bye".to_owned()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Reconnect { attempts: 1 }
    );
    assert_eq!(next_event(&mut events).await, Event::Open);
    assert!(manager.is_connected());
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test]
async fn manual_close_reaches_server_without_reconnect() {
    let server = MockWsServer::start().await;
    let manager = ConnectionManager::new(
        server.ws_url(),
        Options::builder()
            .reconnect_interval(Duration::from_millis(10))
            .build(),
    );
    let mut events = Box::pin(manager.events());

    manager.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Open);

    manager.close(Some(1000), Some("done"));
    match next_event(&mut events).await {
        Event::Close { code, .. } => assert_eq!(code, 1000),
        other => panic!("expected close, got {other:?}"),
    }

    let extra = timeout(Duration::from_millis(200), events.next()).await;
    assert!(extra.is_err(), "no event should follow a manual close");
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn heartbeat_reaches_server() {
    let mut server = MockWsServer::start().await;
    let manager = ConnectionManager::new(
        server.ws_url(),
        Options::builder()
            .heartbeat(true)
            .heartbeat_interval(Duration::from_millis(50))
            .build(),
    );

    manager.connect().await.unwrap();

    assert_eq!(server.recv().await.as_deref(), Some("ping"));
    assert_eq!(server.recv().await.as_deref(), Some("ping"));
}

#[tokio::test]
async fn unreachable_endpoint_fails_with_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let manager = ConnectionManager::new(
        format!("ws://{addr}/socket"),
        Options::builder().auto_reconnect(false).build(),
    );

    let error = manager.connect().await.unwrap_err();
    assert!(
        matches!(ws_error(&error), WsError::Transport(_)),
        "unexpected error: {error}"
    );
}

#[tokio::test]
async fn malformed_endpoint_fails_construction() {
    for endpoint in ["not a url", "http://127.0.0.1:9/socket"] {
        let manager = ConnectionManager::new(endpoint.to_owned(), Options::default());

        let error = manager.connect().await.unwrap_err();
        assert!(
            matches!(ws_error(&error), WsError::Construction(_)),
            "{endpoint}: unexpected error {error}"
        );
    }
}
