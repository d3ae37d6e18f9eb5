//! Keeps a connection to an echo server alive and logs everything it does.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,resilient_socket=debug cargo run --example echo --features tracing -- wss://echo.websocket.org
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=echo.log RUST_LOG=debug cargo run --example echo --features tracing
//! ```

use std::fs::File;
use std::time::Duration;

use futures::StreamExt as _;
use resilient_socket::ws::{ConnectionManager, Event, EventKind, Options, listener};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_ENDPOINT: &str = "wss://echo.websocket.org";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());

    let options = Options::builder()
        .reconnect_interval(Duration::from_secs(2))
        .max_reconnect_attempts(5)
        .heartbeat(true)
        .heartbeat_interval(Duration::from_secs(10))
        .build();
    let manager = ConnectionManager::new(endpoint, options);

    manager.on(
        EventKind::Reconnect,
        listener(|event| warn!(?event, "connection lost, retrying")),
    );
    manager.on(
        EventKind::Error,
        listener(|event| warn!(?event, "transport error")),
    );

    let mut events = Box::pin(manager.events());

    manager.connect().await?;
    info!(endpoint = manager.endpoint(), "connected");

    for n in 1..=3 {
        manager.send(format!("hello #{n}"))?;
    }

    let mut echoed = 0;
    while let Some(event) = events.next().await {
        match event? {
            Event::Message(payload) => {
                info!(text = payload.as_text(), "received");
                echoed += 1;
                if echoed == 3 {
                    break;
                }
            }
            other => info!(?other, "event"),
        }
    }

    manager.close(None, None);
    Ok(())
}
