//! Resilient socket connection management.
//!
//! This module keeps one logical connection alive on top of a raw, message-framed
//! transport, reconnecting after unexpected closes and sending heartbeats while open.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: Cloneable handle to the connection, with connect/send/close
//!   and event listeners
//! - [`Transport`] / [`Link`]: Traits for plugging in the raw socket
//! - [`TungsteniteTransport`]: Default transport over `tokio-tungstenite`
//!
//! # Example
//!
//! ```ignore
//! let manager = ConnectionManager::new(endpoint, Options::builder().heartbeat(true).build());
//! manager.on(EventKind::Reconnect, listener(|event| tracing::info!(?event)));
//! manager.connect().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
mod machine;
pub mod traits;
#[cfg(feature = "tungstenite")]
pub mod transport;
pub mod types;

pub use config::{Config, HeartbeatMessage, Options};
pub use connection::{ConnectionManager, ConnectionState, WeakConnectionManager};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use listeners::{Listener, listener};
pub use traits::*;
#[cfg(feature = "tungstenite")]
pub use transport::TungsteniteTransport;
pub use types::*;
