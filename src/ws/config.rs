use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use backoff::backoff::Constant;
use bon::Builder;
use chrono::Utc;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use serde_with::{DurationMilliSeconds, serde_as};

const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_MESSAGE: &str = "ping";

/// Payload sent on every heartbeat tick.
#[non_exhaustive]
#[derive(Clone)]
pub enum HeartbeatMessage {
    /// The same text on every tick
    Static(String),
    /// Text produced fresh on every tick
    Generated(Arc<dyn Fn() -> String + Send + Sync>),
}

impl HeartbeatMessage {
    pub fn generated<F>(generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self::Generated(Arc::new(generator))
    }

    /// Empty static text resolves to nothing, so the default ping is used instead.
    ///
    /// A panicking generator is caught and its panic returned as the error.
    fn resolve(&self) -> thread::Result<Option<String>> {
        match self {
            Self::Static(text) if text.is_empty() => Ok(None),
            Self::Static(text) => Ok(Some(text.clone())),
            Self::Generated(generator) => {
                catch_unwind(AssertUnwindSafe(generator.as_ref())).map(Some)
            }
        }
    }
}

impl fmt::Debug for HeartbeatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Self::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

impl From<&str> for HeartbeatMessage {
    fn from(text: &str) -> Self {
        Self::Static(text.to_owned())
    }
}

impl From<String> for HeartbeatMessage {
    fn from(text: String) -> Self {
        Self::Static(text)
    }
}

impl<'de> Deserialize<'de> for HeartbeatMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::Static)
    }
}

/// Resolved configuration for a [`ConnectionManager`](super::ConnectionManager).
///
/// Built from [`Options`]; every field the caller leaves out takes its default.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Reconnect after a close the caller did not request
    pub auto_reconnect: bool,
    /// Fixed delay before each reconnection attempt
    pub reconnect_interval: Duration,
    /// Maximum number of reconnection attempts, `0` meaning unlimited
    pub max_reconnect_attempts: u32,
    /// Send heartbeats while the connection is open
    pub heartbeat: bool,
    /// Delay between heartbeats
    pub heartbeat_interval: Duration,
    /// Heartbeat payload. `None` sends `{"type":"ping","timestamp":<millis>}`
    pub heartbeat_message: Option<HeartbeatMessage>,
    /// Maximum time to wait for the transport to open
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL_DURATION,
            max_reconnect_attempts: 0,
            heartbeat: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_message: Some(HeartbeatMessage::from(DEFAULT_HEARTBEAT_MESSAGE)),
            timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
        }
    }
}

impl Config {
    /// Heartbeats run only when enabled and the interval is non-zero.
    #[must_use]
    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat && !self.heartbeat_interval.is_zero()
    }

    /// Produce the payload for the next heartbeat.
    ///
    /// Returns `None` when the generator panicked; that tick is skipped.
    #[must_use]
    pub fn heartbeat_payload(&self) -> Option<String> {
        let text = match self.heartbeat_message.as_ref().map(HeartbeatMessage::resolve) {
            Some(Ok(text)) => text,
            Some(Err(panic)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?panic, "Heartbeat generator panicked, skipping tick");
                #[cfg(not(feature = "tracing"))]
                let _ = &panic;
                return None;
            }
            None => None,
        };

        Some(text.unwrap_or_else(|| {
            json!({ "type": "ping", "timestamp": Utc::now().timestamp_millis() }).to_string()
        }))
    }

    pub(crate) fn reconnect_backoff(&self) -> Constant {
        Constant::new(self.reconnect_interval)
    }
}

/// Caller overrides for [`Config`].
///
/// Field names match the established option names (`autoReconnect`,
/// `reconnectInterval`, `maxReconnectAttempts`, `heartbeat`, `heartbeatInterval`,
/// `heartbeatMessage`, `timeout`) when deserialized; durations are in milliseconds.
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, Default, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    pub auto_reconnect: Option<bool>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default)]
    pub reconnect_interval: Option<Duration>,
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat: Option<bool>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default)]
    pub heartbeat_interval: Option<Duration>,
    /// `Some(None)` (an explicit `null`) selects the JSON ping fallback.
    #[serde(default, with = "::serde_with::rust::double_option")]
    #[builder(into)]
    pub heartbeat_message: Option<Option<HeartbeatMessage>>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl Options {
    /// Parse options from their JSON form.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<Options> for Config {
    fn from(options: Options) -> Self {
        let defaults = Config::default();

        Self {
            auto_reconnect: options.auto_reconnect.unwrap_or(defaults.auto_reconnect),
            reconnect_interval: options
                .reconnect_interval
                .unwrap_or(defaults.reconnect_interval),
            max_reconnect_attempts: options
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            heartbeat: options.heartbeat.unwrap_or(defaults.heartbeat),
            heartbeat_interval: options
                .heartbeat_interval
                .unwrap_or(defaults.heartbeat_interval),
            heartbeat_message: options
                .heartbeat_message
                .unwrap_or(defaults.heartbeat_message),
            timeout: options.timeout.unwrap_or(defaults.timeout),
        }
    }
}
