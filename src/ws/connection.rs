#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::collections::VecDeque;
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_stream::stream;
use backoff::backoff::{Backoff as _, Constant};
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior, Sleep, interval_at, sleep};

use super::config::Config;
use super::error::WsError;
use super::listeners::{Listener, Listeners};
use super::machine::{Effect, Input, Machine, Outcome};
use super::traits::{Link, Notification, Notifier, Transport, TransportEvent};
use super::types::{Event, EventKind, NORMAL_CLOSURE, Payload, ReadyState};
use crate::Result;

/// Broadcast channel capacity for emitted events.
const BROADCAST_CAPACITY: usize = 1024;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Waiting for the transport to open
    Connecting,
    /// Successfully connected
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting to retry after an unexpected close
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Closed by the caller, or reconnection gave up
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

type SharedLink = Option<Arc<dyn Link>>;

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Close {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Keeps a logical connection to one endpoint alive across transport failures.
///
/// The manager handles:
/// - Connecting with a timeout
/// - Reconnecting at a fixed interval after unexpected closes
/// - Sending heartbeats while the connection is open
/// - Dispatching lifecycle and message events to listeners and subscribers
///
/// All state is owned by a background task, so every clone of the manager observes the
/// same connection. The task stops, closing the transport, once every clone is dropped.
/// A listener that needs the manager should capture a [`WeakConnectionManager`] from
/// [`downgrade`](Self::downgrade): a clone captured by a listener keeps the task alive.
///
/// # Example
///
/// ```rust, no_run
/// use resilient_socket::ws::{ConnectionManager, EventKind, Options, listener};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let manager = ConnectionManager::new("wss://echo.example.com".to_owned(), Options::default());
///
///     manager.on(
///         EventKind::Message,
///         listener(|event| println!("Received: {event:?}")),
///     );
///     manager.connect().await?;
///     manager.send("hello")?;
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Shared>,
}

/// A handle that does not keep the manager task alive.
///
/// Obtained from [`ConnectionManager::downgrade`].
#[derive(Debug, Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Shared>,
}

impl WeakConnectionManager {
    /// The manager, if any strong handle to it still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

/// Everything the handles share. Dropping the last one closes `commands`, which stops
/// the manager task.
struct Shared {
    endpoint: Arc<str>,
    config: Arc<Config>,
    /// Requests for the manager task
    commands: mpsc::UnboundedSender<Command>,
    /// Live transport handle, published by the manager task
    link_rx: watch::Receiver<SharedLink>,
    /// Watch channel receiver for state changes
    state_rx: watch::Receiver<ConnectionState>,
    attempts_rx: watch::Receiver<u32>,
    listeners: Arc<Listeners>,
    /// Broadcast sender for emitted events
    broadcast_tx: broadcast::Sender<Event>,
}

impl ConnectionManager {
    /// Create a manager backed by the tungstenite transport.
    ///
    /// Nothing is dialed until [`connect`](Self::connect) is called. Must be called from
    /// within a tokio runtime.
    #[cfg(feature = "tungstenite")]
    #[must_use]
    pub fn new<C: Into<Config>>(endpoint: String, config: C) -> Self {
        Self::with_transport(endpoint, config, super::transport::TungsteniteTransport)
    }

    /// Create a manager that obtains its transport handles from `transport`.
    #[must_use]
    pub fn with_transport<C, T>(endpoint: String, config: C, transport: T) -> Self
    where
        C: Into<Config>,
        T: Transport,
    {
        let config = Arc::new(config.into());
        let endpoint: Arc<str> = endpoint.into();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (attempts_tx, attempts_rx) = watch::channel(0);
        let (link_tx, link_rx) = watch::channel(None);
        let listeners = Arc::new(Listeners::new());

        let driver = Driver {
            endpoint: Arc::clone(&endpoint),
            machine: Machine::new(&config),
            reconnect_backoff: config.reconnect_backoff(),
            config: Arc::clone(&config),
            transport,
            link: None,
            link_tx,
            pending: None,
            connect_deadline: None,
            reconnect_at: None,
            heartbeat: None,
            notify_tx,
            listeners: Arc::clone(&listeners),
            broadcast_tx: broadcast_tx.clone(),
            state_tx,
            attempts_tx,
        };

        tokio::spawn(driver.run(commands_rx, notify_rx));

        Self {
            inner: Arc::new(Shared {
                endpoint,
                config,
                commands: commands_tx,
                link_rx,
                state_rx,
                attempts_rx,
                listeners,
                broadcast_tx,
            }),
        }
    }

    /// A handle for listeners and other places that must not keep the manager alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Dial the endpoint, resolving once the transport opens.
    ///
    /// Fails with [`WsError::ConnectTimeout`] if the transport does not open in time,
    /// [`WsError::Transport`] if it reports an error first, [`WsError::Construction`] if
    /// no handle could be created, and [`WsError::ConnectionClosed`] if the attempt is
    /// closed or superseded by another `connect` before it opens.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Connect(tx))
            .map_err(|_e| WsError::ConnectionClosed)?;

        rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Send a payload over the open transport.
    ///
    /// Nothing is queued: if the transport is not open this fails with
    /// [`WsError::NotConnected`] and the payload is dropped.
    pub fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        send_over(self.inner.link_rx.borrow().as_ref(), payload.into())
    }

    /// Close the connection and stop reconnecting until `connect` is called again.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        // A closed channel means the manager task is gone, so there is nothing to close.
        _ = self.inner.commands.send(Command::Close {
            code,
            reason: reason.map(ToOwned::to_owned),
        });
    }

    /// Register `listener` for events of `kind`.
    ///
    /// Registering the same listener twice dispatches it twice.
    pub fn on(&self, kind: EventKind, listener: Listener) {
        self.inner.listeners.on(kind, listener);
    }

    /// Remove the first registration of `listener` for `kind`, if any.
    pub fn remove(&self, kind: EventKind, listener: &Listener) -> bool {
        self.inner.listeners.remove(kind, listener)
    }

    /// Number of listeners registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.count(kind)
    }

    /// Whether the live transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Readiness of the live transport, [`ReadyState::Closed`] when there is none.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.inner
            .link_rx
            .borrow()
            .as_ref()
            .map_or(ReadyState::Closed, |link| link.ready_state())
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Reconnection attempts made since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        *self.inner.attempts_rx.borrow()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Subscribe to every emitted event.
    ///
    /// Each call returns a new independent receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Stream of emitted events. Ends when the manager task stops.
    pub fn events(&self) -> impl Stream<Item = Result<Event>> + use<> {
        let mut rx = self.subscribe();

        stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield Ok(event),
                    Err(RecvError::Lagged(count)) => yield Err(WsError::Lagged { count }.into()),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

fn send_over(link: Option<&Arc<dyn Link>>, payload: Payload) -> Result<()> {
    match link {
        Some(link) if link.ready_state() == ReadyState::Open => link.send(payload),
        _ => Err(WsError::NotConnected.into()),
    }
}

/// Resolves when the timer fires; never resolves when there is no timer.
async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

/// The manager's own execution context: owns all mutable connection state.
struct Driver<T: Transport> {
    endpoint: Arc<str>,
    config: Arc<Config>,
    machine: Machine,
    reconnect_backoff: Constant,
    transport: T,
    link: SharedLink,
    link_tx: watch::Sender<SharedLink>,
    /// Caller waiting on the current connect attempt
    pending: Option<oneshot::Sender<Result<()>>>,
    connect_deadline: Option<Pin<Box<Sleep>>>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    heartbeat: Option<Interval>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    listeners: Arc<Listeners>,
    broadcast_tx: broadcast::Sender<Event>,
    state_tx: watch::Sender<ConnectionState>,
    attempts_tx: watch::Sender<u32>,
}

impl<T: Transport> Driver<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(reply)) => {
                        if let Some(previous) = self.pending.replace(reply) {
                            _ = previous.send(Err(WsError::ConnectionClosed.into()));
                        }
                        self.apply(Input::Connect);
                    }
                    Some(Command::Close { code, reason }) => {
                        self.apply(Input::CloseRequested { code, reason });
                    }
                    None => break,
                },

                Some(notification) = notifications.recv() => {
                    if notification.generation != self.machine.generation() {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(
                            generation = notification.generation,
                            event = ?notification.event,
                            "Ignoring notification from a replaced transport"
                        );
                        continue;
                    }
                    self.apply(notification.event.into());
                }

                () = fire(&mut self.connect_deadline) => {
                    self.connect_deadline = None;
                    self.apply(Input::TimedOut);
                }

                () = fire(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.apply(Input::ReconnectDue);
                }

                () = tick(&mut self.heartbeat) => {
                    self.apply(Input::HeartbeatDue);
                }
            }
        }

        // Every handle is gone, nobody can observe the connection anymore.
        if let Some(link) = self.link.take() {
            link.close(Some(NORMAL_CLOSURE), None);
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "Connection manager stopped");
    }

    /// Feed `input` to the machine and perform the resulting effects, including any
    /// follow-up inputs they produce.
    fn apply(&mut self, input: Input) {
        let mut inputs = VecDeque::from([input]);

        while let Some(input) = inputs.pop_front() {
            for effect in self.machine.step(input) {
                if let Some(next) = self.perform(effect) {
                    inputs.push_back(next);
                }
            }
        }

        let state = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        let attempts = self.machine.reconnect_attempts();
        self.attempts_tx.send_if_modified(|current| {
            let changed = *current != attempts;
            *current = attempts;
            changed
        });
    }

    fn perform(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::CreateTransport => {
                let notifier = Notifier::new(self.machine.generation(), self.notify_tx.clone());
                return match self.transport.open(&self.endpoint, notifier) {
                    Ok(link) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(endpoint = %self.endpoint, "Created transport");
                        self.replace_link(Some(link));
                        Some(Input::Created)
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(endpoint = %self.endpoint, "Unable to create transport: {e}");
                        self.replace_link(None);
                        Some(Input::ConstructionFailed(construction_reason(&e)))
                    }
                };
            }
            Effect::ArmConnectTimeout => {
                self.connect_deadline = Some(Box::pin(sleep(self.config.timeout)));
            }
            Effect::CancelConnectTimeout => self.connect_deadline = None,
            Effect::StartHeartbeat => {
                let period = self.config.heartbeat_interval;
                let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(ticker);
            }
            Effect::StopHeartbeat => self.heartbeat = None,
            Effect::SendHeartbeat => {
                let Some(payload) = self.config.heartbeat_payload() else {
                    return None;
                };
                if let Err(e) = send_over(self.link.as_ref(), Payload::Text(payload)) {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Skipped heartbeat: {e}");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
            Effect::CloseTransport { code, reason } => {
                if let Some(link) = &self.link {
                    link.close(code, reason.as_deref());
                }
            }
            Effect::DropTransport => self.replace_link(None),
            Effect::ScheduleReconnect => {
                let delay = self
                    .reconnect_backoff
                    .next_backoff()
                    .unwrap_or(self.config.reconnect_interval);
                #[cfg(feature = "tracing")]
                tracing::info!(
                    attempt = self.machine.reconnect_attempts(),
                    ?delay,
                    "Scheduling reconnection"
                );
                self.reconnect_at = Some(Box::pin(sleep(delay)));
            }
            Effect::CancelReconnect => self.reconnect_at = None,
            Effect::Emit(event) => {
                self.listeners.emit(&event);
                // No subscribers is fine
                _ = self.broadcast_tx.send(event);
            }
            Effect::Settle(outcome) => {
                if let Some(reply) = self.pending.take() {
                    _ = reply.send(self.outcome_result(outcome));
                }
            }
        }

        None
    }

    /// Swap the live transport, closing the previous handle if it is still around.
    fn replace_link(&mut self, link: SharedLink) {
        if let Some(previous) = self.link.take()
            && matches!(
                previous.ready_state(),
                ReadyState::Connecting | ReadyState::Open
            )
        {
            previous.close(Some(NORMAL_CLOSURE), None);
        }
        self.link.clone_from(&link);
        self.link_tx.send_replace(link);
    }

    fn outcome_result(&self, outcome: Outcome) -> Result<()> {
        let error = match outcome {
            Outcome::Connected => return Ok(()),
            Outcome::TimedOut => WsError::ConnectTimeout(self.config.timeout),
            Outcome::Failed(e) => WsError::Transport(e),
            Outcome::Construction(reason) => WsError::Construction(reason),
            Outcome::Closed => WsError::ConnectionClosed,
        };

        Err(error.into())
    }
}

/// Keep the transport's own wording for construction failures.
fn construction_reason(error: &crate::error::Error) -> String {
    match error.downcast_ref::<WsError>() {
        Some(WsError::Construction(reason)) => reason.clone(),
        _ => error.to_string(),
    }
}

impl From<TransportEvent> for Input {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Open => Self::Opened,
            TransportEvent::Message(payload) => Self::Message(payload),
            TransportEvent::Close { code, reason } => Self::Closed { code, reason },
            TransportEvent::Error(error) => Self::Errored(error),
        }
    }
}
