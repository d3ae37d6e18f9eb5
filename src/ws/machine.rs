//! Connection lifecycle as a pure transition function.
//!
//! [`Machine::step`] consumes one [`Input`] and returns the [`Effect`]s the driving
//! task must perform. Timers, transport handles and listeners live with the driver;
//! the machine only tracks the bookkeeping that decides what happens next.

use std::time::Instant;

use super::config::Config;
use super::connection::ConnectionState;
use super::types::{Event, NORMAL_CLOSURE, Payload, TransportError};

#[derive(Debug, Clone, Copy)]
struct Policy {
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    heartbeat: bool,
}

#[derive(Debug)]
pub(crate) enum Input {
    /// The caller asked to connect
    Connect,
    /// The transport handle for the current attempt exists
    Created,
    /// The transport handle could not be created
    ConstructionFailed(String),
    Opened,
    Message(Payload),
    Closed {
        code: u16,
        reason: String,
    },
    Errored(TransportError),
    /// The connect timeout elapsed
    TimedOut,
    /// The reconnect delay elapsed
    ReconnectDue,
    /// The heartbeat interval elapsed
    HeartbeatDue,
    /// The caller asked to close
    CloseRequested {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// How a caller's pending connect ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Connected,
    TimedOut,
    Failed(TransportError),
    Construction(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    CreateTransport,
    ArmConnectTimeout,
    CancelConnectTimeout,
    StartHeartbeat,
    StopHeartbeat,
    SendHeartbeat,
    CloseTransport {
        code: Option<u16>,
        reason: Option<String>,
    },
    DropTransport,
    ScheduleReconnect,
    CancelReconnect,
    Emit(Event),
    Settle(Outcome),
}

#[derive(Debug)]
pub(crate) struct Machine {
    policy: Policy,
    state: ConnectionState,
    reconnect_attempts: u32,
    manual_close: bool,
    /// Incremented for every transport handle; stale notifications are filtered on it
    generation: u64,
    /// A caller is waiting on the current attempt
    pending: bool,
    /// The current attempt timed out and its handle is being torn down
    abandoned: bool,
    has_transport: bool,
    /// `Open` was emitted for the current handle and its `Close` has not been yet
    announced: bool,
    /// Code and reason of a caller close that the transport has not confirmed yet
    requested_close: Option<(u16, String)>,
}

impl Machine {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            policy: Policy {
                auto_reconnect: config.auto_reconnect,
                max_reconnect_attempts: config.max_reconnect_attempts,
                heartbeat: config.heartbeat_enabled(),
            },
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            manual_close: false,
            generation: 0,
            pending: false,
            abandoned: false,
            has_transport: false,
            announced: false,
            requested_close: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn step(&mut self, input: Input) -> Vec<Effect> {
        let mut effects = Vec::new();

        match input {
            Input::Connect => {
                effects.push(Effect::CancelReconnect);
                if self.announced {
                    // The replaced handle's own close will be filtered out.
                    let (code, reason) = self
                        .requested_close
                        .take()
                        .unwrap_or((NORMAL_CLOSURE, String::new()));
                    effects.push(Effect::Emit(Event::Close { code, reason }));
                }
                self.begin_attempt(true, &mut effects);
            }
            Input::ReconnectDue => {
                if matches!(self.state, ConnectionState::Reconnecting { .. }) {
                    self.begin_attempt(false, &mut effects);
                }
            }
            Input::Created => {
                self.has_transport = true;
                effects.push(Effect::ArmConnectTimeout);
            }
            Input::ConstructionFailed(reason) => {
                self.has_transport = false;
                self.state = ConnectionState::Closed;
                self.settle(Outcome::Construction(reason), &mut effects);
            }
            Input::Opened => {
                if self.abandoned || self.state != ConnectionState::Connecting {
                    return effects;
                }
                effects.push(Effect::CancelConnectTimeout);
                self.announced = true;
                self.reconnect_attempts = 0;
                self.state = ConnectionState::Open {
                    since: Instant::now(),
                };
                if self.policy.heartbeat {
                    effects.push(Effect::StartHeartbeat);
                }
                effects.push(Effect::Emit(Event::Open));
                self.settle(Outcome::Connected, &mut effects);
            }
            Input::Message(payload) => {
                effects.push(Effect::Emit(Event::Message(payload)));
            }
            Input::Errored(error) => {
                effects.push(Effect::CancelConnectTimeout);
                effects.push(Effect::StopHeartbeat);
                effects.push(Effect::Emit(Event::Error(error.clone())));
                self.settle(Outcome::Failed(error), &mut effects);
            }
            Input::Closed { code, reason } => {
                self.has_transport = false;
                self.announced = false;
                self.requested_close = None;
                effects.push(Effect::CancelConnectTimeout);
                effects.push(Effect::StopHeartbeat);
                effects.push(Effect::DropTransport);
                effects.push(Effect::Emit(Event::Close { code, reason }));
                self.settle(Outcome::Closed, &mut effects);

                if !self.manual_close && self.policy.auto_reconnect {
                    self.schedule_reconnect(&mut effects);
                } else {
                    self.state = ConnectionState::Closed;
                }
            }
            Input::TimedOut => {
                if self.abandoned || self.state != ConnectionState::Connecting {
                    return effects;
                }
                self.abandoned = true;
                effects.push(Effect::CloseTransport {
                    code: None,
                    reason: None,
                });
                self.settle(Outcome::TimedOut, &mut effects);
            }
            Input::HeartbeatDue => {
                if matches!(self.state, ConnectionState::Open { .. }) {
                    effects.push(Effect::SendHeartbeat);
                }
            }
            Input::CloseRequested { code, reason } => {
                self.manual_close = true;
                effects.push(Effect::StopHeartbeat);
                effects.push(Effect::CancelConnectTimeout);
                effects.push(Effect::CancelReconnect);
                if self.has_transport {
                    self.requested_close = Some((
                        code.unwrap_or(NORMAL_CLOSURE),
                        reason.clone().unwrap_or_default(),
                    ));
                    effects.push(Effect::CloseTransport { code, reason });
                }
                self.settle(Outcome::Closed, &mut effects);
                self.state = ConnectionState::Closed;
            }
        }

        effects
    }

    fn begin_attempt(&mut self, caller: bool, effects: &mut Vec<Effect>) {
        self.manual_close = false;
        self.abandoned = false;
        self.has_transport = false;
        self.announced = false;
        self.requested_close = None;
        self.generation = self.generation.wrapping_add(1);
        self.state = ConnectionState::Connecting;
        self.pending = caller;

        effects.push(Effect::CancelConnectTimeout);
        effects.push(Effect::StopHeartbeat);
        effects.push(Effect::CreateTransport);
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        let max = self.policy.max_reconnect_attempts;
        if max != 0 && self.reconnect_attempts >= max {
            self.state = ConnectionState::Closed;
            return;
        }

        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.state = ConnectionState::Reconnecting {
            attempt: self.reconnect_attempts,
        };
        effects.push(Effect::Emit(Event::Reconnect {
            attempts: self.reconnect_attempts,
        }));
        effects.push(Effect::ScheduleReconnect);
    }

    fn settle(&mut self, outcome: Outcome, effects: &mut Vec<Effect>) {
        if self.pending {
            self.pending = false;
            effects.push(Effect::Settle(outcome));
        }
    }
}
