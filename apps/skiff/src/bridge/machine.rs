//! Connection lifecycle as a pure state machine.
//!
//! Transitions are functions of (state, event) returning effects; the driver
//! in the parent module interprets effects against real sockets and timers.
//! Keeping this pure makes the reconnect policy testable without a socket.

use std::time::Duration;

/// Reconnect budget before the bridge goes terminal and waits for a manual
/// retry.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Online,
    Errored,
    Reconnecting,
}

/// Everything that can drive a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// connect() was called, explicitly or as a recovery nudge.
    ConnectRequested,
    /// The socket finished its handshake.
    Opened,
    /// The transport reported an error; a close always follows.
    TransportError,
    /// The socket closed, cleanly or not.
    Closed,
    /// The scheduled reconnect delay elapsed.
    ReconnectDue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Discard any prior socket and open a fresh one.
    OpenSocket,
    /// Announce self-identity with the lifecycle/connect meta-event.
    SendHandshake,
    StartHeartbeat,
    StopHeartbeat,
    /// Drop all pending-request markers and their timers.
    ClearPending,
    ScheduleReconnect { attempt: u32, delay: Duration },
    CancelReconnect,
    /// The reconnect budget is spent; only a manual retry continues.
    ReportExhausted,
}

/// Backoff for a given attempt number: 1s, 2s, 4s, 8s, 16s, capped at 30s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.min(31);
    BACKOFF_CAP.min(Duration::from_secs(BACKOFF_BASE_SECS << exp))
}

#[derive(Debug)]
pub struct LinkMachine {
    state: ConnectionState,
    attempts: u32,
}

impl Default for LinkMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn handle(&mut self, event: LinkEvent) -> Vec<Effect> {
        use ConnectionState::*;

        match (self.state, event) {
            (Disconnected | Errored, LinkEvent::ConnectRequested) => {
                self.state = Connecting;
                vec![Effect::OpenSocket]
            }
            (Reconnecting, LinkEvent::ConnectRequested) => {
                self.state = Connecting;
                vec![Effect::CancelReconnect, Effect::OpenSocket]
            }
            (Connecting | Online, LinkEvent::ConnectRequested) => Vec::new(),

            (Connecting, LinkEvent::Opened) => {
                self.state = Online;
                self.attempts = 0;
                vec![Effect::SendHandshake, Effect::StartHeartbeat]
            }
            // A socket that opened after the state moved on is stale.
            (_, LinkEvent::Opened) => Vec::new(),

            (Connecting | Online | Errored, LinkEvent::TransportError) => {
                self.state = Errored;
                vec![Effect::StopHeartbeat]
            }
            (Disconnected | Reconnecting, LinkEvent::TransportError) => Vec::new(),

            (Connecting | Online | Errored, LinkEvent::Closed) => {
                let mut effects = vec![Effect::StopHeartbeat, Effect::ClearPending];
                if self.attempts < MAX_RECONNECT_ATTEMPTS {
                    let delay = reconnect_delay(self.attempts);
                    self.attempts += 1;
                    self.state = Reconnecting;
                    effects.push(Effect::ScheduleReconnect {
                        attempt: self.attempts,
                        delay,
                    });
                } else {
                    self.state = Disconnected;
                    effects.push(Effect::ReportExhausted);
                }
                effects
            }
            (Disconnected | Reconnecting, LinkEvent::Closed) => Vec::new(),

            (Reconnecting, LinkEvent::ReconnectDue) => {
                self.state = Connecting;
                vec![Effect::OpenSocket]
            }
            (_, LinkEvent::ReconnectDue) => Vec::new(),
        }
    }
}
