//! Data model shared by the WebSocket manager: connection state machine,
//! disconnect reasons, reconnect policy, and frames.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// `CLOSED` is terminal; `DISCONNECTED` is reconnectable. The manager
    /// is "dead" iff disconnected/closed with no reconnect task in flight
    /// -- callers combine this with the reconnect-task flag upstream.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    UserRequested,
    NetworkError(String),
    PeerClose { code: u16, reason: String },
    KeepaliveTimeout,
    ProtocolError(String),
    ProactiveCycle,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum ReconnectStrategy {
    Immediate,
    FixedDelay(Duration),
    ExponentialBackoff { base: Duration, max: Duration },
    CallbackControlled,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        ReconnectStrategy::ExponentialBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectStrategy {
    /// The k-th (1-indexed) reconnect delay, jitter excluded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            ReconnectStrategy::Immediate => Duration::ZERO,
            ReconnectStrategy::FixedDelay(d) => *d,
            ReconnectStrategy::ExponentialBackoff { base, max } => {
                let exp = attempt.saturating_sub(1).min(32);
                let scaled = base.as_millis().saturating_mul(1u128 << exp);
                Duration::from_millis(scaled.min(max.as_millis()) as u64)
            }
            ReconnectStrategy::CallbackControlled => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Now,
    After(Duration),
    Never,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Synthetic marker separating connection generations in the
    /// consumer-visible stream.
    Reconnected,
}
