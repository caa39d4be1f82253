use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the resilience core. Every fallible constructor and
/// operation in this crate returns `Result<_, ResilienceError>`; nothing
/// in library code panics on bad input.
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection failed: {cause}")]
    ConnectionFailed { cause: String },

    #[error("peer closed connection (code {code}): {reason}")]
    PeerClosed { code: u16, reason: String },

    #[error("no traffic within ping_timeout")]
    KeepaliveTimeout,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("circuit '{name}' is open, retry in {remaining:?}")]
    CircuitOpen { remaining: Duration, name: String },

    #[error("heartbeat state file write failed")]
    HeartbeatWriteFailed(#[source] std::io::Error),

    #[error("watchdog timeout after {elapsed:?} of inactivity")]
    WatchdogTimeout { elapsed: Duration },

    #[error("shutdown refused: {0}")]
    ShutdownRefused(String),

    #[error("invalid modulo: {0}")]
    InvalidModulo(String),
}

pub type Result<T> = std::result::Result<T, ResilienceError>;
