//! Resilience core: a WebSocket session manager, heartbeat, watchdog,
//! circuit breaker, graceful-shutdown orchestrator, and time-modulo
//! trigger, built to keep a long-running process attached to a flaky
//! duplex stream.

pub mod alert;
pub mod callback;
pub mod circuit_breaker;
pub mod clock;
pub mod error;
pub mod heartbeat;
pub mod shutdown;
pub mod time_trigger;
pub mod watchdog;
pub mod ws;

pub use error::{ResilienceError, Result};
