mod config;
mod manager;
mod state;

pub use config::WebSocketManagerConfig;
pub use manager::{WebSocketManager, WebSocketManagerCallbacks};
pub use state::{ConnectionState, DisconnectReason, Frame, ReconnectDecision, ReconnectStrategy};
