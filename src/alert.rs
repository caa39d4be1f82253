//! Abstract alert sink consumed by [`crate::heartbeat`], [`crate::watchdog`]
//! and [`crate::ws`]. The core never talks to a concrete transport (mail,
//! Slack, Telegram); it only ever holds an `Arc<dyn AlertSink>`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, channel: &str, message: &str, context: &Value);
}

pub type SharedAlertSink = Arc<dyn AlertSink>;

/// An alert sink that forwards onto an mpsc channel without blocking,
/// dropping the alert if the channel is full. Grounded on the teacher's
/// `notifications::alert_gate::AlertGate` / `notifications::telegram`
/// fire-and-forget `try_send` dispatch, generalized away from Telegram
/// specifically.
pub struct ChannelAlertSink {
    tx: tokio::sync::mpsc::Sender<Alert>,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub channel: String,
    pub message: String,
    pub context: Value,
}

impl ChannelAlertSink {
    pub fn new(tx: tokio::sync::mpsc::Sender<Alert>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn send(&self, channel: &str, message: &str, context: &Value) {
        let alert = Alert {
            channel: channel.to_string(),
            message: message.to_string(),
            context: context.clone(),
        };
        if self.tx.try_send(alert).is_err() {
            log::warn!("alert dropped, sink channel full or closed: channel={channel} message={message}");
        }
    }
}

/// Sink that only logs; useful as a default when no transport is wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn send(&self, channel: &str, message: &str, context: &Value) {
        log::warn!("alert[{channel}]: {message} context={context}");
    }
}
