//! Periodic liveness tick, optional atomic state-file write, optional
//! death-detection of a monitored target.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::alert::SharedAlertSink;
use crate::callback::Callback;
use crate::clock::{Clock, SystemClock};
use crate::error::{ResilienceError, Result};

/// Capability a heartbeat can monitor for death. Implemented by
/// [`crate::ws::WebSocketManager`]; held behind `Arc<dyn DeathWatch>` so
/// the heartbeat never owns a direct pointer back to the manager.
pub trait DeathWatch: Send + Sync {
    fn is_dead(&self) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatState {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub hostname: String,
    pub metadata: HashMap<String, String>,
}

impl HeartbeatState {
    pub fn capture(metadata: HashMap<String, String>, clock: &dyn Clock) -> Self {
        Self {
            timestamp: clock.utc_now(),
            pid: std::process::id(),
            hostname: hostname(),
            metadata,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Serialize to a temp sibling file then rename, so readers never
/// observe a partially-written record.
pub async fn write_state_atomic(path: &Path, state: &HeartbeatState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ResilienceError::HeartbeatWriteFailed)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec(state)
        .map_err(|e| ResilienceError::HeartbeatWriteFailed(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    tokio::fs::write(&tmp_path, body)
        .await
        .map_err(ResilienceError::HeartbeatWriteFailed)?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(ResilienceError::HeartbeatWriteFailed)?;
    Ok(())
}

/// Returns `None` on absent, corrupt, or schema-violating file.
pub async fn read_state(path: &Path) -> Option<HeartbeatState> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub async fn is_alive(path: &Path, max_age: Duration) -> bool {
    match read_state(path).await {
        Some(state) => {
            let age = Utc::now() - state.timestamp;
            age.to_std().map(|a| a <= max_age).unwrap_or(false)
        }
        None => false,
    }
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub state_file: Option<PathBuf>,
    pub metadata: HashMap<String, String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            state_file: None,
            metadata: HashMap::new(),
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        let secs = self.interval.as_secs();
        if !(1..=300).contains(&secs) {
            return Err(ResilienceError::Configuration(format!(
                "heartbeat interval {secs}s out of range [1, 300]"
            )));
        }
        Ok(())
    }
}

struct Worker {
    handle: JoinHandle<()>,
}

/// Ticks at a fixed interval, optionally writing a liveness file and
/// monitoring a target for death. At most one worker task runs per
/// instance.
pub struct Heartbeat {
    config: HeartbeatConfig,
    clock: Arc<dyn Clock>,
    target: Option<Arc<dyn DeathWatch>>,
    on_beat: Option<Callback<HeartbeatState, ()>>,
    on_missed_beat: Option<Callback<String, ()>>,
    on_target_dead: Option<Callback<(), ()>>,
    alert_sink: Option<SharedAlertSink>,
    worker: Mutex<Option<Worker>>,
    is_shutdown: AtomicBool,
    target_alerted: AtomicBool,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HeartbeatConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            target: None,
            on_beat: None,
            on_missed_beat: None,
            on_target_dead: None,
            alert_sink: None,
            worker: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
            target_alerted: AtomicBool::new(false),
        })
    }

    pub fn with_target(mut self, target: Arc<dyn DeathWatch>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_on_beat(mut self, cb: Callback<HeartbeatState, ()>) -> Self {
        self.on_beat = Some(cb);
        self
    }

    pub fn with_on_missed_beat(mut self, cb: Callback<String, ()>) -> Self {
        self.on_missed_beat = Some(cb);
        self
    }

    pub fn with_on_target_dead(mut self, cb: Callback<(), ()>) -> Self {
        self.on_target_dead = Some(cb);
        self
    }

    pub fn with_alert_sink(mut self, sink: SharedAlertSink) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    async fn beat_once(self: &Arc<Self>) {
        let state = HeartbeatState::capture(self.config.metadata.clone(), self.clock.as_ref());
        if let Some(path) = &self.config.state_file {
            if let Err(e) = write_state_atomic(path, &state).await {
                log::warn!("heartbeat write failed: {e}");
                if let Some(cb) = &self.on_missed_beat {
                    cb.invoke(e.to_string()).await;
                }
            }
        }
        if let Some(cb) = &self.on_beat {
            cb.invoke(state).await;
        }
        if let Some(target) = &self.target {
            if target.is_dead() {
                if !self.target_alerted.swap(true, Ordering::SeqCst) {
                    log::error!("heartbeat target is dead");
                    if let Some(cb) = &self.on_target_dead {
                        cb.invoke(()).await;
                    }
                    if let Some(sink) = &self.alert_sink {
                        sink.send("heartbeat", "monitored target is dead", &Value::Null)
                            .await;
                    }
                }
            } else {
                self.target_alerted.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Spawns the tick loop if not already running.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let interval = self.config.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if this.is_shutdown() {
                    break;
                }
                this.beat_once().await;
            }
        });
        *worker = Some(Worker { handle });
    }

    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(w) = worker.take() {
            w.handle.abort();
        }
    }

    /// Stops the worker and latches `is_shutdown`, signalling downstream
    /// components (e.g. the watchdog) that this process should not be
    /// restarted.
    pub async fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct AlwaysDead;
    impl DeathWatch for AlwaysDead {
        fn is_dead(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn writes_atomic_state_file_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let clock = SystemClock;
        let state = HeartbeatState::capture(HashMap::new(), &clock);
        write_state_atomic(&path, &state).await.unwrap();
        let read_back = read_state(&path).await.unwrap();
        assert_eq!(read_back, state);
        assert!(!dir.path().join("hb.tmp").exists());
    }

    #[tokio::test]
    async fn absent_and_corrupt_files_read_as_none() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(read_state(&missing).await.is_none());

        let corrupt = dir.path().join("corrupt.json");
        tokio::fs::write(&corrupt, b"not json").await.unwrap();
        assert!(read_state(&corrupt).await.is_none());
    }

    #[tokio::test]
    async fn target_death_alerts_exactly_once_until_rearmed() {
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        let hb = Arc::new(
            Heartbeat::new(HeartbeatConfig {
                interval: Duration::from_secs(1),
                ..Default::default()
            })
            .unwrap()
            .with_target(Arc::new(AlwaysDead))
            .with_on_target_dead(Callback::asynchronous(move |_| {
                let fired = fired2.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );
        hb.beat_once().await;
        hb.beat_once().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
