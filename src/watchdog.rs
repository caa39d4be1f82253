//! Activity timer. Fires `on_timeout` once inactivity exceeds `timeout`,
//! either against local `ping()` calls or against a remote liveness file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::callback::Callback;
use crate::clock::{Clock, SystemClock};
use crate::error::{ResilienceError, Result};
use crate::heartbeat;

#[derive(Debug, Default, Clone, Copy)]
pub struct WatchdogStats {
    pub pings_total: u64,
    pub timeouts_triggered: u64,
}

enum Source {
    Activity,
    StateFile { path: PathBuf, max_age: Duration },
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct WatchdogConfig {
    pub name: String,
    pub timeout: Duration,
    pub check_interval: Option<Duration>,
    pub raise_on_timeout: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            name: "watchdog".to_string(),
            timeout: Duration::from_secs(30),
            check_interval: None,
            raise_on_timeout: false,
        }
    }
}

impl WatchdogConfig {
    fn validate(&self) -> Result<()> {
        let secs = self.timeout.as_secs();
        if !(1..=3600).contains(&secs) {
            return Err(ResilienceError::Configuration(format!(
                "watchdog timeout {secs}s out of range [1, 3600]"
            )));
        }
        Ok(())
    }
}

pub struct Watchdog {
    config: WatchdogConfig,
    source: Source,
    clock: Arc<dyn Clock>,
    on_timeout: Option<Callback<Duration, ()>>,
    last_activity_millis: AtomicU64,
    epoch: std::time::Instant,
    triggered: AtomicBool,
    is_shutdown: AtomicBool,
    pings_total: AtomicU64,
    timeouts_triggered: AtomicU64,
    start_time: std::time::Instant,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Result<Arc<Self>> {
        Self::build(config, Source::Activity, Arc::new(SystemClock))
    }

    /// Builds a watchdog that polls a heartbeat-style JSON state file
    /// instead of local `ping()` calls. `check_interval` defaults to
    /// `max_age / 2`; `name` defaults to `state_file_watcher:<path>`.
    pub fn from_state_file(
        path: PathBuf,
        max_age: Duration,
        check_interval: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let name = format!("state_file_watcher:{}", path.display());
        let interval = check_interval.unwrap_or(max_age / 2);
        let config = WatchdogConfig {
            name,
            timeout: max_age,
            check_interval: Some(interval),
            raise_on_timeout: false,
        };
        Self::build(
            config,
            Source::StateFile { path, max_age },
            Arc::new(SystemClock),
        )
    }

    fn build(config: WatchdogConfig, source: Source, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;
        let now = clock.now();
        Ok(Arc::new(Self {
            config,
            source,
            clock,
            on_timeout: None,
            last_activity_millis: AtomicU64::new(0),
            epoch: now,
            triggered: AtomicBool::new(false),
            is_shutdown: AtomicBool::new(false),
            pings_total: AtomicU64::new(0),
            timeouts_triggered: AtomicU64::new(0),
            start_time: now,
            worker: Mutex::new(None),
        }))
    }

    pub fn with_on_timeout(mut self: Arc<Self>, cb: Callback<Duration, ()>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_on_timeout must be called before sharing the Arc")
            .on_timeout = Some(cb);
        self
    }

    /// Lock-free: records the last-activity instant as an atomic offset
    /// from construction time.
    pub fn ping(&self) {
        let elapsed = self.clock.now().saturating_duration_since(self.epoch);
        self.last_activity_millis
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.pings_total.fetch_add(1, Ordering::Relaxed);
        self.triggered.store(false, Ordering::SeqCst);
    }

    fn elapsed_since_activity(&self) -> Duration {
        let last = self.last_activity_millis.load(Ordering::Relaxed);
        let now_ms = self.clock.now().saturating_duration_since(self.epoch).as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(last))
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        // Lock-free approximation: a worker handle exists iff started.
        // Checked synchronously via try_lock to avoid requiring async here.
        self.worker
            .try_lock()
            .map(|g| g.is_some())
            .unwrap_or(true)
    }

    pub fn reset(&self) {
        self.triggered.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> WatchdogStats {
        WatchdogStats {
            pings_total: self.pings_total.load(Ordering::Relaxed),
            timeouts_triggered: self.timeouts_triggered.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start_time)
    }

    async fn check_once(self: &Arc<Self>) -> Result<()> {
        let stale = match &self.source {
            Source::Activity => self.elapsed_since_activity() >= self.config.timeout,
            Source::StateFile { path, max_age } => {
                !heartbeat::is_alive(path, *max_age).await
            }
        };
        if stale {
            if !self.triggered.swap(true, Ordering::SeqCst) {
                self.timeouts_triggered.fetch_add(1, Ordering::Relaxed);
                let elapsed = match &self.source {
                    Source::Activity => self.elapsed_since_activity(),
                    Source::StateFile { .. } => self.config.timeout,
                };
                log::error!("watchdog '{}' timed out after {:?}", self.config.name, elapsed);
                if let Some(cb) = &self.on_timeout {
                    cb.invoke(elapsed).await;
                }
                if self.config.raise_on_timeout {
                    return Err(ResilienceError::WatchdogTimeout { elapsed });
                }
            }
        } else {
            self.triggered.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(ResilienceError::Configuration(
                "watchdog already running".into(),
            ));
        }
        let this = Arc::clone(self);
        let interval = self
            .config
            .check_interval
            .unwrap_or_else(|| std::cmp::min(self.config.timeout / 3, Duration::from_secs(1)));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if this.is_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = this.check_once().await {
                    log::error!("watchdog '{}': {e}", this.config.name);
                }
            }
        });
        *worker = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        match worker.take() {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Err(ResilienceError::Configuration("watchdog not running".into())),
        }
    }

    pub async fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
        let _ = self.stop().await;
    }
}
