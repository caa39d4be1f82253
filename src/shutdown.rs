//! Signal -> ordered, bounded cleanup callbacks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::callback::Callback;
use crate::error::{ResilienceError, Result};

static INSTALL_REFCOUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone)]
struct CleanupCallback {
    name: String,
    callback: Callback<(), std::result::Result<(), String>>,
    priority: u32,
    timeout: Option<Duration>,
    order: u64,
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct ShutdownConfig {
    pub global_timeout: Duration,
    pub force_exit_code: i32,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            global_timeout: Duration::from_secs(30),
            force_exit_code: 1,
        }
    }
}

impl ShutdownConfig {
    fn validate(&self) -> Result<()> {
        let secs = self.global_timeout.as_secs();
        if !(5..=300).contains(&secs) {
            return Err(ResilienceError::Configuration(format!(
                "shutdown global_timeout {secs}s out of range [5, 300]"
            )));
        }
        Ok(())
    }
}

/// Registry of named cleanup callbacks run in priority order on
/// `trigger()`. One instance per process is typical but not enforced;
/// signal installation is guarded by a process-global reference count.
pub struct GracefulShutdown {
    config: ShutdownConfig,
    callbacks: Mutex<Vec<CleanupCallback>>,
    names: Mutex<HashSet<String>>,
    next_order: AtomicUsize,
    triggered: AtomicBool,
    installed: AtomicBool,
    notify: Notify,
    signal_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            callbacks: Mutex::new(Vec::new()),
            names: Mutex::new(HashSet::new()),
            next_order: AtomicUsize::new(0),
            triggered: AtomicBool::new(false),
            installed: AtomicBool::new(false),
            notify: Notify::new(),
            signal_tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub async fn register(
        &self,
        name: impl Into<String>,
        callback: Callback<(), std::result::Result<(), String>>,
        priority: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.is_shutting_down() {
            return Err(ResilienceError::ShutdownRefused(
                "registration attempted during shutdown".into(),
            ));
        }
        let name = name.into();
        let mut names = self.names.lock().await;
        if !names.insert(name.clone()) {
            return Err(ResilienceError::ShutdownRefused(format!(
                "'{name}' already registered"
            )));
        }
        let order = self.next_order.fetch_add(1, Ordering::SeqCst) as u64;
        let mut callbacks = self.callbacks.lock().await;
        callbacks.push(CleanupCallback {
            name,
            callback,
            priority,
            timeout,
            order,
        });
        callbacks.sort_by_key(|c| (c.priority, c.order));
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut names = self.names.lock().await;
        if !names.remove(name) {
            return false;
        }
        let mut callbacks = self.callbacks.lock().await;
        callbacks.retain(|c| c.name != name);
        true
    }

    /// Attaches SIGINT+SIGTERM (Unix) / SIGINT (Windows) handlers that
    /// call `trigger()`. Rejects a second install on the same instance,
    /// and -- since OS signal delivery is process-wide regardless of how
    /// many `GracefulShutdown` instances exist -- rejects a concurrent
    /// install on any other instance too.
    pub fn install(self: &Arc<Self>) -> Result<()> {
        if self.installed.swap(true, Ordering::SeqCst) {
            return Err(ResilienceError::Configuration(
                "shutdown orchestrator already installed".into(),
            ));
        }
        if INSTALL_REFCOUNT
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.installed.store(false, Ordering::SeqCst);
            return Err(ResilienceError::Configuration(
                "a shutdown orchestrator is already installed process-wide".into(),
            ));
        }
        let this = Arc::clone(self);
        let mut tasks = Vec::new();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
                let this = Arc::clone(&this);
                let mut sig = signal(kind).expect("failed to install signal handler");
                tasks.push(tokio::spawn(async move {
                    sig.recv().await;
                    log::info!("shutdown signal received");
                    this.trigger().await;
                }));
            }
        }
        #[cfg(not(unix))]
        {
            let this = Arc::clone(&this);
            tasks.push(tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                log::info!("shutdown signal received");
                this.trigger().await;
            }));
        }

        let handle_store = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = handle_store.signal_tasks.lock().await;
            guard.extend(tasks);
        });
        Ok(())
    }

    pub fn uninstall(&self) {
        if self.installed.swap(false, Ordering::SeqCst) {
            INSTALL_REFCOUNT.store(0, Ordering::SeqCst);
            if let Ok(mut guard) = self.signal_tasks.try_lock() {
                for task in guard.drain(..) {
                    task.abort();
                }
            }
        }
    }

    /// Idempotent: subsequent calls return immediately without
    /// re-running callbacks.
    pub async fn trigger(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = self.callbacks.lock().await.clone();
        let deadline = tokio::time::Instant::now() + self.config.global_timeout;
        for cb in callbacks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                log::warn!("shutdown global_timeout exceeded, forcing exit");
                self.notify.notify_waiters();
                std::process::exit(self.config.force_exit_code);
            }
            let per_callback = cb.timeout.unwrap_or(remaining).min(remaining);
            log::info!("running shutdown callback '{}' (priority {})", cb.name, cb.priority);
            let outcome = tokio::time::timeout(per_callback, cb.callback.invoke(())).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("shutdown callback '{}' failed: {e}", cb.name),
                Err(_) => log::warn!(
                    "shutdown callback '{}' exceeded its {:?} timeout, abandoning",
                    cb.name,
                    per_callback
                ),
            }
        }
        self.notify.notify_waiters();
    }

    /// Blocks until `trigger()` has run (or already has), up to
    /// `timeout`. Returns whether it triggered within the window.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        tokio::select! {
            _ = self.notify.notified() => true,
            _ = tokio::time::sleep(timeout) => self.is_shutting_down(),
        }
    }
}

/// RAII guard: installs on construction, triggers shutdown on drop
/// (best-effort, via a detached spawn since `Drop` cannot await),
/// unless already triggered.
pub struct ShutdownGuard {
    shutdown: Arc<GracefulShutdown>,
}

impl ShutdownGuard {
    pub fn new(shutdown: Arc<GracefulShutdown>) -> Result<Self> {
        shutdown.install()?;
        Ok(Self { shutdown })
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let shutdown = Arc::clone(&self.shutdown);
        if !shutdown.is_shutting_down() {
            tokio::spawn(async move {
                shutdown.trigger().await;
                shutdown.uninstall();
            });
        } else {
            shutdown.uninstall();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn ok_cb(order_log: Arc<StdMutex<Vec<&'static str>>>, name: &'static str) -> Callback<(), std::result::Result<(), String>> {
        Callback::asynchronous(move |_| {
            let order_log = order_log.clone();
            async move {
                order_log.lock().unwrap().push(name);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn priority_order_with_registration_tiebreak() {
        let shutdown = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        shutdown
            .register("a", ok_cb(log.clone(), "a"), 10, None)
            .await
            .unwrap();
        shutdown
            .register("b", ok_cb(log.clone(), "b"), 50, None)
            .await
            .unwrap();
        shutdown
            .register("c", ok_cb(log.clone(), "c"), 10, None)
            .await
            .unwrap();
        shutdown.trigger().await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let shutdown = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        shutdown
            .register(
                "once",
                Callback::asynchronous(move |_| {
                    let count = count2.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                100,
                None,
            )
            .await
            .unwrap();
        shutdown.trigger().await;
        shutdown.trigger().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let shutdown = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        shutdown
            .register("dup", ok_cb(log.clone(), "dup"), 100, None)
            .await
            .unwrap();
        let second = shutdown.register("dup", ok_cb(log, "dup"), 100, None).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn register_unregister_round_trip_is_idempotent() {
        let shutdown = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        shutdown
            .register("r", ok_cb(log.clone(), "r"), 100, None)
            .await
            .unwrap();
        assert!(shutdown.unregister("r").await);
        assert!(!shutdown.unregister("r").await);
        shutdown
            .register("r", ok_cb(log, "r"), 100, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn slow_callback_is_abandoned_without_blocking_the_rest() {
        let shutdown = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        shutdown
            .register(
                "slow",
                Callback::asynchronous(|_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }),
                10,
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        shutdown
            .register("fast", ok_cb(log.clone(), "fast"), 20, None)
            .await
            .unwrap();
        shutdown.trigger().await;
        assert_eq!(*log.lock().unwrap(), vec!["fast"]);
    }

    #[tokio::test]
    async fn install_is_refused_process_wide_while_another_instance_holds_it() {
        let first = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        first.install().unwrap();

        let second = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        assert!(second.install().is_err());
        assert!(!second.is_shutting_down());

        first.uninstall();
        let third = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
        third.install().unwrap();
        third.uninstall();
    }
}
