use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use resilience_core::callback::Callback;
use resilience_core::heartbeat::{Heartbeat, HeartbeatConfig};
use resilience_core::shutdown::{GracefulShutdown, ShutdownConfig};
use resilience_core::watchdog::Watchdog;
use resilience_core::ws::{WebSocketManager, WebSocketManagerConfig};

const SYMBOL_STREAM: &str = "btcusdt@kline_1m";

/// Demo orchestration of the resilience core, grounded on the way the
/// original Python `ResilienceDemo` wires a stream manager to a
/// heartbeat and a watchdog and installs shutdown handling around the
/// whole thing. `manager` is rebuildable in place so `_on_target_dead`'s
/// restart can swap in a fresh one without tearing down the demo itself.
struct ResilienceDemo {
    url: String,
    manager: Mutex<Arc<WebSocketManager>>,
    restarting: AtomicBool,
}

impl ResilienceDemo {
    async fn new(url: &str) -> anyhow::Result<Arc<Self>> {
        let manager = Self::build_manager(url)?;
        Ok(Arc::new(Self {
            url: url.to_string(),
            manager: Mutex::new(manager),
            restarting: AtomicBool::new(false),
        }))
    }

    fn build_manager(url: &str) -> anyhow::Result<Arc<WebSocketManager>> {
        let config = WebSocketManagerConfig::new(url);
        WebSocketManager::new(config).map_err(anyhow::Error::from)
    }

    async fn start(self: &Arc<Self>) {
        let manager = self.manager.lock().await.clone();
        manager.start().await;
        if let Err(e) = manager.subscribe([SYMBOL_STREAM.to_string()]).await {
            log::warn!("subscribe failed: {e}");
        }
    }

    async fn stop(self: &Arc<Self>) -> Result<(), String> {
        self.manager.lock().await.shutdown().await;
        Ok(())
    }

    /// Mirrors the Python original's `_on_target_dead`: tears down the
    /// dead manager, builds a fresh one, starts it, and re-subscribes.
    /// `restarting` is set for the whole span so `is_dead()` does not
    /// report the old manager's death while the new one is still coming
    /// up, and is cleared on every exit path including failure so a
    /// subsequent heartbeat tick can retry.
    async fn restart(self: &Arc<Self>) {
        if self.restarting.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("monitored stream is dead, restarting");
        let old = self.manager.lock().await.clone();
        old.shutdown().await;

        match Self::build_manager(&self.url) {
            Ok(fresh) => {
                fresh.start().await;
                if let Err(e) = fresh.subscribe([SYMBOL_STREAM.to_string()]).await {
                    log::warn!("resubscribe after restart failed: {e}");
                }
                *self.manager.lock().await = fresh;
                log::info!("stream restarted");
            }
            Err(e) => {
                log::error!("failed to rebuild stream manager: {e}");
            }
        }
        self.restarting.store(false, Ordering::SeqCst);
    }
}

impl resilience_core::heartbeat::DeathWatch for ResilienceDemo {
    fn is_dead(&self) -> bool {
        // `DeathWatch::is_dead` is sync (polled off the heartbeat tick);
        // `restarting` and the manager swap are cheap enough to check
        // via `try_lock` without blocking that tick.
        if self.restarting.load(Ordering::SeqCst) {
            return false;
        }
        match self.manager.try_lock() {
            Ok(guard) => resilience_core::heartbeat::DeathWatch::is_dead(guard.as_ref()),
            Err(_) => false,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let _ = dotenv::dotenv();

    let url = std::env::var("RESILIENCE_DEMO_URL")
        .unwrap_or_else(|_| "wss://stream.binance.com:9443/ws".to_string());

    let demo = ResilienceDemo::new(&url).await?;
    demo.start().await;

    let heartbeat = Arc::new({
        let demo = demo.clone();
        Heartbeat::with_clock(
            HeartbeatConfig {
                interval: Duration::from_secs(5),
                state_file: Some(std::env::temp_dir().join("resilience_demo_heartbeat.json")),
                ..Default::default()
            },
            Arc::new(resilience_core::clock::SystemClock),
        )?
        .with_target(demo.clone())
        .with_on_target_dead(Callback::asynchronous(move |_| {
            let demo = demo.clone();
            async move { demo.restart().await }
        }))
    });
    heartbeat.start().await;

    let watchdog = Watchdog::new(Default::default())?;
    watchdog.start().await?;

    let shutdown = GracefulShutdown::new(ShutdownConfig::default())?;
    shutdown.install()?;

    {
        let demo = demo.clone();
        shutdown
            .register(
                "resilience-demo",
                Callback::asynchronous(move |_| {
                    let demo = demo.clone();
                    async move { demo.stop().await }
                }),
                10,
                None,
            )
            .await?;
    }
    {
        let heartbeat = heartbeat.clone();
        shutdown
            .register(
                "heartbeat",
                Callback::asynchronous(move |_| {
                    let heartbeat = heartbeat.clone();
                    async move {
                        heartbeat.shutdown().await;
                        Ok(())
                    }
                }),
                50,
                None,
            )
            .await?;
    }
    {
        let watchdog = watchdog.clone();
        shutdown
            .register(
                "watchdog",
                Callback::asynchronous(move |_| {
                    let watchdog = watchdog.clone();
                    async move {
                        watchdog.shutdown().await;
                        Ok(())
                    }
                }),
                50,
                None,
            )
            .await?;
    }

    log::info!("resilience demo running against {url}, press Ctrl-C to stop");
    shutdown.wait(Duration::from_secs(3600 * 24)).await;
    Ok(())
}
