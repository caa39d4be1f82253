//! The centerpiece: owns a single duplex WebSocket connection's lifecycle,
//! its subscription set, its reconnect policy, and exposes an async
//! frame stream to the consumer. Grounded on `binance::ws_handler::WsHandler`'s
//! connect/backoff/heartbeat loop, generalized into a full state machine.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::alert::SharedAlertSink;
use crate::clock::{Clock, SystemClock};
use crate::error::{ResilienceError, Result};
use crate::heartbeat::DeathWatch;
use crate::time_trigger::TimeTrigger;
use crate::ws::config::WebSocketManagerConfig;
use crate::ws::state::{ConnectionState, DisconnectReason, Frame, ReconnectDecision};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type AsyncHook<Out> = Arc<dyn Fn() -> BoxFuture<'static, Out> + Send + Sync>;
type AsyncHook1<Arg, Out> = Arc<dyn Fn(Arg) -> BoxFuture<'static, Out> + Send + Sync>;

#[derive(Default)]
pub struct WebSocketManagerCallbacks {
    pub on_connect: Option<AsyncHook<()>>,
    pub on_disconnect: Option<AsyncHook1<DisconnectReason, ()>>,
    pub on_message: Option<AsyncHook1<Frame, ()>>,
    pub should_disconnect: Option<AsyncHook<bool>>,
    pub should_reconnect: Option<AsyncHook<ReconnectDecision>>,
}

struct Inner {
    state: ConnectionState,
    is_shutdown: bool,
    reconnect_in_flight: bool,
}

pub struct WebSocketManager {
    config: WebSocketManagerConfig,
    stream_id: u64,
    clock: Arc<dyn Clock>,
    inner: AsyncMutex<Inner>,
    generation: Arc<AtomicU64>,
    subscriptions: AsyncMutex<HashSet<String>>,
    cancel: AsyncMutex<CancellationToken>,
    inbound_tx: mpsc::Sender<Frame>,
    inbound_rx: AsyncMutex<Option<mpsc::Receiver<Frame>>>,
    outbound_tx: mpsc::Sender<WsMessage>,
    outbound_rx: AsyncMutex<Option<mpsc::Receiver<WsMessage>>>,
    dropped_sends: AtomicU64,
    reconnect_attempt: AtomicU64,
    request_id: AtomicU64,
    pending_acks: AsyncMutex<HashMap<u64, oneshot::Sender<()>>>,
    pending_disconnect_reason: AsyncMutex<Option<DisconnectReason>>,
    last_traffic: AsyncMutex<std::time::Instant>,
    callbacks: WebSocketManagerCallbacks,
    alert_sink: Option<SharedAlertSink>,
    time_trigger: Option<TimeTrigger>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl WebSocketManager {
    pub fn new(config: WebSocketManagerConfig) -> Result<Arc<Self>> {
        Self::with_clock(config, Arc::new(SystemClock), WebSocketManagerCallbacks::default())
    }

    pub fn with_clock(
        config: WebSocketManagerConfig,
        clock: Arc<dyn Clock>,
        callbacks: WebSocketManagerCallbacks,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let queue_cap = if config.queue_size == 0 { 10_000 } else { config.queue_size };
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_cap.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_cap.max(1));
        Ok(Arc::new(Self {
            stream_id: NEXT_STREAM_ID.fetch_add(1, Ordering::SeqCst),
            clock,
            inner: AsyncMutex::new(Inner {
                state: ConnectionState::Disconnected,
                is_shutdown: false,
                reconnect_in_flight: false,
            }),
            generation: Arc::new(AtomicU64::new(0)),
            subscriptions: AsyncMutex::new(HashSet::new()),
            cancel: AsyncMutex::new(CancellationToken::new()),
            inbound_tx,
            inbound_rx: AsyncMutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: AsyncMutex::new(Some(outbound_rx)),
            dropped_sends: AtomicU64::new(0),
            reconnect_attempt: AtomicU64::new(0),
            request_id: AtomicU64::new(1),
            pending_acks: AsyncMutex::new(HashMap::new()),
            pending_disconnect_reason: AsyncMutex::new(None),
            last_traffic: AsyncMutex::new(std::time::Instant::now()),
            callbacks,
            alert_sink: None,
            time_trigger: None,
            tasks: AsyncMutex::new(Vec::new()),
            config,
        }))
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn is_shutdown(&self) -> bool {
        self.inner.lock().await.is_shutdown
    }

    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends.load(Ordering::Relaxed)
    }

    /// Starts the connection loop (connect, keepalive, reader, reconnect
    /// handling, proactive-disconnect controller) as background tasks.
    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.connection_loop().await;
        });
        self.tasks.lock().await.push(handle);

        if let Some(trigger) = self.time_trigger.clone() {
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                this.proactive_disconnect_loop(trigger).await;
            });
            self.tasks.lock().await.push(handle);
        }
    }

    async fn connection_loop(self: Arc<Self>) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.is_shutdown {
                    break;
                }
            }

            match self.connect_once().await {
                Ok(()) => {
                    // connect_once blocks (via handle_stream) until disconnect.
                }
                Err(e) => {
                    log::warn!("stream {}: connect failed: {e}", self.stream_id);
                    self.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                }
            }

            let is_shutdown = self.inner.lock().await.is_shutdown;
            if is_shutdown {
                break;
            }

            self.inner.lock().await.reconnect_in_flight = true;
            match self.decide_reconnect().await {
                ReconnectDecision::Never => {
                    self.inner.lock().await.reconnect_in_flight = false;
                    self.set_state(ConnectionState::Disconnected).await;
                    break;
                }
                ReconnectDecision::After(d) => {
                    self.set_state(ConnectionState::Reconnecting).await;
                    tokio::time::sleep(d).await;
                }
                ReconnectDecision::Now => {
                    self.set_state(ConnectionState::Reconnecting).await;
                }
            }
        }
        self.inner.lock().await.reconnect_in_flight = false;
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn decide_reconnect(&self) -> ReconnectDecision {
        if !self.config.auto_reconnect {
            return ReconnectDecision::Never;
        }
        if let Some(hook) = &self.callbacks.should_reconnect {
            return hook().await;
        }
        let attempt = self.reconnect_attempt.load(Ordering::SeqCst) as u32;
        if self.config.max_reconnect_attempts > 0 && attempt >= self.config.max_reconnect_attempts {
            log::error!("stream {}: reconnect attempts exhausted", self.stream_id);
            return ReconnectDecision::Never;
        }
        let delay = self.config.reconnect_strategy.delay_for_attempt(attempt + 1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        ReconnectDecision::After((delay + jitter).min(self.config.max_reconnect_delay))
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return;
        }
        inner.state = state;
    }

    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;
        log::info!("stream {}: connecting to {}", self.stream_id, self.config.url);

        let connect_fut = tokio_tungstenite::connect_async(&self.config.url);
        let (ws_stream, _response) = tokio::time::timeout(self.config.connection_timeout, connect_fut)
            .await
            .map_err(|_| ResilienceError::ConnectionFailed {
                cause: "connection_timeout elapsed".into(),
            })?
            .map_err(|e| ResilienceError::ConnectionFailed { cause: e.to_string() })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        *self.last_traffic.lock().await = std::time::Instant::now();
        self.set_state(ConnectionState::Connected).await;
        self.inner.lock().await.reconnect_in_flight = false;

        let (mut write, mut read) = ws_stream.split();

        self.resend_subscriptions(&mut write).await?;

        if let Some(hook) = &self.callbacks.on_connect {
            hook().await;
        }

        let new_cancel = CancellationToken::new();
        *self.cancel.lock().await = new_cancel.clone();

        let writer_handle = self.spawn_writer(write, new_cancel.clone());
        let keepalive_handle = self.spawn_keepalive(generation, new_cancel.clone());

        let disconnect_reason = self.read_loop(&mut read, generation, &new_cancel).await;

        new_cancel.cancel();
        let _ = writer_handle.await;
        let _ = keepalive_handle.await;

        self.handle_disconnect(disconnect_reason).await;
        Ok(())
    }

    async fn resend_subscriptions(
        &self,
        write: &mut (impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Result<()> {
        let subs = self.subscriptions.lock().await;
        if subs.is_empty() {
            return Ok(());
        }
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({
            "method": "SUBSCRIBE",
            "params": subs.iter().cloned().collect::<Vec<_>>(),
            "id": id,
        });
        write
            .send(WsMessage::Text(payload.to_string()))
            .await
            .map_err(|e| ResilienceError::ConnectionFailed { cause: e.to_string() })?;
        Ok(())
    }

    fn spawn_writer<S>(self: &Arc<Self>, mut write: S, cancel: CancellationToken) -> JoinHandle<()>
    where
        S: SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = this.outbound_rx.lock().await.take().expect("outbound receiver taken twice");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => {
                        match msg {
                            Some(m) => {
                                if write.send(m).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            *this.outbound_rx.lock().await = Some(rx);
        })
    }

    /// Pings on `ping_interval` but polls staleness on a tighter cadence --
    /// checking only once per ping would let detection drift up to a full
    /// extra `ping_interval` past `ping_interval + ping_timeout`.
    fn spawn_keepalive(self: &Arc<Self>, generation: u64, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ping_ticker = tokio::time::interval(this.config.ping_interval);
            let check_interval = ((this.config.ping_interval + this.config.ping_timeout) / 10)
                .max(Duration::from_millis(100));
            let mut check_ticker = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ping_ticker.tick() => {
                        if this.generation.load(Ordering::SeqCst) != generation {
                            break;
                        }
                        let _ = this.outbound_tx.try_send(WsMessage::Ping(Vec::new()));
                    }
                    _ = check_ticker.tick() => {
                        if this.generation.load(Ordering::SeqCst) != generation {
                            break;
                        }
                        let last = *this.last_traffic.lock().await;
                        if last.elapsed() > this.config.ping_interval + this.config.ping_timeout {
                            log::warn!("stream {}: keepalive timeout", this.stream_id);
                            this.set_state(ConnectionState::Disconnected).await;
                            if let Some(hook) = &this.callbacks.on_disconnect {
                                hook(DisconnectReason::KeepaliveTimeout).await;
                            }
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Returns the reason the connection ended. Only frames belonging to
    /// `generation` are forwarded; a stale reader exits immediately if
    /// the manager has already moved to a newer generation.
    async fn read_loop(
        &self,
        read: &mut (impl futures_util::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
        generation: u64,
        cancel: &CancellationToken,
    ) -> DisconnectReason {
        loop {
            if self.generation.load(Ordering::SeqCst) != generation {
                return DisconnectReason::NetworkError("superseded by newer generation".into());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self
                        .pending_disconnect_reason
                        .lock()
                        .await
                        .take()
                        .unwrap_or(DisconnectReason::UserRequested);
                }
                next = read.next() => {
                    match next {
                        Some(Ok(msg)) => {
                            *self.last_traffic.lock().await = std::time::Instant::now();
                            if self.generation.load(Ordering::SeqCst) != generation {
                                return DisconnectReason::NetworkError("superseded by newer generation".into());
                            }
                            match msg {
                                WsMessage::Text(text) => {
                                    if !self.maybe_complete_ack(&text).await {
                                        self.deliver(Frame::Text(text)).await;
                                    }
                                }
                                WsMessage::Binary(bin) => self.deliver(Frame::Binary(bin)).await,
                                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                                WsMessage::Close(frame) => {
                                    let (code, reason) = frame
                                        .map(|f| (f.code.into(), f.reason.to_string()))
                                        .unwrap_or((1000, String::new()));
                                    return DisconnectReason::PeerClose { code, reason };
                                }
                                WsMessage::Frame(_) => {}
                            }
                        }
                        Some(Err(e)) => return DisconnectReason::NetworkError(e.to_string()),
                        None => return DisconnectReason::NetworkError("stream ended".into()),
                    }
                }
            }
        }
    }

    async fn maybe_complete_ack(&self, text: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return false;
        };
        let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
            return false;
        };
        let mut pending = self.pending_acks.lock().await;
        if let Some(tx) = pending.remove(&id) {
            let _ = tx.send(());
            true
        } else {
            false
        }
    }

    async fn deliver(&self, frame: Frame) {
        if let Some(hook) = &self.callbacks.on_message {
            hook(frame.clone()).await;
        }
        let _ = self.inbound_tx.send(frame).await;
    }

    async fn handle_disconnect(&self, reason: DisconnectReason) {
        log::info!("stream {}: disconnected: {:?}", self.stream_id, reason);
        self.set_state(ConnectionState::Disconnected).await;
        if let Some(hook) = &self.callbacks.on_disconnect {
            hook(reason.clone()).await;
        }
        if matches!(reason, DisconnectReason::NetworkError(_) | DisconnectReason::KeepaliveTimeout) {
            self.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn proactive_disconnect_loop(self: Arc<Self>, trigger: TimeTrigger) {
        let mut ticker = tokio::time::interval(self.config.disconnect_check_interval);
        loop {
            ticker.tick().await;
            if self.is_shutdown().await {
                break;
            }
            let should = if let Some(hook) = &self.callbacks.should_disconnect {
                hook().await
            } else {
                trigger.should_trigger(self.config.disconnect_margin)
            };
            if should && self.state().await == ConnectionState::Connected {
                log::info!("stream {}: proactive disconnect cycle", self.stream_id);
                self.disconnect_with_reason(DisconnectReason::ProactiveCycle).await;
                tokio::time::sleep(self.config.reconnect_check_interval).await;
                self.reconnect_attempt.store(0, Ordering::SeqCst);
            }
        }
    }

    /// If a read loop is currently active (`CONNECTED`), hands it the
    /// reason and cancels its token -- it becomes the single place that
    /// calls `handle_disconnect`, avoiding a double `on_disconnect` fire.
    /// Otherwise there is nothing to cancel, so the hook runs here.
    async fn disconnect_with_reason(&self, reason: DisconnectReason) {
        if self.state().await == ConnectionState::Connected {
            *self.pending_disconnect_reason.lock().await = Some(reason);
            let cancel = self.cancel.lock().await.clone();
            cancel.cancel();
            return;
        }
        self.set_state(ConnectionState::Disconnected).await;
        if let Some(hook) = &self.callbacks.on_disconnect {
            hook(reason).await;
        }
    }

    pub async fn disconnect(&self) {
        self.disconnect_with_reason(DisconnectReason::UserRequested).await;
    }

    /// Synthetic external disconnect simulating a server kick. The
    /// manager remains reconnectable.
    pub async fn kill(&self) {
        self.disconnect_with_reason(DisconnectReason::NetworkError("killed".into())).await;
    }

    /// Terminal: latches `is_shutdown` and transitions to `CLOSED`.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.is_shutdown = true;
            inner.state = ConnectionState::Closed;
        }
        let cancel = self.cancel.lock().await.clone();
        cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub async fn subscribe(&self, streams: impl IntoIterator<Item = String>) -> Result<()> {
        {
            let mut subs = self.subscriptions.lock().await;
            for s in streams {
                subs.insert(s);
            }
        }
        self.send_subscription_delta("SUBSCRIBE").await
    }

    pub async fn unsubscribe(&self, streams: impl IntoIterator<Item = String>) -> Result<()> {
        {
            let mut subs = self.subscriptions.lock().await;
            for s in streams {
                subs.remove(&s);
            }
        }
        self.send_subscription_delta("UNSUBSCRIBE").await
    }

    async fn send_subscription_delta(&self, method: &str) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Ok(());
        }
        let streams: Vec<String> = self.subscriptions.lock().await.iter().cloned().collect();
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let payload = json!({ "method": method, "params": streams, "id": id });
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(id, tx);
        if self.outbound_tx.try_send(WsMessage::Text(payload.to_string())).is_err() {
            self.dropped_sends.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let _ = tokio::time::timeout(self.config.reconnect_check_interval, rx).await;
        Ok(())
    }

    /// Enqueues an outbound frame. Drops-newest on overflow, recording
    /// `dropped_sends`; never blocks longer than `reconnect_check_interval`.
    pub fn send(&self, frame: Frame) {
        let msg = match frame {
            Frame::Text(t) => WsMessage::Text(t),
            Frame::Binary(b) => WsMessage::Binary(b),
            Frame::Reconnected => return,
        };
        if self.outbound_tx.try_send(msg).is_err() {
            self.dropped_sends.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Consumer API. Only one outstanding stream is supported; a second
    /// call while one is checked out returns a configuration error.
    pub async fn stream(&self) -> Result<tokio_stream::wrappers::ReceiverStream<Frame>> {
        let rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ResilienceError::Configuration("stream already taken".into()))?;
        Ok(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    pub async fn trigger_reconnect(&self) {
        self.disconnect_with_reason(DisconnectReason::UserRequested).await;
    }
}

impl DeathWatch for WebSocketManager {
    fn is_dead(&self) -> bool {
        match self.inner.try_lock() {
            Ok(inner) => matches!(inner.state, ConnectionState::Disconnected | ConnectionState::Closed)
                && !inner.reconnect_in_flight,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_are_monotonic_capped() {
        use crate::ws::state::ReconnectStrategy;
        let strategy = ReconnectStrategy::ExponentialBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(strategy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn send_drops_newest_on_full_queue() {
        let mut config = WebSocketManagerConfig::new("wss://example.invalid/ws");
        config.queue_size = 2;
        let manager = WebSocketManager::new(config).unwrap();
        for _ in 0..4 {
            manager.send(Frame::Text("x".into()));
        }
        assert!(manager.dropped_sends() >= 2);
    }

    #[tokio::test]
    async fn second_stream_call_is_rejected() {
        let config = WebSocketManagerConfig::new("wss://example.invalid/ws");
        let manager = WebSocketManager::new(config).unwrap();
        let _first = manager.stream().await.unwrap();
        assert!(manager.stream().await.is_err());
    }
}
