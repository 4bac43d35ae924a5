use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crewdesk_observability::{emit_event, BridgeEvent, ProcessKind};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Level;

use crate::config::ReconnectPolicy;
use crate::error::{BridgeError, Result};
use crate::registry::Registry;
use crate::router::Router;
use crate::transport::{Link, LinkControl, Transport};

/// Backend link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Probe failed or the link dropped; reconnecting, pending requests kept
    /// until the grace period runs out.
    Degraded,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every state change. `generation` grows by one per link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub transport: String,
    pub generation: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub exhausted: bool,
    pub last_error: Option<String>,
    pub next_retry_in_ms: Option<u64>,
    pub degraded_for_ms: Option<u64>,
    pub stale_frames: u64,
}

/// Delay before reconnect attempt `attempt` (1-based), without jitter.
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let ms = (policy.base_delay_ms as f64 * policy.factor.powi(exponent))
        .min(policy.max_delay_ms as f64);
    Duration::from_millis(ms as u64)
}

/// Adds a random extra of up to `ratio * delay`.
pub fn jittered(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0.0..=ratio);
    delay + delay.mul_f64(extra)
}

struct ActiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    control: Arc<dyn LinkControl>,
    reader: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    link: Option<ActiveLink>,
    attempts: u32,
    exhausted: bool,
    last_error: Option<String>,
    next_retry_at: Option<Instant>,
    retry_task: Option<JoinHandle<()>>,
    degraded_since: Option<Instant>,
    grace_task: Option<JoinHandle<()>>,
}

impl Inner {
    fn cancel_retry(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        self.next_retry_at = None;
    }

    fn clear_degraded(&mut self) {
        if let Some(task) = self.grace_task.take() {
            task.abort();
        }
        self.degraded_since = None;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state == ConnectionState::Connected
            && self
                .link
                .as_ref()
                .is_some_and(|link| link.generation == generation)
    }
}

/// Lifecycle of the channel to the backend.
///
/// Inbound frames are handed to the [`Router`] only while the link that
/// produced them is the current one. Pending requests live in the shared
/// [`Registry`] and are failed here when the link is torn down for good.
pub struct Connection {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    grace: Duration,
    router: Arc<Router>,
    registry: Arc<Registry>,
    inner: Mutex<Inner>,
    /// Serializes connect/disconnect/retry so only one link is ever opening.
    lifecycle_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<ConnectionStatus>,
    stale_frames: AtomicU64,
}

impl Connection {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
        grace: Duration,
        router: Arc<Router>,
        registry: Arc<Registry>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            generation: 0,
        });
        Arc::new(Self {
            transport,
            policy,
            grace,
            router,
            registry,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                link: None,
                attempts: 0,
                exhausted: false,
                last_error: None,
                next_retry_at: None,
                retry_task: None,
                degraded_since: None,
                grace_task: None,
            }),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            status_tx,
            stale_frames: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        ConnectionSnapshot {
            state: inner.state,
            transport: self.transport.describe(),
            generation: inner.generation,
            attempts: inner.attempts,
            max_attempts: self.policy.max_attempts,
            exhausted: inner.exhausted,
            last_error: inner.last_error.clone(),
            next_retry_in_ms: inner
                .next_retry_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            degraded_for_ms: inner
                .degraded_since
                .map(|since| now.saturating_duration_since(since).as_millis() as u64),
            stale_frames: self.stale_frames.load(Ordering::Relaxed),
        }
    }

    /// Opens a link unless one is already up. Clears an exhausted retry state.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connected {
                tracing::debug!("backend link already connected");
                return Ok(());
            }
            if inner.exhausted {
                tracing::info!("explicit connect resets exhausted reconnect state");
            }
            inner.exhausted = false;
            inner.attempts = 0;
            inner.cancel_retry();
        }
        self.establish().await
    }

    /// Used by dispatch: connects on demand but refuses once retries are
    /// exhausted, until an explicit [`Connection::connect`].
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        if self.check_ready()? {
            return Ok(());
        }
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        if self.check_ready()? {
            return Ok(());
        }
        self.inner.lock().cancel_retry();
        self.establish().await
    }

    fn check_ready(&self) -> Result<bool> {
        let inner = self.inner.lock();
        if inner.state == ConnectionState::Connected {
            return Ok(true);
        }
        if inner.exhausted {
            return Err(BridgeError::ConnectionExhausted {
                attempts: inner.attempts,
                last_error: inner.last_error.clone().unwrap_or_default(),
            });
        }
        Ok(false)
    }

    pub async fn disconnect(&self) {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        let (link, was) = {
            let mut inner = self.inner.lock();
            inner.cancel_retry();
            inner.clear_degraded();
            inner.attempts = 0;
            inner.exhausted = false;
            let was = inner.state;
            inner.state = ConnectionState::Disconnected;
            self.publish(&inner);
            (inner.link.take(), was)
        };

        if let Some(link) = link {
            link.reader.abort();
            link.control.shutdown().await;
        }

        let failed = self
            .registry
            .fail_all(|| BridgeError::ConnectionClosed("connection closed".to_string()));
        if was != ConnectionState::Disconnected || failed > 0 {
            tracing::info!(failed, "disconnected from backend");
            self.emit(Level::INFO, "disconnected", None, None);
        }
    }

    /// Probes the current link. A failure moves Connected to Degraded and
    /// starts reconnecting.
    pub async fn health_check(self: &Arc<Self>) -> Result<()> {
        let (generation, control, outbound_closed) = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.link) {
                (ConnectionState::Connected, Some(link)) => (
                    link.generation,
                    link.control.clone(),
                    link.outbound.is_closed(),
                ),
                (state, _) => {
                    return Err(BridgeError::ConnectionLost(format!(
                        "backend link is {state}"
                    )))
                }
            }
        };

        let result = if outbound_closed {
            Err(BridgeError::ConnectionLost(
                "outbound channel closed".to_string(),
            ))
        } else {
            control.probe().await
        };
        if let Err(err) = &result {
            self.degrade(generation, err.to_string());
        }
        result
    }

    pub fn send(self: &Arc<Self>, frame: String) -> Result<()> {
        let generation = {
            let inner = self.inner.lock();
            match (&inner.state, &inner.link) {
                (ConnectionState::Connected, Some(link)) => {
                    if link.outbound.send(frame).is_ok() {
                        return Ok(());
                    }
                    link.generation
                }
                (state, _) => {
                    return Err(BridgeError::ConnectionLost(format!(
                        "cannot send while {state}"
                    )))
                }
            }
        };
        self.degrade(generation, "outbound channel closed".to_string());
        Err(BridgeError::ConnectionLost(
            "outbound channel closed".to_string(),
        ))
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        let previous = {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Connecting;
            self.publish(&inner);
            inner.link.take()
        };
        if let Some(previous) = previous {
            previous.reader.abort();
            previous.control.shutdown().await;
        }

        let attempt = self.inner.lock().attempts + 1;
        tracing::info!(
            transport = %self.transport.describe(),
            attempt,
            "opening backend link"
        );
        match self.transport.open().await {
            Ok(link) => {
                self.install(link);
                Ok(())
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn install(self: &Arc<Self>, link: Link) {
        let Link {
            outbound,
            mut inbound,
            control,
        } = link;

        let mut inner = self.inner.lock();
        inner.generation += 1;
        let generation = inner.generation;

        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let Some(conn) = weak.upgrade() else { return };
                conn.deliver(generation, &frame);
            }
            if let Some(conn) = weak.upgrade() {
                conn.degrade(generation, "backend closed the link".to_string());
            }
        });

        inner.link = Some(ActiveLink {
            generation,
            outbound,
            control,
            reader,
        });
        inner.state = ConnectionState::Connected;
        inner.attempts = 0;
        inner.last_error = None;
        inner.next_retry_at = None;
        inner.clear_degraded();
        self.publish(&inner);
        drop(inner);

        tracing::info!(generation, "backend link connected");
        self.emit(Level::INFO, "connected", None, None);
    }

    fn deliver(&self, generation: u64, frame: &str) {
        if !self.inner.lock().is_current(generation) {
            self.stale_frames.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(generation, "discarding frame from superseded link");
            return;
        }
        self.router.route(frame);
    }

    fn degrade(self: &Arc<Self>, generation: u64, reason: String) {
        let link = {
            let mut inner = self.inner.lock();
            if !inner.is_current(generation) {
                return;
            }
            inner.state = ConnectionState::Degraded;
            inner.last_error = Some(reason.clone());
            let since = Instant::now();
            inner.degraded_since = Some(since);
            if let Some(task) = inner.grace_task.take() {
                task.abort();
            }
            let weak = Arc::downgrade(self);
            let grace = self.grace;
            inner.grace_task = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(conn) = weak.upgrade() {
                    conn.grace_expired(since);
                }
            }));
            self.publish(&inner);
            inner.link.take()
        };

        tracing::warn!(generation, "backend link degraded: {}", reason);
        self.emit(Level::WARN, "degraded", None, Some(&reason));

        if let Some(link) = link {
            link.reader.abort();
            let control = link.control;
            tokio::spawn(async move { control.shutdown().await });
        }
        self.schedule_retry(Duration::ZERO);
    }

    fn grace_expired(&self, since: Instant) {
        {
            let mut inner = self.inner.lock();
            if inner.degraded_since != Some(since) || inner.state == ConnectionState::Connected {
                return;
            }
            inner.grace_task = None;
        }
        let grace_ms = self.grace.as_millis() as u64;
        let failed = self.registry.fail_all(|| {
            BridgeError::ConnectionLost(format!(
                "backend link down for longer than {grace_ms}ms"
            ))
        });
        if failed > 0 {
            tracing::warn!(failed, "grace period expired, failed pending requests");
        }
    }

    fn record_failure(self: &Arc<Self>, err: &BridgeError) {
        let mut inner = self.inner.lock();
        inner.attempts += 1;
        inner.last_error = Some(err.to_string());
        inner.state = ConnectionState::Disconnected;
        let attempts = inner.attempts;

        if attempts >= self.policy.max_attempts {
            inner.exhausted = true;
            inner.next_retry_at = None;
            inner.clear_degraded();
            self.publish(&inner);
            drop(inner);

            let last_error = err.to_string();
            let failed = self
                .registry
                .fail_all(|| BridgeError::ConnectionExhausted {
                    attempts,
                    last_error: last_error.clone(),
                });
            tracing::error!(
                attempts,
                failed,
                "giving up on backend link: {}",
                last_error
            );
            self.emit(Level::ERROR, "reconnect_exhausted", Some(attempts), Some(&last_error));
            return;
        }

        self.publish(&inner);
        drop(inner);

        let delay = jittered(
            backoff_delay(&self.policy, attempts),
            self.policy.jitter_ratio,
        );
        tracing::warn!(
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            "backend link failed: {}",
            err
        );
        self.emit(Level::WARN, "connect_failed", Some(attempts), Some(&err.to_string()));
        self.schedule_retry(delay);
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let mut inner = self.inner.lock();
        if inner.exhausted {
            return;
        }
        inner.cancel_retry();
        inner.next_retry_at = Some(Instant::now() + delay);
        inner.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(conn) = weak.upgrade() {
                conn.retry().await;
            }
        }));
    }

    async fn retry(self: &Arc<Self>) {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        {
            let mut inner = self.inner.lock();
            // Detach our own handle so a reschedule does not abort this task.
            inner.retry_task.take();
            inner.next_retry_at = None;
            if inner.exhausted || inner.state == ConnectionState::Connected {
                return;
            }
        }
        let _ = self.establish().await;
    }

    fn publish(&self, inner: &Inner) {
        let next = ConnectionStatus {
            state: inner.state,
            generation: inner.generation,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn emit(&self, level: Level, event: &str, attempt: Option<u32>, detail: Option<&str>) {
        let state = self.state();
        emit_event(
            level,
            ProcessKind::Shell,
            BridgeEvent {
                state: Some(state.as_str()),
                attempt,
                detail,
                ..BridgeEvent::new("connection", event)
            },
        );
    }
}
