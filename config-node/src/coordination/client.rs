use metrics::{counter, histogram};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::{
    ChildEventStream, ConnectionState, CoordinationStore, CreateMode, MemoryStore, NatsKvStore,
    RetryPolicy,
};
use crate::config::{CoordinationBackend, CoordinationConfig};
use crate::error::{ConfigNodeError, Result};

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Connection-state and error fan-out shared between the client and its backend
#[derive(Debug)]
pub struct ConnectionNotifier {
    state: watch::Sender<ConnectionState>,
    errors: broadcast::Sender<String>,
    /// Consecutive failed reconnect attempts since the last connect
    reconnect_failures: AtomicU32,
}

impl ConnectionNotifier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            state,
            errors,
            reconnect_failures: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    /// Record a state transition, logging it once
    pub fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state.send_replace(new_state);
        if old_state != new_state {
            info!(
                old_state = %old_state,
                new_state = %new_state,
                "Coordination connection state changed"
            );
        }
    }

    /// Backend (re)established its session
    pub fn connected(&self) {
        self.reconnect_failures.store(0, Ordering::Relaxed);
        let next = match self.state() {
            ConnectionState::Suspended | ConnectionState::Lost => ConnectionState::Reconnected,
            ConnectionState::Closed => return,
            _ => ConnectionState::Connected,
        };
        self.set_state(next);
    }

    /// Backend lost its session but may recover
    pub fn suspended(&self) {
        if self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Suspended);
        }
    }

    /// One reconnect attempt failed while the session was suspended
    ///
    /// After `budget` consecutive failures the session is declared `Lost`
    /// and the loss is published once. A later successful connect still
    /// moves it to `Reconnected`. Returns `true` if this call lost it.
    pub fn reconnect_failed(&self, budget: u32, reason: &str) -> bool {
        if !matches!(self.state(), ConnectionState::Suspended) {
            return false;
        }
        let failures = self.reconnect_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(failures = failures, budget = budget, error = %reason, "Reconnect attempt failed");
        if failures < budget {
            return false;
        }
        self.set_state(ConnectionState::Lost);
        self.report_error(format!(
            "coordination session lost after {} failed reconnects: {}",
            failures, reason
        ));
        true
    }

    /// Publish an unrecoverable or unexpected error to listeners
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(error = %message, "Coordination service error");
        counter!("coordination_errors_reported_total", 1);
        // Nobody listening is fine
        let _ = self.errors.send(message);
    }
}

impl Default for ConnectionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared connection to the coordination service
///
/// Wraps a `CoordinationStore` with the node's retry policy, optional
/// per-call timeout, metrics and connection-state notification. Cheap to
/// clone; every clone talks over the same session.
#[derive(Clone)]
pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    notifier: Arc<ConnectionNotifier>,
    call_timeout: Option<Duration>,
}

impl std::fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("backend", &self.store.backend_name())
            .field("state", &self.notifier.state())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl CoordinationClient {
    /// Connect to the configured backend, retrying with exponential backoff
    pub async fn connect(config: &CoordinationConfig) -> Result<Self> {
        Self::connect_with_notifier(config, Arc::new(ConnectionNotifier::new())).await
    }

    /// Same as `connect`, reporting through a caller-owned notifier
    ///
    /// Once the retry budget is spent the state becomes `Lost`, the failure
    /// is published on the error channel and `Connection` is returned, so
    /// listeners subscribed beforehand observe a failed startup too.
    pub async fn connect_with_notifier(
        config: &CoordinationConfig,
        notifier: Arc<ConnectionNotifier>,
    ) -> Result<Self> {
        let policy = &config.retry;

        info!(
            backend = ?config.backend,
            max_retries = policy.max_retries,
            "Connecting to coordination service"
        );

        let mut retries = 0;
        let store = loop {
            match Self::open_store(config, &notifier).await {
                Ok(store) => break store,
                Err(e) if policy.should_retry(retries) => {
                    let delay = policy.delay(retries);
                    warn!(
                        error = %e,
                        attempt = retries + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        "Coordination service connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => {
                    let err = ConfigNodeError::Connection {
                        attempts: retries + 1,
                        message: e.to_string(),
                    };
                    notifier.set_state(ConnectionState::Lost);
                    notifier.report_error(err.to_string());
                    return Err(err);
                }
            }
        };

        notifier.connected();
        info!(backend = store.backend_name(), "Connected to coordination service");

        Ok(Self {
            store,
            notifier,
            call_timeout: config.call_timeout(),
        })
    }

    /// Wrap an already-open store
    pub fn with_store(store: Arc<dyn CoordinationStore>) -> Self {
        let notifier = Arc::new(ConnectionNotifier::new());
        notifier.connected();
        Self {
            store,
            notifier,
            call_timeout: None,
        }
    }

    /// Apply a per-call timeout to every coordination call
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    async fn open_store(
        config: &CoordinationConfig,
        notifier: &Arc<ConnectionNotifier>,
    ) -> Result<Arc<dyn CoordinationStore>> {
        match config.backend {
            CoordinationBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            CoordinationBackend::Nats => {
                let store = NatsKvStore::connect(config, Arc::clone(notifier)).await?;
                Ok(Arc::new(store))
            }
        }
    }

    pub fn notifier(&self) -> &Arc<ConnectionNotifier> {
        &self.notifier
    }

    pub fn state(&self) -> ConnectionState {
        self.notifier.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.notifier.subscribe_state()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.notifier.subscribe_errors()
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Run one store call with timeout, metrics and closed-state checks
    async fn call<T, F>(&self, op: &'static str, path: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.notifier.state() == ConnectionState::Closed {
            return Err(ConfigNodeError::Closed);
        }

        let start = Instant::now();
        let result = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(ConfigNodeError::Timeout(format!(
                    "{} {} exceeded {}ms",
                    op,
                    path,
                    limit.as_millis()
                ))),
            },
            None => fut.await,
        };

        counter!("coordination_calls_total", 1, "op" => op);
        histogram!("coordination_call_duration_seconds", start.elapsed().as_secs_f64(), "op" => op);

        if let Err(e) = &result {
            counter!("coordination_call_errors_total", 1, "op" => op, "kind" => e.kind());
            debug!(op = op, path = %path, error = %e, "Coordination call failed");
        }
        result
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.call("exists", path, self.store.exists(path)).await
    }

    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<()> {
        self.call("create", path, self.store.create(path, data, mode)).await
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.call("read", path, self.store.read(path)).await
    }

    pub async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.call("write", path, self.store.write(path, data)).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.call("delete", path, self.store.delete(path)).await
    }

    pub async fn list_children(&self, path: &str) -> Result<BTreeSet<String>> {
        self.call("list_children", path, self.store.list_children(path))
            .await
    }

    pub async fn watch_children(&self, path: &str) -> Result<ChildEventStream> {
        self.call("watch_children", path, self.store.watch_children(path))
            .await
    }

    /// Close the session; further calls fail with `Closed`
    pub async fn close(&self) -> Result<()> {
        if self.notifier.state() == ConnectionState::Closed {
            return Ok(());
        }
        let result = self.store.close().await;
        self.notifier.set_state(ConnectionState::Closed);
        info!(backend = self.store.backend_name(), "Coordination client closed");
        result
    }
}
