//! NATS JetStream key-value backend.
//!
//! The node tree is flattened into one KV bucket. Each path segment is
//! escaped so it only uses key-safe characters and the segments are joined
//! with `.`, the NATS token separator:
//!
//! `/waf/config/request/ip-filter` -> `waf.config.request.ip-filter`
//!
//! Bytes outside `[A-Za-z0-9_-]` are written as `=HH` (upper-case hex), so a
//! rule such as `10\.0\.0\.1` is stored as `10=5C=2E0=5C=2E0=5C=2E1`. A watch
//! on `<parent>.*` then yields exactly the direct children of `parent`.

use async_nats::jetstream::{self, kv};
use async_nats::{ConnectOptions, Event};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::path;
use super::{
    ChildEvent, ChildEventStream, ConnectionNotifier, ConnectionState, CoordinationStore,
    CreateMode,
};
use crate::config::CoordinationConfig;
use crate::error::{ConfigNodeError, Result};

const WATCH_BUFFER: usize = 256;

/// Coordination store backed by a JetStream KV bucket
pub struct NatsKvStore {
    client: async_nats::Client,
    kv: kv::Store,
    bucket: String,
    closed: AtomicBool,
    /// Stops the watch forwarding tasks on close
    shutdown: CancellationToken,
}

impl std::fmt::Debug for NatsKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsKvStore")
            .field("bucket", &self.bucket)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn backend_error(op: &str, key: &str, err: impl Display) -> ConfigNodeError {
    ConfigNodeError::Backend(format!("{} {}: {}", op, key, err))
}

fn is_key_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

/// Escape one path segment into a single NATS subject token
pub fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for &byte in segment.as_bytes() {
        if is_key_safe(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("={:02X}", byte));
        }
    }
    out
}

/// Reverse `escape_segment`
pub fn unescape_segment(token: &str) -> Result<String> {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            let hex = token.get(i + 1..i + 3).ok_or_else(|| {
                ConfigNodeError::InvalidPath(format!("truncated escape in {:?}", token))
            })?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                ConfigNodeError::InvalidPath(format!("bad escape {:?} in {:?}", hex, token))
            })?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|e| ConfigNodeError::InvalidPath(format!("{:?} is not UTF-8: {}", token, e)))
}

/// KV key for an absolute node path; the root has no key
pub fn path_to_key(node_path: &str) -> Result<Option<String>> {
    path::validate(node_path)?;
    if node_path == path::ROOT {
        return Ok(None);
    }
    let key = path::segments(node_path)
        .map(escape_segment)
        .collect::<Vec<_>>()
        .join(".");
    Ok(Some(key))
}

/// Node path for a KV key
pub fn key_to_path(key: &str) -> Result<String> {
    let mut node_path = String::new();
    for token in key.split('.') {
        node_path.push(path::SEPARATOR);
        node_path.push_str(&unescape_segment(token)?);
    }
    Ok(node_path)
}

fn require_key(node_path: &str) -> Result<String> {
    path_to_key(node_path)?.ok_or_else(|| {
        ConfigNodeError::InvalidPath("the root node has no value".to_string())
    })
}

/// Prefix that direct children keys of `parent_key` start with
fn child_prefix(parent_key: Option<&str>) -> String {
    match parent_key {
        Some(key) => format!("{}.", key),
        None => String::new(),
    }
}

/// Child name if `key` is a direct child under `prefix`
fn direct_child(prefix: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() || rest.contains('.') {
        return None;
    }
    unescape_segment(rest).ok()
}

impl NatsKvStore {
    /// Connect to NATS and open (or create) the configuration bucket
    ///
    /// Connection events are forwarded to `notifier`: a disconnect suspends
    /// the session and a connect restores it. The client keeps reconnecting
    /// on its own, so a suspended session is declared lost once
    /// `max_reconnect_failures` attempts in a row have failed. Other client
    /// and server errors are published on the error channel.
    pub async fn connect(
        config: &CoordinationConfig,
        notifier: Arc<ConnectionNotifier>,
    ) -> Result<Self> {
        let servers = config.nats_servers.join(",");
        let connection_name = config
            .connection_name
            .clone()
            .unwrap_or_else(|| format!("waf-config-node-{}", Uuid::new_v4()));

        info!(
            servers = %servers,
            bucket = %config.bucket,
            connection_name = %connection_name,
            "Connecting to NATS server"
        );

        let callback_notifier = Arc::clone(&notifier);
        let reconnect_budget = config.max_reconnect_failures;
        let options = ConnectOptions::new()
            .name(connection_name)
            .connection_timeout(config.connect_timeout())
            .event_callback(move |event| {
                let notifier = Arc::clone(&callback_notifier);
                async move {
                    match event {
                        Event::Connected => notifier.connected(),
                        Event::Disconnected => notifier.suspended(),
                        Event::ServerError(err) => {
                            notifier.report_error(format!("NATS server error: {:?}", err))
                        }
                        Event::ClientError(err) => {
                            let reason = err.to_string();
                            if notifier.state() == ConnectionState::Suspended {
                                notifier.reconnect_failed(reconnect_budget, &reason);
                            } else {
                                notifier.report_error(format!("NATS client error: {}", reason));
                            }
                        }
                        other => debug!(event = ?other, "NATS connection event"),
                    }
                }
            });

        let client = async_nats::connect_with_options(servers.as_str(), options)
            .await
            .map_err(|e| backend_error("connect", &servers, e))?;

        let jetstream = jetstream::new(client.clone());
        let kv = match jetstream.get_key_value(config.bucket.as_str()).await {
            Ok(kv) => kv,
            Err(e) => {
                debug!(bucket = %config.bucket, error = %e, "Bucket not found, creating it");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: config.bucket.clone(),
                        description: "WAF cluster filter configuration".to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| backend_error("create bucket", &config.bucket, e))?
            }
        };

        info!(bucket = %config.bucket, "Opened NATS key-value bucket");

        Ok(Self {
            client,
            kv,
            bucket: config.bucket.clone(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ConfigNodeError::Closed)
        } else {
            Ok(())
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .kv
            .get(key)
            .await
            .map_err(|e| backend_error("get", key, e))?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Children of `parent_key` by scanning bucket keys
    async fn child_names(&self, parent_key: Option<&str>) -> Result<BTreeSet<String>> {
        let prefix = child_prefix(parent_key);
        let mut keys = self
            .kv
            .keys()
            .await
            .map_err(|e| backend_error("keys", &self.bucket, e))?;

        let mut names = BTreeSet::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| backend_error("keys", &self.bucket, e))?;
            if let Some(name) = direct_child(&prefix, &key) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Create one key atomically; an existing key yields `AlreadyExists`
    ///
    /// The write is conditional on the key's last revision: 0 for a key
    /// never written, the tombstone's revision for a deleted one.
    async fn create_key(&self, node_path: &str, key: &str, data: &[u8]) -> Result<()> {
        let entry = self
            .kv
            .entry(key)
            .await
            .map_err(|e| backend_error("entry", key, e))?;
        let expected_revision = match entry {
            None => 0,
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => {
                return Err(ConfigNodeError::AlreadyExists(node_path.to_string()));
            }
            Some(entry) => entry.revision,
        };

        match self
            .kv
            .update(key, data.to_vec().into(), expected_revision)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.key_exists(key).await? {
                    Err(ConfigNodeError::AlreadyExists(node_path.to_string()))
                } else {
                    Err(backend_error("create", key, e))
                }
            }
        }
    }
}

/// Map one watched entry to a child event
///
/// Deletions of children never seen as present are dropped; the history
/// replay delivers them for keys removed before the watch started.
fn child_event(
    prefix: &str,
    entry: kv::Entry,
    seen: &mut HashSet<String>,
) -> Option<ChildEvent> {
    let Some(name) = direct_child(prefix, &entry.key) else {
        warn!(key = %entry.key, "Ignoring undecodable key in watch");
        return None;
    };
    match entry.operation {
        kv::Operation::Put => {
            let data = entry.value.to_vec();
            if seen.insert(name.clone()) {
                Some(ChildEvent::Added { name, data })
            } else {
                Some(ChildEvent::Updated { name, data })
            }
        }
        kv::Operation::Delete | kv::Operation::Purge => {
            if seen.remove(&name) {
                Some(ChildEvent::Removed { name })
            } else {
                None
            }
        }
    }
}

/// Forward a bucket watch into `events` until the receiver goes away or
/// the store is closed
///
/// Owns its `kv::Store` handle since the watch borrows it for its whole
/// lifetime. Subscription failure is reported once through `ready`.
async fn forward_watch(
    kv: kv::Store,
    subject: String,
    prefix: String,
    events: mpsc::Sender<Result<ChildEvent>>,
    ready: oneshot::Sender<Result<()>>,
    shutdown: CancellationToken,
) {
    let watch = match kv.watch_with_history(subject.as_str()).await {
        Ok(watch) => watch,
        Err(e) => {
            let _ = ready.send(Err(backend_error("watch", &subject, e)));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    tokio::pin!(watch);

    let mut seen = HashSet::new();
    loop {
        let entry = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = events.closed() => break,
            entry = watch.next() => entry,
        };
        let event = match entry {
            Some(Ok(entry)) => match child_event(&prefix, entry, &mut seen) {
                Some(event) => Ok(event),
                None => continue,
            },
            Some(Err(e)) => Err(backend_error("watch", &subject, e)),
            None => break,
        };
        if events.send(event).await.is_err() {
            break;
        }
    }

    debug!(subject = %subject, "NATS watch forwarder stopped");
}

#[async_trait]
impl CoordinationStore for NatsKvStore {
    fn backend_name(&self) -> &'static str {
        "nats"
    }

    async fn exists(&self, node_path: &str) -> Result<bool> {
        self.check_open()?;
        match path_to_key(node_path)? {
            Some(key) => self.key_exists(&key).await,
            None => Ok(true),
        }
    }

    async fn create(&self, node_path: &str, data: &[u8], mode: CreateMode) -> Result<()> {
        self.check_open()?;
        if !mode.persistent {
            return Err(ConfigNodeError::Backend(
                "ephemeral nodes are not supported by the NATS backend".to_string(),
            ));
        }
        let key = require_key(node_path)?;

        for ancestor in path::ancestors(node_path) {
            let ancestor_key = require_key(&ancestor)?;
            if self.key_exists(&ancestor_key).await? {
                continue;
            }
            if !mode.create_parents {
                return Err(ConfigNodeError::NotFound(ancestor));
            }
            match self.create_key(&ancestor, &ancestor_key, &[]).await {
                Ok(()) | Err(ConfigNodeError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.create_key(node_path, &key, data).await?;
        debug!(path = %node_path, key = %key, "Created node");
        Ok(())
    }

    async fn read(&self, node_path: &str) -> Result<Vec<u8>> {
        self.check_open()?;
        let key = require_key(node_path)?;
        self.get(&key)
            .await?
            .ok_or_else(|| ConfigNodeError::NotFound(node_path.to_string()))
    }

    async fn write(&self, node_path: &str, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let key = require_key(node_path)?;
        if !self.key_exists(&key).await? {
            return Err(ConfigNodeError::NotFound(node_path.to_string()));
        }
        self.kv
            .put(key.as_str(), data.to_vec().into())
            .await
            .map_err(|e| backend_error("put", &key, e))?;
        Ok(())
    }

    async fn delete(&self, node_path: &str) -> Result<()> {
        self.check_open()?;
        let key = require_key(node_path)?;
        if !self.key_exists(&key).await? {
            return Err(ConfigNodeError::NotFound(node_path.to_string()));
        }
        if !self.child_names(Some(&key)).await?.is_empty() {
            return Err(ConfigNodeError::NotEmpty(node_path.to_string()));
        }
        self.kv
            .delete(key.as_str())
            .await
            .map_err(|e| backend_error("delete", &key, e))?;
        debug!(path = %node_path, key = %key, "Deleted node");
        Ok(())
    }

    async fn list_children(&self, node_path: &str) -> Result<BTreeSet<String>> {
        self.check_open()?;
        let key = path_to_key(node_path)?;
        if let Some(key) = &key {
            if !self.key_exists(key).await? {
                return Err(ConfigNodeError::NotFound(node_path.to_string()));
            }
        }
        self.child_names(key.as_deref()).await
    }

    async fn watch_children(&self, node_path: &str) -> Result<ChildEventStream> {
        self.check_open()?;
        let parent_key = path_to_key(node_path)?;
        let prefix = child_prefix(parent_key.as_deref());
        let subject = format!("{}*", prefix);

        // History replay delivers the latest entry per key first, which
        // becomes the initial `Added` batch
        let (events_tx, events_rx) = mpsc::channel(WATCH_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(forward_watch(
            self.kv.clone(),
            subject.clone(),
            prefix,
            events_tx,
            ready_tx,
            self.shutdown.child_token(),
        ));

        match ready_rx.await {
            Ok(Ok(())) => Ok(ReceiverStream::new(events_rx).boxed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConfigNodeError::Backend(format!(
                "watch on {} stopped before subscribing",
                subject
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.client
            .flush()
            .await
            .map_err(|e| backend_error("flush", &self.bucket, e))?;
        info!(bucket = %self.bucket, "Closed NATS key-value store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_segment() {
        assert_eq!(escape_segment("ip-filter"), "ip-filter");
        assert_eq!(escape_segment(r"10\.0\.0\.1"), "10=5C=2E0=5C=2E0=5C=2E1");
        assert_eq!(escape_segment("a=b"), "a=3Db");
        assert_eq!(escape_segment("a b*"), "a=20b=2A");
    }

    #[test]
    fn test_unescape_segment() {
        assert_eq!(unescape_segment("10=5C=2E0=5C=2E0=5C=2E1").unwrap(), r"10\.0\.0\.1");
        assert!(unescape_segment("bad=4").is_err());
        assert!(unescape_segment("bad=ZZ").is_err());
    }

    #[test]
    fn test_path_key_mapping() {
        assert_eq!(
            path_to_key("/waf/config/request/ip-filter").unwrap().unwrap(),
            "waf.config.request.ip-filter"
        );
        assert_eq!(path_to_key("/").unwrap(), None);
        assert_eq!(
            key_to_path("waf.config.request.ip-filter").unwrap(),
            "/waf/config/request/ip-filter"
        );
    }

    #[test]
    fn test_direct_child() {
        let prefix = child_prefix(Some("waf.config.request"));
        assert_eq!(
            direct_child(&prefix, "waf.config.request.ip-filter"),
            Some("ip-filter".to_string())
        );
        assert_eq!(direct_child(&prefix, "waf.config.request.ip-filter.rule"), None);
        assert_eq!(direct_child(&prefix, "waf.config.response.x"), None);
        assert_eq!(direct_child(&child_prefix(None), "waf"), Some("waf".to_string()));
    }
}
