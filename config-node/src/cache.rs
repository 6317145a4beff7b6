//! Watch-fed mirror of the request and response filter switches.
//!
//! One delivery task per namespace owns that namespace's map and is its
//! only writer. Each event swaps in a new map through `ArcSwap`, so readers
//! take a snapshot without locking and never see a half-applied change.
//! Rule sets are not cached; `get_request_configs` lists and reads them
//! from the coordination service on every call.

use arc_swap::ArcSwap;
use futures::{stream, StreamExt};
use metrics::{counter, gauge};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::coordination::{path, ChildEvent, CoordinationClient};
use crate::error::{ConfigNodeError, Result};
use crate::model::{
    decode_switch, Namespace, RequestConfigs, RequestFilterConfig, ResponseConfigs,
    ResponseFilterConfig,
};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Filter name -> switch value
pub type SwitchSnapshot = Arc<BTreeMap<String, bool>>;

/// Switch map for one namespace
#[derive(Debug)]
struct NamespaceCache {
    namespace: Namespace,
    switches: ArcSwap<BTreeMap<String, bool>>,
    synced: watch::Sender<bool>,
}

impl NamespaceCache {
    fn new(namespace: Namespace) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            namespace,
            switches: ArcSwap::from_pointee(BTreeMap::new()),
            synced,
        }
    }

    fn snapshot(&self) -> SwitchSnapshot {
        self.switches.load_full()
    }

    fn decode(&self, name: &str, data: &[u8]) -> bool {
        decode_switch(data).unwrap_or_else(|e| {
            warn!(
                namespace = %self.namespace,
                filter = %name,
                error = %e,
                "Unparseable switch value, treating filter as disabled"
            );
            false
        })
    }

    fn record_size(&self, len: usize) {
        gauge!("config_cache_filters", len as f64, "namespace" => self.namespace.as_str());
    }

    /// Apply one delivered event
    fn apply(&self, event: ChildEvent) {
        counter!(
            "config_cache_events_total",
            1,
            "namespace" => self.namespace.as_str(),
            "kind" => event.kind()
        );
        debug!(
            namespace = %self.namespace,
            filter = %event.name(),
            kind = event.kind(),
            "Applying watch event"
        );

        let next = match event {
            ChildEvent::Added { name, data } | ChildEvent::Updated { name, data } => {
                let enabled = self.decode(&name, &data);
                let mut next = (**self.switches.load()).clone();
                next.insert(name, enabled);
                next
            }
            ChildEvent::Removed { name } => {
                let mut next = (**self.switches.load()).clone();
                next.remove(&name);
                next
            }
        };

        self.record_size(next.len());
        self.switches.store(Arc::new(next));
    }

    /// Rebuild the whole map from the coordination service
    async fn resync(&self, client: &CoordinationClient) -> Result<()> {
        let base = self.namespace.base_path();
        let names = match client.list_children(base).await {
            Ok(names) => names,
            Err(ConfigNodeError::NotFound(_)) => Default::default(),
            Err(e) => return Err(e),
        };

        let previous = self.snapshot();
        let mut next = BTreeMap::new();
        for name in names {
            let node_path = path::join(base, &name);
            match client.read(&node_path).await {
                Ok(data) => {
                    let enabled = self.decode(&name, &data);
                    next.insert(name, enabled);
                }
                Err(ConfigNodeError::NotFound(_)) => {}
                Err(e) => {
                    warn!(
                        path = %node_path,
                        error = %e,
                        "Failed to read switch during resync, keeping cached value"
                    );
                    if let Some(&enabled) = previous.get(&name) {
                        next.insert(name, enabled);
                    }
                }
            }
        }

        info!(namespace = %self.namespace, filters = next.len(), "Namespace cache synchronized");
        self.record_size(next.len());
        self.switches.store(Arc::new(next));
        Ok(())
    }

    /// Delivery loop: subscribe, resync, then apply events in arrival order
    async fn run(self: Arc<Self>, client: CoordinationClient, cancel: CancellationToken) {
        let base = self.namespace.base_path();

        loop {
            let mut events = match client.watch_children(base).await {
                Ok(events) => events,
                Err(ConfigNodeError::Closed) => return,
                Err(e) => {
                    warn!(
                        namespace = %self.namespace,
                        error = %e,
                        "Failed to subscribe to namespace, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
            };

            // Subscribed first, so anything written during the resync is
            // also in the event stream
            if let Err(e) = self.resync(&client).await {
                warn!(namespace = %self.namespace, error = %e, "Initial namespace resync failed");
            }
            self.synced.send_replace(true);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(namespace = %self.namespace, "Cache delivery task cancelled");
                        return;
                    }
                    item = events.next() => match item {
                        Some(Ok(event)) => self.apply(event),
                        Some(Err(e)) => {
                            warn!(
                                namespace = %self.namespace,
                                error = %e,
                                "Watch delivery error, resynchronizing"
                            );
                            counter!(
                                "config_cache_resyncs_total",
                                1,
                                "namespace" => self.namespace.as_str()
                            );
                            if let Err(e) = self.resync(&client).await {
                                warn!(
                                    namespace = %self.namespace,
                                    error = %e,
                                    "Namespace resync failed"
                                );
                            }
                        }
                        None => {
                            warn!(namespace = %self.namespace, "Watch stream ended, resubscribing");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }
}

/// Local, eventually consistent view of the filter configuration tree
#[derive(Debug)]
pub struct HierarchicalConfigCache {
    client: CoordinationClient,
    request: Arc<NamespaceCache>,
    response: Arc<NamespaceCache>,
    rule_read_concurrency: usize,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HierarchicalConfigCache {
    pub fn new(client: CoordinationClient, config: &CacheConfig) -> Self {
        Self {
            client,
            request: Arc::new(NamespaceCache::new(Namespace::Request)),
            response: Arc::new(NamespaceCache::new(Namespace::Response)),
            rule_read_concurrency: config.rule_read_concurrency.max(1),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn namespace(&self, namespace: Namespace) -> &Arc<NamespaceCache> {
        match namespace {
            Namespace::Request => &self.request,
            Namespace::Response => &self.response,
        }
    }

    /// Spawn the per-namespace delivery tasks; later calls are no-ops
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        for namespace in Namespace::ALL {
            let cache = Arc::clone(self.namespace(namespace));
            let client = self.client.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(cache.run(client, cancel)));
        }

        info!("✓ Configuration cache delivery tasks started");
    }

    /// Wait until both namespaces applied their initial snapshot
    pub async fn wait_until_synced(&self, timeout: Duration) -> Result<()> {
        let wait_all = async {
            for namespace in Namespace::ALL {
                let mut synced = self.namespace(namespace).synced.subscribe();
                while !*synced.borrow() {
                    if synced.changed().await.is_err() {
                        return Err(ConfigNodeError::Closed);
                    }
                }
            }
            Ok(())
        };

        tokio::time::timeout(timeout, wait_all).await.map_err(|_| {
            ConfigNodeError::Timeout(format!(
                "configuration cache not synchronized within {}ms",
                timeout.as_millis()
            ))
        })?
    }

    pub fn is_synced(&self) -> bool {
        Namespace::ALL
            .iter()
            .all(|&ns| *self.namespace(ns).synced.borrow())
    }

    /// The connection is suspended or lost; reads serve the last snapshot
    pub fn is_degraded(&self) -> bool {
        self.client.state().is_degraded()
    }

    /// Current switch map of a namespace
    pub fn switches(&self, namespace: Namespace) -> SwitchSnapshot {
        self.namespace(namespace).snapshot()
    }

    /// Request filters with their switches and current rules
    ///
    /// Rules are read at call time. A rule that cannot be read or parsed is
    /// left out and logged; a filter whose rules cannot be listed is
    /// reported with no rules. The call itself never fails.
    pub async fn get_request_configs(&self) -> RequestConfigs {
        let switches = self.request.snapshot();
        let mut configs = RequestConfigs::new();

        for (name, &enabled) in switches.iter() {
            let rules = self.read_rules(name).await;
            configs.insert(name.clone(), RequestFilterConfig { enabled, rules });
        }

        configs
    }

    /// Response filters with their switches
    pub async fn get_response_configs(&self) -> ResponseConfigs {
        self.response
            .snapshot()
            .iter()
            .map(|(name, &enabled)| (name.clone(), ResponseFilterConfig { enabled }))
            .collect()
    }

    async fn read_rules(&self, filter_name: &str) -> BTreeMap<String, bool> {
        let filter_path = path::join(Namespace::Request.base_path(), filter_name);

        let regexes = match self.client.list_children(&filter_path).await {
            Ok(regexes) => regexes,
            Err(e) => {
                warn!(filter = %filter_name, error = %e, "Failed to list rules, reporting none");
                return BTreeMap::new();
            }
        };

        let results: Vec<(String, Result<bool>)> = stream::iter(regexes)
            .map(|regex| {
                let rule_path = path::join(&filter_path, &regex);
                async move {
                    let result = self.read_rule(&rule_path).await;
                    (regex, result)
                }
            })
            .buffer_unordered(self.rule_read_concurrency)
            .collect()
            .await;

        let mut rules = BTreeMap::new();
        for (regex, result) in results {
            match result {
                Ok(enabled) => {
                    rules.insert(regex, enabled);
                }
                Err(e) => {
                    counter!("config_rule_read_failures_total", 1);
                    warn!(
                        filter = %filter_name,
                        regex = %regex,
                        error = %e,
                        "Skipping unreadable rule"
                    );
                }
            }
        }
        rules
    }

    async fn read_rule(&self, rule_path: &str) -> Result<bool> {
        let transient = |message: String| ConfigNodeError::TransientRead {
            path: rule_path.to_string(),
            message,
        };

        let data = self
            .client
            .read(rule_path)
            .await
            .map_err(|e| transient(e.to_string()))?;
        decode_switch(&data).map_err(|e| transient(e.to_string()))
    }

    /// Stop the delivery tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Cache delivery task ended abnormally");
            }
        }
        info!("Configuration cache stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CreateMode, MemoryStore};

    fn cache_with_store() -> (HierarchicalConfigCache, CoordinationClient) {
        let client = CoordinationClient::with_store(Arc::new(MemoryStore::new()));
        let cache = HierarchicalConfigCache::new(client.clone(), &CacheConfig::default());
        (cache, client)
    }

    #[test]
    fn test_apply_events() {
        let ns = NamespaceCache::new(Namespace::Response);
        ns.apply(ChildEvent::Added {
            name: "clickjack-filter".into(),
            data: b"false".to_vec(),
        });
        assert_eq!(ns.snapshot().get("clickjack-filter"), Some(&false));

        ns.apply(ChildEvent::Updated {
            name: "clickjack-filter".into(),
            data: b"true".to_vec(),
        });
        assert_eq!(ns.snapshot().get("clickjack-filter"), Some(&true));

        ns.apply(ChildEvent::Updated {
            name: "clickjack-filter".into(),
            data: b"garbage".to_vec(),
        });
        assert_eq!(ns.snapshot().get("clickjack-filter"), Some(&false));

        ns.apply(ChildEvent::Removed {
            name: "clickjack-filter".into(),
        });
        assert!(ns.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_is_stable_across_updates() {
        let ns = NamespaceCache::new(Namespace::Request);
        ns.apply(ChildEvent::Added {
            name: "ip-filter".into(),
            data: b"false".to_vec(),
        });
        let before = ns.snapshot();
        ns.apply(ChildEvent::Updated {
            name: "ip-filter".into(),
            data: b"true".to_vec(),
        });
        assert_eq!(before.get("ip-filter"), Some(&false));
        assert_eq!(ns.snapshot().get("ip-filter"), Some(&true));
    }

    #[tokio::test]
    async fn test_start_syncs_existing_state() {
        let (cache, client) = cache_with_store();
        client
            .create(
                "/waf/config/response/clickjack-filter",
                b"true",
                CreateMode::PERSISTENT_WITH_PARENTS,
            )
            .await
            .unwrap();

        cache.start().await;
        cache.wait_until_synced(Duration::from_secs(5)).await.unwrap();
        assert!(cache.is_synced());

        let configs = cache.get_response_configs().await;
        assert_eq!(configs.get("clickjack-filter"), Some(&ResponseFilterConfig { enabled: true }));
        assert!(cache.get_request_configs().await.is_empty());

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_rule_listing_reports_no_rules() {
        let (cache, _client) = cache_with_store();
        let rules = cache.read_rules("never-created").await;
        assert!(rules.is_empty());
    }
}
