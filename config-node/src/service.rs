use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::bootstrap::{BootstrapReport, Bootstrapper};
use crate::cache::HierarchicalConfigCache;
use crate::config::NodeConfig;
use crate::coordination::{ConnectionNotifier, ConnectionState, CoordinationClient};
use crate::error::Result;
use crate::model::{
    RequestConfigUpdate, RequestConfigs, ResponseConfigUpdate, ResponseConfigs,
};
use crate::mutation::ConfigMutationApi;
use crate::registry::FilterRegistry;

/// Cluster configuration service handed to the API layer
///
/// Owns the single coordination session and the watched cache. Built
/// once by `start` and released by `shutdown`; pass it around (usually in
/// an `Arc`) instead of looking it up globally.
#[derive(Debug)]
pub struct ClusterConfigService {
    client: CoordinationClient,
    cache: HierarchicalConfigCache,
    mutations: ConfigMutationApi,
    bootstrap_report: BootstrapReport,
}

impl ClusterConfigService {
    /// Connect, seed the filter namespace and start the cache
    ///
    /// Fails if the coordination service cannot be reached within the
    /// retry budget or the bootstrap cannot complete.
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        Self::start_with_notifier(config, Arc::new(ConnectionNotifier::new())).await
    }

    /// Same as `start`, reporting state and errors through `notifier`
    ///
    /// Subscribe to the notifier first to observe a startup that never
    /// reaches the coordination service.
    pub async fn start_with_notifier(
        config: &NodeConfig,
        notifier: Arc<ConnectionNotifier>,
    ) -> Result<Self> {
        let client =
            CoordinationClient::connect_with_notifier(&config.coordination, notifier).await?;
        Self::start_with_client(client, config).await
    }

    /// Same as `start`, over an already-connected client
    ///
    /// A call timeout set in `config` replaces the client's own.
    pub async fn start_with_client(
        client: CoordinationClient,
        config: &NodeConfig,
    ) -> Result<Self> {
        let client = match config.coordination.call_timeout() {
            Some(timeout) => client.with_call_timeout(Some(timeout)),
            None => client,
        };
        let bootstrap_report = Self::bootstrap(&client, &config.filters).await?;

        let cache = HierarchicalConfigCache::new(client.clone(), &config.cache);
        cache.start().await;
        if let Err(e) = cache
            .wait_until_synced(config.cache.initial_sync_timeout())
            .await
        {
            warn!(error = %e, "Serving before the configuration cache finished its initial sync");
        }

        info!(
            backend = client.backend_name(),
            seeded = bootstrap_report.created.len(),
            "🌐 Cluster configuration service started"
        );

        Ok(Self {
            mutations: ConfigMutationApi::new(client.clone()),
            client,
            cache,
            bootstrap_report,
        })
    }

    async fn bootstrap(
        client: &CoordinationClient,
        registry: &FilterRegistry,
    ) -> Result<BootstrapReport> {
        let bootstrapper = Bootstrapper::new(client.clone(), registry.clone());
        match bootstrapper.bootstrap().await {
            Ok(report) => Ok(report),
            Err(e) => {
                client.notifier().report_error(format!("bootstrap failed: {}", e));
                if let Err(close_error) = client.close().await {
                    warn!(
                        error = %close_error,
                        "Failed to close coordination client after bootstrap failure"
                    );
                }
                Err(e)
            }
        }
    }

    pub fn bootstrap_report(&self) -> &BootstrapReport {
        &self.bootstrap_report
    }

    pub fn cache(&self) -> &HierarchicalConfigCache {
        &self.cache
    }

    pub fn mutations(&self) -> &ConfigMutationApi {
        &self.mutations
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.client.subscribe_state()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.client.subscribe_errors()
    }

    pub async fn get_request_configs(&self) -> RequestConfigs {
        self.cache.get_request_configs().await
    }

    pub async fn get_response_configs(&self) -> ResponseConfigs {
        self.cache.get_response_configs().await
    }

    pub async fn set_request_switch(&self, filter_name: &str, enabled: bool) -> Result<()> {
        self.mutations.set_request_switch(filter_name, enabled).await
    }

    pub async fn set_request_rule(
        &self,
        filter_name: &str,
        regex: &str,
        enabled: bool,
    ) -> Result<()> {
        self.mutations
            .set_request_rule(filter_name, regex, enabled)
            .await
    }

    pub async fn delete_request_rule(&self, filter_name: &str, regex: &str) -> Result<()> {
        self.mutations.delete_request_rule(filter_name, regex).await
    }

    pub async fn set_response_switch(&self, filter_name: &str, enabled: bool) -> Result<()> {
        self.mutations.set_response_switch(filter_name, enabled).await
    }

    pub async fn apply_request_update(&self, update: &RequestConfigUpdate) -> Result<()> {
        self.mutations.apply_request_update(update).await
    }

    pub async fn apply_response_update(&self, update: &ResponseConfigUpdate) -> Result<()> {
        self.mutations.apply_response_update(update).await
    }

    pub async fn delete_request_rules<I, S>(&self, filter_name: &str, regexes: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mutations.delete_request_rules(filter_name, regexes).await
    }

    /// Cancel the watch subscriptions and close the session
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down cluster configuration service");
        self.cache.shutdown().await;
        self.client.close().await
    }
}

/// Shared handle type for consumers
pub type SharedConfigService = Arc<ClusterConfigService>;
