use metrics::counter;
use tracing::{debug, info, warn};

use crate::coordination::{CoordinationClient, CreateMode};
use crate::error::{ConfigNodeError, Result};
use crate::model::encode_switch;
use crate::registry::FilterRegistry;

/// Outcome of seeding the filter namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Paths created with the default switch
    pub created: Vec<String>,
    /// Paths left untouched because they were already initialized
    pub existing: Vec<String>,
}

/// Seeds a switch node for every known filter
///
/// Existing nodes are never overwritten, so switches an administrator set
/// before a restart survive it. The existence check and the create are two
/// calls; losing the race to another node shows up as `AlreadyExists` and
/// counts as already initialized.
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    client: CoordinationClient,
    registry: FilterRegistry,
}

impl Bootstrapper {
    pub fn new(client: CoordinationClient, registry: FilterRegistry) -> Self {
        Self { client, registry }
    }

    /// Create every missing filter node with `"false"`
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();
        let default_switch = encode_switch(false);

        if self.registry.is_empty() {
            warn!("No filters registered, nothing to bootstrap");
            return Ok(report);
        }

        for entry in self.registry.entries() {
            let node_path = entry.namespace.filter_path(&entry.name)?;

            if self.client.exists(&node_path).await? {
                debug!(path = %node_path, "Filter node already initialized");
                report.existing.push(node_path);
                continue;
            }

            match self
                .client
                .create(&node_path, &default_switch, CreateMode::PERSISTENT_WITH_PARENTS)
                .await
            {
                Ok(()) => {
                    info!(namespace = %entry.namespace, filter = %entry.name, "Seeded filter node");
                    counter!("bootstrap_nodes_created_total", 1);
                    report.created.push(node_path);
                }
                Err(ConfigNodeError::AlreadyExists(_)) => {
                    debug!(path = %node_path, "Filter node created concurrently by another node");
                    report.existing.push(node_path);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            created = report.created.len(),
            existing = report.existing.len(),
            "Filter namespace bootstrap complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bootstrap_creates_defaults() {
        let client = CoordinationClient::with_store(Arc::new(MemoryStore::new()));
        let registry =
            FilterRegistry::new(vec!["ip-filter".into()], vec!["clickjack-filter".into()]);

        let report = Bootstrapper::new(client.clone(), registry)
            .bootstrap()
            .await
            .unwrap();
        assert_eq!(
            report.created,
            vec![
                "/waf/config/request/ip-filter".to_string(),
                "/waf/config/response/clickjack-filter".to_string()
            ]
        );
        assert!(report.existing.is_empty());
        assert_eq!(client.read("/waf/config/request/ip-filter").await.unwrap(), b"false");
        assert_eq!(client.read("/waf/config").await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_existing_value() {
        let client = CoordinationClient::with_store(Arc::new(MemoryStore::new()));
        client
            .create(
                "/waf/config/request/ip-filter",
                b"true",
                CreateMode::PERSISTENT_WITH_PARENTS,
            )
            .await
            .unwrap();

        let registry = FilterRegistry::new(vec!["ip-filter".into()], vec![]);
        let report = Bootstrapper::new(client.clone(), registry)
            .bootstrap()
            .await
            .unwrap();

        assert!(report.created.is_empty());
        assert_eq!(report.existing, vec!["/waf/config/request/ip-filter".to_string()]);
        assert_eq!(client.read("/waf/config/request/ip-filter").await.unwrap(), b"true");
    }

    #[tokio::test]
    async fn test_empty_registry_creates_nothing() {
        let client = CoordinationClient::with_store(Arc::new(MemoryStore::new()));
        let registry = FilterRegistry::new(vec![], vec![]);

        let report = Bootstrapper::new(client.clone(), registry)
            .bootstrap()
            .await
            .unwrap();

        assert_eq!(report, BootstrapReport::default());
        assert!(!client.exists("/waf").await.unwrap());
    }
}
