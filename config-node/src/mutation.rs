use metrics::counter;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::coordination::{CoordinationClient, CreateMode};
use crate::error::{ConfigNodeError, Result};
use crate::model::{
    encode_switch, rule_path, Namespace, RequestConfigUpdate, ResponseConfigUpdate,
};

/// Direct writes against the coordination service
///
/// Every call is a synchronous round trip. Nothing here touches the local
/// cache; it catches up when the corresponding watch event arrives.
#[derive(Debug, Clone)]
pub struct ConfigMutationApi {
    client: CoordinationClient,
}

impl ConfigMutationApi {
    pub fn new(client: CoordinationClient) -> Self {
        Self { client }
    }

    async fn write_switch(
        &self,
        namespace: Namespace,
        filter_name: &str,
        enabled: bool,
    ) -> Result<()> {
        let node_path = namespace.filter_path(filter_name)?;
        self.client.write(&node_path, &encode_switch(enabled)).await?;

        counter!(
            "config_mutations_total",
            1,
            "op" => "set_switch",
            "namespace" => namespace.as_str()
        );
        info!(
            namespace = %namespace,
            filter = %filter_name,
            enabled = enabled,
            "Filter switch updated"
        );
        Ok(())
    }

    /// Turn a request filter on or off; `NotFound` if the filter is unknown
    #[instrument(skip(self))]
    pub async fn set_request_switch(&self, filter_name: &str, enabled: bool) -> Result<()> {
        self.write_switch(Namespace::Request, filter_name, enabled).await
    }

    /// Turn a response filter on or off; `NotFound` if the filter is unknown
    #[instrument(skip(self))]
    pub async fn set_response_switch(&self, filter_name: &str, enabled: bool) -> Result<()> {
        self.write_switch(Namespace::Response, filter_name, enabled).await
    }

    /// Create or overwrite a rule under a request filter
    ///
    /// Check-then-act: absent rules are created, present ones overwritten.
    /// Concurrent writers are not serialized; the last write wins. The
    /// filter node must exist. The rule is stored as given; filter engines
    /// own its dialect, so a pattern this crate's regex engine cannot
    /// compile is only logged.
    #[instrument(skip(self))]
    pub async fn set_request_rule(
        &self,
        filter_name: &str,
        regex: &str,
        enabled: bool,
    ) -> Result<()> {
        if let Err(e) = Regex::new(regex) {
            warn!(
                filter = %filter_name,
                regex = %regex,
                error = %e,
                "Storing rule that does not compile here"
            );
        }
        let node_path = rule_path(filter_name, regex)?;
        let value = encode_switch(enabled);

        if self.client.exists(&node_path).await? {
            self.client.write(&node_path, &value).await?;
        } else {
            match self.client.create(&node_path, &value, CreateMode::PERSISTENT).await {
                Ok(()) => {}
                Err(ConfigNodeError::AlreadyExists(_)) => {
                    debug!(path = %node_path, "Rule created concurrently, overwriting");
                    self.client.write(&node_path, &value).await?;
                }
                Err(e) => return Err(e),
            }
        }

        counter!("config_mutations_total", 1, "op" => "set_rule", "namespace" => "request");
        info!(filter = %filter_name, regex = %regex, enabled = enabled, "Request rule updated");
        Ok(())
    }

    /// Remove a rule; removing a rule that does not exist is `NotFound`
    #[instrument(skip(self))]
    pub async fn delete_request_rule(&self, filter_name: &str, regex: &str) -> Result<()> {
        let node_path = rule_path(filter_name, regex)?;
        self.client.delete(&node_path).await?;

        counter!("config_mutations_total", 1, "op" => "delete_rule", "namespace" => "request");
        info!(filter = %filter_name, regex = %regex, "Request rule deleted");
        Ok(())
    }

    /// Apply an optional switch change, then upsert each rule in order
    ///
    /// Stops at the first failure; earlier writes stay applied.
    pub async fn apply_request_update(&self, update: &RequestConfigUpdate) -> Result<()> {
        if let Some(enabled) = update.enabled {
            self.set_request_switch(&update.filter_name, enabled).await?;
        }
        for rule in &update.rules {
            self.set_request_rule(&update.filter_name, &rule.regex, rule.enabled)
                .await?;
        }
        Ok(())
    }

    pub async fn apply_response_update(&self, update: &ResponseConfigUpdate) -> Result<()> {
        self.set_response_switch(&update.filter_name, update.enabled)
            .await
    }

    /// Delete each rule in order, stopping at the first failure
    pub async fn delete_request_rules<I, S>(&self, filter_name: &str, regexes: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for regex in regexes {
            self.delete_request_rule(filter_name, regex.as_ref()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use std::sync::Arc;

    async fn api_with_filter(filter: &str) -> (ConfigMutationApi, CoordinationClient) {
        let client = CoordinationClient::with_store(Arc::new(MemoryStore::new()));
        client
            .create(
                &Namespace::Request.filter_path(filter).unwrap(),
                b"false",
                CreateMode::PERSISTENT_WITH_PARENTS,
            )
            .await
            .unwrap();
        (ConfigMutationApi::new(client.clone()), client)
    }

    #[tokio::test]
    async fn test_switch_on_unknown_filter_is_not_found() {
        let (api, _) = api_with_filter("ip-filter").await;
        assert!(api
            .set_request_switch("nope", true)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(api
            .set_response_switch("clickjack-filter", true)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_set_rule_creates_then_overwrites() {
        let (api, client) = api_with_filter("ip-filter").await;
        let path = r"/waf/config/request/ip-filter/10\.0\.0\.1";

        api.set_request_rule("ip-filter", r"10\.0\.0\.1", true).await.unwrap();
        assert_eq!(client.read(path).await.unwrap(), b"true");

        api.set_request_rule("ip-filter", r"10\.0\.0\.1", false).await.unwrap();
        assert_eq!(client.read(path).await.unwrap(), b"false");
    }

    #[tokio::test]
    async fn test_rule_requires_parent_filter() {
        let (api, _) = api_with_filter("ip-filter").await;
        assert!(api
            .set_request_rule("missing-filter", "x", true)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_foreign_dialect_rules_are_stored() {
        let (api, client) = api_with_filter("args-filter").await;

        api.set_request_rule("args-filter", r"(?!safe)select.+from", true)
            .await
            .unwrap();
        api.set_request_rule("args-filter", r#"(['"])\1"#, false)
            .await
            .unwrap();

        let rules = client.list_children("/waf/config/request/args-filter").await.unwrap();
        assert!(rules.contains(r"(?!safe)select.+from"));
        assert!(rules.contains(r#"(['"])\1"#));
    }

    #[tokio::test]
    async fn test_rule_with_separator_rejected() {
        let (api, _) = api_with_filter("url-filter").await;
        assert!(matches!(
            api.set_request_rule("url-filter", "/admin/.*", true).await,
            Err(ConfigNodeError::InvalidRule(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_twice_fails() {
        let (api, _) = api_with_filter("ip-filter").await;
        api.set_request_rule("ip-filter", "a+", true).await.unwrap();
        api.delete_request_rule("ip-filter", "a+").await.unwrap();
        assert!(api
            .delete_request_rule("ip-filter", "a+")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
