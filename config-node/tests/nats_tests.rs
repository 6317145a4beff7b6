//! Tests against a live NATS server with JetStream enabled
//!
//! Each test works in its own throwaway key-value bucket and removes it
//! afterwards.
//!
//! Prerequisites:
//! - `nats-server -js` reachable at `NATS_URL` (default `nats://127.0.0.1:4222`)
//!
//! Usage:
//!   cargo test --test nats_tests -- --ignored

use anyhow::Result;
use futures::StreamExt;
use std::time::Duration;
use uuid::Uuid;

use config_node::coordination::{ChildEvent, ChildEventStream, CreateMode};
use config_node::{
    ClusterConfigService, ConfigNodeError, ConnectionState, CoordinationClient,
    CoordinationConfig, NodeConfig,
};

fn nats_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string())
}

/// Coordination config pointing at a fresh bucket
fn scratch_config() -> CoordinationConfig {
    let mut config = CoordinationConfig::default();
    config.nats_servers = vec![nats_url()];
    config.bucket = format!("waf-config-test-{}", Uuid::new_v4().simple());
    config.call_timeout_ms = Some(5_000);
    config
}

async fn drop_bucket(bucket: &str) -> Result<()> {
    let client = async_nats::connect(nats_url()).await?;
    async_nats::jetstream::new(client)
        .delete_key_value(bucket)
        .await?;
    Ok(())
}

/// Next event, failing the test if none arrives in time
async fn next_event(events: &mut ChildEventStream) -> Result<ChildEvent> {
    match tokio::time::timeout(Duration::from_secs(5), events.next()).await {
        Ok(Some(event)) => Ok(event?),
        Ok(None) => anyhow::bail!("watch stream ended"),
        Err(_) => anyhow::bail!("no watch event within 5s"),
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test nats_tests -- --ignored
async fn test_node_lifecycle() -> Result<()> {
    let config = scratch_config();
    let client = CoordinationClient::connect(&config).await?;
    assert_eq!(client.state(), ConnectionState::Connected);

    let filter = "/waf/config/request/ip-filter";
    let rule = r"/waf/config/request/ip-filter/10\.0\.0\.1";

    client
        .create(filter, b"false", CreateMode::PERSISTENT_WITH_PARENTS)
        .await?;
    assert!(client.exists("/waf/config").await?);
    assert!(matches!(
        client.create(filter, b"true", CreateMode::PERSISTENT).await,
        Err(ConfigNodeError::AlreadyExists(_))
    ));
    assert_eq!(client.read(filter).await?, b"false");

    client.create(rule, b"true", CreateMode::PERSISTENT).await?;
    client.write(filter, b"true").await?;
    assert_eq!(client.read(filter).await?, b"true");

    let children = client.list_children(filter).await?;
    assert_eq!(children.into_iter().collect::<Vec<_>>(), vec![r"10\.0\.0\.1".to_string()]);

    assert!(matches!(
        client.delete(filter).await,
        Err(ConfigNodeError::NotEmpty(_))
    ));
    client.delete(rule).await?;
    assert!(client.delete(rule).await.unwrap_err().is_not_found());
    assert!(client.list_children(filter).await?.is_empty());

    // A deleted key can be created again
    client.create(rule, b"false", CreateMode::PERSISTENT).await?;
    assert_eq!(client.read(rule).await?, b"false");

    client.close().await?;
    drop_bucket(&config.bucket).await
}

#[tokio::test]
#[ignore]
async fn test_child_watch() -> Result<()> {
    let config = scratch_config();
    let client = CoordinationClient::connect(&config).await?;
    let parent = "/waf/config/response";

    client
        .create(
            "/waf/config/response/clickjack-filter",
            b"false",
            CreateMode::PERSISTENT_WITH_PARENTS,
        )
        .await?;

    let mut events = client.watch_children(parent).await?;

    // Existing children are replayed first
    match next_event(&mut events).await? {
        ChildEvent::Added { name, data } => {
            assert_eq!(name, "clickjack-filter");
            assert_eq!(data, b"false");
        }
        other => panic!("expected replayed child, got {:?}", other),
    }

    client
        .create("/waf/config/response/csp-filter", b"true", CreateMode::PERSISTENT)
        .await?;
    client
        .write("/waf/config/response/clickjack-filter", b"true")
        .await?;
    client.delete("/waf/config/response/csp-filter").await?;

    let added = next_event(&mut events).await?;
    assert!(matches!(added, ChildEvent::Added { ref name, .. } if name == "csp-filter"));
    let updated = next_event(&mut events).await?;
    assert!(matches!(
        updated,
        ChildEvent::Updated { ref name, ref data } if name == "clickjack-filter" && data == b"true"
    ));
    let removed = next_event(&mut events).await?;
    assert!(matches!(removed, ChildEvent::Removed { ref name } if name == "csp-filter"));

    // Grandchildren are not reported
    client
        .create(
            "/waf/config/response/clickjack-filter/nested",
            b"true",
            CreateMode::PERSISTENT,
        )
        .await?;
    assert!(
        tokio::time::timeout(Duration::from_millis(300), events.next())
            .await
            .is_err()
    );

    drop(events);
    client.close().await?;
    drop_bucket(&config.bucket).await
}

#[tokio::test]
#[ignore]
async fn test_service_over_nats() -> Result<()> {
    let mut config = NodeConfig::default();
    config.coordination = scratch_config();
    let bucket = config.coordination.bucket.clone();

    let service = ClusterConfigService::start(&config).await?;
    assert_eq!(service.bootstrap_report().created.len(), config.filters.len());

    service
        .set_request_rule("ip-filter", r"10\.0\.0\.1", true)
        .await?;
    service.set_request_switch("ip-filter", true).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let configs = service.get_request_configs().await;
        let ip = &configs["ip-filter"];
        if ip.enabled {
            assert_eq!(ip.rule(r"10\.0\.0\.1"), Some(true));
            break;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("switch change never reached the cache");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    service.shutdown().await?;
    drop_bucket(&bucket).await
}
