use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use config_node::config::{LoggingConfig, NodeConfig};
use config_node::{ClusterConfigService, SharedConfigService};

const DEFAULT_CONFIG_PATH: &str = "config/default";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("WAFCFG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    // Load configuration from file if available, otherwise use defaults
    let (config, load_error) = match NodeConfig::from_file(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (NodeConfig::default(), Some(e)),
    };

    init_logging(&config.logging);

    info!("Starting WAF Configuration Node v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!(path = %config_path, "Configuration loaded"),
        Some(e) => warn!(
            path = %config_path,
            error = %e,
            "Failed to load config file, using defaults"
        ),
    }
    if let Ok(rendered) = config.to_toml() {
        debug!(config = %rendered, "Effective configuration");
    }

    if config.metrics.enabled {
        let addr = config.metrics_addr()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        describe_metrics();
        info!(metrics_addr = %addr, "Prometheus metrics server started");
    }

    let service: SharedConfigService = Arc::new(
        ClusterConfigService::start(&config)
            .await
            .context("Failed to start cluster configuration service")?,
    );

    log_snapshot(&service).await;

    // Surface runtime coordination errors without stopping the node
    let mut errors = service.subscribe_errors();
    let error_logger = tokio::spawn(async move {
        while let Ok(message) = errors.recv().await {
            error!(error = %message, "Coordination service reported an error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    service
        .shutdown()
        .await
        .context("Failed to shut down cluster configuration service")?;
    error_logger.abort();

    info!("WAF Configuration Node stopped");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("config_node={}", logging.level).into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if logging.is_json() {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn describe_metrics() {
    describe_counter!("coordination_calls_total", "Coordination service calls by operation");
    describe_counter!(
        "coordination_call_errors_total",
        "Failed coordination service calls by operation and error kind"
    );
    describe_histogram!(
        "coordination_call_duration_seconds",
        "Coordination service call latency"
    );
    describe_counter!(
        "coordination_errors_reported_total",
        "Errors published on the coordination error channel"
    );
    describe_counter!("bootstrap_nodes_created_total", "Filter nodes seeded at startup");
    describe_counter!("config_cache_events_total", "Watch events applied to the cache");
    describe_counter!("config_cache_resyncs_total", "Full namespace resynchronizations");
    describe_gauge!("config_cache_filters", "Filters currently cached per namespace");
    describe_counter!(
        "config_rule_read_failures_total",
        "Rules skipped because they could not be read"
    );
    describe_counter!("config_mutations_total", "Configuration writes by operation");
}

async fn log_snapshot(service: &ClusterConfigService) {
    let request = service.get_request_configs().await;
    let response = service.get_response_configs().await;

    info!(
        request_filters = request.len(),
        request_enabled = request.values().filter(|c| c.enabled).count(),
        response_filters = response.len(),
        response_enabled = response.values().filter(|c| c.enabled).count(),
        "Current filter configuration"
    );

    match serde_json::to_string(&request) {
        Ok(json) => debug!(request = %json, "Request filter configuration"),
        Err(e) => warn!(error = %e, "Failed to serialize request configuration"),
    }
}
