//! WAF Cluster Configuration Node Library
//!
//! Shares one live view of which WAF filters are enabled, and which rules
//! each request filter carries, across every node of the fleet. State lives
//! in a hierarchical coordination store; each node mirrors the filter
//! switches through watch notifications and writes changes straight back.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod coordination;
pub mod error;
pub mod model;
pub mod mutation;
pub mod registry;
pub mod service;

// Re-export commonly used types
pub use bootstrap::{BootstrapReport, Bootstrapper};
pub use cache::HierarchicalConfigCache;
pub use config::{CoordinationBackend, CoordinationConfig, NodeConfig};
pub use coordination::{ConnectionState, CoordinationClient, CoordinationStore, MemoryStore};
pub use error::{ConfigNodeError, Result};
pub use model::{
    Namespace, RequestConfigUpdate, RequestConfigs, RequestFilterConfig, ResponseConfigUpdate,
    ResponseConfigs, ResponseFilterConfig, Rule,
};
pub use mutation::ConfigMutationApi;
pub use registry::FilterRegistry;
pub use service::{ClusterConfigService, SharedConfigService};
