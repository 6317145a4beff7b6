// Coordination service access
//
// This module wraps the external hierarchical store every node shares:
// - `CoordinationStore` is the node-namespace contract (exists/create/read/
//   write/delete/list plus per-parent child subscriptions)
// - `MemoryStore` keeps the tree in-process (single node, tests)
// - `NatsKvStore` maps the tree onto a NATS JetStream key-value bucket
// - `CoordinationClient` owns the store, the retry policy and the
//   connection-state / error notification channels

pub mod client;
pub mod memory;
pub mod nats;
pub mod path;
pub mod retry;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;

pub use client::{ConnectionNotifier, CoordinationClient};
pub use memory::MemoryStore;
pub use nats::NatsKvStore;
pub use retry::RetryPolicy;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateMode {
    /// Node survives the creating session
    pub persistent: bool,
    /// Missing ancestors are created with an empty value
    pub create_parents: bool,
}

impl CreateMode {
    pub const PERSISTENT: CreateMode = CreateMode {
        persistent: true,
        create_parents: false,
    };

    pub const PERSISTENT_WITH_PARENTS: CreateMode = CreateMode {
        persistent: true,
        create_parents: true,
    };
}

/// Change to a direct child of a watched node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Added { name: String, data: Vec<u8> },
    Updated { name: String, data: Vec<u8> },
    Removed { name: String },
}

impl ChildEvent {
    pub fn name(&self) -> &str {
        match self {
            ChildEvent::Added { name, .. }
            | ChildEvent::Updated { name, .. }
            | ChildEvent::Removed { name } => name,
        }
    }

    /// Event kind label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ChildEvent::Added { .. } => "added",
            ChildEvent::Updated { .. } => "updated",
            ChildEvent::Removed { .. } => "removed",
        }
    }
}

/// Stream of child events; an `Err` item means events may have been missed
pub type ChildEventStream = BoxStream<'static, Result<ChildEvent>>;

/// Connection state as seen by listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Connection interrupted, reads should fall back to cached state
    Suspended,
    Reconnected,
    /// Retry budget exhausted
    Lost,
    Closed,
}

impl ConnectionState {
    /// Reads are served from the last snapshot only
    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionState::Suspended | ConnectionState::Lost)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Reconnected => "reconnected",
            ConnectionState::Lost => "lost",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Hierarchical node store shared by the fleet
///
/// Paths are absolute and slash-separated. Events for a given parent are
/// delivered in the order the writes were applied.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Backend label for logs
    fn backend_name(&self) -> &'static str;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Fails with `AlreadyExists` if the node exists and `NotFound` if the
    /// parent is missing and `mode.create_parents` is false
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<()>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Overwrite an existing node's value
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Remove a leaf node; `NotEmpty` if it has children
    async fn delete(&self, path: &str) -> Result<()>;

    async fn list_children(&self, path: &str) -> Result<BTreeSet<String>>;

    /// Subscribe to the direct children of `path`. The stream first replays
    /// every existing child as `Added`, then delivers live changes.
    async fn watch_children(&self, path: &str) -> Result<ChildEventStream>;

    /// Release the underlying connection
    async fn close(&self) -> Result<()>;
}
