//! In-process coordination store.
//!
//! Holds the node tree in a `BTreeMap` keyed by absolute path and fans child
//! events out over a broadcast channel. Events are sent while the write lock
//! is held, so a subscriber that snapshots under the read lock and then
//! subscribes sees every change exactly once.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::path;
use super::{ChildEvent, ChildEventStream, CoordinationStore, CreateMode};
use crate::error::{ConfigNodeError, Result};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    persistent: bool,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    closed: bool,
}

impl Tree {
    fn contains(&self, path: &str) -> bool {
        path == path::ROOT || self.nodes.contains_key(path)
    }

    fn children<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = (&'a str, &'a Node)> + 'a {
        let prefix = if parent == path::ROOT {
            path::ROOT.to_string()
        } else {
            format!("{}/", parent)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter(move |(key, _)| path::parent(key) == Some(parent))
            .map(|(key, node)| (path::name(key), node))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(ConfigNodeError::Closed)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
struct TreeEvent {
    parent: String,
    event: ChildEvent,
}

/// Coordination store kept entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    tree: RwLock<Tree>,
    events: broadcast::Sender<TreeEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Store whose subscribers lag (and must resync) after `capacity` unread events
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            tree: RwLock::new(Tree::default()),
            events,
        }
    }

    /// Number of nodes, excluding the implicit root
    pub async fn len(&self) -> usize {
        self.tree.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tree.read().await.nodes.is_empty()
    }

    fn notify(&self, node_path: &str, event: ChildEvent) {
        if let Some(parent) = path::parent(node_path) {
            // No subscribers is fine
            let _ = self.events.send(TreeEvent {
                parent: parent.to_string(),
                event,
            });
        }
    }

    fn insert(&self, tree: &mut Tree, node_path: &str, data: &[u8], persistent: bool) {
        tree.nodes.insert(
            node_path.to_string(),
            Node {
                data: data.to_vec(),
                persistent,
            },
        );
        self.notify(
            node_path,
            ChildEvent::Added {
                name: path::name(node_path).to_string(),
                data: data.to_vec(),
            },
        );
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, node_path: &str) -> Result<bool> {
        path::validate(node_path)?;
        let tree = self.tree.read().await;
        tree.check_open()?;
        Ok(tree.contains(node_path))
    }

    async fn create(&self, node_path: &str, data: &[u8], mode: CreateMode) -> Result<()> {
        path::validate(node_path)?;
        if node_path == path::ROOT {
            return Err(ConfigNodeError::AlreadyExists(node_path.to_string()));
        }

        let mut tree = self.tree.write().await;
        tree.check_open()?;

        if tree.contains(node_path) {
            return Err(ConfigNodeError::AlreadyExists(node_path.to_string()));
        }

        for ancestor in path::ancestors(node_path) {
            if tree.contains(&ancestor) {
                continue;
            }
            if !mode.create_parents {
                return Err(ConfigNodeError::NotFound(ancestor));
            }
            self.insert(&mut tree, &ancestor, &[], mode.persistent);
        }

        self.insert(&mut tree, node_path, data, mode.persistent);
        debug!(path = %node_path, "Created node");
        Ok(())
    }

    async fn read(&self, node_path: &str) -> Result<Vec<u8>> {
        path::validate(node_path)?;
        let tree = self.tree.read().await;
        tree.check_open()?;
        tree.nodes
            .get(node_path)
            .map(|node| node.data.clone())
            .ok_or_else(|| ConfigNodeError::NotFound(node_path.to_string()))
    }

    async fn write(&self, node_path: &str, data: &[u8]) -> Result<()> {
        path::validate(node_path)?;
        let mut tree = self.tree.write().await;
        tree.check_open()?;

        let node = tree
            .nodes
            .get_mut(node_path)
            .ok_or_else(|| ConfigNodeError::NotFound(node_path.to_string()))?;
        node.data = data.to_vec();

        self.notify(
            node_path,
            ChildEvent::Updated {
                name: path::name(node_path).to_string(),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, node_path: &str) -> Result<()> {
        path::validate(node_path)?;
        let mut tree = self.tree.write().await;
        tree.check_open()?;

        if !tree.nodes.contains_key(node_path) {
            return Err(ConfigNodeError::NotFound(node_path.to_string()));
        }
        if tree.children(node_path).next().is_some() {
            return Err(ConfigNodeError::NotEmpty(node_path.to_string()));
        }

        tree.nodes.remove(node_path);
        self.notify(
            node_path,
            ChildEvent::Removed {
                name: path::name(node_path).to_string(),
            },
        );
        debug!(path = %node_path, "Deleted node");
        Ok(())
    }

    async fn list_children(&self, node_path: &str) -> Result<BTreeSet<String>> {
        path::validate(node_path)?;
        let tree = self.tree.read().await;
        tree.check_open()?;

        if !tree.contains(node_path) {
            return Err(ConfigNodeError::NotFound(node_path.to_string()));
        }
        Ok(tree
            .children(node_path)
            .map(|(name, _)| name.to_string())
            .collect())
    }

    async fn watch_children(&self, node_path: &str) -> Result<ChildEventStream> {
        path::validate(node_path)?;
        let tree = self.tree.read().await;
        tree.check_open()?;

        // Subscribe before releasing the lock so nothing falls between
        // the snapshot and the live feed
        let receiver = self.events.subscribe();
        let initial: Vec<Result<ChildEvent>> = tree
            .children(node_path)
            .map(|(name, node)| {
                Ok(ChildEvent::Added {
                    name: name.to_string(),
                    data: node.data.clone(),
                })
            })
            .collect();
        drop(tree);

        let parent = node_path.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let event = match item {
                Ok(tree_event) if tree_event.parent == parent => Some(Ok(tree_event.event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(
                    ConfigNodeError::Backend(format!(
                        "watch on {} lagged by {} events",
                        parent, missed
                    )),
                )),
            };
            futures::future::ready(event)
        });

        Ok(stream::iter(initial).chain(live).boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut tree = self.tree.write().await;
        if tree.closed {
            return Ok(());
        }

        // Ephemeral nodes go away with the session
        let ephemeral: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, node)| !node.persistent)
            .map(|(key, _)| key.clone())
            .collect();
        for key in ephemeral {
            tree.nodes.remove(&key);
        }

        tree.closed = true;
        Ok(())
    }
}
