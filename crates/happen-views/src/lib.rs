#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-views** -- read-only, possibly-cached projections of other
//! nodes' local state.
//!
//! A [`ViewRegistry`] holds weak references to every running node's state
//! reader; a [`Views`] accessor handed to a `LocalState::set` transformer
//! projects one or many peers' current state without ever granting a
//! mutating handle. Peers that are absent, stopped, or the caller itself
//! project as `None`.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use happen_types::NodeId;
use serde_json::Value;

/// Implemented by whatever holds a node's current state (`happen-state`'s
/// `LocalState`) so this crate can read it without depending on that crate.
#[async_trait]
pub trait StateReader: Send + Sync {
    /// Snapshot the current state document.
    async fn get_raw(&self) -> Value;
}

/// A selector applied to a peer's raw state before it's handed back.
pub type Selector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

fn identity_selector() -> Selector {
    Arc::new(|v: &Value| v.clone())
}

/// Global registry mapping node id to a weak handle on its state reader.
///
/// Populated on node start, cleared on node stop. Holding only a [`Weak`]
/// reference means a concurrent read racing an unregister observes "absent"
/// rather than a half-torn-down node, and the registry itself never keeps a
/// stopped node's state alive.
#[derive(Default)]
pub struct ViewRegistry {
    nodes: DashMap<NodeId, Weak<dyn StateReader>>,
    cache: DashMap<(NodeId, String), (Instant, Value)>,
}

impl ViewRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `reader` as the current state source for `id`.
    pub fn register(&self, id: NodeId, reader: Weak<dyn StateReader>) {
        self.nodes.insert(id, reader);
    }

    /// Remove `id` and any cached projections of it.
    pub fn unregister(&self, id: &NodeId) {
        self.nodes.remove(id);
        self.cache.retain(|(node, _), _| node != id);
    }

    /// Build a [`Views`] accessor scoped to `caller` (so the caller projects
    /// itself as absent, matching the "self is null" rule).
    pub fn views_for(self: &Arc<Self>, caller: NodeId) -> Views {
        Views {
            registry: Arc::clone(self),
            caller,
        }
    }
}

/// Per-invocation read-only accessor over peer state, handed to a
/// `LocalState::set` transformer.
pub struct Views {
    registry: Arc<ViewRegistry>,
    caller: NodeId,
}

impl Views {
    /// Project `node`'s current state through `selector`, or `None` if the
    /// node is absent, stopped, or is the caller itself.
    pub async fn get(&self, node: &NodeId, selector: Selector) -> Option<Value> {
        if *node == self.caller {
            return None;
        }
        let Some(entry) = self.registry.nodes.get(node) else {
            tracing::debug!(node = %node.0, "view requested for unregistered node");
            return None;
        };
        let Some(reader) = entry.upgrade() else {
            tracing::debug!(node = %node.0, "view requested for stopped node");
            return None;
        };
        let raw = reader.get_raw().await;
        Some(selector(&raw))
    }

    /// Like [`get`](Self::get) but memoizes the projection for `ttl` under
    /// `cache_key`, scoped to `(node, cache_key)`.
    pub async fn get_cached(
        &self,
        node: &NodeId,
        cache_key: &str,
        ttl: Duration,
        selector: Selector,
    ) -> Option<Value> {
        let composite = (node.clone(), cache_key.to_string());
        if let Some(entry) = self.registry.cache.get(&composite) {
            if entry.0.elapsed() < ttl {
                return Some(entry.1.clone());
            }
        }
        let value = self.get(node, selector).await?;
        self.registry
            .cache
            .insert(composite, (Instant::now(), value.clone()));
        Some(value)
    }

    /// Project `node`'s state with the identity selector (the whole
    /// document, no projection).
    pub async fn get_whole(&self, node: &NodeId) -> Option<Value> {
        self.get(node, identity_selector()).await
    }

    /// Parallel `get` across many named projections; failures/absences per
    /// key become `None` rather than failing the whole collection.
    pub async fn collect(
        &self,
        specs: Vec<(String, NodeId, Selector)>,
    ) -> std::collections::HashMap<String, Option<Value>> {
        let futures = specs
            .into_iter()
            .map(|(key, node, selector)| async move {
                let value = self.get(&node, selector).await;
                (key, value)
            });
        futures::future::join_all(futures).await.into_iter().collect()
    }
}
