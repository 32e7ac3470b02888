use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use happen_flow_balance::{FlowBalanceMonitor, NodeHealthSnapshot};
use happen_node::{broadcast_subject, EventsPayload, IngressEnvelope, Node, NodeGroup};
use happen_resilience::{ServiceStatus, Supervisor};
use happen_transport::{InMemoryTransport, Transport};
use happen_types::NodeId;
use happen_views::ViewRegistry;

use crate::config::RuntimeConfig;

/// Errors raised while operating a [`Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A node-level operation failed.
    #[error("node error: {0}")]
    Node(#[from] happen_node::NodeError),
    /// `spawn_node` was called with an id already registered on this runtime.
    #[error("node '{0}' is already registered on this runtime")]
    DuplicateNode(String),
    /// A requested node id has no corresponding spawned node.
    #[error("node '{0}' is not registered on this runtime")]
    UnknownNode(String),
}

/// A fully wired Happen runtime: transport, view registry, and the
/// Flow-Balance monitor, plus the nodes spawned on top of them.
///
/// Mirrors this codebase's top-level runtime handle: components are built
/// once at [`Runtime::initialize`] time and shared behind `Arc`, with an
/// explicit background task for the one thing that needs to run
/// continuously (Flow-Balance polling) tracked so it can be stopped.
pub struct Runtime {
    config: RuntimeConfig,
    transport: Arc<dyn Transport>,
    views_registry: Arc<ViewRegistry>,
    flow_balance: Arc<FlowBalanceMonitor>,
    supervisor: Arc<Supervisor>,
    nodes: DashMap<NodeId, Arc<Node>>,
    flow_balance_task: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Wire up a runtime from `config`. Infallible: transport, view
    /// registry, and the Flow-Balance monitor are all pure in-process
    /// construction.
    pub fn initialize(config: RuntimeConfig) -> Arc<Self> {
        info!(?config, "initializing happen runtime");

        let transport = InMemoryTransport::new(config.transport_capacity);
        let views_registry = ViewRegistry::new();
        let flow_balance = Arc::new(FlowBalanceMonitor::new(
            NodeId("flow-balance".to_string()),
            config.flow_balance_thresholds,
            config.flow_balance_polling_interval,
        ));
        let supervisor = Arc::new(Supervisor::new(config.supervisor));

        Arc::new(Self {
            config,
            transport,
            views_registry,
            flow_balance,
            supervisor,
            nodes: DashMap::new(),
            flow_balance_task: Mutex::new(None),
        })
    }

    /// Spawn and start a node identified by `id`, using this runtime's
    /// configured [`happen_node::NodeConfig`] defaults. Registers the node
    /// with the runtime's supervisor so repeated [`Runtime::report_node_error`]
    /// calls past the configured threshold trigger an automatic respawn.
    pub async fn spawn_node(self: &Arc<Self>, id: NodeId) -> Result<Arc<Node>> {
        if self.nodes.contains_key(&id) {
            return Err(RuntimeError::DuplicateNode(id.0).into());
        }

        let node = self.spawn_node_inner(id.clone()).await?;

        let weak_self = Arc::downgrade(self);
        self.supervisor.register(
            id.0.clone(),
            Arc::new(move || {
                let weak_self = weak_self.clone();
                let id = id.clone();
                Box::pin(async move {
                    let Some(runtime) = weak_self.upgrade() else { return Err(()) };
                    runtime.respawn_node(id).await.map(|_| ()).map_err(|_| ())
                })
            }),
        );

        Ok(node)
    }

    async fn spawn_node_inner(self: &Arc<Self>, id: NodeId) -> Result<Arc<Node>> {
        let node = Node::new(
            id.clone(),
            self.config.node.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.views_registry),
        )
        .await
        .map_err(RuntimeError::from)?;
        node.start().await.map_err(RuntimeError::from)?;

        debug!(node = %id.0, "node spawned");
        self.nodes.insert(id, Arc::clone(&node));
        Ok(node)
    }

    /// Stop and drop a previously spawned node.
    pub async fn stop_node(&self, id: &NodeId) -> Result<()> {
        let (_, node) = self.nodes.remove(id).ok_or_else(|| RuntimeError::UnknownNode(id.0.clone()))?;
        node.stop().await;
        Ok(())
    }

    /// Rebuild and restart a node in place, replacing any prior instance
    /// under the same id. Used as the supervisor's restart action, but
    /// callable directly for manual recovery.
    pub async fn respawn_node(self: &Arc<Self>, id: NodeId) -> Result<Arc<Node>> {
        if let Some((_, node)) = self.nodes.remove(&id) {
            node.stop().await;
        }
        self.spawn_node_inner(id).await
    }

    /// Report a failure against `id` to the runtime's supervisor. Once
    /// errors within the configured sliding window cross the threshold, the
    /// node is automatically respawned.
    pub async fn report_node_error(&self, id: &NodeId) {
        self.supervisor.report_error(&id.0).await;
    }

    /// The supervisor's current classification of `id`, if it has been
    /// spawned on this runtime at least once.
    pub fn node_status(&self, id: &NodeId) -> Option<ServiceStatus> {
        self.supervisor.status(&id.0)
    }

    /// Look up a spawned node by id.
    pub fn node(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of every node currently spawned on this runtime.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Build a [`NodeGroup`] over the given node ids. Ids with no spawned
    /// node are skipped and logged rather than failing the whole group.
    pub fn group(&self, ids: &[NodeId]) -> NodeGroup {
        let members = ids
            .iter()
            .filter_map(|id| {
                let node = self.node(id);
                if node.is_none() {
                    warn!(node = %id.0, "group member not spawned on this runtime, skipping");
                }
                node
            })
            .collect();
        NodeGroup::new(members)
    }

    /// Access to the shared transport, for callers that need to publish or
    /// subscribe outside a node (test harnesses, bootstrapping).
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Start the Flow-Balance polling loop against `flow_balance_stream`.
    /// Detected patterns are turned into events and broadcast to every node.
    /// A second call is a no-op if a poll loop is already running.
    pub async fn start_flow_balance(self: &Arc<Self>) {
        let mut guard = self.flow_balance_task.lock().await;
        if guard.is_some() {
            return;
        }

        let transport = Arc::clone(&self.transport);
        let stream = self.config.flow_balance_stream.clone();
        let emit_transport = Arc::clone(&self.transport);
        let emitter: happen_flow_balance::Emitter = Arc::new(move |event| {
            let transport = Arc::clone(&emit_transport);
            Box::pin(async move {
                let envelope = IngressEnvelope { events: EventsPayload::Single(event), reply_to: None };
                match serde_json::to_vec(&envelope) {
                    Ok(bytes) => {
                        if let Err(err) = transport.publish(broadcast_subject(), bytes).await {
                            warn!(error = %err, "failed to broadcast flow-balance event");
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to encode flow-balance event"),
                }
            })
        });

        *guard = Some(Arc::clone(&self.flow_balance).spawn(transport, stream, emitter));
        info!("flow-balance polling started");
    }

    /// Stop the Flow-Balance polling loop, if running.
    pub async fn stop_flow_balance(&self) {
        if let Some(task) = self.flow_balance_task.lock().await.take() {
            task.abort();
        }
    }

    /// Current per-node health-and-metrics map, populated as Flow-Balance
    /// ticks. Empty until the polling loop has run at least once (or
    /// [`FlowBalanceMonitor::tick`] has been driven directly in tests).
    pub fn health_snapshot(&self) -> HashMap<NodeId, NodeHealthSnapshot> {
        self.flow_balance.snapshot()
    }

    /// Stop every spawned node and the Flow-Balance poll loop.
    pub async fn shutdown(&self) {
        info!("shutting down happen runtime");
        self.stop_flow_balance().await;
        let nodes: Vec<Arc<Node>> = self.nodes.iter().map(|entry| Arc::clone(entry.value())).collect();
        for node in nodes {
            node.stop().await;
        }
        self.nodes.clear();
    }
}
