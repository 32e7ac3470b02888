use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use happen_causality::create_derived;
use happen_continuum::{ContinuumExecutor, ContinuumOutcome, EventInput, Handler, HandlerContext};
use happen_pattern::{PatternEngine, PatternError, RegistrationId};
use happen_state::{LocalState, Selector, StateError, TemporalStore};
use happen_transport::{Transport, TransportError};
use happen_types::{Event, EventId, NodeId};
use happen_views::{StateReader, ViewRegistry, Views};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::envelope::{EventsPayload, IngressEnvelope, ReplyEnvelope, ReplyOutcome};

/// Errors raised while operating a [`Node`].
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The underlying transport rejected a publish/subscribe/request.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// A pattern string failed to compile at registration time.
    #[error("pattern registration failure: {0}")]
    Pattern(#[from] PatternError),
    /// Persistent state load/save failed.
    #[error("state failure: {0}")]
    State(#[from] StateError),
    /// A wire envelope could not be encoded or decoded.
    #[error("malformed wire envelope: {0}")]
    Malformed(String),
    /// No reply arrived before the deadline.
    #[error("response timed out")]
    ResponseTimeout,
    /// The responder's continuum failed.
    #[error("responder failed: {0}")]
    Failed(Value),
    /// The responder streamed a result, which cannot cross the wire.
    #[error("responder streamed a result; not representable over the wire")]
    StreamUnsupported,
    /// The sender's pending slot was dropped without a reply ever arriving.
    #[error("response channel closed before a value arrived")]
    ResponseChannelClosed,
}

/// Sane defaults for a node's executor, retention, and persistence behavior.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeConfig {
    /// Maximum number of continuums this node runs concurrently.
    pub concurrency_cap: usize,
    /// Deadline applied to a continuum invocation unless overridden.
    pub timeout_default: Duration,
    /// Maximum temporal snapshots retained per node.
    pub history_limit: usize,
    /// TTL applied to temporal snapshots regardless of `history_limit`.
    pub max_age: Duration,
    /// Whether this node's state document is durably backed by the
    /// transport's KV store under `node-<id>`.
    pub persistent: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 64,
            timeout_default: Duration::from_secs(30),
            history_limit: 1000,
            max_age: Duration::from_secs(30 * 24 * 3600),
            persistent: false,
        }
    }
}

fn ingress_subject(id: &NodeId) -> String {
    format!("happen.node.{}.ingress", id.0)
}

fn reply_subject(id: &NodeId, event_id: &EventId) -> String {
    format!("happen.node.{}.reply.{}", id.0, event_id.0)
}

fn reply_wildcard(id: &NodeId) -> String {
    format!("happen.node.{}.reply.>", id.0)
}

const BROADCAST_SUBJECT: &str = "happen.broadcast";

/// The subject every node subscribes to for fleet-wide broadcasts. Exposed so
/// callers outside a `Node` (e.g. `happen-runtime`'s Flow-Balance wiring) can
/// publish directly onto it without tracking a responder of their own.
pub fn broadcast_subject() -> &'static str {
    BROADCAST_SUBJECT
}

/// A pending `send()` awaiting its responder's terminal value.
pub struct SendResult {
    rx: oneshot::Receiver<Result<Value, NodeError>>,
}

impl SendResult {
    /// Await the responder's terminal value, or the error that prevented one.
    pub async fn returned(self) -> Result<Value, NodeError> {
        self.rx.await.unwrap_or(Err(NodeError::ResponseChannelClosed))
    }
}

/// A running event-processing node: ingress/egress plumbing, local state,
/// temporal history, and the continuum executor that drives its registered
/// handlers.
pub struct Node {
    id: NodeId,
    config: NodeConfig,
    patterns: PatternEngine<Handler>,
    executor: ContinuumExecutor,
    state: Arc<LocalState>,
    temporal: Arc<TemporalStore>,
    views_registry: Arc<ViewRegistry>,
    transport: Arc<dyn Transport>,
    pending: DashMap<EventId, oneshot::Sender<Result<Value, NodeError>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node identified by `id`. Loads persistent state from the
    /// transport's KV store when `config.persistent`.
    pub async fn new(
        id: NodeId,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        views_registry: Arc<ViewRegistry>,
    ) -> Result<Arc<Self>, NodeError> {
        let state = if config.persistent {
            let kv = transport.kv(&format!("node-{}", id.0));
            Arc::new(LocalState::new_persistent(kv, "state").await?)
        } else {
            Arc::new(LocalState::new(Value::Object(Default::default())))
        };
        let temporal = Arc::new(TemporalStore::new(config.history_limit, config.max_age));
        let executor = ContinuumExecutor::new(config.concurrency_cap, config.timeout_default);

        Ok(Arc::new(Self {
            id,
            config,
            patterns: PatternEngine::new(),
            executor,
            state,
            temporal,
            views_registry,
            transport,
            pending: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// This node's id.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Read-only access to this node's temporal history.
    pub fn temporal(&self) -> &TemporalStore {
        &self.temporal
    }

    /// Read the current state document, or `selector` applied to it.
    pub async fn get_state(&self, selector: Option<Selector>) -> Value {
        self.state.get(selector).await
    }

    /// Atomically mutate state and append a temporal snapshot crediting
    /// `event` as the write's cause.
    pub async fn set_state<F, Fut>(&self, event: &Event, tx: F) -> Result<Value, NodeError>
    where
        F: FnOnce(Value, Option<&Views>) -> Fut,
        Fut: std::future::Future<Output = Value>,
    {
        let views = self.views_registry.views_for(self.id.clone());
        let next = self.state.set(Some(&views), tx).await?;
        self.temporal.record(event, next.clone());
        Ok(next)
    }

    /// Register a handler. Returns an id usable with
    /// [`unregister`](Self::unregister).
    pub fn on(
        &self,
        pattern: impl Into<happen_pattern::PatternSpec>,
        priority: i32,
        handler: Handler,
    ) -> Result<RegistrationId, NodeError> {
        self.patterns.register(pattern, priority, handler).map_err(Into::into)
    }

    /// Remove a prior registration.
    pub fn unregister(&self, id: RegistrationId) {
        self.patterns.unregister(id);
    }

    /// Start the node: register with the view registry and subscribe to
    /// direct, broadcast, and reply traffic.
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        let reader: Arc<dyn StateReader> = Arc::clone(&self.state) as Arc<dyn StateReader>;
        self.views_registry.register(self.id.clone(), Arc::downgrade(&reader));

        let mut direct = self.transport.subscribe(&ingress_subject(&self.id))?;
        let mut bcast = self.transport.subscribe(BROADCAST_SUBJECT)?;
        let mut replies = self.transport.subscribe(&reply_wildcard(&self.id))?;

        let node = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = direct.recv() => {
                        match msg {
                            Ok((_, bytes)) => node.handle_ingress_bytes(&bytes).await,
                            Err(_) => break,
                        }
                    }
                    msg = bcast.recv() => {
                        match msg {
                            Ok((_, bytes)) => node.handle_ingress_bytes(&bytes).await,
                            Err(_) => break,
                        }
                    }
                    msg = replies.recv() => {
                        match msg {
                            Ok((_, bytes)) => node.handle_reply_bytes(&bytes),
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Stop the node: unregister from the view registry and abort its
    /// ingress loop.
    pub async fn stop(&self) {
        self.views_registry.unregister(&self.id);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    async fn handle_ingress_bytes(&self, bytes: &[u8]) {
        let envelope: IngressEnvelope = match serde_json::from_slice(bytes) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "dropped malformed ingress envelope");
                return;
            }
        };

        match envelope.events {
            EventsPayload::Single(event) => self.handle_single_ingress(event, envelope.reply_to).await,
            EventsPayload::Batch(events) => self.handle_batch_ingress(events, envelope.reply_to).await,
        }
    }

    async fn handle_single_ingress(&self, event: Event, reply_to: Option<String>) {
        if let Err(err) = happen_causality::validate(&event) {
            tracing::warn!(error = %err, event_id = %event.id, "dropped invalid event at ingress");
            return;
        }

        let handlers = self.patterns.lookup(&event.event_type, Some(&event));
        let Some(initial) = handlers.into_iter().next() else {
            tracing::debug!(event_type = %event.event_type, "no handler matched incoming event");
            return;
        };

        let received_at = chrono::Utc::now().timestamp_millis();
        let ctx = HandlerContext::new(event.context.causal.clone(), received_at);
        let outcome = self
            .executor
            .run(EventInput::Single(event.clone()), initial, ctx, None)
            .await;

        self.finish_continuum(&event, outcome, reply_to.as_deref()).await;
    }

    /// Batch mode: pattern lookup happens once against the first event, and
    /// the whole array is handed to that handler as a single continuum.
    /// An empty batch invokes no handler (per spec's boundary behavior).
    async fn handle_batch_ingress(&self, events: Vec<Event>, reply_to: Option<String>) {
        let Some(first) = events.first().cloned() else {
            tracing::debug!("dropped empty batch ingress");
            return;
        };

        if let Err(err) = happen_causality::validate(&first) {
            tracing::warn!(error = %err, event_id = %first.id, "dropped invalid event at ingress");
            return;
        }

        let handlers = self.patterns.lookup(&first.event_type, Some(&first));
        let Some(initial) = handlers.into_iter().next() else {
            tracing::debug!(event_type = %first.event_type, "no handler matched incoming batch");
            return;
        };

        let received_at = chrono::Utc::now().timestamp_millis();
        let batch_contexts = events.iter().map(|e| e.context.causal.clone()).collect();
        let ctx = HandlerContext::new_batch(first.context.causal.clone(), batch_contexts, received_at);
        let outcome = self.executor.run(EventInput::Batch(events), initial, ctx, None).await;

        self.finish_continuum(&first, outcome, reply_to.as_deref()).await;
    }

    async fn finish_continuum(&self, event: &Event, outcome: ContinuumOutcome, reply_to: Option<&str>) {
        let reply_outcome = match &outcome {
            ContinuumOutcome::Returned(value) => Some(ReplyOutcome::Value(value.clone())),
            ContinuumOutcome::Streamed(_) => Some(ReplyOutcome::StreamUnsupported),
            ContinuumOutcome::Failed { value, .. } => {
                self.emit_system_error(event, value.clone()).await;
                Some(ReplyOutcome::Failed(value.clone()))
            }
            ContinuumOutcome::TimedOut { .. } => {
                let payload = serde_json::json!({ "error": "ResponseTimeout" });
                self.emit_system_error(event, payload).await;
                Some(ReplyOutcome::TimedOut)
            }
        };

        if let (Some(subject), Some(reply_outcome)) = (reply_to, reply_outcome) {
            let envelope = ReplyEnvelope { event_id: event.id.clone(), outcome: reply_outcome };
            match serde_json::to_vec(&envelope) {
                Ok(bytes) => {
                    if let Err(err) = self.transport.publish(subject, bytes).await {
                        tracing::warn!(error = %err, "failed to publish reply");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to encode reply envelope"),
            }
        }
    }

    async fn emit_system_error(&self, event: &Event, payload: Value) {
        tracing::error!(event_id = %event.id, event_type = %event.event_type, "continuum failed");
        let error_event = create_derived(event, "system.error", payload, &self.id);
        let envelope = IngressEnvelope { events: EventsPayload::Single(error_event), reply_to: None };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            let _ = self.transport.publish(BROADCAST_SUBJECT, bytes).await;
        }
    }

    fn handle_reply_bytes(&self, bytes: &[u8]) {
        let envelope: ReplyEnvelope = match serde_json::from_slice(bytes) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "dropped malformed reply envelope");
                return;
            }
        };
        if let Some((_, tx)) = self.pending.remove(&envelope.event_id) {
            let result = match envelope.outcome {
                ReplyOutcome::Value(v) => Ok(v),
                ReplyOutcome::Failed(v) => Err(NodeError::Failed(v)),
                ReplyOutcome::StreamUnsupported => Err(NodeError::StreamUnsupported),
                ReplyOutcome::TimedOut => Err(NodeError::ResponseTimeout),
            };
            let _ = tx.send(result);
        }
    }

    /// Send `event` to `target` and return a handle to await its responder's
    /// terminal value. Registers a pending slot keyed by the event's id and
    /// arms a timeout that rejects the slot with
    /// [`NodeError::ResponseTimeout`] if nothing arrives first.
    pub async fn send(
        self: &Arc<Self>,
        target: &NodeId,
        event: Event,
        timeout_override: Option<Duration>,
    ) -> Result<SendResult, NodeError> {
        let event_id = event.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(event_id.clone(), tx);

        let envelope =
            IngressEnvelope { events: EventsPayload::Single(event), reply_to: Some(reply_subject(&self.id, &event_id)) };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| NodeError::Malformed(e.to_string()))?;

        if let Err(err) = self.transport.publish(&ingress_subject(target), bytes).await {
            self.pending.remove(&event_id);
            return Err(err.into());
        }

        let deadline = timeout_override.unwrap_or(self.config.timeout_default);
        let node = Arc::clone(self);
        let timeout_id = event_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some((_, tx)) = node.pending.remove(&timeout_id) {
                let _ = tx.send(Err(NodeError::ResponseTimeout));
            }
        });

        Ok(SendResult { rx })
    }

    /// Publish `event` on the shared broadcast subject; no response tracking.
    pub async fn broadcast(&self, event: Event) -> Result<(), NodeError> {
        let envelope = IngressEnvelope { events: EventsPayload::Single(event), reply_to: None };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| NodeError::Malformed(e.to_string()))?;
        self.transport.publish(BROADCAST_SUBJECT, bytes).await?;
        Ok(())
    }

    /// Fire-and-forget: publish `event` directly to `target`'s ingress with
    /// no pending-response slot.
    pub async fn tell(&self, target: &NodeId, event: Event) -> Result<(), NodeError> {
        let envelope = IngressEnvelope { events: EventsPayload::Single(event), reply_to: None };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| NodeError::Malformed(e.to_string()))?;
        self.transport.publish(&ingress_subject(target), bytes).await?;
        Ok(())
    }

    /// Fire-and-forget: publish `events` to `target`'s ingress as a single
    /// batch. The responder dispatches the whole array to one handler
    /// chosen by the first event's pattern match (spec.md's batch mode).
    pub async fn tell_batch(&self, target: &NodeId, events: Vec<Event>) -> Result<(), NodeError> {
        let envelope = IngressEnvelope { events: EventsPayload::Batch(events), reply_to: None };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| NodeError::Malformed(e.to_string()))?;
        self.transport.publish(&ingress_subject(target), bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use happen_causality::create_event;
    use happen_continuum::HandlerResult;
    use happen_transport::InMemoryTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn echo_handler() -> Handler {
        Handler::new("echo", Arc::new(|input, ctx| {
            Box::pin(async move {
                let value = input.first().map(|e| e.payload.clone()).unwrap_or(Value::Null);
                (HandlerResult::Return(value), ctx)
            })
        }))
    }

    #[tokio::test]
    async fn send_receives_responders_return_value() {
        let transport = InMemoryTransport::new(64);
        let registry = ViewRegistry::new();

        let responder = Node::new(NodeId("responder".into()), NodeConfig::default(), transport.clone(), Arc::clone(&registry))
            .await
            .unwrap();
        responder.on("ping", 0, echo_handler()).unwrap();
        responder.start().await.unwrap();

        let sender = Node::new(NodeId("sender".into()), NodeConfig::default(), transport, registry)
            .await
            .unwrap();
        sender.start().await.unwrap();

        let event = create_event("ping", json!({"hello": "world"}), None, sender.id());
        let result = sender.send(&NodeId("responder".into()), event, Some(Duration::from_secs(1))).await.unwrap();
        let value = result.returned().await.unwrap();
        assert_eq!(value, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn send_to_unresponsive_target_times_out() {
        let transport = InMemoryTransport::new(64);
        let registry = ViewRegistry::new();
        let sender = Node::new(NodeId("sender".into()), NodeConfig::default(), transport, registry)
            .await
            .unwrap();
        sender.start().await.unwrap();

        let event = create_event("ping", json!({}), None, sender.id());
        let result = sender
            .send(&NodeId("ghost".into()), event, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        let err = result.returned().await.unwrap_err();
        assert!(matches!(err, NodeError::ResponseTimeout));
    }

    #[tokio::test]
    async fn batch_ingress_dispatches_whole_array_to_one_handler() {
        let transport = InMemoryTransport::new(64);
        let registry = ViewRegistry::new();
        let seen_len = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_len2 = Arc::clone(&seen_len);

        let responder = Node::new(NodeId("responder".into()), NodeConfig::default(), transport.clone(), Arc::clone(&registry))
            .await
            .unwrap();
        responder
            .on(
                "order.created",
                0,
                Handler::new("count-batch", Arc::new(move |input, ctx| {
                    let seen_len2 = Arc::clone(&seen_len2);
                    Box::pin(async move {
                        let len = match &input {
                            happen_continuum::EventInput::Batch(events) => events.len(),
                            happen_continuum::EventInput::Single(_) => 1,
                        };
                        seen_len2.store(len, Ordering::SeqCst);
                        (HandlerResult::Return(Value::Null), ctx)
                    })
                })),
            )
            .unwrap();
        responder.start().await.unwrap();

        let sender = Node::new(NodeId("sender".into()), NodeConfig::default(), transport, registry)
            .await
            .unwrap();
        let events = vec![
            create_event("order.created", json!({"id": "O1"}), None, sender.id()),
            create_event("order.created", json!({"id": "O2"}), None, sender.id()),
            create_event("order.created", json!({"id": "O3"}), None, sender.id()),
        ];
        sender.tell_batch(&NodeId("responder".into()), events).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(seen_len.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_batch_ingress_invokes_no_handler() {
        let transport = InMemoryTransport::new(64);
        let registry = ViewRegistry::new();
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked2 = Arc::clone(&invoked);

        let responder = Node::new(NodeId("responder".into()), NodeConfig::default(), transport.clone(), Arc::clone(&registry))
            .await
            .unwrap();
        responder
            .on(
                "*",
                0,
                Handler::new("mark-invoked", Arc::new(move |input, ctx| {
                    let invoked2 = Arc::clone(&invoked2);
                    Box::pin(async move {
                        invoked2.store(true, Ordering::SeqCst);
                        (HandlerResult::Return(input.first().map(|e| e.payload.clone()).unwrap_or(Value::Null)), ctx)
                    })
                })),
            )
            .unwrap();
        responder.start().await.unwrap();

        let sender = Node::new(NodeId("sender".into()), NodeConfig::default(), transport, registry)
            .await
            .unwrap();
        sender.tell_batch(&NodeId("responder".into()), Vec::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn broadcast_is_received_by_every_subscribed_node() {
        let transport = InMemoryTransport::new(64);
        let registry = ViewRegistry::new();
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = Arc::clone(&seen);

        let listener = Node::new(NodeId("listener".into()), NodeConfig::default(), transport.clone(), Arc::clone(&registry))
            .await
            .unwrap();
        listener
            .on(
                "announcement",
                0,
                Handler::new("mark-seen", Arc::new(move |input, ctx| {
                    let seen2 = Arc::clone(&seen2);
                    Box::pin(async move {
                        seen2.store(true, Ordering::SeqCst);
                        (HandlerResult::Return(input.first().map(|e| e.payload.clone()).unwrap_or(Value::Null)), ctx)
                    })
                })),
            )
            .unwrap();
        listener.start().await.unwrap();

        let sender = Node::new(NodeId("sender".into()), NodeConfig::default(), transport, registry)
            .await
            .unwrap();
        let event = create_event("announcement", json!({}), None, sender.id());
        sender.broadcast(event).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.load(Ordering::SeqCst));
    }
}
