use std::collections::HashMap;
use std::sync::Arc;

use happen_types::NodeId;
use serde_json::Value;

use crate::node::{Node, NodeError};

/// Per-target outcome of a [`NodeGroup`] fan-out send.
#[derive(Debug, Clone)]
pub enum GroupSendOutcome {
    /// The target's continuum resolved to this value.
    Value(Value),
    /// The send to this target failed or its continuum did.
    Error(String),
}

/// A set of nodes addressed together: `.on` registers the same handler on
/// every member, `.send`/`.broadcast` fan out and aggregate results keyed by
/// node id. The Rust-native replacement for array-of-nodes fan-out.
#[derive(Clone)]
pub struct NodeGroup {
    members: Vec<Arc<Node>>,
}

impl NodeGroup {
    /// Build a group from existing nodes.
    pub fn new(members: Vec<Arc<Node>>) -> Self {
        Self { members }
    }

    /// Member node ids, in group order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|n| n.id().clone()).collect()
    }

    /// Register `handler` under `pattern` on every member.
    pub fn on(
        &self,
        pattern: impl Into<happen_pattern::PatternSpec> + Clone,
        priority: i32,
        handler: happen_continuum::Handler,
    ) -> Result<(), NodeError> {
        for member in &self.members {
            member.on(pattern.clone(), priority, handler.clone())?;
        }
        Ok(())
    }

    /// Send a freshly-derived copy of `event` to every member, aggregating
    /// each member's responder outcome by node id. A per-target failure does
    /// not fail the aggregate.
    pub async fn send(
        &self,
        from: &Arc<Node>,
        event_type: &str,
        payload: Value,
    ) -> HashMap<NodeId, GroupSendOutcome> {
        let mut results = HashMap::new();
        for member in &self.members {
            let event = happen_causality::create_event(event_type, payload.clone(), None, from.id());
            let outcome = match from.send(member.id(), event, None).await {
                Ok(pending) => match pending.returned().await {
                    Ok(value) => GroupSendOutcome::Value(value),
                    Err(err) => GroupSendOutcome::Error(err.to_string()),
                },
                Err(err) => GroupSendOutcome::Error(err.to_string()),
            };
            results.insert(member.id().clone(), outcome);
        }
        results
    }

    /// Fan out `event_type`/`payload` to every member with no response
    /// tracking.
    pub async fn broadcast(&self, from: &Node, event_type: &str, payload: Value) {
        for member in &self.members {
            let event = happen_causality::create_event(event_type, payload.clone(), None, from.id());
            if let Err(err) = from.tell(member.id(), event).await {
                tracing::warn!(target = %member.id(), error = %err, "group broadcast failed for member");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use happen_continuum::{Handler, HandlerResult};
    use happen_transport::InMemoryTransport;
    use happen_views::ViewRegistry;
    use serde_json::json;

    #[tokio::test]
    async fn send_aggregates_per_member_outcomes() {
        let transport = InMemoryTransport::new(64);
        let registry = ViewRegistry::new();

        let a = Node::new(NodeId("a".into()), NodeConfig::default(), transport.clone(), Arc::clone(&registry))
            .await
            .unwrap();
        let b = Node::new(NodeId("b".into()), NodeConfig::default(), transport.clone(), Arc::clone(&registry))
            .await
            .unwrap();
        for member in [&a, &b] {
            member
                .on(
                    "ping",
                    0,
                    Handler::new("echo", Arc::new(|input, ctx| {
                        Box::pin(async move {
                            let v = input.first().map(|e| e.payload.clone()).unwrap_or(Value::Null);
                            (HandlerResult::Return(v), ctx)
                        })
                    })),
                )
                .unwrap();
            member.start().await.unwrap();
        }

        let sender = Node::new(NodeId("sender".into()), NodeConfig::default(), transport, registry)
            .await
            .unwrap();
        let group = NodeGroup::new(vec![a, b]);
        let results = group.send(&sender, "ping", json!({"n": 1})).await;

        assert_eq!(results.len(), 2);
        for outcome in results.values() {
            assert!(matches!(outcome, GroupSendOutcome::Value(v) if *v == json!({"n": 1})));
        }
    }
}
