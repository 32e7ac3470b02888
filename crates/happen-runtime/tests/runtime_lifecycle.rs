use std::time::Duration;

use happen_continuum::{Handler, HandlerResult};
use happen_types::NodeId;
use happen_runtime::{test_config, Runtime};
use serde_json::{json, Value};

fn echo_handler() -> Handler {
    Handler::new("echo", std::sync::Arc::new(|input, ctx| {
        Box::pin(async move {
            let value = input.first().map(|e| e.payload.clone()).unwrap_or(Value::Null);
            (HandlerResult::Return(value), ctx)
        })
    }))
}

#[tokio::test]
async fn spawned_nodes_exchange_request_response() {
    let runtime = Runtime::initialize(test_config());

    let responder = runtime.spawn_node(NodeId("responder".into())).await.unwrap();
    responder.on("ping", 0, echo_handler()).unwrap();

    let sender = runtime.spawn_node(NodeId("sender".into())).await.unwrap();

    let event = happen_causality::create_event("ping", json!({"n": 1}), None, sender.id());
    let pending = sender
        .send(&NodeId("responder".into()), event, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    let value = pending.returned().await.unwrap();
    assert_eq!(value, json!({"n": 1}));

    runtime.shutdown().await;
}

#[tokio::test]
async fn runtime_group_fans_out_to_every_member() {
    let runtime = Runtime::initialize(test_config());

    let a = runtime.spawn_node(NodeId("a".into())).await.unwrap();
    a.on("ping", 0, echo_handler()).unwrap();
    let b = runtime.spawn_node(NodeId("b".into())).await.unwrap();
    b.on("ping", 0, echo_handler()).unwrap();

    let sender = runtime.spawn_node(NodeId("sender".into())).await.unwrap();
    let group = runtime.group(&[NodeId("a".into()), NodeId("b".into())]);

    let results = group.send(&sender, "ping", json!({"hi": true})).await;
    assert_eq!(results.len(), 2);
    for id in group.ids() {
        assert!(results.contains_key(&id));
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn health_snapshot_starts_empty_before_any_poll() {
    let runtime = Runtime::initialize(test_config());
    assert!(runtime.health_snapshot().is_empty());
    runtime.shutdown().await;
}
