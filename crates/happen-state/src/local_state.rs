use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use happen_transport::KvBucket;
use happen_views::{StateReader, Views};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

/// A projection applied to the state document by `get`.
pub type Selector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Errors raised by [`LocalState`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The node is not configured for durable persistence but a persistent
    /// operation was attempted.
    #[error("state is not persistent for this node")]
    NotPersistent,
    /// The durable KV bucket reported an error.
    #[error("persistence failure: {0}")]
    Persistence(#[from] happen_transport::TransportError),
    /// The persisted bytes could not be deserialized as JSON.
    #[error("corrupt persisted state: {0}")]
    Corrupt(String),
}

struct Durable {
    kv: Arc<dyn KvBucket>,
    key: String,
}

/// A node's local, node-owned state document.
///
/// Mutation happens exclusively through [`set`](Self::set): it reads the
/// current value, awaits the caller-supplied transformer, and atomically
/// publishes the result. Concurrent `set` calls against the same
/// `LocalState` are serialized by an internal write gate, so there is always
/// a total order in which each call observes its immediate predecessor's
/// output.
pub struct LocalState {
    current: RwLock<Value>,
    write_gate: Mutex<()>,
    durable: Option<Durable>,
}

impl LocalState {
    /// Create a non-persistent state document seeded with `initial`.
    pub fn new(initial: Value) -> Self {
        Self {
            current: RwLock::new(initial),
            write_gate: Mutex::new(()),
            durable: None,
        }
    }

    /// Create a state document backed by a durable KV bucket under `key`,
    /// loading any existing value (falling back to `{}` on absence).
    pub async fn new_persistent(kv: Arc<dyn KvBucket>, key: impl Into<String>) -> Result<Self, StateError> {
        let key = key.into();
        let initial = match kv.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StateError::Corrupt(e.to_string()))?,
            None => Value::Object(Default::default()),
        };
        Ok(Self {
            current: RwLock::new(initial),
            write_gate: Mutex::new(()),
            durable: Some(Durable { kv, key }),
        })
    }

    /// Whether this state document is backed by durable storage.
    pub fn is_persistent(&self) -> bool {
        self.durable.is_some()
    }

    /// Read the current document, or `selector` applied to it.
    pub async fn get(&self, selector: Option<Selector>) -> Value {
        let current = self.current.read().await;
        match selector {
            Some(f) => f(&current),
            None => current.clone(),
        }
    }

    /// Atomically mutate the state document.
    ///
    /// `tx` receives the current value and an optional [`Views`] accessor
    /// (pass `None` for transformers that don't need peer projections) and
    /// returns the next value. The write gate is held for the full duration
    /// of `tx`, including any `.await` points inside it, which is what
    /// gives `set` its serialization guarantee.
    pub async fn set<F, Fut>(&self, views: Option<&Views>, tx: F) -> Result<Value, StateError>
    where
        F: FnOnce(Value, Option<&Views>) -> Fut,
        Fut: Future<Output = Value>,
    {
        let _gate = self.write_gate.lock().await;
        let current = self.current.read().await.clone();
        let next = tx(current, views).await;

        {
            let mut slot = self.current.write().await;
            *slot = next.clone();
        }

        if let Some(durable) = &self.durable {
            let bytes = serde_json::to_vec(&next)
                .map_err(|e| StateError::Corrupt(e.to_string()))?;
            durable.kv.put(&durable.key, bytes).await?;
        }

        Ok(next)
    }
}

#[async_trait]
impl StateReader for LocalState {
    async fn get_raw(&self) -> Value {
        self.current.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_returns_current_document() {
        let state = LocalState::new(json!({"count": 1}));
        assert_eq!(state.get(None).await, json!({"count": 1}));
    }

    #[tokio::test]
    async fn get_applies_selector() {
        let state = LocalState::new(json!({"count": 7}));
        let selector: Selector = Arc::new(|v| v.get("count").cloned().unwrap_or(Value::Null));
        assert_eq!(state.get(Some(selector)).await, json!(7));
    }

    #[tokio::test]
    async fn set_publishes_transformer_result() {
        let state = LocalState::new(json!({"count": 1}));
        state
            .set(None, |current, _views| async move {
                let n = current["count"].as_i64().unwrap_or(0);
                json!({"count": n + 1})
            })
            .await
            .unwrap();
        assert_eq!(state.get(None).await, json!({"count": 2}));
    }

    #[tokio::test]
    async fn concurrent_sets_compose_in_some_total_order() {
        let state = Arc::new(LocalState::new(json!({"count": 0})));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move {
                state
                    .set(None, |current, _| async move {
                        let n = current["count"].as_i64().unwrap_or(0);
                        json!({"count": n + 1})
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(state.get(None).await, json!({"count": 20}));
    }

    #[tokio::test]
    async fn persistent_state_round_trips_through_kv() {
        let transport = happen_transport::InMemoryTransport::new(4);
        let kv = happen_transport::Transport::kv(transport.as_ref(), "node-a");
        let state = LocalState::new_persistent(kv.clone(), "state").await.unwrap();
        assert_eq!(state.get(None).await, json!({}));
        state
            .set(None, |_current, _| async move { json!({"loaded": true}) })
            .await
            .unwrap();

        let reloaded = LocalState::new_persistent(kv, "state").await.unwrap();
        assert_eq!(reloaded.get(None).await, json!({"loaded": true}));
    }
}
