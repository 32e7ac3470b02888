use std::collections::HashMap;

use happen_types::CausalContext;
use serde_json::Value;

/// The mutable per-invocation context threaded through every handler in a
/// continuum. One is created per ingress event (or batch); never shared
/// across continuums.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Causal metadata of the event (or first event of a batch) that started
    /// this continuum.
    pub causal: CausalContext,
    /// Causal contexts of every event in the batch, set only in batch mode.
    pub batch: Option<Vec<CausalContext>>,
    /// Epoch milliseconds at which the ingress event was accepted.
    pub received_at: i64,
    /// Names of handlers invoked so far, in execution order.
    pub path: Vec<String>,
    /// The most recently caught error value, set by `catch` or a `Fail` result.
    pub error: Option<Value>,
    /// Reason recorded by the `fallback` combinator when the primary fails.
    pub fallback_reason: Option<Value>,
    /// Free-form extension bag for application handlers.
    pub bag: HashMap<String, Value>,
}

impl HandlerContext {
    /// Start a fresh context for a single-event continuum.
    pub fn new(causal: CausalContext, received_at: i64) -> Self {
        Self {
            causal,
            batch: None,
            received_at,
            path: Vec::new(),
            error: None,
            fallback_reason: None,
            bag: HashMap::new(),
        }
    }

    /// Start a fresh context for a batch continuum; `causal` is the first
    /// event's causal context, `batch` holds every event's.
    pub fn new_batch(causal: CausalContext, batch: Vec<CausalContext>, received_at: i64) -> Self {
        Self {
            causal,
            batch: Some(batch),
            received_at,
            path: Vec::new(),
            error: None,
            fallback_reason: None,
            bag: HashMap::new(),
        }
    }

    /// Record that `name` is about to run.
    pub fn record(&mut self, name: &str) {
        self.path.push(name.to_string());
    }
}
