use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use happen_types::{CausalContext, CorrelationId, Event, EventId};
use serde_json::Value;

/// A historical `(event, state)` pair, keyed by the event that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalSnapshot {
    /// The event that triggered this state write.
    pub event_id: EventId,
    /// The event's dotted type.
    pub event_type: String,
    /// Deep copy of the state document immediately after the write.
    pub state: Value,
    /// Deep copy of the triggering event's causal context.
    pub causal: CausalContext,
}

/// A query against [`TemporalStore::when`].
pub enum TemporalQuery<'a> {
    /// Equivalent to `get(id)`, wrapped as a single-element (or empty) result.
    EventId(&'a EventId),
    /// Scan every retained snapshot, keeping those the predicate accepts.
    Predicate(&'a dyn Fn(&TemporalSnapshot) -> bool),
}

/// Parse a retention TTL string (`"30d"`, `"2h"`, `"45m"`, `"10s"`).
/// Anything else defaults to 30 days, matching the source's fallback.
pub fn parse_max_age(input: &str) -> Duration {
    let default = Duration::from_secs(30 * 24 * 3600);
    if input.len() < 2 {
        return default;
    }
    let (num, unit) = input.split_at(input.len() - 1);
    let Ok(n) = num.parse::<u64>() else {
        return default;
    };
    match unit {
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        "d" => Duration::from_secs(n * 24 * 3600),
        _ => default,
    }
}

struct Inner {
    by_event: HashMap<EventId, TemporalSnapshot>,
    by_causation: HashMap<EventId, HashSet<EventId>>,
    by_correlation: HashMap<CorrelationId, HashSet<EventId>>,
    by_type: HashMap<String, HashSet<EventId>>,
    insertion_order: VecDeque<EventId>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            by_event: HashMap::new(),
            by_causation: HashMap::new(),
            by_correlation: HashMap::new(),
            by_type: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }
}

/// Per-node, append-only history of `(event, state)` pairs with
/// causal-chain and correlation-chain indices, bounded by a maximum snapshot
/// count and a TTL.
pub struct TemporalStore {
    inner: RwLock<Inner>,
    history_limit: usize,
    max_age: Duration,
}

impl TemporalStore {
    /// Create a store retaining at most `history_limit` snapshots, each
    /// evicted once older than `max_age`.
    pub fn new(history_limit: usize, max_age: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            history_limit,
            max_age,
        }
    }

    /// Record a snapshot for `event` and its resulting `state`. Index
    /// updates happen as a single logical transaction: either all four
    /// indices reflect the new snapshot, or (under a poisoned lock) none do.
    pub fn record(&self, event: &Event, state: Value) {
        let snapshot = TemporalSnapshot {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            state,
            causal: event.context.causal.clone(),
        };

        let mut inner = self.inner.write().expect("temporal store lock poisoned");
        let id = snapshot.event_id.clone();

        if let Some(causation_id) = &snapshot.causal.causation_id {
            inner
                .by_causation
                .entry(causation_id.clone())
                .or_default()
                .insert(id.clone());
        }
        inner
            .by_correlation
            .entry(snapshot.causal.correlation_id.clone())
            .or_default()
            .insert(id.clone());
        inner
            .by_type
            .entry(snapshot.event_type.clone())
            .or_default()
            .insert(id.clone());
        inner.insertion_order.push_back(id.clone());
        inner.by_event.insert(id, snapshot);

        self.evict_if_needed(&mut inner);
    }

    fn evict_if_needed(&self, inner: &mut Inner) {
        let now = chrono::Utc::now().timestamp_millis();
        let max_age_ms = self.max_age.as_millis() as i64;

        while inner.insertion_order.len() > self.history_limit {
            if let Some(oldest) = inner.insertion_order.pop_front() {
                Self::purge(inner, &oldest);
            } else {
                break;
            }
        }

        let expired: Vec<EventId> = inner
            .by_event
            .values()
            .filter(|s| now.saturating_sub(s.causal.timestamp) > max_age_ms)
            .map(|s| s.event_id.clone())
            .collect();
        for id in expired {
            inner.insertion_order.retain(|e| *e != id);
            Self::purge(inner, &id);
        }
    }

    fn purge(inner: &mut Inner, id: &EventId) {
        if let Some(snapshot) = inner.by_event.remove(id) {
            if let Some(causation_id) = &snapshot.causal.causation_id {
                if let Some(set) = inner.by_causation.get_mut(causation_id) {
                    set.remove(id);
                }
            }
            if let Some(set) = inner.by_correlation.get_mut(&snapshot.causal.correlation_id) {
                set.remove(id);
            }
            if let Some(set) = inner.by_type.get_mut(&snapshot.event_type) {
                set.remove(id);
            }
        }
    }

    /// O(1) lookup by event id.
    pub fn get(&self, event_id: &EventId) -> Option<TemporalSnapshot> {
        self.inner
            .read()
            .expect("temporal store lock poisoned")
            .by_event
            .get(event_id)
            .cloned()
    }

    /// Run a query, returning matches sorted by timestamp ascending.
    pub fn when(&self, query: TemporalQuery<'_>) -> Vec<TemporalSnapshot> {
        let inner = self.inner.read().expect("temporal store lock poisoned");
        let mut results: Vec<TemporalSnapshot> = match query {
            TemporalQuery::EventId(id) => inner.by_event.get(id).cloned().into_iter().collect(),
            TemporalQuery::Predicate(pred) => inner
                .by_event
                .values()
                .filter(|s| pred(s))
                .cloned()
                .collect(),
        };
        results.sort_by_key(|s| s.causal.timestamp);
        results
    }

    /// DFS over `causal:` edges from `event_id`, cycle-safe, sorted by
    /// timestamp ascending. Includes the root snapshot itself when present.
    pub fn causal_chain(&self, event_id: &EventId) -> Vec<TemporalSnapshot> {
        let inner = self.inner.read().expect("temporal store lock poisoned");
        let mut visited: HashSet<EventId> = HashSet::new();
        let mut stack: Vec<EventId> = vec![event_id.clone()];
        let mut results = Vec::new();

        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(snapshot) = inner.by_event.get(&id) {
                results.push(snapshot.clone());
            }
            if let Some(children) = inner.by_causation.get(&id) {
                for child in children {
                    if !visited.contains(child) {
                        stack.push(child.clone());
                    }
                }
            }
        }

        results.sort_by_key(|s| s.causal.timestamp);
        results
    }

    /// All snapshots sharing `correlation_id`, sorted by timestamp ascending.
    pub fn correlation(&self, correlation_id: &CorrelationId) -> Vec<TemporalSnapshot> {
        let inner = self.inner.read().expect("temporal store lock poisoned");
        let mut results: Vec<TemporalSnapshot> = inner
            .by_correlation
            .get(correlation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.by_event.get(id).cloned())
            .collect();
        results.sort_by_key(|s| s.causal.timestamp);
        results
    }

    /// Number of snapshots currently retained.
    pub fn len(&self) -> usize {
        self.inner.read().expect("temporal store lock poisoned").by_event.len()
    }

    /// Whether the store currently holds no snapshots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use happen_types::{ContextBag, EventContext, NodeId};
    use serde_json::json;

    fn event_at(
        id: &str,
        event_type: &str,
        causation: Option<&str>,
        correlation: &str,
        timestamp: i64,
    ) -> Event {
        Event {
            id: EventId(id.into()),
            event_type: event_type.into(),
            payload: json!({}),
            context: EventContext {
                causal: CausalContext {
                    id: EventId(id.into()),
                    sender: NodeId("n".into()),
                    causation_id: causation.map(|c| EventId(c.into())),
                    correlation_id: CorrelationId(correlation.into()),
                    path: vec![NodeId("n".into())],
                    timestamp,
                },
                identity: None,
                integrity: None,
                bag: ContextBag::default(),
            },
        }
    }

    #[test]
    fn round_trip_preserves_state_and_event_type() {
        let store = TemporalStore::new(100, Duration::from_secs(3600));
        let e = event_at("e1", "order.created", None, "c1", 1);
        store.record(&e, json!({"total": 10}));
        let snap = store.get(&EventId("e1".into())).unwrap();
        assert_eq!(snap.state, json!({"total": 10}));
        assert_eq!(snap.event_type, "order.created");
    }

    #[test]
    fn causal_chain_traverses_every_descendant_once_sorted_by_time() {
        let store = TemporalStore::new(100, Duration::from_secs(3600));
        store.record(&event_at("e1", "a", None, "c1", 1), json!(1));
        store.record(&event_at("e2", "b", Some("e1"), "c1", 2), json!(2));
        store.record(&event_at("e3", "c", Some("e2"), "c1", 3), json!(3));

        let chain = store.causal_chain(&EventId("e1".into()));
        let ids: Vec<String> = chain.iter().map(|s| s.event_id.0.clone()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn causal_chain_is_cycle_safe() {
        let store = TemporalStore::new(100, Duration::from_secs(3600));
        // Pathological self-referential causation id; DFS must still terminate.
        store.record(&event_at("e1", "a", Some("e1"), "c1", 1), json!(1));
        let chain = store.causal_chain(&EventId("e1".into()));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn correlation_groups_and_sorts_by_timestamp() {
        let store = TemporalStore::new(100, Duration::from_secs(3600));
        store.record(&event_at("e2", "b", None, "c1", 2), json!(2));
        store.record(&event_at("e1", "a", None, "c1", 1), json!(1));
        let group = store.correlation(&CorrelationId("c1".into()));
        let ids: Vec<String> = group.iter().map(|s| s.event_id.0.clone()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn when_with_event_id_matches_get() {
        let store = TemporalStore::new(100, Duration::from_secs(3600));
        store.record(&event_at("e1", "a", None, "c1", 1), json!(1));
        let via_when = store.when(TemporalQuery::EventId(&EventId("e1".into())));
        let via_get = store.get(&EventId("e1".into())).into_iter().collect::<Vec<_>>();
        assert_eq!(via_when, via_get);
    }

    #[test]
    fn history_limit_evicts_oldest_first() {
        let store = TemporalStore::new(2, Duration::from_secs(3600));
        store.record(&event_at("e1", "a", None, "c1", 1), json!(1));
        store.record(&event_at("e2", "a", None, "c1", 2), json!(2));
        store.record(&event_at("e3", "a", None, "c1", 3), json!(3));
        assert_eq!(store.len(), 2);
        assert!(store.get(&EventId("e1".into())).is_none());
        assert!(store.get(&EventId("e3".into())).is_some());
    }

    #[test]
    fn parse_max_age_handles_all_units_and_falls_back() {
        assert_eq!(parse_max_age("30d"), Duration::from_secs(30 * 86400));
        assert_eq!(parse_max_age("2h"), Duration::from_secs(2 * 3600));
        assert_eq!(parse_max_age("45m"), Duration::from_secs(45 * 60));
        assert_eq!(parse_max_age("10s"), Duration::from_secs(10));
        assert_eq!(parse_max_age("nonsense"), Duration::from_secs(30 * 86400));
    }
}
