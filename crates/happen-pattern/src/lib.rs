#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-pattern** -- the pattern-indexed dispatch table.
//!
//! A node's handler registrations are compiled once at registration time into
//! one of three shapes -- exact string match, an intra-segment wildcard /
//! alternatives regex, or an opaque predicate -- and indexed so that
//! `lookup(event_type, event)` can answer "which handlers match, in priority
//! order" without re-scanning every registration on every event.
//!
//! Caching: a per-event-type result cache is populated whenever no predicate
//! patterns are registered at all. The moment a predicate pattern is added,
//! caching is disabled wholesale, because a predicate's answer can depend on
//! the event value and not just its type -- this is a deliberate design
//! choice carried over unchanged from the source system, not an oversight.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use happen_types::Event;
use regex::Regex;

/// Errors raised while compiling a pattern string.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern string was syntactically invalid (unbalanced or empty
    /// alternation braces).
    #[error("invalid pattern syntax: {0}")]
    PatternSyntax(String),
}

/// A predicate pattern: receives the event type and, when available, the
/// full event, and decides whether it matches.
pub type PredicateFn = Arc<dyn Fn(&str, Option<&Event>) -> bool + Send + Sync>;

/// The pattern half of a registration, before compilation.
#[derive(Clone)]
pub enum PatternSpec {
    /// A dotted string pattern: exact, wildcard (`*`), or alternatives (`{a,b}`).
    Str(String),
    /// An arbitrary predicate over `(event_type, event)`.
    Predicate(PredicateFn),
}

impl From<&str> for PatternSpec {
    fn from(s: &str) -> Self {
        PatternSpec::Str(s.to_string())
    }
}

impl From<String> for PatternSpec {
    fn from(s: String) -> Self {
        PatternSpec::Str(s)
    }
}

/// Opaque handle to a registration, returned by `register` and consumed by
/// `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

enum Compiled {
    Exact(String),
    Any,
    Regex(Regex),
    Predicate(PredicateFn),
}

impl Compiled {
    fn is_predicate(&self) -> bool {
        matches!(self, Compiled::Predicate(_))
    }

    fn matches(&self, event_type: &str, event: Option<&Event>) -> bool {
        match self {
            Compiled::Exact(s) => s == event_type,
            Compiled::Any => true,
            Compiled::Regex(re) => re.is_match(event_type),
            Compiled::Predicate(f) => {
                match panic::catch_unwind(AssertUnwindSafe(|| f(event_type, event))) {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(event_type, "pattern predicate panicked; treated as no match");
                        false
                    }
                }
            }
        }
    }
}

struct Registration<H> {
    id: RegistrationId,
    priority: i32,
    insertion_seq: u64,
    compiled: Compiled,
    handler: H,
}

struct Inner<H> {
    exact: HashMap<String, Vec<RegistrationId>>,
    nonexact: Vec<Registration<H>>,
    /// Exact-pattern registrations keyed by id so both indices can share storage.
    exact_store: HashMap<RegistrationId, Registration<H>>,
    cache: HashMap<String, Vec<H>>,
    predicate_count: usize,
    next_seq: u64,
    next_id: u64,
}

impl<H> Default for Inner<H> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            nonexact: Vec::new(),
            exact_store: HashMap::new(),
            cache: HashMap::new(),
            predicate_count: 0,
            next_seq: 0,
            next_id: 0,
        }
    }
}

/// The pattern-indexed dispatch table for one node.
///
/// Generic over the handler type `H` so this crate has no opinion on what a
/// "handler" actually is -- `happen-continuum` instantiates it with its own
/// handler closures.
pub struct PatternEngine<H: Clone> {
    inner: RwLock<Inner<H>>,
}

impl<H: Clone> Default for PatternEngine<H> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl<H: Clone> PatternEngine<H> {
    /// Create an empty pattern engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` with `priority` (higher fires earlier) and
    /// `handler`. Returns an id usable with [`unregister`](Self::unregister).
    pub fn register(
        &self,
        pattern: impl Into<PatternSpec>,
        priority: i32,
        handler: H,
    ) -> Result<RegistrationId, PatternError> {
        let compiled = compile(pattern.into())?;
        let mut inner = self.inner.write().expect("pattern engine lock poisoned");
        let id = RegistrationId(inner.next_id);
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let is_predicate = compiled.is_predicate();
        if is_predicate {
            inner.predicate_count += 1;
        }

        match &compiled {
            Compiled::Exact(s) => {
                let key = s.clone();
                let reg = Registration {
                    id,
                    priority,
                    insertion_seq: seq,
                    compiled,
                    handler,
                };
                inner.exact.entry(key).or_default().push(id);
                inner.exact_store.insert(id, reg);
            }
            _ => {
                inner.nonexact.push(Registration {
                    id,
                    priority,
                    insertion_seq: seq,
                    compiled,
                    handler,
                });
            }
        }

        inner.cache.clear();
        Ok(id)
    }

    /// Remove a prior registration. O(n) over the matching bucket plus cache
    /// invalidation.
    pub fn unregister(&self, id: RegistrationId) {
        let mut inner = self.inner.write().expect("pattern engine lock poisoned");
        if let Some(reg) = inner.exact_store.remove(&id) {
            if let Compiled::Exact(key) = &reg.compiled {
                if let Some(bucket) = inner.exact.get_mut(key) {
                    bucket.retain(|rid| *rid != id);
                    if bucket.is_empty() {
                        inner.exact.remove(key);
                    }
                }
            }
            inner.cache.clear();
            return;
        }
        let before = inner.nonexact.len();
        let mut removed_predicate = false;
        inner.nonexact.retain(|r| {
            let keep = r.id != id;
            if !keep && r.compiled.is_predicate() {
                removed_predicate = true;
            }
            keep
        });
        if inner.nonexact.len() != before {
            if removed_predicate {
                inner.predicate_count = inner.predicate_count.saturating_sub(1);
            }
            inner.cache.clear();
        }
    }

    /// Answer "which handlers match `event_type`", in descending-priority
    /// order (ties broken by insertion order). `event` is passed to
    /// predicate patterns when present.
    pub fn lookup(&self, event_type: &str, event: Option<&Event>) -> Vec<H> {
        {
            let inner = self.inner.read().expect("pattern engine lock poisoned");
            if inner.predicate_count == 0 {
                if let Some(cached) = inner.cache.get(event_type) {
                    return cached.clone();
                }
            }
        }

        let mut inner = self.inner.write().expect("pattern engine lock poisoned");
        let mut matches: Vec<(i32, u64, H)> = Vec::new();

        if let Some(ids) = inner.exact.get(event_type) {
            for id in ids {
                if let Some(reg) = inner.exact_store.get(id) {
                    matches.push((reg.priority, reg.insertion_seq, reg.handler.clone()));
                }
            }
        }

        for reg in inner.nonexact.iter() {
            if reg.compiled.matches(event_type, event) {
                matches.push((reg.priority, reg.insertion_seq, reg.handler.clone()));
            }
        }

        matches.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let result: Vec<H> = matches.into_iter().map(|(_, _, h)| h).collect();

        if inner.predicate_count == 0 {
            inner.cache.insert(event_type.to_string(), result.clone());
        }

        result
    }

    /// Number of live registrations (exact + non-exact).
    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("pattern engine lock poisoned");
        inner.exact_store.len() + inner.nonexact.len()
    }

    /// Whether there are no registrations at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compile a [`PatternSpec`] into its internal representation.
fn compile(spec: PatternSpec) -> Result<Compiled, PatternError> {
    let pattern = match spec {
        PatternSpec::Predicate(f) => return Ok(Compiled::Predicate(f)),
        PatternSpec::Str(s) => s,
    };

    if pattern == "*" {
        return Ok(Compiled::Any);
    }

    if !pattern.contains('*') && !pattern.contains('{') {
        return Ok(Compiled::Exact(pattern));
    }

    let regex_src = lower_to_regex(&pattern)?;
    let re = Regex::new(&regex_src)
        .map_err(|e| PatternError::PatternSyntax(format!("{pattern}: {e}")))?;
    Ok(Compiled::Regex(re))
}

/// Lower a dotted wildcard/alternatives pattern to an anchored regex source.
fn lower_to_regex(pattern: &str) -> Result<String, PatternError> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^.]*"),
            '.' => out.push_str("\\."),
            '{' => {
                let mut group = String::new();
                let mut closed = false;
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        closed = true;
                        break;
                    }
                    group.push(c2);
                }
                if !closed {
                    return Err(PatternError::PatternSyntax(format!(
                        "{pattern}: unbalanced '{{'"
                    )));
                }
                let alts: Vec<&str> = group.split(',').collect();
                if alts.is_empty() || alts.iter().any(|a| a.trim().is_empty()) {
                    return Err(PatternError::PatternSyntax(format!(
                        "{pattern}: empty alternation"
                    )));
                }
                let escaped: Vec<String> = alts.iter().map(|a| regex::escape(a.trim())).collect();
                out.push('(');
                out.push_str(&escaped.join("|"));
                out.push(')');
            }
            '}' => {
                return Err(PatternError::PatternSyntax(format!(
                    "{pattern}: unbalanced '}}'"
                )));
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use happen_types::{CausalContext, ContextBag, CorrelationId, EventContext, EventId, NodeId};
    use serde_json::json;

    fn dummy_event(event_type: &str) -> Event {
        Event {
            id: EventId("e1".into()),
            event_type: event_type.to_string(),
            payload: json!({}),
            context: EventContext {
                causal: CausalContext {
                    id: EventId("e1".into()),
                    sender: NodeId("node-a".into()),
                    causation_id: None,
                    correlation_id: CorrelationId("c1".into()),
                    path: vec![NodeId("node-a".into())],
                    timestamp: 0,
                },
                identity: None,
                integrity: None,
                bag: ContextBag::default(),
            },
        }
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        engine.register("order.created", 0, "h1").unwrap();
        assert_eq!(engine.lookup("order.created", None), vec!["h1"]);
        assert!(engine.lookup("order.updated", None).is_empty());
    }

    #[test]
    fn wildcard_is_intra_segment() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        engine.register("order.*", 0, "h1").unwrap();
        assert_eq!(engine.lookup("order.created", None), vec!["h1"]);
        assert!(engine.lookup("order.created.extra", None).is_empty());
    }

    #[test]
    fn bare_star_matches_everything_including_multi_segment() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        engine.register("*", 0, "h1").unwrap();
        assert_eq!(engine.lookup("order.created.v2", None), vec!["h1"]);
        assert_eq!(engine.lookup("", None), vec!["h1"]);
    }

    #[test]
    fn alternatives_pattern_expands_to_alternation() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        engine.register("{order,payment}.created", 0, "h1").unwrap();
        assert_eq!(engine.lookup("order.created", None), vec!["h1"]);
        assert_eq!(engine.lookup("payment.created", None), vec!["h1"]);
        assert!(engine.lookup("refund.created", None).is_empty());
    }

    #[test]
    fn empty_alternation_is_pattern_syntax_error() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        let err = engine.register("{}.created", 0, "h1").unwrap_err();
        assert_eq!(err, PatternError::PatternSyntax("{}.created: empty alternation".into()));
    }

    #[test]
    fn unbalanced_brace_is_pattern_syntax_error() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        assert!(engine.register("{order.created", 0, "h1").is_err());
    }

    #[test]
    fn priority_orders_descending_ties_by_insertion() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        engine.register("order.*", 1, "low").unwrap();
        engine.register("order.created", 10, "high").unwrap();
        engine.register("order.created", 10, "high2").unwrap();
        assert_eq!(
            engine.lookup("order.created", None),
            vec!["high", "high2", "low"]
        );
    }

    #[test]
    fn predicate_disables_caching_and_sees_event() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        let pred: PredicateFn = Arc::new(|t, e| t == "order.created" && e.is_some());
        engine
            .register(PatternSpec::Predicate(pred), 0, "h1")
            .unwrap();
        let ev = dummy_event("order.created");
        assert_eq!(engine.lookup("order.created", Some(&ev)), vec!["h1"]);
        assert!(engine.lookup("order.created", None).is_empty());
    }

    #[test]
    fn panicking_predicate_is_treated_as_no_match() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        let pred: PredicateFn = Arc::new(|_, _| panic!("boom"));
        engine
            .register(PatternSpec::Predicate(pred), 0, "h1")
            .unwrap();
        assert!(engine.lookup("order.created", None).is_empty());
    }

    #[test]
    fn unregister_removes_exact_registration() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        let id = engine.register("order.created", 0, "h1").unwrap();
        engine.unregister(id);
        assert!(engine.lookup("order.created", None).is_empty());
    }

    #[test]
    fn cache_recomputes_after_registration_change() {
        let engine: PatternEngine<&'static str> = PatternEngine::new();
        engine.register("order.created", 0, "h1").unwrap();
        assert_eq!(engine.lookup("order.created", None), vec!["h1"]);
        engine.register("order.created", 5, "h2").unwrap();
        assert_eq!(engine.lookup("order.created", None), vec!["h2", "h1"]);
    }
}
