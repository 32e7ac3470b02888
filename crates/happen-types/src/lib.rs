#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-types** -- shared wire-level data structures for Happen.
//!
//! The crate is dependency-light and sits at the bottom of the crate graph so
//! every other crate can depend on it without causing cycles. It makes no
//! assumptions about transport, persistence, or cryptography -- those live in
//! `happen-transport` and `happen-causality`.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum allowed length for a node's human-readable name component.
pub const MAX_NODE_NAME_LEN: usize = 128;

/// Maximum allowed length for a dotted event type string.
pub const MAX_EVENT_TYPE_LEN: usize = 256;

//─────────────────────────────
//  Identifiers
//─────────────────────────────

/// Unique identifier for a node, of the form `node-<name>-<timestamp36>-<rand>`.
///
/// Wrapped in a newtype (rather than a bare `String`) so the type system
/// distinguishes node identity from arbitrary event or correlation strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a fresh node id for `name`.
    ///
    /// Format: `node-<name>-<timestamp base36>-<4 random base36 chars>`.
    pub fn generate(name: &str) -> Self {
        let ts = chrono::Utc::now().timestamp_millis().max(0) as u128;
        let mut rng = rand::thread_rng();
        let rand_suffix: String = (0..4)
            .map(|_| {
                let n: u32 = rng.gen_range(0..36);
                std::char::from_digit(n, 36).unwrap_or('0')
            })
            .collect();
        Self(format!("node-{name}-{}-{rand_suffix}", to_base36(ts)))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn to_base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let digits = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    while n > 0 {
        out.push(digits[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Unique identifier for a single event (UUID v4, stringly-typed on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Generate a fresh random event id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier shared by every event in a causally-related family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//─────────────────────────────
//  Causal context
//─────────────────────────────

/// Causal metadata carried by every event.
///
/// Invariants (enforced by `happen-causality`, not by this struct):
/// `causal.id == event.id`, `sender` appears in `path`, and `path` is
/// strictly append-only across derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalContext {
    /// Mirrors the owning event's id.
    pub id: EventId,
    /// Node that produced this event.
    pub sender: NodeId,
    /// Id of the event this one was derived from, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<EventId>,
    /// Id shared across an entire causally-related family of events.
    pub correlation_id: CorrelationId,
    /// Ordered list of nodes this event (or its ancestors) passed through.
    pub path: Vec<NodeId>,
    /// Epoch milliseconds at creation time.
    pub timestamp: i64,
}

/// Optional signature/hash envelope over the canonical serialization of an
/// event (excluding this field itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityEnvelope {
    /// Hex-encoded SHA-256 digest of the canonical event bytes.
    pub hash: String,
    /// Hex-encoded Ed25519 signature over `hash`, if signed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    /// Hex-encoded Ed25519 public key used to verify `signature`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public_key: Option<String>,
}

/// Free-form, user-extensible key/value bag, partitioned into the semantic
/// sub-maps the spec calls out: `system`, `user`, `origin`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBag {
    /// Entries written by the runtime itself (e.g. diagnostics).
    #[serde(default)]
    pub system: HashMap<String, Value>,
    /// Entries written by application handlers.
    #[serde(default)]
    pub user: HashMap<String, Value>,
    /// Entries describing where/why the event originated.
    #[serde(default)]
    pub origin: HashMap<String, Value>,
}

/// Full context attached to every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    /// Causal chain metadata (see [`CausalContext`]).
    pub causal: CausalContext,
    /// Identity of the authenticated principal behind this event, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identity: Option<String>,
    /// Optional integrity envelope (hash/signature/public key).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub integrity: Option<IntegrityEnvelope>,
    /// Free-form extension bag.
    #[serde(default)]
    pub bag: ContextBag,
}

//─────────────────────────────
//  Event
//─────────────────────────────

/// A single typed event flowing through the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id; must equal `context.causal.id`.
    pub id: EventId,
    /// Dotted, hierarchical event type, e.g. `order.created`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: Value,
    /// Causal and extension context.
    pub context: EventContext,
}

impl Event {
    /// Partial context supplied by a caller constructing an event, before
    /// the remaining causal fields are filled in by `happen-causality`.
    pub fn event_type_segments(&self) -> std::str::Split<'_, char> {
        self.event_type.split('.')
    }
}

/// Errors surfaced while validating event-shaped structural constraints that
/// `happen-types` itself is responsible for (length/format, not causality).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypesError {
    /// The event type exceeded [`MAX_EVENT_TYPE_LEN`] or used disallowed characters.
    #[error("invalid event type {0:?}")]
    InvalidEventType(String),
    /// The node name exceeded [`MAX_NODE_NAME_LEN`].
    #[error("node name too long: {0} > {MAX_NODE_NAME_LEN}")]
    NodeNameTooLong(usize),
}

/// Validate that `event_type` is a well-formed dotted type string.
pub fn validate_event_type(event_type: &str) -> Result<(), TypesError> {
    if event_type.is_empty()
        || event_type.len() > MAX_EVENT_TYPE_LEN
        || event_type.starts_with('.')
        || event_type.ends_with('.')
        || event_type.contains("..")
        || !event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(TypesError::InvalidEventType(event_type.to_string()));
    }
    Ok(())
}
