#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-causality** -- event construction, derivation, validation, and
//! the optional integrity envelope.
//!
//! Every event in Happen carries a [`happen_types::CausalContext`] that
//! traces it back to the root of its causal family. This crate is the only
//! place that is allowed to stamp or extend that context; everything else
//! treats it as read-only.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use happen_types::{CausalContext, ContextBag, CorrelationId, Event, EventContext, EventId, NodeId};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors raised while constructing, deriving, validating, or signing events.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CausalityError {
    /// The event failed structural validation at ingress and was dropped.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    /// The payload nested beyond the canonicalization depth guard -- the
    /// closest a tree-shaped `serde_json::Value` can come to a "cycle".
    #[error("payload exceeds maximum canonicalization depth")]
    TooDeep,
    /// Integrity verification found the recomputed hash did not match.
    #[error("integrity hash mismatch")]
    HashMismatch,
    /// Signature verification failed.
    #[error("signature verification failed")]
    SignatureInvalid,
    /// Event carries a signature but no public key to verify it with.
    #[error("missing public key for signature verification")]
    MissingPublicKey,
    /// Hex decoding of a stored hash/signature/key failed.
    #[error("malformed integrity encoding: {0}")]
    MalformedEncoding(String),
}

/// Maximum nesting depth accepted by [`canonicalize`]. Guards against
/// pathological payloads; also the mechanism by which "cyclic" input (never
/// literally possible for a tree-shaped `Value`, but possible via
/// adversarially deep construction) is rejected rather than silently
/// stack-overflowing.
pub const MAX_CANONICALIZE_DEPTH: usize = 64;

/// Optional overrides a caller may supply when creating a root event.
#[derive(Debug, Clone, Default)]
pub struct PartialContext {
    /// Reuse an existing correlation id instead of minting a fresh one.
    pub correlation_id: Option<CorrelationId>,
    /// Authenticated principal behind this event, if known.
    pub identity: Option<String>,
    /// Extension bag to seed the event with.
    pub bag: ContextBag,
}

/// Construct a brand-new root event.
///
/// Fills a new id, current timestamp, `sender = node_id`, `path = [node_id]`,
/// and a fresh `correlation_id` unless one was supplied in `partial`.
pub fn create_event(
    event_type: impl Into<String>,
    payload: Value,
    partial: Option<PartialContext>,
    node_id: &NodeId,
) -> Event {
    let partial = partial.unwrap_or_default();
    let id = EventId::generate();
    let correlation_id = partial.correlation_id.unwrap_or_else(CorrelationId::generate);

    let causal = CausalContext {
        id: id.clone(),
        sender: node_id.clone(),
        causation_id: None,
        correlation_id,
        path: vec![node_id.clone()],
        timestamp: chrono::Utc::now().timestamp_millis(),
    };

    Event {
        id,
        event_type: event_type.into(),
        payload,
        context: EventContext {
            causal,
            identity: partial.identity,
            integrity: None,
            bag: partial.bag,
        },
    }
}

/// Derive a new event from `parent`.
///
/// `causation_id` becomes `parent.id`, `correlation_id` is inherited, and
/// `path` is `parent.path` with `node_id` appended -- unless `node_id` is
/// already the last element, in which case the path is left unchanged (a
/// node deriving repeatedly without another hop in between does not grow
/// the path). Deduplication beyond that is not performed: a node may
/// legitimately appear multiple times if the chain genuinely passes through
/// it more than once.
pub fn create_derived(
    parent: &Event,
    event_type: impl Into<String>,
    payload: Value,
    node_id: &NodeId,
) -> Event {
    let id = EventId::generate();
    let mut path = parent.context.causal.path.clone();
    if path.last() != Some(node_id) {
        path.push(node_id.clone());
    }

    let causal = CausalContext {
        id: id.clone(),
        sender: node_id.clone(),
        causation_id: Some(parent.id.clone()),
        correlation_id: parent.context.causal.correlation_id.clone(),
        path,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };

    Event {
        id,
        event_type: event_type.into(),
        payload,
        context: EventContext {
            causal,
            identity: parent.context.identity.clone(),
            integrity: None,
            bag: ContextBag::default(),
        },
    }
}

/// Validate that an event is structurally well-formed enough to enter the
/// pattern engine.
///
/// Checks: `id`, `sender`, `correlation_id`, `timestamp` are non-empty/valid;
/// `path` is non-empty; `sender` appears in `path`; `event.id` matches
/// `context.causal.id`.
pub fn validate(event: &Event) -> Result<(), CausalityError> {
    let causal = &event.context.causal;

    let reason = if event.id != causal.id {
        Some("event.id does not match context.causal.id")
    } else if causal.sender.0.trim().is_empty() {
        Some("empty sender")
    } else if causal.correlation_id.0.trim().is_empty() {
        Some("empty correlation id")
    } else if causal.timestamp <= 0 {
        Some("non-positive timestamp")
    } else if causal.path.is_empty() {
        Some("empty path")
    } else if !causal.path.contains(&causal.sender) {
        Some("sender not present in path")
    } else {
        None
    };

    match reason {
        Some(reason) => {
            tracing::warn!(event_id = %event.id, reason, "event failed causality validation");
            Err(CausalityError::InvalidEvent(reason.into()))
        }
        None => Ok(()),
    }
}

//─────────────────────────────
//  Canonical serialization + integrity
//─────────────────────────────

/// Recursively sort object keys so two logically-identical values serialize
/// to byte-identical output regardless of construction order.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CausalityError> {
    let sorted = sort_keys(value, 0)?;
    serde_json::to_vec(&sorted)
        .map_err(|e| CausalityError::InvalidEvent(format!("serialization failed: {e}")))
}

fn sort_keys(value: &Value, depth: usize) -> Result<Value, CausalityError> {
    if depth > MAX_CANONICALIZE_DEPTH {
        return Err(CausalityError::TooDeep);
    }
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), sort_keys(v, depth + 1)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(sort_keys(item, depth + 1)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Build the canonical, integrity-field-excluded view of `event` used for
/// hashing.
fn canonical_event_bytes(event: &Event) -> Result<Vec<u8>, CausalityError> {
    let mut value = serde_json::to_value(event)
        .map_err(|e| CausalityError::InvalidEvent(format!("serialization failed: {e}")))?;
    if let Some(context) = value.get_mut("context") {
        if let Some(obj) = context.as_object_mut() {
            obj.remove("integrity");
        }
    }
    canonicalize(&value)
}

/// Compute the SHA-256 hash (hex-encoded) of `event`'s canonical bytes,
/// excluding any existing integrity envelope.
pub fn compute_hash(event: &Event) -> Result<String, CausalityError> {
    let bytes = canonical_event_bytes(event)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

/// Compute the hash and sign it with `signing_key`, writing the resulting
/// [`happen_types::IntegrityEnvelope`] into `event.context.integrity`.
pub fn sign(event: &mut Event, signing_key: &SigningKey) -> Result<(), CausalityError> {
    let hash = compute_hash(event)?;
    let signature = signing_key.sign(hash.as_bytes());
    event.context.integrity = Some(happen_types::IntegrityEnvelope {
        hash,
        signature: Some(hex::encode(signature.to_bytes())),
        public_key: Some(hex::encode(signing_key.verifying_key().to_bytes())),
    });
    Ok(())
}

/// Recompute the hash and, if a signature is present, verify it against the
/// embedded public key. Returns `Ok(())` when the event's integrity envelope
/// (if any) is internally consistent.
pub fn verify(event: &Event) -> Result<(), CausalityError> {
    let result = verify_inner(event);
    if let Err(err) = &result {
        tracing::warn!(event_id = %event.id, error = %err, "event failed integrity verification");
    }
    result
}

fn verify_inner(event: &Event) -> Result<(), CausalityError> {
    let Some(integrity) = &event.context.integrity else {
        return Ok(());
    };

    let recomputed = compute_hash(event)?;
    if recomputed != integrity.hash {
        return Err(CausalityError::HashMismatch);
    }

    let Some(sig_hex) = &integrity.signature else {
        return Ok(());
    };
    let Some(pk_hex) = &integrity.public_key else {
        return Err(CausalityError::MissingPublicKey);
    };

    let sig_bytes = hex::decode(sig_hex)
        .map_err(|e| CausalityError::MalformedEncoding(format!("signature: {e}")))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| CausalityError::MalformedEncoding("signature length".into()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    let pk_bytes = hex::decode(pk_hex)
        .map_err(|e| CausalityError::MalformedEncoding(format!("public key: {e}")))?;
    let pk_bytes: [u8; 32] = pk_bytes
        .try_into()
        .map_err(|_| CausalityError::MalformedEncoding("public key length".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&pk_bytes)
        .map_err(|e| CausalityError::MalformedEncoding(format!("public key: {e}")))?;

    verifying_key
        .verify(integrity.hash.as_bytes(), &signature)
        .map_err(|_| CausalityError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(n: &str) -> NodeId {
        NodeId(n.to_string())
    }

    #[test]
    fn create_event_stamps_self_consistent_causal_context() {
        let e = create_event("order.created", json!({"id": "O1"}), None, &node("A"));
        assert_eq!(e.id, e.context.causal.id);
        assert_eq!(e.context.causal.sender, node("A"));
        assert_eq!(e.context.causal.path, vec![node("A")]);
        assert!(e.context.causal.causation_id.is_none());
        assert!(validate(&e).is_ok());
    }

    #[test]
    fn derived_event_preserves_and_extends_chain() {
        let root = create_event("cart.checkout-initiated", json!({}), None, &node("U"));
        let d1 = create_derived(&root, "order.created", json!({}), &node("C"));
        let d2 = create_derived(&d1, "payment.requested", json!({}), &node("P"));

        assert_eq!(d2.context.causal.path, vec![node("U"), node("C"), node("P")]);
        assert_eq!(d2.context.causal.correlation_id, root.context.causal.correlation_id);
        assert_eq!(d1.context.causal.correlation_id, root.context.causal.correlation_id);
        assert_eq!(d2.context.causal.causation_id, Some(d1.id.clone()));
        assert_eq!(d1.context.causal.causation_id, Some(root.id.clone()));
    }

    #[test]
    fn derived_event_without_node_hop_does_not_duplicate_path_tail() {
        let root = create_event("a.start", json!({}), None, &node("A"));
        let d1 = create_derived(&root, "a.step", json!({}), &node("A"));
        assert_eq!(d1.context.causal.path, vec![node("A")]);
    }

    #[test]
    fn validate_rejects_sender_outside_path() {
        let mut e = create_event("x", json!({}), None, &node("A"));
        e.context.causal.sender = node("B");
        assert!(validate(&e).is_err());
    }

    #[test]
    fn validate_rejects_mismatched_ids() {
        let mut e = create_event("x", json!({}), None, &node("A"));
        e.id = EventId("other".into());
        assert!(validate(&e).is_err());
    }

    #[test]
    fn canonicalize_is_stable_under_key_reordering() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn hash_then_sign_then_verify_round_trips() {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let mut e = create_event("order.created", json!({"id": "O1"}), None, &node("A"));
        sign(&mut e, &signing_key).unwrap();
        assert!(verify(&e).is_ok());
    }

    #[test]
    fn tampering_after_signing_fails_verification() {
        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let mut e = create_event("order.created", json!({"id": "O1"}), None, &node("A"));
        sign(&mut e, &signing_key).unwrap();
        e.payload = json!({"id": "TAMPERED"});
        assert_eq!(verify(&e).unwrap_err(), CausalityError::HashMismatch);
    }

    #[test]
    fn event_without_integrity_verifies_trivially() {
        let e = create_event("order.created", json!({}), None, &node("A"));
        assert!(verify(&e).is_ok());
    }
}
