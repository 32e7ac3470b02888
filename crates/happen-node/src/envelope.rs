use happen_types::{Event, EventId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What crosses the wire when one node sends an event to another. Carries an
/// optional reply subject so the responder knows where to publish its
/// continuum's terminal value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressEnvelope {
    /// The event(s) being delivered: a bare event for a normal send, or an
    /// array for a batch delivered to the node's ingress funnel at once.
    pub events: EventsPayload,
    /// Subject the responder should publish its outcome to, if this is a
    /// request-response send rather than fire-and-forget.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<String>,
}

/// The `events` field of an [`IngressEnvelope`]. Untagged so the wire shape
/// matches spec.md's "a bare event, or an array of events" ingress value
/// exactly: a JSON object decodes as `Single`, a JSON array as `Batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventsPayload {
    /// One event, dispatched as [`happen_continuum::EventInput::Single`].
    Single(Event),
    /// Several events delivered together, dispatched as
    /// [`happen_continuum::EventInput::Batch`] against a single handler
    /// chosen by the first event's pattern match.
    Batch(Vec<Event>),
}

/// The outcome a responder reports back on a reply subject. Lazy-sequence
/// results can't cross the wire as JSON, so a streaming response to a
/// cross-node request degrades to `StreamUnsupported` -- true streaming is
/// only available to same-process callers holding the responder `Node`
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyOutcome {
    /// The continuum resolved to this terminal value.
    Value(Value),
    /// The continuum failed with this value.
    Failed(Value),
    /// The continuum streamed a result, which has no wire representation.
    StreamUnsupported,
    /// The responder's continuum deadline elapsed before a result was ready.
    TimedOut,
}

/// A responder's reply to a prior [`IngressEnvelope`] request, keyed by the
/// originating event's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// The id of the event this is a reply to.
    pub event_id: EventId,
    /// The continuum's outcome.
    pub outcome: ReplyOutcome,
}
