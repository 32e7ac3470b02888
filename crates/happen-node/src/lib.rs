#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-node** -- a running event-processing node: ingress/egress
//! plumbing over `happen-transport`, local state, temporal history,
//! continuum dispatch, request-response, and multi-node fan-out.
//!
//! Mirrors the shape of this codebase's top-level runtime struct: a handle
//! owning shared state behind `Arc`, a spawned background task driving an
//! event loop, and typed start/stop lifecycle methods.

mod envelope;
mod group;
mod node;

pub use envelope::{EventsPayload, IngressEnvelope, ReplyEnvelope, ReplyOutcome};
pub use group::{GroupSendOutcome, NodeGroup};
pub use node::{broadcast_subject, Node, NodeConfig, NodeError, SendResult};
