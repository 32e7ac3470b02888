#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-flow-balance** -- infers system health from consumer telemetry.
//!
//! Runs as a periodic observer (mirrors the `DashMap`-keyed tracking shape
//! used by this codebase's progress monitor) over `happen-transport`
//! consumer info, derives per-node health, detects named patterns, and emits
//! `node.down`/`system.down` events through a supplied emitter.

mod metrics;
mod monitor;
mod patterns;

pub use metrics::{compute_metrics, ConsumerMetrics};
pub use monitor::{Emitter, FlowBalanceMonitor, NodeHealthSnapshot};
pub use patterns::{FlowPattern, NodeHealth, Severity, Thresholds};
