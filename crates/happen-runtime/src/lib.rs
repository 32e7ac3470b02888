#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-runtime** -- wires the event-processing substrate together.
//!
//! Builds the transport, the cross-node view registry, and the Flow-Balance
//! monitor once, then hands out [`Runtime`] as the handle callers spawn nodes
//! and node groups from. Also owns structured logging initialization and the
//! `RuntimeConfig` default-construction pattern, mirroring the shape of this
//! codebase's top-level runtime crate.

mod config;
mod logging;
mod runtime;

pub use config::{test_config, RuntimeConfig};
pub use happen_resilience::ServiceStatus;
pub use logging::init_tracing;
pub use runtime::{Runtime, RuntimeError};
