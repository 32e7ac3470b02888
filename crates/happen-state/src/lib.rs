#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-state** -- a node's local state document and its temporal
//! (append-only, causally-indexed) history.

mod local_state;
mod temporal;

pub use local_state::{LocalState, Selector, StateError};
pub use temporal::{parse_max_age, TemporalQuery, TemporalSnapshot, TemporalStore};
