#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-continuum** -- the handler-chain executor ("continuum") driving
//! a single ingress event through a node's registered handlers, plus the
//! flow combinators library built on top of it.
//!
//! A handler either hands control to another handler (`Continue`), resolves
//! a terminal value (`Return`), streams a lazy sequence (`Stream`), or fails
//! (`Fail`). The executor loops over that chain under a concurrency cap and
//! deadline; it never touches transport or causality directly -- callers
//! (`happen-node`) turn a `ContinuumOutcome::TimedOut`/`Failed` into a
//! `system.error` event themselves.

mod combinators;
mod context;
mod executor;
mod handler;

pub use combinators::{
    branch, catch, fallback, filter, finally, map, parallel, retry, sequence, timeout, when, CondFn, RetryPolicy,
};
pub use context::HandlerContext;
pub use executor::{ContinuumExecutor, ContinuumOutcome};
pub use handler::{EventInput, Handler, HandlerFn, HandlerFuture, HandlerOutput, HandlerResult, LazySeq};
