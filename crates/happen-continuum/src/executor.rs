use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use happen_types::EventId;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::context::HandlerContext;
use crate::handler::{EventInput, Handler, HandlerResult, LazySeq};

/// The final disposition of a continuum invocation.
pub enum ContinuumOutcome {
    /// The chain terminated with a non-function value.
    Returned(Value),
    /// The chain terminated with a lazy sequence, handed back unconsumed.
    Streamed(LazySeq),
    /// The chain terminated with `HandlerResult::Fail`.
    Failed {
        /// The failing value.
        value: Value,
        /// Id of the event that started this continuum.
        event_id: EventId,
        /// Type of the event that started this continuum.
        event_type: String,
    },
    /// The continuum's deadline elapsed before it produced a terminal value.
    TimedOut {
        /// Id of the event that started this continuum.
        event_id: EventId,
        /// Type of the event that started this continuum.
        event_type: String,
    },
}

impl fmt::Debug for ContinuumOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContinuumOutcome::Returned(v) => write!(f, "Returned({v})"),
            ContinuumOutcome::Streamed(_) => write!(f, "Streamed(..)"),
            ContinuumOutcome::Failed { value, event_id, event_type } => {
                write!(f, "Failed {{ value: {value}, event_id: {event_id:?}, event_type: {event_type:?} }}")
            }
            ContinuumOutcome::TimedOut { event_id, event_type } => {
                write!(f, "TimedOut {{ event_id: {event_id:?}, event_type: {event_type:?} }}")
            }
        }
    }
}

/// Drives a handler chain to completion under a concurrency cap and a
/// per-invocation deadline.
///
/// Mirrors the dispatch-and-emit loop shape used elsewhere in this codebase,
/// generalized: here the loop is "follow handler continuations until a
/// terminal value, a stream, a failure, or the deadline", gated by a
/// semaphore instead of a single-writer lock.
pub struct ContinuumExecutor {
    concurrency: Arc<Semaphore>,
    cap: usize,
    timeout_default: Duration,
}

impl ContinuumExecutor {
    /// Build an executor admitting at most `concurrency_cap` continuums at
    /// once, each bounded by `timeout_default` unless overridden per call.
    pub fn new(concurrency_cap: usize, timeout_default: Duration) -> Self {
        let cap = concurrency_cap.max(1);
        Self {
            concurrency: Arc::new(Semaphore::new(cap)),
            cap,
            timeout_default,
        }
    }

    /// The configured concurrency cap.
    pub fn concurrency_cap(&self) -> usize {
        self.cap
    }

    /// Continuums currently allowed to start before a new invocation waits
    /// in the semaphore's FIFO queue.
    pub fn available_permits(&self) -> usize {
        self.concurrency.available_permits()
    }

    /// Run `initial` to completion against `input`, starting from `ctx`.
    ///
    /// Blocks (FIFO, via the semaphore) if the concurrency cap is already
    /// saturated. `timeout_override` replaces the executor's default
    /// deadline for this single invocation.
    pub async fn run(
        &self,
        input: EventInput,
        initial: Handler,
        ctx: HandlerContext,
        timeout_override: Option<Duration>,
    ) -> ContinuumOutcome {
        let permit = self
            .concurrency
            .acquire()
            .await
            .expect("continuum semaphore never closes");

        let (event_id, event_type) = match input.first() {
            Some(e) => (e.id.clone(), e.event_type.clone()),
            None => (EventId("unknown".into()), "unknown".into()),
        };
        let deadline = timeout_override.unwrap_or(self.timeout_default);

        let outcome = match tokio::time::timeout(deadline, Self::drive(input, initial, ctx)).await {
            Ok(HandlerResult::Return(v)) => ContinuumOutcome::Returned(v),
            Ok(HandlerResult::Stream(s)) => ContinuumOutcome::Streamed(s),
            Ok(HandlerResult::Fail(value)) => ContinuumOutcome::Failed { value, event_id, event_type },
            Ok(HandlerResult::Continue(_)) => unreachable!("drive never returns Continue"),
            Err(_elapsed) => ContinuumOutcome::TimedOut { event_id, event_type },
        };

        drop(permit);
        outcome
    }

    /// Follow `Continue` links until a non-`Continue` result, ignoring the
    /// context threaded back out (callers observe it only via `ctx` fields
    /// handlers chose to leave behind, e.g. `error`; the executor itself has
    /// no further use for it once a terminal value is reached).
    async fn drive(input: EventInput, initial: Handler, ctx: HandlerContext) -> HandlerResult {
        let mut current = initial;
        let mut ctx = ctx;
        loop {
            let (result, next_ctx) = current.call(input.clone(), ctx).await;
            ctx = next_ctx;
            match result {
                HandlerResult::Continue(next) => {
                    current = next;
                    continue;
                }
                terminal => return terminal,
            }
        }
    }
}
