use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::BoxStream;
use happen_types::Event;
use serde_json::Value;

use crate::context::HandlerContext;

/// What a single continuum invocation is driven by: one event, or -- in
/// batch mode -- the full array the node's ingress funnel received at once.
#[derive(Debug, Clone)]
pub enum EventInput {
    /// A single ingress event.
    Single(Event),
    /// An array of events delivered together; the executor re-dispatches
    /// the whole array to every handler in the chain rather than to each
    /// element individually.
    Batch(Vec<Event>),
}

impl EventInput {
    /// The first (or only) event, used to identify the continuum for
    /// diagnostics and error events.
    pub fn first(&self) -> Option<&Event> {
        match self {
            EventInput::Single(e) => Some(e),
            EventInput::Batch(events) => events.first(),
        }
    }
}

/// A cancellable lazy sequence handed from a streaming handler straight to
/// the caller; dropping it stops pulling further items.
pub type LazySeq = BoxStream<'static, Value>;

/// The handler's context after it finishes; handlers own and return their
/// context rather than mutating it behind a lock, so the executor threads
/// it explicitly from one handler to the next.
pub type HandlerOutput = (HandlerResult, HandlerContext);

/// The boxed future a handler invocation returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerOutput> + Send>>;

/// The callable core of a handler: given the continuum's input and current
/// context, produce a result and the (possibly mutated) context.
pub type HandlerFn = Arc<dyn Fn(EventInput, HandlerContext) -> HandlerFuture + Send + Sync>;

/// What a handler invocation resolves to.
pub enum HandlerResult {
    /// Hand off to the next handler in the chain. Source-language
    /// "thrown function" branches are modeled as this variant too --
    /// error-as-flow-branch is just another continuation.
    Continue(Handler),
    /// A terminal, non-function value: the continuum's result.
    Return(Value),
    /// A lazy sequence, surfaced to the caller without further iteration by
    /// the executor.
    Stream(LazySeq),
    /// A terminal failure. Recorded on the context as `error`, surfaced to
    /// the caller as a `system.error` event by the node layer.
    Fail(Value),
}

impl fmt::Debug for HandlerResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerResult::Continue(h) => write!(f, "Continue({})", h.name),
            HandlerResult::Return(v) => write!(f, "Return({v})"),
            HandlerResult::Stream(_) => write!(f, "Stream(..)"),
            HandlerResult::Fail(v) => write!(f, "Fail({v})"),
        }
    }
}

/// A named, callable link in a continuum chain.
///
/// The name exists purely for diagnostics: it is pushed onto
/// `HandlerContext::path` immediately before the handler runs.
#[derive(Clone)]
pub struct Handler {
    pub(crate) name: String,
    func: HandlerFn,
}

impl Handler {
    /// Wrap a raw handler function with a diagnostic name.
    pub fn new(name: impl Into<String>, func: HandlerFn) -> Self {
        Self { name: name.into(), func }
    }

    /// This handler's diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the handler, recording its name on `ctx` first.
    pub async fn call(&self, input: EventInput, mut ctx: HandlerContext) -> HandlerOutput {
        ctx.record(&self.name);
        (self.func)(input, ctx).await
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish()
    }
}
