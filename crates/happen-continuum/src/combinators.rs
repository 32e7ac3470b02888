use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};

use crate::context::HandlerContext;
use crate::handler::{EventInput, Handler, HandlerFn, HandlerResult};

/// A predicate over a continuum's input and in-flight context, used by
/// [`when`] and [`branch`].
pub type CondFn = Arc<dyn Fn(&EventInput, &HandlerContext) -> bool + Send + Sync>;

/// `when(cond, h)` -- continues to `h` iff `cond(&input, &ctx)` holds,
/// otherwise terminates with `null`.
pub fn when(cond: CondFn, h: Handler) -> Handler {
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let matched = cond(&input, &ctx);
        let h = h.clone();
        Box::pin(async move {
            if matched {
                (HandlerResult::Continue(h), ctx)
            } else {
                (HandlerResult::Return(Value::Null), ctx)
            }
        })
    });
    Handler::new("when", f)
}

/// `branch([(cond, h)...])` -- the first arm whose condition holds wins;
/// if none match, terminates with `null`.
pub fn branch(arms: Vec<(CondFn, Handler)>) -> Handler {
    let arms = Arc::new(arms);
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let arms = Arc::clone(&arms);
        Box::pin(async move {
            for (cond, h) in arms.iter() {
                if cond(&input, &ctx) {
                    return (HandlerResult::Continue(h.clone()), ctx);
                }
            }
            (HandlerResult::Return(Value::Null), ctx)
        })
    });
    Handler::new("branch", f)
}

/// `parallel(h...)` -- awaits every handler to its own terminal value
/// concurrently against independent copies of `ctx`; the combined result is
/// `null`. Any handler that fails marks `ctx.error`, but does not stop the
/// others from running to completion.
pub fn parallel(handlers: Vec<Handler>) -> Handler {
    let handlers = Arc::new(handlers);
    let f: HandlerFn = Arc::new(move |input, mut ctx| {
        let handlers = Arc::clone(&handlers);
        Box::pin(async move {
            let futures = handlers
                .iter()
                .cloned()
                .map(|h| {
                    let input = input.clone();
                    let branch_ctx = ctx.clone();
                    async move { run_to_terminal(h, input, branch_ctx).await }
                })
                .collect::<Vec<_>>();
            let results = join_all(futures).await;
            if let Some(failure) = results.into_iter().find_map(|r| match r {
                HandlerResult::Fail(v) => Some(v),
                _ => None,
            }) {
                ctx.error = Some(failure);
            }
            (HandlerResult::Return(Value::Null), ctx)
        })
    });
    Handler::new("parallel", f)
}

/// `sequence(h...)` -- runs each handler to its own terminal value in turn;
/// the first that resolves to `Continue` short-circuits the whole sequence
/// to that handler. If none does, the sequence's result is the last
/// handler's terminal value.
pub fn sequence(handlers: Vec<Handler>) -> Handler {
    let handlers = Arc::new(handlers);
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let handlers = Arc::clone(&handlers);
        Box::pin(async move {
            let mut ctx = ctx;
            let mut last = HandlerResult::Return(Value::Null);
            for h in handlers.iter() {
                let (result, next_ctx) = h.call(input.clone(), ctx).await;
                ctx = next_ctx;
                if matches!(result, HandlerResult::Continue(_)) {
                    return (result, ctx);
                }
                last = result;
            }
            (last, ctx)
        })
    });
    Handler::new("sequence", f)
}

/// Exponential-backoff policy for [`retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled after every subsequent failure.
    pub base_delay: Duration,
}

/// `retry(h, policy)` -- re-runs `h` with exponential backoff while it keeps
/// failing, re-raising the last error once `max_attempts` is exhausted.
/// Non-`Fail` results pass through unchanged on the first attempt.
pub fn retry(h: Handler, policy: RetryPolicy) -> Handler {
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let h = h.clone();
        let policy = policy;
        Box::pin(async move {
            let mut ctx = ctx;
            let mut delay = policy.base_delay;
            for attempt in 1..=policy.max_attempts.max(1) {
                let (result, next_ctx) = h.call(input.clone(), ctx).await;
                ctx = next_ctx;
                match result {
                    HandlerResult::Fail(value) => {
                        if attempt == policy.max_attempts.max(1) {
                            return (HandlerResult::Fail(value), ctx);
                        }
                        ctx.error = Some(value);
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    other => return (other, ctx),
                }
            }
            unreachable!("loop always returns before exhausting max_attempts")
        })
    });
    Handler::new("retry", f)
}

/// `timeout(h, duration)` -- races `h` against a deadline; on expiry,
/// resolves to `Fail({"error": "HandlerTimeout"})`.
pub fn timeout(h: Handler, duration: Duration) -> Handler {
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let h = h.clone();
        Box::pin(async move {
            match tokio::time::timeout(duration, h.call(input, ctx.clone())).await {
                Ok(output) => output,
                Err(_elapsed) => (HandlerResult::Fail(json!({"error": "HandlerTimeout"})), ctx),
            }
        })
    });
    Handler::new("timeout", f)
}

/// `map(tx, h)` -- applies `tx` to `h`'s terminal `Return` value; other
/// result kinds pass through untouched.
pub fn map<T>(tx: T, h: Handler) -> Handler
where
    T: Fn(Value) -> Value + Send + Sync + 'static,
{
    let tx = Arc::new(tx);
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let h = h.clone();
        let tx = Arc::clone(&tx);
        Box::pin(async move {
            let (result, ctx) = h.call(input, ctx).await;
            let result = match result {
                HandlerResult::Return(v) => HandlerResult::Return(tx(v)),
                other => other,
            };
            (result, ctx)
        })
    });
    Handler::new("map", f)
}

/// `filter(pred, h)` -- keeps `h`'s `Return` value only if `pred` accepts
/// it, otherwise replaces it with `null`. Other result kinds pass through.
pub fn filter<P>(pred: P, h: Handler) -> Handler
where
    P: Fn(&Value) -> bool + Send + Sync + 'static,
{
    let pred = Arc::new(pred);
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let h = h.clone();
        let pred = Arc::clone(&pred);
        Box::pin(async move {
            let (result, ctx) = h.call(input, ctx).await;
            let result = match result {
                HandlerResult::Return(v) if !pred(&v) => HandlerResult::Return(Value::Null),
                other => other,
            };
            (result, ctx)
        })
    });
    Handler::new("filter", f)
}

/// `catch(h, err_h)` -- runs `h`; on `Fail`, records the value as
/// `ctx.error` and continues with `err_h`.
pub fn catch(h: Handler, err_h: Handler) -> Handler {
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let h = h.clone();
        let err_h = err_h.clone();
        Box::pin(async move {
            let (result, mut ctx) = h.call(input, ctx).await;
            match result {
                HandlerResult::Fail(value) => {
                    ctx.error = Some(value);
                    (HandlerResult::Continue(err_h), ctx)
                }
                other => (other, ctx),
            }
        })
    });
    Handler::new("catch", f)
}

/// `fallback(h, secondary)` -- runs `h`; on `Fail`, records the caught value
/// as `ctx.fallback_reason` and continues with `secondary`. Distinct from
/// [`catch`]: `catch` records `ctx.error` for handler-local recovery,
/// `fallback` records `ctx.fallback_reason` for a resilience-layer secondary.
pub fn fallback(h: Handler, secondary: Handler) -> Handler {
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let h = h.clone();
        let secondary = secondary.clone();
        Box::pin(async move {
            let (result, mut ctx) = h.call(input, ctx).await;
            match result {
                HandlerResult::Fail(value) => {
                    ctx.fallback_reason = Some(value);
                    (HandlerResult::Continue(secondary), ctx)
                }
                other => (other, ctx),
            }
        })
    });
    Handler::new("fallback", f)
}

/// `finally(h, fin)` -- runs `h`, then always runs `fin` for its side
/// effects (its own result is discarded); `h`'s result and `fin`'s context
/// mutations both survive.
pub fn finally(h: Handler, fin: Handler) -> Handler {
    let f: HandlerFn = Arc::new(move |input, ctx| {
        let h = h.clone();
        let fin = fin.clone();
        Box::pin(async move {
            let (result, ctx) = h.call(input.clone(), ctx).await;
            let (_discarded, ctx) = fin.call(input, ctx).await;
            (result, ctx)
        })
    });
    Handler::new("finally", f)
}

/// Run `h` (and anything it `Continue`s to) down to a non-`Continue`
/// terminal result, used by combinators (`parallel`) that need a handler's
/// full outcome rather than its first link.
async fn run_to_terminal(h: Handler, input: EventInput, ctx: HandlerContext) -> HandlerResult {
    let mut current = h;
    let mut ctx = ctx;
    loop {
        let (result, next_ctx) = current.call(input.clone(), ctx).await;
        ctx = next_ctx;
        match result {
            HandlerResult::Continue(next) => current = next,
            terminal => return terminal,
        }
    }
}
