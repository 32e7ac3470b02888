#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **happen-resilience** -- resilience combinators that wrap fallible async
//! work: circuit breaker, bulkhead, timeout, fallback, and a per-service
//! supervisor. Deliberately decoupled from `happen-continuum`'s `Handler`
//! type -- each combinator here operates on any `FnOnce() -> Future`, the
//! same shape `toka-kernel`'s resource guards wrap plain async closures.

mod bulkhead;
mod circuit_breaker;
mod fallback;
mod supervisor;
mod timeout;

pub use bulkhead::Bulkhead;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use fallback::with_fallback;
pub use supervisor::{ServiceStatus, Supervisor, SupervisorConfig};
pub use timeout::{with_timeout, TimeoutError};
