//! Deferreds and promises with chaining, progress notifications and the
//! `all`/`any` combinators.
//!
//! A [`Deferred`] is the producer side: whoever runs the asynchronous
//! operation settles it exactly once with [`resolve`](Deferred::resolve) or
//! [`reject`](Deferred::reject) and may report progress with
//! [`notify`](Deferred::notify) before that. A [`Promise`] is the read-only
//! consumer side. Promises can be chained with [`then`](Promise::then),
//! combined with [`Promise::all`]/[`Promise::any`] and awaited as futures.
//!
//! Events are delivered through a [`Scheduler`]. The crate ships
//! [`EventQueue`], a cooperative queue bound to one thread: settling from that
//! thread delivers events right away, settling from any other thread queues
//! them until the owner spins the queue.
//!
//! # Examples
//!
//! ```
//! use promise_out::{Deferred, EventQueue, Promise, State, Value};
//! let queue = EventQueue::new();
//! let scheduler = queue.scheduler();
//! let deferred = Deferred::new(&scheduler);
//! let doubled = deferred
//!     .promise()
//!     .then(|v| Value::new(v.get::<i32>().copied().unwrap_or_default() * 2));
//! let both = Promise::all(&scheduler, [deferred.promise(), doubled.clone()]);
//!
//! deferred.resolve(21);
//! assert_eq!(doubled.value().get::<i32>(), Some(&42));
//! assert_eq!(both.state(), State::Resolved);
//! ```
use std::time::Duration;

pub mod chain;
pub mod child;
mod combinator;
pub mod deferred;
pub mod promise;
pub mod scheduler;
mod signal;
pub mod sitter;
pub mod value;

pub use chain::{Callbacks, Outcome};
pub use child::ChildDeferred;
pub use deferred::{Deferred, State};
pub use promise::Promise;
pub use scheduler::{EventQueue, Schedule, Scheduler, Task};
pub use signal::ListenerId;
pub use sitter::PromiseSitter;
pub use value::Value;

/// Errors reported by this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Stored as the rejection reason of a deferred whose last handle was
    /// dropped while it was still pending.
    #[error("deferred {id} was destroyed while pending")]
    DeferredDestroyed { id: u64 },
    /// A [`Value`] did not hold the requested type.
    #[error("expected a value of type {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// [`EventQueue::wait_until`] ran out of time before its condition held.
    #[error("gave up waiting after {waited:?}")]
    Timeout { waited: Duration },
}
