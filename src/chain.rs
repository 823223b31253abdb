//! Chaining: deriving a new promise from the outcome of another one.
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::deferred::Cell;
use crate::{ChildDeferred, Promise, State, Value};

/// What a chaining callback wants to happen to the derived promise.
///
/// Callbacks return anything convertible into an `Outcome`: `()` passes the
/// event through, a [`Value`] replaces it and a [`Promise`] chains onto it.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Forward the event unchanged.
    Pass,
    /// Resolve (or, for progress callbacks, notify) with this value. Returned
    /// from a rejection callback it means the failure was handled.
    Value(Value),
    /// Follow another promise.
    Chain(Promise),
}

impl From<()> for Outcome {
    fn from(_: ()) -> Self {
        Outcome::Pass
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl From<Promise> for Outcome {
    fn from(promise: Promise) -> Self {
        Outcome::Chain(promise)
    }
}

type SettleFn = Box<dyn FnOnce(&Value) -> Outcome + Send + 'static>;
type NotifyFn = Arc<dyn Fn(&Value) -> Outcome + Send + Sync + 'static>;

enum Source {
    Pending(ChildDeferred),
    // The callback runs after the source's lock is released.
    Settled(Value, Option<SettleFn>),
}

/// The callbacks for [`Promise::then_with`]. A missing callback passes its
/// event through to the derived promise.
#[derive(Default)]
pub struct Callbacks {
    resolved: Option<SettleFn>,
    rejected: Option<SettleFn>,
    notified: Option<NotifyFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved<F, R>(mut self, f: F) -> Self
    where
        F: FnOnce(&Value) -> R + Send + 'static,
        R: Into<Outcome>,
    {
        self.resolved = Some(Box::new(move |value| f(value).into()));
        self
    }

    pub fn rejected<F, R>(mut self, f: F) -> Self
    where
        F: FnOnce(&Value) -> R + Send + 'static,
        R: Into<Outcome>,
    {
        self.rejected = Some(Box::new(move |value| f(value).into()));
        self
    }

    /// Unlike the settle callbacks this one may run any number of times.
    pub fn notified<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        self.notified = Some(Arc::new(move |value| f(value).into()));
        self
    }
}

impl Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("resolved", &self.resolved.is_some())
            .field("rejected", &self.rejected.is_some())
            .field("notified", &self.notified.is_some())
            .finish()
    }
}

impl Promise {
    /// Derives a promise from this one's outcome.
    ///
    /// If this promise is already settled, the matching callback runs right
    /// away and its return value decides the result:
    /// - `()` or no callback: a promise for the same deferred,
    /// - a [`Value`]: a new promise resolved with it,
    /// - a [`Promise`]: that promise.
    ///
    /// Otherwise a new child deferred is created that keeps this one alive
    /// and is driven by the callbacks when events arrive. A callback
    /// returning a pending promise makes the derived promise follow it.
    ///
    /// Progress is first taken from this promise (through the `notified`
    /// callback). A `notified` callback returning a pending promise hands
    /// progress over to it: its resolution and its notifications become
    /// notifications of the derived promise, its rejection is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_out::{Callbacks, Deferred, EventQueue, Value};
    /// let queue = EventQueue::new();
    /// let deferred = Deferred::new(&queue.scheduler());
    /// let derived = deferred.promise().then_with(
    ///     Callbacks::new()
    ///         .resolved(|v| Value::new(v.get::<i32>().copied().unwrap_or_default() * 2))
    ///         .rejected(|_| Value::new(0)),
    /// );
    /// deferred.resolve(21);
    /// assert_eq!(derived.value().get::<i32>(), Some(&42));
    /// ```
    pub fn then_with(&self, callbacks: Callbacks) -> Promise {
        let source = self.cell().clone();
        let Callbacks {
            resolved,
            rejected,
            notified,
        } = callbacks;
        let source_state = source.with_state(|state, value| {
            if state == State::Pending {
                let child = ChildDeferred::with_parent(&source);
                let weak = Arc::downgrade(&source);
                source
                    .resolved
                    .connect(settle_wrapper(child.clone(), State::Resolved, resolved));
                source
                    .rejected
                    .connect(settle_wrapper(child.clone(), State::Rejected, rejected));
                source
                    .notified
                    .connect(notify_wrapper(child.clone(), weak, notified));
                Source::Pending(child)
            } else {
                let callback = match state {
                    State::Resolved => resolved,
                    _ => rejected,
                };
                Source::Settled(value.clone(), callback)
            }
        });

        match source_state {
            Source::Pending(child) => child.promise(),
            Source::Settled(value, callback) => match callback.map(|f| f(&value)) {
                None | Some(Outcome::Pass) => Promise::from_cell(source),
                Some(Outcome::Value(value)) => Promise::resolved(source.scheduler(), value),
                Some(Outcome::Chain(nested)) => nested,
            },
        }
    }

    /// Shorthand for [`then_with`](Promise::then_with) with only a resolve
    /// callback.
    pub fn then<F, R>(&self, f: F) -> Promise
    where
        F: FnOnce(&Value) -> R + Send + 'static,
        R: Into<Outcome>,
    {
        self.then_with(Callbacks::new().resolved(f))
    }

    /// Only a rejection callback. Returning a [`Value`] turns the failure into
    /// a resolution.
    pub fn fail<F, R>(&self, f: F) -> Promise
    where
        F: FnOnce(&Value) -> R + Send + 'static,
        R: Into<Outcome>,
    {
        self.then_with(Callbacks::new().rejected(f))
    }

    pub fn progress<F, R>(&self, f: F) -> Promise
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: Into<Outcome>,
    {
        self.then_with(Callbacks::new().notified(f))
    }

    /// Calls `f` on settlement, whichever way it goes.
    pub fn always<F, R>(&self, f: F) -> Promise
    where
        F: FnOnce(&Value) -> R + Send + 'static,
        R: Into<Outcome>,
    {
        let shared = Arc::new(Mutex::new(Some(f)));
        let other = shared.clone();
        let call = |slot: Arc<Mutex<Option<F>>>| {
            move |value: &Value| {
                let f = slot.lock().take();
                f.map_or(Outcome::Pass, |f| f(value).into())
            }
        };
        self.then_with(Callbacks::new().resolved(call(shared)).rejected(call(other)))
    }
}

fn settle_wrapper(
    child: ChildDeferred,
    state: State,
    callback: Option<SettleFn>,
) -> impl Fn(&Value) + Send + Sync + 'static {
    let callback = Mutex::new(callback);
    move |value| {
        let f = callback.lock().take();
        match f.map_or(Outcome::Pass, |f| f(value)) {
            Outcome::Pass if state == State::Resolved => {
                child.resolve(value.clone());
            }
            Outcome::Pass => {
                child.reject(value.clone());
            }
            Outcome::Value(value) => {
                child.resolve(value);
            }
            Outcome::Chain(nested) => follow(&child, nested.cell()),
        }
    }
}

/// Makes `child` settle like `nested`.
fn follow(child: &ChildDeferred, nested: &Arc<Cell>) {
    let settled = nested.with_state(|state, value| {
        if state != State::Pending {
            return Some((state, value.clone()));
        }
        tracing::trace!(id = child.id(), nested = nested.id(), "following nested promise");
        child.replace_parents(vec![nested.clone()], false);
        let c = child.clone();
        nested.resolved.connect(move |v| {
            c.resolve(v.clone());
        });
        let c = child.clone();
        nested.rejected.connect(move |v| {
            c.reject(v.clone());
        });
        let c = child.clone();
        nested.notified.connect(move |v| {
            c.notify(v.clone());
        });
        None
    });
    match settled {
        Some((State::Resolved, value)) => {
            child.resolve(value);
        }
        Some((_, value)) => {
            child.reject(value);
        }
        None => {}
    }
}

fn notify_wrapper(
    child: ChildDeferred,
    source: Weak<Cell>,
    callback: Option<NotifyFn>,
) -> impl Fn(&Value) + Send + Sync + 'static {
    move |progress| {
        match callback.as_ref().map_or(Outcome::Pass, |f| f(progress)) {
            Outcome::Pass => {
                child.notify(progress.clone());
            }
            Outcome::Value(value) => {
                child.notify(value);
            }
            Outcome::Chain(nested) => notify_from(&child, &source, nested.cell()),
        }
    }
}

/// Takes progress from `nested` from now on. Its rejection is dropped.
fn notify_from(child: &ChildDeferred, source: &Weak<Cell>, nested: &Arc<Cell>) {
    let resolved = nested.with_state(|state, value| match state {
        State::Pending => {
            tracing::trace!(id = child.id(), nested = nested.id(), "taking progress from nested promise");
            let parents = source.upgrade().into_iter().chain([nested.clone()]).collect();
            child.replace_parents(parents, false);
            let c = child.clone();
            nested.resolved.connect(move |v| {
                c.notify(v.clone());
            });
            let c = child.clone();
            nested.notified.connect(move |v| {
                c.notify(v.clone());
            });
            None
        }
        State::Resolved => Some(value.clone()),
        State::Rejected => None,
    });
    if let Some(value) = resolved {
        child.notify(value);
    }
}
