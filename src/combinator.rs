//! `all` and `any`: one promise for a whole collection of promises.
use std::sync::{Arc, Weak};

use crate::deferred::Cell;
use crate::{ChildDeferred, Promise, Scheduler, Value};

/// Settles the combined cell from inside one of its own lineage events.
fn settle_with(cell: &Weak<Cell>, resolve: bool) -> impl Fn(&Value) + Send + Sync + 'static {
    let cell = cell.clone();
    move |value| {
        if let Some(cell) = cell.upgrade() {
            if resolve {
                cell.resolve(value.clone());
            } else {
                cell.reject(value.clone());
            }
        }
    }
}

fn combine<I, F>(scheduler: &Scheduler, promises: I, wire: F) -> ChildDeferred
where
    I: IntoIterator<Item = Promise>,
    F: FnOnce(&ChildDeferred, &Weak<Cell>),
{
    let cells: Vec<Arc<Cell>> = promises.into_iter().map(|p| p.cell().clone()).collect();
    let combined = ChildDeferred::empty(scheduler);
    combined.deferred().set_log_invalid_actions(false);
    wire(&combined, &Arc::downgrade(combined.cell()));
    combined.hold_until_settled();
    combined.replace_parents(cells, true);
    combined
}

impl Promise {
    /// A promise resolved with the values of all `promises`, in the order
    /// given, once they all resolved. The first rejection rejects it with
    /// that single reason; later outcomes are ignored.
    ///
    /// An empty collection gives a promise resolved with an empty list.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_out::{Deferred, EventQueue, Promise, State};
    /// let queue = EventQueue::new();
    /// let scheduler = queue.scheduler();
    /// let a = Deferred::new(&scheduler);
    /// let b = Deferred::new(&scheduler);
    /// let all = Promise::all(&scheduler, [a.promise(), b.promise()]);
    /// b.resolve("b");
    /// assert_eq!(all.state(), State::Pending);
    /// a.resolve("a");
    /// let values = all.value();
    /// let values = values.as_list().unwrap();
    /// assert_eq!(values[0].get::<&str>(), Some(&"a"));
    /// assert_eq!(values[1].get::<&str>(), Some(&"b"));
    /// ```
    pub fn all<I>(scheduler: &Scheduler, promises: I) -> Promise
    where
        I: IntoIterator<Item = Promise>,
    {
        let promises: Vec<Promise> = promises.into_iter().collect();
        if promises.is_empty() {
            return Promise::resolved(scheduler, Value::list(vec![]));
        }
        combine(scheduler, promises, |combined, cell| {
            combined.on_parents_resolved(settle_with(cell, true));
            combined.on_parent_rejected(settle_with(cell, false));
        })
        .promise()
    }

    /// The dual of [`all`](Promise::all): resolves with the first value
    /// any of `promises` resolves with, rejects with all reasons (in the
    /// order given) once every one of them rejected.
    ///
    /// An empty collection gives a promise rejected with an empty list.
    pub fn any<I>(scheduler: &Scheduler, promises: I) -> Promise
    where
        I: IntoIterator<Item = Promise>,
    {
        let promises: Vec<Promise> = promises.into_iter().collect();
        if promises.is_empty() {
            return Promise::rejected(scheduler, Value::list(vec![]));
        }
        combine(scheduler, promises, |combined, cell| {
            combined.on_parent_resolved(settle_with(cell, true));
            combined.on_parents_rejected(settle_with(cell, false));
        })
        .promise()
    }
}
