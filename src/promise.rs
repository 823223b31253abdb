use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::deferred::Cell;
use crate::signal::{emit_to, ListenerId, Signal};
use crate::{Deferred, Scheduler, State, Value};

struct Inner {
    cell: Arc<Cell>,
    resolved: Signal,
    rejected: Signal,
    notified: Signal,
    forwarders: Mutex<Option<[ListenerId; 3]>>,
}

impl Inner {
    fn deliver(&self, state: State, value: &Value) {
        let listeners = match state {
            State::Resolved => self.resolved.take(),
            _ => self.rejected.take(),
        };
        self.resolved.clear();
        self.rejected.clear();
        self.notified.clear();
        emit_to(&listeners, value);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some([resolved, rejected, notified]) = self.forwarders.get_mut().take() {
            self.cell.resolved.disconnect(resolved);
            self.cell.rejected.disconnect(rejected);
            self.cell.notified.disconnect(notified);
        }
    }
}

/// Provides read-only access to the outcome of an asynchronous operation.
///
/// Clones share one set of listeners. A promise created for a cell that is
/// already settled still emits the settle event to its listeners, on the next
/// tick of the scheduler.
///
/// A promise is also a [`Future`] yielding `Ok(value)` or `Err(reason)`.
/// Awaiting wakes directly on settlement and needs no queue spinning.
///
/// # Examples
///
/// ```
/// use promise_out::{Deferred, EventQueue};
/// use futures::executor::block_on;
/// use std::thread;
/// let queue = EventQueue::new();
/// let deferred = Deferred::new(&queue.scheduler());
/// let promise = deferred.promise();
/// let task = thread::spawn(move || block_on(promise));
/// deferred.resolve("Hi");
/// let received = task.join().expect("The task thread has panicked.");
/// assert_eq!(received.unwrap().get::<&str>(), Some(&"Hi"));
/// ```
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

impl Promise {
    pub fn new(deferred: &Deferred) -> Self {
        Self::from_cell(deferred.cell().clone())
    }

    /// A promise that is already resolved with `value`.
    pub fn resolved(scheduler: &Scheduler, value: impl Into<Value>) -> Self {
        Deferred::resolved(scheduler, value).promise()
    }

    /// A promise that is already rejected with `reason`.
    pub fn rejected(scheduler: &Scheduler, reason: impl Into<Value>) -> Self {
        Deferred::rejected(scheduler, reason).promise()
    }

    pub(crate) fn from_cell(cell: Arc<Cell>) -> Self {
        let inner = Arc::new(Inner {
            cell: cell.clone(),
            resolved: Signal::new(),
            rejected: Signal::new(),
            notified: Signal::new(),
            forwarders: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        cell.with_state(|state, value| match state {
            State::Pending => {
                let ids = [
                    cell.resolved.connect(forward(weak.clone(), State::Resolved)),
                    cell.rejected.connect(forward(weak.clone(), State::Rejected)),
                    cell.notified.connect(move |progress| {
                        if let Some(inner) = weak.upgrade() {
                            inner.notified.emit(progress);
                        }
                    }),
                ];
                *inner.forwarders.lock() = Some(ids);
            }
            settled => {
                let value = value.clone();
                cell.scheduler().schedule(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.deliver(settled, &value);
                    }
                });
            }
        });
        Promise { inner }
    }

    pub(crate) fn cell(&self) -> &Arc<Cell> {
        &self.inner.cell
    }

    /// Identity of this promise and its clones.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Id of the backing deferred.
    pub fn id(&self) -> u64 {
        self.inner.cell.id()
    }

    pub fn state(&self) -> State {
        self.inner.cell.state()
    }

    /// The resolve value, the rejection reason, or a null value while
    /// pending.
    pub fn value(&self) -> Value {
        self.inner.cell.value()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == State::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    pub fn on_resolved<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.resolved.connect(f)
    }

    pub fn on_rejected<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.rejected.connect(f)
    }

    pub fn on_notified<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.notified.connect(f)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        let inner = &self.inner;
        inner.resolved.disconnect(id) || inner.rejected.disconnect(id) || inner.notified.disconnect(id)
    }

    /// Whether both promises are the same view (one is a clone of the other).
    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether both promises observe the same deferred.
    pub fn same_deferred(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.inner.cell, &other.inner.cell)
    }
}

fn forward(inner: Weak<Inner>, state: State) -> impl Fn(&Value) + Send + Sync + 'static {
    move |value| {
        if let Some(inner) = inner.upgrade() {
            inner.deliver(state, value);
        }
    }
}

impl From<&Deferred> for Promise {
    fn from(deferred: &Deferred) -> Self {
        Promise::new(deferred)
    }
}

impl Future for Promise {
    type Output = Result<Value, Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.cell.poll_settled(cx)
    }
}

impl Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("value", &self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Promise;
    use crate::{Deferred, EventQueue, State, Value};
    use futures::executor::block_on;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn record(promise: &Promise) -> Arc<Mutex<Vec<(&'static str, Value)>>> {
        let seen = Arc::new(Mutex::new(vec![]));
        let s = seen.clone();
        promise.on_resolved(move |v| s.lock().unwrap().push(("resolved", v.clone())));
        let s = seen.clone();
        promise.on_rejected(move |v| s.lock().unwrap().push(("rejected", v.clone())));
        let s = seen.clone();
        promise.on_notified(move |v| s.lock().unwrap().push(("notified", v.clone())));
        seen
    }

    #[test]
    fn create_resolved_promise() {
        let queue = EventQueue::new();
        let promise = Promise::resolved(&queue.scheduler(), String::from("String"));
        assert_eq!(promise.state(), State::Resolved);
    }

    #[test]
    fn create_rejected_promise() {
        let queue = EventQueue::new();
        let promise = Promise::rejected(&queue.scheduler(), String::from("String"));
        assert_eq!(promise.state(), State::Rejected);
    }

    #[test]
    fn mirrors_pending_deferred() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let promise = Promise::new(&deferred);
        let seen = record(&promise);

        deferred.notify(1);
        deferred.resolve(2);
        assert_eq!(promise.state(), State::Resolved);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "notified");
        assert_eq!(seen[1].0, "resolved");
        assert_eq!(seen[1].1.get::<i32>(), Some(&2));
    }

    #[test]
    fn settled_deferred_is_redelivered_next_tick() {
        let queue = EventQueue::new();
        let deferred = Deferred::rejected(&queue.scheduler(), "nope");
        let promise = deferred.promise();
        let seen = record(&promise);
        assert!(seen.lock().unwrap().is_empty());

        queue.run_pending();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "rejected");
        assert_eq!(seen[0].1.get::<&str>(), Some(&"nope"));
    }

    #[test]
    fn clones_share_listeners() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let promise = deferred.promise();
        let clone = promise.clone();
        let seen = record(&clone);
        drop(clone);
        deferred.resolve(1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(promise.ptr_eq(&promise.clone()));
        assert!(promise.same_deferred(&deferred.promise()));
        assert!(!promise.ptr_eq(&deferred.promise()));
    }

    #[test]
    fn dropped_promise_disconnects_from_deferred() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let promise = deferred.promise();
        assert_eq!(deferred.cell().notified.len(), 1);
        drop(promise);
        assert_eq!(deferred.cell().notified.len(), 0);
    }

    #[test]
    fn await_from_another_thread() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let promise = deferred.promise();
        let second = promise.clone();
        let task1 = thread::spawn(move || block_on(promise));
        let task2 = thread::spawn(move || block_on(second));
        let settle = thread::spawn(move || deferred.reject("💥"));
        assert!(settle.join().expect("The settle thread has panicked"));
        let first = task1.join().expect("The task1 thread has panicked");
        let second = task2.join().expect("The task2 thread has panicked");
        assert_eq!(first.unwrap_err().get::<&str>(), Some(&"💥"));
        assert_eq!(second.unwrap_err().get::<&str>(), Some(&"💥"));
    }
}
