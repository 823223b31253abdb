use std::cell::RefCell;
use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::ReentrantMutex;

use crate::child::Lineage;
use crate::signal::{emit_to, ListenerId, Signal};
use crate::{Error, Promise, Scheduler, Value};

/// Possible states of a [`Deferred`] or [`Promise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// The outcome has not been reported yet.
    Pending,
    /// The operation completed successfully.
    Resolved,
    /// The operation failed.
    Rejected,
}

impl State {
    pub fn is_settled(self) -> bool {
        self != State::Pending
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "pending",
            State::Resolved => "resolved",
            State::Rejected => "rejected",
        })
    }
}

#[derive(Debug)]
struct Slot {
    state: State,
    value: Value,
    wakers: Vec<Waker>,
}

/// The shared settlement cell behind [`Deferred`], [`ChildDeferred`] and
/// [`Promise`].
///
/// `slot` is re-entrant: listeners run while it is held (when they run inline)
/// and may call back into the same cell. Listener lists are taken out of the
/// cell before they are called, so a `RefCell` borrow is never held across
/// user code.
///
/// [`ChildDeferred`]: crate::ChildDeferred
pub(crate) struct Cell {
    id: u64,
    scheduler: Scheduler,
    slot: ReentrantMutex<RefCell<Slot>>,
    pub(crate) resolved: Signal,
    pub(crate) rejected: Signal,
    pub(crate) notified: Signal,
    /// Emissions of this cell waiting on the scheduler.
    queued: Arc<AtomicUsize>,
    log_invalid_actions: AtomicBool,
    lineage: Lineage,
}

impl Cell {
    pub(crate) fn new(scheduler: &Scheduler) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Cell {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            scheduler: scheduler.clone(),
            slot: ReentrantMutex::new(RefCell::new(Slot {
                state: State::Pending,
                value: Value::null(),
                wakers: vec![],
            })),
            resolved: Signal::new(),
            rejected: Signal::new(),
            notified: Signal::new(),
            queued: Arc::new(AtomicUsize::new(0)),
            log_invalid_actions: AtomicBool::new(true),
            lineage: Lineage::default(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    pub(crate) fn state(&self) -> State {
        self.slot.lock().borrow().state
    }

    pub(crate) fn value(&self) -> Value {
        self.slot.lock().borrow().value.clone()
    }

    /// Runs `f` on a snapshot of the state while holding the cell's lock, so
    /// that "check state, then subscribe" cannot race with a settlement.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(State, &Value) -> R) -> R {
        let guard = self.slot.lock();
        let (state, value) = {
            let slot = guard.borrow();
            (slot.state, slot.value.clone())
        };
        let result = f(state, &value);
        drop(guard);
        result
    }

    pub(crate) fn resolve(&self, value: Value) -> bool {
        self.settle(State::Resolved, value)
    }

    pub(crate) fn reject(&self, reason: Value) -> bool {
        self.settle(State::Rejected, reason)
    }

    fn settle(&self, state: State, value: Value) -> bool {
        let action = if state == State::Resolved {
            "resolve"
        } else {
            "reject"
        };
        let guard = self.slot.lock();
        let wakers = {
            let mut slot = guard.borrow_mut();
            if slot.state != State::Pending {
                let current = slot.state;
                drop(slot);
                self.log_invalid_action(action, current);
                return false;
            }
            slot.state = state;
            slot.value = value.clone();
            std::mem::take(&mut slot.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        // A settled cell never emits again.
        let listeners = match state {
            State::Resolved => self.resolved.take(),
            _ => self.rejected.take(),
        };
        self.resolved.clear();
        self.rejected.clear();
        self.notified.clear();
        self.dispatch(move || emit_to(&listeners, &value));
        drop(guard);
        true
    }

    pub(crate) fn notify(&self, progress: Value) -> bool {
        let guard = self.slot.lock();
        let state = guard.borrow().state;
        if state != State::Pending {
            self.log_invalid_action("notify", state);
            return false;
        }
        let listeners = self.notified.snapshot();
        self.dispatch(move || emit_to(&listeners, &progress));
        drop(guard);
        true
    }

    /// Emits inline on the scheduler's thread, unless earlier emissions of
    /// this cell are still queued. Called with `slot` held.
    fn dispatch<F>(&self, emit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.scheduler.is_current() && self.queued.load(Ordering::Acquire) == 0 {
            emit();
            return;
        }
        tracing::trace!(id = self.id, "marshaling event onto scheduler thread");
        let queued = self.queued.clone();
        queued.fetch_add(1, Ordering::AcqRel);
        self.scheduler.schedule(move || {
            queued.fetch_sub(1, Ordering::AcqRel);
            emit();
        });
    }

    pub(crate) fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<Result<Value, Value>> {
        let guard = self.slot.lock();
        let mut slot = guard.borrow_mut();
        match slot.state {
            State::Resolved => Poll::Ready(Ok(slot.value.clone())),
            State::Rejected => Poll::Ready(Err(slot.value.clone())),
            State::Pending => {
                if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    slot.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }

    pub(crate) fn set_log_invalid_actions(&self, enabled: bool) {
        self.log_invalid_actions.store(enabled, Ordering::Relaxed);
    }

    fn log_invalid_action(&self, action: &'static str, state: State) {
        if self.log_invalid_actions.load(Ordering::Relaxed) {
            tracing::debug!(id = self.id, action, %state, "cannot {action} deferred which is already {state}");
        }
    }

    /// The last settlement authority is gone.
    fn abandon(&self) {
        let guard = self.slot.lock();
        let pending = guard.borrow().state == State::Pending;
        if pending {
            tracing::debug!(id = self.id, "deferred destroyed while still pending");
            self.reject(Value::new(Error::DeferredDestroyed { id: self.id }));
        }
        drop(guard);
    }
}

impl Drop for Cell {
    fn drop(&mut self) {
        self.lineage.detach_all();
    }
}

impl Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

struct Authority {
    cell: Arc<Cell>,
}

impl Drop for Authority {
    /// If this is an unsettled deferred, reject it so nobody waits forever.
    fn drop(&mut self) {
        self.cell.abandon();
    }
}

/// Communicates the outcome of an asynchronous operation.
///
/// The usage pattern is: create a `Deferred`, hand out [`Promise`]s for it,
/// and have the asynchronous operation call [`resolve`](Deferred::resolve),
/// [`reject`](Deferred::reject) and [`notify`](Deferred::notify) on it.
///
/// Clones share the same cell. A `Deferred` is the *authority* to settle the
/// cell: when the last clone is dropped while the cell is still pending, the
/// cell is rejected with [`Error::DeferredDestroyed`]. Promises keep the cell
/// readable but do not count as authority.
///
/// Settlement from a thread other than the scheduler's is safe; the
/// resulting events are delivered on the scheduler's thread.
///
/// # Examples
///
/// ```
/// use promise_out::{Deferred, EventQueue, State};
/// let queue = EventQueue::new();
/// let deferred = Deferred::new(&queue.scheduler());
/// assert!(deferred.resolve("🍓"));
/// assert!(!deferred.reject("💥"));
/// assert_eq!(deferred.state(), State::Resolved);
/// assert_eq!(deferred.value().get::<&str>(), Some(&"🍓"));
/// ```
#[derive(Clone)]
pub struct Deferred {
    authority: Arc<Authority>,
}

impl Deferred {
    /// Creates a pending deferred whose events are delivered through
    /// `scheduler`.
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::from_cell(Cell::new(scheduler))
    }

    pub fn resolved(scheduler: &Scheduler, value: impl Into<Value>) -> Self {
        let deferred = Self::new(scheduler);
        deferred.resolve(value);
        deferred
    }

    pub fn rejected(scheduler: &Scheduler, reason: impl Into<Value>) -> Self {
        let deferred = Self::new(scheduler);
        deferred.reject(reason);
        deferred
    }

    pub(crate) fn from_cell(cell: Arc<Cell>) -> Self {
        Self {
            authority: Arc::new(Authority { cell }),
        }
    }

    pub(crate) fn cell(&self) -> &Arc<Cell> {
        &self.authority.cell
    }

    /// Process-unique id, used in diagnostics and in
    /// [`Error::DeferredDestroyed`].
    pub fn id(&self) -> u64 {
        self.cell().id()
    }

    pub fn state(&self) -> State {
        self.cell().state()
    }

    /// The resolve value, the rejection reason, or a null value while
    /// pending.
    pub fn value(&self) -> Value {
        self.cell().value()
    }

    /// Communicates success. Returns `false` if the deferred was not pending.
    pub fn resolve(&self, value: impl Into<Value>) -> bool {
        self.cell().resolve(value.into())
    }

    /// Communicates failure. Returns `false` if the deferred was not pending.
    pub fn reject(&self, reason: impl Into<Value>) -> bool {
        self.cell().reject(reason.into())
    }

    /// Communicates progress. Returns `false` if the deferred was not pending.
    pub fn notify(&self, progress: impl Into<Value>) -> bool {
        self.cell().notify(progress.into())
    }

    /// Connects a listener to the resolve event. Listeners connected after
    /// settlement never fire; use a [`Promise`] to observe settled cells.
    pub fn on_resolved<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.cell().resolved.connect(f)
    }

    pub fn on_rejected<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.cell().rejected.connect(f)
    }

    pub fn on_notified<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.cell().notified.connect(f)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        let cell = self.cell();
        cell.resolved.disconnect(id) || cell.rejected.disconnect(id) || cell.notified.disconnect(id)
    }

    /// Whether calling resolve/reject/notify on a settled deferred logs a
    /// debug message. On by default.
    pub fn set_log_invalid_actions(&self, enabled: bool) {
        self.cell().set_log_invalid_actions(enabled);
    }

    /// Creates a read-only view of this deferred.
    pub fn promise(&self) -> Promise {
        Promise::from_cell(self.cell().clone())
    }
}

impl Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Deferred, State};
    use crate::{Error, EventQueue, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    #[derive(Default, Clone)]
    struct Spies {
        resolved: Arc<Mutex<Vec<Value>>>,
        rejected: Arc<Mutex<Vec<Value>>>,
        notified: Arc<Mutex<Vec<Value>>>,
    }

    impl Spies {
        fn attach(deferred: &Deferred) -> Self {
            let spies = Spies::default();
            let s = spies.clone();
            deferred.on_resolved(move |v| s.resolved.lock().unwrap().push(v.clone()));
            let s = spies.clone();
            deferred.on_rejected(move |v| s.rejected.lock().unwrap().push(v.clone()));
            let s = spies.clone();
            deferred.on_notified(move |v| s.notified.lock().unwrap().push(v.clone()));
            spies
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.resolved.lock().unwrap().len(),
                self.rejected.lock().unwrap().len(),
                self.notified.lock().unwrap().len(),
            )
        }
    }

    #[test]
    fn new_deferred_is_pending() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        assert_eq!(deferred.state(), State::Pending);
        assert!(deferred.value().is_null());
    }

    #[test]
    fn resolve_once() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let spies = Spies::attach(&deferred);

        assert!(deferred.resolve("myValue"));
        assert_eq!(deferred.state(), State::Resolved);
        assert_eq!(spies.counts(), (1, 0, 0));
        assert_eq!(spies.resolved.lock().unwrap()[0].get::<&str>(), Some(&"myValue"));

        assert!(!deferred.notify("progress"));
        assert!(!deferred.reject("reason"));
        assert!(!deferred.resolve("other"));
        assert_eq!(deferred.value().get::<&str>(), Some(&"myValue"));
        assert_eq!(deferred.state(), State::Resolved);
        assert_eq!(spies.counts(), (1, 0, 0));
    }

    #[test]
    fn reject_once() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let spies = Spies::attach(&deferred);

        assert!(deferred.reject("myValue"));
        assert_eq!(deferred.state(), State::Rejected);
        assert_eq!(spies.counts(), (0, 1, 0));

        assert!(!deferred.notify("progress"));
        assert!(!deferred.resolve("value"));
        assert_eq!(deferred.value().get::<&str>(), Some(&"myValue"));
        assert_eq!(spies.counts(), (0, 1, 0));
    }

    #[test]
    fn notify_delivers_every_progress_in_order() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let spies = Spies::attach(&deferred);

        assert!(deferred.notify("myValue"));
        assert!(deferred.notify(3));
        assert_eq!(deferred.state(), State::Pending);
        assert!(deferred.value().is_null());
        let notified = spies.notified.lock().unwrap();
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[0].get::<&str>(), Some(&"myValue"));
        assert_eq!(notified[1].get::<i32>(), Some(&3));
    }

    #[test]
    fn dropping_last_handle_rejects_with_marker() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let id = deferred.id();
        let spies = Spies::attach(&deferred);
        let promise = deferred.promise();
        let clone = deferred.clone();

        drop(deferred);
        assert_eq!(promise.state(), State::Pending);
        drop(clone);

        assert_eq!(promise.state(), State::Rejected);
        assert_eq!(spies.counts(), (0, 1, 0));
        assert_eq!(
            promise.value().get::<Error>(),
            Some(&Error::DeferredDestroyed { id })
        );
    }

    #[test]
    fn dropping_settled_deferred_changes_nothing() {
        let queue = EventQueue::new();
        let deferred = Deferred::resolved(&queue.scheduler(), 1);
        let promise = deferred.promise();
        drop(deferred);
        assert_eq!(promise.state(), State::Resolved);
        assert_eq!(promise.value().get::<i32>(), Some(&1));
    }

    #[test]
    fn listener_may_reenter_the_cell() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let inner = deferred.clone();
        let second_attempt = Arc::new(Mutex::new(None));
        let attempt = second_attempt.clone();
        deferred.on_resolved(move |_| {
            *attempt.lock().unwrap() = Some(inner.reject("late"));
        });
        assert!(deferred.resolve(1));
        assert_eq!(*second_attempt.lock().unwrap(), Some(false));
        assert_eq!(deferred.state(), State::Resolved);
    }

    #[test]
    fn disconnected_listener_is_not_called() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = deferred.on_notified(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        deferred.notify(1);
        assert!(deferred.disconnect(id));
        deferred.notify(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnecting_listener_that_owns_a_view() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let view = deferred.promise();
        assert_eq!(deferred.cell().notified.len(), 1);
        let id = deferred.on_notified(move |_| {
            view.state();
        });

        assert!(deferred.disconnect(id));
        assert_eq!(deferred.cell().notified.len(), 0);
        assert!(deferred.resolve(1));
    }

    #[test]
    fn exactly_one_concurrent_settlement_wins() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        deferred.set_log_invalid_actions(false);
        let spies = Spies::attach(&deferred);
        let barrier = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let deferred = deferred.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let notified = deferred.notify(i);
                    let settled = if i % 2 == 0 {
                        deferred.resolve(i)
                    } else {
                        deferred.reject(i)
                    };
                    (notified, settled)
                })
            })
            .collect();
        let results: Vec<(bool, bool)> = workers
            .into_iter()
            .map(|w| w.join().expect("The worker thread has panicked"))
            .collect();
        assert_eq!(results.iter().filter(|(_, settled)| *settled).count(), 1);

        // Events raised on worker threads are delivered on the queue.
        assert_eq!(spies.counts(), (0, 0, 0));
        queue.run_pending();
        let (resolved, rejected, notified) = spies.counts();
        assert_eq!(resolved + rejected, 1);
        assert_eq!(notified, results.iter().filter(|(n, _)| *n).count());

        let winner = deferred.value();
        let winner = *winner.get::<i32>().unwrap();
        match deferred.state() {
            State::Resolved => assert_eq!(winner % 2, 0),
            State::Rejected => assert_eq!(winner % 2, 1),
            State::Pending => panic!("deferred must be settled"),
        }
    }

    #[test]
    fn queued_progress_is_delivered_before_later_settlement() {
        let queue = EventQueue::new();
        let deferred = Deferred::new(&queue.scheduler());
        let order = Arc::new(Mutex::new(vec![]));
        let o = order.clone();
        deferred.on_notified(move |_| o.lock().unwrap().push("notified"));
        let o = order.clone();
        deferred.on_resolved(move |_| o.lock().unwrap().push("resolved"));

        let worker = deferred.clone();
        let notified = thread::spawn(move || worker.notify(1))
            .join()
            .expect("The worker thread has panicked");
        assert!(notified);
        assert!(deferred.resolve(2));
        assert!(order.lock().unwrap().is_empty());

        queue.run_pending();
        assert_eq!(*order.lock().unwrap(), vec!["notified", "resolved"]);

        // Nothing left queued: later events are inline again.
        let inline = Deferred::new(&queue.scheduler());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        inline.on_resolved(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        inline.resolve(());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
