//! The "next tick" collaborator.
//!
//! Cells never call back into user code from a foreign thread and never
//! deliver events for already-settled inputs inline: both go through a
//! [`Schedule`] implementation. [`EventQueue`] is the cooperative FIFO queue
//! shipped with the crate; anything else (a GUI loop, an executor) can be
//! plugged in by implementing the trait.
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::Error;

/// A unit of work run on the next turn of a queue.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Schedule: Send + Sync {
    /// Runs `task` on a later turn, never inline.
    fn schedule(&self, task: Task);

    /// Whether the calling thread is the one that runs the scheduled tasks.
    /// Events raised on any other thread are marshaled through [`schedule`].
    ///
    /// [`schedule`]: Schedule::schedule
    fn is_current(&self) -> bool;
}

/// Shared handle onto a [`Schedule`] implementation.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<dyn Schedule>,
}

impl Scheduler {
    pub fn new<S: Schedule + 'static>(schedule: S) -> Self {
        Self {
            inner: Arc::new(schedule),
        }
    }

    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.schedule(Box::new(task));
    }

    pub fn is_current(&self) -> bool {
        self.inner.is_current()
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("is_current", &self.is_current())
            .finish()
    }
}

struct QueueInner {
    owner: ThreadId,
    tasks: Mutex<VecDeque<Task>>,
    ready: Condvar,
}

/// A single-threaded cooperative task queue.
///
/// Tasks may be queued from any thread; they only run when the owning thread
/// spins the queue with [`run_pending`](EventQueue::run_pending),
/// [`run_once`](EventQueue::run_once) or
/// [`wait_until`](EventQueue::wait_until).
///
/// # Examples
///
/// ```
/// use promise_out::{Deferred, EventQueue};
/// let queue = EventQueue::new();
/// let deferred = Deferred::new(&queue.scheduler());
/// let promise = deferred.promise();
/// let worker = std::thread::spawn(move || deferred.resolve(42));
/// worker.join().unwrap();
/// queue.run_pending();
/// assert_eq!(promise.value().get::<i32>(), Some(&42));
/// ```
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl EventQueue {
    /// Creates a queue owned by the calling thread.
    pub fn new() -> Self {
        Self::with_owner(thread::current().id())
    }

    pub fn with_owner(owner: ThreadId) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                owner,
                tasks: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.lock().is_empty()
    }

    /// Runs the tasks queued before this call. Tasks they queue in turn are
    /// left for the next turn. Returns the number of tasks run.
    pub fn run_once(&self) -> usize {
        let turn: Vec<Task> = self.inner.tasks.lock().drain(..).collect();
        let count = turn.len();
        for task in turn {
            task();
        }
        count
    }

    /// Runs tasks until the queue is empty, including tasks queued while
    /// running. Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            // Pop under the lock, run outside of it.
            let next = self.inner.tasks.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Spins the queue until `done` returns true, sleeping on the queue while
    /// it is empty. Gives up after `timeout`.
    pub fn wait_until<F>(&self, mut done: F, timeout: Duration) -> Result<(), Error>
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        loop {
            self.run_pending();
            if done() {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(Error::Timeout { waited });
            }
            let mut tasks = self.inner.tasks.lock();
            if tasks.is_empty() {
                let slice = (timeout - waited).min(Duration::from_millis(10));
                self.inner.ready.wait_for(&mut tasks, slice);
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule for EventQueue {
    fn schedule(&self, task: Task) {
        self.inner.tasks.lock().push_back(task);
        self.inner.ready.notify_all();
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.inner.owner
    }
}

impl Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("owner", &self.inner.owner)
            .field("queued", &self.len())
            .finish()
    }
}
