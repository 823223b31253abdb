use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::Promise;

struct Entry {
    promise: Promise,
    // Keeps the auto-removal chain alive along with the promise.
    _removal: Promise,
}

type Entries = RwLock<HashMap<usize, Entry>>;

/// Keeps promises alive until they settle.
///
/// Useful for fire-and-forget chains: the final promise of a chain is added
/// to a sitter and dropped by the caller; the sitter releases it once it is
/// resolved or rejected. Clones share the same set.
///
/// # Examples
///
/// ```
/// use promise_out::{Deferred, EventQueue, PromiseSitter};
/// let queue = EventQueue::new();
/// let sitter = PromiseSitter::new();
/// let deferred = Deferred::new(&queue.scheduler());
/// sitter.add(&deferred.promise().then(|_| println!("done")));
/// assert_eq!(sitter.len(), 1);
/// deferred.resolve(());
/// assert!(sitter.is_empty());
/// ```
#[derive(Clone, Default)]
pub struct PromiseSitter {
    entries: Arc<Entries>,
}

impl PromiseSitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds `promise` until it settles. Settled promises and promises that
    /// are already held are ignored.
    pub fn add(&self, promise: &Promise) {
        if promise.state().is_settled() || self.contains(promise) {
            return;
        }
        let key = promise.key();
        let entries: Weak<Entries> = Arc::downgrade(&self.entries);
        // Registered outside the lock: on a promise that settled meanwhile
        // the callback runs right away.
        let removal = promise.always(move |_| {
            if let Some(entries) = entries.upgrade() {
                let removed = entries.write().remove(&key);
                drop(removed);
            }
        });
        self.entries.write().entry(key).or_insert(Entry {
            promise: promise.clone(),
            _removal: removal,
        });
        if promise.state().is_settled() {
            self.remove(promise);
        }
    }

    /// Releases `promise`. Returns whether it was held.
    pub fn remove(&self, promise: &Promise) -> bool {
        let removed = self.entries.write().remove(&promise.key());
        removed.is_some()
    }

    pub fn contains(&self, promise: &Promise) -> bool {
        self.entries.read().contains_key(&promise.key())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Debug for PromiseSitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_list()
            .entries(entries.values().map(|e| &e.promise))
            .finish()
    }
}
