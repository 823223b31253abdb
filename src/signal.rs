use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Value;

/// Handle returned when connecting a listener, used to disconnect it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) type Listener = Arc<dyn Fn(&Value) + Send + Sync + 'static>;

/// An ordered list of listeners for one kind of event.
///
/// Emission works on a snapshot so listeners may connect and disconnect
/// (on this or any other signal) while being called.
#[derive(Default)]
pub(crate) struct Signal {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners.lock().push((id, Arc::new(f)));
        id
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock();
            let position = listeners.iter().position(|(lid, _)| *lid == id);
            position.map(|i| listeners.remove(i))
        };
        // Dropped unlocked: a listener may own the last handle to a view
        // that disconnects from this signal.
        removed.is_some()
    }

    pub fn snapshot(&self) -> Vec<Listener> {
        self.listeners.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    /// Removes every listener, handing them back in connection order.
    pub fn take(&self) -> Vec<Listener> {
        std::mem::take(&mut *self.listeners.lock())
            .into_iter()
            .map(|(_, l)| l)
            .collect()
    }

    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.listeners.lock());
        drop(old);
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn emit(&self, value: &Value) {
        emit_to(&self.snapshot(), value);
    }
}

pub(crate) fn emit_to(listeners: &[Listener], value: &Value) {
    for listener in listeners {
        listener(value);
    }
}

impl Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("listeners", &self.len())
            .finish()
    }
}
