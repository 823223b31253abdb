//! Deferreds that hold on to other (parent) deferreds.
//!
//! Chaining and the combinators are really deferred chains: the cell behind
//! a derived promise keeps strong references to the cells it was derived
//! from, so an upstream operation stays observable for as long as anything
//! downstream of it is. With result tracking enabled, the child also mirrors
//! the settlement of every parent into per-parent and aggregate events.
use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::deferred::Cell;
use crate::signal::{ListenerId, Signal};
use crate::{Deferred, Error, Promise, Scheduler, State, Value};

struct Parent {
    cell: Arc<Cell>,
    observed: bool,
    listeners: Option<(ListenerId, ListenerId)>,
}

impl Parent {
    fn new(cell: Arc<Cell>) -> Self {
        Self {
            cell,
            observed: false,
            listeners: None,
        }
    }

    fn detach(&mut self) {
        if let Some((resolved, rejected)) = self.listeners.take() {
            self.cell.resolved.disconnect(resolved);
            self.cell.rejected.disconnect(rejected);
        }
    }
}

#[derive(Default)]
struct Links {
    parents: Vec<Parent>,
    track_results: bool,
    // Bumped on every parent swap; observations of an older set are stale.
    generation: u64,
    resolved: usize,
    rejected: usize,
}

/// Parent bookkeeping of a cell. Empty for plain deferreds.
///
/// `links` is only ever locked on its own (never while acquiring a cell
/// lock), so a cell may be a parent in any number of tracking relationships.
#[derive(Default)]
pub(crate) struct Lineage {
    links: Mutex<Links>,
    keeper: Mutex<Option<Deferred>>,
    parent_resolved: Signal,
    parent_rejected: Signal,
    parents_resolved: Signal,
    parents_rejected: Signal,
}

impl Lineage {
    pub(crate) fn detach_all(&mut self) {
        for parent in self.links.get_mut().parents.iter_mut() {
            parent.detach();
        }
    }

    fn parent_cells(&self) -> Vec<Arc<Cell>> {
        self.links
            .lock()
            .parents
            .iter()
            .map(|p| p.cell.clone())
            .collect()
    }
}

/// Records the settlement of parent `index` in the child behind `child`.
fn observe(child: &Weak<Cell>, generation: u64, index: usize, state: State, value: &Value) {
    let Some(cell) = child.upgrade() else {
        return;
    };
    let lineage = cell.lineage();
    let complete = {
        let mut links = lineage.links.lock();
        if links.generation != generation || !links.track_results {
            return;
        }
        let total = links.parents.len();
        let Some(parent) = links.parents.get_mut(index) else {
            return;
        };
        if parent.observed {
            return;
        }
        parent.observed = true;
        parent.listeners = None;
        let count = if state == State::Resolved {
            links.resolved += 1;
            links.resolved
        } else {
            links.rejected += 1;
            links.rejected
        };
        (count == total).then(|| {
            links
                .parents
                .iter()
                .map(|p| p.cell.clone())
                .collect::<Vec<_>>()
        })
    };

    if state == State::Rejected {
        if let Some(Error::DeferredDestroyed { id }) = value.get::<Error>() {
            tracing::warn!(
                parent = *id,
                child = cell.id(),
                "parent deferred destroyed while child is still holding a reference"
            );
        }
    }

    let (single, aggregate) = match state {
        State::Resolved => (&lineage.parent_resolved, &lineage.parents_resolved),
        _ => (&lineage.parent_rejected, &lineage.parents_rejected),
    };
    single.emit(value);
    if let Some(parents) = complete {
        // Parent order, not completion order.
        let values = parents.iter().map(|p| p.value()).collect();
        aggregate.emit(&Value::list(values));
    }
}

/// A [`Deferred`] holding strong references to one or more parent cells.
///
/// With `track_results` enabled, every parent's settlement is observed
/// exactly once: each observation raises a per-parent event carrying that
/// parent's value, and when all parents resolved (or all rejected) an
/// aggregate event fires once with the values of all parents, in parent
/// order. Parents that are already settled when attached are observed on the
/// next tick of the scheduler.
///
/// Dropping the last handle detaches the child's listeners from its parents
/// and, as for every [`Deferred`], rejects the child if it is still pending.
///
/// # Examples
///
/// ```
/// use promise_out::{ChildDeferred, Deferred, EventQueue, Value};
/// use std::sync::{Arc, Mutex};
/// let queue = EventQueue::new();
/// let scheduler = queue.scheduler();
/// let a = Deferred::new(&scheduler);
/// let b = Deferred::new(&scheduler);
/// let child = ChildDeferred::new(&scheduler, [a.promise(), b.promise()], true);
/// let seen = Arc::new(Mutex::new(None));
/// let s = seen.clone();
/// child.on_parents_resolved(move |values| *s.lock().unwrap() = Some(values.clone()));
/// b.resolve(2);
/// a.resolve(1);
/// let values = seen.lock().unwrap().clone().unwrap();
/// let values = values.as_list().unwrap();
/// assert_eq!(values[0].get::<i32>(), Some(&1));
/// assert_eq!(values[1].get::<i32>(), Some(&2));
/// ```
#[derive(Clone)]
pub struct ChildDeferred {
    deferred: Deferred,
}

impl ChildDeferred {
    pub fn new<I>(scheduler: &Scheduler, parents: I, track_results: bool) -> Self
    where
        I: IntoIterator<Item = Promise>,
    {
        let child = Self::empty(scheduler);
        child.set_parents(parents, track_results);
        child
    }

    pub(crate) fn empty(scheduler: &Scheduler) -> Self {
        Self {
            deferred: Deferred::new(scheduler),
        }
    }

    pub(crate) fn with_parent(parent: &Arc<Cell>) -> Self {
        let child = Self::empty(parent.scheduler());
        child.replace_parents(vec![parent.clone()], false);
        child
    }

    pub fn deferred(&self) -> &Deferred {
        &self.deferred
    }

    pub(crate) fn cell(&self) -> &Arc<Cell> {
        self.deferred.cell()
    }

    fn lineage(&self) -> &Lineage {
        self.cell().lineage()
    }

    /// Replaces the parents. Listeners on the old parents are detached and the
    /// counters restart from zero for the new set; they only move again with
    /// `track_results`.
    pub fn set_parents<I>(&self, parents: I, track_results: bool)
    where
        I: IntoIterator<Item = Promise>,
    {
        let cells = parents.into_iter().map(|p| p.cell().clone()).collect();
        self.replace_parents(cells, track_results);
    }

    pub(crate) fn replace_parents(&self, cells: Vec<Arc<Cell>>, track_results: bool) {
        let count = cells.len();
        let (old, generation) = {
            let mut links = self.lineage().links.lock();
            links.generation += 1;
            links.track_results = track_results;
            links.resolved = 0;
            links.rejected = 0;
            let new = cells.into_iter().map(Parent::new).collect();
            (std::mem::replace(&mut links.parents, new), links.generation)
        };
        for mut parent in old {
            parent.detach();
        }
        tracing::trace!(id = self.id(), parents = count, track_results, "parents replaced");
        if track_results {
            self.attach(generation);
        }
    }

    fn attach(&self, generation: u64) {
        let lineage = self.lineage();
        for (index, parent) in lineage.parent_cells().iter().enumerate() {
            let child = Arc::downgrade(self.cell());
            let listeners = parent.with_state(|state, value| {
                if state == State::Pending {
                    let on_rejected = child.clone();
                    let resolved = parent.resolved.connect(move |v| {
                        observe(&child, generation, index, State::Resolved, v)
                    });
                    let rejected = parent.rejected.connect(move |v| {
                        observe(&on_rejected, generation, index, State::Rejected, v)
                    });
                    Some((resolved, rejected))
                } else {
                    let value = value.clone();
                    self.cell()
                        .scheduler()
                        .schedule(move || observe(&child, generation, index, state, &value));
                    None
                }
            });
            let Some((resolved, rejected)) = listeners else {
                continue;
            };
            let stored = {
                let mut links = lineage.links.lock();
                let current = links.generation == generation;
                match links.parents.get_mut(index) {
                    Some(slot) if current => {
                        slot.listeners = Some((resolved, rejected));
                        true
                    }
                    _ => false,
                }
            };
            if !stored {
                parent.resolved.disconnect(resolved);
                parent.rejected.disconnect(rejected);
            }
        }
    }

    /// Snapshot of the current parents.
    pub fn parents(&self) -> Vec<Promise> {
        self.lineage()
            .parent_cells()
            .into_iter()
            .map(Promise::from_cell)
            .collect()
    }

    pub fn parent_count(&self) -> usize {
        self.lineage().links.lock().parents.len()
    }

    pub fn track_results(&self) -> bool {
        self.lineage().links.lock().track_results
    }

    /// Number of parents observed resolved since tracking (re)started.
    pub fn resolved_count(&self) -> usize {
        self.lineage().links.lock().resolved
    }

    pub fn rejected_count(&self) -> usize {
        self.lineage().links.lock().rejected
    }

    /// Fires once per resolved parent with that parent's value.
    pub fn on_parent_resolved<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.lineage().parent_resolved.connect(f)
    }

    pub fn on_parent_rejected<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.lineage().parent_rejected.connect(f)
    }

    /// Fires once, when every parent resolved, with a list of their values.
    pub fn on_parents_resolved<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.lineage().parents_resolved.connect(f)
    }

    pub fn on_parents_rejected<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.lineage().parents_rejected.connect(f)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        let lineage = self.lineage();
        self.deferred.disconnect(id)
            || lineage.parent_resolved.disconnect(id)
            || lineage.parent_rejected.disconnect(id)
            || lineage.parents_resolved.disconnect(id)
            || lineage.parents_rejected.disconnect(id)
    }

    /// Keeps this child from being destroyed until it settles, for children
    /// that are driven by their own parent events rather than by a caller.
    pub(crate) fn hold_until_settled(&self) {
        *self.lineage().keeper.lock() = Some(self.deferred.clone());
        let cell = Arc::downgrade(self.cell());
        let release = move |_: &Value| {
            if let Some(cell) = cell.upgrade() {
                let held = cell.lineage().keeper.lock().take();
                drop(held);
            }
        };
        self.cell().resolved.connect(release.clone());
        self.cell().rejected.connect(release);
    }
}

impl Deref for ChildDeferred {
    type Target = Deferred;

    fn deref(&self) -> &Deferred {
        &self.deferred
    }
}

impl Debug for ChildDeferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let links = self.lineage().links.lock();
        f.debug_struct("ChildDeferred")
            .field("id", &self.id())
            .field("parents", &links.parents.len())
            .field("track_results", &links.track_results)
            .field("resolved", &links.resolved)
            .field("rejected", &links.rejected)
            .finish()
    }
}
