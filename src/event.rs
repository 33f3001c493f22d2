//! Path change notifications.

use crate::path::BeanPath;
use crate::value::{BeanRef, ObjectId, Value};

/// The value reachable through `path` changed from `old` to `new` for every
/// root in `roots`.
#[derive(Debug, Clone, PartialEq)]
pub struct PathChangeEvent {
    path: BeanPath,
    roots: Vec<BeanRef>,
    old: Value,
    new: Value,
}

impl PathChangeEvent {
    /// Create an event.
    pub fn new(path: BeanPath, roots: Vec<BeanRef>, old: Value, new: Value) -> Self {
        Self {
            path,
            roots,
            old,
            new,
        }
    }

    /// The path whose value changed.
    pub fn path(&self) -> &BeanPath {
        &self.path
    }

    /// The affected roots, each listed once.
    pub fn roots(&self) -> &[BeanRef] {
        &self.roots
    }

    /// Value before the change.
    pub fn old_value(&self) -> &Value {
        &self.old
    }

    /// Value after the change.
    pub fn new_value(&self) -> &Value {
        &self.new
    }

    /// Returns true if `root` is among the affected roots.
    pub fn affects(&self, root: &BeanRef) -> bool {
        self.roots.iter().any(|r| r == root)
    }

    pub(crate) fn push_root(&mut self, root: BeanRef) {
        if !self.affects(&root) {
            self.roots.push(root);
        }
    }

    fn root_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.roots.iter().map(BeanRef::id).collect();
        ids.sort_unstable();
        ids
    }
}

/// Returns true if every event in the batch carries the same set of roots.
pub fn all_affect_same_roots(events: &[PathChangeEvent]) -> bool {
    let mut iter = events.iter();
    let Some(first) = iter.next() else {
        return true;
    };
    let expected = first.root_ids();
    iter.all(|event| event.root_ids() == expected)
}

/// How a [`PathListener`] wants to receive the events of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// One [`PathListener::graph_changed`] call per event.
    #[default]
    Single,
    /// One [`PathListener::multiple_change`] call per originating mutation.
    Batched,
}

/// Receives change notifications for registered paths.
///
/// Both callbacks have default implementations, so a listener only
/// overrides what it uses. A batched listener that does not override
/// `multiple_change` still sees each event through `graph_changed`.
pub trait PathListener: Send + Sync + 'static {
    /// One path changed.
    fn graph_changed(&self, _event: &PathChangeEvent) {}

    /// Several paths changed as the result of one mutation.
    ///
    /// `all_affect_same_roots` is true if every event names the same roots.
    fn multiple_change(&self, events: &[PathChangeEvent], _all_affect_same_roots: bool) {
        for event in events {
            self.graph_changed(event);
        }
    }

    /// Delivery preference; consulted on every dispatch.
    fn delivery(&self) -> Delivery {
        Delivery::Single
    }
}
