//! The updated-symbol cache: which symbols changed for which roots since the
//! last drain.

use std::sync::Arc;

use indexmap::IndexMap;
use papaya::{Compute, HashMap, Operation};
use tracing::trace;

use crate::value::{ObjectId, WeakBean};

#[derive(Debug, Clone)]
struct DirtyEntry {
    root: WeakBean,
    hits: u64,
}

/// The dirty symbols of one root, taken by a drain.
#[derive(Debug, Clone)]
pub struct DirtyRoot {
    /// The root whose inputs changed.
    pub root: WeakBean,
    /// Symbols that changed, in no particular order.
    pub symbols: Vec<Arc<str>>,
    /// Total number of changes recorded for those symbols.
    pub hits: u64,
}

impl DirtyRoot {
    /// Returns true if `symbol` is among the dirty symbols.
    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| &**s == symbol)
    }
}

/// Concurrent multiset of `(root, symbol)` pairs.
///
/// Writers never block each other or the drainer. An entry written while a
/// drain is running is either taken by that drain or left for the next one.
#[derive(Default)]
pub struct UpdatedSymbolCache {
    entries: HashMap<(ObjectId, Arc<str>), DirtyEntry, ahash::RandomState>,
}

impl UpdatedSymbolCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `symbol` changed for `root`.
    pub fn mark(&self, root: &WeakBean, symbol: &str) {
        let pinned = self.entries.pin();
        let result = pinned.compute(
            (root.id(), Arc::from(symbol)),
            |entry| -> Operation<DirtyEntry, ()> {
                match entry {
                    Some((_, existing)) => Operation::Insert(DirtyEntry {
                        root: existing.root.clone(),
                        hits: existing.hits + 1,
                    }),
                    None => Operation::Insert(DirtyEntry {
                        root: root.clone(),
                        hits: 1,
                    }),
                }
            },
        );
        if let Compute::Inserted(_, _) = result {
            trace!(root = ?root.id(), symbol, "symbol marked dirty");
        }
    }

    /// Number of dirty `(root, symbol)` pairs.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    /// Returns true if nothing is dirty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every dirty entry, grouped by root in no particular order.
    pub fn drain(&self) -> Vec<DirtyRoot> {
        let pinned = self.entries.pin();
        let keys: Vec<(ObjectId, Arc<str>)> = pinned.keys().cloned().collect();
        let mut roots: IndexMap<ObjectId, DirtyRoot> = IndexMap::new();
        for key in keys {
            let Some(entry) = pinned.remove(&key).cloned() else {
                continue;
            };
            let dirty = roots.entry(key.0).or_insert_with(|| DirtyRoot {
                root: entry.root.clone(),
                symbols: Vec::new(),
                hits: 0,
            });
            dirty.symbols.push(key.1);
            dirty.hits += entry.hits;
        }
        roots.into_values().collect()
    }

    /// Forget every entry of `root`.
    pub fn forget_root(&self, root: ObjectId) {
        let pinned = self.entries.pin();
        let keys: Vec<(ObjectId, Arc<str>)> = pinned
            .keys()
            .filter(|(id, _)| *id == root)
            .cloned()
            .collect();
        for key in keys {
            pinned.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::PropertyBag;
    use std::thread;

    #[test]
    fn test_mark_counts_hits() {
        let root = PropertyBag::new("Root").bean();
        let cache = UpdatedSymbolCache::new();
        for _ in 0..5 {
            cache.mark(&root.downgrade(), "a");
        }
        cache.mark(&root.downgrade(), "b");
        assert_eq!(cache.len(), 2);

        let drained = cache.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].hits, 6);
        assert!(drained[0].contains("a") && drained[0].contains("b"));
        assert!(cache.is_empty());
        assert!(cache.drain().is_empty());
    }

    #[test]
    fn test_forget_root() {
        let a = PropertyBag::new("Root").bean();
        let b = PropertyBag::new("Root").bean();
        let cache = UpdatedSymbolCache::new();
        cache.mark(&a.downgrade(), "x");
        cache.mark(&b.downgrade(), "x");
        cache.forget_root(a.id());

        let drained = cache.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].root.id(), b.id());
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let roots: Vec<_> = (0..4).map(|_| PropertyBag::new("Root").bean()).collect();
        let cache = UpdatedSymbolCache::new();
        let mut total = 0;

        thread::scope(|scope| {
            for root in &roots {
                let cache = &cache;
                let weak = root.downgrade();
                scope.spawn(move || {
                    for i in 0..1000 {
                        cache.mark(&weak, if i % 2 == 0 { "even" } else { "odd" });
                    }
                });
            }
            for _ in 0..20 {
                total += cache.drain().iter().map(|d| d.hits).sum::<u64>();
            }
        });
        total += cache.drain().iter().map(|d| d.hits).sum::<u64>();

        assert_eq!(total, 4000);
    }
}
