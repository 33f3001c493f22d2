//! The cached object graph: root and path registration, cached reads, and
//! batched change dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::GraphConfig;
use crate::error::GraphError;
use crate::event::{all_affect_same_roots, Delivery, PathChangeEvent, PathListener};
use crate::observable::{same_listener, PropertyChange, PropertyListener, ReadMode};
use crate::path::{BeanPath, IntoPath};
use crate::reference::{LeafChange, ReferenceGraph};
use crate::tracer::{NoopTracer, SpanId, Tracer};
use crate::value::{BeanRef, ObjectId, Value, WeakBean};

/// Observes property paths from a set of root objects.
///
/// Every registered path is resolved from every registered root. When a
/// property along a resolved path changes, the graph rewires the affected
/// subscriptions and notifies the path listeners once per originating
/// mutation.
///
/// This is cheap to clone; clones share the same graph.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use path_flow::{CachedObjectGraph, PathChangeEvent, PathListener, PropertyBag, Value};
///
/// #[derive(Default)]
/// struct Log(Mutex<Vec<Value>>);
///
/// impl PathListener for Log {
///     fn graph_changed(&self, event: &PathChangeEvent) {
///         self.0.lock().push(event.new_value().clone());
///     }
/// }
///
/// let address = PropertyBag::new("Address");
/// address.declare("city", "Oslo");
/// let person = PropertyBag::new("Person");
/// person.declare("address", address.clone());
///
/// let graph = CachedObjectGraph::new();
/// let log = Arc::new(Log::default());
/// graph.add_path_listener("address.city", log.clone()).unwrap();
/// graph.add_root_object(&person.bean()).unwrap();
///
/// address.set("city", "Bergen").unwrap();
/// assert_eq!(*log.0.lock(), vec![Value::from("Bergen")]);
/// assert_eq!(graph.get(&person.bean(), "address.city").unwrap(), Value::from("Bergen"));
/// ```
#[derive(Clone)]
pub struct CachedObjectGraph {
    shared: Arc<GraphShared>,
}

/// Builder for [`CachedObjectGraph`].
pub struct CachedObjectGraphBuilder {
    config: GraphConfig,
    tracer: Arc<dyn Tracer>,
}

impl Default for CachedObjectGraphBuilder {
    fn default() -> Self {
        Self {
            config: GraphConfig::default(),
            tracer: Arc::new(NoopTracer),
        }
    }
}

impl CachedObjectGraphBuilder {
    /// Read properties without blocking.
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.config.asynchronous = asynchronous;
        self
    }

    /// Use a full configuration.
    pub fn config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the tracer.
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Set a shared tracer.
    pub fn shared_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the graph.
    pub fn build(self) -> CachedObjectGraph {
        let mode = if self.config.asynchronous {
            ReadMode::NonBlocking
        } else {
            ReadMode::Blocking
        };
        let shared = Arc::new_cyclic(|weak: &Weak<GraphShared>| {
            let observer: Arc<dyn PropertyListener> = Arc::new(GraphObserver {
                shared: weak.clone(),
            });
            GraphShared {
                state: Mutex::new(GraphState {
                    refs: ReferenceGraph::new(observer, mode, self.tracer.clone()),
                    roots: IndexMap::new(),
                    paths: IndexMap::new(),
                }),
                pending: Mutex::new(VecDeque::new()),
                dispatching: AtomicBool::new(false),
                tracer: self.tracer,
                config: self.config,
            }
        });
        CachedObjectGraph { shared }
    }
}

struct RootEntry {
    root: WeakBean,
    count: usize,
}

#[derive(Default)]
struct PathEntry {
    listeners: Vec<Arc<dyn PathListener>>,
}

struct GraphState {
    refs: ReferenceGraph,
    roots: IndexMap<ObjectId, RootEntry>,
    paths: IndexMap<BeanPath, PathEntry>,
}

impl GraphState {
    fn live_roots(&self) -> Vec<BeanRef> {
        self.roots
            .values()
            .filter_map(|entry| entry.root.upgrade())
            .collect()
    }

    /// Subscribe `path` for each of `roots`, undoing everything on failure.
    fn subscribe_all(&mut self, roots: &[BeanRef], paths: &[BeanPath]) -> Result<(), GraphError> {
        let mut done: Vec<(ObjectId, &BeanPath)> = Vec::new();
        for root in roots {
            for path in paths {
                match self.refs.subscribe(root, path) {
                    Ok(_) => done.push((root.id(), path)),
                    Err(err) => {
                        for (root, path) in done {
                            self.refs.unsubscribe(root, path);
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Turn leaf changes into path events, one per `(path, old, new)` with
    /// every affected root listed once.
    fn collect_events(&self, changes: Vec<LeafChange>) -> Vec<PathChangeEvent> {
        let mut events: Vec<PathChangeEvent> = Vec::new();
        for LeafChange { sub, old } in changes {
            let Some(subscription) = self.refs.subscription(sub) else {
                continue;
            };
            let new = subscription.leaf();
            if *new == old {
                continue;
            }
            let Some(root) = subscription.root().upgrade() else {
                continue;
            };
            let path = subscription.path();
            match events.iter_mut().find(|e| {
                e.path() == path && *e.old_value() == old && e.new_value() == new
            }) {
                Some(event) => event.push_root(root),
                None => events.push(PathChangeEvent::new(path.clone(), vec![root], old, new.clone())),
            }
        }
        events
    }

    /// Group events by listener, in registration order.
    fn plan(&self, events: Vec<PathChangeEvent>) -> Vec<Dispatch> {
        let mut plan: Vec<Dispatch> = Vec::new();
        for event in events {
            let Some(entry) = self.paths.get(event.path()) else {
                continue;
            };
            for listener in &entry.listeners {
                match plan
                    .iter_mut()
                    .find(|d| same_listener(&d.listener, listener))
                {
                    Some(dispatch) => {
                        if !dispatch.events.iter().any(|e| e == &event) {
                            dispatch.events.push(event.clone());
                        }
                    }
                    None => plan.push(Dispatch {
                        listener: listener.clone(),
                        events: vec![event.clone()],
                    }),
                }
            }
        }
        plan
    }
}

struct Dispatch {
    listener: Arc<dyn PathListener>,
    events: Vec<PathChangeEvent>,
}

/// A property change waiting to be applied.
struct PendingChange {
    source: ObjectId,
    property: Arc<str>,
    new: Value,
}

struct GraphShared {
    state: Mutex<GraphState>,
    /// Changes reported while the graph was busy, applied in arrival order.
    pending: Mutex<VecDeque<PendingChange>>,
    dispatching: AtomicBool,
    tracer: Arc<dyn Tracer>,
    config: GraphConfig,
}

/// Resets the dispatching flag, also when a listener panics.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl GraphShared {
    /// Run `f` on the state. Changes fired while `f` runs (for example by a
    /// load that completes during a read) are queued and applied afterwards.
    fn exclusive<R>(&self, f: impl FnOnce(&mut GraphState) -> R) -> R {
        let owner = !self.dispatching.swap(true, Ordering::AcqRel);
        let result = {
            let _guard = owner.then(|| DispatchGuard(&self.dispatching));
            f(&mut *self.state.lock())
        };
        if owner {
            self.pump();
        }
        result
    }

    fn enqueue(&self, change: PendingChange) {
        self.pending.lock().push_back(change);
        self.pump();
    }

    /// Apply queued changes unless another call is already doing so.
    fn pump(&self) {
        loop {
            if self.pending.lock().is_empty() {
                return;
            }
            if self.dispatching.swap(true, Ordering::AcqRel) {
                return;
            }
            let _guard = DispatchGuard(&self.dispatching);
            loop {
                let next = self.pending.lock().pop_front();
                match next {
                    Some(change) => self.apply(change),
                    None => break,
                }
            }
        }
    }

    fn apply(&self, change: PendingChange) {
        let span_id = self.tracer.new_span_id();
        self.tracer
            .on_batch_start(span_id, change.source, &change.property);
        let plan = {
            let mut state = self.state.lock();
            let changes = state
                .refs
                .property_changed(change.source, &change.property, &change.new);
            let events = state.collect_events(changes);
            state.plan(events)
        };
        let delivered = deliver(span_id, plan);
        self.tracer.on_batch_end(span_id, delivered);
    }
}

/// Deliver a plan outside the state lock. Returns the number of events.
fn deliver(span_id: SpanId, plan: Vec<Dispatch>) -> usize {
    let mut delivered = 0;
    for Dispatch { listener, events } in plan {
        delivered += events.len();
        match listener.delivery() {
            Delivery::Single => {
                for event in &events {
                    listener.graph_changed(event);
                }
            }
            Delivery::Batched => {
                let same_roots = all_affect_same_roots(&events);
                debug!(span = span_id.0, events = events.len(), same_roots, "delivering batch");
                listener.multiple_change(&events, same_roots);
            }
        }
    }
    delivered
}

struct GraphObserver {
    shared: Weak<GraphShared>,
}

impl PropertyListener for GraphObserver {
    fn property_changed(&self, change: PropertyChange<'_>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.enqueue(PendingChange {
                source: change.source,
                property: Arc::from(change.property),
                new: change.new.clone(),
            });
        }
    }
}

impl Default for CachedObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedObjectGraph {
    /// A synchronous graph with the default tracer.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a graph.
    pub fn builder() -> CachedObjectGraphBuilder {
        CachedObjectGraphBuilder::default()
    }

    /// Returns true if property reads never block.
    pub fn is_asynchronous(&self) -> bool {
        self.shared.config.asynchronous
    }

    pub(crate) fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.shared.tracer
    }

    /// Register a root object and resolve every registered path from it.
    ///
    /// Roots are reference-counted by identity: adding the same object again
    /// only increments its count.
    pub fn add_root_object(&self, root: &BeanRef) -> Result<(), GraphError> {
        self.shared.exclusive(|state| {
            if let Some(entry) = state.roots.get_mut(&root.id()) {
                entry.count += 1;
                return Ok(());
            }
            let paths: Vec<BeanPath> = state
                .paths
                .keys()
                .filter(|path| !path.is_formula())
                .cloned()
                .collect();
            state.subscribe_all(std::slice::from_ref(root), &paths)?;
            state.roots.insert(
                root.id(),
                RootEntry {
                    root: root.downgrade(),
                    count: 1,
                },
            );
            debug!(?root, paths = paths.len(), "root added");
            Ok(())
        })
    }

    /// Release one registration of `root`.
    ///
    /// Returns true if this was the last registration and the root's
    /// subscriptions were torn down.
    pub fn remove_root_object(&self, root: &BeanRef) -> bool {
        self.shared.exclusive(|state| {
            let Some(entry) = state.roots.get_mut(&root.id()) else {
                return false;
            };
            entry.count -= 1;
            if entry.count > 0 {
                return false;
            }
            state.roots.shift_remove(&root.id());
            let paths: Vec<BeanPath> = state.paths.keys().cloned().collect();
            for path in &paths {
                state.refs.unsubscribe(root.id(), path);
            }
            debug!(?root, "root removed");
            true
        })
    }

    /// Register `listener` for changes to `path`.
    ///
    /// The first listener of a path resolves it from every registered root;
    /// an unknown property anywhere along the way is reported here and
    /// leaves the graph unchanged. Formula pseudo-paths are registered
    /// without being resolved.
    pub fn add_path_listener(
        &self,
        path: impl IntoPath,
        listener: Arc<dyn PathListener>,
    ) -> Result<(), GraphError> {
        let path = path.into_path()?;
        self.shared.exclusive(|state| {
            if let Some(entry) = state.paths.get_mut(&path) {
                entry.listeners.push(listener);
                return Ok(());
            }
            if !path.is_formula() {
                let roots = state.live_roots();
                state.subscribe_all(&roots, std::slice::from_ref(&path))?;
            }
            debug!(%path, "path registered");
            state.paths.insert(
                path,
                PathEntry {
                    listeners: vec![listener],
                },
            );
            Ok(())
        })
    }

    /// Deregister one registration of `listener` for `path`.
    ///
    /// Returns false if the listener was not registered. Removing the last
    /// listener of a path unsubscribes it from every root.
    pub fn remove_path_listener(
        &self,
        path: impl IntoPath,
        listener: &Arc<dyn PathListener>,
    ) -> Result<bool, GraphError> {
        let path = path.into_path()?;
        Ok(self.shared.exclusive(|state| {
            let Some(entry) = state.paths.get_mut(&path) else {
                return false;
            };
            let Some(index) = entry
                .listeners
                .iter()
                .position(|l| same_listener(l, listener))
            else {
                return false;
            };
            entry.listeners.remove(index);
            if entry.listeners.is_empty() {
                state.paths.shift_remove(&path);
                let roots: Vec<ObjectId> = state.roots.keys().copied().collect();
                for root in roots {
                    state.refs.unsubscribe(root, &path);
                }
                debug!(%path, "path unregistered");
            }
            true
        }))
    }

    /// The value reachable through `path` from `root`.
    ///
    /// Registered paths answer from the cache. Other paths walk cached nodes
    /// where they exist and read the remaining properties directly, without
    /// blocking in asynchronous mode. An unloaded value is
    /// [`Value::NotReady`]; formula pseudo-paths are always `NotReady` here.
    pub fn get(&self, root: &BeanRef, path: impl IntoPath) -> Result<Value, GraphError> {
        let path = path.into_path()?;
        if path.is_formula() {
            return Ok(Value::NotReady);
        }
        if let Some(leaf) = self.shared.state.lock().refs.leaf(root.id(), &path) {
            return Ok(leaf.clone());
        }
        let mode = if self.is_asynchronous() {
            ReadMode::NonBlocking
        } else {
            ReadMode::Blocking
        };
        let mut current = Value::Object(root.clone());
        for (depth, segment) in path.segments().enumerate() {
            let object = match current {
                Value::Object(object) => object,
                Value::Null => return Ok(Value::Null),
                Value::NotReady => return Ok(Value::NotReady),
                _ => {
                    return Err(GraphError::NotAnObject {
                        path: path.clone(),
                        segment: path.segment(depth.saturating_sub(1)).to_string(),
                    })
                }
            };
            let cached = self
                .shared
                .state
                .lock()
                .refs
                .cached(object.id(), segment)
                .cloned();
            current = match cached {
                Some(value) => value,
                None => object.property(segment, mode)?,
            };
        }
        Ok(current)
    }

    /// Live registered roots, in registration order.
    pub fn roots(&self) -> Vec<BeanRef> {
        self.shared.state.lock().live_roots()
    }

    /// Returns true if `root` is registered.
    pub fn contains_root(&self, root: &BeanRef) -> bool {
        self.shared.state.lock().roots.contains_key(&root.id())
    }

    /// Paths with at least one listener, in registration order.
    pub fn paths(&self) -> Vec<BeanPath> {
        self.shared.state.lock().paths.keys().cloned().collect()
    }

    /// Number of listeners registered for `path`.
    pub fn listener_count(&self, path: &BeanPath) -> usize {
        self.shared
            .state
            .lock()
            .paths
            .get(path)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Number of observed `(object, property)` pairs.
    pub fn node_count(&self) -> usize {
        self.shared.state.lock().refs.node_count()
    }

    /// Number of live `(root, path)` subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.state.lock().refs.subscription_count()
    }

    /// Deliver externally produced events to the listeners of their paths.
    pub(crate) fn fire_synthetic(&self, events: Vec<PathChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let span_id = self.shared.tracer.new_span_id();
        let plan = self.shared.state.lock().plan(events);
        let delivered = deliver(span_id, plan);
        self.shared.tracer.on_batch_end(span_id, delivered);
    }

    /// Remove and return every listener of a formula pseudo-path.
    pub(crate) fn take_path_listeners(&self, path: &BeanPath) -> Vec<Arc<dyn PathListener>> {
        self.shared.exclusive(|state| {
            state
                .paths
                .shift_remove(path)
                .map(|entry| entry.listeners)
                .unwrap_or_default()
        })
    }

    /// Append listeners to a formula pseudo-path.
    pub(crate) fn put_path_listeners(&self, path: BeanPath, listeners: Vec<Arc<dyn PathListener>>) {
        if listeners.is_empty() {
            return;
        }
        self.shared.exclusive(|state| {
            state
                .paths
                .entry(path)
                .or_default()
                .listeners
                .extend(listeners);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::PropertyBag;

    #[derive(Default)]
    struct Count(Mutex<Vec<PathChangeEvent>>);

    impl PathListener for Count {
        fn graph_changed(&self, event: &PathChangeEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn test_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<CachedObjectGraph>();
        assert_sync::<CachedObjectGraph>();
    }

    #[test]
    fn test_root_reference_counting() {
        let root = PropertyBag::new("Root");
        root.declare("x", 1);
        let graph = CachedObjectGraph::new();
        let listener: Arc<dyn PathListener> = Arc::new(Count::default());
        graph.add_path_listener("x", listener.clone()).unwrap();

        graph.add_root_object(&root.bean()).unwrap();
        graph.add_root_object(&root.bean()).unwrap();
        assert_eq!(graph.subscription_count(), 1);
        assert_eq!(root.listener_count("x"), 1);

        assert!(!graph.remove_root_object(&root.bean()));
        assert!(graph.contains_root(&root.bean()));
        assert!(graph.remove_root_object(&root.bean()));
        assert!(!graph.contains_root(&root.bean()));
        assert!(!graph.remove_root_object(&root.bean()));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_get_unregistered_path() {
        let c = PropertyBag::new("C");
        c.declare("name", "c");
        let root = PropertyBag::new("Root");
        root.declare("c", c.clone());
        root.declare("none", Value::Null);
        let graph = CachedObjectGraph::new();

        assert_eq!(graph.get(&root.bean(), "c.name").unwrap(), Value::from("c"));
        assert_eq!(graph.get(&root.bean(), "none.name").unwrap(), Value::Null);
        assert!(graph.get(&root.bean(), "c.missing").is_err());
        assert!(matches!(
            graph.get(&root.bean(), "c.name.len"),
            Err(GraphError::NotAnObject { .. })
        ));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_duplicate_listener_notified_once() {
        let root = PropertyBag::new("Root");
        root.declare("x", 1);
        let graph = CachedObjectGraph::new();
        let count = Arc::new(Count::default());
        let listener: Arc<dyn PathListener> = count.clone();
        graph.add_path_listener("x", listener.clone()).unwrap();
        graph.add_path_listener("x", listener.clone()).unwrap();
        graph.add_root_object(&root.bean()).unwrap();

        root.set("x", 2).unwrap();
        assert_eq!(count.0.lock().len(), 1);

        assert!(graph.remove_path_listener("x", &listener).unwrap());
        assert_eq!(graph.listener_count(&BeanPath::parse("x").unwrap()), 1);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.remove_path_listener("x", &listener).unwrap());
        assert!(!graph.remove_path_listener("x", &listener).unwrap());
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_listener_may_reenter_graph() {
        struct Reader {
            graph: CachedObjectGraph,
            root: BeanRef,
            seen: Mutex<Vec<Value>>,
        }

        impl PathListener for Reader {
            fn graph_changed(&self, _event: &PathChangeEvent) {
                let value = self.graph.get(&self.root, "x").unwrap();
                self.seen.lock().push(value);
            }
        }

        let root = PropertyBag::new("Root");
        root.declare("x", 1);
        let graph = CachedObjectGraph::new();
        graph.add_root_object(&root.bean()).unwrap();
        let reader = Arc::new(Reader {
            graph: graph.clone(),
            root: root.bean(),
            seen: Mutex::new(Vec::new()),
        });
        graph.add_path_listener("x", reader.clone()).unwrap();

        root.set("x", 5).unwrap();
        assert_eq!(*reader.seen.lock(), vec![Value::from(5)]);
    }
}
