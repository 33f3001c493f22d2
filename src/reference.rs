//! The reference graph: which `(object, property)` pairs are observed, and for
//! which `(root, path)` subscriptions.
//!
//! Nodes live in a slab arena and are indexed by object identity plus
//! property name, never by path. A node exists while at least one
//! subscription walks through it; the walk of each subscription is bounded by
//! its path length, so cyclic object graphs terminate and a node reached
//! twice by the same walk is shared rather than duplicated.

use std::collections::BTreeMap;
use std::sync::Arc;

use slab::Slab;
use tracing::{trace, warn};

use crate::error::GraphError;
use crate::observable::{PropertyListener, ReadMode};
use crate::path::BeanPath;
use crate::tracer::Tracer;
use crate::value::{BeanRef, ObjectId, Value, WeakBean};

pub(crate) type NodeId = usize;
pub(crate) type SubId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NodeKey {
    object: ObjectId,
    property: Arc<str>,
}

/// One observation point.
struct Node {
    object: WeakBean,
    key: NodeKey,
    /// Last value read or reported for the property.
    value: Value,
    /// `(subscription, depth)` pairs walking through this node.
    members: ahash::HashSet<(SubId, usize)>,
}

/// A path resolved from one root.
pub(crate) struct Subscription {
    root: WeakBean,
    path: BeanPath,
    /// `chain[d]` is the node observed for `path.segment(d)`. Shorter than the
    /// path when the walk stopped at a null or not-ready value.
    chain: Vec<NodeId>,
    leaf: Value,
}

impl Subscription {
    pub(crate) fn root(&self) -> &WeakBean {
        &self.root
    }

    pub(crate) fn path(&self) -> &BeanPath {
        &self.path
    }

    pub(crate) fn leaf(&self) -> &Value {
        &self.leaf
    }
}

/// A subscription affected by one property change, with its leaf value from
/// before the change.
pub(crate) struct LeafChange {
    pub(crate) sub: SubId,
    pub(crate) old: Value,
}

pub(crate) struct ReferenceGraph {
    nodes: Slab<Node>,
    index: ahash::HashMap<NodeKey, NodeId>,
    subscriptions: Slab<Subscription>,
    by_root_path: ahash::HashMap<(ObjectId, BeanPath), SubId>,
    /// Registered on every observed `(object, property)` pair.
    observer: Arc<dyn PropertyListener>,
    mode: ReadMode,
    tracer: Arc<dyn Tracer>,
}

impl ReferenceGraph {
    pub(crate) fn new(
        observer: Arc<dyn PropertyListener>,
        mode: ReadMode,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            nodes: Slab::new(),
            index: Default::default(),
            subscriptions: Slab::new(),
            by_root_path: Default::default(),
            observer,
            mode,
            tracer,
        }
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn subscription(&self, sub: SubId) -> Option<&Subscription> {
        self.subscriptions.get(sub)
    }

    /// Current leaf of the `(root, path)` subscription, if there is one.
    pub(crate) fn leaf(&self, root: ObjectId, path: &BeanPath) -> Option<&Value> {
        let sub = self.by_root_path.get(&(root, path.clone()))?;
        Some(&self.subscriptions[*sub].leaf)
    }

    /// Cached value of an observed property.
    pub(crate) fn cached(&self, object: ObjectId, property: &str) -> Option<&Value> {
        let key = NodeKey {
            object,
            property: Arc::from(property),
        };
        self.index.get(&key).map(|node| &self.nodes[*node].value)
    }

    /// Resolve `path` from `root` and observe every property along the way.
    ///
    /// Subscribing an existing `(root, path)` pair returns the existing
    /// subscription. On error nothing is left behind.
    pub(crate) fn subscribe(&mut self, root: &BeanRef, path: &BeanPath) -> Result<SubId, GraphError> {
        let key = (root.id(), path.clone());
        if let Some(sub) = self.by_root_path.get(&key) {
            return Ok(*sub);
        }
        let sub = self.subscriptions.insert(Subscription {
            root: root.downgrade(),
            path: path.clone(),
            chain: Vec::with_capacity(path.len()),
            leaf: Value::Null,
        });
        if let Err(err) = self.rebuild(sub, 0) {
            self.drop_subscription(sub);
            return Err(err);
        }
        trace!(root = ?root, %path, sub, "subscribed");
        self.by_root_path.insert(key, sub);
        Ok(sub)
    }

    /// Stop resolving `path` from `root`. Returns false if there was no such
    /// subscription.
    pub(crate) fn unsubscribe(&mut self, root: ObjectId, path: &BeanPath) -> bool {
        match self.by_root_path.remove(&(root, path.clone())) {
            Some(sub) => {
                self.drop_subscription(sub);
                trace!(?root, %path, sub, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Apply a change reported by an observed object.
    ///
    /// Returns every subscription walking through the changed node, each once,
    /// with its leaf from before the change. A change to a value equal to the
    /// cached one (the same object, for references) has no effect.
    pub(crate) fn property_changed(
        &mut self,
        source: ObjectId,
        property: &str,
        new: &Value,
    ) -> Vec<LeafChange> {
        let key = NodeKey {
            object: source,
            property: Arc::from(property),
        };
        let Some(&node) = self.index.get(&key) else {
            return Vec::new();
        };
        if self.nodes[node].value == *new {
            return Vec::new();
        }
        self.nodes[node].value = new.clone();

        // A cyclic walk may pass the same node at several depths; rewiring
        // from the shallowest one covers the deeper ones.
        let mut shallowest: BTreeMap<SubId, usize> = BTreeMap::new();
        for &(sub, depth) in &self.nodes[node].members {
            shallowest
                .entry(sub)
                .and_modify(|d| *d = (*d).min(depth))
                .or_insert(depth);
        }

        let mut changes = Vec::with_capacity(shallowest.len());
        for (sub, depth) in shallowest {
            let old = self.subscriptions[sub].leaf.clone();
            if depth + 1 == self.subscriptions[sub].path.len() {
                self.subscriptions[sub].leaf = new.clone();
            } else if let Err(err) = self.rebuild(sub, depth + 1) {
                let path = &self.subscriptions[sub].path;
                warn!(%path, error = %err, "path no longer resolves; treating it as null");
            }
            changes.push(LeafChange { sub, old });
        }
        changes
    }

    /// Re-resolve a subscription from `from` onwards.
    ///
    /// New nodes are acquired before the old tail is released, so nodes that
    /// stay on the walk keep their registrations. On error the chain keeps
    /// the nodes acquired so far and the leaf becomes `Null`.
    fn rebuild(&mut self, sub: SubId, from: usize) -> Result<(), GraphError> {
        let (root, path) = {
            let s = &self.subscriptions[sub];
            (s.root.clone(), s.path.clone())
        };
        let old_tail = self.subscriptions[sub].chain.split_off(from);
        let mut fresh = Vec::with_capacity(path.len() - from);
        let outcome = self.walk(sub, &root, &path, from, &mut fresh);

        for (offset, &node) in old_tail.iter().enumerate() {
            if fresh.get(offset) != Some(&node) {
                self.release(node, sub, from + offset);
            }
        }

        let s = &mut self.subscriptions[sub];
        s.chain.extend(fresh);
        match outcome {
            Ok(leaf) => {
                s.leaf = leaf;
                Ok(())
            }
            Err(err) => {
                s.leaf = Value::Null;
                Err(err)
            }
        }
    }

    fn walk(
        &mut self,
        sub: SubId,
        root: &WeakBean,
        path: &BeanPath,
        from: usize,
        fresh: &mut Vec<NodeId>,
    ) -> Result<Value, GraphError> {
        let mut current = if from == 0 {
            match root.upgrade() {
                Some(root) => Value::Object(root),
                None => return Ok(Value::Null),
            }
        } else {
            let parent = self.subscriptions[sub].chain[from - 1];
            self.nodes[parent].value.clone()
        };

        for depth in from..path.len() {
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
            let node = self.acquire(&object, path.segment(depth))?;
            self.nodes[node].members.insert((sub, depth));
            fresh.push(node);
            current = self.nodes[node].value.clone();
        }
        Ok(current)
    }

    /// Find or create the node observing `object.property`.
    fn acquire(&mut self, object: &BeanRef, property: &str) -> Result<NodeId, GraphError> {
        let key = NodeKey {
            object: object.id(),
            property: Arc::from(property),
        };
        if let Some(&node) = self.index.get(&key) {
            return Ok(node);
        }

        // Listen before reading so a load completing during the read is not
        // missed.
        object.add_property_listener(property, self.observer.clone());
        let value = match object.property(property, self.mode) {
            Ok(value) => value,
            Err(err) => {
                object.remove_property_listener(property, &self.observer);
                return Err(err);
            }
        };

        let node = self.nodes.insert(Node {
            object: object.downgrade(),
            key: key.clone(),
            value,
            members: Default::default(),
        });
        self.index.insert(key, node);
        trace!(object = ?object, property, node, "node created");
        self.tracer.on_node_created(object.id(), property);
        Ok(node)
    }

    /// Drop one membership; remove the node once nothing walks through it.
    fn release(&mut self, node: NodeId, sub: SubId, depth: usize) {
        let entry = &mut self.nodes[node];
        entry.members.remove(&(sub, depth));
        if !entry.members.is_empty() {
            return;
        }
        let entry = self.nodes.remove(node);
        self.index.remove(&entry.key);
        if let Some(object) = entry.object.upgrade() {
            object.remove_property_listener(&entry.key.property, &self.observer);
        }
        trace!(object = ?entry.key.object, property = %entry.key.property, node, "node removed");
        self.tracer
            .on_node_removed(entry.key.object, &entry.key.property);
    }

    fn drop_subscription(&mut self, sub: SubId) {
        let subscription = self.subscriptions.remove(sub);
        for (depth, node) in subscription.chain.into_iter().enumerate() {
            self.release(node, sub, depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::{PropertyBag, PropertyChange};
    use crate::tracer::NoopTracer;

    struct Silent;

    impl PropertyListener for Silent {
        fn property_changed(&self, _change: PropertyChange<'_>) {}
    }

    fn graph() -> ReferenceGraph {
        ReferenceGraph::new(Arc::new(Silent), ReadMode::Blocking, Arc::new(NoopTracer))
    }

    fn path(text: &str) -> BeanPath {
        BeanPath::parse(text).unwrap()
    }

    #[test]
    fn test_shared_prefix_shares_nodes() {
        let c = PropertyBag::new("C");
        c.declare("x", 1);
        c.declare("y", 2);
        let root = PropertyBag::new("Root");
        root.declare("c", c.clone());

        let mut refs = graph();
        refs.subscribe(&root.bean(), &path("c.x")).unwrap();
        refs.subscribe(&root.bean(), &path("c.y")).unwrap();
        // root.c, c.x, c.y
        assert_eq!(refs.node_count(), 3);
        assert_eq!(root.listener_count("c"), 1);
        assert_eq!(refs.leaf(root.bean().id(), &path("c.y")), Some(&Value::from(2)));

        assert!(refs.unsubscribe(root.bean().id(), &path("c.x")));
        assert_eq!(refs.node_count(), 2);
        assert!(refs.unsubscribe(root.bean().id(), &path("c.y")));
        assert_eq!(refs.node_count(), 0);
        assert_eq!(root.total_listener_count() + c.total_listener_count(), 0);
    }

    #[test]
    fn test_cycle_through_same_node() {
        let root = PropertyBag::new("Node");
        root.declare("next", Value::Null);
        root.set("next", root.clone()).unwrap();

        let mut refs = graph();
        let sub = refs.subscribe(&root.bean(), &path("next.next.next")).unwrap();
        assert_eq!(refs.node_count(), 1);
        assert_eq!(refs.subscription(sub).unwrap().chain, vec![0, 0, 0]);

        let changes = refs.property_changed(root.bean().id(), "next", &Value::Null);
        assert_eq!(changes.len(), 1);
        assert_eq!(refs.subscription(sub).unwrap().leaf(), &Value::Null);
        assert_eq!(refs.node_count(), 1);

        refs.unsubscribe(root.bean().id(), &path("next.next.next"));
        assert_eq!(refs.node_count(), 0);
        assert_eq!(root.total_listener_count(), 0);
    }

    #[test]
    fn test_failed_subscribe_leaves_nothing() {
        let b = PropertyBag::new("B");
        let root = PropertyBag::new("Root");
        root.declare("b", b.clone());

        let mut refs = graph();
        let err = refs.subscribe(&root.bean(), &path("b.missing")).unwrap_err();
        assert!(matches!(err, GraphError::UnknownProperty { .. }));
        assert_eq!(refs.node_count(), 0);
        assert_eq!(refs.subscription_count(), 0);
        assert_eq!(root.total_listener_count() + b.total_listener_count(), 0);
    }

    #[test]
    fn test_scalar_intermediate_is_rejected() {
        let root = PropertyBag::new("Root");
        root.declare("name", "ann");

        let mut refs = graph();
        let err = refs.subscribe(&root.bean(), &path("name.length")).unwrap_err();
        assert!(matches!(err, GraphError::NotAnObject { ref segment, .. } if segment == "name"));
        assert_eq!(refs.node_count(), 0);
    }

    #[test]
    fn test_identical_value_is_ignored() {
        let c = PropertyBag::new("C");
        c.declare("x", 1);
        let root = PropertyBag::new("Root");
        root.declare("c", c.clone());

        let mut refs = graph();
        refs.subscribe(&root.bean(), &path("c.x")).unwrap();
        let same = Value::from(c.clone());
        assert!(refs.property_changed(root.bean().id(), "c", &same).is_empty());
        assert!(refs
            .property_changed(ObjectId::of(&0u8), "c", &Value::Null)
            .is_empty());
    }
}
