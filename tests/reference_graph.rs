//! Path observation over live object graphs: resolution, rewiring, sharing,
//! cycles, batching, asynchronous values and teardown.

mod common;

use std::sync::Arc;

use common::{BatchRecorder, CountingTracer, QueueLoader, Recorder};
use path_flow::{
    BeanPath, CachedObjectGraph, GraphError, PathListener, PropertyBag, Value,
};

fn path(text: &str) -> BeanPath {
    BeanPath::parse(text).unwrap()
}

/// root -> b -> c.someString
fn chain(text: &str) -> (Arc<PropertyBag>, Arc<PropertyBag>, Arc<PropertyBag>) {
    let c = PropertyBag::new("C");
    c.declare("someString", text);
    let b = PropertyBag::new("B");
    b.declare("c", c.clone());
    let root = PropertyBag::new("Root");
    root.declare("b", b.clone());
    (root, b, c)
}

// =============================================================================
// Teardown
// =============================================================================

#[test]
fn test_cleanup_reaches_zero_nodes() {
    let (root, b, c) = chain("x");
    let (other, other_b, _) = chain("y");
    let tracer = CountingTracer::new();
    let graph = CachedObjectGraph::builder()
        .shared_tracer(tracer.clone())
        .build();

    let first: Arc<dyn PathListener> = Recorder::new();
    let second: Arc<dyn PathListener> = BatchRecorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", first.clone()).unwrap();
    graph.add_path_listener("b", second.clone()).unwrap();
    graph.add_path_listener("b.c", second.clone()).unwrap();
    graph.add_root_object(&other.bean()).unwrap();
    assert!(graph.node_count() > 0);

    // Churn while registered.
    b.set("c", other_b.get("c").unwrap()).unwrap();
    root.set("b", other_b.clone()).unwrap();

    graph.remove_path_listener("b.c.someString", &first).unwrap();
    graph.remove_path_listener("b", &second).unwrap();
    graph.remove_path_listener("b.c", &second).unwrap();
    assert!(graph.remove_root_object(&root.bean()));
    assert!(graph.remove_root_object(&other.bean()));

    assert_eq!(graph.node_count(), 0);
    assert_eq!(graph.subscription_count(), 0);
    assert!(graph.paths().is_empty());
    assert!(graph.roots().is_empty());
    for bag in [&root, &b, &c, &other, &other_b] {
        assert_eq!(bag.total_listener_count(), 0);
    }
    assert_eq!(
        tracer.nodes_created.load(std::sync::atomic::Ordering::Relaxed),
        tracer.nodes_removed.load(std::sync::atomic::Ordering::Relaxed)
    );
}

#[test]
fn test_removing_roots_first_also_cleans_up() {
    let (root, _, c) = chain("x");
    let graph = CachedObjectGraph::new();
    let listener: Arc<dyn PathListener> = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", listener.clone()).unwrap();

    assert!(graph.remove_root_object(&root.bean()));
    assert_eq!(graph.node_count(), 0);
    assert!(graph.remove_path_listener("b.c.someString", &listener).unwrap());
    assert_eq!(c.total_listener_count(), 0);
}

// =============================================================================
// Single root, single path
// =============================================================================

#[test]
fn test_leaf_change_delivers_one_event() {
    let (root, _, c) = chain("before");
    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", recorder.clone()).unwrap();

    c.set("someString", "after").unwrap();

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path(), &path("b.c.someString"));
    assert_eq!(events[0].roots(), &[root.bean()]);
    assert_eq!(events[0].old_value(), &Value::from("before"));
    assert_eq!(events[0].new_value(), &Value::from("after"));
    assert_eq!(
        graph.get(&root.bean(), "b.c.someString").unwrap(),
        Value::from("after")
    );
}

#[test]
fn test_assigning_the_same_value_is_silent() {
    let (root, b, c) = chain("x");
    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", recorder.clone()).unwrap();

    c.set("someString", "x").unwrap();
    b.set("c", c.clone()).unwrap();
    assert!(recorder.events().is_empty());
}

#[test]
fn test_same_text_through_a_new_object_is_silent() {
    let (root, b, _) = chain("x");
    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", recorder.clone()).unwrap();

    let twin = PropertyBag::new("C");
    twin.declare("someString", "x");
    b.set("c", twin.clone()).unwrap();

    assert!(recorder.events().is_empty());
    // Still rewired to the twin.
    twin.set("someString", "y").unwrap();
    assert_eq!(recorder.new_values(), vec![Value::from("y")]);
}

// =============================================================================
// Rewiring
// =============================================================================

#[test]
fn test_intermediate_change_rewires_the_path() {
    let (root, b, old_c) = chain("old");
    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", recorder.clone()).unwrap();

    let new_c = PropertyBag::new("C");
    new_c.declare("someString", "new");
    b.set("c", new_c.clone()).unwrap();

    assert_eq!(recorder.new_values(), vec![Value::from("new")]);
    assert_eq!(old_c.total_listener_count(), 0);
    assert_eq!(new_c.listener_count("someString"), 1);

    // The old object is no longer observed; the new one is.
    old_c.set("someString", "ignored").unwrap();
    new_c.set("someString", "newer").unwrap();
    assert_eq!(
        recorder.new_values(),
        vec![Value::from("new"), Value::from("newer")]
    );
    assert_eq!(
        graph.get(&root.bean(), "b.c.someString").unwrap(),
        Value::from("newer")
    );
}

#[test]
fn test_null_intermediate_suspends_and_resumes() {
    let (root, b, c) = chain("x");
    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", recorder.clone()).unwrap();

    b.set("c", Value::Null).unwrap();
    assert_eq!(graph.get(&root.bean(), "b.c.someString").unwrap(), Value::Null);
    assert_eq!(c.total_listener_count(), 0);

    b.set("c", c.clone()).unwrap();
    assert_eq!(
        recorder.new_values(),
        vec![Value::Null, Value::from("x")]
    );
}

// =============================================================================
// Sharing and cycles
// =============================================================================

#[test]
fn test_roots_sharing_a_sub_object() {
    let shared = PropertyBag::new("C");
    shared.declare("someString", "x");
    let first = PropertyBag::new("Root");
    first.declare("c", shared.clone());
    let second = PropertyBag::new("Root");
    second.declare("c", shared.clone());

    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&first.bean()).unwrap();
    graph.add_root_object(&second.bean()).unwrap();
    graph.add_path_listener("c.someString", recorder.clone()).unwrap();
    // first.c, second.c, shared.someString
    assert_eq!(graph.node_count(), 3);
    assert_eq!(shared.listener_count("someString"), 1);

    shared.set("someString", "y").unwrap();

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].affects(&first.bean()));
    assert!(events[0].affects(&second.bean()));
    assert_eq!(events[0].roots().len(), 2);

    // Detach the second root from the shared object.
    let own = PropertyBag::new("C");
    own.declare("someString", "own");
    second.set("c", own.clone()).unwrap();
    recorder.clear();
    shared.set("someString", "z").unwrap();
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].roots(), &[first.bean()]);
}

#[test]
fn test_reassignment_into_a_cycle() {
    // first.child -> a, second.child -> b; b.parent -> second.
    let a = PropertyBag::new("Child");
    a.declare("name", "a");
    a.declare("parent", Value::Null);
    let b = PropertyBag::new("Child");
    b.declare("name", "b");
    b.declare("parent", Value::Null);
    let first = PropertyBag::new("Root");
    first.declare("child", a.clone());
    let second = PropertyBag::new("Root");
    second.declare("child", b.clone());
    a.set("parent", first.clone()).unwrap();
    b.set("parent", second.clone()).unwrap();

    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&first.bean()).unwrap();
    graph.add_root_object(&second.bean()).unwrap();
    graph
        .add_path_listener("child.parent.child.name", recorder.clone())
        .unwrap();

    // Converge both roots on `a`, whose parent leads back to `first`.
    second.set("child", a.clone()).unwrap();
    assert_eq!(
        graph.get(&second.bean(), "child.parent.child.name").unwrap(),
        Value::from("a")
    );
    recorder.clear();

    a.set("name", "renamed").unwrap();
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].roots().len(), 2);
    assert!(events[0].affects(&first.bean()) && events[0].affects(&second.bean()));

    // first -> b -> second -> a, second -> a -> first -> b
    b.set("name", "b2").unwrap();
    first.set("child", b.clone()).unwrap();
    assert_eq!(
        recorder.new_values().last(),
        Some(&Value::from("b2"))
    );
    recorder.clear();
    a.set("name", "again").unwrap();
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].roots(), &[first.bean()]);

    let listener: Arc<dyn PathListener> = recorder;
    graph
        .remove_path_listener("child.parent.child.name", &listener)
        .unwrap();
    graph.remove_root_object(&first.bean());
    graph.remove_root_object(&second.bean());
    assert_eq!(graph.node_count(), 0);
    for bag in [&a, &b, &first, &second] {
        assert_eq!(bag.total_listener_count(), 0);
    }
}

#[test]
fn test_self_referencing_object() {
    let node = PropertyBag::new("Node");
    node.declare("value", 1);
    node.declare("next", Value::Null);
    node.set("next", node.clone()).unwrap();

    let graph = CachedObjectGraph::new();
    let recorder = Recorder::new();
    graph.add_root_object(&node.bean()).unwrap();
    graph
        .add_path_listener("next.next.next.value", recorder.clone())
        .unwrap();
    // node.next and node.value, no matter how often the walk visits them.
    assert_eq!(graph.node_count(), 2);
    assert_eq!(node.listener_count("next"), 1);

    node.set("value", 2).unwrap();
    assert_eq!(recorder.events().len(), 1);

    let listener: Arc<dyn PathListener> = recorder;
    graph
        .remove_path_listener("next.next.next.value", &listener)
        .unwrap();
    assert_eq!(graph.node_count(), 0);
    assert_eq!(node.total_listener_count(), 0);
}

// =============================================================================
// Batching
// =============================================================================

#[test]
fn test_sibling_paths_are_batched() {
    let (root, old_b, _) = chain("x");
    let graph = CachedObjectGraph::new();
    let batches = BatchRecorder::new();
    let single = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b", batches.clone()).unwrap();
    graph.add_path_listener("b.c", batches.clone()).unwrap();
    graph.add_path_listener("b", single.clone()).unwrap();
    graph.add_path_listener("b.c", single.clone()).unwrap();

    let (_, new_b, _) = chain("y");
    root.set("b", new_b.clone()).unwrap();

    let recorded = batches.batches();
    assert_eq!(recorded.len(), 1);
    let (events, same_roots) = &recorded[0];
    assert!(*same_roots);
    let mut paths: Vec<String> = events.iter().map(|e| e.path().to_string()).collect();
    paths.sort();
    assert_eq!(paths, vec!["b".to_string(), "b.c".to_string()]);
    assert!(events
        .iter()
        .any(|e| e.path() == &path("b") && e.old_value() == &Value::from(old_b.clone())));

    // The same mutation, one call per event.
    assert_eq!(single.events().len(), 2);
}

#[test]
fn test_batch_with_different_roots() {
    // first.c -> t, second.c -> u, u.c -> t
    let t = PropertyBag::new("Node");
    t.declare("x", 1);
    t.declare("c", Value::Null);
    let u = PropertyBag::new("Node");
    u.declare("x", 5);
    u.declare("c", t.clone());
    let first = PropertyBag::new("Root");
    first.declare("c", t.clone());
    let second = PropertyBag::new("Root");
    second.declare("c", u.clone());

    let graph = CachedObjectGraph::new();
    let batches = BatchRecorder::new();
    graph.add_root_object(&first.bean()).unwrap();
    graph.add_root_object(&second.bean()).unwrap();
    graph.add_path_listener("c.x", batches.clone()).unwrap();
    graph.add_path_listener("c.c.x", batches.clone()).unwrap();

    // `t.x` is `c.x` for `first` and `c.c.x` for `second`.
    t.set("x", 2).unwrap();
    let recorded = batches.batches();
    assert_eq!(recorded.len(), 1);
    let (events, same_roots) = &recorded[0];
    assert_eq!(events.len(), 2);
    assert!(!*same_roots);
    for event in events {
        let expected = if event.path() == &path("c.x") { &first } else { &second };
        assert_eq!(event.roots(), &[expected.bean()]);
    }

    // One root, one event.
    u.set("x", 6).unwrap();
    let recorded = batches.batches();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[1].0.len(), 1);
    assert!(recorded[1].1);
}

// =============================================================================
// Asynchronous values
// =============================================================================

#[test]
fn test_not_ready_until_loaded() {
    let loader = QueueLoader::new();
    let profile = PropertyBag::with_loader("Profile", loader.clone());
    profile.declare_lazy("bio");
    let root = PropertyBag::new("User");
    root.declare("profile", profile.clone());

    let graph = CachedObjectGraph::builder().asynchronous(true).build();
    assert!(graph.is_asynchronous());
    let recorder = Recorder::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("profile.bio", recorder.clone()).unwrap();

    assert_eq!(loader.pending(), 1);
    assert_eq!(graph.get(&root.bean(), "profile.bio").unwrap(), Value::NotReady);
    assert!(recorder.events().is_empty());

    loader.complete("bio", "hello");

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old_value(), &Value::NotReady);
    assert_eq!(events[0].new_value(), &Value::from("hello"));
    assert_eq!(
        graph.get(&root.bean(), "profile.bio").unwrap(),
        Value::from("hello")
    );
}

#[test]
fn test_blocking_graph_loads_synchronously() {
    let loader = QueueLoader::new();
    let profile = PropertyBag::with_loader("Profile", loader.clone());
    profile.declare_lazy("bio");

    let graph = CachedObjectGraph::new();
    graph.add_root_object(&profile.bean()).unwrap();
    graph.add_path_listener("bio", Recorder::new()).unwrap();

    assert_eq!(loader.pending(), 0);
    assert_eq!(
        graph.get(&profile.bean(), "bio").unwrap(),
        Value::from("loaded bio")
    );
}

// =============================================================================
// Registration errors
// =============================================================================

#[test]
fn test_unknown_property_is_reported_at_registration() {
    let (root, b, c) = chain("x");
    let graph = CachedObjectGraph::new();
    graph.add_root_object(&root.bean()).unwrap();

    let err = graph
        .add_path_listener("b.c.missing", Recorder::new())
        .unwrap_err();
    assert!(matches!(
        err,
        GraphError::UnknownProperty { ref property, .. } if property == "missing"
    ));
    assert_eq!(graph.node_count(), 0);
    assert!(graph.paths().is_empty());
    for bag in [&root, &b, &c] {
        assert_eq!(bag.total_listener_count(), 0);
    }
}

#[test]
fn test_unknown_property_on_new_root_rolls_back() {
    let (root, _, _) = chain("x");
    let bare = PropertyBag::new("Root");
    let graph = CachedObjectGraph::new();
    graph.add_root_object(&root.bean()).unwrap();
    graph.add_path_listener("b.c.someString", Recorder::new()).unwrap();
    let nodes = graph.node_count();

    assert!(graph.add_root_object(&bare.bean()).is_err());
    assert!(!graph.contains_root(&bare.bean()));
    assert_eq!(graph.node_count(), nodes);
}

#[test]
fn test_invalid_path_text() {
    let graph = CachedObjectGraph::new();
    assert!(matches!(
        graph.add_path_listener("b..c", Recorder::new()),
        Err(GraphError::InvalidPath(_))
    ));
}
