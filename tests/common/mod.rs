//! Listeners, loaders and tracers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use path_flow::{
    Delivery, EvaluationResult, FormulaId, LoadRequest, ObjectId, PathChangeEvent, PathListener,
    PropertyLoader, SpanId, Tracer, Value,
};

/// Records every event, one `graph_changed` call at a time.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<PathChangeEvent>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PathChangeEvent> {
        self.events.lock().clone()
    }

    pub fn new_values(&self) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .map(|e| e.new_value().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl PathListener for Recorder {
    fn graph_changed(&self, event: &PathChangeEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Records one entry per batch.
#[derive(Default)]
pub struct BatchRecorder {
    batches: Mutex<Vec<(Vec<PathChangeEvent>, bool)>>,
}

impl BatchRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<(Vec<PathChangeEvent>, bool)> {
        self.batches.lock().clone()
    }
}

impl PathListener for BatchRecorder {
    fn multiple_change(&self, events: &[PathChangeEvent], all_affect_same_roots: bool) {
        self.batches
            .lock()
            .push((events.to_vec(), all_affect_same_roots));
    }

    fn delivery(&self) -> Delivery {
        Delivery::Batched
    }
}

/// Holds asynchronous load requests until the test completes them.
#[derive(Default)]
pub struct QueueLoader {
    requests: Mutex<Vec<LoadRequest>>,
}

impl QueueLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.requests.lock().len()
    }

    /// Complete every pending request of `property` with `value`.
    pub fn complete(&self, property: &str, value: impl Into<Value>) {
        let value = value.into();
        let ready: Vec<LoadRequest> = {
            let mut requests = self.requests.lock();
            let (ready, waiting) = requests
                .drain(..)
                .partition(|r: &LoadRequest| r.property() == property);
            *requests = waiting;
            ready
        };
        for request in ready {
            request.complete(value.clone());
        }
    }
}

impl PropertyLoader for QueueLoader {
    fn load(&self, _bean_type: &str, property: &str) -> Value {
        Value::from(format!("loaded {property}"))
    }

    fn request(&self, request: LoadRequest) {
        self.requests.lock().push(request);
    }
}

/// Counts graph and formula activity.
#[derive(Default)]
pub struct CountingTracer {
    next_span: AtomicU64,
    pub batches: AtomicUsize,
    pub nodes_created: AtomicUsize,
    pub nodes_removed: AtomicUsize,
    pub drains: AtomicUsize,
    evaluations: Mutex<Vec<(FormulaId, ObjectId, EvaluationResult)>>,
}

impl CountingTracer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn evaluations(&self) -> Vec<(FormulaId, ObjectId, EvaluationResult)> {
        self.evaluations.lock().clone()
    }

    pub fn evaluation_count(&self, formula: FormulaId) -> usize {
        self.evaluations
            .lock()
            .iter()
            .filter(|(id, _, _)| *id == formula)
            .count()
    }
}

impl Tracer for CountingTracer {
    fn new_span_id(&self) -> SpanId {
        SpanId(self.next_span.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn on_batch_end(&self, _span_id: SpanId, _events: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn on_node_created(&self, _object: ObjectId, _property: &str) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }

    fn on_node_removed(&self, _object: ObjectId, _property: &str) {
        self.nodes_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_drain(&self, _span_id: SpanId, _dirty_roots: usize) {
        self.drains.fetch_add(1, Ordering::Relaxed);
    }

    fn on_formula_evaluated(
        &self,
        _span_id: SpanId,
        formula: FormulaId,
        root: ObjectId,
        result: EvaluationResult,
    ) {
        self.evaluations.lock().push((formula, root, result));
    }
}
