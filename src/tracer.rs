//! Tracer trait for observing graph and formula activity.
//!
//! This module defines the [`Tracer`] trait and related types. The default
//! [`NoopTracer`] costs nothing when tracing is not needed.
//!
//! # Example
//!
//! ```
//! use path_flow::{CachedObjectGraph, SpanId, Tracer};
//! use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
//!
//! struct BatchCounter {
//!     next: AtomicU64,
//!     batches: AtomicUsize,
//! }
//!
//! impl Tracer for BatchCounter {
//!     fn new_span_id(&self) -> SpanId {
//!         SpanId(self.next.fetch_add(1, Ordering::Relaxed))
//!     }
//!
//!     fn on_batch_end(&self, _span_id: SpanId, _events: usize) {
//!         self.batches.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let graph = CachedObjectGraph::builder()
//!     .tracer(BatchCounter { next: AtomicU64::new(1), batches: AtomicUsize::new(0) })
//!     .build();
//! # let _ = graph;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::formula::FormulaId;
use crate::value::ObjectId;

/// Unique identifier for one originating mutation or one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u64);

/// Outcome of one formula evaluation for one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationResult {
    /// The result differs from the cached one and was published.
    Changed,
    /// The result equals the cached one; nothing was published.
    Unchanged,
    /// An input was not ready; the formula was marked not ready.
    Deferred,
    /// Evaluation failed and was skipped for this cycle.
    Error {
        /// The failure, with its context chain.
        message: String,
    },
}

/// Tracer trait for observing path-flow execution.
///
/// All methods except [`new_span_id`](Tracer::new_span_id) have empty default
/// implementations, so only the events of interest need overriding.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: formula drains call the tracer from
/// a worker thread.
pub trait Tracer: Send + Sync + 'static {
    /// Generate a new unique span ID.
    fn new_span_id(&self) -> SpanId;

    /// Called when a property change starts being processed.
    #[inline]
    fn on_batch_start(&self, _span_id: SpanId, _source: ObjectId, _property: &str) {}

    /// Called after a property change has been processed and `events` path
    /// events were dispatched.
    #[inline]
    fn on_batch_end(&self, _span_id: SpanId, _events: usize) {}

    /// Called when a reference-graph node starts observing `(object, property)`.
    #[inline]
    fn on_node_created(&self, _object: ObjectId, _property: &str) {}

    /// Called when a reference-graph node stops observing `(object, property)`.
    #[inline]
    fn on_node_removed(&self, _object: ObjectId, _property: &str) {}

    /// Called at the start of a drain with the number of dirty roots taken.
    #[inline]
    fn on_drain(&self, _span_id: SpanId, _dirty_roots: usize) {}

    /// Called after a formula has been evaluated for a root.
    #[inline]
    fn on_formula_evaluated(
        &self,
        _span_id: SpanId,
        _formula: FormulaId,
        _root: ObjectId,
        _result: EvaluationResult,
    ) {
    }
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`CachedObjectGraph`](crate::CachedObjectGraph).
pub struct NoopTracer;

/// Global span counter for NoopTracer.
static NOOP_SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

impl Tracer for NoopTracer {
    #[inline(always)]
    fn new_span_id(&self) -> SpanId {
        SpanId(NOOP_SPAN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
