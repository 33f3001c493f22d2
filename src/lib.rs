#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod config;
mod error;
mod event;
pub mod formula;
mod graph;
mod observable;
mod path;
mod reference;
pub mod tracer;
mod value;

pub use config::{
    FormulaConfig, GraphConfig, ENV_DRAIN_INTERVAL_MS, ENV_FORMULAS_ENABLED, ENV_WORKER_THREADS,
};
pub use error::{FormulaError, GraphError};
pub use event::{all_affect_same_roots, Delivery, PathChangeEvent, PathListener};
pub use formula::{
    DirtyRoot, Formula, FormulaEnabledGraph, FormulaId, FormulaManager, SymbolMapping,
    SymbolMappings, UpdatedSymbolCache,
};
pub use graph::{CachedObjectGraph, CachedObjectGraphBuilder};
pub use observable::{
    LoadRequest, Observable, PropertyBag, PropertyChange, PropertyChangeSupport, PropertyListener,
    PropertyLoader, ReadMode,
};
pub use path::{BeanPath, IntoPath, FORMULA_PATH_MARKER};
pub use tracer::{EvaluationResult, NoopTracer, SpanId, Tracer};
pub use value::{BeanRef, ObjectId, Value, WeakBean};
