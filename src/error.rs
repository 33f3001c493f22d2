//! Error types for path registration, lookup, and formula handling.

use thiserror::Error;

use crate::path::BeanPath;

/// Errors reported synchronously by the object graph.
///
/// Everything here is a configuration problem raised at registration or
/// lookup time. A value that is still loading is not an error; it is reported
/// as [`Value::NotReady`](crate::Value::NotReady).
#[derive(Debug, Error)]
pub enum GraphError {
    /// A path segment names a property the runtime object does not have.
    #[error("unknown property '{property}' on {bean_type}")]
    UnknownProperty {
        /// Type name reported by the object.
        bean_type: String,
        /// The property that was requested.
        property: String,
    },

    /// An intermediate path segment resolved to a scalar, so the rest of the
    /// path cannot be traversed.
    #[error("'{segment}' in path '{path}' does not refer to an object")]
    NotAnObject {
        /// The path being resolved.
        path: BeanPath,
        /// The segment whose value is not an object.
        segment: String,
    },

    /// The path string is malformed (empty, or containing empty segments).
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// A formula pseudo-path names a formula the manager does not know.
    #[error("no formula named '{0}'")]
    UnknownFormula(String),

    /// Formula support is switched off in the configuration.
    #[error("formulas are disabled")]
    FormulasDisabled,

    /// The graph has been disposed.
    #[error("graph has been disposed")]
    Disposed,

    /// A formula-level error surfaced through the graph.
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

/// Errors raised while parsing, binding, or evaluating formulas.
#[derive(Debug, Error)]
pub enum FormulaError {
    /// The expression text could not be parsed.
    #[error("cannot parse '{expression}' at offset {offset}: {message}")]
    Parse {
        /// The full expression text.
        expression: String,
        /// Byte offset of the failure.
        offset: usize,
        /// Human-readable description.
        message: String,
    },

    /// Evaluation met a symbol with no bound value.
    #[error("symbol '{0}' has no value")]
    UnboundSymbol(String),

    /// Evaluation failed (type mismatch, overflow, division by zero, ...).
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// A formula input is bound to another formula's pseudo-path.
    #[error("formula '{formula}' cannot depend on symbol '{symbol}': it is bound to a formula")]
    FormulaDependency {
        /// The dependent formula.
        formula: String,
        /// The offending symbol.
        symbol: String,
    },

    /// A symbol name is already in use.
    #[error("symbol '{0}' is already defined")]
    DuplicateSymbol(String),

    /// The background worker pool could not be started.
    #[error("cannot start formula scheduler: {0}")]
    Scheduler(#[from] std::io::Error),
}

impl FormulaError {
    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        FormulaError::Evaluation(message.into())
    }
}
