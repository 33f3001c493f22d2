//! Derived values computed from symbols bound to paths.
//!
//! A [`FormulaManager`] owns the [`SymbolMappings`] and the [`Formula`]s. A
//! [`FormulaEnabledGraph`] serves each formula under the pseudo-path
//! `$formula.<name>` and recomputes it lazily, in drains, when its inputs
//! change.

mod cache;
mod definition;
mod expr;
mod graph;
mod manager;
#[cfg(feature = "background-drain")]
mod scheduler;
mod symbols;

pub use cache::{DirtyRoot, UpdatedSymbolCache};
pub use definition::{Formula, FormulaId};
pub use expr::{BinOp, Expr, Function, ParseError, UnaryOp};
pub use graph::FormulaEnabledGraph;
pub use manager::FormulaManager;
pub use symbols::{SymbolMapping, SymbolMappings};
