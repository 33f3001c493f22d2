//! A single named formula.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::expr::{Expr, ParseError};
use crate::error::FormulaError;
use crate::path::BeanPath;
use crate::value::Value;

/// Stable identity of a formula, kept across renames and edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormulaId(pub u64);

impl fmt::Display for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "formula#{}", self.0)
    }
}

static NEXT_FORMULA_ID: AtomicU64 = AtomicU64::new(1);

/// A named expression over symbols.
///
/// The expression is parsed on every [`set_expression`](Formula::set_expression);
/// a parse failure is kept and reported by validation and evaluation, so an
/// editor can hold an incomplete expression.
#[derive(Debug, Clone)]
pub struct Formula {
    id: FormulaId,
    name: String,
    expression: String,
    enabled: bool,
    parsed: Result<Expr, ParseError>,
    symbols: Vec<String>,
    bindings: HashMap<String, Value>,
}

impl Formula {
    /// Create a disabled formula with a fresh id.
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        let mut formula = Self {
            id: FormulaId(NEXT_FORMULA_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            expression: String::new(),
            enabled: false,
            parsed: Ok(Expr::Literal(Value::Null)),
            symbols: Vec::new(),
            bindings: HashMap::new(),
        };
        formula.set_expression(expression);
        formula
    }

    /// The formula's identity.
    pub fn id(&self) -> FormulaId {
        self.id
    }

    /// Display name; also the last segment of its pseudo-path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The expression text.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Replace the expression text and re-derive the symbol list.
    pub fn set_expression(&mut self, expression: impl Into<String>) {
        self.expression = expression.into();
        self.parsed = Expr::parse(&self.expression);
        self.symbols = match &self.parsed {
            Ok(expr) => expr.symbols(),
            Err(_) => Vec::new(),
        };
        self.bindings.clear();
    }

    /// Returns true if some listener displays this formula.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Symbols the expression references, in order of first appearance.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Returns true if the expression references `symbol`.
    pub fn depends_on(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    /// The parse failure, if the expression does not parse.
    pub fn parse_error(&self) -> Option<FormulaError> {
        self.parsed
            .as_ref()
            .err()
            .map(|err| err.clone().into_formula_error(&self.expression))
    }

    /// The pseudo-path under which results are published.
    pub fn path(&self) -> BeanPath {
        BeanPath::formula(&self.name)
    }

    /// An independent copy with no bound values, for evaluation off the
    /// editing thread.
    pub fn snapshot(&self) -> Formula {
        Formula {
            bindings: HashMap::new(),
            ..self.clone()
        }
    }

    /// Bind a value to a symbol for the next evaluation.
    pub fn bind(&mut self, symbol: &str, value: Value) {
        self.bindings.insert(symbol.to_string(), value);
    }

    /// Evaluate with the bound values.
    ///
    /// Every referenced symbol must be bound. The result is `NotReady` if any
    /// bound value is.
    pub fn evaluate(&self) -> Result<Value, FormulaError> {
        let expr = match &self.parsed {
            Ok(expr) => expr,
            Err(err) => return Err(err.clone().into_formula_error(&self.expression)),
        };
        for symbol in &self.symbols {
            match self.bindings.get(symbol) {
                Some(Value::NotReady) => return Ok(Value::NotReady),
                Some(_) => {}
                None => return Err(FormulaError::UnboundSymbol(symbol.clone())),
            }
        }
        expr.evaluate(&|name| self.bindings.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Formula::new("a", "1");
        let b = Formula::new("b", "1");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.snapshot().id(), a.id());
    }

    #[test]
    fn test_set_expression_rederives_symbols() {
        let mut formula = Formula::new("total", "price * qty");
        assert_eq!(formula.symbols(), ["price", "qty"]);
        assert!(formula.parse_error().is_none());

        formula.set_expression("price *");
        assert!(formula.symbols().is_empty());
        assert!(matches!(formula.parse_error(), Some(FormulaError::Parse { .. })));
        assert!(formula.evaluate().is_err());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut live = Formula::new("f", "x + 1");
        let mut copy = live.snapshot();
        copy.bind("x", Value::from(2));
        live.set_expression("x + 100");

        assert_eq!(copy.evaluate().unwrap(), Value::from(3));
        assert!(matches!(live.evaluate(), Err(FormulaError::UnboundSymbol(_))));
    }

    #[test]
    fn test_not_ready_input() {
        let mut formula = Formula::new("f", "if(flag, x, 0)");
        formula.bind("flag", Value::Bool(false));
        formula.bind("x", Value::NotReady);
        assert_eq!(formula.evaluate().unwrap(), Value::NotReady);
    }

    #[test]
    fn test_path() {
        let formula = Formula::new("margin", "1");
        assert_eq!(formula.path().to_string(), "$formula.margin");
    }
}
