//! The formula manager: symbol mappings plus an ordered list of formulas.

use super::definition::{Formula, FormulaId};
use super::symbols::SymbolMappings;
use crate::path::BeanPath;

/// Owns the symbol mappings and the formulas of one graph.
///
/// Cloning (or [`initialise_from`](FormulaManager::initialise_from)) gives a
/// deep, independent copy, which is how editing sessions are isolated from
/// the live manager.
#[derive(Debug, Clone, Default)]
pub struct FormulaManager {
    symbols: SymbolMappings,
    formulas: Vec<Formula>,
}

impl FormulaManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a formula, append it, and return a handle to it.
    pub fn create_formula(
        &mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
    ) -> &mut Formula {
        self.add_formula(Formula::new(name, expression))
    }

    /// Append a formula.
    pub fn add_formula(&mut self, formula: Formula) -> &mut Formula {
        self.formulas.push(formula);
        let last = self.formulas.len() - 1;
        &mut self.formulas[last]
    }

    /// Remove and return the formula at `index`.
    pub fn remove_formula_at(&mut self, index: usize) -> Option<Formula> {
        (index < self.formulas.len()).then(|| self.formulas.remove(index))
    }

    /// All formulas, in order.
    pub fn formulas(&self) -> &[Formula] {
        &self.formulas
    }

    /// The formula with `id`.
    pub fn formula(&self, id: FormulaId) -> Option<&Formula> {
        self.formulas.iter().find(|f| f.id() == id)
    }

    /// Mutable access to the formula with `id`.
    pub fn formula_mut(&mut self, id: FormulaId) -> Option<&mut Formula> {
        self.formulas.iter_mut().find(|f| f.id() == id)
    }

    /// The first formula named `name`.
    pub fn formula_by_name(&self, name: &str) -> Option<&Formula> {
        self.formulas.iter().find(|f| f.name() == name)
    }

    /// Mutable access to the first formula named `name`.
    pub fn formula_by_name_mut(&mut self, name: &str) -> Option<&mut Formula> {
        self.formulas.iter_mut().find(|f| f.name() == name)
    }

    /// The symbol mappings.
    pub fn symbols(&self) -> &SymbolMappings {
        &self.symbols
    }

    /// Mutable access to the symbol mappings.
    pub fn symbols_mut(&mut self) -> &mut SymbolMappings {
        &mut self.symbols
    }

    /// Replace this manager's content with a deep copy of `other`'s.
    pub fn initialise_from(&mut self, other: &FormulaManager) {
        self.symbols = other.symbols.clone();
        self.formulas = other.formulas.iter().map(Formula::snapshot).collect();
    }

    /// The parsed path bound to `symbol`, if it is mapped to a valid path.
    pub fn path_for_symbol(&self, symbol: &str) -> Option<BeanPath> {
        self.symbols
            .bean_path_for_symbol(symbol)
            .and_then(|path| BeanPath::parse(path).ok())
    }

    /// Problems that prevent the enabled formulas from being computed, or
    /// `None` if there are none.
    ///
    /// Formulas may not depend on formulas: a symbol bound to a formula
    /// pseudo-path is rejected.
    pub fn validate(&self) -> Option<Vec<String>> {
        let mut problems = self.symbols.validate().unwrap_or_default();

        for (index, formula) in self.formulas.iter().enumerate() {
            if !formula.is_enabled() {
                continue;
            }
            let label = if formula.name().trim().is_empty() {
                problems.push(format!("formula #{} has no name", index + 1));
                format!("formula #{}", index + 1)
            } else {
                format!("formula '{}'", formula.name())
            };

            if let Some(err) = formula.parse_error() {
                problems.push(format!("{label}: {err}"));
                continue;
            }
            if formula.symbols().is_empty() {
                problems.push(format!("{label} does not reference any symbol"));
            }
            for symbol in formula.symbols() {
                match self.symbols.bean_path_for_symbol(symbol) {
                    None => problems.push(format!("{label} uses undefined symbol '{symbol}'")),
                    Some(path) => match BeanPath::parse(path) {
                        Ok(path) if path.is_formula() => problems.push(format!(
                            "{label} depends on symbol '{symbol}', which is bound to formula '{}'",
                            path.formula_name().unwrap_or_default()
                        )),
                        Ok(_) => {}
                        Err(_) => problems.push(format!(
                            "{label} uses symbol '{symbol}' with invalid path '{path}'"
                        )),
                    },
                }
            }

            let duplicate = self.formulas[..index]
                .iter()
                .any(|other| other.is_enabled() && other.name() == formula.name());
            if duplicate && !formula.name().trim().is_empty() {
                problems.push(format!("{label} is defined more than once"));
            }
        }

        (!problems.is_empty()).then_some(problems)
    }
}
