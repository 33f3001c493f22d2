//! Symbol mappings: short names bound to bean paths.

use serde::{Deserialize, Serialize};

use crate::error::FormulaError;

/// One symbol and the path it stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMapping {
    /// The symbol name used in expressions.
    pub symbol: String,
    /// Dotted path string; empty until configured.
    pub path: String,
}

/// Ordered list of symbol mappings.
///
/// Several symbols may point at the same path. Symbol names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolMappings {
    mappings: Vec<SymbolMapping>,
}

impl SymbolMappings {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mapping for `path` under the next free generated name, or
    /// with an empty path when `path` is `None`. Returns the symbol name.
    ///
    /// Generated names run `a`..`z`, `a1`..`z1`, `a2`.., skipping names in use.
    pub fn add_symbol_mapping(&mut self, path: Option<&str>) -> String {
        let symbol = self.next_free_symbol();
        self.mappings.push(SymbolMapping {
            symbol: symbol.clone(),
            path: path.unwrap_or_default().to_string(),
        });
        symbol
    }

    /// Append a mapping with an explicit symbol name.
    pub fn add_named(&mut self, symbol: &str, path: &str) -> Result<(), FormulaError> {
        if self.index_of(symbol).is_some() {
            return Err(FormulaError::DuplicateSymbol(symbol.to_string()));
        }
        self.mappings.push(SymbolMapping {
            symbol: symbol.to_string(),
            path: path.to_string(),
        });
        Ok(())
    }

    /// Remove and return the mapping at `index`.
    pub fn remove_symbol_at(&mut self, index: usize) -> Option<SymbolMapping> {
        (index < self.mappings.len()).then(|| self.mappings.remove(index))
    }

    /// Rebind the mapping at `index` to `path`. Returns false if there is no
    /// such mapping.
    pub fn set_path_at(&mut self, index: usize, path: &str) -> bool {
        match self.mappings.get_mut(index) {
            Some(mapping) => {
                mapping.path = path.to_string();
                true
            }
            None => false,
        }
    }

    /// The path bound to `symbol`.
    pub fn bean_path_for_symbol(&self, symbol: &str) -> Option<&str> {
        self.mappings
            .iter()
            .find(|m| m.symbol == symbol)
            .map(|m| m.path.as_str())
    }

    /// The first symbol bound to `path`.
    pub fn symbol_for_bean_path<'a>(&'a self, path: &'a str) -> Option<&'a str> {
        self.symbols_for_bean_path(path).next()
    }

    /// Every symbol bound to `path`, in list order.
    pub fn symbols_for_bean_path<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.mappings
            .iter()
            .filter(move |m| m.path == path)
            .map(|m| m.symbol.as_str())
    }

    /// Problems with the mappings, or `None` if they are consistent.
    pub fn validate(&self) -> Option<Vec<String>> {
        let mut problems = Vec::new();
        for (index, mapping) in self.mappings.iter().enumerate() {
            if mapping.symbol.trim().is_empty() {
                problems.push(format!("symbol #{} has no name", index + 1));
            }
            if mapping.path.trim().is_empty() {
                problems.push(format!("symbol '{}' has no path", mapping.symbol));
            }
            if self.mappings[..index].iter().any(|m| m.symbol == mapping.symbol) {
                problems.push(format!("symbol '{}' is defined more than once", mapping.symbol));
            }
        }
        (!problems.is_empty()).then_some(problems)
    }

    /// Iterate over the mappings.
    pub fn iter(&self) -> impl Iterator<Item = &SymbolMapping> {
        self.mappings.iter()
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Returns true if there are no mappings.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// The mapping at `index`.
    pub fn get(&self, index: usize) -> Option<&SymbolMapping> {
        self.mappings.get(index)
    }

    fn index_of(&self, symbol: &str) -> Option<usize> {
        self.mappings.iter().position(|m| m.symbol == symbol)
    }

    fn next_free_symbol(&self) -> String {
        (0usize..)
            .flat_map(|round| {
                ('a'..='z').map(move |letter| match round {
                    0 => letter.to_string(),
                    n => format!("{letter}{n}"),
                })
            })
            .find(|candidate| self.index_of(candidate).is_none())
            .unwrap_or_default()
    }
}
