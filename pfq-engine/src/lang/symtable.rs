//! Symbol registry for functional primitives.
//!
//! Submissions name primitives by `(kind, symbol)`; the table resolves
//! them to an evaluation payload, a declared argument signature and the
//! optional init/fini lifecycle hooks. Extension modules can register
//! additional symbols before the engine starts.

use std::collections::HashMap;

use crate::error::{PfqError, Result};
use crate::lang::args::ArgSig;
use crate::lang::{FiniFn, InitFn, NodeFun};

/// Primitive categories. Which categories a descriptor kind may resolve
/// into is fixed: monadic descriptors reach the packet-transforming
/// categories, the other kinds map one-to-one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Filter,
    Bloom,
    Vlan,
    Forward,
    Steering,
    Predicate,
    Combinator,
    Property,
    HighOrder,
    Misc,
}

impl Category {
    /// Whether symbols of this category evaluate as chain (monadic or
    /// high-order) nodes.
    pub fn is_functional(&self) -> bool {
        !matches!(
            self,
            Category::Predicate | Category::Combinator | Category::Property
        )
    }
}

/// One registered primitive.
pub struct SymbolEntry {
    pub symbol: &'static str,
    pub category: Category,
    pub fun: NodeFun,
    pub signature: &'static [ArgSig],
    pub init: Option<InitFn>,
    pub fini: Option<FiniFn>,
}

/// The engine-wide symbol table.
pub struct SymbolTable {
    entries: HashMap<&'static str, SymbolEntry>,
}

impl SymbolTable {
    pub fn empty() -> Self {
        SymbolTable {
            entries: HashMap::new(),
        }
    }

    /// Table pre-loaded with the built-in primitives.
    pub fn with_defaults() -> Self {
        let mut table = SymbolTable::empty();
        table
            .register(crate::lang::primitives::default_symbols())
            .expect("built-in symbols are unique");
        table
    }

    /// Register additional primitives (extension modules). Fails with
    /// `AlreadyExists` on a symbol collision, leaving the table unchanged.
    pub fn register(&mut self, entries: Vec<SymbolEntry>) -> Result<()> {
        for entry in &entries {
            if self.entries.contains_key(entry.symbol) {
                return Err(PfqError::AlreadyExists);
            }
        }
        for entry in entries {
            self.entries.insert(entry.symbol, entry);
        }
        Ok(())
    }

    pub fn lookup(&self, symbol: &str) -> Option<&SymbolEntry> {
        self.entries.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All symbols of a category, sorted (diagnostics, `pfqd` listing).
    pub fn symbols_of(&self, category: Category) -> Vec<&'static str> {
        let mut out: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.category == category)
            .map(|e| e.symbol)
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_category() {
        let table = SymbolTable::with_defaults();
        for category in [
            Category::Filter,
            Category::Bloom,
            Category::Vlan,
            Category::Forward,
            Category::Steering,
            Category::Predicate,
            Category::Combinator,
            Category::Property,
            Category::HighOrder,
            Category::Misc,
        ] {
            assert!(
                !table.symbols_of(category).is_empty(),
                "category {:?} has no primitives",
                category
            );
        }
    }

    #[test]
    fn lookup_known_symbols() {
        let table = SymbolTable::with_defaults();
        for sym in ["steer_flow", "steer_ip", "drop", "is_ip", "or", "when"] {
            assert!(table.lookup(sym).is_some(), "missing symbol {}", sym);
        }
        assert!(table.lookup("no_such_symbol").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut table = SymbolTable::with_defaults();
        let dup = crate::lang::primitives::default_symbols()
            .into_iter()
            .filter(|e| e.symbol == "drop")
            .collect();
        assert_eq!(table.register(dup).unwrap_err(), PfqError::AlreadyExists);
    }
}
