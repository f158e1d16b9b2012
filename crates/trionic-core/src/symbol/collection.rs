//! Ordered, indexed symbol collection

use std::collections::HashMap;

use parking_lot::RwLock;

use super::Symbol;

#[derive(Debug, Default)]
struct Inner {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, usize>,
    by_number: HashMap<i32, usize>,
}

impl Inner {
    fn push(&mut self, symbol: Symbol) {
        let idx = self.symbols.len();
        self.by_name.insert(symbol.name.clone(), idx);
        self.by_number.insert(symbol.number, idx);
        self.symbols.push(symbol);
    }
}

/// Symbols in insertion order with name and number indexes.
///
/// Lookups hand out clones so callers never hold the lock across an await.
#[derive(Debug, Default)]
pub struct SymbolCollection {
    inner: RwLock<Inner>,
}

impl SymbolCollection {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        let mut inner = Inner::default();
        for s in symbols {
            inner.push(s);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    pub fn add(&self, symbols: impl IntoIterator<Item = Symbol>) {
        let mut inner = self.inner.write();
        for s in symbols {
            inner.push(s);
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Symbol> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .and_then(|idx| inner.symbols.get(*idx))
            .cloned()
    }

    pub fn get_by_number(&self, number: i32) -> Option<Symbol> {
        let inner = self.inner.read();
        inner
            .by_number
            .get(&number)
            .and_then(|idx| inner.symbols.get(*idx))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().by_name.contains_key(name)
    }

    /// Snapshot of all symbols in insertion order
    pub fn symbols(&self) -> Vec<Symbol> {
        self.inner.read().symbols.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .symbols
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for SymbolCollection {
    fn clone(&self) -> Self {
        Self::new(self.symbols())
    }
}

impl FromIterator<Symbol> for SymbolCollection {
    fn from_iter<I: IntoIterator<Item = Symbol>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
