//! The VM-global interned symbol table
//!
//! Every identifier used as a field, method, variable or import name is
//! interned here once; its position is its stable symbol id. Class, module
//! and instance symbol storage is indexed by these ids directly, so method
//! dispatch is an array index, never a string compare.

use rustc_hash::FxHashMap;

/// Stable id of an interned name; indexes per-class/per-module symbol arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SymbolId(pub u32);

impl SymbolId {
    /// The id as a plain index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only interned name table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<Box<str>>,
    index: FxHashMap<Box<str>, u32>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or insert a name; returns its stable id.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.index.get(name) {
            return SymbolId(id);
        }
        let id = self.names.len() as u32;
        self.names.push(name.into());
        self.index.insert(name.into(), id);
        SymbolId(id)
    }

    /// Look up a name without inserting.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.index.get(name).map(|&id| SymbolId(id))
    }

    /// The interned spelling of `id`.
    pub fn name(&self, id: SymbolId) -> &str {
        &self.names[id.index()]
    }

    /// Number of interned names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut table = SymbolTable::new();
        let a = table.intern("alpha");
        let b = table.intern("beta");
        let a2 = table.intern("alpha");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(table.name(a), "alpha");
        assert_eq!(table.name(b), "beta");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut table = SymbolTable::new();
        assert_eq!(table.intern("x"), SymbolId(0));
        assert_eq!(table.intern("y"), SymbolId(1));
        assert_eq!(table.lookup("x"), Some(SymbolId(0)));
        assert_eq!(table.lookup("z"), None);
    }
}
