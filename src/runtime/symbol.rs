use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Interned name. Selectors, ivar names and constant names are all symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub u32);

#[derive(Default)]
pub struct SymbolTable {
    inner: RwLock<Interner>,
}

#[derive(Default)]
struct Interner {
    ids: HashMap<Arc<str>, u32>,
    names: Vec<Arc<str>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(&id) = self.inner.read().ids.get(name) {
            return Symbol(id);
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.ids.get(name) {
            return Symbol(id);
        }
        let id = inner.names.len() as u32;
        let name: Arc<str> = Arc::from(name);
        inner.names.push(name.clone());
        inner.ids.insert(name, id);
        Symbol(id)
    }

    pub fn name(&self, sym: Symbol) -> Arc<str> {
        self.inner
            .read()
            .names
            .get(sym.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from("?"))
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.inner.read().ids.get(name).map(|&id| Symbol(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let t = SymbolTable::new();
        let a = t.intern("foo");
        let b = t.intern("bar");
        assert_ne!(a, b);
        assert_eq!(t.intern("foo"), a);
        assert_eq!(&*t.name(b), "bar");
        assert_eq!(t.lookup("baz"), None);
    }
}
