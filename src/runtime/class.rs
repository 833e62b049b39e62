//! Classes, modules and their method tables.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::method::MethodEntry;
use super::symbol::Symbol;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

pub struct Class {
    pub id: ClassId,
    pub is_module: bool,
    /// Set for metaclasses: the class they belong to.
    pub attached: Option<ClassId>,
    pub superclass: Option<ClassId>,
    name: RwLock<Option<String>>,
    pub(crate) includes: RwLock<Vec<ClassId>>,
    pub(crate) methods: RwLock<HashMap<Symbol, Arc<MethodEntry>>>,
    pub(crate) constants: RwLock<HashMap<Symbol, Value>>,
    pub(crate) cvars: RwLock<HashMap<Symbol, Value>>,
    pub(crate) ivars: RwLock<HashMap<Symbol, Value>>,
    meta: RwLock<Option<ClassId>>,
}

impl Class {
    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn method(&self, selector: Symbol) -> Option<Arc<MethodEntry>> {
        self.methods.read().get(&selector).cloned()
    }

    pub fn constant(&self, name: Symbol) -> Option<Value> {
        self.constants.read().get(&name).copied()
    }
}

#[derive(Default)]
pub struct ClassTable {
    classes: RwLock<Vec<Arc<Class>>>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: Option<&str>, superclass: Option<ClassId>, is_module: bool) -> ClassId {
        self.push(name.map(str::to_string), superclass, is_module, None)
    }

    fn push(&self, name: Option<String>, superclass: Option<ClassId>, is_module: bool, attached: Option<ClassId>) -> ClassId {
        let mut classes = self.classes.write();
        let id = ClassId(classes.len() as u32);
        classes.push(Arc::new(Class {
            id,
            is_module,
            attached,
            superclass,
            name: RwLock::new(name),
            includes: RwLock::new(Vec::new()),
            methods: RwLock::new(HashMap::new()),
            constants: RwLock::new(HashMap::new()),
            cvars: RwLock::new(HashMap::new()),
            ivars: RwLock::new(HashMap::new()),
            meta: RwLock::new(None),
        }));
        id
    }

    /// Panics only on ids this table never handed out.
    pub fn get(&self, id: ClassId) -> Arc<Class> {
        self.classes.read()[id.0 as usize].clone()
    }

    pub fn try_get(&self, id: ClassId) -> Option<Arc<Class>> {
        self.classes.read().get(id.0 as usize).cloned()
    }

    pub fn name(&self, id: ClassId) -> String {
        let class = self.get(id);
        if let Some(name) = class.name() {
            return name;
        }
        match class.attached {
            Some(owner) => format!("#<Class:{}>", self.name(owner)),
            None => format!("#<{}:{:#x}>", if class.is_module { "Module" } else { "Class" }, id.0),
        }
    }

    /// Name anonymous classes on first constant assignment.
    pub fn set_name_if_anonymous(&self, id: ClassId, name: String) {
        let class = self.get(id);
        let mut slot = class.name.write();
        if slot.is_none() {
            *slot = Some(name);
        }
    }

    /// Metaclass of a class or module, created on demand.
    ///
    /// The metaclass of `C` inherits from the metaclass of `C`'s superclass, so
    /// class methods are inherited. Roots fall back to `root` (`Class` for
    /// classes, `Module` for modules).
    pub fn metaclass(&self, id: ClassId, class_root: ClassId, module_root: ClassId) -> ClassId {
        let class = self.get(id);
        if let Some(meta) = *class.meta.read() {
            return meta;
        }
        let superclass = match (class.attached, class.superclass) {
            (Some(_), _) => class_root,
            (None, Some(sup)) => self.metaclass(sup, class_root, module_root),
            (None, None) if class.is_module => module_root,
            (None, None) => class_root,
        };
        let mut slot = class.meta.write();
        if let Some(meta) = *slot {
            return meta;
        }
        let meta = self.push(None, Some(superclass), false, Some(id));
        *slot = Some(meta);
        meta
    }

    /// Whether a metaclass already exists (used to avoid creating one just to
    /// answer a lookup).
    pub fn existing_metaclass(&self, id: ClassId) -> Option<ClassId> {
        *self.get(id).meta.read()
    }

    /// Method resolution order: each class, then the modules it includes (most
    /// recent first, with their own includes), then the superclass.
    pub fn ancestors(&self, id: ClassId) -> Vec<ClassId> {
        let mut out = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            self.push_with_includes(c, &mut out);
            cur = self.get(c).superclass;
        }
        out
    }

    fn push_with_includes(&self, id: ClassId, out: &mut Vec<ClassId>) {
        if out.contains(&id) {
            return;
        }
        out.push(id);
        let includes = self.get(id).includes.read().clone();
        for m in includes.into_iter().rev() {
            self.push_with_includes(m, out);
        }
    }

    pub fn include(&self, target: ClassId, module: ClassId) -> bool {
        if self.ancestors(target).contains(&module) {
            return false;
        }
        self.get(target).includes.write().push(module);
        true
    }

    pub fn is_subclass(&self, id: ClassId, ancestor: ClassId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    /// First definition of `selector` along the ancestor chain.
    pub fn lookup(&self, id: ClassId, selector: Symbol) -> Option<Arc<MethodEntry>> {
        self.ancestors(id).into_iter().find_map(|c| self.get(c).method(selector))
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_put_modules_after_their_includer() {
        let t = ClassTable::new();
        let object = t.define(Some("Object"), None, false);
        let kernel = t.define(Some("Kernel"), None, true);
        t.include(object, kernel);
        let m = t.define(Some("M"), None, true);
        let n = t.define(Some("N"), None, true);
        let a = t.define(Some("A"), Some(object), false);
        t.include(a, m);
        t.include(a, n);
        assert_eq!(t.ancestors(a), vec![a, n, m, object, kernel]);
    }

    #[test]
    fn including_twice_is_a_no_op() {
        let t = ClassTable::new();
        let a = t.define(Some("A"), None, false);
        let m = t.define(Some("M"), None, true);
        assert!(t.include(a, m));
        assert!(!t.include(a, m));
        assert_eq!(t.ancestors(a), vec![a, m]);
    }

    #[test]
    fn metaclass_chain_follows_superclasses() {
        let t = ClassTable::new();
        let object = t.define(Some("Object"), None, false);
        let module = t.define(Some("Module"), Some(object), false);
        let class = t.define(Some("Class"), Some(module), false);
        let a = t.define(Some("A"), Some(object), false);
        let meta_a = t.metaclass(a, class, module);
        let meta_object = t.metaclass(object, class, module);
        assert_eq!(t.get(meta_a).superclass, Some(meta_object));
        assert_eq!(t.get(meta_object).superclass, Some(class));
        assert_eq!(t.metaclass(a, class, module), meta_a);
        assert_eq!(t.name(meta_a), "#<Class:A>");
    }
}
