//! Object storage.
//!
//! Objects live in one append-only table and are addressed by index. There is
//! no collector: reclaiming memory is outside what this runtime models.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::block::Proc;
use super::class::ClassId;
use super::symbol::Symbol;
use super::thread::{RubyMutex, ThreadHandle};
use crate::value::Value;

pub struct Object {
    pub class: ClassId,
    ivars: Mutex<Vec<(Symbol, Value)>>,
    pub data: Data,
}

pub enum Data {
    Plain,
    Str(Mutex<String>),
    Float(f64),
    /// Integers outside the fixnum range.
    BigInt(i128),
    Array(Mutex<Vec<Value>>),
    Proc(Proc),
    Thread(Arc<ThreadHandle>),
    Mutex(Arc<RubyMutex>),
}

impl Object {
    pub fn new(class: ClassId, data: Data) -> Self {
        Object { class, ivars: Mutex::new(Vec::new()), data }
    }

    pub fn ivar(&self, name: Symbol) -> Option<Value> {
        self.ivars.lock().iter().find(|(k, _)| *k == name).map(|&(_, v)| v)
    }

    pub fn set_ivar(&self, name: Symbol, value: Value) {
        let mut ivars = self.ivars.lock();
        match ivars.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => ivars.push((name, value)),
        }
    }

    pub fn ivars(&self) -> Vec<(Symbol, Value)> {
        self.ivars.lock().clone()
    }
}

#[derive(Default)]
pub struct Heap {
    objects: RwLock<Vec<Arc<Object>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&self, object: Object) -> Value {
        let mut objects = self.objects.write();
        let index = objects.len() as u32;
        objects.push(Arc::new(object));
        Value::heap(index)
    }

    pub fn get(&self, v: Value) -> Option<Arc<Object>> {
        let index = v.as_heap()?;
        self.objects.read().get(index as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn string(&self, v: Value) -> Option<String> {
        match &self.get(v)?.data {
            Data::Str(s) => Some(s.lock().clone()),
            _ => None,
        }
    }

    /// Snapshot of an array's elements.
    pub fn array(&self, v: Value) -> Option<Vec<Value>> {
        match &self.get(v)?.data {
            Data::Array(a) => Some(a.lock().clone()),
            _ => None,
        }
    }

    pub fn is_array(&self, v: Value) -> bool {
        self.get(v).is_some_and(|o| matches!(o.data, Data::Array(_)))
    }

    pub fn float(&self, v: Value) -> Option<f64> {
        match self.get(v)?.data {
            Data::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn bigint(&self, v: Value) -> Option<i128> {
        match self.get(v)?.data {
            Data::BigInt(n) => Some(n),
            _ => None,
        }
    }

    /// Run `f` with the array's storage locked.
    pub fn with_array<R>(&self, v: Value, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        let object = self.get(v)?;
        match &object.data {
            Data::Array(a) => Some(f(&mut a.lock())),
            _ => None,
        }
    }

    pub fn with_string<R>(&self, v: Value, f: impl FnOnce(&mut String) -> R) -> Option<R> {
        let object = self.get(v)?;
        match &object.data {
            Data::Str(s) => Some(f(&mut s.lock())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_read_back() {
        let heap = Heap::new();
        let s = heap.alloc(Object::new(ClassId(1), Data::Str(Mutex::new("hi".into()))));
        let a = heap.alloc(Object::new(ClassId(2), Data::Array(Mutex::new(vec![Value::int(1)]))));
        assert_eq!(heap.string(s).as_deref(), Some("hi"));
        assert_eq!(heap.array(a), Some(vec![Value::int(1)]));
        assert!(heap.is_array(a) && !heap.is_array(s));
        heap.with_array(a, |v| v.push(Value::NIL));
        assert_eq!(heap.array(a).map(|v| v.len()), Some(2));
    }

    #[test]
    fn ivars_overwrite_in_place() {
        let o = Object::new(ClassId(0), Data::Plain);
        o.set_ivar(Symbol(1), Value::int(1));
        o.set_ivar(Symbol(1), Value::int(2));
        assert_eq!(o.ivar(Symbol(1)), Some(Value::int(2)));
        assert_eq!(o.ivars().len(), 1);
    }
}
