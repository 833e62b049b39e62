use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::arity::Arity;
use super::class::ClassId;
use super::symbol::Symbol;
use super::{Cref, Unwind};
use crate::ir::FuncId;
use crate::value::Value;
use crate::vm::Interp;

/// Host-implemented method. Receives the variadic convention: `(self, argv)`.
pub type ForeignFn = fn(&mut Interp, Value, &[Value], Option<Value>) -> Result<Value, Unwind>;

#[derive(Clone)]
pub enum MethodBody {
    /// IR function, interpreted or JIT-compiled on first call.
    Compiled(FuncId),
    Foreign(ForeignFn),
    AttrReader(Symbol),
    AttrWriter(Symbol),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags {
    /// `def m; end`: calls return nil without entering the body.
    pub empty_body: bool,
    /// Native entry takes `(argc, argv)` instead of one argument per slot.
    pub variadic: bool,
}

/// Method descriptor. Replaced wholesale on redefinition, never mutated.
pub struct MethodEntry {
    pub id: u64,
    pub owner: ClassId,
    pub selector: Symbol,
    pub arity: Arity,
    pub body: MethodBody,
    pub flags: MethodFlags,
    /// Lexical class nesting at the point of definition.
    pub cref: Cref,
}

static NEXT_METHOD_ID: AtomicU64 = AtomicU64::new(1);

impl MethodEntry {
    pub fn new(owner: ClassId, selector: Symbol, arity: Arity, body: MethodBody, flags: MethodFlags, cref: Cref) -> Arc<Self> {
        Arc::new(MethodEntry {
            id: NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            selector,
            arity,
            body,
            flags,
            cref,
        })
    }

    pub fn kind(&self) -> CacheKind {
        match self.body {
            MethodBody::Compiled(_) => CacheKind::Compiled,
            MethodBody::Foreign(_) => CacheKind::Foreign,
            MethodBody::AttrReader(_) | MethodBody::AttrWriter(_) => CacheKind::Attr,
        }
    }

    pub fn is_foreign(&self, f: ForeignFn) -> bool {
        matches!(self.body, MethodBody::Foreign(g) if std::ptr::fn_addr_eq(g, f))
    }
}

/// Tag stored next to a cached target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Compiled,
    Foreign,
    Attr,
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("selector", &self.selector)
            .field("arity", &self.arity)
            .field("kind", &self.kind())
            .finish()
    }
}
