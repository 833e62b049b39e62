//! Process-wide inline caches.
//!
//! Call sites and constant references get a stable integer slot when the
//! compiler emits them. A slot holds one (class → target) pair: monomorphic,
//! overwritten on a miss.
//!
//! Invalidation is by generation counter. Every method definition or module
//! inclusion bumps `method_generation`; every constant assignment bumps
//! `const_generation`. An entry is valid only while its recorded generation
//! equals the current one, so invalidation is O(1) and a stale read at worst
//! causes a redundant re-resolution. Counters and redefinition flags use
//! release stores and acquire loads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::class::ClassId;
use super::method::MethodEntry;
use crate::value::Value;

pub type SiteId = u32;

/// Selectors compiled with a guarded fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InlineOp {
    Plus,
    Minus,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Eqq,
    Shl,
    Aref,
    Aset,
    Send,
}

impl InlineOp {
    pub const COUNT: usize = 15;

    pub const ALL: [InlineOp; InlineOp::COUNT] = [
        InlineOp::Plus,
        InlineOp::Minus,
        InlineOp::Mul,
        InlineOp::Div,
        InlineOp::Lt,
        InlineOp::Le,
        InlineOp::Gt,
        InlineOp::Ge,
        InlineOp::Eq,
        InlineOp::Ne,
        InlineOp::Eqq,
        InlineOp::Shl,
        InlineOp::Aref,
        InlineOp::Aset,
        InlineOp::Send,
    ];

    pub fn selector(self) -> &'static str {
        match self {
            InlineOp::Plus => "+",
            InlineOp::Minus => "-",
            InlineOp::Mul => "*",
            InlineOp::Div => "/",
            InlineOp::Lt => "<",
            InlineOp::Le => "<=",
            InlineOp::Gt => ">",
            InlineOp::Ge => ">=",
            InlineOp::Eq => "==",
            InlineOp::Ne => "!=",
            InlineOp::Eqq => "===",
            InlineOp::Shl => "<<",
            InlineOp::Aref => "[]",
            InlineOp::Aset => "[]=",
            InlineOp::Send => "send",
        }
    }

    pub fn from_selector(name: &str) -> Option<InlineOp> {
        if name == "__send__" {
            return Some(InlineOp::Send);
        }
        InlineOp::ALL.into_iter().find(|op| op.selector() == name)
    }

    /// Two operands, one result: lowered as a `Binop`.
    pub fn is_binary(self) -> bool {
        !matches!(self, InlineOp::Aset | InlineOp::Send)
    }
}

struct CallCache {
    class: ClassId,
    generation: u64,
    target: Arc<MethodEntry>,
}

struct ConstCache {
    generation: u64,
    /// Innermost lexical scope when the value was resolved.
    scope: ClassId,
    value: Value,
}

pub struct CacheStore {
    method_generation: AtomicU64,
    const_generation: AtomicU64,
    redefined: [AtomicBool; InlineOp::COUNT],
    calls: RwLock<Vec<Mutex<Option<CallCache>>>>,
    consts: RwLock<Vec<Mutex<Option<ConstCache>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for CacheStore {
    fn default() -> Self {
        CacheStore {
            method_generation: AtomicU64::new(0),
            const_generation: AtomicU64::new(0),
            redefined: std::array::from_fn(|_| AtomicBool::new(false)),
            calls: RwLock::new(Vec::new()),
            consts: RwLock::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── call sites ──────────────────────────────────────────────────

    pub fn new_call_site(&self) -> SiteId {
        let mut calls = self.calls.write();
        calls.push(Mutex::new(None));
        (calls.len() - 1) as SiteId
    }

    pub fn method_generation(&self) -> u64 {
        self.method_generation.load(Ordering::Acquire)
    }

    pub fn invalidate_methods(&self) {
        self.method_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Cached target for `class`, if the slot is still valid.
    pub fn lookup_call(&self, site: SiteId, class: ClassId) -> Option<Arc<MethodEntry>> {
        let generation = self.method_generation();
        let calls = self.calls.read();
        let slot = calls.get(site as usize)?.lock();
        match &*slot {
            Some(c) if c.class == class && c.generation == generation => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(c.target.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Overwrite the slot. `generation` must be read before resolution began
    /// so a concurrent redefinition leaves the entry already stale.
    pub fn store_call(&self, site: SiteId, class: ClassId, generation: u64, target: Arc<MethodEntry>) {
        let calls = self.calls.read();
        if let Some(slot) = calls.get(site as usize) {
            *slot.lock() = Some(CallCache { class, generation, target });
        }
    }

    /// Target currently cached at `site`, regardless of validity.
    pub fn peek_call(&self, site: SiteId) -> Option<(ClassId, Arc<MethodEntry>)> {
        let calls = self.calls.read();
        let slot = calls.get(site as usize)?.lock();
        slot.as_ref().map(|c| (c.class, c.target.clone()))
    }

    pub fn call_sites(&self) -> usize {
        self.calls.read().len()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    // ── constants ───────────────────────────────────────────────────

    pub fn new_const_site(&self) -> SiteId {
        let mut consts = self.consts.write();
        consts.push(Mutex::new(None));
        (consts.len() - 1) as SiteId
    }

    pub fn const_generation(&self) -> u64 {
        self.const_generation.load(Ordering::Acquire)
    }

    /// Any constant assignment anywhere invalidates every constant cache.
    pub fn invalidate_constants(&self) {
        self.const_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn lookup_const(&self, site: SiteId, scope: ClassId) -> Option<Value> {
        let generation = self.const_generation();
        let consts = self.consts.read();
        let slot = consts.get(site as usize)?.lock();
        match &*slot {
            Some(c) if c.generation == generation && c.scope == scope => Some(c.value),
            _ => None,
        }
    }

    pub fn store_const(&self, site: SiteId, generation: u64, scope: ClassId, value: Value) {
        let consts = self.consts.read();
        if let Some(slot) = consts.get(site as usize) {
            *slot.lock() = Some(ConstCache { generation, scope, value });
        }
    }

    // ── redefinition flags ─────────────────────────────────────────

    pub fn mark_redefined(&self, op: InlineOp) {
        self.redefined[op as usize].store(true, Ordering::Release);
    }

    pub fn is_redefined(&self, op: InlineOp) -> bool {
        self.redefined[op as usize].load(Ordering::Acquire)
    }

    /// Address native code loads to test the flag (one byte, nonzero = set).
    pub fn flag_addr(&self, op: InlineOp) -> usize {
        self.redefined[op as usize].as_ptr() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::arity::Arity;
    use crate::runtime::method::{MethodBody, MethodFlags};
    use crate::runtime::symbol::Symbol;

    fn entry(owner: u32) -> Arc<MethodEntry> {
        MethodEntry::new(
            ClassId(owner),
            Symbol(0),
            Arity::fixed(0),
            MethodBody::AttrReader(Symbol(1)),
            MethodFlags::default(),
            Arc::new(vec![ClassId(0)]),
        )
    }

    #[test]
    fn hit_requires_same_class_and_generation() {
        let store = CacheStore::new();
        let site = store.new_call_site();
        let g = store.method_generation();
        let target = entry(1);
        store.store_call(site, ClassId(1), g, target.clone());
        assert_eq!(store.lookup_call(site, ClassId(1)).map(|m| m.id), Some(target.id));
        assert!(store.lookup_call(site, ClassId(2)).is_none());
        store.invalidate_methods();
        assert!(store.lookup_call(site, ClassId(1)).is_none());
        let (hits, misses) = store.stats();
        assert_eq!((hits, misses), (1, 2));
    }

    #[test]
    fn miss_overwrites_slot() {
        let store = CacheStore::new();
        let site = store.new_call_site();
        let g = store.method_generation();
        store.store_call(site, ClassId(1), g, entry(1));
        let second = entry(2);
        store.store_call(site, ClassId(2), g, second.clone());
        assert!(store.lookup_call(site, ClassId(1)).is_none());
        assert_eq!(store.peek_call(site).map(|(c, m)| (c, m.id)), Some((ClassId(2), second.id)));
    }

    #[test]
    fn constant_cache_tracks_scope_and_generation() {
        let store = CacheStore::new();
        let site = store.new_const_site();
        store.store_const(site, store.const_generation(), ClassId(3), Value::int(7));
        assert_eq!(store.lookup_const(site, ClassId(3)), Some(Value::int(7)));
        assert_eq!(store.lookup_const(site, ClassId(4)), None);
        store.invalidate_constants();
        assert_eq!(store.lookup_const(site, ClassId(3)), None);
    }

    #[test]
    fn redefinition_flags_are_sticky() {
        let store = CacheStore::new();
        assert!(!store.is_redefined(InlineOp::Plus));
        store.mark_redefined(InlineOp::Plus);
        assert!(store.is_redefined(InlineOp::Plus));
        assert!(!store.is_redefined(InlineOp::Minus));
        let addr = store.flag_addr(InlineOp::Plus) as *const u8;
        assert_eq!(unsafe { *addr }, 1);
    }

    #[test]
    fn selectors_map_back() {
        for op in InlineOp::ALL {
            assert_eq!(InlineOp::from_selector(op.selector()), Some(op));
        }
        assert_eq!(InlineOp::from_selector("__send__"), Some(InlineOp::Send));
        assert_eq!(InlineOp::from_selector("%"), None);
    }
}
