//! Closures.
//!
//! A block object pairs a compiled block template with the activation it was
//! created in: `self`, the boxed cells of every enclosing variable the block
//! can see, and the frames `break` and `return` target.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::arity::Arity;
use super::method::MethodEntry;
use super::symbol::Symbol;
use super::{Cref, FrameId};
use crate::ir::FuncId;
use crate::value::Value;

/// Heap-boxed variable shared between a scope and the blocks that capture it.
#[derive(Debug, Clone)]
pub struct Cell(Arc<AtomicU64>);

impl Cell {
    pub fn new(v: Value) -> Self {
        Cell(Arc::new(AtomicU64::new(v.0)))
    }

    #[inline]
    pub fn get(&self) -> Value {
        Value(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, v: Value) {
        self.0.store(v.0, Ordering::Release);
    }
}

pub struct Block {
    pub func: FuncId,
    pub self_val: Value,
    /// Cells of the creating frame (its own env first, then its boxed locals).
    pub env: Vec<Cell>,
    pub arity: Arity,
    /// Method the block was created in; `super` and `def` inside the block use it.
    pub method: Option<Arc<MethodEntry>>,
    pub cref: Cref,
    /// Block of the enclosing method, the target of `yield` inside this block.
    pub outer_block: Option<Value>,
    /// Method frame a `return` inside the block leaves.
    pub home: FrameId,
    /// Frame whose call site a `break` inside the block completes.
    pub creator: FrameId,
    is_proc: AtomicBool,
    is_lambda: AtomicBool,
    is_active: AtomicBool,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        func: FuncId,
        self_val: Value,
        env: Vec<Cell>,
        arity: Arity,
        method: Option<Arc<MethodEntry>>,
        cref: Cref,
        outer_block: Option<Value>,
        home: FrameId,
        creator: FrameId,
        lambda: bool,
    ) -> Self {
        Block {
            func,
            self_val,
            env,
            arity,
            method,
            cref,
            outer_block,
            home,
            creator,
            is_proc: AtomicBool::new(false),
            is_lambda: AtomicBool::new(lambda),
            is_active: AtomicBool::new(true),
        }
    }

    /// Escaped into a first-class Proc: a later activation of the same
    /// literal must build a fresh object.
    pub fn is_proc(&self) -> bool {
        self.is_proc.load(Ordering::Acquire)
    }

    pub fn mark_proc(&self) {
        self.is_proc.store(true, Ordering::Release);
    }

    pub fn is_lambda(&self) -> bool {
        self.is_lambda.load(Ordering::Acquire)
    }

    pub fn mark_lambda(&self) {
        self.is_lambda.store(true, Ordering::Release);
    }

    /// False once the creating frame has returned; `break` and `return`
    /// from the block then raise LocalJumpError.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.is_active.store(false, Ordering::Release);
    }
}

/// Callable payload of a Proc object.
#[derive(Clone)]
pub enum Proc {
    Block(Arc<Block>),
    /// `&:sym`: calls `sym` on the first argument.
    Symbol(Symbol),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_are_shared_by_reference() {
        let a = Cell::new(Value::int(1));
        let b = a.clone();
        b.set(Value::int(2));
        assert_eq!(a.get(), Value::int(2));
    }

    #[test]
    fn flags_start_as_active_plain_block() {
        let block = Block::new(0, Value::NIL, vec![], Arity::fixed(0), None, Arc::new(vec![]), None, 1, 1, false);
        assert!(block.is_active() && !block.is_proc() && !block.is_lambda());
        block.mark_proc();
        block.deactivate();
        assert!(block.is_proc() && !block.is_active());
    }
}
