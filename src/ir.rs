//! Register IR emitted by the compiler.
//!
//! One [`Function`] per scope (top level, class body, method, block). Every
//! instruction names registers of the current frame; call arguments occupy
//! contiguous registers `args..args+argc`. Protected regions are described
//! out of line by a handler table, innermost region first.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::ast::NodeId;
use crate::runtime::arity::Arity;
use crate::runtime::cache::{InlineOp, SiteId};
use crate::runtime::symbol::Symbol;
use crate::value::Value;

pub type Reg = u16;
pub type FuncId = u32;

/// Call shape, which also selects the NoMethodError wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `recv.m(...)`
    Normal,
    /// `m(...)` with implicit self.
    FCall,
    /// Bare `m`, which could have been a local variable.
    VCall,
    Super,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOperand {
    None,
    /// Block literal built by `MakeBlock` in this frame; `break` from it
    /// completes this call.
    Literal(Reg),
    /// `&expr`: a Proc, a Symbol or nil.
    Value(Reg),
    /// `super` without an explicit block forwards the current one.
    Inherit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Break,
    Next,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Float(f64),
    /// Integer literal too wide for a fixnum.
    Int(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    LoadImm { dst: Reg, value: Value },
    /// Fresh string, float or boxed integer built from the literal pool.
    LoadLit { dst: Reg, lit: u32 },
    LoadSelf { dst: Reg },
    Move { dst: Reg, src: Reg },
    GetCell { dst: Reg, cell: u16 },
    SetCell { cell: u16, src: Reg },
    GetIvar { dst: Reg, name: Symbol },
    SetIvar { name: Symbol, src: Reg },
    GetCvar { dst: Reg, name: Symbol },
    SetCvar { name: Symbol, src: Reg },
    GetGlobal { dst: Reg, name: Symbol },
    SetGlobal { name: Symbol, src: Reg },
    /// With `soft`, a missing constant reads as nil instead of raising.
    GetConst { dst: Reg, scope: Option<Reg>, top: bool, name: Symbol, site: SiteId, soft: bool },
    SetConst { scope: Option<Reg>, name: Symbol, src: Reg },

    NewArray { dst: Reg, start: Reg, count: u16 },
    /// `dst = src.to_a` for splats: arrays pass through, nil is `[]`, others wrap.
    ToArray { dst: Reg, src: Reg },
    /// Append the elements of `src` (after `ToArray` coercion) to array `dst`.
    ConcatArray { dst: Reg, src: Reg },
    ArrayPush { dst: Reg, src: Reg },
    ArrayGet { dst: Reg, src: Reg, index: u16 },
    /// Elements `[start, len - tail)`.
    ArraySlice { dst: Reg, src: Reg, start: u16, tail: u16 },
    /// Element `index` of the `count` trailing elements, never overlapping the
    /// first `start` elements.
    ArrayPost { dst: Reg, src: Reg, start: u16, count: u16, index: u16 },
    StrConcat { dst: Reg, start: Reg, count: u16 },

    Send {
        dst: Reg,
        recv: Option<Reg>,
        sel: Symbol,
        args: Reg,
        argc: u16,
        /// The last argument is an array to expand.
        splat: bool,
        block: BlockOperand,
        kind: CallKind,
        site: SiteId,
        /// Guarded fast path for `[]=` and literal-symbol `send`.
        inline: Option<InlineOp>,
        /// For `send(:sym, ...)` compiled to a direct `sym` call: the
        /// `send` selector to fall back to if it was redefined.
        via: Option<Symbol>,
    },
    Binop { op: InlineOp, dst: Reg, lhs: Reg, rhs: Reg, site: SiteId },
    /// Direct recursion into the enclosing method.
    SelfCall { dst: Reg, args: Reg, argc: u16, site: SiteId },
    Super { dst: Reg, args: Reg, argc: u16, splat: bool, block: BlockOperand, site: SiteId },
    Yield { dst: Reg, args: Reg, argc: u16, splat: bool },

    MakeBlock { dst: Reg, func: FuncId, slot: u16 },
    /// Current block as a Proc, or nil.
    BlockArg { dst: Reg },
    BlockGiven { dst: Reg },
    DefMethod { dst: Reg, name: Symbol, func: FuncId },
    DefSingleton { dst: Reg, target: Reg, name: Symbol, func: FuncId },
    DefClass { dst: Reg, scope: Option<Reg>, name: Symbol, superclass: Option<Reg>, body: FuncId, module: bool },

    Jump { target: u32 },
    /// Jump when `cond`'s truthiness equals `when`.
    Branch { cond: Reg, target: u32, when: bool },
    JumpIfDefined { src: Reg, target: u32 },
    /// `dst = list.any? { |p| p === subject }`.
    CaseSplatTest { dst: Reg, subject: Reg, list: Reg },
    Not { dst: Reg, src: Reg },
    Return { src: Reg },
    /// `return` inside a block: leaves the home method.
    BlockReturn { src: Reg },
    /// `break` inside a block: completes the call the block was passed to.
    BlockBreak { src: Reg },
    LocalJump { kind: JumpKind },

    /// Landing-pad entry for rescue: take the in-flight exception and make it
    /// the handled one (`$!`).
    CatchException { dst: Reg },
    /// Leave a rescue clause.
    ClearException,
    /// No clause matched: hand the exception back to the unwinder.
    Reraise { src: Reg },
    /// Landing-pad entry for ensure: park whatever is unwinding.
    SaveUnwind { slot: u16 },
    /// End of an ensure pad: continue unwinding.
    ResumeUnwind { slot: u16 },
}

impl Op {
    /// Jump targets held by this instruction.
    pub fn targets_mut(&mut self) -> Option<&mut u32> {
        match self {
            Op::Jump { target } | Op::Branch { target, .. } | Op::JumpIfDefined { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<u32> {
        match *self {
            Op::Jump { target } | Op::Branch { target, .. } | Op::JumpIfDefined { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Jump { .. }
                | Op::Return { .. }
                | Op::BlockReturn { .. }
                | Op::BlockBreak { .. }
                | Op::LocalJump { .. }
                | Op::Reraise { .. }
                | Op::ResumeUnwind { .. }
        )
    }

    /// Register written, if any.
    pub fn def(&self) -> Option<Reg> {
        match *self {
            Op::LoadImm { dst, .. }
            | Op::LoadLit { dst, .. }
            | Op::LoadSelf { dst }
            | Op::Move { dst, .. }
            | Op::GetCell { dst, .. }
            | Op::GetIvar { dst, .. }
            | Op::GetCvar { dst, .. }
            | Op::GetGlobal { dst, .. }
            | Op::GetConst { dst, .. }
            | Op::NewArray { dst, .. }
            | Op::ToArray { dst, .. }
            | Op::ArrayGet { dst, .. }
            | Op::ArraySlice { dst, .. }
            | Op::ArrayPost { dst, .. }
            | Op::StrConcat { dst, .. }
            | Op::Send { dst, .. }
            | Op::Binop { dst, .. }
            | Op::SelfCall { dst, .. }
            | Op::Super { dst, .. }
            | Op::Yield { dst, .. }
            | Op::MakeBlock { dst, .. }
            | Op::BlockArg { dst }
            | Op::BlockGiven { dst }
            | Op::DefMethod { dst, .. }
            | Op::DefSingleton { dst, .. }
            | Op::DefClass { dst, .. }
            | Op::CaseSplatTest { dst, .. }
            | Op::Not { dst, .. }
            | Op::CatchException { dst } => Some(dst),
            _ => None,
        }
    }

    /// Every register read, ranges expanded.
    pub fn uses(&self) -> Vec<Reg> {
        fn range(start: Reg, count: u16) -> impl Iterator<Item = Reg> {
            (0..count).map(move |i| start + i)
        }
        fn block(b: BlockOperand) -> Option<Reg> {
            match b {
                BlockOperand::Literal(r) | BlockOperand::Value(r) => Some(r),
                BlockOperand::None | BlockOperand::Inherit => None,
            }
        }
        match *self {
            Op::Move { src, .. }
            | Op::SetCell { src, .. }
            | Op::SetIvar { src, .. }
            | Op::SetCvar { src, .. }
            | Op::SetGlobal { src, .. }
            | Op::ToArray { src, .. }
            | Op::ArrayGet { src, .. }
            | Op::ArraySlice { src, .. }
            | Op::ArrayPost { src, .. }
            | Op::Not { src, .. }
            | Op::Return { src }
            | Op::BlockReturn { src }
            | Op::BlockBreak { src }
            | Op::Reraise { src }
            | Op::JumpIfDefined { src, .. } => vec![src],
            Op::GetConst { scope, .. } => scope.into_iter().collect(),
            Op::SetConst { scope, src, .. } => scope.into_iter().chain([src]).collect(),
            Op::NewArray { start, count, .. } | Op::StrConcat { start, count, .. } => range(start, count).collect(),
            Op::ConcatArray { dst, src } | Op::ArrayPush { dst, src } => vec![dst, src],
            Op::Send { recv, args, argc, block: b, .. } => {
                recv.into_iter().chain(range(args, argc)).chain(block(b)).collect()
            }
            Op::Binop { lhs, rhs, .. } => vec![lhs, rhs],
            Op::SelfCall { args, argc, .. } | Op::Yield { args, argc, .. } => range(args, argc).collect(),
            Op::Super { args, argc, block: b, .. } => range(args, argc).chain(block(b)).collect(),
            Op::DefSingleton { target, .. } => vec![target],
            Op::DefClass { scope, superclass, .. } => scope.into_iter().chain(superclass).collect(),
            Op::Branch { cond, .. } => vec![cond],
            Op::CaseSplatTest { subject, list, .. } => vec![subject, list],
            _ => Vec::new(),
        }
    }

    /// Registers read as part of a contiguous argument range. These cannot be
    /// renamed individually.
    pub fn pinned(&self) -> Vec<Reg> {
        match *self {
            Op::NewArray { start, count, .. } | Op::StrConcat { start, count, .. } => (start..start + count).collect(),
            Op::Send { args, argc, .. }
            | Op::SelfCall { args, argc, .. }
            | Op::Super { args, argc, .. }
            | Op::Yield { args, argc, .. } => (args..args + argc).collect(),
            _ => Vec::new(),
        }
    }

    /// Rename a single-register read. Range operands are left alone.
    pub fn rename_use(&mut self, from: Reg, to: Reg) {
        let swap = |r: &mut Reg| {
            if *r == from {
                *r = to;
            }
        };
        match self {
            Op::Move { src, .. }
            | Op::SetCell { src, .. }
            | Op::SetIvar { src, .. }
            | Op::SetCvar { src, .. }
            | Op::SetGlobal { src, .. }
            | Op::ToArray { src, .. }
            | Op::ArrayGet { src, .. }
            | Op::ArraySlice { src, .. }
            | Op::ArrayPost { src, .. }
            | Op::Not { src, .. }
            | Op::Return { src }
            | Op::BlockReturn { src }
            | Op::BlockBreak { src }
            | Op::Reraise { src }
            | Op::JumpIfDefined { src, .. } => swap(src),
            Op::Binop { lhs, rhs, .. } => {
                swap(lhs);
                swap(rhs);
            }
            Op::Branch { cond, .. } => swap(cond),
            Op::CaseSplatTest { subject, list, .. } => {
                swap(subject);
                swap(list);
            }
            Op::Send { recv: Some(r), .. } | Op::DefSingleton { target: r, .. } => swap(r),
            _ => {}
        }
    }
}

/// What kind of scope a function was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Top,
    ClassBody,
    Method,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Catches raised exceptions only.
    Rescue,
    /// Catches every unwind: exceptions, break, non-local return, thread kill.
    Ensure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    /// Half-open pc ranges covered. Several ranges when inlined cleanup code
    /// had to be cut out of the region.
    pub ranges: Vec<(u32, u32)>,
    pub target: u32,
    pub kind: HandlerKind,
    /// Lexical nesting depth; the table is sorted deepest first.
    pub depth: u16,
}

impl Handler {
    pub fn covers(&self, pc: u32) -> bool {
        self.ranges.iter().any(|&(s, e)| s <= pc && pc < e)
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub file: Arc<str>,
    pub line: u32,
    pub kind: FunctionKind,
    pub arity: Arity,
    /// Selector for methods; used by the self-call guard.
    pub selector: Option<Symbol>,
    pub reg_count: u16,
    /// Boxed locals allocated fresh on entry, after the inherited env.
    pub own_cells: u16,
    pub env_cells: u16,
    pub block_slots: u16,
    pub unwind_slots: u16,
    pub empty_body: bool,
    pub code: Vec<Op>,
    pub lines: Vec<u32>,
    pub handlers: Vec<Handler>,
    pub literals: Vec<Literal>,
}

impl Function {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(self.line)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "fn {} ({:?}, {}:{}) arity={}..{} real={} regs={} cells={}+{}",
            self.name,
            self.kind,
            self.file,
            self.line,
            self.arity.min,
            self.arity.max,
            self.arity.real,
            self.reg_count,
            self.env_cells,
            self.own_cells
        )?;
        for (pc, op) in self.code.iter().enumerate() {
            writeln!(f, "  {pc:04} {op:?}    ; line {}", self.line_at(pc))?;
        }
        for h in &self.handlers {
            writeln!(f, "  handler {:?} {:?} -> {} (depth {})", h.kind, h.ranges, h.target, h.depth)?;
        }
        Ok(())
    }
}

/// Registered function plus its lazily generated native code.
pub struct FunctionSlot {
    pub ir: Arc<Function>,
    pub native: OnceLock<Option<Arc<crate::jit::NativeCode>>>,
}

/// Every compiled function in the process, addressed by [`FuncId`].
#[derive(Default)]
pub struct FunctionStore {
    slots: RwLock<Vec<Arc<FunctionSlot>>>,
    /// Block templates by (program, node): each block literal compiles once.
    templates: Mutex<HashMap<(u32, NodeId), FuncId>>,
}

impl FunctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, function: Function) -> FuncId {
        let mut slots = self.slots.write();
        slots.push(Arc::new(FunctionSlot { ir: Arc::new(function), native: OnceLock::new() }));
        (slots.len() - 1) as FuncId
    }

    pub fn get(&self, id: FuncId) -> Option<Arc<FunctionSlot>> {
        self.slots.read().get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn template(&self, program: u32, node: NodeId) -> Option<FuncId> {
        self.templates.lock().get(&(program, node)).copied()
    }

    pub fn set_template(&self, program: u32, node: NodeId, id: FuncId) {
        self.templates.lock().insert((program, node), id);
    }

    /// IR listing of every function, for `--dump-ir`.
    pub fn dump(&self) -> String {
        self.slots.read().iter().map(|s| s.ir.to_string()).collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_expand_argument_ranges() {
        let op = Op::Send {
            dst: 0,
            recv: Some(1),
            sel: Symbol(0),
            args: 4,
            argc: 3,
            splat: false,
            block: BlockOperand::Value(9),
            kind: CallKind::Normal,
            site: 0,
            inline: None,
            via: None,
        };
        assert_eq!(op.uses(), vec![1, 4, 5, 6, 9]);
        assert_eq!(op.pinned(), vec![4, 5, 6]);
        assert_eq!(op.def(), Some(0));
    }

    #[test]
    fn rename_leaves_ranges_alone() {
        let mut op = Op::Binop { op: InlineOp::Plus, dst: 0, lhs: 2, rhs: 2, site: 0 };
        op.rename_use(2, 7);
        assert_eq!(op, Op::Binop { op: InlineOp::Plus, dst: 0, lhs: 7, rhs: 7, site: 0 });
        let mut call = Op::SelfCall { dst: 0, args: 2, argc: 1, site: 0 };
        call.rename_use(2, 7);
        assert_eq!(call, Op::SelfCall { dst: 0, args: 2, argc: 1, site: 0 });
    }

    #[test]
    fn handler_ranges_are_half_open() {
        let h = Handler { ranges: vec![(2, 4), (6, 7)], target: 9, kind: HandlerKind::Rescue, depth: 1 };
        assert!(!h.covers(1) && h.covers(2) && h.covers(3) && !h.covers(4) && h.covers(6) && !h.covers(7));
    }
}
