//! IR interpreter and per-thread execution state.
//!
//! Every compiled function can run here. Native code produced by the JIT
//! calls back into [`Interp::step`] for every instruction it does not lower
//! itself, so both tiers share one implementation of each operation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::ir::{BlockOperand, FuncId, Function, FunctionKind, HandlerKind, JumpKind, Literal, Op, Reg};
use crate::runtime::block::{Block, Cell, Proc};
use crate::runtime::cache::InlineOp;
use crate::runtime::class::ClassId;
use crate::runtime::heap::{Data, Object};
use crate::runtime::method::{MethodBody, MethodEntry, MethodFlags};
use crate::runtime::symbol::Symbol;
use crate::runtime::{Core, Cref, FrameId, Unwind, builtins};
use crate::value::Value;

// ── Thread state ─────────────────────────────────────────────────────

/// What backtraces and `super` need to know about a live compiled frame.
pub struct FrameInfo {
    pub id: FrameId,
    pub func: Arc<Function>,
    /// Method the frame belongs to (for a block, the method it was created in).
    pub method: Option<Arc<MethodEntry>>,
    /// Entered through `super`.
    pub via_super: bool,
    pub block: Option<Value>,
    pub pc: usize,
    /// Entry address when the frame runs native code.
    pub native_entry: Option<usize>,
}

pub struct ThreadState {
    pub id: u64,
    pub kill: Arc<AtomicBool>,
    pub frames: Vec<FrameInfo>,
    /// Exceptions thrown and not yet caught, innermost last.
    pub raised: Vec<Value>,
    /// Exceptions being handled by a rescue clause; the last one is `$!`.
    pub handled: Vec<Value>,
    depth: usize,
}

pub struct Interp {
    pub core: Arc<Core>,
    pub thread: ThreadState,
}

// ── Frames ───────────────────────────────────────────────────────────

/// How a function is being entered.
pub struct Entry {
    pub self_val: Value,
    pub block: Option<Value>,
    pub method: Option<Arc<MethodEntry>>,
    pub cref: Cref,
    /// Cells inherited from the creating frame (blocks only).
    pub env: Vec<Cell>,
    pub proc_: Option<Arc<Block>>,
    pub via_super: bool,
}

impl Entry {
    pub fn method(recv: Value, method: &Arc<MethodEntry>, block: Option<Value>, via_super: bool) -> Self {
        Entry {
            self_val: recv,
            block,
            method: Some(method.clone()),
            cref: method.cref.clone(),
            env: Vec::new(),
            proc_: None,
            via_super,
        }
    }
}

pub struct Frame {
    pub id: FrameId,
    pub fid: FuncId,
    pub func: Arc<Function>,
    pub self_val: Value,
    pub regs: Vec<Value>,
    pub cells: Vec<Cell>,
    pub block: Option<Value>,
    pub method: Option<Arc<MethodEntry>>,
    pub cref: Cref,
    /// Frame a non-local `return` leaves. Equal to `id` for methods,
    /// lambdas and the top level.
    pub home: FrameId,
    pub proc_: Option<Arc<Block>>,
    block_memo: Vec<Option<Value>>,
    blocks_made: Vec<Arc<Block>>,
    unwind_slots: Vec<Option<Unwind>>,
    /// Set while a landing pad runs.
    pub unwinding: Option<Unwind>,
}

impl Frame {
    fn is_lambda(&self) -> bool {
        self.proc_.as_ref().is_some_and(|b| b.is_lambda())
    }

    #[inline]
    pub fn reg(&self, r: Reg) -> Value {
        self.regs[r as usize]
    }

    #[inline]
    pub fn set(&mut self, r: Reg, v: Value) {
        self.regs[r as usize] = v;
    }
}

/// Result of one instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Flow {
    Next,
    Jump(u32),
    Return(Value),
}

/// First handler covering `pc` that accepts `unwind`. The table is ordered
/// innermost first.
pub fn find_handler(func: &Function, pc: usize, unwind: &Unwind) -> Option<u32> {
    handler_index(func, pc, unwind).map(|i| func.handlers[i].target)
}

/// Position of that handler in the table.
pub fn handler_index(func: &Function, pc: usize, unwind: &Unwind) -> Option<usize> {
    func.handlers.iter().position(|h| {
        h.covers(pc as u32)
            && match h.kind {
                HandlerKind::Rescue => matches!(unwind, Unwind::Raise(_)),
                HandlerKind::Ensure => true,
            }
    })
}

impl Interp {
    pub fn new(core: Arc<Core>, id: u64, kill: Arc<AtomicBool>) -> Self {
        Interp {
            core,
            thread: ThreadState { id, kill, frames: Vec::new(), raised: Vec::new(), handled: Vec::new(), depth: 0 },
        }
    }

    /// Interpreter for the main Ruby thread.
    pub fn main(core: Arc<Core>) -> Self {
        let id = core.next_thread_id();
        Interp::new(core, id, Arc::new(AtomicBool::new(false)))
    }

    /// `Err(Kill)` once another thread asked this one to stop.
    pub fn check_kill(&self) -> Result<(), Unwind> {
        if self.thread.kill.load(Ordering::Acquire) { Err(Unwind::Kill) } else { Ok(()) }
    }

    pub fn run_top(&mut self, top: FuncId) -> Result<Value, Unwind> {
        let entry = Entry {
            self_val: self.core.main,
            block: None,
            method: None,
            cref: Arc::new(vec![self.core.c.object]),
            env: Vec::new(),
            proc_: None,
            via_super: false,
        };
        self.execute(top, Vec::new(), entry)
    }

    // ---- frame lifecycle ----

    /// Run function `fid` with already marshaled arguments.
    pub fn execute(&mut self, fid: FuncId, args: Vec<Value>, entry: Entry) -> Result<Value, Unwind> {
        let mut frame = self.enter_frame(fid, args, entry)?;
        let result = self.run_frame(&mut frame);
        self.leave_frame(frame, result)
    }

    pub fn enter_frame(&mut self, fid: FuncId, args: Vec<Value>, entry: Entry) -> Result<Frame, Unwind> {
        let Some(slot) = self.core.functions.get(fid) else {
            return Err(self.raise(self.core.c.runtime_error, &format!("unknown function {fid}")));
        };
        if self.thread.depth >= self.core.config.max_call_depth {
            return Err(self.raise(self.core.c.system_stack_error, "stack level too deep"));
        }
        self.thread.depth += 1;

        let func = slot.ir.clone();
        let id = self.core.next_frame_id();
        let mut regs = args;
        regs.resize((func.reg_count as usize).max(func.arity.real as usize), Value::NIL);
        let mut cells = entry.env;
        cells.truncate(func.env_cells as usize);
        cells.extend((0..func.own_cells).map(|_| Cell::new(Value::NIL)));
        let home = match &entry.proc_ {
            Some(b) if !b.is_lambda() => b.home,
            _ => id,
        };
        self.thread.frames.push(FrameInfo {
            id,
            func: func.clone(),
            method: entry.method.clone(),
            via_super: entry.via_super,
            block: entry.block,
            pc: 0,
            native_entry: None,
        });
        Ok(Frame {
            id,
            fid,
            self_val: entry.self_val,
            regs,
            cells,
            block: entry.block,
            method: entry.method,
            cref: entry.cref,
            home,
            proc_: entry.proc_,
            block_memo: vec![None; func.block_slots as usize],
            blocks_made: Vec::new(),
            unwind_slots: vec![None; func.unwind_slots as usize],
            unwinding: None,
            func,
        })
    }

    /// Run an entered frame on native code when available, else interpret it.
    pub fn run_frame(&mut self, frame: &mut Frame) -> Result<Value, Unwind> {
        let native = self.core.functions.get(frame.fid).and_then(|slot| self.core.jit.native(&slot, frame.fid, &self.core));
        match native {
            Some(code) => {
                if let Some(info) = self.thread.frames.last_mut() {
                    info.native_entry = Some(code.entry_address());
                }
                let args: Vec<Value> = frame.regs[..frame.func.arity.real as usize].to_vec();
                // SAFETY: both borrows are handed over as raw pointers and
                // not used again until the activation returns.
                unsafe { code.invoke(self, frame, &args) }
            }
            None => self.interpret(frame, 0),
        }
    }

    pub fn leave_frame(&mut self, frame: Frame, result: Result<Value, Unwind>) -> Result<Value, Unwind> {
        self.thread.frames.pop();
        self.thread.depth = self.thread.depth.saturating_sub(1);
        for block in &frame.blocks_made {
            block.deactivate();
        }
        match result {
            Err(Unwind::Return { tag, value }) if tag == frame.id => Ok(value),
            other => other,
        }
    }

    pub fn interpret(&mut self, frame: &mut Frame, mut pc: usize) -> Result<Value, Unwind> {
        loop {
            if pc >= frame.func.code.len() {
                return Ok(Value::NIL);
            }
            match self.step(frame, pc) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target as usize,
                Ok(Flow::Return(v)) => return Ok(v),
                Err(unwind) => match find_handler(&frame.func, pc, &unwind) {
                    Some(target) => {
                        frame.unwinding = Some(unwind);
                        pc = target as usize;
                    }
                    None => return Err(unwind),
                },
            }
        }
    }

    // ── Instructions ─────────────────────────────────────────────────

    pub fn step(&mut self, frame: &mut Frame, pc: usize) -> Result<Flow, Unwind> {
        if let Some(info) = self.thread.frames.last_mut() {
            info.pc = pc;
        }
        let op = frame.func.code[pc].clone();
        match op {
            Op::Nop => {}
            Op::LoadImm { dst, value } => frame.set(dst, value),
            Op::LoadLit { dst, lit } => {
                let v = match &frame.func.literals[lit as usize] {
                    Literal::Str(s) => self.core.new_string(s.clone()),
                    Literal::Float(f) => self.core.new_float(*f),
                    Literal::Int(n) => self.core.int_value(*n as i128),
                };
                frame.set(dst, v);
            }
            Op::LoadSelf { dst } => frame.set(dst, frame.self_val),
            Op::Move { dst, src } => frame.set(dst, frame.reg(src)),
            Op::GetCell { dst, cell } => frame.set(dst, frame.cells[cell as usize].get()),
            Op::SetCell { cell, src } => frame.cells[cell as usize].set(frame.reg(src)),
            Op::GetIvar { dst, name } => frame.set(dst, self.core.ivar_get(frame.self_val, name)),
            Op::SetIvar { name, src } => {
                if !self.core.ivar_set(frame.self_val, name, frame.reg(src)) {
                    let class = self.core.class_name(self.core.class_of(frame.self_val));
                    return Err(self.raise(self.core.c.runtime_error, &format!("can't modify frozen {class}")));
                }
            }
            Op::GetCvar { dst, name } => {
                let v = self.cvar_get(&frame.cref, name)?;
                frame.set(dst, v);
            }
            Op::SetCvar { name, src } => self.cvar_set(&frame.cref, name, frame.reg(src)),
            Op::GetGlobal { dst, name } => {
                let v = if &*self.core.symbols.name(name) == "$!" {
                    self.current_exception()
                } else {
                    self.core.global(name)
                };
                frame.set(dst, v);
            }
            Op::SetGlobal { name, src } => self.core.set_global(name, frame.reg(src)),
            Op::GetConst { dst, scope, top, name, site, soft } => {
                let v = match self.get_const(frame, scope, top, name, site, soft)? {
                    Some(v) => v,
                    None => Value::NIL,
                };
                frame.set(dst, v);
            }
            Op::SetConst { scope, name, src } => {
                let owner = match scope {
                    Some(r) => self.expect_class(frame.reg(r))?,
                    None => frame.cref[0],
                };
                self.core.set_constant(owner, name, frame.reg(src));
            }

            Op::NewArray { dst, start, count } => {
                let elements = frame.regs[start as usize..(start + count) as usize].to_vec();
                frame.set(dst, self.core.new_array(elements));
            }
            Op::ToArray { dst, src } => {
                let v = self.to_array(frame.reg(src));
                frame.set(dst, v);
            }
            Op::ConcatArray { dst, src } => {
                let extra = self.splat_elements(frame.reg(src));
                self.core.heap.with_array(frame.reg(dst), |a| a.extend(extra));
            }
            Op::ArrayPush { dst, src } => {
                let v = frame.reg(src);
                self.core.heap.with_array(frame.reg(dst), |a| a.push(v));
            }
            Op::ArrayGet { dst, src, index } => {
                let v = self
                    .core
                    .heap
                    .with_array(frame.reg(src), |a| a.get(index as usize).copied())
                    .flatten()
                    .unwrap_or(Value::NIL);
                frame.set(dst, v);
            }
            Op::ArraySlice { dst, src, start, tail } => {
                let elements = self.core.heap.array(frame.reg(src)).unwrap_or_default();
                let from = (start as usize).min(elements.len());
                let to = elements.len().saturating_sub(tail as usize).max(from);
                frame.set(dst, self.core.new_array(elements[from..to].to_vec()));
            }
            Op::ArrayPost { dst, src, start, count, index } => {
                let elements = self.core.heap.array(frame.reg(src)).unwrap_or_default();
                let first = elements.len().saturating_sub(count as usize).max(start as usize);
                frame.set(dst, elements.get(first + index as usize).copied().unwrap_or(Value::NIL));
            }
            Op::StrConcat { dst, start, count } => {
                let mut out = String::new();
                for r in start..start + count {
                    out.push_str(&builtins::to_s(self, frame.reg(r))?);
                }
                frame.set(dst, self.core.new_string(out));
            }

            Op::Send { dst, recv, sel, args, argc, splat, block, kind, site, inline, via } => {
                let recv = recv.map_or(frame.self_val, |r| frame.reg(r));
                let mut argv = self.collect_args(frame, args, argc, splat);
                let block_val = self.block_operand(frame, block)?;
                let result = match (inline, via) {
                    (Some(InlineOp::Send), Some(send)) if self.core.caches.is_redefined(InlineOp::Send) => {
                        argv.insert(0, Value::symbol(sel));
                        self.dispatch(site, recv, send, block_val, kind, &argv)
                    }
                    (Some(InlineOp::Aset), _) if !self.core.caches.is_redefined(InlineOp::Aset) => {
                        match self.array_store(recv, &argv) {
                            Some(v) => Ok(v),
                            None => self.dispatch(site, recv, sel, block_val, kind, &argv),
                        }
                    }
                    _ => self.dispatch(site, recv, sel, block_val, kind, &argv),
                };
                let v = match result {
                    Err(Unwind::Break { tag, value }) if tag == frame.id && matches!(block, BlockOperand::Literal(_)) => value,
                    other => other?,
                };
                frame.set(dst, v);
            }
            Op::Binop { op, dst, lhs, rhs, site } => {
                let v = self.binop(op, frame.reg(lhs), frame.reg(rhs), site)?;
                frame.set(dst, v);
            }
            Op::SelfCall { dst, args, argc, site } => {
                let v = match self.prepare_self_call(frame, args, argc, site)? {
                    SelfCall::Direct(mut child) => {
                        let result = self.run_frame(&mut child);
                        self.leave_frame(*child, result)?
                    }
                    SelfCall::Done(v) => v,
                };
                frame.set(dst, v);
            }
            Op::Super { dst, args, argc, splat, block, site } => {
                let argv = self.collect_args(frame, args, argc, splat);
                let block_val = self.block_operand(frame, block)?;
                let v = self.call_super(site, frame.self_val, &argv, block_val)?;
                frame.set(dst, v);
            }
            Op::Yield { dst, args, argc, splat } => {
                let argv = self.collect_args(frame, args, argc, splat);
                let v = self.yield_to_current_block(&argv)?;
                frame.set(dst, v);
            }

            Op::MakeBlock { dst, func, slot } => {
                let v = self.make_block(frame, func, slot);
                frame.set(dst, v);
            }
            Op::BlockArg { dst } => {
                let v = match frame.block {
                    Some(b) => {
                        self.escape_block(b);
                        b
                    }
                    None => Value::NIL,
                };
                frame.set(dst, v);
            }
            Op::BlockGiven { dst } => frame.set(dst, Value::bool(frame.block.is_some())),
            Op::DefMethod { dst, name, func } => {
                let class = frame.cref[0];
                self.define_compiled(class, name, func, frame.cref.clone());
                frame.set(dst, Value::symbol(name));
            }
            Op::DefSingleton { dst, target, name, func } => {
                let target = frame.reg(target);
                let Some(id) = target.as_class() else {
                    let class = self.core.class_name(self.core.class_of(target));
                    return Err(self.raise(self.core.c.type_error, &format!("can't define singleton method for an instance of {class}")));
                };
                let meta = self.core.metaclass(id);
                self.define_compiled(meta, name, func, frame.cref.clone());
                frame.set(dst, Value::symbol(name));
            }
            Op::DefClass { dst, scope, name, superclass, body, module } => {
                let v = self.def_class(frame, scope, name, superclass, body, module)?;
                frame.set(dst, v);
            }

            Op::Jump { target } => {
                // Loops observe cancellation on their back edge.
                if target as usize <= pc {
                    self.check_kill()?;
                }
                return Ok(Flow::Jump(target));
            }
            Op::Branch { cond, target, when } => {
                if frame.reg(cond).is_truthy() == when {
                    return Ok(Flow::Jump(target));
                }
            }
            Op::JumpIfDefined { src, target } => {
                if !frame.reg(src).is_undef() {
                    return Ok(Flow::Jump(target));
                }
            }
            Op::CaseSplatTest { dst, subject, list } => {
                let subject = frame.reg(subject);
                let mut hit = false;
                for pattern in self.splat_elements(frame.reg(list)) {
                    let eqq = self.core.s.eqq;
                    if self.call(pattern, eqq, &[subject], None, false)?.is_truthy() {
                        hit = true;
                        break;
                    }
                }
                frame.set(dst, Value::bool(hit));
            }
            Op::Not { dst, src } => frame.set(dst, Value::bool(!frame.reg(src).is_truthy())),
            Op::Return { src } => return Ok(Flow::Return(frame.reg(src))),
            Op::BlockReturn { src } => {
                let value = frame.reg(src);
                if frame.proc_.is_none() || frame.is_lambda() {
                    return Ok(Flow::Return(value));
                }
                if !self.thread.frames.iter().any(|f| f.id == frame.home) {
                    return Err(self.raise(self.core.c.local_jump_error, "unexpected return"));
                }
                return Err(Unwind::Return { tag: frame.home, value });
            }
            Op::BlockBreak { src } => {
                let value = frame.reg(src);
                if frame.is_lambda() {
                    return Ok(Flow::Return(value));
                }
                return match &frame.proc_ {
                    Some(b) if b.is_active() => Err(Unwind::Break { tag: b.creator, value }),
                    _ => Err(self.raise(self.core.c.local_jump_error, "break from proc-closure")),
                };
            }
            Op::LocalJump { kind } => {
                let msg = match kind {
                    JumpKind::Break => "break from proc-closure",
                    JumpKind::Next => "unexpected next",
                };
                return Err(self.raise(self.core.c.local_jump_error, msg));
            }

            Op::CatchException { dst } => match frame.unwinding.take() {
                Some(Unwind::Raise(exc)) => {
                    self.thread.raised.pop();
                    self.thread.handled.push(exc);
                    frame.set(dst, exc);
                }
                Some(other) => return Err(other),
                None => frame.set(dst, self.current_exception()),
            },
            Op::ClearException => {
                self.thread.handled.pop();
            }
            Op::Reraise { src } => {
                self.thread.handled.pop();
                return Err(self.raise_value(frame.reg(src)));
            }
            Op::SaveUnwind { slot } => {
                let unwind = frame.unwinding.take();
                if matches!(unwind, Some(Unwind::Raise(_))) {
                    self.thread.raised.pop();
                }
                frame.unwind_slots[slot as usize] = unwind;
            }
            Op::ResumeUnwind { slot } => {
                return match frame.unwind_slots[slot as usize].take() {
                    Some(Unwind::Raise(exc)) => {
                        self.thread.raised.push(exc);
                        Err(Unwind::Raise(exc))
                    }
                    Some(other) => Err(other),
                    None => Err(self.raise(self.core.c.runtime_error, "ensure resumed with nothing to unwind")),
                };
            }
        }
        Ok(Flow::Next)
    }

    // ---- operands ----

    fn collect_args(&self, frame: &Frame, args: Reg, argc: u16, splat: bool) -> Vec<Value> {
        let mut argv = frame.regs[args as usize..(args + argc) as usize].to_vec();
        if splat && let Some(last) = argv.pop() {
            argv.extend(self.splat_elements(last));
        }
        argv
    }

    fn block_operand(&mut self, frame: &Frame, block: BlockOperand) -> Result<Option<Value>, Unwind> {
        match block {
            BlockOperand::None => Ok(None),
            BlockOperand::Literal(r) => Ok(Some(frame.reg(r))),
            BlockOperand::Inherit => Ok(frame.block),
            BlockOperand::Value(r) => self.to_proc(frame.reg(r)),
        }
    }

    /// `&expr`: nil passes no block, a Symbol becomes a symbol proc.
    pub fn to_proc(&mut self, v: Value) -> Result<Option<Value>, Unwind> {
        if v.is_nil() {
            return Ok(None);
        }
        if let Some(sym) = v.as_symbol() {
            let core = &self.core;
            return Ok(Some(core.heap.alloc(Object::new(core.c.proc_, Data::Proc(Proc::Symbol(sym))))));
        }
        if self.core.heap.get(v).is_some_and(|o| matches!(o.data, Data::Proc(_))) {
            return Ok(Some(v));
        }
        let class = self.core.class_name(self.core.class_of(v));
        Err(self.raise(self.core.c.type_error, &format!("wrong argument type {class} (expected Proc)")))
    }

    /// Splat coercion: arrays pass through, nil is empty, anything else wraps.
    pub fn to_array(&self, v: Value) -> Value {
        if self.core.heap.is_array(v) {
            v
        } else {
            self.core.new_array(self.splat_elements(v))
        }
    }

    pub fn splat_elements(&self, v: Value) -> Vec<Value> {
        if v.is_nil() {
            return Vec::new();
        }
        self.core.heap.array(v).unwrap_or_else(|| vec![v])
    }

    fn array_store(&self, recv: Value, args: &[Value]) -> Option<Value> {
        let [index, value] = *args else { return None };
        let index = index.as_fixnum()?;
        self.core
            .heap
            .with_array(recv, |a| {
                let i = if index < 0 { a.len() as i64 + index } else { index };
                if i < 0 {
                    return None;
                }
                let i = i as usize;
                if i >= a.len() {
                    a.resize(i + 1, Value::NIL);
                }
                a[i] = value;
                Some(value)
            })
            .flatten()
    }

    // ---- inlined operators ----

    /// Fast path for an inlined operator, falling back to dispatch when the
    /// selector was redefined or the operands are not fixnums (arrays for
    /// `<<` and `[]`).
    pub fn binop(&mut self, op: InlineOp, lhs: Value, rhs: Value, site: u32) -> Result<Value, Unwind> {
        if !self.core.caches.is_redefined(op)
            && let Some(v) = self.binop_fast(op, lhs, rhs)
        {
            return Ok(v);
        }
        let sel = self.core.symbols.intern(op.selector());
        self.dispatch(site, lhs, sel, None, crate::ir::CallKind::Normal, &[rhs])
    }

    fn binop_fast(&self, op: InlineOp, lhs: Value, rhs: Value) -> Option<Value> {
        match op {
            InlineOp::Shl => {
                return self.core.heap.with_array(lhs, |a| a.push(rhs)).map(|_| lhs);
            }
            InlineOp::Aref => {
                let i = rhs.as_fixnum()?;
                return self
                    .core
                    .heap
                    .with_array(lhs, |a| {
                        let i = if i < 0 { a.len() as i64 + i } else { i };
                        usize::try_from(i).ok().and_then(|i| a.get(i).copied()).unwrap_or(Value::NIL)
                    });
            }
            _ => {}
        }
        let (a, b) = (lhs.as_fixnum()? as i128, rhs.as_fixnum()? as i128);
        Some(match op {
            InlineOp::Plus => self.core.int_value(a + b),
            InlineOp::Minus => self.core.int_value(a - b),
            InlineOp::Mul => self.core.int_value(a * b),
            InlineOp::Div if b != 0 => self.core.int_value(builtins::numeric::floor_div(a, b)),
            InlineOp::Lt => Value::bool(a < b),
            InlineOp::Le => Value::bool(a <= b),
            InlineOp::Gt => Value::bool(a > b),
            InlineOp::Ge => Value::bool(a >= b),
            InlineOp::Eq | InlineOp::Eqq => Value::bool(a == b),
            InlineOp::Ne => Value::bool(a != b),
            _ => return None,
        })
    }

    // ---- recursion ----

    /// Enter the current method directly when `self.<sel>` still resolves to
    /// it, otherwise dispatch normally.
    pub fn prepare_self_call(&mut self, frame: &Frame, args: Reg, argc: u16, site: u32) -> Result<SelfCall, Unwind> {
        let argv = self.collect_args(frame, args, argc, false);
        let sel = frame.func.selector.or(frame.method.as_ref().map(|m| m.selector));
        let Some(sel) = sel else {
            return Err(self.raise(self.core.c.runtime_error, "self call outside of a method"));
        };
        let class = self.core.class_of(frame.self_val);
        let current = self.resolve_cached(site, class, sel);
        match (&frame.method, current) {
            (Some(method), Some(target)) if Arc::ptr_eq(method, &target) && !self.thread.kill.load(Ordering::Acquire) => {
                if !method.arity.accepts(argv.len()) {
                    return Err(self.raise(self.core.c.argument_error, &method.arity.mismatch_message(argv.len())));
                }
                let entry = Entry::method(frame.self_val, method, None, false);
                let child = self.enter_frame(frame.fid, argv, entry)?;
                Ok(SelfCall::Direct(Box::new(child)))
            }
            _ => self.dispatch(site, frame.self_val, sel, None, crate::ir::CallKind::FCall, &argv).map(SelfCall::Done),
        }
    }

    // ---- blocks ----

    fn make_block(&mut self, frame: &mut Frame, func: FuncId, slot: u16) -> Value {
        if let Some(v) = frame.block_memo[slot as usize]
            && self.block_of(v).is_some_and(|b| !b.is_proc())
        {
            return v;
        }
        let arity = self.core.functions.get(func).map(|s| s.ir.arity).unwrap_or_default();
        let block = Arc::new(Block::new(
            func,
            frame.self_val,
            frame.cells.clone(),
            arity,
            frame.method.clone(),
            frame.cref.clone(),
            frame.block,
            frame.home,
            frame.id,
            false,
        ));
        frame.blocks_made.push(block.clone());
        let core = &self.core;
        let v = core.heap.alloc(Object::new(core.c.proc_, Data::Proc(Proc::Block(block))));
        frame.block_memo[slot as usize] = Some(v);
        v
    }

    pub fn block_of(&self, v: Value) -> Option<Arc<Block>> {
        match &self.core.heap.get(v)?.data {
            Data::Proc(Proc::Block(b)) => Some(b.clone()),
            _ => None,
        }
    }

    /// The block escaped into a first-class Proc: later activations of the
    /// same literal must not reuse it.
    pub fn escape_block(&self, v: Value) {
        if let Some(b) = self.block_of(v) {
            b.mark_proc();
        }
    }

    // ---- definitions ----

    fn define_compiled(&self, class: ClassId, name: Symbol, func: FuncId, cref: Cref) {
        let Some(slot) = self.core.functions.get(func) else { return };
        let ir = &slot.ir;
        let flags = MethodFlags { empty_body: ir.empty_body, variadic: ir.arity.real > crate::jit::MAX_FIXED_ARGS };
        self.core.define_method(class, name, MethodBody::Compiled(func), ir.arity, flags, cref);
    }

    fn def_class(
        &mut self,
        frame: &Frame,
        scope: Option<Reg>,
        name: Symbol,
        superclass: Option<Reg>,
        body: FuncId,
        module: bool,
    ) -> Result<Value, Unwind> {
        let container = match scope {
            Some(r) => self.expect_class(frame.reg(r))?,
            None => frame.cref[0],
        };
        let superclass = match superclass {
            Some(r) => Some(self.expect_class(frame.reg(r))?),
            None => None,
        };
        let label = self.core.symbols.name(name);
        let existing = self.core.classes.get(container).constant(name);
        let id = match existing {
            Some(v) => {
                let Some(id) = v.as_class() else {
                    return Err(self.raise(self.core.c.type_error, &format!("{label} is not a {}", if module { "module" } else { "class" })));
                };
                let class = self.core.classes.get(id);
                if class.is_module != module {
                    return Err(self.raise(self.core.c.type_error, &format!("{label} is not a {}", if module { "module" } else { "class" })));
                }
                if let Some(sup) = superclass
                    && class.superclass != Some(sup)
                {
                    return Err(self.raise(self.core.c.type_error, &format!("superclass mismatch for class {label}")));
                }
                id
            }
            None => self.core.define_class(container, name, superclass, module),
        };
        let mut cref = Vec::with_capacity(frame.cref.len() + 1);
        cref.push(id);
        cref.extend(frame.cref.iter().copied());
        let entry = Entry {
            self_val: Value::class(id),
            block: None,
            method: None,
            cref: Arc::new(cref),
            env: Vec::new(),
            proc_: None,
            via_super: false,
        };
        self.execute(body, Vec::new(), entry)
    }

    // ---- variables ----

    /// `Ok(None)` only for a soft read of a missing constant.
    fn get_const(
        &mut self,
        frame: &Frame,
        scope: Option<Reg>,
        top: bool,
        name: Symbol,
        site: u32,
        soft: bool,
    ) -> Result<Option<Value>, Unwind> {
        let core = self.core.clone();
        let (key, lexical) = match scope {
            Some(r) => (self.expect_class(frame.reg(r))?, false),
            None if top => (core.c.object, false),
            None => (frame.cref[0], true),
        };
        if let Some(v) = core.caches.lookup_const(site, key) {
            return Ok(Some(v));
        }
        let generation = core.caches.const_generation();
        let found = if lexical { core.lookup_constant(&frame.cref, name) } else { core.constant_in(key, name) };
        match found {
            Some(v) => {
                core.caches.store_const(site, generation, key, v);
                Ok(Some(v))
            }
            None if soft => Ok(None),
            None => {
                let label = core.symbols.name(name);
                let msg = if scope.is_some() {
                    format!("uninitialized constant {}::{label}", core.class_name(key))
                } else {
                    format!("uninitialized constant {label}")
                };
                Err(self.raise(core.c.name_error, &msg))
            }
        }
    }

    fn cvar_owner(&self, cref: &Cref, name: Symbol) -> Option<ClassId> {
        let base = self.class_var_base(cref);
        self.core.classes.ancestors(base).into_iter().find(|&c| self.core.classes.get(c).cvars.read().contains_key(&name))
    }

    /// Class variables of a singleton-method body belong to the attached class.
    fn class_var_base(&self, cref: &Cref) -> ClassId {
        let c = cref[0];
        self.core.classes.get(c).attached.unwrap_or(c)
    }

    fn cvar_get(&mut self, cref: &Cref, name: Symbol) -> Result<Value, Unwind> {
        if let Some(owner) = self.cvar_owner(cref, name)
            && let Some(v) = self.core.classes.get(owner).cvars.read().get(&name).copied()
        {
            return Ok(v);
        }
        let msg = format!(
            "uninitialized class variable {} in {}",
            self.core.symbols.name(name),
            self.core.class_name(self.class_var_base(cref))
        );
        Err(self.raise(self.core.c.name_error, &msg))
    }

    fn cvar_set(&self, cref: &Cref, name: Symbol, value: Value) {
        let owner = self.cvar_owner(cref, name).unwrap_or_else(|| self.class_var_base(cref));
        self.core.classes.get(owner).cvars.write().insert(name, value);
    }

    pub fn expect_class(&mut self, v: Value) -> Result<ClassId, Unwind> {
        match v.as_class() {
            Some(id) => Ok(id),
            None => {
                let desc = builtins::inspect(self, v)?;
                Err(self.raise(self.core.c.type_error, &format!("{desc} is not a class/module")))
            }
        }
    }

    // ── Exceptions ───────────────────────────────────────────────────

    /// `$!`
    pub fn current_exception(&self) -> Value {
        self.thread.handled.last().copied().unwrap_or(Value::NIL)
    }

    /// New exception object carrying the current backtrace.
    pub fn exception(&self, class: ClassId, message: &str) -> Value {
        let exc = self.core.make_exception(class, message);
        self.attach_backtrace(exc);
        exc
    }

    pub fn raise(&mut self, class: ClassId, message: &str) -> Unwind {
        let exc = self.exception(class, message);
        self.raise_value(exc)
    }

    /// Throw an existing exception object. Its backtrace is kept if it has one.
    pub fn raise_value(&mut self, exc: Value) -> Unwind {
        if self.core.ivar_get(exc, self.core.s.backtrace).is_nil() {
            self.attach_backtrace(exc);
        }
        self.thread.raised.push(exc);
        Unwind::Raise(exc)
    }

    fn attach_backtrace(&self, exc: Value) {
        let lines = self.backtrace().into_iter().map(|l| self.core.new_string(l)).collect();
        let array = self.core.new_array(lines);
        self.core.ivar_set(exc, self.core.s.backtrace, array);
    }

    /// `file:line:in 'name'` for every live compiled frame, innermost first.
    /// Frames running native code are named through the code-range table.
    pub fn backtrace(&self) -> Vec<String> {
        self.thread
            .frames
            .iter()
            .rev()
            .map(|f| {
                let name = f
                    .native_entry
                    .and_then(|addr| self.core.resolve_address(addr))
                    .map(|(name, _)| name)
                    .unwrap_or_else(|| f.func.name.clone());
                let label = match f.func.kind {
                    FunctionKind::Block => format!("block in {name}"),
                    _ => name,
                };
                format!("{}:{}:in `{label}'", f.func.file, f.func.line_at(f.pc))
            })
            .collect()
    }

    /// Convert an unwind that escaped the main thread into a library error.
    pub fn uncaught(&mut self, unwind: Unwind) -> Error {
        let core = self.core.clone();
        match unwind {
            Unwind::Raise(exc) => {
                let class = core.class_name(core.class_of(exc));
                let message = builtins::exception_message(self, exc);
                let backtrace = core
                    .heap
                    .array(core.ivar_get(exc, core.s.backtrace))
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|l| core.heap.string(l))
                    .collect();
                Error::Uncaught { class, message, backtrace }
            }
            Unwind::Break { .. } => Error::Uncaught {
                class: "LocalJumpError".into(),
                message: "break from proc-closure".into(),
                backtrace: Vec::new(),
            },
            Unwind::Return { .. } => Error::Uncaught {
                class: "LocalJumpError".into(),
                message: "unexpected return".into(),
                backtrace: Vec::new(),
            },
            Unwind::Kill => Error::Uncaught { class: "Thread".into(), message: "main thread killed".into(), backtrace: Vec::new() },
        }
    }
}

/// How a direct self call proceeds.
pub enum SelfCall {
    /// Child frame entered; the caller runs it and leaves it.
    Direct(Box<Frame>),
    /// The guard failed and a normal dispatch already produced the result.
    Done(Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::runtime::Capture;

    fn run(root: crate::ast::Node) -> (Result<Value, Unwind>, Interp) {
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        let top = core.load(&Program::new("test.rb", root)).unwrap();
        let mut interp = Interp::main(core);
        let r = interp.run_top(top);
        (r, interp)
    }

    #[test]
    fn arithmetic_and_locals() {
        let (r, _) = run(seq(vec![lasgn("a", int(40)), call(lvar("a"), "+", vec![int(2)])]));
        assert_eq!(r, Ok(Value::int(42)));
    }

    #[test]
    fn fixnum_overflow_boxes() {
        let max = Value::FIXNUM_MAX;
        let (r, interp) = run(call(int(max), "+", vec![int(1)]));
        let v = r.unwrap();
        assert_eq!(interp.core.int_of(v), Some(max as i128 + 1));
    }

    #[test]
    fn floor_division_matches_ruby() {
        let (r, _) = run(call(int(-7), "/", vec![int(2)]));
        assert_eq!(r, Ok(Value::int(-4)));
    }

    #[test]
    fn rescue_pops_in_flight_exception_once() {
        let body = begin(
            Some(fcall("raise", vec![str_("x")])),
            vec![rescue(vec![], Some("e"), Some(sym("handled")))],
            None,
            None,
        );
        let (r, interp) = run(body);
        assert_eq!(r, Ok(interp.core.symbol_value("handled")));
        assert!(interp.thread.raised.is_empty());
        assert!(interp.thread.handled.is_empty());
    }

    #[test]
    fn backtrace_names_method_and_line() {
        let prog = seq(vec![
            def("boom", params(), Some(fcall("raise", vec![str_("no")]).at(2))).at(1),
            fcall("boom", vec![]).at(3),
        ]);
        let (r, mut interp) = run(prog);
        let Err(u) = r else { panic!("expected raise") };
        let Error::Uncaught { class, message, backtrace } = interp.uncaught(u) else { panic!() };
        assert_eq!((class.as_str(), message.as_str()), ("RuntimeError", "no"));
        assert_eq!(backtrace[0], "test.rb:2:in `boom'");
        assert_eq!(backtrace[1], "test.rb:3:in `<main>'");
    }

    #[test]
    fn depth_limit_raises_system_stack_error() {
        let core = Core::with_output(
            Config { jit: false, max_call_depth: 50, ..Config::default() },
            Box::new(Capture::new()),
        );
        let prog = seq(vec![def("f", params(), Some(fcall("f", vec![]))), fcall("f", vec![])]);
        let top = core.load(&Program::new("t.rb", prog)).unwrap();
        let mut interp = Interp::main(core.clone());
        let Err(Unwind::Raise(exc)) = interp.run_top(top) else { panic!("expected raise") };
        assert_eq!(core.class_of(exc), core.c.system_stack_error);
        assert_eq!(interp.thread.depth, 0);
    }
}
