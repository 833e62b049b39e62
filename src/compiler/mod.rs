//! AST to register IR.
//!
//! Every scope (top level, class body, method, block) becomes one
//! [`Function`]. Expressions compile into a destination register chosen by
//! the caller; temporaries are allocated above the locals and released when
//! the expression that needed them is done. Captured locals live in cells
//! decided by [`scope::Analysis`].

mod assign;
mod rescue;
pub mod scope;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::ast::{Node, NodeKind, Params, Program, When};
use crate::ir::{BlockOperand, CallKind, FuncId, Function, FunctionKind, Handler, JumpKind, Literal, Op, Reg};
use crate::runtime::Core;
use crate::runtime::arity::Arity;
use crate::runtime::cache::InlineOp;
use crate::runtime::symbol::Symbol;
use crate::value::Value;
use rescue::Protect;
use scope::{Analysis, ScopeId, positional};

// ── Errors ──────────────────────────────────────────────────────────

/// A tree the compiler cannot translate. These are contract violations of
/// the AST producer and never become Ruby exceptions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{file}:{line}: {kind}")]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// `retry` outside a rescue clause, `redo` outside a loop, block or method.
    #[error("Invalid {0}")]
    InvalidJump(&'static str),
    #[error("unexpected `{0}` node here")]
    Unexpected(&'static str),
    #[error("cannot assign to `{0}`")]
    NotAssignable(&'static str),
    #[error("local variable `{0}` has no resolved scope")]
    Unresolved(String),
    #[error("too many {what} in `{function}`")]
    Exhausted { what: &'static str, function: String },
}

impl CompileError {
    /// Short stable code for diagnostics.
    pub fn code(&self) -> &'static str {
        match self.kind {
            ErrorKind::InvalidJump(_) => "C001",
            ErrorKind::Unexpected(_) => "C002",
            ErrorKind::NotAssignable(_) => "C003",
            ErrorKind::Unresolved(_) => "C004",
            ErrorKind::Exhausted { .. } => "C005",
        }
    }
}

type Result<T> = std::result::Result<T, CompileError>;

/// Compile a whole program. Returns the top-level function; every nested
/// scope is registered in `core.functions` along the way.
pub fn compile_program(core: &Core, program: &Program) -> Result<FuncId> {
    let analysis = Analysis::run(&program.root);
    let mut c = Compiler {
        core,
        program: core.next_program_id(),
        file: Arc::from(program.file.as_str()),
        analysis,
        cur: FnBuilder::default(),
        outer: Vec::new(),
    };
    let spec = FnSpec {
        kind: FunctionKind::Top,
        name: "<main>".to_string(),
        line: program.root.line,
        scope: 0,
        params: None,
        selector: None,
    };
    let id = c.function(spec, Some(&program.root))?;
    debug!(file = %program.file, functions = core.functions.len(), "program compiled");
    Ok(id)
}

// ── Builder state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Reg(Reg),
    Cell(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

#[derive(Debug, Default)]
struct LabelState {
    pos: Option<u32>,
    pending: Vec<usize>,
}

/// Targets of `break`/`next`/`redo` inside a `while`/`until`.
#[derive(Debug, Clone, Copy)]
struct LoopCtx {
    result: Reg,
    next: Label,
    redo: Label,
    end: Label,
    /// Protected regions open when the loop started.
    protect: usize,
}

struct FnSpec<'n> {
    kind: FunctionKind,
    name: String,
    line: u32,
    scope: ScopeId,
    params: Option<&'n Params>,
    selector: Option<Symbol>,
}

struct FnBuilder {
    kind: FunctionKind,
    name: String,
    line: u32,
    scope: ScopeId,
    arity: Arity,
    selector: Option<Symbol>,
    locals: HashMap<String, Slot>,
    cell_base: u16,
    own_cells: u16,
    code: Vec<Op>,
    lines: Vec<u32>,
    at_line: u32,
    next_reg: u32,
    reg_count: u32,
    block_slots: u16,
    unwind_slots: u16,
    literals: Vec<Literal>,
    handlers: Vec<Handler>,
    labels: Vec<LabelState>,
    loops: Vec<LoopCtx>,
    protects: Vec<Protect>,
    /// `retry` targets: begin label and protect depth, innermost last.
    retries: Vec<(Label, usize)>,
    /// Start of the body, after parameter setup; `redo` lands here.
    entry: Label,
    empty_body: bool,
}

impl Default for FnBuilder {
    fn default() -> Self {
        FnBuilder {
            kind: FunctionKind::Top,
            name: String::new(),
            line: 0,
            scope: 0,
            arity: Arity::default(),
            selector: None,
            locals: HashMap::new(),
            cell_base: 0,
            own_cells: 0,
            code: Vec::new(),
            lines: Vec::new(),
            at_line: 0,
            next_reg: 0,
            reg_count: 0,
            block_slots: 0,
            unwind_slots: 0,
            literals: Vec::new(),
            handlers: Vec::new(),
            labels: Vec::new(),
            loops: Vec::new(),
            protects: Vec::new(),
            retries: Vec::new(),
            entry: Label(0),
            empty_body: false,
        }
    }
}

pub(crate) struct Compiler<'a> {
    core: &'a Core,
    program: u32,
    file: Arc<str>,
    analysis: Analysis,
    /// Function being emitted.
    cur: FnBuilder,
    /// Suspended enclosing functions, outermost first.
    outer: Vec<FnBuilder>,
}

impl<'a> Compiler<'a> {
    // ---- functions ----

    fn function(&mut self, spec: FnSpec<'_>, body: Option<&Node>) -> Result<FuncId> {
        let builder = self.builder(&spec, body.is_none())?;
        let parent = std::mem::replace(&mut self.cur, builder);
        self.outer.push(parent);
        let result = self.function_body(spec.params, body);
        let parent = self.outer.pop().unwrap_or_default();
        let builder = std::mem::replace(&mut self.cur, parent);
        result?;
        let function = self.build(builder)?;
        trace!(function = %function.name, ops = function.code.len(), "ir\n{function}");
        Ok(self.core.functions.register(function))
    }

    /// Lay out locals: parameters in argument slots, other unboxed locals in
    /// the registers after them, boxed locals in cells after the inherited
    /// environment.
    fn builder(&self, spec: &FnSpec<'_>, empty: bool) -> Result<FnBuilder> {
        let info = self.analysis.scope(spec.scope);
        let arity = spec.params.map(Arity::from_params).unwrap_or_default();
        let cell_base = match spec.kind {
            FunctionKind::Block => self.cur.cell_base + self.cur.own_cells,
            _ => 0,
        };
        let exhausted = |what| CompileError {
            file: self.file.to_string(),
            line: spec.line,
            kind: ErrorKind::Exhausted { what, function: spec.name.clone() },
        };

        let mut locals = HashMap::new();
        let mut cells = cell_base as usize;
        for name in info.boxed_vars() {
            locals.insert(name.clone(), Slot::Cell(u16::try_from(cells).map_err(|_| exhausted("captured variables"))?));
            cells += 1;
        }
        let params = spec.params.map(positional).unwrap_or_default();
        for (i, name) in params.iter().enumerate() {
            if !info.is_boxed(name) {
                locals.entry(name.clone()).or_insert(Slot::Reg(i as Reg));
            }
        }
        let mut next = arity.real as u32;
        for name in &info.vars {
            if !locals.contains_key(name) {
                locals.insert(name.clone(), Slot::Reg(next as Reg));
                next += 1;
            }
        }
        if next >= Reg::MAX as u32 {
            return Err(exhausted("local variables"));
        }

        let mut b = FnBuilder {
            kind: spec.kind,
            name: spec.name.clone(),
            line: spec.line,
            scope: spec.scope,
            arity,
            selector: spec.selector,
            locals,
            cell_base,
            own_cells: (cells - cell_base as usize) as u16,
            at_line: spec.line,
            next_reg: next,
            reg_count: next,
            empty_body: empty && spec.kind == FunctionKind::Method,
            ..FnBuilder::default()
        };
        b.labels.push(LabelState::default());
        b.entry = Label(0);
        Ok(b)
    }

    fn function_body(&mut self, params: Option<&Params>, body: Option<&Node>) -> Result<()> {
        if let Some(p) = params {
            self.prologue(p)?;
        }
        let entry = self.cur.entry;
        self.place(entry);
        let result = self.tmp()?;
        self.expr_opt(body, result)?;
        self.emit(Op::Return { src: result });
        Ok(())
    }

    /// Default values for optionals not supplied, then copy captured
    /// parameters into their cells.
    fn prologue(&mut self, p: &Params) -> Result<()> {
        let left = p.required.len();
        for (i, name) in positional(p).iter().enumerate() {
            let reg = i as Reg;
            if let Some(opt) = i.checked_sub(left).and_then(|k| p.optional.get(k)) {
                let skip = self.label();
                self.jump_to(skip, |target| Op::JumpIfDefined { src: reg, target });
                self.expr(&opt.value, reg)?;
                self.place(skip);
            }
            if let Some(Slot::Cell(cell)) = self.cur.locals.get(name).copied() {
                self.emit(Op::SetCell { cell, src: reg });
            }
        }
        if let Some(name) = &p.block {
            match self.cur.locals.get(name).copied() {
                Some(Slot::Reg(dst)) => {
                    self.emit(Op::BlockArg { dst });
                }
                Some(Slot::Cell(cell)) => {
                    let t = self.tmp()?;
                    self.emit(Op::BlockArg { dst: t });
                    self.emit(Op::SetCell { cell, src: t });
                }
                None => {}
            }
        }
        Ok(())
    }

    fn build(&self, mut b: FnBuilder) -> Result<Function> {
        if b.labels.iter().any(|l| l.pos.is_none() && !l.pending.is_empty()) {
            return Err(self.error(b.line, ErrorKind::Unexpected("unplaced jump target")));
        }
        b.handlers.retain(|h| !h.ranges.is_empty());
        b.handlers.sort_by(|x, y| y.depth.cmp(&x.depth));
        Ok(Function {
            name: b.name,
            file: self.file.clone(),
            line: b.line,
            kind: b.kind,
            arity: b.arity,
            selector: b.selector,
            reg_count: b.reg_count as u16,
            own_cells: b.own_cells,
            env_cells: b.cell_base,
            block_slots: b.block_slots,
            unwind_slots: b.unwind_slots,
            empty_body: b.empty_body,
            code: b.code,
            lines: b.lines,
            handlers: b.handlers,
            literals: b.literals,
        })
    }

    // ---- emission ----

    fn error(&self, line: u32, kind: ErrorKind) -> CompileError {
        CompileError { file: self.file.to_string(), line, kind }
    }

    fn err(&self, node: &Node, kind: ErrorKind) -> CompileError {
        self.error(node.line, kind)
    }

    fn exhausted(&self, what: &'static str) -> CompileError {
        self.error(self.cur.at_line, ErrorKind::Exhausted { what, function: self.cur.name.clone() })
    }

    fn pc(&self) -> u32 {
        self.cur.code.len() as u32
    }

    fn emit(&mut self, op: Op) -> usize {
        self.cur.code.push(op);
        self.cur.lines.push(self.cur.at_line);
        self.cur.code.len() - 1
    }

    fn intern(&self, name: &str) -> Symbol {
        self.core.symbols.intern(name)
    }

    fn tmp(&mut self) -> Result<Reg> {
        self.tmps(1)
    }

    /// `n` contiguous temporaries; the first one is returned.
    fn tmps(&mut self, n: usize) -> Result<Reg> {
        let start = self.cur.next_reg;
        let end = start as usize + n;
        if end >= Reg::MAX as usize {
            return Err(self.exhausted("registers"));
        }
        self.cur.next_reg = end as u32;
        self.cur.reg_count = self.cur.reg_count.max(self.cur.next_reg);
        Ok(start as Reg)
    }

    fn mark(&self) -> u32 {
        self.cur.next_reg
    }

    fn release(&mut self, mark: u32) {
        self.cur.next_reg = mark;
    }

    fn literal(&mut self, lit: Literal) -> u32 {
        if let Some(i) = self.cur.literals.iter().position(|l| *l == lit) {
            return i as u32;
        }
        self.cur.literals.push(lit);
        (self.cur.literals.len() - 1) as u32
    }

    fn load(&mut self, dst: Reg, value: Value) {
        self.emit(Op::LoadImm { dst, value });
    }

    fn label(&mut self) -> Label {
        self.cur.labels.push(LabelState::default());
        Label(self.cur.labels.len() - 1)
    }

    fn place(&mut self, label: Label) {
        let pc = self.pc();
        let state = &mut self.cur.labels[label.0];
        state.pos = Some(pc);
        for i in std::mem::take(&mut state.pending) {
            if let Some(t) = self.cur.code[i].targets_mut() {
                *t = pc;
            }
        }
    }

    fn jump_to(&mut self, label: Label, make: impl FnOnce(u32) -> Op) {
        let pos = self.cur.labels[label.0].pos;
        let i = self.emit(make(pos.unwrap_or(u32::MAX)));
        if pos.is_none() {
            self.cur.labels[label.0].pending.push(i);
        }
    }

    fn jump(&mut self, label: Label) {
        self.jump_to(label, |target| Op::Jump { target });
    }

    fn branch(&mut self, cond: Reg, when: bool, label: Label) {
        self.jump_to(label, |target| Op::Branch { cond, target, when });
    }

    fn send(&mut self, dst: Reg, recv: Option<Reg>, sel: Symbol, args: Reg, argc: u16, kind: CallKind) {
        let site = self.core.caches.new_call_site();
        self.emit(Op::Send {
            dst,
            recv,
            sel,
            args,
            argc,
            splat: false,
            block: BlockOperand::None,
            kind,
            site,
            inline: None,
            via: None,
        });
    }

    /// `dst = lhs op rhs`, inlined when operator inlining is on.
    fn binary(&mut self, op: InlineOp, dst: Reg, lhs: Reg, rhs: Reg) {
        if self.core.config.inline_operators && op.is_binary() {
            let site = self.core.caches.new_call_site();
            self.emit(Op::Binop { op, dst, lhs, rhs, site });
        } else {
            let sel = self.intern(op.selector());
            self.send(dst, Some(lhs), sel, rhs, 1, CallKind::Normal);
        }
    }

    // ---- locals ----

    /// Slot of local `name` declared in `owner`, as seen from the current
    /// function.
    fn slot_in(&self, owner: ScopeId, name: &str, line: u32) -> Result<Slot> {
        let unresolved = || self.error(line, ErrorKind::Unresolved(name.to_string()));
        if owner == self.cur.scope {
            return self.cur.locals.get(name).copied().ok_or_else(unresolved);
        }
        let outer = self.outer.iter().rev().find(|b| b.scope == owner).ok_or_else(unresolved)?;
        match outer.locals.get(name) {
            Some(Slot::Cell(c)) => Ok(Slot::Cell(*c)),
            _ => Err(unresolved()),
        }
    }

    fn slot_of(&self, node: &Node, name: &str) -> Result<Slot> {
        let owner = self
            .analysis
            .owner(node.id)
            .ok_or_else(|| self.err(node, ErrorKind::Unresolved(name.to_string())))?;
        self.slot_in(owner, name, node.line)
    }

    fn read_slot(&mut self, slot: Slot, dst: Reg) {
        match slot {
            Slot::Reg(src) => {
                if src != dst {
                    self.emit(Op::Move { dst, src });
                }
            }
            Slot::Cell(cell) => {
                self.emit(Op::GetCell { dst, cell });
            }
        }
    }

    fn write_slot(&mut self, slot: Slot, src: Reg) {
        match slot {
            Slot::Reg(dst) => {
                if src != dst {
                    self.emit(Op::Move { dst, src });
                }
            }
            Slot::Cell(cell) => {
                self.emit(Op::SetCell { cell, src });
            }
        }
    }

    fn write_local(&mut self, node: &Node, name: &str, src: Reg) -> Result<()> {
        let slot = self.slot_of(node, name)?;
        self.write_slot(slot, src);
        Ok(())
    }

    // ── Expressions ─────────────────────────────────────────────────

    fn expr(&mut self, node: &Node, dst: Reg) -> Result<()> {
        let line = std::mem::replace(&mut self.cur.at_line, node.line);
        let mark = self.mark();
        let result = self.expr_kind(node, dst);
        self.release(mark);
        self.cur.at_line = line;
        result
    }

    fn expr_opt(&mut self, node: Option<&Node>, dst: Reg) -> Result<()> {
        match node {
            Some(n) => self.expr(n, dst),
            None => {
                self.load(dst, Value::NIL);
                Ok(())
            }
        }
    }

    /// Compile into a fresh temporary that outlives the call.
    fn value(&mut self, node: &Node) -> Result<Reg> {
        let t = self.tmp()?;
        self.expr(node, t)?;
        Ok(t)
    }

    fn discard(&mut self, node: &Node) -> Result<()> {
        let mark = self.mark();
        let t = self.tmp()?;
        let result = self.expr(node, t);
        self.release(mark);
        result
    }

    fn expr_kind(&mut self, node: &Node, dst: Reg) -> Result<()> {
        match &node.kind {
            NodeKind::Nil => self.load(dst, Value::NIL),
            NodeKind::True => self.load(dst, Value::TRUE),
            NodeKind::False => self.load(dst, Value::FALSE),
            NodeKind::SelfRef => {
                self.emit(Op::LoadSelf { dst });
            }
            NodeKind::Int { value } => match Value::fixnum(*value) {
                Some(v) => self.load(dst, v),
                None => {
                    let lit = self.literal(Literal::Int(*value));
                    self.emit(Op::LoadLit { dst, lit });
                }
            },
            NodeKind::Float { value } => {
                let lit = self.literal(Literal::Float(*value));
                self.emit(Op::LoadLit { dst, lit });
            }
            NodeKind::Str { value } => {
                let lit = self.literal(Literal::Str(value.clone()));
                self.emit(Op::LoadLit { dst, lit });
            }
            NodeKind::Dstr { parts } => {
                let start = self.tmps(parts.len())?;
                for (i, part) in parts.iter().enumerate() {
                    self.expr(part, start + i as Reg)?;
                }
                let count = self.count(parts.len())?;
                self.emit(Op::StrConcat { dst, start, count });
            }
            NodeKind::Sym { name } => {
                let sym = self.intern(name);
                self.load(dst, Value::symbol(sym));
            }
            NodeKind::Array { elements } => self.array(elements, dst)?,
            NodeKind::Splat { value } => {
                let src = self.value(value)?;
                self.emit(Op::ToArray { dst, src });
            }
            NodeKind::BlockPass { .. } | NodeKind::Iter { .. } => {
                return Err(self.err(node, ErrorKind::Unexpected(node.kind_name())));
            }

            NodeKind::Lvar { name } => {
                let slot = self.slot_of(node, name)?;
                self.read_slot(slot, dst);
            }
            NodeKind::Ivar { name } => {
                let name = self.intern(name);
                self.emit(Op::GetIvar { dst, name });
            }
            NodeKind::Cvar { name } => {
                let name = self.intern(name);
                self.emit(Op::GetCvar { dst, name });
            }
            NodeKind::Gvar { name } => {
                let name = self.intern(name);
                self.emit(Op::GetGlobal { dst, name });
            }
            NodeKind::Const { scope, top, name } => {
                let scope = scope.as_deref().map(|s| self.value(s)).transpose()?;
                let name = self.intern(name);
                let site = self.core.caches.new_const_site();
                self.emit(Op::GetConst { dst, scope, top: *top, name, site, soft: false });
            }
            NodeKind::Lasgn { .. }
            | NodeKind::Iasgn { .. }
            | NodeKind::Cvasgn { .. }
            | NodeKind::Gasgn { .. }
            | NodeKind::Cdecl { .. } => self.assign(node, dst)?,
            NodeKind::AttrAsgn { receiver, name, args } => self.attr_asgn(node, receiver, name, args, dst)?,
            NodeKind::Masgn { pre, splat, post, value } => {
                let Some(value) = value else {
                    return Err(self.err(node, ErrorKind::Unexpected("masgn target")));
                };
                self.masgn(pre, splat.as_deref(), post, value, dst)?;
            }
            NodeKind::OpAsgn { target, op, value } => self.op_asgn(target, op, value, dst)?,

            NodeKind::Call { receiver, name, args, block } => {
                self.call(receiver.as_deref(), name, args, block.as_deref(), dst)?;
            }
            NodeKind::Vcall { name } => {
                let sel = self.intern(name);
                let args = self.mark() as Reg;
                self.send(dst, None, sel, args, 0, CallKind::VCall);
            }
            NodeKind::Super { args, block } => self.super_call(args, block.as_deref(), dst)?,
            NodeKind::Zsuper { block } => self.zsuper(block.as_deref(), dst)?,
            NodeKind::Yield { args } => {
                let (a, pass) = self.call_args(args)?;
                if let Some(pass) = pass {
                    return Err(self.err(pass, ErrorKind::Unexpected("block_pass")));
                }
                self.emit(Op::Yield { dst, args: a.start, argc: a.argc, splat: a.splat });
            }

            NodeKind::Not { value } => {
                let src = self.value(value)?;
                self.emit(Op::Not { dst, src });
            }
            NodeKind::And { left, right } | NodeKind::Or { left, right } => {
                let end = self.label();
                self.expr(left, dst)?;
                let is_and = matches!(node.kind, NodeKind::And { .. });
                self.branch(dst, !is_and, end);
                self.expr(right, dst)?;
                self.place(end);
            }
            NodeKind::If { cond, then_body, else_body } => {
                let c = self.value(cond)?;
                let (otherwise, end) = (self.label(), self.label());
                self.branch(c, false, otherwise);
                self.expr_opt(then_body.as_deref(), dst)?;
                self.jump(end);
                self.place(otherwise);
                self.expr_opt(else_body.as_deref(), dst)?;
                self.place(end);
            }
            NodeKind::While { cond, body, post } => self.while_loop(cond, body.as_deref(), *post, false, dst)?,
            NodeKind::Until { cond, body, post } => self.while_loop(cond, body.as_deref(), *post, true, dst)?,
            NodeKind::Case { subject, whens, else_body } => {
                self.case(subject.as_deref(), whens, else_body.as_deref(), dst)?;
            }
            NodeKind::Begin { body, rescues, else_body, ensure } => {
                self.begin(body.as_deref(), rescues, else_body.as_deref(), ensure.as_deref(), dst)?;
            }
            NodeKind::Seq { stmts } => match stmts.split_last() {
                Some((last, init)) => {
                    for s in init {
                        self.discard(s)?;
                    }
                    self.expr(last, dst)?;
                }
                None => self.load(dst, Value::NIL),
            },

            NodeKind::Return { value } => self.ret(value.as_deref())?,
            NodeKind::Break { value } => self.brk(value.as_deref())?,
            NodeKind::Next { value } => self.next(value.as_deref())?,
            NodeKind::Redo => self.redo(node)?,
            NodeKind::Retry => {
                let Some(&(target, depth)) = self.cur.retries.last() else {
                    return Err(self.err(node, ErrorKind::InvalidJump("retry")));
                };
                let exited = self.exit_protects(depth)?;
                self.jump(target);
                self.restore_protects(exited);
            }

            NodeKind::Def { name, params, body } => self.def(node, None, name, params, body.as_deref(), dst)?,
            NodeKind::Defs { receiver, name, params, body } => {
                self.def(node, Some(receiver), name, params, body.as_deref(), dst)?;
            }
            NodeKind::Class { scope, name, superclass, body } => {
                self.class_def(node, scope.as_deref(), name, superclass.as_deref(), body.as_deref(), false, dst)?;
            }
            NodeKind::Module { scope, name, body } => {
                self.class_def(node, scope.as_deref(), name, None, body.as_deref(), true, dst)?;
            }
        }
        Ok(())
    }

    fn count(&self, n: usize) -> Result<u16> {
        u16::try_from(n).map_err(|_| self.exhausted("operands"))
    }

    fn array(&mut self, elements: &[Node], dst: Reg) -> Result<()> {
        let lead = elements.iter().take_while(|e| !matches!(e.kind, NodeKind::Splat { .. })).count();
        let start = self.tmps(lead)?;
        for (i, e) in elements[..lead].iter().enumerate() {
            self.expr(e, start + i as Reg)?;
        }
        let count = self.count(lead)?;
        self.emit(Op::NewArray { dst, start, count });
        for e in &elements[lead..] {
            match &e.kind {
                NodeKind::Splat { value } => {
                    let src = self.value(value)?;
                    self.emit(Op::ConcatArray { dst, src });
                }
                _ => {
                    let src = self.value(e)?;
                    self.emit(Op::ArrayPush { dst, src });
                }
            }
        }
        Ok(())
    }

    // ── Calls ───────────────────────────────────────────────────────

    /// Lay out call arguments. A trailing `&blk` is returned separately. With
    /// any splat the arguments are gathered into one array passed with the
    /// splat flag.
    fn call_args<'n>(&mut self, args: &'n [Node]) -> Result<(Args, Option<&'n Node>)> {
        let (args, pass) = match args.split_last() {
            Some((last, init)) if matches!(last.kind, NodeKind::BlockPass { .. }) => (init, Some(last)),
            _ => (args, None),
        };
        if args.iter().any(|a| matches!(a.kind, NodeKind::Splat { .. })) {
            let start = self.tmp()?;
            self.array(args, start)?;
            return Ok((Args { start, argc: 1, splat: true }, pass));
        }
        let start = self.tmps(args.len())?;
        for (i, a) in args.iter().enumerate() {
            self.expr(a, start + i as Reg)?;
        }
        Ok((Args { start, argc: self.count(args.len())?, splat: false }, pass))
    }

    fn block_operand(&mut self, block: Option<&Node>) -> Result<BlockOperand> {
        let Some(node) = block else { return Ok(BlockOperand::None) };
        match &node.kind {
            NodeKind::Iter { params, body } => {
                let func = self.block_function(node, params, body.as_deref())?;
                let dst = self.tmp()?;
                let slot = self.cur.block_slots;
                self.cur.block_slots = slot.checked_add(1).ok_or_else(|| self.exhausted("block literals"))?;
                self.emit(Op::MakeBlock { dst, func, slot });
                Ok(BlockOperand::Literal(dst))
            }
            NodeKind::BlockPass { value } => Ok(BlockOperand::Value(self.value(value)?)),
            _ => Err(self.err(node, ErrorKind::Unexpected(node.kind_name()))),
        }
    }

    /// Compile a block literal once per tree node.
    fn block_function(&mut self, node: &Node, params: &Params, body: Option<&Node>) -> Result<FuncId> {
        if let Some(id) = self.core.functions.template(self.program, node.id) {
            return Ok(id);
        }
        let scope = self
            .analysis
            .scope_of(node.id)
            .ok_or_else(|| self.err(node, ErrorKind::Unexpected("iter")))?;
        let spec = FnSpec {
            kind: FunctionKind::Block,
            name: self.cur.name.clone(),
            line: node.line,
            scope,
            params: Some(params),
            selector: None,
        };
        let id = self.function(spec, body)?;
        self.core.functions.set_template(self.program, node.id, id);
        Ok(id)
    }

    fn is_self_call(&self, name: &str, argc: usize) -> bool {
        self.core.config.self_call
            && self.cur.kind == FunctionKind::Method
            && self.cur.selector.is_some_and(|s| *self.core.symbols.name(s) == *name)
            && self.cur.arity.is_simple()
            && argc == self.cur.arity.real as usize
    }

    fn call(&mut self, receiver: Option<&Node>, name: &str, args: &[Node], block: Option<&Node>, dst: Reg) -> Result<()> {
        let inline = self.core.config.inline_operators;
        let plain = block.is_none() && !args.iter().any(|a| matches!(a.kind, NodeKind::Splat { .. } | NodeKind::BlockPass { .. }));

        if let (Some(recv), Some(op), true, [arg]) = (receiver, InlineOp::from_selector(name), inline && plain, args)
            && op.is_binary()
        {
            let lhs = self.value(recv)?;
            let rhs = self.value(arg)?;
            self.binary(op, dst, lhs, rhs);
            return Ok(());
        }
        if plain && receiver.is_none() && self.is_self_call(name, args.len()) {
            let (a, _) = self.call_args(args)?;
            let site = self.core.caches.new_call_site();
            self.emit(Op::SelfCall { dst, args: a.start, argc: a.argc, site });
            return Ok(());
        }

        let recv = receiver.map(|r| self.value(r)).transpose()?;
        let kind = if receiver.is_some() { CallKind::Normal } else { CallKind::FCall };
        let mut sel = self.intern(name);
        let mut args = args;
        let mut op = None;
        let mut via = None;
        if inline
            && matches!(name, "send" | "__send__")
            && let Some((first, rest)) = args.split_first()
            && let NodeKind::Sym { name: target } = &first.kind
        {
            via = Some(sel);
            sel = self.intern(target);
            args = rest;
            op = Some(InlineOp::Send);
        }
        let (a, pass) = self.call_args(args)?;
        let block = self.block_operand(block.or(pass))?;
        if inline && name == "[]=" && !a.splat {
            op = Some(InlineOp::Aset);
        }
        let site = self.core.caches.new_call_site();
        self.emit(Op::Send {
            dst,
            recv,
            sel,
            args: a.start,
            argc: a.argc,
            splat: a.splat,
            block,
            kind,
            site,
            inline: op,
            via,
        });
        Ok(())
    }

    fn super_call(&mut self, args: &[Node], block: Option<&Node>, dst: Reg) -> Result<()> {
        let (a, pass) = self.call_args(args)?;
        let block = match block.or(pass) {
            Some(b) => self.block_operand(Some(b))?,
            None => BlockOperand::Inherit,
        };
        let site = self.core.caches.new_call_site();
        self.emit(Op::Super { dst, args: a.start, argc: a.argc, splat: a.splat, block, site });
        Ok(())
    }

    /// `super` without arguments re-passes the enclosing method's parameters
    /// as they are now.
    fn zsuper(&mut self, block: Option<&Node>, dst: Reg) -> Result<()> {
        let method = std::iter::once(&self.cur)
            .chain(self.outer.iter().rev())
            .find(|b| b.kind != FunctionKind::Block)
            .filter(|b| b.kind == FunctionKind::Method)
            .map(|b| (b.scope, b.arity));
        let Some((scope, arity)) = method else {
            return self.super_call(&[], block, dst);
        };
        let names = self.analysis.scope(scope).params.clone();
        let line = self.cur.at_line;
        let lead = (arity.left_req + arity.optional) as usize;

        let a = if arity.rest {
            let arr = self.tmp()?;
            let start = self.tmps(lead)?;
            for (i, name) in names[..lead].iter().enumerate() {
                let slot = self.slot_in(scope, name, line)?;
                self.read_slot(slot, start + i as Reg);
            }
            self.emit(Op::NewArray { dst: arr, start, count: lead as u16 });
            let t = self.tmp()?;
            for (i, name) in names[lead..].iter().enumerate() {
                let slot = self.slot_in(scope, name, line)?;
                self.read_slot(slot, t);
                if i == 0 {
                    self.emit(Op::ConcatArray { dst: arr, src: t });
                } else {
                    self.emit(Op::ArrayPush { dst: arr, src: t });
                }
            }
            Args { start: arr, argc: 1, splat: true }
        } else {
            let start = self.tmps(names.len())?;
            for (i, name) in names.iter().enumerate() {
                let slot = self.slot_in(scope, name, line)?;
                self.read_slot(slot, start + i as Reg);
            }
            Args { start, argc: self.count(names.len())?, splat: false }
        };
        let block = match block {
            Some(b) => self.block_operand(Some(b))?,
            None => BlockOperand::Inherit,
        };
        let site = self.core.caches.new_call_site();
        self.emit(Op::Super { dst, args: a.start, argc: a.argc, splat: a.splat, block, site });
        Ok(())
    }

    // ── Definitions ─────────────────────────────────────────────────

    fn def(&mut self, node: &Node, target: Option<&Node>, name: &str, params: &Params, body: Option<&Node>, dst: Reg) -> Result<()> {
        let scope = self
            .analysis
            .scope_of(node.id)
            .ok_or_else(|| self.err(node, ErrorKind::Unexpected(node.kind_name())))?;
        let sel = self.intern(name);
        let spec = FnSpec {
            kind: FunctionKind::Method,
            name: name.to_string(),
            line: node.line,
            scope,
            params: Some(params),
            selector: Some(sel),
        };
        let func = self.function(spec, body)?;
        match target {
            None => {
                self.emit(Op::DefMethod { dst, name: sel, func });
            }
            Some(t) => {
                let target = self.value(t)?;
                self.emit(Op::DefSingleton { dst, target, name: sel, func });
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn class_def(
        &mut self,
        node: &Node,
        scope: Option<&Node>,
        name: &str,
        superclass: Option<&Node>,
        body: Option<&Node>,
        module: bool,
        dst: Reg,
    ) -> Result<()> {
        let scope_reg = scope.map(|s| self.value(s)).transpose()?;
        let superclass = superclass.map(|s| self.value(s)).transpose()?;
        let body_scope = self
            .analysis
            .scope_of(node.id)
            .ok_or_else(|| self.err(node, ErrorKind::Unexpected(node.kind_name())))?;
        let spec = FnSpec {
            kind: FunctionKind::ClassBody,
            name: if module { format!("<module:{name}>") } else { format!("<class:{name}>") },
            line: node.line,
            scope: body_scope,
            params: None,
            selector: None,
        };
        let func = self.function(spec, body)?;
        let name = self.intern(name);
        self.emit(Op::DefClass { dst, scope: scope_reg, name, superclass, body: func, module });
        Ok(())
    }

    // ── Control flow ────────────────────────────────────────────────

    fn while_loop(&mut self, cond: &Node, body: Option<&Node>, post: bool, until: bool, dst: Reg) -> Result<()> {
        self.load(dst, Value::NIL);
        let (head, top, end) = (self.label(), self.label(), self.label());
        let protect = self.cur.protects.len();
        self.cur.loops.push(LoopCtx { result: dst, next: head, redo: top, end, protect });
        if !post {
            self.place(head);
            self.loop_test(cond, until, end)?;
        }
        self.place(top);
        if let Some(b) = body {
            self.discard(b)?;
        }
        if post {
            self.place(head);
            self.loop_test(cond, until, end)?;
            self.jump(top);
        } else {
            self.jump(head);
        }
        self.cur.loops.pop();
        self.place(end);
        Ok(())
    }

    /// Leave the loop when the condition's truthiness equals `until`.
    fn loop_test(&mut self, cond: &Node, until: bool, end: Label) -> Result<()> {
        let mark = self.mark();
        let c = self.value(cond)?;
        self.branch(c, until, end);
        self.release(mark);
        Ok(())
    }

    fn case(&mut self, subject: Option<&Node>, whens: &[When], else_body: Option<&Node>, dst: Reg) -> Result<()> {
        let subject = subject.map(|s| self.value(s)).transpose()?;
        let end = self.label();
        for w in whens {
            let (body, next) = (self.label(), self.label());
            for pattern in &w.patterns {
                let mark = self.mark();
                let t = self.tmp()?;
                match (&pattern.kind, subject) {
                    (NodeKind::Splat { value }, Some(s)) => {
                        let list = self.value(value)?;
                        self.emit(Op::CaseSplatTest { dst: t, subject: s, list });
                    }
                    (NodeKind::Splat { value }, None) => {
                        let list = self.value(value)?;
                        self.emit(Op::ToArray { dst: list, src: list });
                        let any = self.intern("any?");
                        self.send(t, Some(list), any, t, 0, CallKind::Normal);
                    }
                    (_, Some(s)) => {
                        let p = self.value(pattern)?;
                        self.binary(InlineOp::Eqq, t, p, s);
                    }
                    (_, None) => self.expr(pattern, t)?,
                }
                self.branch(t, true, body);
                self.release(mark);
            }
            self.jump(next);
            self.place(body);
            self.expr_opt(w.body.as_ref(), dst)?;
            self.jump(end);
            self.place(next);
        }
        self.expr_opt(else_body, dst)?;
        self.place(end);
        Ok(())
    }

    fn ret(&mut self, value: Option<&Node>) -> Result<()> {
        let v = self.tmp()?;
        self.expr_opt(value, v)?;
        let exited = self.exit_protects(0)?;
        if self.cur.kind == FunctionKind::Block {
            self.emit(Op::BlockReturn { src: v });
        } else {
            self.emit(Op::Return { src: v });
        }
        self.restore_protects(exited);
        Ok(())
    }

    fn brk(&mut self, value: Option<&Node>) -> Result<()> {
        if let Some(lp) = self.cur.loops.last().copied() {
            self.expr_opt(value, lp.result)?;
            let exited = self.exit_protects(lp.protect)?;
            self.jump(lp.end);
            self.restore_protects(exited);
            return Ok(());
        }
        let v = self.tmp()?;
        self.expr_opt(value, v)?;
        if self.cur.kind == FunctionKind::Block {
            let exited = self.exit_protects(0)?;
            self.emit(Op::BlockBreak { src: v });
            self.restore_protects(exited);
        } else {
            self.emit(Op::LocalJump { kind: JumpKind::Break });
        }
        Ok(())
    }

    fn next(&mut self, value: Option<&Node>) -> Result<()> {
        let v = self.tmp()?;
        self.expr_opt(value, v)?;
        if let Some(lp) = self.cur.loops.last().copied() {
            let exited = self.exit_protects(lp.protect)?;
            self.jump(lp.next);
            self.restore_protects(exited);
        } else if self.cur.kind == FunctionKind::Block {
            let exited = self.exit_protects(0)?;
            self.emit(Op::Return { src: v });
            self.restore_protects(exited);
        } else {
            self.emit(Op::LocalJump { kind: JumpKind::Next });
        }
        Ok(())
    }

    fn redo(&mut self, node: &Node) -> Result<()> {
        let (target, depth) = match self.cur.loops.last() {
            Some(lp) => (lp.redo, lp.protect),
            None if matches!(self.cur.kind, FunctionKind::Block | FunctionKind::Method) => (self.cur.entry, 0),
            None => return Err(self.err(node, ErrorKind::InvalidJump("redo"))),
        };
        let exited = self.exit_protects(depth)?;
        self.jump(target);
        self.restore_protects(exited);
        Ok(())
    }
}

/// Argument registers of a call.
#[derive(Debug, Clone, Copy)]
struct Args {
    start: Reg,
    argc: u16,
    splat: bool,
}
