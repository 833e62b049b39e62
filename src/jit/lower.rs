//! Lowering optimized IR to Cranelift.
//!
//! One Cranelift block per IR instruction. Moves, branches, returns and the
//! fixnum paths of `+ - < <= > >= == !=` are emitted inline; every other
//! instruction becomes a call to [`helpers::garnet_rt_step`]. Promoted
//! registers are SSA variables, the rest are loaded from and stored to the
//! frame's register file.

use cranelift_codegen::Context;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::types::{I8, I32, I64};
use cranelift_codegen::ir::{AbiParam, Block, FuncRef, InstBuilder, JumpTableData, MemFlags, Type};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, default_libcall_names};

use super::JitError;
use super::helpers::{self, PAD, RET_OFFSET, REGS_OFFSET, RETURN, STATUS_OFFSET, TARGET_OFFSET};
use super::passes::Optimized;
use crate::ir::{FuncId, Function, Op, Reg};
use crate::runtime::cache::{CacheStore, InlineOp};
use crate::value::Value;

type Clif = cranelift_codegen::ir::Value;

pub(super) struct Lowered {
    pub module: JITModule,
    pub entry: *const u8,
    pub size: usize,
}

fn helper_symbols() -> [(&'static str, *const u8); 5] {
    [
        ("garnet_rt_step", helpers::garnet_rt_step as *const u8),
        ("garnet_rt_poll", helpers::garnet_rt_poll as *const u8),
        ("garnet_rt_binop", helpers::garnet_rt_binop as *const u8),
        ("garnet_rt_enter_self", helpers::garnet_rt_enter_self as *const u8),
        ("garnet_rt_leave_self", helpers::garnet_rt_leave_self as *const u8),
    ]
}

fn target_err(e: impl std::fmt::Display) -> JitError {
    JitError::Target(e.to_string())
}

pub(super) fn lower(fid: FuncId, opt: &Optimized, caches: &CacheStore) -> Result<Lowered, JitError> {
    let func = &opt.func;
    let codegen = |e: &dyn std::fmt::Display| JitError::Codegen { function: func.name.clone(), message: e.to_string() };

    let mut flag_builder = settings::builder();
    flag_builder.set("opt_level", "speed").map_err(target_err)?;
    let isa_builder = cranelift_native::builder().map_err(target_err)?;
    let isa = isa_builder.finish(settings::Flags::new(flag_builder)).map_err(target_err)?;

    let mut jit_builder = JITBuilder::with_isa(isa, default_libcall_names());
    for (name, addr) in helper_symbols() {
        jit_builder.symbol(name, addr);
    }
    let mut module = JITModule::new(jit_builder);
    let ptr = module.target_config().pointer_type();

    // (ctx, receiver, selector, arg0 .. argN) -> status
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(I64));
    sig.params.push(AbiParam::new(I64));
    for _ in 0..func.arity.real {
        sig.params.push(AbiParam::new(I64));
    }
    sig.returns.push(AbiParam::new(I32));
    let func_id = module
        .declare_function(&format!("garnet_fn_{fid}"), Linkage::Local, &sig)
        .map_err(|e| codegen(&e))?;

    let mut import = |name: &str, params: &[Type], ret: Type| {
        let mut s = module.make_signature();
        s.params.extend(params.iter().map(|&t| AbiParam::new(t)));
        s.returns.push(AbiParam::new(ret));
        module.declare_function(name, Linkage::Import, &s)
    };
    let step = import("garnet_rt_step", &[ptr, I32], I32).map_err(|e| codegen(&e))?;
    let poll = import("garnet_rt_poll", &[ptr, I32], I32).map_err(|e| codegen(&e))?;
    let binop = import("garnet_rt_binop", &[ptr, I32, I64, I64], I32).map_err(|e| codegen(&e))?;
    let enter_self = import("garnet_rt_enter_self", &[ptr, I32], ptr).map_err(|e| codegen(&e))?;
    let leave_self = import("garnet_rt_leave_self", &[ptr, I32, ptr, I32], I32).map_err(|e| codegen(&e))?;

    let mut ctx = Context::new();
    ctx.func.signature = sig;
    let mut fn_builder_ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut ctx.func, &mut fn_builder_ctx);
    let refs = Refs {
        step: module.declare_func_in_func(step, b.func),
        poll: module.declare_func_in_func(poll, b.func),
        binop: module.declare_func_in_func(binop, b.func),
        enter_self: module.declare_func_in_func(enter_self, b.func),
        leave_self: module.declare_func_in_func(leave_self, b.func),
        this: module.declare_func_in_func(func_id, b.func),
    };

    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    // One block per instruction plus the fall-off-the-end block.
    let blocks: Vec<Block> = (0..=func.code.len()).map(|_| b.create_block()).collect();
    let unwind = b.create_block();
    b.append_block_param(unwind, I32);

    b.switch_to_block(entry);
    let params = b.block_params(entry).to_vec();
    let regs = b.ins().load(ptr, MemFlags::trusted(), params[0], REGS_OFFSET);
    let count = (func.reg_count as usize).max(func.arity.real as usize);
    let vars: Vec<Variable> = (0..count)
        .map(|i| {
            let var = Variable::from_u32(i as u32);
            b.declare_var(var, I64);
            var
        })
        .collect();

    let mut l = Lower {
        b,
        func,
        opt,
        caches,
        vars,
        blocks,
        unwind,
        polls: Vec::new(),
        refs,
        ctx: params[0],
        recv: params[1],
        sel: params[2],
        regs,
        ptr,
    };
    for r in 0..count as Reg {
        let v = match params.get(3 + r as usize) {
            Some(&arg) => arg,
            None if l.opt.residency.in_memory(r) => continue,
            None => l.b.ins().iconst(I64, Value::NIL.bits() as i64),
        };
        l.set(r, v);
    }
    l.b.ins().jump(l.blocks[0], &[]);

    for pc in 0..func.code.len() {
        l.b.switch_to_block(l.blocks[pc]);
        l.op(pc);
    }
    l.tail();
    l.b.seal_all_blocks();
    l.b.finalize();

    module.define_function(func_id, &mut ctx).map_err(|e| codegen(&e))?;
    let size = ctx.compiled_code().map_or(0, |c| c.code_info().total_size as usize);
    module.finalize_definitions().map_err(|e| codegen(&e))?;
    let entry = module.get_finalized_function(func_id);
    Ok(Lowered { module, entry, size })
}

struct Refs {
    step: FuncRef,
    poll: FuncRef,
    binop: FuncRef,
    enter_self: FuncRef,
    leave_self: FuncRef,
    this: FuncRef,
}

struct Lower<'a> {
    b: FunctionBuilder<'a>,
    func: &'a Function,
    opt: &'a Optimized,
    caches: &'a CacheStore,
    vars: Vec<Variable>,
    blocks: Vec<Block>,
    unwind: Block,
    /// Back edges still to emit: (block, pc, target).
    polls: Vec<(Block, usize, u32)>,
    refs: Refs,
    ctx: Clif,
    recv: Clif,
    sel: Clif,
    regs: Clif,
    ptr: Type,
}

impl Lower<'_> {
    // ---- registers ----

    fn get(&mut self, r: Reg) -> Clif {
        if self.opt.residency.in_memory(r) {
            self.b.ins().load(I64, MemFlags::trusted(), self.regs, i32::from(r) * 8)
        } else {
            self.b.use_var(self.vars[r as usize])
        }
    }

    fn set(&mut self, r: Reg, v: Clif) {
        if self.opt.residency.in_memory(r) {
            self.b.ins().store(MemFlags::trusted(), v, self.regs, i32::from(r) * 8);
        } else {
            self.b.def_var(self.vars[r as usize], v);
        }
    }

    fn imm(&mut self, v: Value) -> Clif {
        self.b.ins().iconst(I64, v.bits() as i64)
    }

    fn truthy(&mut self, v: Clif) -> Clif {
        let not_false = self.b.ins().icmp_imm(IntCC::NotEqual, v, Value::FALSE.bits() as i64);
        let not_nil = self.b.ins().icmp_imm(IntCC::NotEqual, v, Value::NIL.bits() as i64);
        self.b.ins().band(not_false, not_nil)
    }

    // ---- control ----

    /// Continue at `next` when the status is NEXT (zero), otherwise hand it
    /// to the unwind block.
    fn check(&mut self, status: Clif, next: Block) {
        self.b.ins().brif(status, self.unwind, &[status], next, &[]);
    }

    /// Destination for a transfer to `target`; back edges go through a kill poll.
    fn edge(&mut self, pc: usize, target: u32) -> Block {
        if target as usize > pc {
            return self.blocks[target as usize];
        }
        let block = self.b.create_block();
        self.polls.push((block, pc, target));
        block
    }

    fn call(&mut self, f: FuncRef, args: &[Clif]) -> Clif {
        let inst = self.b.ins().call(f, args);
        self.b.inst_results(inst)[0]
    }

    fn pc(&mut self, pc: usize) -> Clif {
        self.b.ins().iconst(I32, pc as i64)
    }

    // ---- instructions ----

    fn op(&mut self, pc: usize) {
        let next = self.blocks[pc + 1];
        match self.func.code[pc] {
            Op::Nop => {
                self.b.ins().jump(next, &[]);
            }
            Op::LoadImm { dst, value } => {
                let v = self.imm(value);
                self.set(dst, v);
                self.b.ins().jump(next, &[]);
            }
            Op::Move { dst, src } => {
                let v = self.get(src);
                self.set(dst, v);
                self.b.ins().jump(next, &[]);
            }
            Op::Not { dst, src } => {
                let v = self.get(src);
                let t = self.truthy(v);
                let (f, tr) = (self.imm(Value::FALSE), self.imm(Value::TRUE));
                let r = self.b.ins().select(t, f, tr);
                self.set(dst, r);
                self.b.ins().jump(next, &[]);
            }
            Op::Jump { target } => {
                let dest = self.edge(pc, target);
                self.b.ins().jump(dest, &[]);
            }
            Op::Branch { cond, target, when } => {
                let v = self.get(cond);
                let t = self.truthy(v);
                let taken = self.edge(pc, target);
                let (yes, no) = if when { (taken, next) } else { (next, taken) };
                self.b.ins().brif(t, yes, &[], no, &[]);
            }
            Op::JumpIfDefined { src, target } => {
                let v = self.get(src);
                let defined = self.b.ins().icmp_imm(IntCC::NotEqual, v, Value::UNDEF.bits() as i64);
                let taken = self.edge(pc, target);
                self.b.ins().brif(defined, taken, &[], next, &[]);
            }
            Op::Return { src } => {
                let v = self.get(src);
                self.b.ins().store(MemFlags::trusted(), v, self.ctx, RET_OFFSET);
                let status = self.b.ins().iconst(I32, i64::from(RETURN));
                self.b.ins().return_(&[status]);
            }
            Op::Binop { op, dst, lhs, rhs, .. } => self.binop(pc, op, dst, lhs, rhs),
            Op::SelfCall { args, argc, .. } if argc == self.func.arity.real => self.self_call(pc, args, argc),
            _ => {
                let pcv = self.pc(pc);
                let status = self.call(self.refs.step, &[self.ctx, pcv]);
                self.check(status, next);
            }
        }
    }

    /// Guarded fixnum fast path with the interpreter's operator as fallback.
    fn binop(&mut self, pc: usize, op: InlineOp, dst: Reg, lhs: Reg, rhs: Reg) {
        let next = self.blocks[pc + 1];
        let a = self.get(lhs);
        let c = self.get(rhs);
        let join = self.b.create_block();
        self.b.append_block_param(join, I64);
        let slow = self.b.create_block();

        let cmp = match op {
            InlineOp::Lt => Some(IntCC::SignedLessThan),
            InlineOp::Le => Some(IntCC::SignedLessThanOrEqual),
            InlineOp::Gt => Some(IntCC::SignedGreaterThan),
            InlineOp::Ge => Some(IntCC::SignedGreaterThanOrEqual),
            InlineOp::Eq => Some(IntCC::Equal),
            InlineOp::Ne => Some(IntCC::NotEqual),
            _ => None,
        };
        if cmp.is_some() || matches!(op, InlineOp::Plus | InlineOp::Minus) {
            let fast = self.b.create_block();
            let both = self.b.ins().band(a, c);
            let tag = self.b.ins().band_imm(both, 1);
            let fixnums = self.b.ins().icmp_imm(IntCC::NotEqual, tag, 0);
            let flag_addr = self.b.ins().iconst(self.ptr, self.caches.flag_addr(op) as i64);
            let flag = self.b.ins().load(I8, MemFlags::trusted(), flag_addr, 0);
            let intact = self.b.ins().icmp_imm(IntCC::Equal, flag, 0);
            let ok = self.b.ins().band(fixnums, intact);
            self.b.ins().brif(ok, fast, &[], slow, &[]);

            self.b.switch_to_block(fast);
            // Tagged arithmetic: (2x+1) + 2y and (2x+1) - 2y stay tagged, and
            // overflow of the i64 is exactly overflow of the 63-bit payload.
            let untagged = self.b.ins().iadd_imm(c, -1);
            match (op, cmp) {
                (InlineOp::Plus, _) => {
                    let (r, overflow) = self.b.ins().sadd_overflow(a, untagged);
                    self.b.ins().brif(overflow, slow, &[], join, &[r]);
                }
                (InlineOp::Minus, _) => {
                    let (r, overflow) = self.b.ins().ssub_overflow(a, untagged);
                    self.b.ins().brif(overflow, slow, &[], join, &[r]);
                }
                (_, Some(cc)) => {
                    let t = self.b.ins().icmp(cc, a, c);
                    let (yes, no) = (self.imm(Value::TRUE), self.imm(Value::FALSE));
                    let r = self.b.ins().select(t, yes, no);
                    self.b.ins().jump(join, &[r]);
                }
                _ => {
                    self.b.ins().jump(slow, &[]);
                }
            }
        } else {
            self.b.ins().jump(slow, &[]);
        }

        self.b.switch_to_block(slow);
        let pcv = self.pc(pc);
        let status = self.call(self.refs.binop, &[self.ctx, pcv, a, c]);
        let done = self.b.create_block();
        self.check(status, done);
        self.b.switch_to_block(done);
        let r = self.b.ins().load(I64, MemFlags::trusted(), self.ctx, RET_OFFSET);
        self.b.ins().jump(join, &[r]);

        self.b.switch_to_block(join);
        let r = self.b.block_params(join)[0];
        self.set(dst, r);
        self.b.ins().jump(next, &[]);
    }

    /// Direct native recursion. The helper enters the callee frame (or
    /// dispatches normally when the guard fails) and leaves it afterwards.
    fn self_call(&mut self, pc: usize, args: Reg, argc: u16) {
        let next = self.blocks[pc + 1];
        let pcv = self.pc(pc);
        let act = self.call(self.refs.enter_self, &[self.ctx, pcv]);
        let direct = self.b.create_block();
        let done = self.b.create_block();
        self.b.ins().brif(act, direct, &[], done, &[]);

        self.b.switch_to_block(done);
        let status = self.b.ins().load(I32, MemFlags::trusted(), self.ctx, STATUS_OFFSET);
        self.check(status, next);

        self.b.switch_to_block(direct);
        let mut argv = vec![act, self.recv, self.sel];
        for i in 0..argc {
            let v = self.get(args + i);
            argv.push(v);
        }
        let callee_status = self.call(self.refs.this, &argv);
        let status = self.call(self.refs.leave_self, &[self.ctx, pcv, act, callee_status]);
        self.check(status, next);
    }

    /// Back-edge polls, the fall-off return and the unwind dispatcher.
    fn tail(&mut self) {
        for (block, pc, target) in std::mem::take(&mut self.polls) {
            self.b.switch_to_block(block);
            let pcv = self.pc(pc);
            let status = self.call(self.refs.poll, &[self.ctx, pcv]);
            self.check(status, self.blocks[target as usize]);
        }

        let end = self.blocks[self.func.code.len()];
        self.b.switch_to_block(end);
        let nil = self.imm(Value::NIL);
        self.b.ins().store(MemFlags::trusted(), nil, self.ctx, RET_OFFSET);
        let status = self.b.ins().iconst(I32, i64::from(RETURN));
        self.b.ins().return_(&[status]);

        self.b.switch_to_block(self.unwind);
        let status = self.b.block_params(self.unwind)[0];
        if self.func.handlers.is_empty() {
            self.b.ins().return_(&[status]);
            return;
        }
        let dispatch = self.b.create_block();
        let exit = self.b.create_block();
        let is_pad = self.b.ins().icmp_imm(IntCC::Equal, status, i64::from(PAD));
        self.b.ins().brif(is_pad, dispatch, &[], exit, &[]);

        self.b.switch_to_block(exit);
        self.b.ins().return_(&[status]);

        self.b.switch_to_block(dispatch);
        let index = self.b.ins().load(I32, MemFlags::trusted(), self.ctx, TARGET_OFFSET);
        let pads: Vec<_> = self
            .func
            .handlers
            .iter()
            .map(|h| self.b.func.dfg.block_call(self.blocks[h.target as usize], &[]))
            .collect();
        let fallback = self.b.func.dfg.block_call(exit, &[]);
        let table = self.b.create_jump_table(JumpTableData::new(fallback, &pads));
        self.b.ins().br_table(index, table);
    }
}
