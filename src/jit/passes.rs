//! IR clean-up run before native lowering.
//!
//! Passes rewrite instructions in place and never move one, so pcs, the line
//! table and the handler table stay valid for the optimized copy, and the
//! interpreter can still step any instruction of it. The order is fixed:
//! promote, combine, reassociate, cse, simplify_cfg.

use crate::ir::{Function, Op, Reg};

/// Instructions generated code runs itself. Everything else goes through the
/// interpreter and therefore reads and writes registers in the frame.
pub fn is_native(op: &Op) -> bool {
    matches!(
        op,
        Op::Nop
            | Op::LoadImm { .. }
            | Op::Move { .. }
            | Op::Jump { .. }
            | Op::Branch { .. }
            | Op::JumpIfDefined { .. }
            | Op::Not { .. }
            | Op::Return { .. }
            | Op::Binop { .. }
    )
}

/// Where native code keeps each register.
#[derive(Debug, Clone, PartialEq)]
pub struct Residency {
    memory: Vec<bool>,
}

impl Residency {
    /// The register lives in the frame and is loaded and stored around every
    /// access. Otherwise it is an SSA variable.
    pub fn in_memory(&self, r: Reg) -> bool {
        self.memory.get(r as usize).copied().unwrap_or(true)
    }

    pub fn promoted(&self) -> usize {
        self.memory.iter().filter(|m| !**m).count()
    }
}

#[derive(Debug)]
pub struct Optimized {
    pub func: Function,
    pub residency: Residency,
}

pub fn optimize(func: &Function) -> Optimized {
    let mut func = func.clone();
    let residency = promote(&func);
    combine(&mut func);
    reassociate(&mut func, &residency);
    cse(&mut func);
    simplify_cfg(&mut func);
    Optimized { func, residency }
}

// ── promote ─────────────────────────────────────────────────────────

/// Registers only native instructions touch become SSA variables. Later
/// passes keep this valid: they never make an interpreted instruction read a
/// promoted register.
pub fn promote(func: &Function) -> Residency {
    let count = (func.reg_count as usize).max(func.arity.real as usize);
    let mut memory = vec![false; count];
    for op in func.code.iter().filter(|op| !is_native(op)) {
        for r in op.uses().into_iter().chain(op.def()) {
            if let Some(m) = memory.get_mut(r as usize) {
                *m = true;
            }
        }
    }
    Residency { memory }
}

// ── combine ─────────────────────────────────────────────────────────

/// Peephole folds inside a basic block: self moves, branches on a negation,
/// and branches on a constant loaded just before.
pub fn combine(func: &mut Function) {
    let leaders = leaders(func);
    for pc in 0..func.code.len() {
        if let Op::Move { dst, src } = func.code[pc]
            && dst == src
        {
            func.code[pc] = Op::Nop;
            continue;
        }
        if pc == 0 || leaders[pc] {
            continue;
        }
        let prev = func.code[pc - 1].clone();
        let folded = match (&prev, &func.code[pc]) {
            (Op::Not { dst, src }, &Op::Branch { cond, target, when }) if *dst == cond && src != dst => {
                Some(Op::Branch { cond: *src, target, when: !when })
            }
            (Op::LoadImm { dst, value }, &Op::Branch { cond, target, when }) if *dst == cond => {
                Some(if value.is_truthy() == when { Op::Jump { target } } else { Op::Nop })
            }
            (Op::LoadImm { dst, value }, &Op::JumpIfDefined { src, target }) if *dst == src => {
                Some(if value.is_undef() { Op::Nop } else { Op::Jump { target } })
            }
            _ => None,
        };
        if let Some(op) = folded {
            func.code[pc] = op;
        }
    }
}

// ── reassociate ─────────────────────────────────────────────────────

/// Collapse copy chains within a block: a read of a register that holds a
/// copy is redirected to the copy's source while both are unchanged.
pub fn reassociate(func: &mut Function, residency: &Residency) {
    let leaders = leaders(func);
    // (copy, source) pairs valid at the current pc.
    let mut copies: Vec<(Reg, Reg)> = Vec::new();
    for pc in 0..func.code.len() {
        if leaders[pc] {
            copies.clear();
        }
        let native = is_native(&func.code[pc]);
        let pinned = func.code[pc].pinned();
        for &(copy, source) in &copies {
            if pinned.contains(&copy) || !(native || residency.in_memory(source)) {
                continue;
            }
            func.code[pc].rename_use(copy, source);
        }
        if let Some(d) = func.code[pc].def() {
            copies.retain(|&(c, s)| c != d && s != d);
            if let Op::Move { dst, src } = func.code[pc]
                && dst != src
            {
                copies.push((dst, src));
            }
        }
    }
}

// ── cse ─────────────────────────────────────────────────────────────

/// Reuse `self` and block-given results already loaded in the same block.
pub fn cse(func: &mut Function) {
    #[derive(PartialEq, Clone, Copy)]
    enum Pure {
        SelfVal,
        BlockGiven,
    }
    let leaders = leaders(func);
    let mut avail: Vec<(Pure, Reg)> = Vec::new();
    for pc in 0..func.code.len() {
        if leaders[pc] {
            avail.clear();
        }
        let key = match func.code[pc] {
            Op::LoadSelf { dst } => Some((Pure::SelfVal, dst)),
            Op::BlockGiven { dst } => Some((Pure::BlockGiven, dst)),
            _ => None,
        };
        if let Some((kind, dst)) = key
            && let Some(&(_, held)) = avail.iter().find(|(k, r)| *k == kind && *r != dst)
        {
            func.code[pc] = Op::Move { dst, src: held };
        }
        if let Some(d) = func.code[pc].def() {
            avail.retain(|&(_, r)| r != d);
        }
        if let Some((kind, dst)) = key {
            avail.push((kind, dst));
        }
    }
}

// ── simplify_cfg ────────────────────────────────────────────────────

/// Thread jumps through unconditional jumps, drop jumps to the next
/// instruction and blank out unreachable code.
pub fn simplify_cfg(func: &mut Function) {
    let len = func.code.len();
    for pc in 0..len {
        let Some(mut target) = func.code[pc].target() else { continue };
        // Bounded so a cycle of jumps cannot spin.
        for _ in 0..len {
            match func.code.get(target as usize) {
                Some(&Op::Jump { target: next }) if next != target => target = next,
                _ => break,
            }
        }
        if let Some(t) = func.code[pc].targets_mut() {
            *t = target;
        }
        if matches!(func.code[pc], Op::Jump { .. }) && target as usize == pc + 1 {
            func.code[pc] = Op::Nop;
        }
    }

    let mut reachable = vec![false; len];
    let mut work: Vec<usize> = vec![0];
    work.extend(func.handlers.iter().map(|h| h.target as usize));
    while let Some(pc) = work.pop() {
        if pc >= len || reachable[pc] {
            continue;
        }
        reachable[pc] = true;
        let op = &func.code[pc];
        if let Some(t) = op.target() {
            work.push(t as usize);
        }
        if !op.is_terminator() {
            work.push(pc + 1);
        }
    }
    for (op, live) in func.code.iter_mut().zip(reachable) {
        if !live {
            *op = Op::Nop;
        }
    }
}

/// Basic block starts: entry, jump targets, landing pads, and whatever
/// follows a branch or terminator.
pub fn leaders(func: &Function) -> Vec<bool> {
    let len = func.code.len();
    let mut out = vec![false; len + 1];
    out[0] = true;
    for h in &func.handlers {
        if let Some(l) = out.get_mut(h.target as usize) {
            *l = true;
        }
    }
    for (pc, op) in func.code.iter().enumerate() {
        if let Some(t) = op.target()
            && let Some(l) = out.get_mut(t as usize)
        {
            *l = true;
        }
        if op.target().is_some() || op.is_terminator() {
            out[pc + 1] = true;
        }
    }
    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ir::{FunctionKind, Handler, HandlerKind};
    use crate::runtime::arity::Arity;
    use crate::runtime::cache::InlineOp;
    use crate::value::Value;

    fn func(code: Vec<Op>, reg_count: u16) -> Function {
        Function {
            name: "t".into(),
            file: Arc::from("t.rb"),
            line: 1,
            kind: FunctionKind::Method,
            arity: Arity::default(),
            selector: None,
            reg_count,
            own_cells: 0,
            env_cells: 0,
            block_slots: 0,
            unwind_slots: 0,
            empty_body: false,
            lines: vec![1; code.len()],
            code,
            handlers: Vec::new(),
            literals: Vec::new(),
        }
    }

    fn binop(op: InlineOp, dst: Reg, lhs: Reg, rhs: Reg) -> Op {
        Op::Binop { op, dst, lhs, rhs, site: 0 }
    }

    #[test]
    fn registers_touched_by_interpreted_ops_stay_in_memory() {
        let f = func(
            vec![
                Op::LoadImm { dst: 0, value: Value::fixnum(1).unwrap() },
                Op::LoadSelf { dst: 1 },
                binop(InlineOp::Plus, 2, 0, 0),
                Op::Return { src: 2 },
            ],
            3,
        );
        let r = promote(&f);
        assert!(!r.in_memory(0));
        assert!(r.in_memory(1));
        assert!(!r.in_memory(2));
        assert_eq!(r.promoted(), 2);
        assert!(r.in_memory(99));
    }

    #[test]
    fn branch_on_negation_tests_the_operand() {
        let mut f = func(
            vec![
                Op::Not { dst: 1, src: 0 },
                Op::Branch { cond: 1, target: 3, when: true },
                Op::Move { dst: 2, src: 2 },
                Op::Return { src: 0 },
            ],
            3,
        );
        combine(&mut f);
        assert_eq!(f.code[1], Op::Branch { cond: 0, target: 3, when: false });
        assert_eq!(f.code[2], Op::Nop);
    }

    #[test]
    fn constant_branches_fold() {
        let mut f = func(
            vec![
                Op::LoadImm { dst: 0, value: Value::NIL },
                Op::Branch { cond: 0, target: 4, when: false },
                Op::LoadImm { dst: 0, value: Value::TRUE },
                Op::Branch { cond: 0, target: 4, when: false },
                Op::Return { src: 0 },
            ],
            1,
        );
        combine(&mut f);
        assert_eq!(f.code[1], Op::Jump { target: 4 });
        assert_eq!(f.code[3], Op::Nop);
    }

    #[test]
    fn no_folding_across_a_jump_target() {
        let mut f = func(
            vec![
                Op::Branch { cond: 0, target: 2, when: true },
                Op::LoadImm { dst: 0, value: Value::NIL },
                Op::Branch { cond: 0, target: 4, when: true },
                Op::Return { src: 0 },
                Op::Return { src: 0 },
            ],
            1,
        );
        combine(&mut f);
        assert_eq!(f.code[2], Op::Branch { cond: 0, target: 4, when: true });
    }

    #[test]
    fn copies_resolve_to_their_source() {
        let mut f = func(
            vec![
                Op::Move { dst: 1, src: 0 },
                Op::Move { dst: 2, src: 1 },
                binop(InlineOp::Plus, 3, 2, 1),
                Op::Return { src: 3 },
            ],
            4,
        );
        let r = promote(&f);
        reassociate(&mut f, &r);
        assert_eq!(f.code[1], Op::Move { dst: 2, src: 0 });
        assert_eq!(f.code[2], binop(InlineOp::Plus, 3, 0, 0));
    }

    #[test]
    fn interpreted_reads_never_move_to_a_promoted_register() {
        let mut f = func(
            vec![
                Op::LoadImm { dst: 0, value: Value::fixnum(5).unwrap() },
                Op::Move { dst: 1, src: 0 },
                Op::SetGlobal { name: crate::runtime::symbol::Symbol(0), src: 1 },
                Op::Return { src: 1 },
            ],
            2,
        );
        let r = promote(&f);
        assert!(!r.in_memory(0) && r.in_memory(1));
        reassociate(&mut f, &r);
        assert!(matches!(f.code[2], Op::SetGlobal { src: 1, .. }));
        assert_eq!(f.code[3], Op::Return { src: 0 });
    }

    #[test]
    fn a_redefined_source_ends_the_copy() {
        let mut f = func(
            vec![
                Op::Move { dst: 1, src: 0 },
                Op::LoadImm { dst: 0, value: Value::NIL },
                Op::Return { src: 1 },
            ],
            2,
        );
        let r = promote(&f);
        reassociate(&mut f, &r);
        assert_eq!(f.code[2], Op::Return { src: 1 });
    }

    #[test]
    fn repeated_self_loads_become_moves() {
        let mut f = func(
            vec![
                Op::LoadSelf { dst: 0 },
                Op::LoadSelf { dst: 1 },
                Op::BlockGiven { dst: 2 },
                Op::Jump { target: 4 },
                Op::LoadSelf { dst: 3 },
                Op::Return { src: 3 },
            ],
            4,
        );
        cse(&mut f);
        assert_eq!(f.code[1], Op::Move { dst: 1, src: 0 });
        assert_eq!(f.code[2], Op::BlockGiven { dst: 2 });
        assert_eq!(f.code[4], Op::LoadSelf { dst: 3 });
    }

    #[test]
    fn jump_chains_thread_and_dead_code_clears() {
        let mut f = func(
            vec![
                Op::Branch { cond: 0, target: 3, when: true },
                Op::Jump { target: 2 },
                Op::Return { src: 0 },
                Op::Jump { target: 2 },
                Op::LoadSelf { dst: 0 },
            ],
            1,
        );
        simplify_cfg(&mut f);
        assert_eq!(f.code[0], Op::Branch { cond: 0, target: 2, when: true });
        assert_eq!(f.code[1], Op::Nop);
        assert_eq!(f.code[3], Op::Nop);
        assert_eq!(f.code[4], Op::Nop);
    }

    #[test]
    fn landing_pads_stay_reachable() {
        let mut f = func(
            vec![
                Op::LoadSelf { dst: 0 },
                Op::Return { src: 0 },
                Op::CatchException { dst: 0 },
                Op::Return { src: 0 },
            ],
            1,
        );
        f.handlers.push(Handler { ranges: vec![(0, 1)], target: 2, kind: HandlerKind::Rescue, depth: 0 });
        simplify_cfg(&mut f);
        assert_eq!(f.code[2], Op::CatchException { dst: 0 });
    }

    #[test]
    fn optimize_keeps_positions() {
        let f = func(
            vec![
                Op::LoadSelf { dst: 0 },
                Op::LoadSelf { dst: 1 },
                Op::Move { dst: 2, src: 1 },
                Op::Return { src: 2 },
            ],
            3,
        );
        let opt = optimize(&f);
        assert_eq!(opt.func.code.len(), f.code.len());
        assert_eq!(opt.func.lines, f.lines);
        assert_eq!(opt.func.code[1], Op::Move { dst: 1, src: 0 });
        assert_eq!(opt.func.code[3], Op::Return { src: 1 });
    }
}
