//! begin/rescue/else/ensure lowering.
//!
//! Protected regions are open entries on the builder's protect stack; each
//! owns one handler whose covered ranges grow as code is emitted. A jump out
//! of a region (`return`, `break`, `next`, `redo`, `retry`) closes the ranges
//! it leaves, emits their cleanup inline (ensure bodies, `$!` restore) and
//! reopens them after the jump. The ensure body is therefore emitted once per
//! exit path plus once on the landing pad.

use crate::ast::{Node, NodeKind, RescueClause};
use crate::ir::{Handler, HandlerKind, Op, Reg};

use super::{Compiler, ErrorKind, Label, Result};

#[derive(Debug, Clone)]
pub(super) enum ProtectKind {
    /// Body of a begin with rescue clauses.
    Rescue,
    /// Inside a rescue clause, where the caught exception is `$!`.
    Clause,
    Ensure(Node),
}

#[derive(Debug, Clone)]
pub(super) struct Protect {
    kind: ProtectKind,
    handler: usize,
    start: u32,
}

impl Compiler<'_> {
    // ---- protect stack ----

    fn handler(&mut self, kind: HandlerKind) -> usize {
        let depth = self.cur.protects.len() as u16;
        self.cur.handlers.push(Handler { ranges: Vec::new(), target: 0, kind, depth });
        self.cur.handlers.len() - 1
    }

    fn push_protect(&mut self, kind: ProtectKind, handler: usize) {
        let start = self.pc();
        self.cur.protects.push(Protect { kind, handler, start });
    }

    /// Pop the innermost region and close its current range.
    fn pop_protect(&mut self) -> Option<Protect> {
        let p = self.cur.protects.pop()?;
        let end = self.pc();
        if p.start < end {
            self.cur.handlers[p.handler].ranges.push((p.start, end));
        }
        Some(p)
    }

    fn land(&mut self, handler: usize) {
        self.cur.handlers[handler].target = self.pc();
    }

    fn unwind_slot(&mut self) -> Result<u16> {
        let slot = self.cur.unwind_slots;
        self.cur.unwind_slots = slot.checked_add(1).ok_or_else(|| self.exhausted("ensure clauses"))?;
        Ok(slot)
    }

    /// Leave every region above `depth`, innermost first, emitting each one's
    /// cleanup while the regions outside it still cover the code.
    pub(super) fn exit_protects(&mut self, depth: usize) -> Result<Vec<Protect>> {
        let mut exited = Vec::new();
        while self.cur.protects.len() > depth {
            let Some(p) = self.pop_protect() else { break };
            match &p.kind {
                ProtectKind::Rescue => {}
                ProtectKind::Clause => {
                    self.emit(Op::ClearException);
                }
                ProtectKind::Ensure(body) => {
                    let body = body.clone();
                    self.discard(&body)?;
                }
            }
            exited.push(p);
        }
        Ok(exited)
    }

    /// Reopen regions closed by [`Compiler::exit_protects`] at the current pc.
    pub(super) fn restore_protects(&mut self, exited: Vec<Protect>) {
        let pc = self.pc();
        for mut p in exited.into_iter().rev() {
            p.start = pc;
            self.cur.protects.push(p);
        }
    }

    /// Emit code the innermost region must not cover.
    fn uncovered(&mut self, emit: impl FnOnce(&mut Self)) {
        match self.pop_protect() {
            Some(p) => {
                emit(self);
                self.restore_protects(vec![p]);
            }
            None => emit(self),
        }
    }

    // ── begin ───────────────────────────────────────────────────────

    pub(super) fn begin(
        &mut self,
        body: Option<&Node>,
        rescues: &[RescueClause],
        else_body: Option<&Node>,
        ensure: Option<&Node>,
        dst: Reg,
    ) -> Result<()> {
        let Some(ensure) = ensure else {
            return self.rescue(body, rescues, else_body, dst);
        };
        let handler = self.handler(HandlerKind::Ensure);
        self.push_protect(ProtectKind::Ensure(ensure.clone()), handler);
        self.rescue(body, rescues, else_body, dst)?;
        self.pop_protect();

        self.discard(ensure)?;
        let end = self.label();
        self.jump(end);

        let slot = self.unwind_slot()?;
        self.land(handler);
        self.emit(Op::SaveUnwind { slot });
        self.discard(ensure)?;
        self.emit(Op::ResumeUnwind { slot });
        self.place(end);
        Ok(())
    }

    fn rescue(&mut self, body: Option<&Node>, rescues: &[RescueClause], else_body: Option<&Node>, dst: Reg) -> Result<()> {
        if rescues.is_empty() {
            self.expr_opt(body, dst)?;
            if let Some(e) = else_body {
                self.expr(e, dst)?;
            }
            return Ok(());
        }
        let exc = self.tmp()?;
        let depth = self.cur.protects.len();
        let start = self.label();
        self.place(start);

        let handler = self.handler(HandlerKind::Rescue);
        self.push_protect(ProtectKind::Rescue, handler);
        self.expr_opt(body, dst)?;
        self.pop_protect();
        if let Some(e) = else_body {
            self.expr(e, dst)?;
        }
        let done = self.label();
        self.jump(done);

        // Landing pad: take the exception, then test each clause in order.
        self.land(handler);
        self.emit(Op::CatchException { dst: exc });
        let restore = self.handler(HandlerKind::Ensure);
        self.push_protect(ProtectKind::Clause, restore);
        self.cur.retries.push((start, depth));

        let targets: Vec<Label> = rescues.iter().map(|_| self.label()).collect();
        for (clause, &target) in rescues.iter().zip(&targets) {
            self.clause_test(clause, exc, target)?;
        }
        self.uncovered(|c| {
            c.emit(Op::Reraise { src: exc });
        });
        for (clause, &target) in rescues.iter().zip(&targets) {
            self.place(target);
            if let Some(var) = &clause.var {
                self.assign_target(var, exc)?;
            }
            self.expr_opt(clause.body.as_ref(), dst)?;
            self.uncovered(|c| {
                c.emit(Op::ClearException);
                c.jump(done);
            });
        }
        self.cur.retries.pop();
        self.pop_protect();

        // A clause left by an exception of its own still drops `$!`.
        let slot = self.unwind_slot()?;
        self.land(restore);
        self.emit(Op::SaveUnwind { slot });
        self.emit(Op::ClearException);
        self.emit(Op::ResumeUnwind { slot });
        self.place(done);
        Ok(())
    }

    /// Branch to `target` when `exc` matches one of the clause's classes
    /// (StandardError when none are listed).
    fn clause_test(&mut self, clause: &RescueClause, exc: Reg, target: Label) -> Result<()> {
        let mark = self.mark();
        if clause.classes.is_empty() {
            let class = self.tmp()?;
            let name = self.intern("StandardError");
            let site = self.core.caches.new_const_site();
            self.emit(Op::GetConst { dst: class, scope: None, top: true, name, site, soft: false });
            let t = self.tmp()?;
            self.eqq(t, class, exc);
            self.branch(t, true, target);
        }
        for class in &clause.classes {
            let t = self.tmp()?;
            match &class.kind {
                NodeKind::Splat { value } => {
                    let list = self.value(value)?;
                    self.emit(Op::CaseSplatTest { dst: t, subject: exc, list });
                }
                NodeKind::BlockPass { .. } => return Err(self.err(class, ErrorKind::Unexpected("block_pass"))),
                _ => {
                    let c = self.value(class)?;
                    self.eqq(t, c, exc);
                }
            }
            self.branch(t, true, target);
        }
        self.release(mark);
        Ok(())
    }

    /// `dst = class === exc` through normal dispatch, so a redefined `===`
    /// is honored.
    fn eqq(&mut self, dst: Reg, class: Reg, exc: Reg) {
        let sel = self.core.s.eqq;
        self.send(dst, Some(class), sel, exc, 1, crate::ir::CallKind::Normal);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::ir::{Function, HandlerKind, Op};
    use crate::runtime::{Capture, Core};

    fn top(root: crate::ast::Node) -> Arc<Function> {
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        let id = core.load(&Program::new("r.rb", root)).unwrap();
        core.functions.get(id).unwrap().ir.clone()
    }

    #[test]
    fn rescue_region_covers_only_the_body() {
        let f = top(begin(
            Some(fcall("risky", vec![])),
            vec![rescue(vec![], Some("e"), Some(sym("handled")))],
            Some(fcall("after", vec![])),
            None,
        ));
        let rescue = f.handlers.iter().find(|h| h.kind == HandlerKind::Rescue).unwrap();
        let risky = f.code.iter().position(|op| matches!(op, Op::Send { .. })).unwrap() as u32;
        assert!(rescue.covers(risky));
        let catch = f.code.iter().position(|op| matches!(op, Op::CatchException { .. })).unwrap() as u32;
        assert_eq!(rescue.target, catch);
        let reraise = f.code.iter().position(|op| matches!(op, Op::Reraise { .. })).unwrap() as u32;
        assert!(f.handlers.iter().all(|h| !h.covers(reraise)));
    }

    #[test]
    fn nested_regions_sort_innermost_first() {
        let inner = begin(Some(fcall("x", vec![])), vec![rescue(vec![], None, None)], None, None);
        let f = top(begin(Some(inner), vec![], None, Some(fcall("done", vec![]))));
        assert_eq!(f.handlers.first().map(|h| h.kind), Some(HandlerKind::Rescue));
        assert_eq!(f.handlers.last().map(|h| h.kind), Some(HandlerKind::Ensure));
        assert!(f.handlers.windows(2).all(|w| w[0].depth >= w[1].depth));
        assert_eq!(f.unwind_slots, 2);
    }

    #[test]
    fn retry_jumps_back_to_the_begin() {
        let f = top(begin(Some(fcall("x", vec![])), vec![rescue(vec![], None, Some(retry()))], None, None));
        let clear_then_jump = f.code.windows(2).any(|w| {
            matches!(w, [Op::ClearException, Op::Jump { target: 0 }])
        });
        assert!(clear_then_jump);
    }
}
