//! Assignment forms: simple, attribute, multiple and operator assignment.

use crate::ast::{Node, NodeKind};
use crate::ir::{BlockOperand, CallKind, Op, Reg};
use crate::runtime::cache::InlineOp;

use super::{Compiler, ErrorKind, Result};

impl Compiler<'_> {
    /// `a = v`, `@a = v`, `@@a = v`, `$a = v`, `A = v`; the value lands in
    /// `dst` too.
    pub(super) fn assign(&mut self, node: &Node, dst: Reg) -> Result<()> {
        let value = match &node.kind {
            NodeKind::Lasgn { value, .. }
            | NodeKind::Iasgn { value, .. }
            | NodeKind::Cvasgn { value, .. }
            | NodeKind::Gasgn { value, .. }
            | NodeKind::Cdecl { value, .. } => value.as_deref(),
            _ => None,
        };
        let Some(value) = value else {
            return Err(self.err(node, ErrorKind::Unexpected(node.kind_name())));
        };
        if let NodeKind::Cdecl { scope: Some(scope), name, .. } = &node.kind {
            let scope = self.value(scope)?;
            self.expr(value, dst)?;
            let name = self.intern(name);
            self.emit(Op::SetConst { scope: Some(scope), name, src: dst });
            return Ok(());
        }
        self.expr(value, dst)?;
        self.assign_target(node, dst)
    }

    /// Store `src` into a target, ignoring any value the target node carries.
    /// Used for masgn slots and `rescue => e`.
    pub(super) fn assign_target(&mut self, target: &Node, src: Reg) -> Result<()> {
        match &target.kind {
            NodeKind::Lasgn { name, .. } => self.write_local(target, name, src)?,
            NodeKind::Iasgn { name, .. } => {
                let name = self.intern(name);
                self.emit(Op::SetIvar { name, src });
            }
            NodeKind::Cvasgn { name, .. } => {
                let name = self.intern(name);
                self.emit(Op::SetCvar { name, src });
            }
            NodeKind::Gasgn { name, .. } => {
                let name = self.intern(name);
                self.emit(Op::SetGlobal { name, src });
            }
            NodeKind::Cdecl { scope, name, .. } => {
                let scope = scope.as_deref().map(|s| self.value(s)).transpose()?;
                let name = self.intern(name);
                self.emit(Op::SetConst { scope, name, src });
            }
            NodeKind::AttrAsgn { receiver, name, args } => {
                let mark = self.mark();
                let recv = self.value(receiver)?;
                let start = self.tmps(args.len() + 1)?;
                for (i, a) in args.iter().enumerate() {
                    self.expr(a, start + i as Reg)?;
                }
                let last = start + args.len() as Reg;
                self.emit(Op::Move { dst: last, src });
                let argc = self.count(args.len() + 1)?;
                let scratch = self.tmp()?;
                self.setter(scratch, recv, name, start, argc);
                self.release(mark);
            }
            NodeKind::Masgn { pre, splat, post, value: None } => {
                let mark = self.mark();
                let arr = self.tmp()?;
                self.emit(Op::ToArray { dst: arr, src });
                self.destructure(pre, splat.as_deref(), post, arr)?;
                self.release(mark);
            }
            NodeKind::Splat { value } => self.assign_target(value, src)?,
            _ => return Err(self.err(target, ErrorKind::NotAssignable(target.kind_name()))),
        }
        Ok(())
    }

    fn setter(&mut self, dst: Reg, recv: Reg, name: &str, args: Reg, argc: u16) {
        let sel = self.intern(name);
        let inline = (self.core.config.inline_operators && name == "[]=").then_some(InlineOp::Aset);
        let site = self.core.caches.new_call_site();
        self.emit(Op::Send {
            dst,
            recv: Some(recv),
            sel,
            args,
            argc,
            splat: false,
            block: BlockOperand::None,
            kind: CallKind::Normal,
            site,
            inline,
            via: None,
        });
    }

    /// `recv.name = v` / `recv[i] = v`. The expression's value is `v`, not
    /// whatever the setter returns.
    pub(super) fn attr_asgn(&mut self, node: &Node, receiver: &Node, name: &str, args: &[Node], dst: Reg) -> Result<()> {
        if args.is_empty() {
            return Err(self.err(node, ErrorKind::Unexpected("attr_asgn without value")));
        }
        let recv = self.value(receiver)?;
        if args.iter().any(|a| matches!(a.kind, NodeKind::Splat { .. })) {
            let list = self.tmp()?;
            self.array(args, list)?;
            let sel = self.intern(name);
            let site = self.core.caches.new_call_site();
            self.emit(Op::Send {
                dst,
                recv: Some(recv),
                sel,
                args: list,
                argc: 1,
                splat: true,
                block: BlockOperand::None,
                kind: CallKind::Normal,
                site,
                inline: None,
                via: None,
            });
            return Ok(());
        }
        let start = self.tmps(args.len())?;
        for (i, a) in args.iter().enumerate() {
            self.expr(a, start + i as Reg)?;
        }
        let argc = self.count(args.len())?;
        let scratch = self.tmp()?;
        self.setter(scratch, recv, name, start, argc);
        self.emit(Op::Move { dst, src: start + argc - 1 });
        Ok(())
    }

    /// `a, b, *c, d = value`. The expression's value is the right-hand side.
    pub(super) fn masgn(&mut self, pre: &[Node], splat: Option<&Node>, post: &[Node], value: &Node, dst: Reg) -> Result<()> {
        self.expr(value, dst)?;
        let arr = self.tmp()?;
        self.emit(Op::ToArray { dst: arr, src: dst });
        self.destructure(pre, splat, post, arr)
    }

    fn destructure(&mut self, pre: &[Node], splat: Option<&Node>, post: &[Node], arr: Reg) -> Result<()> {
        let t = self.tmp()?;
        let lead = self.count(pre.len())?;
        let tail = self.count(post.len())?;
        for (i, target) in pre.iter().enumerate() {
            self.emit(Op::ArrayGet { dst: t, src: arr, index: i as u16 });
            self.assign_target(target, t)?;
        }
        if let Some(s) = splat {
            self.emit(Op::ArraySlice { dst: t, src: arr, start: lead, tail });
            self.assign_target(s, t)?;
        }
        for (i, target) in post.iter().enumerate() {
            self.emit(Op::ArrayPost { dst: t, src: arr, start: lead, count: tail, index: i as u16 });
            self.assign_target(target, t)?;
        }
        Ok(())
    }

    /// `target op= value`, including `||=` and `&&=`. The target is a
    /// variable read, an attribute read or an index read.
    pub(super) fn op_asgn(&mut self, target: &Node, op: &str, value: &Node, dst: Reg) -> Result<()> {
        match &target.kind {
            NodeKind::Lvar { .. }
            | NodeKind::Ivar { .. }
            | NodeKind::Cvar { .. }
            | NodeKind::Gvar { .. } => {
                self.expr(target, dst)?;
                self.combine(op, value, dst, |c, src| c.store_var(target, src))
            }
            // `X ||= v` assigns an undefined constant instead of raising.
            NodeKind::Const { scope, top, name } => {
                let scope_reg = scope.as_deref().map(|s| self.value(s)).transpose()?;
                let sym = self.intern(name);
                let site = self.core.caches.new_const_site();
                self.emit(Op::GetConst { dst, scope: scope_reg, top: *top, name: sym, site, soft: op == "||" });
                self.combine(op, value, dst, |c, src| c.store_var(target, src))
            }
            NodeKind::Call { receiver: Some(receiver), name, args, block: None }
                if !args.iter().any(|a| matches!(a.kind, NodeKind::Splat { .. } | NodeKind::BlockPass { .. })) =>
            {
                let recv = self.value(receiver)?;
                let start = self.tmps(args.len() + 1)?;
                for (i, a) in args.iter().enumerate() {
                    self.expr(a, start + i as Reg)?;
                }
                let argc = self.count(args.len())?;
                let getter = self.intern(name);
                self.send(dst, Some(recv), getter, start, argc, CallKind::Normal);
                let setter = if name == "[]" { "[]=".to_string() } else { format!("{name}=") };
                self.combine(op, value, dst, |c, src| {
                    c.emit(Op::Move { dst: start + argc, src });
                    let scratch = c.tmp()?;
                    c.setter(scratch, recv, &setter, start, argc + 1);
                    Ok(())
                })
            }
            _ => Err(self.err(target, ErrorKind::NotAssignable(target.kind_name()))),
        }
    }

    /// `dst` holds the current value; compute the new one into `dst` and
    /// hand it to `store`. `||=` and `&&=` skip both when the current value
    /// already decides the result.
    fn combine(
        &mut self,
        op: &str,
        value: &Node,
        dst: Reg,
        store: impl FnOnce(&mut Self, Reg) -> Result<()>,
    ) -> Result<()> {
        let short = match op {
            "||" => Some(true),
            "&&" => Some(false),
            _ => None,
        };
        if let Some(when) = short {
            let end = self.label();
            self.branch(dst, when, end);
            self.expr(value, dst)?;
            store(self, dst)?;
            self.place(end);
            return Ok(());
        }
        let rhs = self.value(value)?;
        match InlineOp::from_selector(op).filter(|o| o.is_binary()) {
            Some(inline) => self.binary(inline, dst, dst, rhs),
            None => {
                let sel = self.intern(op);
                self.send(dst, Some(dst), sel, rhs, 1, CallKind::Normal);
            }
        }
        store(self, dst)
    }

    /// Write back through the read node of an operator assignment.
    fn store_var(&mut self, target: &Node, src: Reg) -> Result<()> {
        match &target.kind {
            NodeKind::Lvar { name } => self.write_local(target, name, src)?,
            NodeKind::Ivar { name } => {
                let name = self.intern(name);
                self.emit(Op::SetIvar { name, src });
            }
            NodeKind::Cvar { name } => {
                let name = self.intern(name);
                self.emit(Op::SetCvar { name, src });
            }
            NodeKind::Gvar { name } => {
                let name = self.intern(name);
                self.emit(Op::SetGlobal { name, src });
            }
            NodeKind::Const { scope, name, .. } => {
                let scope = scope.as_deref().map(|s| self.value(s)).transpose()?;
                let name = self.intern(name);
                self.emit(Op::SetConst { scope, name, src });
            }
            _ => return Err(self.err(target, ErrorKind::NotAssignable(target.kind_name()))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::build::*;
    use crate::ast::{Node, Program};
    use crate::config::Config;
    use crate::runtime::{Capture, Core};
    use crate::value::Value;

    fn eval(root: Node) -> Value {
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        core.run(&Program::new("a.rb", root)).unwrap()
    }

    fn eval_out(root: Node) -> String {
        let out = Capture::new();
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(out.clone()));
        core.run(&Program::new("a.rb", root)).unwrap();
        out.contents()
    }

    #[test]
    fn masgn_spreads_with_splat_and_post() {
        let prog = seq(vec![
            masgn(vec![ltarget("a")], Some(ltarget("b")), vec![ltarget("c")], array(vec![int(1), int(2), int(3), int(4)])),
            fcall("p", vec![array(vec![lvar("a"), lvar("b"), lvar("c")])]),
        ]);
        assert_eq!(eval_out(prog), "[1, [2, 3], 4]\n");
    }

    #[test]
    fn masgn_swaps_and_nests() {
        let prog = seq(vec![
            lasgn("x", int(1)),
            lasgn("y", int(2)),
            masgn(vec![ltarget("x"), ltarget("y")], None, vec![], array(vec![lvar("y"), lvar("x")])),
            masgn(
                vec![ltarget("a"), mtarget(vec![ltarget("b"), ltarget("c")], None, vec![])],
                None,
                vec![],
                array(vec![int(1), array(vec![int(2), int(3)])]),
            ),
            fcall("p", vec![array(vec![lvar("x"), lvar("y"), lvar("a"), lvar("b"), lvar("c")])]),
        ]);
        assert_eq!(eval_out(prog), "[2, 1, 1, 2, 3]\n");
    }

    #[test]
    fn or_assign_short_circuits() {
        let prog = seq(vec![
            op_asgn(lvar("a"), "||", int(1)),
            op_asgn(lvar("a"), "||", int(2)),
            op_asgn(lvar("a"), "+", int(10)),
            lvar("a"),
        ]);
        assert_eq!(eval(prog), Value::int(11));
    }

    #[test]
    fn index_op_assign_reads_then_writes() {
        let prog = seq(vec![
            lasgn("arr", array(vec![int(1), int(2)])),
            op_asgn(call(lvar("arr"), "[]", vec![int(1)]), "*", int(5)),
            fcall("p", vec![lvar("arr")]),
        ]);
        assert_eq!(eval_out(prog), "[1, 10]\n");
    }

    #[test]
    fn attribute_assignment_evaluates_to_the_value() {
        let prog = seq(vec![
            class("Box", None, Some(fcall("attr_accessor", vec![sym("v")]))),
            lasgn("b", call(const_("Box"), "new", vec![])),
            lasgn("r", attr_asgn(lvar("b"), "v=", vec![int(7)])),
            op_asgn(call(lvar("b"), "v", vec![]), "&&", int(9)),
            array(vec![lvar("r"), call(lvar("b"), "v", vec![])]),
        ]);
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        let v = core.run(&Program::new("a.rb", prog)).unwrap();
        assert_eq!(core.heap.array(v), Some(vec![Value::int(7), Value::int(9)]));
    }
}
