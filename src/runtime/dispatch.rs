//! The runtime dispatcher: every call site, `yield`, `super` and block call
//! ends up here.
//!
//! Call-site caches are monomorphic. A hit requires the receiver's class and
//! the current method generation to match; anything else re-resolves through
//! the class table and overwrites the slot.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, trace};

use super::Unwind;
use super::block::Proc;
use super::builtins;
use super::cache::SiteId;
use super::class::ClassId;
use super::heap::Data;
use super::method::{MethodBody, MethodEntry};
use super::symbol::Symbol;
use crate::ir::CallKind;
use crate::value::Value;
use crate::vm::{Entry, Interp};

impl Interp {
    /// Call `sel` on `recv` through the inline cache at `site`.
    pub fn dispatch(
        &mut self,
        site: SiteId,
        recv: Value,
        sel: Symbol,
        block: Option<Value>,
        kind: CallKind,
        args: &[Value],
    ) -> Result<Value, Unwind> {
        self.check_kill()?;
        let class = self.core.class_of(recv);
        match self.resolve_cached(site, class, sel) {
            Some(target) => self.invoke(&target, recv, args, block, false),
            None => self.method_missing(recv, sel, kind, args, block),
        }
    }

    /// Cached target for `(site, class)`, re-resolving on a miss.
    pub fn resolve_cached(&self, site: SiteId, class: ClassId, sel: Symbol) -> Option<Arc<MethodEntry>> {
        let caches = &self.core.caches;
        if let Some(target) = caches.lookup_call(site, class) {
            return Some(target);
        }
        let generation = caches.method_generation();
        let target = self.core.lookup_method(class, sel)?;
        debug!(
            target: "garnet::cache",
            site,
            selector = %self.core.symbols.name(sel),
            class = %self.core.class_name(class),
            kind = ?target.kind(),
            "call cache miss"
        );
        caches.store_call(site, class, generation, target.clone());
        Some(target)
    }

    /// Check arity, marshal and run a resolved target.
    pub fn invoke(
        &mut self,
        target: &Arc<MethodEntry>,
        recv: Value,
        args: &[Value],
        block: Option<Value>,
        via_super: bool,
    ) -> Result<Value, Unwind> {
        if !target.arity.accepts(args.len()) {
            let msg = target.arity.mismatch_message(args.len());
            return Err(self.raise(self.core.c.argument_error, &msg));
        }
        match target.body {
            MethodBody::Compiled(fid) => {
                if target.flags.empty_body {
                    return Ok(Value::NIL);
                }
                let core = self.core.clone();
                let slots = target.arity.marshal(args, |rest| core.new_array(rest));
                self.execute(fid, slots, Entry::method(recv, target, block, via_super))
            }
            MethodBody::Foreign(f) => f(self, recv, args, block),
            MethodBody::AttrReader(name) => Ok(self.core.ivar_get(recv, name)),
            MethodBody::AttrWriter(name) => {
                self.core.ivar_set(recv, name, args[0]);
                Ok(args[0])
            }
        }
    }

    /// Uncached call, for host code. With `is_super`, resolves past the method
    /// of the innermost compiled frame.
    pub fn call(
        &mut self,
        recv: Value,
        sel: Symbol,
        args: &[Value],
        block: Option<Value>,
        is_super: bool,
    ) -> Result<Value, Unwind> {
        if is_super {
            return self.super_from(recv, sel, args, block);
        }
        self.check_kill()?;
        let class = self.core.class_of(recv);
        match self.core.lookup_method(class, sel) {
            Some(target) => self.invoke(&target, recv, args, block, false),
            None => self.method_missing(recv, sel, CallKind::Normal, args, block),
        }
    }

    // ---- super ----

    /// `super` from the innermost compiled frame.
    ///
    /// The walk starts after the current method's owner in the receiver's
    /// ancestors and skips every method already running in the chain of
    /// `super` calls that led here, so a module reached twice through
    /// re-inclusion cannot select itself again.
    pub fn call_super(&mut self, site: SiteId, recv: Value, args: &[Value], block: Option<Value>) -> Result<Value, Unwind> {
        let Some(method) = self.thread.frames.last().and_then(|f| f.method.clone()) else {
            return Err(self.raise(self.core.c.runtime_error, "super called outside of method"));
        };
        let class = self.core.class_of(recv);
        let plain_chain = self.thread.frames.last().is_some_and(|f| !f.via_super);
        if plain_chain && let Some(target) = self.core.caches.lookup_call(site, class) {
            return self.invoke(&target, recv, args, block, true);
        }
        let generation = self.core.caches.method_generation();
        match self.super_target(&method, class) {
            Some(target) => {
                if plain_chain {
                    self.core.caches.store_call(site, class, generation, target.clone());
                }
                self.invoke(&target, recv, args, block, true)
            }
            None => self.method_missing(recv, method.selector, CallKind::Super, args, block),
        }
    }

    fn super_from(&mut self, recv: Value, sel: Symbol, args: &[Value], block: Option<Value>) -> Result<Value, Unwind> {
        let Some(method) = self.thread.frames.last().and_then(|f| f.method.clone()) else {
            return Err(self.raise(self.core.c.runtime_error, "super called outside of method"));
        };
        let class = self.core.class_of(recv);
        match self.super_target(&method, class) {
            Some(target) => self.invoke(&target, recv, args, block, true),
            None => self.method_missing(recv, sel, CallKind::Super, args, block),
        }
    }

    fn super_target(&self, method: &Arc<MethodEntry>, class: ClassId) -> Option<Arc<MethodEntry>> {
        let active = self.active_super_chain();
        let ancestors = self.core.classes.ancestors(class);
        let start = ancestors.iter().position(|&c| c == method.owner).map_or(ancestors.len(), |i| i + 1);
        ancestors[start..]
            .iter()
            .filter_map(|&c| self.core.classes.get(c).method(method.selector))
            .find(|m| m.id != method.id && !active.contains(&m.id))
    }

    /// Method ids of the innermost run of frames linked by `super`, plus the
    /// frame that started it.
    fn active_super_chain(&self) -> HashSet<u64> {
        let mut active = HashSet::new();
        for f in self.thread.frames.iter().rev() {
            if let Some(m) = &f.method {
                active.insert(m.id);
            }
            if !f.via_super {
                break;
            }
        }
        active
    }

    // ---- blocks ----

    /// `yield`: call the block of the innermost compiled frame.
    pub fn yield_to_current_block(&mut self, args: &[Value]) -> Result<Value, Unwind> {
        match self.thread.frames.last().and_then(|f| f.block) {
            Some(block) => self.call_block(block, args),
            None => Err(self.raise(self.core.c.local_jump_error, "no block given (yield)")),
        }
    }

    /// Invoke a Proc object. Lambdas check arity strictly; plain blocks adapt
    /// the argument list (auto-spread, nil padding, truncation).
    pub fn call_block(&mut self, block: Value, args: &[Value]) -> Result<Value, Unwind> {
        let proc_ = match self.core.heap.get(block).map(|o| match &o.data {
            Data::Proc(p) => Some(p.clone()),
            _ => None,
        }) {
            Some(Some(p)) => p,
            _ => {
                let desc = builtins::inspect(self, block)?;
                return Err(self.raise(self.core.c.type_error, &format!("{desc} is not a proc")));
            }
        };
        match proc_ {
            Proc::Symbol(sym) => {
                let Some((&recv, rest)) = args.split_first() else {
                    return Err(self.raise(self.core.c.argument_error, "no receiver given"));
                };
                self.call(recv, sym, rest, None, false)
            }
            Proc::Block(b) => {
                let core = self.core.clone();
                let slots = if b.is_lambda() {
                    if !b.arity.accepts(args.len()) {
                        let msg = b.arity.mismatch_message(args.len());
                        return Err(self.raise(core.c.argument_error, &msg));
                    }
                    b.arity.marshal(args, |rest| core.new_array(rest))
                } else {
                    let spread = match args {
                        [one] => core.heap.array(*one),
                        _ => None,
                    };
                    b.arity.adapt(args, spread, |rest| core.new_array(rest))
                };
                trace!(target: "garnet::dispatch", func = b.func, argc = args.len(), "block call");
                let entry = Entry {
                    self_val: b.self_val,
                    block: b.outer_block,
                    method: b.method.clone(),
                    cref: b.cref.clone(),
                    env: b.env.clone(),
                    proc_: Some(b.clone()),
                    via_super: false,
                };
                self.execute(b.func, slots, entry)
            }
        }
    }

    // ---- failures ----

    /// Route an unresolved selector to `method_missing`. The builtin default
    /// raises directly with wording chosen by the call shape.
    pub fn method_missing(
        &mut self,
        recv: Value,
        sel: Symbol,
        kind: CallKind,
        args: &[Value],
        block: Option<Value>,
    ) -> Result<Value, Unwind> {
        let class = self.core.class_of(recv);
        let handler = self.core.lookup_method(class, self.core.s.method_missing);
        match handler {
            Some(h) if !h.is_foreign(builtins::kernel::method_missing) => {
                let mut argv = Vec::with_capacity(args.len() + 1);
                argv.push(Value::symbol(sel));
                argv.extend_from_slice(args);
                self.invoke(&h, recv, &argv, block, false)
            }
            _ => Err(self.no_method_error(recv, sel, kind)),
        }
    }

    pub fn no_method_error(&mut self, recv: Value, sel: Symbol, kind: CallKind) -> Unwind {
        let name = self.core.symbols.name(sel);
        let target = self.describe_receiver(recv);
        let (class, msg) = match kind {
            CallKind::VCall => (self.core.c.name_error, format!("undefined local variable or method `{name}' for {target}")),
            CallKind::Super => (self.core.c.no_method_error, format!("super: no superclass method `{name}' for {target}")),
            CallKind::Normal | CallKind::FCall => (self.core.c.no_method_error, format!("undefined method `{name}' for {target}")),
        };
        self.raise(class, &msg)
    }

    /// Receiver wording for NoMethodError messages.
    pub fn describe_receiver(&self, recv: Value) -> String {
        let core = &self.core;
        match recv {
            Value::NIL => "nil".into(),
            Value::TRUE => "true".into(),
            Value::FALSE => "false".into(),
            v if v == core.main => "main:Object".into(),
            v => match v.as_class() {
                Some(id) if core.classes.get(id).is_module => format!("module {}", core.class_name(id)),
                Some(id) => format!("class {}", core.class_name(id)),
                None => format!("an instance of {}", core.class_name(core.class_of(v))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::Config;
    use crate::runtime::arity::Arity;
    use crate::runtime::method::MethodFlags;
    use crate::runtime::{Capture, Core};

    fn interp() -> Interp {
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        Interp::main(core)
    }

    fn one(_: &mut Interp, _: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
        Ok(Value::int(1))
    }

    fn two(_: &mut Interp, _: Value, _: &[Value], _: Option<Value>) -> Result<Value, Unwind> {
        Ok(Value::int(2))
    }

    #[test]
    fn redefinition_is_seen_through_a_warm_cache() {
        let mut interp = interp();
        let core = interp.core.clone();
        let site = core.caches.new_call_site();
        let k = core.define_class(core.c.object, core.symbols.intern("K"), None, false);
        core.define_foreign(k, "m", 0, 0, one);
        let obj = core.new_object(k);
        let m = core.symbols.intern("m");
        assert_eq!(interp.dispatch(site, obj, m, None, CallKind::Normal, &[]), Ok(Value::int(1)));
        assert_eq!(interp.dispatch(site, obj, m, None, CallKind::Normal, &[]), Ok(Value::int(1)));
        core.define_foreign(k, "m", 0, 0, two);
        assert_eq!(interp.dispatch(site, obj, m, None, CallKind::Normal, &[]), Ok(Value::int(2)));
    }

    #[test]
    fn class_mismatch_re_resolves_and_overwrites() {
        let mut interp = interp();
        let core = interp.core.clone();
        let site = core.caches.new_call_site();
        let a = core.define_class(core.c.object, core.symbols.intern("A"), None, false);
        let b = core.define_class(core.c.object, core.symbols.intern("B"), None, false);
        core.define_foreign(a, "m", 0, 0, one);
        core.define_foreign(b, "m", 0, 0, two);
        let m = core.symbols.intern("m");
        interp.dispatch(site, core.new_object(a), m, None, CallKind::Normal, &[]).unwrap();
        assert_eq!(core.caches.peek_call(site).map(|(c, _)| c), Some(a));
        let r = interp.dispatch(site, core.new_object(b), m, None, CallKind::Normal, &[]);
        assert_eq!(r, Ok(Value::int(2)));
        assert_eq!(core.caches.peek_call(site).map(|(c, _)| c), Some(b));
    }

    #[test]
    fn arity_mismatch_raises_argument_error() {
        let mut interp = interp();
        let core = interp.core.clone();
        let site = core.caches.new_call_site();
        core.define_method(
            core.c.object,
            core.symbols.intern("m"),
            MethodBody::Foreign(one),
            Arity::fixed(1),
            MethodFlags::default(),
            Arc::new(vec![core.c.object]),
        );
        let m = core.symbols.intern("m");
        let Err(Unwind::Raise(exc)) = interp.dispatch(site, core.main, m, None, CallKind::FCall, &[]) else {
            panic!("expected ArgumentError");
        };
        assert_eq!(core.class_of(exc), core.c.argument_error);
        assert_eq!(
            builtins::exception_message(&mut interp, exc),
            "wrong number of arguments (given 0, expected 1)"
        );
    }

    #[test]
    fn missing_method_messages_depend_on_call_kind() {
        let mut interp = interp();
        let core = interp.core.clone();
        let site = core.caches.new_call_site();
        let foo = core.symbols.intern("foo");
        let Err(Unwind::Raise(e)) = interp.dispatch(site, Value::NIL, foo, None, CallKind::Normal, &[]) else { panic!() };
        assert_eq!(builtins::exception_message(&mut interp, e), "undefined method `foo' for nil");
        let Err(Unwind::Raise(e)) = interp.dispatch(site, core.main, foo, None, CallKind::VCall, &[]) else { panic!() };
        assert_eq!(core.class_of(e), core.c.name_error);
        assert_eq!(builtins::exception_message(&mut interp, e), "undefined local variable or method `foo' for main:Object");
    }

    #[test]
    fn killed_thread_stops_at_dispatch() {
        let mut interp = interp();
        let core = interp.core.clone();
        interp.thread.kill.store(true, Ordering::Release);
        let site = core.caches.new_call_site();
        let r = interp.dispatch(site, Value::int(1), core.symbols.intern("to_s"), None, CallKind::Normal, &[]);
        assert_eq!(r, Err(Unwind::Kill));
    }
}
