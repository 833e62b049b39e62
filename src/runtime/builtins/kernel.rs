//! Kernel, BasicObject, Module and Class.

use std::sync::Arc;
use std::time::Duration;

use super::{Ret, default_to_s, inspect, name_arg, require_block, to_s};
use crate::ir::CallKind;
use crate::runtime::arity::Arity;
use crate::runtime::class::ClassId;
use crate::runtime::heap::{Data, Object};
use crate::runtime::method::{MethodBody, MethodFlags};
use crate::runtime::{Core, Unwind};
use crate::value::Value;
use crate::vm::Interp;

pub(crate) fn install(core: &Core) {
    let basic = core.c.basic_object;
    core.define_foreign(basic, "initialize", 0, 0, initialize);
    core.define_foreign(basic, "==", 1, 1, equal);
    core.define_foreign(basic, "equal?", 1, 1, equal);
    core.define_foreign(basic, "!", 0, 0, not);
    core.define_foreign(basic, "!=", 1, 1, not_equal);
    core.define_foreign(basic, "__send__", 1, -1, send);
    core.define_foreign(basic, "method_missing", 1, -1, method_missing);

    let k = core.c.kernel;
    core.define_foreign(k, "===", 1, 1, case_equal);
    core.define_foreign(k, "class", 0, 0, class);
    core.define_foreign(k, "nil?", 0, 0, is_nil);
    core.define_foreign(k, "is_a?", 1, 1, is_a);
    core.define_foreign(k, "kind_of?", 1, 1, is_a);
    core.define_foreign(k, "instance_of?", 1, 1, instance_of);
    core.define_foreign(k, "respond_to?", 1, 2, respond_to);
    core.define_foreign(k, "send", 1, -1, send);
    core.define_foreign(k, "public_send", 1, -1, send);
    core.define_foreign(k, "inspect", 0, 0, object_inspect);
    core.define_foreign(k, "to_s", 0, 0, object_to_s);
    core.define_foreign(k, "hash", 0, 0, object_id);
    core.define_foreign(k, "object_id", 0, 0, object_id);
    core.define_foreign(k, "instance_variable_get", 1, 1, ivar_get);
    core.define_foreign(k, "instance_variable_set", 2, 2, ivar_set);
    core.define_foreign(k, "instance_variables", 0, 0, ivars);
    core.define_foreign(k, "freeze", 0, 0, identity);
    core.define_foreign(k, "itself", 0, 0, identity);
    core.define_foreign(k, "tap", 0, 0, tap);
    core.define_foreign(k, "puts", 0, -1, puts);
    core.define_foreign(k, "print", 0, -1, print);
    core.define_foreign(k, "p", 0, -1, p);
    core.define_foreign(k, "raise", 0, 2, raise);
    core.define_foreign(k, "fail", 0, 2, raise);
    core.define_foreign(k, "lambda", 0, 0, lambda);
    core.define_foreign(k, "proc", 0, 0, proc_);
    core.define_foreign(k, "block_given?", 0, 0, block_given);
    core.define_foreign(k, "loop", 0, 0, loop_);
    core.define_foreign(k, "sleep", 0, 1, sleep);

    let m = core.c.module;
    core.define_foreign(m, "name", 0, 0, module_name);
    core.define_foreign(m, "to_s", 0, 0, module_to_s);
    core.define_foreign(m, "inspect", 0, 0, module_to_s);
    core.define_foreign(m, "===", 1, 1, module_eqq);
    core.define_foreign(m, "include", 1, -1, include);
    core.define_foreign(m, "include?", 1, 1, includes);
    core.define_foreign(m, "ancestors", 0, 0, ancestors);
    core.define_foreign(m, "attr_reader", 0, -1, attr_reader);
    core.define_foreign(m, "attr_writer", 0, -1, attr_writer);
    core.define_foreign(m, "attr_accessor", 0, -1, attr_accessor);
    core.define_foreign(m, "alias_method", 2, 2, alias_method);
    core.define_foreign(m, "method_defined?", 1, 1, method_defined);
    core.define_foreign(m, "instance_method_names", 0, 0, instance_method_names);
    core.define_foreign(m, "const_get", 1, 1, const_get);
    core.define_foreign(m, "const_set", 2, 2, const_set);
    for name in ["private", "public", "protected", "module_function", "private_constant"] {
        core.define_foreign(m, name, 0, -1, visibility);
    }

    let cmp = core.c.comparable;
    core.define_foreign(cmp, "<", 1, 1, cmp_lt);
    core.define_foreign(cmp, "<=", 1, 1, cmp_le);
    core.define_foreign(cmp, ">", 1, 1, cmp_gt);
    core.define_foreign(cmp, ">=", 1, 1, cmp_ge);
    core.define_foreign(cmp, "==", 1, 1, cmp_eq);
    core.define_foreign(cmp, "between?", 2, 2, between);

    for class in [core.c.nil, core.c.true_, core.c.false_] {
        core.define_foreign(class, "to_s", 0, 0, immediate_to_s);
        core.define_foreign(class, "inspect", 0, 0, immediate_inspect);
        core.define_foreign(class, "&", 1, 1, bool_and);
        core.define_foreign(class, "|", 1, 1, bool_or);
    }
    core.define_foreign(core.c.nil, "to_a", 0, 0, nil_to_a);

    let c = core.c.class;
    core.define_foreign(c, "new", 0, -1, class_new);
    core.define_foreign(c, "allocate", 0, 0, allocate);
    core.define_foreign(c, "superclass", 0, 0, superclass);
}

fn initialize(_: &mut Interp, _: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::NIL)
}

fn equal(_: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(recv == args[0]))
}

fn not(_: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(!recv.is_truthy()))
}

fn not_equal(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let eq = interp.core.s.eq;
    Ok(Value::bool(!interp.call(recv, eq, args, None, false)?.is_truthy()))
}

/// Default `===`: identity or `==`.
fn case_equal(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    if recv == args[0] {
        return Ok(Value::TRUE);
    }
    let eq = interp.core.s.eq;
    Ok(Value::bool(interp.call(recv, eq, args, None, false)?.is_truthy()))
}

fn send(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    let sel = name_arg(interp, args[0])?;
    interp.call(recv, sel, &args[1..], block, false)
}

/// Reached only when called explicitly; the dispatcher raises directly
/// when no user `method_missing` exists.
pub(crate) fn method_missing(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let sel = name_arg(interp, args[0])?;
    Err(interp.no_method_error(recv, sel, CallKind::Normal))
}

fn class(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::class(interp.core.visible_class(recv)))
}

fn is_nil(_: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(recv.is_nil()))
}

fn class_arg(interp: &mut Interp, v: Value) -> Result<ClassId, Unwind> {
    match v.as_class() {
        Some(id) => Ok(id),
        None => Err(interp.raise(interp.core.c.type_error, "class or module required")),
    }
}

fn is_a(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let class = class_arg(interp, args[0])?;
    Ok(Value::bool(interp.core.is_a(recv, class)))
}

fn instance_of(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let class = class_arg(interp, args[0])?;
    Ok(Value::bool(interp.core.visible_class(recv) == class))
}

fn respond_to(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let sel = name_arg(interp, args[0])?;
    let class = interp.core.class_of(recv);
    Ok(Value::bool(interp.core.lookup_method(class, sel).is_some()))
}

fn object_to_s(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = &interp.core;
    let text = if recv == core.main { "main".to_string() } else { default_to_s(core, recv) };
    Ok(core.new_string(text))
}

/// `#<Point @x=1, @y=2>`
fn object_inspect(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = interp.core.clone();
    if recv == core.main {
        return Ok(core.new_string("main"));
    }
    let ivars = core.heap.get(recv).map(|o| o.ivars()).unwrap_or_default();
    let class = core.class_name(core.class_of(recv));
    if ivars.is_empty() {
        return Ok(core.new_string(format!("#<{class}>")));
    }
    let mut parts = Vec::with_capacity(ivars.len());
    for (name, v) in ivars {
        let name = core.symbols.name(name);
        if name.starts_with("@__") {
            continue;
        }
        parts.push(format!("{name}={}", inspect(interp, v)?));
    }
    Ok(core.new_string(format!("#<{class} {}>", parts.join(", "))))
}

fn object_id(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.int_value((recv.bits() >> 1) as i128))
}

fn ivar_get(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let name = name_arg(interp, args[0])?;
    Ok(interp.core.ivar_get(recv, name))
}

fn ivar_set(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let name = name_arg(interp, args[0])?;
    if !interp.core.ivar_set(recv, name, args[1]) {
        return Err(interp.raise(interp.core.c.runtime_error, "can't modify frozen object"));
    }
    Ok(args[1])
}

fn ivars(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = &interp.core;
    let names = core
        .heap
        .get(recv)
        .map(|o| o.ivars())
        .unwrap_or_default()
        .into_iter()
        .filter(|(name, _)| !core.symbols.name(*name).starts_with("@__"))
        .map(|(name, _)| Value::symbol(name))
        .collect();
    Ok(core.new_array(names))
}

fn identity(_: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(recv)
}

fn tap(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    interp.call_block(block, &[recv])?;
    Ok(recv)
}

// ---- output ----

fn write(interp: &mut Interp, text: &str) -> Result<(), Unwind> {
    interp
        .core
        .write_output(text)
        .map_err(|e| interp.raise(interp.core.c.runtime_error, &format!("write failed: {e}")))
}

fn puts_lines(interp: &mut Interp, v: Value, out: &mut String) -> Result<(), Unwind> {
    if let Some(elements) = interp.core.heap.array(v) {
        for e in elements {
            puts_lines(interp, e, out)?;
        }
        return Ok(());
    }
    let line = to_s(interp, v)?;
    out.push_str(&line);
    if !line.ends_with('\n') {
        out.push('\n');
    }
    Ok(())
}

fn puts(interp: &mut Interp, _: Value, args: &[Value], _: Option<Value>) -> Ret {
    let mut out = String::new();
    if args.is_empty() {
        out.push('\n');
    }
    for &a in args {
        puts_lines(interp, a, &mut out)?;
    }
    write(interp, &out)?;
    Ok(Value::NIL)
}

fn print(interp: &mut Interp, _: Value, args: &[Value], _: Option<Value>) -> Ret {
    let mut out = String::new();
    for &a in args {
        out.push_str(&to_s(interp, a)?);
    }
    write(interp, &out)?;
    Ok(Value::NIL)
}

fn p(interp: &mut Interp, _: Value, args: &[Value], _: Option<Value>) -> Ret {
    let mut out = String::new();
    for &a in args {
        out.push_str(&inspect(interp, a)?);
        out.push('\n');
    }
    write(interp, &out)?;
    Ok(match args {
        [] => Value::NIL,
        [one] => *one,
        many => interp.core.new_array(many.to_vec()),
    })
}

// ---- control ----

/// `raise`, `raise "msg"`, `raise Klass`, `raise Klass, "msg"`, `raise exc`.
fn raise(interp: &mut Interp, _: Value, args: &[Value], _: Option<Value>) -> Ret {
    let core = interp.core.clone();
    let exc = match args {
        [] => {
            let current = interp.current_exception();
            if current.is_nil() {
                interp.exception(core.c.runtime_error, "unhandled exception")
            } else {
                current
            }
        }
        [msg] if core.heap.string(*msg).is_some() => {
            let text = core.heap.string(*msg).unwrap_or_default();
            interp.exception(core.c.runtime_error, &text)
        }
        [class, rest @ ..] if class.as_class().is_some() => {
            let new = core.symbols.intern("new");
            interp.call(*class, new, rest, None, false)?
        }
        [exc] => *exc,
        _ => return Err(interp.raise(core.c.type_error, "exception class/object expected")),
    };
    if !core.is_a(exc, core.c.exception) {
        return Err(interp.raise(core.c.type_error, "exception class/object expected"));
    }
    Err(interp.raise_value(exc))
}

fn lambda(interp: &mut Interp, _: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = match block {
        Some(b) => b,
        None => return Err(interp.raise(interp.core.c.argument_error, "tried to create Proc object without a block")),
    };
    if let Some(b) = interp.block_of(block) {
        b.mark_proc();
        b.mark_lambda();
    }
    Ok(block)
}

fn proc_(interp: &mut Interp, _: Value, _: &[Value], block: Option<Value>) -> Ret {
    match block {
        Some(b) => {
            interp.escape_block(b);
            Ok(b)
        }
        None => Err(interp.raise(interp.core.c.argument_error, "tried to create Proc object without a block")),
    }
}

fn block_given(interp: &mut Interp, _: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(interp.thread.frames.last().is_some_and(|f| f.block.is_some())))
}

/// Repeats the block until it breaks; StopIteration ends the loop quietly.
fn loop_(interp: &mut Interp, _: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    loop {
        interp.check_kill()?;
        match interp.call_block(block, &[]) {
            Ok(_) => {}
            Err(Unwind::Raise(exc)) if interp.core.is_a(exc, interp.core.c.stop_iteration) => {
                interp.thread.raised.pop();
                return Ok(Value::NIL);
            }
            Err(u) => return Err(u),
        }
    }
}

fn sleep(interp: &mut Interp, _: Value, args: &[Value], _: Option<Value>) -> Ret {
    let secs = match args.first() {
        None => f64::INFINITY,
        Some(&v) => match (v.as_fixnum(), interp.core.heap.float(v)) {
            (Some(n), _) => n as f64,
            (None, Some(f)) => f,
            _ => return Err(interp.raise(interp.core.c.type_error, "can't convert into time interval")),
        },
    };
    let start = std::time::Instant::now();
    while start.elapsed().as_secs_f64() < secs {
        interp.check_kill()?;
        let left = secs - start.elapsed().as_secs_f64();
        std::thread::sleep(Duration::from_secs_f64(left.clamp(0.0, 0.01)));
    }
    Ok(interp.core.int_value(secs.round() as i128))
}

// ---- Comparable ----

/// `recv <=> other` as an ordering; a nil answer is an ArgumentError.
fn compare(interp: &mut Interp, recv: Value, other: Value) -> Result<std::cmp::Ordering, Unwind> {
    let spaceship = interp.core.symbols.intern("<=>");
    let r = interp.call(recv, spaceship, &[other], None, false)?;
    match r.as_fixnum() {
        Some(n) => Ok(n.cmp(&0)),
        None => Err(comparison_failed(interp, recv, other)),
    }
}

pub(crate) fn comparison_failed(interp: &mut Interp, recv: Value, other: Value) -> Unwind {
    let core = &interp.core;
    let theirs = match other {
        Value::NIL => "nil".to_string(),
        Value::TRUE => "true".to_string(),
        Value::FALSE => "false".to_string(),
        v => core.class_name(core.visible_class(v)),
    };
    let msg = format!("comparison of {} with {theirs} failed", core.class_name(core.visible_class(recv)));
    interp.raise(interp.core.c.argument_error, &msg)
}

fn cmp_lt(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_lt()))
}

fn cmp_le(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_le()))
}

fn cmp_gt(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_gt()))
}

fn cmp_ge(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_ge()))
}

fn cmp_eq(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    if recv == args[0] {
        return Ok(Value::TRUE);
    }
    let spaceship = interp.core.symbols.intern("<=>");
    let r = interp.call(recv, spaceship, args, None, false)?;
    Ok(Value::bool(r.as_fixnum() == Some(0)))
}

fn between(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let above = compare(interp, recv, args[0])?.is_ge();
    Ok(Value::bool(above && compare(interp, recv, args[1])?.is_le()))
}

// ---- nil, true, false ----

fn immediate_to_s(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let text = match recv {
        Value::TRUE => "true",
        Value::FALSE => "false",
        _ => "",
    };
    Ok(interp.core.new_string(text))
}

fn immediate_inspect(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let text = match recv {
        Value::TRUE => "true",
        Value::FALSE => "false",
        _ => "nil",
    };
    Ok(interp.core.new_string(text))
}

fn bool_and(_: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(recv.is_truthy() && args[0].is_truthy()))
}

fn bool_or(_: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(recv.is_truthy() || args[0].is_truthy()))
}

fn nil_to_a(interp: &mut Interp, _: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.new_array(Vec::new()))
}

// ── Module ───────────────────────────────────────────────────────────

fn self_class(interp: &mut Interp, recv: Value) -> Result<ClassId, Unwind> {
    class_arg(interp, recv)
}

fn module_name(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let id = self_class(interp, recv)?;
    let core = &interp.core;
    Ok(match core.classes.get(id).name() {
        Some(name) => core.new_string(name),
        None => Value::NIL,
    })
}

fn module_to_s(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let id = self_class(interp, recv)?;
    let name = interp.core.class_name(id);
    Ok(interp.core.new_string(name))
}

fn module_eqq(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let id = self_class(interp, recv)?;
    Ok(Value::bool(interp.core.is_a(args[0], id)))
}

fn include(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let target = self_class(interp, recv)?;
    for &m in args {
        let module = class_arg(interp, m)?;
        if !interp.core.classes.get(module).is_module {
            let name = interp.core.class_name(module);
            return Err(interp.raise(interp.core.c.type_error, &format!("wrong argument type Class (expected Module): {name}")));
        }
        interp.core.include_module(target, module);
    }
    Ok(recv)
}

fn includes(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let target = self_class(interp, recv)?;
    let module = class_arg(interp, args[0])?;
    Ok(Value::bool(target != module && interp.core.classes.is_subclass(target, module)))
}

fn ancestors(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let id = self_class(interp, recv)?;
    let list = interp.core.classes.ancestors(id).into_iter().map(Value::class).collect();
    Ok(interp.core.new_array(list))
}

fn define_attrs(interp: &mut Interp, recv: Value, args: &[Value], reader: bool, writer: bool) -> Ret {
    let class = self_class(interp, recv)?;
    let cref = Arc::new(vec![class]);
    for &a in args {
        let name = name_arg(interp, a)?;
        let core = interp.core.clone();
        let text = core.symbols.name(name);
        let ivar = core.symbols.intern(&format!("@{text}"));
        if reader {
            core.define_method(class, name, MethodBody::AttrReader(ivar), Arity::fixed(0), MethodFlags::default(), cref.clone());
        }
        if writer {
            let setter = core.symbols.intern(&format!("{text}="));
            core.define_method(class, setter, MethodBody::AttrWriter(ivar), Arity::fixed(1), MethodFlags::default(), cref.clone());
        }
    }
    Ok(Value::NIL)
}

fn attr_reader(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    define_attrs(interp, recv, args, true, false)
}

fn attr_writer(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    define_attrs(interp, recv, args, false, true)
}

fn attr_accessor(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    define_attrs(interp, recv, args, true, true)
}

fn alias_method(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let class = self_class(interp, recv)?;
    let new = name_arg(interp, args[0])?;
    let old = name_arg(interp, args[1])?;
    let Some(entry) = interp.core.lookup_method(class, old) else {
        let msg = format!(
            "undefined method `{}' for class `{}'",
            interp.core.symbols.name(old),
            interp.core.class_name(class)
        );
        return Err(interp.raise(interp.core.c.name_error, &msg));
    };
    interp.core.define_method(class, new, entry.body.clone(), entry.arity, entry.flags, entry.cref.clone());
    Ok(Value::symbol(new))
}

fn method_defined(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let class = self_class(interp, recv)?;
    let sel = name_arg(interp, args[0])?;
    Ok(Value::bool(interp.core.lookup_method(class, sel).is_some()))
}

fn instance_method_names(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let class = self_class(interp, recv)?;
    let mut names: Vec<_> = interp.core.classes.get(class).methods.read().keys().copied().collect();
    names.sort_by_key(|s| interp.core.symbols.name(*s));
    Ok(interp.core.new_array(names.into_iter().map(Value::symbol).collect()))
}

fn const_get(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let class = self_class(interp, recv)?;
    let name = name_arg(interp, args[0])?;
    match interp.core.constant_in(class, name) {
        Some(v) => Ok(v),
        None => {
            let msg = format!("uninitialized constant {}::{}", interp.core.class_name(class), interp.core.symbols.name(name));
            Err(interp.raise(interp.core.c.name_error, &msg))
        }
    }
}

fn const_set(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let class = self_class(interp, recv)?;
    let name = name_arg(interp, args[0])?;
    interp.core.set_constant(class, name, args[1]);
    Ok(args[1])
}

fn visibility(_: &mut Interp, _: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(args.first().copied().unwrap_or(Value::NIL))
}

// ── Class ────────────────────────────────────────────────────────────

fn class_new(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    let obj = allocate(interp, recv, &[], None)?;
    let init = interp.core.s.initialize;
    interp.call(obj, init, args, block, false)?;
    Ok(obj)
}

fn allocate(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let class = self_class(interp, recv)?;
    let core = interp.core.clone();
    let c = &core.c;
    if [c.integer, c.float, c.symbol, c.nil, c.true_, c.false_]
        .iter()
        .any(|&immediate| core.classes.is_subclass(class, immediate))
    {
        let name = core.class_name(class);
        return Err(interp.raise(c.no_method_error, &format!("undefined method `new' for class {name}")));
    }
    if core.classes.get(class).is_module {
        let name = core.class_name(class);
        return Err(interp.raise(c.no_method_error, &format!("undefined method `new' for module {name}")));
    }
    let data = if core.classes.is_subclass(class, c.string) {
        Data::Str(parking_lot::Mutex::new(String::new()))
    } else if core.classes.is_subclass(class, c.array) {
        Data::Array(parking_lot::Mutex::new(Vec::new()))
    } else {
        Data::Plain
    };
    Ok(core.heap.alloc(Object::new(class, data)))
}

fn superclass(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let id = self_class(interp, recv)?;
    Ok(interp.core.classes.get(id).superclass.map_or(Value::NIL, Value::class))
}

#[cfg(test)]
mod tests {
    use crate::ast::build::*;
    use crate::ast::Program;
    use crate::config::Config;
    use crate::runtime::{Capture, Core};
    use crate::value::Value;

    fn eval(root: crate::ast::Node) -> (Value, String, std::sync::Arc<Core>) {
        let out = Capture::new();
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(out.clone()));
        let v = core.run(&Program::new("k.rb", root)).unwrap();
        (v, out.contents(), core)
    }

    #[test]
    fn puts_flattens_arrays_and_prints_nil_as_blank() {
        let (_, out, _) = eval(fcall("puts", vec![array(vec![int(1), array(vec![str_("a")])]), nil()]));
        assert_eq!(out, "1\na\n\n");
    }

    #[test]
    fn p_uses_inspect_and_returns_its_argument() {
        let (v, out, _) = eval(fcall("p", vec![str_("hi")]));
        assert_eq!(out, "\"hi\"\n");
        assert!(v.as_heap().is_some());
    }

    #[test]
    fn attr_accessor_defines_both_directions() {
        let prog = seq(vec![
            class("Pt", None, Some(fcall("attr_accessor", vec![sym("x")]))),
            lasgn("pt", call(const_("Pt"), "new", vec![])),
            attr_asgn(lvar("pt"), "x=", vec![int(7)]),
            call(lvar("pt"), "x", vec![]),
        ]);
        let (v, _, _) = eval(prog);
        assert_eq!(v, Value::int(7));
    }

    #[test]
    fn user_method_missing_receives_selector() {
        let prog = seq(vec![
            class(
                "Ghost",
                None,
                Some(def(
                    "method_missing",
                    params().req("name").rest("args"),
                    Some(lvar("name")),
                )),
            ),
            call(call(const_("Ghost"), "new", vec![]), "boo", vec![int(1)]),
        ]);
        let (v, _, core) = eval(prog);
        assert_eq!(v, core.symbol_value("boo"));
    }

    #[test]
    fn module_case_equality_tests_ancestry() {
        let (v, _, _) = eval(call(const_("Comparable"), "===", vec![int(3)]));
        assert_eq!(v, Value::TRUE);
    }
}
