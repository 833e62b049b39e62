//! Array.
//!
//! Element vectors are snapshotted before calling back into Ruby, so a block
//! may mutate the array it is iterating without holding its lock.

use std::cmp::Ordering;

use super::kernel::comparison_failed;
use super::{Ret, inspect, require_block, to_s};
use crate::runtime::heap::{Data, Object};
use crate::runtime::{Core, Unwind};
use crate::value::Value;
use crate::vm::Interp;

pub(crate) fn install(core: &Core) {
    let meta = core.metaclass(core.c.array);
    core.define_foreign(meta, "new", 0, 2, array_new);

    let a = core.c.array;
    core.define_foreign(a, "[]", 1, 2, aref);
    core.define_foreign(a, "[]=", 2, 2, aset);
    core.define_foreign(a, "<<", 1, 1, push);
    core.define_foreign(a, "push", 0, -1, push);
    core.define_foreign(a, "append", 0, -1, push);
    core.define_foreign(a, "pop", 0, 0, pop);
    core.define_foreign(a, "shift", 0, 0, shift);
    core.define_foreign(a, "unshift", 0, -1, unshift);
    core.define_foreign(a, "size", 0, 0, size);
    core.define_foreign(a, "length", 0, 0, size);
    core.define_foreign(a, "first", 0, 0, first);
    core.define_foreign(a, "last", 0, 0, last);
    core.define_foreign(a, "empty?", 0, 0, is_empty);
    core.define_foreign(a, "each", 0, 0, each);
    core.define_foreign(a, "each_with_index", 0, 0, each_with_index);
    core.define_foreign(a, "map", 0, 0, map);
    core.define_foreign(a, "collect", 0, 0, map);
    core.define_foreign(a, "select", 0, 0, select);
    core.define_foreign(a, "filter", 0, 0, select);
    core.define_foreign(a, "reject", 0, 0, reject);
    core.define_foreign(a, "reduce", 0, 1, reduce);
    core.define_foreign(a, "inject", 0, 1, reduce);
    core.define_foreign(a, "include?", 1, 1, includes);
    core.define_foreign(a, "index", 1, 1, index);
    core.define_foreign(a, "join", 0, 1, join);
    core.define_foreign(a, "+", 1, 1, concat);
    core.define_foreign(a, "==", 1, 1, eq);
    core.define_foreign(a, "inspect", 0, 0, array_inspect);
    core.define_foreign(a, "to_s", 0, 0, array_inspect);
    core.define_foreign(a, "to_a", 0, 0, identity);
    core.define_foreign(a, "reverse", 0, 0, reverse);
    core.define_foreign(a, "sort", 0, 0, sort);
    core.define_foreign(a, "min", 0, 0, min);
    core.define_foreign(a, "max", 0, 0, max);
    core.define_foreign(a, "sum", 0, 0, sum);
    core.define_foreign(a, "dup", 0, 0, dup);
    core.define_foreign(a, "compact", 0, 0, compact);
    core.define_foreign(a, "count", 0, 1, count);
    core.define_foreign(a, "any?", 0, 0, any);
    core.define_foreign(a, "all?", 0, 0, all);
    core.define_foreign(a, "flatten", 0, 0, flatten);
    core.define_foreign(a, "uniq", 0, 0, uniq);
}

fn elements(interp: &Interp, v: Value) -> Vec<Value> {
    interp.core.heap.array(v).unwrap_or_default()
}

fn int_arg(interp: &mut Interp, v: Value) -> Result<i64, Unwind> {
    match v.as_fixnum() {
        Some(n) => Ok(n),
        None => {
            let core = interp.core.clone();
            let theirs = core.class_name(core.visible_class(v));
            Err(interp.raise(core.c.type_error, &format!("no implicit conversion of {theirs} into Integer")))
        }
    }
}

/// Ruby `==` between two values, short-circuiting on identity.
fn equal(interp: &mut Interp, a: Value, b: Value) -> Result<bool, Unwind> {
    if a == b {
        return Ok(true);
    }
    let eq = interp.core.s.eq;
    Ok(interp.call(a, eq, &[b], None, false)?.is_truthy())
}

fn array_new(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    let class = recv.as_class().unwrap_or(interp.core.c.array);
    let n = match args.first() {
        Some(&v) => int_arg(interp, v)?,
        None => 0,
    };
    if n < 0 {
        return Err(interp.raise(interp.core.c.argument_error, "negative array size"));
    }
    let fill = args.get(1).copied().unwrap_or(Value::NIL);
    let mut out = Vec::with_capacity(n as usize);
    for i in 0..n {
        out.push(match block {
            Some(b) => interp.call_block(b, &[Value::fixnum(i).unwrap_or(Value::NIL)])?,
            None => fill,
        });
    }
    Ok(interp.core.heap.alloc(Object::new(class, Data::Array(parking_lot::Mutex::new(out)))))
}

fn aref(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let a = elements(interp, recv);
    let len = a.len() as i64;
    let i = int_arg(interp, args[0])?;
    let start = if i < 0 { len + i } else { i };
    match args.get(1) {
        None => Ok(usize::try_from(start).ok().and_then(|i| a.get(i).copied()).unwrap_or(Value::NIL)),
        Some(&count) => {
            let count = int_arg(interp, count)?;
            if start < 0 || start > len || count < 0 {
                return Ok(Value::NIL);
            }
            let end = (start + count).min(len);
            Ok(interp.core.new_array(a[start as usize..end as usize].to_vec()))
        }
    }
}

fn aset(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let i = int_arg(interp, args[0])?;
    let value = args[1];
    let stored = interp.core.heap.with_array(recv, |a| {
        let i = if i < 0 { a.len() as i64 + i } else { i };
        let i = usize::try_from(i).ok()?;
        if i >= a.len() {
            a.resize(i + 1, Value::NIL);
        }
        a[i] = value;
        Some(())
    });
    match stored.flatten() {
        Some(()) => Ok(value),
        None => {
            let msg = format!("index {i} too small for array");
            Err(interp.raise(interp.core.c.index_error, &msg))
        }
    }
}

fn push(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    interp.core.heap.with_array(recv, |a| a.extend_from_slice(args));
    Ok(recv)
}

fn pop(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.heap.with_array(recv, |a| a.pop()).flatten().unwrap_or(Value::NIL))
}

fn shift(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let v = interp.core.heap.with_array(recv, |a| if a.is_empty() { None } else { Some(a.remove(0)) });
    Ok(v.flatten().unwrap_or(Value::NIL))
}

fn unshift(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    interp.core.heap.with_array(recv, |a| {
        a.splice(0..0, args.iter().copied());
    });
    Ok(recv)
}

fn size(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let n = elements(interp, recv).len();
    Ok(interp.core.int_value(n as i128))
}

fn first(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(elements(interp, recv).first().copied().unwrap_or(Value::NIL))
}

fn last(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(elements(interp, recv).last().copied().unwrap_or(Value::NIL))
}

fn is_empty(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(elements(interp, recv).is_empty()))
}

// ── Iteration ────────────────────────────────────────────────────────

fn each(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    let mut i = 0;
    // Re-read per step: the block may grow or shrink the array.
    while let Some(v) = interp.core.heap.with_array(recv, |a| a.get(i).copied()).flatten() {
        interp.call_block(block, &[v])?;
        i += 1;
    }
    Ok(recv)
}

fn each_with_index(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    for (i, v) in elements(interp, recv).into_iter().enumerate() {
        let index = interp.core.int_value(i as i128);
        interp.call_block(block, &[v, index])?;
    }
    Ok(recv)
}

fn map(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    let mut out = Vec::new();
    for v in elements(interp, recv) {
        out.push(interp.call_block(block, &[v])?);
    }
    Ok(interp.core.new_array(out))
}

fn filter(interp: &mut Interp, recv: Value, block: Option<Value>, keep: bool) -> Ret {
    let block = require_block(interp, block)?;
    let mut out = Vec::new();
    for v in elements(interp, recv) {
        if interp.call_block(block, &[v])?.is_truthy() == keep {
            out.push(v);
        }
    }
    Ok(interp.core.new_array(out))
}

fn select(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    filter(interp, recv, block, true)
}

fn reject(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    filter(interp, recv, block, false)
}

/// `reduce(init) { }`, `reduce { }` and `reduce(:sym)`.
fn reduce(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    let mut items = elements(interp, recv).into_iter();
    let (mut acc, op) = match (args.first(), block) {
        (Some(&sym), None) if sym.as_symbol().is_some() => (items.next().unwrap_or(Value::NIL), sym.as_symbol()),
        (Some(&init), _) => (init, None),
        (None, _) => (items.next().unwrap_or(Value::NIL), None),
    };
    for v in items {
        acc = match op {
            Some(sel) => interp.call(acc, sel, &[v], None, false)?,
            None => {
                let block = require_block(interp, block)?;
                interp.call_block(block, &[acc, v])?
            }
        };
    }
    Ok(acc)
}

fn includes(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    for v in elements(interp, recv) {
        if equal(interp, v, args[0])? {
            return Ok(Value::TRUE);
        }
    }
    Ok(Value::FALSE)
}

fn index(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    for (i, v) in elements(interp, recv).into_iter().enumerate() {
        if equal(interp, v, args[0])? {
            return Ok(interp.core.int_value(i as i128));
        }
    }
    Ok(Value::NIL)
}

fn join(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let sep = match args.first() {
        Some(&s) if !s.is_nil() => to_s(interp, s)?,
        _ => String::new(),
    };
    let mut parts = Vec::new();
    for v in elements(interp, recv) {
        if interp.core.heap.is_array(v) {
            let inner = join(interp, v, args, None)?;
            parts.push(interp.core.heap.string(inner).unwrap_or_default());
        } else {
            parts.push(to_s(interp, v)?);
        }
    }
    Ok(interp.core.new_string(parts.join(&sep)))
}

fn concat(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let Some(other) = interp.core.heap.array(args[0]) else {
        let core = interp.core.clone();
        let theirs = core.class_name(core.visible_class(args[0]));
        return Err(interp.raise(core.c.type_error, &format!("no implicit conversion of {theirs} into Array")));
    };
    let mut out = elements(interp, recv);
    out.extend(other);
    Ok(interp.core.new_array(out))
}

fn eq(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let Some(other) = interp.core.heap.array(args[0]) else { return Ok(Value::FALSE) };
    let mine = elements(interp, recv);
    if mine.len() != other.len() {
        return Ok(Value::FALSE);
    }
    for (a, b) in mine.into_iter().zip(other) {
        if !equal(interp, a, b)? {
            return Ok(Value::FALSE);
        }
    }
    Ok(Value::TRUE)
}

fn array_inspect(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let mut parts = Vec::new();
    for v in elements(interp, recv) {
        parts.push(if v == recv { "[...]".to_string() } else { inspect(interp, v)? });
    }
    Ok(interp.core.new_string(format!("[{}]", parts.join(", "))))
}

fn identity(_: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(recv)
}

fn reverse(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let mut out = elements(interp, recv);
    out.reverse();
    Ok(interp.core.new_array(out))
}

/// `a <=> b` through dispatch; nil means the pair is not comparable.
fn compare(interp: &mut Interp, a: Value, b: Value) -> Result<Ordering, Unwind> {
    if let (Some(x), Some(y)) = (a.as_fixnum(), b.as_fixnum()) {
        return Ok(x.cmp(&y));
    }
    let spaceship = interp.core.symbols.intern("<=>");
    match interp.call(a, spaceship, &[b], None, false)?.as_fixnum() {
        Some(n) => Ok(n.cmp(&0)),
        None => Err(comparison_failed(interp, a, b)),
    }
}

/// Merge sort that can fail part way through a comparison.
fn sort_values(interp: &mut Interp, items: Vec<Value>) -> Result<Vec<Value>, Unwind> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let mut left = items;
    let right = left.split_off(left.len() / 2);
    let left = sort_values(interp, left)?;
    let right = sort_values(interp, right)?;
    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut l, mut r) = (left.into_iter().peekable(), right.into_iter().peekable());
    while let (Some(&a), Some(&b)) = (l.peek(), r.peek()) {
        if compare(interp, a, b)? == Ordering::Greater {
            out.push(b);
            r.next();
        } else {
            out.push(a);
            l.next();
        }
    }
    out.extend(l);
    out.extend(r);
    Ok(out)
}

fn sort(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let items = elements(interp, recv);
    let sorted = sort_values(interp, items)?;
    Ok(interp.core.new_array(sorted))
}

fn extreme(interp: &mut Interp, recv: Value, want: Ordering) -> Ret {
    let mut best: Option<Value> = None;
    for v in elements(interp, recv) {
        best = match best {
            Some(b) if compare(interp, v, b)? != want => Some(b),
            _ => Some(v),
        };
    }
    Ok(best.unwrap_or(Value::NIL))
}

fn min(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    extreme(interp, recv, Ordering::Less)
}

fn max(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    extreme(interp, recv, Ordering::Greater)
}

fn sum(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let plus = interp.core.symbols.intern("+");
    let mut acc = Value::int(0);
    for v in elements(interp, recv) {
        acc = interp.call(acc, plus, &[v], None, false)?;
    }
    Ok(acc)
}

fn dup(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let items = elements(interp, recv);
    Ok(interp.core.new_array(items))
}

fn compact(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let items = elements(interp, recv).into_iter().filter(|v| !v.is_nil()).collect();
    Ok(interp.core.new_array(items))
}

fn count(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    let mut n = 0;
    for v in elements(interp, recv) {
        let hit = match (args.first(), block) {
            (Some(&x), _) => equal(interp, v, x)?,
            (None, Some(b)) => interp.call_block(b, &[v])?.is_truthy(),
            (None, None) => true,
        };
        n += hit as i128;
    }
    Ok(interp.core.int_value(n))
}

fn any(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    for v in elements(interp, recv) {
        let hit = match block {
            Some(b) => interp.call_block(b, &[v])?.is_truthy(),
            None => v.is_truthy(),
        };
        if hit {
            return Ok(Value::TRUE);
        }
    }
    Ok(Value::FALSE)
}

fn all(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    for v in elements(interp, recv) {
        let hit = match block {
            Some(b) => interp.call_block(b, &[v])?.is_truthy(),
            None => v.is_truthy(),
        };
        if !hit {
            return Ok(Value::FALSE);
        }
    }
    Ok(Value::TRUE)
}

fn flatten_into(core: &Core, v: Value, out: &mut Vec<Value>, depth: usize) {
    match core.heap.array(v) {
        Some(items) if depth < 64 => {
            for item in items {
                flatten_into(core, item, out, depth + 1);
            }
        }
        _ => out.push(v),
    }
}

fn flatten(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let mut out = Vec::new();
    for v in elements(interp, recv) {
        flatten_into(&interp.core, v, &mut out, 0);
    }
    Ok(interp.core.new_array(out))
}

fn uniq(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let mut out: Vec<Value> = Vec::new();
    for v in elements(interp, recv) {
        let mut seen = false;
        for &u in &out {
            if equal(interp, u, v)? {
                seen = true;
                break;
            }
        }
        if !seen {
            out.push(v);
        }
    }
    Ok(interp.core.new_array(out))
}

#[cfg(test)]
mod tests {
    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::runtime::{Capture, Core};
    use crate::value::Value;

    fn eval_out(root: crate::ast::Node) -> String {
        let out = Capture::new();
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(out.clone()));
        core.run(&Program::new("a.rb", root)).unwrap();
        out.contents()
    }

    fn nums(ns: &[i64]) -> crate::ast::Node {
        array(ns.iter().map(|&n| int(n)).collect())
    }

    #[test]
    fn map_select_and_inspect() {
        let doubled = with_block(call(nums(&[1, 2, 3]), "map", vec![]), params().req("x"), Some(call(lvar("x"), "*", vec![int(2)])));
        let odd = with_block(call(doubled, "select", vec![]), params().req("x"), Some(call(lvar("x"), ">", vec![int(2)])));
        assert_eq!(eval_out(fcall("p", vec![odd])), "[4, 6]\n");
    }

    #[test]
    fn reduce_with_symbol_and_block() {
        let by_sym = call(nums(&[1, 2, 3, 4]), "reduce", vec![sym("+")]);
        let by_block = with_block(
            call(nums(&[1, 2, 3]), "inject", vec![int(10)]),
            params().req("acc").req("x"),
            Some(call(lvar("acc"), "+", vec![lvar("x")])),
        );
        assert_eq!(eval_out(seq(vec![fcall("p", vec![by_sym]), fcall("p", vec![by_block])])), "10\n16\n");
    }

    #[test]
    fn sort_orders_mixed_numbers_and_rejects_strings() {
        assert_eq!(eval_out(fcall("p", vec![call(array(vec![int(3), float(1.5), int(2)]), "sort", vec![])])), "[1.5, 2, 3]\n");
        let out = Capture::new();
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(out));
        let r = core.run(&Program::new("a.rb", call(array(vec![int(1), str_("a")]), "sort", vec![])));
        let Err(crate::Error::Uncaught { message, .. }) = r else { panic!("expected raise") };
        assert_eq!(message, "comparison of Integer with String failed");
    }

    #[test]
    fn index_assignment_pads_with_nil() {
        let prog = seq(vec![
            lasgn("a", nums(&[1])),
            attr_asgn(lvar("a"), "[]=", vec![int(3), int(9)]),
            fcall("p", vec![lvar("a")]),
        ]);
        assert_eq!(eval_out(prog), "[1, nil, nil, 9]\n");
    }

    #[test]
    fn each_returns_receiver() {
        let prog = with_block(call(nums(&[1, 2]), "each", vec![]), params().req("x"), Some(fcall("print", vec![lvar("x")])));
        let out = Capture::new();
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(out.clone()));
        let v = core.run(&Program::new("a.rb", prog)).unwrap();
        assert_eq!(out.contents(), "12");
        assert_eq!(core.heap.array(v), Some(vec![Value::int(1), Value::int(2)]));
    }
}
