//! Integer and Float.
//!
//! Integers are fixnums while they fit and boxed `i128` values past that;
//! results outside `i128` raise. Mixed operations promote to Float.

use std::cmp::Ordering;

use super::kernel::comparison_failed;
use super::{Ret, format_float, require_block};
use crate::runtime::{Core, Unwind};
use crate::value::Value;
use crate::vm::Interp;

/// Division rounding toward negative infinity. `b` must be non-zero.
pub(crate) fn floor_div(a: i128, b: i128) -> i128 {
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) { q - 1 } else { q }
}

/// Remainder with the sign of the divisor. `b` must be non-zero.
pub(crate) fn floor_mod(a: i128, b: i128) -> i128 {
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
}

fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i128),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(f) => f,
        }
    }
}

fn num(core: &Core, v: Value) -> Option<Num> {
    if let Some(n) = core.int_of(v) {
        return Some(Num::Int(n));
    }
    core.heap.float(v).map(Num::Float)
}

fn operand(interp: &mut Interp, recv: Value, v: Value) -> Result<Num, Unwind> {
    if let Some(n) = num(&interp.core, v) {
        return Ok(n);
    }
    let core = interp.core.clone();
    let theirs = match v {
        Value::NIL => "nil".to_string(),
        Value::TRUE => "true".to_string(),
        Value::FALSE => "false".to_string(),
        v => core.class_name(core.visible_class(v)),
    };
    let ours = core.class_name(core.class_of(recv));
    Err(interp.raise(core.c.type_error, &format!("{theirs} can't be coerced into {ours}")))
}

fn receiver(interp: &Interp, recv: Value) -> Num {
    num(&interp.core, recv).unwrap_or(Num::Int(0))
}

fn overflow(interp: &mut Interp) -> Unwind {
    interp.raise(interp.core.c.runtime_error, "integer overflow")
}

fn int_result(interp: &mut Interp, n: Option<i128>) -> Ret {
    match n {
        Some(n) => Ok(interp.core.int_value(n)),
        None => Err(overflow(interp)),
    }
}

fn float_value(interp: &Interp, f: f64) -> Value {
    interp.core.new_float(f)
}

pub(crate) fn install(core: &Core) {
    for class in [core.c.integer, core.c.float] {
        core.define_foreign(class, "+", 1, 1, add);
        core.define_foreign(class, "-", 1, 1, sub);
        core.define_foreign(class, "*", 1, 1, mul);
        core.define_foreign(class, "/", 1, 1, div);
        core.define_foreign(class, "%", 1, 1, modulo);
        core.define_foreign(class, "modulo", 1, 1, modulo);
        core.define_foreign(class, "**", 1, 1, pow);
        core.define_foreign(class, "-@", 0, 0, negate);
        core.define_foreign(class, "+@", 0, 0, identity);
        core.define_foreign(class, "==", 1, 1, eq);
        core.define_foreign(class, "===", 1, 1, eq);
        core.define_foreign(class, "!=", 1, 1, ne);
        core.define_foreign(class, "<", 1, 1, lt);
        core.define_foreign(class, "<=", 1, 1, le);
        core.define_foreign(class, ">", 1, 1, gt);
        core.define_foreign(class, ">=", 1, 1, ge);
        core.define_foreign(class, "<=>", 1, 1, spaceship);
        core.define_foreign(class, "to_s", 0, 1, to_s);
        core.define_foreign(class, "inspect", 0, 0, to_s);
        core.define_foreign(class, "to_i", 0, 0, to_i);
        core.define_foreign(class, "to_int", 0, 0, to_i);
        core.define_foreign(class, "to_f", 0, 0, to_f);
        core.define_foreign(class, "abs", 0, 0, abs);
        core.define_foreign(class, "zero?", 0, 0, is_zero);
        core.define_foreign(class, "positive?", 0, 0, is_positive);
        core.define_foreign(class, "negative?", 0, 0, is_negative);
        core.define_foreign(class, "hash", 0, 0, hash);
        core.define_foreign(class, "coerce", 1, 1, coerce);
    }

    let i = core.c.integer;
    core.define_foreign(i, "times", 0, 0, times);
    core.define_foreign(i, "upto", 1, 1, upto);
    core.define_foreign(i, "downto", 1, 1, downto);
    core.define_foreign(i, "even?", 0, 0, is_even);
    core.define_foreign(i, "odd?", 0, 0, is_odd);
    core.define_foreign(i, "succ", 0, 0, succ);
    core.define_foreign(i, "next", 0, 0, succ);
    core.define_foreign(i, "pred", 0, 0, pred);
    core.define_foreign(i, "<<", 1, 1, shl);
    core.define_foreign(i, ">>", 1, 1, shr);
    core.define_foreign(i, "&", 1, 1, bit_and);
    core.define_foreign(i, "|", 1, 1, bit_or);
    core.define_foreign(i, "^", 1, 1, bit_xor);
    core.define_foreign(i, "div", 1, 1, div);
    core.define_foreign(i, "chr", 0, 0, chr);
    core.define_foreign(i, "floor", 0, 0, identity);
    core.define_foreign(i, "ceil", 0, 0, identity);
    core.define_foreign(i, "round", 0, 0, identity);

    let f = core.c.float;
    core.define_foreign(f, "floor", 0, 0, floor);
    core.define_foreign(f, "ceil", 0, 0, ceil);
    core.define_foreign(f, "round", 0, 0, round);
    core.define_foreign(f, "nan?", 0, 0, is_nan);
    core.define_foreign(f, "infinite?", 0, 0, is_infinite);
}

// ── Arithmetic ───────────────────────────────────────────────────────

fn add(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    match (receiver(interp, recv), operand(interp, recv, args[0])?) {
        (Num::Int(a), Num::Int(b)) => int_result(interp, a.checked_add(b)),
        (a, b) => Ok(float_value(interp, a.as_f64() + b.as_f64())),
    }
}

fn sub(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    match (receiver(interp, recv), operand(interp, recv, args[0])?) {
        (Num::Int(a), Num::Int(b)) => int_result(interp, a.checked_sub(b)),
        (a, b) => Ok(float_value(interp, a.as_f64() - b.as_f64())),
    }
}

fn mul(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    match (receiver(interp, recv), operand(interp, recv, args[0])?) {
        (Num::Int(a), Num::Int(b)) => int_result(interp, a.checked_mul(b)),
        (a, b) => Ok(float_value(interp, a.as_f64() * b.as_f64())),
    }
}

fn div(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    match (receiver(interp, recv), operand(interp, recv, args[0])?) {
        (Num::Int(_), Num::Int(0)) => Err(interp.raise(interp.core.c.zero_division_error, "divided by 0")),
        (Num::Int(a), Num::Int(b)) => int_result(interp, a.checked_div(b).map(|_| floor_div(a, b))),
        (a, b) => Ok(float_value(interp, a.as_f64() / b.as_f64())),
    }
}

fn modulo(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    match (receiver(interp, recv), operand(interp, recv, args[0])?) {
        (Num::Int(_), Num::Int(0)) => Err(interp.raise(interp.core.c.zero_division_error, "divided by 0")),
        (Num::Int(a), Num::Int(b)) => int_result(interp, a.checked_rem(b).map(|_| floor_mod(a, b))),
        (a, b) => Ok(float_value(interp, float_mod(a.as_f64(), b.as_f64()))),
    }
}

fn pow(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    match (receiver(interp, recv), operand(interp, recv, args[0])?) {
        (Num::Int(a), Num::Int(b)) if b >= 0 => {
            let r = u32::try_from(b).ok().and_then(|b| a.checked_pow(b));
            int_result(interp, r)
        }
        (a, b) => Ok(float_value(interp, a.as_f64().powf(b.as_f64()))),
    }
}

fn negate(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    match receiver(interp, recv) {
        Num::Int(a) => int_result(interp, a.checked_neg()),
        Num::Float(f) => Ok(float_value(interp, -f)),
    }
}

fn identity(_: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(recv)
}

fn abs(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    match receiver(interp, recv) {
        Num::Int(a) => int_result(interp, a.checked_abs()),
        Num::Float(f) => Ok(float_value(interp, f.abs())),
    }
}

// ── Comparison ───────────────────────────────────────────────────────

fn order(a: Num, b: Num) -> Option<Ordering> {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
        (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
    }
}

fn compare(interp: &mut Interp, recv: Value, other: Value) -> Result<Option<Ordering>, Unwind> {
    let Some(b) = num(&interp.core, other) else {
        return Err(comparison_failed(interp, recv, other));
    };
    Ok(order(receiver(interp, recv), b))
}

fn eq(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let equal = num(&interp.core, args[0]).is_some_and(|b| order(receiver(interp, recv), b) == Some(Ordering::Equal));
    Ok(Value::bool(equal))
}

fn ne(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    Ok(Value::bool(!eq(interp, recv, args, block)?.is_truthy()))
}

fn lt(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_some_and(Ordering::is_lt)))
}

fn le(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_some_and(Ordering::is_le)))
}

fn gt(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_some_and(Ordering::is_gt)))
}

fn ge(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(compare(interp, recv, args[0])?.is_some_and(Ordering::is_ge)))
}

fn spaceship(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let result = num(&interp.core, args[0]).and_then(|b| order(receiver(interp, recv), b));
    Ok(match result {
        Some(Ordering::Less) => Value::int(-1),
        Some(Ordering::Equal) => Value::int(0),
        Some(Ordering::Greater) => Value::int(1),
        None => Value::NIL,
    })
}

fn is_zero(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(receiver(interp, recv).as_f64() == 0.0))
}

fn is_positive(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(receiver(interp, recv).as_f64() > 0.0))
}

fn is_negative(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(receiver(interp, recv).as_f64() < 0.0))
}

fn hash(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let bits = match receiver(interp, recv) {
        Num::Int(n) => n as i64,
        Num::Float(f) => f.to_bits() as i64,
    };
    Ok(interp.core.int_value((bits >> 2) as i128))
}

fn coerce(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let theirs = operand(interp, recv, args[0])?;
    let pair = match (receiver(interp, recv), theirs) {
        (Num::Int(_), Num::Int(_)) => vec![args[0], recv],
        (a, b) => vec![float_value(interp, b.as_f64()), float_value(interp, a.as_f64())],
    };
    Ok(interp.core.new_array(pair))
}

// ── Conversion ───────────────────────────────────────────────────────

/// `n.to_s(base)` for bases 2 to 36.
pub(crate) fn int_to_string(mut n: i128, base: u32) -> String {
    if n == 0 {
        return "0".into();
    }
    let negative = n < 0;
    let mut digits = Vec::new();
    while n != 0 {
        let d = (n % base as i128).unsigned_abs() as u32;
        digits.push(std::char::from_digit(d, base).unwrap_or('?'));
        n /= base as i128;
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

fn to_s(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let text = match receiver(interp, recv) {
        Num::Int(n) => {
            let base = match args.first() {
                None => 10,
                Some(b) => match b.as_fixnum() {
                    Some(b @ 2..=36) => b as u32,
                    _ => return Err(interp.raise(interp.core.c.argument_error, "invalid radix")),
                },
            };
            int_to_string(n, base)
        }
        Num::Float(f) => format_float(f),
    };
    Ok(interp.core.new_string(text))
}

fn float_to_int(interp: &mut Interp, f: f64) -> Ret {
    if f.is_nan() || f.is_infinite() || f.abs() >= i128::MAX as f64 {
        let text = format_float(f);
        return Err(interp.raise(interp.core.c.runtime_error, &text));
    }
    Ok(interp.core.int_value(f as i128))
}

fn to_i(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    match receiver(interp, recv) {
        Num::Int(_) => Ok(recv),
        Num::Float(f) => float_to_int(interp, f.trunc()),
    }
}

fn to_f(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    match receiver(interp, recv) {
        Num::Int(n) => Ok(float_value(interp, n as f64)),
        Num::Float(_) => Ok(recv),
    }
}

fn floor(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let f = receiver(interp, recv).as_f64();
    float_to_int(interp, f.floor())
}

fn ceil(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let f = receiver(interp, recv).as_f64();
    float_to_int(interp, f.ceil())
}

fn round(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let f = receiver(interp, recv).as_f64();
    float_to_int(interp, f.round())
}

fn is_nan(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(receiver(interp, recv).as_f64().is_nan()))
}

/// `1`, `-1` or nil, like Ruby.
fn is_infinite(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let f = receiver(interp, recv).as_f64();
    Ok(match (f.is_infinite(), f > 0.0) {
        (false, _) => Value::NIL,
        (true, true) => Value::int(1),
        (true, false) => Value::int(-1),
    })
}

fn chr(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let Num::Int(n) = receiver(interp, recv) else { return Ok(Value::NIL) };
    match u32::try_from(n).ok().and_then(char::from_u32) {
        Some(c) => Ok(interp.core.new_string(c.to_string())),
        None => {
            let msg = format!("{n} out of char range");
            Err(interp.raise(interp.core.c.argument_error, &msg))
        }
    }
}

// ── Integer ──────────────────────────────────────────────────────────

fn int_arg(interp: &mut Interp, recv: Value, v: Value) -> Result<i128, Unwind> {
    match operand(interp, recv, v)? {
        Num::Int(n) => Ok(n),
        Num::Float(f) => Ok(f as i128),
    }
}

fn recv_int(interp: &Interp, recv: Value) -> i128 {
    interp.core.int_of(recv).unwrap_or(0)
}

fn times(interp: &mut Interp, recv: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    let n = recv_int(interp, recv);
    let mut i = 0;
    while i < n {
        let v = interp.core.int_value(i);
        interp.call_block(block, &[v])?;
        i += 1;
    }
    Ok(recv)
}

fn upto(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    let limit = int_arg(interp, recv, args[0])?;
    let mut i = recv_int(interp, recv);
    while i <= limit {
        let v = interp.core.int_value(i);
        interp.call_block(block, &[v])?;
        i += 1;
    }
    Ok(recv)
}

fn downto(interp: &mut Interp, recv: Value, args: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    let limit = int_arg(interp, recv, args[0])?;
    let mut i = recv_int(interp, recv);
    while i >= limit {
        let v = interp.core.int_value(i);
        interp.call_block(block, &[v])?;
        i -= 1;
    }
    Ok(recv)
}

fn is_even(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(recv_int(interp, recv) % 2 == 0))
}

fn is_odd(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(recv_int(interp, recv) % 2 != 0))
}

fn succ(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let n = recv_int(interp, recv).checked_add(1);
    int_result(interp, n)
}

fn pred(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let n = recv_int(interp, recv).checked_sub(1);
    int_result(interp, n)
}

fn shift(interp: &mut Interp, n: i128, by: i128) -> Ret {
    let r = if by >= 0 {
        u32::try_from(by).ok().and_then(|s| n.checked_shl(s)).filter(|r| r >> by == n)
    } else {
        let s = u32::try_from(-by).unwrap_or(127).min(127);
        Some(n >> s)
    };
    int_result(interp, r)
}

fn shl(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let by = int_arg(interp, recv, args[0])?;
    shift(interp, recv_int(interp, recv), by)
}

fn shr(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let by = int_arg(interp, recv, args[0])?;
    shift(interp, recv_int(interp, recv), -by)
}

fn bit_and(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let b = int_arg(interp, recv, args[0])?;
    Ok(interp.core.int_value(recv_int(interp, recv) & b))
}

fn bit_or(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let b = int_arg(interp, recv, args[0])?;
    Ok(interp.core.int_value(recv_int(interp, recv) | b))
}

fn bit_xor(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let b = int_arg(interp, recv, args[0])?;
    Ok(interp.core.int_value(recv_int(interp, recv) ^ b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::runtime::Capture;

    fn eval(root: crate::ast::Node) -> (crate::error::Result<Value>, std::sync::Arc<Core>) {
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        (core.run(&Program::new("n.rb", root)), core)
    }

    #[test]
    fn floor_division_and_modulo_follow_the_divisor() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_mod(-7, 2), 1);
        assert_eq!(floor_mod(7, -2), -1);
        assert_eq!(float_mod(-7.0, 2.0), 1.0);
    }

    #[test]
    fn radix_formatting() {
        assert_eq!(int_to_string(255, 16), "ff");
        assert_eq!(int_to_string(-5, 2), "-101");
        assert_eq!(int_to_string(0, 8), "0");
    }

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        let (v, core) = eval(call(int(1), "+", vec![float(0.5)]));
        assert_eq!(core.heap.float(v.unwrap()), Some(1.5));
    }

    #[test]
    fn division_by_zero_raises() {
        let (r, _) = eval(call(int(1), "/", vec![int(0)]));
        let Err(Error::Uncaught { class, message, .. }) = r else { panic!("expected raise") };
        assert_eq!((class.as_str(), message.as_str()), ("ZeroDivisionError", "divided by 0"));
    }

    #[test]
    fn string_operand_cannot_be_coerced() {
        let (r, _) = eval(call(int(1), "+", vec![str_("a")]));
        let Err(Error::Uncaught { class, message, .. }) = r else { panic!("expected raise") };
        assert_eq!((class.as_str(), message.as_str()), ("TypeError", "String can't be coerced into Integer"));
    }

    #[test]
    fn comparison_with_string_fails() {
        let (r, _) = eval(call(int(1), "<", vec![str_("a")]));
        let Err(Error::Uncaught { message, .. }) = r else { panic!("expected raise") };
        assert_eq!(message, "comparison of Integer with String failed");
    }

    #[test]
    fn power_past_fixnum_range_boxes() {
        let (v, core) = eval(call(int(2), "**", vec![int(70)]));
        assert_eq!(core.int_of(v.unwrap()), Some(1i128 << 70));
    }

    #[test]
    fn times_yields_each_index() {
        let prog = seq(vec![
            lasgn("acc", int(0)),
            with_block(
                call(int(4), "times", vec![]),
                params().req("i"),
                Some(lasgn("acc", call(lvar("acc"), "+", vec![lvar("i")]))),
            ),
            lvar("acc"),
        ]);
        let (v, _) = eval(prog);
        assert_eq!(v.unwrap(), Value::int(6));
    }
}
