//! Foreign methods of the builtin classes.
//!
//! Just enough of a core library to exercise every dispatch path: each
//! method is a plain `fn` with the [`ForeignFn`](super::method::ForeignFn)
//! signature, registered on its class at boot.

pub mod array;
pub mod exception;
pub mod kernel;
pub mod numeric;
pub mod proc;
pub mod string;

use super::symbol::Symbol;
use super::{Core, Unwind};
use crate::value::Value;
use crate::vm::Interp;

pub(crate) type Ret = Result<Value, Unwind>;

pub(crate) fn install(core: &Core) {
    kernel::install(core);
    numeric::install(core);
    string::install(core);
    array::install(core);
    proc::install(core);
    exception::install(core);
    super::thread::install(core);
}

/// `v.to_s` as a Rust string.
pub fn to_s(interp: &mut Interp, v: Value) -> Result<String, Unwind> {
    if let Some(s) = interp.core.heap.string(v) {
        return Ok(s);
    }
    let sel = interp.core.s.to_s;
    let r = interp.call(v, sel, &[], None, false)?;
    Ok(interp.core.heap.string(r).unwrap_or_else(|| default_to_s(&interp.core, v)))
}

/// `v.inspect` as a Rust string.
pub fn inspect(interp: &mut Interp, v: Value) -> Result<String, Unwind> {
    let sel = interp.core.s.inspect;
    let r = interp.call(v, sel, &[], None, false)?;
    Ok(interp.core.heap.string(r).unwrap_or_else(|| default_to_s(&interp.core, v)))
}

/// `#<Foo>`
pub(crate) fn default_to_s(core: &Core, v: Value) -> String {
    format!("#<{}>", core.class_name(core.class_of(v)))
}

/// Message of an exception object, never failing.
pub fn exception_message(interp: &mut Interp, exc: Value) -> String {
    let core = interp.core.clone();
    let sel = core.symbols.intern("message");
    match interp.call(exc, sel, &[], None, false) {
        Ok(v) => core.heap.string(v).unwrap_or_else(|| core.class_name(core.class_of(exc))),
        Err(_) => {
            interp.thread.raised.pop();
            exception::stored_message(&core, exc)
        }
    }
}

/// Ruby's float formatting: `1.0`, `0.1`, `1.0e+20`, `Infinity`, `NaN`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{f:e}");
        let (mantissa, exp) = text.split_once('e').unwrap_or((&text, "0"));
        let mantissa = if mantissa.contains('.') { mantissa.to_string() } else { format!("{mantissa}.0") };
        let exp: i32 = exp.parse().unwrap_or(0);
        return format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs());
    }
    if f.fract() == 0.0 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Double-quoted, escaped form used by `String#inspect`.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{1b}' => out.push_str("\\e"),
            c if c.is_control() => out.push_str(&format!("\\x{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// A symbol or string argument naming a method or variable.
pub(crate) fn name_arg(interp: &mut Interp, v: Value) -> Result<Symbol, Unwind> {
    if let Some(sym) = v.as_symbol() {
        return Ok(sym);
    }
    if let Some(s) = interp.core.heap.string(v) {
        return Ok(interp.core.symbols.intern(&s));
    }
    let desc = inspect(interp, v)?;
    Err(interp.raise(interp.core.c.type_error, &format!("{desc} is not a symbol nor a string")))
}

pub(crate) fn require_block(interp: &mut Interp, block: Option<Value>) -> Result<Value, Unwind> {
    match block {
        Some(b) => Ok(b),
        None => Err(interp.raise(interp.core.c.local_jump_error, "no block given (yield)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_format_like_ruby() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(1e20), "1.0e+20");
        assert_eq!(format_float(1.5e-7), "1.5e-07");
        assert_eq!(format_float(f64::INFINITY), "Infinity");
        assert_eq!(format_float(f64::NAN), "NaN");
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote("a\"b\n"), "\"a\\\"b\\n\"");
    }
}
