//! String and Symbol.

use std::cmp::Ordering;

use super::{Ret, quote};
use crate::runtime::block::Proc;
use crate::runtime::heap::{Data, Object};
use crate::runtime::{Core, Unwind};
use crate::value::Value;
use crate::vm::Interp;

pub(crate) fn install(core: &Core) {
    let s = core.c.string;
    core.define_foreign(s, "+", 1, 1, plus);
    core.define_foreign(s, "*", 1, 1, times);
    core.define_foreign(s, "==", 1, 1, eq);
    core.define_foreign(s, "eql?", 1, 1, eq);
    core.define_foreign(s, "===", 1, 1, eq);
    core.define_foreign(s, "<=>", 1, 1, spaceship);
    core.define_foreign(s, "<<", 1, 1, append);
    core.define_foreign(s, "concat", 1, 1, append);
    core.define_foreign(s, "length", 0, 0, length);
    core.define_foreign(s, "size", 0, 0, length);
    core.define_foreign(s, "to_s", 0, 0, identity);
    core.define_foreign(s, "to_str", 0, 0, identity);
    core.define_foreign(s, "inspect", 0, 0, string_inspect);
    core.define_foreign(s, "to_sym", 0, 0, to_sym);
    core.define_foreign(s, "to_i", 0, 0, to_i);
    core.define_foreign(s, "to_f", 0, 0, to_f);
    core.define_foreign(s, "upcase", 0, 0, upcase);
    core.define_foreign(s, "downcase", 0, 0, downcase);
    core.define_foreign(s, "capitalize", 0, 0, capitalize);
    core.define_foreign(s, "reverse", 0, 0, reverse);
    core.define_foreign(s, "strip", 0, 0, strip);
    core.define_foreign(s, "include?", 1, 1, includes);
    core.define_foreign(s, "start_with?", 1, -1, starts_with);
    core.define_foreign(s, "end_with?", 1, -1, ends_with);
    core.define_foreign(s, "empty?", 0, 0, is_empty);
    core.define_foreign(s, "[]", 1, 2, index);
    core.define_foreign(s, "split", 0, 1, split);
    core.define_foreign(s, "chars", 0, 0, chars);
    core.define_foreign(s, "dup", 0, 0, dup);
    core.define_foreign(s, "hash", 0, 0, hash);
    core.define_foreign(s, "freeze", 0, 0, identity);

    let y = core.c.symbol;
    core.define_foreign(y, "to_s", 0, 0, sym_to_s);
    core.define_foreign(y, "id2name", 0, 0, sym_to_s);
    core.define_foreign(y, "to_sym", 0, 0, identity);
    core.define_foreign(y, "inspect", 0, 0, sym_inspect);
    core.define_foreign(y, "to_proc", 0, 0, sym_to_proc);
    core.define_foreign(y, "length", 0, 0, sym_length);
    core.define_foreign(y, "size", 0, 0, sym_length);
    core.define_foreign(y, "<=>", 1, 1, sym_spaceship);
}

fn text(interp: &Interp, v: Value) -> String {
    interp.core.heap.string(v).unwrap_or_default()
}

/// Argument that must already be a String.
fn string_arg(interp: &mut Interp, v: Value) -> Result<String, Unwind> {
    if let Some(s) = interp.core.heap.string(v) {
        return Ok(s);
    }
    let core = interp.core.clone();
    let theirs = match v {
        Value::NIL => "nil".to_string(),
        v => core.class_name(core.visible_class(v)),
    };
    Err(interp.raise(core.c.type_error, &format!("no implicit conversion of {theirs} into String")))
}

fn plus(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let other = string_arg(interp, args[0])?;
    let mut out = text(interp, recv);
    out.push_str(&other);
    Ok(interp.core.new_string(out))
}

fn times(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    match args[0].as_fixnum() {
        Some(n) if n >= 0 => Ok(interp.core.new_string(text(interp, recv).repeat(n as usize))),
        Some(_) => Err(interp.raise(interp.core.c.argument_error, "negative argument")),
        None => Err(interp.raise(interp.core.c.type_error, "no implicit conversion into Integer")),
    }
}

fn eq(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let equal = interp.core.heap.string(args[0]).is_some_and(|other| other == text(interp, recv));
    Ok(Value::bool(equal))
}

fn spaceship(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let Some(other) = interp.core.heap.string(args[0]) else { return Ok(Value::NIL) };
    Ok(ordering(text(interp, recv).cmp(&other)))
}

fn ordering(o: Ordering) -> Value {
    match o {
        Ordering::Less => Value::int(-1),
        Ordering::Equal => Value::int(0),
        Ordering::Greater => Value::int(1),
    }
}

/// `<<` mutates the receiver in place; integers append a codepoint.
fn append(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let extra = match args[0].as_fixnum().and_then(|n| u32::try_from(n).ok()).and_then(char::from_u32) {
        Some(c) => c.to_string(),
        None => string_arg(interp, args[0])?,
    };
    interp.core.heap.with_string(recv, |s| s.push_str(&extra));
    Ok(recv)
}

fn length(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let n = text(interp, recv).chars().count();
    Ok(interp.core.int_value(n as i128))
}

fn identity(_: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(recv)
}

fn string_inspect(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.new_string(quote(&text(interp, recv))))
}

fn to_sym(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.symbol_value(&text(interp, recv)))
}

/// Leading integer, ignoring surrounding junk like Ruby does.
fn leading_int(s: &str) -> i128 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits.find(|c: char| !c.is_ascii_digit() && c != '_').unwrap_or(digits.len());
    let cleaned: String = digits[..end].chars().filter(|&c| c != '_').collect();
    cleaned.parse::<i128>().map(|n| sign * n).unwrap_or(0)
}

fn to_i(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.int_value(leading_int(&text(interp, recv))))
}

fn to_f(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let s = text(interp, recv);
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || ((c == '-' || c == '+') && i == 0)))
        .map_or(s.len(), |(i, _)| i);
    let mut prefix = &s[..end];
    let value = loop {
        if let Ok(f) = prefix.parse::<f64>() {
            break f;
        }
        if prefix.is_empty() {
            break 0.0;
        }
        prefix = &prefix[..prefix.len() - 1];
    };
    Ok(interp.core.new_float(value))
}

fn upcase(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.new_string(text(interp, recv).to_uppercase()))
}

fn downcase(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.new_string(text(interp, recv).to_lowercase()))
}

fn capitalize(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let s = text(interp, recv);
    let mut chars = s.chars();
    let out = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    Ok(interp.core.new_string(out))
}

fn reverse(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.new_string(text(interp, recv).chars().rev().collect::<String>()))
}

fn strip(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.new_string(text(interp, recv).trim()))
}

fn includes(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let needle = string_arg(interp, args[0])?;
    Ok(Value::bool(text(interp, recv).contains(&needle)))
}

fn starts_with(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let s = text(interp, recv);
    for &a in args {
        if s.starts_with(&string_arg(interp, a)?) {
            return Ok(Value::TRUE);
        }
    }
    Ok(Value::FALSE)
}

fn ends_with(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let s = text(interp, recv);
    for &a in args {
        if s.ends_with(&string_arg(interp, a)?) {
            return Ok(Value::TRUE);
        }
    }
    Ok(Value::FALSE)
}

fn is_empty(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(text(interp, recv).is_empty()))
}

/// `s[i]`, `s[i, len]` and `s["sub"]`, by character.
fn index(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let chars: Vec<char> = text(interp, recv).chars().collect();
    if let Some(sub) = interp.core.heap.string(args[0]) {
        let s: String = chars.iter().collect();
        return Ok(if s.contains(&sub) { interp.core.new_string(sub) } else { Value::NIL });
    }
    let Some(i) = args[0].as_fixnum() else {
        return Err(interp.raise(interp.core.c.type_error, "no implicit conversion into Integer"));
    };
    let len = chars.len() as i64;
    let start = if i < 0 { len + i } else { i };
    match args.get(1).map(|v| v.as_fixnum()) {
        None => {
            if start < 0 || start >= len {
                return Ok(Value::NIL);
            }
            Ok(interp.core.new_string(chars[start as usize].to_string()))
        }
        Some(Some(count)) => {
            if start < 0 || start > len || count < 0 {
                return Ok(Value::NIL);
            }
            let end = (start + count).min(len);
            Ok(interp.core.new_string(chars[start as usize..end as usize].iter().collect::<String>()))
        }
        Some(None) => Err(interp.raise(interp.core.c.type_error, "no implicit conversion into Integer")),
    }
}

fn split(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let s = text(interp, recv);
    let parts: Vec<String> = match args.first() {
        None => s.split_whitespace().map(str::to_string).collect(),
        Some(&sep) => {
            let sep = string_arg(interp, sep)?;
            if sep == " " {
                s.split_whitespace().map(str::to_string).collect()
            } else if sep.is_empty() {
                s.chars().map(|c| c.to_string()).collect()
            } else {
                let mut parts: Vec<String> = s.split(sep.as_str()).map(str::to_string).collect();
                while parts.last().is_some_and(String::is_empty) {
                    parts.pop();
                }
                parts
            }
        }
    };
    let core = &interp.core;
    Ok(core.new_array(parts.into_iter().map(|p| core.new_string(p)).collect()))
}

fn chars(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = &interp.core;
    let s = core.heap.string(recv).unwrap_or_default();
    Ok(core.new_array(s.chars().map(|c| core.new_string(c.to_string())).collect()))
}

fn dup(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let class = interp.core.class_of(recv);
    let s = text(interp, recv);
    Ok(interp.core.heap.alloc(Object::new(class, Data::Str(parking_lot::Mutex::new(s)))))
}

/// FNV-1a, so equal strings hash equal.
fn hash(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let h = text(interp, recv).bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3));
    Ok(interp.core.int_value((h >> 2) as i128))
}

// ── Symbol ───────────────────────────────────────────────────────────

fn sym_name(interp: &Interp, recv: Value) -> String {
    recv.as_symbol().map(|s| interp.core.symbols.name(s).to_string()).unwrap_or_default()
}

fn sym_to_s(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(interp.core.new_string(sym_name(interp, recv)))
}

/// `:name`, quoted when the name is not a plain identifier or operator.
fn sym_inspect(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let name = sym_name(interp, recv);
    let plain = !name.is_empty()
        && ((name.chars().all(|c| c.is_alphanumeric() || "_?!=@$".contains(c))
            && !name.starts_with(|c: char| c.is_ascii_digit()))
            || ["+", "-", "*", "/", "%", "**", "==", "!=", "<", "<=", ">", ">=", "<=>", "<<", ">>", "[]", "[]=", "!", "===", "-@", "+@", "&", "|", "^"]
                .contains(&name.as_str()));
    let out = if plain { format!(":{name}") } else { format!(":{}", quote(&name)) };
    Ok(interp.core.new_string(out))
}

fn sym_to_proc(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let Some(sym) = recv.as_symbol() else { return Ok(Value::NIL) };
    let core = &interp.core;
    Ok(core.heap.alloc(Object::new(core.c.proc_, Data::Proc(Proc::Symbol(sym)))))
}

fn sym_length(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let n = sym_name(interp, recv).chars().count();
    Ok(interp.core.int_value(n as i128))
}

fn sym_spaceship(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    if args[0].as_symbol().is_none() {
        return Ok(Value::NIL);
    }
    Ok(ordering(sym_name(interp, recv).cmp(&sym_name(interp, args[0]))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::runtime::Capture;

    fn eval(root: crate::ast::Node) -> (Value, std::sync::Arc<Core>) {
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        let v = core.run(&Program::new("s.rb", root)).unwrap();
        (v, core)
    }

    #[test]
    fn leading_int_ignores_trailing_junk() {
        assert_eq!(leading_int("  42abc"), 42);
        assert_eq!(leading_int("-1_000"), -1000);
        assert_eq!(leading_int("x"), 0);
    }

    #[test]
    fn shovel_mutates_in_place() {
        let prog = seq(vec![
            lasgn("s", str_("ab")),
            call(lvar("s"), "<<", vec![str_("c")]),
            lvar("s"),
        ]);
        let (v, core) = eval(prog);
        assert_eq!(core.heap.string(v).as_deref(), Some("abc"));
    }

    #[test]
    fn split_drops_trailing_empty_fields() {
        let (v, core) = eval(call(str_("a,b,,"), "split", vec![str_(",")]));
        let parts: Vec<String> = core.heap.array(v).unwrap().into_iter().filter_map(|p| core.heap.string(p)).collect();
        assert_eq!(parts, ["a", "b"]);
    }

    #[test]
    fn symbol_inspect_quotes_odd_names() {
        let (v, core) = eval(call(sym("foo bar"), "inspect", vec![]));
        assert_eq!(core.heap.string(v).as_deref(), Some(":\"foo bar\""));
        let (v, core) = eval(call(sym("<=>"), "inspect", vec![]));
        assert_eq!(core.heap.string(v).as_deref(), Some(":<=>"));
    }

    #[test]
    fn strings_compare_through_comparable() {
        let (v, _) = eval(call(str_("a"), "<", vec![str_("b")]));
        assert_eq!(v, Value::TRUE);
    }
}
