//! Exception and its subclasses.
//!
//! The message lives in `@message` and the backtrace in a hidden ivar set
//! when the exception is first raised.

use super::{Ret, to_s};
use crate::runtime::Core;
use crate::value::Value;
use crate::vm::Interp;

pub(crate) fn install(core: &Core) {
    let e = core.c.exception;
    core.define_foreign(e, "initialize", 0, 1, initialize);
    core.define_foreign(e, "message", 0, 0, message);
    core.define_foreign(e, "to_s", 0, 0, exc_to_s);
    core.define_foreign(e, "inspect", 0, 0, inspect);
    core.define_foreign(e, "backtrace", 0, 0, backtrace);
    core.define_foreign(e, "full_message", 0, 0, full_message);
}

/// Message text without running any Ruby code: `@message` when it is a
/// String, else the class name.
pub(crate) fn stored_message(core: &Core, exc: Value) -> String {
    core.heap
        .string(core.ivar_get(exc, core.s.message))
        .unwrap_or_else(|| core.class_name(core.class_of(exc)))
}

fn initialize(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    let msg = args.first().copied().unwrap_or(Value::NIL);
    interp.core.ivar_set(recv, interp.core.s.message, msg);
    Ok(Value::NIL)
}

fn message(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let sel = interp.core.s.to_s;
    interp.call(recv, sel, &[], None, false)
}

fn exc_to_s(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = interp.core.clone();
    let msg = core.ivar_get(recv, core.s.message);
    if msg.is_nil() {
        return Ok(core.new_string(core.class_name(core.class_of(recv))));
    }
    if core.heap.string(msg).is_some() {
        return Ok(msg);
    }
    let text = to_s(interp, msg)?;
    Ok(core.new_string(text))
}

/// `#<RuntimeError: boom>`
fn inspect(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = interp.core.clone();
    let class = core.class_name(core.class_of(recv));
    let text = to_s(interp, recv)?;
    let out = if text.is_empty() { class } else { format!("#<{class}: {text}>") };
    Ok(core.new_string(out))
}

fn backtrace(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = &interp.core;
    let bt = core.ivar_get(recv, core.s.backtrace);
    Ok(match core.heap.array(bt) {
        Some(lines) => core.new_array(lines),
        None => Value::NIL,
    })
}

/// `file:line:in 'm': msg (Class)` followed by the remaining frames.
fn full_message(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let core = interp.core.clone();
    let class = core.class_name(core.class_of(recv));
    let msg = super::exception_message(interp, recv);
    let lines: Vec<String> = core
        .heap
        .array(core.ivar_get(recv, core.s.backtrace))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|l| core.heap.string(l))
        .collect();
    let mut out = match lines.first() {
        Some(first) => format!("{first}: {msg} ({class})"),
        None => format!("{msg} ({class})"),
    };
    for line in lines.iter().skip(1) {
        out.push_str(&format!("\n\tfrom {line}"));
    }
    Ok(core.new_string(out))
}

#[cfg(test)]
mod tests {
    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::runtime::{Capture, Core};

    fn eval_out(root: crate::ast::Node) -> String {
        let out = Capture::new();
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(out.clone()));
        core.run(&Program::new("e.rb", root)).unwrap();
        out.contents()
    }

    #[test]
    fn message_defaults_to_class_name() {
        let prog = fcall("puts", vec![call(call(const_("ArgumentError"), "new", vec![]), "message", vec![])]);
        assert_eq!(eval_out(prog), "ArgumentError\n");
    }

    #[test]
    fn inspect_shows_class_and_message() {
        let prog = fcall("p", vec![call(const_("RuntimeError"), "new", vec![str_("boom")])]);
        assert_eq!(eval_out(prog), "#<RuntimeError: boom>\n");
    }

    #[test]
    fn custom_to_s_drives_message() {
        let prog = seq(vec![
            class("Oops", Some(const_("StandardError")), Some(def("to_s", params(), Some(str_("custom"))))),
            begin(
                Some(fcall("raise", vec![const_("Oops")])),
                vec![rescue(vec![const_("Oops")], Some("e"), Some(fcall("puts", vec![call(lvar("e"), "message", vec![])])))],
                None,
                None,
            ),
        ]);
        assert_eq!(eval_out(prog), "custom\n");
    }

    #[test]
    fn backtrace_is_set_when_raised() {
        let prog = begin(
            Some(fcall("raise", vec![str_("x")]).at(2)),
            vec![rescue(vec![], Some("e"), Some(fcall("puts", vec![call(lvar("e"), "backtrace", vec![])])))],
            None,
            None,
        );
        assert_eq!(eval_out(prog), "e.rb:2:in `<main>'\n");
    }
}
