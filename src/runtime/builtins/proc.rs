//! Proc.

use super::{Ret, require_block};
use crate::runtime::Core;
use crate::runtime::block::Proc;
use crate::runtime::heap::Data;
use crate::value::Value;
use crate::vm::Interp;

pub(crate) fn install(core: &Core) {
    let meta = core.metaclass(core.c.proc_);
    core.define_foreign(meta, "new", 0, 0, proc_new);

    let p = core.c.proc_;
    for name in ["call", "()", "yield", "[]", "==="] {
        core.define_foreign(p, name, 0, -1, call);
    }
    core.define_foreign(p, "arity", 0, 0, arity);
    core.define_foreign(p, "lambda?", 0, 0, is_lambda);
    core.define_foreign(p, "to_proc", 0, 0, to_proc);
    core.define_foreign(p, "inspect", 0, 0, inspect);
    core.define_foreign(p, "to_s", 0, 0, inspect);
}

fn proc_new(interp: &mut Interp, _: Value, _: &[Value], block: Option<Value>) -> Ret {
    let block = require_block(interp, block)?;
    interp.escape_block(block);
    Ok(block)
}

fn call(interp: &mut Interp, recv: Value, args: &[Value], _: Option<Value>) -> Ret {
    interp.call_block(recv, args)
}

fn arity(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let Some(object) = interp.core.heap.get(recv) else { return Ok(Value::int(0)) };
    let n = match &object.data {
        Data::Proc(Proc::Block(b)) => b.arity.ruby_arity(),
        Data::Proc(Proc::Symbol(_)) => -2,
        _ => 0,
    };
    Ok(interp.core.int_value(n as i128))
}

fn is_lambda(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    Ok(Value::bool(interp.block_of(recv).is_some_and(|b| b.is_lambda())))
}

fn to_proc(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    interp.escape_block(recv);
    Ok(recv)
}

fn inspect(interp: &mut Interp, recv: Value, _: &[Value], _: Option<Value>) -> Ret {
    let text = match interp.block_of(recv) {
        Some(b) => {
            let file = interp.core.functions.get(b.func).map(|s| format!("{}:{}", s.ir.file, s.ir.line)).unwrap_or_default();
            let kind = if b.is_lambda() { " (lambda)" } else { "" };
            format!("#<Proc:{file}{kind}>")
        }
        None => "#<Proc:(&:symbol) (lambda)>".to_string(),
    };
    Ok(interp.core.new_string(text))
}

#[cfg(test)]
mod tests {
    use crate::ast::Program;
    use crate::ast::build::*;
    use crate::config::Config;
    use crate::runtime::{Capture, Core};
    use crate::value::Value;

    fn eval(root: crate::ast::Node) -> crate::Result<Value> {
        let core = Core::with_output(Config { jit: false, ..Config::default() }, Box::new(Capture::new()));
        core.run(&Program::new("p.rb", root))
    }

    #[test]
    fn lambda_checks_arity_and_proc_does_not() {
        let lam = with_block(fcall("lambda", vec![]), params().req("a").req("b"), Some(lvar("a")));
        let r = eval(call(lam, "call", vec![int(1)]));
        let Err(crate::Error::Uncaught { class, .. }) = r else { panic!("expected ArgumentError") };
        assert_eq!(class, "ArgumentError");

        let pr = with_block(fcall("proc", vec![]), params().req("a").req("b"), Some(lvar("b")));
        assert_eq!(eval(call(pr, "call", vec![int(1)])).unwrap(), Value::NIL);
    }

    #[test]
    fn arity_counts_optionals_as_negative() {
        let pr = with_block(fcall("proc", vec![]), params().req("a").opt("b", int(1)), None);
        assert_eq!(eval(call(pr, "arity", vec![])).unwrap(), Value::int(-2));
        let lam = with_block(fcall("lambda", vec![]), params().req("a").req("b"), None);
        assert_eq!(eval(call(lam, "arity", vec![])).unwrap(), Value::int(2));
    }

    #[test]
    fn return_inside_lambda_returns_from_lambda() {
        let lam = with_block(fcall("lambda", vec![]), params(), Some(seq(vec![return_(Some(int(5))), int(6)])));
        let prog = seq(vec![lasgn("l", lam), call(call(lvar("l"), "call", vec![]), "+", vec![int(1)])]);
        assert_eq!(eval(prog).unwrap(), Value::int(6));
    }
}
