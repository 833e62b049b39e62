//! Behavior that must not depend on how a method ends up executing:
//! interpreted, native, with or without operator inlining and self calls.

use garnet::ast::build::*;
use garnet::ast::{Node, Program};
use garnet::runtime::Capture;
use garnet::{Config, Core, Error};

fn run_with(config: Config, root: Node) -> Result<String, Error> {
    let out = Capture::new();
    let core = Core::with_output(config, Box::new(out.clone()));
    core.run(&Program::new("prop.rb", root))?;
    Ok(out.contents())
}

fn modes() -> Vec<(&'static str, Config)> {
    vec![
        ("interpreted", Config { jit: false, ..Config::default() }),
        ("native", Config::default()),
        ("no inlining", Config { inline_operators: false, ..Config::default() }),
        ("no self call", Config { self_call: false, ..Config::default() }),
        ("interpreted, generic", Config { jit: false, inline_operators: false, self_call: false, ..Config::default() }),
    ]
}

/// Run `root` in every mode and expect the same output each time.
fn check(root: Node, expected: &str) {
    for (mode, config) in modes() {
        match run_with(config, root.clone()) {
            Ok(out) => assert_eq!(out, expected, "mode: {mode}"),
            Err(e) => panic!("mode {mode}: {e}"),
        }
    }
}

fn puts(v: Node) -> Node {
    fcall("puts", vec![v])
}

fn p(v: Node) -> Node {
    fcall("p", vec![v])
}

#[test]
fn redefinition_is_seen_through_a_warm_call_site() {
    let prog = seq(vec![
        class("K", None, Some(def("m", params(), Some(int(1))))),
        def("call_it", params().req("o"), Some(call(lvar("o"), "m", vec![]))),
        puts(fcall("call_it", vec![call(const_("K"), "new", vec![])])),
        puts(fcall("call_it", vec![call(const_("K"), "new", vec![])])),
        class("K", None, Some(def("m", params(), Some(int(2))))),
        puts(fcall("call_it", vec![call(const_("K"), "new", vec![])])),
    ]);
    check(prog, "1\n1\n2\n");
}

#[test]
fn subclass_override_after_caching_on_the_subclass() {
    let prog = seq(vec![
        class("A", None, Some(def("who", params(), Some(str_("a"))))),
        class("B", Some(const_("A")), None),
        def("ask", params().req("o"), Some(call(lvar("o"), "who", vec![]))),
        puts(fcall("ask", vec![call(const_("B"), "new", vec![])])),
        class("B", Some(const_("A")), Some(def("who", params(), Some(str_("b"))))),
        puts(fcall("ask", vec![call(const_("B"), "new", vec![])])),
        puts(fcall("ask", vec![call(const_("A"), "new", vec![])])),
    ]);
    check(prog, "a\nb\na\n");
}

#[test]
fn optional_and_rest_parameters_marshal() {
    let f = def(
        "f",
        params().req("a").opt("b", int(1)).rest("c"),
        Some(array(vec![lvar("a"), lvar("b"), lvar("c")])),
    );
    let prog = seq(vec![
        f,
        p(fcall("f", vec![int(1)])),
        p(fcall("f", vec![int(1), int(2)])),
        p(fcall("f", vec![int(1), int(2), int(3), int(4)])),
    ]);
    check(prog, "[1, 1, []]\n[1, 2, []]\n[1, 2, [3, 4]]\n");
}

#[test]
fn too_few_arguments_raise_argument_error() {
    let prog = seq(vec![
        def("f", params().req("a").opt("b", int(1)).rest("c"), Some(lvar("a"))),
        begin(
            Some(fcall("f", vec![])),
            vec![rescue(vec![const_("ArgumentError")], Some("e"), Some(puts(call(lvar("e"), "message", vec![]))))],
            None,
            None,
        ),
    ]);
    check(prog, "wrong number of arguments (given 0, expected 1+)\n");
}

#[test]
fn splatted_call_arguments_fill_parameters() {
    let prog = seq(vec![
        def("pair", params().req("a").req("b"), Some(call(lvar("a"), "-", vec![lvar("b")]))),
        lasgn("args", array(vec![int(10), int(3)])),
        puts(fcall("pair", vec![splat(lvar("args"))])),
    ]);
    check(prog, "7\n");
}

#[test]
fn two_parameter_block_spreads_an_array() {
    let each = |params, body| with_block(call(array(vec![array(vec![int(1), int(2)])]), "each", vec![]), params, Some(body));
    let prog = seq(vec![
        each(params().req("a").req("b"), seq(vec![puts(lvar("a")), puts(lvar("b"))])),
        each(params().req("a"), p(lvar("a"))),
    ]);
    check(prog, "1\n2\n[1, 2]\n");
}

#[test]
fn yield_spreads_the_same_way() {
    let prog = seq(vec![
        def("give", params(), Some(yield_(vec![array(vec![int(3), int(4)])]))),
        with_block(fcall("give", vec![]), params().req("x").req("y"), Some(puts(call(lvar("x"), "*", vec![lvar("y")])))),
        with_block(fcall("give", vec![]), params().req("x"), Some(p(lvar("x")))),
    ]);
    check(prog, "12\n[3, 4]\n");
}

#[test]
fn inlined_addition_matches_dispatch() {
    let max = 4_611_686_018_427_387_903_i64;
    let min = -4_611_686_018_427_387_904_i64;
    let add = def("add", params().req("a").req("b"), Some(call(lvar("a"), "+", vec![lvar("b")])));
    let sub = def("sub", params().req("a").req("b"), Some(call(lvar("a"), "-", vec![lvar("b")])));
    let prog = seq(vec![
        add,
        sub,
        p(fcall("add", vec![int(1), int(2)])),
        p(fcall("add", vec![int(max), int(1)])),
        p(fcall("add", vec![int(max), int(0)])),
        p(fcall("add", vec![int(min), int(-1)])),
        p(fcall("sub", vec![int(min), int(1)])),
        p(fcall("sub", vec![int(-1), int(max)])),
        p(fcall("add", vec![float(1.5), int(1)])),
        p(fcall("add", vec![str_("ab"), str_("cd")])),
        p(fcall("add", vec![array(vec![int(1)]), array(vec![int(2)])])),
    ]);
    check(
        prog,
        "3\n4611686018427387904\n4611686018427387903\n-4611686018427387905\n-4611686018427387905\n\
         -4611686018427387904\n2.5\n\"abcd\"\n[1, 2]\n",
    );
}

#[test]
fn comparisons_match_dispatch() {
    let cmp = |name: &str, op: &str| def(name, params().req("a").req("b"), Some(call(lvar("a"), op, vec![lvar("b")])));
    let prog = seq(vec![
        cmp("lt", "<"),
        cmp("ge", ">="),
        cmp("eq", "=="),
        p(fcall("lt", vec![int(-3), int(2)])),
        p(fcall("lt", vec![int(2), int(2)])),
        p(fcall("ge", vec![int(2), int(2)])),
        p(fcall("ge", vec![float(1.5), int(2)])),
        p(fcall("eq", vec![int(5), int(5)])),
        p(fcall("eq", vec![int(5), str_("5")])),
    ]);
    check(prog, "true\nfalse\ntrue\nfalse\ntrue\nfalse\n");
}

fn fib() -> Node {
    def(
        "fib",
        params().req("n"),
        Some(if_(
            call(lvar("n"), "<", vec![int(2)]),
            Some(lvar("n")),
            Some(call(
                fcall("fib", vec![call(lvar("n"), "-", vec![int(1)])]),
                "+",
                vec![fcall("fib", vec![call(lvar("n"), "-", vec![int(2)])])],
            )),
        )),
    )
}

#[test]
fn recursion_agrees_with_and_without_self_calls() {
    let fact = def(
        "fact",
        params().req("n"),
        Some(if_(
            call(lvar("n"), "<=", vec![int(1)]),
            Some(int(1)),
            Some(call(lvar("n"), "*", vec![fcall("fact", vec![call(lvar("n"), "-", vec![int(1)])])])),
        )),
    );
    let prog = seq(vec![fib(), fact, puts(fcall("fib", vec![int(18)])), puts(fcall("fact", vec![int(25)]))]);
    check(prog, "2584\n15511210043330985984000000\n");
}

#[test]
fn self_call_on_another_receiver_still_dispatches() {
    // `@nxt.walk` has an explicit receiver, so it is a normal send even
    // though it names the enclosing method.
    let prog = seq(vec![
        class(
            "Node",
            None,
            Some(seq(vec![
                def("initialize", params().req("nxt"), Some(iasgn("@nxt", lvar("nxt")))),
                def(
                    "walk",
                    params().req("n"),
                    Some(if_(
                        call(ivar("@nxt"), "nil?", vec![]),
                        Some(lvar("n")),
                        Some(call(ivar("@nxt"), "walk", vec![call(lvar("n"), "+", vec![int(1)])])),
                    )),
                ),
            ])),
        ),
        lasgn("list", call(const_("Node"), "new", vec![call(const_("Node"), "new", vec![call(const_("Node"), "new", vec![nil()])])])),
        puts(call(lvar("list"), "walk", vec![int(0)])),
    ]);
    check(prog, "2\n");
}

#[test]
fn rescue_binds_the_exception_and_yields_the_clause_value() {
    let prog = seq(vec![
        lasgn(
            "x",
            begin(
                Some(fcall("raise", vec![str_("x")])),
                vec![rescue(vec![], Some("e"), Some(sym("handled")))],
                None,
                None,
            ),
        ),
        p(lvar("x")),
        puts(call(lvar("e"), "message", vec![])),
    ]);
    check(prog, ":handled\nx\n");
}

#[test]
fn rescue_matches_by_class_and_skips_others() {
    let prog = seq(vec![
        def("fail_with", params().req("k"), Some(fcall("raise", vec![lvar("k"), str_("m")]))),
        lasgn(
            "r",
            begin(
                Some(fcall("fail_with", vec![const_("TypeError")])),
                vec![
                    rescue(vec![const_("ArgumentError")], None, Some(sym("arg"))),
                    rescue(vec![const_("TypeError")], None, Some(sym("type"))),
                ],
                None,
                None,
            ),
        ),
        p(lvar("r")),
    ]);
    check(prog, ":type\n");
}

#[test]
fn retry_reruns_the_protected_body() {
    let prog = seq(vec![
        lasgn("tries", int(0)),
        begin(
            Some(seq(vec![
                lasgn("tries", call(lvar("tries"), "+", vec![int(1)])),
                if_(call(lvar("tries"), "<", vec![int(3)]), Some(fcall("raise", vec![str_("again")])), None),
                puts(lvar("tries")),
            ])),
            vec![rescue(vec![], None, Some(retry()))],
            None,
            None,
        ),
    ]);
    check(prog, "3\n");
}

#[test]
fn ensure_runs_once_on_return() {
    let prog = seq(vec![
        gasgn("$n", int(0)),
        def(
            "f",
            params(),
            Some(begin(
                Some(return_(Some(int(1)))),
                vec![],
                None,
                Some(seq(vec![gasgn("$n", call(gvar("$n"), "+", vec![int(1)])), puts(str_("side"))])),
            )),
        ),
        puts(fcall("f", vec![])),
        puts(gvar("$n")),
    ]);
    check(prog, "side\n1\n1\n");
}

#[test]
fn ensure_runs_on_raise_and_on_break() {
    let guarded = |body| begin(Some(body), vec![], None, Some(puts(str_("ensure"))));
    let prog = seq(vec![
        begin(
            Some(guarded(fcall("raise", vec![str_("boom")]))),
            vec![rescue(vec![], Some("e"), Some(puts(call(lvar("e"), "message", vec![]))))],
            None,
            None,
        ),
        with_block(fcall("loop", vec![]), params(), Some(guarded(break_(None)))),
        puts(str_("done")),
    ]);
    check(prog, "ensure\nboom\nensure\ndone\n");
}

#[test]
fn redefined_integer_plus_wins_over_the_fast_path() {
    let prog = seq(vec![
        def("add", params().req("a").req("b"), Some(call(lvar("a"), "+", vec![lvar("b")]))),
        puts(fcall("add", vec![int(1), int(1)])),
        class("Integer", None, Some(def("+", params().req("o"), Some(int(42))))),
        puts(call(int(1), "+", vec![int(1)])),
        puts(fcall("add", vec![int(1), int(1)])),
    ]);
    check(prog, "2\n42\n42\n");
}

#[test]
fn break_and_next_leave_blocks_with_values() {
    let prog = seq(vec![
        lasgn(
            "found",
            with_block(
                call(array(vec![int(1), int(5), int(9)]), "each", vec![]),
                params().req("x"),
                Some(if_(call(lvar("x"), ">", vec![int(3)]), Some(break_(Some(lvar("x")))), None)),
            ),
        ),
        p(lvar("found")),
        p(with_block(
            call(array(vec![int(1), int(2), int(3)]), "map", vec![]),
            params().req("x"),
            Some(seq(vec![
                if_(call(lvar("x"), "==", vec![int(2)]), Some(next(Some(int(0)))), None),
                call(lvar("x"), "*", vec![int(10)]),
            ])),
        )),
    ]);
    check(prog, "5\n[10, 0, 30]\n");
}

#[test]
fn return_from_a_block_leaves_the_method() {
    let prog = seq(vec![
        def(
            "first_big",
            params().req("xs"),
            Some(seq(vec![
                with_block(
                    call(lvar("xs"), "each", vec![]),
                    params().req("x"),
                    Some(if_(call(lvar("x"), ">", vec![int(10)]), Some(return_(Some(lvar("x")))), None)),
                ),
                nil(),
            ])),
        ),
        p(fcall("first_big", vec![array(vec![int(3), int(11), int(40)])])),
        p(fcall("first_big", vec![array(vec![int(3)])])),
    ]);
    check(prog, "11\nnil\n");
}

#[test]
fn blocks_share_captured_locals() {
    let prog = seq(vec![
        lasgn("total", int(0)),
        with_block(
            call(array(vec![int(1), int(2), int(3)]), "each", vec![]),
            params().req("x"),
            Some(lasgn("total", call(lvar("total"), "+", vec![lvar("x")]))),
        ),
        puts(lvar("total")),
        lasgn("counter", with_block(fcall("lambda", vec![]), params(), Some(lasgn("total", call(lvar("total"), "+", vec![int(100)]))))),
        call(lvar("counter"), "call", vec![]),
        puts(lvar("total")),
    ]);
    check(prog, "6\n106\n");
}

#[test]
fn method_missing_receives_unknown_selectors() {
    let prog = seq(vec![
        class(
            "Ghost",
            None,
            Some(def(
                "method_missing",
                params().req("name").rest("args"),
                Some(array(vec![lvar("name"), lvar("args")])),
            )),
        ),
        p(call(call(const_("Ghost"), "new", vec![]), "boo", vec![int(1), int(2)])),
        begin(
            Some(call(nil(), "boo", vec![])),
            vec![rescue(vec![const_("NoMethodError")], Some("e"), Some(puts(call(lvar("e"), "message", vec![]))))],
            None,
            None,
        ),
    ]);
    check(prog, "[:boo, [1, 2]]\nundefined method `boo' for nil\n");
}

#[test]
fn super_reaches_the_parent_definition() {
    let prog = seq(vec![
        class("Base", None, Some(def("greet", params().req("n"), Some(dstr(vec![str_("hi "), lvar("n")]))))),
        class(
            "Child",
            Some(const_("Base")),
            Some(def("greet", params().req("n"), Some(dstr(vec![zsuper(), str_("!")])))),
        ),
        puts(call(call(const_("Child"), "new", vec![]), "greet", vec![str_("bo")])),
    ]);
    check(prog, "hi bo!\n");
}

#[test]
fn loops_with_back_edges_finish() {
    let prog = seq(vec![
        lasgn("i", int(0)),
        lasgn("sum", int(0)),
        while_(
            call(lvar("i"), "<", vec![int(1000)]),
            Some(seq(vec![
                lasgn("sum", call(lvar("sum"), "+", vec![lvar("i")])),
                lasgn("i", call(lvar("i"), "+", vec![int(1)])),
            ])),
        ),
        puts(lvar("sum")),
    ]);
    check(prog, "499500\n");
}

#[test]
fn thread_values_and_errors_surface_on_join() {
    let prog = seq(vec![
        lasgn("t", with_block(call(const_("Thread"), "new", vec![]), params(), Some(call(int(20), "+", vec![int(22)])))),
        puts(call(lvar("t"), "value", vec![])),
        lasgn("bad", with_block(call(const_("Thread"), "new", vec![]), params(), Some(fcall("raise", vec![str_("inner")])))),
        begin(
            Some(call(lvar("bad"), "join", vec![])),
            vec![rescue(vec![], Some("e"), Some(puts(call(lvar("e"), "message", vec![]))))],
            None,
            None,
        ),
    ]);
    check(prog, "42\ninner\n");
}

#[test]
fn uncaught_exception_reports_class_and_backtrace() {
    let prog = seq(vec![
        def("boom", params(), Some(fcall("raise", vec![const_("ArgumentError"), str_("nope")]).at(2))).at(1),
        fcall("boom", vec![]).at(4),
    ]);
    for (mode, config) in modes() {
        let Err(Error::Uncaught { class, message, backtrace }) = run_with(config, prog.clone()) else {
            panic!("mode {mode}: expected an uncaught exception");
        };
        assert_eq!((class.as_str(), message.as_str()), ("ArgumentError", "nope"), "mode: {mode}");
        assert_eq!(backtrace.first().map(String::as_str), Some("prop.rb:2:in `boom'"), "mode: {mode}");
    }
}

#[test]
fn deep_recursion_raises_system_stack_error() {
    let prog = seq(vec![
        def("down", params().req("n"), Some(fcall("down", vec![call(lvar("n"), "+", vec![int(1)])]))),
        begin(
            Some(fcall("down", vec![int(0)])),
            vec![rescue(vec![const_("SystemStackError")], Some("e"), Some(puts(call(lvar("e"), "message", vec![]))))],
            None,
            None,
        ),
    ]);
    for (mode, config) in modes() {
        let config = Config { max_call_depth: 200, ..config };
        assert_eq!(run_with(config, prog.clone()).unwrap(), "stack level too deep\n", "mode: {mode}");
    }
}

#[test]
fn invalid_jumps_are_compile_errors() {
    let err = run_with(Config::default(), def("f", params(), Some(retry()))).unwrap_err();
    let Error::Compile(c) = err else { panic!("expected a compile error, got {err}") };
    assert_eq!(c.code(), "C001");
}

#[test]
fn block_parameter_is_callable_as_a_proc() {
    let body = seq(vec![
        call(lvar("b"), "call", vec![lvar("v")]),
        call(lvar("b"), "call", vec![call(lvar("v"), "+", vec![int(1)])]),
    ]);
    let prog = seq(vec![
        def("twice", params().req("v").block("b"), Some(body)),
        with_block(fcall("twice", vec![int(4)]), params().req("x"), Some(p(lvar("x")))),
    ]);
    check(prog, "4\n5\n");
}

#[test]
fn redefined_send_replaces_an_inlined_send() {
    let prog = seq(vec![
        class("K", None, Some(def("m", params(), Some(int(1))))),
        def("go", params().req("o"), Some(call(lvar("o"), "send", vec![sym("m")]))),
        puts(fcall("go", vec![call(const_("K"), "new", vec![])])),
        puts(fcall("go", vec![call(const_("K"), "new", vec![])])),
        class("K", None, Some(def("send", params().rest("a"), Some(int(9))))),
        puts(fcall("go", vec![call(const_("K"), "new", vec![])])),
    ]);
    check(prog, "1\n1\n9\n");
}

#[test]
fn jumps_from_an_orphaned_proc_raise_local_jump_error() {
    let attempt = |maker: &str| {
        begin(
            Some(call(fcall(maker, vec![]), "call", vec![])),
            vec![rescue(vec![const_("LocalJumpError")], Some("e"), Some(puts(call(lvar("e"), "message", vec![]))))],
            None,
            None,
        )
    };
    let prog = seq(vec![
        def("breaker", params(), Some(with_block(call(const_("Proc"), "new", vec![]), params(), Some(break_(Some(int(1))))))),
        def("returner", params(), Some(with_block(fcall("proc", vec![]), params(), Some(return_(Some(int(2))))))),
        attempt("breaker"),
        attempt("returner"),
        puts(str_("after")),
    ]);
    check(prog, "break from proc-closure\nunexpected return\nafter\n");
}

#[test]
fn redo_reruns_the_block_body_with_the_same_argument() {
    let body = seq(vec![
        op_asgn(lvar("n"), "+", int(1)),
        if_(call(lvar("n"), "==", vec![int(1)]), Some(redo()), None),
        p(array(vec![lvar("x"), lvar("n")])),
    ]);
    let prog = seq(vec![
        lasgn("n", int(0)),
        with_block(call(array(vec![int(1), int(2)]), "each", vec![]), params().req("x"), Some(body)),
    ]);
    check(prog, "[1, 2]\n[2, 3]\n");
}

#[test]
fn or_assign_defines_a_missing_constant_once() {
    let prog = seq(vec![
        op_asgn(const_("LIMIT"), "||", int(1)),
        op_asgn(const_("LIMIT"), "||", int(2)),
        p(const_("LIMIT")),
    ]);
    check(prog, "1\n");
}

#[test]
fn plain_read_of_a_missing_constant_still_raises() {
    let prog = begin(
        Some(p(const_("Nowhere"))),
        vec![rescue(vec![const_("NameError")], None, Some(puts(str_("name error"))))],
        None,
        None,
    );
    check(prog, "name error\n");
}
