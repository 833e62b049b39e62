use std::io::Write;
use std::process::{Command, Output};

use garnet::ast::build::*;
use garnet::ast::{Node, Program};
use tempfile::NamedTempFile;

fn garnet() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_garnet"));
    for key in ["GARNET_JIT", "GARNET_INLINE", "GARNET_SELF_CALL", "GARNET_MAX_DEPTH", "GARNET_LOG"] {
        cmd.env_remove(key);
    }
    cmd
}

fn program_file(root: Node) -> NamedTempFile {
    let json = serde_json::to_string(&Program::new("prog.rb", root)).expect("serialize program");
    text_file(&json)
}

fn text_file(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(text.as_bytes()).expect("write temp file");
    file
}

fn run(cmd: &mut Command) -> (i32, String, String) {
    let Output { status, stdout, stderr } = cmd.output().expect("failed to run garnet");
    (
        status.code().unwrap_or(-1),
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}

fn sum_program() -> Node {
    seq(vec![
        def("add", params().req("a").req("b"), Some(call(lvar("a"), "+", vec![lvar("b")]))),
        fcall("puts", vec![fcall("add", vec![int(1), int(2)])]),
    ])
}

// --- Running programs ---

#[test]
fn runs_a_program() {
    let file = program_file(sum_program());
    let (code, out, err) = run(garnet().arg(file.path()));
    assert_eq!(code, 0, "stderr: {err}");
    assert_eq!(out, "3\n");
}

#[test]
fn flags_do_not_change_output() {
    let file = program_file(sum_program());
    let (code, out, err) = run(garnet().arg(file.path()).args(["--no-jit", "--no-inline", "--no-self-call"]));
    assert_eq!(code, 0, "stderr: {err}");
    assert_eq!(out, "3\n");
}

#[test]
fn dump_ir_lists_functions_without_running() {
    let file = program_file(sum_program());
    let (code, out, _) = run(garnet().arg(file.path()).arg("--dump-ir"));
    assert_eq!(code, 0);
    assert!(out.contains("fn <main>"), "got:\n{out}");
    assert!(out.contains("fn add"), "got:\n{out}");
    assert!(!out.starts_with("3\n"));
}

// --- Errors ---

#[test]
fn uncaught_exception_exits_1_with_diagnostic() {
    let file = program_file(fcall("raise", vec![str_("boom")]).at(1));
    let (code, out, err) = run(garnet().arg(file.path()));
    assert_eq!(code, 1);
    assert!(out.is_empty());
    assert!(err.contains("error[R001]: boom (RuntimeError)"), "stderr: {err}");
    assert!(err.contains("--> prog.rb:1"), "stderr: {err}");
}

#[test]
fn json_errors_are_one_line() {
    let file = program_file(fcall("raise", vec![const_("TypeError"), str_("bad")]).at(1));
    let (code, _, err) = run(garnet().arg(file.path()).arg("--json-errors"));
    assert_eq!(code, 1);
    let line = err.lines().last().unwrap_or_default();
    let v: serde_json::Value = serde_json::from_str(line).expect("JSON diagnostic");
    assert_eq!(v["code"], "R001");
    assert_eq!(v["message"], "bad (TypeError)");
    assert_eq!(v["file"], "prog.rb");
}

#[test]
fn compile_error_exits_1() {
    let file = program_file(seq(vec![retry().at(2)]));
    let (code, _, err) = run(garnet().arg(file.path()));
    assert_eq!(code, 1);
    assert!(err.contains("error[C001]"), "stderr: {err}");
}

#[test]
fn malformed_ast_exits_2() {
    let file = text_file(r#"{"file": "x.rb", "root": {"type": "bogus"}}"#);
    let (code, _, err) = run(garnet().arg(file.path()).arg("--json-errors"));
    assert_eq!(code, 2);
    let v: serde_json::Value = serde_json::from_str(err.trim()).expect("JSON diagnostic");
    assert_eq!(v["code"], "E001");
}

#[test]
fn missing_program_file_exits_2() {
    let (code, _, err) = run(garnet().arg("/definitely/not/here.json"));
    assert_eq!(code, 2);
    assert!(err.contains("error[E002]"), "stderr: {err}");
}

#[test]
fn no_arguments_is_a_usage_error() {
    let (code, _, err) = run(&mut garnet());
    assert_eq!(code, 2);
    assert!(err.contains("Usage"), "stderr: {err}");
}

// --- Configuration ---

#[test]
fn config_file_is_applied() {
    let file = program_file(sum_program());
    let config = text_file(r#"{"jit": false, "log": "garnet=debug"}"#);
    let (code, out, err) = run(garnet().arg(file.path()).arg("--config").arg(config.path()));
    assert_eq!(code, 0, "stderr: {err}");
    assert_eq!(out, "3\n");
    assert!(err.contains("loaded program"), "debug logging expected on stderr: {err}");
}

#[test]
fn bad_config_file_exits_2() {
    let file = program_file(sum_program());
    let config = text_file(r#"{"jit": "sometimes"}"#);
    let (code, _, err) = run(garnet().arg(file.path()).arg("--config").arg(config.path()));
    assert_eq!(code, 2);
    assert!(err.contains("error[E003]"), "stderr: {err}");
}

#[test]
fn bad_environment_flag_exits_2() {
    let file = program_file(sum_program());
    let (code, _, err) = run(garnet().arg(file.path()).env("GARNET_JIT", "maybe"));
    assert_eq!(code, 2);
    assert!(err.contains("GARNET_JIT"), "stderr: {err}");
}

#[test]
fn depth_limit_from_environment() {
    let prog = seq(vec![def("f", params(), Some(fcall("f", vec![]))), fcall("f", vec![])]);
    let file = program_file(prog);
    let (code, _, err) = run(garnet().arg(file.path()).env("GARNET_MAX_DEPTH", "100"));
    assert_eq!(code, 1);
    assert!(err.contains("stack level too deep (SystemStackError)"), "stderr: {err}");
}

// --- Explain ---

#[test]
fn explain_prints_the_registry_entry() {
    let (code, out, _) = run(garnet().args(["--explain", "C001"]));
    assert_eq!(code, 0);
    assert!(out.starts_with("## C001"), "got:\n{out}");
}

#[test]
fn explain_unknown_code_exits_2() {
    let (code, _, err) = run(garnet().args(["--explain", "Z999"]));
    assert_eq!(code, 2);
    assert!(err.contains("Z999"));
}
