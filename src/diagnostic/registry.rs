/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    /// One line, attached to diagnostics as a suggestion.
    pub short: &'static str,
    /// Full explanation for `--explain`.
    pub long: &'static str,
}

/// Every stable error code garnet reports.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Compile ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "C001",
        short: "`retry` belongs in a rescue clause and `redo` in a loop or block",
        long: r#"## C001: invalid jump

A `retry` appeared outside a rescue clause, or a `redo` appeared at the
top level or directly in a class body.

**Example that triggers this:**

    def f
      retry
    end

`retry` restarts the `begin` whose rescue clause is running, so it is
only meaningful inside `rescue`.
"#,
    },
    ErrorEntry {
        code: "C002",
        short: "the AST producer emitted a node where it cannot appear",
        long: r#"## C002: unexpected node

A node kind showed up in a position the compiler does not accept, for
example a block-pass argument inside a rescue class list or a `when`
clause outside `case`. The program JSON was produced by a parser that
disagrees with garnet about the tree shape.
"#,
    },
    ErrorEntry {
        code: "C003",
        short: "only variables, attributes, index targets and constants can be assigned",
        long: r#"## C003: not assignable

The left side of an assignment, multiple assignment or operator
assignment is not something that can hold a value.

**Example that triggers this:**

    1 += 2
"#,
    },
    ErrorEntry {
        code: "C004",
        short: "the local variable was not seen by scope analysis",
        long: r#"## C004: unresolved local

A local variable read or write has no declaring scope. This means the
tree changed between analysis and compilation, or node ids collide.
Reload the program from JSON so ids are renumbered.
"#,
    },
    ErrorEntry {
        code: "C005",
        short: "split the method into smaller ones",
        long: r#"## C005: limit exceeded

A single method, block or class body needs more registers, block
slots or ensure slots than one frame can address (65535 of each).
"#,
    },
    // ── Runtime ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "R001",
        short: "rescue the exception or fix its cause",
        long: r#"## R001: uncaught exception

A Ruby exception propagated out of the main program. The message is
followed by the backtrace, innermost frame first.
"#,
    },
    ErrorEntry {
        code: "R002",
        short: "this is a bug in garnet",
        long: r#"## R002: interpreter thread panicked

The thread running the program stopped with a Rust panic. Run again
with `GARNET_LOG=garnet=debug` and report the output.
"#,
    },
    // ── Input ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "E001",
        short: "the program must be a JSON document `{ \"file\": ..., \"root\": Node }`",
        long: r#"## E001: invalid AST

The program file is not valid JSON, or a node has an unknown `type` or
is missing a required field.
"#,
    },
    ErrorEntry {
        code: "E002",
        short: "check the path and its permissions",
        long: r#"## E002: I/O error

A program or configuration file could not be read.
"#,
    },
    ErrorEntry {
        code: "E003",
        short: "see the config keys: jit, inline_operators, self_call, max_call_depth, stack_size, log",
        long: r#"## E003: invalid configuration

A `--config` file did not deserialize, or a `GARNET_*` environment
variable had a value of the wrong kind.

**Example:**

    GARNET_JIT=maybe garnet prog.json

Flags accept `1`, `true`, `on`, `yes` and `0`, `false`, `off`, `no`.
"#,
    },
];

/// Look up an error entry by code (e.g. `"C001"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_code() {
        let e = lookup("C001").expect("C001 should be in registry");
        assert_eq!(e.code, "C001");
        assert!(e.long.contains("C001"));
        assert_eq!(lookup("r001").map(|e| e.code), Some("R001"));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("X999").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn all_codes_unique() {
        let mut codes: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        let len_before = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), len_before, "duplicate codes in registry");
    }

    #[test]
    fn long_text_names_its_code() {
        for entry in REGISTRY {
            assert!(!entry.short.is_empty(), "{} missing short description", entry.code);
            assert!(entry.long.starts_with(&format!("## {}", entry.code)), "{} heading", entry.code);
        }
    }
}
