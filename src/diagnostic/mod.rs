pub mod ansi;
pub mod json;
pub mod registry;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// `file:line` in the Ruby program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub location: Option<Location>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            location: None,
            notes: Vec::new(),
            suggestion: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    /// Set the code, and the registry's one-line hint as the suggestion.
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        if self.suggestion.is_none() {
            self.suggestion = registry::lookup(code).map(|e| e.short.to_string());
        }
        self
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.location = Some(Location { file: file.into(), line });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// `file:line:in `name'` backtrace entry split into its location.
fn backtrace_location(entry: &str) -> Option<Location> {
    let mut parts = entry.splitn(3, ':');
    let file = parts.next()?;
    let line = parts.next()?.parse().ok()?;
    Some(Location { file: file.to_string(), line })
}

impl From<&Error> for Diagnostic {
    fn from(e: &Error) -> Self {
        match e {
            Error::Compile(c) => Diagnostic::error(c.kind.to_string()).with_code(c.code()).at(&c.file, c.line),
            Error::Uncaught { class, message, backtrace } => {
                let mut d = Diagnostic::error(format!("{message} ({class})")).with_code("R001");
                d.location = backtrace.first().and_then(|b| backtrace_location(b));
                for entry in backtrace {
                    d = d.with_note(format!("from {entry}"));
                }
                d
            }
            Error::Ast(err) => Diagnostic::error(format!("invalid AST: {err}")).with_code("E001"),
            Error::Io { path, source } => Diagnostic::error(format!("{path}: {source}")).with_code("E002"),
            Error::Config(msg) => Diagnostic::error(format!("invalid config: {msg}")).with_code("E003"),
            Error::ThreadPanicked => Diagnostic::error(e.to_string()).with_code("R002"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileError, ErrorKind};

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.location.is_none());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
        assert_eq!(Diagnostic::warning("w").severity, Severity::Warning);
    }

    #[test]
    fn code_brings_the_registry_hint() {
        let d = Diagnostic::error("bad").with_code("C003");
        assert_eq!(d.code, Some("C003"));
        assert!(d.suggestion.as_deref().is_some_and(|s| s.contains("assigned")));
        let kept = Diagnostic::error("bad").with_suggestion("mine").with_code("C003");
        assert_eq!(kept.suggestion.as_deref(), Some("mine"));
    }

    #[test]
    fn from_compile_error() {
        let e = Error::Compile(CompileError { file: "c.rb".into(), line: 3, kind: ErrorKind::InvalidJump("retry") });
        let d = Diagnostic::from(&e);
        assert_eq!(d.message, "Invalid retry");
        assert_eq!(d.code, Some("C001"));
        assert_eq!(d.location, Some(Location { file: "c.rb".into(), line: 3 }));
    }

    #[test]
    fn from_uncaught_exception() {
        let e = Error::Uncaught {
            class: "RuntimeError".into(),
            message: "boom".into(),
            backtrace: vec!["t.rb:4:in `f'".into(), "t.rb:9:in `<main>'".into()],
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.message, "boom (RuntimeError)");
        assert_eq!(d.location, Some(Location { file: "t.rb".into(), line: 4 }));
        assert_eq!(d.notes, vec!["from t.rb:4:in `f'", "from t.rb:9:in `<main>'"]);
    }

    #[test]
    fn uncaught_without_backtrace_has_no_location() {
        let e = Error::Uncaught { class: "X".into(), message: "m".into(), backtrace: Vec::new() };
        assert!(Diagnostic::from(&e).location.is_none());
    }

    #[test]
    fn input_errors_get_input_codes() {
        let io = Error::io("p.json", std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(Diagnostic::from(&io).code, Some("E002"));
        assert_eq!(Diagnostic::from(&Error::Config("x".into())).code, Some("E003"));
    }
}
