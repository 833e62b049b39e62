use super::{Diagnostic, Severity};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, sgr: &str, s: &str) -> String {
        if self.use_color { format!("\x1b[{sgr}m{s}\x1b[0m") } else { s.to_string() }
    }

    /// ```text
    /// error[C001]: Invalid retry
    ///   --> prog.rb:3
    ///   = note: ...
    ///   = suggestion: ...
    /// ```
    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        let (word, sgr) = match d.severity {
            Severity::Error => ("error", "1;31"),
            Severity::Warning => ("warning", "1;33"),
        };
        let head = d.code.map_or_else(|| word.to_string(), |code| format!("{word}[{code}]"));
        out.push_str(&format!("{}: {}\n", self.paint(sgr, &head), self.paint("1", &d.message)));

        if let Some(loc) = &d.location {
            out.push_str(&format!("  {} {}:{}\n", self.paint("36", "-->"), loc.file, loc.line));
        }

        let bar = self.paint("2", "=");
        for note in &d.notes {
            out.push_str(&format!("  {bar} note: {note}\n"));
        }
        if let Some(hint) = &d.suggestion {
            out.push_str(&format!("  {bar} suggestion: {hint}\n"));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_diag() -> Diagnostic {
        Diagnostic::error("Invalid retry")
            .with_code("C001")
            .at("prog.rb", 3)
            .with_note("in method 'f'")
            .with_suggestion("move it into a rescue clause")
    }

    #[test]
    fn render_contains_code_and_message() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.starts_with("error[C001]: Invalid retry\n"), "got:\n{out}");
    }

    #[test]
    fn location_line_follows_the_header() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.contains("--> prog.rb:3\n"), "missing location in:\n{out}");
    }

    #[test]
    fn notes_then_suggestion() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag());
        assert!(out.contains("note: in method 'f'"), "missing note in:\n{out}");
        assert!(out.contains("suggestion: move it into a rescue clause"), "missing suggestion in:\n{out}");
    }

    #[test]
    fn render_without_code_or_location() {
        let out = AnsiRenderer { use_color: false }.render(&Diagnostic::error("something bad"));
        assert_eq!(out, "error: something bad\n");
    }

    #[test]
    fn warnings_say_so() {
        let out = AnsiRenderer { use_color: false }.render(&Diagnostic::warning("slow path"));
        assert!(out.starts_with("warning: slow path"));
    }

    #[test]
    fn color_only_when_asked() {
        let d = make_diag();
        assert!(AnsiRenderer { use_color: true }.render(&d).contains("\x1b["));
        assert!(!AnsiRenderer { use_color: false }.render(&d).contains("\x1b["));
    }
}
