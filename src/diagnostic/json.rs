use super::{Diagnostic, Severity};

/// One-line JSON for tooling. Absent fields are left out.
pub fn render(d: &Diagnostic) -> String {
    let mut fields = serde_json::Map::new();
    let kind = if d.severity == Severity::Warning { "warning" } else { "error" };
    fields.insert("severity".into(), kind.into());
    if let Some(code) = d.code {
        fields.insert("code".into(), code.into());
    }
    fields.insert("message".into(), d.message.as_str().into());
    if let Some(loc) = &d.location {
        fields.insert("file".into(), loc.file.as_str().into());
        fields.insert("line".into(), loc.line.into());
    }
    fields.insert("notes".into(), serde_json::json!(d.notes));
    if let Some(hint) = &d.suggestion {
        fields.insert("suggestion".into(), hint.as_str().into());
    }

    serde_json::to_string(&serde_json::Value::Object(fields))
        .unwrap_or_else(|_| r#"{"severity":"error","message":"diagnostic could not be serialized"}"#.to_string())
}
