//! Parsing of toolchain output lines into structured diagnostics

use crate::types::{BuildDiagnostic, DiagnosticSeverity};

const SEVERITIES: [(&str, DiagnosticSeverity); 3] = [
    ("error", DiagnosticSeverity::Error),
    ("warning", DiagnosticSeverity::Warning),
    ("note", DiagnosticSeverity::Note),
];

/// Parse one toolchain output line into a structured diagnostic.
///
/// Recognizes the `file.zig:line:col: severity: message` form the compiler
/// emits, as well as bare `severity: message` lines. Anything else is not a
/// diagnostic and returns `None`.
pub fn parse_diagnostic(line: &str) -> Option<BuildDiagnostic> {
    let line = line.trim();
    for (token, severity) in SEVERITIES {
        let marker = format!("{token}: ");

        if let Some(message) = line.strip_prefix(&marker) {
            return Some(BuildDiagnostic {
                severity,
                message: message.to_string(),
                file: None,
                line: None,
                column: None,
                code: None,
            });
        }

        let located = format!(": {marker}");
        if let Some(pos) = line.find(&located) {
            let message = line[pos + located.len()..].to_string();
            let (file, line_no, column) = parse_location(&line[..pos]);
            return Some(BuildDiagnostic {
                severity,
                message,
                file,
                line: line_no,
                column,
                code: None,
            });
        }
    }
    None
}

/// Split a `file:line:col` location prefix. Falls back to treating the whole
/// prefix as a file name when the trailing segments are not numeric.
fn parse_location(loc: &str) -> (Option<String>, Option<u32>, Option<u32>) {
    let mut segments: Vec<&str> = loc.rsplitn(3, ':').collect();
    segments.reverse();
    if let [file, line, column] = segments.as_slice() {
        if let (Ok(line), Ok(column)) = (line.parse(), column.parse()) {
            return (Some((*file).to_string()), Some(line), Some(column));
        }
    }
    (Some(loc.to_string()), None, None)
}

/// Parse `[n/total]` compile progress from a toolchain output line
pub fn parse_compile_progress(line: &str) -> Option<(u32, u32)> {
    let rest = line.trim_start().strip_prefix('[')?;
    let end = rest.find(']')?;
    let (current, total) = rest[..end].split_once('/')?;
    let current = current.trim().parse().ok()?;
    let total: u32 = total.trim().parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((current, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diagnostic_with_location() {
        let diag =
            parse_diagnostic("src/main.zig:4:13: error: use of undeclared identifier 'foo'")
                .unwrap();
        assert_eq!(diag.severity, DiagnosticSeverity::Error);
        assert_eq!(diag.file.as_deref(), Some("src/main.zig"));
        assert_eq!(diag.line, Some(4));
        assert_eq!(diag.column, Some(13));
        assert_eq!(diag.message, "use of undeclared identifier 'foo'");
    }

    #[test]
    fn test_parse_diagnostic_warning_and_note() {
        let diag = parse_diagnostic("lib/ui.zig:10:1: warning: unused variable").unwrap();
        assert_eq!(diag.severity, DiagnosticSeverity::Warning);

        let diag = parse_diagnostic("src/app.zig:2:5: note: declared here").unwrap();
        assert_eq!(diag.severity, DiagnosticSeverity::Note);
        assert_eq!(diag.line, Some(2));
    }

    #[test]
    fn test_parse_diagnostic_bare() {
        let diag = parse_diagnostic("error: FileNotFound").unwrap();
        assert_eq!(diag.severity, DiagnosticSeverity::Error);
        assert!(diag.file.is_none());
        assert_eq!(diag.message, "FileNotFound");
    }

    #[test]
    fn test_parse_diagnostic_rejects_plain_output() {
        assert!(parse_diagnostic("Compiling src/main.zig").is_none());
        assert!(parse_diagnostic("").is_none());
    }

    #[test]
    fn test_parse_compile_progress() {
        assert_eq!(parse_compile_progress("[1/10] Compiling main.zig"), Some((1, 10)));
        assert_eq!(parse_compile_progress("[5/10] Linking"), Some((5, 10)));
        assert_eq!(parse_compile_progress("[10/10] Done"), Some((10, 10)));
        assert_eq!(parse_compile_progress("[0/0] nothing"), None);
        assert_eq!(parse_compile_progress("Some other output"), None);
    }
}
