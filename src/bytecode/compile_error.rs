use thiserror::Error;

/// Which stage produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Unrecognized character or unterminated literal.
    Lex,
    /// Unexpected token; the compiler resynchronized after it.
    Syntax,
}

/// One compile-time problem at a source line.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {message}")]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub line: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn lex(line: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            kind: DiagnosticKind::Lex,
            line,
            message: message.into(),
        }
    }

    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            kind: DiagnosticKind::Syntax,
            line,
            message: message.into(),
        }
    }
}

/// Aggregate failure for one source file.
///
/// Any diagnostic means no script definition was produced for the file.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "compile error: {count} problem(s) in '{file}'{listing}",
    count = .diagnostics.len(),
    listing = listing(.file, .diagnostics)
)]
pub struct CompileError {
    pub file: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    pub fn new(file: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        CompileError {
            file: file.into(),
            diagnostics,
        }
    }

    pub fn has_kind(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }
}

/// One `file:line: kind: message` line per diagnostic, each on its own line.
fn listing(file: &str, diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| {
            let kind = match d.kind {
                DiagnosticKind::Lex => "lex error",
                DiagnosticKind::Syntax => "syntax error",
            };
            format!("\n  {}:{}: {}: {}", file, d.line, kind, d.message)
        })
        .collect()
}
