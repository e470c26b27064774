//! Compile-time diagnostics

use thiserror::Error;

/// Where a diagnostic points within the offending line.
#[derive(Debug, Clone)]
pub enum Location {
    /// The parser was at end of input.
    End,
    /// The parser was at this lexeme.
    Lexeme(String),
    /// The token itself was malformed; the message says everything.
    Unknown,
}

/// One compile error, formatted the way the compiler reports it:
/// `[line N] Error at 'lexeme': message`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// 1-indexed source line.
    pub line: u32,
    /// Position within the line.
    pub location: Location,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            Location::End => write!(f, " at end")?,
            Location::Lexeme(lexeme) => write!(f, " at '{lexeme}'")?,
            Location::Unknown => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// All diagnostics from one compile. The compiler keeps parsing past the
/// first error (re-synchronizing at statement boundaries), so this
/// usually carries everything wrong with the source at once.
#[derive(Debug, Error)]
#[error("aborting due to {} compile error(s)", .diagnostics.len())]
pub struct CompileErrors {
    /// Every error reported, in source order.
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileErrors {
    /// True if any diagnostic's message contains `needle` (test helper).
    pub fn mentions(&self, needle: &str) -> bool {
        self.diagnostics.iter().any(|d| d.message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_formats() {
        let at_lexeme = Diagnostic {
            line: 3,
            location: Location::Lexeme("=".to_string()),
            message: "Invalid assignment target.".to_string(),
        };
        assert_eq!(
            at_lexeme.to_string(),
            "[line 3] Error at '=': Invalid assignment target."
        );

        let at_end = Diagnostic {
            line: 9,
            location: Location::End,
            message: "Expect expression.".to_string(),
        };
        assert_eq!(at_end.to_string(), "[line 9] Error at end: Expect expression.");

        let bare = Diagnostic {
            line: 1,
            location: Location::Unknown,
            message: "Unexpected character.".to_string(),
        };
        assert_eq!(bare.to_string(), "[line 1] Error: Unexpected character.");
    }
}
