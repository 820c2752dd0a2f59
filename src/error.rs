use std::fmt;

/// The per-line compile-time problems spec.md §7's taxonomy enumerates.
///
/// This is never returned as a hard `Result::Err` — spec.md is explicit that
/// compile errors are "accumulated and returned alongside the partial
/// forest," never fatal. `CompileError` exists so a [`Diagnostic`]'s
/// `message` is backed by a structured, matchable value instead of a bare
/// string; `compiler::compile` constructs one of these for every line it
/// discards and folds it into a `Diagnostic` via [`Diagnostic::from_error`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("invalid offset: '{0}'")]
    InvalidOffset(String),
    #[error("unknown type: '{0}'")]
    UnknownType(String),
    #[error("invalid type mask: '{0}'")]
    InvalidTypeMask(String),
    #[error("invalid numeric content: '{0}'")]
    InvalidNumericContent(String),
    #[error("invalid mime type: '{0}'")]
    InvalidMimeType(String),
    #[error("truncated line: fewer than three fields")]
    TruncatedLine,
    #[error("inconsistent depth: '{found}' markers exceed current nesting of {max}")]
    InconsistentDepth { found: u32, max: usize },
    #[error("read error: {0}")]
    ReadError(String),
}

/// A single problem found while compiling a rule line.
///
/// Diagnostics are collected, never thrown: a malformed line is skipped and
/// compilation continues with the next line (see `compiler::compile`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub source_name: String,
    pub line: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new<S: Into<String>, M: Into<String>>(source_name: S, line: usize, message: M) -> Self {
        Diagnostic {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    pub fn from_error<S: Into<String>>(source_name: S, line: usize, error: CompileError) -> Self {
        Diagnostic::new(source_name, line, error.to_string())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}: {}", self.source_name, self.line, self.message)
    }
}

/// Errors surfaced to the caller of the Match Engine.
///
/// "No match" is not an error — it is a normal `MatchReport` with an empty
/// candidate list. Only I/O-level failures on the byte source reach here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("byte source read failed: {0}")]
    Source(#[from] std::io::Error),

    #[error("stream does not support mark/reset: {0}")]
    Usage(String),
}

pub(crate) fn classify_io(err: std::io::Error) -> EngineError {
    if err.kind() == std::io::ErrorKind::Unsupported {
        EngineError::Usage(err.to_string())
    } else {
        EngineError::Source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_displays_as_source_line_message() {
        let diag = Diagnostic::from_error("builtin", 3, CompileError::TruncatedLine);
        assert_eq!(diag.to_string(), "builtin:3: truncated line: fewer than three fields");
    }

    #[test]
    fn classify_io_distinguishes_usage_from_source_errors() {
        let unsupported = std::io::Error::new(std::io::ErrorKind::Unsupported, "no mark support");
        assert!(matches!(classify_io(unsupported), EngineError::Usage(_)));

        let other = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        assert!(matches!(classify_io(other), EngineError::Source(_)));
    }
}
