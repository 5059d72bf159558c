//! Error types for the stream-surgeon crate.
//!
//! This module defines a unified error enumeration used across stream
//! parsing, serialization, the manifest engine, and the surgical
//! operators. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant corresponds to one error *kind*; callers at a known
//!   level filter-match on [`SurgeonError::kind`] and propagate the rest.
//! - Parse errors always carry the one-based line number of the
//!   offending input line.

use thiserror::Error;

/// Coarse classification of an error, used by callers that want to
/// catch exactly one kind at a known level and re-propagate others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input stream.
    Parse,
    /// Operator precondition violation; the repository is left untouched.
    Command,
    /// Malformed metadata update; no partial apply.
    Msgbox,
    /// I/O failure in blob or scratch storage.
    Storage,
    /// Invariant violation — a bug in this crate or its caller.
    Internal,
}

#[derive(Error, Debug)]
/// Unified error enumeration for the stream-surgeon library.
///
/// - Used across the parser, serializer, manifest engine and operators.
/// - Implements `std::error::Error` via `thiserror`.
pub enum SurgeonError {
    /// Malformed fast-import input, annotated with the input line number.
    #[error("line {line}: {msg}")]
    Parse { line: u64, msg: String },

    /// An operator precondition was violated. The repository has not
    /// been modified when this is returned.
    #[error("{0}")]
    Command(String),

    /// A metadata update (comment, attribution, tag field) was
    /// malformed and has not been applied.
    #[error("metadata update rejected: {0}")]
    Msgbox(String),

    /// I/O error from blob content or scratch-directory storage.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Invalid mark, reference or hash value encountered where a
    /// well-formed one was required.
    #[error("the `{0}` is not a valid {1}")]
    InvalidValue(String, &'static str),

    /// Internal invariant violation. Fatal; the top-level abort hook
    /// removes the scratch directory.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SurgeonError {
    /// The coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SurgeonError::Parse { .. } => ErrorKind::Parse,
            SurgeonError::Command(_) => ErrorKind::Command,
            SurgeonError::Msgbox(_) => ErrorKind::Msgbox,
            SurgeonError::Storage(_) => ErrorKind::Storage,
            SurgeonError::InvalidValue(..) => ErrorKind::Command,
            SurgeonError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Construct a parse error for the given input line.
    pub fn parse(line: u64, msg: impl Into<String>) -> Self {
        SurgeonError::Parse {
            line,
            msg: msg.into(),
        }
    }

    /// Construct an operator precondition error.
    pub fn command(msg: impl Into<String>) -> Self {
        SurgeonError::Command(msg.into())
    }

    /// Construct an internal invariant-violation error.
    pub fn internal(msg: impl Into<String>) -> Self {
        SurgeonError::Internal(msg.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SurgeonError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Parse errors carry the line number into the message.
    #[test]
    fn test_parse_error_display() {
        let err = SurgeonError::parse(42, "expected mark");
        assert_eq!(err.to_string(), "line 42: expected mark");
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    /// IO errors convert into the Storage kind.
    #[test]
    fn test_storage_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SurgeonError = io.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    /// Command errors keep their message verbatim.
    #[test]
    fn test_command_error() {
        let err = SurgeonError::command("cut is infeasible at that edge");
        assert_eq!(err.to_string(), "cut is infeasible at that edge");
        assert_eq!(err.kind(), ErrorKind::Command);
    }
}
