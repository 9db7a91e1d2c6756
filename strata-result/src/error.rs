use std::{fmt, io};
use thiserror::Error;

/// Unified error type for all strata operations.
///
/// Errors propagate upward through the call stack using Rust's `?` operator.
/// Internal code can match on specific variants for fine-grained handling;
/// API boundaries typically render the message.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during file or block-store operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Arrow library error during columnar data operations.
    ///
    /// Arrow is the underlying in-memory format for chunks and columns, so
    /// these typically indicate schema mismatches or malformed arrays.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Invalid user input or API parameter.
    ///
    /// Recoverable: fix the input and retry the operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A mutation was attempted against a table version that has been
    /// superseded by a schema change.
    ///
    /// The transaction must restart against the current table version.
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Data constraint violation: NOT NULL, CHECK, UNIQUE, or FOREIGN KEY.
    ///
    /// The message names the table, column, and (for indexed violations) a
    /// synthesized key. Expected during normal operation; the application
    /// should surface it to the user.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid schema change, e.g. dropping a column an index depends on.
    #[error("{0}")]
    CatalogError(String),

    /// The requested operation variant is not supported.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Internal error indicating a bug or unexpected state.
    ///
    /// Never caught inside the engine; if you see one, report it with
    /// reproduction steps.
    #[error("An internal operation failed: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error from any displayable payload.
    #[inline]
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        Error::Internal(err.to_string())
    }

    /// Create a constraint-violation error from any displayable payload.
    #[inline]
    pub fn constraint<E: fmt::Display>(err: E) -> Self {
        Error::ConstraintViolation(err.to_string())
    }

    /// True if this error is an internal invariant breach.
    ///
    /// Constraint verification wraps expression-execution failures as
    /// constraint violations, except internal errors, which must propagate
    /// unchanged; this predicate makes that check explicit at call sites.
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_recognized() {
        let err = Error::internal("row group count mismatch");
        assert!(err.is_internal());
        assert!(!Error::constraint("duplicate key").is_internal());
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> crate::Result<()> {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing block"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(Error::Io(_))));
    }
}
