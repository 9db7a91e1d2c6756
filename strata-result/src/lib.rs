//! Error types and result definitions for the strata storage engine.
//!
//! All strata crates share the single [`Error`] enum and the [`Result<T>`]
//! alias defined here. Operations that can fail return `Result<T>` and
//! propagate failures with the `?` operator; the variant communicates how a
//! caller should react:
//!
//! - [`Error::TransactionConflict`]: the operation raced a schema change and
//!   must be retried against the current table version.
//! - [`Error::ConstraintViolation`]: user data violated NOT NULL, CHECK,
//!   UNIQUE, or FOREIGN KEY rules; expected during normal operation.
//! - [`Error::CatalogError`]: an invalid schema change was requested.
//! - [`Error::NotImplemented`]: the requested variant of an operation is not
//!   supported.
//! - [`Error::Internal`]: an invariant was breached. These are bugs; they are
//!   never caught inside the engine.

#![forbid(unsafe_code)]

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
