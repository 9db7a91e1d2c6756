use crate::error::Error;

/// Result alias used across all strata crates.
pub type Result<T> = std::result::Result<T, Error>;
