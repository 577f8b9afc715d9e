//! Custom error types for the application.
//!
//! This module defines the primary error type, `SweepError`, using the
//! `thiserror` crate. The taxonomy is deliberately small:
//!
//! - **`Instrument`**: communication failures (timeout, malformed reply,
//!   protocol error) from either the power supply or the lock-in. Any of
//!   these aborts the remaining sweep, but the controller still ramps the
//!   supply to zero before surfacing the error.
//! - **`Cancelled`**: a cooperative abort was requested. This is internal
//!   plumbing; the sweep entry point converts it into a clean early finish
//!   with a partial, flagged record rather than an error to the caller.
//! - **`Config`**: semantic configuration problems caught during validation
//!   (empty sensitivity ladder, inverted threshold band, and so on).
//! - **`Io` / `Storage`**: filesystem and CSV persistence failures.
//!
//! Auto-ranging exhaustion is intentionally *not* an error variant: the
//! reading is still recorded with its best-effort sensitivity and a flag,
//! so no data point is ever dropped over a range problem.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type SweepResult<T> = std::result::Result<T, SweepError>;

/// Errors raised by the sweep controller and its collaborators.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Instrument communication failure (timeout or malformed response).
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Cooperative cancellation was observed mid-sweep.
    #[error("Sweep cancelled")]
    Cancelled,

    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Result persistence failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SweepError::Instrument("lock-in timed out".to_string());
        assert_eq!(err.to_string(), "Instrument error: lock-in timed out");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: SweepError = io.into();
        assert!(err.to_string().contains("no such file"));
    }
}
