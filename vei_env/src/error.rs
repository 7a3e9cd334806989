//! Error types for the VEI environment layer.

use thiserror::Error;

/// Errors raised by the clock and RNG primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// A caller passed a value outside the accepted domain (e.g. a negative delta)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An attempt to move the clock backwards
    #[error("Clock regression: now={now}ms, requested={requested}ms")]
    ClockRegression { now: u64, requested: u64 },

    /// Integer overflow while computing a logical time
    #[error("Logical time overflow")]
    Overflow,
}

impl EnvError {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
