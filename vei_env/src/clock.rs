//! Logical clock: a millisecond counter that never decreases.

use crate::error::EnvError;
use crate::types::LogicalTime;

/// Deterministic millisecond clock owned by a session.
///
/// The clock is advanced explicitly by the router; it never consults
/// the host's wall clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalClock {
    now_ms: LogicalTime,
}

impl LogicalClock {
    /// Creates a clock at time zero.
    pub fn new() -> Self {
        Self { now_ms: 0 }
    }

    /// Returns the current logical time.
    pub fn now(&self) -> LogicalTime {
        self.now_ms
    }

    /// Advances the clock by `dt_ms` and returns the new time.
    ///
    /// Fails with `InvalidArgument` for a negative delta, leaving the
    /// clock untouched.
    pub fn advance(&mut self, dt_ms: i64) -> Result<LogicalTime, EnvError> {
        if dt_ms < 0 {
            return Err(EnvError::invalid_argument(format!(
                "dt_ms must be >= 0, got {}",
                dt_ms
            )));
        }
        self.now_ms = self
            .now_ms
            .checked_add(dt_ms as u64)
            .ok_or(EnvError::Overflow)?;
        Ok(self.now_ms)
    }

    /// Moves the clock forward to an absolute time.
    pub fn advance_to(&mut self, target_ms: LogicalTime) -> Result<LogicalTime, EnvError> {
        if target_ms < self.now_ms {
            return Err(EnvError::ClockRegression {
                now: self.now_ms,
                requested: target_ms,
            });
        }
        self.now_ms = target_ms;
        Ok(self.now_ms)
    }

    /// Resets the clock to zero.
    pub fn reset(&mut self) {
        self.now_ms = 0;
    }
}
