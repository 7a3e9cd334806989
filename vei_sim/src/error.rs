//! Error types for the simulation harness.

use thiserror::Error;
use vei_core::KernelError;

/// Errors raised while building or running a simulated world.
#[derive(Debug, Error)]
pub enum SimError {
    /// The kernel rejected a call or halted
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// World definition is inconsistent (bad DOM graph, unknown alias pack, ...)
    #[error("World error: {0}")]
    World(String),

    /// Unknown scenario name
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// Two runs that must agree did not
    #[error("Runs diverged: {0}")]
    Divergence(String),

    /// Reading or writing an artifact failed
    #[error("I/O error: {0}")]
    Io(String),

    /// A hosted session task panicked or was cancelled
    #[error("Session task failed: {0}")]
    Join(String),
}

impl SimError {
    /// Creates a world-definition error.
    pub fn world(msg: impl Into<String>) -> Self {
        Self::World(msg.into())
    }

    /// Creates an I/O error.
    pub fn io(msg: impl std::fmt::Display) -> Self {
        Self::Io(msg.to_string())
    }
}
