//! Kernel error taxonomy.
//!
//! Everything except `StateInvariantViolation` (and `Halted`, which
//! repeats it) is recoverable: the router renders it as a structured
//! `{error: {code, message}}` response and the session continues.

use crate::state_store::Receipt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use vei_env::{EnvError, LogicalTime};

/// Domain-level failure reported by a connector twin.
///
/// Codes are stable strings (`validation_error`, `unknown_po`,
/// `okta.user_not_found`, ...) and form part of the trace.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ConnectorError {
    pub code: String,
    pub message: String,
}

impl ConnectorError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Shorthand for argument problems detected inside a handler.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new("invalid_args", message)
    }

    /// The call names something that is not a legal action right now
    /// (a missing affordance, say). Surfaces as `KernelError::InvalidAction`.
    pub fn invalid_action(message: impl Into<String>) -> Self {
        Self::new(INVALID_ACTION, message)
    }

    pub fn is_invalid_action(&self) -> bool {
        self.code == INVALID_ACTION
    }
}

const INVALID_ACTION: &str = "invalid_action";

/// Failures of an atomic state-store apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A required or mutated entity does not exist
    #[error("Missing entity {family}/{id}")]
    MissingEntity { family: String, id: String },

    /// A merge or push targeted a non-object entity
    #[error("Entity {family}/{id} is not an object")]
    NotAnObject { family: String, id: String },

    /// A push targeted a field that is not an array
    #[error("Field '{field}' of {family}/{id} is not an array")]
    NotAnArray {
        family: String,
        id: String,
        field: String,
    },

    /// Initial entities can only be installed before the first apply
    #[error("Cannot seed store at revision {0}")]
    SeedAfterApply(u64),
}

/// Diagnostic context captured when a kernel invariant breaks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvariantReport {
    pub message: String,
    pub revision: u64,
    pub time_ms: LogicalTime,
    pub recent_receipts: Vec<Receipt>,
}

impl std::fmt::Display for InvariantReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (revision={}, time_ms={}, receipts={})",
            self.message,
            self.revision,
            self.time_ms,
            self.recent_receipts.len()
        )
    }
}

/// Errors surfaced by the router and its components.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    /// Tool name not present in the registry
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Schema failure or out-of-menu selection
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Business-rule failure inside a connector twin
    #[error("Connector error: {0}")]
    Connector(ConnectorError),

    /// Replay cursor has no record matching the call
    #[error("Replay mismatch at cursor {cursor} for {tool}: {detail}")]
    ReplayMismatch {
        tool: String,
        cursor: usize,
        detail: String,
    },

    /// Malformed kernel argument (negative delay, negative tick, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation could not be applied atomically
    #[error("State conflict: {0}")]
    Store(#[from] StoreError),

    /// Snapshot or diff requested past the current head
    #[error("Revision {requested} is beyond head {head}")]
    RevisionOutOfRange { requested: u64, head: u64 },

    /// The receipt archive failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Kernel bug: the run must stop
    #[error("State invariant violation: {0}")]
    StateInvariantViolation(Box<InvariantReport>),

    /// The session already stopped on an invariant violation
    #[error("Session halted: {0}")]
    Halted(Box<InvariantReport>),
}

impl KernelError {
    /// Creates an invalid-action error.
    pub fn invalid_action(msg: impl Into<String>) -> Self {
        Self::InvalidAction(msg.into())
    }

    /// Creates an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Stable wire code of this error.
    pub fn code(&self) -> &str {
        match self {
            KernelError::UnknownTool(_) => "unknown_tool",
            KernelError::InvalidAction(_) => INVALID_ACTION,
            KernelError::Connector(err) => &err.code,
            KernelError::ReplayMismatch { .. } => "replay_mismatch",
            KernelError::InvalidArgument(_) => "invalid_argument",
            KernelError::Store(_) => "state_conflict",
            KernelError::RevisionOutOfRange { .. } => "revision_out_of_range",
            KernelError::Persistence(_) => "persistence_error",
            KernelError::StateInvariantViolation(_) => "state_invariant_violation",
            KernelError::Halted(_) => "halted",
        }
    }

    /// Human-readable message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            KernelError::UnknownTool(tool) => tool.clone(),
            KernelError::InvalidAction(msg) | KernelError::InvalidArgument(msg) => msg.clone(),
            KernelError::Connector(err) => err.message.clone(),
            other => other.to_string(),
        }
    }

    /// True when the run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::StateInvariantViolation(_) | KernelError::Halted(_)
        )
    }

    /// Renders the `{error: {code, message}}` wire object.
    pub fn to_response(&self) -> Value {
        json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        })
    }
}

impl From<ConnectorError> for KernelError {
    fn from(err: ConnectorError) -> Self {
        if err.is_invalid_action() {
            KernelError::InvalidAction(err.message)
        } else {
            KernelError::Connector(err)
        }
    }
}

impl From<EnvError> for KernelError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::InvalidArgument(msg) => KernelError::InvalidArgument(msg),
            other => KernelError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(KernelError::UnknownTool("x.y".into()).code(), "unknown_tool");
        assert_eq!(KernelError::invalid_action("nope").code(), "invalid_action");
        assert_eq!(
            KernelError::from(ConnectorError::new("unknown_po", "PO-9")).code(),
            "unknown_po"
        );
        assert_eq!(KernelError::invalid_argument("dt").code(), "invalid_argument");
    }

    #[test]
    fn test_connector_invalid_action_maps_to_kernel_variant() {
        let err = KernelError::from(ConnectorError::invalid_action("No affordance X on home"));
        assert!(matches!(err, KernelError::InvalidAction(ref msg) if msg == "No affordance X on home"));
        assert_eq!(err.code(), "invalid_action");
        assert!(matches!(
            KernelError::from(ConnectorError::new("unknown_po", "PO-9")),
            KernelError::Connector(_)
        ));
    }

    #[test]
    fn test_response_shape() {
        let resp = KernelError::invalid_action("alias missing").to_response();
        assert_eq!(resp["error"]["code"], "invalid_action");
        assert_eq!(resp["error"]["message"], "alias missing");
    }

    #[test]
    fn test_only_invariant_violations_are_fatal() {
        let report = Box::new(InvariantReport {
            message: "orphan".into(),
            revision: 3,
            time_ms: 10,
            recent_receipts: vec![],
        });
        assert!(KernelError::StateInvariantViolation(report.clone()).is_fatal());
        assert!(KernelError::Halted(report).is_fatal());
        assert!(!KernelError::invalid_action("x").is_fatal());
        assert!(!KernelError::ReplayMismatch {
            tool: "mail.list".into(),
            cursor: 0,
            detail: "sig".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_env_error_maps_to_invalid_argument() {
        let err: KernelError = EnvError::invalid_argument("dt_ms must be >= 0").into();
        assert_eq!(err.code(), "invalid_argument");
    }
}
