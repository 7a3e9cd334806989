//! Common types for the VEI environment layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical time in milliseconds since session start.
pub type LogicalTime = u64;

/// Master seed of a session.
pub type Seed = u64;

/// Seed used when a session is created without one.
pub const DEFAULT_SEED: Seed = 42042;

/// Stable identifier for one simulation session.
///
/// Derived from the seed so the identifier itself is reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a deterministic SessionId from a seed.
    pub fn from_seed(seed: Seed) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Returns the connector prefix of a tool name (`"mail.compose"` -> `"mail"`).
pub fn connector_of(tool: &str) -> &str {
    tool.split_once('.').map(|(prefix, _)| prefix).unwrap_or(tool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_seed_is_stable() {
        assert_eq!(SessionId::from_seed(42042), SessionId::from_seed(42042));
        assert_ne!(SessionId::from_seed(1), SessionId::from_seed(2));
    }

    #[test]
    fn test_connector_of() {
        assert_eq!(connector_of("mail.compose"), "mail");
        assert_eq!(connector_of("vei.act_and_observe"), "vei");
        assert_eq!(connector_of("bare"), "bare");
    }
}
