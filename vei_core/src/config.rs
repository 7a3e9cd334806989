//! Kernel configuration.
//!
//! Everything that can change a run's output lives here (or in the
//! providers' own configuration), so "same config + same seed" fully
//! determines a run.

use crate::tool_registry::LatencyProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use vei_env::{Seed, DEFAULT_SEED};

/// How calls to a connector are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorMode {
    /// Deterministic simulation against the twin
    #[default]
    Sim,
    /// Recorded responses from a replay bundle
    Replay,
    /// Best-effort live backend (outside the determinism contract)
    Live,
}

impl FromStr for ConnectorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sim" => Ok(ConnectorMode::Sim),
            "replay" => Ok(ConnectorMode::Replay),
            "live" => Ok(ConnectorMode::Live),
            other => Err(format!("Unknown connector mode: {}", other)),
        }
    }
}

/// How many due events a dispatch step delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// At most this many events per step
    Bounded(usize),
    /// Every due event
    All,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        DrainPolicy::Bounded(1)
    }
}

impl DrainPolicy {
    pub fn limit(&self) -> Option<usize> {
        match self {
            DrainPolicy::Bounded(n) => Some(*n),
            DrainPolicy::All => None,
        }
    }
}

/// Fault injection parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultProfile {
    /// Per-connector rate of seeded business errors inside the twin
    #[serde(default)]
    pub error_rates: BTreeMap<String, f64>,

    /// Per-tool probability of failing with `fault.injected`
    #[serde(default)]
    pub tool_overrides: BTreeMap<String, f64>,

    /// Latency used by tools without their own profile
    #[serde(default)]
    pub latency: LatencyProfile,
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub seed: Seed,

    /// Per-connector execution mode (absent = sim)
    pub modes: BTreeMap<String, ConnectorMode>,

    pub drain_policy: DrainPolicy,

    /// Time advanced by `observe`
    pub observe_advance_ms: u64,

    /// Reject calls not reachable from the action menu
    pub menu_restricted: bool,

    /// Terms used to rank concrete affordances
    pub goal_terms: Vec<String>,

    pub faults: FaultProfile,

    /// `code:severity` policy overrides
    pub policy_overrides: Vec<String>,

    /// Receipts attached to invariant-violation reports
    pub receipt_tail: usize,

    /// Focus before the first call
    pub initial_focus: String,

    /// Capture a replay bundle while running
    pub record: bool,

    /// Receipt/snapshot archive directory
    pub state_dir: Option<PathBuf>,

    /// JSONL trace file
    pub trace_path: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            modes: BTreeMap::new(),
            drain_policy: DrainPolicy::default(),
            observe_advance_ms: 1000,
            menu_restricted: false,
            goal_terms: Vec::new(),
            faults: FaultProfile::default(),
            policy_overrides: Vec::new(),
            receipt_tail: 10,
            initial_focus: "browser".to_string(),
            record: false,
            state_dir: None,
            trace_path: None,
        }
    }
}

impl RouterConfig {
    pub fn new(seed: Seed) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, connector: &str, mode: ConnectorMode) -> Self {
        self.modes.insert(connector.to_string(), mode);
        self
    }

    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn with_menu_restricted(mut self, restricted: bool) -> Self {
        self.menu_restricted = restricted;
        self
    }

    pub fn with_goal_terms(mut self, terms: &[&str]) -> Self {
        self.goal_terms = terms.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_fault(mut self, tool: &str, rate: f64) -> Self {
        self.faults.tool_overrides.insert(tool.to_string(), rate);
        self
    }

    pub fn with_error_rate(mut self, connector: &str, rate: f64) -> Self {
        self.faults.error_rates.insert(connector.to_string(), rate);
        self
    }

    pub fn with_recording(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn with_trace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_path = Some(path.into());
        self
    }

    pub fn with_state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(path.into());
        self
    }

    pub fn mode_for(&self, connector: &str) -> ConnectorMode {
        self.modes.get(connector).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.seed, 42042);
        assert_eq!(cfg.drain_policy.limit(), Some(1));
        assert_eq!(cfg.mode_for("mail"), ConnectorMode::Sim);
        assert_eq!(cfg.faults.latency.base_ms, 1000);
    }

    #[test]
    fn test_builders_and_modes() {
        let cfg = RouterConfig::new(7)
            .with_mode("mail", ConnectorMode::Replay)
            .with_drain_policy(DrainPolicy::All)
            .with_fault("erp.submit_invoice", 0.5);
        assert_eq!(cfg.mode_for("mail"), ConnectorMode::Replay);
        assert_eq!(cfg.drain_policy.limit(), None);
        assert_eq!(cfg.faults.tool_overrides["erp.submit_invoice"], 0.5);
        assert_eq!("LIVE".parse::<ConnectorMode>().unwrap(), ConnectorMode::Live);
        assert!("cloud".parse::<ConnectorMode>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: RouterConfig = serde_json::from_str(r#"{"seed": 5, "menu_restricted": true}"#).unwrap();
        assert_eq!(cfg.seed, 5);
        assert!(cfg.menu_restricted);
        assert_eq!(cfg.observe_advance_ms, 1000);
    }
}
