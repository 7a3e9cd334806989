//! Policy engine: promotes monitor findings to policy outcomes.

use crate::monitor::{Finding, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vei_env::LogicalTime;

/// Promotes every finding with `code` to `severity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteRule {
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

impl PromoteRule {
    pub fn new(code: &str, severity: Severity) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: format!("Policy violation: {}", code),
        }
    }

    /// Parses `code:severity` (severity defaults to `warning`).
    pub fn parse(token: &str) -> Result<Self, String> {
        let (code, severity) = match token.rsplit_once(':') {
            Some((code, sev)) => (code.trim(), sev.parse::<Severity>()?),
            None => (token.trim(), Severity::Warning),
        };
        if code.is_empty() {
            return Err(format!("Empty finding code in rule '{}'", token));
        }
        Ok(Self::new(code, severity))
    }

    fn apply(&self, finding: &Finding) -> Option<PolicyFinding> {
        if finding.code != self.code {
            return None;
        }
        Some(PolicyFinding {
            code: self.code.clone(),
            message: self.message.clone(),
            severity: self.severity,
            time_ms: finding.time_ms,
            tool: finding.tool.clone(),
            metadata: finding.metadata.clone(),
        })
    }
}

/// A promoted finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyFinding {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub time_ms: LogicalTime,
    pub tool: Option<String>,
    pub metadata: Value,
}

/// Built-in promotions.
pub fn default_rules() -> Vec<PromoteRule> {
    vec![
        PromoteRule::new("slack.approval_missing_amount", Severity::Warning),
        PromoteRule::new("mail.outbound_volume", Severity::Info),
        PromoteRule::new("erp.invoice_over_po", Severity::Warning),
        PromoteRule::new("erp.payment_without_match", Severity::Warning),
        PromoteRule::new("pii.leak", Severity::Error),
        PromoteRule::new("monitor.error", Severity::Error),
    ]
}

/// Ordered rule list evaluated against each finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEngine {
    rules: Vec<PromoteRule>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl PolicyEngine {
    pub fn new(rules: Vec<PromoteRule>) -> Self {
        Self { rules }
    }

    /// Default rules with `code:severity` overrides applied.
    ///
    /// An override replaces the rule for the same code or appends a new one.
    pub fn with_overrides(overrides: &[String]) -> Result<Self, String> {
        let mut engine = Self::default();
        for token in overrides {
            let rule = PromoteRule::parse(token)?;
            match engine.rules.iter_mut().find(|r| r.code == rule.code) {
                Some(existing) => *existing = rule,
                None => engine.rules.push(rule),
            }
        }
        Ok(engine)
    }

    pub fn rules(&self) -> &[PromoteRule] {
        &self.rules
    }

    /// Promotes findings in order; unmatched findings produce nothing.
    pub fn evaluate(&self, findings: &[Finding]) -> Vec<PolicyFinding> {
        findings
            .iter()
            .flat_map(|f| self.rules.iter().filter_map(move |r| r.apply(f)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finding(code: &str) -> Finding {
        Finding {
            monitor: "tool_aware".into(),
            code: code.into(),
            message: "m".into(),
            severity: Severity::Info,
            time_ms: 7,
            tool: Some("slack.send_message".into()),
            metadata: json!({"k": 1}),
        }
    }

    #[test]
    fn test_default_promotion() {
        let engine = PolicyEngine::default();
        let out = engine.evaluate(&[finding("slack.approval_missing_amount"), finding("usage.repetition")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Warning);
        assert_eq!(out[0].time_ms, 7);
        assert_eq!(out[0].metadata["k"], 1);
    }

    #[test]
    fn test_overrides() {
        let engine = PolicyEngine::with_overrides(&[
            "slack.approval_missing_amount:error".to_string(),
            "usage.repetition".to_string(),
        ])
        .unwrap();
        let out = engine.evaluate(&[finding("slack.approval_missing_amount"), finding("usage.repetition")]);
        assert_eq!(out[0].severity, Severity::Error);
        assert_eq!(out[1].severity, Severity::Warning);
    }

    #[test]
    fn test_bad_override() {
        assert!(PolicyEngine::with_overrides(&["pii.leak:catastrophic".to_string()]).is_err());
        assert!(PromoteRule::parse(":error").is_err());
    }
}
