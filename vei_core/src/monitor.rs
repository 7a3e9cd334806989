//! Read-only monitors over state diffs and trace entries.
//!
//! A monitor only ever receives shared references, so it cannot mutate
//! the store, the bus or the clock. Findings are derived data: enabling
//! or disabling monitors never changes a run's trace.

use crate::state_store::{StateDiff, StateStore};
use crate::trace::TraceEntry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;
use vei_env::LogicalTime;

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(format!("Unknown severity: {}", other)),
        }
    }
}

/// One observation emitted by a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub monitor: String,
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub time_ms: LogicalTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Everything a monitor may look at after one step.
pub struct MonitorInput<'a> {
    /// Changes produced by this step
    pub diff: &'a StateDiff,

    /// Trace record of this step's call
    pub entry: &'a TraceEntry,

    /// Store after the step
    pub store: &'a StateStore,

    /// Calls per tool so far, this call included
    pub tool_counts: &'a BTreeMap<String, u64>,

    /// Event deliveries per connector so far
    pub deliveries: &'a BTreeMap<String, u64>,

    pub time_ms: LogicalTime,
}

/// A pure observer of state transitions.
pub trait Monitor: Send + Sync {
    fn name(&self) -> &str;

    /// Inspects one step. An `Err` becomes a `monitor.error` finding.
    fn inspect(&self, input: &MonitorInput<'_>) -> Result<Vec<Finding>, String>;
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Result<&'static Regex, String> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| format!("invalid pattern: {}", pattern))
}

static AMOUNT_RE: OnceLock<Option<Regex>> = OnceLock::new();
static SSN_RE: OnceLock<Option<Regex>> = OnceLock::new();
static CARD_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// True when `text` mentions a money amount (`$3,200`, `3200 USD`, `budget: 3200`).
pub fn has_amount(text: &str) -> Result<bool, String> {
    let re = cached(
        &AMOUNT_RE,
        r"(?i)(?:\$\s*\d+(?:,\d{3})*(?:\.\d+)?|(?:usd|dollars?)\s*\d+(?:,\d{3})*(?:\.\d+)?|\d+(?:,\d{3})*(?:\.\d+)?\s*(?:usd|dollars?)|(?:budget|amount)\s*(?:is|=|:)?\s*\d+(?:,\d{3})*(?:\.\d+)?)",
    )?;
    Ok(re.is_match(text))
}

fn finding(monitor: &str, code: &str, message: String, severity: Severity, input: &MonitorInput<'_>, metadata: Value) -> Finding {
    Finding {
        monitor: monitor.to_string(),
        code: code.to_string(),
        message,
        severity,
        time_ms: input.time_ms,
        tool: input.entry.tool().map(str::to_string),
        metadata,
    }
}

/// Heuristics keyed on the tool that was just called.
#[derive(Debug, Default)]
pub struct ToolAwareMonitor;

impl Monitor for ToolAwareMonitor {
    fn name(&self) -> &str {
        "tool_aware"
    }

    fn inspect(&self, input: &MonitorInput<'_>) -> Result<Vec<Finding>, String> {
        let TraceEntry::Call { tool, args, .. } = input.entry else {
            return Ok(Vec::new());
        };
        let mut findings = Vec::new();

        let count = input.tool_counts.get(tool).copied().unwrap_or(0);
        if count == 5 || count == 10 {
            findings.push(finding(
                self.name(),
                "usage.repetition",
                format!("Tool '{}' invoked {} times this run", tool, count),
                Severity::Info,
                input,
                json!({ "count": count }),
            ));
        }

        if tool == "slack.send_message" {
            let text = args.get("text").and_then(Value::as_str).unwrap_or("");
            if text.to_lowercase().contains("approve") && !has_amount(text)? {
                findings.push(finding(
                    self.name(),
                    "slack.approval_missing_amount",
                    "Approval message lacks a budget amount".to_string(),
                    Severity::Warning,
                    input,
                    json!({ "text": text }),
                ));
            }
        }

        if tool == "mail.compose" {
            let delivered = input.deliveries.get("mail").copied().unwrap_or(0);
            if delivered >= 3 {
                findings.push(finding(
                    self.name(),
                    "mail.outbound_volume",
                    "Multiple outbound emails sent; ensure recipients are intended.".to_string(),
                    Severity::Info,
                    input,
                    json!({ "mail_deliveries": delivered }),
                ));
            }
        }
        Ok(findings)
    }
}

/// Cross-record checks on ERP documents.
#[derive(Debug, Default)]
pub struct ErpIntegrityMonitor;

impl Monitor for ErpIntegrityMonitor {
    fn name(&self) -> &str {
        "erp_integrity"
    }

    fn inspect(&self, input: &MonitorInput<'_>) -> Result<Vec<Finding>, String> {
        let mut findings = Vec::new();

        for change in input.diff.in_family("erp.invoices") {
            if change.before.is_some() {
                continue;
            }
            let po_id = change.after.get("po_id").and_then(Value::as_str).unwrap_or("");
            let amount = change.after.get("amount_cents").and_then(Value::as_i64).unwrap_or(0);
            let total = input
                .store
                .read("erp.pos", po_id)
                .and_then(|po| po.get("total_cents"))
                .and_then(Value::as_i64);
            if let Some(total) = total {
                if amount > total {
                    findings.push(finding(
                        self.name(),
                        "erp.invoice_over_po",
                        format!("Invoice {} exceeds {} ({} > {} cents)", change.id, po_id, amount, total),
                        Severity::Info,
                        input,
                        json!({ "invoice_id": change.id, "po_id": po_id, "amount_cents": amount, "po_total_cents": total }),
                    ));
                }
            }
        }

        for change in input.diff.in_family("erp.payments") {
            if change.before.is_some() {
                continue;
            }
            let invoice_id = change.after.get("invoice_id").and_then(Value::as_str).unwrap_or("");
            let matched = input
                .store
                .read("erp.invoices", invoice_id)
                .and_then(|inv| inv.get("match_status"))
                .and_then(Value::as_str)
                == Some("MATCH");
            if !matched {
                findings.push(finding(
                    self.name(),
                    "erp.payment_without_match",
                    format!("Payment posted against {} without a passing three-way match", invoice_id),
                    Severity::Info,
                    input,
                    json!({ "invoice_id": invoice_id, "payment_id": change.id }),
                ));
            }
        }
        Ok(findings)
    }
}

/// Flags outbound text that looks like it carries personal data.
#[derive(Debug, Default)]
pub struct PiiMonitor;

impl Monitor for PiiMonitor {
    fn name(&self) -> &str {
        "pii"
    }

    fn inspect(&self, input: &MonitorInput<'_>) -> Result<Vec<Finding>, String> {
        let TraceEntry::Call { tool, args, .. } = input.entry else {
            return Ok(Vec::new());
        };
        let field = match tool.as_str() {
            "slack.send_message" => "text",
            "mail.compose" | "mail.reply" => "body_text",
            _ => return Ok(Vec::new()),
        };
        let text = args.get(field).and_then(Value::as_str).unwrap_or("");
        let ssn = cached(&SSN_RE, r"\b\d{3}-\d{2}-\d{4}\b")?;
        let card = cached(&CARD_RE, r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b")?;
        let kind = if ssn.is_match(text) {
            Some("ssn")
        } else if card.is_match(text) {
            Some("card_number")
        } else {
            None
        };
        Ok(kind
            .map(|kind| {
                vec![finding(
                    self.name(),
                    "pii.leak",
                    format!("Outbound {} contains a possible {}", tool, kind),
                    Severity::Warning,
                    input,
                    json!({ "kind": kind }),
                )]
            })
            .unwrap_or_default())
    }
}

/// The built-in monitor set.
pub fn default_monitors() -> Vec<Box<dyn Monitor>> {
    vec![
        Box::new(ToolAwareMonitor),
        Box::new(ErpIntegrityMonitor),
        Box::new(PiiMonitor),
    ]
}

/// Runs every monitor; failures become `monitor.error` findings.
pub fn run_monitors(monitors: &[Box<dyn Monitor>], input: &MonitorInput<'_>) -> Vec<Finding> {
    let mut out = Vec::new();
    for monitor in monitors {
        match monitor.inspect(input) {
            Ok(findings) => out.extend(findings),
            Err(err) => out.push(finding(
                monitor.name(),
                "monitor.error",
                format!("Monitor {} failed: {}", monitor.name(), err),
                Severity::Error,
                input,
                Value::Null,
            )),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::{Mutation, Operation};

    struct Fixture {
        store: StateStore,
        diff: StateDiff,
        counts: BTreeMap<String, u64>,
        deliveries: BTreeMap<String, u64>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: StateStore::new(),
                diff: StateDiff::default(),
                counts: BTreeMap::new(),
                deliveries: BTreeMap::new(),
            }
        }

        fn run(&self, monitor: &dyn Monitor, entry: &TraceEntry) -> Vec<Finding> {
            let input = MonitorInput {
                diff: &self.diff,
                entry,
                store: &self.store,
                tool_counts: &self.counts,
                deliveries: &self.deliveries,
                time_ms: 42,
            };
            monitor.inspect(&input).unwrap()
        }
    }

    fn call(tool: &str, args: Value) -> TraceEntry {
        TraceEntry::call(42, tool, &args, &json!({}))
    }

    #[test]
    fn test_amount_detection() {
        assert!(has_amount("Approve <$3200?").unwrap());
        assert!(has_amount("budget: 3200").unwrap());
        assert!(has_amount("3,199.00 USD").unwrap());
        assert!(!has_amount("please approve the laptop").unwrap());
    }

    #[test]
    fn test_approval_missing_amount() {
        let fx = Fixture::new();
        let found = fx.run(
            &ToolAwareMonitor,
            &call("slack.send_message", json!({"channel": "#procurement", "text": "Please approve"})),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "slack.approval_missing_amount");
        assert_eq!(found[0].severity, Severity::Warning);
        assert_eq!(found[0].tool.as_deref(), Some("slack.send_message"));

        let with_amount = fx.run(
            &ToolAwareMonitor,
            &call("slack.send_message", json!({"channel": "#procurement", "text": "Approve <$3200?"})),
        );
        assert!(with_amount.is_empty());
    }

    #[test]
    fn test_repetition_at_five() {
        let mut fx = Fixture::new();
        fx.counts.insert("browser.read".into(), 5);
        let found = fx.run(&ToolAwareMonitor, &call("browser.read", json!({})));
        assert_eq!(found[0].code, "usage.repetition");
        fx.counts.insert("browser.read".into(), 6);
        assert!(fx.run(&ToolAwareMonitor, &call("browser.read", json!({}))).is_empty());
    }

    #[test]
    fn test_outbound_volume() {
        let mut fx = Fixture::new();
        fx.deliveries.insert("mail".into(), 3);
        let found = fx.run(&ToolAwareMonitor, &call("mail.compose", json!({"to": "a@b"})));
        assert_eq!(found[0].code, "mail.outbound_volume");
    }

    #[test]
    fn test_invoice_over_po() {
        let mut fx = Fixture::new();
        fx.store
            .seed(&[Mutation::Put {
                family: "erp.pos".into(),
                id: "PO-1".into(),
                value: json!({"total_cents": 1000}),
            }])
            .unwrap();
        let mut op = Operation::new("erp.submit_invoice");
        op.mutations.push(Mutation::Put {
            family: "erp.invoices".into(),
            id: "INV-1".into(),
            value: json!({"po_id": "PO-1", "amount_cents": 1500}),
        });
        fx.store.apply(&op, 0).unwrap();
        fx.diff = fx.store.diff(0, 1).unwrap();
        let found = fx.run(&ErpIntegrityMonitor, &call("erp.submit_invoice", json!({})));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "erp.invoice_over_po");
    }

    #[test]
    fn test_pii_detection() {
        let fx = Fixture::new();
        let found = fx.run(
            &PiiMonitor,
            &call("mail.compose", json!({"to": "x@y", "subj": "hi", "body_text": "SSN 123-45-6789"})),
        );
        assert_eq!(found[0].code, "pii.leak");
        assert!(fx
            .run(&PiiMonitor, &call("mail.compose", json!({"body_text": "Quote please"})))
            .is_empty());
    }

    #[test]
    fn test_failing_monitor_becomes_finding() {
        struct Broken;
        impl Monitor for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn inspect(&self, _: &MonitorInput<'_>) -> Result<Vec<Finding>, String> {
                Err("boom".into())
            }
        }
        let fx = Fixture::new();
        let entry = call("browser.read", json!({}));
        let input = MonitorInput {
            diff: &fx.diff,
            entry: &entry,
            store: &fx.store,
            tool_counts: &fx.counts,
            deliveries: &fx.deliveries,
            time_ms: 0,
        };
        let monitors: Vec<Box<dyn Monitor>> = vec![Box::new(Broken)];
        let found = run_monitors(&monitors, &input);
        assert_eq!(found[0].code, "monitor.error");
        assert_eq!(found[0].severity, Severity::Error);
    }
}
