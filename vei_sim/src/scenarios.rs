//! Scripted scenarios for deterministic replay testing.
//!
//! Each scenario is a world plus a fixed action script. Agents are not
//! involved: the script stands in for one, so two runs under the same
//! seed must produce byte-identical traces.

use crate::drift::DriftMode;
use crate::twins::browser::BrowserConfig;
use crate::world::WorldConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioId {
    /// Browse, ask the CFO, request a vendor quote (the seed-42042 script)
    Procurement,

    /// Five-page storefront navigation with back-tracking
    ExtendedStore,

    /// PO -> goods receipt -> invoice -> three-way match -> payment
    ErpThreeWay,

    /// CRM pipeline through HubSpot aliases, ending in a consent violation
    CrmOutreach,

    /// Identity + service desk access review
    AccessReview,

    /// Aggressive background drift while the agent idles
    DriftStorm,
}

/// One scripted action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// A tool call through `Router::call`
    Call { tool: String, args: Value },
    /// `Router::tick`
    Tick { dt_ms: u64 },
    /// `Router::observe`
    Observe { focus: Option<String> },
}

impl Step {
    pub fn call(tool: &str, args: Value) -> Self {
        Step::Call {
            tool: tool.to_string(),
            args,
        }
    }

    pub fn tick(dt_ms: u64) -> Self {
        Step::Tick { dt_ms }
    }

    pub fn observe(focus: Option<&str>) -> Self {
        Step::Observe {
            focus: focus.map(str::to_string),
        }
    }

    /// Short label used in logs and step records.
    pub fn label(&self) -> String {
        match self {
            Step::Call { tool, .. } => tool.clone(),
            Step::Tick { dt_ms } => format!("tick({})", dt_ms),
            Step::Observe { focus } => format!("observe({})", focus.as_deref().unwrap_or("-")),
        }
    }
}

fn laptop_lines() -> Value {
    json!([{ "item_id": "MBP16", "desc": "MacroBook Pro 16", "qty": 2, "unit_price": 3199 }])
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Procurement,
            ScenarioId::ExtendedStore,
            ScenarioId::ErpThreeWay,
            ScenarioId::CrmOutreach,
            ScenarioId::AccessReview,
            ScenarioId::DriftStorm,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Procurement => "procurement",
            ScenarioId::ExtendedStore => "extended-store",
            ScenarioId::ErpThreeWay => "erp-three-way",
            ScenarioId::CrmOutreach => "crm-outreach",
            ScenarioId::AccessReview => "access-review",
            ScenarioId::DriftStorm => "drift-storm",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Procurement => "Browse the product page, ask the CFO for approval, request a vendor quote",
            ScenarioId::ExtendedStore => "Navigate category -> product -> specs and back on the extended storefront",
            ScenarioId::ErpThreeWay => "Procure-to-pay through Xero aliases with a clean three-way match",
            ScenarioId::CrmOutreach => "HubSpot pipeline; outreach to a do-not-contact lead is refused",
            ScenarioId::AccessReview => "Approve REQ-8801: reactivate the user, grant the group, close the request",
            ScenarioId::DriftStorm => "Ten minutes of aggressive newsletter, ping and alert drift",
        }
    }

    /// The world this scenario runs in.
    pub fn world(&self) -> WorldConfig {
        let base = WorldConfig {
            name: self.name().to_string(),
            ..WorldConfig::default()
        };
        match self {
            ScenarioId::Procurement => base.with_connectors(&["browser", "slack", "mail"]),
            ScenarioId::ExtendedStore => WorldConfig {
                browser: BrowserConfig::extended_store(),
                goal_terms: vec!["macrobook".to_string(), "laptops".to_string()],
                ..base
            }
            .with_connectors(&["browser", "slack"]),
            ScenarioId::ErpThreeWay => WorldConfig {
                alias_packs: vec!["xero".to_string()],
                ..base
            }
            .with_connectors(&["erp", "slack"]),
            ScenarioId::CrmOutreach => {
                let mut world = WorldConfig {
                    alias_packs: vec!["hubspot".to_string()],
                    ..base
                }
                .with_connectors(&["crm", "mail"]);
                world.error_rates.insert("crm".to_string(), 1.0);
                world
            }
            ScenarioId::AccessReview => base
                .with_connectors(&["okta", "servicedesk", "docs", "slack"])
                .with_derail(
                    "slack",
                    json!({ "channel": "#procurement", "text": "Can someone approve my lunch order?", "user": "sam" }),
                    2_000,
                ),
            ScenarioId::DriftStorm => base.with_connectors(&["slack", "mail"]).with_drift(DriftMode::Aggressive),
        }
    }

    /// The fixed action sequence.
    pub fn script(&self) -> Vec<Step> {
        match self {
            ScenarioId::Procurement => vec![
                Step::call("browser.open", json!({ "url": "home" })),
                Step::call("browser.click", json!({ "node_id": "CLICK:open_pdp#0" })),
                Step::call("browser.read", json!({})),
                Step::call(
                    "slack.send_message",
                    json!({ "channel": "#procurement", "text": "Approve MacroBook Pro 16 purchase for $3200?" }),
                ),
                Step::call(
                    "mail.compose",
                    json!({
                        "to": "sales@vendor.example",
                        "subj": "Quote request",
                        "body_text": "Please quote 1x MacroBook Pro 16 with delivery ETA.",
                    }),
                ),
                Step::tick(15_000),
                Step::call("mail.list", json!({})),
            ],
            ScenarioId::ExtendedStore => vec![
                Step::call("browser.open", json!({ "url": "home" })),
                Step::call("browser.find", json!({ "query": "laptops" })),
                Step::call("browser.click", json!({ "node_id": "CLICK:open_category#0" })),
                Step::call("browser.click", json!({ "node_id": "CLICK:open_pdp1#0" })),
                Step::call("browser.read", json!({})),
                Step::call("browser.click", json!({ "node_id": "CLICK:open_specs1#0" })),
                Step::call("browser.read", json!({})),
                Step::call("browser.back", json!({})),
                Step::call("browser.back", json!({})),
                Step::call(
                    "slack.send_message",
                    json!({ "channel": "#procurement", "text": "Summary: MacroBook Pro 16, 32GB RAM, $3199." }),
                ),
                Step::tick(12_000),
                Step::call("slack.open_channel", json!({ "channel": "#procurement" })),
            ],
            ScenarioId::ErpThreeWay => vec![
                Step::call(
                    "xero.create_purchase_order",
                    json!({ "vendor": "MacroCompute", "currency": "USD", "lines": laptop_lines() }),
                ),
                Step::call(
                    "erp.receive_goods",
                    json!({ "po_id": "PO-1", "lines": [{ "item_id": "MBP16", "qty": 2 }] }),
                ),
                Step::call(
                    "xero.create_invoice",
                    json!({ "vendor": "MacroCompute", "po_id": "PO-1", "lines": laptop_lines() }),
                ),
                Step::call(
                    "erp.match_three_way",
                    json!({ "po_id": "PO-1", "invoice_id": "INV-1", "receipt_id": "RCPT-1" }),
                ),
                Step::call("xero.post_payment", json!({ "invoice_id": "INV-1", "amount": 6398 })),
                Step::call("xero.get_invoice", json!({ "id": "INV-1" })),
            ],
            ScenarioId::CrmOutreach => vec![
                Step::call("hubspot.companies.create", json!({ "name": "Acme Labs", "domain": "acme.example" })),
                Step::call("hubspot.contacts.create", json!({ "email": "amy@acme.example", "first_name": "Amy" })),
                Step::call(
                    "hubspot.contacts.create",
                    json!({ "email": "legal@acme.example", "do_not_contact": true }),
                ),
                Step::call(
                    "hubspot.associations.contact_company",
                    json!({ "contact_id": "C-1", "company_id": "CO-1" }),
                ),
                Step::call(
                    "hubspot.deals.create",
                    json!({ "name": "MacroBook fleet", "amount": 6398, "contact_id": "C-1", "company_id": "CO-1" }),
                ),
                Step::call("hubspot.deals.update_stage", json!({ "id": "D-1", "stage": "Negotiation" })),
                Step::call(
                    "hubspot.activities.log",
                    json!({ "kind": "email_outreach", "contact_id": "C-1", "note": "Sent fleet quote" }),
                ),
                Step::call(
                    "crm.log_activity",
                    json!({ "kind": "email_outreach", "contact_id": "C-2", "note": "Cold follow-up" }),
                ),
            ],
            ScenarioId::AccessReview => vec![
                Step::call("servicedesk.get_request", json!({ "request_id": "REQ-8801" })),
                Step::call("docs.search", json!({ "query": "procurement" })),
                Step::call("okta.get_user", json!({ "user_id": "USR-9002" })),
                Step::call("okta.activate_user", json!({ "user_id": "USR-9002" })),
                Step::call("okta.assign_group", json!({ "user_id": "USR-9002", "group_id": "GRP-security" })),
                Step::call(
                    "servicedesk.update_request",
                    json!({
                        "request_id": "REQ-8801",
                        "approval_stage": "security",
                        "approval_status": "APPROVED",
                        "status": "APPROVED",
                        "comment": "Security approval granted; user reactivated.",
                    }),
                ),
                Step::call(
                    "slack.send_message",
                    json!({ "channel": "#procurement", "text": "REQ-8801 access review complete." }),
                ),
                Step::observe(Some("slack")),
            ],
            ScenarioId::DriftStorm => vec![
                Step::call("slack.open_channel", json!({ "channel": "#procurement" })),
                Step::tick(120_000),
                Step::observe(Some("mail")),
                Step::call("mail.list", json!({})),
                Step::tick(480_000),
                Step::call("slack.open_channel", json!({ "channel": "#procurement" })),
            ],
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "procurement" | "macrocompute" => Ok(ScenarioId::Procurement),
            "extended-store" | "store" => Ok(ScenarioId::ExtendedStore),
            "erp-three-way" | "erp" | "three-way" => Ok(ScenarioId::ErpThreeWay),
            "crm-outreach" | "crm" => Ok(ScenarioId::CrmOutreach),
            "access-review" | "access" => Ok(ScenarioId::AccessReview),
            "drift-storm" | "drift" => Ok(ScenarioId::DriftStorm),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("ERP_THREE_WAY".parse::<ScenarioId>().unwrap(), ScenarioId::ErpThreeWay);
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_every_world_compiles() {
        for scenario in ScenarioId::all() {
            let world = scenario.world();
            assert_eq!(world.name, scenario.name());
            assert!(world.providers().is_ok(), "{} world invalid", scenario);
        }
    }

    #[test]
    fn test_scripts_target_enabled_connectors() {
        for scenario in ScenarioId::all() {
            let world = scenario.world();
            for step in scenario.script() {
                if let Step::Call { tool, .. } = step {
                    let prefix = tool.split('.').next().unwrap_or_default();
                    let known = world.is_enabled(prefix) || world.alias_packs.iter().any(|p| p == prefix);
                    assert!(known, "{} calls {} outside its world", scenario, tool);
                }
            }
        }
    }

    #[test]
    fn test_step_serde_shape() {
        let step = Step::tick(15_000);
        assert_eq!(serde_json::to_value(&step).unwrap(), json!({ "kind": "tick", "dt_ms": 15000 }));
        assert_eq!(Step::observe(None).label(), "observe(-)");
    }
}
