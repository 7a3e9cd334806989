//! Tool registry: name -> {schema, side effects, connector, latency}.
//!
//! Providers register their tools once at session construction. Vendor
//! alias packs (Xero, NetSuite, HubSpot, ...) map vendor-flavoured names
//! onto the base tools without duplicating handlers.

use crate::error::KernelError;
use crate::schema::ArgsSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use vei_env::connector_of;

/// Side-effect classification of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Reads state only
    Read,
    /// Mutates the state store
    Write,
    /// May schedule future events
    Schedule,
}

/// Logical time a call takes: `base_ms + floor(sample * (jitter_ms + 1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyProfile {
    pub base_ms: u64,
    pub jitter_ms: u64,
}

impl Default for LatencyProfile {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            jitter_ms: 0,
        }
    }
}

impl LatencyProfile {
    /// Latency for one call. `sample` is the call's fault sample; calls
    /// without one (replay, kernel tools) take the base latency.
    pub fn sample(&self, sample: Option<f64>) -> u64 {
        let jitter = match sample {
            Some(u) if self.jitter_ms > 0 => {
                ((u * (self.jitter_ms + 1) as f64) as u64).min(self.jitter_ms)
            }
            _ => 0,
        };
        self.base_ms + jitter
    }
}

/// How a tool shows up in action menus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuVisibility {
    /// Listed as a schema-only entry whenever its connector has focus
    Generic,
    /// Only reachable through concrete affordances
    Concrete,
    /// Never listed
    Hidden,
}

/// Registered description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub args: ArgsSchema,
    pub side_effects: Vec<SideEffect>,

    /// Per-tool latency; `None` uses the session default
    pub latency: Option<LatencyProfile>,

    pub menu: MenuVisibility,
}

impl ToolSpec {
    /// A read-only, hidden tool with no arguments.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            args: ArgsSchema::new(),
            side_effects: vec![SideEffect::Read],
            latency: None,
            menu: MenuVisibility::Hidden,
        }
    }

    pub fn with_args(mut self, args: ArgsSchema) -> Self {
        self.args = args;
        self
    }

    pub fn with_side_effects(mut self, effects: &[SideEffect]) -> Self {
        self.side_effects = effects.to_vec();
        self
    }

    pub fn with_latency(mut self, base_ms: u64, jitter_ms: u64) -> Self {
        self.latency = Some(LatencyProfile { base_ms, jitter_ms });
        self
    }

    /// Lists the tool as a generic menu entry.
    pub fn generic(mut self) -> Self {
        self.menu = MenuVisibility::Generic;
        self
    }

    /// Marks the tool as reachable through concrete affordances only.
    pub fn concrete(mut self) -> Self {
        self.menu = MenuVisibility::Concrete;
        self
    }

    /// Connector that owns this tool.
    pub fn connector(&self) -> &str {
        connector_of(&self.name)
    }

    pub fn is_mutating(&self) -> bool {
        self.side_effects.contains(&SideEffect::Write)
    }
}

/// Who executes a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOwner {
    /// Handled by the router itself (`vei.*`)
    Kernel,
    /// Index into the router's provider list
    Provider(usize),
}

/// A resolved lookup.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedTool<'a> {
    pub spec: &'a ToolSpec,
    pub owner: ToolOwner,
}

#[derive(Debug, Clone)]
struct Entry {
    spec: ToolSpec,
    owner: ToolOwner,
}

type AliasPack = (&'static str, &'static [(&'static str, &'static str)]);

/// Built-in vendor alias packs.
pub const ALIAS_PACKS: &[AliasPack] = &[
    (
        "xero",
        &[
            ("xero.create_purchase_order", "erp.create_po"),
            ("xero.get_purchase_order", "erp.get_po"),
            ("xero.list_purchase_orders", "erp.list_pos"),
            ("xero.create_invoice", "erp.submit_invoice"),
            ("xero.get_invoice", "erp.get_invoice"),
            ("xero.list_invoices", "erp.list_invoices"),
            ("xero.post_payment", "erp.post_payment"),
        ],
    ),
    (
        "netsuite",
        &[
            ("netsuite.po.create", "erp.create_po"),
            ("netsuite.po.get", "erp.get_po"),
            ("netsuite.po.list", "erp.list_pos"),
            ("netsuite.invoice.create", "erp.submit_invoice"),
            ("netsuite.invoice.get", "erp.get_invoice"),
            ("netsuite.invoice.list", "erp.list_invoices"),
            ("netsuite.payment.apply", "erp.post_payment"),
        ],
    ),
    (
        "dynamics",
        &[
            ("dynamics.po.create", "erp.create_po"),
            ("dynamics.po.get", "erp.get_po"),
            ("dynamics.po.list", "erp.list_pos"),
            ("dynamics.invoice.create", "erp.submit_invoice"),
            ("dynamics.invoice.get", "erp.get_invoice"),
            ("dynamics.invoice.list", "erp.list_invoices"),
            ("dynamics.payment.post", "erp.post_payment"),
        ],
    ),
    (
        "quickbooks",
        &[
            ("quickbooks.purchaseorder.create", "erp.create_po"),
            ("quickbooks.purchaseorder.get", "erp.get_po"),
            ("quickbooks.purchaseorder.list", "erp.list_pos"),
            ("quickbooks.invoice.create", "erp.submit_invoice"),
            ("quickbooks.invoice.get", "erp.get_invoice"),
            ("quickbooks.invoice.list", "erp.list_invoices"),
            ("quickbooks.payment.create", "erp.post_payment"),
        ],
    ),
    (
        "hubspot",
        &[
            ("hubspot.contacts.create", "crm.create_contact"),
            ("hubspot.contacts.get", "crm.get_contact"),
            ("hubspot.contacts.list", "crm.list_contacts"),
            ("hubspot.companies.create", "crm.create_company"),
            ("hubspot.companies.get", "crm.get_company"),
            ("hubspot.companies.list", "crm.list_companies"),
            ("hubspot.associations.contact_company", "crm.associate_contact_company"),
            ("hubspot.deals.create", "crm.create_deal"),
            ("hubspot.deals.get", "crm.get_deal"),
            ("hubspot.deals.list", "crm.list_deals"),
            ("hubspot.deals.update_stage", "crm.update_deal_stage"),
            ("hubspot.activities.log", "crm.log_activity"),
        ],
    ),
    (
        "salesforce",
        &[
            ("salesforce.contact.create", "crm.create_contact"),
            ("salesforce.contact.get", "crm.get_contact"),
            ("salesforce.contact.list", "crm.list_contacts"),
            ("salesforce.account.create", "crm.create_company"),
            ("salesforce.account.get", "crm.get_company"),
            ("salesforce.account.list", "crm.list_companies"),
            ("salesforce.contact.link_account", "crm.associate_contact_company"),
            ("salesforce.opportunity.create", "crm.create_deal"),
            ("salesforce.opportunity.get", "crm.get_deal"),
            ("salesforce.opportunity.list", "crm.list_deals"),
            ("salesforce.opportunity.update_stage", "crm.update_deal_stage"),
            ("salesforce.activity.log", "crm.log_activity"),
        ],
    ),
];

/// Typed registry keyed by tool name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Entry>,
    aliases: BTreeMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Duplicate names are rejected.
    pub fn register(&mut self, spec: ToolSpec, owner: ToolOwner) -> Result<(), KernelError> {
        if self.tools.contains_key(&spec.name) || self.aliases.contains_key(&spec.name) {
            return Err(KernelError::invalid_argument(format!(
                "tool '{}' registered twice",
                spec.name
            )));
        }
        self.tools.insert(spec.name.clone(), Entry { spec, owner });
        Ok(())
    }

    /// Registers `alias` as another name for the base tool `base`.
    pub fn register_alias(&mut self, alias: &str, base: &str) -> Result<(), KernelError> {
        if !self.tools.contains_key(base) {
            return Err(KernelError::invalid_argument(format!(
                "alias '{}' targets unknown tool '{}'",
                alias, base
            )));
        }
        if self.tools.contains_key(alias) {
            return Err(KernelError::invalid_argument(format!(
                "alias '{}' shadows a registered tool",
                alias
            )));
        }
        self.aliases.insert(alias.to_string(), base.to_string());
        Ok(())
    }

    /// Registers a built-in alias pack by name; returns the alias count.
    pub fn register_alias_pack(&mut self, pack: &str) -> Result<usize, KernelError> {
        let (_, entries) = ALIAS_PACKS
            .iter()
            .find(|(name, _)| *name == pack)
            .ok_or_else(|| KernelError::invalid_argument(format!("unknown alias pack '{}'", pack)))?;
        if let Some((_, missing)) = entries.iter().find(|(_, base)| !self.tools.contains_key(*base)) {
            return Err(KernelError::invalid_argument(format!(
                "alias pack '{}' needs tool '{}'",
                pack, missing
            )));
        }
        for (alias, base) in entries.iter() {
            self.register_alias(alias, base)?;
        }
        Ok(entries.len())
    }

    /// Resolves a tool name (following aliases).
    pub fn resolve(&self, name: &str) -> Result<ResolvedTool<'_>, KernelError> {
        let base = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.tools
            .get(base)
            .map(|entry| ResolvedTool {
                spec: &entry.spec,
                owner: entry.owner,
            })
            .ok_or_else(|| KernelError::UnknownTool(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.resolve(name).ok().map(|r| r.spec)
    }

    /// All base tools in name order.
    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values().map(|e| &e.spec)
    }

    /// Generic menu entries of one connector, in name order.
    pub fn generic_for(&self, connector: &str) -> Vec<&ToolSpec> {
        self.specs()
            .filter(|s| s.connector() == connector && s.menu == MenuVisibility::Generic)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Machine-readable catalog of base tools and aliases.
    pub fn catalog(&self) -> Value {
        let tools: Vec<Value> = self
            .specs()
            .map(|s| {
                json!({
                    "name": s.name,
                    "description": s.description,
                    "side_effects": s.side_effects,
                    "args": s.args.to_menu_value(),
                })
            })
            .collect();
        json!({ "tools": tools, "aliases": self.aliases })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ArgKind;

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        for name in [
            "erp.create_po",
            "erp.get_po",
            "erp.list_pos",
            "erp.submit_invoice",
            "erp.get_invoice",
            "erp.list_invoices",
            "erp.post_payment",
        ] {
            reg.register(ToolSpec::new(name, "erp tool"), ToolOwner::Provider(0))
                .unwrap();
        }
        reg.register(
            ToolSpec::new("slack.send_message", "post")
                .with_args(ArgsSchema::new().required("channel", ArgKind::Str))
                .generic(),
            ToolOwner::Provider(1),
        )
        .unwrap();
        reg
    }

    #[test]
    fn test_unknown_tool() {
        let reg = registry();
        let err = reg.resolve("slack.explode").unwrap_err();
        assert_eq!(err, KernelError::UnknownTool("slack.explode".into()));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut reg = registry();
        assert!(reg
            .register(ToolSpec::new("erp.get_po", "again"), ToolOwner::Provider(0))
            .is_err());
    }

    #[test]
    fn test_alias_pack_resolves_to_base() {
        let mut reg = registry();
        assert_eq!(reg.register_alias_pack("xero").unwrap(), 7);
        let resolved = reg.resolve("xero.create_purchase_order").unwrap();
        assert_eq!(resolved.spec.name, "erp.create_po");
        assert_eq!(resolved.owner, ToolOwner::Provider(0));
        assert!(reg.register_alias_pack("sap").is_err());
    }

    #[test]
    fn test_alias_pack_needs_base_tools() {
        let mut reg = registry();
        assert!(reg.register_alias_pack("hubspot").is_err());
    }

    #[test]
    fn test_generic_for_connector() {
        let reg = registry();
        let generic: Vec<&str> = reg.generic_for("slack").iter().map(|s| s.name.as_str()).collect();
        assert_eq!(generic, vec!["slack.send_message"]);
        assert!(reg.generic_for("erp").is_empty());
    }

    #[test]
    fn test_latency_sample() {
        let fixed = LatencyProfile::default();
        assert_eq!(fixed.sample(Some(0.99)), 1000);
        let jittery = LatencyProfile {
            base_ms: 100,
            jitter_ms: 50,
        };
        assert_eq!(jittery.sample(None), 100);
        assert_eq!(jittery.sample(Some(0.0)), 100);
        assert_eq!(jittery.sample(Some(0.999_999)), 150);
    }
}
