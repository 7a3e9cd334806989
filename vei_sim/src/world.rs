//! World definition: which twins run, how they are seeded, and the
//! scheduled derails that hit the agent regardless of what it does.
//!
//! A `WorldConfig` plus a `RouterConfig` fully determine a session.

use crate::drift::{DriftEngine, DriftMode};
use crate::error::SimError;
use crate::twins::docs::Document;
use crate::twins::{
    browser::BrowserConfig, identity::IdentityConfig, mail::MailConfig, servicedesk::ServiceDeskConfig,
    slack::SlackConfig, BrowserTwin, CrmTwin, DocsTwin, ErpTwin, IdentityTwin, MailTwin, ServiceDeskTwin, SlackTwin,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use vei_core::{ConnectorError, ProviderContext, Router, RouterBuilder, RouterConfig, ToolProvider, ToolSpec};

/// Every connector a world can enable, in provider order.
pub const CONNECTORS: &[&str] = &["browser", "slack", "mail", "docs", "erp", "crm", "okta", "servicedesk"];

/// An event scheduled when the session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerailEvent {
    pub target: String,
    pub payload: Value,
    /// Offset from session start
    pub at_ms: u64,
}

/// Everything a session needs besides the kernel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub name: String,

    /// Enabled connectors (subset of [`CONNECTORS`])
    pub connectors: Vec<String>,

    pub slack: SlackConfig,
    pub mail: MailConfig,
    pub browser: BrowserConfig,
    pub identity: IdentityConfig,
    pub servicedesk: ServiceDeskConfig,
    pub documents: Vec<Document>,

    pub derail_events: Vec<DerailEvent>,
    pub drift: DriftMode,

    /// Vendor alias packs to register (`xero`, `hubspot`, ...)
    pub alias_packs: Vec<String>,

    /// Seeded business-error rate per connector
    pub error_rates: BTreeMap<String, f64>,

    /// Terms that rank concrete affordances; empty keeps the kernel's
    pub goal_terms: Vec<String>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: "macrocompute_default".to_string(),
            connectors: CONNECTORS.iter().map(|c| c.to_string()).collect(),
            slack: SlackConfig::default(),
            mail: MailConfig::default(),
            browser: BrowserConfig::default(),
            identity: IdentityConfig::default(),
            servicedesk: ServiceDeskConfig::default(),
            documents: vec![Document {
                doc_id: "DOC-1".to_string(),
                title: "Procurement policy".to_string(),
                body: "Requests over $2k need a vendor quote and CFO approval in #procurement.".to_string(),
                tags: vec!["policy".to_string()],
            }],
            derail_events: Vec::new(),
            drift: DriftMode::Off,
            alias_packs: Vec::new(),
            error_rates: BTreeMap::new(),
            goal_terms: Vec::new(),
        }
    }
}

impl WorldConfig {
    /// Parses a world definition; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, SimError> {
        serde_json::from_str(text).map_err(|e| SimError::world(format!("invalid world definition: {}", e)))
    }

    /// Loads a world definition from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SimError::io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&text)
    }

    pub fn with_connectors(mut self, connectors: &[&str]) -> Self {
        self.connectors = connectors.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_drift(mut self, mode: DriftMode) -> Self {
        self.drift = mode;
        self
    }

    pub fn with_derail(mut self, target: &str, payload: Value, at_ms: u64) -> Self {
        self.derail_events.push(DerailEvent {
            target: target.to_string(),
            payload,
            at_ms,
        });
        self
    }

    pub fn is_enabled(&self, connector: &str) -> bool {
        self.connectors.iter().any(|c| c == connector)
    }

    /// Instantiates the enabled twins, plus drift and derails if any.
    pub fn providers(&self) -> Result<Vec<Arc<dyn ToolProvider>>, SimError> {
        if let Some(unknown) = self.connectors.iter().find(|c| !CONNECTORS.contains(&c.as_str())) {
            return Err(SimError::world(format!("unknown connector '{}'", unknown)));
        }

        let mut providers: Vec<Arc<dyn ToolProvider>> = Vec::new();
        for connector in CONNECTORS.iter().filter(|c| self.is_enabled(c)) {
            let provider: Arc<dyn ToolProvider> = match *connector {
                "browser" => Arc::new(
                    BrowserTwin::new(&self.browser).map_err(|e| SimError::world(format!("browser: {}", e)))?,
                ),
                "slack" => Arc::new(SlackTwin::new(self.slack.clone())),
                "mail" => Arc::new(MailTwin::new(self.mail.clone())),
                "docs" => Arc::new(DocsTwin::new(self.documents.clone())),
                "erp" => Arc::new(ErpTwin),
                "crm" => Arc::new(CrmTwin),
                "okta" => Arc::new(IdentityTwin::new(self.identity.clone())),
                "servicedesk" => Arc::new(ServiceDeskTwin::new(self.servicedesk.clone())),
                _ => continue,
            };
            providers.push(provider);
        }

        if self.drift.is_active() {
            providers.push(Arc::new(DriftEngine::new(self.drift)));
        }
        if !self.derail_events.is_empty() {
            providers.push(Arc::new(DerailSchedule {
                events: self.derail_events.clone(),
            }));
        }
        Ok(providers)
    }

    /// Folds the world's fault rates and goal terms into `base`.
    pub fn router_config(&self, base: RouterConfig) -> RouterConfig {
        let mut config = base;
        for (connector, rate) in &self.error_rates {
            config = config.with_error_rate(connector, *rate);
        }
        if !self.goal_terms.is_empty() {
            config.goal_terms = self.goal_terms.clone();
        }
        config
    }

    /// Builder with the world's providers and alias packs, for callers
    /// that attach a replay bundle or extra monitors.
    pub fn router_builder(&self, base: RouterConfig) -> Result<RouterBuilder, SimError> {
        let mut builder = Router::builder(self.router_config(base)).providers(self.providers()?);
        for pack in &self.alias_packs {
            builder = builder.alias_pack(pack);
        }
        Ok(builder)
    }

    /// Compiles the world into a ready session.
    pub fn build_router(&self, base: RouterConfig) -> Result<Router, SimError> {
        let router = self.router_builder(base)?.build()?;
        debug!(
            world = %self.name,
            connectors = self.connectors.len(),
            derails = self.derail_events.len(),
            drift = %self.drift,
            "world compiled"
        );
        Ok(router)
    }
}

/// Schedules the world's derail events at session start.
#[derive(Debug, Clone)]
struct DerailSchedule {
    events: Vec<DerailEvent>,
}

impl ToolProvider for DerailSchedule {
    fn connector(&self) -> &str {
        "world"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        for event in &self.events {
            ctx.schedule(event.at_ms, &event.target, event.payload.clone());
        }
        Ok(())
    }

    fn call(&self, tool: &str, _args: &Value, _ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        Err(ConnectorError::new("unknown_tool", tool))
    }
}
