//! Observation and action-menu builder.
//!
//! The action menu is the agent's bounded action space. Concrete entries
//! come from the focused provider's affordances, ranked by goal-term
//! overlap and then by stable id; generic entries are schema-only and
//! always present for the focused connector.

use crate::provider::{Affordance, ToolProvider};
use crate::state_store::StateStore;
use crate::tool_registry::{MenuVisibility, ToolRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use vei_env::{connector_of, LogicalTime};

/// Upper bound on concrete entries per observation.
pub const MAX_CONCRETE_ENTRIES: usize = 16;

/// One entry of the action menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MenuEntry {
    /// Fully bound call, dispatchable as-is
    Concrete {
        tool: String,
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// Schema-only entry for free-form calls
    Generic { tool: String, args_schema: Value },
}

impl MenuEntry {
    pub fn tool(&self) -> &str {
        match self {
            MenuEntry::Concrete { tool, .. } | MenuEntry::Generic { tool, .. } => tool,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, MenuEntry::Concrete { .. })
    }
}

/// What the agent sees after each step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time_ms: LogicalTime,
    pub focus: String,
    pub summary: String,
    pub action_menu: Vec<MenuEntry>,
    pub pending_events: BTreeMap<String, usize>,
}

fn normalized(args: &Value) -> Value {
    if args.is_null() {
        json!({})
    } else {
        args.clone()
    }
}

/// Goal-term overlap of an affordance label.
fn relevance(label: &str, goal_terms: &[String]) -> usize {
    let label = label.to_lowercase();
    goal_terms
        .iter()
        .filter(|term| !term.is_empty() && label.contains(&term.to_lowercase()))
        .count()
}

/// Ranks affordances: higher relevance first, then id, then tool.
pub fn rank_affordances(mut affordances: Vec<Affordance>, goal_terms: &[String]) -> Vec<Affordance> {
    affordances.sort_by(|a, b| {
        relevance(&b.label, goal_terms)
            .cmp(&relevance(&a.label, goal_terms))
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| a.tool.cmp(&b.tool))
    });
    affordances
}

/// Builds observations from read-only session state.
pub struct ObservationBuilder<'a> {
    registry: &'a ToolRegistry,
    providers: &'a [Arc<dyn ToolProvider>],
    store: &'a StateStore,
    goal_terms: &'a [String],
}

impl<'a> ObservationBuilder<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        providers: &'a [Arc<dyn ToolProvider>],
        store: &'a StateStore,
        goal_terms: &'a [String],
    ) -> Self {
        Self {
            registry,
            providers,
            store,
            goal_terms,
        }
    }

    fn provider(&self, connector: &str) -> Option<&Arc<dyn ToolProvider>> {
        self.providers.iter().find(|p| p.connector() == connector)
    }

    /// Ranked concrete affordances of a connector.
    fn concrete(&self, connector: &str) -> Vec<Affordance> {
        let affordances = self
            .provider(connector)
            .map(|p| p.affordances(self.store))
            .unwrap_or_default();
        let mut ranked = rank_affordances(affordances, self.goal_terms);
        ranked.truncate(MAX_CONCRETE_ENTRIES);
        ranked
    }

    /// Action menu for a connector: concrete entries, then generic ones.
    pub fn menu_for(&self, connector: &str) -> Vec<MenuEntry> {
        let mut menu: Vec<MenuEntry> = self
            .concrete(connector)
            .into_iter()
            .map(|a| MenuEntry::Concrete {
                tool: a.tool,
                args: normalized(&a.args),
                label: if a.label.is_empty() { None } else { Some(a.label) },
            })
            .collect();
        menu.extend(self.registry.generic_for(connector).into_iter().map(|spec| {
            MenuEntry::Generic {
                tool: spec.name.clone(),
                args_schema: spec.args.to_menu_value(),
            }
        }));
        menu
    }

    /// Whether `(tool, args)` is reachable from the menu of the tool's
    /// connector. `tool` must be a resolved base name.
    pub fn allows(&self, tool: &str, args: &Value) -> bool {
        let Some(spec) = self.registry.get(tool) else {
            return false;
        };
        if spec.menu == MenuVisibility::Generic {
            return true;
        }
        let args = normalized(args);
        self.concrete(connector_of(tool))
            .iter()
            .any(|a| a.tool == tool && normalized(&a.args) == args)
    }

    /// Composes the observation for `focus`.
    pub fn build(&self, focus: &str, time_ms: LogicalTime, pending: BTreeMap<String, usize>) -> Observation {
        let summary = self
            .provider(focus)
            .and_then(|p| p.summary(self.store))
            .unwrap_or_else(|| format!("{}: nothing to report", focus));

        // Every event-receiving connector is listed, even with zero pending.
        let mut pending_events: BTreeMap<String, usize> = self
            .providers
            .iter()
            .filter(|p| p.accepts_events())
            .map(|p| (p.connector().to_string(), 0))
            .collect();
        for (connector, count) in pending {
            pending_events.insert(connector, count);
        }

        Observation {
            time_ms,
            focus: focus.to_string(),
            summary,
            action_menu: self.menu_for(focus),
            pending_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aff(id: &str, label: &str) -> Affordance {
        Affordance {
            tool: "browser.click".into(),
            args: json!({ "node_id": id }),
            label: label.into(),
            id: id.into(),
        }
    }

    #[test]
    fn test_rank_by_goal_terms_then_id() {
        let goal = vec!["laptop".to_string(), "pro".to_string()];
        let ranked = rank_affordances(
            vec![
                aff("CLICK:c#0", "Accessories"),
                aff("CLICK:b#0", "MacroBook Pro laptop"),
                aff("CLICK:a#0", "Accessories"),
            ],
            &goal,
        );
        let ids: Vec<&str> = ranked.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["CLICK:b#0", "CLICK:a#0", "CLICK:c#0"]);
    }

    #[test]
    fn test_rank_without_goal_is_id_order() {
        let ranked = rank_affordances(vec![aff("z", "x"), aff("a", "y")], &[]);
        assert_eq!(ranked[0].id, "a");
    }

    #[test]
    fn test_menu_entry_serialization() {
        let concrete = MenuEntry::Concrete {
            tool: "browser.click".into(),
            args: json!({"node_id": "BACK"}),
            label: None,
        };
        assert_eq!(
            serde_json::to_value(&concrete).unwrap(),
            json!({"tool": "browser.click", "args": {"node_id": "BACK"}})
        );
        let generic = MenuEntry::Generic {
            tool: "browser.find".into(),
            args_schema: json!({"query": "str"}),
        };
        assert_eq!(
            serde_json::to_value(&generic).unwrap(),
            json!({"tool": "browser.find", "args_schema": {"query": "str"}})
        );
        assert!(concrete.is_concrete());
        assert_eq!(generic.tool(), "browser.find");
    }
}
