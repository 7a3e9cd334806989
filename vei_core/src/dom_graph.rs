//! DOM graph arena for browser-like connectors.
//!
//! Pages are nodes keyed by a stable string id; affordances are edges
//! stored as `(from_id, alias) -> to_id`. There are no node-to-node
//! pointers, so cycles (BACK edges) need no special ownership handling.

use crate::canonical::digest;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Alias used for the back affordance.
pub const BACK_ALIAS: &str = "BACK";

/// Content of one page state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageNode {
    pub id: String,
    pub url: String,
    pub title: String,
    pub excerpt: String,
}

impl PageNode {
    /// Digest identifying the page content (used in replay bundles).
    pub fn page_state_digest(&self) -> String {
        digest(&json!({
            "url": self.url,
            "title": self.title,
            "excerpt": self.excerpt,
        }))
    }
}

/// One outgoing edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from_id: String,
    pub alias: String,
    pub to_id: String,

    /// Link text shown to the agent (used for relevance ranking)
    #[serde(default)]
    pub label: String,
}

/// Encoded graph as stored in replay bundles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedGraph {
    pub nodes: Vec<EncodedNode>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedNode {
    pub id: String,
    pub page_state_digest: String,
}

/// Structural problems detected by `validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    DanglingEdge { from_id: String, alias: String, to_id: String },
    UnknownSource { from_id: String, alias: String },
    MissingRoot(String),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::DanglingEdge { from_id, alias, to_id } => {
                write!(f, "edge {}/{} points to missing node {}", from_id, alias, to_id)
            }
            GraphError::UnknownSource { from_id, alias } => {
                write!(f, "edge {}/{} starts at missing node", from_id, alias)
            }
            GraphError::MissingRoot(id) => write!(f, "root node {} missing", id),
        }
    }
}

/// Arena of pages and affordance edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomGraph {
    root: String,
    nodes: BTreeMap<String, PageNode>,
    edges: BTreeMap<(String, String), Edge>,
}

impl DomGraph {
    /// Creates an empty graph whose entry page is `root`.
    pub fn new(root: &str) -> Self {
        Self {
            root: root.to_string(),
            ..Self::default()
        }
    }

    pub fn add_node(&mut self, id: &str, url: &str, title: &str, excerpt: &str) -> &mut Self {
        self.nodes.insert(
            id.to_string(),
            PageNode {
                id: id.to_string(),
                url: url.to_string(),
                title: title.to_string(),
                excerpt: excerpt.to_string(),
            },
        );
        self
    }

    /// Adds (or replaces) the edge `(from, alias) -> to`.
    pub fn add_edge(&mut self, from: &str, alias: &str, to: &str, label: &str) -> &mut Self {
        self.edges.insert(
            (from.to_string(), alias.to_string()),
            Edge {
                from_id: from.to_string(),
                alias: alias.to_string(),
                to_id: to.to_string(),
                label: label.to_string(),
            },
        );
        self
    }

    /// Checks that every edge connects two existing nodes.
    pub fn validate(&self) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&self.root) {
            return Err(GraphError::MissingRoot(self.root.clone()));
        }
        for edge in self.edges.values() {
            if !self.nodes.contains_key(&edge.from_id) {
                return Err(GraphError::UnknownSource {
                    from_id: edge.from_id.clone(),
                    alias: edge.alias.clone(),
                });
            }
            if !self.nodes.contains_key(&edge.to_id) {
                return Err(GraphError::DanglingEdge {
                    from_id: edge.from_id.clone(),
                    alias: edge.alias.clone(),
                    to_id: edge.to_id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn node(&self, id: &str) -> Option<&PageNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PageNode> {
        self.nodes.values()
    }

    /// Follows `alias` from `from`.
    pub fn resolve(&self, from: &str, alias: &str) -> Option<&str> {
        self.edges
            .get(&(from.to_string(), alias.to_string()))
            .map(|e| e.to_id.as_str())
    }

    /// Outgoing edges of a node in alias order.
    pub fn edges_from<'a>(&'a self, from: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.values().filter(move |e| e.from_id == from)
    }

    /// Node whose URL contains `needle`, falling back to the root.
    pub fn node_for_url(&self, needle: &str) -> &str {
        self.nodes
            .values()
            .find(|n| n.url == needle)
            .or_else(|| self.nodes.values().find(|n| n.id == needle))
            .or_else(|| self.nodes.values().find(|n| !needle.is_empty() && n.url.contains(needle)))
            .map(|n| n.id.as_str())
            .unwrap_or(self.root.as_str())
    }

    /// Encoding used in replay bundles.
    pub fn encode(&self) -> EncodedGraph {
        EncodedGraph {
            nodes: self
                .nodes
                .values()
                .map(|n| EncodedNode {
                    id: n.id.clone(),
                    page_state_digest: n.page_state_digest(),
                })
                .collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    /// Page view returned by browser tools.
    pub fn page_view(&self, id: &str) -> Value {
        match self.node(id) {
            Some(node) => json!({
                "node_id": node.id,
                "url": node.url,
                "title": node.title,
                "excerpt": node.excerpt,
            }),
            None => json!({ "node_id": id }),
        }
    }
}

/// Graph-only navigator over an encoded graph, used during replay where
/// page content is represented by digests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedNavigator {
    digests: BTreeMap<String, String>,
    edges: BTreeMap<(String, String), String>,
}

impl EncodedNavigator {
    pub fn new(graph: &EncodedGraph) -> Self {
        Self {
            digests: graph
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.page_state_digest.clone()))
                .collect(),
            edges: graph
                .edges
                .iter()
                .map(|e| ((e.from_id.clone(), e.alias.clone()), e.to_id.clone()))
                .collect(),
        }
    }

    pub fn resolve(&self, from: &str, alias: &str) -> Option<&str> {
        self.edges
            .get(&(from.to_string(), alias.to_string()))
            .map(String::as_str)
    }

    pub fn digest(&self, id: &str) -> Option<&str> {
        self.digests.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.digests.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> DomGraph {
        let mut g = DomGraph::new("home");
        g.add_node("home", "https://vweb.local/home", "Home", "Welcome")
            .add_node("pdp", "https://vweb.local/pdp/macrobook-pro-16", "Product", "Price $3199")
            .add_edge("home", "CLICK:open_pdp#0", "pdp", "MacroBook Pro 16")
            .add_edge("pdp", BACK_ALIAS, "home", "Back");
        g
    }

    #[test]
    fn test_resolve_edges() {
        let g = shop();
        assert!(g.validate().is_ok());
        assert_eq!(g.resolve("home", "CLICK:open_pdp#0"), Some("pdp"));
        assert_eq!(g.resolve("pdp", BACK_ALIAS), Some("home"));
        assert_eq!(g.resolve("home", BACK_ALIAS), None);
    }

    #[test]
    fn test_dangling_edge_detected() {
        let mut g = shop();
        g.add_edge("pdp", "CLICK:open_specs#0", "specs", "Specs");
        assert!(matches!(g.validate(), Err(GraphError::DanglingEdge { .. })));
    }

    #[test]
    fn test_node_for_url() {
        let g = shop();
        assert_eq!(g.node_for_url("https://vweb.local/pdp/macrobook-pro-16"), "pdp");
        assert_eq!(g.node_for_url("pdp"), "pdp");
        assert_eq!(g.node_for_url("home"), "home");
        assert_eq!(g.node_for_url("https://elsewhere.example"), "home");
    }

    #[test]
    fn test_encoded_navigator_matches_graph() {
        let g = shop();
        let nav = EncodedNavigator::new(&g.encode());
        assert_eq!(nav.resolve("home", "CLICK:open_pdp#0"), Some("pdp"));
        assert_eq!(nav.digest("pdp"), Some(g.node("pdp").unwrap().page_state_digest().as_str()));
        assert!(nav.contains("home"));
        assert!(!nav.contains("specs"));
    }
}
