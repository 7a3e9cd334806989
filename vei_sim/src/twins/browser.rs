//! Virtual browser over a DOM graph of product pages.

use super::{arg_str, opt_str};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vei_core::dom_graph::{GraphError, BACK_ALIAS};
use vei_core::{
    Affordance, ArgKind, ArgsSchema, ConnectorError, DomGraph, ProviderContext, StateStore, ToolProvider, ToolSpec,
};

const SESSION: &str = "browser.session";
const CURRENT: &str = "current";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageConfig {
    pub id: String,
    pub url: String,
    pub title: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub from: String,
    pub alias: String,
    pub to: String,
    #[serde(default)]
    pub label: String,
}

/// Pages and links of the virtual site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub root: String,
    pub pages: Vec<PageConfig>,
    pub links: Vec<LinkConfig>,
}

fn page(id: &str, url: &str, title: &str, excerpt: &str) -> PageConfig {
    PageConfig {
        id: id.to_string(),
        url: url.to_string(),
        title: title.to_string(),
        excerpt: excerpt.to_string(),
    }
}

fn link(from: &str, alias: &str, to: &str, label: &str) -> LinkConfig {
    LinkConfig {
        from: from.to_string(),
        alias: alias.to_string(),
        to: to.to_string(),
        label: label.to_string(),
    }
}

impl Default for BrowserConfig {
    /// Three-page MacroCompute storefront.
    fn default() -> Self {
        Self {
            root: "home".to_string(),
            pages: vec![
                page(
                    "home",
                    "https://vweb.local/home",
                    "MacroCompute - Home",
                    "Welcome to MacroCompute. Find laptops and specs.",
                ),
                page(
                    "pdp",
                    "https://vweb.local/pdp/macrobook-pro-16",
                    "MacroBook Pro 16 - Product",
                    "Powerful 16-inch laptop. Price $3199. See specifications.",
                ),
                page(
                    "specs",
                    "https://vweb.local/pdp/macrobook-pro-16/specs",
                    "MacroBook Pro 16 - Specifications",
                    "16-core CPU, 32GB RAM, 1TB SSD",
                ),
            ],
            links: vec![
                link("home", "CLICK:open_pdp#0", "pdp", "Open product page"),
                link("pdp", "CLICK:open_specs#0", "specs", "See specifications"),
                link("pdp", BACK_ALIAS, "home", "Back to home"),
                link("specs", BACK_ALIAS, "pdp", "Back to product"),
            ],
        }
    }
}

impl BrowserConfig {
    /// Storefront with a category page and two products.
    pub fn extended_store() -> Self {
        Self {
            root: "home".to_string(),
            pages: vec![
                page(
                    "home",
                    "https://vweb.local/home",
                    "MacroCompute - Home",
                    "Welcome. Browse categories to find laptops and accessories.",
                ),
                page("category", "https://vweb.local/cat/laptops", "Laptops - Category", "Showing 2 results"),
                page(
                    "pdp1",
                    "https://vweb.local/pdp/macrobook-pro-16",
                    "MacroBook Pro 16 - Product",
                    "Powerful 16-inch laptop. Price $3199. See specifications.",
                ),
                page(
                    "specs1",
                    "https://vweb.local/pdp/macrobook-pro-16/specs",
                    "MacroBook Pro 16 - Specifications",
                    "16-core CPU, 32GB RAM, 1TB SSD",
                ),
                page(
                    "pdp2",
                    "https://vweb.local/pdp/macrobook-air-13",
                    "MacroBook Air 13 - Product",
                    "Lightweight 13-inch laptop. Price $1299.",
                ),
            ],
            links: vec![
                link("home", "CLICK:open_category#0", "category", "Laptops"),
                link("category", "CLICK:open_pdp1#0", "pdp1", "MacroBook Pro 16"),
                link("category", "CLICK:open_pdp2#0", "pdp2", "MacroBook Air 13"),
                link("category", BACK_ALIAS, "home", "Back to home"),
                link("pdp1", "CLICK:open_specs1#0", "specs1", "See specifications"),
                link("pdp1", BACK_ALIAS, "category", "Back to laptops"),
                link("specs1", BACK_ALIAS, "pdp1", "Back to product"),
                link("pdp2", BACK_ALIAS, "category", "Back to laptops"),
            ],
        }
    }

    /// Builds and validates the page graph.
    pub fn build_graph(&self) -> Result<DomGraph, GraphError> {
        let mut graph = DomGraph::new(&self.root);
        for p in &self.pages {
            graph.add_node(&p.id, &p.url, &p.title, &p.excerpt);
        }
        for l in &self.links {
            graph.add_edge(&l.from, &l.alias, &l.to, &l.label);
        }
        graph.validate()?;
        Ok(graph)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Location {
    node_id: String,
    history: Vec<String>,
}

/// The browser twin.
#[derive(Debug, Clone)]
pub struct BrowserTwin {
    graph: DomGraph,
}

impl BrowserTwin {
    pub fn new(config: &BrowserConfig) -> Result<Self, GraphError> {
        Ok(Self {
            graph: config.build_graph()?,
        })
    }

    fn location(&self, store: &StateStore) -> String {
        store
            .read(SESSION, CURRENT)
            .and_then(|doc| doc.get("node_id"))
            .and_then(Value::as_str)
            .unwrap_or(self.graph.root())
            .to_string()
    }

    fn navigate(&self, to: &str, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        ctx.push(SESSION, CURRENT, "history", json!(to));
        ctx.merge(SESSION, CURRENT, json!({ "node_id": to }))?;
        Ok(self.graph.page_view(to))
    }

    fn find(&self, current: &str, query: &str, top_k: usize) -> Value {
        let needle = query.to_lowercase();
        let hits: Vec<Value> = self
            .graph
            .edges_from(current)
            .filter(|e| e.alias != BACK_ALIAS)
            .filter(|e| {
                needle.is_empty()
                    || e.label.to_lowercase().contains(&needle)
                    || e.alias.to_lowercase().contains(&needle)
            })
            .take(top_k)
            .map(|e| json!({ "node_id": e.alias, "role": "button", "name": e.label }))
            .collect();
        json!({ "hits": hits })
    }
}

impl BrowserTwin {
    /// Page an affordance on `current` leads to. `BACK` is not clickable.
    fn click_target(&self, current: &str, alias: &str) -> Result<String, ConnectorError> {
        self.graph
            .resolve(current, alias)
            .filter(|_| alias != BACK_ALIAS)
            .map(str::to_string)
            .ok_or_else(|| ConnectorError::invalid_action(format!("No affordance {} on {}", alias, current)))
    }
}

impl ToolProvider for BrowserTwin {
    fn connector(&self) -> &str {
        "browser"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new("browser.open", "Open a URL")
                .with_args(ArgsSchema::new().required("url", ArgKind::Str))
                .with_latency(300, 100)
                .generic(),
            ToolSpec::new("browser.click", "Follow an affordance on the current page")
                .with_args(ArgsSchema::new().required("node_id", ArgKind::Str))
                .with_latency(250, 80)
                .concrete(),
            ToolSpec::new("browser.back", "Go back one page")
                .with_latency(200, 50)
                .concrete(),
            ToolSpec::new("browser.read", "Read the current page").generic(),
            ToolSpec::new("browser.find", "Find clickable elements on the current page")
                .with_args(
                    ArgsSchema::new()
                        .required("query", ArgKind::Str)
                        .optional("top_k", ArgKind::Int),
                )
                .generic(),
            ToolSpec::new("browser.type", "Type into a field")
                .with_args(
                    ArgsSchema::new()
                        .required("node_id", ArgKind::Str)
                        .required("text", ArgKind::Str),
                )
                .generic(),
            ToolSpec::new("browser.submit", "Submit a form")
                .with_args(ArgsSchema::new().required("form_id", ArgKind::Str))
                .generic(),
        ]
    }

    fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        ctx.put(
            SESSION,
            CURRENT,
            &Location {
                node_id: self.graph.root().to_string(),
                history: vec![self.graph.root().to_string()],
            },
        )
    }

    fn precheck(&self, tool: &str, args: &Value, store: &StateStore) -> Result<(), ConnectorError> {
        if tool == "browser.click" {
            self.click_target(&self.location(store), arg_str(args, "node_id")?)?;
        }
        Ok(())
    }

    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        let current = self.location(ctx.store());
        match tool {
            "browser.open" => {
                let target = self.graph.node_for_url(arg_str(args, "url")?).to_string();
                self.navigate(&target, ctx)
            }
            "browser.click" => {
                let target = self.click_target(&current, arg_str(args, "node_id")?)?;
                self.navigate(&target, ctx)
            }
            "browser.back" => match self.graph.resolve(&current, BACK_ALIAS) {
                Some(target) => {
                    let target = target.to_string();
                    self.navigate(&target, ctx)
                }
                None => Ok(self.graph.page_view(&current)),
            },
            "browser.read" => Ok(self.graph.page_view(&current)),
            "browser.find" => {
                let top_k = args.get("top_k").and_then(Value::as_u64).unwrap_or(10) as usize;
                Ok(self.find(&current, arg_str(args, "query")?, top_k))
            }
            "browser.type" => {
                arg_str(args, "node_id")?;
                arg_str(args, "text")?;
                Ok(json!({ "ok": true }))
            }
            "browser.submit" => {
                let url = self.graph.node(&current).map(|n| n.url.clone()).unwrap_or_default();
                Ok(json!({ "ok": true, "form_id": opt_str(args, "form_id"), "url": url }))
            }
            other => Err(ConnectorError::new("unknown_tool", other)),
        }
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        let current = self.location(store);
        self.graph
            .node(&current)
            .map(|n| format!("Browser: {} ({}) - {}", n.title, n.url, n.excerpt))
    }

    fn affordances(&self, store: &StateStore) -> Vec<Affordance> {
        let current = self.location(store);
        self.graph
            .edges_from(&current)
            .map(|edge| {
                if edge.alias == BACK_ALIAS {
                    Affordance {
                        tool: "browser.back".to_string(),
                        args: json!({}),
                        label: edge.label.clone(),
                        id: BACK_ALIAS.to_string(),
                    }
                } else {
                    Affordance {
                        tool: "browser.click".to_string(),
                        args: json!({ "node_id": edge.alias }),
                        label: edge.label.clone(),
                        id: edge.alias.clone(),
                    }
                }
            })
            .collect()
    }

    fn dom_graph(&self) -> Option<&DomGraph> {
        Some(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_router;
    use super::*;
    use vei_core::KernelError;

    fn router() -> vei_core::Router {
        test_router(BrowserTwin::new(&BrowserConfig::default()).unwrap())
    }

    #[test]
    fn test_default_and_extended_graphs_validate() {
        assert!(BrowserConfig::default().build_graph().is_ok());
        assert!(BrowserConfig::extended_store().build_graph().is_ok());
    }

    #[test]
    fn test_dangling_link_is_rejected() {
        let mut config = BrowserConfig::default();
        config.links.push(link("home", "CLICK:nowhere#0", "missing", ""));
        assert!(matches!(config.build_graph(), Err(GraphError::DanglingEdge { .. })));
    }

    #[test]
    fn test_click_follows_edges() {
        let mut router = router();
        let home = router.dispatch("browser.open", &json!({ "url": "home" })).unwrap();
        assert_eq!(home["node_id"], "home");
        let pdp = router
            .dispatch("browser.click", &json!({ "node_id": "CLICK:open_pdp#0" }))
            .unwrap();
        assert_eq!(pdp["node_id"], "pdp");
        let page = router.dispatch("browser.read", &json!({})).unwrap();
        assert!(page["excerpt"].as_str().unwrap().contains("$3199"));
    }

    #[test]
    fn test_invalid_click_leaves_page_unchanged() {
        let mut router = router();
        let revision = router.store().revision();
        let err = router
            .dispatch("browser.click", &json!({ "node_id": "CLICK:open_specs#0" }))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_action");
        assert_eq!(router.store().revision(), revision);
        assert_eq!(router.dispatch("browser.read", &json!({})).unwrap()["node_id"], "home");
    }

    #[test]
    fn test_invalid_click_is_rejected_before_the_fault_draw() {
        let walk = [
            ("browser.click", json!({ "node_id": "CLICK:open_pdp#0" })),
            ("browser.back", json!({})),
            ("browser.click", json!({ "node_id": "CLICK:open_pdp#0" })),
            ("browser.open", json!({ "url": "home" })),
        ];

        let mut clean = router();
        for (tool, args) in &walk {
            clean.dispatch(tool, args).unwrap();
        }

        let mut noisy = router();
        let err = noisy
            .dispatch("browser.click", &json!({ "node_id": "CLICK:open_specs#0" }))
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidAction(ref msg) if msg.contains("open_specs")));
        let err = noisy
            .dispatch("browser.click", &json!({ "node_id": BACK_ALIAS }))
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidAction(_)));
        assert_eq!(noisy.now(), 0);
        for (tool, args) in &walk {
            noisy.dispatch(tool, args).unwrap();
        }

        // jittered latencies only line up if the rejected clicks drew nothing
        assert_eq!(noisy.now(), clean.now());
        assert_eq!(noisy.store().revision(), clean.store().revision());
    }

    #[test]
    fn test_back_without_edge_stays_put() {
        let mut router = router();
        assert_eq!(router.dispatch("browser.back", &json!({})).unwrap()["node_id"], "home");
        router
            .dispatch("browser.click", &json!({ "node_id": "CLICK:open_pdp#0" }))
            .unwrap();
        assert_eq!(router.dispatch("browser.back", &json!({})).unwrap()["node_id"], "home");
    }

    #[test]
    fn test_find_lists_click_targets_only() {
        let mut router = router();
        router.dispatch("browser.open", &json!({ "url": "https://vweb.local/pdp/macrobook-pro-16" })).unwrap();
        let found = router.dispatch("browser.find", &json!({ "query": "" })).unwrap();
        assert_eq!(
            found["hits"],
            json!([{ "node_id": "CLICK:open_specs#0", "role": "button", "name": "See specifications" }])
        );
    }

    #[test]
    fn test_affordances_match_current_page() {
        let twin = BrowserTwin::new(&BrowserConfig::default()).unwrap();
        let mut router = test_router(twin.clone());
        router.dispatch("browser.click", &json!({ "node_id": "CLICK:open_pdp#0" })).unwrap();
        let ids: Vec<String> = twin.affordances(router.store()).into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["BACK".to_string(), "CLICK:open_specs#0".to_string()]);
    }
}
