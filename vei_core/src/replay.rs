//! Replay matching and recording.
//!
//! A replay bundle is an ordered list of recorded calls. In replay mode
//! the router hands each call for a replayed connector to the matcher,
//! which compares its signature with that connector's next record.
//! Each connector has its own cursor, so a session can replay one
//! connector while the others keep running in sim mode. A match
//! returns the recorded response and the events the call emitted, timed
//! at `t_start + dt_ms` on the session's logical clock. A mismatch is
//! reported, never skipped.
//!
//! Browser navigation is additionally checked against the recorded DOM
//! graph: following an alias that is not an edge of the current node is
//! an invalid action rather than a mismatch.

use crate::canonical::call_signature;
use crate::dom_graph::{DomGraph, EncodedGraph, EncodedNavigator, BACK_ALIAS};
use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use vei_env::{connector_of, LogicalTime};

/// An event emitted by a recorded call, `dt_ms` after the call started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEmit {
    pub target: String,
    pub payload: Value,
    pub dt_ms: u64,
}

/// One recorded tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub tool: String,

    /// Connector that served the call (alias tools keep their base
    /// connector here); empty in older bundles
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connector: String,

    pub args_signature: String,
    pub request: Value,
    pub response: Value,
    pub t_start: LogicalTime,

    /// Logical time the call took
    pub dt_ms: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emits: Vec<RecordedEmit>,
}

/// A recorded session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayBundle {
    pub records: Vec<ReplayRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_graph: Option<EncodedGraph>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_root: Option<String>,
}

impl ReplayRecord {
    /// Connector whose replay lane this record belongs to.
    pub fn lane(&self) -> &str {
        if self.connector.is_empty() {
            connector_of(&self.tool)
        } else {
            &self.connector
        }
    }
}

impl ReplayBundle {
    pub fn from_json(text: &str) -> Result<Self, KernelError> {
        serde_json::from_str(text).map_err(|e| KernelError::invalid_argument(format!("replay bundle: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, KernelError> {
        serde_json::to_string_pretty(self).map_err(|e| KernelError::Persistence(format!("replay bundle: {}", e)))
    }
}

/// Result of a successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayHit {
    pub response: Value,
    pub latency_ms: u64,

    /// `(due_time, target, payload)` for each recorded emit
    pub events: Vec<(LogicalTime, String, Value)>,
}

/// Per-connector cursors over a replay bundle.
#[derive(Debug, Clone)]
pub struct ReplayMatcher {
    /// Records of each connector, in recording order
    lanes: BTreeMap<String, Vec<ReplayRecord>>,
    cursors: BTreeMap<String, usize>,
    total: usize,
    navigator: Option<EncodedNavigator>,
    dom_cursor: Option<String>,
}

impl ReplayMatcher {
    pub fn new(bundle: &ReplayBundle) -> Self {
        let mut lanes: BTreeMap<String, Vec<ReplayRecord>> = BTreeMap::new();
        for record in &bundle.records {
            lanes.entry(record.lane().to_string()).or_default().push(record.clone());
        }
        Self {
            lanes,
            cursors: BTreeMap::new(),
            total: bundle.records.len(),
            navigator: bundle.dom_graph.as_ref().map(EncodedNavigator::new),
            dom_cursor: bundle.dom_root.clone(),
        }
    }

    /// Records consumed so far, across all connectors.
    pub fn cursor(&self) -> usize {
        self.cursors.values().sum()
    }

    /// Records consumed so far for one connector.
    pub fn cursor_for(&self, connector: &str) -> usize {
        self.cursors.get(connector).copied().unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.total - self.cursor()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor() >= self.total
    }

    /// Current DOM node during browser replay.
    pub fn dom_node(&self) -> Option<&str> {
        self.dom_cursor.as_deref()
    }

    fn check_navigation(&self, tool: &str, args: &Value) -> Result<Option<String>, KernelError> {
        let (Some(nav), Some(current)) = (self.navigator.as_ref(), self.dom_cursor.as_deref()) else {
            return Ok(None);
        };
        let alias = match tool {
            "browser.click" => args.get("node_id").and_then(Value::as_str).unwrap_or(""),
            "browser.back" => BACK_ALIAS,
            _ => return Ok(None),
        };
        match nav.resolve(current, alias) {
            Some(next) => Ok(Some(next.to_string())),
            None => Err(KernelError::invalid_action(format!(
                "alias '{}' is not an edge from node '{}'",
                alias, current
            ))),
        }
    }

    /// Matches one call against `connector`'s next record.
    pub fn match_call(&mut self, connector: &str, tool: &str, args: &Value) -> Result<ReplayHit, KernelError> {
        let next_node = self.check_navigation(tool, args)?;

        let signature = call_signature(tool, args);
        let cursor = self.cursor_for(connector);
        let record = self
            .lanes
            .get(connector)
            .and_then(|lane| lane.get(cursor))
            .ok_or_else(|| KernelError::ReplayMismatch {
                tool: tool.to_string(),
                cursor,
                detail: format!("recording exhausted for {}", connector),
            })?;
        if record.tool != tool || record.args_signature != signature {
            return Err(KernelError::ReplayMismatch {
                tool: tool.to_string(),
                cursor,
                detail: format!(
                    "expected {} [{}], got {} [{}]",
                    record.tool,
                    &record.args_signature[..record.args_signature.len().min(12)],
                    tool,
                    &signature[..12]
                ),
            });
        }

        let hit = ReplayHit {
            response: record.response.clone(),
            latency_ms: record.dt_ms,
            events: record
                .emits
                .iter()
                .map(|e| (record.t_start + e.dt_ms, e.target.clone(), e.payload.clone()))
                .collect(),
        };
        *self.cursors.entry(connector.to_string()).or_default() += 1;

        if let Some(node) = next_node {
            self.dom_cursor = Some(node);
        } else if tool.starts_with("browser.") {
            // browser.open and friends report the page they landed on
            if let Some(node) = hit.response.get("node_id").and_then(Value::as_str) {
                if self.navigator.as_ref().map_or(false, |n| n.contains(node)) {
                    self.dom_cursor = Some(node.to_string());
                }
            }
        }
        Ok(hit)
    }
}

/// Captures a sim-mode session into a bundle.
#[derive(Debug, Clone, Default)]
pub struct ReplayRecorder {
    records: Vec<ReplayRecord>,
}

impl ReplayRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        connector: &str,
        tool: &str,
        args: &Value,
        response: &Value,
        t_start: LogicalTime,
        dt_ms: u64,
        emits: Vec<RecordedEmit>,
    ) {
        self.records.push(ReplayRecord {
            tool: tool.to_string(),
            connector: connector.to_string(),
            args_signature: call_signature(tool, args),
            request: args.clone(),
            response: response.clone(),
            t_start,
            dt_ms,
            emits,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Builds the bundle, attaching the DOM graph when one is given.
    pub fn bundle(&self, dom: Option<&DomGraph>) -> ReplayBundle {
        ReplayBundle {
            records: self.records.clone(),
            dom_graph: dom.map(DomGraph::encode),
            dom_root: dom.map(|g| g.root().to_string()),
        }
    }
}
