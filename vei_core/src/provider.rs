//! Provider interface: the only surface connector twins see.
//!
//! A provider contributes tool specs and a handler. Handlers get a
//! `ProviderContext` exposing the current logical time, the session RNG,
//! a read view of the store, and staging buffers for mutations and
//! scheduled events. The router applies the staged operation atomically
//! after the handler returns `Ok`; on `Err` everything staged is dropped.

use crate::dom_graph::DomGraph;
use crate::error::ConnectorError;
use crate::state_store::{EntityRef, Mutation, Operation, StateStore};
use crate::tool_registry::ToolSpec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use vei_env::{LogicalTime, SessionContext};

/// A concrete, fully-bound action offered by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Affordance {
    pub tool: String,
    pub args: Value,

    /// Text matched against goal terms when ranking
    pub label: String,

    /// Stable tie-break key
    pub id: String,
}

/// An event a handler wants delivered later.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedEvent {
    pub delay_ms: u64,
    pub target: String,
    pub payload: Value,
}

/// Handler-side view of the session.
pub struct ProviderContext<'a> {
    store: &'a StateStore,
    session: &'a mut SessionContext,
    fault_sample: Option<f64>,
    error_rate: f64,
    staged: Operation,
    scheduled: Vec<StagedEvent>,
}

impl<'a> ProviderContext<'a> {
    pub fn new(
        store: &'a StateStore,
        session: &'a mut SessionContext,
        fault_sample: Option<f64>,
        kind: &str,
    ) -> Self {
        Self {
            store,
            session,
            fault_sample,
            error_rate: 0.0,
            staged: Operation::new(kind),
            scheduled: Vec::new(),
        }
    }

    /// Current logical time.
    pub fn now(&self) -> LogicalTime {
        self.session.now()
    }

    /// The committed store, without this call's staged writes.
    pub fn store(&self) -> &'a StateStore {
        self.store
    }

    /// Draws from the session's main stream.
    pub fn next_random(&mut self) -> f64 {
        self.session.rng_mut().next_random()
    }

    /// Inclusive integer draw from the session's main stream.
    pub fn randint(&mut self, lo: i64, hi: i64) -> i64 {
        self.session.rng_mut().randint(lo, hi)
    }

    /// Inclusive integer draw from a named sub-stream.
    ///
    /// Providers with their own cadence (drift) use a sub-stream so their
    /// draws never shift the main stream.
    pub fn stream_randint(&mut self, label: &str, lo: i64, hi: i64) -> i64 {
        self.session.stream(label).randint(lo, hi)
    }

    /// The single fault sample drawn for this call (sim dispatch only).
    pub fn fault_sample(&self) -> Option<f64> {
        self.fault_sample
    }

    /// True when this call's fault sample falls under `rate`.
    pub fn fault_triggered(&self, rate: f64) -> bool {
        matches!(self.fault_sample, Some(u) if u < rate)
    }

    /// Sets the connector's configured business-error rate.
    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = rate;
        self
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    /// True when this call should fail with the connector's seeded
    /// business error.
    pub fn seeded_error(&self) -> bool {
        self.fault_triggered(self.error_rate)
    }

    /// Reads an entity, including this call's staged writes.
    pub fn read(&self, family: &str, id: &str) -> Option<Value> {
        let mut current = self.store.read(family, id).cloned();
        for mutation in &self.staged.mutations {
            if mutation.target() == (family, id) {
                match mutation.apply_to(current.clone()) {
                    Ok(next) => current = Some(next),
                    Err(_) => return current,
                }
            }
        }
        current
    }

    /// Reads and deserializes an entity.
    pub fn read_as<T: DeserializeOwned>(&self, family: &str, id: &str) -> Result<Option<T>, ConnectorError> {
        match self.read(family, id) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ConnectorError::new("decode_error", format!("{}/{}: {}", family, id, e))),
        }
    }

    /// All entities of a family (staged writes included), by id.
    pub fn list(&self, family: &str) -> BTreeMap<String, Value> {
        let mut ids: Vec<String> = self
            .store
            .family(family)
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        for mutation in &self.staged.mutations {
            let (fam, id) = mutation.target();
            if fam == family && !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        ids.into_iter()
            .filter_map(|id| self.read(family, &id).map(|v| (id, v)))
            .collect()
    }

    /// Entity count of a family, staged creations included.
    pub fn count(&self, family: &str) -> usize {
        self.list(family).len()
    }

    /// Stages a create-or-replace.
    pub fn put<T: Serialize>(&mut self, family: &str, id: &str, value: &T) -> Result<(), ConnectorError> {
        let value = serde_json::to_value(value)
            .map_err(|e| ConnectorError::new("encode_error", e.to_string()))?;
        self.staged.mutations.push(Mutation::Put {
            family: family.to_string(),
            id: id.to_string(),
            value,
        });
        Ok(())
    }

    /// Stages a shallow field merge into an existing object.
    pub fn merge(&mut self, family: &str, id: &str, fields: Value) -> Result<(), ConnectorError> {
        let fields: Map<String, Value> = match fields {
            Value::Object(map) => map,
            other => {
                return Err(ConnectorError::new(
                    "encode_error",
                    format!("merge expects an object, got {}", other),
                ))
            }
        };
        self.staged.mutations.push(Mutation::Merge {
            family: family.to_string(),
            id: id.to_string(),
            fields,
        });
        Ok(())
    }

    /// Stages an append to an array field.
    pub fn push(&mut self, family: &str, id: &str, field: &str, item: Value) {
        self.staged.mutations.push(Mutation::Push {
            family: family.to_string(),
            id: id.to_string(),
            field: field.to_string(),
            item,
        });
    }

    /// Declares that `(family, id)` must exist when the operation applies.
    pub fn require(&mut self, family: &str, id: &str) {
        self.staged.requires.push(EntityRef {
            family: family.to_string(),
            id: id.to_string(),
        });
    }

    /// Schedules an event `delay_ms` after the current time.
    pub fn schedule(&mut self, delay_ms: u64, target: &str, payload: Value) {
        self.scheduled.push(StagedEvent {
            delay_ms,
            target: target.to_string(),
            payload,
        });
    }

    /// Consumes the context, returning staged writes and events.
    pub fn into_parts(self) -> (Operation, Vec<StagedEvent>) {
        (self.staged, self.scheduled)
    }
}

/// A connector twin.
///
/// Providers hold configuration only; all mutable state lives in the
/// store, which is what lets `reset` rebuild a session from scratch.
pub trait ToolProvider: Send + Sync {
    /// Connector name (`"slack"`, `"mail"`, ...).
    fn connector(&self) -> &str;

    /// Tools contributed by this provider.
    fn tools(&self) -> Vec<ToolSpec>;

    /// Stages initial entities and events for a fresh session.
    fn initialize(&self, _ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Rejects a call that is not a legal action in the current state.
    /// Runs before the call's fault sample is drawn, so a rejected call
    /// leaves every random stream where it was.
    fn precheck(&self, _tool: &str, _args: &Value, _store: &StateStore) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Executes one tool call.
    fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError>;

    /// Validates an externally injected event payload before scheduling.
    fn check_event(&self, _payload: &Value, _store: &StateStore) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Delivers a due event targeted at this connector.
    fn deliver(&self, _payload: &Value, _ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        Err(ConnectorError::new(
            "unsupported_event",
            format!("{} does not accept events", self.connector()),
        ))
    }

    /// Called for every provider after any event delivery.
    fn on_delivered(
        &self,
        _target: &str,
        _payload: &Value,
        _ctx: &mut ProviderContext<'_>,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Whether this connector receives events (listed in pending counts).
    fn accepts_events(&self) -> bool {
        false
    }

    /// One-line summary for observations.
    fn summary(&self, _store: &StateStore) -> Option<String> {
        None
    }

    /// Concrete actions available in the current state.
    fn affordances(&self, _store: &StateStore) -> Vec<Affordance> {
        Vec::new()
    }

    /// DOM graph for browser-like connectors.
    fn dom_graph(&self) -> Option<&DomGraph> {
        None
    }
}

/// Best-effort live backend for a connector in live mode.
///
/// Live calls bypass the simulation and are outside the determinism
/// contract.
pub trait LiveConnector: Send {
    fn call(&mut self, tool: &str, args: &Value) -> Result<Value, ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reads_see_staged_writes() {
        let mut store = StateStore::new();
        store
            .seed(&[Mutation::Put {
                family: "mail.folders".into(),
                id: "INBOX".into(),
                value: json!({"ids": []}),
            }])
            .unwrap();
        let mut session = SessionContext::new(1);
        let mut ctx = ProviderContext::new(&store, &mut session, None, "mail.compose");

        ctx.put("mail.messages", "m1", &json!({"subj": "Quote"})).unwrap();
        ctx.push("mail.folders", "INBOX", "ids", json!("m1"));

        assert_eq!(ctx.read("mail.messages", "m1").unwrap()["subj"], "Quote");
        assert_eq!(ctx.read("mail.folders", "INBOX").unwrap()["ids"], json!(["m1"]));
        assert_eq!(ctx.count("mail.messages"), 1);
        // Store untouched until the router applies
        assert!(store.read("mail.messages", "m1").is_none());
    }

    #[test]
    fn test_into_parts_returns_staging() {
        let store = StateStore::new();
        let mut session = SessionContext::new(1);
        let mut ctx = ProviderContext::new(&store, &mut session, Some(0.05), "slack.send_message");
        assert!(ctx.fault_triggered(0.1));
        assert!(!ctx.fault_triggered(0.05));
        ctx.schedule(7_000, "slack", json!({"text": "derail"}));
        ctx.require("slack.channels", "#procurement");
        let (op, events) = ctx.into_parts();
        assert_eq!(op.kind, "slack.send_message");
        assert_eq!(op.requires.len(), 1);
        assert_eq!(events[0].delay_ms, 7_000);
    }

    #[test]
    fn test_stream_draws_leave_main_stream_alone() {
        let store = StateStore::new();
        let mut a = SessionContext::new(3);
        let mut b = SessionContext::new(3);
        {
            let mut ctx = ProviderContext::new(&store, &mut a, None, "drift");
            ctx.stream_randint("drift", 0, 100);
        }
        let mut ctx_a = ProviderContext::new(&store, &mut a, None, "x");
        let x = ctx_a.randint(0, 1_000_000);
        let mut ctx_b = ProviderContext::new(&store, &mut b, None, "x");
        assert_eq!(x, ctx_b.randint(0, 1_000_000));
    }

    #[test]
    fn test_merge_requires_object() {
        let store = StateStore::new();
        let mut session = SessionContext::new(1);
        let mut ctx = ProviderContext::new(&store, &mut session, None, "x");
        assert!(ctx.merge("a", "b", json!([1])).is_err());
    }
}
