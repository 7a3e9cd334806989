//! Tool router: the single entry point for agent calls.
//!
//! One dispatch runs validation, execution (sim, replay or live),
//! receipt + trace, a bounded event drain, the latency advance and the
//! monitor pass, in that order. Only a `StateInvariantViolation` stops a
//! session; after one, every call returns `Halted` until `reset`.

use crate::archive::ReceiptArchive;
use crate::config::{ConnectorMode, RouterConfig};
use crate::error::{ConnectorError, InvariantReport, KernelError, StoreError};
use crate::event_bus::{EventBus, ScheduledEvent};
use crate::monitor::{default_monitors, run_monitors, Finding, Monitor, MonitorInput};
use crate::observation::{Observation, ObservationBuilder};
use crate::policy::{PolicyEngine, PolicyFinding};
use crate::provider::{LiveConnector, ProviderContext, StagedEvent, ToolProvider};
use crate::replay::{RecordedEmit, ReplayBundle, ReplayMatcher, ReplayRecorder};
use crate::schema::{ArgKind, ArgsSchema};
use crate::state_store::{Operation, Receipt, Snapshot, StateDiff, StateStore};
use crate::tool_registry::{SideEffect, ToolOwner, ToolRegistry, ToolSpec};
use crate::trace::{TraceEntry, Tracer};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use vei_env::{LogicalTime, Seed, SessionContext};

/// RNG sub-stream used for the per-call fault sample.
const FAULT_STREAM: &str = "faults";

const ACT_AND_OBSERVE: &str = "vei.act_and_observe";

/// Where the router is inside a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterPhase {
    Idle,
    Validating,
    Executing,
    EventDraining,
    ObservationBuilding,
    Halted,
}

/// Pending events per connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingReport {
    #[serde(flatten)]
    pub by_connector: BTreeMap<String, usize>,
    pub total: usize,
}

/// Result of `tick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Events delivered per connector
    pub delivered: BTreeMap<String, usize>,
    pub time_ms: LogicalTime,
    pub pending: PendingReport,
}

/// Result of `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub ok: bool,
    pub seed: Seed,
    pub time_ms: LogicalTime,
}

/// Result of `act_and_observe`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActOutcome {
    /// Tool response or `{error: {code, message}}`
    pub result: Value,
    pub observation: Observation,
}

/// Kernel introspection returned by `vei.state`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelState {
    pub seed: Seed,
    pub session_id: String,
    pub time_ms: LogicalTime,
    pub revision: u64,
    pub focus: String,
    pub phase: RouterPhase,
    pub receipts: Vec<Receipt>,
    pub tool_counts: BTreeMap<String, u64>,
    pub deliveries: BTreeMap<String, u64>,
    pub findings: Vec<Finding>,
    pub policy_findings: Vec<PolicyFinding>,
    pub pending: PendingReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_cursor: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Snapshot>,
}

fn kernel_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new("vei.observe", "Drain due events, advance time and return an observation")
            .with_args(ArgsSchema::new().optional("focus", ArgKind::Str)),
        ToolSpec::new("vei.tick", "Advance logical time, delivering every event due on the way")
            .with_args(ArgsSchema::new().required("dt_ms", ArgKind::Int))
            .with_side_effects(&[SideEffect::Schedule]),
        ToolSpec::new("vei.pending", "Pending event counts per connector"),
        ToolSpec::new("vei.state", "Kernel state: receipts, counters, findings")
            .with_args(
                ArgsSchema::new()
                    .optional("include_state", ArgKind::Bool)
                    .optional("tail", ArgKind::Int),
            ),
        ToolSpec::new("vei.inject", "Schedule an external event for a connector")
            .with_args(
                ArgsSchema::new()
                    .required("target", ArgKind::Str)
                    .required("payload", ArgKind::Object)
                    .optional("dt_ms", ArgKind::Int),
            )
            .with_side_effects(&[SideEffect::Schedule]),
        ToolSpec::new(ACT_AND_OBSERVE, "Dispatch a tool call and return the observation after it")
            .with_args(
                ArgsSchema::new()
                    .required("tool", ArgKind::Str)
                    .optional("args", ArgKind::Object),
            ),
    ]
}

/// Builder for [`Router`].
pub struct RouterBuilder {
    config: RouterConfig,
    providers: Vec<Arc<dyn ToolProvider>>,
    alias_packs: Vec<String>,
    monitors: Vec<Box<dyn Monitor>>,
    replay: Option<ReplayBundle>,
    live: BTreeMap<String, Box<dyn LiveConnector>>,
}

impl RouterBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            alias_packs: Vec::new(),
            monitors: default_monitors(),
            replay: None,
            live: BTreeMap::new(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn providers(mut self, providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    /// Registers a vendor alias pack (`xero`, `hubspot`, ...).
    pub fn alias_pack(mut self, pack: &str) -> Self {
        self.alias_packs.push(pack.to_string());
        self
    }

    pub fn monitor(mut self, monitor: Box<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    pub fn without_default_monitors(mut self) -> Self {
        self.monitors.clear();
        self
    }

    pub fn replay_bundle(mut self, bundle: ReplayBundle) -> Self {
        self.replay = Some(bundle);
        self
    }

    pub fn live_connector(mut self, connector: &str, backend: Box<dyn LiveConnector>) -> Self {
        self.live.insert(connector.to_string(), backend);
        self
    }

    pub fn build(self) -> Result<Router, KernelError> {
        let mut registry = ToolRegistry::new();
        for spec in kernel_tools() {
            registry.register(spec, ToolOwner::Kernel)?;
        }

        let mut connectors = BTreeSet::new();
        for (index, provider) in self.providers.iter().enumerate() {
            let connector = provider.connector();
            if !connectors.insert(connector.to_string()) {
                return Err(KernelError::invalid_argument(format!(
                    "connector {} registered twice",
                    connector
                )));
            }
            for spec in provider.tools() {
                if spec.connector() != connector {
                    return Err(KernelError::invalid_argument(format!(
                        "{} registers foreign tool {}",
                        connector, spec.name
                    )));
                }
                registry.register(spec, ToolOwner::Provider(index))?;
            }
        }
        for pack in &self.alias_packs {
            let added = registry.register_alias_pack(pack)?;
            debug!(pack = %pack, added, "alias pack registered");
        }

        let policy = PolicyEngine::with_overrides(&self.config.policy_overrides)
            .map_err(KernelError::InvalidArgument)?;
        let tracer = match &self.config.trace_path {
            Some(path) => Tracer::with_file(path)?,
            None => Tracer::new(),
        };
        let archive = match &self.config.state_dir {
            Some(dir) => Some(ReceiptArchive::open(dir)?),
            None => None,
        };

        let seed = self.config.seed;
        let mut router = Router {
            session: SessionContext::new(seed),
            registry,
            providers: self.providers,
            store: StateStore::new(),
            bus: EventBus::new(),
            tracer,
            monitors: self.monitors,
            policy,
            findings: Vec::new(),
            policy_findings: Vec::new(),
            tool_counts: BTreeMap::new(),
            deliveries: BTreeMap::new(),
            focus: self.config.initial_focus.clone(),
            phase: RouterPhase::Idle,
            halted: None,
            replay: self.replay.as_ref().map(ReplayMatcher::new),
            replay_bundle: self.replay,
            recorder: self.config.record.then(ReplayRecorder::new),
            live: self.live,
            archive,
            config: self.config,
        };
        if let Some(archive) = &router.archive {
            archive.clear()?;
        }
        router.initialize()?;

        info!(
            seed,
            providers = router.providers.len(),
            tools = router.registry.len(),
            "router ready"
        );
        Ok(router)
    }
}

/// The simulation kernel's tool router.
pub struct Router {
    config: RouterConfig,
    session: SessionContext,
    registry: ToolRegistry,
    providers: Vec<Arc<dyn ToolProvider>>,
    store: StateStore,
    bus: EventBus,
    tracer: Tracer,
    monitors: Vec<Box<dyn Monitor>>,
    policy: PolicyEngine,
    findings: Vec<Finding>,
    policy_findings: Vec<PolicyFinding>,
    tool_counts: BTreeMap<String, u64>,
    deliveries: BTreeMap<String, u64>,
    focus: String,
    phase: RouterPhase,
    halted: Option<Box<InvariantReport>>,
    replay: Option<ReplayMatcher>,
    replay_bundle: Option<ReplayBundle>,
    recorder: Option<ReplayRecorder>,
    live: BTreeMap<String, Box<dyn LiveConnector>>,
    archive: Option<ReceiptArchive>,
}

impl Router {
    /// Router with default monitors and no alias packs.
    pub fn new(config: RouterConfig, providers: Vec<Arc<dyn ToolProvider>>) -> Result<Self, KernelError> {
        RouterBuilder::new(config).providers(providers).build()
    }

    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder::new(config)
    }

    // ------------------------------------------------------------------
    // Agent-facing operations
    // ------------------------------------------------------------------

    /// Executes one tool call.
    ///
    /// Recoverable failures come back as `Err` after being traced; they
    /// leave no receipt, drain nothing and do not advance time.
    pub fn dispatch(&mut self, tool: &str, args: &Value) -> Result<Value, KernelError> {
        self.ensure_running()?;
        let result = self.run_call(tool, args);
        match &result {
            Err(err) if err.is_fatal() => self.halt(err),
            Err(err) => {
                if let KernelError::ReplayMismatch { cursor, detail, .. } = err {
                    error!(tool, cursor, detail = %detail, "replay mismatch");
                } else {
                    debug!(tool, code = err.code(), "call rejected");
                }
                let entry = TraceEntry::call(self.now(), tool, args, &err.to_response());
                if let Err(trace_err) = self.tracer.record(entry) {
                    warn!(error = %trace_err, "failed to trace rejected call");
                }
                self.phase = RouterPhase::Idle;
            }
            Ok(_) => self.phase = RouterPhase::Idle,
        }
        result
    }

    /// Like `dispatch`, but renders recoverable errors as the
    /// `{error: {code, message}}` response. Only fatal errors are `Err`.
    pub fn call(&mut self, tool: &str, args: &Value) -> Result<Value, KernelError> {
        match self.dispatch(tool, args) {
            Ok(response) => Ok(response),
            Err(err) if !err.is_fatal() => Ok(err.to_response()),
            Err(err) => Err(err),
        }
    }

    /// Dispatches a call and returns the observation of the resulting state.
    pub fn act_and_observe(&mut self, tool: &str, args: &Value) -> Result<ActOutcome, KernelError> {
        let result = self.call(tool, args)?;
        self.phase = RouterPhase::ObservationBuilding;
        let observation = self.observation();
        self.phase = RouterPhase::Idle;
        Ok(ActOutcome { result, observation })
    }

    /// Drains due events, advances time and returns an observation.
    pub fn observe(&mut self, focus: Option<&str>) -> Result<Observation, KernelError> {
        self.guarded(|router| router.observe_inner(focus))
    }

    /// Advances time by `dt_ms`, delivering every event due on the way.
    pub fn tick(&mut self, dt_ms: i64) -> Result<TickReport, KernelError> {
        self.guarded(|router| router.tick_inner(dt_ms))
    }

    /// Schedules an external event for a connector, `dt_ms` from now.
    pub fn inject(&mut self, target: &str, payload: Value, dt_ms: i64) -> Result<Value, KernelError> {
        self.guarded(|router| router.inject_inner(target, payload, dt_ms))
    }

    /// Schedules every event recorded in `bundle`, offset from now by the
    /// time it was emitted in the recording. Records of replayed
    /// connectors are skipped since matching their calls schedules the
    /// same events. All events are checked before any is queued.
    pub fn prime_events(&mut self, bundle: &ReplayBundle) -> Result<usize, KernelError> {
        self.guarded(|router| router.prime_inner(bundle))
    }

    pub fn pending(&self) -> PendingReport {
        let mut by_connector: BTreeMap<String, usize> = self
            .providers
            .iter()
            .filter(|p| p.accepts_events())
            .map(|p| (p.connector().to_string(), 0))
            .collect();
        by_connector.extend(self.bus.pending_counts());
        PendingReport {
            total: self.bus.len(),
            by_connector,
        }
    }

    /// Rebuilds the session under `seed` (or the configured one).
    pub fn reset(&mut self, seed: Option<Seed>) -> Result<ResetReport, KernelError> {
        let seed = seed.unwrap_or(self.config.seed);
        self.session = SessionContext::new(seed);
        self.store = StateStore::new();
        self.bus = EventBus::new();
        self.tracer.reset()?;
        if let Some(archive) = &self.archive {
            archive.clear()?;
        }
        self.findings.clear();
        self.policy_findings.clear();
        self.tool_counts.clear();
        self.deliveries.clear();
        self.focus = self.config.initial_focus.clone();
        self.halted = None;
        self.phase = RouterPhase::Idle;
        self.replay = self.replay_bundle.as_ref().map(ReplayMatcher::new);
        self.recorder = self.config.record.then(ReplayRecorder::new);
        self.initialize()?;

        info!(seed, "session reset");
        Ok(ResetReport {
            ok: true,
            seed,
            time_ms: self.now(),
        })
    }

    /// Kernel introspection. `tail` limits the receipts returned.
    pub fn state(&self, include_state: bool, tail: usize) -> KernelState {
        KernelState {
            seed: self.session.seed(),
            session_id: self.session.session_id().to_string(),
            time_ms: self.now(),
            revision: self.store.revision(),
            focus: self.focus.clone(),
            phase: self.phase,
            receipts: self.store.receipt_tail(tail),
            tool_counts: self.tool_counts.clone(),
            deliveries: self.deliveries.clone(),
            findings: self.findings.clone(),
            policy_findings: self.policy_findings.clone(),
            pending: self.pending(),
            replay_cursor: self.replay.as_ref().map(ReplayMatcher::cursor),
            state: include_state.then(|| self.store.snapshot()),
        }
    }

    /// Observation of the current state without side effects.
    pub fn observation(&self) -> Observation {
        self.observation_builder()
            .build(&self.focus, self.now(), self.bus.pending_counts())
    }

    /// Swaps in a replay bundle; takes effect immediately and on every reset.
    pub fn load_replay(&mut self, bundle: ReplayBundle) {
        self.replay = Some(ReplayMatcher::new(&bundle));
        self.replay_bundle = Some(bundle);
    }

    /// Attaches a live backend for a connector.
    pub fn attach_live(&mut self, connector: &str, backend: Box<dyn LiveConnector>) {
        self.live.insert(connector.to_string(), backend);
    }

    /// Registers a vendor alias pack after construction.
    pub fn register_alias_pack(&mut self, pack: &str) -> Result<usize, KernelError> {
        self.registry.register_alias_pack(pack)
    }

    /// Bundle captured so far, if recording is enabled.
    pub fn replay_bundle(&self) -> Option<ReplayBundle> {
        let dom = self.providers.iter().find_map(|p| p.dom_graph());
        self.recorder.as_ref().map(|r| r.bundle(dom))
    }

    pub fn snapshot_at(&self, revision: u64) -> Result<Snapshot, KernelError> {
        self.store.snapshot_at(revision)
    }

    pub fn diff(&self, from: u64, to: u64) -> Result<StateDiff, KernelError> {
        self.store.diff(from, to)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn now(&self) -> LogicalTime {
        self.session.now()
    }

    pub fn seed(&self) -> Seed {
        self.session.seed()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn policy_findings(&self) -> &[PolicyFinding] {
        &self.policy_findings
    }

    pub fn tool_counts(&self) -> &BTreeMap<String, u64> {
        &self.tool_counts
    }

    pub fn focus(&self) -> &str {
        &self.focus
    }

    pub fn phase(&self) -> RouterPhase {
        self.phase
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn replay_cursor(&self) -> Option<usize> {
        self.replay.as_ref().map(ReplayMatcher::cursor)
    }

    /// Flushes the receipt archive, if one is configured.
    pub fn flush(&self) -> Result<(), KernelError> {
        match &self.archive {
            Some(archive) => archive.flush(),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Step internals
    // ------------------------------------------------------------------

    fn observation_builder(&self) -> ObservationBuilder<'_> {
        ObservationBuilder::new(&self.registry, &self.providers, &self.store, &self.config.goal_terms)
    }

    fn enter(&mut self, phase: RouterPhase) {
        trace!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    fn ensure_running(&self) -> Result<(), KernelError> {
        match &self.halted {
            Some(report) => Err(KernelError::Halted(report.clone())),
            None => Ok(()),
        }
    }

    fn guarded<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        self.ensure_running()?;
        let result = step(self);
        if let Err(err) = &result {
            if err.is_fatal() {
                self.halt(err);
            }
        }
        if self.halted.is_none() {
            self.phase = RouterPhase::Idle;
        }
        result
    }

    fn halt(&mut self, err: &KernelError) {
        let report = match err {
            KernelError::StateInvariantViolation(report) | KernelError::Halted(report) => report.clone(),
            other => Box::new(self.report(other.to_string())),
        };
        error!(
            message = %report.message,
            revision = report.revision,
            time_ms = report.time_ms,
            "state invariant violated; session halted"
        );
        self.halted = Some(report);
        self.phase = RouterPhase::Halted;
    }

    fn report(&self, message: String) -> InvariantReport {
        InvariantReport {
            message,
            revision: self.store.revision(),
            time_ms: self.now(),
            recent_receipts: self.store.receipt_tail(self.config.receipt_tail),
        }
    }

    fn invariant(&self, message: String) -> KernelError {
        KernelError::StateInvariantViolation(Box::new(self.report(message)))
    }

    fn provider_for(&self, connector: &str) -> Option<Arc<dyn ToolProvider>> {
        self.providers
            .iter()
            .find(|p| p.connector() == connector)
            .cloned()
    }

    fn accepts(&self, target: &str) -> bool {
        self.providers
            .iter()
            .any(|p| p.connector() == target && p.accepts_events())
    }

    /// Seeds every provider's initial state and events at revision 0.
    fn initialize(&mut self) -> Result<(), KernelError> {
        for provider in self.providers.clone() {
            let kind = format!("{}.initialize", provider.connector());
            let mut ctx = ProviderContext::new(&self.store, &mut self.session, None, &kind);
            let outcome = provider.initialize(&mut ctx);
            let (op, events) = ctx.into_parts();
            outcome.map_err(|e| {
                KernelError::invalid_argument(format!("{} failed to initialize: {}", provider.connector(), e))
            })?;
            self.store.seed(&op.mutations)?;
            self.schedule_staged(events)?;
        }
        debug!(
            entities = self.store.snapshot().entity_count(),
            pending = self.bus.len(),
            "session initialized"
        );
        Ok(())
    }

    fn run_call(&mut self, tool: &str, args: &Value) -> Result<Value, KernelError> {
        if self.phase != RouterPhase::Idle {
            return Err(self.invariant(format!("dispatch entered in phase {:?}", self.phase)));
        }
        self.enter(RouterPhase::Validating);
        let resolved = self.registry.resolve(tool)?;
        let spec = resolved.spec.clone();
        let owner = resolved.owner;
        spec.args
            .validate(args)
            .map_err(|msg| KernelError::invalid_action(format!("{}: {}", tool, msg)))?;

        let index = match owner {
            ToolOwner::Kernel => return self.run_kernel_tool(tool, &spec.name, args),
            ToolOwner::Provider(index) => index,
        };
        if self.config.menu_restricted && !self.observation_builder().allows(&spec.name, args) {
            return Err(KernelError::invalid_action(format!(
                "{} with these arguments is not in the action menu",
                tool
            )));
        }

        let connector = spec.connector().to_string();
        let t_start = self.now();
        let rev_before = self.store.revision();
        self.enter(RouterPhase::Executing);
        let (response, latency_ms, emits) = match self.config.mode_for(&connector) {
            ConnectorMode::Sim => self.execute_sim(index, &spec, args)?,
            ConnectorMode::Replay => self.execute_replay(&connector, tool, args)?,
            ConnectorMode::Live => self.execute_live(&connector, &spec, args)?,
        };

        let entry = self.finish_call(tool, args, &response, t_start)?;
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(&connector, tool, args, &response, t_start, latency_ms, emits);
        }

        self.enter(RouterPhase::EventDraining);
        self.drain_due(self.config.drain_policy.limit())?;
        self.advance(latency_ms)?;
        self.inspect(rev_before, &entry)?;
        self.focus = connector;

        debug!(tool, latency_ms, revision = self.store.revision(), "call complete");
        Ok(response)
    }

    fn execute_sim(
        &mut self,
        index: usize,
        spec: &ToolSpec,
        args: &Value,
    ) -> Result<(Value, u64, Vec<RecordedEmit>), KernelError> {
        let provider = match self.providers.get(index) {
            Some(provider) => Arc::clone(provider),
            None => return Err(self.invariant(format!("{} owned by missing provider {}", spec.name, index))),
        };
        provider.precheck(&spec.name, args, &self.store)?;

        let sample = self.session.stream(FAULT_STREAM).next_random();
        if let Some(rate) = self.config.faults.tool_overrides.get(&spec.name) {
            if sample < *rate {
                return Err(ConnectorError::new(
                    "fault.injected",
                    format!("injected fault in {} (p={})", spec.name, rate),
                )
                .into());
            }
        }

        let error_rate = self.config.faults.error_rates.get(spec.connector()).copied().unwrap_or(0.0);
        let mut ctx = ProviderContext::new(&self.store, &mut self.session, Some(sample), &spec.name)
            .with_error_rate(error_rate);
        let response = provider.call(&spec.name, args, &mut ctx)?;
        let (op, events) = ctx.into_parts();
        self.commit(&op)?;
        let emits = self.schedule_staged(events)?;

        let profile = spec.latency.unwrap_or(self.config.faults.latency);
        Ok((response, profile.sample(Some(sample)), emits))
    }

    fn execute_replay(
        &mut self,
        connector: &str,
        tool: &str,
        args: &Value,
    ) -> Result<(Value, u64, Vec<RecordedEmit>), KernelError> {
        let matcher = self.replay.as_mut().ok_or_else(|| KernelError::ReplayMismatch {
            tool: tool.to_string(),
            cursor: 0,
            detail: "no replay bundle loaded".to_string(),
        })?;
        let hit = matcher.match_call(connector, tool, args)?;

        let now = self.now();
        let mut emits = Vec::with_capacity(hit.events.len());
        for (due_time, target, payload) in hit.events {
            if !self.accepts(&target) {
                return Err(self.invariant(format!("replayed event for unknown target {}", target)));
            }
            self.bus.schedule_at(due_time, target.as_str(), payload.clone());
            emits.push(RecordedEmit {
                target,
                payload,
                dt_ms: due_time.saturating_sub(now),
            });
        }
        Ok((hit.response, hit.latency_ms, emits))
    }

    fn execute_live(
        &mut self,
        connector: &str,
        spec: &ToolSpec,
        args: &Value,
    ) -> Result<(Value, u64, Vec<RecordedEmit>), KernelError> {
        let backend = self.live.get_mut(connector).ok_or_else(|| {
            ConnectorError::new("live.unavailable", format!("no live backend attached for {}", connector))
        })?;
        let response = backend.call(&spec.name, args)?;
        let latency = spec.latency.unwrap_or(self.config.faults.latency).base_ms;
        Ok((response, latency, Vec::new()))
    }

    /// Receipt, archive, counters and trace for a successful call.
    fn finish_call(
        &mut self,
        tool: &str,
        args: &Value,
        response: &Value,
        time_ms: LogicalTime,
    ) -> Result<TraceEntry, KernelError> {
        let receipt = self.store.append_receipt(time_ms, tool, args, response);
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.record_receipt(&receipt) {
                warn!(error = %err, sequence_no = receipt.sequence_no, "receipt not archived");
            }
        }
        *self.tool_counts.entry(tool.to_string()).or_default() += 1;
        let entry = TraceEntry::call(time_ms, tool, args, response);
        self.tracer.record(entry.clone())?;
        Ok(entry)
    }

    fn run_kernel_tool(&mut self, tool: &str, name: &str, args: &Value) -> Result<Value, KernelError> {
        if name == ACT_AND_OBSERVE {
            let inner_tool = args.get("tool").and_then(Value::as_str).unwrap_or_default().to_string();
            let inner_args = args.get("args").cloned().unwrap_or_else(|| json!({}));
            self.phase = RouterPhase::Idle;
            let outcome = self.act_and_observe(&inner_tool, &inner_args)?;
            return encode(&outcome);
        }

        let rev_before = self.store.revision();
        self.enter(RouterPhase::Executing);
        let response = match name {
            "vei.observe" => {
                let focus = args.get("focus").and_then(Value::as_str).map(str::to_string);
                encode(&self.observe_inner(focus.as_deref())?)?
            }
            "vei.tick" => {
                let dt_ms = args.get("dt_ms").and_then(Value::as_i64).unwrap_or_default();
                encode(&self.tick_inner(dt_ms)?)?
            }
            "vei.pending" => encode(&self.pending())?,
            "vei.state" => {
                let include_state = args.get("include_state").and_then(Value::as_bool).unwrap_or(false);
                let tail = args
                    .get("tail")
                    .and_then(Value::as_u64)
                    .map_or(self.config.receipt_tail, |n| n as usize);
                encode(&self.state(include_state, tail))?
            }
            "vei.inject" => {
                let target = args.get("target").and_then(Value::as_str).unwrap_or_default().to_string();
                let payload = args.get("payload").cloned().unwrap_or_else(|| json!({}));
                let dt_ms = args.get("dt_ms").and_then(Value::as_i64).unwrap_or(0);
                self.inject_inner(&target, payload, dt_ms)?
            }
            other => return Err(KernelError::UnknownTool(other.to_string())),
        };

        let entry = self.finish_call(tool, args, &response, self.now())?;
        self.inspect(rev_before, &entry)?;
        Ok(response)
    }

    fn observe_inner(&mut self, focus: Option<&str>) -> Result<Observation, KernelError> {
        self.enter(RouterPhase::EventDraining);
        self.drain_due(self.config.drain_policy.limit())?;
        self.advance(self.config.observe_advance_ms)?;
        if let Some(focus) = focus {
            self.focus = focus.to_string();
        }
        self.enter(RouterPhase::ObservationBuilding);
        Ok(self.observation())
    }

    fn tick_inner(&mut self, dt_ms: i64) -> Result<TickReport, KernelError> {
        if dt_ms < 0 {
            return Err(KernelError::invalid_argument(format!(
                "tick dt_ms must be >= 0, got {}",
                dt_ms
            )));
        }
        let target = self
            .now()
            .checked_add(dt_ms as u64)
            .ok_or_else(|| KernelError::invalid_argument("tick overflows the clock"))?;

        self.enter(RouterPhase::EventDraining);
        let mut delivered: BTreeMap<String, usize> = BTreeMap::new();
        while let Some(event) = self.bus.pop_due(target) {
            *delivered.entry(event.target.clone()).or_default() += 1;
            self.deliver(event)?;
        }
        self.session.clock_mut().advance_to(target)?;

        debug!(dt_ms, delivered = delivered.values().sum::<usize>(), time_ms = target, "tick");
        Ok(TickReport {
            delivered,
            time_ms: self.now(),
            pending: self.pending(),
        })
    }

    fn inject_inner(&mut self, target: &str, payload: Value, dt_ms: i64) -> Result<Value, KernelError> {
        if dt_ms < 0 {
            return Err(KernelError::invalid_argument(format!(
                "inject dt_ms must be >= 0, got {}",
                dt_ms
            )));
        }
        let provider = self
            .provider_for(target)
            .filter(|p| p.accepts_events())
            .ok_or_else(|| KernelError::invalid_action(format!("{} does not accept events", target)))?;
        provider
            .check_event(&payload, &self.store)
            .map_err(|e| KernelError::invalid_action(format!("{}: {}", target, e.message)))?;

        let handle = self.bus.schedule(self.now(), dt_ms, target, payload)?;
        Ok(json!({
            "scheduled": true,
            "target": target,
            "due_time": handle.due_time,
        }))
    }

    fn prime_inner(&mut self, bundle: &ReplayBundle) -> Result<usize, KernelError> {
        let now = self.now();
        let mut primed = Vec::new();
        for record in &bundle.records {
            if self.config.mode_for(record.lane()) == ConnectorMode::Replay {
                continue;
            }
            for emit in &record.emits {
                let provider = self
                    .provider_for(&emit.target)
                    .filter(|p| p.accepts_events())
                    .ok_or_else(|| KernelError::invalid_action(format!("{} does not accept events", emit.target)))?;
                provider
                    .check_event(&emit.payload, &self.store)
                    .map_err(|e| KernelError::invalid_action(format!("{}: {}", emit.target, e.message)))?;
                let due = now.saturating_add(record.t_start).saturating_add(emit.dt_ms);
                primed.push((due, emit.target.clone(), emit.payload.clone()));
            }
        }

        let count = primed.len();
        for (due, target, payload) in primed {
            self.bus.schedule_at(due, target, payload);
        }
        info!(count, records = bundle.records.len(), "primed recorded events");
        Ok(count)
    }

    fn advance(&mut self, dt_ms: u64) -> Result<(), KernelError> {
        let dt = i64::try_from(dt_ms).map_err(|_| KernelError::invalid_argument("advance overflows the clock"))?;
        self.session.clock_mut().advance(dt)?;
        Ok(())
    }

    /// Applies a handler's staged operation; conflicts are recoverable.
    fn commit(&mut self, op: &Operation) -> Result<(), StoreError> {
        if op.is_empty() {
            return Ok(());
        }
        self.store.apply(op, self.now())?;
        if let Some(archive) = &self.archive {
            match archive.maybe_record_snapshot(&self.store.snapshot()) {
                Ok(true) => debug!(revision = self.store.revision(), "snapshot archived"),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "snapshot not archived"),
            }
        }
        Ok(())
    }

    /// Applies an operation staged during delivery; conflicts are kernel bugs.
    fn commit_internal(&mut self, op: &Operation) -> Result<(), KernelError> {
        self.commit(op)
            .map_err(|e| self.invariant(format!("{} could not be applied: {}", op.kind, e)))
    }

    fn schedule_staged(&mut self, events: Vec<StagedEvent>) -> Result<Vec<RecordedEmit>, KernelError> {
        let now = self.now();
        let mut emits = Vec::with_capacity(events.len());
        for event in events {
            if !self.accepts(&event.target) {
                return Err(self.invariant(format!("event scheduled for unknown target {}", event.target)));
            }
            let due_time = now
                .checked_add(event.delay_ms)
                .ok_or_else(|| KernelError::invalid_argument("due time overflows"))?;
            self.bus.schedule_at(due_time, event.target.as_str(), event.payload.clone());
            emits.push(RecordedEmit {
                target: event.target,
                payload: event.payload,
                dt_ms: event.delay_ms,
            });
        }
        Ok(emits)
    }

    fn drain_due(&mut self, limit: Option<usize>) -> Result<usize, KernelError> {
        let events = self.bus.drain(self.now(), limit);
        let count = events.len();
        for event in events {
            self.deliver(event)?;
        }
        Ok(count)
    }

    fn deliver(&mut self, event: ScheduledEvent) -> Result<(), KernelError> {
        if event.due_time > self.now() {
            self.session.clock_mut().advance_to(event.due_time)?;
        }
        let now = self.now();

        let emitted = if self.config.mode_for(&event.target) == ConnectorMode::Replay {
            json!({ "replayed": true })
        } else {
            let provider = self
                .provider_for(&event.target)
                .ok_or_else(|| self.invariant(format!("orphan event target {}", event.target)))?;
            let kind = format!("{}.deliver", event.target);
            let mut ctx = ProviderContext::new(&self.store, &mut self.session, None, &kind);
            let outcome = provider.deliver(&event.payload, &mut ctx);
            let (op, staged) = ctx.into_parts();
            let emitted = outcome
                .map_err(|e| self.invariant(format!("delivery to {} failed: {}", event.target, e)))?;
            self.commit_internal(&op)?;
            self.schedule_staged(staged)?;
            emitted
        };

        *self.deliveries.entry(event.target.clone()).or_default() += 1;
        self.tracer
            .record(TraceEntry::event(now, &event.target, &event.payload, &emitted))?;

        for provider in self.providers.clone() {
            let kind = format!("{}.on_delivered", provider.connector());
            let mut ctx = ProviderContext::new(&self.store, &mut self.session, None, &kind);
            let outcome = provider.on_delivered(&event.target, &event.payload, &mut ctx);
            let (op, staged) = ctx.into_parts();
            outcome.map_err(|e| {
                self.invariant(format!("{} failed after delivery: {}", provider.connector(), e))
            })?;
            self.commit_internal(&op)?;
            self.schedule_staged(staged)?;
        }

        trace!(connector = %event.target, due_time = event.due_time, "event delivered");
        Ok(())
    }

    fn inspect(&mut self, rev_before: u64, entry: &TraceEntry) -> Result<(), KernelError> {
        if self.monitors.is_empty() {
            return Ok(());
        }
        let diff = self.store.diff(rev_before, self.store.revision())?;
        let input = MonitorInput {
            diff: &diff,
            entry,
            store: &self.store,
            tool_counts: &self.tool_counts,
            deliveries: &self.deliveries,
            time_ms: self.now(),
        };
        let findings = run_monitors(&self.monitors, &input);
        if findings.is_empty() {
            return Ok(());
        }
        let promoted = self.policy.evaluate(&findings);
        for finding in &findings {
            debug!(monitor = %finding.monitor, code = %finding.code, severity = %finding.severity, "finding");
        }
        for promoted in &promoted {
            warn!(code = %promoted.code, severity = %promoted.severity, "policy finding");
        }
        self.findings.extend(findings);
        self.policy_findings.extend(promoted);
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, KernelError> {
    serde_json::to_value(value).map_err(|e| KernelError::Persistence(format!("encode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DrainPolicy;
    use crate::provider::Affordance;

    /// Small twin: notes are stored, each note schedules an echo event.
    struct DeskProvider;

    impl ToolProvider for DeskProvider {
        fn connector(&self) -> &str {
            "desk"
        }

        fn tools(&self) -> Vec<ToolSpec> {
            vec![
                ToolSpec::new("desk.note", "Write a note")
                    .with_args(ArgsSchema::new().required("text", ArgKind::Str))
                    .with_side_effects(&[SideEffect::Write, SideEffect::Schedule])
                    .with_latency(250, 0)
                    .concrete(),
                ToolSpec::new("desk.list", "List notes").generic(),
                ToolSpec::new("desk.flaky", "Fails on a high fault sample")
                    .with_latency(100, 0)
                    .generic(),
                ToolSpec::new("desk.stray", "Schedules an event nobody receives").generic(),
            ]
        }

        fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
            ctx.put("desk.meta", "main", &json!({ "notes": [], "echoes": 0 }))?;
            ctx.schedule(10_000, "desk", json!({ "text": "welcome" }));
            Ok(())
        }

        fn call(&self, tool: &str, args: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
            match tool {
                "desk.note" => {
                    let text = args["text"].as_str().unwrap_or_default().to_string();
                    ctx.require("desk.meta", "main");
                    ctx.push("desk.meta", "main", "notes", json!(text));
                    ctx.schedule(0, "desk", json!({ "text": format!("echo:{}", text) }));
                    Ok(json!({ "ok": true }))
                }
                "desk.list" => Ok(ctx.read("desk.meta", "main").unwrap_or(Value::Null)),
                "desk.flaky" => {
                    if ctx.fault_triggered(0.5) {
                        Err(ConnectorError::new("desk.busy", "try later"))
                    } else {
                        Ok(json!({ "ok": true }))
                    }
                }
                "desk.stray" => {
                    ctx.schedule(0, "nowhere", json!({}));
                    Ok(json!({ "ok": true }))
                }
                other => Err(ConnectorError::new("unknown_tool", other)),
            }
        }

        fn deliver(&self, payload: &Value, ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
            if payload.get("boom").is_some() {
                return Err(ConnectorError::new("desk.corrupt", "cannot deliver"));
            }
            let echoes = ctx
                .read("desk.meta", "main")
                .and_then(|m| m["echoes"].as_u64())
                .unwrap_or(0);
            ctx.merge("desk.meta", "main", json!({ "echoes": echoes + 1 }))?;
            Ok(json!({ "echo": payload["text"].clone() }))
        }

        fn accepts_events(&self) -> bool {
            true
        }

        fn summary(&self, store: &StateStore) -> Option<String> {
            let notes = store
                .read("desk.meta", "main")
                .and_then(|m| m["notes"].as_array().map(Vec::len))
                .unwrap_or(0);
            Some(format!("desk: {} notes", notes))
        }

        fn affordances(&self, _store: &StateStore) -> Vec<Affordance> {
            vec![Affordance {
                tool: "desk.note".into(),
                args: json!({ "text": "hello" }),
                label: "say hello".into(),
                id: "note:hello".into(),
            }]
        }
    }

    fn router_with(config: RouterConfig) -> Router {
        Router::new(config, vec![Arc::new(DeskProvider)]).unwrap()
    }

    fn router() -> Router {
        router_with(RouterConfig::new(7))
    }

    #[test]
    fn test_initial_state() {
        let router = router();
        assert_eq!(router.now(), 0);
        assert_eq!(router.store().revision(), 0);
        assert_eq!(router.pending().total, 1);
        assert_eq!(router.pending().by_connector["desk"], 1);
        assert_eq!(router.focus(), "browser");
    }

    #[test]
    fn test_successful_call_issues_receipt_and_advances_time() {
        let mut router = router();
        let response = router.dispatch("desk.note", &json!({ "text": "hi" })).unwrap();
        assert_eq!(response, json!({ "ok": true }));
        assert_eq!(router.store().receipts().len(), 1);
        assert_eq!(router.now(), 250);
        assert_eq!(router.focus(), "desk");
        // the zero-delay echo was drained by the same step
        assert_eq!(router.store().read("desk.meta", "main").unwrap()["echoes"], 1);
        assert_eq!(router.tracer().len(), 2);
    }

    #[test]
    fn test_errors_leave_no_receipt_and_no_time() {
        let mut router = router();
        let err = router.dispatch("desk.nope", &json!({})).unwrap_err();
        assert_eq!(err.code(), "unknown_tool");
        let err = router.dispatch("desk.note", &json!({ "text": 5 })).unwrap_err();
        assert_eq!(err.code(), "invalid_action");
        let err = router.dispatch("desk.note", &json!({ "text": "a", "extra": 1 })).unwrap_err();
        assert_eq!(err.code(), "invalid_action");

        assert!(router.store().receipts().is_empty());
        assert_eq!(router.now(), 0);
        assert_eq!(router.tracer().len(), 3);
        assert!(!router.is_halted());
    }

    #[test]
    fn test_call_renders_error_object() {
        let mut router = router();
        let response = router.call("desk.nope", &json!({})).unwrap();
        assert_eq!(response["error"]["code"], "unknown_tool");
    }

    #[test]
    fn test_negative_tick_is_rejected_without_mutation() {
        let mut router = router();
        let err = router.tick(-5).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert_eq!(router.now(), 0);
        assert_eq!(router.pending().total, 1);
    }

    #[test]
    fn test_tick_delivers_due_events() {
        let mut router = router();
        let report = router.tick(9_999).unwrap();
        assert!(report.delivered.is_empty());
        let report = router.tick(1).unwrap();
        assert_eq!(report.delivered["desk"], 1);
        assert_eq!(report.time_ms, 10_000);
        assert_eq!(report.pending.total, 0);
        assert_eq!(router.tracer().last().unwrap().time_ms(), 10_000);
    }

    #[test]
    fn test_bounded_drain_delivers_one_event_per_step() {
        let mut router = router();
        router.inject("desk", json!({ "text": "a" }), 0).unwrap();
        router.inject("desk", json!({ "text": "b" }), 0).unwrap();
        router.dispatch("desk.list", &json!({})).unwrap();
        assert_eq!(router.pending().total, 2);

        let mut all = router_with(RouterConfig::new(7).with_drain_policy(DrainPolicy::All));
        all.inject("desk", json!({ "text": "a" }), 0).unwrap();
        all.inject("desk", json!({ "text": "b" }), 0).unwrap();
        all.dispatch("desk.list", &json!({})).unwrap();
        assert_eq!(all.pending().total, 1);
    }

    #[test]
    fn test_injected_events_are_delivered_in_fifo_order() {
        let mut router = router();
        for text in ["first", "second", "third"] {
            router.inject("desk", json!({ "text": text }), 5).unwrap();
        }
        router.tick(5).unwrap();
        let echoes: Vec<Value> = router
            .tracer()
            .entries()
            .iter()
            .filter_map(|e| match e {
                TraceEntry::Event { emitted, .. } => Some(emitted["echo"].clone()),
                _ => None,
            })
            .collect();
        assert_eq!(echoes, vec![json!("first"), json!("second"), json!("third")]);
    }

    #[test]
    fn test_inject_rejects_unknown_target() {
        let mut router = router();
        let err = router.inject("nowhere", json!({}), 0).unwrap_err();
        assert_eq!(err.code(), "invalid_action");
        let err = router.inject("desk", json!({}), -1).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[test]
    fn test_menu_restricted_accepts_only_menu_entries() {
        let mut router = router_with(RouterConfig::new(7).with_menu_restricted(true));
        let err = router.dispatch("desk.note", &json!({ "text": "other" })).unwrap_err();
        assert_eq!(err.code(), "invalid_action");
        router.dispatch("desk.note", &json!({ "text": "hello" })).unwrap();
        router.dispatch("desk.list", &json!({})).unwrap();
        router.dispatch("vei.pending", &json!({})).unwrap();
    }

    #[test]
    fn test_every_menu_entry_is_dispatchable() {
        let mut router = router_with(RouterConfig::new(7).with_menu_restricted(true));
        let observation = router.observe(Some("desk")).unwrap();
        assert!(!observation.action_menu.is_empty());
        for entry in observation.action_menu {
            if let crate::observation::MenuEntry::Concrete { tool, args, .. } = entry {
                let response = router.call(&tool, &args).unwrap();
                assert!(response.get("error").is_none(), "{} rejected: {}", tool, response);
            }
        }
    }

    #[test]
    fn test_fault_override_fails_with_injected_code() {
        let mut router = router_with(RouterConfig::new(7).with_fault("desk.list", 1.0));
        let err = router.dispatch("desk.list", &json!({})).unwrap_err();
        assert_eq!(err.code(), "fault.injected");
        assert!(router.store().receipts().is_empty());
    }

    #[test]
    fn test_fault_samples_are_seeded() {
        let outcomes = |seed| {
            let mut router = router_with(RouterConfig::new(seed));
            (0..20)
                .map(|_| router.call("desk.flaky", &json!({})).unwrap().get("error").is_some())
                .collect::<Vec<_>>()
        };
        assert_eq!(outcomes(11), outcomes(11));
    }

    #[test]
    fn test_orphan_event_target_halts_session() {
        let mut router = router();
        let err = router.dispatch("desk.stray", &json!({})).unwrap_err();
        assert_eq!(err.code(), "state_invariant_violation");
        assert!(router.is_halted());
        assert_eq!(router.phase(), RouterPhase::Halted);

        let err = router.dispatch("desk.list", &json!({})).unwrap_err();
        assert_eq!(err.code(), "halted");
        assert!(router.tick(1).is_err());

        router.reset(None).unwrap();
        assert!(!router.is_halted());
        router.dispatch("desk.list", &json!({})).unwrap();
    }

    #[test]
    fn test_failed_delivery_is_fatal() {
        let mut router = router();
        router.inject("desk", json!({ "boom": true }), 0).unwrap();
        let err = router.tick(0).unwrap_err();
        assert!(err.is_fatal());
        assert!(router.is_halted());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut router = router();
        router.dispatch("desk.note", &json!({ "text": "x" })).unwrap();
        router.tick(20_000).unwrap();

        let first = router.reset(Some(99)).unwrap();
        let snap_a = router.store().snapshot();
        let second = router.reset(Some(99)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, ResetReport { ok: true, seed: 99, time_ms: 0 });
        assert_eq!(snap_a, router.store().snapshot());
        assert!(router.tracer().is_empty());
        assert_eq!(router.pending().total, 1);
    }

    #[test]
    fn test_kernel_tools() {
        let mut router = router();
        let tick = router.dispatch("vei.tick", &json!({ "dt_ms": 10_000 })).unwrap();
        assert_eq!(tick["delivered"], json!({ "desk": 1 }));
        let pending = router.dispatch("vei.pending", &json!({})).unwrap();
        assert_eq!(pending, json!({ "desk": 0, "total": 0 }));
        let state = router.dispatch("vei.state", &json!({ "include_state": true })).unwrap();
        assert_eq!(state["seed"], 7);
        assert!(state["state"]["entities"].is_object());

        let outcome = router
            .dispatch("vei.act_and_observe", &json!({ "tool": "desk.note", "args": { "text": "z" } }))
            .unwrap();
        assert_eq!(outcome["result"], json!({ "ok": true }));
        assert_eq!(outcome["observation"]["focus"], "desk");
        assert_eq!(router.phase(), RouterPhase::Idle);
    }

    #[test]
    fn test_act_and_observe_wraps_errors() {
        let mut router = router();
        let outcome = router.act_and_observe("desk.note", &json!({})).unwrap();
        assert_eq!(outcome.result["error"]["code"], "invalid_action");
        assert_eq!(outcome.observation.time_ms, 0);
    }

    #[test]
    fn test_observation_lists_zero_pending_connectors() {
        let mut router = router();
        router.tick(10_000).unwrap();
        let observation = router.observe(Some("desk")).unwrap();
        assert_eq!(observation.pending_events["desk"], 0);
        assert_eq!(observation.summary, "desk: 0 notes");
    }

    #[test]
    fn test_recorded_session_replays() {
        let mut recorder = router_with(RouterConfig::new(5).with_recording(true));
        recorder.dispatch("desk.note", &json!({ "text": "a" })).unwrap();
        recorder.dispatch("desk.list", &json!({})).unwrap();
        let bundle = recorder.replay_bundle().unwrap();
        assert_eq!(bundle.records.len(), 2);

        let config = RouterConfig::new(5).with_mode("desk", ConnectorMode::Replay);
        let mut replay = Router::builder(config)
            .provider(Arc::new(DeskProvider))
            .replay_bundle(bundle)
            .build()
            .unwrap();
        let response = replay.dispatch("desk.note", &json!({ "text": "a" })).unwrap();
        assert_eq!(response, json!({ "ok": true }));
        assert_eq!(replay.now(), 250);

        let err = replay.dispatch("desk.note", &json!({ "text": "b" })).unwrap_err();
        assert_eq!(err.code(), "replay_mismatch");
        assert!(!replay.is_halted());
    }

    #[test]
    fn test_prime_events_schedules_recorded_emits() {
        let mut recorder = router_with(RouterConfig::new(5).with_recording(true));
        recorder.tick(1_000).unwrap();
        recorder.dispatch("desk.note", &json!({ "text": "a" })).unwrap();
        let bundle = recorder.replay_bundle().unwrap();
        assert_eq!(bundle.records[0].emits.len(), 1);

        let mut fresh = router();
        assert_eq!(fresh.pending().total, 1);
        assert_eq!(fresh.prime_events(&bundle).unwrap(), 1);
        assert_eq!(fresh.pending().total, 2);
        fresh.tick(1_000).unwrap();
        assert_eq!(fresh.store().read("desk.meta", "main").unwrap()["echoes"], 1);
        assert_eq!(fresh.store().read("desk.meta", "main").unwrap()["notes"], json!([]));

        // replayed connectors bring their own emits
        let config = RouterConfig::new(5).with_mode("desk", ConnectorMode::Replay);
        let mut replayed = router_with(config);
        assert_eq!(replayed.prime_events(&bundle).unwrap(), 0);
        assert_eq!(replayed.pending().total, 1);
    }

    #[test]
    fn test_prime_events_rejects_unknown_target_atomically() {
        let mut recorder = ReplayRecorder::new();
        recorder.record(
            "desk",
            "desk.note",
            &json!({ "text": "a" }),
            &json!({ "ok": true }),
            0,
            250,
            vec![
                RecordedEmit { target: "desk".into(), payload: json!({ "text": "x" }), dt_ms: 0 },
                RecordedEmit { target: "nowhere".into(), payload: json!({}), dt_ms: 0 },
            ],
        );
        let bundle = recorder.bundle(None);

        let mut router = router();
        let err = router.prime_events(&bundle).unwrap_err();
        assert_eq!(err.code(), "invalid_action");
        assert_eq!(router.pending().total, 1);
        assert!(!router.is_halted());
    }

    #[test]
    fn test_live_mode_without_backend() {
        let config = RouterConfig::new(1).with_mode("desk", ConnectorMode::Live);
        let mut router = router_with(config);
        let err = router.dispatch("desk.list", &json!({})).unwrap_err();
        assert_eq!(err.code(), "live.unavailable");
    }

    #[test]
    fn test_duplicate_connector_is_rejected() {
        let result = Router::new(
            RouterConfig::default(),
            vec![Arc::new(DeskProvider), Arc::new(DeskProvider)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let mut router = router();
        let mut last = 0;
        for i in 0..10 {
            if i % 3 == 0 {
                router.tick(700).unwrap();
            } else {
                router.call("desk.note", &json!({ "text": format!("n{}", i) })).unwrap();
            }
            assert!(router.now() >= last);
            last = router.now();
        }
    }
}
