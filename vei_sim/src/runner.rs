//! Scenario runner - executes scripted scenarios against a compiled world.
//!
//! A run is judged twice: once by the scenario's own expectations on the
//! final state, and once by reproducibility (`verify_determinism`,
//! `verify_replay`).

use crate::drift::DriftMode;
use crate::error::SimError;
use crate::scenarios::{ScenarioId, Step};
use crate::world::WorldConfig;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use vei_core::{ConnectorMode, DrainPolicy, ReplayBundle, Router, RouterConfig, Severity};
use vei_env::{LogicalTime, Seed};

/// One executed script step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub label: String,
    /// Logical time after the step
    pub time_ms: LogicalTime,
    pub response: Value,
}

impl StepRecord {
    /// Whether the step came back as `{error: {...}}`.
    pub fn is_error(&self) -> bool {
        self.response.get("error").is_some()
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: Seed,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Script steps executed
    pub steps: usize,

    /// Final logical time
    pub final_time_ms: LogicalTime,

    /// SHA-256 of the JSONL trace
    pub trace_digest: String,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn failed(scenario: ScenarioId, seed: Seed, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            steps: 0,
            final_time_ms: 0,
            trace_digest: String::new(),
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Successful tool calls (kernel tools included)
    pub tool_calls: u64,

    /// Steps answered with `{error: ...}`
    pub error_responses: u64,

    pub events_delivered: u64,

    pub findings: usize,
    pub policy_warnings: usize,
    pub policy_errors: usize,

    /// Store revision at the end
    pub state_revision: u64,
}

impl ScenarioMetrics {
    fn collect(run: &ScriptRun) -> Self {
        let router = &run.router;
        let severity_count = |severity: Severity| {
            router
                .policy_findings()
                .iter()
                .filter(|f| f.severity == severity)
                .count()
        };
        Self {
            tool_calls: router.tool_counts().values().sum(),
            error_responses: run.records.iter().filter(|r| r.is_error()).count() as u64,
            events_delivered: router.state(false, 0).deliveries.values().sum(),
            findings: router.findings().len(),
            policy_warnings: severity_count(Severity::Warning),
            policy_errors: severity_count(Severity::Error),
            state_revision: router.store().revision(),
        }
    }
}

/// A finished script: the session it ran in and what each step returned.
pub struct ScriptRun {
    pub router: Router,
    pub records: Vec<StepRecord>,
}

impl ScriptRun {
    pub fn trace_jsonl(&self) -> Result<String, SimError> {
        Ok(self.router.tracer().to_jsonl()?)
    }

    /// Logical time after each step.
    pub fn times(&self) -> Vec<LogicalTime> {
        self.records.iter().map(|r| r.time_ms).collect()
    }

    fn last_response(&self) -> &Value {
        self.records.last().map_or(&Value::Null, |r| &r.response)
    }

    fn response(&self, index: usize) -> &Value {
        self.records.get(index).map_or(&Value::Null, |r| &r.response)
    }
}

/// Runs `steps` in order. Recoverable errors become `{error}` responses;
/// only a halted kernel aborts the script.
pub fn run_script(mut router: Router, steps: &[Step]) -> Result<ScriptRun, SimError> {
    let mut records = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        let response = match step {
            Step::Call { tool, args } => router.call(tool, args)?,
            Step::Tick { dt_ms } => {
                let dt = i64::try_from(*dt_ms).map_err(|_| SimError::world(format!("tick too large: {}", dt_ms)))?;
                json!(router.tick(dt)?)
            }
            Step::Observe { focus } => json!(router.observe(focus.as_deref())?),
        };
        debug!(index, step = %step.label(), time_ms = router.now(), "step");
        records.push(StepRecord {
            index,
            label: step.label(),
            time_ms: router.now(),
            response,
        });
    }
    Ok(ScriptRun { router, records })
}

fn expect(condition: bool, message: &str) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message.to_string())
    }
}

fn entity(router: &Router, family: &str, id: &str) -> Result<Value, String> {
    router
        .store()
        .read(family, id)
        .cloned()
        .ok_or_else(|| format!("{}/{} missing", family, id))
}

fn slack_has(router: &Router, needle: &str) -> bool {
    router
        .store()
        .read("slack.channels", "#procurement")
        .and_then(|channel| channel["messages"].as_array())
        .map_or(false, |messages| {
            messages
                .iter()
                .any(|m| m["text"].as_str().map_or(false, |t| t.contains(needle)))
        })
}

/// Scenario expectations on the finished run.
fn check(scenario: ScenarioId, run: &ScriptRun) -> Result<(), String> {
    let router = &run.router;
    if let Some(finding) = router.policy_findings().iter().find(|f| f.severity == Severity::Error) {
        return Err(format!("policy error {}: {}", finding.code, finding.message));
    }

    match scenario {
        ScenarioId::Procurement => {
            let reply = run
                .last_response()
                .get(0)
                .ok_or_else(|| "inbox empty after waiting for the vendor".to_string())?;
            expect(reply["from"] == "sales@vendor.example", "newest message is not the vendor reply")?;
            let body = reply["body_text"].as_str().unwrap_or_default().replace(',', "");
            expect(body.contains("3199"), "vendor reply carries no price")?;
            expect(slack_has(router, "Approved"), "CFO approval never arrived")
        }
        ScenarioId::ExtendedStore => {
            expect(
                run.response(1)["hits"][0]["node_id"] == "CLICK:open_category#0",
                "find did not surface the laptops category",
            )?;
            let specs = run.response(6)["excerpt"].as_str().unwrap_or_default();
            expect(specs.contains("32GB"), "specs page not reached")?;
            expect(run.response(8)["node_id"] == "category", "back-tracking did not return to the category")?;
            expect(slack_has(router, "Approved"), "CFO approval never arrived")
        }
        ScenarioId::ErpThreeWay => {
            expect(run.response(3)["status"] == "MATCH", "three-way match failed")?;
            expect(run.last_response()["status"] == "PAID", "invoice not paid")?;
            match router.findings().iter().find(|f| f.code.starts_with("erp.")) {
                Some(finding) => Err(format!("unexpected ERP finding {}", finding.code)),
                None => Ok(()),
            }
        }
        ScenarioId::CrmOutreach => {
            expect(
                run.last_response()["error"]["code"] == "consent_violation",
                "outreach to a do-not-contact lead was accepted",
            )?;
            let deal = entity(router, "crm.deals", "D-1")?;
            expect(deal["stage"] == "Negotiation", "deal stage not updated")?;
            expect(router.store().count("crm.activities") == 1, "refused activity was stored")
        }
        ScenarioId::AccessReview => {
            let user = entity(router, "okta.users", "USR-9002")?;
            expect(user["status"] == "ACTIVE", "user not reactivated")?;
            let in_group = user["groups"]
                .as_array()
                .map_or(false, |groups| groups.iter().any(|g| g == "GRP-security"));
            expect(in_group, "user not added to GRP-security")?;
            let request = entity(router, "servicedesk.requests", "REQ-8801")?;
            expect(request["status"] == "APPROVED", "request still open")?;
            expect(slack_has(router, "lunch order"), "scheduled derail never arrived")
        }
        ScenarioId::DriftStorm => {
            let delivered: u64 = router
                .store()
                .family("drift.jobs")
                .map(|jobs| jobs.values().filter_map(|j| j["delivered"].as_u64()).sum())
                .unwrap_or(0);
            expect(delivered >= 5, "drift delivered fewer than 5 background events")?;
            expect(
                run.response(3).as_array().map_or(false, |inbox| !inbox.is_empty()),
                "no drift mail after two minutes",
            )
        }
    }
}

/// Runs scripted scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    /// Configuration seed
    seed: Seed,

    /// Replaces the scenario's own world
    world: Option<WorldConfig>,

    /// Overrides the world's drift mode
    drift: Option<DriftMode>,

    menu_restricted: bool,

    drain_policy: DrainPolicy,

    /// JSONL trace written by `run`
    trace_path: Option<PathBuf>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: Seed) -> Self {
        Self {
            seed,
            world: None,
            drift: None,
            menu_restricted: false,
            drain_policy: DrainPolicy::default(),
            trace_path: None,
        }
    }

    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_world(mut self, world: WorldConfig) -> Self {
        self.world = Some(world);
        self
    }

    pub fn with_drift(mut self, mode: DriftMode) -> Self {
        self.drift = Some(mode);
        self
    }

    pub fn with_menu_restricted(mut self, restricted: bool) -> Self {
        self.menu_restricted = restricted;
        self
    }

    pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.drain_policy = policy;
        self
    }

    pub fn with_trace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_path = Some(path.into());
        self
    }

    pub fn seed(&self) -> Seed {
        self.seed
    }

    /// Kernel configuration shared by every session this runner builds.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig::new(self.seed)
            .with_menu_restricted(self.menu_restricted)
            .with_drain_policy(self.drain_policy)
    }

    /// The world a scenario runs in, after overrides.
    pub fn world_for(&self, scenario: ScenarioId) -> WorldConfig {
        let mut world = self.world.clone().unwrap_or_else(|| scenario.world());
        if let Some(mode) = self.drift {
            world.drift = mode;
        }
        world
    }

    /// Compiles the scenario's world under `config` and runs its script.
    pub fn execute(&self, scenario: ScenarioId, config: RouterConfig) -> Result<ScriptRun, SimError> {
        let router = self.world_for(scenario).build_router(config)?;
        run_script(router, &scenario.script())
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        let mut config = self.router_config();
        if let Some(path) = &self.trace_path {
            config = config.with_trace_path(path);
        }
        match self.execute(scenario, config) {
            Ok(run) => self.evaluate(scenario, &run),
            Err(err) => {
                warn!(scenario = %scenario, error = %err, "scenario aborted");
                ScenarioResult::failed(scenario, self.seed, err.to_string())
            }
        }
    }

    /// Scores a finished run against the scenario's expectations.
    pub fn evaluate(&self, scenario: ScenarioId, run: &ScriptRun) -> ScenarioResult {
        let (trace_digest, digest_error) = match run.router.tracer().digest() {
            Ok(digest) => (digest, None),
            Err(err) => (String::new(), Some(err.to_string())),
        };
        let failure_reason = digest_error.or_else(|| check(scenario, run).err());
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            steps: run.records.len(),
            final_time_ms: run.router.now(),
            trace_digest,
            failure_reason,
            metrics: ScenarioMetrics::collect(run),
        }
    }

    /// Runs the scenario twice; returns the shared trace digest.
    pub fn verify_determinism(&self, scenario: ScenarioId) -> Result<String, SimError> {
        let first = self.execute(scenario, self.router_config())?;
        let second = self.execute(scenario, self.router_config())?;

        if first.times() != second.times() {
            return Err(SimError::Divergence(format!(
                "{}: time progression {:?} vs {:?}",
                scenario,
                first.times(),
                second.times()
            )));
        }
        if first.trace_jsonl()? != second.trace_jsonl()? {
            return Err(SimError::Divergence(format!("{}: trace bytes differ", scenario)));
        }
        Ok(first.router.tracer().digest()?)
    }

    /// A replay-mode session over the scenario's world.
    pub fn replay_session(&self, scenario: ScenarioId, bundle: ReplayBundle) -> Result<Router, SimError> {
        let connectors = self.world_for(scenario).connectors;
        self.replay_session_for(scenario, bundle, &connectors)
    }

    /// A session where only `connectors` replay; the rest run in sim mode.
    pub fn replay_session_for(
        &self,
        scenario: ScenarioId,
        bundle: ReplayBundle,
        connectors: &[String],
    ) -> Result<Router, SimError> {
        let world = self.world_for(scenario);
        // The store does not move under replay, so menu checks would see stale pages.
        let mut config = self.router_config().with_menu_restricted(false);
        for connector in connectors {
            config = config.with_mode(connector, ConnectorMode::Replay);
        }
        Ok(world.router_builder(config)?.replay_bundle(bundle).build()?)
    }

    /// Records the scenario in sim mode, replays it, and checks that every
    /// recorded response and step time comes back unchanged.
    pub fn verify_replay(&self, scenario: ScenarioId) -> Result<(), SimError> {
        let connectors = self.world_for(scenario).connectors;
        self.verify_replay_for(scenario, &connectors)
    }

    /// Same check with only `connectors` in replay mode.
    ///
    /// Replayed calls that failed while recording left no record, so they
    /// are skipped; they never advanced time either. Sim-mode calls are
    /// all re-executed, failures included, so the fault stream lines up.
    pub fn verify_replay_for(&self, scenario: ScenarioId, connectors: &[String]) -> Result<(), SimError> {
        let recorded = self.execute(scenario, self.router_config().with_recording(true))?;
        let bundle = recorded
            .router
            .replay_bundle()
            .ok_or_else(|| SimError::Divergence("recording produced no bundle".to_string()))?;
        let mut replay = self.replay_session_for(scenario, bundle, connectors)?;

        for (step, expected) in scenario.script().iter().zip(&recorded.records) {
            match step {
                Step::Call { tool, args } => {
                    let replayed = replay
                        .registry()
                        .resolve(tool)
                        .map(|resolved| connectors.iter().any(|c| c == resolved.spec.connector()))
                        .unwrap_or(false);
                    if replayed && expected.is_error() {
                        continue;
                    }
                    let response = replay.call(tool, args)?;
                    if response != expected.response {
                        return Err(SimError::Divergence(format!(
                            "{} step {} ({}): replayed response differs",
                            scenario, expected.index, tool
                        )));
                    }
                }
                Step::Tick { dt_ms } => {
                    let dt = i64::try_from(*dt_ms).map_err(|_| SimError::world(format!("tick too large: {}", dt_ms)))?;
                    replay.tick(dt)?;
                }
                Step::Observe { focus } => {
                    replay.observe(focus.as_deref())?;
                }
            }
            if replay.now() != expected.time_ms {
                return Err(SimError::Divergence(format!(
                    "{} step {}: replay at {} ms, recording at {} ms",
                    scenario,
                    expected.index,
                    replay.now(),
                    expected.time_ms
                )));
            }
        }
        debug!(scenario = %scenario, cursor = ?replay.replay_cursor(), "replay verified");
        Ok(())
    }
}
