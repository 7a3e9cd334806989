//! Background drift: seeded newsletters, pings and alerts that keep the
//! world moving while the agent works.
//!
//! Drift draws only from its own `"drift"` RNG sub-stream, so turning it
//! on never changes what the twins draw from the main stream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use vei_core::{ConnectorError, ProviderContext, StateStore, ToolProvider, ToolSpec};

/// RNG sub-stream label used for drift jitter and template choice.
pub const DRIFT_STREAM: &str = "drift";

const JOBS: &str = "drift.jobs";

/// How busy the background is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftMode {
    #[default]
    Off,
    /// Half-rate cadence
    Light,
    Fast,
    /// Full cadence plus security alerts
    Aggressive,
}

impl DriftMode {
    pub fn is_active(&self) -> bool {
        *self != DriftMode::Off
    }

    fn cadence_factor(&self) -> u64 {
        match self {
            DriftMode::Light => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for DriftMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriftMode::Off => "off",
            DriftMode::Light => "light",
            DriftMode::Fast => "fast",
            DriftMode::Aggressive => "aggressive",
        };
        f.write_str(name)
    }
}

impl FromStr for DriftMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "off" | "none" => Ok(DriftMode::Off),
            "light" | "slow" => Ok(DriftMode::Light),
            "fast" => Ok(DriftMode::Fast),
            "aggressive" => Ok(DriftMode::Aggressive),
            other => Err(format!("unknown drift mode '{}' (off, light, fast, aggressive)", other)),
        }
    }
}

/// One recurring background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftJob {
    pub id: String,
    pub target: String,
    pub cadence_ms: u64,
    pub initial_offset_ms: u64,
    pub jitter_ms: u64,
    pub templates: Vec<Value>,
}

impl DriftJob {
    fn new(id: &str, target: &str, timing: (u64, u64, u64), factor: u64, templates: Vec<Value>) -> Self {
        let (cadence, offset, jitter) = timing;
        Self {
            id: id.to_string(),
            target: target.to_string(),
            cadence_ms: cadence / factor,
            initial_offset_ms: offset / factor,
            jitter_ms: jitter / factor,
            templates,
        }
    }
}

/// Jobs that run in `mode`.
pub fn jobs_for(mode: DriftMode) -> Vec<DriftJob> {
    if !mode.is_active() {
        return Vec::new();
    }
    let factor = mode.cadence_factor();
    let newsletter = |subj: &str, body: &str| {
        json!({ "from": "newsletter@macrocompute.example", "subj": subj, "body_text": body })
    };
    let ping = |text: &str| json!({ "channel": "#procurement", "text": text, "thread_ts": null });

    let mut jobs = vec![
        DriftJob::new(
            "mail.weekly_newsletter",
            "mail",
            (120_000, 45_000, 10_000),
            factor,
            vec![
                newsletter(
                    "Weekly procurement digest",
                    "Top tickets: MacroBook refresh, monitor replacements, CFO approval backlog.",
                ),
                newsletter(
                    "Vendor scorecard snapshot",
                    "Reminder: MacroCompute Q3 supplier review due Friday.",
                ),
            ],
        ),
        DriftJob::new(
            "slack.procurement_ping",
            "slack",
            (90_000, 30_000, 8_000),
            factor,
            vec![
                ping("Heads-up: Finance wants laptop refresh status by EOD."),
                ping("Reminder: please attach vendor quotes to approvals (auto)"),
            ],
        ),
    ];
    if matches!(mode, DriftMode::Fast | DriftMode::Aggressive) {
        jobs.push(DriftJob::new(
            "mail.alert_security",
            "mail",
            (150_000, 75_000, 12_000),
            factor,
            vec![json!({
                "from": "security@macrocompute.example",
                "subj": "Login notice: Procurement portal",
                "body_text": "We noticed a sign-in from a new device for procurement@macrocompute.example.",
            })],
        ));
    }
    jobs
}

/// Drift as a tool-less provider: it seeds its jobs at session start and
/// re-arms a job each time one of its events is delivered.
#[derive(Debug, Clone, Default)]
pub struct DriftEngine {
    mode: DriftMode,
    jobs: Vec<DriftJob>,
}

impl DriftEngine {
    pub fn new(mode: DriftMode) -> Self {
        Self {
            mode,
            jobs: jobs_for(mode),
        }
    }

    pub fn mode(&self) -> DriftMode {
        self.mode
    }

    pub fn jobs(&self) -> &[DriftJob] {
        &self.jobs
    }

    /// Schedules the next run of `job` after `offset_ms` plus seeded jitter.
    fn arm(&self, job: &DriftJob, offset_ms: u64, ctx: &mut ProviderContext<'_>) -> u64 {
        let jitter = if job.jitter_ms > 0 {
            ctx.stream_randint(DRIFT_STREAM, 0, job.jitter_ms as i64) as u64
        } else {
            0
        };
        let idx = ctx.stream_randint(DRIFT_STREAM, 0, job.templates.len().saturating_sub(1) as i64) as usize;
        let mut payload = job.templates.get(idx).cloned().unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut payload {
            map.insert("drift".to_string(), json!(true));
            map.insert("drift_job".to_string(), json!(job.id));
        }
        let dt = offset_ms + jitter;
        ctx.schedule(dt, &job.target, payload);
        dt
    }
}

impl ToolProvider for DriftEngine {
    fn connector(&self) -> &str {
        "drift"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    fn initialize(&self, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        for job in &self.jobs {
            let dt = self.arm(job, job.initial_offset_ms, ctx);
            ctx.put(
                JOBS,
                &job.id,
                &json!({
                    "job": job.id,
                    "target": job.target,
                    "scheduled": 1,
                    "delivered": 0,
                    "next_dt_ms": dt,
                    "last_delivered_ms": null,
                }),
            )?;
        }
        Ok(())
    }

    fn call(&self, tool: &str, _args: &Value, _ctx: &mut ProviderContext<'_>) -> Result<Value, ConnectorError> {
        Err(ConnectorError::new("unknown_tool", tool))
    }

    fn on_delivered(&self, target: &str, payload: &Value, ctx: &mut ProviderContext<'_>) -> Result<(), ConnectorError> {
        if payload.get("drift").and_then(Value::as_bool) != Some(true) {
            return Ok(());
        }
        let Some(job_id) = payload.get("drift_job").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(job) = self.jobs.iter().find(|j| j.id == job_id && j.target == target) else {
            return Ok(());
        };
        let stats = ctx.read(JOBS, &job.id).unwrap_or_else(|| json!({}));
        let count = |key: &str| stats.get(key).and_then(Value::as_u64).unwrap_or(0);
        let (scheduled, delivered) = (count("scheduled"), count("delivered"));

        let dt = self.arm(job, job.cadence_ms, ctx);
        let now = ctx.now();
        ctx.merge(
            JOBS,
            &job.id,
            json!({
                "scheduled": scheduled + 1,
                "delivered": delivered + 1,
                "next_dt_ms": dt,
                "last_delivered_ms": now,
            }),
        )
    }

    fn summary(&self, store: &StateStore) -> Option<String> {
        if !self.mode.is_active() {
            return None;
        }
        let delivered: u64 = store
            .family(JOBS)
            .map(|jobs| jobs.values().filter_map(|j| j["delivered"].as_u64()).sum())
            .unwrap_or(0);
        Some(format!("Drift ({}): {} background events delivered", self.mode, delivered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twins::{MailTwin, SlackTwin};
    use std::sync::Arc;
    use vei_core::{Router, RouterConfig};

    fn router(seed: u64, mode: DriftMode) -> Router {
        let providers: Vec<Arc<dyn ToolProvider>> = vec![
            Arc::new(SlackTwin::default()),
            Arc::new(MailTwin::default()),
            Arc::new(DriftEngine::new(mode)),
        ];
        Router::new(RouterConfig::new(seed), providers).unwrap()
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("slow".parse::<DriftMode>().unwrap(), DriftMode::Light);
        assert_eq!("NONE".parse::<DriftMode>().unwrap(), DriftMode::Off);
        assert!("chaotic".parse::<DriftMode>().is_err());
        assert_eq!(DriftMode::Aggressive.to_string(), "aggressive");
    }

    #[test]
    fn test_jobs_per_mode() {
        assert!(jobs_for(DriftMode::Off).is_empty());
        assert_eq!(jobs_for(DriftMode::Light).len(), 2);
        assert_eq!(jobs_for(DriftMode::Light)[0].cadence_ms, 60_000);
        assert_eq!(jobs_for(DriftMode::Aggressive).len(), 3);
    }

    #[test]
    fn test_off_schedules_nothing() {
        let router = router(42042, DriftMode::Off);
        assert_eq!(router.pending().total, 0);
    }

    #[test]
    fn test_delivery_rearms_job() {
        let mut router = router(42042, DriftMode::Fast);
        assert_eq!(router.pending().total, 3);

        // Past the slack ping's first window (30s + up to 8s jitter)
        router.tick(38_000).unwrap();
        let ping = router.store().read(JOBS, "slack.procurement_ping").unwrap().clone();
        assert_eq!(ping["delivered"], 1);
        assert_eq!(ping["scheduled"], 2);
        assert_eq!(router.pending().total, 3);
    }

    #[test]
    fn test_drift_is_seeded() {
        let trace = |seed| {
            let mut router = router(seed, DriftMode::Aggressive);
            router.tick(400_000).unwrap();
            router.tracer().entries().to_vec()
        };
        assert_eq!(trace(7), trace(7));
    }

    #[test]
    fn test_drift_leaves_main_stream_alone() {
        let vendor_body = |mode| {
            let mut router = router(42042, mode);
            router
                .dispatch(
                    "mail.compose",
                    &json!({ "to": "sales@vendor.example", "subj": "Quote request", "body_text": "?" }),
                )
                .unwrap();
            router.tick(16_000).unwrap();
            router.dispatch("mail.list", &json!({})).unwrap()[0]["body_text"].clone()
        };
        assert_eq!(vendor_body(DriftMode::Off), vendor_body(DriftMode::Light));
    }
}
