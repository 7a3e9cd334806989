//! JSON exporter for scenario runs.
//!
//! Writes a run as one pretty JSON document (result, step responses,
//! findings, full trace), plus the raw JSONL trace and the replay bundle
//! for offline scoring tools.

use crate::error::SimError;
use crate::runner::{ScenarioResult, ScriptRun, StepRecord};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use vei_core::{Finding, PolicyFinding, ReplayBundle, TraceEntry};
use vei_env::{LogicalTime, Seed};

/// Complete export of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: Seed,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub final_time_ms: LogicalTime,

    /// SHA-256 of the JSONL trace
    pub trace_digest: String,

    /// What each script step returned
    pub steps: Vec<ExportedStep>,

    /// Monitor findings
    pub findings: Vec<Finding>,

    /// Promoted policy findings
    pub policy_findings: Vec<PolicyFinding>,

    /// Every trace record, in order
    pub trace: Vec<TraceEntry>,
}

/// A script step as exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedStep {
    pub index: usize,
    pub label: String,
    pub time_ms: LogicalTime,
    pub response: serde_json::Value,
}

impl From<&StepRecord> for ExportedStep {
    fn from(record: &StepRecord) -> Self {
        Self {
            index: record.index,
            label: record.label.clone(),
            time_ms: record.time_ms,
            response: record.response.clone(),
        }
    }
}

impl TraceExport {
    /// Creates an empty export container.
    pub fn new(scenario: &str, seed: Seed) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            passed: false,
            failure_reason: None,
            final_time_ms: 0,
            trace_digest: String::new(),
            steps: Vec::new(),
            findings: Vec::new(),
            policy_findings: Vec::new(),
            trace: Vec::new(),
        }
    }

    /// Captures a finished run together with its verdict.
    pub fn from_run(result: &ScenarioResult, run: &ScriptRun) -> Self {
        let router = &run.router;
        let mut export = Self::new(result.scenario.name(), result.seed);
        export.passed = result.passed;
        export.failure_reason = result.failure_reason.clone();
        export.final_time_ms = result.final_time_ms;
        export.trace_digest = result.trace_digest.clone();
        export.steps = run.records.iter().map(ExportedStep::from).collect();
        export.findings = router.findings().to_vec();
        export.policy_findings = router.policy_findings().to_vec();
        export.trace = router.tracer().entries().to_vec();
        export
    }

    /// Writes to a JSON file.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self).map_err(SimError::io)?;
        write_text(path.as_ref(), &json)
    }

    /// Reads an export written by [`TraceExport::write_to_file`].
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SimError::io(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&text).map_err(SimError::io)
    }
}

/// Writes the run's trace as JSONL.
pub fn write_trace_jsonl<P: AsRef<Path>>(run: &ScriptRun, path: P) -> Result<(), SimError> {
    write_text(path.as_ref(), &run.trace_jsonl()?)
}

/// Writes a replay bundle as JSON.
pub fn write_replay_bundle<P: AsRef<Path>>(bundle: &ReplayBundle, path: P) -> Result<(), SimError> {
    let json = bundle.to_json()?;
    write_text(path.as_ref(), &json)
}

fn write_text(path: &Path, text: &str) -> Result<(), SimError> {
    let mut file = File::create(path).map_err(|e| SimError::io(format!("{}: {}", path.display(), e)))?;
    file.write_all(text.as_bytes())
        .map_err(|e| SimError::io(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScenarioRunner;
    use crate::scenarios::ScenarioId;
    use std::path::PathBuf;
    use vei_env::DEFAULT_SEED;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vei-export-{}-{}", std::process::id(), name))
    }

    fn procurement_run() -> (ScenarioResult, ScriptRun) {
        let runner = ScenarioRunner::new(DEFAULT_SEED);
        let run = runner
            .execute(ScenarioId::Procurement, runner.router_config().with_recording(true))
            .unwrap();
        let result = runner.evaluate(ScenarioId::Procurement, &run);
        (result, run)
    }

    #[test]
    fn test_export_captures_run() {
        let (result, run) = procurement_run();
        let export = TraceExport::from_run(&result, &run);

        assert_eq!(export.scenario, "procurement");
        assert!(export.passed);
        assert_eq!(export.steps.len(), run.records.len());
        assert_eq!(export.steps[0].label, run.records[0].label);
        assert_eq!(export.trace.len(), run.router.tracer().len());
        assert_eq!(export.trace_digest, run.router.tracer().digest().unwrap());
    }

    #[test]
    fn test_export_file_round_trip() {
        let (result, run) = procurement_run();
        let export = TraceExport::from_run(&result, &run);
        let path = temp_path("export.json");

        export.write_to_file(&path).unwrap();
        let loaded = TraceExport::read_from_file(&path).unwrap();
        assert_eq!(loaded.trace, export.trace);
        assert_eq!(loaded.final_time_ms, result.final_time_ms);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_trace_and_bundle_files() {
        let (_, run) = procurement_run();
        let trace_path = temp_path("trace.jsonl");
        let bundle_path = temp_path("bundle.json");

        write_trace_jsonl(&run, &trace_path).unwrap();
        let text = std::fs::read_to_string(&trace_path).unwrap();
        assert_eq!(text, run.trace_jsonl().unwrap());

        let bundle = run.router.replay_bundle().unwrap();
        write_replay_bundle(&bundle, &bundle_path).unwrap();
        let loaded = ReplayBundle::from_json(&std::fs::read_to_string(&bundle_path).unwrap()).unwrap();
        assert_eq!(loaded, bundle);

        let _ = std::fs::remove_file(&trace_path);
        let _ = std::fs::remove_file(&bundle_path);
    }

    #[test]
    fn test_unwritable_path_is_io_error() {
        let export = TraceExport::new("procurement", 1);
        let path = temp_path("missing-dir").join("nested").join("export.json");
        assert!(matches!(export.write_to_file(&path), Err(SimError::Io(_))));
    }
}
