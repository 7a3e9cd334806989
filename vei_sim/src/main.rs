//! VEI Simulator CLI
//!
//! Run scripted scenarios against the deterministic kernel, check them for
//! reproducibility, and export traces.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vei_core::DrainPolicy;
use vei_env::DEFAULT_SEED;
use vei_sim::exporter::{write_replay_bundle, write_trace_jsonl, TraceExport};
use vei_sim::{DriftMode, ScenarioId, ScenarioResult, ScenarioRunner, SessionHost, WorldConfig};

/// VEI deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "vei-sim")]
#[command(about = "Run deterministic enterprise-twin scenarios", long_about = None)]
struct Args {
    /// Master seed; every session derives all randomness from it
    #[arg(short, long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Scenario to run (procurement, extended-store, erp-three-way,
    /// crm-outreach, access-review, drift-storm, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to run
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Sessions run at once when more than one seed is given
    #[arg(long, default_value = "4")]
    concurrency: usize,

    /// World definition (JSON) replacing each scenario's own world
    #[arg(long)]
    world: Option<PathBuf>,

    /// Background drift override (off, light, fast, aggressive)
    #[arg(long)]
    drift: Option<DriftMode>,

    /// Reject concrete tools absent from the current action menu
    #[arg(long)]
    menu_restricted: bool,

    /// Events delivered per step (0 = every due event)
    #[arg(long, default_value = "1")]
    drain_per_step: usize,

    /// Also check run-to-run determinism and replay fidelity
    #[arg(long)]
    verify: bool,

    /// Stream the JSONL trace to this file (single run only)
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Export the run as JSON (single run only)
    #[arg(long)]
    export: Option<PathBuf>,

    /// Write the recorded replay bundle (single run only)
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn build_runner(args: &Args, seed: u64) -> ScenarioRunner {
    let mut runner = ScenarioRunner::new(seed).with_menu_restricted(args.menu_restricted);
    let policy = match args.drain_per_step {
        0 => DrainPolicy::All,
        n => DrainPolicy::Bounded(n),
    };
    runner = runner.with_drain_policy(policy);
    if let Some(path) = &args.world {
        match WorldConfig::load(path) {
            Ok(world) => runner = runner.with_world(world),
            Err(e) => fail(e),
        }
    }
    if let Some(mode) = args.drift {
        runner = runner.with_drift(mode);
    }
    runner
}

/// Single run with trace streaming and artifact export.
fn run_with_artifacts(args: &Args, runner: ScenarioRunner, scenario: ScenarioId) -> ScenarioResult {
    let mut config = runner.router_config().with_recording(args.bundle.is_some());
    if let Some(path) = &args.trace {
        config = config.with_trace_path(path);
    }
    let run = match runner.execute(scenario, config) {
        Ok(run) => run,
        Err(e) => fail(e),
    };
    let result = runner.evaluate(scenario, &run);

    if let Some(path) = &args.export {
        match TraceExport::from_run(&result, &run).write_to_file(path) {
            Ok(()) => info!("Exported {} trace records to {}", run.router.tracer().len(), path.display()),
            Err(e) => error!("Failed to write export: {}", e),
        }
    }
    if let Some(path) = &args.bundle {
        let written = run
            .router
            .replay_bundle()
            .map(|bundle| write_replay_bundle(&bundle, path));
        match written {
            Some(Ok(())) => info!("Replay bundle written to {}", path.display()),
            Some(Err(e)) => error!("Failed to write replay bundle: {}", e),
            None => error!("No replay bundle recorded"),
        }
    }
    if args.trace.is_none() && args.verbose {
        let path = std::env::temp_dir().join(format!("vei-{}-{}.jsonl", scenario.name(), result.seed));
        if write_trace_jsonl(&run, &path).is_ok() {
            info!("Trace written to {}", path.display());
        }
    }
    result
}

fn report(result: &ScenarioResult, json: bool) {
    if json {
        return;
    }
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED in {} ms, digest {}",
            result.scenario.name(),
            result.seed,
            result.final_time_ms,
            &result.trace_digest[..result.trace_digest.len().min(12)]
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        fail(format!("failed to set tracing subscriber: {}", e));
    }

    if !args.json {
        info!("VEI Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!(
                    "Available scenarios: {}, all",
                    ScenarioId::all().iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
                );
                std::process::exit(1);
            }
        }
    };

    let base_seed = args.seed;
    let seeds: Vec<u64> = (0..args.seeds.max(1) as u64).map(|i| base_seed.wrapping_add(i)).collect();

    let wants_artifacts = args.trace.is_some() || args.export.is_some() || args.bundle.is_some();
    if wants_artifacts && (scenarios.len() > 1 || seeds.len() > 1) {
        fail("--trace, --export and --bundle need a single scenario and a single seed");
    }

    let results: Vec<ScenarioResult> = if wants_artifacts {
        vec![run_with_artifacts(&args, build_runner(&args, base_seed), scenarios[0])]
    } else if seeds.len() == 1 {
        let runner = build_runner(&args, base_seed);
        scenarios.iter().map(|s| runner.run(*s)).collect()
    } else {
        let host = SessionHost::new(build_runner(&args, base_seed)).with_concurrency(args.concurrency);
        match host.run_grid(&seeds, &scenarios).await {
            Ok(results) => results,
            Err(e) => fail(e),
        }
    };
    for result in &results {
        report(result, args.json);
    }

    let mut verify_failures: Vec<String> = Vec::new();
    if args.verify {
        for &seed in &seeds {
            let runner = build_runner(&args, seed);
            for &scenario in &scenarios {
                let checked = runner
                    .verify_determinism(scenario)
                    .and_then(|_| runner.verify_replay(scenario));
                match checked {
                    Ok(()) => {
                        if !args.json {
                            info!("✓ {} (seed={}) reproducible", scenario.name(), seed);
                        }
                    }
                    Err(e) => {
                        error!("✗ {} (seed={}) not reproducible: {}", scenario.name(), seed, e);
                        verify_failures.push(format!("{} seed={}: {}", scenario.name(), seed, e));
                    }
                }
            }
        }
    }

    let total = results.len();
    let failed_count = results.iter().filter(|r| !r.passed).count();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "verify_failures": verify_failures,
            "results": results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => fail(e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 && verify_failures.is_empty() {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
            for failure in &verify_failures {
                error!("  - {}", failure);
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 || !verify_failures.is_empty() {
        std::process::exit(1);
    }
}
