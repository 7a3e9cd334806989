//! Multi-session host: many independent sessions side by side.
//!
//! Sessions share nothing. Each one is built and run inside its own
//! blocking task, so a session's result depends only on its seed and
//! scenario, never on scheduling.

use crate::error::SimError;
use crate::runner::{ScenarioResult, ScenarioRunner};
use crate::scenarios::ScenarioId;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use vei_env::Seed;

/// Runs seed x scenario grids on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct SessionHost {
    /// Template cloned into every session (seed replaced per task)
    runner: ScenarioRunner,
    max_concurrency: usize,
}

impl SessionHost {
    pub fn new(runner: ScenarioRunner) -> Self {
        Self {
            runner,
            max_concurrency: 4,
        }
    }

    /// Caps how many sessions run at once (minimum 1).
    pub fn with_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Runs every `(seed, scenario)` pair. Results come back seed-major,
    /// in input order, whatever order the tasks finish in.
    pub async fn run_grid(&self, seeds: &[Seed], scenarios: &[ScenarioId]) -> Result<Vec<ScenarioResult>, SimError> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(seeds.len() * scenarios.len());

        for &seed in seeds {
            for &scenario in scenarios {
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| SimError::Join(e.to_string()))?;
                let runner = self.runner.clone().with_seed(seed);
                handles.push(tokio::task::spawn_blocking(move || {
                    let result = runner.run(scenario);
                    drop(permit);
                    result
                }));
            }
        }
        debug!(sessions = handles.len(), "all sessions spawned");

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|e| SimError::Join(e.to_string()))?);
        }

        let failed = results.iter().filter(|r| !r.passed).count();
        info!(sessions = results.len(), failed, "session grid finished");
        Ok(results)
    }

    /// Checks every seed for run-to-run determinism in parallel.
    pub async fn verify_grid(&self, seeds: &[Seed], scenarios: &[ScenarioId]) -> Result<Vec<String>, SimError> {
        let mut handles = Vec::with_capacity(seeds.len() * scenarios.len());
        for &seed in seeds {
            for &scenario in scenarios {
                let runner = self.runner.clone().with_seed(seed);
                handles.push(tokio::task::spawn_blocking(move || runner.verify_determinism(scenario)));
            }
        }

        let mut digests = Vec::with_capacity(handles.len());
        for handle in handles {
            digests.push(handle.await.map_err(|e| SimError::Join(e.to_string()))??);
        }
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grid_matches_sequential_runs() {
        let seeds = [1, 2, 42042];
        let scenarios = [ScenarioId::Procurement, ScenarioId::ErpThreeWay];
        let host = SessionHost::new(ScenarioRunner::new(0)).with_concurrency(3);

        let results = host.run_grid(&seeds, &scenarios).await.unwrap();
        assert_eq!(results.len(), 6);

        let mut i = 0;
        for seed in seeds {
            for scenario in scenarios {
                let expected = ScenarioRunner::new(seed).run(scenario);
                assert_eq!(results[i].seed, seed);
                assert_eq!(results[i].scenario, scenario);
                assert_eq!(results[i].trace_digest, expected.trace_digest);
                assert!(results[i].passed, "{:?}", results[i].failure_reason);
                i += 1;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_verify_grid_returns_one_digest_per_session() {
        let host = SessionHost::new(ScenarioRunner::new(0));
        let digests = host
            .verify_grid(&[5, 6], &[ScenarioId::Procurement])
            .await
            .unwrap();
        assert_eq!(digests.len(), 2);
        assert_ne!(digests[0], digests[1]);
    }

    #[test]
    fn test_concurrency_floor() {
        let host = SessionHost::new(ScenarioRunner::new(0)).with_concurrency(0);
        assert_eq!(host.max_concurrency(), 1);
    }
}
