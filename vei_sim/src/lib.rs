//! VEI Simulation Harness
//!
//! Connector twins, world definitions and a scenario catalog on top of the
//! `vei_core` kernel, plus the runner that scores scripted sessions and
//! checks them for reproducibility.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                        │
//! │   WorldConfig ──► providers ──► vei_core::Router           │
//! │                                   │                        │
//! │   ┌────────┐ ┌──────┐ ┌──────┐ ┌──┴──┐ ┌─────┐ ┌────────┐  │
//! │   │browser │ │slack │ │ mail │ │ erp │ │ crm │ │  okta  │  │
//! │   └────────┘ └──────┘ └──────┘ └─────┘ └─────┘ └────────┘  │
//! │        docs · servicedesk · drift · scheduled derails      │
//! └────────────────────────────────────────────────────────────┘
//!            │                                  │
//!       SessionHost (many seeds)        TraceExport (JSON, JSONL)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vei_sim::{ScenarioId, ScenarioRunner};
//!
//! let runner = ScenarioRunner::new(42042);
//! let result = runner.run(ScenarioId::Procurement);
//! assert!(result.passed);
//! ```

pub mod drift;
pub mod error;
pub mod exporter;
pub mod host;
pub mod runner;
pub mod scenarios;
pub mod twins;
pub mod world;

pub use drift::{DriftEngine, DriftMode};
pub use error::SimError;
pub use exporter::TraceExport;
pub use host::SessionHost;
pub use runner::{run_script, ScenarioMetrics, ScenarioResult, ScenarioRunner, ScriptRun, StepRecord};
pub use scenarios::{ScenarioId, Step};
pub use world::{DerailEvent, WorldConfig};
