//! VEI Core - Deterministic Multi-Service Simulation Kernel
//!
//! The kernel every connector twin plugs into:
//! 1. **Event bus**: a min-heap keyed by `(due_time, insertion_sequence)`
//! 2. **State store**: JSON entity documents with atomic operations,
//!    receipts, historical snapshots and diffs
//! 3. **Router**: validation, sim/replay/live execution, bounded event
//!    draining, monitors and policy, all behind one `dispatch`
//!
//! ```text
//!   agent ──► Router::dispatch ──► ToolProvider (twin) ──► StateStore
//!                 │                      │
//!                 │                      └─ staged events ──► EventBus
//!                 ├─ Tracer (JSONL)                              │
//!                 ├─ Monitors ──► PolicyEngine                   │
//!                 └─ ObservationBuilder ◄──── drain due ◄────────┘
//! ```
//!
//! Same seed and same call sequence give a byte-identical trace.

pub mod archive;
pub mod canonical;
pub mod config;
pub mod dom_graph;
pub mod error;
pub mod event_bus;
pub mod monitor;
pub mod observation;
pub mod policy;
pub mod provider;
pub mod replay;
pub mod router;
pub mod schema;
pub mod state_store;
pub mod tool_registry;
pub mod trace;

// Re-export key types for convenience
pub use config::{ConnectorMode, DrainPolicy, FaultProfile, RouterConfig};
pub use dom_graph::{DomGraph, EncodedGraph};
pub use error::{ConnectorError, InvariantReport, KernelError, StoreError};
pub use event_bus::{EventBus, ScheduledEvent};
pub use monitor::{Finding, Monitor, Severity};
pub use observation::{MenuEntry, Observation};
pub use policy::{PolicyEngine, PolicyFinding};
pub use provider::{Affordance, LiveConnector, ProviderContext, ToolProvider};
pub use replay::{ReplayBundle, ReplayMatcher, ReplayRecorder};
pub use router::{ActOutcome, KernelState, PendingReport, ResetReport, Router, RouterBuilder, RouterPhase, TickReport};
pub use schema::{ArgKind, ArgsSchema};
pub use state_store::{Mutation, Operation, Receipt, Snapshot, StateDiff, StateStore};
pub use tool_registry::{SideEffect, ToolSpec};
pub use trace::{TraceEntry, Tracer};
