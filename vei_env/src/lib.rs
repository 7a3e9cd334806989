//! VEI Environment Layer
//!
//! The deterministic primitives every other VEI crate is built on:
//! - A logical clock measured in milliseconds that only moves forward
//! - Seeded RNG streams (ChaCha8) for every stochastic decision
//! - A `SessionContext` owning both, created once per run
//!
//! Nothing in this crate reads wall-clock time or OS entropy. Given the
//! same seed, a `SessionContext` produces the same draw sequence on any
//! machine, which is what makes whole-run replay possible.
//!
//! # Example
//!
//! ```ignore
//! use vei_env::SessionContext;
//!
//! let mut ctx = SessionContext::new(42042);
//! ctx.clock_mut().advance(1000)?;
//! let roll = ctx.rng_mut().next_random();
//! ```

mod clock;
mod context;
mod error;
mod rng;
mod types;

pub use clock::LogicalClock;
pub use context::SessionContext;
pub use error::EnvError;
pub use rng::{derive_seed, SimRng};
pub use types::{connector_of, LogicalTime, Seed, SessionId, DEFAULT_SEED};
