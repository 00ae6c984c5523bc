//! Coverage-guided, mutation-based fuzz testing harness for native executables.
//!
//! See the module-level docs of [`coverage`], [`executor`], [`mutator`], [`corpus`],
//! [`triage`], and [`orchestrator`] for the four core subsystems plus the worker pool
//! that drives them.

pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod mutator;
pub mod orchestrator;
pub mod rng;
pub mod triage;
pub mod util;

use thiserror::Error;

/// Crate-local error type. Covers configuration and setup failures only; host-side
/// per-execution failures are data (`executor::ExecResult`), not errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("coverage setup failed: {0}")]
    CoverageSetup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
