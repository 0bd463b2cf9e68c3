//! Step-execution engine for agent-driven code changes.
//!
//! A run is an ordered sequence of steps executed against a target
//! repository. Each step moves through a fixed pipeline (plan, code,
//! validate, commit, update PR, merge) driven one transition at a time by
//! [`Orchestrator::advance`]. A size guard and a validator gate sit between
//! the coder and the commit; anything recoverable pauses the step for an
//! operator instead of failing the run.

pub mod agents;
pub mod config;
pub mod contracts;
pub mod diff;
pub mod errors;
pub mod events;
pub mod gate;
pub mod guard;
pub mod machine;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod store;

pub use config::EngineConfig;
pub use contracts::{default_registry, ContractRegistry};
pub use errors::{AdapterFailure, ContractError, OrchestratorError, PauseReason};
pub use models::{Run, RunStatus, Step, StepSpec, StepState, ValidationReport};
pub use orchestrator::{Orchestrator, StepOutcome};
pub use store::{Store, StoreHandle};

/// Install a tracing subscriber honoring `RUST_LOG`. For binaries and
/// examples embedding the engine; tests and libraries skip it.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
