//! Check execution: process runner, cancellation, resource sampling and the
//! per-level executor loop.

pub mod cancel;
pub mod executor;
pub mod resources;
pub mod runner;

pub use cancel::CancelToken;
pub use executor::{ExecutorConfig, GateExecutor, InFlightPolicy, LevelOutcome, LevelRequest};
pub use resources::{
    adaptive_degree, ProcResources, ResourceStatus, ResourceStatusProvider, StaticResources,
};
pub use runner::{
    run_with_retries, CheckContext, CheckOutput, CheckRunner, CommandRunner, RunStatus,
    RISK_MARKER,
};
