//! Tollgate core library: adaptive quality gates for code changes.
//!
//! A change set is aggregated into [`ComplexityMetrics`], scored into a
//! [`RiskAssessment`], matched to the cheapest [`GateLevel`] whose threshold
//! admits it, and executed under that level's budget and concurrency
//! strategy. Escalation rules watch every appended result and can move the
//! run to a more expensive level without re-running checks that already
//! passed. The caller always gets back a finalized [`ExecutionRun`].

pub mod analysis;
pub mod config;
pub mod errors;
pub mod escalation;
pub mod execution;
pub mod gates;
pub mod models;
pub mod orchestrator;
pub mod store;

pub use config::{HistoryBackend, HistoryConfig, OrchestratorConfig};
pub use errors::{TollgateError, TollgateResult};
pub use execution::{CancelToken, CheckRunner, CommandRunner};
pub use gates::{GateCatalog, GateLevel};
pub use models::{
    ChangeKind, CheckOutcome, CheckResult, ComplexityMetrics, ExecutionRun, FileCategory,
    FileChange, ImpactSummary, RiskAssessment, RiskFactor, RiskLevel, Verdict, WorkflowPhase,
};
pub use orchestrator::Orchestrator;
