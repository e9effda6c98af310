//! Change analysis: complexity aggregation and risk evaluation.

pub mod complexity;
pub mod risk;

pub use complexity::aggregate;
pub use risk::{FactorEscalation, RiskBreakpoint, RiskEvaluator, RiskPolicy};
