pub mod engine;
pub mod rules;

pub use engine::{
    Decision, EscalationEngine, EscalationMode, EscalationSession, EscalationState, RuleContext,
};
pub use rules::{validate_rules, Action, EscalationRule, Precondition, Trigger};
