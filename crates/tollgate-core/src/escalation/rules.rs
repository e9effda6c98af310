//! Escalation rule definitions and load-time validation.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{TollgateError, TollgateResult};
use crate::gates::catalog::GateCatalog;
use crate::gates::guards::MAX_ESCALATION_RULES;
use crate::models::{duration_ms, opt_duration_ms, RiskLevel};

fn default_true() -> bool {
    true
}

fn default_min_failures() -> u32 {
    1
}

/// Condition over the run so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum Trigger {
    /// Named check has failed (or timed out) at least `min_failures` times.
    CheckFailureCount {
        check: String,
        #[serde(default = "default_min_failures")]
        min_failures: u32,
    },
    /// Wall-clock time since the run started.
    TotalDurationExceeded {
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
    },
    /// Either sampled fraction reaches its bound.
    ResourceThresholdReached {
        #[serde(default)]
        max_cpu: Option<f64>,
        #[serde(default)]
        max_memory: Option<f64>,
    },
    /// A check reported risk above the assessed level (and at least
    /// `at_least`, when set).
    RiskLevelIncreased {
        #[serde(default)]
        at_least: Option<RiskLevel>,
    },
}

impl Trigger {
    /// Whether the trigger fires on failing checks, as opposed to time,
    /// load or reported risk.
    pub fn is_failure(&self) -> bool {
        matches!(self, Trigger::CheckFailureCount { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum Action {
    EscalateTo { level: String },
    /// Cancel in-flight work and jump to the catch-all level with early
    /// termination disabled.
    TerminateAndEscalateToHighest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "require", rename_all = "snake_case")]
pub enum Precondition {
    /// Violated in the red phase. On a failure trigger the violation
    /// suppresses escalation and ends the run; on any other trigger the rule
    /// just does not apply.
    NotInRedPhase,
    MinimumElapsed {
        #[serde(rename = "min_ms", with = "duration_ms")]
        min: Duration,
    },
    /// The change carries a schema, public-API or security factor.
    CriticalPathChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub name: String,
    pub trigger: Trigger,
    pub action: Action,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// After firing, the rule stays quiet for this long within the run.
    #[serde(
        default,
        rename = "cooldown_ms",
        with = "opt_duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub cooldown: Option<Duration>,
}

impl EscalationRule {
    pub fn new(name: impl Into<String>, trigger: Trigger, action: Action) -> Self {
        Self {
            name: name.into(),
            trigger,
            action,
            preconditions: Vec::new(),
            enabled: true,
            cooldown: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn when(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn escalate_on_failures(
        name: impl Into<String>,
        check: impl Into<String>,
        min_failures: u32,
        level: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            Trigger::CheckFailureCount {
                check: check.into(),
                min_failures,
            },
            Action::EscalateTo {
                level: level.into(),
            },
        )
    }
}

/// Validate rules against the catalog they will escalate within.
pub fn validate_rules(rules: &[EscalationRule], catalog: &GateCatalog) -> TollgateResult<()> {
    if rules.len() > MAX_ESCALATION_RULES {
        return Err(TollgateError::config(format!(
            "{} escalation rules (max {MAX_ESCALATION_RULES})",
            rules.len()
        )));
    }
    let mut names = HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            return Err(TollgateError::config("escalation rule with an empty name"));
        }
        if !names.insert(rule.name.as_str()) {
            return Err(TollgateError::config(format!(
                "escalation rule '{}' declared twice",
                rule.name
            )));
        }
        match &rule.trigger {
            Trigger::CheckFailureCount { check, min_failures } => {
                if check.trim().is_empty() || *min_failures == 0 {
                    return Err(TollgateError::config(format!(
                        "rule '{}' needs a check name and min_failures >= 1",
                        rule.name
                    )));
                }
            }
            Trigger::TotalDurationExceeded { max } => {
                if max.is_zero() {
                    return Err(TollgateError::config(format!(
                        "rule '{}' has a zero duration bound",
                        rule.name
                    )));
                }
            }
            Trigger::ResourceThresholdReached {
                max_cpu,
                max_memory,
            } => {
                let in_range =
                    |v: &Option<f64>| v.map_or(true, |f| f.is_finite() && f > 0.0 && f <= 1.0);
                if (max_cpu.is_none() && max_memory.is_none())
                    || !in_range(max_cpu)
                    || !in_range(max_memory)
                {
                    return Err(TollgateError::config(format!(
                        "rule '{}' needs resource bounds in (0, 1]",
                        rule.name
                    )));
                }
            }
            Trigger::RiskLevelIncreased { .. } => {}
        }
        if rule.cooldown.is_some_and(|c| c.is_zero()) {
            return Err(TollgateError::config(format!(
                "rule '{}' has a zero cooldown",
                rule.name
            )));
        }
        if let Action::EscalateTo { level } = &rule.action {
            match catalog.level(level) {
                None => {
                    return Err(TollgateError::config(format!(
                        "rule '{}' escalates to unknown level '{level}'",
                        rule.name
                    )))
                }
                Some(target) if !target.enabled => {
                    return Err(TollgateError::config(format!(
                        "rule '{}' escalates to disabled level '{level}'",
                        rule.name
                    )))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
