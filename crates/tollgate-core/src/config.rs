//! Orchestrator configuration: one JSON document, parsed and validated once.
//!
//! Sections:
//!
//! ```json
//! {
//!   "levels": [ ... ],
//!   "escalation_rules": [ ... ],
//!   "risk": { ... },
//!   "executor": { ... },
//!   "selector": { ... },
//!   "history": { "backend": "sqlite", "path": "~/.tollgate/history.db" }
//! }
//! ```
//!
//! Durations are milliseconds (`*_ms` keys). The catalog is validated while
//! it is deserialized; rules and risk breakpoints are validated afterwards
//! against it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::risk::{RiskBreakpoint, RiskPolicy};
use crate::errors::{TollgateError, TollgateResult};
use crate::escalation::rules::{validate_rules, Action, EscalationRule, Precondition, Trigger};
use crate::execution::executor::ExecutorConfig;
use crate::gates::catalog::{
    ActivationPredicate, ChangeThreshold, CheckSpec, ConcurrencyStrategy, GateCatalog, GateLevel,
};
use crate::gates::selector::HistoryHint;
use crate::models::{ChangeKind, FileCategory, RiskLevel};

fn default_true() -> bool {
    true
}

fn default_memory_capacity() -> usize {
    1_000
}

/// Where finished runs are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum HistoryBackend {
    #[default]
    Disabled,
    Memory {
        #[serde(default = "default_memory_capacity")]
        capacity: usize,
    },
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(flatten)]
    pub backend: HistoryBackend,
    /// Record off the calling thread.
    #[serde(default = "default_true")]
    pub background: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Disabled,
            background: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub levels: GateCatalog,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,
    #[serde(default)]
    pub risk: RiskPolicy,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub selector: HistoryHint,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl OrchestratorConfig {
    pub fn new(levels: GateCatalog) -> Self {
        Self {
            levels,
            escalation_rules: Vec::new(),
            risk: RiskPolicy::default(),
            executor: ExecutorConfig::default(),
            selector: HistoryHint::default(),
            history: HistoryConfig::default(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<EscalationRule>) -> Self {
        self.escalation_rules = rules;
        self
    }

    pub fn with_history(mut self, backend: HistoryBackend) -> Self {
        self.history.backend = backend;
        self
    }

    /// Parse and validate. Any problem is a [`TollgateError::Config`].
    pub fn from_json_str(json: &str) -> TollgateResult<Self> {
        let config: OrchestratorConfig = serde_json::from_str(json)
            .map_err(|e| TollgateError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> TollgateResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TollgateError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "loading orchestrator configuration");
        Self::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> TollgateResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> TollgateResult<()> {
        validate_rules(&self.escalation_rules, &self.levels)?;
        validate_risk_policy(&self.risk)?;

        let hint = &self.selector;
        if hint.enabled && !(hint.min_share > 0.0 && hint.min_share <= 1.0) {
            return Err(TollgateError::config(format!(
                "selector min_share {} outside (0, 1]",
                hint.min_share
            )));
        }
        if let HistoryBackend::Memory { capacity: 0 } = self.history.backend {
            return Err(TollgateError::config("memory history capacity must be >= 1"));
        }
        Ok(())
    }

    /// Built-in ladder with its matching rules.
    pub fn standard() -> TollgateResult<Self> {
        let config = Self::new(Self::default_catalog()?).with_rules(Self::default_rules());
        config.validate()?;
        Ok(config)
    }

    /// `minimal -> light -> standard -> full`, each a superset of the last.
    pub fn default_catalog() -> TollgateResult<GateCatalog> {
        let fmt = make_check("fmt", 60);
        let lint = make_check("lint", 120);
        let unit = make_check("unit-tests", 300);
        let integration = make_check("integration-tests", 600);
        let schema = make_check("schema-compat", 300);
        let api = make_check("api-compat", 300);
        let docs = make_check("docs", 120)
            .non_blocking()
            .activated_when(ActivationPredicate::CategoryPresent {
                category: FileCategory::Documentation,
            });
        let security = make_check("security-scan", 900);
        let e2e = make_check("e2e", 1_800);

        GateCatalog::new(vec![
            GateLevel::new(
                "minimal",
                ChangeThreshold::unrestricted()
                    .with_max_lines(50)
                    .with_max_files(5)
                    .with_max_complexity_delta(5)
                    .with_allowed_kinds([ChangeKind::Created, ChangeKind::Modified])
                    .with_max_risk(RiskLevel::Low),
                Duration::from_secs(120),
            )
            .require(fmt.clone())
            .require(lint.clone()),
            GateLevel::new(
                "light",
                ChangeThreshold::unrestricted()
                    .with_max_lines(200)
                    .with_max_files(15)
                    .with_max_complexity_delta(20)
                    .with_allowed_kinds([
                        ChangeKind::Created,
                        ChangeKind::Modified,
                        ChangeKind::Deleted,
                    ])
                    .with_max_risk(RiskLevel::Medium),
                Duration::from_secs(300),
            )
            .require(fmt.clone())
            .require(lint.clone())
            .require(unit.clone())
            .optionally(docs.clone())
            .with_concurrency(ConcurrencyStrategy::BoundedParallel { max_in_flight: 2 })
            .escalating_on_failure(),
            GateLevel::new(
                "standard",
                ChangeThreshold::unrestricted()
                    .with_max_lines(1_000)
                    .with_max_files(50)
                    .with_max_complexity_delta(80)
                    .with_max_risk(RiskLevel::High),
                Duration::from_secs(900),
            )
            .require(fmt.clone())
            .require(lint.clone())
            .require(unit.clone())
            .require(integration.clone())
            .require(schema.clone())
            .require(api.clone())
            .optionally(docs.clone())
            .optionally(security.clone().activated_when(ActivationPredicate::RiskAtLeast {
                level: RiskLevel::High,
            }))
            .with_concurrency(ConcurrencyStrategy::Adaptive { ceiling: 4 }),
            GateLevel::new(
                "full",
                ChangeThreshold::unrestricted(),
                Duration::from_secs(2_700),
            )
            .require(fmt)
            .require(lint)
            .require(unit)
            .require(integration)
            .require(schema)
            .require(api)
            .require(security)
            .require(e2e)
            .optionally(docs)
            .with_concurrency(ConcurrencyStrategy::Adaptive { ceiling: 8 }),
        ])
    }

    /// Rules for [`Self::default_catalog`].
    pub fn default_rules() -> Vec<EscalationRule> {
        vec![
            EscalationRule::new(
                "risk-reported-by-check",
                Trigger::RiskLevelIncreased {
                    at_least: Some(RiskLevel::High),
                },
                Action::TerminateAndEscalateToHighest,
            ),
            EscalationRule::escalate_on_failures("lint-failure", "lint", 1, "standard")
                .when(Precondition::NotInRedPhase),
            EscalationRule::escalate_on_failures("unit-test-failure", "unit-tests", 1, "standard")
                .when(Precondition::NotInRedPhase),
            EscalationRule::escalate_on_failures(
                "critical-path-integration-failure",
                "integration-tests",
                1,
                "full",
            )
            .when(Precondition::CriticalPathChange)
            .when(Precondition::NotInRedPhase),
        ]
    }
}

fn make_check(target: &str, timeout_secs: u64) -> CheckSpec {
    CheckSpec::new(target, ["make", target], Duration::from_secs(timeout_secs))
}

fn validate_risk_policy(policy: &RiskPolicy) -> TollgateResult<()> {
    let tiers: [(&str, &RiskBreakpoint); 3] = [
        ("medium", &policy.medium),
        ("high", &policy.high),
        ("critical", &policy.critical),
    ];
    for pair in tiers.windows(2) {
        let (lower_name, lower) = pair[0];
        let (upper_name, upper) = pair[1];
        let inverted =
            |a: Option<i64>, b: Option<i64>| matches!((a, b), (Some(a), Some(b)) if b < a);
        let to_i64 = |v: Option<u64>| v.map(|v| v as i64);
        if inverted(to_i64(lower.lines), to_i64(upper.lines))
            || inverted(to_i64(lower.files), to_i64(upper.files))
            || inverted(lower.complexity_delta, upper.complexity_delta)
        {
            return Err(TollgateError::config(format!(
                "risk breakpoint '{upper_name}' is below '{lower_name}'"
            )));
        }
    }
    Ok(())
}
