//! Rule evaluation and the per-run escalation state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::TollgateResult;
use crate::escalation::rules::{validate_rules, Action, EscalationRule, Precondition, Trigger};
use crate::execution::resources::{ResourceStatusProvider, StaticResources};
use crate::gates::catalog::GateCatalog;
use crate::models::{ExecutionRun, RiskAssessment, RiskFactor, Verdict, WorkflowPhase};

/// How an escalation treats the level being left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationMode {
    /// Stop the current level per the in-flight policy and carry passing
    /// evidence forward.
    Additive,
    /// Cancel in-flight work; the target runs without early termination.
    TerminateToHighest,
}

/// Outcome of evaluating rules after a result was appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Escalate {
        target: usize,
        rule: Option<String>,
        reason: String,
        mode: EscalationMode,
    },
    /// A matching rule was vetoed by `NotInRedPhase`; the run ends `Failed`
    /// at the current level.
    Suppress { rule: String },
}

impl Decision {
    /// Whether in-flight checks must be cancelled regardless of policy.
    pub fn forces_cancel(&self) -> bool {
        match self {
            Decision::Escalate { mode, .. } => *mode == EscalationMode::TerminateToHighest,
            Decision::Suppress { .. } => true,
        }
    }
}

/// Inputs to one rule evaluation besides the run itself.
pub struct RuleContext<'a> {
    pub catalog: &'a GateCatalog,
    pub current: usize,
    pub phase: WorkflowPhase,
    pub risk: &'a RiskAssessment,
    pub elapsed: Duration,
    /// Reference instant for rule cooldowns.
    pub now: Instant,
}

/// Ordered rule set. Earlier rules take priority.
///
/// The engine outlives individual runs, so a rule's cooldown spans every
/// run evaluated through it.
pub struct EscalationEngine {
    rules: Vec<EscalationRule>,
    resources: Arc<dyn ResourceStatusProvider>,
    fired: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for EscalationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationEngine")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            resources: Arc::new(StaticResources::default()),
            fired: Mutex::new(HashMap::new()),
        }
    }
}

impl EscalationEngine {
    pub fn new(
        rules: Vec<EscalationRule>,
        catalog: &GateCatalog,
        resources: Arc<dyn ResourceStatusProvider>,
    ) -> TollgateResult<Self> {
        validate_rules(&rules, catalog)?;
        Ok(Self {
            rules,
            resources,
            fired: Mutex::new(HashMap::new()),
        })
    }

    pub fn rules(&self) -> &[EscalationRule] {
        &self.rules
    }

    /// Start `rule`'s cooldown at `at`. Rules without a cooldown are ignored.
    pub fn record_fired(&self, rule: &str, at: Instant) {
        if self
            .rules
            .iter()
            .any(|r| r.name == rule && r.cooldown.is_some())
        {
            self.fired.lock().insert(rule.to_string(), at);
        }
    }

    fn cooling_down(&self, rule: &EscalationRule, now: Instant) -> bool {
        let Some(cooldown) = rule.cooldown else {
            return false;
        };
        self.fired
            .lock()
            .get(&rule.name)
            .is_some_and(|fired_at| now < *fired_at + cooldown)
    }

    /// First rule whose trigger matches, whose preconditions hold, and whose
    /// target lies above the current level.
    pub fn evaluate(&self, run: &ExecutionRun, ctx: &RuleContext<'_>) -> Option<Decision> {
        for rule in self.rules.iter().filter(|r| r.enabled) {
            if self.cooling_down(rule, ctx.now) {
                debug!(rule = %rule.name, "escalation rule cooling down");
                continue;
            }
            if !self.trigger_matches(&rule.trigger, run, ctx) {
                continue;
            }

            let target = match &rule.action {
                Action::EscalateTo { level } => match ctx.catalog.index_of(level) {
                    Some(idx) => idx,
                    None => {
                        warn!(rule = %rule.name, level = %level, "escalation target missing");
                        continue;
                    }
                },
                Action::TerminateAndEscalateToHighest => ctx.catalog.highest_index(),
            };
            if target <= ctx.current {
                debug!(
                    rule = %rule.name,
                    target,
                    current = ctx.current,
                    "target not above current level"
                );
                continue;
            }

            if !rule
                .preconditions
                .iter()
                .filter(|p| **p != Precondition::NotInRedPhase)
                .all(|p| precondition_holds(p, ctx))
            {
                debug!(rule = %rule.name, "escalation preconditions not met");
                continue;
            }
            if ctx.phase.is_red() && rule.preconditions.contains(&Precondition::NotInRedPhase) {
                if !rule.trigger.is_failure() {
                    debug!(rule = %rule.name, "rule does not apply in red phase");
                    continue;
                }
                info!(rule = %rule.name, "escalation suppressed in red phase");
                return Some(Decision::Suppress {
                    rule: rule.name.clone(),
                });
            }

            let mode = match rule.action {
                Action::EscalateTo { .. } => EscalationMode::Additive,
                Action::TerminateAndEscalateToHighest => EscalationMode::TerminateToHighest,
            };
            return Some(Decision::Escalate {
                target,
                rule: Some(rule.name.clone()),
                reason: describe_trigger(&rule.trigger),
                mode,
            });
        }
        None
    }

    fn trigger_matches(
        &self,
        trigger: &Trigger,
        run: &ExecutionRun,
        ctx: &RuleContext<'_>,
    ) -> bool {
        match trigger {
            Trigger::CheckFailureCount {
                check,
                min_failures,
            } => run.failure_count(check) >= *min_failures as usize,
            Trigger::TotalDurationExceeded { max } => ctx.elapsed >= *max,
            Trigger::ResourceThresholdReached {
                max_cpu,
                max_memory,
            } => {
                let status = self.resources.status();
                max_cpu.is_some_and(|m| status.cpu_load >= m)
                    || max_memory.is_some_and(|m| status.memory_pressure >= m)
            }
            Trigger::RiskLevelIncreased { at_least } => match run.max_reported_risk() {
                Some(reported) => {
                    reported > ctx.risk.level && at_least.map_or(true, |floor| reported >= floor)
                }
                None => false,
            },
        }
    }
}

fn precondition_holds(precondition: &Precondition, ctx: &RuleContext<'_>) -> bool {
    match precondition {
        Precondition::NotInRedPhase => !ctx.phase.is_red(),
        Precondition::MinimumElapsed { min } => ctx.elapsed >= *min,
        Precondition::CriticalPathChange => {
            ctx.risk.has_factor(RiskFactor::SchemaChange)
                || ctx.risk.has_factor(RiskFactor::PublicApiChange)
                || ctx.risk.has_factor(RiskFactor::SecuritySensitivePath)
        }
    }
}

fn describe_trigger(trigger: &Trigger) -> String {
    match trigger {
        Trigger::CheckFailureCount {
            check,
            min_failures,
        } => format!("check '{check}' failed {min_failures}+ times"),
        Trigger::TotalDurationExceeded { max } => {
            format!("run exceeded {} ms", max.as_millis())
        }
        Trigger::ResourceThresholdReached { .. } => "resource threshold reached".to_string(),
        Trigger::RiskLevelIncreased { .. } => "check reported higher risk".to_string(),
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationState {
    Running { level: usize },
    EvaluatingEscalation { level: usize },
    Escalated { from: usize, to: usize },
    Terminated(Verdict),
}

/// One run's walk through the catalog. Levels only ever increase.
pub struct EscalationSession<'a> {
    engine: &'a EscalationEngine,
    catalog: &'a GateCatalog,
    phase: WorkflowPhase,
    risk: &'a RiskAssessment,
    started: Instant,
    state: EscalationState,
    current: usize,
}

impl<'a> EscalationSession<'a> {
    pub fn new(
        engine: &'a EscalationEngine,
        catalog: &'a GateCatalog,
        phase: WorkflowPhase,
        risk: &'a RiskAssessment,
        started: Instant,
        level: usize,
    ) -> Self {
        Self {
            engine,
            catalog,
            phase,
            risk,
            started,
            state: EscalationState::Running { level },
            current: level,
        }
    }

    pub fn state(&self) -> &EscalationState {
        &self.state
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.phase
    }

    /// Evaluate rules after a result was appended. The first decision moves
    /// the session out of `Running`; later calls return `None` until the
    /// session is running again.
    pub fn observe(&mut self, run: &ExecutionRun) -> Option<Decision> {
        let EscalationState::Running { level } = self.state else {
            return None;
        };
        self.state = EscalationState::EvaluatingEscalation { level };
        let now = Instant::now();
        let ctx = RuleContext {
            catalog: self.catalog,
            current: self.current,
            phase: self.phase,
            risk: self.risk,
            elapsed: now.saturating_duration_since(self.started),
            now,
        };
        let decision = self.engine.evaluate(run, &ctx);
        match &decision {
            None => self.state = EscalationState::Running { level },
            Some(Decision::Escalate {
                rule: Some(rule), ..
            }) => self.engine.record_fired(rule, now),
            Some(_) => {}
        }
        decision
    }

    /// Move to `target`. Returns false (and leaves the state alone) when the
    /// target would not strictly increase the level.
    pub fn escalate(&mut self, target: usize) -> bool {
        if target <= self.current || target >= self.catalog.len() {
            return false;
        }
        self.state = EscalationState::Escalated {
            from: self.current,
            to: target,
        };
        self.current = target;
        true
    }

    /// Mark the escalated level as running.
    pub fn enter(&mut self) {
        self.state = EscalationState::Running {
            level: self.current,
        };
    }

    pub fn terminate(&mut self, verdict: Verdict) {
        self.state = EscalationState::Terminated(verdict);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
