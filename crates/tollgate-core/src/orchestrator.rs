//! Top-level entry point: analyse a change set, pick a level, run it, and
//! escalate until a level settles the verdict.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::analysis::complexity::aggregate;
use crate::analysis::risk::RiskEvaluator;
use crate::config::{HistoryBackend, OrchestratorConfig};
use crate::errors::TollgateResult;
use crate::escalation::engine::{Decision, EscalationEngine, EscalationMode, EscalationSession};
use crate::execution::cancel::CancelToken;
use crate::execution::executor::{GateExecutor, LevelOutcome, LevelRequest};
use crate::execution::resources::{ProcResources, ResourceStatusProvider};
use crate::execution::runner::{CheckRunner, CommandRunner};
use crate::gates::catalog::{GateCatalog, GateLevel};
use crate::gates::selector::LevelSelector;
use crate::models::{
    change_set_fingerprint, ComplexityMetrics, EscalationHop, ExecutionRun, FileChange,
    ImpactSummary, RiskAssessment, WorkflowPhase,
};
use crate::store::history::{
    HistoryRecorder, HistoryStore, MemoryHistoryStore, SqliteHistoryStore,
};

/// Where the next level comes from after one finishes.
struct NextLevel {
    target: usize,
    rule: Option<String>,
    reason: String,
    mode: EscalationMode,
}

#[derive(Debug)]
pub struct Orchestrator {
    catalog: GateCatalog,
    evaluator: RiskEvaluator,
    selector: LevelSelector,
    engine: EscalationEngine,
    executor: GateExecutor,
    history: Option<HistoryRecorder>,
}

impl Orchestrator {
    /// Real processes, `/proc` resource sampling, history per config.
    pub fn from_config(config: OrchestratorConfig) -> TollgateResult<Self> {
        let runner = Arc::new(CommandRunner::new(config.executor.poll_interval));
        Self::with_runner(config, runner, Arc::new(ProcResources::default()))
    }

    pub fn with_runner(
        config: OrchestratorConfig,
        runner: Arc<dyn CheckRunner>,
        resources: Arc<dyn ResourceStatusProvider>,
    ) -> TollgateResult<Self> {
        config.validate()?;
        let store: Option<Arc<dyn HistoryStore>> = match &config.history.backend {
            HistoryBackend::Disabled => None,
            HistoryBackend::Memory { capacity } => Some(Arc::new(
                MemoryHistoryStore::with_capacity(*capacity),
            ) as Arc<dyn HistoryStore>),
            HistoryBackend::Sqlite { path } => {
                Some(Arc::new(SqliteHistoryStore::open(path)?) as Arc<dyn HistoryStore>)
            }
        };
        let history = store.map(|store| {
            let recorder = if config.history.background {
                HistoryRecorder::new(store)
            } else {
                HistoryRecorder::inline(store)
            };
            recorder.with_query_limit(config.selector.max_samples)
        });

        let engine = EscalationEngine::new(
            config.escalation_rules,
            &config.levels,
            Arc::clone(&resources),
        )?;
        Ok(Self {
            evaluator: RiskEvaluator::new(config.risk),
            selector: LevelSelector::new(config.selector),
            executor: GateExecutor::new(runner, resources, config.executor),
            catalog: config.levels,
            engine,
            history,
        })
    }

    /// Replace the configured history (or add one).
    pub fn with_history(mut self, recorder: HistoryRecorder) -> Self {
        self.history = Some(recorder);
        self
    }

    pub fn without_history(mut self) -> Self {
        self.history = None;
        self
    }

    pub fn catalog(&self) -> &GateCatalog {
        &self.catalog
    }

    pub fn history(&self) -> Option<&HistoryRecorder> {
        self.history.as_ref()
    }

    /// Metrics and risk for a change set, without running anything.
    pub fn assess(
        &self,
        changes: &[FileChange],
        impact: &ImpactSummary,
    ) -> (ComplexityMetrics, RiskAssessment) {
        let metrics = aggregate(changes);
        let risk = self.evaluator.evaluate(&metrics, impact);
        (metrics, risk)
    }

    /// The level `evaluate` would start at.
    pub fn plan(&self, changes: &[FileChange], impact: &ImpactSummary) -> &GateLevel {
        let (metrics, risk) = self.assess(changes, impact);
        let index = self.select(&metrics, &risk);
        self.level_at(index)
    }

    fn select(&self, metrics: &ComplexityMetrics, risk: &RiskAssessment) -> usize {
        let history = self
            .history
            .as_ref()
            .map(|h| h.query(&metrics.shape_fingerprint(risk.level)))
            .unwrap_or_default();
        match self
            .selector
            .select_index(risk, metrics, &self.catalog, &history)
        {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "selection failed, falling back to the highest level");
                self.catalog.highest_index()
            }
        }
    }

    fn level_at(&self, index: usize) -> &GateLevel {
        self.catalog
            .get(index)
            .unwrap_or_else(|| self.catalog.highest())
    }

    /// Run the gate for a change set. Always returns a finalized run.
    pub fn evaluate(
        &self,
        changes: &[FileChange],
        impact: &ImpactSummary,
        phase: WorkflowPhase,
        cancel: &CancelToken,
    ) -> ExecutionRun {
        let started = Instant::now();
        let (metrics, risk) = self.assess(changes, impact);
        let start = self.select(&metrics, &risk);

        let mut run = ExecutionRun::new(&self.level_at(start).name);
        run.change_set_fingerprint = change_set_fingerprint(changes);
        run.shape_fingerprint = metrics.shape_fingerprint(risk.level);
        run.phase = phase;
        run.risk_level = risk.level;
        info!(
            run = %run.run_id,
            level = %run.selected_level,
            risk = risk.level.as_str(),
            lines = metrics.lines_changed,
            files = metrics.files_affected,
            "gate level selected"
        );

        let mut session =
            EscalationSession::new(&self.engine, &self.catalog, phase, &risk, started, start);
        let mut early_termination = true;

        loop {
            let index = session.current();
            let level = self.level_at(index);
            run.enter_level(&level.name, level.max_execution_time);

            let request = LevelRequest {
                level,
                metrics: &metrics,
                risk: &risk,
                cancel,
                run_started: started,
                early_termination,
            };
            let outcome = self.executor.run_level(&mut run, &request, &mut |r: &ExecutionRun| {
                session.observe(r)
            });

            if let Some(next) = self.next_level(index, level, &outcome) {
                if session.escalate(next.target) {
                    let to = self.level_at(next.target);
                    let reused_checks: Vec<String> = to
                        .required
                        .iter()
                        .chain(to.optional.iter())
                        .filter(|check| run.has_passed(&check.name))
                        .map(|check| check.name.clone())
                        .collect();
                    info!(
                        run = %run.run_id,
                        from = %level.name,
                        to = %to.name,
                        rule = next.rule.as_deref().unwrap_or("escalate_on_failure"),
                        reason = %next.reason,
                        reused = reused_checks.len(),
                        "escalating"
                    );
                    run.record_hop(EscalationHop {
                        from_level: level.name.clone(),
                        to_level: to.name.clone(),
                        rule: next.rule,
                        reason: next.reason,
                        at_ms: started.elapsed().as_millis() as u64,
                        reused_checks,
                    });
                    if next.mode == EscalationMode::TerminateToHighest {
                        early_termination = false;
                    }
                    session.enter();
                    continue;
                }
            }

            let (verdict, termination) = outcome.verdict(&level.name, run.escalated());
            session.terminate(verdict);
            run.finalize(verdict, termination, started.elapsed());
            break;
        }

        info!(
            run = %run.run_id,
            verdict = run.verdict.map(|v| v.as_str()).unwrap_or("none"),
            final_level = %run.final_level(),
            hops = run.hops.len(),
            duration_ms = run.duration.as_millis() as u64,
            "gate run finished"
        );
        if let Some(history) = &self.history {
            history.record(&run);
        }
        run
    }

    fn next_level(
        &self,
        index: usize,
        level: &GateLevel,
        outcome: &LevelOutcome,
    ) -> Option<NextLevel> {
        match outcome {
            LevelOutcome::Interrupted(Decision::Escalate {
                target,
                rule,
                reason,
                mode,
            }) => Some(NextLevel {
                target: *target,
                rule: rule.clone(),
                reason: reason.clone(),
                mode: *mode,
            }),
            LevelOutcome::Completed { failed }
                if !failed.is_empty() && level.escalate_on_failure =>
            {
                self.on_failure(index, level, failed.join(", "))
            }
            LevelOutcome::BlockingFailure { check } if level.escalate_on_failure => {
                self.on_failure(index, level, check.clone())
            }
            _ => None,
        }
    }

    fn on_failure(&self, index: usize, level: &GateLevel, checks: String) -> Option<NextLevel> {
        let target = self.catalog.next_enabled_after(index)?;
        Some(NextLevel {
            target,
            rule: None,
            reason: format!("level '{}' failed: {checks}", level.name),
            mode: EscalationMode::Additive,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::escalation::rules::EscalationRule;
    use crate::execution::resources::StaticResources;
    use crate::execution::runner::{CheckContext, CheckOutput};
    use crate::gates::catalog::{ChangeThreshold, CheckSpec};
    use crate::models::{ChangeKind, CheckOutcome, Termination, Verdict};

    fn check(name: &str) -> CheckSpec {
        CheckSpec::new(name, ["true"], Duration::from_secs(5))
    }

    fn ladder(escalate_light: bool) -> OrchestratorConfig {
        let mut light = GateLevel::new(
            "light",
            ChangeThreshold::unrestricted().with_max_lines(100),
            Duration::from_secs(30),
        )
        .require(check("lint"))
        .require(check("unit"));
        if escalate_light {
            light = light.escalating_on_failure();
        }
        let full = GateLevel::new("full", ChangeThreshold::unrestricted(), Duration::from_secs(30))
            .require(check("lint"))
            .require(check("unit"))
            .require(check("integration"));
        OrchestratorConfig::new(GateCatalog::new(vec![light, full]).unwrap())
    }

    fn failing(names: &'static [&'static str]) -> Arc<dyn CheckRunner> {
        Arc::new(move |spec: &CheckSpec, _ctx: &CheckContext| {
            let code = if names.contains(&spec.name.as_str()) { 1 } else { 0 };
            CheckOutput::exited(code, "")
        })
    }

    fn orchestrator(config: OrchestratorConfig, runner: Arc<dyn CheckRunner>) -> Orchestrator {
        Orchestrator::with_runner(config, runner, Arc::new(StaticResources::default())).unwrap()
    }

    fn small_change() -> Vec<FileChange> {
        vec![FileChange::new("src/lib.rs", ChangeKind::Modified).with_lines(10, 2)]
    }

    #[test]
    fn passing_level_finishes_without_hops() {
        let orch = orchestrator(ladder(false), failing(&[]));
        let run = orch.evaluate(
            &small_change(),
            &ImpactSummary::default(),
            WorkflowPhase::Development,
            &CancelToken::new(),
        );
        assert_eq!(run.verdict, Some(Verdict::Passed));
        assert_eq!(run.selected_level, "light");
        assert!(run.hops.is_empty());
        assert!(!run.change_set_fingerprint.is_empty());
        assert_eq!(run.budget, Duration::from_secs(30));
    }

    #[test]
    fn level_flag_escalates_without_a_rule() {
        let orch = orchestrator(ladder(true), failing(&["unit"]));
        let run = orch.evaluate(
            &small_change(),
            &ImpactSummary::default(),
            WorkflowPhase::Development,
            &CancelToken::new(),
        );
        assert_eq!(run.levels_visited, ["light", "full"]);
        assert_eq!(run.hops.len(), 1);
        assert_eq!(run.hops[0].rule, None);
        assert_eq!(run.hops[0].reused_checks, ["lint"]);
        assert_eq!(run.executions_of("lint"), 1);
        assert_eq!(run.verdict, Some(Verdict::EscalatedThenFailed));
        assert_eq!(run.budget, Duration::from_secs(60));
    }

    #[test]
    fn failure_without_flag_or_rule_stays_put() {
        let orch = orchestrator(ladder(false), failing(&["unit"]));
        let run = orch.evaluate(
            &small_change(),
            &ImpactSummary::default(),
            WorkflowPhase::Development,
            &CancelToken::new(),
        );
        assert_eq!(run.levels_visited, ["light"]);
        assert_eq!(run.verdict, Some(Verdict::Failed));
        assert_eq!(
            run.termination,
            Some(Termination::BlockingFailure {
                check: "unit".into()
            })
        );
    }

    #[test]
    fn red_phase_suppresses_rule() {
        let config = ladder(false).with_rules(vec![EscalationRule::escalate_on_failures(
            "unit-fails",
            "unit",
            1,
            "full",
        )
        .when(crate::escalation::rules::Precondition::NotInRedPhase)]);
        let orch = orchestrator(config, failing(&["unit"]));
        let run = orch.evaluate(
            &small_change(),
            &ImpactSummary::default(),
            WorkflowPhase::Red,
            &CancelToken::new(),
        );
        assert_eq!(run.levels_visited, ["light"]);
        assert_eq!(run.verdict, Some(Verdict::Failed));
        assert_eq!(
            run.termination,
            Some(Termination::EscalationSuppressed {
                rule: "unit-fails".into()
            })
        );
    }

    #[test]
    fn records_finished_runs_inline() {
        let store = Arc::new(MemoryHistoryStore::default());
        let orch = orchestrator(ladder(false), failing(&[]))
            .with_history(HistoryRecorder::inline(store.clone()));
        let run = orch.evaluate(
            &small_change(),
            &ImpactSummary::default(),
            WorkflowPhase::Development,
            &CancelToken::new(),
        );
        let stored = store.query_by_shape(&run.shape_fingerprint, 5).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].run_id, run.run_id);
        assert_eq!(stored[0].count(CheckOutcome::Pass), 2);
    }

    #[test]
    fn plan_matches_selected_level() {
        let orch = orchestrator(ladder(false), failing(&[]));
        let big = vec![FileChange::new("src/lib.rs", ChangeKind::Modified).with_lines(400, 0)];
        assert_eq!(orch.plan(&big, &ImpactSummary::default()).name, "full");
        assert_eq!(
            orch.plan(&small_change(), &ImpactSummary::default()).name,
            "light"
        );
    }
}
