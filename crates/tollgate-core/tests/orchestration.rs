//! End-to-end gate runs against the built-in ladder with a scripted runner.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tollgate_core::config::HistoryBackend;
use tollgate_core::escalation::EscalationRule;
use tollgate_core::execution::{
    CheckContext, CheckOutput, InFlightPolicy, RunStatus, StaticResources,
};
use tollgate_core::gates::{ChangeThreshold, CheckSpec, ConcurrencyStrategy};
use tollgate_core::models::{CheckResult, Termination};
use tollgate_core::store::{HistoryStore, SqliteHistoryStore};
use tollgate_core::{
    CancelToken, ChangeKind, CheckOutcome, CheckRunner, ExecutionRun, FileCategory, FileChange,
    GateCatalog, GateLevel, ImpactSummary, Orchestrator, OrchestratorConfig, RiskFactor,
    RiskLevel, Verdict, WorkflowPhase,
};

// ---------------------------------------------------------------------------
// Scripted runner
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Step {
    code: i32,
    delay: Duration,
    risk: Option<RiskLevel>,
}

impl Step {
    fn pass() -> Self {
        Self {
            code: 0,
            delay: Duration::ZERO,
            risk: None,
        }
    }

    fn fail() -> Self {
        Self { code: 1, ..Self::pass() }
    }

    fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn reporting(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }
}

type Script = dyn Fn(&str, &str) -> Step + Send + Sync;

/// Decides each attempt's outcome from `(level, check)` and records calls.
struct ScriptedRunner {
    calls: Mutex<Vec<(String, String)>>,
    script: Box<Script>,
}

impl ScriptedRunner {
    fn new(script: impl Fn(&str, &str) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }

    fn passing() -> Arc<Self> {
        Self::new(|_, _| Step::pass())
    }

    fn calls_to(&self, check: &str) -> usize {
        self.calls.lock().iter().filter(|(_, name)| name == check).count()
    }
}

impl CheckRunner for ScriptedRunner {
    fn run(&self, check: &CheckSpec, ctx: &CheckContext) -> CheckOutput {
        self.calls.lock().push((ctx.level.clone(), check.name.clone()));
        let step = (self.script)(&ctx.level, &check.name);
        let deadline = Instant::now() + step.delay;
        while Instant::now() < deadline {
            if ctx.cancel.is_cancelled() {
                return CheckOutput::status(RunStatus::Cancelled);
            }
            thread::sleep(Duration::from_millis(5));
        }
        let out = CheckOutput::exited(step.code, format!("{} exited {}", check.name, step.code));
        match step.risk {
            Some(risk) => out.with_reported_risk(risk),
            None => out,
        }
    }
}

fn ladder(runner: Arc<ScriptedRunner>) -> Orchestrator {
    Orchestrator::with_runner(
        OrchestratorConfig::standard().unwrap(),
        runner,
        Arc::new(StaticResources::default()),
    )
    .unwrap()
}

fn evaluate(orch: &Orchestrator, changes: &[FileChange], impact: &ImpactSummary) -> ExecutionRun {
    orch.evaluate(changes, impact, WorkflowPhase::Development, &CancelToken::new())
}

fn medium_change() -> Vec<FileChange> {
    vec![
        FileChange::new("src/service/orders.rs", ChangeKind::Modified).with_lines(90, 20),
        FileChange::new("src/service/billing.rs", ChangeKind::Modified).with_lines(30, 10),
        FileChange::new("tests/orders.rs", ChangeKind::Modified)
            .with_lines(5, 0)
            .with_category(FileCategory::Test),
    ]
}

fn outcome_of<'a>(run: &'a ExecutionRun, check: &str) -> Option<&'a CheckResult> {
    run.latest(check)
}

fn result_at<'a>(run: &'a ExecutionRun, level: &str, check: &str) -> Option<&'a CheckResult> {
    run.results
        .iter()
        .find(|r| r.level == level && r.name == check)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn doc_only_change_passes_at_minimal_level() {
    let runner = ScriptedRunner::passing();
    let orch = ladder(runner.clone());
    let changes = vec![FileChange::new("docs/guide.md", ChangeKind::Modified)
        .with_lines(10, 2)
        .with_category(FileCategory::Documentation)];

    let run = evaluate(&orch, &changes, &ImpactSummary::default());

    assert_eq!(run.risk_level, RiskLevel::Low);
    assert_eq!(run.selected_level, "minimal");
    assert_eq!(run.levels_visited, ["minimal"]);
    assert_eq!(run.verdict, Some(Verdict::Passed));
    assert_eq!(run.termination, Some(Termination::AllRequiredPassed));
    assert_eq!(runner.calls_to("fmt"), 1);
    assert_eq!(runner.calls_to("lint"), 1);
    assert_eq!(runner.calls_to("unit-tests"), 0);
}

#[test]
fn migration_with_public_api_change_runs_compatibility_checks() {
    let runner = ScriptedRunner::passing();
    let orch = ladder(runner.clone());
    let changes = vec![
        FileChange::new("migrations/0042_add_accounts.sql", ChangeKind::Created)
            .with_lines(40, 0)
            .with_category(FileCategory::Migration),
        FileChange::new("src/api/accounts.rs", ChangeKind::Modified).with_lines(25, 5),
    ];
    let impact = ImpactSummary::default().with_factor(RiskFactor::PublicApiChange);

    let run = evaluate(&orch, &changes, &impact);

    assert!(run.risk_level >= RiskLevel::High);
    assert_eq!(run.selected_level, "standard");
    for check in ["schema-compat", "api-compat"] {
        let result = outcome_of(&run, check).expect("compatibility check ran");
        assert_eq!(result.outcome, CheckOutcome::Pass);
    }
    // Security scan is optional at this level and activates at high risk.
    assert_eq!(runner.calls_to("security-scan"), 1);
    assert_eq!(
        outcome_of(&run, "docs").map(|r| r.outcome),
        Some(CheckOutcome::Skipped)
    );
    assert_eq!(run.verdict, Some(Verdict::Passed));
}

#[test]
fn lint_failure_at_light_escalates_without_rerunning_passed_checks() {
    let runner = ScriptedRunner::new(|level, check| match (level, check) {
        ("light", "lint") => Step::fail().after(Duration::from_millis(150)),
        _ => Step::pass(),
    });
    let orch = ladder(runner.clone());

    let run = evaluate(&orch, &medium_change(), &ImpactSummary::default());

    assert_eq!(run.selected_level, "light");
    assert_eq!(run.levels_visited, ["light", "standard"]);
    assert_eq!(run.hops.len(), 1);
    let hop = &run.hops[0];
    assert_eq!(hop.rule.as_deref(), Some("lint-failure"));
    assert!(hop.reused_checks.contains(&"fmt".to_string()));
    assert!(hop.reused_checks.contains(&"unit-tests".to_string()));

    assert_eq!(runner.calls_to("fmt"), 1);
    assert_eq!(runner.calls_to("unit-tests"), 1);
    assert_eq!(runner.calls_to("lint"), 2);
    assert_eq!(run.executions_of("fmt"), 1);
    assert_eq!(run.verdict, Some(Verdict::EscalatedThenPassed));
}

#[test]
fn caller_cancellation_aborts_with_nothing_appended_afterwards() {
    let runner = ScriptedRunner::new(|_, check| match check {
        "fmt" => Step::pass(),
        _ => Step::pass().after(Duration::from_secs(5)),
    });
    let orch = ladder(runner);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    // The run's clock starts after this one, so a result stamped before the
    // cancel can never carry a later stamp than the caller's.
    let started = Instant::now();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        trigger.cancel();
        started.elapsed().as_millis() as u64
    });

    let run = orch.evaluate(
        &medium_change(),
        &ImpactSummary::default(),
        WorkflowPhase::Development,
        &cancel,
    );
    let cancelled_by_caller_ms = canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(run.verdict, Some(Verdict::Aborted));
    assert_eq!(run.termination, Some(Termination::Cancelled));
    assert!(run.cancelled_at_ms.is_some());
    assert!(run.has_passed("fmt"));
    assert!(run
        .results
        .iter()
        .all(|r| r.completed_at_ms <= cancelled_by_caller_ms));
    assert_eq!(run.count(CheckOutcome::Pass), 1);
    assert_eq!(run.executions_of("lint"), 0);
    assert_eq!(run.executions_of("unit-tests"), 0);
}

#[test]
fn drained_escalation_survives_a_slow_sibling_overrunning_the_budget() {
    let fast = CheckSpec::new("fast", ["make", "fast"], Duration::from_secs(5)).non_blocking();
    let slow = CheckSpec::new("slow", ["make", "slow"], Duration::from_secs(5));
    let catalog = GateCatalog::new(vec![
        GateLevel::new(
            "quick",
            ChangeThreshold::unrestricted().with_max_lines(1_000),
            Duration::from_millis(250),
        )
        .require(fast.clone())
        .require(slow.clone())
        .with_concurrency(ConcurrencyStrategy::BoundedParallel { max_in_flight: 2 }),
        GateLevel::new("deep", ChangeThreshold::unrestricted(), Duration::from_secs(10))
            .require(fast)
            .require(slow),
    ])
    .unwrap();
    let mut config = OrchestratorConfig::new(catalog).with_rules(vec![
        EscalationRule::escalate_on_failures("fast-failure", "fast", 1, "deep"),
    ]);
    config.executor.in_flight = InFlightPolicy::Drain;
    let runner = ScriptedRunner::new(|level, check| match (level, check) {
        ("quick", "fast") => Step::fail(),
        ("quick", "slow") => Step::pass().after(Duration::from_secs(3)),
        _ => Step::pass(),
    });
    let orch =
        Orchestrator::with_runner(config, runner.clone(), Arc::new(StaticResources::default()))
            .unwrap();

    let run = evaluate(&orch, &medium_change(), &ImpactSummary::default());

    assert_eq!(run.levels_visited, ["quick", "deep"]);
    assert_eq!(run.hops.len(), 1);
    assert_eq!(run.hops[0].rule.as_deref(), Some("fast-failure"));
    assert!(run.hops[0].reused_checks.is_empty());
    // The sibling was drained until the budget ran out, then cut off.
    assert_eq!(
        result_at(&run, "quick", "slow").map(|r| r.outcome),
        Some(CheckOutcome::TimedOut)
    );
    assert_eq!(
        result_at(&run, "deep", "slow").map(|r| r.outcome),
        Some(CheckOutcome::Pass)
    );
    assert_eq!(runner.calls_to("fast"), 2);
    assert_eq!(run.verdict, Some(Verdict::EscalatedThenPassed));
    assert!(run.duration < Duration::from_secs(2), "{:?}", run.duration);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn reported_risk_terminates_and_jumps_to_highest_level() {
    let runner = ScriptedRunner::new(|level, check| match (level, check) {
        ("light", "unit-tests") => Step::pass()
            .after(Duration::from_millis(50))
            .reporting(RiskLevel::Critical),
        // Fails at once while its siblings are still running.
        ("full", "integration-tests") => Step::fail(),
        ("full", _) => Step::pass().after(Duration::from_millis(100)),
        _ => Step::pass(),
    });
    let orch = ladder(runner.clone());

    let run = evaluate(&orch, &medium_change(), &ImpactSummary::default());

    assert_eq!(run.levels_visited, ["light", "full"]);
    let hop = &run.hops[0];
    assert_eq!(hop.rule.as_deref(), Some("risk-reported-by-check"));
    for carried in ["fmt", "lint", "unit-tests"] {
        assert!(hop.reused_checks.contains(&carried.to_string()), "{carried}");
        assert_eq!(runner.calls_to(carried), 1, "{carried} ran again");
        assert!(result_at(&run, "full", carried).is_none());
    }

    // Early termination is off at the target: a blocking failure does not
    // stop the rest of the level.
    assert_eq!(
        result_at(&run, "full", "integration-tests").map(|r| r.outcome),
        Some(CheckOutcome::Fail)
    );
    for check in ["schema-compat", "api-compat", "security-scan", "e2e"] {
        assert_eq!(
            result_at(&run, "full", check).map(|r| r.outcome),
            Some(CheckOutcome::Pass),
            "{check}"
        );
    }
    assert_eq!(run.verdict, Some(Verdict::EscalatedThenFailed));
}

#[test]
fn visited_levels_strictly_increase() {
    let runner = ScriptedRunner::new(|_, check| match check {
        "lint" | "integration-tests" => Step::fail(),
        _ => Step::pass(),
    });
    let orch = ladder(runner);
    let impact = ImpactSummary::default().with_factor(RiskFactor::SecuritySensitivePath);

    let run = evaluate(&orch, &medium_change(), &impact);

    let indices: Vec<usize> = run
        .levels_visited
        .iter()
        .map(|name| orch.catalog().index_of(name).unwrap())
        .collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]), "{indices:?}");
    assert!(run.is_finalized());
    assert!(!run.verdict.unwrap().is_pass());
}

#[test]
fn level_budget_is_respected() {
    let slow = CheckSpec::new("slow", ["sleep", "10"], Duration::from_secs(30));
    let catalog = GateCatalog::new(vec![GateLevel::new(
        "only",
        ChangeThreshold::unrestricted(),
        Duration::from_millis(300),
    )
    .require(slow)])
    .unwrap();
    let runner = ScriptedRunner::new(|_, _| Step::pass().after(Duration::from_secs(10)));
    let orch = Orchestrator::with_runner(
        OrchestratorConfig::new(catalog),
        runner,
        Arc::new(StaticResources::default()),
    )
    .unwrap();

    let run = evaluate(&orch, &medium_change(), &ImpactSummary::default());

    assert_eq!(run.verdict, Some(Verdict::Failed));
    assert_eq!(
        run.termination,
        Some(Termination::BudgetExceeded {
            level: "only".into()
        })
    );
    assert!(run.duration < Duration::from_secs(3), "{:?}", run.duration);
    assert_eq!(
        outcome_of(&run, "slow").map(|r| r.outcome),
        Some(CheckOutcome::TimedOut)
    );
}

#[test]
fn sqlite_history_records_each_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("history.db");
    let mut config = OrchestratorConfig::standard()
        .unwrap()
        .with_history(HistoryBackend::Sqlite { path: db.clone() });
    config.history.background = false;
    let orch = Orchestrator::with_runner(
        config,
        ScriptedRunner::passing(),
        Arc::new(StaticResources::default()),
    )
    .unwrap();

    let first = evaluate(&orch, &medium_change(), &ImpactSummary::default());
    let second = evaluate(&orch, &medium_change(), &ImpactSummary::default());
    assert_eq!(first.shape_fingerprint, second.shape_fingerprint);

    let store = SqliteHistoryStore::open(&db).unwrap();
    let runs = store.query_by_shape(&first.shape_fingerprint, 10).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(store.runs_for_change_set(&first.change_set_fingerprint).unwrap().len(), 2);
}

#[cfg(unix)]
#[test]
fn command_runner_drives_real_processes() {
    let sh = |name: &str, script: &str| {
        CheckSpec::new(name, ["sh", "-c", script], Duration::from_secs(10))
    };
    let catalog = GateCatalog::new(vec![
        GateLevel::new(
            "quick",
            ChangeThreshold::unrestricted().with_max_lines(10),
            Duration::from_secs(10),
        )
        .require(sh("echo", "echo hello")),
        GateLevel::new("thorough", ChangeThreshold::unrestricted(), Duration::from_secs(10))
            .require(sh("echo", "echo hello"))
            .require(sh("fails", "echo broken >&2; exit 3")),
    ])
    .unwrap();
    let orch = Orchestrator::from_config(OrchestratorConfig::new(catalog)).unwrap();

    let run = evaluate(&orch, &medium_change(), &ImpactSummary::default());

    assert_eq!(run.selected_level, "thorough");
    assert_eq!(run.verdict, Some(Verdict::Failed));
    let failed = outcome_of(&run, "fails").unwrap();
    assert_eq!(failed.outcome, CheckOutcome::Fail);
    assert!(failed.output.contains("broken"));
    assert!(outcome_of(&run, "echo").unwrap().output.contains("hello"));
}
