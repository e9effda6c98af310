//! Gate executor: runs one level's checks on a bounded rayon pool.
//!
//! Workers only run checks and send results back over a channel. The loop
//! in [`LevelRun`] is the single writer of the [`ExecutionRun`]: it launches
//! checks in declaration order, appends results in completion order, and
//! wakes at the nearest of (check deadline, level budget, poll interval) so
//! that cancellation and timeouts are noticed without blocking on a check.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::escalation::Decision;
use crate::execution::cancel::CancelToken;
use crate::execution::resources::{adaptive_degree, ResourceStatusProvider, StaticResources};
use crate::execution::runner::{run_with_retries, CheckRunner, CommandRunner};
use crate::gates::catalog::{CheckSpec, ConcurrencyStrategy, GateLevel};
use crate::gates::guards::{
    clamp_concurrency, clamp_duration, CANCEL_POLL_INTERVAL, DEFAULT_OPTIONAL_MIN_REMAINING,
    MAX_ADAPTIVE_CONCURRENCY, MAX_BOUNDED_CONCURRENCY,
};
use crate::models::{
    duration_ms, CheckOutcome, CheckResult, ComplexityMetrics, Criticality, ExecutionRun,
    RiskAssessment, Termination, Verdict,
};

/// What happens to checks still running when a level stops early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Let them finish (within their timeouts) and keep their results.
    Drain,
    /// Cancel them; they are recorded `Skipped`.
    #[default]
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Optional checks launch only while more budget than this remains.
    #[serde(rename = "optional_min_remaining_ms", with = "duration_ms")]
    pub optional_min_remaining: Duration,
    pub in_flight: InFlightPolicy,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            optional_min_remaining: DEFAULT_OPTIONAL_MIN_REMAINING,
            in_flight: InFlightPolicy::Cancel,
            poll_interval: CANCEL_POLL_INTERVAL,
        }
    }
}

/// How a single level ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelOutcome {
    /// Every required check ran; `failed` lists those without a pass.
    Completed { failed: Vec<String> },
    BlockingFailure { check: String },
    Interrupted(Decision),
    BudgetExceeded,
    Cancelled,
}

impl LevelOutcome {
    /// Final verdict if the run ends on this outcome.
    pub fn verdict(&self, level: &str, escalated: bool) -> (Verdict, Termination) {
        let failed = if escalated {
            Verdict::EscalatedThenFailed
        } else {
            Verdict::Failed
        };
        match self {
            LevelOutcome::Completed { failed: checks } if checks.is_empty() => {
                let passed = if escalated {
                    Verdict::EscalatedThenPassed
                } else {
                    Verdict::Passed
                };
                (passed, Termination::AllRequiredPassed)
            }
            LevelOutcome::Completed { failed: checks } => (
                failed,
                Termination::RequiredFailures {
                    checks: checks.clone(),
                },
            ),
            LevelOutcome::BlockingFailure { check } => (
                failed,
                Termination::BlockingFailure {
                    check: check.clone(),
                },
            ),
            LevelOutcome::BudgetExceeded => (
                failed,
                Termination::BudgetExceeded {
                    level: level.to_string(),
                },
            ),
            LevelOutcome::Cancelled => (Verdict::Aborted, Termination::Cancelled),
            LevelOutcome::Interrupted(Decision::Suppress { rule }) => (
                failed,
                Termination::EscalationSuppressed { rule: rule.clone() },
            ),
            LevelOutcome::Interrupted(Decision::Escalate { .. }) => (
                failed,
                Termination::EscalationExhausted {
                    level: level.to_string(),
                },
            ),
        }
    }
}

/// Per-level inputs for [`GateExecutor::run_level`].
pub struct LevelRequest<'a> {
    pub level: &'a GateLevel,
    pub metrics: &'a ComplexityMetrics,
    pub risk: &'a RiskAssessment,
    pub cancel: &'a CancelToken,
    /// Start of the whole run; result timestamps are relative to it.
    pub run_started: Instant,
    /// When false, blocking failures do not stop further launches.
    pub early_termination: bool,
}

pub struct GateExecutor {
    runner: Arc<dyn CheckRunner>,
    resources: Arc<dyn ResourceStatusProvider>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for GateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for GateExecutor {
    fn default() -> Self {
        Self::new(
            Arc::new(CommandRunner::default()),
            Arc::new(StaticResources::default()),
            ExecutorConfig::default(),
        )
    }
}

impl GateExecutor {
    pub fn new(
        runner: Arc<dyn CheckRunner>,
        resources: Arc<dyn ResourceStatusProvider>,
        config: ExecutorConfig,
    ) -> Self {
        let config = ExecutorConfig {
            poll_interval: clamp_duration(
                config.poll_interval,
                Duration::from_millis(1),
                Duration::from_secs(1),
            ),
            ..config
        };
        Self {
            runner,
            resources,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn resources(&self) -> Arc<dyn ResourceStatusProvider> {
        Arc::clone(&self.resources)
    }

    /// Run one level on its own, without escalation.
    pub fn execute(
        &self,
        cancel: &CancelToken,
        level: &GateLevel,
        metrics: &ComplexityMetrics,
        risk: &RiskAssessment,
    ) -> ExecutionRun {
        let started = Instant::now();
        let mut run = ExecutionRun::new(&level.name);
        run.risk_level = risk.level;
        run.enter_level(&level.name, level.max_execution_time);

        let request = LevelRequest {
            level,
            metrics,
            risk,
            cancel,
            run_started: started,
            early_termination: true,
        };
        let outcome = self.run_level(&mut run, &request, &mut |_| None);
        let (verdict, termination) = outcome.verdict(&level.name, false);
        run.finalize(verdict, termination, started.elapsed());
        run
    }

    /// Run one level, appending to `run`. `observe` is called after every
    /// executed result; the first `Some` stops the level.
    ///
    /// Required checks that already passed in `run` are not run again.
    pub fn run_level(
        &self,
        run: &mut ExecutionRun,
        request: &LevelRequest<'_>,
        observe: &mut dyn FnMut(&ExecutionRun) -> Option<Decision>,
    ) -> LevelOutcome {
        let level = request.level;
        let degree = self.degree(level.concurrency);
        info!(
            level = %level.name,
            degree,
            budget_ms = level.max_execution_time.as_millis() as u64,
            "running gate level"
        );

        let mut level_run = LevelRun::new(self, request, observe, degree);

        let required: Vec<Job> = level
            .required
            .iter()
            .filter(|check| !run.has_passed(&check.name))
            .map(|check| Job::new(check, Criticality::Required))
            .collect();

        match level_run.run_phase(run, required) {
            PhaseEnd::Finished => {}
            PhaseEnd::Blocked(check) => {
                for check_spec in &level.optional {
                    if !run.has_passed(&check_spec.name) {
                        level_run.skip(
                            run,
                            check_spec,
                            Criticality::Optional,
                            format!("required phase stopped by '{check}'"),
                        );
                    }
                }
                return LevelOutcome::BlockingFailure { check };
            }
            PhaseEnd::Interrupted(decision) => return LevelOutcome::Interrupted(decision),
            PhaseEnd::BudgetExceeded => return LevelOutcome::BudgetExceeded,
            PhaseEnd::Cancelled => return LevelOutcome::Cancelled,
        }

        let mut optional = Vec::new();
        for check in &level.optional {
            if run.has_passed(&check.name) {
                continue;
            }
            if check.activation.holds(request.metrics, request.risk) {
                optional.push(Job::new(check, Criticality::Optional));
            } else {
                let reason = "activation predicate not satisfied";
                level_run.skip(run, check, Criticality::Optional, reason);
            }
        }

        match level_run.run_phase(run, optional) {
            PhaseEnd::Finished | PhaseEnd::Blocked(_) => {}
            PhaseEnd::Interrupted(decision) => return LevelOutcome::Interrupted(decision),
            PhaseEnd::BudgetExceeded => return LevelOutcome::BudgetExceeded,
            PhaseEnd::Cancelled => return LevelOutcome::Cancelled,
        }

        let failed: Vec<String> = level
            .required
            .iter()
            .filter(|check| !run.has_passed(&check.name))
            .map(|check| check.name.clone())
            .collect();
        LevelOutcome::Completed { failed }
    }

    /// Checks allowed in flight for `strategy`, sampled once per level.
    pub fn degree(&self, strategy: ConcurrencyStrategy) -> usize {
        match strategy {
            ConcurrencyStrategy::Sequential => 1,
            ConcurrencyStrategy::BoundedParallel { max_in_flight } => {
                clamp_concurrency(max_in_flight, MAX_BOUNDED_CONCURRENCY)
            }
            ConcurrencyStrategy::Adaptive { ceiling } => {
                let ceiling = clamp_concurrency(ceiling, MAX_ADAPTIVE_CONCURRENCY);
                let degree = adaptive_degree(ceiling, self.resources.status());
                debug!(ceiling, degree, "adaptive concurrency");
                degree
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Level loop
// ---------------------------------------------------------------------------

struct Job {
    spec: CheckSpec,
    criticality: Criticality,
}

impl Job {
    fn new(spec: &CheckSpec, criticality: Criticality) -> Self {
        Self {
            spec: spec.clone(),
            criticality,
        }
    }
}

struct InFlight {
    name: String,
    criticality: Criticality,
    blocking: bool,
    timeout: Duration,
    deadline: Instant,
    cancel: CancelToken,
}

enum PhaseEnd {
    Finished,
    Blocked(String),
    Interrupted(Decision),
    BudgetExceeded,
    Cancelled,
}

type Message = (u64, Option<CheckResult>);

struct LevelRun<'a, 'r> {
    executor: &'a GateExecutor,
    request: &'a LevelRequest<'r>,
    observe: &'a mut dyn FnMut(&ExecutionRun) -> Option<Decision>,
    pool: Option<rayon::ThreadPool>,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    in_flight: HashMap<u64, InFlight>,
    next_ticket: u64,
    degree: usize,
    budget_deadline: Instant,
    level_cancel: CancelToken,
    /// Set once a decision has been taken for this level.
    decided: bool,
}

impl<'a, 'r> LevelRun<'a, 'r> {
    fn new(
        executor: &'a GateExecutor,
        request: &'a LevelRequest<'r>,
        observe: &'a mut dyn FnMut(&ExecutionRun) -> Option<Decision>,
        degree: usize,
    ) -> Self {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(degree)
            .thread_name(|i| format!("tollgate-check-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                // Fallback to a thread per check
                warn!(error = %e, "check pool unavailable, spawning threads");
                None
            }
        };
        let (tx, rx) = mpsc::channel();
        Self {
            executor,
            request,
            observe,
            pool,
            tx,
            rx,
            in_flight: HashMap::new(),
            next_ticket: 0,
            degree,
            budget_deadline: Instant::now() + request.level.max_execution_time,
            level_cancel: request.cancel.child(),
            decided: false,
        }
    }

    fn level_name(&self) -> &str {
        &self.request.level.name
    }

    fn elapsed_ms(&self) -> u64 {
        self.request.run_started.elapsed().as_millis() as u64
    }

    fn run_phase(&mut self, run: &mut ExecutionRun, jobs: Vec<Job>) -> PhaseEnd {
        let mut pending: VecDeque<Job> = jobs.into();
        let mut stopped: Option<PhaseEnd> = None;

        loop {
            if self.request.cancel.is_cancelled() {
                self.level_cancel.cancel();
                self.in_flight.clear();
                run.cancelled_at_ms = Some(self.elapsed_ms());
                info!(level = %self.level_name(), "run cancelled by caller");
                return PhaseEnd::Cancelled;
            }

            let now = Instant::now();
            if now >= self.budget_deadline {
                self.exhaust_budget(run, &mut pending);
                // A decision taken while draining still stands.
                return stopped.take().unwrap_or(PhaseEnd::BudgetExceeded);
            }

            self.expire_checks(run, now, &mut pending, &mut stopped);

            if stopped.is_none() {
                self.launch(run, &mut pending);
            }

            if self.in_flight.is_empty() && (stopped.is_some() || pending.is_empty()) {
                break;
            }

            let mut wake = (now + self.executor.config.poll_interval).min(self.budget_deadline);
            for flight in self.in_flight.values() {
                wake = wake.min(flight.deadline);
            }
            match self.rx.recv_timeout(wake.saturating_duration_since(Instant::now())) {
                Ok((ticket, result)) => {
                    if self.request.cancel.is_cancelled() {
                        continue;
                    }
                    let Some(flight) = self.in_flight.remove(&ticket) else {
                        debug!(ticket, "late result discarded");
                        continue;
                    };
                    if let Some(result) = result {
                        self.record(run, result, flight.blocking, &mut pending, &mut stopped);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }

        stopped.unwrap_or(PhaseEnd::Finished)
    }

    fn launch(&mut self, run: &mut ExecutionRun, pending: &mut VecDeque<Job>) {
        while self.in_flight.len() < self.degree {
            let Some(job) = pending.pop_front() else {
                break;
            };
            let remaining = self.budget_deadline.saturating_duration_since(Instant::now());
            if job.criticality == Criticality::Optional
                && remaining <= self.executor.config.optional_min_remaining
            {
                self.skip(
                    run,
                    &job.spec,
                    job.criticality,
                    format!("insufficient budget: {} ms remaining", remaining.as_millis()),
                );
                continue;
            }
            self.spawn(job);
        }
    }

    fn spawn(&mut self, job: Job) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let cancel = self.level_cancel.child();
        let tx = self.tx.clone();
        let runner = Arc::clone(&self.executor.runner);
        let level = self.level_name().to_string();
        let task_cancel = cancel.clone();
        let Job { spec, criticality } = job;

        self.in_flight.insert(
            ticket,
            InFlight {
                name: spec.name.clone(),
                criticality,
                blocking: criticality == Criticality::Required && spec.blocking,
                timeout: spec.timeout,
                deadline: Instant::now() + spec.timeout,
                cancel,
            },
        );
        debug!(check = %spec.name, level = %level, ticket, "check launched");

        let task = move || {
            let result =
                run_with_retries(runner.as_ref(), &spec, criticality, &level, &task_cancel);
            // Receiver may be gone if the level already finished.
            let _ = tx.send((ticket, result));
        };
        match &self.pool {
            Some(pool) => pool.spawn(task),
            None => {
                thread::spawn(task);
            }
        }
    }

    /// Append an executed result and react to it.
    fn record(
        &mut self,
        run: &mut ExecutionRun,
        mut result: CheckResult,
        blocking: bool,
        pending: &mut VecDeque<Job>,
        stopped: &mut Option<PhaseEnd>,
    ) {
        result.completed_at_ms = self.elapsed_ms();
        let failed = result.outcome.is_failure();
        let name = result.name.clone();
        debug!(check = %name, outcome = result.outcome.as_str(), "check finished");
        if !run.append(result) || self.decided {
            return;
        }

        if let Some(decision) = (self.observe)(run) {
            self.decided = true;
            self.skip_pending(run, pending, "level left by escalation");
            let cancel = self.executor.config.in_flight == InFlightPolicy::Cancel;
            if decision.forces_cancel() || cancel {
                self.cancel_in_flight(run, "cancelled by escalation");
            }
            *stopped = Some(PhaseEnd::Interrupted(decision));
            return;
        }

        if failed && blocking && self.request.early_termination && stopped.is_none() {
            info!(check = %name, level = %self.level_name(), "blocking check failed");
            self.skip_pending(run, pending, &format!("blocked by failing check '{name}'"));
            if self.executor.config.in_flight == InFlightPolicy::Cancel {
                self.cancel_in_flight(run, &format!("cancelled after '{name}' failed"));
            }
            *stopped = Some(PhaseEnd::Blocked(name));
        }
    }

    fn expire_checks(
        &mut self,
        run: &mut ExecutionRun,
        now: Instant,
        pending: &mut VecDeque<Job>,
        stopped: &mut Option<PhaseEnd>,
    ) {
        let mut expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(ticket, _)| *ticket)
            .collect();
        expired.sort_unstable();

        for ticket in expired {
            let Some(flight) = self.in_flight.remove(&ticket) else {
                continue;
            };
            flight.cancel.cancel();
            warn!(
                check = %flight.name,
                timeout_ms = flight.timeout.as_millis() as u64,
                "check timed out"
            );
            let result = CheckResult {
                name: flight.name,
                level: self.level_name().to_string(),
                criticality: flight.criticality,
                outcome: CheckOutcome::TimedOut,
                duration: flight.timeout,
                output: format!("exceeded {} ms timeout", flight.timeout.as_millis()),
                attempts: 1,
                reported_risk: None,
                completed_at_ms: 0,
            };
            self.record(run, result, flight.blocking, pending, stopped);
        }
    }

    fn exhaust_budget(&mut self, run: &mut ExecutionRun, pending: &mut VecDeque<Job>) {
        warn!(
            level = %self.level_name(),
            in_flight = self.in_flight.len(),
            pending = pending.len(),
            "level budget exhausted"
        );
        self.level_cancel.cancel();

        let mut tickets: Vec<u64> = self.in_flight.keys().copied().collect();
        tickets.sort_unstable();
        for ticket in tickets {
            if let Some(flight) = self.in_flight.remove(&ticket) {
                let result = CheckResult {
                    name: flight.name,
                    level: self.level_name().to_string(),
                    criticality: flight.criticality,
                    outcome: CheckOutcome::TimedOut,
                    duration: self.request.level.max_execution_time,
                    output: "level budget exhausted".to_string(),
                    attempts: 1,
                    reported_risk: None,
                    completed_at_ms: self.elapsed_ms(),
                };
                run.append(result);
            }
        }
        self.skip_pending(run, pending, "level budget exhausted");
    }

    fn cancel_in_flight(&mut self, run: &mut ExecutionRun, reason: &str) {
        let mut tickets: Vec<u64> = self.in_flight.keys().copied().collect();
        tickets.sort_unstable();
        for ticket in tickets {
            if let Some(flight) = self.in_flight.remove(&ticket) {
                flight.cancel.cancel();
                let mut skipped = CheckResult::skipped(
                    flight.name,
                    self.level_name(),
                    flight.criticality,
                    reason,
                );
                skipped.completed_at_ms = self.elapsed_ms();
                run.append(skipped);
            }
        }
    }

    fn skip_pending(&mut self, run: &mut ExecutionRun, pending: &mut VecDeque<Job>, reason: &str) {
        while let Some(job) = pending.pop_front() {
            self.skip(run, &job.spec, job.criticality, reason);
        }
    }

    fn skip(
        &self,
        run: &mut ExecutionRun,
        check: &CheckSpec,
        criticality: Criticality,
        reason: impl Into<String>,
    ) {
        let mut skipped = CheckResult::skipped(&check.name, self.level_name(), criticality, reason);
        skipped.completed_at_ms = self.elapsed_ms();
        run.append(skipped);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
