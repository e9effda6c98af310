//! Shared typed models used across analysis, gating, execution, and storage.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// First 16 hex characters of the SHA-256 of `input`.
fn short_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Bit length of `n`, used to bucket magnitudes logarithmically.
fn magnitude_bucket(n: u64) -> u32 {
    64 - n.leading_zeros()
}

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

pub(crate) mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// 1. FileChange
// ---------------------------------------------------------------------------

/// How a single file was touched by a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
    Moved,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 5] = [
        ChangeKind::Created,
        ChangeKind::Modified,
        ChangeKind::Deleted,
        ChangeKind::Renamed,
        ChangeKind::Moved,
    ];

    /// Tie-break rank for primary-kind voting. Higher is more conservative.
    pub const fn severity(self) -> u8 {
        match self {
            ChangeKind::Created => 0,
            ChangeKind::Modified => 1,
            ChangeKind::Moved => 2,
            ChangeKind::Renamed => 3,
            ChangeKind::Deleted => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed => "renamed",
            ChangeKind::Moved => "moved",
        }
    }
}

/// Coarse role of a file within the repository.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    #[default]
    Source,
    Test,
    Config,
    Documentation,
    Build,
    Migration,
    Other,
}

impl FileCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Source => "source",
            FileCategory::Test => "test",
            FileCategory::Config => "config",
            FileCategory::Documentation => "documentation",
            FileCategory::Build => "build",
            FileCategory::Migration => "migration",
            FileCategory::Other => "other",
        }
    }
}

/// One created, modified, deleted, renamed or moved file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub lines_added: u64,
    #[serde(default)]
    pub lines_removed: u64,
    #[serde(default)]
    pub complexity_delta: i64,
    #[serde(default)]
    pub category: FileCategory,
    #[serde(default)]
    pub language: String,
}

impl FileChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            lines_added: 0,
            lines_removed: 0,
            complexity_delta: 0,
            category: FileCategory::Source,
            language: String::new(),
        }
    }

    pub fn with_lines(mut self, added: u64, removed: u64) -> Self {
        self.lines_added = added;
        self.lines_removed = removed;
        self
    }

    pub fn with_complexity_delta(mut self, delta: i64) -> Self {
        self.complexity_delta = delta;
        self
    }

    pub fn with_category(mut self, category: FileCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn lines_changed(&self) -> u64 {
        self.lines_added.saturating_add(self.lines_removed)
    }
}

/// Stable fingerprint of an exact change set, independent of input order.
pub fn change_set_fingerprint(changes: &[FileChange]) -> String {
    let mut rows: Vec<String> = changes
        .iter()
        .map(|c| {
            format!(
                "{}|{}|{}|{}|{}",
                c.path,
                c.kind.as_str(),
                c.lines_added,
                c.lines_removed,
                c.complexity_delta
            )
        })
        .collect();
    rows.sort();
    short_digest(&rows.join("\n"))
}

// ---------------------------------------------------------------------------
// 2. ComplexityMetrics
// ---------------------------------------------------------------------------

/// Majority change kind of a change set, or `NoChange` when it is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKind {
    NoChange,
    Created,
    Modified,
    Deleted,
    Renamed,
    Moved,
}

impl PrimaryKind {
    pub fn change_kind(self) -> Option<ChangeKind> {
        match self {
            PrimaryKind::NoChange => None,
            PrimaryKind::Created => Some(ChangeKind::Created),
            PrimaryKind::Modified => Some(ChangeKind::Modified),
            PrimaryKind::Deleted => Some(ChangeKind::Deleted),
            PrimaryKind::Renamed => Some(ChangeKind::Renamed),
            PrimaryKind::Moved => Some(ChangeKind::Moved),
        }
    }

    pub fn as_str(self) -> &'static str {
        self.change_kind().map(ChangeKind::as_str).unwrap_or("no_change")
    }
}

impl From<ChangeKind> for PrimaryKind {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => PrimaryKind::Created,
            ChangeKind::Modified => PrimaryKind::Modified,
            ChangeKind::Deleted => PrimaryKind::Deleted,
            ChangeKind::Renamed => PrimaryKind::Renamed,
            ChangeKind::Moved => PrimaryKind::Moved,
        }
    }
}

/// Breakdown of a change set by kind, category and language.
///
/// Maps keep first-seen order so identical inputs serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDistribution {
    pub by_kind: IndexMap<ChangeKind, u64>,
    pub by_category: IndexMap<FileCategory, u64>,
    pub by_language: IndexMap<String, u64>,
}

impl ChangeDistribution {
    pub fn kind_count(&self, kind: ChangeKind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }

    pub fn category_count(&self, category: FileCategory) -> u64 {
        self.by_category.get(&category).copied().unwrap_or(0)
    }

    pub fn has_category(&self, category: FileCategory) -> bool {
        self.category_count(category) > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityMetrics {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub lines_changed: u64,
    pub files_affected: u64,
    pub complexity_delta: i64,
    pub primary_kind: PrimaryKind,
    pub distribution: ChangeDistribution,
    /// Per-path line counts, consulted by pattern-weighted thresholds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub footprint: Vec<FileFootprint>,
}

/// Lines touched in one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFootprint {
    pub path: String,
    pub lines: u64,
}

impl Default for ComplexityMetrics {
    fn default() -> Self {
        Self {
            lines_added: 0,
            lines_removed: 0,
            lines_changed: 0,
            files_affected: 0,
            complexity_delta: 0,
            primary_kind: PrimaryKind::NoChange,
            distribution: ChangeDistribution::default(),
            footprint: Vec::new(),
        }
    }
}

impl ComplexityMetrics {
    pub fn is_empty(&self) -> bool {
        self.files_affected == 0
    }

    /// Fingerprint of the change *shape*: log-bucketed size, primary kind and
    /// risk. Runs with equal shapes are comparable for selection hints.
    pub fn shape_fingerprint(&self, risk: RiskLevel) -> String {
        let delta_sign = if self.complexity_delta < 0 { "-" } else { "+" };
        let shape = format!(
            "l{}:f{}:d{}{}:k{}:r{}",
            magnitude_bucket(self.lines_changed),
            magnitude_bucket(self.files_affected),
            delta_sign,
            magnitude_bucket(self.complexity_delta.unsigned_abs()),
            self.primary_kind.as_str(),
            risk.as_str(),
        );
        short_digest(&shape)
    }
}

// ---------------------------------------------------------------------------
// 3. Risk
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Medium,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub const fn tier(self) -> u8 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }

    pub const fn from_tier(tier: u8) -> Self {
        match tier {
            0 => RiskLevel::Low,
            1 => RiskLevel::Medium,
            2 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }

    /// Raise by `tiers`, capped at `Critical`.
    pub fn raised_by(self, tiers: usize) -> Self {
        let tiers = tiers.min(RiskLevel::Critical.tier() as usize) as u8;
        RiskLevel::from_tier(self.tier().saturating_add(tiers))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// A named concern attached to a risk assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    SchemaChange,
    PublicApiChange,
    SecuritySensitivePath,
    DependencyUpdate,
    ConfigurationChange,
    PerformanceSensitive,
    WideBlastRadius,
}

impl RiskFactor {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskFactor::SchemaChange => "schema_change",
            RiskFactor::PublicApiChange => "public_api_change",
            RiskFactor::SecuritySensitivePath => "security_sensitive_path",
            RiskFactor::DependencyUpdate => "dependency_update",
            RiskFactor::ConfigurationChange => "configuration_change",
            RiskFactor::PerformanceSensitive => "performance_sensitive",
            RiskFactor::WideBlastRadius => "wide_blast_radius",
        }
    }
}

/// Size class of a change, by lines touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMagnitude {
    Trivial,
    Small,
    Medium,
    Large,
    Massive,
}

impl ChangeMagnitude {
    pub fn classify(lines_changed: u64) -> Self {
        match lines_changed {
            0..=10 => ChangeMagnitude::Trivial,
            11..=50 => ChangeMagnitude::Small,
            51..=250 => ChangeMagnitude::Medium,
            251..=1000 => ChangeMagnitude::Large,
            _ => ChangeMagnitude::Massive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ComponentRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }
}

/// Blast-radius data supplied by the impact-analysis collaborator.
///
/// Missing collections deserialize as empty; nothing else is validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactSummary {
    pub affected_components: Vec<ComponentRef>,
    pub blast_radius: usize,
    pub detected_factors: Vec<RiskFactor>,
}

impl ImpactSummary {
    pub fn with_factor(mut self, factor: RiskFactor) -> Self {
        self.detected_factors.push(factor);
        self
    }

    pub fn with_blast_radius(mut self, radius: usize) -> Self {
        self.blast_radius = radius;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Level derived from complexity metrics alone.
    pub base_level: RiskLevel,
    pub complexity_score: f64,
    pub magnitude: ChangeMagnitude,
    pub blast_radius: usize,
    pub affected_components: Vec<ComponentRef>,
    pub factors: BTreeSet<RiskFactor>,
}

impl RiskAssessment {
    /// Assessment with no factors, used when only a level is known.
    pub fn at_level(level: RiskLevel) -> Self {
        Self {
            level,
            base_level: level,
            complexity_score: 0.0,
            magnitude: ChangeMagnitude::Trivial,
            blast_radius: 0,
            affected_components: Vec::new(),
            factors: BTreeSet::new(),
        }
    }

    pub fn has_factor(&self, factor: RiskFactor) -> bool {
        self.factors.contains(&factor)
    }
}

// ---------------------------------------------------------------------------
// 4. Check results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Required,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    Fail,
    TimedOut,
    Skipped,
}

impl CheckOutcome {
    /// `TimedOut` counts as a failure for rules and verdicts.
    pub fn is_failure(self) -> bool {
        matches!(self, CheckOutcome::Fail | CheckOutcome::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckOutcome::Pass => "pass",
            CheckOutcome::Fail => "fail",
            CheckOutcome::TimedOut => "timed_out",
            CheckOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    /// Gate level the check ran at.
    pub level: String,
    pub criticality: Criticality,
    pub outcome: CheckOutcome,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub attempts: u32,
    /// Risk the check itself observed (e.g. a scanner finding).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_risk: Option<RiskLevel>,
    /// Milliseconds since run start when the result was appended.
    #[serde(default)]
    pub completed_at_ms: u64,
}

impl CheckResult {
    pub fn skipped(
        name: impl Into<String>,
        level: impl Into<String>,
        criticality: Criticality,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            level: level.into(),
            criticality,
            outcome: CheckOutcome::Skipped,
            duration: Duration::ZERO,
            output: reason.into(),
            attempts: 0,
            reported_risk: None,
            completed_at_ms: 0,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == CheckOutcome::Pass
    }
}

// ---------------------------------------------------------------------------
// 5. ExecutionRun
// ---------------------------------------------------------------------------

/// Caller-supplied workflow state. `Red` is the intentionally-failing phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Requirements,
    Planning,
    Red,
    Green,
    Refactor,
    #[default]
    Development,
    Integration,
}

impl WorkflowPhase {
    pub fn is_red(self) -> bool {
        self == WorkflowPhase::Red
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    EscalatedThenPassed,
    EscalatedThenFailed,
    Aborted,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        matches!(self, Verdict::Passed | Verdict::EscalatedThenPassed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
            Verdict::EscalatedThenPassed => "escalated_then_passed",
            Verdict::EscalatedThenFailed => "escalated_then_failed",
            Verdict::Aborted => "aborted",
        }
    }
}

/// Why a run stopped where it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    AllRequiredPassed,
    BlockingFailure { check: String },
    RequiredFailures { checks: Vec<String> },
    BudgetExceeded { level: String },
    Cancelled,
    EscalationSuppressed { rule: String },
    EscalationExhausted { level: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationHop {
    pub from_level: String,
    pub to_level: String,
    /// Rule that fired; `None` for a level's own `escalate_on_failure`.
    pub rule: Option<String>,
    pub reason: String,
    pub at_ms: u64,
    /// Checks whose earlier passing result satisfied the new level.
    pub reused_checks: Vec<String>,
}

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub run_id: String,
    pub change_set_fingerprint: String,
    pub shape_fingerprint: String,
    pub phase: WorkflowPhase,
    pub risk_level: RiskLevel,
    pub selected_level: String,
    pub levels_visited: Vec<String>,
    pub results: Vec<CheckResult>,
    pub hops: Vec<EscalationHop>,
    pub started_at_ms: u64,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Sum of the budgets of every visited level.
    #[serde(with = "duration_ms")]
    pub budget: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at_ms: Option<u64>,
    pub verdict: Option<Verdict>,
    pub termination: Option<Termination>,
}

impl ExecutionRun {
    pub fn new(selected_level: impl Into<String>) -> Self {
        let started_at_ms = now_ms();
        let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            run_id: format!("run-{started_at_ms:x}-{seq}"),
            change_set_fingerprint: String::new(),
            shape_fingerprint: String::new(),
            phase: WorkflowPhase::default(),
            risk_level: RiskLevel::Low,
            selected_level: selected_level.into(),
            levels_visited: Vec::new(),
            results: Vec::new(),
            hops: Vec::new(),
            started_at_ms,
            duration: Duration::ZERO,
            budget: Duration::ZERO,
            cancelled_at_ms: None,
            verdict: None,
            termination: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.verdict.is_some()
    }

    /// Append a result. Ignored once the run is finalized.
    pub fn append(&mut self, result: CheckResult) -> bool {
        if self.is_finalized() {
            tracing::warn!(
                run = %self.run_id,
                check = %result.name,
                "result after finalize dropped"
            );
            return false;
        }
        self.results.push(result);
        true
    }

    pub fn record_hop(&mut self, hop: EscalationHop) {
        if !self.is_finalized() {
            self.hops.push(hop);
        }
    }

    pub fn enter_level(&mut self, level: &str, budget: Duration) {
        self.levels_visited.push(level.to_string());
        self.budget += budget;
    }

    pub fn finalize(&mut self, verdict: Verdict, termination: Termination, duration: Duration) {
        if self.is_finalized() {
            return;
        }
        self.verdict = Some(verdict);
        self.termination = Some(termination);
        self.duration = duration;
    }

    pub fn escalated(&self) -> bool {
        !self.hops.is_empty()
    }

    pub fn final_level(&self) -> &str {
        self.levels_visited
            .last()
            .map(String::as_str)
            .unwrap_or(self.selected_level.as_str())
    }

    /// Number of actual executions (anything but `Skipped`) of `name`.
    pub fn executions_of(&self, name: &str) -> usize {
        self.results
            .iter()
            .filter(|r| r.name == name && r.outcome != CheckOutcome::Skipped)
            .count()
    }

    /// Most recent result for `name`.
    pub fn latest(&self, name: &str) -> Option<&CheckResult> {
        self.results.iter().rev().find(|r| r.name == name)
    }

    pub fn has_passed(&self, name: &str) -> bool {
        self.results.iter().any(|r| r.name == name && r.passed())
    }

    pub fn failure_count(&self, name: &str) -> usize {
        self.results
            .iter()
            .filter(|r| r.name == name && r.outcome.is_failure())
            .count()
    }

    pub fn count(&self, outcome: CheckOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Names of checks whose latest result is a failure, in first-seen order.
    pub fn failed_checks(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for r in &self.results {
            if !seen.contains(&r.name) {
                seen.push(r.name.clone());
            }
        }
        seen.into_iter()
            .filter(|name| {
                self.latest(name)
                    .map(|r| r.outcome.is_failure())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Highest risk any check reported, if any did.
    pub fn max_reported_risk(&self) -> Option<RiskLevel> {
        self.results.iter().filter_map(|r| r.reported_risk).max()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
