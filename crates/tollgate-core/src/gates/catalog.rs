//! Gate level definitions and the validated, ordered catalog.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::errors::{TollgateError, TollgateResult};
use crate::gates::guards::{
    DEFAULT_ADAPTIVE_CEILING, MAX_ADAPTIVE_CONCURRENCY, MAX_BOUNDED_CONCURRENCY,
    MAX_CHECKS_PER_LEVEL, MAX_CHECK_RETRIES, MAX_FILE_PATTERNS, MAX_LEVELS, MAX_PATTERN_FACTOR,
};
use crate::models::{
    duration_ms, ChangeKind, ComplexityMetrics, Criticality, FileCategory, RiskAssessment,
    RiskFactor, RiskLevel,
};

fn default_true() -> bool {
    true
}

fn default_ceiling() -> usize {
    DEFAULT_ADAPTIVE_CEILING
}

fn default_factor() -> f64 {
    1.0
}

fn is_no_backoff(backoff: &Backoff) -> bool {
    *backoff == Backoff::None
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Glob over changed paths whose lines weigh more, or whose presence raises
/// the risk compared against `max_risk`.
///
/// Factors are at least 1.0: a pattern can only make a change look bigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "FilePatternDef", into = "FilePatternDef")]
pub struct FilePattern {
    pattern: String,
    weight: f64,
    risk_multiplier: f64,
    matcher: GlobMatcher,
}

#[derive(Serialize, Deserialize)]
struct FilePatternDef {
    pattern: String,
    #[serde(default = "default_factor")]
    weight: f64,
    #[serde(default = "default_factor")]
    risk_multiplier: f64,
}

impl FilePattern {
    pub fn new(
        pattern: impl Into<String>,
        weight: f64,
        risk_multiplier: f64,
    ) -> TollgateResult<Self> {
        let pattern = pattern.into();
        for (name, factor) in [("weight", weight), ("risk_multiplier", risk_multiplier)] {
            if !(1.0..=MAX_PATTERN_FACTOR).contains(&factor) {
                return Err(TollgateError::config(format!(
                    "file pattern '{pattern}' {name} {factor} outside 1..={MAX_PATTERN_FACTOR}"
                )));
            }
        }
        let matcher = GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| TollgateError::config(format!("file pattern '{pattern}': {e}")))?
            .compile_matcher();
        Ok(Self {
            pattern,
            weight,
            risk_multiplier,
            matcher,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn risk_multiplier(&self) -> f64 {
        self.risk_multiplier
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }
}

impl PartialEq for FilePattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.weight == other.weight
            && self.risk_multiplier == other.risk_multiplier
    }
}

impl TryFrom<FilePatternDef> for FilePattern {
    type Error = TollgateError;

    fn try_from(def: FilePatternDef) -> Result<Self, Self::Error> {
        FilePattern::new(def.pattern, def.weight, def.risk_multiplier)
    }
}

impl From<FilePattern> for FilePatternDef {
    fn from(pattern: FilePattern) -> Self {
        FilePatternDef {
            pattern: pattern.pattern,
            weight: pattern.weight,
            risk_multiplier: pattern.risk_multiplier,
        }
    }
}

/// Scale a risk tier by `multiplier`, rounding to the nearest tier.
fn scaled_risk(risk: RiskLevel, multiplier: f64) -> RiskLevel {
    if multiplier <= 1.0 {
        return risk;
    }
    let rank = f64::from(risk.tier()) + 1.0;
    let scaled = (rank * multiplier).round() as usize;
    risk.raised_by(scaled.saturating_sub(rank as usize))
}

/// Upper bounds a change must stay within to be handled by a level.
///
/// `None` means unbounded. An absent `allowed_kinds` admits every kind.
/// Paths matching `file_patterns` count `weight` times toward `max_lines`,
/// and the heaviest matching `risk_multiplier` scales the risk compared
/// against `max_risk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeThreshold {
    pub max_lines: Option<u64>,
    pub max_files: Option<u64>,
    pub max_complexity_delta: Option<i64>,
    pub allowed_kinds: Option<BTreeSet<ChangeKind>>,
    pub max_risk: RiskLevel,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_patterns: Vec<FilePattern>,
}

impl Default for ChangeThreshold {
    fn default() -> Self {
        Self::unrestricted()
    }
}

impl ChangeThreshold {
    pub fn unrestricted() -> Self {
        Self {
            max_lines: None,
            max_files: None,
            max_complexity_delta: None,
            allowed_kinds: None,
            max_risk: RiskLevel::Critical,
            file_patterns: Vec::new(),
        }
    }

    pub fn with_max_lines(mut self, lines: u64) -> Self {
        self.max_lines = Some(lines);
        self
    }

    pub fn with_max_files(mut self, files: u64) -> Self {
        self.max_files = Some(files);
        self
    }

    pub fn with_max_complexity_delta(mut self, delta: i64) -> Self {
        self.max_complexity_delta = Some(delta);
        self
    }

    pub fn with_allowed_kinds(mut self, kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        self.allowed_kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn with_max_risk(mut self, risk: RiskLevel) -> Self {
        self.max_risk = risk;
        self
    }

    pub fn with_file_pattern(mut self, pattern: FilePattern) -> Self {
        self.file_patterns.push(pattern);
        self
    }

    fn admits_every_kind(&self) -> bool {
        self.allowed_kinds
            .as_ref()
            .map_or(true, |kinds| ChangeKind::ALL.iter().all(|k| kinds.contains(k)))
    }

    pub fn is_unrestricted(&self) -> bool {
        self.max_lines.is_none()
            && self.max_files.is_none()
            && self.max_complexity_delta.is_none()
            && self.admits_every_kind()
            && self.max_risk == RiskLevel::Critical
    }

    /// Heaviest (weight, risk multiplier) among patterns matching `path`.
    fn factors_for(&self, path: &str) -> (f64, f64) {
        self.file_patterns
            .iter()
            .filter(|p| p.matches(path))
            .fold((1.0, 1.0), |(w, m), p| (w.max(p.weight), m.max(p.risk_multiplier)))
    }

    /// Changed lines with pattern weights applied.
    pub fn weighted_lines(&self, metrics: &ComplexityMetrics) -> u64 {
        if self.file_patterns.is_empty() {
            return metrics.lines_changed;
        }
        let extra: f64 = metrics
            .footprint
            .iter()
            .map(|file| file.lines as f64 * (self.factors_for(&file.path).0 - 1.0))
            .sum();
        metrics.lines_changed.saturating_add(extra.ceil() as u64)
    }

    /// Risk with the heaviest matching pattern multiplier applied.
    pub fn effective_risk(&self, metrics: &ComplexityMetrics, risk: RiskLevel) -> RiskLevel {
        let multiplier = metrics
            .footprint
            .iter()
            .map(|file| self.factors_for(&file.path).1)
            .fold(1.0, f64::max);
        scaled_risk(risk, multiplier)
    }

    /// Whether a change with these metrics and risk fits under the threshold.
    ///
    /// An empty change set (`NoChange`) passes the kind test at every level.
    pub fn fits(&self, metrics: &ComplexityMetrics, risk: RiskLevel) -> bool {
        self.rejection(metrics, risk).is_none()
    }

    /// First dimension that rejects the change, if any.
    pub fn rejection(&self, metrics: &ComplexityMetrics, risk: RiskLevel) -> Option<&'static str> {
        if self
            .max_lines
            .is_some_and(|max| self.weighted_lines(metrics) > max)
        {
            return Some("lines");
        }
        if self.max_files.is_some_and(|max| metrics.files_affected > max) {
            return Some("files");
        }
        if self
            .max_complexity_delta
            .is_some_and(|max| metrics.complexity_delta > max)
        {
            return Some("complexity_delta");
        }
        if let (Some(kind), Some(allowed)) =
            (metrics.primary_kind.change_kind(), &self.allowed_kinds)
        {
            if !allowed.contains(&kind) {
                return Some("change_kind");
            }
        }
        if self.effective_risk(metrics, risk) > self.max_risk {
            return Some("risk");
        }
        None
    }

    /// Dimension in which `self` is narrower than `previous`, if any.
    ///
    /// Every pattern here must also appear in `previous` with factors at
    /// least as heavy, so a change never weighs more at a wider level.
    pub fn narrowing_against(&self, previous: &ChangeThreshold) -> Option<&'static str> {
        fn wider<T: PartialOrd>(current: Option<T>, previous: Option<T>) -> bool {
            match (current, previous) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(c), Some(p)) => c >= p,
            }
        }

        if !wider(self.max_lines, previous.max_lines) {
            return Some("max_lines");
        }
        if !wider(self.max_files, previous.max_files) {
            return Some("max_files");
        }
        if !wider(self.max_complexity_delta, previous.max_complexity_delta) {
            return Some("max_complexity_delta");
        }
        if !self.admits_every_kind() {
            let covers = match (&self.allowed_kinds, &previous.allowed_kinds) {
                (Some(current), Some(prev)) => prev.is_subset(current),
                _ => false,
            };
            if !covers {
                return Some("allowed_kinds");
            }
        }
        if self.max_risk < previous.max_risk {
            return Some("max_risk");
        }
        let lighter = self.file_patterns.iter().all(|pattern| {
            previous.file_patterns.iter().any(|prev| {
                prev.pattern == pattern.pattern
                    && prev.weight >= pattern.weight
                    && prev.risk_multiplier >= pattern.risk_multiplier
            })
        });
        if !lighter {
            return Some("file_patterns");
        }
        None
    }

    pub fn is_superset_of(&self, previous: &ChangeThreshold) -> bool {
        self.narrowing_against(previous).is_none()
    }

    fn validate(&self, level: &str) -> TollgateResult<()> {
        if self.file_patterns.len() > MAX_FILE_PATTERNS {
            return Err(TollgateError::config(format!(
                "level '{level}' declares {} file patterns (max {MAX_FILE_PATTERNS})",
                self.file_patterns.len()
            )));
        }
        let mut seen = HashSet::new();
        for pattern in &self.file_patterns {
            if !seen.insert(pattern.pattern.as_str()) {
                return Err(TollgateError::config(format!(
                    "level '{level}' declares file pattern '{}' twice",
                    pattern.pattern
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Exit status a check must produce to count as a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedExit {
    #[default]
    Success,
    /// Non-zero exit passes; used for checks that must fail in the red phase.
    Failure,
    Any,
}

impl ExpectedExit {
    pub fn accepts(self, exit_code: i32) -> bool {
        match self {
            ExpectedExit::Success => exit_code == 0,
            ExpectedExit::Failure => exit_code != 0,
            ExpectedExit::Any => true,
        }
    }
}

/// Delay before each retry of a failed attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    Fixed {
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    /// `increment` times the retry number.
    Linear {
        #[serde(rename = "increment_ms", with = "duration_ms")]
        increment: Duration,
    },
    /// Doubles from `initial`, capped at `max`.
    Exponential {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay(self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => delay,
            Backoff::Linear { increment } => increment.saturating_mul(retry),
            Backoff::Exponential { initial, max } => {
                let factor = 1u32 << (retry - 1).min(20);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Condition under which an optional check is worth running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum ActivationPredicate {
    #[default]
    Always,
    RiskAtLeast {
        level: RiskLevel,
    },
    LinesChangedAbove {
        lines: u64,
    },
    FilesAffectedAbove {
        files: u64,
    },
    ComplexityDeltaAbove {
        delta: i64,
    },
    ChangeKindIn {
        kinds: Vec<ChangeKind>,
    },
    CategoryPresent {
        category: FileCategory,
    },
    FactorPresent {
        factor: RiskFactor,
    },
    AllOf {
        all: Vec<ActivationPredicate>,
    },
    AnyOf {
        any: Vec<ActivationPredicate>,
    },
}

impl ActivationPredicate {
    pub fn holds(&self, metrics: &ComplexityMetrics, risk: &RiskAssessment) -> bool {
        match self {
            ActivationPredicate::Always => true,
            ActivationPredicate::RiskAtLeast { level } => risk.level >= *level,
            ActivationPredicate::LinesChangedAbove { lines } => metrics.lines_changed > *lines,
            ActivationPredicate::FilesAffectedAbove { files } => metrics.files_affected > *files,
            ActivationPredicate::ComplexityDeltaAbove { delta } => {
                metrics.complexity_delta > *delta
            }
            ActivationPredicate::ChangeKindIn { kinds } => kinds
                .iter()
                .any(|kind| metrics.distribution.kind_count(*kind) > 0),
            ActivationPredicate::CategoryPresent { category } => {
                metrics.distribution.has_category(*category)
            }
            ActivationPredicate::FactorPresent { factor } => risk.has_factor(*factor),
            ActivationPredicate::AllOf { all } => all.iter().all(|p| p.holds(metrics, risk)),
            ActivationPredicate::AnyOf { any } => any.iter().any(|p| p.holds(metrics, risk)),
        }
    }
}

/// One named validation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// A failing blocking required check stops further launches.
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default)]
    pub expected: ExpectedExit,
    /// Extra attempts after a failed (not timed-out) one.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "is_no_backoff")]
    pub backoff: Backoff,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Only consulted for optional checks.
    #[serde(default)]
    pub activation: ActivationPredicate,
}

impl CheckSpec {
    pub fn new<I, S>(name: impl Into<String>, command: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            timeout,
            blocking: true,
            expected: ExpectedExit::Success,
            retries: 0,
            backoff: Backoff::None,
            env: BTreeMap::new(),
            working_dir: None,
            activation: ActivationPredicate::Always,
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn expecting(mut self, expected: ExpectedExit) -> Self {
        self.expected = expected;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn activated_when(mut self, predicate: ActivationPredicate) -> Self {
        self.activation = predicate;
        self
    }

    fn validate(&self, level: &str) -> TollgateResult<()> {
        if self.name.trim().is_empty() {
            return Err(TollgateError::config(format!(
                "level '{level}' has a check with an empty name"
            )));
        }
        if self.command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(TollgateError::config(format!(
                "check '{}' in level '{level}' has no command",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(TollgateError::config(format!(
                "check '{}' in level '{level}' has a zero timeout",
                self.name
            )));
        }
        if self.retries > MAX_CHECK_RETRIES {
            return Err(TollgateError::config(format!(
                "check '{}' in level '{level}' retries {} times (max {MAX_CHECK_RETRIES})",
                self.name, self.retries
            )));
        }
        if let Backoff::Exponential { initial, max } = self.backoff {
            if initial.is_zero() || max < initial {
                return Err(TollgateError::config(format!(
                    "check '{}' in level '{level}' has an exponential backoff with initial {} ms \
                     and max {} ms",
                    self.name,
                    initial.as_millis(),
                    max.as_millis()
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyStrategy {
    #[default]
    Sequential,
    BoundedParallel {
        max_in_flight: usize,
    },
    /// Degree picked from resource pressure, between 1 and `ceiling`.
    Adaptive {
        #[serde(default = "default_ceiling")]
        ceiling: usize,
    },
}

impl ConcurrencyStrategy {
    /// Upper bound on checks in flight under this strategy.
    pub fn max_degree(self) -> usize {
        match self {
            ConcurrencyStrategy::Sequential => 1,
            ConcurrencyStrategy::BoundedParallel { max_in_flight } => max_in_flight,
            ConcurrencyStrategy::Adaptive { ceiling } => ceiling,
        }
    }
}

/// A named validation tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateLevel {
    pub name: String,
    #[serde(default)]
    pub threshold: ChangeThreshold,
    #[serde(default)]
    pub required: Vec<CheckSpec>,
    #[serde(default)]
    pub optional: Vec<CheckSpec>,
    #[serde(rename = "max_execution_time_ms", with = "duration_ms")]
    pub max_execution_time: Duration,
    #[serde(default)]
    pub concurrency: ConcurrencyStrategy,
    /// Escalate to the next enabled level when this one fails and no rule fired.
    #[serde(default)]
    pub escalate_on_failure: bool,
    /// Disabled levels are never selected but still take part in validation.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl GateLevel {
    pub fn new(name: impl Into<String>, threshold: ChangeThreshold, budget: Duration) -> Self {
        Self {
            name: name.into(),
            threshold,
            required: Vec::new(),
            optional: Vec::new(),
            max_execution_time: budget,
            concurrency: ConcurrencyStrategy::Sequential,
            escalate_on_failure: false,
            enabled: true,
        }
    }

    pub fn require(mut self, check: CheckSpec) -> Self {
        self.required.push(check);
        self
    }

    pub fn optionally(mut self, check: CheckSpec) -> Self {
        self.optional.push(check);
        self
    }

    pub fn with_concurrency(mut self, strategy: ConcurrencyStrategy) -> Self {
        self.concurrency = strategy;
        self
    }

    pub fn escalating_on_failure(mut self) -> Self {
        self.escalate_on_failure = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Look a check up by name in either list.
    pub fn check(&self, name: &str) -> Option<(&CheckSpec, Criticality)> {
        self.required
            .iter()
            .find(|c| c.name == name)
            .map(|c| (c, Criticality::Required))
            .or_else(|| {
                self.optional
                    .iter()
                    .find(|c| c.name == name)
                    .map(|c| (c, Criticality::Optional))
            })
    }

    pub fn requires(&self, name: &str) -> bool {
        self.required.iter().any(|c| c.name == name)
    }

    pub fn check_count(&self) -> usize {
        self.required.len() + self.optional.len()
    }

    fn validate(&self) -> TollgateResult<()> {
        if self.name.trim().is_empty() {
            return Err(TollgateError::config("gate level with an empty name"));
        }
        if self.max_execution_time.is_zero() {
            return Err(TollgateError::config(format!(
                "level '{}' has a zero execution budget",
                self.name
            )));
        }
        if self.check_count() > MAX_CHECKS_PER_LEVEL {
            return Err(TollgateError::config(format!(
                "level '{}' declares {} checks (max {MAX_CHECKS_PER_LEVEL})",
                self.name,
                self.check_count()
            )));
        }
        self.threshold.validate(&self.name)?;

        let mut seen = HashSet::new();
        for check in self.required.iter().chain(self.optional.iter()) {
            check.validate(&self.name)?;
            if !seen.insert(check.name.as_str()) {
                return Err(TollgateError::config(format!(
                    "level '{}' declares check '{}' twice",
                    self.name, check.name
                )));
            }
        }

        match self.concurrency {
            ConcurrencyStrategy::Sequential => {}
            ConcurrencyStrategy::BoundedParallel { max_in_flight } => {
                if max_in_flight == 0 || max_in_flight > MAX_BOUNDED_CONCURRENCY {
                    return Err(TollgateError::config(format!(
                        "level '{}' bounded parallelism {max_in_flight} outside \
                         1..={MAX_BOUNDED_CONCURRENCY}",
                        self.name
                    )));
                }
            }
            ConcurrencyStrategy::Adaptive { ceiling } => {
                if ceiling == 0 || ceiling > MAX_ADAPTIVE_CONCURRENCY {
                    return Err(TollgateError::config(format!(
                        "level '{}' adaptive ceiling {ceiling} outside \
                         1..={MAX_ADAPTIVE_CONCURRENCY}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Ordered levels, cheapest first. Only constructible through validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<GateLevel>", into = "Vec<GateLevel>")]
pub struct GateCatalog {
    levels: Vec<GateLevel>,
}

impl GateCatalog {
    pub fn new(levels: Vec<GateLevel>) -> TollgateResult<Self> {
        validate_levels(&levels)?;
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[GateLevel] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&GateLevel> {
        self.levels.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|l| l.name == name)
    }

    pub fn level(&self, name: &str) -> Option<&GateLevel> {
        self.levels.iter().find(|l| l.name == name)
    }

    pub fn highest_index(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// The catch-all level.
    pub fn highest(&self) -> &GateLevel {
        &self.levels[self.highest_index()]
    }

    /// Next enabled level strictly above `index`.
    pub fn next_enabled_after(&self, index: usize) -> Option<usize> {
        (index + 1..self.levels.len()).find(|i| self.levels[*i].enabled)
    }
}

impl TryFrom<Vec<GateLevel>> for GateCatalog {
    type Error = TollgateError;

    fn try_from(levels: Vec<GateLevel>) -> Result<Self, Self::Error> {
        GateCatalog::new(levels)
    }
}

impl From<GateCatalog> for Vec<GateLevel> {
    fn from(catalog: GateCatalog) -> Self {
        catalog.levels
    }
}

fn validate_levels(levels: &[GateLevel]) -> TollgateResult<()> {
    if levels.is_empty() {
        return Err(TollgateError::config("gate catalog is empty"));
    }
    if levels.len() > MAX_LEVELS {
        return Err(TollgateError::config(format!(
            "gate catalog has {} levels (max {MAX_LEVELS})",
            levels.len()
        )));
    }

    let mut names = HashSet::new();
    for (idx, level) in levels.iter().enumerate() {
        level.validate()?;
        if !names.insert(level.name.as_str()) {
            return Err(TollgateError::config(format!(
                "gate level '{}' declared twice",
                level.name
            )));
        }
        if idx > 0 {
            let previous = &levels[idx - 1];
            if let Some(dimension) = level.threshold.narrowing_against(&previous.threshold) {
                return Err(TollgateError::config(format!(
                    "level '{}' narrows {dimension} relative to '{}'",
                    level.name, previous.name
                )));
            }
        }
    }

    // Non-empty was checked above.
    let last = &levels[levels.len() - 1];
    if !last.threshold.is_unrestricted() {
        return Err(TollgateError::config(format!(
            "last level '{}' must be unrestricted",
            last.name
        )));
    }
    if !last.enabled {
        return Err(TollgateError::config(format!(
            "last level '{}' must be enabled",
            last.name
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
