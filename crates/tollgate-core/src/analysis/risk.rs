//! Risk evaluation: complexity breakpoints plus hard-factor escalation.
//!
//! The level is computed in two steps. A base level comes from the metrics
//! alone (the highest breakpoint any metric reaches). Each distinct hard
//! factor category then raises it by one tier, capped at `Critical`. Factors
//! are a set, so twenty migration files raise the level exactly as much as
//! one does.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{
    ChangeMagnitude, ComplexityMetrics, FileCategory, ImpactSummary, RiskAssessment, RiskFactor,
    RiskLevel,
};

/// Thresholds at which a metric pushes the base level to a tier.
///
/// A tier is reached when *any* configured metric meets its value. Absent
/// values never trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskBreakpoint {
    pub lines: Option<u64>,
    pub files: Option<u64>,
    pub complexity_delta: Option<i64>,
}

impl RiskBreakpoint {
    pub fn new(lines: u64, files: u64, complexity_delta: i64) -> Self {
        Self {
            lines: Some(lines),
            files: Some(files),
            complexity_delta: Some(complexity_delta),
        }
    }

    fn reached(&self, metrics: &ComplexityMetrics) -> bool {
        self.lines.is_some_and(|v| metrics.lines_changed >= v)
            || self.files.is_some_and(|v| metrics.files_affected >= v)
            || self
                .complexity_delta
                .is_some_and(|v| metrics.complexity_delta >= v)
    }
}

/// How hard factors raise the base level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorEscalation {
    /// One tier per distinct hard factor category.
    #[default]
    PerCategory,
    /// One tier if any hard factor is present.
    SingleTier,
    /// Factors are reported but never change the level.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    pub medium: RiskBreakpoint,
    pub high: RiskBreakpoint,
    pub critical: RiskBreakpoint,
    pub hard_factors: BTreeSet<RiskFactor>,
    pub factor_escalation: FactorEscalation,
    /// Blast radius at or above which `WideBlastRadius` is attached.
    pub wide_blast_radius: Option<usize>,
    /// Derive factors from file categories (migrations, config, build files).
    pub infer_from_categories: bool,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            medium: RiskBreakpoint::new(100, 5, 10),
            high: RiskBreakpoint::new(500, 20, 40),
            critical: RiskBreakpoint::new(2000, 60, 120),
            hard_factors: [
                RiskFactor::SchemaChange,
                RiskFactor::PublicApiChange,
                RiskFactor::SecuritySensitivePath,
            ]
            .into_iter()
            .collect(),
            factor_escalation: FactorEscalation::PerCategory,
            wide_blast_radius: Some(25),
            infer_from_categories: true,
        }
    }
}

/// Deterministic `(metrics, impact) -> RiskAssessment` mapping.
#[derive(Debug, Clone, Default)]
pub struct RiskEvaluator {
    policy: RiskPolicy,
}

impl RiskEvaluator {
    pub fn new(policy: RiskPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    pub fn evaluate(&self, metrics: &ComplexityMetrics, impact: &ImpactSummary) -> RiskAssessment {
        let base_level = self.base_level(metrics);
        let factors = self.collect_factors(metrics, impact);
        let hard_categories = factors
            .iter()
            .filter(|f| self.policy.hard_factors.contains(f))
            .count();
        let tiers = match self.policy.factor_escalation {
            FactorEscalation::PerCategory => hard_categories,
            FactorEscalation::SingleTier => hard_categories.min(1),
            FactorEscalation::Disabled => 0,
        };
        let level = base_level.raised_by(tiers);

        debug!(
            base = base_level.as_str(),
            level = level.as_str(),
            hard_categories,
            "risk evaluated"
        );

        RiskAssessment {
            level,
            base_level,
            complexity_score: complexity_score(metrics),
            magnitude: ChangeMagnitude::classify(metrics.lines_changed),
            blast_radius: impact.blast_radius.max(impact.affected_components.len()),
            affected_components: impact.affected_components.clone(),
            factors,
        }
    }

    /// Level from metrics alone.
    pub fn base_level(&self, metrics: &ComplexityMetrics) -> RiskLevel {
        if self.policy.critical.reached(metrics) {
            RiskLevel::Critical
        } else if self.policy.high.reached(metrics) {
            RiskLevel::High
        } else if self.policy.medium.reached(metrics) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    fn collect_factors(
        &self,
        metrics: &ComplexityMetrics,
        impact: &ImpactSummary,
    ) -> BTreeSet<RiskFactor> {
        let mut factors: BTreeSet<RiskFactor> = impact.detected_factors.iter().copied().collect();

        if self.policy.infer_from_categories {
            let dist = &metrics.distribution;
            if dist.has_category(FileCategory::Migration) {
                factors.insert(RiskFactor::SchemaChange);
            }
            if dist.has_category(FileCategory::Config) {
                factors.insert(RiskFactor::ConfigurationChange);
            }
            if dist.has_category(FileCategory::Build) {
                factors.insert(RiskFactor::DependencyUpdate);
            }
        }

        let radius = impact.blast_radius.max(impact.affected_components.len());
        if self.policy.wide_blast_radius.is_some_and(|t| radius >= t) {
            factors.insert(RiskFactor::WideBlastRadius);
        }

        factors
    }
}

/// Informational score; the level never depends on it.
fn complexity_score(metrics: &ComplexityMetrics) -> f64 {
    let raw = metrics.lines_changed as f64 / 100.0
        + metrics.files_affected as f64 * 0.5
        + metrics.complexity_delta.max(0) as f64 * 0.2;
    (raw * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregate;
    use crate::models::{ChangeKind, ComponentRef, FileChange};

    fn metrics(lines: u64, files: u64, delta: i64) -> ComplexityMetrics {
        ComplexityMetrics {
            lines_changed: lines,
            files_affected: files,
            complexity_delta: delta,
            ..Default::default()
        }
    }

    #[test]
    fn base_level_follows_breakpoints() {
        let eval = RiskEvaluator::default();
        assert_eq!(eval.base_level(&metrics(5, 1, 0)), RiskLevel::Low);
        assert_eq!(eval.base_level(&metrics(100, 1, 0)), RiskLevel::Medium);
        assert_eq!(eval.base_level(&metrics(10, 20, 0)), RiskLevel::High);
        assert_eq!(eval.base_level(&metrics(10, 1, 500)), RiskLevel::Critical);
    }

    #[test]
    fn empty_impact_degrades_to_base() {
        let eval = RiskEvaluator::default();
        let m = metrics(150, 2, 0);
        let risk = eval.evaluate(&m, &ImpactSummary::default());
        assert_eq!(risk.level, RiskLevel::Medium);
        assert_eq!(risk.base_level, RiskLevel::Medium);
        assert!(risk.factors.is_empty());
    }

    #[test]
    fn escalates_once_per_category_not_per_count() {
        let eval = RiskEvaluator::default();
        let m = metrics(5, 1, 0);
        let impact = ImpactSummary::default()
            .with_factor(RiskFactor::PublicApiChange)
            .with_factor(RiskFactor::PublicApiChange)
            .with_factor(RiskFactor::PublicApiChange);
        assert_eq!(eval.evaluate(&m, &impact).level, RiskLevel::Medium);

        let impact = impact.with_factor(RiskFactor::SecuritySensitivePath);
        assert_eq!(eval.evaluate(&m, &impact).level, RiskLevel::High);
    }

    #[test]
    fn soft_factors_do_not_escalate() {
        let eval = RiskEvaluator::default();
        let impact = ImpactSummary::default()
            .with_factor(RiskFactor::DependencyUpdate)
            .with_factor(RiskFactor::PerformanceSensitive);
        let risk = eval.evaluate(&metrics(5, 1, 0), &impact);
        assert_eq!(risk.level, RiskLevel::Low);
        assert_eq!(risk.factors.len(), 2);
    }

    #[test]
    fn capped_at_critical() {
        let eval = RiskEvaluator::default();
        let impact = ImpactSummary::default()
            .with_factor(RiskFactor::SchemaChange)
            .with_factor(RiskFactor::PublicApiChange)
            .with_factor(RiskFactor::SecuritySensitivePath);
        let risk = eval.evaluate(&metrics(600, 1, 0), &impact);
        assert_eq!(risk.base_level, RiskLevel::High);
        assert_eq!(risk.level, RiskLevel::Critical);
    }

    #[test]
    fn migration_category_implies_schema_change() {
        let eval = RiskEvaluator::default();
        let changes = vec![
            FileChange::new("db/migrations/0042_add_index.sql", ChangeKind::Created)
                .with_lines(20, 0)
                .with_category(FileCategory::Migration),
        ];
        let risk = eval.evaluate(&aggregate(&changes), &ImpactSummary::default());
        assert!(risk.has_factor(RiskFactor::SchemaChange));
        assert_eq!(risk.level, RiskLevel::Medium);
    }

    #[test]
    fn single_tier_and_disabled_policies() {
        let impact = ImpactSummary::default()
            .with_factor(RiskFactor::SchemaChange)
            .with_factor(RiskFactor::PublicApiChange);
        let m = metrics(5, 1, 0);

        let single = RiskEvaluator::new(RiskPolicy {
            factor_escalation: FactorEscalation::SingleTier,
            ..RiskPolicy::default()
        });
        assert_eq!(single.evaluate(&m, &impact).level, RiskLevel::Medium);

        let disabled = RiskEvaluator::new(RiskPolicy {
            factor_escalation: FactorEscalation::Disabled,
            ..RiskPolicy::default()
        });
        let risk = disabled.evaluate(&m, &impact);
        assert_eq!(risk.level, RiskLevel::Low);
        assert_eq!(risk.factors.len(), 2);
    }

    #[test]
    fn wide_blast_radius_from_components() {
        let eval = RiskEvaluator::new(RiskPolicy {
            wide_blast_radius: Some(2),
            ..RiskPolicy::default()
        });
        let impact = ImpactSummary {
            affected_components: vec![ComponentRef::new("api"), ComponentRef::new("worker")],
            blast_radius: 0,
            detected_factors: vec![],
        };
        let risk = eval.evaluate(&metrics(5, 1, 0), &impact);
        assert_eq!(risk.blast_radius, 2);
        assert!(risk.has_factor(RiskFactor::WideBlastRadius));
        assert_eq!(risk.level, RiskLevel::Low);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let eval = RiskEvaluator::default();
        let m = metrics(321, 7, 12);
        let impact = ImpactSummary::default().with_factor(RiskFactor::SchemaChange);
        assert_eq!(eval.evaluate(&m, &impact), eval.evaluate(&m, &impact));
    }
}
