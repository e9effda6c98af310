//! Gate level selection: first fit over the catalog, optionally nudged
//! upward by the history of similar changes.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{TollgateError, TollgateResult};
use crate::gates::catalog::{GateCatalog, GateLevel};
use crate::gates::guards::{
    clamp_share, DEFAULT_HINT_MIN_SAMPLES, DEFAULT_HINT_MIN_SHARE, MAX_HINT_SAMPLES,
};
use crate::models::{ComplexityMetrics, ExecutionRun, RiskAssessment, Verdict};

/// Index of the cheapest enabled level whose threshold covers the change.
pub fn select_index(
    risk: &RiskAssessment,
    metrics: &ComplexityMetrics,
    catalog: &GateCatalog,
) -> TollgateResult<usize> {
    for (idx, level) in catalog.levels().iter().enumerate() {
        if !level.enabled {
            continue;
        }
        match level.threshold.rejection(metrics, risk.level) {
            None => {
                debug!(level = %level.name, risk = risk.level.as_str(), "level selected");
                return Ok(idx);
            }
            Some(dimension) => {
                debug!(level = %level.name, dimension, "level rejected");
            }
        }
    }
    Err(TollgateError::NoLevelFits(format!(
        "{} lines, {} files, risk {}",
        metrics.lines_changed,
        metrics.files_affected,
        risk.level.as_str()
    )))
}

/// Cheapest enabled level whose threshold covers the change.
///
/// Deterministic; errors only when the catalog has no enabled catch-all,
/// which a validated catalog rules out.
pub fn select<'a>(
    risk: &RiskAssessment,
    metrics: &ComplexityMetrics,
    catalog: &'a GateCatalog,
) -> TollgateResult<&'a GateLevel> {
    let idx = select_index(risk, metrics, catalog)?;
    Ok(&catalog.levels()[idx])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryHint {
    pub enabled: bool,
    /// Fewer comparable runs than this and history is ignored.
    pub min_samples: usize,
    /// Share of comparable runs that must have finished at or below a level
    /// for it to be chosen.
    pub min_share: f64,
    pub max_samples: usize,
}

impl Default for HistoryHint {
    fn default() -> Self {
        Self {
            enabled: true,
            min_samples: DEFAULT_HINT_MIN_SAMPLES,
            min_share: DEFAULT_HINT_MIN_SHARE,
            max_samples: MAX_HINT_SAMPLES,
        }
    }
}

/// Selector that may only move *up* from the threshold choice.
#[derive(Debug, Clone, Default)]
pub struct LevelSelector {
    hint: HistoryHint,
}

impl LevelSelector {
    pub fn new(hint: HistoryHint) -> Self {
        Self {
            hint: HistoryHint {
                min_share: clamp_share(hint.min_share),
                min_samples: hint.min_samples.max(1),
                ..hint
            },
        }
    }

    pub fn hint(&self) -> &HistoryHint {
        &self.hint
    }

    /// Select with `history` holding earlier runs of the same change shape.
    pub fn select_index(
        &self,
        risk: &RiskAssessment,
        metrics: &ComplexityMetrics,
        catalog: &GateCatalog,
        history: &[ExecutionRun],
    ) -> TollgateResult<usize> {
        let base = select_index(risk, metrics, catalog)?;
        if !self.hint.enabled {
            return Ok(base);
        }
        let Some(hinted) = self.hinted_index(catalog, history) else {
            return Ok(base);
        };
        if hinted <= base {
            return Ok(base);
        }

        let chosen = if catalog.levels()[hinted].enabled {
            hinted
        } else {
            catalog.next_enabled_after(hinted).unwrap_or(base)
        };
        if chosen > base {
            info!(
                from = %catalog.levels()[base].name,
                to = %catalog.levels()[chosen].name,
                "history raised gate level"
            );
        }
        Ok(chosen.max(base))
    }

    /// Lowest level at or below which `min_share` of comparable runs ended.
    fn hinted_index(&self, catalog: &GateCatalog, history: &[ExecutionRun]) -> Option<usize> {
        let finals: Vec<usize> = history
            .iter()
            .filter(|run| matches!(run.verdict, Some(v) if v != Verdict::Aborted))
            .take(self.hint.max_samples)
            .filter_map(|run| catalog.index_of(run.final_level()))
            .collect();
        if finals.len() < self.hint.min_samples {
            return None;
        }

        let total = finals.len() as f64;
        (0..catalog.len()).find(|idx| {
            let at_or_below = finals.iter().filter(|f| **f <= *idx).count() as f64;
            at_or_below / total >= self.hint.min_share
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
