//! Reduction of per-file change records into a single `ComplexityMetrics`.

use crate::models::{
    ChangeDistribution, ChangeKind, ComplexityMetrics, FileChange, FileFootprint, PrimaryKind,
};

/// Aggregate a change set.
///
/// Pure and total: inputs are not re-validated, sums saturate, and an empty
/// slice yields all-zero metrics with `PrimaryKind::NoChange`.
pub fn aggregate(changes: &[FileChange]) -> ComplexityMetrics {
    if changes.is_empty() {
        return ComplexityMetrics::default();
    }

    let mut lines_added = 0u64;
    let mut lines_removed = 0u64;
    let mut complexity_delta = 0i64;
    let mut distribution = ChangeDistribution::default();
    let mut footprint = Vec::with_capacity(changes.len());

    for change in changes {
        footprint.push(FileFootprint {
            path: change.path.clone(),
            lines: change.lines_changed(),
        });
        lines_added = lines_added.saturating_add(change.lines_added);
        lines_removed = lines_removed.saturating_add(change.lines_removed);
        complexity_delta = complexity_delta.saturating_add(change.complexity_delta);

        *distribution.by_kind.entry(change.kind).or_insert(0) += 1;
        *distribution.by_category.entry(change.category).or_insert(0) += 1;
        if !change.language.is_empty() {
            *distribution
                .by_language
                .entry(change.language.clone())
                .or_insert(0) += 1;
        }
    }

    ComplexityMetrics {
        lines_added,
        lines_removed,
        lines_changed: lines_added.saturating_add(lines_removed),
        files_affected: changes.len() as u64,
        complexity_delta,
        primary_kind: primary_kind(&distribution),
        distribution,
        footprint,
    }
}

/// Majority vote over change kinds; ties go to the more severe kind.
fn primary_kind(distribution: &ChangeDistribution) -> PrimaryKind {
    ChangeKind::ALL
        .iter()
        .filter_map(|kind| {
            let votes = distribution.kind_count(*kind);
            (votes > 0).then_some((votes, kind.severity(), *kind))
        })
        .max_by_key(|(votes, severity, _)| (*votes, *severity))
        .map(|(_, _, kind)| PrimaryKind::from(kind))
        .unwrap_or(PrimaryKind::NoChange)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileCategory;

    fn change(path: &str, kind: ChangeKind, added: u64, removed: u64) -> FileChange {
        FileChange::new(path, kind).with_lines(added, removed)
    }

    #[test]
    fn empty_input_is_no_change() {
        let metrics = aggregate(&[]);
        assert_eq!(metrics.lines_changed, 0);
        assert_eq!(metrics.files_affected, 0);
        assert_eq!(metrics.complexity_delta, 0);
        assert_eq!(metrics.primary_kind, PrimaryKind::NoChange);
        assert!(metrics.is_empty());
    }

    #[test]
    fn sums_lines_files_and_delta() {
        let changes = vec![
            change("src/a.rs", ChangeKind::Modified, 10, 2).with_complexity_delta(3),
            change("src/b.rs", ChangeKind::Modified, 5, 5).with_complexity_delta(-1),
            change("docs/c.md", ChangeKind::Created, 20, 0)
                .with_category(FileCategory::Documentation),
        ];
        let metrics = aggregate(&changes);
        assert_eq!(metrics.lines_added, 35);
        assert_eq!(metrics.lines_removed, 7);
        assert_eq!(metrics.lines_changed, 42);
        assert_eq!(metrics.files_affected, 3);
        assert_eq!(metrics.complexity_delta, 2);
        assert_eq!(metrics.primary_kind, PrimaryKind::Modified);
        assert_eq!(metrics.distribution.category_count(FileCategory::Source), 2);
        assert_eq!(
            metrics.distribution.category_count(FileCategory::Documentation),
            1
        );
    }

    #[test]
    fn footprint_keeps_each_path_and_its_lines() {
        let changes = vec![
            change("migrations/001.sql", ChangeKind::Created, 40, 0),
            change("src/lib.rs", ChangeKind::Modified, 3, 1),
        ];
        let metrics = aggregate(&changes);
        assert_eq!(
            metrics.footprint,
            vec![
                FileFootprint {
                    path: "migrations/001.sql".into(),
                    lines: 40,
                },
                FileFootprint {
                    path: "src/lib.rs".into(),
                    lines: 4,
                },
            ]
        );
    }

    #[test]
    fn tie_prefers_deleted_over_everything() {
        let changes = vec![
            change("a", ChangeKind::Created, 1, 0),
            change("b", ChangeKind::Deleted, 0, 1),
            change("c", ChangeKind::Modified, 1, 1),
        ];
        assert_eq!(aggregate(&changes).primary_kind, PrimaryKind::Deleted);
    }

    #[test]
    fn tie_prefers_renamed_over_modified_and_created() {
        let changes = vec![
            change("a", ChangeKind::Modified, 1, 0),
            change("b", ChangeKind::Renamed, 0, 0),
            change("c", ChangeKind::Created, 4, 0),
        ];
        assert_eq!(aggregate(&changes).primary_kind, PrimaryKind::Renamed);

        let moved = vec![
            change("a", ChangeKind::Moved, 0, 0),
            change("b", ChangeKind::Modified, 1, 1),
        ];
        assert_eq!(aggregate(&moved).primary_kind, PrimaryKind::Moved);
    }

    #[test]
    fn majority_beats_severity() {
        let changes = vec![
            change("a", ChangeKind::Created, 1, 0),
            change("b", ChangeKind::Created, 1, 0),
            change("c", ChangeKind::Deleted, 0, 9),
        ];
        assert_eq!(aggregate(&changes).primary_kind, PrimaryKind::Created);
    }

    #[test]
    fn language_breakdown_skips_untagged_files() {
        let changes = vec![
            change("a.rs", ChangeKind::Modified, 1, 0).with_language("rust"),
            change("b.rs", ChangeKind::Modified, 1, 0).with_language("rust"),
            change("Makefile", ChangeKind::Modified, 1, 0),
        ];
        let metrics = aggregate(&changes);
        assert_eq!(metrics.distribution.by_language.len(), 1);
        assert_eq!(metrics.distribution.by_language["rust"], 2);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let changes = vec![
            change("a", ChangeKind::Modified, 3, 1).with_language("go"),
            change("b", ChangeKind::Moved, 0, 0).with_language("python"),
        ];
        assert_eq!(aggregate(&changes), aggregate(&changes));
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let changes = vec![
            change("a", ChangeKind::Modified, u64::MAX, 0).with_complexity_delta(i64::MAX),
            change("b", ChangeKind::Modified, 5, 0).with_complexity_delta(5),
        ];
        let metrics = aggregate(&changes);
        assert_eq!(metrics.lines_changed, u64::MAX);
        assert_eq!(metrics.complexity_delta, i64::MAX);
    }
}
