//! Two-snapshot result diffing.
//!
//! [`results_did_change`] is the cheap gate RUN uses to decide whether a
//! handover is worth producing; [`calculate_changes`] computes the
//! position-level changeset between the last delivered row set and the new
//! one. Both restore row identity across compaction relocations by mapping
//! the new view's row indices back into the previous commit's index space
//! through the inverse of the commit's move map; the `changed` and
//! `inserted` sets are recorded in commit-end space and are consulted with
//! unmapped indices.

use std::collections::HashMap;

use rill_store::Snapshot;
use rill_types::{CommitChanges, LinkPath, PositionChange, RowIdx, TableChanges, TableIdx};

use crate::paths::{row_reaches_change, watched_tables};

/// Whether the freshly computed row set differs from the previously
/// handed-over one, directly or through a watched link path.
pub(crate) fn results_did_change(
    snapshot: &Snapshot,
    table: TableIdx,
    new_rows: &[RowIdx],
    previous: &[RowIdx],
    watched: &[LinkPath],
    commit: &CommitChanges,
) -> bool {
    if new_rows.len() != previous.len() {
        return true;
    }
    let table_changes = commit.for_table(table);
    let inverse = table_changes.map(TableChanges::inverse_moves).unwrap_or_default();
    for (i, &idx) in new_rows.iter().enumerate() {
        if let Some(changes) = table_changes {
            if changes.changed.contains(&idx) || changes.inserted.contains(&idx) {
                return true;
            }
        }
        let identity = inverse.get(&idx).copied().unwrap_or(idx);
        if identity != previous[i] {
            return true;
        }
    }

    // Identity and content of the primary table are unchanged; anything
    // left must come in through a watched link path.
    if watched.is_empty() {
        return false;
    }
    let reachable = watched_tables(snapshot, table, watched);
    if !reachable
        .iter()
        .any(|&t| commit.for_table(t).is_some_and(|c| !c.changed.is_empty()))
    {
        return false;
    }
    new_rows
        .iter()
        .any(|&row| row_reaches_change(snapshot, table, row, watched, commit))
}

/// Whether a row kept in place should be reported as modified: its own
/// content changed, or a watched link path reaches a modified row.
fn row_modified(
    snapshot: &Snapshot,
    table: TableIdx,
    row: RowIdx,
    watched: &[LinkPath],
    commit: &CommitChanges,
) -> bool {
    if commit
        .for_table(table)
        .is_some_and(|c| c.changed.contains(&row))
    {
        return true;
    }
    row_reaches_change(snapshot, table, row, watched, commit)
}

/// Compute the changeset describing the transition from `baseline` (the
/// last delivered row set) to `new_rows` (the freshly computed one).
///
/// The walk merges both sides ordered by row identity, carrying a running
/// shift so that rows merely displaced by insertions or deletions above
/// them produce no entries. Rows present on one side only become
/// insertions or deletions; rows whose position moved beyond the shift
/// become moves; rows in place whose content (or watched link closure)
/// changed become in-place modifications.
pub(crate) fn calculate_changes(
    snapshot: &Snapshot,
    table: TableIdx,
    baseline: &[RowIdx],
    new_rows: &[RowIdx],
    watched: &[LinkPath],
    commit: &CommitChanges,
) -> Vec<PositionChange> {
    let table_changes = commit.for_table(table);
    let inverse: HashMap<RowIdx, RowIdx> = table_changes
        .map(TableChanges::inverse_moves)
        .unwrap_or_default();

    let mut old_side: Vec<(RowIdx, usize)> = baseline
        .iter()
        .enumerate()
        .map(|(pos, &row)| (row, pos))
        .collect();
    old_side.sort_by_key(|&(row, _)| row);

    // Identity `None` marks rows born in this commit: they can never match
    // a baseline row, even when they reuse a deleted row's storage slot.
    let mut new_side: Vec<(Option<RowIdx>, usize, RowIdx)> = new_rows
        .iter()
        .enumerate()
        .map(|(pos, &actual)| {
            let fresh = table_changes.is_some_and(|c| c.inserted.contains(&actual));
            let identity = (!fresh).then(|| inverse.get(&actual).copied().unwrap_or(actual));
            (identity, pos, actual)
        })
        .collect();
    new_side.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.1.cmp(&b.1),
    });

    let mut changeset = Vec::new();
    let (mut i, mut j) = (0, 0);
    let mut shift: i64 = 0;
    while i < old_side.len() && j < new_side.len() {
        let (old_row, old_pos) = old_side[i];
        let (identity, new_pos, actual) = new_side[j];
        match identity {
            Some(new_row) if new_row == old_row => {
                let shifted = new_pos as i64 + shift;
                if old_pos as i64 != shifted {
                    let target = usize::try_from(shifted).unwrap_or(new_pos);
                    changeset.push(PositionChange::moved(old_pos, target));
                } else if row_modified(snapshot, table, actual, watched, commit) {
                    changeset.push(PositionChange::modified(old_pos));
                }
                i += 1;
                j += 1;
            }
            // Fresh rows (identity None) order after every surviving row.
            Some(new_row) if old_row < new_row => {
                changeset.push(PositionChange::deleted(old_pos));
                shift += 1;
                i += 1;
            }
            None => {
                changeset.push(PositionChange::deleted(old_pos));
                shift += 1;
                i += 1;
            }
            Some(_) => {
                changeset.push(PositionChange::inserted(new_pos));
                shift -= 1;
                j += 1;
            }
        }
    }
    for &(_, old_pos) in &old_side[i..] {
        changeset.push(PositionChange::deleted(old_pos));
    }
    for &(_, new_pos, _) in &new_side[j..] {
        changeset.push(PositionChange::inserted(new_pos));
    }
    changeset
}
