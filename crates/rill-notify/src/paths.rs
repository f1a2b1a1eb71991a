//! Link-path dependency tracing.
//!
//! Observers may declare paths through link-valued columns; a result row
//! then depends not just on its own table's row but on every row reachable
//! along those paths. Tracing walks forward from each result row because
//! result cardinalities are small compared to global link fan-in.

use rill_store::{ColumnKind, Snapshot};
use rill_types::{ColumnIdx, CommitChanges, LinkPath, RowIdx, TableIdx};

/// Bound on traversal depth. Link graphs may contain cycles; hitting the
/// bound yields "no change detected" on that path, which is safe because a
/// real modification also fires through the direct-change rule on its own
/// table.
pub(crate) const MAX_LINK_DEPTH: usize = 16;

/// Every table reached by any prefix of any watched path, deduplicated.
pub(crate) fn watched_tables(
    snapshot: &Snapshot,
    root: TableIdx,
    paths: &[LinkPath],
) -> Vec<TableIdx> {
    let mut tables = Vec::new();
    for path in paths {
        let mut current = root;
        for &column in path {
            let Some(target) = snapshot.link_target(current, column) else {
                break;
            };
            if !tables.contains(&target) {
                tables.push(target);
            }
            current = target;
        }
    }
    tables
}

/// Whether following `path` from `row` (starting at `position`) reaches a
/// row modified in this commit.
pub(crate) fn check_path(
    snapshot: &Snapshot,
    table: TableIdx,
    row: RowIdx,
    path: &[ColumnIdx],
    position: usize,
    commit: &CommitChanges,
) -> bool {
    if position >= path.len() || position >= MAX_LINK_DEPTH {
        return false;
    }
    let column = path[position];
    let Some(target) = snapshot.link_target(table, column) else {
        return false;
    };
    let target_changes = commit.for_table(target);
    if target_changes.is_none() && position + 1 == path.len() {
        // Nothing at the frontier can have changed.
        return false;
    }
    match snapshot.column_kind(table, column) {
        Some(ColumnKind::Link { .. }) => {
            let Some(dst) = snapshot.get_link(table, column, row) else {
                return false;
            };
            let dst = target_changes.map_or(dst, |c| c.map_move(dst));
            if target_changes.is_some_and(|c| c.changed.contains(&dst)) {
                return true;
            }
            check_path(snapshot, target, dst, path, position + 1, commit)
        }
        Some(ColumnKind::LinkList { .. }) => {
            for &linked in snapshot.get_link_list(table, column, row) {
                let dst = target_changes.map_or(linked, |c| c.map_move(linked));
                if target_changes.is_some_and(|c| c.changed.contains(&dst)) {
                    return true;
                }
                if check_path(snapshot, target, dst, path, position + 1, commit) {
                    return true;
                }
            }
            false
        }
        _ => false,
    }
}

/// Whether any watched path from `row` reaches a modified row.
pub(crate) fn row_reaches_change(
    snapshot: &Snapshot,
    table: TableIdx,
    row: RowIdx,
    paths: &[LinkPath],
    commit: &CommitChanges,
) -> bool {
    paths
        .iter()
        .any(|path| check_path(snapshot, table, row, path, 0, commit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_store::{Cell, Engine, EngineOptions, TableSchema};
    use rill_types::TableChanges;
    use std::sync::Arc;

    struct Fixture {
        engine: Arc<Engine>,
        people: TableIdx,
        teams: TableIdx,
        orgs: TableIdx,
    }

    // orgs --link--> teams --link/link-list--> people
    fn fixture() -> Fixture {
        let engine = Engine::new(EngineOptions::default());
        let mut txn = engine.write();
        let people = txn.create_table(TableSchema::new("people", vec![ColumnKind::Value]));
        let teams = txn.create_table(TableSchema::new(
            "teams",
            vec![
                ColumnKind::Link { target: people },
                ColumnKind::LinkList { target: people },
            ],
        ));
        let orgs = txn.create_table(TableSchema::new(
            "orgs",
            vec![ColumnKind::Link { target: teams }],
        ));
        txn.commit();

        let mut txn = engine.write();
        let alice = txn.insert(people, vec![Cell::Int(1)]);
        let bob = txn.insert(people, vec![Cell::Int(2)]);
        let team = txn.insert(
            teams,
            vec![Cell::Link(Some(alice)), Cell::LinkList(vec![alice, bob])],
        );
        txn.insert(orgs, vec![Cell::Link(Some(team))]);
        txn.commit();

        Fixture {
            engine,
            people,
            teams,
            orgs,
        }
    }

    fn changed_commit(table: TableIdx, row: RowIdx, table_count: usize) -> CommitChanges {
        let mut tables = vec![TableChanges::default(); table_count];
        tables[table.index()].changed.insert(row);
        CommitChanges::new(tables)
    }

    #[test]
    fn single_link_hit_is_detected() {
        let f = fixture();
        let snap = f.engine.snapshot();
        let commit = changed_commit(f.people, RowIdx::new(0), 3);
        assert!(check_path(
            &snap,
            f.teams,
            RowIdx::new(0),
            &[ColumnIdx::new(0)],
            0,
            &commit
        ));
    }

    #[test]
    fn link_list_hit_is_detected() {
        let f = fixture();
        let snap = f.engine.snapshot();
        // Bob is only reachable through the link list, not the single link.
        let commit = changed_commit(f.people, RowIdx::new(1), 3);
        assert!(!check_path(
            &snap,
            f.teams,
            RowIdx::new(0),
            &[ColumnIdx::new(0)],
            0,
            &commit
        ));
        assert!(check_path(
            &snap,
            f.teams,
            RowIdx::new(0),
            &[ColumnIdx::new(1)],
            0,
            &commit
        ));
    }

    #[test]
    fn two_step_path_recurses_through_intermediate_table() {
        let f = fixture();
        let snap = f.engine.snapshot();
        let commit = changed_commit(f.people, RowIdx::new(0), 3);
        let path = vec![ColumnIdx::new(0), ColumnIdx::new(0)];
        assert!(check_path(&snap, f.orgs, RowIdx::new(0), &path, 0, &commit));
    }

    #[test]
    fn untouched_frontier_short_circuits() {
        let f = fixture();
        let snap = f.engine.snapshot();
        // Summary covers no tables at all: the final step cannot match.
        let commit = CommitChanges::empty();
        assert!(!check_path(
            &snap,
            f.teams,
            RowIdx::new(0),
            &[ColumnIdx::new(0)],
            0,
            &commit
        ));
    }

    #[test]
    fn moved_link_target_is_resolved_through_move_map() {
        let f = fixture();
        let snap = f.engine.snapshot();
        // The linked row 0 was relocated to index 5 and modified there.
        let mut tables = vec![TableChanges::default(); 3];
        tables[f.people.index()]
            .moves
            .insert(RowIdx::new(0), RowIdx::new(5));
        tables[f.people.index()].changed.insert(RowIdx::new(5));
        let commit = CommitChanges::new(tables);
        assert!(check_path(
            &snap,
            f.teams,
            RowIdx::new(0),
            &[ColumnIdx::new(0)],
            0,
            &commit
        ));
    }

    #[test]
    fn watched_tables_collects_every_prefix_terminal() {
        let f = fixture();
        let snap = f.engine.snapshot();
        let paths = vec![
            vec![ColumnIdx::new(0), ColumnIdx::new(0)],
            vec![ColumnIdx::new(0), ColumnIdx::new(1)],
        ];
        let tables = watched_tables(&snap, f.orgs, &paths);
        assert!(tables.contains(&f.teams));
        assert!(tables.contains(&f.people));
        assert_eq!(tables.len(), 2, "duplicates must be collapsed");
    }

    #[test]
    fn value_column_in_a_path_terminates_the_walk() {
        let f = fixture();
        let snap = f.engine.snapshot();
        let commit = changed_commit(f.people, RowIdx::new(0), 3);
        assert!(!check_path(
            &snap,
            f.people,
            RowIdx::new(0),
            &[ColumnIdx::new(0)],
            0,
            &commit
        ));
    }

    #[test]
    fn row_reaches_change_unions_paths() {
        let f = fixture();
        let snap = f.engine.snapshot();
        let commit = changed_commit(f.people, RowIdx::new(1), 3);
        let paths = vec![vec![ColumnIdx::new(0)], vec![ColumnIdx::new(1)]];
        assert!(row_reaches_change(
            &snap,
            f.teams,
            RowIdx::new(0),
            &paths,
            &commit
        ));
        assert!(!row_reaches_change(
            &snap,
            f.teams,
            RowIdx::new(0),
            &paths[..1],
            &commit
        ));
    }
}
