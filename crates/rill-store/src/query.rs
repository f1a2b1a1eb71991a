//! Queries and their thread-transportable exported form.

use std::sync::Arc;

use rill_error::{NotifyError, Result};
use rill_types::{RowIdx, SortDescriptor, TableIdx};

use crate::engine::{Cell, Engine};
use crate::snapshot::Snapshot;
use crate::view::View;

/// Row filter evaluated against a row's cells.
pub type RowPredicate = Arc<dyn Fn(&[Cell]) -> bool + Send + Sync>;

/// What a live result is made of: the queried table, the row filter, and an
/// optional sort. Cheap to clone; the predicate is shared.
#[derive(Clone)]
pub struct QuerySpec {
    pub table: TableIdx,
    pub predicate: RowPredicate,
    pub sort: Option<SortDescriptor>,
}

impl QuerySpec {
    #[must_use]
    pub fn new(table: TableIdx, predicate: RowPredicate) -> Self {
        Self {
            table,
            predicate,
            sort: None,
        }
    }

    #[must_use]
    pub fn with_sort(mut self, sort: SortDescriptor) -> Self {
        self.sort = Some(sort);
        self
    }
}

impl std::fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySpec")
            .field("table", &self.table)
            .field("sort", &self.sort)
            .finish_non_exhaustive()
    }
}

/// A query bound to an engine, runnable against that engine's snapshots.
pub struct Query {
    engine: Arc<Engine>,
    table: TableIdx,
    predicate: RowPredicate,
}

impl Query {
    #[must_use]
    pub fn table(&self) -> TableIdx {
        self.table
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub(crate) fn into_exported(self) -> ExportedQuery {
        ExportedQuery {
            table: self.table,
            predicate: self.predicate,
        }
    }

    /// Evaluate against a snapshot of the bound engine, producing the
    /// matching rows in storage order.
    ///
    /// # Errors
    ///
    /// Fails with [`NotifyError::QueryExecution`] when the snapshot belongs
    /// to a different engine or the queried table does not exist there.
    pub fn find_all(&self, snapshot: &Snapshot) -> Result<View> {
        if !Arc::ptr_eq(&self.engine, snapshot.engine()) {
            return Err(NotifyError::query_execution(
                "query is bound to a different engine",
            ));
        }
        let Some(table_version) = snapshot.table_version(self.table) else {
            return Err(NotifyError::query_execution(format!(
                "table {} out of range",
                self.table
            )));
        };
        let rows = (0..snapshot.row_count(self.table))
            .map(RowIdx::from_index)
            .filter(|&row| {
                snapshot
                    .row_cells(self.table, row)
                    .is_some_and(|cells| (self.predicate)(cells))
            })
            .collect();
        Ok(View::new(
            self.table,
            rows,
            snapshot.current_version(),
            table_version,
        ))
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// Thread-transportable form of a query. Move-only: exactly one side owns
/// it at any moment, and importing consumes it.
pub struct ExportedQuery {
    table: TableIdx,
    predicate: RowPredicate,
}

impl ExportedQuery {
    /// Build the transportable form directly from a spec, the way a live
    /// result registers itself before any snapshot is involved.
    #[must_use]
    pub fn from_spec(spec: &QuerySpec) -> Self {
        Self {
            table: spec.table,
            predicate: Arc::clone(&spec.predicate),
        }
    }

    #[must_use]
    pub fn table(&self) -> TableIdx {
        self.table
    }

    pub(crate) fn into_query(self, engine: Arc<Engine>) -> Query {
        Query {
            engine,
            table: self.table,
            predicate: self.predicate,
        }
    }
}

impl std::fmt::Debug for ExportedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedQuery")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ColumnKind, EngineOptions, TableSchema};
    use rill_types::ColumnIdx;

    fn even_spec(table: TableIdx) -> QuerySpec {
        QuerySpec::new(
            table,
            Arc::new(|cells: &[Cell]| cells[0].as_int().is_some_and(|v| v % 2 == 0)),
        )
    }

    #[test]
    fn find_all_filters_in_storage_order() {
        let engine = Engine::new(EngineOptions::default());
        let mut txn = engine.write();
        let table = txn.create_table(TableSchema::new("t", vec![ColumnKind::Value]));
        for v in [1, 2, 3, 4, 5, 6] {
            txn.insert(table, vec![Cell::Int(v)]);
        }
        txn.commit();

        let snap = engine.snapshot();
        let query = snap.import_query(ExportedQuery::from_spec(&even_spec(table)));
        let view = query.find_all(&snap).unwrap();
        assert_eq!(
            view.rows(),
            &[RowIdx::new(1), RowIdx::new(3), RowIdx::new(5)]
        );
        assert!(view.is_in_sync(&snap));
    }

    #[test]
    fn export_import_round_trip_preserves_results() {
        let engine = Engine::new(EngineOptions::default());
        let mut txn = engine.write();
        let table = txn.create_table(TableSchema::new("t", vec![ColumnKind::Value]));
        for v in [2, 4, 7] {
            txn.insert(table, vec![Cell::Int(v)]);
        }
        txn.commit();

        let snap = engine.snapshot();
        let query = snap.import_query(ExportedQuery::from_spec(&even_spec(table)));
        let direct = query.find_all(&snap).unwrap().rows().to_vec();

        // Bounce the query through its exported form and re-run.
        let exported = snap.export_query(query);
        let reimported = snap.import_query(exported);
        let round_tripped = reimported.find_all(&snap).unwrap().rows().to_vec();
        assert_eq!(
            direct, round_tripped,
            "exporting and importing a query must not change its results"
        );
    }

    #[test]
    fn find_all_rejects_unknown_table() {
        let engine = Engine::new(EngineOptions::default());
        let snap = engine.snapshot();
        let spec = QuerySpec::new(TableIdx::new(5), Arc::new(|_: &[Cell]| true));
        let query = snap.import_query(ExportedQuery::from_spec(&spec));
        let err = query.find_all(&snap).unwrap_err();
        assert!(matches!(err, NotifyError::QueryExecution { .. }));
    }

    #[test]
    fn spec_sort_is_carried_not_applied() {
        let engine = Engine::new(EngineOptions::default());
        let mut txn = engine.write();
        let table = txn.create_table(TableSchema::new("t", vec![ColumnKind::Value]));
        txn.commit();
        let spec = even_spec(table).with_sort(SortDescriptor::ascending(ColumnIdx::new(0)));
        assert!(spec.sort.is_some());
        // find_all itself returns storage order; sorting is the caller's step.
        let snap = engine.snapshot();
        let query = snap.import_query(ExportedQuery::from_spec(&spec));
        assert!(query.find_all(&snap).unwrap().rows().is_empty());
    }
}
