//! Pinned read snapshots and the export/import surface for handover
//! payloads.

use std::sync::Arc;

use rill_error::{NotifyError, Result};
use rill_types::{ColumnIdx, RowIdx, SnapshotVersion, TableIdx, TableVersion};

use crate::engine::{Cell, ColumnKind, Engine, Generation, TableState};
use crate::query::{ExportedQuery, Query};
use crate::view::{ExportedView, View};

/// A pinned point-in-time read position over the engine.
///
/// The pinned generation is retained until the snapshot drops or advances
/// past it. Snapshots are the only place handover payloads are produced and
/// consumed: a payload stamped at one version can only be imported into a
/// snapshot sitting at exactly that version.
#[derive(Debug)]
pub struct Snapshot {
    engine: Arc<Engine>,
    generation: Arc<Generation>,
}

impl Snapshot {
    pub(crate) fn new(engine: Arc<Engine>, generation: Arc<Generation>) -> Self {
        Self { engine, generation }
    }

    /// The version this snapshot is pinned to.
    #[must_use]
    pub fn current_version(&self) -> SnapshotVersion {
        self.generation.version
    }

    /// The engine this snapshot reads from.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Re-pin to `version`. Returns `false` when that generation is no
    /// longer retained (the snapshot stays where it was).
    pub fn advance_to(&mut self, version: SnapshotVersion) -> bool {
        if version == self.generation.version {
            return true;
        }
        let Some(next) = self.engine.pin_version(version) else {
            return false;
        };
        let previous = std::mem::replace(&mut self.generation, next);
        self.engine.unpin(previous.version);
        true
    }

    /// Re-pin to the latest committed version.
    pub fn advance_to_latest(&mut self) {
        let next = self.engine.pin_latest();
        if next.version == self.generation.version {
            self.engine.unpin(next.version);
            return;
        }
        let previous = std::mem::replace(&mut self.generation, next);
        self.engine.unpin(previous.version);
    }

    fn table(&self, table: TableIdx) -> Option<&TableState> {
        self.generation.tables.get(table.index()).map(Arc::as_ref)
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.generation.tables.len()
    }

    #[must_use]
    pub fn row_count(&self, table: TableIdx) -> usize {
        self.table(table).map_or(0, |t| t.rows.len())
    }

    #[must_use]
    pub fn column_count(&self, table: TableIdx) -> usize {
        self.table(table).map_or(0, |t| t.schema.columns.len())
    }

    #[must_use]
    pub fn column_kind(&self, table: TableIdx, column: ColumnIdx) -> Option<ColumnKind> {
        self.table(table)?.schema.columns.get(column.index()).copied()
    }

    /// The linked table of a link or link-list column.
    #[must_use]
    pub fn link_target(&self, table: TableIdx, column: ColumnIdx) -> Option<TableIdx> {
        self.column_kind(table, column)?.link_target()
    }

    /// Logical version of a table at this snapshot.
    #[must_use]
    pub fn table_version(&self, table: TableIdx) -> Option<TableVersion> {
        self.table(table).map(|t| t.version)
    }

    /// All cells of a row, for predicate evaluation.
    #[must_use]
    pub fn row_cells(&self, table: TableIdx, row: RowIdx) -> Option<&[Cell]> {
        self.table(table)?.rows.get(row.index()).map(Vec::as_slice)
    }

    #[must_use]
    pub fn get_value(&self, table: TableIdx, column: ColumnIdx, row: RowIdx) -> Option<i64> {
        self.row_cells(table, row)?.get(column.index())?.as_int()
    }

    /// Resolve a single-link cell. `None` for null links, missing rows, and
    /// non-link columns alike.
    #[must_use]
    pub fn get_link(&self, table: TableIdx, column: ColumnIdx, row: RowIdx) -> Option<RowIdx> {
        self.row_cells(table, row)?.get(column.index())?.as_link()
    }

    /// Resolve a link-list cell; empty for anything that is not one.
    #[must_use]
    pub fn get_link_list(&self, table: TableIdx, column: ColumnIdx, row: RowIdx) -> &[RowIdx] {
        self.row_cells(table, row)
            .and_then(|cells| cells.get(column.index()))
            .and_then(Cell::as_link_list)
            .unwrap_or(&[])
    }

    /// Export a query into a thread-transportable payload, consuming it.
    #[must_use]
    pub fn export_query(&self, query: Query) -> ExportedQuery {
        assert!(
            Arc::ptr_eq(&self.engine, query.engine()),
            "query belongs to a different engine"
        );
        query.into_exported()
    }

    /// Import a query payload, binding it to this snapshot's engine.
    #[must_use]
    pub fn import_query(&self, exported: ExportedQuery) -> Query {
        exported.into_query(Arc::clone(&self.engine))
    }

    /// Export a view into a thread-transportable payload, consuming it.
    ///
    /// # Errors
    ///
    /// Fails with [`NotifyError::HandoverExport`] when the view is out of
    /// sync with this snapshot.
    pub fn export_view(&self, view: View) -> Result<ExportedView> {
        if !view.is_in_sync(self) {
            return Err(NotifyError::handover_export(format!(
                "view computed at {} cannot be exported from snapshot at {}",
                view.snapshot_version(),
                self.current_version()
            )));
        }
        Ok(view.into_exported())
    }

    /// Import a view payload produced at exactly this snapshot's version.
    ///
    /// # Errors
    ///
    /// Fails with [`NotifyError::HandoverImport`] on a version mismatch.
    pub fn import_view(&self, exported: ExportedView) -> Result<View> {
        if exported.snapshot_version() != self.current_version() {
            return Err(NotifyError::handover_import(format!(
                "payload stamped {} but snapshot is at {}",
                exported.snapshot_version(),
                self.current_version()
            )));
        }
        Ok(exported.into_view())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.engine.unpin(self.generation.version);
    }
}
