//! Views (ordered row sets) and their thread-transportable exported form.

use std::cmp::Ordering;

use rill_types::{RowIdx, SnapshotVersion, SortDescriptor, TableIdx, TableVersion};

use crate::snapshot::Snapshot;

/// The ordered row set produced by evaluating a query at one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    table: TableIdx,
    rows: Vec<RowIdx>,
    snapshot_version: SnapshotVersion,
    table_version: TableVersion,
}

impl View {
    pub(crate) fn new(
        table: TableIdx,
        rows: Vec<RowIdx>,
        snapshot_version: SnapshotVersion,
        table_version: TableVersion,
    ) -> Self {
        Self {
            table,
            rows,
            snapshot_version,
            table_version,
        }
    }

    #[must_use]
    pub fn table(&self) -> TableIdx {
        self.table
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn rows(&self) -> &[RowIdx] {
        &self.rows
    }

    /// Row index at position `i`.
    #[must_use]
    pub fn row_index(&self, i: usize) -> RowIdx {
        self.rows[i]
    }

    /// The logical table version this view was computed against.
    #[must_use]
    pub fn outside_version(&self) -> TableVersion {
        self.table_version
    }

    /// The snapshot version this view was computed against.
    #[must_use]
    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    /// Whether the view still reflects the given snapshot.
    #[must_use]
    pub fn is_in_sync(&self, snapshot: &Snapshot) -> bool {
        self.snapshot_version == snapshot.current_version()
            && snapshot.table_version(self.table) == Some(self.table_version)
    }

    /// Sort in place by the descriptor's keys, in declaration order, stable
    /// with respect to the storage order the rows arrived in.
    pub fn sort(&mut self, snapshot: &Snapshot, sort: &SortDescriptor) {
        if sort.is_empty() {
            return;
        }
        let table = self.table;
        self.rows.sort_by(|&a, &b| {
            for key in sort.columns() {
                let va = snapshot.get_value(table, key.column, a);
                let vb = snapshot.get_value(table, key.column, b);
                let ord = if key.ascending {
                    va.cmp(&vb)
                } else {
                    vb.cmp(&va)
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    pub(crate) fn into_exported(self) -> ExportedView {
        ExportedView {
            table: self.table,
            rows: self.rows,
            snapshot_version: self.snapshot_version,
            table_version: self.table_version,
        }
    }
}

/// Thread-transportable form of a view, stamped with the snapshot version
/// it was exported at. Move-only; importing consumes it.
#[derive(Debug)]
pub struct ExportedView {
    table: TableIdx,
    rows: Vec<RowIdx>,
    snapshot_version: SnapshotVersion,
    table_version: TableVersion,
}

impl ExportedView {
    #[must_use]
    pub fn table(&self) -> TableIdx {
        self.table
    }

    #[must_use]
    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    pub(crate) fn into_view(self) -> View {
        View {
            table: self.table,
            rows: self.rows,
            snapshot_version: self.snapshot_version,
            table_version: self.table_version,
        }
    }
}
