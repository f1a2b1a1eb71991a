//! The multi-version engine: schema, cells, committed generations, and the
//! single-writer transaction that publishes new ones.
//!
//! Every commit produces a fresh generation (copy-on-write at table
//! granularity) plus the [`CommitChanges`] summary the notification layer
//! consumes. Deleting a row compacts the table by relocating the last row
//! into the hole; the summary's move map is the authoritative record of
//! that relocation, and readers resolving link values within the same
//! commit are expected to map them through it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rill_types::{
    ColumnIdx, CommitChanges, RowIdx, SnapshotVersion, TableChanges, TableIdx, TableVersion,
};

use crate::snapshot::Snapshot;

/// Default bound on the committed-generation chain.
pub const DEFAULT_RETAINED_GENERATIONS: usize = 32;

/// Column type within a table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Plain integer value column.
    Value,
    /// Single link to a row of the target table.
    Link { target: TableIdx },
    /// Ordered list of links to rows of the target table.
    LinkList { target: TableIdx },
}

impl ColumnKind {
    /// The linked table, for either link kind.
    #[must_use]
    pub const fn link_target(self) -> Option<TableIdx> {
        match self {
            Self::Value => None,
            Self::Link { target } | Self::LinkList { target } => Some(target),
        }
    }
}

/// One stored cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Int(i64),
    Link(Option<RowIdx>),
    LinkList(Vec<RowIdx>),
}

impl Cell {
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_link(&self) -> Option<RowIdx> {
        match self {
            Self::Link(v) => *v,
            _ => None,
        }
    }

    #[must_use]
    pub fn as_link_list(&self) -> Option<&[RowIdx]> {
        match self {
            Self::LinkList(v) => Some(v),
            _ => None,
        }
    }

    fn matches(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (Self::Int(_), ColumnKind::Value)
                | (Self::Link(_), ColumnKind::Link { .. })
                | (Self::LinkList(_), ColumnKind::LinkList { .. })
        )
    }
}

/// Table schema: a name and the ordered column kinds.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnKind>,
}

impl TableSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<ColumnKind>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }
}

/// Immutable committed state of one table.
#[derive(Debug)]
pub(crate) struct TableState {
    pub(crate) schema: Arc<TableSchema>,
    pub(crate) rows: Vec<Vec<Cell>>,
    pub(crate) version: TableVersion,
}

/// One committed generation: the full table set at a snapshot version plus
/// the change summary of the commit that produced it.
#[derive(Debug)]
pub(crate) struct Generation {
    pub(crate) version: SnapshotVersion,
    pub(crate) tables: Vec<Arc<TableState>>,
    pub(crate) changes: CommitChanges,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// How many committed generations to retain for lagging readers.
    /// Clamped to at least 1; generations a live snapshot pins are never
    /// pruned regardless of this bound.
    pub retained_generations: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retained_generations: DEFAULT_RETAINED_GENERATIONS,
        }
    }
}

#[derive(Debug)]
struct EngineInner {
    generations: VecDeque<Arc<Generation>>,
    pins: HashMap<SnapshotVersion, usize>,
    retained: usize,
}

impl EngineInner {
    fn latest(&self) -> &Arc<Generation> {
        self.generations
            .back()
            .expect("engine always retains at least one generation")
    }

    fn find(&self, version: SnapshotVersion) -> Option<&Arc<Generation>> {
        self.generations.iter().find(|g| g.version == version)
    }

    fn prune(&mut self) {
        while self.generations.len() > self.retained {
            let front = self
                .generations
                .front()
                .expect("non-empty by loop condition");
            if self.pins.get(&front.version).copied().unwrap_or(0) > 0 {
                break;
            }
            let dropped = self
                .generations
                .pop_front()
                .expect("non-empty by loop condition");
            tracing::trace!(version = %dropped.version, "generation pruned");
        }
    }
}

/// The shared multi-version store. One writer at a time; any number of
/// pinned reader snapshots.
#[derive(Debug)]
pub struct Engine {
    inner: Mutex<EngineInner>,
    write_lock: Mutex<()>,
}

impl Engine {
    /// Create an engine with an empty initial generation at version zero.
    #[must_use]
    pub fn new(options: EngineOptions) -> Arc<Self> {
        let initial = Generation {
            version: SnapshotVersion::ZERO,
            tables: Vec::new(),
            changes: CommitChanges::empty(),
        };
        Arc::new(Self {
            inner: Mutex::new(EngineInner {
                generations: VecDeque::from([Arc::new(initial)]),
                pins: HashMap::new(),
                retained: options.retained_generations.max(1),
            }),
            write_lock: Mutex::new(()),
        })
    }

    /// Latest committed version.
    #[must_use]
    pub fn current_version(&self) -> SnapshotVersion {
        self.inner.lock().latest().version
    }

    /// Change summary of the commit that produced `version`, while that
    /// generation is still retained.
    #[must_use]
    pub fn changes_for(&self, version: SnapshotVersion) -> Option<CommitChanges> {
        self.inner.lock().find(version).map(|g| g.changes.clone())
    }

    /// Pin a read snapshot at the latest committed version.
    #[must_use]
    pub fn snapshot(self: &Arc<Self>) -> Snapshot {
        let generation = self.pin_latest();
        Snapshot::new(Arc::clone(self), generation)
    }

    /// Begin a write transaction. Blocks until the previous writer commits
    /// or is dropped.
    #[must_use]
    pub fn write(&self) -> WriteTransaction<'_> {
        let guard = self.write_lock.lock();
        let (base_version, base_tables) = {
            let inner = self.inner.lock();
            let latest = inner.latest();
            (latest.version, latest.tables.clone())
        };
        WriteTransaction {
            engine: self,
            _guard: guard,
            base_version,
            base_tables,
            new_schemas: Vec::new(),
            edits: HashMap::new(),
        }
    }

    fn inner_pin(
        &self,
        inner: &mut MutexGuard<'_, EngineInner>,
        version: Option<SnapshotVersion>,
    ) -> Arc<Generation> {
        let generation = match version {
            Some(v) => inner
                .find(v)
                .expect("caller checked the generation is retained")
                .clone(),
            None => inner.latest().clone(),
        };
        *inner.pins.entry(generation.version).or_insert(0) += 1;
        generation
    }

    pub(crate) fn pin_version(&self, version: SnapshotVersion) -> Option<Arc<Generation>> {
        let mut inner = self.inner.lock();
        inner.find(version)?;
        Some(self.inner_pin(&mut inner, Some(version)))
    }

    pub(crate) fn pin_latest(&self) -> Arc<Generation> {
        let mut inner = self.inner.lock();
        self.inner_pin(&mut inner, None)
    }

    pub(crate) fn unpin(&self, version: SnapshotVersion) {
        let mut inner = self.inner.lock();
        match inner.pins.get_mut(&version) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                inner.pins.remove(&version);
            }
            None => debug_assert!(false, "unpin without matching pin for {version}"),
        }
        inner.prune();
    }
}

/// Working edits for one table within a transaction.
#[derive(Debug, Default)]
struct TableEdit {
    rows: Vec<Vec<Cell>>,
    moves: HashMap<RowIdx, RowIdx>,
    changed: std::collections::HashSet<RowIdx>,
    inserted: std::collections::HashSet<RowIdx>,
}

/// Single-writer transaction. Dropping without [`commit`](Self::commit)
/// discards all edits.
pub struct WriteTransaction<'a> {
    engine: &'a Engine,
    _guard: MutexGuard<'a, ()>,
    base_version: SnapshotVersion,
    base_tables: Vec<Arc<TableState>>,
    new_schemas: Vec<Arc<TableSchema>>,
    edits: HashMap<usize, TableEdit>,
}

impl WriteTransaction<'_> {
    fn table_count(&self) -> usize {
        self.base_tables.len() + self.new_schemas.len()
    }

    fn schema(&self, table: TableIdx) -> Arc<TableSchema> {
        let idx = table.index();
        assert!(idx < self.table_count(), "table {table} out of range");
        if idx < self.base_tables.len() {
            Arc::clone(&self.base_tables[idx].schema)
        } else {
            Arc::clone(&self.new_schemas[idx - self.base_tables.len()])
        }
    }

    fn edit_mut(&mut self, table: TableIdx) -> &mut TableEdit {
        let idx = table.index();
        assert!(idx < self.table_count(), "table {table} out of range");
        let base_rows = if idx < self.base_tables.len() {
            Some(&self.base_tables[idx].rows)
        } else {
            None
        };
        self.edits.entry(idx).or_insert_with(|| TableEdit {
            rows: base_rows.cloned().unwrap_or_default(),
            ..TableEdit::default()
        })
    }

    /// Add a table; it becomes visible (empty unless populated in this same
    /// transaction) at commit.
    pub fn create_table(&mut self, schema: TableSchema) -> TableIdx {
        for (i, column) in schema.columns.iter().enumerate() {
            if let Some(target) = column.link_target() {
                assert!(
                    target.index() <= self.table_count(),
                    "column {i} links to unknown table {target}"
                );
            }
        }
        self.new_schemas.push(Arc::new(schema));
        TableIdx::new((self.table_count() - 1) as u32)
    }

    /// Append a row; returns its index.
    pub fn insert(&mut self, table: TableIdx, cells: Vec<Cell>) -> RowIdx {
        let schema = self.schema(table);
        assert_eq!(
            cells.len(),
            schema.columns.len(),
            "row arity does not match schema of {table}"
        );
        for (i, (cell, kind)) in cells.iter().zip(&schema.columns).enumerate() {
            assert!(cell.matches(*kind), "cell {i} does not match column kind");
        }
        let edit = self.edit_mut(table);
        let row = RowIdx::from_index(edit.rows.len());
        edit.rows.push(cells);
        edit.inserted.insert(row);
        row
    }

    /// Overwrite a value cell and record the row as changed.
    pub fn set_value(&mut self, table: TableIdx, column: ColumnIdx, row: RowIdx, value: i64) {
        let schema = self.schema(table);
        assert_eq!(
            schema.columns.get(column.index()),
            Some(&ColumnKind::Value),
            "set_value requires a value column"
        );
        let edit = self.edit_mut(table);
        edit.rows[row.index()][column.index()] = Cell::Int(value);
        if !edit.inserted.contains(&row) {
            edit.changed.insert(row);
        }
    }

    /// Overwrite a single-link cell and record the row as changed.
    pub fn set_link(&mut self, table: TableIdx, column: ColumnIdx, row: RowIdx, dst: Option<RowIdx>) {
        let schema = self.schema(table);
        assert!(
            matches!(
                schema.columns.get(column.index()),
                Some(ColumnKind::Link { .. })
            ),
            "set_link requires a link column"
        );
        let edit = self.edit_mut(table);
        edit.rows[row.index()][column.index()] = Cell::Link(dst);
        if !edit.inserted.contains(&row) {
            edit.changed.insert(row);
        }
    }

    /// Replace a link-list cell and record the row as changed.
    pub fn set_link_list(
        &mut self,
        table: TableIdx,
        column: ColumnIdx,
        row: RowIdx,
        dsts: Vec<RowIdx>,
    ) {
        let schema = self.schema(table);
        assert!(
            matches!(
                schema.columns.get(column.index()),
                Some(ColumnKind::LinkList { .. })
            ),
            "set_link_list requires a link-list column"
        );
        let edit = self.edit_mut(table);
        edit.rows[row.index()][column.index()] = Cell::LinkList(dsts);
        if !edit.inserted.contains(&row) {
            edit.changed.insert(row);
        }
    }

    /// Delete a row, compacting the table by relocating the last row into
    /// the hole. The relocation is recorded in the commit's move map;
    /// inbound link cells are not rewritten, readers resolve them through
    /// the move map.
    pub fn delete(&mut self, table: TableIdx, row: RowIdx) {
        let edit = self.edit_mut(table);
        assert!(row.index() < edit.rows.len(), "row {row} out of range");
        let last = RowIdx::from_index(edit.rows.len() - 1);

        // The deleted row's own bookkeeping disappears with it.
        edit.changed.remove(&row);
        edit.inserted.remove(&row);
        if let Some(origin) = edit
            .moves
            .iter()
            .find_map(|(&from, &to)| (to == row).then_some(from))
        {
            edit.moves.remove(&origin);
        }

        if row == last {
            edit.rows.pop();
            return;
        }
        edit.rows.swap_remove(row.index());

        // Relocate bookkeeping for the row that lived at `last`.
        if edit.changed.remove(&last) {
            edit.changed.insert(row);
        }
        if edit.inserted.remove(&last) {
            // Rows born in this commit are insertions, never moves.
            edit.inserted.insert(row);
        } else if let Some(origin) = edit
            .moves
            .iter()
            .find_map(|(&from, &to)| (to == last).then_some(from))
        {
            edit.moves.insert(origin, row);
        } else {
            edit.moves.insert(last, row);
        }
    }

    /// Current row count of a table as seen by this transaction.
    #[must_use]
    pub fn row_count(&self, table: TableIdx) -> usize {
        let idx = table.index();
        if let Some(edit) = self.edits.get(&idx) {
            return edit.rows.len();
        }
        self.base_tables.get(idx).map_or(0, |t| t.rows.len())
    }

    /// Publish the transaction as the next generation and return its
    /// version.
    pub fn commit(mut self) -> SnapshotVersion {
        let mut inner = self.engine.inner.lock();
        assert_eq!(
            inner.latest().version,
            self.base_version,
            "write transactions are serialized; the base cannot advance"
        );
        let next = self.base_version.next();
        let table_count = self.base_tables.len() + self.new_schemas.len();
        let mut tables = Vec::with_capacity(table_count);
        let mut changes = Vec::with_capacity(table_count);
        for idx in 0..table_count {
            let in_base = idx < self.base_tables.len();
            if let Some(edit) = self.edits.remove(&idx) {
                let schema = if in_base {
                    Arc::clone(&self.base_tables[idx].schema)
                } else {
                    Arc::clone(&self.new_schemas[idx - self.base_tables.len()])
                };
                let version = if in_base {
                    self.base_tables[idx].version.next()
                } else {
                    TableVersion::ZERO
                };
                tables.push(Arc::new(TableState {
                    schema,
                    rows: edit.rows,
                    version,
                }));
                changes.push(TableChanges {
                    moves: edit.moves,
                    changed: edit.changed,
                    inserted: edit.inserted,
                });
            } else if in_base {
                tables.push(Arc::clone(&self.base_tables[idx]));
                changes.push(TableChanges::default());
            } else {
                tables.push(Arc::new(TableState {
                    schema: Arc::clone(&self.new_schemas[idx - self.base_tables.len()]),
                    rows: Vec::new(),
                    version: TableVersion::ZERO,
                }));
                changes.push(TableChanges::default());
            }
        }
        inner.generations.push_back(Arc::new(Generation {
            version: next,
            tables,
            changes: CommitChanges::new(changes),
        }));
        inner.prune();
        tracing::debug!(version = %next, "commit published");
        next
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("base_version", &self.base_version)
            .field("edited_tables", &self.edits.len())
            .field("created_tables", &self.new_schemas.len())
            .finish_non_exhaustive()
    }
}
