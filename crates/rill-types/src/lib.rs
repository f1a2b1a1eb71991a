//! Shared identifiers and plain data types for the RillDB live-query layer.
//!
//! Everything here is inert data: version counters, table/column/row
//! ordinals, sort descriptors, changeset entries, and the per-commit change
//! summaries the coordinator hands to background query evaluation. The
//! behavior lives in `rill-store` (the snapshot provider) and `rill-notify`
//! (the live-query core).

use std::collections::{HashMap, HashSet};
use std::fmt;

/// Monotone identifier of a committed database snapshot.
///
/// Every commit produces the next version; a snapshot handle is pinned to
/// exactly one of them. Handover payloads are stamped with the version they
/// were produced against and may only be imported at that same version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SnapshotVersion(u64);

impl SnapshotVersion {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v#{}", self.get())
    }
}

/// Logical per-table version a view was computed against.
///
/// Bumped once per commit that touches the table. Observer delivery is
/// gated on this: an observer is invoked at most once per delivered table
/// version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableVersion(u64);

impl TableVersion {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tv#{}", self.get())
    }
}

/// Table ordinal within the engine.
///
/// Also indexes the per-commit change summary vector; ordinals beyond that
/// vector mean "no modifications recorded for the table".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableIdx(u32);

impl TableIdx {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TableIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t#{}", self.get())
    }
}

/// Column ordinal within a table (0-based).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ColumnIdx(u32);

impl ColumnIdx {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ColumnIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c#{}", self.get())
    }
}

/// Row position within a table's storage.
///
/// Not a stable identity across commits: deleting a row relocates the last
/// row into the hole, and the commit's move map records the relocation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RowIdx(u64);

impl RowIdx {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u64)
    }
}

impl fmt::Display for RowIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r#{}", self.get())
    }
}

/// Opaque handle returned by observer registration, used for removal.
///
/// Monotone within one live query: a fresh token is strictly greater than
/// every token currently registered there.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ObserverToken(u64);

impl ObserverToken {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for ObserverToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs#{}", self.get())
    }
}

/// One sort key: a column and a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SortColumn {
    pub column: ColumnIdx,
    pub ascending: bool,
}

impl SortColumn {
    #[inline]
    pub const fn asc(column: ColumnIdx) -> Self {
        Self {
            column,
            ascending: true,
        }
    }

    #[inline]
    pub const fn desc(column: ColumnIdx) -> Self {
        Self {
            column,
            ascending: false,
        }
    }
}

/// Immutable sort specification: keys applied in declaration order, stable
/// with respect to the underlying storage order.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct SortDescriptor {
    columns: Vec<SortColumn>,
}

impl SortDescriptor {
    #[must_use]
    pub fn new(columns: Vec<SortColumn>) -> Self {
        Self { columns }
    }

    /// Single ascending key, the common case.
    #[must_use]
    pub fn ascending(column: ColumnIdx) -> Self {
        Self {
            columns: vec![SortColumn::asc(column)],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[SortColumn] {
        &self.columns
    }
}

/// A dependency path: a sequence of link-valued column ordinals rooted at
/// the query's table. An observer declaring paths is notified when any row
/// reachable through them is modified.
pub type LinkPath = Vec<ColumnIdx>;

/// One changeset entry: how a single result row transitioned between two
/// delivered views. `None` on a side means the row is absent there.
///
/// - `old` absent: insertion at `new`.
/// - `new` absent: deletion of `old`.
/// - equal sides: in-place modification.
/// - differing sides: move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PositionChange {
    pub old: Option<usize>,
    pub new: Option<usize>,
}

impl PositionChange {
    #[inline]
    pub const fn inserted(new: usize) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    #[inline]
    pub const fn deleted(old: usize) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    #[inline]
    pub const fn modified(position: usize) -> Self {
        Self {
            old: Some(position),
            new: Some(position),
        }
    }

    #[inline]
    pub const fn moved(old: usize, new: usize) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    #[must_use]
    pub const fn is_insertion(&self) -> bool {
        self.old.is_none() && self.new.is_some()
    }

    #[must_use]
    pub const fn is_deletion(&self) -> bool {
        self.old.is_some() && self.new.is_none()
    }

    #[must_use]
    pub fn is_modification(&self) -> bool {
        matches!((self.old, self.new), (Some(o), Some(n)) if o == n)
    }

    #[must_use]
    pub fn is_move(&self) -> bool {
        matches!((self.old, self.new), (Some(o), Some(n)) if o != n)
    }
}

impl fmt::Display for PositionChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn side(v: Option<usize>) -> String {
            v.map_or_else(|| "-".to_owned(), |p| p.to_string())
        }
        write!(f, "({}, {})", side(self.old), side(self.new))
    }
}

/// One table's per-commit change record.
///
/// `moves` maps commit-start row index to commit-end row index for rows the
/// writer relocated (compaction after deletes). `changed` holds commit-end
/// indices of rows whose content was modified. `inserted` holds commit-end
/// indices of rows created by this commit; the diff uses it to keep a
/// freshly inserted row from inheriting the identity of a deleted row whose
/// storage slot it reuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableChanges {
    pub moves: HashMap<RowIdx, RowIdx>,
    pub changed: HashSet<RowIdx>,
    pub inserted: HashSet<RowIdx>,
}

impl TableChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.changed.is_empty() && self.inserted.is_empty()
    }

    /// Follow the move map forward: commit-start index to commit-end index.
    /// Identity for rows that did not move.
    #[must_use]
    pub fn map_move(&self, idx: RowIdx) -> RowIdx {
        self.moves.get(&idx).copied().unwrap_or(idx)
    }

    /// Commit-end index to commit-start index, for restoring row identity
    /// when comparing against a pre-commit row set.
    #[must_use]
    pub fn inverse_moves(&self) -> HashMap<RowIdx, RowIdx> {
        self.moves.iter().map(|(&from, &to)| (to, from)).collect()
    }
}

/// Per-commit change summary, indexed by table ordinal.
///
/// The vector may be shorter than the engine's table count; lookups beyond
/// it mean "no modifications recorded for that table".
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitChanges {
    tables: Vec<TableChanges>,
}

impl CommitChanges {
    #[must_use]
    pub fn new(tables: Vec<TableChanges>) -> Self {
        Self { tables }
    }

    /// A summary recording no modifications at all.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn for_table(&self, table: TableIdx) -> Option<&TableChanges> {
        self.tables.get(table.index())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(TableChanges::is_empty)
    }
}
