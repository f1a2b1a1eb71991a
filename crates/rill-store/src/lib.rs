//! Multi-version in-memory storage engine for the RillDB live-query layer.
//!
//! The engine keeps a chain of immutable committed generations; readers pin
//! one generation through a [`Snapshot`] while a single writer publishes the
//! next one, together with a per-commit change summary (row moves, content
//! changes, insertions per table). Queries and views move between threads
//! only as the move-only [`ExportedQuery`] / [`ExportedView`] payloads,
//! stamped with the snapshot version they are valid for.

pub mod engine;
pub mod query;
pub mod snapshot;
pub mod view;

pub use engine::{Cell, ColumnKind, Engine, EngineOptions, TableSchema, WriteTransaction};
pub use query::{ExportedQuery, Query, QuerySpec, RowPredicate};
pub use snapshot::Snapshot;
pub use view::{ExportedView, View};
