//! Error taxonomy for the live-query notification pipeline.
//!
//! Only failures that reach observer callbacks get a variant here: query
//! re-execution failures and handover export/import failures. Everything
//! else is handled locally — calling an owner-thread-only entry point from
//! the wrong thread is a programmer error and panics, and work arriving for
//! an unregistered target is silently dropped.

use thiserror::Error;

/// Failure surfaced to observers of a live query.
///
/// Cloneable by design: one captured error is handed to every registered
/// observer before the observer list is flushed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// Query re-evaluation failed on the background snapshot.
    #[error("query execution failed: {detail}")]
    QueryExecution { detail: String },

    /// Exporting the freshly computed view into a transportable payload
    /// failed on the worker thread.
    #[error("view handover export failed: {detail}")]
    HandoverExport { detail: String },

    /// Importing a handed-over view into the owner snapshot failed.
    #[error("view handover import failed: {detail}")]
    HandoverImport { detail: String },
}

impl NotifyError {
    /// Create a query execution error.
    pub fn query_execution(detail: impl Into<String>) -> Self {
        Self::QueryExecution {
            detail: detail.into(),
        }
    }

    /// Create a handover export error.
    pub fn handover_export(detail: impl Into<String>) -> Self {
        Self::HandoverExport {
            detail: detail.into(),
        }
    }

    /// Create a handover import error.
    pub fn handover_import(detail: impl Into<String>) -> Self {
        Self::HandoverImport {
            detail: detail.into(),
        }
    }

    /// Whether this error arose while moving a payload across threads.
    #[must_use]
    pub const fn is_handover(&self) -> bool {
        matches!(
            self,
            Self::HandoverExport { .. } | Self::HandoverImport { .. }
        )
    }
}

/// Result type alias using [`NotifyError`].
pub type Result<T> = std::result::Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(
            NotifyError::query_execution("table t#9 out of range").to_string(),
            "query execution failed: table t#9 out of range"
        );
        assert_eq!(
            NotifyError::handover_export("view out of sync").to_string(),
            "view handover export failed: view out of sync"
        );
        assert_eq!(
            NotifyError::handover_import("stamped v#3, snapshot at v#4").to_string(),
            "view handover import failed: stamped v#3, snapshot at v#4"
        );
    }

    #[test]
    fn handover_classification() {
        assert!(NotifyError::handover_export("x").is_handover());
        assert!(NotifyError::handover_import("x").is_handover());
        assert!(!NotifyError::query_execution("x").is_handover());
    }

    #[test]
    fn clones_compare_equal() {
        let err = NotifyError::handover_import("mismatch");
        assert_eq!(err.clone(), err);
    }
}
