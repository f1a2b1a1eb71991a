//! The user-facing live result handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rill_store::{Engine, QuerySpec, View};
use rill_types::{RowIdx, TableVersion};

/// A registered query's user-facing result set.
///
/// Owned by the client on the thread that created it; the background
/// machinery holds only a weak reference, so dropping the handle ends the
/// live query. Delivery installs each new view here after the owning thread
/// has advanced to the matching snapshot version.
pub struct LiveResults {
    engine: Arc<Engine>,
    spec: QuerySpec,
    view: Mutex<Option<View>>,
    wants_background_updates: AtomicBool,
}

impl LiveResults {
    #[must_use]
    pub fn new(engine: Arc<Engine>, spec: QuerySpec) -> Arc<Self> {
        Arc::new(Self {
            engine,
            spec,
            view: Mutex::new(None),
            wants_background_updates: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    #[must_use]
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// Whether any view has been delivered yet.
    #[must_use]
    pub fn has_result(&self) -> bool {
        self.view.lock().is_some()
    }

    /// Row indices of the installed view, in delivery order.
    #[must_use]
    pub fn result_rows(&self) -> Vec<RowIdx> {
        self.view
            .lock()
            .as_ref()
            .map(|v| v.rows().to_vec())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn result_len(&self) -> usize {
        self.view.lock().as_ref().map_or(0, View::len)
    }

    /// Table version of the installed view.
    #[must_use]
    pub fn result_version(&self) -> Option<TableVersion> {
        self.view.lock().as_ref().map(View::outside_version)
    }

    /// Opt out of background refreshes while no observers are registered.
    /// The background evaluator skips queries whose target neither has
    /// observers nor wants pushed updates.
    pub fn set_wants_background_updates(&self, wants: bool) {
        self.wants_background_updates
            .store(wants, Ordering::Relaxed);
    }

    #[must_use]
    pub fn wants_background_updates(&self) -> bool {
        self.wants_background_updates.load(Ordering::Relaxed)
    }

    pub(crate) fn install(&self, view: View) {
        *self.view.lock() = Some(view);
    }
}

impl std::fmt::Debug for LiveResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveResults")
            .field("spec", &self.spec)
            .field("has_result", &self.has_result())
            .finish_non_exhaustive()
    }
}
