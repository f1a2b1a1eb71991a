//! The per-query background evaluation state machine.
//!
//! One [`LiveQuery`] exists per registered live result. The coordinator
//! drives it through attach → run → prepare_handover on the worker thread
//! and deliver → call_callbacks on the owning thread; the LiveQuery itself
//! never schedules anything.
//!
//! Internal state is split by guarding lock:
//!
//! - the *target* mutex guards the weak back-reference to the owning
//!   [`LiveResults`] and the strong engine reference. Critical sections are
//!   a few loads; it is held across DELIVER and the RUN liveness gate.
//! - the *callback* mutex guards the observer list and the invocation
//!   cursor. It is never held across a callback invocation, so callbacks
//!   may re-enter add/remove freely.
//! - the *handover* mutex guards the query/view payloads exchanged between
//!   the two threads and everything versioned that travels with them. The
//!   worker holds it through RUN and HANDOVER, the owner through DELIVER;
//!   the coordinator serializes those phases per query, so it is never
//!   contended for long.
//!
//! Lock order where several are taken: target, then handover, then
//! callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rill_error::{NotifyError, Result};
use rill_store::{Engine, ExportedQuery, ExportedView, Query, Snapshot, View};
use rill_types::{
    CommitChanges, LinkPath, ObserverToken, PositionChange, RowIdx, SnapshotVersion,
    SortDescriptor, TableVersion,
};

use crate::diff::{calculate_changes, results_did_change};
use crate::results::LiveResults;

/// Observer callback: receives the changeset describing the transition
/// from the previously delivered view, or an empty changeset plus the
/// error that terminated the query.
pub type NotifyCallback = Arc<dyn Fn(&[PositionChange], Option<&NotifyError>) + Send + Sync>;

struct Observer {
    token: ObserverToken,
    callback: NotifyCallback,
    /// View version most recently delivered to this observer; `None` until
    /// its first invocation.
    delivered_version: Option<TableVersion>,
    paths: Vec<LinkPath>,
}

struct TargetState {
    target: Weak<LiveResults>,
    /// Strong engine reference held while the target is registered, so the
    /// store outlives in-flight background work.
    engine: Option<Arc<Engine>>,
}

#[derive(Default)]
struct CallbackState {
    observers: Vec<Observer>,
    /// Index of the observer currently being invoked; `None` outside an
    /// invocation sweep. Removals at or before it decrement it so it still
    /// points at the same logical "next".
    cursor: Option<usize>,
    error: Option<NotifyError>,
}

/// The query handle always exists in exactly one of these forms after
/// construction: transportable, or bound to the worker's snapshot.
enum QueryForm {
    Exported(ExportedQuery),
    Attached(Query),
    Released,
}

struct HandoverState {
    query: QueryForm,
    /// Live view between RUN and HANDOVER; absent outside that window.
    view: Option<View>,
    /// Transportable view between HANDOVER and DELIVER; absent otherwise.
    exported_view: Option<ExportedView>,
    /// Snapshot version the exported view is valid for.
    background_version: SnapshotVersion,
    initial_run_complete: bool,
    /// Table version of the last exported view.
    handed_over_version: TableVersion,
    /// Table version of the last view installed into the target.
    delivered_version: Option<TableVersion>,
    /// Rows of the last handed-over view, in delivery order; what the next
    /// RUN compares against.
    previous_rows: Vec<RowIdx>,
    /// Rows of the last *delivered* view; what changesets are computed
    /// against, so undelivered handovers compose instead of stacking.
    baseline_rows: Vec<RowIdx>,
    /// Rows matching `exported_view`, promoted to `baseline_rows` when it
    /// is delivered.
    staged_rows: Vec<RowIdx>,
    /// Changeset from `baseline_rows` to `staged_rows`.
    pending_changes: Vec<PositionChange>,
    /// Changeset of the delivered-but-not-yet-notified view.
    ready_changes: Vec<PositionChange>,
}

/// Background evaluator for one registered live result.
pub struct LiveQuery {
    owner_thread: ThreadId,
    sort: Option<SortDescriptor>,
    target: Mutex<TargetState>,
    callbacks: Mutex<CallbackState>,
    /// Mirror of `!observers.is_empty()`, readable without the callback
    /// mutex from the RUN gate.
    have_observers: AtomicBool,
    handover: Mutex<HandoverState>,
    /// Requests a commit-notification cycle from the coordinator; installed
    /// at registration.
    wake: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl LiveQuery {
    /// Capture the query in exported form, the owning thread, the sort,
    /// and the current snapshot version. Must be called on the thread that
    /// owns `results`.
    #[must_use]
    pub fn new(results: &Arc<LiveResults>, snapshot: &Snapshot) -> Arc<Self> {
        let spec = results.spec();
        Arc::new(Self {
            owner_thread: thread::current().id(),
            sort: spec.sort.clone(),
            target: Mutex::new(TargetState {
                target: Arc::downgrade(results),
                engine: Some(Arc::clone(results.engine())),
            }),
            callbacks: Mutex::new(CallbackState::default()),
            have_observers: AtomicBool::new(false),
            handover: Mutex::new(HandoverState {
                query: QueryForm::Exported(ExportedQuery::from_spec(spec)),
                view: None,
                exported_view: None,
                background_version: snapshot.current_version(),
                initial_run_complete: false,
                handed_over_version: TableVersion::ZERO,
                delivered_version: None,
                previous_rows: Vec::new(),
                baseline_rows: Vec::new(),
                staged_rows: Vec::new(),
                pending_changes: Vec::new(),
                ready_changes: Vec::new(),
            }),
            wake: Mutex::new(None),
        })
    }

    /// Install the hook used to request a commit-notification cycle when
    /// the first observer is added to an idle query.
    pub fn set_wake_hook(&self, hook: Box<dyn Fn() + Send>) {
        *self.wake.lock() = Some(hook);
    }

    /// Whether the target result handle is still registered and alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.target.lock().target.upgrade().is_some()
    }

    /// Clear the target reference. Callable from any thread; subsequent
    /// RUNs short-circuit and no further callback is invoked.
    pub fn unregister(&self) {
        let mut target = self.target.lock();
        target.target = Weak::new();
        target.engine = None;
        tracing::debug!("live query unregistered");
    }

    /// Drop the query handle and any in-flight view payloads. May only be
    /// called once the target is gone.
    pub fn release_query(&self) {
        {
            let mut target = self.target.lock();
            assert!(
                target.target.upgrade().is_none(),
                "release_query requires an unregistered target"
            );
            target.engine = None;
        }
        let mut handover = self.handover.lock();
        handover.query = QueryForm::Released;
        handover.view = None;
        handover.exported_view = None;
        tracing::trace!("query released");
    }

    /// Bind the exported query to the worker's snapshot.
    pub fn attach(&self, snapshot: &Snapshot) {
        let mut handover = self.handover.lock();
        match std::mem::replace(&mut handover.query, QueryForm::Released) {
            QueryForm::Exported(exported) => {
                handover.query = QueryForm::Attached(snapshot.import_query(exported));
                tracing::trace!(version = %snapshot.current_version(), "query attached");
            }
            QueryForm::Attached(_) => panic!("attach called while already attached"),
            QueryForm::Released => panic!("attach called after release_query"),
        }
    }

    /// Export the attached query back to its transportable form.
    pub fn detach(&self, snapshot: &Snapshot) {
        let mut handover = self.handover.lock();
        assert!(handover.view.is_none(), "detach requires no live view");
        match std::mem::replace(&mut handover.query, QueryForm::Released) {
            QueryForm::Attached(query) => {
                handover.query = QueryForm::Exported(snapshot.export_query(query));
                tracing::trace!("query detached");
            }
            QueryForm::Exported(_) => panic!("detach called while not attached"),
            QueryForm::Released => panic!("detach called after release_query"),
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        matches!(self.handover.lock().query, QueryForm::Attached(_))
    }

    /// Re-evaluate the query against the bound snapshot (worker thread).
    ///
    /// Skips entirely when the target is gone, or when nobody would see the
    /// result (no observers and the target opted out of background
    /// refreshes). Produces a view for handover only when
    /// [`results_did_change`] says the outcome differs from the last
    /// handed-over one.
    ///
    /// # Errors
    ///
    /// Propagates [`NotifyError::QueryExecution`] from evaluation; the
    /// coordinator carries it into the next DELIVER.
    pub fn run(&self, snapshot: &Snapshot, commit: &CommitChanges) -> Result<()> {
        {
            let target = self.target.lock();
            let Some(results) = target.target.upgrade() else {
                return Ok(());
            };
            if !self.have_observers.load(Ordering::Relaxed) && !results.wants_background_updates()
            {
                return Ok(());
            }
        }

        let mut handover = self.handover.lock();
        assert!(
            handover.view.is_none(),
            "prepare_handover must consume the previous view before the next run"
        );
        let mut view = match &handover.query {
            QueryForm::Attached(query) => query.find_all(snapshot)?,
            // Unregistered concurrently; the cycle is already moot.
            _ => return Ok(()),
        };
        if let Some(sort) = &self.sort {
            view.sort(snapshot, sort);
        }

        let watched = self.watched_paths();
        let table = view.table();
        if handover.initial_run_complete {
            let changed = results_did_change(
                snapshot,
                table,
                view.rows(),
                &handover.previous_rows,
                &watched,
                commit,
            );
            if !changed && handover.exported_view.is_none() {
                // Keep the stored row sets in the current index space so
                // later commits compare against fresh indices.
                handover.previous_rows = view.rows().to_vec();
                handover.baseline_rows = handover.previous_rows.clone();
                tracing::trace!(version = %snapshot.current_version(), "results unchanged");
                return Ok(());
            }
            // Results changed, or an undelivered handover must be rebuilt
            // so its payload stays importable at the new snapshot version.
            handover.pending_changes = calculate_changes(
                snapshot,
                table,
                &handover.baseline_rows,
                view.rows(),
                &watched,
                commit,
            );
        }
        handover.previous_rows = view.rows().to_vec();
        handover.view = Some(view);
        tracing::debug!(
            version = %snapshot.current_version(),
            rows = handover.previous_rows.len(),
            changes = handover.pending_changes.len(),
            "run produced a new view"
        );
        Ok(())
    }

    /// Export the view produced by the last RUN (worker thread, still on
    /// the background snapshot). Records the snapshot version either way;
    /// without a view there is nothing to hand over and the call is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Propagates [`NotifyError::HandoverExport`]; the coordinator carries
    /// it into the next DELIVER.
    pub fn prepare_handover(&self, snapshot: &Snapshot) -> Result<()> {
        let mut handover = self.handover.lock();
        handover.background_version = snapshot.current_version();
        let Some(view) = handover.view.take() else {
            return Ok(());
        };
        debug_assert!(view.is_in_sync(snapshot));
        handover.initial_run_complete = true;
        handover.handed_over_version = view.outside_version();
        handover.staged_rows = handover.previous_rows.clone();
        // The worker's view handle is dropped here either way: keeping it
        // attached would pin snapshot resources across advances.
        handover.exported_view = Some(snapshot.export_view(view)?);
        tracing::debug!(
            version = %handover.background_version,
            table_version = %handover.handed_over_version,
            "view exported for handover"
        );
        Ok(())
    }

    /// Import and install the handed-over view (owning thread, after the
    /// owner snapshot advanced to the recorded background version).
    ///
    /// Returns whether observers need calling. Wrong thread, dead target,
    /// a delivery racing ahead of the first RUN, and version mismatches
    /// all return `false`; the previously installed view stays valid and
    /// the next cycle retries.
    pub fn deliver(&self, snapshot: &Snapshot, error: Option<NotifyError>) -> bool {
        if thread::current().id() != self.owner_thread {
            return false;
        }
        let target = self.target.lock();
        let Some(results) = target.target.upgrade() else {
            // Destroyed while the background work was in flight.
            return false;
        };

        let mut handover = self.handover.lock();
        if let Some(error) = error {
            tracing::warn!(%error, "recording background error for observers");
            self.callbacks.lock().error = Some(error);
            return self.have_observers.load(Ordering::Relaxed);
        }
        if !handover.initial_run_complete {
            // A delivery raced ahead of the first RUN.
            return false;
        }
        if handover.background_version != snapshot.current_version() {
            tracing::debug!(
                recorded = %handover.background_version,
                owner = %snapshot.current_version(),
                "snapshot version mismatch; delivery deferred"
            );
            return false;
        }
        if let Some(exported) = handover.exported_view.take() {
            match snapshot.import_view(exported) {
                Ok(view) => {
                    results.install(view);
                    handover.delivered_version = Some(handover.handed_over_version);
                    handover.baseline_rows = std::mem::take(&mut handover.staged_rows);
                    handover.ready_changes = std::mem::take(&mut handover.pending_changes);
                    tracing::debug!(
                        version = %handover.background_version,
                        table_version = %handover.handed_over_version,
                        "view delivered"
                    );
                }
                Err(error) => {
                    tracing::warn!(%error, "handover import failed");
                    self.callbacks.lock().error = Some(error);
                    return self.have_observers.load(Ordering::Relaxed);
                }
            }
        }
        self.have_observers.load(Ordering::Relaxed)
    }

    /// Invoke every observer that has not yet seen the delivered view
    /// version (or every observer, when an error is pending). Runs on the
    /// owning thread; the callback mutex is released around each
    /// invocation, so callbacks may add or remove observers. After an
    /// error has been delivered the observer list is dropped for good.
    pub fn call_callbacks(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner_thread,
            "call_callbacks must run on the owning thread"
        );
        let (changes, delivered) = {
            let mut handover = self.handover.lock();
            (
                std::mem::take(&mut handover.ready_changes),
                handover.delivered_version,
            )
        };
        let error = self.callbacks.lock().error.clone();
        let payload: &[PositionChange] = if error.is_some() { &[] } else { &changes };
        while let Some(callback) = self.next_callback(delivered, error.is_some()) {
            callback(payload, error.as_ref());
        }
        if error.is_some() {
            let mut callbacks = self.callbacks.lock();
            callbacks.observers.clear();
            callbacks.cursor = None;
            self.have_observers.store(false, Ordering::Relaxed);
            tracing::debug!("observers flushed after error");
        }
    }

    fn next_callback(
        &self,
        delivered: Option<TableVersion>,
        errored: bool,
    ) -> Option<NotifyCallback> {
        let mut callbacks = self.callbacks.lock();
        let mut index = callbacks.cursor.map_or(0, |cursor| cursor + 1);
        while index < callbacks.observers.len() {
            let matches = {
                let observer = &callbacks.observers[index];
                errored || observer.delivered_version != delivered
            };
            if matches {
                let observer = &mut callbacks.observers[index];
                observer.delivered_version = delivered;
                let callback = Arc::clone(&observer.callback);
                callbacks.cursor = Some(index);
                return Some(callback);
            }
            index += 1;
        }
        callbacks.cursor = None;
        None
    }

    /// Register an observer watching only the query's own table.
    pub fn add_observer(
        &self,
        callback: impl Fn(&[PositionChange], Option<&NotifyError>) + Send + Sync + 'static,
    ) -> ObserverToken {
        self.add_observer_watching(Vec::new(), callback)
    }

    /// Register an observer that additionally watches the given link-column
    /// paths for indirect modifications. Callable from any thread; returns
    /// a token strictly greater than every currently registered one.
    pub fn add_observer_watching(
        &self,
        paths: Vec<LinkPath>,
        callback: impl Fn(&[PositionChange], Option<&NotifyError>) + Send + Sync + 'static,
    ) -> ObserverToken {
        let (token, should_wake) = {
            let mut callbacks = self.callbacks.lock();
            let token = next_token(&callbacks.observers);
            callbacks.observers.push(Observer {
                token,
                callback: Arc::new(callback),
                delivered_version: None,
                paths,
            });
            self.have_observers.store(true, Ordering::Relaxed);
            // No need to wake the coordinator mid-sweep; the cursor will
            // reach the new observer on its own.
            (token, callbacks.cursor.is_none())
        };
        if should_wake {
            if let Some(wake) = self.wake.lock().as_ref() {
                wake();
            }
        }
        tracing::debug!(%token, "observer added");
        token
    }

    /// Remove an observer. Unknown tokens are tolerated only once an error
    /// has flushed the list.
    pub fn remove_observer(&self, token: ObserverToken) {
        let removed = {
            let mut callbacks = self.callbacks.lock();
            let position = callbacks
                .observers
                .iter()
                .position(|observer| observer.token == token);
            assert!(
                position.is_some() || callbacks.error.is_some(),
                "unknown observer token {token}"
            );
            let Some(position) = position else {
                return;
            };
            if let Some(cursor) = callbacks.cursor {
                if cursor >= position {
                    callbacks.cursor = cursor.checked_sub(1);
                }
            }
            let observer = callbacks.observers.remove(position);
            self.have_observers
                .store(!callbacks.observers.is_empty(), Ordering::Relaxed);
            observer
        };
        // The callback may own arbitrary state; drop it outside the lock.
        drop(removed);
        tracing::debug!(%token, "observer removed");
    }

    fn watched_paths(&self) -> Vec<LinkPath> {
        let callbacks = self.callbacks.lock();
        let mut paths: Vec<LinkPath> = callbacks
            .observers
            .iter()
            .flat_map(|observer| observer.paths.iter().cloned())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

fn next_token(observers: &[Observer]) -> ObserverToken {
    observers
        .iter()
        .map(|observer| observer.token.next())
        .max()
        .unwrap_or(ObserverToken::ZERO)
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("owner_thread", &self.owner_thread)
            .field("sort", &self.sort)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}
