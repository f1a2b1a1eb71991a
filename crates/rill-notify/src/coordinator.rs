//! The commit-notification pump.
//!
//! One background worker thread owns a pinned background snapshot and, on
//! every nudge, advances it one commit at a time, running each registered
//! live query against that commit's change summary and preparing handovers.
//! Delivery happens on the owning thread through
//! [`Coordinator::deliver_pending`]. Processing commits one by one is what
//! serializes RUN → HANDOVER → DELIVER per query and keeps changesets in
//! commit order.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use rill_error::NotifyError;
use rill_store::{Engine, Snapshot};
use rill_types::CommitChanges;

use crate::live_query::LiveQuery;
use crate::results::LiveResults;

enum WorkerMsg {
    Pump,
    Shutdown,
}

struct Entry {
    query: Arc<LiveQuery>,
    /// Background failure captured by the worker, consumed by the next
    /// delivery pass.
    pending_error: Option<NotifyError>,
}

struct CoordinatorShared {
    engine: Arc<Engine>,
    entries: Mutex<Vec<Entry>>,
    /// Nudges sent but not yet fully processed by the worker.
    outstanding: Mutex<u64>,
    drained: Condvar,
    sender: mpsc::Sender<WorkerMsg>,
}

impl CoordinatorShared {
    fn nudge(&self) {
        *self.outstanding.lock() += 1;
        // A send can only fail after shutdown; the counter is balanced
        // below either way.
        if self.sender.send(WorkerMsg::Pump).is_err() {
            self.finish_one();
        }
    }

    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }
}

/// Schedules background evaluation for registered live queries.
pub struct Coordinator {
    shared: Arc<CoordinatorShared>,
    worker: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Spawn the worker thread for `engine`.
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(CoordinatorShared {
            engine,
            entries: Mutex::new(Vec::new()),
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            sender,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("rill-notify-worker".into())
            .spawn(move || worker_loop(&worker_shared, &receiver))
            .expect("spawn notification worker thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Register a live result handle; the first result is computed
    /// promptly in the background. Call on the thread owning `results`.
    #[must_use]
    pub fn register(&self, results: &Arc<LiveResults>) -> Arc<LiveQuery> {
        assert!(
            Arc::ptr_eq(results.engine(), &self.shared.engine),
            "results belong to a different engine"
        );
        let snapshot = self.shared.engine.snapshot();
        let query = LiveQuery::new(results, &snapshot);
        // Weak so the hook does not cycle back through the registry.
        let wake_shared = Arc::downgrade(&self.shared);
        query.set_wake_hook(Box::new(move || {
            if let Some(shared) = wake_shared.upgrade() {
                shared.nudge();
            }
        }));
        self.shared.entries.lock().push(Entry {
            query: Arc::clone(&query),
            pending_error: None,
        });
        tracing::debug!("live query registered");
        self.shared.nudge();
        query
    }

    /// Tell the worker a commit happened; it catches its snapshot up one
    /// commit at a time and re-runs every live query per commit.
    pub fn commit_notification(&self) {
        self.shared.nudge();
    }

    /// Block until the worker has processed every nudge sent so far.
    pub fn wait_until_idle(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.drained.wait(&mut outstanding);
        }
    }

    /// Deliver prepared handovers on the calling (owning) thread: advance
    /// the owner snapshot, install views, and invoke observer callbacks.
    ///
    /// Must not be called from within an observer callback.
    pub fn deliver_pending(&self, snapshot: &mut Snapshot) {
        snapshot.advance_to_latest();
        let batch: Vec<(Arc<LiveQuery>, Option<NotifyError>)> = {
            let mut entries = self.shared.entries.lock();
            entries
                .iter_mut()
                .map(|entry| (Arc::clone(&entry.query), entry.pending_error.take()))
                .collect()
        };
        for (query, error) in batch {
            if query.deliver(snapshot, error) {
                query.call_callbacks();
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let _ = self.shared.sender.send(WorkerMsg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("queries", &self.shared.entries.lock().len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &Arc<CoordinatorShared>, receiver: &mpsc::Receiver<WorkerMsg>) {
    let mut snapshot = shared.engine.snapshot();
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMsg::Shutdown => break,
            WorkerMsg::Pump => {}
        }
        prune_dead_queries(shared);

        // Catch up one commit at a time so every query sees every commit's
        // change summary in order.
        loop {
            let latest = shared.engine.current_version();
            if snapshot.current_version() >= latest {
                break;
            }
            let next = snapshot.current_version().next();
            let summary = shared.engine.changes_for(next).unwrap_or_else(|| {
                tracing::warn!(
                    version = %next,
                    "change summary already pruned; treating commit as opaque"
                );
                CommitChanges::empty()
            });
            if !snapshot.advance_to(next) {
                snapshot.advance_to_latest();
            }
            run_cycle(shared, &snapshot, &summary);
        }
        // One more pass with an empty summary picks up queries that have
        // not completed their initial run yet; anything already current is
        // gated out by the unchanged-results check.
        run_cycle(shared, &snapshot, &CommitChanges::empty());

        shared.finish_one();
    }
}

fn prune_dead_queries(shared: &CoordinatorShared) {
    shared.entries.lock().retain(|entry| {
        if entry.query.is_alive() {
            return true;
        }
        entry.query.release_query();
        tracing::debug!("dead live query pruned");
        false
    });
}

fn run_cycle(shared: &CoordinatorShared, snapshot: &Snapshot, summary: &CommitChanges) {
    let queries: Vec<Arc<LiveQuery>> = shared
        .entries
        .lock()
        .iter()
        .map(|entry| Arc::clone(&entry.query))
        .collect();
    for query in queries {
        if !query.is_alive() {
            continue;
        }
        if !query.is_attached() {
            query.attach(snapshot);
        }
        let outcome = query
            .run(snapshot, summary)
            .and_then(|()| query.prepare_handover(snapshot));
        if let Err(error) = outcome {
            tracing::warn!(%error, "background evaluation failed");
            let mut entries = shared.entries.lock();
            if let Some(entry) = entries
                .iter_mut()
                .find(|entry| Arc::ptr_eq(&entry.query, &query))
            {
                entry.pending_error = Some(error);
            }
        }
    }
}
