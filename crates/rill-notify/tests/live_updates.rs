//! End-to-end live-update scenarios driven through the coordinator's real
//! background worker thread.

use std::sync::Arc;

use parking_lot::Mutex;
use rill_notify::{Coordinator, LiveQuery, LiveResults};
use rill_store::{Cell, ColumnKind, Engine, EngineOptions, QuerySpec, Snapshot, TableSchema};
use rill_types::{ColumnIdx, ObserverToken, PositionChange, RowIdx, SortDescriptor, TableIdx};

type Log = Arc<Mutex<Vec<(Vec<PositionChange>, Option<String>)>>>;

struct Harness {
    engine: Arc<Engine>,
    table: TableIdx,
    results: Arc<LiveResults>,
    query: Arc<LiveQuery>,
    coordinator: Coordinator,
    owner: Snapshot,
}

impl Harness {
    /// Sorted all-rows query over a fresh two-column table seeded with
    /// `keys` in column 0.
    fn sorted(keys: &[i64]) -> Self {
        let engine = Engine::new(EngineOptions::default());
        let mut txn = engine.write();
        let table = txn.create_table(TableSchema::new(
            "items",
            vec![ColumnKind::Value, ColumnKind::Value],
        ));
        for &k in keys {
            txn.insert(table, vec![Cell::Int(k), Cell::Int(0)]);
        }
        txn.commit();

        let spec = QuerySpec::new(table, Arc::new(|_: &[Cell]| true))
            .with_sort(SortDescriptor::ascending(ColumnIdx::new(0)));
        let results = LiveResults::new(Arc::clone(&engine), spec);
        let coordinator = Coordinator::new(Arc::clone(&engine));
        let query = coordinator.register(&results);
        let owner = engine.snapshot();
        Self {
            engine,
            table,
            results,
            query,
            coordinator,
            owner,
        }
    }

    fn observe(&self) -> (Log, ObserverToken) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let token = self.query.add_observer(move |changes, error| {
            sink.lock()
                .push((changes.to_vec(), error.map(ToString::to_string)));
        });
        (log, token)
    }

    /// Let the background worker finish, then deliver on this thread.
    fn settle(&mut self) {
        self.coordinator.wait_until_idle();
        self.coordinator.deliver_pending(&mut self.owner);
    }

    fn commit_and_settle(&mut self, edit: impl FnOnce(&mut rill_store::WriteTransaction<'_>)) {
        let mut txn = self.engine.write();
        edit(&mut txn);
        txn.commit();
        self.coordinator.commit_notification();
        self.settle();
    }
}

#[test]
fn initial_result_arrives_with_empty_changeset() {
    let mut h = Harness::sorted(&[10, 20, 30]);
    let (log, _) = h.observe();
    h.settle();

    let calls = log.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0.is_empty());
    assert!(calls[0].1.is_none());
    drop(calls);
    assert_eq!(
        h.results.result_rows(),
        vec![RowIdx::new(0), RowIdx::new(1), RowIdx::new(2)]
    );
}

#[test]
fn insert_sorted_after_the_tail_is_one_insertion() {
    let mut h = Harness::sorted(&[10, 20, 30]);
    let (log, _) = h.observe();
    h.settle();

    let table = h.table;
    h.commit_and_settle(|txn| {
        txn.insert(table, vec![Cell::Int(40), Cell::Int(0)]);
    });

    let calls = log.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0, vec![PositionChange::inserted(3)]);
    drop(calls);
    assert_eq!(h.results.result_len(), 4);
}

#[test]
fn delete_is_one_deletion_despite_compaction() {
    let mut h = Harness::sorted(&[10, 20, 30, 40]);
    let (log, _) = h.observe();
    h.settle();

    let table = h.table;
    h.commit_and_settle(|txn| {
        txn.delete(table, RowIdx::new(1));
    });

    let calls = log.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].0,
        vec![PositionChange::deleted(1)],
        "rows shifted by the deletion must not be reported"
    );
    drop(calls);
    assert_eq!(h.results.result_len(), 3);
}

#[test]
fn non_key_field_change_is_an_in_place_modification() {
    let mut h = Harness::sorted(&[10, 20, 30]);
    let (log, _) = h.observe();
    h.settle();

    let table = h.table;
    h.commit_and_settle(|txn| {
        txn.set_value(table, ColumnIdx::new(1), RowIdx::new(1), 7);
    });

    let calls = log.lock();
    assert_eq!(calls[1].0, vec![PositionChange::modified(1)]);
}

#[test]
fn sort_key_change_reports_the_move_pair() {
    let mut h = Harness::sorted(&[1, 2, 3]);
    let (log, _) = h.observe();
    h.settle();

    let table = h.table;
    h.commit_and_settle(|txn| {
        txn.set_value(table, ColumnIdx::new(0), RowIdx::new(1), 5);
    });

    let calls = log.lock();
    let changes = &calls[1].0;
    assert_eq!(changes.len(), 2);
    assert!(changes.contains(&PositionChange::moved(1, 2)));
    assert!(changes.contains(&PositionChange::moved(2, 1)));
    drop(calls);
    assert_eq!(
        h.results.result_rows(),
        vec![RowIdx::new(0), RowIdx::new(2), RowIdx::new(1)]
    );
}

#[test]
fn linked_row_change_fires_through_a_watched_path() {
    let engine = Engine::new(EngineOptions::default());
    let mut txn = engine.write();
    let people = txn.create_table(TableSchema::new("people", vec![ColumnKind::Value]));
    let teams = txn.create_table(TableSchema::new(
        "teams",
        vec![ColumnKind::Link { target: people }],
    ));
    txn.commit();
    let mut txn = engine.write();
    let alice = txn.insert(people, vec![Cell::Int(1)]);
    txn.insert(teams, vec![Cell::Link(Some(alice))]);
    txn.commit();

    let results = LiveResults::new(
        Arc::clone(&engine),
        QuerySpec::new(teams, Arc::new(|_: &[Cell]| true)),
    );
    let coordinator = Coordinator::new(Arc::clone(&engine));
    let query = coordinator.register(&results);

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let watched = query.add_observer_watching(vec![vec![ColumnIdx::new(0)]], move |changes, error| {
        sink.lock()
            .push((changes.to_vec(), error.map(ToString::to_string)));
    });
    let unwatched_log: Log = Arc::new(Mutex::new(Vec::new()));
    let unwatched_sink = Arc::clone(&unwatched_log);
    query.add_observer(move |changes, error| {
        unwatched_sink
            .lock()
            .push((changes.to_vec(), error.map(ToString::to_string)));
    });

    let mut owner = engine.snapshot();
    coordinator.wait_until_idle();
    coordinator.deliver_pending(&mut owner);
    assert_eq!(log.lock().len(), 1, "initial delivery");

    // The team rows are untouched; only the linked person changes.
    let mut txn = engine.write();
    txn.set_value(people, ColumnIdx::new(0), alice, 99);
    txn.commit();
    coordinator.commit_notification();
    coordinator.wait_until_idle();
    coordinator.deliver_pending(&mut owner);

    let calls = log.lock();
    assert_eq!(calls.len(), 2, "watched path must surface the indirect change");
    assert_eq!(calls[1].0, vec![PositionChange::modified(0)]);
    drop(calls);
    // The delivery is per-view, so the path-less observer of the same
    // query sees it too; its own paths just never trigger one.
    assert_eq!(unwatched_log.lock().len(), 2);

    query.remove_observer(watched);
}

#[test]
fn background_failure_flushes_observers_with_the_error() {
    let engine = Engine::new(EngineOptions::default());
    let mut txn = engine.write();
    let table = txn.create_table(TableSchema::new("items", vec![ColumnKind::Value]));
    txn.insert(table, vec![Cell::Int(1)]);
    txn.commit();

    // A spec naming a table the engine does not have: evaluation fails on
    // the worker and the error must surface through the next delivery.
    let results = LiveResults::new(
        Arc::clone(&engine),
        QuerySpec::new(TableIdx::new(9), Arc::new(|_: &[Cell]| true)),
    );
    let coordinator = Coordinator::new(Arc::clone(&engine));
    let query = coordinator.register(&results);
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let token = query.add_observer(move |changes, error| {
        sink.lock()
            .push((changes.to_vec(), error.map(ToString::to_string)));
    });

    let mut owner = engine.snapshot();
    coordinator.wait_until_idle();
    coordinator.deliver_pending(&mut owner);

    let calls = log.lock();
    assert_eq!(calls.len(), 1, "each observer is flushed exactly once");
    assert!(calls[0].0.is_empty());
    let message = calls[0].1.as_deref().expect("error must be delivered");
    assert!(message.contains("query execution failed"), "got: {message}");
    drop(calls);

    // Terminal for notifications: further commits deliver nothing, and the
    // flushed token is tolerated.
    let mut txn = engine.write();
    txn.insert(table, vec![Cell::Int(2)]);
    txn.commit();
    coordinator.commit_notification();
    coordinator.wait_until_idle();
    coordinator.deliver_pending(&mut owner);
    assert_eq!(log.lock().len(), 1);
    query.remove_observer(token);
}

#[test]
fn adding_the_first_observer_wakes_the_pipeline() {
    let mut h = Harness::sorted(&[10, 20]);
    // Opt out of unsolicited refreshes so registration alone computes
    // nothing for this target.
    h.results.set_wants_background_updates(false);
    h.settle();
    assert!(!h.results.has_result());

    let (log, _) = h.observe();
    // No commit happened; the observer's wake-up alone must produce the
    // first result.
    h.settle();
    assert_eq!(log.lock().len(), 1);
    assert!(h.results.has_result());
}

#[test]
fn observers_can_be_added_from_other_threads() {
    let mut h = Harness::sorted(&[10]);
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let query = Arc::clone(&h.query);
    std::thread::spawn(move || {
        query.add_observer(move |changes, error| {
            sink.lock()
                .push((changes.to_vec(), error.map(ToString::to_string)));
        });
    })
    .join()
    .expect("observer registration thread");

    h.settle();
    assert_eq!(log.lock().len(), 1);

    let query = Arc::clone(&h.query);
    let (other_log, token) = h.observe();
    std::thread::spawn(move || query.remove_observer(token))
        .join()
        .expect("observer removal thread");
    let table = h.table;
    h.commit_and_settle(|txn| {
        txn.insert(table, vec![Cell::Int(20), Cell::Int(0)]);
    });
    assert_eq!(log.lock().len(), 2);
    assert!(
        other_log.lock().is_empty(),
        "an observer removed before delivery must never fire"
    );
}

#[test]
fn dropping_the_handle_silences_and_prunes_the_query() {
    let mut h = Harness::sorted(&[10]);
    let (log, _) = h.observe();
    h.settle();
    assert_eq!(log.lock().len(), 1);

    let results = h.results;
    h.results = LiveResults::new(
        Arc::clone(&h.engine),
        QuerySpec::new(h.table, Arc::new(|_: &[Cell]| true)),
    );
    drop(results);
    assert!(!h.query.is_alive());

    let table = h.table;
    h.commit_and_settle(|txn| {
        txn.insert(table, vec![Cell::Int(20), Cell::Int(0)]);
    });
    assert_eq!(log.lock().len(), 1, "no callback fires after the target died");
}

#[test]
fn commits_deliver_in_order_with_composed_catch_up() {
    let mut h = Harness::sorted(&[10]);
    let (log, _) = h.observe();
    h.settle();

    // Three commits before the owner settles once: the delivered changeset
    // must describe the whole transition from the last delivered view.
    for key in [20, 30, 40] {
        let mut txn = h.engine.write();
        txn.insert(h.table, vec![Cell::Int(key), Cell::Int(0)]);
        txn.commit();
        h.coordinator.commit_notification();
    }
    h.settle();

    let calls = log.lock();
    assert_eq!(calls.len(), 2, "one composed delivery for the catch-up");
    assert_eq!(
        calls[1].0,
        vec![
            PositionChange::inserted(1),
            PositionChange::inserted(2),
            PositionChange::inserted(3)
        ]
    );
    drop(calls);
    assert_eq!(h.results.result_len(), 4);
}

#[test]
fn filtered_query_tracks_membership_changes() {
    let engine = Engine::new(EngineOptions::default());
    let mut txn = engine.write();
    let table = txn.create_table(TableSchema::new("items", vec![ColumnKind::Value]));
    for v in [1, 6, 3, 8] {
        txn.insert(table, vec![Cell::Int(v)]);
    }
    txn.commit();

    // Rows with value >= 5, in storage order.
    let results = LiveResults::new(
        Arc::clone(&engine),
        QuerySpec::new(
            table,
            Arc::new(|cells: &[Cell]| cells[0].as_int().is_some_and(|v| v >= 5)),
        ),
    );
    let coordinator = Coordinator::new(Arc::clone(&engine));
    let query = coordinator.register(&results);
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    query.add_observer(move |changes, error| {
        sink.lock()
            .push((changes.to_vec(), error.map(ToString::to_string)));
    });

    let mut owner = engine.snapshot();
    coordinator.wait_until_idle();
    coordinator.deliver_pending(&mut owner);
    assert_eq!(
        results.result_rows(),
        vec![RowIdx::new(1), RowIdx::new(3)]
    );

    // Row 2 crosses the threshold: it enters the result set.
    let mut txn = engine.write();
    txn.set_value(table, ColumnIdx::new(0), RowIdx::new(2), 9);
    txn.commit();
    coordinator.commit_notification();
    coordinator.wait_until_idle();
    coordinator.deliver_pending(&mut owner);

    let calls = log.lock();
    assert_eq!(calls[1].0, vec![PositionChange::inserted(1)]);
    drop(calls);
    assert_eq!(
        results.result_rows(),
        vec![RowIdx::new(1), RowIdx::new(2), RowIdx::new(3)]
    );
}
