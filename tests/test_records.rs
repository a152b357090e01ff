//! Record store tests, run against both the in-memory and the SQLite
//! implementations.

use std::sync::Arc;

use arkflow::engine::types::TaskStatus;
use arkflow::records::memory::MemoryRecordStore;
use arkflow::records::sqlite::SqliteRecordStore;
use arkflow::{RecordStore, StepRecord, TaskRecord};
use uuid::Uuid;

async fn memory_store() -> Arc<dyn RecordStore> {
    Arc::new(MemoryRecordStore::new())
}

async fn sqlite_store() -> Arc<dyn RecordStore> {
    Arc::new(SqliteRecordStore::in_memory().await.unwrap())
}

fn task_in(step: &StepRecord, pos: i32, name: &str) -> TaskRecord {
    TaskRecord::new(name, serde_json::json!({ "pos": pos })).in_step(step.id, pos)
}

// --- CRUD and ordering ---

async fn crud_and_ordering(store: Arc<dyn RecordStore>) {
    let step = StepRecord::new("root", "tester");
    store.create_step(&step).await.unwrap();

    let fetched = store.get_step(step.id).await.unwrap();
    assert_eq!(fetched.name, "root");
    assert_eq!(fetched.user, "tester");

    // Created out of order; queries must come back position-ordered.
    for pos in [2, 0, 1] {
        store
            .create_task(&task_in(&step, pos, "t"))
            .await
            .unwrap();
    }

    let tasks = store.tasks_of_step(step.id).await.unwrap();
    let positions: Vec<i32> = tasks.iter().map(|t| t.parent_step_pos).collect();
    assert_eq!(positions, vec![0, 1, 2]);

    let child = StepRecord::new("child", "tester").under(step.id, 0);
    store.create_step(&child).await.unwrap();
    assert_eq!(store.child_steps(step.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn crud_and_ordering_memory() {
    crud_and_ordering(memory_store().await).await;
}

#[tokio::test]
async fn crud_and_ordering_sqlite() {
    crud_and_ordering(sqlite_store().await).await;
}

// --- Query filters ---

async fn query_filters(store: Arc<dyn RecordStore>) {
    let step = StepRecord::new("root", "tester");
    store.create_step(&step).await.unwrap();

    let pending = task_in(&step, 0, "t");
    let failed = task_in(&step, 1, "t");
    let succeeded = task_in(&step, 2, "t");
    for task in [&pending, &failed, &succeeded] {
        store.create_task(task).await.unwrap();
    }
    store
        .set_task_status(failed.id, TaskStatus::Failure)
        .await
        .unwrap();
    store
        .set_task_status(succeeded.id, TaskStatus::Success)
        .await
        .unwrap();

    assert_eq!(store.live_tasks(step.id).await.unwrap().len(), 3);
    assert_eq!(store.failed_tasks(step.id).await.unwrap().len(), 1);
    assert_eq!(store.pending_tasks(step.id).await.unwrap().len(), 1);
    assert!(store.undone_unretried_tasks(step.id).await.unwrap().is_empty());

    // Undoing the failed task moves it into the undone-unretried set and
    // out of the pending one, but it stays live until retried.
    let undo = store
        .create_undo_task(failed.id, Uuid::new_v4())
        .await
        .unwrap();
    assert!(undo.undo_type);
    assert_eq!(store.undone_unretried_tasks(step.id).await.unwrap().len(), 1);
    assert_eq!(store.live_tasks(step.id).await.unwrap().len(), 3);

    // Retrying it replaces it in the live set.
    let retry = store
        .create_retry_task(failed.id, Uuid::new_v4())
        .await
        .unwrap();
    let live = store.live_tasks(step.id).await.unwrap();
    assert_eq!(live.len(), 3);
    assert!(live.iter().any(|t| t.id == retry.id));
    assert!(!live.iter().any(|t| t.id == failed.id));
    assert!(store.undone_unretried_tasks(step.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn query_filters_memory() {
    query_filters(memory_store().await).await;
}

#[tokio::test]
async fn query_filters_sqlite() {
    query_filters(sqlite_store().await).await;
}

// --- Undo / retry record invariants ---

async fn undo_and_retry_records(store: Arc<dyn RecordStore>) {
    let step = StepRecord::new("root", "tester");
    store.create_step(&step).await.unwrap();
    let original = task_in(&step, 0, "some.task");
    store.create_task(&original).await.unwrap();

    let attempt = Uuid::new_v4();
    let undo = store.create_undo_task(original.id, attempt).await.unwrap();

    assert!(undo.undo_type);
    assert_eq!(undo.status, TaskStatus::Prepared);
    assert_eq!(undo.params, original.params);
    assert_eq!(undo.attempt, attempt);
    assert_eq!(undo.parent_step_pos, original.parent_step_pos);
    assert_eq!(
        store.get_task(original.id).await.unwrap().undone,
        Some(undo.id)
    );

    // At most one outstanding undo.
    assert!(store.create_undo_task(original.id, attempt).await.is_err());

    let retry_attempt = Uuid::new_v4();
    let retry = store
        .create_retry_task(original.id, retry_attempt)
        .await
        .unwrap();

    assert!(!retry.undo_type);
    assert_eq!(retry.name, original.name);
    assert_eq!(retry.params, original.params);
    assert_ne!(retry.attempt, original.attempt);
    assert_eq!(retry.status, TaskStatus::Prepared);
    assert_eq!(
        store.get_task(original.id).await.unwrap().retried,
        Some(retry.id)
    );

    // At most one retry.
    assert!(store.create_retry_task(original.id, retry_attempt).await.is_err());
}

#[tokio::test]
async fn undo_and_retry_records_memory() {
    undo_and_retry_records(memory_store().await).await;
}

#[tokio::test]
async fn undo_and_retry_records_sqlite() {
    undo_and_retry_records(sqlite_store().await).await;
}

// --- Retry adopts children ---

async fn retry_adopts_children(store: Arc<dyn RecordStore>) {
    let parent = TaskRecord::new("transfer", serde_json::json!({}));
    store.create_task(&parent).await.unwrap();

    let done = TaskRecord::new("chunk", serde_json::json!({ "offset": 0 })).child_of(parent.id, 0);
    let open = TaskRecord::new("chunk", serde_json::json!({ "offset": 1 })).child_of(parent.id, 1);
    store.create_task(&done).await.unwrap();
    store.create_task(&open).await.unwrap();
    store
        .set_task_status(done.id, TaskStatus::Success)
        .await
        .unwrap();

    let replacement = store
        .create_retry_task(parent.id, Uuid::new_v4())
        .await
        .unwrap();

    // Both children now hang under the replacement, statuses intact.
    assert!(store.child_tasks(parent.id).await.unwrap().is_empty());
    let adopted = store.child_tasks(replacement.id).await.unwrap();
    assert_eq!(adopted.len(), 2);
    assert_eq!(adopted[0].status, TaskStatus::Success);
    assert_eq!(adopted[1].status, TaskStatus::Pending);
}

#[tokio::test]
async fn retry_adopts_children_memory() {
    retry_adopts_children(memory_store().await).await;
}

#[tokio::test]
async fn retry_adopts_children_sqlite() {
    retry_adopts_children(sqlite_store().await).await;
}

// --- Position uniqueness ---

async fn sibling_positions_are_unique(store: Arc<dyn RecordStore>) {
    let step = StepRecord::new("root", "tester");
    store.create_step(&step).await.unwrap();

    store.create_task(&task_in(&step, 0, "t")).await.unwrap();
    assert!(
        store.create_task(&task_in(&step, 0, "t")).await.is_err(),
        "live siblings must not share a position"
    );

    // Undo records mirror their original's position and are exempt.
    let original = store.tasks_of_step(step.id).await.unwrap().remove(0);
    store
        .create_undo_task(original.id, Uuid::new_v4())
        .await
        .unwrap();
}

#[tokio::test]
async fn sibling_positions_are_unique_memory() {
    sibling_positions_are_unique(memory_store().await).await;
}

#[tokio::test]
async fn sibling_positions_are_unique_sqlite() {
    sibling_positions_are_unique(sqlite_store().await).await;
}

// --- Progress monotonicity ---

async fn progress_is_monotonic(store: Arc<dyn RecordStore>) {
    let task = TaskRecord::new("t", serde_json::json!({}));
    store.create_task(&task).await.unwrap();

    store.set_task_progress(task.id, 60).await.unwrap();
    store.set_task_progress(task.id, 40).await.unwrap();
    assert_eq!(store.get_task(task.id).await.unwrap().progress, 60);

    store.set_task_progress(task.id, 100).await.unwrap();
    assert_eq!(store.get_task(task.id).await.unwrap().progress, 100);
}

#[tokio::test]
async fn progress_is_monotonic_memory() {
    progress_is_monotonic(memory_store().await).await;
}

#[tokio::test]
async fn progress_is_monotonic_sqlite() {
    progress_is_monotonic(sqlite_store().await).await;
}

// --- Cascade deletion ---

async fn delete_cascades(store: Arc<dyn RecordStore>) {
    let root = StepRecord::new("root", "tester");
    store.create_step(&root).await.unwrap();
    let child = StepRecord::new("child", "tester").under(root.id, 0);
    store.create_step(&child).await.unwrap();

    let task = task_in(&child, 0, "t");
    store.create_task(&task).await.unwrap();
    let sub = TaskRecord::new("sub", serde_json::json!({})).child_of(task.id, 0);
    store.create_task(&sub).await.unwrap();

    store.delete_step(root.id).await.unwrap();

    assert!(store.get_step(root.id).await.is_err());
    assert!(store.get_step(child.id).await.is_err());
    assert!(store.get_task(task.id).await.is_err());
    assert!(store.get_task(sub.id).await.is_err());
}

#[tokio::test]
async fn delete_cascades_memory() {
    delete_cascades(memory_store().await).await;
}

#[tokio::test]
async fn delete_cascades_sqlite() {
    delete_cascades(sqlite_store().await).await;
}

// --- Round-trip of rich fields through SQLite ---

#[tokio::test]
async fn sqlite_round_trips_all_fields() {
    let store = SqliteRecordStore::in_memory().await.unwrap();

    let mut task = TaskRecord::new(
        "arkflow.tasks.calculate_checksum",
        serde_json::json!({ "filename": "f", "algorithm": "SHA-256" }),
    );
    task.parallel = true;
    task.hidden = true;
    task.information_package = Some(Uuid::new_v4());
    store.create_task(&task).await.unwrap();

    store
        .set_task_result(task.id, Some(serde_json::json!({ "digest": "abc" })))
        .await
        .unwrap();
    store
        .set_task_einfo(
            task.id,
            Some(arkflow::engine::ErrorInfo {
                kind: "LeafFailure".to_string(),
                message: "went wrong".to_string(),
                traceback: Some("trace".to_string()),
            }),
        )
        .await
        .unwrap();
    store
        .set_task_event_outcome(task.id, Some("did things".to_string()))
        .await
        .unwrap();
    store
        .set_task_time_started(task.id, Some(chrono::Utc::now()))
        .await
        .unwrap();

    let loaded = store.get_task(task.id).await.unwrap();
    assert_eq!(loaded.name, task.name);
    assert_eq!(loaded.params, task.params);
    assert!(loaded.parallel);
    assert!(loaded.hidden);
    assert_eq!(loaded.information_package, task.information_package);
    assert_eq!(loaded.result, Some(serde_json::json!({ "digest": "abc" })));
    assert_eq!(loaded.einfo.unwrap().kind, "LeafFailure");
    assert_eq!(loaded.event_outcome.as_deref(), Some("did things"));
    assert!(loaded.time_started.is_some());
}
