//! Tests for the derived status/progress/undone aggregates.

use std::sync::Arc;

use arkflow::engine::aggregate;
use arkflow::engine::types::TaskStatus;
use arkflow::records::memory::MemoryRecordStore;
use arkflow::{RecordStore, StepRecord, TaskRecord};
use uuid::Uuid;

fn store() -> Arc<dyn RecordStore> {
    Arc::new(MemoryRecordStore::new())
}

async fn step_with_tasks(
    store: &Arc<dyn RecordStore>,
    statuses: &[TaskStatus],
) -> (StepRecord, Vec<TaskRecord>) {
    let step = StepRecord::new("step", "tester");
    store.create_step(&step).await.unwrap();

    let mut tasks = Vec::new();
    for (pos, status) in statuses.iter().enumerate() {
        let task = TaskRecord::new("t", serde_json::json!({})).in_step(step.id, pos as i32);
        store.create_task(&task).await.unwrap();
        store.set_task_status(task.id, *status).await.unwrap();
        tasks.push(task);
    }
    (step, tasks)
}

// --- Step status ---

#[tokio::test]
async fn empty_step_is_success() {
    let store = store();
    let step = StepRecord::new("empty", "tester");
    store.create_step(&step).await.unwrap();

    let status = aggregate::step_status(store.as_ref(), &step).await.unwrap();
    assert_eq!(status, TaskStatus::Success);
    let progress = aggregate::step_progress(store.as_ref(), &step).await.unwrap();
    assert_eq!(progress, 100);
}

#[tokio::test]
async fn failure_takes_precedence() {
    let store = store();
    let (step, _) = step_with_tasks(
        &store,
        &[TaskStatus::Success, TaskStatus::Started, TaskStatus::Failure],
    )
    .await;

    let status = aggregate::step_status(store.as_ref(), &step).await.unwrap();
    assert_eq!(status, TaskStatus::Failure);
}

#[tokio::test]
async fn started_beats_pending_beats_success() {
    let store = store();
    let (step, _) = step_with_tasks(&store, &[TaskStatus::Success, TaskStatus::Pending]).await;
    let status = aggregate::step_status(store.as_ref(), &step).await.unwrap();
    assert_eq!(status, TaskStatus::Pending);

    let (step, _) = step_with_tasks(
        &store,
        &[TaskStatus::Success, TaskStatus::Pending, TaskStatus::Started],
    )
    .await;
    let status = aggregate::step_status(store.as_ref(), &step).await.unwrap();
    assert_eq!(status, TaskStatus::Started);

    let (step, _) = step_with_tasks(&store, &[TaskStatus::Success, TaskStatus::Success]).await;
    let status = aggregate::step_status(store.as_ref(), &step).await.unwrap();
    assert_eq!(status, TaskStatus::Success);
}

#[tokio::test]
async fn child_step_status_is_recursive() {
    let store = store();
    let root = StepRecord::new("root", "tester");
    store.create_step(&root).await.unwrap();
    let child = StepRecord::new("child", "tester").under(root.id, 0);
    store.create_step(&child).await.unwrap();

    let task = TaskRecord::new("t", serde_json::json!({})).in_step(child.id, 0);
    store.create_task(&task).await.unwrap();
    store
        .set_task_status(task.id, TaskStatus::Failure)
        .await
        .unwrap();

    let status = aggregate::step_status(store.as_ref(), &root).await.unwrap();
    assert_eq!(status, TaskStatus::Failure);
}

// --- Task status redirection ---

#[tokio::test]
async fn undone_task_reads_as_pending_until_retried() {
    let store = store();
    let (_, tasks) = step_with_tasks(&store, &[TaskStatus::Success]).await;
    let original = &tasks[0];

    store
        .create_undo_task(original.id, Uuid::new_v4())
        .await
        .unwrap();
    let reloaded = store.get_task(original.id).await.unwrap();
    let status = aggregate::task_status(store.as_ref(), &reloaded)
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Pending);

    let retry = store
        .create_retry_task(original.id, Uuid::new_v4())
        .await
        .unwrap();
    store
        .set_task_status(retry.id, TaskStatus::Success)
        .await
        .unwrap();

    let reloaded = store.get_task(original.id).await.unwrap();
    let status = aggregate::task_status(store.as_ref(), &reloaded)
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Success);
}

#[tokio::test]
async fn failed_child_surfaces_through_unstamped_parent() {
    let store = store();
    let parent = TaskRecord::new("parent", serde_json::json!({}));
    store.create_task(&parent).await.unwrap();
    store
        .set_task_status(parent.id, TaskStatus::Started)
        .await
        .unwrap();

    let child = TaskRecord::new("child", serde_json::json!({})).child_of(parent.id, 0);
    store.create_task(&child).await.unwrap();
    store
        .set_task_status(child.id, TaskStatus::Failure)
        .await
        .unwrap();

    let reloaded = store.get_task(parent.id).await.unwrap();
    let status = aggregate::task_status(store.as_ref(), &reloaded)
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Failure);
}

// --- Progress ---

#[tokio::test]
async fn step_progress_averages_children() {
    let store = store();
    let (step, tasks) = step_with_tasks(&store, &[TaskStatus::Started, TaskStatus::Success]).await;
    store.set_task_progress(tasks[0].id, 50).await.unwrap();
    store.set_task_progress(tasks[1].id, 100).await.unwrap();

    let progress = aggregate::step_progress(store.as_ref(), &step).await.unwrap();
    assert_eq!(progress, 75);
}

#[tokio::test]
async fn undone_task_counts_but_contributes_nothing() {
    let store = store();
    let (step, tasks) = step_with_tasks(&store, &[TaskStatus::Success, TaskStatus::Success]).await;
    store.set_task_progress(tasks[0].id, 100).await.unwrap();
    store.set_task_progress(tasks[1].id, 100).await.unwrap();

    store
        .create_undo_task(tasks[1].id, Uuid::new_v4())
        .await
        .unwrap();

    // Denominator stays 2; the undone task's progress is ignored.
    let progress = aggregate::step_progress(store.as_ref(), &step).await.unwrap();
    assert_eq!(progress, 50);
}

// --- Undone flag and times ---

#[tokio::test]
async fn step_undone_tracks_unretried_undos() {
    let store = store();
    let (step, tasks) = step_with_tasks(&store, &[TaskStatus::Success]).await;

    assert!(!aggregate::step_undone(store.as_ref(), &step).await.unwrap());

    store
        .create_undo_task(tasks[0].id, Uuid::new_v4())
        .await
        .unwrap();
    assert!(aggregate::step_undone(store.as_ref(), &step).await.unwrap());

    store
        .create_retry_task(tasks[0].id, Uuid::new_v4())
        .await
        .unwrap();
    assert!(!aggregate::step_undone(store.as_ref(), &step).await.unwrap());
}

#[tokio::test]
async fn step_times_come_from_first_task() {
    let store = store();
    let (step, tasks) = step_with_tasks(&store, &[TaskStatus::Success, TaskStatus::Success]).await;

    let started = chrono::Utc::now();
    store
        .set_task_time_started(tasks[0].id, Some(started))
        .await
        .unwrap();

    let time = aggregate::step_time_started(store.as_ref(), &step)
        .await
        .unwrap();
    assert_eq!(time, Some(started));

    assert!(
        aggregate::step_time_done(store.as_ref(), &step)
            .await
            .unwrap()
            .is_none()
    );
}
