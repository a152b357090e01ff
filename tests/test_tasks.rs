//! Tests for the registry and the built-in task family.

use std::sync::Arc;

use arkflow::engine::aggregate;
use arkflow::records::memory::MemoryRecordStore;
use arkflow::{
    EngineConfig, Node, StepRecord, TaskRecord, TaskRegistry, TaskStatus, WorkflowEngine,
};

fn engine() -> WorkflowEngine {
    WorkflowEngine::new(
        Arc::new(TaskRegistry::with_builtins()),
        Arc::new(MemoryRecordStore::new()),
        EngineConfig::eager(),
    )
}

// --- Registry ---

#[test]
fn registry_resolves_and_validates() {
    let registry = TaskRegistry::with_builtins();

    assert!(registry.resolve("arkflow.tasks.calculate_checksum").is_ok());
    assert!(registry.resolve("no.such.task").is_err());

    let known = TaskRecord::new("arkflow.tasks.calculate_checksum", serde_json::json!({}));
    assert!(registry.validate(&known).is_ok());

    let unknown = TaskRecord::new("no.such.task", serde_json::json!({}));
    assert!(registry.validate(&unknown).is_err());

    // Pure composites are exempt from name validation.
    let mut composite = TaskRecord::new("anything", serde_json::json!({}));
    composite.composite = true;
    assert!(registry.validate(&composite).is_ok());
}

#[test]
fn registry_listing_skips_hidden_tasks() {
    let registry = TaskRegistry::with_builtins();
    let names: Vec<&str> = registry.list().iter().map(|(name, _)| *name).collect();

    assert!(names.contains(&"arkflow.tasks.calculate_checksum"));
    assert!(names.contains(&"arkflow.tasks.copy_file"));
    // copy_chunk is bookkeeping detail.
    assert!(!names.contains(&"arkflow.tasks.copy_chunk"));
}

#[tokio::test]
async fn unregistered_name_fails_with_unknown_task() {
    let engine = engine();
    let task = TaskRecord::new("no.such.task", serde_json::json!({}));
    engine.store().create_task(&task).await.unwrap();

    engine.run(&Node::Task(task.clone())).await.unwrap();

    let record = engine.store().get_task(task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failure);
    assert_eq!(record.einfo.unwrap().kind, "UnknownTask");
}

#[tokio::test]
async fn missing_required_param_fails_with_parameter_error() {
    let engine = engine();
    let task = TaskRecord::new(
        "arkflow.tasks.calculate_checksum",
        serde_json::json!({ "algorithm": "SHA-256" }),
    );
    engine.store().create_task(&task).await.unwrap();

    engine.run(&Node::Task(task.clone())).await.unwrap();

    let record = engine.store().get_task(task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failure);
    let einfo = record.einfo.unwrap();
    assert_eq!(einfo.kind, "ParameterError");
    assert!(einfo.message.contains("filename"));
}

// --- Checksum ---

#[tokio::test]
async fn checksum_of_known_content() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, "foo").unwrap();

    let task = TaskRecord::new(
        "arkflow.tasks.calculate_checksum",
        serde_json::json!({ "filename": file.to_string_lossy(), "algorithm": "SHA-256" }),
    );
    engine.store().create_task(&task).await.unwrap();

    engine.run(&Node::Task(task.clone())).await.unwrap();

    let record = engine.store().get_task(task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Success);
    assert_eq!(record.progress, 100);
    assert_eq!(
        record.result,
        Some(serde_json::json!(
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        ))
    );
    let outcome = record.event_outcome.unwrap();
    assert!(outcome.contains("SHA-256"));
}

#[tokio::test]
async fn checksum_small_block_size_matches() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, "foo").unwrap();

    let task = TaskRecord::new(
        "arkflow.tasks.calculate_checksum",
        serde_json::json!({
            "filename": file.to_string_lossy(),
            "algorithm": "SHA-256",
            "block_size": 1
        }),
    );
    engine.store().create_task(&task).await.unwrap();
    engine.run(&Node::Task(task.clone())).await.unwrap();

    let record = engine.store().get_task(task.id).await.unwrap();
    assert_eq!(
        record.result,
        Some(serde_json::json!(
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        ))
    );
}

#[tokio::test]
async fn unsupported_algorithm_is_a_parameter_error() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, "foo").unwrap();

    let task = TaskRecord::new(
        "arkflow.tasks.calculate_checksum",
        serde_json::json!({ "filename": file.to_string_lossy(), "algorithm": "CRC-11" }),
    );
    engine.store().create_task(&task).await.unwrap();
    engine.run(&Node::Task(task.clone())).await.unwrap();

    let record = engine.store().get_task(task.id).await.unwrap();
    assert_eq!(record.einfo.unwrap().kind, "ParameterError");
}

// --- Integrity validation (nested sub-plan) ---

#[tokio::test]
async fn validate_integrity_accepts_matching_checksum() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, "foo").unwrap();

    let task = TaskRecord::new(
        "arkflow.tasks.validate_integrity",
        serde_json::json!({
            "filename": file.to_string_lossy(),
            "checksum": "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
        }),
    );
    engine.store().create_task(&task).await.unwrap();

    engine.run(&Node::Task(task.clone())).await.unwrap();

    let record = engine.store().get_task(task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Success);

    // The nested checksum ran as a child record of the validating task.
    let children = engine.store().child_tasks(task.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "arkflow.tasks.calculate_checksum");
    assert_eq!(children[0].status, TaskStatus::Success);
}

#[tokio::test]
async fn validate_integrity_rejects_mismatch() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, "bar").unwrap();

    let task = TaskRecord::new(
        "arkflow.tasks.validate_integrity",
        serde_json::json!({
            "filename": file.to_string_lossy(),
            "checksum": "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae",
        }),
    );
    engine.store().create_task(&task).await.unwrap();
    engine.run(&Node::Task(task.clone())).await.unwrap();

    let record = engine.store().get_task(task.id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failure);
    assert_eq!(record.einfo.unwrap().kind, "IntegrityViolation");
}

// --- XML generation and undo ---

#[tokio::test]
async fn generate_xml_writes_and_undo_removes() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("x.xml");

    let spec = serde_json::json!({
        "-name": "mets",
        "-attr": { "TYPE": "SIP" },
        "-children": [
            { "-name": "label", "#content": [ { "var": "label" } ] }
        ]
    });
    let mut files = serde_json::Map::new();
    files.insert(out.to_string_lossy().to_string(), spec);

    let task = TaskRecord::new(
        "arkflow.tasks.generate_xml",
        serde_json::json!({
            "files_to_create": files,
            "info": { "label": "my package" }
        }),
    );
    engine.store().create_task(&task).await.unwrap();

    engine.run(&Node::Task(task.clone())).await.unwrap();

    assert!(out.exists());
    let body = std::fs::read_to_string(&out).unwrap();
    assert!(body.contains("<mets TYPE=\"SIP\">"));
    assert!(body.contains("my package"));

    let outcomes = engine.undo(&Node::Task(task.clone()), false).await.unwrap();
    assert_eq!(outcomes.len(), 1);

    let original = engine.store().get_task(task.id).await.unwrap();
    let undo_id = original.undone.expect("undo record must exist");
    let undo = engine.store().get_task(undo_id).await.unwrap();
    assert!(undo.undo_type);
    assert_eq!(undo.status, TaskStatus::Success);

    assert!(!out.exists(), "undo must remove the generated file");

    // The undone task now reads as pending until a retry replaces it.
    let status = aggregate::task_status(engine.store().as_ref(), &original)
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Pending);
}

// --- Filesystem ops ---

#[tokio::test]
async fn delete_files_removes_trees_and_single_files() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();

    let tree = dir.path().join("tree");
    std::fs::create_dir_all(tree.join("nested")).unwrap();
    std::fs::write(tree.join("nested/file"), "x").unwrap();

    let task = TaskRecord::new(
        "arkflow.tasks.delete_files",
        serde_json::json!({ "path": tree.to_string_lossy() }),
    );
    engine.store().create_task(&task).await.unwrap();
    engine.run(&Node::Task(task.clone())).await.unwrap();

    assert_eq!(
        engine.store().get_task(task.id).await.unwrap().status,
        TaskStatus::Success
    );
    assert!(!tree.exists());

    let single = dir.path().join("single");
    std::fs::write(&single, "x").unwrap();
    let task = TaskRecord::new(
        "arkflow.tasks.delete_files",
        serde_json::json!({ "path": single.to_string_lossy() }),
    );
    engine.store().create_task(&task).await.unwrap();
    engine.run(&Node::Task(task.clone())).await.unwrap();
    assert!(!single.exists());
}

// --- Steps mixing builtin leaves ---

#[tokio::test]
async fn step_of_checksum_tasks_reaches_success() {
    let engine = engine();
    let dir = tempfile::tempdir().unwrap();

    let step = StepRecord::new("Validate package", "archivist");
    engine.store().create_step(&step).await.unwrap();

    for (pos, content) in ["alpha", "beta"].iter().enumerate() {
        let file = dir.path().join(format!("f{}", pos));
        std::fs::write(&file, content).unwrap();
        let task = TaskRecord::new(
            "arkflow.tasks.calculate_checksum",
            serde_json::json!({ "filename": file.to_string_lossy() }),
        )
        .in_step(step.id, pos as i32);
        engine.store().create_task(&task).await.unwrap();
    }

    engine.run(&Node::Step(step.clone())).await.unwrap();

    let status = aggregate::step_status(engine.store().as_ref(), &step)
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Success);
    let progress = aggregate::step_progress(engine.store().as_ref(), &step)
        .await
        .unwrap();
    assert_eq!(progress, 100);
}
