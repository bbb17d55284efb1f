//! Integration tests for instance persistence
//!
//! Persists idle workflows to a filesystem store, reloads them in a fresh
//! runtime and resumes them from where they stopped.

use std::collections::BTreeMap;

use serde_json::json;
use tempfile::TempDir;
use trellis::activities::{samples, CorrelationScope, NoPersistScope, Sequence, WaitForBookmark, WriteLog};
use trellis::runtime::bookmark::BookmarkScope;
use trellis::runtime::control::Control;
use trellis::runtime::error::{RuntimeError, SnapshotError};
use trellis::runtime::{BookmarkResumptionResult, Runtime, RuntimeConfig, WorkflowStatus};
use uuid::Uuid;

fn init(temp: &TempDir) -> RuntimeConfig {
    let config = RuntimeConfig {
        root: temp.path().to_path_buf(),
        ..RuntimeConfig::default()
    };
    Runtime::init(config.clone()).unwrap();
    config
}

#[test]
fn test_persisted_workflow_resumes_in_new_runtime() {
    let temp = TempDir::new().unwrap();
    let config = init(&temp);

    let id = {
        let runtime = Runtime::new(config.clone()).unwrap();
        let tree = runtime.cache(samples::approval()).unwrap();
        let mut executor = runtime.create_executor(tree);
        executor.schedule_root(BTreeMap::new()).unwrap();
        assert_eq!(executor.run(), WorkflowStatus::Executing);
        runtime.persist(&executor).unwrap();
        executor.id()
    };

    let runtime = Runtime::load(temp.path().to_path_buf()).unwrap();
    let entry = runtime.store().entry(&id).unwrap();
    assert_eq!(entry.status, WorkflowStatus::Executing);
    assert_eq!(entry.bookmarks, vec!["approve".to_string()]);

    let tree = runtime.cache(samples::approval()).unwrap();
    let mut executor = runtime.restore(tree, &id).unwrap();
    assert_eq!(executor.id(), id);
    assert_eq!(executor.get_all_bookmarks().len(), 1);

    assert_eq!(executor.resume_bookmark("approve", json!("granted")), BookmarkResumptionResult::Success);
    assert_eq!(executor.run(), WorkflowStatus::Closed);
    assert_eq!(executor.outputs().get("Decision"), Some(&json!("granted")));

    runtime.persist(&executor).unwrap();
    assert_eq!(runtime.store().entry(&id).unwrap().status, WorkflowStatus::Closed);
}

#[test]
fn test_restore_rejects_different_definition() {
    let temp = TempDir::new().unwrap();
    let runtime = Runtime::new(init(&temp)).unwrap();

    let tree = runtime.cache(samples::approval()).unwrap();
    let mut executor = runtime.create_executor(tree);
    executor.schedule_root(BTreeMap::new()).unwrap();
    executor.run();
    runtime.persist(&executor).unwrap();

    let other = runtime.cache(samples::fan_out()).unwrap();
    let error = runtime.restore(other, &executor.id()).unwrap_err();
    assert!(matches!(error, SnapshotError::DefinitionMismatch { .. }));
}

#[test]
fn test_no_persist_zone_blocks_snapshot() {
    let temp = TempDir::new().unwrap();
    let runtime = Runtime::new(init(&temp)).unwrap();

    let root = NoPersistScope::activity("critical", WaitForBookmark::named("go")).build();
    let tree = runtime.cache(root).unwrap();
    let mut executor = runtime.create_executor(tree);
    executor.schedule_root(BTreeMap::new()).unwrap();
    executor.run();

    assert!(executor.persist_blocker().is_some());
    assert!(matches!(runtime.persist(&executor), Err(SnapshotError::NotPersistable(_))));
    assert!(!runtime.store().contains(&executor.id()));
}

#[test]
fn test_bookmark_scope_survives_persistence() {
    let temp = TempDir::new().unwrap();
    let runtime = Runtime::new(init(&temp)).unwrap();
    let correlation = Uuid::new_v4();
    let definition = || {
        CorrelationScope::with_id(
            "order",
            correlation,
            Sequence::activity("body").children([
                WaitForBookmark::in_scope("shipped", CorrelationScope::HANDLE),
                WriteLog::literal("shipped"),
            ]),
        )
        .build()
    };

    let mut executor = runtime.create_executor(runtime.cache(definition()).unwrap());
    executor.schedule_root(BTreeMap::new()).unwrap();
    executor.run();
    runtime.persist(&executor).unwrap();
    let id = executor.id();
    drop(executor);

    let mut restored = runtime.restore(runtime.cache(definition()).unwrap(), &id).unwrap();
    assert_eq!(restored.get_bookmarks(BookmarkScope::Durable(correlation)).len(), 1);
    assert_eq!(
        restored.resume_bookmark_in_scope("shipped", BookmarkScope::Durable(correlation), json!(null)),
        BookmarkResumptionResult::Success
    );
    assert_eq!(restored.run(), WorkflowStatus::Closed);
}

#[test]
fn test_control_start_resume_and_list() {
    let temp = TempDir::new().unwrap();
    let runtime = Runtime::new(init(&temp)).unwrap();
    let mut control = Control::new(runtime);
    for (name, definition) in samples::catalog() {
        control.register(name, definition).unwrap();
    }

    let started = control.start("approval", BTreeMap::new()).unwrap();
    assert_eq!(started.status, WorkflowStatus::Executing);
    assert_eq!(started.bookmarks, vec!["approve".to_string()]);
    assert_eq!(control.bookmarks(&started.id).unwrap(), vec!["approve".to_string()]);
    assert_eq!(control.list().len(), 1);

    let (result, summary) = control.resume(&started.id, "approve", json!("yes")).unwrap();
    assert_eq!(result, BookmarkResumptionResult::Success);
    assert_eq!(summary.status, WorkflowStatus::Closed);
    assert_eq!(summary.outputs.get("Decision"), Some(&json!("yes")));

    let (missing, _) = control.resume(&started.id, "approve", json!("again")).unwrap();
    assert_eq!(missing, BookmarkResumptionResult::NotFound);

    let status = control.status();
    assert_eq!(status.persisted, 1);
    assert_eq!(status.executing, 0);
}

#[test]
fn test_control_cancel_and_unknown_instance() {
    let temp = TempDir::new().unwrap();
    let mut control = Control::new(Runtime::new(init(&temp)).unwrap());
    control.register("fan-out", samples::fan_out()).unwrap();

    let started = control.start("fan-out", BTreeMap::new()).unwrap();
    assert_eq!(started.bookmarks.len(), 2);
    let canceled = control.cancel(&started.id).unwrap();
    assert_eq!(canceled.status, WorkflowStatus::Canceled);
    assert!(canceled.bookmarks.is_empty());

    assert!(matches!(
        control.inspect(&Uuid::new_v4()),
        Err(RuntimeError::Snapshot(SnapshotError::NotFound(_)))
    ));
    assert!(matches!(control.start("nope", BTreeMap::new()), Err(RuntimeError::Config(_))));
}
