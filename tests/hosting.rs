//! Integration tests for the workflow hosts
//!
//! Covers the tokio-hosted `WorkflowApplication` and the synchronous
//! `WorkflowInvoker`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use trellis::activities::{samples, InvokeAsync, Sequence, TransactionScope, WaitForBookmark, WriteLog};
use trellis::runtime::activity::{Argument, Variable};
use trellis::runtime::error::RuntimeError;
use trellis::runtime::extension::ExtensionRegistry;
use trellis::runtime::handle::HandleFactoryRegistry;
use trellis::runtime::tree::ActivityTree;
use trellis::runtime::{
    BookmarkResumptionResult, Runtime, RuntimeConfig, Transaction, TransactionCoordinator, Value, ValueKind,
    WorkflowApplication, WorkflowEvent, WorkflowInvoker, WorkflowStatus,
};

fn tree(root: Arc<trellis::runtime::activity::Activity>) -> Arc<ActivityTree> {
    ActivityTree::cache(root, &HandleFactoryRegistry::with_builtins()).unwrap()
}

fn doubling() -> trellis::runtime::activity::Activity {
    InvokeAsync::activity("double", |input: Value| {
        async move { Ok::<_, anyhow::Error>(json!(input.as_i64().unwrap_or_default() * 2)) }.boxed()
    })
}

#[tokio::test]
async fn test_application_resumes_bookmark() {
    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut executor = runtime.create_executor(tree(samples::approval()));
    executor.schedule_root(BTreeMap::new()).unwrap();

    let app = WorkflowApplication::new(executor);
    let mut events = app.subscribe();
    assert_eq!(app.run().await.unwrap(), WorkflowStatus::Executing);

    let bookmarks = app.bookmarks().await.unwrap();
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].name, "approve");

    let result = app.resume_bookmark("approve", json!("ok")).await.unwrap();
    assert_eq!(result, BookmarkResumptionResult::Success);
    assert_eq!(app.wait_for_completion().await.unwrap(), WorkflowStatus::Closed);
    assert_eq!(app.outputs().await.unwrap().get("Decision"), Some(&json!("ok")));

    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::Completed { state, .. } = event {
            assert_eq!(state, WorkflowStatus::Closed);
            completed = true;
        }
    }
    assert!(completed);
}

#[tokio::test]
async fn test_application_async_activity_completes_without_prompting() {
    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let root = Sequence::activity("main")
        .argument(Argument::output("Doubled", ValueKind::Any))
        .variable(Variable::new("x", ValueKind::Any).with_default(21))
        .children([InvokeAsync::bound("double", "x", "Doubled", |input: Value| {
            async move { Ok::<_, anyhow::Error>(json!(input.as_i64().unwrap_or_default() * 2)) }.boxed()
        })])
        .build();
    let mut executor = runtime.create_executor(tree(root));
    executor.schedule_root(BTreeMap::new()).unwrap();

    let app = WorkflowApplication::new(executor);
    assert_eq!(app.run().await.unwrap(), WorkflowStatus::Executing);
    assert_eq!(app.wait_for_completion().await.unwrap(), WorkflowStatus::Closed);
    assert_eq!(app.outputs().await.unwrap().get("Doubled"), Some(&json!(42)));
}

#[tokio::test]
async fn test_application_unload_persists() {
    let temp = TempDir::new().unwrap();
    let config = RuntimeConfig {
        root: temp.path().to_path_buf(),
        ..RuntimeConfig::default()
    };
    Runtime::init(config.clone()).unwrap();
    let runtime = Runtime::new(config).unwrap();

    let mut executor = runtime.create_executor(runtime.cache(samples::approval()).unwrap());
    executor.schedule_root(BTreeMap::new()).unwrap();
    let app = WorkflowApplication::with_store(executor, runtime.store().clone());
    let id = app.id();
    app.run().await.unwrap();
    app.unload().await.unwrap();

    assert!(runtime.store().contains(&id));
    let restored = runtime.restore(runtime.cache(samples::approval()).unwrap(), &id).unwrap();
    assert_eq!(restored.state(), WorkflowStatus::Executing);
}

#[tokio::test]
async fn test_application_without_store_cannot_persist() {
    let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
    let mut executor = runtime.create_executor(tree(WaitForBookmark::named("x").build()));
    executor.schedule_root(BTreeMap::new()).unwrap();
    let app = WorkflowApplication::new(executor);
    app.run().await.unwrap();
    assert!(matches!(app.persist().await, Err(RuntimeError::Config(_))));

    assert_eq!(app.cancel().await.unwrap(), WorkflowStatus::Canceled);
    assert_eq!(app.status(), WorkflowStatus::Canceled);
}

#[test]
fn test_invoker_returns_outputs() {
    let root = Sequence::activity("main")
        .argument(Argument::input("Value", ValueKind::Number))
        .argument(Argument::output("Doubled", ValueKind::Any))
        .children([InvokeAsync::bound("double", "Value", "Doubled", |input: Value| {
            async move { Ok::<_, anyhow::Error>(json!(input.as_i64().unwrap_or_default() * 2)) }.boxed()
        })])
        .build();
    let invoker = WorkflowInvoker::new(tree(root)).with_timeout(Duration::from_secs(5));

    let outputs = invoker
        .invoke(BTreeMap::from([("Value".to_string(), json!(4))]))
        .unwrap();
    assert_eq!(outputs.get("Doubled"), Some(&json!(8)));
}

#[test]
fn test_invoker_fails_when_idle_on_bookmarks() {
    let invoker = WorkflowInvoker::new(tree(samples::approval()));
    match invoker.invoke(BTreeMap::new()) {
        Err(RuntimeError::IdleWithBookmarks(bookmarks)) => assert_eq!(bookmarks, vec!["approve".to_string()]),
        other => panic!("expected idle error, got {:?}", other),
    }
}

#[test]
fn test_invoke_async_operation() {
    let invoker = WorkflowInvoker::new(tree(doubling().build()));
    let operation = invoker.invoke_async(BTreeMap::from([("Input".to_string(), json!(5))]));
    let outputs = operation.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outputs.get("Result"), Some(&json!(10)));
}

#[derive(Default)]
struct RecordingCoordinator {
    log: Mutex<Vec<String>>,
}

impl TransactionCoordinator for RecordingCoordinator {
    fn begin(&self, _transaction: &Transaction) -> anyhow::Result<()> {
        self.log.lock().push("begin".into());
        Ok(())
    }

    fn commit(&self, _transaction: &Transaction) -> anyhow::Result<()> {
        self.log.lock().push("commit".into());
        Ok(())
    }

    fn rollback(&self, _transaction: &Transaction, _reason: &str) {
        self.log.lock().push("rollback".into());
    }
}

#[test]
fn test_transaction_coordinator_sees_commit_and_rollback() {
    let coordinator = Arc::new(RecordingCoordinator::default());
    let extensions = ExtensionRegistry::new().with::<dyn TransactionCoordinator>(coordinator.clone());

    let committed = TransactionScope::activity("tx", WriteLog::literal("work")).build();
    WorkflowInvoker::new(tree(committed))
        .with_extensions(extensions.clone())
        .invoke(BTreeMap::new())
        .unwrap();
    assert_eq!(*coordinator.log.lock(), vec!["begin", "commit"]);

    let failed = TransactionScope::activity("tx", trellis::activities::Throw::message("bad")).build();
    let error = WorkflowInvoker::new(tree(failed))
        .with_extensions(extensions)
        .invoke(BTreeMap::new())
        .unwrap_err();
    assert!(matches!(error, RuntimeError::Faulted(_)));
    assert_eq!(*coordinator.log.lock(), vec!["begin", "commit", "begin", "rollback"]);
}
