//! Integration tests for workflow execution
//!
//! Drives executors built from the activity library through completion,
//! faults, cancellation and abort.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use trellis::activities::{
    Assign, MemoryLogSink, LogSink, Parallel, Sequence, Throw, TryCatch, WaitForBookmark, WriteLog,
};
use trellis::runtime::activity::{Activity, Argument, Variable};
use trellis::runtime::executor::{ActivityExecutor, UnhandledExceptionAction};
use trellis::runtime::extension::ExtensionRegistry;
use trellis::runtime::handle::HandleFactoryRegistry;
use trellis::runtime::tree::ActivityTree;
use trellis::runtime::{BookmarkResumptionResult, RuntimeConfig, ValueKind, WorkflowEvent, WorkflowStatus};

fn executor_with(root: Activity, config: RuntimeConfig) -> (ActivityExecutor, Arc<MemoryLogSink>) {
    let sink = Arc::new(MemoryLogSink::default());
    let extensions = ExtensionRegistry::new().with::<dyn LogSink>(sink.clone());
    let tree = ActivityTree::cache(root.build(), &HandleFactoryRegistry::with_builtins()).unwrap();
    let mut executor = ActivityExecutor::new(tree, config, extensions);
    executor.schedule_root(BTreeMap::new()).unwrap();
    (executor, sink)
}

fn executor(root: Activity) -> (ActivityExecutor, Arc<MemoryLogSink>) {
    executor_with(root, RuntimeConfig::default())
}

#[test]
fn test_root_inputs_reach_children() {
    let root = Sequence::activity("greet")
        .argument(Argument::input("Name", ValueKind::String).required())
        .child(WriteLog::value_of("Name"));
    let tree = ActivityTree::cache(root.build(), &HandleFactoryRegistry::with_builtins()).unwrap();

    let sink = Arc::new(MemoryLogSink::default());
    let extensions = ExtensionRegistry::new().with::<dyn LogSink>(sink.clone());
    let mut executor = ActivityExecutor::new(tree, RuntimeConfig::default(), extensions);
    executor
        .schedule_root(BTreeMap::from([("Name".to_string(), json!("ada"))]))
        .unwrap();

    assert_eq!(executor.run(), WorkflowStatus::Closed);
    assert_eq!(sink.lines(), vec!["ada"]);
}

#[test]
fn test_wrongly_typed_input_rejected() {
    let root = Sequence::activity("greet").argument(Argument::input("Name", ValueKind::String));
    let tree = ActivityTree::cache(root.build(), &HandleFactoryRegistry::with_builtins()).unwrap();
    let mut executor = ActivityExecutor::new(tree, RuntimeConfig::default(), ExtensionRegistry::new());

    assert!(executor
        .schedule_root(BTreeMap::from([("Name".to_string(), json!(5))]))
        .is_err());
    assert!(executor.root_instance().is_none());
}

#[test]
fn test_invalid_binding_fails_validation() {
    let root = Sequence::activity("bad")
        .argument(Argument::output("Out", ValueKind::Any))
        .child(WriteLog::value_of("Out"));
    let errors = ActivityTree::cache(root.build(), &HandleFactoryRegistry::with_builtins()).unwrap_err();
    assert!(errors.to_string().contains("write-only"));

    let root = Sequence::activity("missing").child(WriteLog::value_of("nowhere"));
    assert!(ActivityTree::cache(root.build(), &HandleFactoryRegistry::with_builtins()).is_err());
}

#[test]
fn test_idle_event_lists_bookmarks() {
    let (mut executor, _sink) = executor(WaitForBookmark::named("approve"));
    executor.run();

    let events = executor.take_events();
    let idle = events.iter().find_map(|event| match event {
        WorkflowEvent::Idle { bookmarks } => Some(bookmarks.clone()),
        _ => None,
    });
    assert_eq!(idle.map(|bookmarks| bookmarks.len()), Some(1));
    assert!(events.iter().any(|event| matches!(event, WorkflowEvent::PersistableIdle)));
}

#[test]
fn test_completed_event_carries_outputs() {
    let root = Sequence::activity("answer")
        .argument(Argument::output("Answer", ValueKind::Number))
        .child(Assign::literal("Answer", 42));
    let (mut executor, _sink) = executor(root);
    assert_eq!(executor.run(), WorkflowStatus::Closed);

    let completed = executor.take_events().into_iter().find_map(|event| match event {
        WorkflowEvent::Completed { state, outputs, fault } => Some((state, outputs, fault)),
        _ => None,
    });
    let (state, outputs, fault) = completed.unwrap();
    assert_eq!(state, WorkflowStatus::Closed);
    assert_eq!(outputs.get("Answer"), Some(&json!(42)));
    assert!(fault.is_none());
}

#[test]
fn test_caught_fault_lets_sequence_continue() {
    let root = Sequence::activity("main").children([
        TryCatch::activity(
            "guard",
            Throw::message("transient"),
            Some(WriteLog::literal("recovered").build()),
            None,
        ),
        WriteLog::literal("next"),
    ]);
    let (mut executor, sink) = executor(root);
    assert_eq!(executor.run(), WorkflowStatus::Closed);
    assert_eq!(sink.lines(), vec!["recovered", "next"]);
}

#[test]
fn test_uncaught_fault_stops_enclosing_sequence() {
    let root = Sequence::activity("main").children([
        TryCatch::activity(
            "guard",
            Throw::message("boom"),
            None,
            Some(WriteLog::literal("finally").build()),
        ),
        WriteLog::literal("next"),
    ]);
    let (mut executor, sink) = executor(root);
    assert_eq!(executor.run(), WorkflowStatus::Faulted);
    assert_eq!(executor.completion_fault().map(|fault| fault.message.as_str()), Some("boom"));
    assert!(!sink.lines().contains(&"next".to_string()));
}

#[test]
fn test_fault_in_catch_propagates() {
    let root = TryCatch::activity(
        "guard",
        Throw::message("first"),
        Some(Throw::message("second").build()),
        None,
    );
    let (mut executor, _sink) = executor(root);
    assert_eq!(executor.run(), WorkflowStatus::Faulted);
    assert_eq!(executor.completion_fault().map(|fault| fault.message.as_str()), Some("second"));
}

#[test]
fn test_unhandled_fault_with_cancel_action() {
    let config = RuntimeConfig {
        unhandled_exception_action: UnhandledExceptionAction::Cancel,
        ..RuntimeConfig::default()
    };
    let root = Parallel::activity("both").children([WaitForBookmark::named("wait"), Throw::message("boom")]);
    let (mut executor, _sink) = executor_with(root, config);
    assert_eq!(executor.run(), WorkflowStatus::Canceled);
    assert!(executor.get_all_bookmarks().is_empty());
}

#[test]
fn test_unhandled_fault_with_abort_action() {
    let config = RuntimeConfig {
        unhandled_exception_action: UnhandledExceptionAction::Abort,
        ..RuntimeConfig::default()
    };
    let (mut executor, _sink) = executor_with(Throw::message("boom"), config);
    assert_eq!(executor.run(), WorkflowStatus::Aborted);
    assert_eq!(executor.abort_reason(), Some("boom"));
    assert!(executor
        .take_events()
        .iter()
        .any(|event| matches!(event, WorkflowEvent::Aborted { .. })));
}

#[test]
fn test_cancel_sequence_stops_remaining_children() {
    let root = Sequence::activity("main").children([
        WaitForBookmark::named("first"),
        WriteLog::literal("never"),
    ]);
    let (mut executor, sink) = executor(root);
    assert_eq!(executor.run(), WorkflowStatus::Executing);

    executor.cancel_root();
    assert_eq!(executor.run(), WorkflowStatus::Canceled);
    assert!(sink.lines().is_empty());
    assert_eq!(executor.resume_bookmark("first", json!(null)), BookmarkResumptionResult::NotFound);
}

#[test]
fn test_finally_runs_on_cancel() {
    let root = TryCatch::activity(
        "guard",
        WaitForBookmark::named("wait"),
        None,
        Some(WriteLog::literal("cleanup").build()),
    );
    let (mut executor, sink) = executor(root);
    executor.run();
    executor.cancel_root();
    assert_eq!(executor.run(), WorkflowStatus::Canceled);
    assert_eq!(sink.lines(), vec!["cleanup"]);
}

#[test]
fn test_abort_discards_everything() {
    let root = Parallel::activity("both").children([WaitForBookmark::named("a"), WaitForBookmark::named("b")]);
    let (mut executor, _sink) = executor(root);
    executor.run();

    executor.abort("operator request");
    assert_eq!(executor.run(), WorkflowStatus::Aborted);
    assert_eq!(executor.abort_reason(), Some("operator request"));
    assert!(executor.instances().is_empty());
    assert_eq!(executor.resume_bookmark("a", json!(null)), BookmarkResumptionResult::NotFound);
}

#[test]
fn test_terminate_completes_faulted() {
    let (mut executor, _sink) = executor(WaitForBookmark::named("wait"));
    executor.run();

    executor.terminate("shutting down");
    assert_eq!(executor.run(), WorkflowStatus::Faulted);
    assert_eq!(
        executor.completion_fault().map(|fault| fault.message.as_str()),
        Some("shutting down")
    );
}

#[test]
fn test_variables_scoped_per_instance() {
    // Each branch declares its own `n`; writes stay in the branch.
    let branch = |name: &str, value: i64| {
        Sequence::activity(name)
            .variable(Variable::new("n", ValueKind::Number))
            .children([Assign::literal("n", value), WriteLog::value_of("n")])
    };
    let root = Parallel::activity("both").children([branch("one", 1), branch("two", 2)]);
    let (mut executor, sink) = executor(root);
    assert_eq!(executor.run(), WorkflowStatus::Closed);

    let mut lines = sink.lines();
    lines.sort();
    assert_eq!(lines, vec!["1", "2"]);
}
