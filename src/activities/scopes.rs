//! Scoping activities: fault handling, no-persist zones, transactions and
//! bookmark scopes

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::runtime::activity::{Activity, Argument, ChildCompletion, NativeActivity, Variable};
use crate::runtime::context::ActivityContext;
use crate::runtime::handle::{BookmarkScopeHandle, NoPersistHandle, RuntimeTransactionHandle};
use crate::runtime::instance::ActivityInstanceState;
use crate::runtime::transaction::Transaction;
use crate::runtime::value::{Value, ValueKind};

/// Variable a catch block reads the caught fault from
pub const EXCEPTION: &str = "Exception";

const CAUGHT: &str = "caught";
const PHASE: &str = "phase";
const BODY_DONE: &str = "body_done";

/// Runs a body, a catch block when the body faults, then a finally block.
///
/// The caught fault is exposed to the catch block as the `Exception`
/// variable: `{"message": .., "source": .., "chain": [..]}`. Without a
/// catch block faults are not handled and propagate to the parent.
pub struct TryCatch {
    has_catch: bool,
    has_finally: bool,
}

impl TryCatch {
    /// `body` guarded by an optional `catch` and `finally`
    pub fn activity(
        name: impl Into<String>,
        body: impl Into<Arc<Activity>>,
        catch: Option<Arc<Activity>>,
        finally: Option<Arc<Activity>>,
    ) -> Activity {
        let behavior = TryCatch {
            has_catch: catch.is_some(),
            has_finally: finally.is_some(),
        };
        Activity::native(name, behavior)
            .variable(Variable::new(EXCEPTION, ValueKind::Any))
            .implementation_variable(Variable::new(CAUGHT, ValueKind::Bool).with_default(false))
            .implementation_variable(Variable::new(PHASE, ValueKind::String).with_default("try"))
            .child(body)
            .children(catch)
            .children(finally)
    }

    fn finally_index(&self) -> usize {
        if self.has_catch { 2 } else { 1 }
    }

    fn run_finally(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        if self.has_finally {
            ctx.set_value(PHASE, "finally")?;
            ctx.schedule_child(self.finally_index(), Some("finally_done"), None)?;
        } else if ctx.is_cancellation_requested() {
            ctx.mark_canceled()?;
        }
        Ok(())
    }
}

impl NativeActivity for TryCatch {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        ctx.schedule_child(0, Some("try_done"), Some("try_faulted"))?;
        Ok(())
    }

    fn on_child_faulted(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> anyhow::Result<()> {
        if !self.has_catch {
            return Ok(());
        }
        let fault = ctx.fault()?;
        let exception = json!({
            "message": fault.message,
            "source": fault.source_activity,
            "chain": fault.chain,
        });
        tracing::debug!(activity = ctx.activity_name(), error = %fault.message, "fault caught");
        ctx.handle_fault()?;
        ctx.set_value(EXCEPTION, exception)?;
        ctx.set_value(CAUGHT, true)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        callback: &str,
        _completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        match callback {
            "try_done" => {
                let caught = ctx.get_value(CAUGHT)?.as_bool().unwrap_or_default();
                if caught && !ctx.is_cancellation_requested() {
                    ctx.set_value(PHASE, "catch")?;
                    ctx.schedule_child(1, Some("catch_done"), None)?;
                    Ok(())
                } else {
                    self.run_finally(ctx)
                }
            }
            "catch_done" => self.run_finally(ctx),
            _ => {
                if ctx.is_cancellation_requested() {
                    ctx.mark_canceled()?;
                }
                Ok(())
            }
        }
    }

    fn cancel(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        // A running finally block is allowed to finish.
        if ctx.get_value(PHASE)?.as_str() != Some("finally") {
            ctx.cancel_children()?;
        }
        if ctx.child_instances()?.is_empty() {
            ctx.mark_canceled()?;
        }
        Ok(())
    }
}

/// Keeps the workflow unpersistable while its body runs
pub struct NoPersistScope;

impl NoPersistScope {
    const GUARD: &'static str = "guard";

    /// `body` run inside a no-persist zone
    pub fn activity(name: impl Into<String>, body: impl Into<Arc<Activity>>) -> Activity {
        Activity::native(name, NoPersistScope)
            .handle(Self::GUARD, NoPersistHandle::TAG)
            .child(body)
    }
}

impl NativeActivity for NoPersistScope {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        ctx.enter_no_persist(Self::GUARD)?;
        ctx.schedule_child(0, Some(BODY_DONE), None)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        ctx.exit_no_persist(Self::GUARD)?;
        if ctx.is_cancellation_requested() {
            ctx.mark_canceled()?;
        }
        Ok(())
    }
}

/// Runs its body inside a runtime transaction.
///
/// The transaction commits when the body closes and rolls back when it
/// faults or is canceled.
pub struct TransactionScope;

impl TransactionScope {
    /// Handle the transaction is bound to
    pub const HANDLE: &'static str = "transaction";

    /// `body` run inside a fresh transaction
    pub fn activity(name: impl Into<String>, body: impl Into<Arc<Activity>>) -> Activity {
        Activity::native(name, TransactionScope)
            .handle(Self::HANDLE, RuntimeTransactionHandle::TAG)
            .child(body)
    }
}

impl NativeActivity for TransactionScope {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        ctx.request_transaction_context("begin")?;
        Ok(())
    }

    fn on_transaction_context(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> anyhow::Result<()> {
        if ctx.is_cancellation_requested() {
            ctx.mark_canceled()?;
            return Ok(());
        }
        ctx.set_runtime_transaction(Self::HANDLE, Transaction::new())?;
        ctx.schedule_child(0, Some(BODY_DONE), None)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        if completed.state == ActivityInstanceState::Closed {
            ctx.complete_transaction()?;
        }
        if ctx.is_cancellation_requested() {
            ctx.mark_canceled()?;
        }
        Ok(())
    }
}

/// Registers a bookmark scope for its body under the handle `correlation`.
///
/// A non-null `CorrelationId` argument makes the scope durable right away;
/// otherwise it stays temporary until an `InitializeCorrelation` inside the
/// body assigns its id.
pub struct CorrelationScope;

impl CorrelationScope {
    /// Handle holding the scope
    pub const HANDLE: &'static str = "correlation";

    /// `body` inside a scope whose id is supplied later
    pub fn activity(name: impl Into<String>, body: impl Into<Arc<Activity>>) -> Activity {
        Activity::native(name, CorrelationScope)
            .handle(Self::HANDLE, BookmarkScopeHandle::TAG)
            .argument(Argument::input("CorrelationId", ValueKind::Any))
            .child(body)
    }

    /// `body` inside the durable scope `id`
    pub fn with_id(name: impl Into<String>, id: Uuid, body: impl Into<Arc<Activity>>) -> Activity {
        Activity::native(name, CorrelationScope)
            .handle(Self::HANDLE, BookmarkScopeHandle::TAG)
            .argument(Argument::input("CorrelationId", ValueKind::Any).literal(id.to_string()))
            .child(body)
    }
}

fn parse_correlation_id(value: &Value) -> anyhow::Result<Option<Uuid>> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(Uuid::parse_str(text)?)),
        other => anyhow::bail!("correlation id must be a uuid string, got {}", other),
    }
}

impl NativeActivity for CorrelationScope {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        let id = parse_correlation_id(&ctx.get_value("CorrelationId")?)?;
        let scope = ctx.create_bookmark_scope(Self::HANDLE, id)?;
        tracing::debug!(%scope, activity = ctx.activity_name(), "bookmark scope registered");
        ctx.schedule_child(0, Some(BODY_DONE), None)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        if ctx.is_cancellation_requested() {
            ctx.mark_canceled()?;
        }
        Ok(())
    }
}

/// Gives the temporary scope held by a visible bookmark-scope handle its durable id
pub struct InitializeCorrelation {
    handle: String,
}

impl InitializeCorrelation {
    /// Initialize the scope of the enclosing `CorrelationScope` with `id`
    pub fn literal(id: Uuid) -> Activity {
        Self::build().argument(Argument::input("CorrelationId", ValueKind::String).literal(id.to_string()))
    }

    /// Initialize the scope of the enclosing `CorrelationScope` from location `from`
    pub fn value_of(from: &str) -> Activity {
        Self::build().argument(Argument::input("CorrelationId", ValueKind::String).bind(from))
    }

    fn build() -> Activity {
        let behavior = InitializeCorrelation {
            handle: CorrelationScope::HANDLE.to_string(),
        };
        Activity::native("InitializeCorrelation", behavior)
    }
}

impl NativeActivity for InitializeCorrelation {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        let Some(id) = parse_correlation_id(&ctx.get_value("CorrelationId")?)? else {
            anyhow::bail!("correlation id is required");
        };
        ctx.initialize_bookmark_scope(&self.handle, id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::primitives::{Throw, WriteLog};
    use crate::activities::sequence::Sequence;
    use crate::activities::testing::start;
    use crate::activities::wait::WaitForBookmark;
    use crate::runtime::bookmark::{BookmarkResumptionResult, BookmarkScope};
    use crate::runtime::executor::WorkflowStatus;

    #[test]
    fn test_try_catch_runs_catch_then_finally() {
        let root = TryCatch::activity(
            "guarded",
            Sequence::activity("body").children([Throw::message("bad input"), WriteLog::literal("unreached")]),
            Some(WriteLog::value_of(EXCEPTION).build()),
            Some(WriteLog::literal("finally").build()),
        );
        let (mut executor, sink) = start(root);
        assert_eq!(executor.run(), WorkflowStatus::Closed);

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("bad input"));
        assert_eq!(lines[1], "finally");
    }

    #[test]
    fn test_try_without_catch_propagates() {
        let root = TryCatch::activity(
            "guarded",
            Throw::message("bad input"),
            None,
            Some(WriteLog::literal("finally").build()),
        );
        let (mut executor, _sink) = start(root);
        assert_eq!(executor.run(), WorkflowStatus::Faulted);
    }

    #[test]
    fn test_no_persist_scope_blocks_persistence() {
        let root = NoPersistScope::activity("critical", WaitForBookmark::named("go"));
        let (mut executor, _sink) = start(root);
        assert_eq!(executor.run(), WorkflowStatus::Executing);
        assert!(!executor.is_persistable());

        executor.resume_bookmark("go", Value::Null);
        assert_eq!(executor.run(), WorkflowStatus::Closed);
    }

    #[test]
    fn test_transaction_scope_commits_on_close() {
        let root = TransactionScope::activity("tx", WriteLog::literal("inside"));
        let (mut executor, sink) = start(root);
        assert_eq!(executor.run(), WorkflowStatus::Closed);
        assert_eq!(sink.lines(), vec!["inside"]);
        assert!(executor.is_persistable());
    }

    #[test]
    fn test_correlation_scope_partitions_bookmarks() {
        let id = Uuid::new_v4();
        let root = CorrelationScope::with_id("order", id, WaitForBookmark::in_scope("shipped", CorrelationScope::HANDLE));
        let (mut executor, _sink) = start(root);
        assert_eq!(executor.run(), WorkflowStatus::Executing);

        let scoped = executor.get_bookmarks(BookmarkScope::Durable(id));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].name, "shipped");
        assert!(executor.get_bookmarks(BookmarkScope::DEFAULT).is_empty());
        assert_eq!(executor.resume_bookmark("shipped", Value::Null), BookmarkResumptionResult::NotFound);

        assert_eq!(
            executor.resume_bookmark_in_scope("shipped", BookmarkScope::Durable(id), Value::Null),
            BookmarkResumptionResult::Success
        );
        assert_eq!(executor.run(), WorkflowStatus::Closed);
    }

    #[test]
    fn test_temporary_scope_initialized_from_body() {
        let id = Uuid::new_v4();
        let body = Sequence::activity("body").children([
            InitializeCorrelation::literal(id),
            WaitForBookmark::in_scope("shipped", CorrelationScope::HANDLE),
        ]);
        let (mut executor, _sink) = start(CorrelationScope::activity("order", body));
        assert_eq!(executor.run(), WorkflowStatus::Executing);
        assert_eq!(executor.get_bookmarks(BookmarkScope::Durable(id)).len(), 1);
    }
}
