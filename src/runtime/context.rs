//! Execution context handed to activity callbacks
//!
//! One struct serves every callback kind. Each kind carries a capability set
//! and every operation checks it, so a code activity cannot schedule
//! children and an abort context can only read. A context is disposed when
//! its callback returns; any later use reports `ContextDisposed`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::async_op::AsyncCompletion;
use super::bookmark::{Bookmark, BookmarkOptions, BookmarkResumptionResult, BookmarkScope};
use super::error::{UsageError, UsageResult};
use super::executor::{ActivityExecutor, PendingAbort};
use super::handle::{BookmarkScopeHandle, Handle, RuntimeTransactionHandle};
use super::instance::{ActivityInstanceState, FaultRecord, InstanceId};
use super::location::{Location, LocationReference};
use super::transaction::Transaction;
use super::tree::{ActivityId, QualifiedId};
use super::value::Value;

const READ: u32 = 1;
const WRITE: u32 = 1 << 1;
const EXTENSIONS: u32 = 1 << 2;
const TRACK: u32 = 1 << 3;
const BOOKMARKS: u32 = 1 << 4;
const SCHEDULE: u32 = 1 << 5;
const CANCEL: u32 = 1 << 6;
const MARK_CANCELED: u32 = 1 << 7;
const HANDLES: u32 = 1 << 8;
const WORKFLOW: u32 = 1 << 9;
const TRANSACTION: u32 = 1 << 10;
const FAULT: u32 = 1 << 11;
const SET_TRANSACTION: u32 = 1 << 12;
const ABORT_INFO: u32 = 1 << 13;

const CODE: u32 = READ | WRITE | EXTENSIONS | TRACK;
const NATIVE: u32 =
    CODE | BOOKMARKS | SCHEDULE | CANCEL | MARK_CANCELED | HANDLES | WORKFLOW | TRANSACTION;

/// Callback kind a context was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Code activity body
    Code,
    /// Async code activity begin, end or cancel
    AsyncCode,
    /// Native activity body or callback
    Native,
    /// Fault callback
    Fault,
    /// Transaction-context callback
    Transaction,
    /// Abort notification
    Abort,
}

impl ContextKind {
    /// Name used in error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Code => "code",
            ContextKind::AsyncCode => "async code",
            ContextKind::Native => "native",
            ContextKind::Fault => "fault",
            ContextKind::Transaction => "transaction",
            ContextKind::Abort => "abort",
        }
    }

    fn capabilities(&self) -> u32 {
        match self {
            ContextKind::Code => CODE,
            ContextKind::AsyncCode => CODE | MARK_CANCELED,
            ContextKind::Native => NATIVE,
            ContextKind::Fault => NATIVE | FAULT,
            ContextKind::Transaction => NATIVE | SET_TRANSACTION,
            ContextKind::Abort => READ | EXTENSIONS | TRACK | ABORT_INFO,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an activity may do while one of its callbacks runs
pub struct ActivityContext<'a> {
    executor: &'a mut ActivityExecutor,
    instance: InstanceId,
    activity: ActivityId,
    kind: ContextKind,
    fault: Option<FaultRecord>,
    fault_handled: bool,
    transaction_set: bool,
    disposed: bool,
}

impl fmt::Debug for ActivityContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityContext")
            .field("instance", &self.instance)
            .field("activity", &self.activity)
            .field("kind", &self.kind)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(executor: &'a mut ActivityExecutor, instance: InstanceId, kind: ContextKind) -> Self {
        let activity = executor
            .instances
            .get(instance)
            .map(|instance| instance.activity)
            .unwrap_or_else(|| executor.tree.root());
        Self {
            executor,
            instance,
            activity,
            kind,
            fault: None,
            fault_handled: false,
            transaction_set: false,
            disposed: false,
        }
    }

    pub(crate) fn set_fault(&mut self, fault: FaultRecord) {
        self.fault = Some(fault);
    }

    pub(crate) fn is_fault_handled(&self) -> bool {
        self.fault_handled
    }

    pub(crate) fn dispose(&mut self) {
        self.disposed = true;
    }

    fn ensure(&self, operation: &'static str, capability: u32) -> UsageResult<()> {
        if self.disposed {
            return Err(UsageError::ContextDisposed);
        }
        if self.kind.capabilities() & capability == 0 {
            return Err(UsageError::CapabilityUnavailable {
                operation,
                context: self.kind.as_str(),
            });
        }
        Ok(())
    }

    /// Callback kind
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Executing instance
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Cached activity the instance runs
    pub fn activity_id(&self) -> ActivityId {
        self.activity
    }

    /// Display name of the executing activity
    pub fn activity_name(&self) -> &str {
        self.executor.tree.node(self.activity).name()
    }

    /// Qualified id of the executing activity
    pub fn qualified_id(&self) -> &QualifiedId {
        self.executor.tree.node(self.activity).qualified_id()
    }

    /// Workflow instance id
    pub fn workflow_id(&self) -> Uuid {
        self.executor.id
    }

    /// Host service of type `T`
    pub fn get_extension<T>(&self) -> UsageResult<Option<Arc<T>>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.ensure("get_extension", EXTENSIONS)?;
        Ok(self.executor.get_extension::<T>())
    }

    /// Record a tracking message for the executing activity
    pub fn track(&self, message: &str) -> UsageResult<()> {
        self.ensure("track", TRACK)?;
        tracing::info!(
            workflow = %self.executor.id,
            instance = %self.instance,
            activity = self.activity_name(),
            "{}",
            message
        );
        Ok(())
    }

    // ---- values ----

    fn reference(&self, name: &str) -> UsageResult<LocationReference> {
        self.executor
            .tree
            .lookup(self.activity, name)
            .cloned()
            .ok_or_else(|| UsageError::UnknownLocation(name.to_string()))
    }

    /// Whether a location called `name` is visible
    pub fn has_value(&self, name: &str) -> bool {
        self.executor.tree.lookup(self.activity, name).is_some()
    }

    /// Current value of the visible location called `name`
    pub fn get_value(&self, name: &str) -> UsageResult<Value> {
        let reference = self.reference(name)?;
        self.get_value_ref(&reference)
    }

    /// Store `value` in the visible location called `name`
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) -> UsageResult<()> {
        let reference = self.reference(name)?;
        self.set_value_ref(&reference, value)
    }

    /// Current value of `reference`
    pub fn get_value_ref(&self, reference: &LocationReference) -> UsageResult<Value> {
        Ok(reference.get_location_for_read(self)?.get().clone())
    }

    /// Store `value` through `reference`
    pub fn set_value_ref(&mut self, reference: &LocationReference, value: impl Into<Value>) -> UsageResult<()> {
        reference.get_location_for_write(self)?.set(value.into())
    }

    pub(crate) fn location(&self, reference: &LocationReference) -> UsageResult<&Location> {
        self.ensure("read a location", READ)?;
        self.executor.location(self.instance, reference)
    }

    pub(crate) fn location_mut(&mut self, reference: &LocationReference) -> UsageResult<&mut Location> {
        self.ensure("write a location", WRITE)?;
        self.executor.location_mut(self.instance, reference)
    }

    // ---- bookmarks ----

    /// Blocking, single-resume bookmark called `name` in the default scope
    pub fn create_bookmark(&mut self, name: &str, callback: &str) -> UsageResult<Bookmark> {
        self.create_bookmark_with(name, Some(callback), BookmarkOptions::NONE, BookmarkScope::DEFAULT)
    }

    /// Named bookmark with explicit options and scope
    pub fn create_bookmark_with(
        &mut self,
        name: &str,
        callback: Option<&str>,
        options: BookmarkOptions,
        scope: BookmarkScope,
    ) -> UsageResult<Bookmark> {
        self.ensure("create_bookmark", BOOKMARKS)?;
        if name.is_empty() {
            return Err(UsageError::EmptyBookmarkName);
        }
        self.executor.create_bookmark(
            self.instance,
            Some(Bookmark::new(name)),
            callback.map(str::to_string),
            options,
            scope,
        )
    }

    /// Unnamed bookmark that only the workflow itself can resume
    pub fn create_internal_bookmark(&mut self, callback: &str, options: BookmarkOptions) -> UsageResult<Bookmark> {
        self.ensure("create_internal_bookmark", BOOKMARKS)?;
        self.executor.create_bookmark(
            self.instance,
            None,
            Some(callback.to_string()),
            options,
            BookmarkScope::DEFAULT,
        )
    }

    /// Remove a bookmark this instance owns in the default scope
    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> UsageResult<bool> {
        self.remove_bookmark_in_scope(bookmark, BookmarkScope::DEFAULT)
    }

    /// Remove a bookmark this instance owns in `scope`
    pub fn remove_bookmark_in_scope(&mut self, bookmark: &Bookmark, scope: BookmarkScope) -> UsageResult<bool> {
        self.ensure("remove_bookmark", BOOKMARKS)?;
        self.executor.remove_bookmark(self.instance, bookmark, scope)
    }

    /// Remove every bookmark this instance owns
    pub fn remove_all_bookmarks(&mut self) -> UsageResult<()> {
        self.ensure("remove_all_bookmarks", BOOKMARKS)?;
        self.executor.remove_all_bookmarks(self.instance);
        Ok(())
    }

    /// Resume a bookmark from inside the workflow. The resumption runs next.
    pub fn resume_bookmark(&mut self, bookmark: &Bookmark, value: Value) -> UsageResult<BookmarkResumptionResult> {
        self.resume_bookmark_in_scope(bookmark, BookmarkScope::DEFAULT, value)
    }

    /// Resume a bookmark registered in `scope` from inside the workflow
    pub fn resume_bookmark_in_scope(
        &mut self,
        bookmark: &Bookmark,
        scope: BookmarkScope,
        value: Value,
    ) -> UsageResult<BookmarkResumptionResult> {
        self.ensure("resume_bookmark", BOOKMARKS)?;
        Ok(self.executor.try_resume(bookmark, scope, value, false))
    }

    // ---- children ----

    /// Number of public children the activity declares
    pub fn child_count(&self) -> usize {
        self.executor.tree.node(self.activity).children().len()
    }

    /// Schedule the public child at `index`
    pub fn schedule_child(
        &mut self,
        index: usize,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> UsageResult<InstanceId> {
        self.ensure("schedule_child", SCHEDULE)?;
        let child = self
            .executor
            .tree
            .node(self.activity)
            .children()
            .get(index)
            .copied()
            .ok_or(UsageError::UnknownChild(index))?;
        self.executor.schedule_activity(
            self.instance,
            child,
            on_completed.map(str::to_string),
            on_faulted.map(str::to_string),
            BTreeMap::new(),
        )
    }

    /// Schedule the handler of the delegate at `index` with `arguments`
    pub fn schedule_delegate(
        &mut self,
        index: usize,
        arguments: BTreeMap<String, Value>,
        on_completed: Option<&str>,
        on_faulted: Option<&str>,
    ) -> UsageResult<InstanceId> {
        self.ensure("schedule_delegate", SCHEDULE)?;
        let handler = self
            .executor
            .tree
            .node(self.activity)
            .delegate_handler(index)
            .ok_or(UsageError::UnknownDelegate(index))?;
        self.executor.schedule_activity(
            self.instance,
            handler,
            on_completed.map(str::to_string),
            on_faulted.map(str::to_string),
            arguments,
        )
    }

    /// Live children of the executing instance, in scheduling order
    pub fn child_instances(&self) -> UsageResult<Vec<InstanceId>> {
        self.ensure("child_instances", SCHEDULE)?;
        Ok(self
            .executor
            .instances
            .get(self.instance)
            .map(|instance| instance.children.clone())
            .unwrap_or_default())
    }

    /// State of a live child
    pub fn child_state(&self, child: InstanceId) -> UsageResult<ActivityInstanceState> {
        self.ensure("child_state", SCHEDULE)?;
        self.require_child(child)?;
        self.executor
            .instances
            .get(child)
            .map(|instance| instance.state)
            .ok_or(UsageError::InstanceNotFound(child.0))
    }

    fn require_child(&self, child: InstanceId) -> UsageResult<()> {
        match self.executor.instances.get(child) {
            Some(instance) if instance.parent == Some(self.instance) => Ok(()),
            Some(_) => Err(UsageError::NotChildInstance(child.0)),
            None => Err(UsageError::InstanceNotFound(child.0)),
        }
    }

    // ---- cancellation ----

    /// Request cancellation of a child
    pub fn cancel_child(&mut self, child: InstanceId) -> UsageResult<()> {
        self.ensure("cancel_child", CANCEL)?;
        self.require_child(child)?;
        self.executor.cancel_instance(child);
        Ok(())
    }

    /// Request cancellation of every live child, latest first
    pub fn cancel_children(&mut self) -> UsageResult<()> {
        self.ensure("cancel_children", CANCEL)?;
        let children = self
            .executor
            .instances
            .get(self.instance)
            .map(|instance| instance.children.clone())
            .unwrap_or_default();
        for child in children.into_iter().rev() {
            self.executor.cancel_instance(child);
        }
        Ok(())
    }

    /// Abort a child and its subtree. The child completes faulted.
    pub fn abort_child_instance(&mut self, child: InstanceId, reason: &str) -> UsageResult<()> {
        self.ensure("abort_child_instance", CANCEL)?;
        self.require_child(child)?;
        let fault = FaultRecord::from_message(reason, child, self.executor.display_name(child));
        self.executor.abort_instance(child, &fault);
        Ok(())
    }

    /// Whether cancellation was requested for the executing instance
    pub fn is_cancellation_requested(&self) -> bool {
        self.executor
            .instances
            .get(self.instance)
            .is_some_and(|instance| instance.is_cancellation_requested)
    }

    /// Complete the executing instance as canceled
    pub fn mark_canceled(&mut self) -> UsageResult<()> {
        self.ensure("mark_canceled", MARK_CANCELED)?;
        let instance = self
            .executor
            .instances
            .get_mut(self.instance)
            .ok_or(UsageError::InstanceNotFound(self.instance.0))?;
        if !instance.is_cancellation_requested {
            return Err(UsageError::MarkCanceledWithoutRequest);
        }
        instance.marked_canceled = true;
        Ok(())
    }

    // ---- workflow ----

    /// Abort the whole workflow once this callback returns
    pub fn abort_workflow(&mut self, reason: &str) -> UsageResult<()> {
        self.ensure("abort_workflow", WORKFLOW)?;
        self.executor.request_abort(PendingAbort::Abort(reason.to_string()));
        Ok(())
    }

    /// Terminate the whole workflow once this callback returns
    pub fn terminate_workflow(&mut self, reason: &str) -> UsageResult<()> {
        self.ensure("terminate_workflow", WORKFLOW)?;
        self.executor.request_abort(PendingAbort::Terminate(reason.to_string()));
        Ok(())
    }

    /// Ask the host to persist at the next persistable point
    pub fn request_persist(&mut self) -> UsageResult<()> {
        self.ensure("request_persist", WORKFLOW)?;
        self.executor.persist_requested = true;
        Ok(())
    }

    // ---- handles ----

    /// Visible handle called `name`, checked against `tag`
    pub fn handle<T: Handle + 'static>(&self, name: &str, tag: &'static str) -> UsageResult<&T> {
        self.ensure("handle", HANDLES)?;
        self.executor.handle_slot(self.instance, name)?.downcast::<T>(tag)
    }

    /// Mutable access to the visible handle called `name`
    pub fn handle_mut<T: Handle + 'static>(&mut self, name: &str, tag: &'static str) -> UsageResult<&mut T> {
        self.ensure("handle", HANDLES)?;
        self.executor.handle_slot_mut(self.instance, name)?.downcast_mut::<T>(tag)
    }

    /// Enter the no-persist zone guarded by handle `name`
    pub fn enter_no_persist(&mut self, name: &str) -> UsageResult<()> {
        self.ensure("enter_no_persist", HANDLES)?;
        self.executor.enter_no_persist(self.instance, name)
    }

    /// Leave the no-persist zone guarded by handle `name`
    pub fn exit_no_persist(&mut self, name: &str) -> UsageResult<()> {
        self.ensure("exit_no_persist", HANDLES)?;
        self.executor.exit_no_persist(self.instance, name)
    }

    /// Register a new bookmark scope and attach it to handle `name`.
    ///
    /// Without an id the scope is temporary until `initialize_bookmark_scope`.
    pub fn create_bookmark_scope(&mut self, name: &str, id: Option<Uuid>) -> UsageResult<BookmarkScope> {
        self.ensure("create_bookmark_scope", HANDLES)?;
        self.executor.with_handle(self.instance, name, |slot, hctx| {
            let scope = hctx.bookmark_scopes()?.create_and_register_scope(id)?;
            slot.downcast_mut::<BookmarkScopeHandle>(BookmarkScopeHandle::TAG)?
                .attach(scope, hctx)?;
            Ok(scope)
        })
    }

    /// Give the temporary scope held by handle `name` its durable id
    pub fn initialize_bookmark_scope(&mut self, name: &str, id: Uuid) -> UsageResult<BookmarkScope> {
        self.ensure("initialize_bookmark_scope", HANDLES)?;
        self.executor.with_handle(self.instance, name, |slot, hctx| {
            let handle = slot.downcast_mut::<BookmarkScopeHandle>(BookmarkScopeHandle::TAG)?;
            let current = handle
                .scope()
                .ok_or_else(|| UsageError::HandleNotInitialized(name.to_string()))?;
            let scope = hctx.bookmark_scopes()?.initialize_scope(current, id)?;
            handle.set_scope(scope);
            Ok(scope)
        })
    }

    /// Scope currently held by handle `name`
    pub fn bookmark_scope(&self, name: &str) -> UsageResult<Option<BookmarkScope>> {
        let handle = self.handle::<BookmarkScopeHandle>(name, BookmarkScopeHandle::TAG)?;
        Ok(handle.scope().map(|scope| self.executor.scopes.canonical(scope)))
    }

    // ---- transactions ----

    /// Ask for a transaction context. `callback` runs once the workflow is
    /// idle and persistable.
    pub fn request_transaction_context(&mut self, callback: &str) -> UsageResult<()> {
        self.ensure("request_transaction_context", TRANSACTION)?;
        self.executor
            .request_transaction_context(self.instance, callback.to_string())
    }

    /// Bind `transaction` to handle `name`, making this instance the isolation scope
    pub fn set_runtime_transaction(&mut self, name: &str, transaction: Transaction) -> UsageResult<()> {
        self.ensure("set_runtime_transaction", SET_TRANSACTION)?;
        if self.transaction_set {
            return Err(UsageError::TransactionAlreadySet);
        }
        self.executor
            .set_runtime_transaction(self.instance, name, transaction)?;
        self.transaction_set = true;
        Ok(())
    }

    /// Commit the transaction this instance isolates
    pub fn complete_transaction(&mut self) -> UsageResult<()> {
        self.ensure("complete_transaction", TRANSACTION)?;
        self.executor.complete_transaction(self.instance)
    }

    /// Transaction bound to handle `name`, if any
    pub fn runtime_transaction(&self, name: &str) -> UsageResult<Option<Transaction>> {
        let handle = self.handle::<RuntimeTransactionHandle>(name, RuntimeTransactionHandle::TAG)?;
        Ok(handle.transaction().cloned())
    }

    // ---- fault and abort ----

    /// Fault being delivered
    pub fn fault(&self) -> UsageResult<&FaultRecord> {
        self.ensure("fault", FAULT)?;
        self.fault.as_ref().ok_or(UsageError::ContextDisposed)
    }

    /// Instance the fault originated from
    pub fn fault_source(&self) -> UsageResult<InstanceId> {
        Ok(self.fault()?.source)
    }

    /// Stop propagation. The faulting child is aborted.
    pub fn handle_fault(&mut self) -> UsageResult<()> {
        self.ensure("handle_fault", FAULT)?;
        self.fault_handled = true;
        Ok(())
    }

    /// Why the instance is being aborted
    pub fn abort_reason(&self) -> UsageResult<&FaultRecord> {
        self.ensure("abort_reason", ABORT_INFO)?;
        self.fault.as_ref().ok_or(UsageError::ContextDisposed)
    }

    // ---- async ----

    /// Drive `future` on the host and deliver its output to `completion`
    pub fn spawn(
        &self,
        completion: AsyncCompletion,
        future: futures::future::BoxFuture<'static, anyhow::Result<Value>>,
    ) -> UsageResult<()> {
        if self.disposed {
            return Err(UsageError::ContextDisposed);
        }
        if self.kind != ContextKind::AsyncCode {
            return Err(UsageError::CapabilityUnavailable {
                operation: "spawn",
                context: self.kind.as_str(),
            });
        }
        completion.spawn(future);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_by_kind() {
        assert_ne!(ContextKind::Native.capabilities() & SCHEDULE, 0);
        assert_eq!(ContextKind::Code.capabilities() & SCHEDULE, 0);
        assert_eq!(ContextKind::Code.capabilities() & BOOKMARKS, 0);
        assert_ne!(ContextKind::Fault.capabilities() & FAULT, 0);
        assert_eq!(ContextKind::Native.capabilities() & FAULT, 0);
        assert_ne!(ContextKind::Transaction.capabilities() & SET_TRANSACTION, 0);
        assert_eq!(ContextKind::Abort.capabilities() & WRITE, 0);
        assert_ne!(ContextKind::AsyncCode.capabilities() & MARK_CANCELED, 0);
    }
}
