//! Activity executor
//!
//! The executor owns every piece of per-workflow state: the instance map, the
//! ready queue, the bookmark tables, outstanding asynchronous operations, the
//! runtime transaction and the completion result. It is driven from a single
//! thread. The only things that cross threads are completion signals posted
//! to its `Inbox`, which `run` drains before and between work items.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::RuntimeConfig;
use super::activity::{ActivityBehavior, AsyncCodeActivity, ChildCompletion, RESULT_ARGUMENT};
use super::async_op::{AsyncCompletion, AsyncCompletionSignal, AsyncOperationContext, AsyncOperationState, Inbox};
use super::bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkOptions, BookmarkRecord, BookmarkResumptionResult,
    BookmarkScope, BookmarkScopeManager, Resumption,
};
use super::context::{ActivityContext, ContextKind};
use super::error::{UsageError, UsageResult};
use super::extension::ExtensionRegistry;
use super::handle::{HandleInitializationContext, HandleSlot, NoPersistHandle, RuntimeTransactionHandle};
use super::instance::{ActivityInstance, ActivityInstanceState, FaultRecord, InstanceId, InstanceMap};
use super::location::{Location, LocationEnvironment, LocationReference, Slot};
use super::quack::Quack;
use super::scheduler::{Scheduler, WorkItem};
use super::transaction::{RuntimeTransaction, Transaction, TransactionCoordinator, TransactionWaiter};
use super::tree::{ActivityId, ActivityTree, LocalInit, TreeNode};
use super::value::{Value, ValueKind};

/// Workflow-level execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Root scheduled or running
    Executing,
    /// Root completed normally
    Closed,
    /// Root completed canceled
    Canceled,
    /// Root completed faulted or the workflow was terminated
    Faulted,
    /// Workflow torn down without completing
    Aborted,
}

impl WorkflowStatus {
    /// Whether the workflow can do no further work
    pub fn is_final(&self) -> bool {
        !matches!(self, WorkflowStatus::Executing)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::Closed => "closed",
            WorkflowStatus::Canceled => "canceled",
            WorkflowStatus::Faulted => "faulted",
            WorkflowStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What happens to a fault nobody handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnhandledExceptionAction {
    /// Abort the root and complete the workflow faulted
    #[default]
    Terminate,
    /// Abort the faulting instance and cancel the root
    Cancel,
    /// Abort the workflow
    Abort,
}

/// Notification raised for the host
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Nothing is ready to run
    Idle {
        /// Named bookmarks the workflow is waiting on
        bookmarks: Vec<BookmarkInfo>,
    },
    /// Idle and safe to persist
    PersistableIdle,
    /// The root completed
    Completed {
        /// Final status
        state: WorkflowStatus,
        /// Root outputs, populated when closed
        outputs: BTreeMap<String, Value>,
        /// Termination or fault reason
        fault: Option<FaultRecord>,
    },
    /// A fault reached the root without a handler
    UnhandledException {
        /// The fault
        fault: FaultRecord,
    },
    /// The workflow was aborted
    Aborted {
        /// Why
        reason: String,
    },
    /// A bookmark scope lost its last handle and was unregistered
    ScopeUnregistered {
        /// The scope
        scope: BookmarkScope,
    },
}

/// Abort or terminate requested from inside a work item
#[derive(Debug, Clone)]
pub(crate) enum PendingAbort {
    Abort(String),
    Terminate(String),
}

/// Runs one workflow instance
pub struct ActivityExecutor {
    pub(crate) id: Uuid,
    pub(crate) tree: Arc<ActivityTree>,
    pub(crate) config: RuntimeConfig,
    pub(crate) extensions: ExtensionRegistry,
    pub(crate) instances: InstanceMap,
    pub(crate) root: Option<InstanceId>,
    pub(crate) scheduler: Scheduler,
    pub(crate) bookmarks: BookmarkManager,
    pub(crate) scopes: BookmarkScopeManager,
    pub(crate) operations: HashMap<InstanceId, AsyncOperationContext>,
    pub(crate) no_persist_count: u32,
    pub(crate) transaction: Option<RuntimeTransaction>,
    pub(crate) transaction_waiters: Quack<TransactionWaiter>,
    pub(crate) root_cancel_pending: bool,
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) status: WorkflowStatus,
    pub(crate) completion_fault: Option<FaultRecord>,
    pub(crate) outputs: BTreeMap<String, Value>,
    pub(crate) abort_reason: Option<String>,
    pub(crate) pending_abort: Option<PendingAbort>,
    pub(crate) persist_requested: bool,
    pub(crate) events: Vec<WorkflowEvent>,
    pub(crate) disposed: bool,
}

impl fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("instances", &self.instances.len())
            .field("pending_work", &self.scheduler.pending_count())
            .field("bookmarks", &self.bookmarks.len())
            .finish()
    }
}

impl ActivityExecutor {
    /// Executor for a fresh workflow instance over `tree`
    pub fn new(tree: Arc<ActivityTree>, config: RuntimeConfig, extensions: ExtensionRegistry) -> Self {
        Self::with_id(Uuid::new_v4(), tree, config, extensions)
    }

    /// Executor with a caller-chosen instance id
    pub fn with_id(
        id: Uuid,
        tree: Arc<ActivityTree>,
        config: RuntimeConfig,
        extensions: ExtensionRegistry,
    ) -> Self {
        Self {
            id,
            tree,
            config,
            extensions,
            instances: InstanceMap::new(),
            root: None,
            scheduler: Scheduler::new(),
            bookmarks: BookmarkManager::new(),
            scopes: BookmarkScopeManager::new(),
            operations: HashMap::new(),
            no_persist_count: 0,
            transaction: None,
            transaction_waiters: Quack::new(),
            root_cancel_pending: false,
            inbox: Inbox::new(),
            status: WorkflowStatus::Executing,
            completion_fault: None,
            outputs: BTreeMap::new(),
            abort_reason: None,
            pending_abort: None,
            persist_requested: false,
            events: Vec::new(),
            disposed: false,
        }
    }

    /// Workflow instance id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cached definition
    pub fn tree(&self) -> &Arc<ActivityTree> {
        &self.tree
    }

    /// Configuration the executor runs with
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Workflow-level state
    pub fn state(&self) -> WorkflowStatus {
        self.status
    }

    /// Root outputs, populated once the root closes
    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Reason the workflow terminated or faulted
    pub fn completion_fault(&self) -> Option<&FaultRecord> {
        self.completion_fault.as_ref()
    }

    /// Reason the workflow was aborted
    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Live activity instances
    pub fn instances(&self) -> &InstanceMap {
        &self.instances
    }

    /// Root instance, once scheduled
    pub fn root_instance(&self) -> Option<InstanceId> {
        self.root
    }

    /// Inbox async operations post their completions to
    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    /// Host service of type `T`
    pub fn get_extension<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.extensions.get::<T>()
    }

    /// Take the notifications raised since the last call
    pub fn take_events(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether nothing is ready to run
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle() && !self.inbox.has_pending()
    }

    /// Whether asynchronous operations are outstanding
    pub fn has_pending_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    /// Whether a snapshot may be taken now
    pub fn is_persistable(&self) -> bool {
        self.is_idle()
            && self.no_persist_count == 0
            && self.transaction.is_none()
            && self.operations.is_empty()
            && !self.disposed
    }

    /// Why the executor is not persistable, if it is not
    pub fn persist_blocker(&self) -> Option<String> {
        if self.disposed {
            Some("the workflow instance was disposed".into())
        } else if !self.is_idle() {
            Some(format!("{} work item(s) are ready", self.scheduler.pending_count()))
        } else if self.transaction.is_some() {
            Some("a runtime transaction is active".into())
        } else if !self.operations.is_empty() {
            Some(format!("{} asynchronous operation(s) are outstanding", self.operations.len()))
        } else if self.no_persist_count > 0 {
            Some(format!("{} no-persist zone(s) are open", self.no_persist_count))
        } else {
            None
        }
    }

    /// Whether an activity asked to persist, clearing the request
    pub fn take_persist_request(&mut self) -> bool {
        std::mem::take(&mut self.persist_requested)
    }

    /// Create the root instance, applying `inputs` to its input arguments
    pub fn schedule_root(&mut self, inputs: BTreeMap<String, Value>) -> UsageResult<InstanceId> {
        if self.disposed || self.status.is_final() {
            return Err(UsageError::NotExecuting);
        }
        if self.root.is_some() {
            return Err(UsageError::RootAlreadyScheduled);
        }

        let root_activity = self.tree.root();
        let node = self.tree.node(root_activity);
        let mut assignments = Vec::with_capacity(inputs.len());
        for (name, value) in inputs {
            let slot = node
                .locals
                .iter()
                .position(|local| local.input && local.reference.name() == name)
                .ok_or_else(|| UsageError::UnknownInput(name.clone()))?;
            let kind = node.locals[slot].reference.kind();
            if !kind.accepts(&value) {
                return Err(UsageError::KindMismatch {
                    name,
                    expected: kind.to_string(),
                    found: ValueKind::of(&value).to_string(),
                });
            }
            assignments.push((slot, value));
        }

        let id = self.create_instance(root_activity, None, None, None, BTreeMap::new())?;
        self.root = Some(id);
        for (slot, value) in assignments {
            if let Some(Slot::Value(location)) = self
                .instances
                .get_mut(id)
                .and_then(|instance| instance.environment.as_mut())
                .and_then(|environment| environment.slots.get_mut(slot))
            {
                location.set(value)?;
            }
        }

        self.scheduler.push_work(WorkItem::ExecuteBody { instance: id });
        tracing::info!(workflow = %self.id, root = %id, activity = self.tree.node(root_activity).name(), "root scheduled");
        Ok(id)
    }

    /// Drain the inbox and run ready work until the workflow is idle or done
    pub fn run(&mut self) -> WorkflowStatus {
        if self.disposed {
            return self.status;
        }

        loop {
            self.drain_inbox();
            while self.status == WorkflowStatus::Executing {
                let Some(item) = self.scheduler.next_work() else {
                    break;
                };
                self.execute_work_item(item);
                self.apply_pending_abort();
                self.drain_inbox();
            }

            if self.status != WorkflowStatus::Executing || !self.serve_transaction_waiter() {
                break;
            }
        }

        if self.status == WorkflowStatus::Executing && self.root.is_some() {
            self.notify_idle();
        }
        self.status
    }

    /// Resume a bookmark in the default scope on behalf of the host
    pub fn resume_bookmark(&mut self, bookmark: impl Into<Bookmark>, value: Value) -> BookmarkResumptionResult {
        self.resume_bookmark_in_scope(bookmark, BookmarkScope::DEFAULT, value)
    }

    /// Resume a bookmark registered in `scope` on behalf of the host
    pub fn resume_bookmark_in_scope(
        &mut self,
        bookmark: impl Into<Bookmark>,
        scope: BookmarkScope,
        value: Value,
    ) -> BookmarkResumptionResult {
        let bookmark = bookmark.into();
        if self.disposed || self.status.is_final() {
            return BookmarkResumptionResult::NotFound;
        }
        let result = self.try_resume(&bookmark, scope, value, true);
        tracing::debug!(workflow = %self.id, %bookmark, %scope, ?result, "host resumption");
        result
    }

    /// Request cancellation of the root
    pub fn cancel_root(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        if self.instances.is_executing(root) {
            if self.transaction.is_some() {
                self.root_cancel_pending = true;
            } else {
                self.cancel_instance(root);
            }
        }
    }

    /// Abort the workflow immediately
    pub fn abort(&mut self, reason: impl Into<String>) {
        self.abort_workflow(reason.into());
    }

    /// Abort every instance and complete the workflow faulted
    pub fn terminate(&mut self, reason: impl Into<String>) {
        self.terminate_workflow(reason.into());
    }

    /// Named bookmarks across the default table and every scope
    pub fn get_all_bookmarks(&self) -> Vec<BookmarkInfo> {
        let display_name = |owner: InstanceId| self.display_name(owner);
        let mut infos = self.bookmarks.populate_bookmark_info(display_name);
        infos.extend(self.scopes.all_bookmarks(display_name));
        infos
    }

    /// Named bookmarks in one scope
    pub fn get_bookmarks(&self, scope: BookmarkScope) -> Vec<BookmarkInfo> {
        let display_name = |owner: InstanceId| self.display_name(owner);
        if scope.is_default() {
            self.bookmarks.populate_bookmark_info(display_name)
        } else {
            self.scopes.get_bookmarks(scope, display_name)
        }
    }

    /// Release everything the executor holds. Later resumptions report NotFound.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if self.transaction.is_some() {
            self.rollback_transaction("workflow instance disposed");
        }
        self.clear_runtime_state();
        self.disposed = true;
        tracing::debug!(workflow = %self.id, "executor disposed");
    }

    /// Whether `dispose` ran
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn display_name(&self, instance: InstanceId) -> String {
        self.instances
            .get(instance)
            .map(|instance| self.tree.node(instance.activity).name().to_string())
            .unwrap_or_else(|| format!("#{}", instance))
    }

    // ---- work loop ----

    fn execute_work_item(&mut self, item: WorkItem) {
        let instance = item.instance();
        if !self.instances.is_executing(instance) {
            tracing::debug!(kind = item.kind(), %instance, "dropping work for completed instance");
            return;
        }
        tracing::trace!(kind = item.kind(), %instance, "work item");

        match item {
            WorkItem::ExecuteBody { instance } => self.execute_body(instance),
            WorkItem::ResumeBookmark {
                instance,
                callback,
                bookmark,
                value,
            } => self.deliver_bookmark(instance, callback, bookmark, value),
            WorkItem::CompleteAsync { instance, result } => self.finish_async(instance, result),
            WorkItem::ChildCompleted {
                parent,
                callback,
                completion,
            } => {
                if let Some(instance) = self.instances.get_mut(parent) {
                    instance.pending_completions = instance.pending_completions.saturating_sub(1);
                }
                self.deliver_child_completion(parent, callback, completion)
            }
            WorkItem::ChildFaulted {
                parent,
                callback,
                fault,
                propagator,
            } => self.deliver_child_fault(parent, callback, fault, propagator),
            WorkItem::Cancel { instance } => self.deliver_cancel(instance),
            WorkItem::TransactionContext { instance, callback } => {
                self.deliver_transaction_context(instance, callback)
            }
            WorkItem::Empty { .. } => {}
        }

        self.try_complete(instance);
    }

    fn drain_inbox(&mut self) {
        for signal in self.inbox.drain() {
            self.complete_async_code_activity(signal);
        }
    }

    /// Bridge a completion posted from another thread into the ready queue
    pub(crate) fn complete_async_code_activity(&mut self, signal: AsyncCompletionSignal) {
        let AsyncCompletionSignal {
            instance,
            bookmark,
            result,
        } = signal;

        let still_active = match self.operations.get(&instance) {
            Some(operation) if *operation.bookmark() == bookmark => operation.is_still_active(),
            _ => {
                tracing::debug!(%instance, %bookmark, "ignoring stale async completion");
                return;
            }
        };

        let instances = &self.instances;
        match self
            .bookmarks
            .try_generate_work_item(&bookmark, |record| instances.is_executing(record.owner))
        {
            Resumption::Ready(_) => self
                .scheduler
                .enqueue_work(WorkItem::CompleteAsync { instance, result }),
            Resumption::NotReady | Resumption::NotFound if still_active => {
                self.abort_workflow(format!(
                    "asynchronous completion for instance {} could not be delivered",
                    instance
                ));
            }
            _ => tracing::debug!(%instance, "async completion arrived after cancellation"),
        }
    }

    fn notify_idle(&mut self) {
        if !self.scheduler.is_idle() || !self.operations.is_empty() {
            return;
        }
        let bookmarks = self.get_all_bookmarks();
        tracing::debug!(workflow = %self.id, bookmarks = bookmarks.len(), "workflow idle");
        self.events.push(WorkflowEvent::Idle { bookmarks });
        if self.is_persistable() {
            self.events.push(WorkflowEvent::PersistableIdle);
        }
    }

    fn apply_pending_abort(&mut self) {
        match self.pending_abort.take() {
            Some(PendingAbort::Abort(reason)) => self.abort_workflow(reason),
            Some(PendingAbort::Terminate(reason)) => self.terminate_workflow(reason),
            None => {}
        }
    }

    // ---- invoking behaviors ----

    fn behavior_of(&self, instance: InstanceId) -> Option<(ActivityBehavior, String)> {
        let instance = self.instances.get(instance)?;
        let node = self.tree.node(instance.activity);
        Some((node.activity.behavior().clone(), node.name().to_string()))
    }

    fn invoke<R>(
        &mut self,
        instance: InstanceId,
        kind: ContextKind,
        fault: Option<FaultRecord>,
        body: impl FnOnce(&mut ActivityContext<'_>) -> R,
    ) -> (R, bool) {
        let mut ctx = ActivityContext::new(self, instance, kind);
        if let Some(fault) = fault {
            ctx.set_fault(fault);
        }
        let result = body(&mut ctx);
        let handled = ctx.is_fault_handled();
        ctx.dispose();
        (result, handled)
    }

    fn fault_from(&self, instance: InstanceId, error: anyhow::Error) -> FaultRecord {
        FaultRecord::from_error(error, instance, self.display_name(instance))
    }

    fn execute_body(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if !instance.has_not_executed || instance.is_cancellation_requested {
            return;
        }
        instance.has_not_executed = false;

        if let Err(error) = self.resolve_arguments(id) {
            let fault = self.fault_from(id, error.into());
            self.propagate_fault(id, fault);
            return;
        }

        let Some((behavior, name)) = self.behavior_of(id) else {
            return;
        };
        tracing::debug!(instance = %id, activity = %name, kind = behavior.kind_name(), "executing");

        let result = match behavior {
            ActivityBehavior::Code(body) => self.invoke(id, ContextKind::Code, None, |ctx| body.execute(ctx)).0,
            ActivityBehavior::Native(body) => self.invoke(id, ContextKind::Native, None, |ctx| body.execute(ctx)).0,
            ActivityBehavior::AsyncCode(body) => self.begin_async(id, body),
        };
        if let Err(error) = result {
            let fault = self.fault_from(id, error);
            self.propagate_fault(id, fault);
        }
    }

    fn begin_async(&mut self, id: InstanceId, body: Arc<dyn AsyncCodeActivity>) -> anyhow::Result<()> {
        if self.operations.contains_key(&id) {
            return Err(UsageError::OperationAlreadyPending(id.0).into());
        }
        let record = self
            .bookmarks
            .create_internal(id, None, BookmarkOptions::NON_BLOCKING);
        self.operations
            .insert(id, AsyncOperationContext::new(id, record.bookmark.clone()));
        if let Some(instance) = self.instances.get_mut(id) {
            instance.busy_count += 1;
        }
        self.no_persist_count += 1;

        let completion = AsyncCompletion::new(id, record.bookmark, Arc::clone(&self.inbox));
        let (result, _) = self.invoke(id, ContextKind::AsyncCode, None, |ctx| {
            body.begin_execute(ctx, completion)
        });
        if result.is_err() {
            self.discard_operation(id);
        }
        result
    }

    fn finish_async(&mut self, id: InstanceId, result: anyhow::Result<Value>) {
        let Some(mut operation) = self.operations.remove(&id) else {
            return;
        };
        operation.complete_operation();
        if let Some(instance) = self.instances.get_mut(id) {
            instance.busy_count = instance.busy_count.saturating_sub(1);
        }
        self.no_persist_count = self.no_persist_count.saturating_sub(1);

        if operation.state() == AsyncOperationState::Canceled {
            if let Some(instance) = self.instances.get_mut(id) {
                instance.marked_canceled = true;
            }
            return;
        }

        if let Some((ActivityBehavior::AsyncCode(body), _)) = self.behavior_of(id) {
            let (outcome, _) = self.invoke(id, ContextKind::AsyncCode, None, |ctx| body.end_execute(ctx, result));
            if let Err(error) = outcome {
                let fault = self.fault_from(id, error);
                self.propagate_fault(id, fault);
            }
        }
    }

    fn deliver_bookmark(&mut self, id: InstanceId, callback: Option<String>, bookmark: Bookmark, value: Value) {
        let Some((ActivityBehavior::Native(body), _)) = self.behavior_of(id) else {
            return;
        };
        let callback = callback.unwrap_or_default();
        let (result, _) = self.invoke(id, ContextKind::Native, None, |ctx| {
            body.on_bookmark_resumed(ctx, &callback, &bookmark, value)
        });
        if let Err(error) = result {
            let fault = self.fault_from(id, error);
            self.propagate_fault(id, fault);
        }
    }

    fn deliver_child_completion(&mut self, parent: InstanceId, callback: String, completion: ChildCompletion) {
        let Some((ActivityBehavior::Native(body), _)) = self.behavior_of(parent) else {
            return;
        };
        let (result, _) = self.invoke(parent, ContextKind::Native, None, |ctx| {
            body.on_child_completed(ctx, &callback, &completion)
        });
        if let Err(error) = result {
            let fault = self.fault_from(parent, error);
            self.propagate_fault(parent, fault);
        }
    }

    fn deliver_child_fault(&mut self, parent: InstanceId, callback: String, fault: FaultRecord, propagator: InstanceId) {
        if !self.config.persist_exceptions {
            self.no_persist_count = self.no_persist_count.saturating_sub(1);
        }
        let Some((ActivityBehavior::Native(body), _)) = self.behavior_of(parent) else {
            self.propagate_fault(parent, fault);
            return;
        };

        tracing::debug!(handler = %parent, %propagator, error = %fault.message, "delivering fault");
        let (result, handled) = self.invoke(parent, ContextKind::Fault, Some(fault.clone()), |ctx| {
            body.on_child_faulted(ctx, &callback)
        });

        match result {
            Err(error) => {
                if self.instances.is_executing(propagator) {
                    self.abort_instance(propagator, &fault);
                }
                let fault = self.fault_from(parent, error);
                self.propagate_fault(parent, fault);
            }
            Ok(()) if handled => {
                if self.instances.is_executing(propagator) {
                    self.abort_instance(propagator, &fault);
                }
            }
            Ok(()) => self.propagate_fault(parent, fault),
        }
    }

    fn deliver_cancel(&mut self, id: InstanceId) {
        let Some((behavior, _)) = self.behavior_of(id) else {
            return;
        };
        let result = match behavior {
            ActivityBehavior::Code(_) => Ok(()),
            ActivityBehavior::AsyncCode(body) => {
                if let Some(operation) = self.operations.get_mut(&id) {
                    operation.cancel_operation();
                }
                self.invoke(id, ContextKind::AsyncCode, None, |ctx| body.cancel(ctx)).0
            }
            ActivityBehavior::Native(body) => self.invoke(id, ContextKind::Native, None, |ctx| body.cancel(ctx)).0,
        };
        if let Err(error) = result {
            let fault = self.fault_from(id, error);
            self.propagate_fault(id, fault);
        }
    }

    fn deliver_transaction_context(&mut self, id: InstanceId, callback: String) {
        let Some((ActivityBehavior::Native(body), _)) = self.behavior_of(id) else {
            return;
        };
        let (result, _) = self.invoke(id, ContextKind::Transaction, None, |ctx| {
            body.on_transaction_context(ctx, &callback)
        });
        if let Err(error) = result {
            let fault = self.fault_from(id, error);
            self.propagate_fault(id, fault);
        }
    }

    // ---- instance lifecycle ----

    pub(crate) fn create_instance(
        &mut self,
        activity: ActivityId,
        parent: Option<InstanceId>,
        completion_callback: Option<String>,
        fault_callback: Option<String>,
        mut delegate_arguments: BTreeMap<String, Value>,
    ) -> UsageResult<InstanceId> {
        let tree = Arc::clone(&self.tree);
        let node = tree.node(activity);

        let mut slots = Vec::with_capacity(node.locals.len());
        if node.needs_environment() {
            for local in &node.locals {
                let reference = &local.reference;
                let slot = match &local.init {
                    LocalInit::Value(value) => {
                        Slot::Value(Location::new(reference.name(), reference.kind(), value.clone()))
                    }
                    LocalInit::CopyFrom(_) => Slot::Value(Location::new(
                        reference.name(),
                        reference.kind(),
                        reference.kind().default_value(),
                    )),
                    LocalInit::Alias(target) => {
                        let from = parent.ok_or_else(|| UsageError::NotVisible(target.name().to_string()))?;
                        let (instance, slot) = self.resolve_slot(from, target)?;
                        Slot::Reference { instance, slot }
                    }
                    LocalInit::DelegateArgument => {
                        let mut location = Location::new(reference.name(), reference.kind(), reference.kind().default_value());
                        if let Some(value) = delegate_arguments.remove(reference.name()) {
                            location.set(value)?;
                        }
                        Slot::Value(location)
                    }
                };
                slots.push(slot);
            }
        }
        if let Some(name) = delegate_arguments.keys().next() {
            return Err(UsageError::UnknownLocation(name.clone()));
        }

        let id = self.instances.allocate_id();
        let environment = if node.needs_environment() {
            let handles = match self.initialize_handles(id, node) {
                Ok(handles) => handles,
                Err(error) => {
                    self.instances.release_id(id);
                    return Err(error);
                }
            };
            Some(LocationEnvironment::new(slots, handles))
        } else {
            None
        };

        let mut instance = ActivityInstance::new(id, activity, parent, completion_callback, fault_callback);
        instance.environment = environment;
        self.instances.insert(instance);
        if let Some(parent) = parent.and_then(|parent| self.instances.get_mut(parent)) {
            parent.children.push(id);
        }
        tracing::debug!(instance = %id, activity = node.name(), parent = ?parent.map(|p| p.0), "instance scheduled");
        Ok(id)
    }

    /// Initialize the handles `node` declares for instance `id`. On failure
    /// the handles initialized so far are uninitialized again.
    fn initialize_handles(&mut self, id: InstanceId, node: &TreeNode) -> UsageResult<Vec<HandleSlot>> {
        let mut handles: Vec<HandleSlot> = Vec::with_capacity(node.handles.len());
        for declared in &node.handles {
            let mut slot = HandleSlot::new(&declared.name, id, (declared.factory)());
            let mut hctx = HandleInitializationContext::new(id, &mut self.scopes, self.config.auto_disassociate_scopes);
            let initialized = slot.initialize(&mut hctx);
            let effects = hctx.dispose();
            self.apply_handle_effects(effects);

            if let Err(error) = initialized {
                for slot in handles.iter_mut().rev() {
                    let mut hctx =
                        HandleInitializationContext::new(id, &mut self.scopes, self.config.auto_disassociate_scopes);
                    slot.uninitialize(&mut hctx);
                    let effects = hctx.dispose();
                    self.apply_handle_effects(effects);
                }
                return Err(error);
            }
            handles.push(slot);
        }
        Ok(handles)
    }

    pub(crate) fn schedule_activity(
        &mut self,
        parent: InstanceId,
        activity: ActivityId,
        completion_callback: Option<String>,
        fault_callback: Option<String>,
        delegate_arguments: BTreeMap<String, Value>,
    ) -> UsageResult<InstanceId> {
        let id = self.create_instance(activity, Some(parent), completion_callback, fault_callback, delegate_arguments)?;
        self.scheduler.push_work(WorkItem::ExecuteBody { instance: id });
        Ok(id)
    }

    fn resolve_arguments(&mut self, id: InstanceId) -> UsageResult<()> {
        let Some(instance) = self.instances.get(id) else {
            return Ok(());
        };
        let Some(parent) = instance.parent else {
            return Ok(());
        };
        let tree = Arc::clone(&self.tree);
        for (index, local) in tree.node(instance.activity).locals.iter().enumerate() {
            if let LocalInit::CopyFrom(source) = &local.init {
                let value = self.location(parent, source)?.get().clone();
                if let Some(Slot::Value(location)) = self
                    .instances
                    .get_mut(id)
                    .and_then(|instance| instance.environment.as_mut())
                    .and_then(|environment| environment.slots.get_mut(index))
                {
                    location.set(value)?;
                }
            }
        }
        Ok(())
    }

    fn try_complete(&mut self, id: InstanceId) {
        let ready = self
            .instances
            .get(id)
            .is_some_and(|instance| instance.state == ActivityInstanceState::Executing && !instance.has_pending_work());
        if ready {
            self.complete_instance(id);
        }
    }

    fn build_completion(&self, id: InstanceId, state: ActivityInstanceState) -> ChildCompletion {
        let mut completion = ChildCompletion {
            instance: id,
            display_name: self.display_name(id),
            state,
            result: None,
            outputs: BTreeMap::new(),
        };
        let Some(instance) = self.instances.get(id) else {
            return completion;
        };
        let node = self.tree.node(instance.activity);
        for local in &node.locals {
            let reference = &local.reference;
            if local.output {
                if let Ok(location) = self.location(id, reference) {
                    completion
                        .outputs
                        .insert(reference.name().to_string(), location.get().clone());
                }
            }
            if reference.name() == RESULT_ARGUMENT && reference.access().can_write() {
                completion.result = self.location(id, reference).ok().map(|location| location.get().clone());
            }
        }
        completion
    }

    fn complete_instance(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let state = instance.completion_state();
        let parent = instance.parent;
        let completion_callback = instance.completion_callback.clone();
        let completion = self.build_completion(id, state);

        self.settle_transaction(id, state);
        self.cleanup_instance(id, state);
        tracing::debug!(instance = %id, activity = %completion.display_name, %state, "instance completed");

        if Some(id) == self.root {
            self.finish_workflow(state, completion);
            return;
        }
        if let Some(parent) = parent {
            match completion_callback {
                Some(callback) => {
                    if let Some(instance) = self.instances.get_mut(parent) {
                        instance.pending_completions += 1;
                    }
                    self.scheduler.push_work(WorkItem::ChildCompleted {
                        parent,
                        callback,
                        completion,
                    })
                }
                None => self.scheduler.push_work(WorkItem::Empty { instance: parent }),
            }
        }
    }

    fn cleanup_instance(&mut self, id: InstanceId, state: ActivityInstanceState) {
        if let Some(operation) = self.discard_operation(id) {
            tracing::debug!(instance = %id, state = ?operation.state(), "dropped outstanding async operation");
        }
        self.bookmarks.remove_all(id);
        self.scopes.remove_all(id);
        self.uninitialize_handles(id);
        while self.transaction_waiters.remove_first(|waiter| waiter.instance == id).is_some() {}
        self.scheduler.remove_for(id);

        if let Some(mut instance) = self.instances.remove(id) {
            instance.blocking_bookmarks = 0;
            instance.busy_count = 0;
            instance.waiting_for_transaction = false;
            instance.propagating_fault = false;
            instance.pending_completions = 0;
            instance.set_state(state);
            if let Some(parent) = instance.parent.and_then(|parent| self.instances.get_mut(parent)) {
                parent.children.retain(|child| *child != id);
            }
        }
    }

    fn discard_operation(&mut self, id: InstanceId) -> Option<AsyncOperationContext> {
        let operation = self.operations.remove(&id)?;
        let _ = self.bookmarks.remove(operation.bookmark(), id);
        if let Some(instance) = self.instances.get_mut(id) {
            instance.busy_count = instance.busy_count.saturating_sub(1);
        }
        self.no_persist_count = self.no_persist_count.saturating_sub(1);
        Some(operation)
    }

    fn uninitialize_handles(&mut self, id: InstanceId) {
        let Some(environment) = self
            .instances
            .get_mut(id)
            .and_then(|instance| instance.environment.as_mut())
        else {
            return;
        };

        let mut unregistered = Vec::new();
        let mut released = 0;
        for slot in environment.handles.iter_mut().rev() {
            let mut hctx = HandleInitializationContext::new(id, &mut self.scopes, self.config.auto_disassociate_scopes);
            slot.uninitialize(&mut hctx);
            let (scopes, no_persist) = hctx.dispose();
            unregistered.extend(scopes);
            released += no_persist;
        }
        self.apply_handle_effects((unregistered, released));
    }

    /// Apply what handle (un)initialization reported: released no-persist
    /// zones and unregistered bookmark scopes
    fn apply_handle_effects(&mut self, (unregistered, released): (Vec<(BookmarkScope, Vec<BookmarkRecord>)>, u32)) {
        self.no_persist_count = self.no_persist_count.saturating_sub(released);
        for (scope, orphaned) in unregistered {
            tracing::debug!(%scope, orphaned = orphaned.len(), "bookmark scope unregistered");
            self.release_orphaned(orphaned);
            self.events.push(WorkflowEvent::ScopeUnregistered { scope });
        }
    }

    pub(crate) fn release_orphaned(&mut self, records: Vec<BookmarkRecord>) {
        for record in records {
            if !record.is_blocking() {
                continue;
            }
            if let Some(owner) = self.instances.get_mut(record.owner) {
                owner.blocking_bookmarks = owner.blocking_bookmarks.saturating_sub(1);
                self.scheduler.push_work(WorkItem::Empty { instance: record.owner });
            }
        }
    }

    fn finish_workflow(&mut self, state: ActivityInstanceState, completion: ChildCompletion) {
        self.status = match state {
            ActivityInstanceState::Closed => WorkflowStatus::Closed,
            ActivityInstanceState::Canceled => WorkflowStatus::Canceled,
            ActivityInstanceState::Faulted | ActivityInstanceState::Executing => WorkflowStatus::Faulted,
        };
        if state == ActivityInstanceState::Closed {
            self.outputs = completion.outputs;
        }
        self.scheduler.clear();
        self.transaction_waiters.clear();
        tracing::info!(workflow = %self.id, status = %self.status, "workflow completed");
        self.events.push(WorkflowEvent::Completed {
            state: self.status,
            outputs: self.outputs.clone(),
            fault: self.completion_fault.clone(),
        });
    }

    // ---- cancellation ----

    pub(crate) fn cancel_instance(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if instance.state != ActivityInstanceState::Executing || instance.is_cancellation_requested {
            return;
        }
        instance.is_cancellation_requested = true;
        if instance.has_not_executed {
            self.scheduler.push_work(WorkItem::Empty { instance: id });
        } else {
            self.scheduler.push_work(WorkItem::Cancel { instance: id });
        }
        tracing::debug!(instance = %id, "cancel requested");
    }

    // ---- faults and aborts ----

    pub(crate) fn propagate_fault(&mut self, start: InstanceId, fault: FaultRecord) {
        tracing::warn!(
            source = %fault.source,
            activity = %fault.source_activity,
            error = %fault.message,
            "activity faulted"
        );

        // The faulting instance stays executing until a handler answers or
        // the propagation aborts it.
        if let Some(instance) = self.instances.get_mut(start) {
            instance.propagating_fault = true;
        }

        let mut current = Some(start);
        while let Some(id) = current {
            let Some(instance) = self.instances.get(id) else {
                break;
            };
            let parent = instance.parent;
            let fault_callback = instance.fault_callback.clone();
            let cancel_requested = instance.is_cancellation_requested;

            if self
                .transaction
                .as_ref()
                .is_some_and(|transaction| transaction.isolation_scope == id)
            {
                self.rollback_transaction(&fault.message);
                self.abort_instance(id, &fault);
                return;
            }

            if cancel_requested {
                self.abort_workflow(format!(
                    "cannot propagate a fault from '{}' while canceling: {}",
                    fault.source_activity, fault.message
                ));
                return;
            }

            if let (Some(callback), Some(parent)) = (fault_callback, parent) {
                if !self.config.persist_exceptions {
                    self.no_persist_count += 1;
                }
                self.scheduler.push_work(WorkItem::ChildFaulted {
                    parent,
                    callback,
                    fault,
                    propagator: id,
                });
                return;
            }
            current = parent;
        }

        self.handle_unhandled_fault(fault);
    }

    fn handle_unhandled_fault(&mut self, fault: FaultRecord) {
        tracing::warn!(workflow = %self.id, error = %fault.message, action = ?self.config.unhandled_exception_action, "unhandled fault");
        self.events.push(WorkflowEvent::UnhandledException { fault: fault.clone() });

        match self.config.unhandled_exception_action {
            UnhandledExceptionAction::Terminate => {
                self.completion_fault = Some(fault.clone());
                if let Some(root) = self.root.filter(|root| self.instances.is_executing(*root)) {
                    self.abort_instance(root, &fault);
                }
            }
            UnhandledExceptionAction::Cancel => {
                if let Some(outermost) = self.outermost_propagating(fault.source) {
                    self.abort_instance(outermost, &fault);
                }
                if let Some(root) = self.root.and_then(|root| self.instances.get_mut(root)) {
                    if std::mem::take(&mut root.propagating_fault) {
                        root.marked_canceled = true;
                    }
                }
                self.cancel_root();
            }
            UnhandledExceptionAction::Abort => self.abort_workflow(fault.message),
        }
    }

    /// Highest non-root instance on the path from `source` that is still
    /// waiting on an unhandled fault
    fn outermost_propagating(&self, source: InstanceId) -> Option<InstanceId> {
        let mut outermost = None;
        let mut current = Some(source);
        while let Some(id) = current {
            let Some(instance) = self.instances.get(id) else {
                break;
            };
            if instance.parent.is_some() && instance.propagating_fault {
                outermost = Some(id);
            }
            current = instance.parent;
        }
        outermost
    }

    /// Abort `id` and its descendants. The instance completes faulted and
    /// its parent is notified.
    pub(crate) fn abort_instance(&mut self, id: InstanceId, reason: &FaultRecord) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let children = instance.children.clone();
        for child in children.into_iter().rev() {
            self.abort_descendant(child, reason);
        }
        self.call_abort(id, reason);
        if let Some(instance) = self.instances.get_mut(id) {
            instance.faulted = true;
        }
        tracing::debug!(instance = %id, reason = %reason.message, "instance aborted");
        self.complete_instance(id);
    }

    fn abort_descendant(&mut self, id: InstanceId, reason: &FaultRecord) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let children = instance.children.clone();
        for child in children.into_iter().rev() {
            self.abort_descendant(child, reason);
        }
        self.call_abort(id, reason);
        if self
            .transaction
            .as_ref()
            .is_some_and(|transaction| transaction.isolation_scope == id)
        {
            self.rollback_transaction(&reason.message);
        }
        self.cleanup_instance(id, ActivityInstanceState::Faulted);
    }

    fn call_abort(&mut self, id: InstanceId, reason: &FaultRecord) {
        match self.behavior_of(id) {
            Some((ActivityBehavior::Native(body), _)) => {
                self.invoke(id, ContextKind::Abort, Some(reason.clone()), |ctx| body.abort(ctx));
            }
            Some((ActivityBehavior::AsyncCode(_), _)) => {
                if let Some(operation) = self.operations.get_mut(&id) {
                    operation.cancel_operation();
                }
            }
            _ => {}
        }
    }

    pub(crate) fn abort_workflow(&mut self, reason: String) {
        if self.status == WorkflowStatus::Aborted || self.disposed {
            return;
        }
        tracing::warn!(workflow = %self.id, %reason, "workflow aborted");
        if self.transaction.is_some() {
            self.rollback_transaction(&reason);
        }
        if let Some(root) = self.root.filter(|root| self.instances.contains(*root)) {
            let fault = FaultRecord::from_message(reason.clone(), root, self.display_name(root));
            self.abort_descendant(root, &fault);
        }
        self.clear_runtime_state();
        self.status = WorkflowStatus::Aborted;
        self.abort_reason = Some(reason.clone());
        self.events.push(WorkflowEvent::Aborted { reason });
    }

    fn terminate_workflow(&mut self, reason: String) {
        if self.status.is_final() || self.disposed {
            return;
        }
        let Some(root) = self.root.filter(|root| self.instances.is_executing(*root)) else {
            return;
        };
        tracing::warn!(workflow = %self.id, %reason, "workflow terminated");
        let fault = FaultRecord::from_message(reason, root, self.display_name(root));
        self.completion_fault = Some(fault.clone());
        self.abort_instance(root, &fault);
    }

    fn clear_runtime_state(&mut self) {
        self.instances.clear();
        self.scheduler.clear();
        self.bookmarks.clear();
        self.scopes.clear();
        self.operations.clear();
        self.transaction_waiters.clear();
        self.transaction = None;
        self.no_persist_count = 0;
        // Completions posted for discarded operations are stale.
        self.inbox.drain();
    }

    pub(crate) fn request_abort(&mut self, pending: PendingAbort) {
        if self.pending_abort.is_none() {
            self.pending_abort = Some(pending);
        }
    }

    // ---- bookmarks ----

    pub(crate) fn create_bookmark(
        &mut self,
        owner: InstanceId,
        bookmark: Option<Bookmark>,
        callback: Option<String>,
        options: BookmarkOptions,
        scope: BookmarkScope,
    ) -> UsageResult<Bookmark> {
        let record = match (bookmark, scope.is_default()) {
            (None, _) => self.bookmarks.create_internal(owner, callback, options),
            (Some(bookmark), true) => self
                .bookmarks
                .create_bookmark(bookmark, owner, callback, options, scope)?,
            (Some(bookmark), false) => self
                .scopes
                .create_bookmark(bookmark, scope, owner, callback, options)?,
        };
        if record.is_blocking() {
            if let Some(instance) = self.instances.get_mut(owner) {
                instance.blocking_bookmarks += 1;
            }
        }
        tracing::debug!(instance = %owner, bookmark = %record.bookmark, scope = %record.scope, "bookmark created");
        Ok(record.bookmark)
    }

    pub(crate) fn remove_bookmark(
        &mut self,
        owner: InstanceId,
        bookmark: &Bookmark,
        scope: BookmarkScope,
    ) -> UsageResult<bool> {
        let removed = if scope.is_default() {
            self.bookmarks.remove(bookmark, owner)?
        } else {
            self.scopes.remove(bookmark, scope, owner)?
        };
        Ok(match removed {
            Some(record) => {
                self.unblock(&record);
                true
            }
            None => false,
        })
    }

    pub(crate) fn remove_all_bookmarks(&mut self, owner: InstanceId) {
        let protected = self.operations.get(&owner).map(|operation| operation.bookmark().clone());
        let targets: Vec<Bookmark> = self
            .bookmarks
            .bookmarks_for(owner)
            .map(|record| record.bookmark.clone())
            .filter(|bookmark| Some(bookmark) != protected.as_ref())
            .collect();
        let mut removed = Vec::with_capacity(targets.len());
        for bookmark in targets {
            if let Ok(Some(record)) = self.bookmarks.remove(&bookmark, owner) {
                removed.push(record);
            }
        }
        removed.extend(self.scopes.remove_all(owner));
        for record in removed {
            self.unblock(&record);
        }
    }

    fn unblock(&mut self, record: &BookmarkRecord) {
        if record.is_blocking() {
            if let Some(instance) = self.instances.get_mut(record.owner) {
                instance.blocking_bookmarks = instance.blocking_bookmarks.saturating_sub(1);
            }
        }
    }

    /// Look the bookmark up and schedule its resumption.
    ///
    /// While a runtime transaction is active, bookmarks owned outside the
    /// isolation scope report NotReady.
    pub(crate) fn try_resume(
        &mut self,
        bookmark: &Bookmark,
        scope: BookmarkScope,
        value: Value,
        external: bool,
    ) -> BookmarkResumptionResult {
        let instances = &self.instances;
        let isolation = self.transaction.as_ref().map(|transaction| transaction.isolation_scope);
        let is_ready = |record: &BookmarkRecord| {
            instances.is_executing(record.owner)
                && isolation.is_none_or(|scope| instances.is_ancestor_or_self(scope, record.owner))
        };
        let lookup = if scope.is_default() {
            self.bookmarks.try_generate_work_item(bookmark, is_ready)
        } else {
            self.scopes.try_generate_work_item(bookmark, scope, is_ready)
        };

        match lookup {
            Resumption::Ready(record) => {
                if !record.options.contains(BookmarkOptions::MULTIPLE_RESUME) {
                    self.unblock(&record);
                }
                let item = WorkItem::ResumeBookmark {
                    instance: record.owner,
                    callback: record.callback,
                    bookmark: record.bookmark,
                    value,
                };
                if external {
                    self.scheduler.enqueue_work(item);
                } else {
                    self.scheduler.push_work(item);
                }
                BookmarkResumptionResult::Success
            }
            Resumption::NotReady => BookmarkResumptionResult::NotReady,
            Resumption::NotFound => BookmarkResumptionResult::NotFound,
        }
    }

    // ---- locations ----

    /// Instance and slot index holding the storage `reference` names, as
    /// seen from `from`
    pub(crate) fn resolve_slot(&self, from: InstanceId, reference: &LocationReference) -> UsageResult<(InstanceId, usize)> {
        let owner = reference.throw_if_not_in_tree()?;
        let mut current = Some(from);
        while let Some(id) = current {
            let instance = self
                .instances
                .get(id)
                .ok_or(UsageError::InstanceNotFound(id.0))?;
            if instance.activity == owner {
                return self.follow_slot(id, reference.id(), reference.name());
            }
            current = instance.parent;
        }
        Err(UsageError::NotVisible(reference.name().to_string()))
    }

    fn follow_slot(&self, mut instance: InstanceId, mut slot: usize, name: &str) -> UsageResult<(InstanceId, usize)> {
        loop {
            let environment = self
                .instances
                .get(instance)
                .and_then(|instance| instance.environment.as_ref())
                .ok_or_else(|| UsageError::UnknownLocation(name.to_string()))?;
            match environment.slots.get(slot) {
                Some(Slot::Value(_)) => return Ok((instance, slot)),
                Some(Slot::Reference {
                    instance: target,
                    slot: target_slot,
                }) => {
                    instance = *target;
                    slot = *target_slot;
                }
                None => return Err(UsageError::UnknownLocation(name.to_string())),
            }
        }
    }

    pub(crate) fn location(&self, from: InstanceId, reference: &LocationReference) -> UsageResult<&Location> {
        let (instance, slot) = self.resolve_slot(from, reference)?;
        match self
            .instances
            .get(instance)
            .and_then(|instance| instance.environment.as_ref())
            .and_then(|environment| environment.slots.get(slot))
        {
            Some(Slot::Value(location)) => Ok(location),
            _ => Err(UsageError::UnknownLocation(reference.name().to_string())),
        }
    }

    pub(crate) fn location_mut(&mut self, from: InstanceId, reference: &LocationReference) -> UsageResult<&mut Location> {
        let (instance, slot) = self.resolve_slot(from, reference)?;
        match self
            .instances
            .get_mut(instance)
            .and_then(|instance| instance.environment.as_mut())
            .and_then(|environment| environment.slots.get_mut(slot))
        {
            Some(Slot::Value(location)) => Ok(location),
            _ => Err(UsageError::UnknownLocation(reference.name().to_string())),
        }
    }

    // ---- handles ----

    /// Instance at or above `from` that declares a handle called `name`
    pub(crate) fn find_handle(&self, from: InstanceId, name: &str) -> UsageResult<InstanceId> {
        let mut current = Some(from);
        while let Some(id) = current {
            let instance = self
                .instances
                .get(id)
                .ok_or(UsageError::InstanceNotFound(id.0))?;
            if instance
                .environment
                .as_ref()
                .is_some_and(|environment| environment.handle(name).is_some())
            {
                return Ok(id);
            }
            current = instance.parent;
        }
        Err(UsageError::UnknownHandle(name.to_string()))
    }

    pub(crate) fn handle_slot(&self, from: InstanceId, name: &str) -> UsageResult<&HandleSlot> {
        let owner = self.find_handle(from, name)?;
        self.instances
            .get(owner)
            .and_then(|instance| instance.environment.as_ref())
            .and_then(|environment| environment.handle(name))
            .ok_or_else(|| UsageError::UnknownHandle(name.to_string()))
    }

    pub(crate) fn handle_slot_mut(&mut self, from: InstanceId, name: &str) -> UsageResult<&mut HandleSlot> {
        let owner = self.find_handle(from, name)?;
        self.instances
            .get_mut(owner)
            .and_then(|instance| instance.environment.as_mut())
            .and_then(|environment| environment.handle_mut(name))
            .ok_or_else(|| UsageError::UnknownHandle(name.to_string()))
    }

    pub(crate) fn enter_no_persist(&mut self, from: InstanceId, name: &str) -> UsageResult<()> {
        self.handle_slot_mut(from, name)?
            .downcast_mut::<NoPersistHandle>(NoPersistHandle::TAG)?
            .enter();
        self.no_persist_count += 1;
        Ok(())
    }

    pub(crate) fn exit_no_persist(&mut self, from: InstanceId, name: &str) -> UsageResult<()> {
        let exited = self
            .handle_slot_mut(from, name)?
            .downcast_mut::<NoPersistHandle>(NoPersistHandle::TAG)?
            .exit();
        if !exited {
            return Err(UsageError::NoPersistNotEntered(name.to_string()));
        }
        self.no_persist_count = self.no_persist_count.saturating_sub(1);
        Ok(())
    }

    /// Run `f` with a handle and an initialization context over the scope registry
    pub(crate) fn with_handle<R>(
        &mut self,
        from: InstanceId,
        name: &str,
        f: impl FnOnce(&mut HandleSlot, &mut HandleInitializationContext<'_>) -> UsageResult<R>,
    ) -> UsageResult<R> {
        let owner = self.find_handle(from, name)?;
        let auto = self.config.auto_disassociate_scopes;
        let slot = self
            .instances
            .get_mut(owner)
            .and_then(|instance| instance.environment.as_mut())
            .and_then(|environment| environment.handle_mut(name))
            .ok_or_else(|| UsageError::UnknownHandle(name.to_string()))?;
        let mut hctx = HandleInitializationContext::new(owner, &mut self.scopes, auto);
        let result = f(slot, &mut hctx);
        let (unregistered, released) = hctx.dispose();
        self.no_persist_count = self.no_persist_count.saturating_sub(released);
        for (scope, orphaned) in unregistered {
            self.release_orphaned(orphaned);
            self.events.push(WorkflowEvent::ScopeUnregistered { scope });
        }
        result
    }

    // ---- transactions ----

    pub(crate) fn request_transaction_context(&mut self, instance: InstanceId, callback: String) -> UsageResult<()> {
        let target = self
            .instances
            .get_mut(instance)
            .ok_or(UsageError::InstanceNotFound(instance.0))?;
        target.waiting_for_transaction = true;
        self.transaction_waiters
            .enqueue(TransactionWaiter { instance, callback });
        tracing::debug!(%instance, "transaction context requested");
        Ok(())
    }

    fn serve_transaction_waiter(&mut self) -> bool {
        if self.transaction.is_some() || self.no_persist_count > 0 || !self.operations.is_empty() {
            return false;
        }
        while let Some(waiter) = self.transaction_waiters.dequeue() {
            let Some(instance) = self.instances.get_mut(waiter.instance) else {
                continue;
            };
            if instance.state != ActivityInstanceState::Executing {
                continue;
            }
            instance.waiting_for_transaction = false;
            self.scheduler.push_work(WorkItem::TransactionContext {
                instance: waiter.instance,
                callback: waiter.callback,
            });
            return true;
        }
        false
    }

    pub(crate) fn set_runtime_transaction(
        &mut self,
        isolation_scope: InstanceId,
        handle_name: &str,
        transaction: Transaction,
    ) -> UsageResult<()> {
        if self.transaction.is_some() {
            return Err(UsageError::TransactionAlreadySet);
        }
        let handle_owner = self.find_handle(isolation_scope, handle_name)?;
        self.handle_slot_mut(isolation_scope, handle_name)?
            .downcast_mut::<RuntimeTransactionHandle>(RuntimeTransactionHandle::TAG)?
            .bind(transaction.clone())?;

        if let Some(coordinator) = self.get_extension::<dyn TransactionCoordinator>() {
            if let Err(error) = coordinator.begin(&transaction) {
                if let Ok(slot) = self.handle_slot_mut(isolation_scope, handle_name) {
                    if let Ok(handle) = slot.downcast_mut::<RuntimeTransactionHandle>(RuntimeTransactionHandle::TAG) {
                        handle.clear();
                    }
                }
                self.request_abort(PendingAbort::Abort(format!("transaction enlistment failed: {:#}", error)));
                return Err(UsageError::TransactionCommitFailed(error.to_string()));
            }
        }

        tracing::info!(%transaction, scope = %isolation_scope, "runtime transaction set");
        self.transaction = Some(RuntimeTransaction {
            transaction,
            isolation_scope,
            handle_owner,
            handle_name: handle_name.to_string(),
        });
        Ok(())
    }

    pub(crate) fn complete_transaction(&mut self, instance: InstanceId) -> UsageResult<()> {
        match &self.transaction {
            Some(transaction) if self.instances.is_ancestor_or_self(transaction.isolation_scope, instance) => {}
            _ => return Err(UsageError::NoTransactionContext),
        }
        self.commit_transaction()
    }

    fn settle_transaction(&mut self, id: InstanceId, state: ActivityInstanceState) {
        if !self
            .transaction
            .as_ref()
            .is_some_and(|transaction| transaction.isolation_scope == id)
        {
            return;
        }
        if state == ActivityInstanceState::Closed {
            if let Err(error) = self.commit_transaction() {
                tracing::warn!(instance = %id, %error, "transaction commit failed at scope completion");
            }
        } else {
            self.rollback_transaction(&format!("isolation scope completed {}", state));
        }
    }

    fn commit_transaction(&mut self) -> UsageResult<()> {
        let Some(runtime) = self.transaction.take() else {
            return Err(UsageError::NoTransactionContext);
        };
        self.clear_transaction_handle(&runtime);
        let outcome = match self.get_extension::<dyn TransactionCoordinator>() {
            Some(coordinator) => coordinator.commit(&runtime.transaction),
            None => Ok(()),
        };
        self.after_transaction();
        match outcome {
            Ok(()) => {
                tracing::info!(transaction = %runtime.transaction, "transaction committed");
                Ok(())
            }
            Err(error) => {
                if let Some(coordinator) = self.get_extension::<dyn TransactionCoordinator>() {
                    coordinator.rollback(&runtime.transaction, &error.to_string());
                }
                Err(UsageError::TransactionCommitFailed(error.to_string()))
            }
        }
    }

    fn rollback_transaction(&mut self, reason: &str) {
        let Some(runtime) = self.transaction.take() else {
            return;
        };
        self.clear_transaction_handle(&runtime);
        if let Some(coordinator) = self.get_extension::<dyn TransactionCoordinator>() {
            coordinator.rollback(&runtime.transaction, reason);
        }
        tracing::info!(transaction = %runtime.transaction, %reason, "transaction rolled back");
        self.after_transaction();
    }

    fn clear_transaction_handle(&mut self, runtime: &RuntimeTransaction) {
        if let Some(slot) = self
            .instances
            .get_mut(runtime.handle_owner)
            .and_then(|instance| instance.environment.as_mut())
            .and_then(|environment| environment.handle_mut(&runtime.handle_name))
        {
            if let Ok(handle) = slot.downcast_mut::<RuntimeTransactionHandle>(RuntimeTransactionHandle::TAG) {
                handle.clear();
            }
        }
    }

    fn after_transaction(&mut self) {
        if std::mem::take(&mut self.root_cancel_pending) {
            if let Some(root) = self.root {
                self.cancel_instance(root);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{Activity, Argument, CodeActivity, NativeActivity, Variable};
    use crate::runtime::handle::HandleFactoryRegistry;
    use parking_lot::Mutex;
    use serde_json::json;

    struct SetResult(Value);

    impl CodeActivity for SetResult {
        fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
            ctx.set_value(RESULT_ARGUMENT, self.0.clone())?;
            Ok(())
        }
    }

    struct Fail;

    impl CodeActivity for Fail {
        fn execute(&self, _ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Park;

    impl NativeActivity for Park {
        fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
            ctx.create_bookmark("B1", "resumed")?;
            Ok(())
        }

        fn on_bookmark_resumed(
            &self,
            ctx: &mut ActivityContext<'_>,
            _callback: &str,
            _bookmark: &Bookmark,
            value: Value,
        ) -> anyhow::Result<()> {
            ctx.set_value(RESULT_ARGUMENT, value)?;
            Ok(())
        }
    }

    /// Schedules its only child with both callbacks and records them
    struct Recorder {
        handle: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl NativeActivity for Recorder {
        fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
            ctx.schedule_child(0, Some("done"), Some("faulted"))?;
            Ok(())
        }

        fn on_child_completed(
            &self,
            _ctx: &mut ActivityContext<'_>,
            _callback: &str,
            completed: &ChildCompletion,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("completed:{}", completed.state));
            Ok(())
        }

        fn on_child_faulted(&self, ctx: &mut ActivityContext<'_>, _callback: &str) -> anyhow::Result<()> {
            let message = ctx.fault()?.message.clone();
            self.log.lock().push(format!("faulted:{message}"));
            if self.handle {
                ctx.handle_fault()?;
            }
            Ok(())
        }
    }

    /// Hands its completion to the test instead of finishing
    struct Stash(Arc<Mutex<Option<AsyncCompletion>>>);

    impl AsyncCodeActivity for Stash {
        fn begin_execute(&self, _ctx: &mut ActivityContext<'_>, completion: AsyncCompletion) -> anyhow::Result<()> {
            *self.0.lock() = Some(completion);
            Ok(())
        }
    }

    fn executor(root: Activity) -> ActivityExecutor {
        let tree = ActivityTree::cache(root.build(), &HandleFactoryRegistry::with_builtins()).unwrap();
        ActivityExecutor::new(tree, RuntimeConfig::default(), ExtensionRegistry::new())
    }

    #[test]
    fn test_code_root_closes_with_outputs() {
        let mut executor = executor(
            Activity::code("answer", SetResult(json!(42))).argument(Argument::output(RESULT_ARGUMENT, ValueKind::Number)),
        );
        executor.schedule_root(BTreeMap::new()).unwrap();
        assert_eq!(executor.run(), WorkflowStatus::Closed);
        assert_eq!(executor.outputs().get(RESULT_ARGUMENT), Some(&json!(42)));
        assert!(executor.instances().is_empty());
    }

    #[test]
    fn test_unknown_input_rejected() {
        let mut executor = executor(
            Activity::code("answer", SetResult(json!(1))).argument(Argument::input("x", ValueKind::Number)),
        );
        let error = executor
            .schedule_root(BTreeMap::from([("y".to_string(), json!(1))]))
            .unwrap_err();
        assert!(matches!(error, UsageError::UnknownInput(name) if name == "y"));
        assert!(executor.schedule_root(BTreeMap::new()).is_ok());
        assert!(matches!(
            executor.schedule_root(BTreeMap::new()),
            Err(UsageError::RootAlreadyScheduled)
        ));
    }

    #[test]
    fn test_unhandled_fault_terminates() {
        let mut executor = executor(Activity::code("fail", Fail));
        executor.schedule_root(BTreeMap::new()).unwrap();
        assert_eq!(executor.run(), WorkflowStatus::Faulted);
        assert_eq!(executor.completion_fault().map(|f| f.message.as_str()), Some("boom"));

        let events = executor.take_events();
        assert!(events.iter().any(|e| matches!(e, WorkflowEvent::UnhandledException { .. })));
        assert!(events.iter().any(|e| matches!(e, WorkflowEvent::Completed { state: WorkflowStatus::Faulted, .. })));
    }

    #[test]
    fn test_bookmark_single_resume() {
        let mut executor = executor(
            Activity::native("park", Park)
                .argument(Argument::output(RESULT_ARGUMENT, ValueKind::Any))
                .variable(Variable::new("unused", ValueKind::Any)),
        );
        executor.schedule_root(BTreeMap::new()).unwrap();
        assert_eq!(executor.run(), WorkflowStatus::Executing);
        assert_eq!(executor.get_all_bookmarks().len(), 1);
        assert!(executor.is_persistable());

        assert_eq!(executor.resume_bookmark("B1", json!("v")), BookmarkResumptionResult::Success);
        assert_eq!(executor.resume_bookmark("B1", json!("again")), BookmarkResumptionResult::NotFound);
        assert_eq!(executor.run(), WorkflowStatus::Closed);
        assert_eq!(executor.outputs().get(RESULT_ARGUMENT), Some(&json!("v")));
        assert_eq!(executor.resume_bookmark("B1", json!(0)), BookmarkResumptionResult::NotFound);
    }

    #[test]
    fn test_abort_clears_state() {
        let mut executor = executor(Activity::native("park", Park));
        executor.schedule_root(BTreeMap::new()).unwrap();
        executor.run();
        executor.abort("operator request");

        assert_eq!(executor.state(), WorkflowStatus::Aborted);
        assert_eq!(executor.abort_reason(), Some("operator request"));
        assert!(executor.instances().is_empty());
        assert_eq!(executor.resume_bookmark("B1", json!(null)), BookmarkResumptionResult::NotFound);
    }

    #[test]
    fn test_cancel_before_execution() {
        let mut executor = executor(Activity::native("park", Park));
        executor.schedule_root(BTreeMap::new()).unwrap();
        executor.cancel_root();
        assert_eq!(executor.run(), WorkflowStatus::Canceled);
    }

    #[test]
    fn test_fault_handler_runs_before_completion_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            handle: true,
            log: Arc::clone(&log),
        };
        let mut executor = executor(Activity::native("recorder", recorder).child(Activity::code("fail", Fail)));
        executor.schedule_root(BTreeMap::new()).unwrap();

        assert_eq!(executor.run(), WorkflowStatus::Closed);
        assert_eq!(*log.lock(), vec!["faulted:boom".to_string(), "completed:Faulted".to_string()]);
        assert!(executor.completion_fault().is_none());
        assert!(executor.instances().is_empty());
    }

    #[test]
    fn test_unanswered_fault_handler_faults_workflow() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            handle: false,
            log: Arc::clone(&log),
        };
        let mut executor = executor(Activity::native("recorder", recorder).child(Activity::code("fail", Fail)));
        executor.schedule_root(BTreeMap::new()).unwrap();

        assert_eq!(executor.run(), WorkflowStatus::Faulted);
        assert_eq!(*log.lock(), vec!["faulted:boom".to_string()]);
        assert_eq!(executor.completion_fault().map(|f| f.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_cancel_after_fault_keeps_final_state() {
        let mut executor = executor(Activity::code("fail", Fail));
        executor.schedule_root(BTreeMap::new()).unwrap();
        assert_eq!(executor.run(), WorkflowStatus::Faulted);

        executor.cancel_root();
        assert_eq!(executor.run(), WorkflowStatus::Faulted);
        assert_eq!(executor.state(), WorkflowStatus::Faulted);
        assert_eq!(executor.completion_fault().map(|f| f.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_unknown_delegate_argument_leaves_no_instance() {
        let mut executor = executor(
            Activity::native("park", Park)
                .variable(Variable::new("unused", ValueKind::Any))
                .handle("zone", NoPersistHandle::TAG),
        );
        let root = executor.tree.root();
        let next_id = executor.instances().next_id();
        let scopes = executor.scopes.scopes().count();

        let error = executor
            .create_instance(root, None, None, None, BTreeMap::from([("bogus".to_string(), json!(1))]))
            .unwrap_err();
        assert!(matches!(error, UsageError::UnknownLocation(name) if name == "bogus"));
        assert_eq!(executor.instances().next_id(), next_id);
        assert!(executor.instances().is_empty());
        assert_eq!(executor.scopes.scopes().count(), scopes);
        assert!(executor.is_persistable());

        executor.schedule_root(BTreeMap::new()).unwrap();
        assert_eq!(executor.run(), WorkflowStatus::Executing);
    }

    #[test]
    fn test_lost_operation_bookmark_aborts_workflow() {
        let stash = Arc::new(Mutex::new(None));
        let mut executor = executor(Activity::async_code("stash", Stash(Arc::clone(&stash))));
        executor.schedule_root(BTreeMap::new()).unwrap();
        assert_eq!(executor.run(), WorkflowStatus::Executing);

        let (owner, bookmark) = executor
            .operations
            .iter()
            .map(|(owner, operation)| (*owner, operation.bookmark().clone()))
            .next()
            .unwrap();
        executor.bookmarks.remove(&bookmark, owner).unwrap();
        executor.take_events();

        stash.lock().take().unwrap().complete(Ok(json!(1)));
        assert_eq!(executor.run(), WorkflowStatus::Aborted);
        assert!(executor
            .take_events()
            .iter()
            .any(|e| matches!(e, WorkflowEvent::Aborted { .. })));
        assert!(executor.instances().is_empty());
        assert!(executor.inbox().drain().is_empty());
    }
}
