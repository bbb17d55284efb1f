//! Hosts that drive an executor
//!
//! `WorkflowApplication` owns one executor on a tokio task and serves
//! commands sent over a channel, so the executor is only ever touched from
//! that task. `WorkflowInvoker` runs a workflow to completion on the calling
//! thread and is the simplest way to execute a definition.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::RuntimeConfig;
use super::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope};
use super::error::{Result, RuntimeError};
use super::executor::{ActivityExecutor, WorkflowEvent, WorkflowStatus};
use super::extension::ExtensionRegistry;
use super::storage::InstanceStore;
use super::tree::ActivityTree;
use super::value::Value;

const EVENT_CAPACITY: usize = 256;

enum Command {
    Run {
        reply: oneshot::Sender<WorkflowStatus>,
    },
    Resume {
        bookmark: Bookmark,
        scope: BookmarkScope,
        value: Value,
        reply: oneshot::Sender<BookmarkResumptionResult>,
    },
    Cancel {
        reply: oneshot::Sender<WorkflowStatus>,
    },
    Abort {
        reason: String,
        reply: oneshot::Sender<WorkflowStatus>,
    },
    Terminate {
        reason: String,
        reply: oneshot::Sender<WorkflowStatus>,
    },
    Persist {
        reply: oneshot::Sender<Result<()>>,
    },
    Bookmarks {
        reply: oneshot::Sender<Vec<BookmarkInfo>>,
    },
    Outputs {
        reply: oneshot::Sender<BTreeMap<String, Value>>,
    },
    Unload {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Asynchronous host for one workflow instance
#[derive(Debug)]
pub struct WorkflowApplication {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<WorkflowEvent>,
    status: watch::Receiver<WorkflowStatus>,
    timeout: Duration,
    task: JoinHandle<()>,
}

impl WorkflowApplication {
    /// Host `executor` without persistence
    pub fn new(executor: ActivityExecutor) -> Self {
        Self::spawn(executor, None)
    }

    /// Host `executor`, persisting it to `store` on request and on unload
    pub fn with_store(executor: ActivityExecutor, store: InstanceStore) -> Self {
        Self::spawn(executor, Some(store))
    }

    fn spawn(executor: ActivityExecutor, store: Option<InstanceStore>) -> Self {
        let id = executor.id();
        let timeout = executor.config().acquire_lock_timeout;
        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(executor.state());

        let worker = Worker {
            executor,
            store,
            events: events.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(worker.serve(receiver));
        tracing::debug!(workflow = %id, "workflow application started");

        Self {
            id,
            commands,
            events,
            status,
            timeout,
            task,
        }
    }

    /// Workflow instance id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stream of workflow notifications
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Last status published by the workflow task
    pub fn status(&self) -> WorkflowStatus {
        *self.status.borrow()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| RuntimeError::HostClosed)?;
        match tokio::time::timeout(self.timeout, response).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RuntimeError::HostClosed),
            Err(_) => Err(RuntimeError::Timeout(self.timeout)),
        }
    }

    /// Run ready work until the workflow is idle or completes
    pub async fn run(&self) -> Result<WorkflowStatus> {
        self.request(|reply| Command::Run { reply }).await
    }

    /// Resume a default-scope bookmark and run
    pub async fn resume_bookmark(
        &self,
        bookmark: impl Into<Bookmark>,
        value: Value,
    ) -> Result<BookmarkResumptionResult> {
        self.resume_bookmark_in_scope(bookmark, BookmarkScope::DEFAULT, value)
            .await
    }

    /// Resume a bookmark registered in `scope` and run
    pub async fn resume_bookmark_in_scope(
        &self,
        bookmark: impl Into<Bookmark>,
        scope: BookmarkScope,
        value: Value,
    ) -> Result<BookmarkResumptionResult> {
        let bookmark = bookmark.into();
        self.request(|reply| Command::Resume {
            bookmark,
            scope,
            value,
            reply,
        })
        .await
    }

    /// Cancel the root and run the cancellation
    pub async fn cancel(&self) -> Result<WorkflowStatus> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Abort the workflow
    pub async fn abort(&self, reason: impl Into<String>) -> Result<WorkflowStatus> {
        let reason = reason.into();
        self.request(|reply| Command::Abort { reason, reply }).await
    }

    /// Terminate the workflow, completing it faulted
    pub async fn terminate(&self, reason: impl Into<String>) -> Result<WorkflowStatus> {
        let reason = reason.into();
        self.request(|reply| Command::Terminate { reason, reply })
            .await
    }

    /// Save the workflow to the store
    pub async fn persist(&self) -> Result<()> {
        self.request(|reply| Command::Persist { reply }).await?
    }

    /// Named bookmarks the workflow waits on
    pub async fn bookmarks(&self) -> Result<Vec<BookmarkInfo>> {
        self.request(|reply| Command::Bookmarks { reply }).await
    }

    /// Root outputs, populated once the workflow closes
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        self.request(|reply| Command::Outputs { reply }).await
    }

    /// Wait until the workflow reaches a final status
    pub async fn wait_for_completion(&self) -> Result<WorkflowStatus> {
        let mut status = self.status.clone();
        let wait = status.wait_for(|status| status.is_final());
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Ok(status)) => Ok(*status),
            Ok(Err(_)) => Err(RuntimeError::HostClosed),
            Err(_) => Err(RuntimeError::Timeout(self.timeout)),
        }
    }

    /// Persist the workflow and stop its task
    pub async fn unload(self) -> Result<()> {
        let outcome = self.request(|reply| Command::Unload { reply }).await;
        if matches!(outcome, Ok(Ok(()))) {
            let _ = self.task.await;
        }
        outcome?
    }
}

struct Worker {
    executor: ActivityExecutor,
    store: Option<InstanceStore>,
    events: broadcast::Sender<WorkflowEvent>,
    status: watch::Sender<WorkflowStatus>,
}

impl Worker {
    async fn serve(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let inbox = Arc::clone(self.executor.inbox());
        loop {
            let waiting = self.executor.has_pending_operations() && !self.executor.is_disposed();
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.handle(command) {
                        break;
                    }
                }
                _ = inbox.notified(), if waiting => {
                    self.run();
                }
            }
        }
        self.executor.dispose();
        tracing::debug!(workflow = %self.executor.id(), "workflow application stopped");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Run { reply } => {
                let _ = reply.send(self.run());
            }
            Command::Resume {
                bookmark,
                scope,
                value,
                reply,
            } => {
                let result = self.executor.resume_bookmark_in_scope(bookmark, scope, value);
                self.run();
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                self.executor.cancel_root();
                let _ = reply.send(self.run());
            }
            Command::Abort { reason, reply } => {
                self.executor.abort(reason);
                let _ = reply.send(self.run());
            }
            Command::Terminate { reason, reply } => {
                self.executor.terminate(reason);
                let _ = reply.send(self.run());
            }
            Command::Persist { reply } => {
                let _ = reply.send(self.persist());
            }
            Command::Bookmarks { reply } => {
                let _ = reply.send(self.executor.get_all_bookmarks());
            }
            Command::Outputs { reply } => {
                let _ = reply.send(self.executor.outputs().clone());
            }
            Command::Unload { reply } => {
                let outcome = self.persist();
                let unloaded = outcome.is_ok();
                let _ = reply.send(outcome);
                return !unloaded;
            }
        }
        true
    }

    fn run(&mut self) -> WorkflowStatus {
        let status = self.executor.run();
        if self.executor.take_persist_request() && self.executor.is_persistable() {
            if let Err(error) = self.persist() {
                tracing::warn!(workflow = %self.executor.id(), %error, "requested persist failed");
            }
        }
        for event in self.executor.take_events() {
            let _ = self.events.send(event);
        }
        self.status.send_replace(status);
        status
    }

    fn persist(&mut self) -> Result<()> {
        let Some(store) = &self.store else {
            return Err(RuntimeError::Config("workflow application has no instance store".into()));
        };
        let snapshot = self.executor.snapshot()?;
        store.save(&snapshot)?;
        Ok(())
    }
}

#[derive(Default)]
struct OperationState {
    result: Option<Result<BTreeMap<String, Value>>>,
    completed: bool,
    waker: Option<Waker>,
}

/// Pending result of `WorkflowInvoker::invoke_async`
///
/// Completes exactly once. Await it, or block on `wait` from a thread that
/// is not driving a tokio runtime.
#[derive(Clone, Default)]
pub struct AsyncInvokeOperation {
    inner: Arc<(Mutex<OperationState>, Condvar)>,
}

impl std::fmt::Debug for AsyncInvokeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncInvokeOperation")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl AsyncInvokeOperation {
    fn complete(&self, result: Result<BTreeMap<String, Value>>) {
        let (state, condvar) = &*self.inner;
        let mut state = state.lock();
        assert!(!state.completed, "invoke operation completed twice");
        state.completed = true;
        state.result = Some(result);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        condvar.notify_all();
    }

    /// Whether the workflow finished
    pub fn is_completed(&self) -> bool {
        self.inner.0.lock().completed
    }

    /// Block until the workflow finishes
    pub fn wait(self) -> Result<BTreeMap<String, Value>> {
        let (state, condvar) = &*self.inner;
        let mut state = state.lock();
        while !state.completed {
            condvar.wait(&mut state);
        }
        state.result.take().unwrap_or(Err(RuntimeError::HostClosed))
    }

    /// Block until the workflow finishes or `timeout` elapses
    pub fn wait_timeout(self, timeout: Duration) -> Result<BTreeMap<String, Value>> {
        let (state, condvar) = &*self.inner;
        let mut state = state.lock();
        let deadline = Instant::now() + timeout;
        while !state.completed {
            if condvar.wait_until(&mut state, deadline).timed_out() {
                return Err(RuntimeError::Timeout(timeout));
            }
        }
        state.result.take().unwrap_or(Err(RuntimeError::HostClosed))
    }
}

impl Future for AsyncInvokeOperation {
    type Output = Result<BTreeMap<String, Value>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.0.lock();
        if state.completed {
            return Poll::Ready(state.result.take().unwrap_or(Err(RuntimeError::HostClosed)));
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Runs a workflow to completion on the calling thread
#[derive(Debug, Clone)]
pub struct WorkflowInvoker {
    tree: Arc<ActivityTree>,
    config: RuntimeConfig,
    extensions: ExtensionRegistry,
    timeout: Option<Duration>,
}

impl WorkflowInvoker {
    /// Invoker for `tree` with the default configuration
    pub fn new(tree: Arc<ActivityTree>) -> Self {
        Self {
            tree,
            config: RuntimeConfig::default(),
            extensions: ExtensionRegistry::new(),
            timeout: None,
        }
    }

    /// Use `config` for each invocation
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Make `extensions` available to activities
    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    /// Give up on outstanding async work after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run to completion and return the root outputs.
    ///
    /// Fails if the workflow goes idle on bookmarks, since nothing could
    /// ever resume them.
    pub fn invoke(&self, inputs: BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
        let mut executor = ActivityExecutor::new(
            Arc::clone(&self.tree),
            self.config.clone(),
            self.extensions.clone(),
        );
        executor.schedule_root(inputs)?;
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            match executor.run() {
                WorkflowStatus::Closed => return Ok(executor.outputs().clone()),
                WorkflowStatus::Canceled => return Err(RuntimeError::Canceled),
                WorkflowStatus::Faulted => {
                    let message = executor
                        .completion_fault()
                        .map(|fault| fault.message.clone())
                        .unwrap_or_else(|| "workflow faulted".into());
                    return Err(RuntimeError::Faulted(message));
                }
                WorkflowStatus::Aborted => {
                    let reason = executor.abort_reason().unwrap_or("workflow aborted").to_string();
                    return Err(RuntimeError::Aborted(reason));
                }
                WorkflowStatus::Executing => {}
            }

            if !executor.has_pending_operations() {
                let bookmarks = executor
                    .get_all_bookmarks()
                    .into_iter()
                    .map(|info| info.name)
                    .collect();
                executor.abort("invoked workflow went idle");
                return Err(RuntimeError::IdleWithBookmarks(bookmarks));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        executor.abort("invocation timed out");
                        return Err(RuntimeError::Timeout(self.timeout.unwrap_or_default()));
                    }
                    remaining
                }
                None => Duration::from_millis(100),
            };
            executor.inbox().wait_timeout(wait);
        }
    }

    /// Run to completion on a dedicated thread
    pub fn invoke_async(&self, inputs: BTreeMap<String, Value>) -> AsyncInvokeOperation {
        let operation = AsyncInvokeOperation::default();
        let completion = operation.clone();
        let invoker = self.clone();
        std::thread::spawn(move || {
            let result = invoker.invoke(inputs);
            completion.complete(result);
        });
        operation
    }
}
