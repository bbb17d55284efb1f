//! Asynchronous completion contract
//!
//! An async code activity starts work that finishes on another thread. The
//! executor tracks it with an `AsyncOperationContext` and hands the activity
//! an `AsyncCompletion`, which posts the result into the executor's `Inbox`.
//! The workflow thread drains the inbox and resumes the operation's internal
//! bookmark, so instance state is never touched from the signaling thread.

use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::bookmark::Bookmark;
use super::instance::InstanceId;
use super::value::Value;

/// Lifecycle of one outstanding operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOperationState {
    /// Started and not yet finished
    Active,
    /// Canceled before it completed
    Canceled,
    /// Completed
    Completed,
}

/// Bookkeeping for the single outstanding operation of one instance
#[derive(Debug)]
pub struct AsyncOperationContext {
    instance: InstanceId,
    bookmark: Bookmark,
    state: AsyncOperationState,
    cancel_recorded: bool,
}

impl AsyncOperationContext {
    pub(crate) fn new(instance: InstanceId, bookmark: Bookmark) -> Self {
        Self {
            instance,
            bookmark,
            state: AsyncOperationState::Active,
            cancel_recorded: false,
        }
    }

    /// Owning instance
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Internal bookmark resumed when the operation completes
    pub fn bookmark(&self) -> &Bookmark {
        &self.bookmark
    }

    /// Current state
    pub fn state(&self) -> AsyncOperationState {
        self.state
    }

    /// Whether neither completion nor cancellation has happened
    pub fn is_still_active(&self) -> bool {
        self.state == AsyncOperationState::Active
    }

    /// Whether cancellation was requested, before or after completion
    pub fn has_been_canceled(&self) -> bool {
        self.state == AsyncOperationState::Canceled || self.cancel_recorded
    }

    /// Mark the operation complete.
    ///
    /// A no-op after cancellation. Completing twice means the executor's
    /// bookkeeping is corrupt and panics.
    pub fn complete_operation(&mut self) {
        match self.state {
            AsyncOperationState::Active => self.state = AsyncOperationState::Completed,
            AsyncOperationState::Canceled => {}
            AsyncOperationState::Completed => panic!(
                "asynchronous operation for instance {} completed twice",
                self.instance
            ),
        }
    }

    /// Cancel the operation. After completion this is only recorded.
    pub fn cancel_operation(&mut self) {
        match self.state {
            AsyncOperationState::Active => self.state = AsyncOperationState::Canceled,
            AsyncOperationState::Canceled => {}
            AsyncOperationState::Completed => self.cancel_recorded = true,
        }
    }
}

/// Result posted from an operation's thread
#[derive(Debug)]
pub struct AsyncCompletionSignal {
    /// Owning instance
    pub instance: InstanceId,
    /// Internal bookmark of the operation
    pub bookmark: Bookmark,
    /// Operation outcome
    pub result: anyhow::Result<Value>,
}

/// Cross-thread queue of completion signals
#[derive(Debug, Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<AsyncCompletionSignal>>,
    available: Condvar,
    notify: Notify,
}

impl Inbox {
    /// Empty inbox
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Post a signal and wake any waiter
    pub fn post(&self, signal: AsyncCompletionSignal) {
        self.queue.lock().push_back(signal);
        self.available.notify_all();
        self.notify.notify_one();
    }

    /// Take every queued signal
    pub fn drain(&self) -> Vec<AsyncCompletionSignal> {
        self.queue.lock().drain(..).collect()
    }

    /// Whether signals are queued
    pub fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Block until a signal is queued or `timeout` elapses. Returns whether one is queued.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            let _ = self.available.wait_for(&mut queue, timeout);
        }
        !queue.is_empty()
    }

    /// Wait asynchronously for the next post
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

/// Completion token handed to an async code activity.
///
/// Consumed by `complete`, so one operation reports exactly one result.
#[derive(Debug)]
pub struct AsyncCompletion {
    instance: InstanceId,
    bookmark: Bookmark,
    inbox: Arc<Inbox>,
}

impl AsyncCompletion {
    pub(crate) fn new(instance: InstanceId, bookmark: Bookmark, inbox: Arc<Inbox>) -> Self {
        Self {
            instance,
            bookmark,
            inbox,
        }
    }

    /// Instance the operation belongs to
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Report the outcome. Safe to call from any thread.
    pub fn complete(self, result: anyhow::Result<Value>) {
        self.inbox.post(AsyncCompletionSignal {
            instance: self.instance,
            bookmark: self.bookmark,
            result,
        });
    }

    /// Drive `future` and report its output.
    ///
    /// Runs on the current tokio runtime when there is one, otherwise on a
    /// dedicated thread.
    pub fn spawn(self, future: BoxFuture<'static, anyhow::Result<Value>>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = future.await;
                    self.complete(result);
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    let result = futures::executor::block_on(future);
                    self.complete(result);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;

    fn operation() -> AsyncOperationContext {
        AsyncOperationContext::new(InstanceId(1), Bookmark::Internal(NonZeroU64::new(9).unwrap()))
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn test_double_completion_is_fatal() {
        let mut op = operation();
        op.complete_operation();
        op.complete_operation();
    }

    #[test]
    fn test_cancel_after_complete_is_recorded() {
        let mut op = operation();
        op.complete_operation();
        op.cancel_operation();
        assert!(!op.is_still_active());
        assert!(op.has_been_canceled());
        assert_eq!(op.state(), AsyncOperationState::Completed);
    }

    #[test]
    fn test_complete_after_cancel_is_noop() {
        let mut op = operation();
        op.cancel_operation();
        op.complete_operation();
        assert_eq!(op.state(), AsyncOperationState::Canceled);
        assert!(!op.is_still_active());
    }

    #[test]
    fn test_completion_crosses_threads() {
        let inbox = Inbox::new();
        let completion = AsyncCompletion::new(
            InstanceId(2),
            Bookmark::Internal(NonZeroU64::new(1).unwrap()),
            Arc::clone(&inbox),
        );
        let worker = std::thread::spawn(move || completion.complete(Ok(Value::from(42))));
        worker.join().unwrap();

        assert!(inbox.wait_timeout(Duration::from_secs(1)));
        let signals = inbox.drain();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].instance, InstanceId(2));
        assert_eq!(signals[0].result.as_ref().unwrap(), &Value::from(42));
    }

    #[test]
    fn test_spawn_without_runtime_uses_thread() {
        let inbox = Inbox::new();
        let completion = AsyncCompletion::new(
            InstanceId(3),
            Bookmark::Internal(NonZeroU64::new(2).unwrap()),
            Arc::clone(&inbox),
        );
        completion.spawn(Box::pin(async { Ok(Value::from("done")) }));
        assert!(inbox.wait_timeout(Duration::from_secs(5)));
        assert_eq!(inbox.drain().len(), 1);
    }
}
