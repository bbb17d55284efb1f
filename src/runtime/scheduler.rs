//! Ready-work scheduler
//!
//! Work produced while an activity runs (child scheduling, completion
//! notifications) goes to the front so the tree is driven depth first.
//! Work arriving from outside the workflow (host resumptions, async
//! completions) goes to the back.

use super::activity::ChildCompletion;
use super::bookmark::Bookmark;
use super::instance::{FaultRecord, InstanceId};
use super::quack::Quack;
use super::value::Value;

/// Unit of work executed by the executor's loop
#[derive(Debug)]
pub enum WorkItem {
    /// Run the instance's body
    ExecuteBody {
        /// Target instance
        instance: InstanceId,
    },
    /// Deliver a bookmark resumption
    ResumeBookmark {
        /// Bookmark owner
        instance: InstanceId,
        /// Callback tag registered with the bookmark
        callback: Option<String>,
        /// Resumed bookmark
        bookmark: Bookmark,
        /// Payload
        value: Value,
    },
    /// Finish an asynchronous code activity
    CompleteAsync {
        /// Target instance
        instance: InstanceId,
        /// Outcome posted by the operation
        result: anyhow::Result<Value>,
    },
    /// Tell a parent that a child completed
    ChildCompleted {
        /// Parent instance
        parent: InstanceId,
        /// Completion callback tag
        callback: String,
        /// What completed
        completion: ChildCompletion,
    },
    /// Let a parent handle a descendant's fault
    ChildFaulted {
        /// Instance whose fault callback runs
        parent: InstanceId,
        /// Fault callback tag
        callback: String,
        /// Propagated fault
        fault: FaultRecord,
        /// Child through which the fault arrived
        propagator: InstanceId,
    },
    /// Deliver a cancellation request to the instance's behavior
    Cancel {
        /// Target instance
        instance: InstanceId,
    },
    /// Hand a transaction context to a waiting instance
    TransactionContext {
        /// Requesting instance
        instance: InstanceId,
        /// Callback tag
        callback: String,
    },
    /// Re-check whether the instance can complete
    Empty {
        /// Target instance
        instance: InstanceId,
    },
}

impl WorkItem {
    /// Instance the item runs against
    pub fn instance(&self) -> InstanceId {
        match self {
            WorkItem::ExecuteBody { instance }
            | WorkItem::ResumeBookmark { instance, .. }
            | WorkItem::CompleteAsync { instance, .. }
            | WorkItem::Cancel { instance }
            | WorkItem::TransactionContext { instance, .. }
            | WorkItem::Empty { instance } => *instance,
            WorkItem::ChildCompleted { parent, .. } | WorkItem::ChildFaulted { parent, .. } => *parent,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::ExecuteBody { .. } => "execute",
            WorkItem::ResumeBookmark { .. } => "resume-bookmark",
            WorkItem::CompleteAsync { .. } => "complete-async",
            WorkItem::ChildCompleted { .. } => "child-completed",
            WorkItem::ChildFaulted { .. } => "child-faulted",
            WorkItem::Cancel { .. } => "cancel",
            WorkItem::TransactionContext { .. } => "transaction-context",
            WorkItem::Empty { .. } => "empty",
        }
    }
}

/// Ready queue of work items
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: Quack<WorkItem>,
}

impl Scheduler {
    /// Empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `item` next
    pub fn push_work(&mut self, item: WorkItem) {
        self.queue.push_front(item);
    }

    /// Run `item` after everything already queued
    pub fn enqueue_work(&mut self, item: WorkItem) {
        self.queue.enqueue(item);
    }

    /// Take the next item
    pub fn next_work(&mut self) -> Option<WorkItem> {
        self.queue.dequeue()
    }

    /// Drop every queued item targeting `instance`, returning how many were dropped
    pub fn remove_for(&mut self, instance: InstanceId) -> usize {
        let mut removed = 0;
        while self
            .queue
            .remove_first(|item| item.instance() == instance)
            .is_some()
        {
            removed += 1;
        }
        removed
    }

    /// Whether nothing is ready
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of ready items
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Queued items, next first
    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> + '_ {
        self.queue.iter()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute(id: u64) -> WorkItem {
        WorkItem::ExecuteBody {
            instance: InstanceId(id),
        }
    }

    #[test]
    fn test_internal_work_runs_before_external() {
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_work(execute(1));
        scheduler.push_work(execute(2));
        scheduler.enqueue_work(execute(3));
        scheduler.push_work(execute(4));

        let order: Vec<u64> = std::iter::from_fn(|| scheduler.next_work())
            .map(|item| item.instance().0)
            .collect();
        assert_eq!(order, vec![4, 2, 1, 3]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_remove_for_drops_every_item_of_instance() {
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_work(execute(1));
        scheduler.enqueue_work(WorkItem::Empty {
            instance: InstanceId(2),
        });
        scheduler.enqueue_work(WorkItem::Cancel {
            instance: InstanceId(1),
        });

        assert_eq!(scheduler.remove_for(InstanceId(1)), 2);
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(scheduler.next_work().map(|item| item.kind()), Some("empty"));
    }
}
