//! Runtime transactions
//!
//! A transaction-scope activity asks the executor for a transaction context.
//! The request is served once the workflow is idle and persistable, and the
//! activity then binds a `Transaction` to one of its handles. Until the
//! transaction completes, bookmarks owned outside the isolation scope are not
//! resumable and the instance cannot be persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::instance::InstanceId;

/// Ambient transaction bound to a scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id
    pub id: Uuid,
    /// When the transaction was started
    pub started_at: DateTime<Utc>,
}

impl Transaction {
    /// Fresh transaction
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.id)
    }
}

/// Host-side transaction manager, registered as `Arc<dyn TransactionCoordinator>`
pub trait TransactionCoordinator: Send + Sync {
    /// A scope bound `transaction`
    fn begin(&self, transaction: &Transaction) -> anyhow::Result<()>;

    /// The scope completed normally
    fn commit(&self, transaction: &Transaction) -> anyhow::Result<()>;

    /// The scope faulted, was canceled or the workflow aborted
    fn rollback(&self, transaction: &Transaction, reason: &str);
}

/// Transaction currently bound by the executor
#[derive(Debug, Clone)]
pub(crate) struct RuntimeTransaction {
    pub(crate) transaction: Transaction,
    pub(crate) isolation_scope: InstanceId,
    pub(crate) handle_owner: InstanceId,
    pub(crate) handle_name: String,
}

/// Pending request for a transaction context
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransactionWaiter {
    pub(crate) instance: InstanceId,
    pub(crate) callback: String,
}
