//! Durable executor state and the persisted-instance index
//!
//! A snapshot is only taken at a persistable point: the ready queue is
//! empty, no asynchronous operation is outstanding, no no-persist zone is
//! open and no runtime transaction is active. That leaves exactly the
//! instance tree, the bookmark tables and the environments to record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use super::RuntimeConfig;
use super::bookmark::{BookmarkInfo, BookmarkManager, BookmarkScopeManager};
use super::error::{SnapshotError, SnapshotResult};
use super::executor::{ActivityExecutor, WorkflowStatus};
use super::extension::ExtensionRegistry;
use super::handle::HandleSlot;
use super::instance::{ActivityInstance, ActivityInstanceState, FaultRecord, InstanceId, InstanceMap};
use super::location::{LocationEnvironment, Slot};
use super::quack::Quack;
use super::transaction::TransactionWaiter;
use super::tree::{ActivityTree, QualifiedId};
use super::value::Value;

/// Persisted handle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleRecord {
    /// Declared handle name
    pub name: String,
    /// Registered type tag
    pub tag: String,
    /// Whether the runtime had initialized it
    pub initialized: bool,
    /// State reported by the handle
    pub state: Value,
}

/// Persisted instance environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    /// Location slots in declaration order
    pub slots: Vec<Slot>,
    /// Handles in declaration order
    pub handles: Vec<HandleRecord>,
}

/// Persisted activity instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance id
    pub id: InstanceId,
    /// Qualified id of the cached activity
    pub activity: QualifiedId,
    /// Parent instance
    pub parent: Option<InstanceId>,
    /// Live children in scheduling order
    pub children: Vec<InstanceId>,
    /// Current state
    pub state: ActivityInstanceState,
    /// Cancellation was requested
    pub is_cancellation_requested: bool,
    /// Marked canceled by its behavior
    pub marked_canceled: bool,
    /// Body has not run yet
    pub has_not_executed: bool,
    /// Completes faulted
    pub faulted: bool,
    /// Blocking bookmarks the instance is parked on
    pub blocking_bookmarks: u32,
    /// Queued for a transaction context
    pub waiting_for_transaction: bool,
    /// Completion callback registered with the parent
    pub completion_callback: Option<String>,
    /// Fault callback registered with the parent
    pub fault_callback: Option<String>,
    /// Environment, when the activity declares locations or handles
    pub environment: Option<EnvironmentRecord>,
}

/// Queued transaction-context request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiterRecord {
    /// Requesting instance
    pub instance: InstanceId,
    /// Callback tag
    pub callback: String,
}

/// Snapshot metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// When the snapshot was taken
    pub persisted_at: DateTime<Utc>,
    /// Display name of the root activity
    pub root_activity: String,
    /// Named bookmarks the workflow waits on
    pub bookmarks: Vec<BookmarkInfo>,
}

/// Complete durable state of one workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Workflow instance id
    pub instance_id: Uuid,
    /// Fingerprint of the tree the snapshot was taken against
    pub definition_fingerprint: String,
    /// Workflow-level state
    pub execution_state: WorkflowStatus,
    /// Root instance
    pub root: Option<InstanceId>,
    /// Last instance id handed out
    pub next_instance_id: u64,
    /// Live instances in id order
    pub instances: Vec<InstanceRecord>,
    /// Default-scope bookmark table
    pub bookmark_manager: BookmarkManager,
    /// Explicit bookmark scopes
    pub bookmark_scopes: BookmarkScopeManager,
    /// Queued transaction-context requests
    pub transaction_waiters: Vec<WaiterRecord>,
    /// Root outputs
    pub outputs: BTreeMap<String, Value>,
    /// Termination or fault reason
    pub completion_fault: Option<FaultRecord>,
    /// Abort reason
    pub abort_reason: Option<String>,
    /// Metadata
    pub metadata: SnapshotMetadata,
}

impl InstanceSnapshot {
    /// Summary for the store index
    pub fn index_entry(&self) -> SnapshotIndexEntry {
        SnapshotIndexEntry {
            instance_id: self.instance_id,
            status: self.execution_state,
            persisted_at: self.metadata.persisted_at,
            root_activity: self.metadata.root_activity.clone(),
            definition_fingerprint: self.definition_fingerprint.clone(),
            bookmarks: self
                .metadata
                .bookmarks
                .iter()
                .map(|info| info.name.clone())
                .collect(),
        }
    }
}

/// Index entry for one persisted instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIndexEntry {
    /// Workflow instance id
    pub instance_id: Uuid,
    /// Status at the last save
    pub status: WorkflowStatus,
    /// When it was last saved
    pub persisted_at: DateTime<Utc>,
    /// Display name of the root activity
    pub root_activity: String,
    /// Tree fingerprint
    pub definition_fingerprint: String,
    /// Named bookmarks at the last save
    pub bookmarks: Vec<String>,
}

/// Index of persisted instances
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotIndex {
    /// Entries keyed by instance id
    pub instances: HashMap<Uuid, SnapshotIndexEntry>,
}

impl SnapshotIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry
    pub fn upsert(&mut self, entry: SnapshotIndexEntry) {
        self.instances.insert(entry.instance_id, entry);
    }

    /// Drop an entry
    pub fn remove(&mut self, id: &Uuid) -> Option<SnapshotIndexEntry> {
        self.instances.remove(id)
    }

    /// Entry for `id`
    pub fn get(&self, id: &Uuid) -> Option<&SnapshotIndexEntry> {
        self.instances.get(id)
    }

    /// Entries, most recently persisted first
    pub fn entries(&self) -> Vec<SnapshotIndexEntry> {
        let mut entries: Vec<_> = self.instances.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.persisted_at
                .cmp(&a.persisted_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        entries
    }

    /// Save index to JSON
    pub fn save(&self, path: &std::path::Path) -> SnapshotResult<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| SnapshotError::InvalidFormat(e.to_string()))?;
        super::storage::write_atomic(path, &data)?;
        Ok(())
    }

    /// Load index from JSON, empty when the file does not exist yet
    pub fn load(path: &std::path::Path) -> SnapshotResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| SnapshotError::InvalidFormat(e.to_string()))
    }
}

impl ActivityExecutor {
    /// Capture the durable state. Fails unless the executor is persistable.
    pub fn snapshot(&self) -> SnapshotResult<InstanceSnapshot> {
        if let Some(blocker) = self.persist_blocker() {
            return Err(SnapshotError::NotPersistable(blocker));
        }

        let instances = self
            .instances
            .iter()
            .map(|instance| self.instance_record(instance))
            .collect();

        let root_activity = self.tree.node(self.tree.root()).name().to_string();
        Ok(InstanceSnapshot {
            instance_id: self.id,
            definition_fingerprint: self.tree.fingerprint().to_string(),
            execution_state: self.status,
            root: self.root,
            next_instance_id: self.instances.next_id(),
            instances,
            bookmark_manager: self.bookmarks.clone(),
            bookmark_scopes: self.scopes.clone(),
            transaction_waiters: self
                .transaction_waiters
                .iter()
                .map(|waiter| WaiterRecord {
                    instance: waiter.instance,
                    callback: waiter.callback.clone(),
                })
                .collect(),
            outputs: self.outputs.clone(),
            completion_fault: self.completion_fault.clone(),
            abort_reason: self.abort_reason.clone(),
            metadata: SnapshotMetadata {
                persisted_at: Utc::now(),
                root_activity,
                bookmarks: self.get_all_bookmarks(),
            },
        })
    }

    fn instance_record(&self, instance: &ActivityInstance) -> InstanceRecord {
        let environment = instance.environment.as_ref().map(|environment| EnvironmentRecord {
            slots: environment.slots.clone(),
            handles: environment
                .handles
                .iter()
                .map(|slot| HandleRecord {
                    name: slot.name().to_string(),
                    tag: slot.type_tag().to_string(),
                    initialized: slot.is_initialized(),
                    state: slot.handle().snapshot(),
                })
                .collect(),
        });

        InstanceRecord {
            id: instance.id,
            activity: self.tree.node(instance.activity).qualified_id().clone(),
            parent: instance.parent,
            children: instance.children.clone(),
            state: instance.state,
            is_cancellation_requested: instance.is_cancellation_requested,
            marked_canceled: instance.marked_canceled,
            has_not_executed: instance.has_not_executed,
            faulted: instance.faulted,
            blocking_bookmarks: instance.blocking_bookmarks,
            waiting_for_transaction: instance.waiting_for_transaction,
            completion_callback: instance.completion_callback.clone(),
            fault_callback: instance.fault_callback.clone(),
            environment,
        }
    }

    /// Rebuild an executor from `snapshot` over the same cached definition
    pub fn restore(
        tree: Arc<ActivityTree>,
        snapshot: InstanceSnapshot,
        config: RuntimeConfig,
        extensions: ExtensionRegistry,
    ) -> SnapshotResult<Self> {
        if snapshot.definition_fingerprint != tree.fingerprint() {
            return Err(SnapshotError::DefinitionMismatch {
                expected: tree.fingerprint().to_string(),
                found: snapshot.definition_fingerprint,
            });
        }

        let mut instances = InstanceMap::with_next_id(snapshot.next_instance_id);
        for record in snapshot.instances {
            instances.insert(restore_instance(&tree, record)?);
        }

        let mut executor = ActivityExecutor::with_id(snapshot.instance_id, tree, config, extensions);
        executor.instances = instances;
        executor.root = snapshot.root;
        executor.status = snapshot.execution_state;
        executor.bookmarks = snapshot.bookmark_manager;
        executor.scopes = snapshot.bookmark_scopes;
        executor.outputs = snapshot.outputs;
        executor.completion_fault = snapshot.completion_fault;
        executor.abort_reason = snapshot.abort_reason;

        let mut waiters = Quack::new();
        for waiter in snapshot.transaction_waiters {
            waiters.enqueue(TransactionWaiter {
                instance: waiter.instance,
                callback: waiter.callback,
            });
        }
        executor.transaction_waiters = waiters;

        tracing::info!(
            workflow = %executor.id,
            instances = executor.instances.len(),
            status = %executor.status,
            "workflow restored"
        );
        Ok(executor)
    }
}

fn restore_instance(tree: &ActivityTree, record: InstanceRecord) -> SnapshotResult<ActivityInstance> {
    let activity = tree
        .find(&record.activity)
        .ok_or_else(|| SnapshotError::InvalidFormat(format!("no activity with id {}", record.activity)))?;
    let node = tree.node(activity);

    let environment = match record.environment {
        Some(environment) => {
            let mut handles = Vec::with_capacity(environment.handles.len());
            for saved in environment.handles {
                let declared = node
                    .handles
                    .iter()
                    .find(|declared| declared.name == saved.name && declared.tag == saved.tag)
                    .ok_or_else(|| {
                        SnapshotError::InvalidFormat(format!(
                            "activity {} declares no '{}' handle named '{}'",
                            record.activity, saved.tag, saved.name
                        ))
                    })?;
                let mut slot = HandleSlot::new(&saved.name, record.id, (declared.factory)());
                slot.handle_mut()
                    .restore(&saved.state)
                    .map_err(|e| SnapshotError::InvalidFormat(format!("handle '{}': {:#}", saved.name, e)))?;
                slot.mark_initialized(saved.initialized);
                handles.push(slot);
            }
            Some(LocationEnvironment::new(environment.slots, handles))
        }
        None => None,
    };

    let mut instance = ActivityInstance::new(
        record.id,
        activity,
        record.parent,
        record.completion_callback,
        record.fault_callback,
    );
    instance.children = record.children;
    instance.environment = environment;
    instance.state = record.state;
    instance.is_cancellation_requested = record.is_cancellation_requested;
    instance.marked_canceled = record.marked_canceled;
    instance.has_not_executed = record.has_not_executed;
    instance.faulted = record.faulted;
    instance.blocking_bookmarks = record.blocking_bookmarks;
    instance.waiting_for_transaction = record.waiting_for_transaction;
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(persisted_at: DateTime<Utc>) -> SnapshotIndexEntry {
        SnapshotIndexEntry {
            instance_id: Uuid::new_v4(),
            status: WorkflowStatus::Executing,
            persisted_at,
            root_activity: "root".into(),
            definition_fingerprint: "abc".into(),
            bookmarks: vec!["approve".into()],
        }
    }

    #[test]
    fn test_index_orders_newest_first() {
        let mut index = SnapshotIndex::new();
        let old = entry(Utc::now() - chrono::Duration::minutes(5));
        let new = entry(Utc::now());
        index.upsert(old.clone());
        index.upsert(new.clone());

        let entries = index.entries();
        assert_eq!(entries[0].instance_id, new.instance_id);
        assert_eq!(entries[1].instance_id, old.instance_id);

        assert!(index.remove(&old.instance_id).is_some());
        assert_eq!(index.entries().len(), 1);
    }

    #[test]
    fn test_index_persists() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("instances.json");
        assert!(SnapshotIndex::load(&path).unwrap().instances.is_empty());

        let mut index = SnapshotIndex::new();
        let saved = entry(Utc::now());
        index.upsert(saved.clone());
        index.save(&path).unwrap();

        let loaded = SnapshotIndex::load(&path).unwrap();
        assert_eq!(loaded.get(&saved.instance_id), Some(&saved));
    }
}
