//! Runtime control facade for CLI and tests
//!
//! Provides a high-level API over a `Runtime` and a catalog of registered
//! definitions: start a workflow, resume one of its bookmarks, cancel it and
//! inspect what the store holds. Every call restores the instance, drives
//! it until it is idle and persists it again.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::Runtime;
use super::activity::Activity;
use super::bookmark::BookmarkResumptionResult;
use super::error::{Result, RuntimeError, SnapshotError};
use super::executor::{ActivityExecutor, WorkflowStatus};
use super::snapshot::SnapshotIndexEntry;
use super::tree::ActivityTree;
use super::value::Value;

/// Where a workflow stands after a control call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow instance id
    pub id: Uuid,
    /// Definition name
    pub definition: String,
    /// Workflow-level status
    pub status: WorkflowStatus,
    /// Named bookmarks it waits on
    pub bookmarks: Vec<String>,
    /// Root outputs, once closed
    pub outputs: BTreeMap<String, Value>,
    /// Fault or abort reason, if any
    pub reason: Option<String>,
}

/// Store-wide status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Store root
    pub root: String,
    /// Registered definition names
    pub definitions: Vec<String>,
    /// Persisted instances
    pub persisted: usize,
    /// Persisted instances still executing
    pub executing: usize,
}

/// Control interface for the runtime
pub struct Control {
    runtime: Runtime,
    definitions: BTreeMap<String, Arc<ActivityTree>>,
}

impl Control {
    /// Create a new control interface
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            definitions: BTreeMap::new(),
        }
    }

    /// Underlying runtime
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Validate, cache and register `root` under `name`
    pub fn register(&mut self, name: impl Into<String>, root: Arc<Activity>) -> Result<()> {
        let tree = self.runtime.cache(root)?;
        self.definitions.insert(name.into(), tree);
        Ok(())
    }

    /// Registered definition names
    pub fn definitions(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    fn tree(&self, name: &str) -> Result<Arc<ActivityTree>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::Config(format!("unknown workflow definition '{}'", name)))
    }

    fn definition_for(&self, fingerprint: &str) -> Result<(String, Arc<ActivityTree>)> {
        self.definitions
            .iter()
            .find(|(_, tree)| tree.fingerprint() == fingerprint)
            .map(|(name, tree)| (name.clone(), Arc::clone(tree)))
            .ok_or_else(|| {
                RuntimeError::Config(format!(
                    "no registered definition matches fingerprint {}",
                    fingerprint
                ))
            })
    }

    fn load(&self, id: &Uuid) -> Result<(String, ActivityExecutor)> {
        let entry = self
            .runtime
            .store()
            .entry(id)
            .ok_or(SnapshotError::NotFound(*id))?;
        let (name, tree) = self.definition_for(&entry.definition_fingerprint)?;
        let executor = self.runtime.restore(tree, id)?;
        Ok((name, executor))
    }

    fn settle(&self, definition: String, executor: &mut ActivityExecutor) -> Result<WorkflowSummary> {
        let status = executor.run();
        for event in executor.take_events() {
            tracing::debug!(workflow = %executor.id(), ?event, "workflow event");
        }
        self.runtime.persist(executor)?;
        Ok(summarize(definition, executor, status))
    }

    /// Start a new instance of definition `name`
    pub fn start(&mut self, name: &str, inputs: BTreeMap<String, Value>) -> Result<WorkflowSummary> {
        let tree = self.tree(name)?;
        let mut executor = self.runtime.create_executor(tree);
        executor.schedule_root(inputs)?;
        tracing::info!(workflow = %executor.id(), definition = name, "workflow started");
        self.settle(name.to_string(), &mut executor)
    }

    /// Resume bookmark `bookmark` of instance `id` with `value`
    pub fn resume(
        &mut self,
        id: &Uuid,
        bookmark: &str,
        value: Value,
    ) -> Result<(BookmarkResumptionResult, WorkflowSummary)> {
        let (definition, mut executor) = self.load(id)?;
        let result = executor.resume_bookmark(bookmark, value);
        let summary = self.settle(definition, &mut executor)?;
        Ok((result, summary))
    }

    /// Cancel instance `id`
    pub fn cancel(&mut self, id: &Uuid) -> Result<WorkflowSummary> {
        let (definition, mut executor) = self.load(id)?;
        executor.cancel_root();
        self.settle(definition, &mut executor)
    }

    /// Current summary of instance `id`
    pub fn inspect(&self, id: &Uuid) -> Result<WorkflowSummary> {
        let (definition, executor) = self.load(id)?;
        let status = executor.state();
        Ok(summarize(definition, &executor, status))
    }

    /// Named bookmarks instance `id` waits on
    pub fn bookmarks(&self, id: &Uuid) -> Result<Vec<String>> {
        let snapshot = self.runtime.store().load(id)?;
        Ok(snapshot
            .metadata
            .bookmarks
            .into_iter()
            .map(|info| info.name)
            .collect())
    }

    /// Persisted instances, most recent first
    pub fn list(&self) -> Vec<SnapshotIndexEntry> {
        self.runtime.store().list()
    }

    /// Get runtime status
    pub fn status(&self) -> RuntimeStatus {
        let entries = self.list();
        RuntimeStatus {
            root: self.runtime.config().root.display().to_string(),
            definitions: self.definitions(),
            persisted: entries.len(),
            executing: entries
                .iter()
                .filter(|entry| entry.status == WorkflowStatus::Executing)
                .count(),
        }
    }
}

fn summarize(definition: String, executor: &ActivityExecutor, status: WorkflowStatus) -> WorkflowSummary {
    let reason = executor
        .completion_fault()
        .map(|fault| fault.message.clone())
        .or_else(|| executor.abort_reason().map(str::to_string));
    WorkflowSummary {
        id: executor.id(),
        definition,
        status,
        bookmarks: executor
            .get_all_bookmarks()
            .into_iter()
            .map(|info| info.name)
            .collect(),
        outputs: executor.outputs().clone(),
        reason,
    }
}
