//! Activity instances and the instance map
//!
//! An `ActivityInstance` is one in-flight execution of one cached activity.
//! Instances form their own tree (recursion and loops produce several
//! instances of a single definition) with back-references to the parent
//! used only for completion and fault delivery.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::location::LocationEnvironment;
use super::tree::ActivityId;

/// Identifier of an activity instance within one workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution state of an instance. Only `Executing` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityInstanceState {
    /// Running or waiting
    Executing,
    /// Completed normally
    Closed,
    /// Completed after honoring a cancel request
    Canceled,
    /// Completed after an unhandled fault or abort
    Faulted,
}

impl ActivityInstanceState {
    /// Whether the state is final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActivityInstanceState::Executing)
    }
}

impl fmt::Display for ActivityInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityInstanceState::Executing => "Executing",
            ActivityInstanceState::Closed => "Closed",
            ActivityInstanceState::Canceled => "Canceled",
            ActivityInstanceState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// Exception propagated through the instance tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Top-level message
    pub message: String,
    /// Messages of the cause chain, outermost first
    pub chain: Vec<String>,
    /// Instance that raised the fault
    pub source: InstanceId,
    /// Display name of the raising activity
    pub source_activity: String,
    /// Original error while the workflow stays in memory
    #[serde(skip)]
    pub error: Option<Arc<anyhow::Error>>,
}

impl FaultRecord {
    /// Capture an activity error
    pub fn from_error(error: anyhow::Error, source: InstanceId, source_activity: impl Into<String>) -> Self {
        let chain = error.chain().map(|cause| cause.to_string()).collect();
        Self {
            message: error.to_string(),
            chain,
            source,
            source_activity: source_activity.into(),
            error: Some(Arc::new(error)),
        }
    }

    /// Fault with only a message, such as an abort reason
    pub fn from_message(message: impl Into<String>, source: InstanceId, source_activity: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            chain: vec![message.clone()],
            message,
            source,
            source_activity: source_activity.into(),
            error: None,
        }
    }

    /// Original error, if still attached
    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_deref()
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (raised by '{}' #{})", self.message, self.source_activity, self.source)
    }
}

/// One runtime execution of a cached activity
#[derive(Debug)]
pub struct ActivityInstance {
    pub(crate) id: InstanceId,
    pub(crate) activity: ActivityId,
    pub(crate) state: ActivityInstanceState,
    pub(crate) parent: Option<InstanceId>,
    pub(crate) children: Vec<InstanceId>,
    pub(crate) environment: Option<LocationEnvironment>,
    pub(crate) is_cancellation_requested: bool,
    pub(crate) marked_canceled: bool,
    pub(crate) has_not_executed: bool,
    pub(crate) faulted: bool,
    pub(crate) busy_count: u32,
    pub(crate) blocking_bookmarks: u32,
    pub(crate) waiting_for_transaction: bool,
    pub(crate) propagating_fault: bool,
    pub(crate) pending_completions: u32,
    pub(crate) completion_callback: Option<String>,
    pub(crate) fault_callback: Option<String>,
}

impl ActivityInstance {
    pub(crate) fn new(
        id: InstanceId,
        activity: ActivityId,
        parent: Option<InstanceId>,
        completion_callback: Option<String>,
        fault_callback: Option<String>,
    ) -> Self {
        Self {
            id,
            activity,
            state: ActivityInstanceState::Executing,
            parent,
            children: Vec::new(),
            environment: None,
            is_cancellation_requested: false,
            marked_canceled: false,
            has_not_executed: true,
            faulted: false,
            busy_count: 0,
            blocking_bookmarks: 0,
            waiting_for_transaction: false,
            propagating_fault: false,
            pending_completions: 0,
            completion_callback,
            fault_callback,
        }
    }

    /// Instance id
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Cached activity this instance executes
    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    /// Current state
    pub fn state(&self) -> ActivityInstanceState {
        self.state
    }

    /// Parent instance
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Live child instances in scheduling order
    pub fn children(&self) -> &[InstanceId] {
        &self.children
    }

    /// Runtime locations, if the activity declares any
    pub fn environment(&self) -> Option<&LocationEnvironment> {
        self.environment.as_ref()
    }

    /// Whether cancellation was requested
    pub fn is_cancellation_requested(&self) -> bool {
        self.is_cancellation_requested
    }

    /// Whether the body has not run yet
    pub fn has_not_executed(&self) -> bool {
        self.has_not_executed
    }

    /// Number of blocking bookmarks the instance is parked on
    pub fn blocking_bookmark_count(&self) -> u32 {
        self.blocking_bookmarks
    }

    /// Whether the instance is done
    pub fn is_completed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether anything still keeps the instance executing
    pub fn has_pending_work(&self) -> bool {
        !self.children.is_empty()
            || self.blocking_bookmarks > 0
            || self.busy_count > 0
            || self.waiting_for_transaction
            || self.propagating_fault
            || self.pending_completions > 0
    }

    /// Move to a new state. Terminal states are final.
    pub(crate) fn set_state(&mut self, state: ActivityInstanceState) {
        assert!(
            !self.state.is_terminal() || self.state == state,
            "activity instance {} cannot move from {} to {}",
            self.id,
            self.state,
            state
        );
        self.state = state;
    }

    /// State the instance completes in right now
    pub(crate) fn completion_state(&self) -> ActivityInstanceState {
        if self.faulted {
            ActivityInstanceState::Faulted
        } else if self.marked_canceled || (self.is_cancellation_requested && self.has_not_executed) {
            ActivityInstanceState::Canceled
        } else {
            ActivityInstanceState::Closed
        }
    }
}

/// Arena of live instances keyed by id
#[derive(Debug, Default)]
pub struct InstanceMap {
    instances: BTreeMap<InstanceId, ActivityInstance>,
    next_id: u64,
}

impl InstanceMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_next_id(next_id: u64) -> Self {
        Self {
            instances: BTreeMap::new(),
            next_id,
        }
    }

    pub(crate) fn allocate_id(&mut self) -> InstanceId {
        self.next_id += 1;
        InstanceId(self.next_id)
    }

    /// Give back `id` when it was the last one handed out and never inserted
    pub(crate) fn release_id(&mut self, id: InstanceId) {
        if id.0 == self.next_id && !self.instances.contains_key(&id) {
            self.next_id -= 1;
        }
    }

    /// Last id handed out
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub(crate) fn insert(&mut self, instance: ActivityInstance) {
        self.instances.insert(instance.id, instance);
    }

    /// Instance by id
    pub fn get(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut ActivityInstance> {
        self.instances.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: InstanceId) -> Option<ActivityInstance> {
        self.instances.remove(&id)
    }

    /// Whether `id` is tracked
    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Whether `id` is tracked and executing
    pub fn is_executing(&self, id: InstanceId) -> bool {
        self.get(id)
            .is_some_and(|instance| instance.state == ActivityInstanceState::Executing)
    }

    /// Whether `ancestor` is `id` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: InstanceId, id: InstanceId) -> bool {
        let mut current = Some(id);
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            current = self.get(candidate).and_then(|instance| instance.parent);
        }
        false
    }

    /// Live instances in id order
    pub fn iter(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.instances.values()
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instances are live
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.instances.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_state_rules() {
        let mut instance = ActivityInstance::new(InstanceId(1), ActivityId(0), None, None, None);
        assert_eq!(instance.completion_state(), ActivityInstanceState::Closed);

        instance.is_cancellation_requested = true;
        assert_eq!(instance.completion_state(), ActivityInstanceState::Canceled);

        instance.has_not_executed = false;
        assert_eq!(instance.completion_state(), ActivityInstanceState::Closed);

        instance.marked_canceled = true;
        assert_eq!(instance.completion_state(), ActivityInstanceState::Canceled);

        instance.faulted = true;
        assert_eq!(instance.completion_state(), ActivityInstanceState::Faulted);
    }

    #[test]
    #[should_panic(expected = "cannot move from Closed to Executing")]
    fn test_terminal_state_is_final() {
        let mut instance = ActivityInstance::new(InstanceId(1), ActivityId(0), None, None, None);
        instance.set_state(ActivityInstanceState::Closed);
        instance.set_state(ActivityInstanceState::Executing);
    }

    #[test]
    fn test_pending_work() {
        let mut instance = ActivityInstance::new(InstanceId(1), ActivityId(0), None, None, None);
        assert!(!instance.has_pending_work());
        instance.blocking_bookmarks = 1;
        assert!(instance.has_pending_work());
        instance.blocking_bookmarks = 0;
        instance.busy_count = 1;
        assert!(instance.has_pending_work());
    }

    #[test]
    fn test_ancestor_walk() {
        let mut map = InstanceMap::new();
        let root = map.allocate_id();
        let child = map.allocate_id();
        map.insert(ActivityInstance::new(root, ActivityId(0), None, None, None));
        map.insert(ActivityInstance::new(child, ActivityId(1), Some(root), None, None));
        assert!(map.is_ancestor_or_self(root, child));
        assert!(map.is_ancestor_or_self(child, child));
        assert!(!map.is_ancestor_or_self(child, root));
    }

    #[test]
    fn test_fault_record_keeps_chain() {
        let error = anyhow::anyhow!("disk full").context("saving order");
        let fault = FaultRecord::from_error(error, InstanceId(4), "Save");
        assert_eq!(fault.message, "saving order");
        assert_eq!(fault.chain, vec!["saving order".to_string(), "disk full".to_string()]);
        assert!(fault.error().is_some());
        assert!(fault.to_string().contains("'Save' #4"));
    }
}
