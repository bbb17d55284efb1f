//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that ties the activity
//! tree cache, the handle registry, host extensions and the instance store
//! together, plus the configuration shared by every executor it creates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Submodules
pub mod activity;
pub mod async_op;
pub mod bookmark;
pub mod context;
pub mod control;
pub mod environment;
pub mod error;
pub mod executor;
pub mod extension;
pub mod handle;
pub mod host;
pub mod id_space;
pub mod instance;
pub mod location;
pub mod quack;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod transaction;
pub mod tree;
pub mod value;

use activity::Activity;
use error::{SnapshotResult, ValidationErrors};
use executor::{ActivityExecutor, UnhandledExceptionAction};
use extension::ExtensionRegistry;
use handle::HandleFactoryRegistry;
use storage::InstanceStore;
use tree::ActivityTree;

/// Configuration for the Trellis runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for the instance store (default: .trellis/)
    pub root: PathBuf,

    /// Upper bound on host waits for the workflow thread and the store
    #[serde(with = "duration_millis")]
    pub acquire_lock_timeout: Duration,

    /// Unregister a bookmark scope once no handle references it
    pub auto_disassociate_scopes: bool,

    /// Allow persistence while a fault is being propagated
    pub persist_exceptions: bool,

    /// What happens to a fault nobody handles
    pub unhandled_exception_action: UnhandledExceptionAction,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".trellis"),
            acquire_lock_timeout: Duration::from_secs(30),
            auto_disassociate_scopes: true,
            persist_exceptions: true,
            unhandled_exception_action: UnhandledExceptionAction::Terminate,
            debug: false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// The main runtime orchestrator
///
/// Caches definitions, creates executors that share the runtime's
/// extensions, and persists or restores them through the instance store.
pub struct Runtime {
    config: RuntimeConfig,
    store: InstanceStore,
    handles: HandleFactoryRegistry,
    extensions: Arc<ExtensionRegistry>,
}

impl Runtime {
    /// Create a new runtime with the given configuration
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        Self::with_extensions(config, ExtensionRegistry::new())
    }

    /// Create a runtime whose executors see `extensions`
    pub fn with_extensions(config: RuntimeConfig, extensions: ExtensionRegistry) -> anyhow::Result<Self> {
        let store = InstanceStore::open(config.root.clone())?;
        Ok(Self {
            config,
            store,
            handles: HandleFactoryRegistry::with_builtins(),
            extensions: Arc::new(extensions),
        })
    }

    /// Initialize runtime storage directories and metadata
    pub fn init(config: RuntimeConfig) -> anyhow::Result<()> {
        storage::init_storage(&config.root)?;
        storage::write_config(&config)?;
        Ok(())
    }

    /// Load an existing runtime from storage
    pub fn load(root: PathBuf) -> anyhow::Result<Self> {
        let config = storage::load_config(&root)?;
        Self::new(config)
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the instance store
    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    /// Handle types available to definitions cached by this runtime
    pub fn handle_factories_mut(&mut self) -> &mut HandleFactoryRegistry {
        &mut self.handles
    }

    /// Validate and cache `root`
    pub fn cache(&self, root: Arc<Activity>) -> Result<Arc<ActivityTree>, ValidationErrors> {
        ActivityTree::cache(root, &self.handles)
    }

    /// Fresh executor over `tree`
    pub fn create_executor(&self, tree: Arc<ActivityTree>) -> ActivityExecutor {
        ActivityExecutor::new(tree, self.config.clone(), self.executor_extensions())
    }

    /// Save `executor` to the store
    pub fn persist(&self, executor: &ActivityExecutor) -> SnapshotResult<()> {
        let snapshot = executor.snapshot()?;
        self.store.save(&snapshot)?;
        tracing::info!(workflow = %snapshot.instance_id, status = %snapshot.execution_state, "workflow persisted");
        Ok(())
    }

    /// Reload instance `id` over `tree`
    pub fn restore(&self, tree: Arc<ActivityTree>, id: &Uuid) -> SnapshotResult<ActivityExecutor> {
        let snapshot = self.store.load(id)?;
        ActivityExecutor::restore(tree, snapshot, self.config.clone(), self.executor_extensions())
    }

    fn executor_extensions(&self) -> ExtensionRegistry {
        ExtensionRegistry::with_parent(Arc::clone(&self.extensions))
    }
}

// Re-export commonly used types
pub use activity::{
    ActivityBehavior, ActivityDelegate, Argument, ArgumentDirection, AsyncCodeActivity, ChildCompletion,
    CodeActivity, DelegateArgument, NativeActivity, Variable, RESULT_ARGUMENT,
};
pub use async_op::AsyncCompletion;
pub use bookmark::{Bookmark, BookmarkInfo, BookmarkOptions, BookmarkResumptionResult, BookmarkScope};
pub use context::{ActivityContext, ContextKind};
pub use control::Control;
pub use error::RuntimeError;
pub use executor::{WorkflowEvent, WorkflowStatus};
pub use host::{AsyncInvokeOperation, WorkflowApplication, WorkflowInvoker};
pub use instance::{ActivityInstanceState, FaultRecord, InstanceId};
pub use transaction::{Transaction, TransactionCoordinator};
pub use value::{Value, ValueKind};
