//! Error types for the Trellis runtime
//!
//! Domain errors use thiserror and convert into `RuntimeError` at the
//! orchestration boundary. Activity bodies report faults through
//! `anyhow::Result`; internal invariant violations panic instead of
//! producing a value.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Activity tree failed to cache
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    /// API used outside its valid state
    #[error("Invalid operation: {0}")]
    Usage(#[from] UsageError),

    /// Bookmark table or scope errors
    #[error("Bookmark error: {0}")]
    Bookmark(#[from] BookmarkError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot-related errors
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A host wait exceeded the acquire-lock timeout
    #[error("Timed out after {0:?} waiting for the workflow")]
    Timeout(Duration),

    /// The host task is gone
    #[error("Workflow host is no longer running")]
    HostClosed,

    /// The workflow instance was aborted
    #[error("Workflow aborted: {0}")]
    Aborted(String),

    /// The workflow completed in the faulted state
    #[error("Workflow faulted: {0}")]
    Faulted(String),

    /// The workflow completed in the canceled state
    #[error("Workflow canceled")]
    Canceled,

    /// A synchronous invocation went idle waiting on bookmarks
    #[error("Workflow went idle waiting on bookmarks: {0:?}")]
    IdleWithBookmarks(Vec<String>),
}

/// A single tree-shape problem found while caching
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Definition is already part of a live tree
    #[error("Activity '{activity}' is already cached into a tree")]
    ActivityReused {
        /// Display name of the activity
        activity: String,
    },

    /// Two declarations share a name in one scope
    #[error("Duplicate name '{name}' declared by '{activity}'")]
    DuplicateName {
        /// Conflicting name
        name: String,
        /// Declaring activity
        activity: String,
    },

    /// Binding names nothing visible from the declaration site
    #[error("Argument '{argument}' of '{activity}' binds to '{target}', which is not visible")]
    UnresolvedReference {
        /// Owning activity
        activity: String,
        /// Argument name
        argument: String,
        /// Name that failed to resolve
        target: String,
    },

    /// Bound reference has an incompatible kind
    #[error("Argument '{argument}' of '{activity}' expects {expected} but '{target}' is {found}")]
    KindMismatch {
        /// Owning activity
        activity: String,
        /// Argument name
        argument: String,
        /// Bound name
        target: String,
        /// Declared kind
        expected: String,
        /// Kind of the bound reference
        found: String,
    },

    /// Literal does not fit the declared kind
    #[error("Literal for '{name}' on '{activity}' is not a {expected}")]
    LiteralMismatch {
        /// Owning activity
        activity: String,
        /// Argument or variable name
        name: String,
        /// Declared kind
        expected: String,
    },

    /// Binding direction conflicts with the target's access
    #[error("Argument '{argument}' of '{activity}' cannot bind to '{target}': {detail}")]
    InvalidBinding {
        /// Owning activity
        activity: String,
        /// Argument name
        argument: String,
        /// Bound name
        target: String,
        /// Why the binding is rejected
        detail: String,
    },

    /// Required argument left unbound below the root
    #[error("Required argument '{argument}' of '{activity}' is unbound")]
    MissingRequiredArgument {
        /// Owning activity
        activity: String,
        /// Argument name
        argument: String,
    },

    /// No factory registered for a handle type tag
    #[error("Handle '{name}' on '{activity}' has unknown type '{tag}'")]
    UnknownHandleType {
        /// Owning activity
        activity: String,
        /// Handle name
        name: String,
        /// Requested type tag
        tag: String,
    },

    /// Delegate declares the same argument twice
    #[error("Delegate '{delegate}' on '{activity}' declares argument '{argument}' more than once")]
    DuplicateDelegateArgument {
        /// Owning activity
        activity: String,
        /// Delegate name
        delegate: String,
        /// Repeated argument name
        argument: String,
    },

    /// Scope ran out of ids
    #[error("Id space exhausted after {limit} members")]
    IdSpaceOverflow {
        /// Maximum number of members
        limit: u32,
    },
}

/// Every validation error from one caching pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// The collected errors
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    /// Number of errors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no errors were collected
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Invalid-operation failures reported at the call site
#[derive(Debug, Error)]
pub enum UsageError {
    /// Context used after its activity callback returned
    #[error("The execution context has been disposed")]
    ContextDisposed,

    /// Operation not offered by this context kind
    #[error("'{operation}' is not available in a {context} context")]
    CapabilityUnavailable {
        /// Requested operation
        operation: &'static str,
        /// Context kind name
        context: &'static str,
    },

    /// Handle used before the runtime initialized it
    #[error("Handle '{0}' is not initialized")]
    HandleNotInitialized(String),

    /// Handle initialized twice
    #[error("Handle '{0}' is already initialized")]
    HandleAlreadyInitialized(String),

    /// Handle exists but has a different type
    #[error("Handle '{name}' is a '{found}', not a '{expected}'")]
    HandleTypeMismatch {
        /// Handle name
        name: String,
        /// Requested type tag
        expected: &'static str,
        /// Actual type tag
        found: String,
    },

    /// No handle with this name is visible
    #[error("No handle named '{0}' is visible")]
    UnknownHandle(String),

    /// Runtime transaction already bound in this scope
    #[error("A runtime transaction is already set")]
    TransactionAlreadySet,

    /// No runtime transaction to complete
    #[error("There is no runtime transaction owned by this activity")]
    NoTransactionContext,

    /// Coordinator refused to commit
    #[error("Transaction commit failed: {0}")]
    TransactionCommitFailed(String),

    /// `mark_canceled` without a pending cancel request
    #[error("Cannot mark an activity canceled unless cancellation was requested")]
    MarkCanceledWithoutRequest,

    /// A second asynchronous operation for one activity
    #[error("Activity instance {0} already has an outstanding asynchronous operation")]
    OperationAlreadyPending(u64),

    /// Access mode forbids the requested intent
    #[error("Location '{name}' does not permit {intent}")]
    AccessDenied {
        /// Reference name
        name: String,
        /// "read" or "write"
        intent: &'static str,
    },

    /// Value does not fit the location kind
    #[error("Location '{name}' holds {expected} values, got {found}")]
    KindMismatch {
        /// Location name
        name: String,
        /// Declared kind
        expected: String,
        /// Kind of the rejected value
        found: String,
    },

    /// Reference not associated with a cached tree
    #[error("Location reference '{0}' is not part of a cached activity tree")]
    NotInTree(String),

    /// Reference is not reachable from the executing activity
    #[error("Location reference '{0}' is not visible from this activity")]
    NotVisible(String),

    /// No location with this name is visible
    #[error("No location named '{0}' is visible")]
    UnknownLocation(String),

    /// Index does not name a child of the executing activity
    #[error("Activity has no child at index {0}")]
    UnknownChild(usize),

    /// Index does not name a delegate with a handler
    #[error("Activity has no delegate handler at index {0}")]
    UnknownDelegate(usize),

    /// Target is not a child instance of the caller
    #[error("Instance {0} is not a child of the executing activity")]
    NotChildInstance(u64),

    /// Instance id no longer tracked
    #[error("Activity instance {0} not found")]
    InstanceNotFound(u64),

    /// Root input has no matching argument
    #[error("Root activity has no input argument named '{0}'")]
    UnknownInput(String),

    /// Exit without a matching enter
    #[error("No-persist handle '{0}' was not entered")]
    NoPersistNotEntered(String),

    /// Named bookmarks need a name
    #[error("Bookmark names must not be empty")]
    EmptyBookmarkName,

    /// Root is already scheduled
    #[error("The root activity has already been scheduled")]
    RootAlreadyScheduled,

    /// Executor no longer accepts work
    #[error("The workflow instance is no longer executing")]
    NotExecuting,

    /// Bookmark table rejected the request
    #[error(transparent)]
    Bookmark(#[from] BookmarkError),
}

/// Convenience result alias for context operations
pub type UsageResult<T> = std::result::Result<T, UsageError>;

/// Bookmark table and scope errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookmarkError {
    /// Name already registered in this scope
    #[error("Bookmark '{0}' already exists in this scope")]
    DuplicateName(String),

    /// Scope is not registered
    #[error("Bookmark scope {0} is not registered")]
    ScopeNotFound(String),

    /// Scope already has a durable id
    #[error("Bookmark scope {0} is already initialized")]
    ScopeAlreadyInitialized(String),

    /// Durable id already belongs to another scope
    #[error("Bookmark scope id {0} is already in use")]
    ScopeIdInUse(Uuid),

    /// Caller does not own the bookmark
    #[error("Bookmark '{0}' is owned by another activity instance")]
    NotOwner(String),
}

/// Convenience result alias for bookmark operations
pub type BookmarkResult<T> = std::result::Result<T, BookmarkError>;

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// No persisted instance with this id
    #[error("Instance {0} not found in the store")]
    NotFound(Uuid),

    /// Snapshot was taken against a different tree
    #[error("Snapshot fingerprint {found} does not match activity tree {expected}")]
    DefinitionMismatch {
        /// Fingerprint of the tree being restored into
        expected: String,
        /// Fingerprint recorded in the snapshot
        found: String,
    },

    /// Executor cannot be persisted right now
    #[error("Workflow instance is not persistable: {0}")]
    NotPersistable(String),

    /// Invalid snapshot format
    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    /// Underlying storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for snapshot operations
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Config file error
    #[error("Config file error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
