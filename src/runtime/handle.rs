//! Handles: runtime slots for cross-cutting per-scope state
//!
//! An activity declares handles by name and type tag. The tag is resolved
//! to a factory from the `HandleFactoryRegistry` when the tree is cached, and
//! the runtime creates, initializes and uninitializes one handle per
//! instance. Handles are exclusively owned by the instance that declared them.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::bookmark::{BookmarkRecord, BookmarkScope, BookmarkScopeManager};
use super::error::{UsageError, UsageResult};
use super::instance::InstanceId;
use super::transaction::Transaction;
use super::value::Value;

/// Per-instance runtime slot
pub trait Handle: fmt::Debug + Send {
    /// Type tag the handle was registered under
    fn type_tag(&self) -> &'static str;

    /// Called when the owning instance starts
    fn on_initialize(&mut self, _ctx: &mut HandleInitializationContext<'_>) -> UsageResult<()> {
        Ok(())
    }

    /// Called when the owning instance completes or is aborted
    fn on_uninitialize(&mut self, _ctx: &mut HandleInitializationContext<'_>) {}

    /// Durable state
    fn snapshot(&self) -> Value {
        Value::Null
    }

    /// Reload durable state
    fn restore(&mut self, _state: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Upcast for typed access
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed access
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Factory creating a fresh, uninitialized handle
pub type HandleFactory = Arc<dyn Fn() -> Box<dyn Handle> + Send + Sync>;

/// Handle bound into an instance environment
#[derive(Debug)]
pub struct HandleSlot {
    name: String,
    owner: InstanceId,
    initialized: bool,
    handle: Box<dyn Handle>,
}

impl HandleSlot {
    pub(crate) fn new(name: impl Into<String>, owner: InstanceId, handle: Box<dyn Handle>) -> Self {
        Self {
            name: name.into(),
            owner,
            initialized: false,
            handle,
        }
    }

    /// Declared name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning instance
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Whether the runtime initialized the handle
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Type tag of the wrapped handle
    pub fn type_tag(&self) -> &'static str {
        self.handle.type_tag()
    }

    /// Fail unless the handle was initialized
    pub fn throw_if_uninitialized(&self) -> UsageResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(UsageError::HandleNotInitialized(self.name.clone()))
        }
    }

    pub(crate) fn initialize(&mut self, ctx: &mut HandleInitializationContext<'_>) -> UsageResult<()> {
        if self.initialized {
            return Err(UsageError::HandleAlreadyInitialized(self.name.clone()));
        }
        self.handle.on_initialize(ctx)?;
        self.initialized = true;
        Ok(())
    }

    pub(crate) fn uninitialize(&mut self, ctx: &mut HandleInitializationContext<'_>) {
        if self.initialized {
            self.handle.on_uninitialize(ctx);
            self.initialized = false;
        }
    }

    pub(crate) fn mark_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
    }

    /// Wrapped handle
    pub fn handle(&self) -> &dyn Handle {
        self.handle.as_ref()
    }

    pub(crate) fn handle_mut(&mut self) -> &mut dyn Handle {
        self.handle.as_mut()
    }

    /// Typed, initialized access
    pub fn downcast<T: Handle + 'static>(&self, expected: &'static str) -> UsageResult<&T> {
        self.throw_if_uninitialized()?;
        self.handle
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| UsageError::HandleTypeMismatch {
                name: self.name.clone(),
                expected,
                found: self.handle.type_tag().to_string(),
            })
    }

    /// Typed, initialized mutable access
    pub fn downcast_mut<T: Handle + 'static>(&mut self, expected: &'static str) -> UsageResult<&mut T> {
        self.throw_if_uninitialized()?;
        let found = self.handle.type_tag().to_string();
        let name = self.name.clone();
        self.handle
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(UsageError::HandleTypeMismatch { name, expected, found })
    }
}

/// Factory functions keyed by handle type tag
#[derive(Clone, Default)]
pub struct HandleFactoryRegistry {
    factories: HashMap<String, HandleFactory>,
}

impl fmt::Debug for HandleFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("HandleFactoryRegistry").field("tags", &tags).finish()
    }
}

impl HandleFactoryRegistry {
    /// Registry without any handle types
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the runtime's built-in handles
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_default::<NoPersistHandle>(NoPersistHandle::TAG);
        registry.register_default::<BookmarkScopeHandle>(BookmarkScopeHandle::TAG);
        registry.register_default::<RuntimeTransactionHandle>(RuntimeTransactionHandle::TAG);
        registry
    }

    /// Register a factory for `tag`
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Handle> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Arc::new(factory));
    }

    /// Register a handle type that implements `Default`
    pub fn register_default<T>(&mut self, tag: impl Into<String>)
    where
        T: Handle + Default + 'static,
    {
        self.register(tag, || Box::new(T::default()));
    }

    /// Factory registered for `tag`
    pub fn resolve(&self, tag: &str) -> Option<HandleFactory> {
        self.factories.get(tag).cloned()
    }

    /// Whether `tag` is registered
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }
}

/// What a handle may touch while it is being initialized or torn down
pub struct HandleInitializationContext<'a> {
    owner: InstanceId,
    scopes: &'a mut BookmarkScopeManager,
    auto_disassociate: bool,
    unregistered: Vec<(BookmarkScope, Vec<BookmarkRecord>)>,
    released_no_persist: u32,
    disposed: bool,
}

impl<'a> HandleInitializationContext<'a> {
    pub(crate) fn new(
        owner: InstanceId,
        scopes: &'a mut BookmarkScopeManager,
        auto_disassociate: bool,
    ) -> Self {
        Self {
            owner,
            scopes,
            auto_disassociate,
            unregistered: Vec::new(),
            released_no_persist: 0,
            disposed: false,
        }
    }

    fn throw_if_disposed(&self) -> UsageResult<()> {
        if self.disposed {
            Err(UsageError::ContextDisposed)
        } else {
            Ok(())
        }
    }

    /// Instance that owns the handle
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Bookmark scope registry
    pub fn bookmark_scopes(&mut self) -> UsageResult<&mut BookmarkScopeManager> {
        self.throw_if_disposed()?;
        Ok(&mut *self.scopes)
    }

    /// Count one more handle referencing `scope`
    pub fn attach_scope(&mut self, scope: BookmarkScope) -> UsageResult<u32> {
        self.throw_if_disposed()?;
        Ok(self.scopes.increment_handle_reference_count(scope)?)
    }

    /// Drop one handle reference to `scope`, unregistering it at zero when
    /// auto-disassociation is enabled
    pub fn release_scope(&mut self, scope: BookmarkScope) -> UsageResult<u32> {
        self.throw_if_disposed()?;
        let remaining = self.scopes.decrement_handle_reference_count(scope)?;
        if remaining == 0 && self.auto_disassociate {
            let canonical = self.scopes.canonical(scope);
            let orphaned = self.scopes.unregister_scope(scope)?;
            self.unregistered.push((canonical, orphaned));
        }
        Ok(remaining)
    }

    /// Report no-persist entries released by the handle
    pub fn release_no_persist(&mut self, count: u32) {
        self.released_no_persist += count;
    }

    pub(crate) fn dispose(mut self) -> (Vec<(BookmarkScope, Vec<BookmarkRecord>)>, u32) {
        self.disposed = true;
        (std::mem::take(&mut self.unregistered), self.released_no_persist)
    }
}

/// Guards a region in which the workflow must not be persisted
#[derive(Debug, Default)]
pub struct NoPersistHandle {
    entered: u32,
}

impl NoPersistHandle {
    /// Registered type tag
    pub const TAG: &'static str = "no-persist";

    /// Nesting depth of open enters
    pub fn entered(&self) -> u32 {
        self.entered
    }

    pub(crate) fn enter(&mut self) {
        self.entered += 1;
    }

    pub(crate) fn exit(&mut self) -> bool {
        if self.entered == 0 {
            return false;
        }
        self.entered -= 1;
        true
    }
}

impl Handle for NoPersistHandle {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn on_uninitialize(&mut self, ctx: &mut HandleInitializationContext<'_>) {
        ctx.release_no_persist(self.entered);
        self.entered = 0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// References a shared bookmark scope
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BookmarkScopeHandle {
    scope: Option<BookmarkScope>,
}

impl BookmarkScopeHandle {
    /// Registered type tag
    pub const TAG: &'static str = "bookmark-scope";

    /// Referenced scope, if attached
    pub fn scope(&self) -> Option<BookmarkScope> {
        self.scope
    }

    /// Point the handle at `scope`, releasing any previous scope
    pub fn attach(
        &mut self,
        scope: BookmarkScope,
        ctx: &mut HandleInitializationContext<'_>,
    ) -> UsageResult<()> {
        if let Some(previous) = self.scope.take() {
            ctx.release_scope(previous)?;
        }
        ctx.attach_scope(scope)?;
        self.scope = Some(scope);
        Ok(())
    }

    pub(crate) fn set_scope(&mut self, scope: BookmarkScope) {
        self.scope = Some(scope);
    }
}

impl Handle for BookmarkScopeHandle {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn on_uninitialize(&mut self, ctx: &mut HandleInitializationContext<'_>) {
        if let Some(scope) = self.scope.take() {
            if let Err(error) = ctx.release_scope(scope) {
                tracing::warn!(%scope, %error, "failed to release bookmark scope");
            }
        }
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(self.scope).unwrap_or(Value::Null)
    }

    fn restore(&mut self, state: &Value) -> anyhow::Result<()> {
        self.scope = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Holds the transaction bound by a transaction scope
#[derive(Debug, Default)]
pub struct RuntimeTransactionHandle {
    transaction: Option<Transaction>,
}

impl RuntimeTransactionHandle {
    /// Registered type tag
    pub const TAG: &'static str = "runtime-transaction";

    /// Bound transaction
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub(crate) fn bind(&mut self, transaction: Transaction) -> UsageResult<()> {
        if self.transaction.is_some() {
            return Err(UsageError::TransactionAlreadySet);
        }
        self.transaction = Some(transaction);
        Ok(())
    }

    pub(crate) fn clear(&mut self) -> Option<Transaction> {
        self.transaction.take()
    }
}

impl Handle for RuntimeTransactionHandle {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn on_uninitialize(&mut self, _ctx: &mut HandleInitializationContext<'_>) {
        self.transaction = None;
    }

    fn snapshot(&self) -> Value {
        serde_json::to_value(&self.transaction).unwrap_or(Value::Null)
    }

    fn restore(&mut self, state: &Value) -> anyhow::Result<()> {
        self.transaction = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
