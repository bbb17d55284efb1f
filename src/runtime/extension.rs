//! Typed extension lookup
//!
//! Hosts register shared services (log sinks, transaction coordinators,
//! anything an activity needs from outside the workflow) before an executor
//! starts. Lookups are keyed by type and return `None` for absent services.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of host-provided services
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    parent: Option<Arc<ExtensionRegistry>>,
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("entries", &self.entries.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

impl ExtensionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that falls back to `parent` for missing entries
    pub fn with_parent(parent: Arc<ExtensionRegistry>) -> Self {
        Self {
            entries: HashMap::new(),
            parent: Some(parent),
        }
    }

    /// Register a service, replacing any earlier one of the same type
    pub fn add<T>(&mut self, extension: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.entries
            .insert(TypeId::of::<Arc<T>>(), Arc::new(extension) as Arc<dyn Any + Send + Sync>);
    }

    /// Builder form of `add`
    pub fn with<T>(mut self, extension: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.add(extension);
        self
    }

    /// Service of type `T`, searching parents when absent locally
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        match self.entries.get(&TypeId::of::<Arc<T>>()) {
            Some(entry) => entry.downcast_ref::<Arc<T>>().cloned(),
            None => self.parent.as_ref().and_then(|parent| parent.get::<T>()),
        }
    }

    /// Whether a service of type `T` is registered
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get::<T>().is_some()
    }
}
