//! Location references, locations and per-instance environments
//!
//! A `LocationReference` names a typed slot declared by some activity in the
//! cached tree. Each instantiation of that activity gets its own `Location`
//! for the slot, so the same reference resolves to different cells in
//! different instances (recursion, loops, parallel branches).

use serde::{Deserialize, Serialize};

use super::context::ActivityContext;
use super::error::{UsageError, UsageResult};
use super::handle::HandleSlot;
use super::instance::InstanceId;
use super::tree::ActivityId;
use super::value::{Value, ValueKind};

/// Direction a reference may be used in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationAccess {
    /// Reads and writes
    ReadWrite,
    /// Reads only
    ReadOnly,
    /// Writes only
    WriteOnly,
}

impl LocationAccess {
    /// Whether reads are permitted
    pub fn can_read(&self) -> bool {
        !matches!(self, LocationAccess::WriteOnly)
    }

    /// Whether writes are permitted
    pub fn can_write(&self) -> bool {
        !matches!(self, LocationAccess::ReadOnly)
    }
}

/// Named, typed binding slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationReference {
    name: String,
    kind: ValueKind,
    id: usize,
    owner: Option<ActivityId>,
    access: LocationAccess,
}

impl LocationReference {
    /// Reference that is not yet bound into a tree
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            id: 0,
            owner: None,
            access: LocationAccess::ReadWrite,
        }
    }

    pub(crate) fn bound(
        name: impl Into<String>,
        kind: ValueKind,
        owner: ActivityId,
        id: usize,
        access: LocationAccess,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            id,
            owner: Some(owner),
            access,
        }
    }

    /// Declared name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared kind
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Slot index within the owner's environment
    pub fn id(&self) -> usize {
        self.id
    }

    /// Declaring activity, if bound into a tree
    pub fn owner(&self) -> Option<ActivityId> {
        self.owner
    }

    /// Permitted access
    pub fn access(&self) -> LocationAccess {
        self.access
    }

    /// Same slot, reads only
    pub fn read_only(&self) -> Self {
        Self {
            access: LocationAccess::ReadOnly,
            ..self.clone()
        }
    }

    /// Same slot, writes only
    pub fn write_only(&self) -> Self {
        Self {
            access: LocationAccess::WriteOnly,
            ..self.clone()
        }
    }

    pub(crate) fn throw_if_not_in_tree(&self) -> UsageResult<ActivityId> {
        self.owner
            .ok_or_else(|| UsageError::NotInTree(self.name.clone()))
    }

    fn require(&self, allowed: bool, intent: &'static str) -> UsageResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(UsageError::AccessDenied {
                name: self.name.clone(),
                intent,
            })
        }
    }

    /// Resolve to the location for full access
    pub fn get_location<'c>(&self, ctx: &'c ActivityContext<'_>) -> UsageResult<&'c Location> {
        self.throw_if_not_in_tree()?;
        self.require(self.access == LocationAccess::ReadWrite, "read-write access")?;
        ctx.location(self)
    }

    /// Resolve to the location with read intent
    pub fn get_location_for_read<'c>(
        &self,
        ctx: &'c ActivityContext<'_>,
    ) -> UsageResult<&'c Location> {
        self.throw_if_not_in_tree()?;
        self.require(self.access.can_read(), "read")?;
        ctx.location(self)
    }

    /// Resolve to the location with write intent
    pub fn get_location_for_write<'c>(
        &self,
        ctx: &'c mut ActivityContext<'_>,
    ) -> UsageResult<&'c mut Location> {
        self.throw_if_not_in_tree()?;
        self.require(self.access.can_write(), "write")?;
        ctx.location_mut(self)
    }
}

/// Mutable storage cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    name: String,
    kind: ValueKind,
    value: Value,
}

impl Location {
    /// Cell holding `value`
    pub fn new(name: impl Into<String>, kind: ValueKind, value: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
        }
    }

    /// Name of the declaring reference
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared kind
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Current value
    pub fn get(&self) -> &Value {
        &self.value
    }

    /// Replace the value after checking it against the declared kind
    pub fn set(&mut self, value: Value) -> UsageResult<()> {
        if !self.kind.accepts(&value) {
            return Err(UsageError::KindMismatch {
                name: self.name.clone(),
                expected: self.kind.to_string(),
                found: ValueKind::of(&value).to_string(),
            });
        }
        self.value = value;
        Ok(())
    }

    /// Move the value out, leaving null
    pub fn take(&mut self) -> Value {
        std::mem::take(&mut self.value)
    }
}

/// Creates fresh locations for one declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFactory {
    name: String,
    kind: ValueKind,
    default: Option<Value>,
}

impl LocationFactory {
    /// Factory for `kind` locations, initialized to `default` or the kind default
    pub fn new(name: impl Into<String>, kind: ValueKind, default: Option<Value>) -> Self {
        Self {
            name: name.into(),
            kind,
            default,
        }
    }

    /// New location with the initial value
    pub fn create_location(&self) -> Location {
        let value = self
            .default
            .clone()
            .unwrap_or_else(|| self.kind.default_value());
        Location::new(self.name.clone(), self.kind, value)
    }
}

/// One declared slot of an instance environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    /// Storage owned by this instance
    Value(Location),
    /// Alias of a slot owned by an enclosing instance
    Reference {
        /// Instance that owns the target location
        instance: InstanceId,
        /// Slot index in that instance's environment
        slot: usize,
    },
}

/// Runtime locations and handles bound for one activity instance
#[derive(Debug, Default)]
pub struct LocationEnvironment {
    pub(crate) slots: Vec<Slot>,
    pub(crate) handles: Vec<HandleSlot>,
}

impl LocationEnvironment {
    /// Environment over the given slots and handles
    pub fn new(slots: Vec<Slot>, handles: Vec<HandleSlot>) -> Self {
        Self { slots, handles }
    }

    /// Slot at `index`
    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Handle with the given declared name
    pub fn handle(&self, name: &str) -> Option<&HandleSlot> {
        self.handles.iter().find(|h| h.name() == name)
    }

    pub(crate) fn handle_mut(&mut self, name: &str) -> Option<&mut HandleSlot> {
        self.handles.iter_mut().find(|h| h.name() == name)
    }

    /// Declared handles
    pub fn handles(&self) -> &[HandleSlot] {
        &self.handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_access_wrappers() {
        let reference = LocationReference::bound("x", ValueKind::Number, ActivityId(0), 0, LocationAccess::ReadWrite);
        assert!(reference.read_only().access().can_read());
        assert!(!reference.read_only().access().can_write());
        assert!(!reference.write_only().access().can_read());
        assert_eq!(reference.write_only().id(), reference.id());
    }

    #[test]
    fn test_unbound_reference_is_not_in_tree() {
        let reference = LocationReference::new("orphan", ValueKind::Any);
        assert!(matches!(
            reference.throw_if_not_in_tree(),
            Err(UsageError::NotInTree(name)) if name == "orphan"
        ));
    }

    #[test]
    fn test_location_set_is_type_checked() {
        let factory = LocationFactory::new("count", ValueKind::Number, Some(json!(5)));
        let mut location = factory.create_location();
        assert_eq!(location.get(), &json!(5));
        location.set(json!(7)).unwrap();
        assert!(matches!(location.set(json!("seven")), Err(UsageError::KindMismatch { .. })));
        assert_eq!(location.take(), json!(7));
        assert!(location.get().is_null());
    }

    #[test]
    fn test_factory_uses_kind_default() {
        let factory = LocationFactory::new("items", ValueKind::Array, None);
        assert_eq!(factory.create_location().get(), &json!([]));
    }
}
