//! Lexically scoped symbol tables
//!
//! `LocationReferenceEnvironment` is a linked chain of scopes built once while
//! caching a tree. Lookups search the local scope first and then defer to the
//! parent. Each scope also carries the set of activities whose declarations
//! are reachable from it, so visibility checks never walk the tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::error::ValidationError;
use super::location::LocationReference;
use super::tree::ActivityId;

/// One lexical scope and its ancestors
#[derive(Debug)]
pub struct LocationReferenceEnvironment {
    owner: Option<ActivityId>,
    parent: Option<Arc<LocationReferenceEnvironment>>,
    references: Vec<LocationReference>,
    by_name: HashMap<String, usize>,
    visible_owners: HashSet<ActivityId>,
}

impl LocationReferenceEnvironment {
    /// Outermost, empty scope
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            owner: None,
            parent: None,
            references: Vec::new(),
            by_name: HashMap::new(),
            visible_owners: HashSet::new(),
        })
    }

    /// Scope declared by `owner` nested inside `parent`.
    ///
    /// Names must be unique within the new scope; shadowing an outer name is
    /// allowed.
    pub fn child(
        parent: &Arc<Self>,
        owner: ActivityId,
        owner_name: &str,
        references: Vec<LocationReference>,
    ) -> Result<Arc<Self>, ValidationError> {
        let mut by_name = HashMap::with_capacity(references.len());
        for (index, reference) in references.iter().enumerate() {
            if by_name.insert(reference.name().to_string(), index).is_some() {
                return Err(ValidationError::DuplicateName {
                    name: reference.name().to_string(),
                    activity: owner_name.to_string(),
                });
            }
        }

        let mut visible_owners = parent.visible_owners.clone();
        visible_owners.insert(owner);

        Ok(Arc::new(Self {
            owner: Some(owner),
            parent: Some(Arc::clone(parent)),
            references,
            by_name,
            visible_owners,
        }))
    }

    /// Find `name` locally, else in the enclosing scopes
    pub fn try_get_location_reference(&self, name: &str) -> Option<&LocationReference> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(&index) = current.by_name.get(name) {
                return current.references.get(index);
            }
            scope = current.parent.as_deref();
        }
        None
    }

    /// Whether `reference` was declared in this scope or one of its ancestors
    pub fn is_visible(&self, reference: &LocationReference) -> bool {
        match reference.owner() {
            Some(owner) => self.visible_owners.contains(&owner),
            None => false,
        }
    }

    /// Enclosing scope
    pub fn parent(&self) -> Option<&Arc<LocationReferenceEnvironment>> {
        self.parent.as_ref()
    }

    /// Activity that declared this scope
    pub fn owner(&self) -> Option<ActivityId> {
        self.owner
    }

    /// References declared directly in this scope
    pub fn local_references(&self) -> &[LocationReference] {
        &self.references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::location::LocationAccess;
    use crate::runtime::value::ValueKind;

    fn var(name: &str, owner: usize, slot: usize) -> LocationReference {
        LocationReference::bound(name, ValueKind::Any, ActivityId(owner), slot, LocationAccess::ReadWrite)
    }

    #[test]
    fn test_lookup_falls_through_to_parent() {
        let root = LocationReferenceEnvironment::root();
        let outer = LocationReferenceEnvironment::child(&root, ActivityId(0), "outer", vec![var("a", 0, 0)]).unwrap();
        let inner = LocationReferenceEnvironment::child(&outer, ActivityId(1), "inner", vec![var("b", 1, 0)]).unwrap();

        assert_eq!(inner.try_get_location_reference("b").unwrap().owner(), Some(ActivityId(1)));
        assert_eq!(inner.try_get_location_reference("a").unwrap().owner(), Some(ActivityId(0)));
        assert!(outer.try_get_location_reference("b").is_none());
        assert!(inner.try_get_location_reference("missing").is_none());
    }

    #[test]
    fn test_inner_declaration_shadows_outer() {
        let root = LocationReferenceEnvironment::root();
        let outer = LocationReferenceEnvironment::child(&root, ActivityId(0), "outer", vec![var("x", 0, 0)]).unwrap();
        let inner = LocationReferenceEnvironment::child(&outer, ActivityId(1), "inner", vec![var("x", 1, 3)]).unwrap();
        assert_eq!(inner.try_get_location_reference("x").unwrap().id(), 3);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let root = LocationReferenceEnvironment::root();
        let err = LocationReferenceEnvironment::child(&root, ActivityId(0), "dup", vec![var("x", 0, 0), var("x", 0, 1)])
            .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateName { name, .. } if name == "x"));
    }

    #[test]
    fn test_sibling_scope_cannot_see_declaration() {
        // root -> a -> b -> c declares X; sibling of b under a
        let root = LocationReferenceEnvironment::root();
        let a = LocationReferenceEnvironment::child(&root, ActivityId(0), "a", vec![]).unwrap();
        let b = LocationReferenceEnvironment::child(&a, ActivityId(1), "b", vec![]).unwrap();
        let c = LocationReferenceEnvironment::child(&b, ActivityId(2), "c", vec![var("X", 2, 0)]).unwrap();
        let below_c = LocationReferenceEnvironment::child(&c, ActivityId(3), "d", vec![]).unwrap();
        let sibling = LocationReferenceEnvironment::child(&a, ActivityId(4), "sibling", vec![]).unwrap();

        let x = c.try_get_location_reference("X").cloned().unwrap();
        assert!(below_c.try_get_location_reference("X").is_some());
        assert!(sibling.try_get_location_reference("X").is_none());

        assert!(c.is_visible(&x));
        assert!(below_c.is_visible(&x));
        assert!(!sibling.is_visible(&x));
        assert!(!b.is_visible(&x));
    }
}
