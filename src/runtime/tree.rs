//! Metadata caching
//!
//! `ActivityTree::cache` walks a definition once, assigning every node its
//! `(IdSpace, id)` position, building the lexical environment chain,
//! resolving argument bindings and handle factories, and collecting every
//! validation problem into one aggregate error.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use uuid::Uuid;

use super::activity::{Activity, ArgumentDirection, Binding, DelegateArgument};
use super::environment::LocationReferenceEnvironment;
use super::error::{ValidationError, ValidationErrors};
use super::handle::{HandleFactory, HandleFactoryRegistry};
use super::id_space::IdSpace;
use super::location::{LocationAccess, LocationReference};
use super::value::Value;

/// Arena index of a cached node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub(crate) usize);

impl ActivityId {
    /// Arena index
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Chain of id-space ids leading to a node, written `1.2.1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct QualifiedId(Vec<u32>);

impl QualifiedId {
    fn extend(&self, id: u32) -> Self {
        let mut parts = self.0.clone();
        parts.push(id);
        QualifiedId(parts)
    }

    /// Component ids, outermost first
    pub fn parts(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

impl FromStr for QualifiedId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split('.')
            .map(|part| part.parse::<u32>().map_err(|e| format!("invalid qualified id '{}': {}", s, e)))
            .collect::<Result<Vec<_>, _>>()
            .map(QualifiedId)
    }
}

impl From<QualifiedId> for String {
    fn from(id: QualifiedId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for QualifiedId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How a local slot gets its initial value
#[derive(Debug, Clone)]
pub(crate) enum LocalInit {
    /// Fresh value
    Value(Value),
    /// Copy of an outer location taken when the instance starts
    CopyFrom(LocationReference),
    /// Alias of an outer location
    Alias(LocationReference),
    /// Supplied by whoever schedules the delegate
    DelegateArgument,
}

/// One slot of a node's runtime environment
#[derive(Debug, Clone)]
pub(crate) struct LocalDecl {
    pub(crate) reference: LocationReference,
    pub(crate) init: LocalInit,
    /// Root inputs may overwrite it
    pub(crate) input: bool,
    /// Reported as an output when the instance completes
    pub(crate) output: bool,
}

/// Handle declaration with its factory
#[derive(Clone)]
pub(crate) struct ResolvedHandle {
    pub(crate) name: String,
    pub(crate) tag: String,
    pub(crate) factory: HandleFactory,
}

impl fmt::Debug for ResolvedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHandle")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .finish()
    }
}

/// Cached metadata for one definition node
#[derive(Debug)]
pub struct TreeNode {
    pub(crate) activity: Arc<Activity>,
    pub(crate) qualified_id: QualifiedId,
    pub(crate) parent: Option<ActivityId>,
    pub(crate) children: Vec<ActivityId>,
    pub(crate) delegate_handlers: Vec<Option<ActivityId>>,
    pub(crate) environment: Arc<LocationReferenceEnvironment>,
    pub(crate) private: HashMap<String, LocationReference>,
    pub(crate) locals: Vec<LocalDecl>,
    pub(crate) handles: Vec<ResolvedHandle>,
    pub(crate) id_space: usize,
}

impl TreeNode {
    /// Definition
    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    /// Display name
    pub fn name(&self) -> &str {
        self.activity.name()
    }

    /// Position in the id-space tree
    pub fn qualified_id(&self) -> &QualifiedId {
        &self.qualified_id
    }

    /// Declaring node
    pub fn parent(&self) -> Option<ActivityId> {
        self.parent
    }

    /// Public children in declaration order
    pub fn children(&self) -> &[ActivityId] {
        &self.children
    }

    /// Handler node of the delegate at `index`
    pub fn delegate_handler(&self, index: usize) -> Option<ActivityId> {
        self.delegate_handlers.get(index).copied().flatten()
    }

    /// Scope visible to this node's body and descendants
    pub fn environment(&self) -> &Arc<LocationReferenceEnvironment> {
        &self.environment
    }

    /// Index of the id space the node belongs to
    pub fn id_space(&self) -> usize {
        self.id_space
    }

    /// Whether the node declares any runtime slots or handles
    pub fn needs_environment(&self) -> bool {
        !self.locals.is_empty() || !self.handles.is_empty()
    }
}

/// A definition cached for execution
#[derive(Debug)]
pub struct ActivityTree {
    stamp: u64,
    nodes: Vec<TreeNode>,
    id_spaces: Vec<IdSpace<ActivityId>>,
    by_qualified_id: HashMap<QualifiedId, ActivityId>,
    fingerprint: String,
}

struct CacheBuilder<'r> {
    stamp: u64,
    registry: &'r HandleFactoryRegistry,
    nodes: Vec<TreeNode>,
    id_spaces: Vec<IdSpace<ActivityId>>,
    space_prefixes: Vec<QualifiedId>,
    stamped: Vec<Arc<Activity>>,
    errors: Vec<ValidationError>,
}

impl ActivityTree {
    /// Cache `root` and everything reachable from it.
    ///
    /// Fails with every validation error found. A definition may belong to
    /// only one live tree; dropping the tree releases it.
    pub fn cache(
        root: Arc<Activity>,
        registry: &HandleFactoryRegistry,
    ) -> Result<Arc<ActivityTree>, ValidationErrors> {
        let stamp = (Uuid::new_v4().as_u128() as u64) | 1;
        let mut builder = CacheBuilder {
            stamp,
            registry,
            nodes: Vec::new(),
            id_spaces: vec![IdSpace::new(None, 0)],
            space_prefixes: vec![QualifiedId(Vec::new())],
            stamped: Vec::new(),
            errors: Vec::new(),
        };

        let root_environment = LocationReferenceEnvironment::root();
        builder.visit(&root, None, &root_environment, 0, None);

        if !builder.errors.is_empty() {
            for activity in &builder.stamped {
                let _ = activity
                    .cache_stamp
                    .compare_exchange(stamp, 0, Ordering::AcqRel, Ordering::Acquire);
            }
            return Err(ValidationErrors(builder.errors));
        }

        let by_qualified_id = builder
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.qualified_id.clone(), ActivityId(index)))
            .collect();
        let fingerprint = fingerprint(&builder.nodes);
        tracing::debug!(nodes = builder.nodes.len(), %fingerprint, "cached activity tree");

        Ok(Arc::new(ActivityTree {
            stamp,
            nodes: builder.nodes,
            id_spaces: builder.id_spaces,
            by_qualified_id,
            fingerprint,
        }))
    }

    /// Root node
    pub fn root(&self) -> ActivityId {
        ActivityId(0)
    }

    /// Node by id
    pub fn node(&self, id: ActivityId) -> &TreeNode {
        &self.nodes[id.0]
    }

    /// Node by id, if in range
    pub fn get(&self, id: ActivityId) -> Option<&TreeNode> {
        self.nodes.get(id.0)
    }

    /// Node by qualified id
    pub fn find(&self, id: &QualifiedId) -> Option<ActivityId> {
        self.by_qualified_id.get(id).copied()
    }

    /// Node whose display name is `name`, first in pre-order
    pub fn find_by_name(&self, name: &str) -> Option<ActivityId> {
        self.nodes
            .iter()
            .position(|node| node.name() == name)
            .map(ActivityId)
    }

    /// Resolve `name` the way the node's body sees it
    pub fn lookup(&self, id: ActivityId, name: &str) -> Option<&LocationReference> {
        let node = self.get(id)?;
        node.private
            .get(name)
            .or_else(|| node.environment.try_get_location_reference(name))
    }

    /// Id space by index
    pub fn id_space(&self, index: usize) -> Option<&IdSpace<ActivityId>> {
        self.id_spaces.get(index)
    }

    /// Number of cached nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Digest of the tree shape, recorded in snapshots
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Nodes in pre-order
    pub fn nodes(&self) -> impl Iterator<Item = (ActivityId, &TreeNode)> {
        self.nodes.iter().enumerate().map(|(i, node)| (ActivityId(i), node))
    }
}

impl Drop for ActivityTree {
    fn drop(&mut self) {
        for node in &self.nodes {
            let _ = node.activity.cache_stamp.compare_exchange(
                self.stamp,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        for space in &mut self.id_spaces {
            space.dispose();
        }
    }
}

impl CacheBuilder<'_> {
    fn visit(
        &mut self,
        activity: &Arc<Activity>,
        parent: Option<ActivityId>,
        parent_environment: &Arc<LocationReferenceEnvironment>,
        space: usize,
        delegate_arguments: Option<&[DelegateArgument]>,
    ) -> Option<ActivityId> {
        if activity
            .cache_stamp
            .compare_exchange(0, self.stamp, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.errors.push(ValidationError::ActivityReused {
                activity: activity.name().to_string(),
            });
            return None;
        }
        self.stamped.push(Arc::clone(activity));

        let id = ActivityId(self.nodes.len());
        let local_id = match self.id_spaces[space].add_member(id) {
            Ok(local_id) => local_id,
            Err(error) => {
                self.errors.push(error);
                0
            }
        };
        let qualified_id = self.space_prefixes[space].extend(local_id);

        let (locals, public, private) =
            self.declare_locals(activity, id, parent, parent_environment, delegate_arguments);

        let environment = match LocationReferenceEnvironment::child(
            parent_environment,
            id,
            activity.name(),
            public,
        ) {
            Ok(environment) => environment,
            Err(error) => {
                self.errors.push(error);
                Arc::clone(parent_environment)
            }
        };
        let handles = self.resolve_handles(activity);

        self.nodes.push(TreeNode {
            activity: Arc::clone(activity),
            qualified_id: qualified_id.clone(),
            parent,
            children: Vec::new(),
            delegate_handlers: Vec::new(),
            environment: Arc::clone(&environment),
            private,
            locals,
            handles,
            id_space: space,
        });

        for child in activity.public_children() {
            if let Some(child_id) = self.visit(child, Some(id), &environment, space, None) {
                self.nodes[id.0].children.push(child_id);
            }
        }

        for delegate in activity.delegates() {
            let mut seen = HashSet::new();
            for argument in &delegate.arguments {
                if !seen.insert(argument.name.as_str()) {
                    self.errors.push(ValidationError::DuplicateDelegateArgument {
                        activity: activity.name().to_string(),
                        delegate: delegate.name.clone(),
                        argument: argument.name.clone(),
                    });
                }
            }

            let handler_id = delegate.handler.as_ref().and_then(|handler| {
                let handler_space = self.id_spaces.len();
                self.id_spaces.push(IdSpace::new(Some(space), local_id));
                self.space_prefixes.push(qualified_id.clone());
                self.visit(handler, Some(id), &environment, handler_space, Some(&delegate.arguments))
            });
            self.nodes[id.0].delegate_handlers.push(handler_id);
        }

        Some(id)
    }

    fn declare_locals(
        &mut self,
        activity: &Activity,
        id: ActivityId,
        parent: Option<ActivityId>,
        parent_environment: &LocationReferenceEnvironment,
        delegate_arguments: Option<&[DelegateArgument]>,
    ) -> (Vec<LocalDecl>, Vec<LocationReference>, HashMap<String, LocationReference>) {
        let mut locals = Vec::new();
        let mut public = Vec::new();
        let mut private = HashMap::new();
        let name = activity.name();

        for argument in delegate_arguments.unwrap_or_default() {
            let access = match argument.direction {
                ArgumentDirection::Out => LocationAccess::WriteOnly,
                _ => LocationAccess::ReadWrite,
            };
            let reference = LocationReference::bound(&argument.name, argument.kind, id, locals.len(), access);
            public.push(reference.clone());
            locals.push(LocalDecl {
                reference,
                init: LocalInit::DelegateArgument,
                input: false,
                output: argument.direction != ArgumentDirection::In,
            });
        }

        for argument in activity.arguments() {
            let access = match argument.direction {
                ArgumentDirection::In => LocationAccess::ReadOnly,
                ArgumentDirection::Out => LocationAccess::WriteOnly,
                ArgumentDirection::InOut => LocationAccess::ReadWrite,
            };
            let reference = LocationReference::bound(&argument.name, argument.kind, id, locals.len(), access);
            let invalid = |detail: &str| ValidationError::InvalidBinding {
                activity: name.to_string(),
                argument: argument.name.clone(),
                target: match &argument.binding {
                    Binding::Variable(target) => target.clone(),
                    _ => String::from("<literal>"),
                },
                detail: detail.to_string(),
            };

            let (init, bound) = match &argument.binding {
                Binding::Literal(value) => {
                    if argument.direction != ArgumentDirection::In {
                        self.errors.push(invalid("outputs cannot bind to a literal"));
                    } else if !argument.kind.accepts(value) {
                        self.errors.push(ValidationError::LiteralMismatch {
                            activity: name.to_string(),
                            name: argument.name.clone(),
                            expected: argument.kind.to_string(),
                        });
                    }
                    (LocalInit::Value(value.clone()), true)
                }
                Binding::Variable(target) => match parent_environment.try_get_location_reference(target) {
                    None => {
                        self.errors.push(ValidationError::UnresolvedReference {
                            activity: name.to_string(),
                            argument: argument.name.clone(),
                            target: target.clone(),
                        });
                        (LocalInit::Value(argument.kind.default_value()), true)
                    }
                    Some(target_reference) => {
                        debug_assert!(parent_environment.is_visible(target_reference));
                        if !argument.kind.is_compatible_with(target_reference.kind()) {
                            self.errors.push(ValidationError::KindMismatch {
                                activity: name.to_string(),
                                argument: argument.name.clone(),
                                target: target.clone(),
                                expected: argument.kind.to_string(),
                                found: target_reference.kind().to_string(),
                            });
                        }
                        let access = target_reference.access();
                        let reads = argument.direction != ArgumentDirection::Out;
                        let writes = argument.direction != ArgumentDirection::In;
                        if reads && !access.can_read() {
                            self.errors.push(invalid("target is write-only"));
                        }
                        if writes && !access.can_write() {
                            self.errors.push(invalid("target is read-only"));
                        }
                        let init = if writes {
                            LocalInit::Alias(target_reference.clone())
                        } else {
                            LocalInit::CopyFrom(target_reference.clone())
                        };
                        (init, true)
                    }
                },
                Binding::Unbound => {
                    if argument.required && parent.is_some() {
                        self.errors.push(ValidationError::MissingRequiredArgument {
                            activity: name.to_string(),
                            argument: argument.name.clone(),
                        });
                    }
                    (LocalInit::Value(argument.kind.default_value()), false)
                }
            };

            public.push(reference.clone());
            locals.push(LocalDecl {
                reference,
                init,
                input: parent.is_none() && argument.direction != ArgumentDirection::Out,
                output: !bound && argument.direction != ArgumentDirection::In,
            });
        }

        for variable in activity.variables() {
            let access = if variable.read_only {
                LocationAccess::ReadOnly
            } else {
                LocationAccess::ReadWrite
            };
            let init = self.variable_init(name, &variable.name, variable.kind, variable.default.as_ref());
            let reference = LocationReference::bound(&variable.name, variable.kind, id, locals.len(), access);
            public.push(reference.clone());
            locals.push(LocalDecl {
                reference,
                init,
                input: false,
                output: false,
            });
        }

        for variable in &activity.implementation_variables {
            let init = self.variable_init(name, &variable.name, variable.kind, variable.default.as_ref());
            let reference =
                LocationReference::bound(&variable.name, variable.kind, id, locals.len(), LocationAccess::ReadWrite);
            let clashes = public.iter().any(|r| r.name() == variable.name);
            if clashes || private.insert(variable.name.clone(), reference.clone()).is_some() {
                self.errors.push(ValidationError::DuplicateName {
                    name: variable.name.clone(),
                    activity: name.to_string(),
                });
            }
            locals.push(LocalDecl {
                reference,
                init,
                input: false,
                output: false,
            });
        }

        (locals, public, private)
    }

    fn variable_init(
        &mut self,
        activity: &str,
        variable: &str,
        kind: super::value::ValueKind,
        default: Option<&Value>,
    ) -> LocalInit {
        match default {
            Some(value) => {
                if !kind.accepts(value) {
                    self.errors.push(ValidationError::LiteralMismatch {
                        activity: activity.to_string(),
                        name: variable.to_string(),
                        expected: kind.to_string(),
                    });
                }
                LocalInit::Value(value.clone())
            }
            None => LocalInit::Value(kind.default_value()),
        }
    }

    fn resolve_handles(&mut self, activity: &Activity) -> Vec<ResolvedHandle> {
        let mut names = HashSet::new();
        let mut handles = Vec::new();
        for decl in activity.handles() {
            if !names.insert(decl.name.as_str()) {
                self.errors.push(ValidationError::DuplicateName {
                    name: decl.name.clone(),
                    activity: activity.name().to_string(),
                });
                continue;
            }
            match self.registry.resolve(&decl.tag) {
                Some(factory) => handles.push(ResolvedHandle {
                    name: decl.name.clone(),
                    tag: decl.tag.clone(),
                    factory,
                }),
                None => self.errors.push(ValidationError::UnknownHandleType {
                    activity: activity.name().to_string(),
                    name: decl.name.clone(),
                    tag: decl.tag.clone(),
                }),
            }
        }
        handles
    }
}

fn fingerprint(nodes: &[TreeNode]) -> String {
    let mut hasher = blake3::Hasher::new();
    for node in nodes {
        hasher.update(node.qualified_id.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(node.name().as_bytes());
        hasher.update(b"|");
        hasher.update(node.activity.behavior().kind_name().as_bytes());
        for local in &node.locals {
            hasher.update(b"|");
            hasher.update(local.reference.name().as_bytes());
            hasher.update(b":");
            hasher.update(local.reference.kind().as_str().as_bytes());
        }
        for handle in &node.handles {
            hasher.update(b"|h:");
            hasher.update(handle.name.as_bytes());
            hasher.update(b"=");
            hasher.update(handle.tag.as_bytes());
        }
        hasher.update(format!("|c{}|d{};", node.children.len(), node.delegate_handlers.len()).as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::{ActivityDelegate, Argument, CodeActivity, Variable};
    use crate::runtime::context::ActivityContext;
    use crate::runtime::value::ValueKind;

    struct Noop;

    impl CodeActivity for Noop {
        fn execute(&self, _ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn noop(name: &str) -> Activity {
        Activity::code(name, Noop)
    }

    fn registry() -> HandleFactoryRegistry {
        HandleFactoryRegistry::with_builtins()
    }

    #[test]
    fn test_ids_follow_id_spaces() {
        let root = noop("root")
            .child(noop("a"))
            .child(noop("b"))
            .delegate(ActivityDelegate::new("body").handler(noop("handler").child(noop("inner"))))
            .build();
        let tree = ActivityTree::cache(root, &registry()).unwrap();

        let ids: Vec<String> = tree.nodes().map(|(_, n)| n.qualified_id().to_string()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "1.1", "1.2"]);
        assert_eq!(tree.find(&"1.2".parse().unwrap()).map(|id| tree.node(id).name()), Some("inner"));
        assert_eq!(tree.id_space(1).unwrap().parent_id(), 1);
    }

    #[test]
    fn test_reuse_rejected_until_tree_dropped() {
        let shared = noop("shared").build();
        let root = noop("root").child(Arc::clone(&shared)).child(Arc::clone(&shared)).build();
        let errors = ActivityTree::cache(root, &registry()).unwrap_err();
        assert!(errors.errors().iter().any(|e| matches!(e, ValidationError::ActivityReused { .. })));
        assert_eq!(shared.cache_stamp.load(Ordering::Acquire), 0);

        let solo = noop("solo").build();
        let tree = ActivityTree::cache(Arc::clone(&solo), &registry()).unwrap();
        assert!(ActivityTree::cache(Arc::clone(&solo), &registry()).is_err());
        drop(tree);
        assert!(ActivityTree::cache(solo, &registry()).is_ok());
    }

    #[test]
    fn test_errors_are_aggregated() {
        let root = noop("root")
            .variable(Variable::new("x", ValueKind::Number))
            .variable(Variable::new("x", ValueKind::String))
            .handle("h", "mystery")
            .child(noop("c").argument(Argument::input("v", ValueKind::Number).bind("missing")))
            .child(noop("d").argument(Argument::input("v", ValueKind::Number).literal("nope")))
            .delegate(
                ActivityDelegate::new("cb")
                    .argument(DelegateArgument::input("p", ValueKind::Any))
                    .argument(DelegateArgument::input("p", ValueKind::Any)),
            )
            .build();

        let errors = ActivityTree::cache(root, &registry()).unwrap_err();
        let kinds: Vec<&ValidationError> = errors.errors().iter().collect();
        assert!(kinds.iter().any(|e| matches!(e, ValidationError::DuplicateName { .. })));
        assert!(kinds.iter().any(|e| matches!(e, ValidationError::UnknownHandleType { .. })));
        assert!(kinds.iter().any(|e| matches!(e, ValidationError::UnresolvedReference { .. })));
        assert!(kinds.iter().any(|e| matches!(e, ValidationError::LiteralMismatch { .. })));
        assert!(kinds.iter().any(|e| matches!(e, ValidationError::DuplicateDelegateArgument { .. })));
        assert!(errors.to_string().starts_with(&format!("{} validation error(s)", errors.len())));
    }

    #[test]
    fn test_binding_direction_checks() {
        let root = noop("root")
            .variable(Variable::new("frozen", ValueKind::Number).read_only())
            .variable(Variable::new("open", ValueKind::String))
            .child(noop("writer").argument(Argument::output("out", ValueKind::Number).bind("frozen")))
            .child(noop("typed").argument(Argument::input("num", ValueKind::Number).bind("open")))
            .build();

        let errors = ActivityTree::cache(root, &registry()).unwrap_err();
        assert!(errors.errors().iter().any(|e| matches!(e, ValidationError::InvalidBinding { detail, .. } if detail.contains("read-only"))));
        assert!(errors.errors().iter().any(|e| matches!(e, ValidationError::KindMismatch { .. })));
    }

    #[test]
    fn test_nested_scopes_and_siblings() {
        let root = noop("outer")
            .child(
                noop("middle").child(
                    noop("inner")
                        .variable(Variable::new("X", ValueKind::Number))
                        .child(noop("leaf")),
                ),
            )
            .child(noop("sibling"))
            .build();
        let tree = ActivityTree::cache(root, &registry()).unwrap();

        let inner = tree.find_by_name("inner").unwrap();
        let leaf = tree.find_by_name("leaf").unwrap();
        let sibling = tree.find_by_name("sibling").unwrap();

        let x = tree.lookup(inner, "X").cloned().unwrap();
        assert!(tree.lookup(leaf, "X").is_some());
        assert!(tree.lookup(sibling, "X").is_none());
        assert!(tree.node(leaf).environment().is_visible(&x));
        assert!(!tree.node(sibling).environment().is_visible(&x));
    }

    #[test]
    fn test_fingerprint_tracks_shape() {
        let a = ActivityTree::cache(noop("root").child(noop("x")).build(), &registry()).unwrap();
        let b = ActivityTree::cache(noop("root").child(noop("x")).build(), &registry()).unwrap();
        let c = ActivityTree::cache(noop("root").child(noop("y")).build(), &registry()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
