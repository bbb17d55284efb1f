//! Activity definitions and behavior traits
//!
//! An `Activity` is an immutable definition node: its behavior, its public
//! children, the variables and arguments it declares, its delegates and its
//! handles. Definitions are shared as `Arc<Activity>` and cached into exactly
//! one live `ActivityTree` at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use super::async_op::AsyncCompletion;
use super::bookmark::Bookmark;
use super::context::ActivityContext;
use super::instance::{ActivityInstanceState, InstanceId};
use super::value::{Value, ValueKind};

/// Name of the argument `end_execute` writes by default
pub const RESULT_ARGUMENT: &str = "Result";

/// Activity whose body runs to completion in one call
pub trait CodeActivity: Send + Sync {
    /// Run the body
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()>;
}

/// Activity whose body finishes on another thread
pub trait AsyncCodeActivity: Send + Sync {
    /// Start the operation and hand `completion` to whatever finishes it
    fn begin_execute(
        &self,
        ctx: &mut ActivityContext<'_>,
        completion: AsyncCompletion,
    ) -> anyhow::Result<()>;

    /// Consume the operation's outcome on the workflow thread
    fn end_execute(
        &self,
        ctx: &mut ActivityContext<'_>,
        result: anyhow::Result<Value>,
    ) -> anyhow::Result<()> {
        let value = result?;
        if ctx.has_value(RESULT_ARGUMENT) {
            ctx.set_value(RESULT_ARGUMENT, value)?;
        }
        Ok(())
    }

    /// Cancellation was requested while the operation is outstanding
    fn cancel(&self, _ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Activity with full access to scheduling, bookmarks and handles
pub trait NativeActivity: Send + Sync {
    /// Run the body
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()>;

    /// A bookmark registered with `callback` was resumed with `value`
    fn on_bookmark_resumed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _bookmark: &Bookmark,
        _value: Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A child scheduled with `callback` completed
    fn on_child_completed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A child scheduled with fault `callback` faulted. Runs in a fault context.
    fn on_child_faulted(&self, _ctx: &mut ActivityContext<'_>, _callback: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// The requested transaction context is available. Runs in a transaction context.
    fn on_transaction_context(&self, _ctx: &mut ActivityContext<'_>, _callback: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Cancellation was requested
    fn cancel(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        ctx.remove_all_bookmarks()?;
        ctx.cancel_children()?;
        if ctx.child_instances()?.is_empty() {
            ctx.mark_canceled()?;
        }
        Ok(())
    }

    /// The instance is being aborted. Runs in an abort context.
    fn abort(&self, _ctx: &mut ActivityContext<'_>) {}
}

/// Behavior attached to a definition
#[derive(Clone)]
pub enum ActivityBehavior {
    /// Synchronous body
    Code(Arc<dyn CodeActivity>),
    /// Body completed from another thread
    AsyncCode(Arc<dyn AsyncCodeActivity>),
    /// Composite body
    Native(Arc<dyn NativeActivity>),
}

impl ActivityBehavior {
    /// Stable tag used in fingerprints
    pub fn kind_name(&self) -> &'static str {
        match self {
            ActivityBehavior::Code(_) => "code",
            ActivityBehavior::AsyncCode(_) => "async",
            ActivityBehavior::Native(_) => "native",
        }
    }
}

impl fmt::Debug for ActivityBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// Data flow direction of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentDirection {
    /// Value flows into the activity
    In,
    /// Value flows out of the activity
    Out,
    /// Value flows both ways
    InOut,
}

impl ArgumentDirection {
    /// Stable tag used in fingerprints
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgumentDirection::In => "in",
            ArgumentDirection::Out => "out",
            ArgumentDirection::InOut => "inout",
        }
    }
}

/// What an argument is bound to in the declaring scope
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Not bound; root inputs and outputs may stay unbound
    Unbound,
    /// Constant value
    Literal(Value),
    /// Name of a visible variable or argument
    Variable(String),
}

/// Variable declared by an activity
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Name, unique within the declaring scope
    pub name: String,
    /// Type tag
    pub kind: ValueKind,
    /// Initial value, or the kind default
    pub default: Option<Value>,
    /// Whether children may only read it
    pub read_only: bool,
}

impl Variable {
    /// Writable variable initialized to the kind default
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            read_only: false,
        }
    }

    /// Set the initial value
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Make the variable read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Argument declared by an activity
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// Name, unique within the activity
    pub name: String,
    /// Type tag
    pub kind: ValueKind,
    /// Direction
    pub direction: ArgumentDirection,
    /// Binding in the parent scope
    pub binding: Binding,
    /// Whether a binding is mandatory below the root
    pub required: bool,
}

impl Argument {
    fn new(name: impl Into<String>, kind: ValueKind, direction: ArgumentDirection) -> Self {
        Self {
            name: name.into(),
            kind,
            direction,
            binding: Binding::Unbound,
            required: false,
        }
    }

    /// Input argument
    pub fn input(name: impl Into<String>, kind: ValueKind) -> Self {
        Self::new(name, kind, ArgumentDirection::In)
    }

    /// Output argument
    pub fn output(name: impl Into<String>, kind: ValueKind) -> Self {
        Self::new(name, kind, ArgumentDirection::Out)
    }

    /// Input/output argument
    pub fn in_out(name: impl Into<String>, kind: ValueKind) -> Self {
        Self::new(name, kind, ArgumentDirection::InOut)
    }

    /// Bind to a constant
    pub fn literal(mut self, value: impl Into<Value>) -> Self {
        self.binding = Binding::Literal(value.into());
        self
    }

    /// Bind to a visible variable or argument by name
    pub fn bind(mut self, name: impl Into<String>) -> Self {
        self.binding = Binding::Variable(name.into());
        self
    }

    /// Require a binding
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Argument a delegate handler receives from its invoker
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateArgument {
    /// Name visible inside the handler
    pub name: String,
    /// Type tag
    pub kind: ValueKind,
    /// Direction
    pub direction: ArgumentDirection,
}

impl DelegateArgument {
    /// Input delegate argument
    pub fn input(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            direction: ArgumentDirection::In,
        }
    }

    /// Output delegate argument
    pub fn output(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            direction: ArgumentDirection::Out,
        }
    }
}

/// Parameterized callback an activity can schedule; its handler opens a new id space
#[derive(Debug, Clone)]
pub struct ActivityDelegate {
    /// Delegate name
    pub name: String,
    /// Arguments passed to the handler
    pub arguments: Vec<DelegateArgument>,
    /// Handler, if any
    pub handler: Option<Arc<Activity>>,
}

impl ActivityDelegate {
    /// Delegate without arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            handler: None,
        }
    }

    /// Add an argument
    pub fn argument(mut self, argument: DelegateArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Set the handler
    pub fn handler(mut self, handler: impl Into<Arc<Activity>>) -> Self {
        self.handler = Some(handler.into());
        self
    }
}

/// Handle declared by an activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleDecl {
    /// Name visible to the activity and its descendants
    pub name: String,
    /// Factory tag
    pub tag: String,
}

/// Immutable definition node
pub struct Activity {
    pub(crate) name: String,
    pub(crate) behavior: ActivityBehavior,
    pub(crate) children: Vec<Arc<Activity>>,
    pub(crate) variables: Vec<Variable>,
    pub(crate) implementation_variables: Vec<Variable>,
    pub(crate) arguments: Vec<Argument>,
    pub(crate) delegates: Vec<ActivityDelegate>,
    pub(crate) handles: Vec<HandleDecl>,
    pub(crate) cache_stamp: AtomicU64,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("name", &self.name)
            .field("behavior", &self.behavior)
            .field("children", &self.children.len())
            .field("variables", &self.variables)
            .field("arguments", &self.arguments)
            .finish()
    }
}

impl Activity {
    fn with_behavior(name: impl Into<String>, behavior: ActivityBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            children: Vec::new(),
            variables: Vec::new(),
            implementation_variables: Vec::new(),
            arguments: Vec::new(),
            delegates: Vec::new(),
            handles: Vec::new(),
            cache_stamp: AtomicU64::new(0),
        }
    }

    /// Definition backed by a synchronous body
    pub fn code(name: impl Into<String>, behavior: impl CodeActivity + 'static) -> Self {
        Self::with_behavior(name, ActivityBehavior::Code(Arc::new(behavior)))
    }

    /// Definition backed by an asynchronous body
    pub fn async_code(name: impl Into<String>, behavior: impl AsyncCodeActivity + 'static) -> Self {
        Self::with_behavior(name, ActivityBehavior::AsyncCode(Arc::new(behavior)))
    }

    /// Definition backed by a composite body
    pub fn native(name: impl Into<String>, behavior: impl NativeActivity + 'static) -> Self {
        Self::with_behavior(name, ActivityBehavior::Native(Arc::new(behavior)))
    }

    /// Add a public child
    pub fn child(mut self, child: impl Into<Arc<Activity>>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Add several public children
    pub fn children<I>(mut self, children: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arc<Activity>>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    /// Declare a variable visible to this activity and its descendants
    pub fn variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Declare a variable visible only to this activity's own body
    pub fn implementation_variable(mut self, variable: Variable) -> Self {
        self.implementation_variables.push(variable);
        self
    }

    /// Declare an argument
    pub fn argument(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Declare a delegate
    pub fn delegate(mut self, delegate: ActivityDelegate) -> Self {
        self.delegates.push(delegate);
        self
    }

    /// Declare a handle
    pub fn handle(mut self, name: impl Into<String>, tag: impl Into<String>) -> Self {
        self.handles.push(HandleDecl {
            name: name.into(),
            tag: tag.into(),
        });
        self
    }

    /// Share the definition
    pub fn build(self) -> Arc<Activity> {
        Arc::new(self)
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Behavior
    pub fn behavior(&self) -> &ActivityBehavior {
        &self.behavior
    }

    /// Public children in declaration order
    pub fn public_children(&self) -> &[Arc<Activity>] {
        &self.children
    }

    /// Declared arguments
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Declared variables
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Declared delegates
    pub fn delegates(&self) -> &[ActivityDelegate] {
        &self.delegates
    }

    /// Declared handles
    pub fn handles(&self) -> &[HandleDecl] {
        &self.handles
    }
}

/// What a parent learns when a child completes
#[derive(Debug, Clone)]
pub struct ChildCompletion {
    /// Completed instance
    pub instance: InstanceId,
    /// Display name of the child activity
    pub display_name: String,
    /// Final state
    pub state: ActivityInstanceState,
    /// Value of the child's `Result` output, if it has one
    pub result: Option<Value>,
    /// Values of the child's unbound outputs
    pub outputs: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    impl CodeActivity for Noop {
        fn execute(&self, _ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builder_collects_declarations() {
        let activity = Activity::code("noop", Noop)
            .variable(Variable::new("n", ValueKind::Number).with_default(1))
            .argument(Argument::input("text", ValueKind::String).literal("hi"))
            .argument(Argument::output("Result", ValueKind::Any))
            .handle("guard", "no-persist")
            .child(Activity::code("inner", Noop))
            .build();

        assert_eq!(activity.name(), "noop");
        assert_eq!(activity.behavior().kind_name(), "code");
        assert_eq!(activity.variables()[0].default, Some(json!(1)));
        assert_eq!(activity.arguments()[0].binding, Binding::Literal(json!("hi")));
        assert_eq!(activity.arguments()[1].direction, ArgumentDirection::Out);
        assert_eq!(activity.handles()[0].tag, "no-persist");
        assert_eq!(activity.public_children().len(), 1);
    }
}
