//! Async invocation and delegate invocation

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::runtime::activity::{
    Activity, ActivityDelegate, Argument, ArgumentDirection, AsyncCodeActivity, ChildCompletion, NativeActivity,
    RESULT_ARGUMENT,
};
use crate::runtime::async_op::AsyncCompletion;
use crate::runtime::context::ActivityContext;
use crate::runtime::value::{Value, ValueKind};

/// Function an `InvokeAsync` drives off the workflow thread
pub type AsyncFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

const INPUT: &str = "Input";

/// Calls an async function with `Input` and writes its output to `Result`.
///
/// The future runs on the host's tokio runtime when there is one; the
/// workflow thread only sees the completion.
pub struct InvokeAsync {
    function: AsyncFn,
}

impl InvokeAsync {
    /// Unbound `Input` and `Result`
    pub fn activity<F>(name: impl Into<String>, function: F) -> Activity
    where
        F: Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        Self::build(name, Arc::new(function))
            .argument(Argument::input(INPUT, ValueKind::Any))
            .argument(Argument::output(RESULT_ARGUMENT, ValueKind::Any))
    }

    /// Read `Input` from location `input` and write `Result` to `result`
    pub fn bound<F>(name: impl Into<String>, input: &str, result: &str, function: F) -> Activity
    where
        F: Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static,
    {
        Self::build(name, Arc::new(function))
            .argument(Argument::input(INPUT, ValueKind::Any).bind(input))
            .argument(Argument::output(RESULT_ARGUMENT, ValueKind::Any).bind(result))
    }

    fn build(name: impl Into<String>, function: AsyncFn) -> Activity {
        Activity::async_code(name, InvokeAsync { function })
    }
}

impl AsyncCodeActivity for InvokeAsync {
    fn begin_execute(&self, ctx: &mut ActivityContext<'_>, completion: AsyncCompletion) -> anyhow::Result<()> {
        let input = ctx.get_value(INPUT)?;
        let future = (self.function)(input);
        ctx.spawn(completion, future)?;
        Ok(())
    }
}

/// Schedules the handler of its single delegate.
///
/// Each input mapping copies a visible location into a delegate argument;
/// each output mapping copies a delegate argument back once the handler
/// completes.
pub struct InvokeDelegate {
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl InvokeDelegate {
    /// Invoke `delegate`, mapping `(argument, location)` pairs in and out
    pub fn activity(
        name: impl Into<String>,
        delegate: ActivityDelegate,
        inputs: &[(&str, &str)],
        outputs: &[(&str, &str)],
    ) -> Activity {
        let kind_of = |argument: &str, direction: ArgumentDirection| {
            delegate
                .arguments
                .iter()
                .find(|candidate| candidate.name == argument && candidate.direction == direction)
                .map(|candidate| candidate.kind)
                .unwrap_or_default()
        };
        let mut activity = Activity::native(
            name,
            InvokeDelegate {
                inputs: inputs.iter().map(|(argument, _)| argument.to_string()).collect(),
                outputs: outputs.iter().map(|(argument, _)| argument.to_string()).collect(),
            },
        );
        for (argument, from) in inputs {
            activity = activity.argument(Argument::input(*argument, kind_of(*argument, ArgumentDirection::In)).bind(*from));
        }
        for (argument, to) in outputs {
            activity = activity.argument(Argument::output(*argument, kind_of(*argument, ArgumentDirection::Out)).bind(*to));
        }
        activity.delegate(delegate)
    }
}

impl NativeActivity for InvokeDelegate {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        let mut arguments = BTreeMap::new();
        for name in &self.inputs {
            arguments.insert(name.clone(), ctx.get_value(name)?);
        }
        ctx.schedule_delegate(0, arguments, Some("handler_done"), None)?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        if ctx.is_cancellation_requested() {
            ctx.mark_canceled()?;
            return Ok(());
        }
        for name in &self.outputs {
            if let Some(value) = completed.outputs.get(name) {
                ctx.set_value(name, value.clone())?;
            }
        }
        Ok(())
    }
}
