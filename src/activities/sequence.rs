//! Sequential and parallel composition

use crate::runtime::activity::{Activity, ChildCompletion, NativeActivity, Variable};
use crate::runtime::context::ActivityContext;
use crate::runtime::value::ValueKind;

const INDEX: &str = "index";
const NEXT: &str = "next";
const BRANCH: &str = "branch";

/// Runs its children one after another.
///
/// The position is kept in a private variable so it survives persistence.
pub struct Sequence;

impl Sequence {
    /// Empty sequence called `name`
    pub fn activity(name: impl Into<String>) -> Activity {
        Activity::native(name, Sequence)
            .implementation_variable(Variable::new(INDEX, ValueKind::Number).with_default(0))
    }

    fn schedule_from(&self, ctx: &mut ActivityContext<'_>, index: usize) -> anyhow::Result<()> {
        if index >= ctx.child_count() {
            return Ok(());
        }
        ctx.set_value(INDEX, index as u64)?;
        ctx.schedule_child(index, Some(NEXT), None)?;
        Ok(())
    }
}

impl NativeActivity for Sequence {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        self.schedule_from(ctx, 0)
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        if ctx.is_cancellation_requested() {
            ctx.mark_canceled()?;
            return Ok(());
        }
        let index = ctx.get_value(INDEX)?.as_u64().unwrap_or_default() as usize;
        self.schedule_from(ctx, index + 1)
    }
}

/// Runs all children at once and closes when every branch has completed
pub struct Parallel;

impl Parallel {
    /// Empty parallel called `name`
    pub fn activity(name: impl Into<String>) -> Activity {
        Activity::native(name, Parallel)
    }
}

impl NativeActivity for Parallel {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        // Scheduled work runs last-in first-out, so push the branches in
        // reverse to start them in declaration order.
        for index in (0..ctx.child_count()).rev() {
            ctx.schedule_child(index, Some(BRANCH), None)?;
        }
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _completed: &ChildCompletion,
    ) -> anyhow::Result<()> {
        if ctx.is_cancellation_requested() && ctx.child_instances()?.is_empty() {
            ctx.mark_canceled()?;
        }
        Ok(())
    }
}
