//! Waiting on a host resumption

use crate::runtime::activity::{Activity, Argument, NativeActivity, RESULT_ARGUMENT};
use crate::runtime::bookmark::{Bookmark, BookmarkOptions, BookmarkScope};
use crate::runtime::context::ActivityContext;
use crate::runtime::value::{Value, ValueKind};

const BOOKMARK_NAME: &str = "BookmarkName";
const RESUMED: &str = "resumed";

/// Creates the bookmark `BookmarkName` and closes once it is resumed,
/// writing the resumption value to `Result`.
///
/// With a scope handle the bookmark is registered in the bookmark scope that
/// handle holds instead of the default namespace.
pub struct WaitForBookmark {
    scope_handle: Option<String>,
}

impl WaitForBookmark {
    /// Wait on `bookmark` in the default scope, leaving `Result` unbound
    pub fn named(bookmark: &str) -> Activity {
        Self::build(bookmark, None).argument(Argument::output(RESULT_ARGUMENT, ValueKind::Any))
    }

    /// Wait on `bookmark` and store the resumption value in `target`
    pub fn writing_to(bookmark: &str, target: &str) -> Activity {
        Self::build(bookmark, None).argument(Argument::output(RESULT_ARGUMENT, ValueKind::Any).bind(target))
    }

    /// Wait on `bookmark` inside the scope held by handle `handle`
    pub fn in_scope(bookmark: &str, handle: &str) -> Activity {
        Self::build(bookmark, Some(handle.to_string())).argument(Argument::output(RESULT_ARGUMENT, ValueKind::Any))
    }

    fn build(bookmark: &str, scope_handle: Option<String>) -> Activity {
        Activity::native("WaitForBookmark", WaitForBookmark { scope_handle })
            .argument(Argument::input(BOOKMARK_NAME, ValueKind::String).literal(bookmark))
    }
}

impl NativeActivity for WaitForBookmark {
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> anyhow::Result<()> {
        let name = ctx.get_value(BOOKMARK_NAME)?;
        let Some(name) = name.as_str() else {
            anyhow::bail!("bookmark name must be a string");
        };
        let scope = match &self.scope_handle {
            Some(handle) => ctx.bookmark_scope(handle)?.unwrap_or(BookmarkScope::DEFAULT),
            None => BookmarkScope::DEFAULT,
        };
        ctx.create_bookmark_with(name, Some(RESUMED), BookmarkOptions::NONE, scope)?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        bookmark: &Bookmark,
        value: Value,
    ) -> anyhow::Result<()> {
        tracing::debug!(%bookmark, activity = ctx.activity_name(), "bookmark resumed");
        if ctx.has_value(RESULT_ARGUMENT) {
            ctx.set_value(RESULT_ARGUMENT, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::testing::start;
    use crate::runtime::bookmark::BookmarkResumptionResult;
    use crate::runtime::executor::WorkflowStatus;
    use serde_json::json;

    #[test]
    fn test_resumption_value_becomes_result() {
        let (mut executor, _sink) = start(WaitForBookmark::named("approve"));
        assert_eq!(executor.run(), WorkflowStatus::Executing);

        let bookmarks = executor.get_all_bookmarks();
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0].name, "approve");
        assert_eq!(bookmarks[0].owner_display_name, "WaitForBookmark");

        assert_eq!(executor.resume_bookmark("approve", json!("yes")), BookmarkResumptionResult::Success);
        assert_eq!(executor.run(), WorkflowStatus::Closed);
        assert_eq!(executor.outputs().get(RESULT_ARGUMENT), Some(&json!("yes")));
    }

    #[test]
    fn test_unknown_bookmark_not_found() {
        let (mut executor, _sink) = start(WaitForBookmark::named("approve"));
        executor.run();
        assert_eq!(executor.resume_bookmark("reject", json!(null)), BookmarkResumptionResult::NotFound);
        assert_eq!(executor.state(), WorkflowStatus::Executing);
    }
}
