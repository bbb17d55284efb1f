//! Ready-made definitions for the CLI and demos

use std::sync::Arc;

use super::primitives::{Assign, Throw, WriteLog};
use super::scopes::{EXCEPTION, TryCatch};
use super::sequence::{Parallel, Sequence};
use super::wait::WaitForBookmark;
use crate::runtime::activity::{Activity, Argument, Variable};
use crate::runtime::value::ValueKind;

/// Waits on the `approve` bookmark and returns the resumption value as `Decision`
pub fn approval() -> Arc<Activity> {
    Sequence::activity("Approval")
        .argument(Argument::output("Decision", ValueKind::Any))
        .variable(Variable::new("decision", ValueKind::Any))
        .children([
            WriteLog::literal("waiting for approval"),
            WaitForBookmark::writing_to("approve", "decision"),
            WriteLog::value_of("decision"),
            Assign::copy("Decision", "decision"),
        ])
        .build()
}

/// Waits on `left` and `right` at the same time
pub fn fan_out() -> Arc<Activity> {
    Parallel::activity("FanOut")
        .children([
            Sequence::activity("Left").children([WriteLog::literal("left waiting"), WaitForBookmark::named("left")]),
            Sequence::activity("Right").children([WriteLog::literal("right waiting"), WaitForBookmark::named("right")]),
        ])
        .build()
}

/// Catches a failure of the `review` step and logs it
pub fn guarded_review() -> Arc<Activity> {
    let body = Sequence::activity("Review").children([
        WaitForBookmark::named("review"),
        Throw::message("review rejected"),
    ]);
    TryCatch::activity(
        "GuardedReview",
        body,
        Some(WriteLog::value_of(EXCEPTION).build()),
        Some(WriteLog::literal("review finished").build()),
    )
    .build()
}

/// Sample definitions by name
pub fn catalog() -> Vec<(&'static str, Arc<Activity>)> {
    vec![
        ("approval", approval()),
        ("fan-out", fan_out()),
        ("guarded-review", guarded_review()),
    ]
}
