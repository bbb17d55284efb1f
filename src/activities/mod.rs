//! Built-in activities
//!
//! Composite and primitive activities written against the public runtime
//! API: sequencing and parallel branches, assignment and logging, waiting
//! on bookmarks, fault handling, no-persist zones, transactions, bookmark
//! scopes, async invocation and delegates. `samples` wires a few of them
//! into definitions the CLI can start.

pub mod invoke;
pub mod primitives;
pub mod samples;
pub mod scopes;
pub mod sequence;
pub mod wait;

pub use invoke::{AsyncFn, InvokeAsync, InvokeDelegate};
pub use primitives::{Assign, LogSink, MemoryLogSink, Throw, WriteLog};
pub use scopes::{CorrelationScope, InitializeCorrelation, NoPersistScope, TransactionScope, TryCatch};
pub use sequence::{Parallel, Sequence};
pub use wait::WaitForBookmark;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::primitives::{LogSink, MemoryLogSink};
    use crate::runtime::RuntimeConfig;
    use crate::runtime::activity::Activity;
    use crate::runtime::executor::ActivityExecutor;
    use crate::runtime::extension::ExtensionRegistry;
    use crate::runtime::handle::HandleFactoryRegistry;
    use crate::runtime::tree::ActivityTree;

    /// Executor over `root` with a memory log sink attached and the root scheduled
    pub(crate) fn start(root: Activity) -> (ActivityExecutor, Arc<MemoryLogSink>) {
        let sink = Arc::new(MemoryLogSink::default());
        let extensions = ExtensionRegistry::new().with::<dyn LogSink>(sink.clone());
        let tree = ActivityTree::cache(root.build(), &HandleFactoryRegistry::with_builtins()).unwrap();
        let mut executor = ActivityExecutor::new(tree, RuntimeConfig::default(), extensions);
        executor.schedule_root(BTreeMap::new()).unwrap();
        (executor, sink)
    }
}
