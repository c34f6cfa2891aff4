//! Core engine - tasks, queues, process execution, output fan-out

mod executor;
mod hook;
mod output;
mod queue;
mod registry;
mod store;
mod task;

pub use executor::{ExecOutcome, ProcessExecutor};
pub use hook::{CompletionHook, DynamicLoader, HookLoader, PostHandlerInvoker, ENTRY_POINT};
pub use output::{OutputMux, OutputReader, CHUNK_SIZE};
pub use queue::Queue;
pub use registry::{EngineContext, QueueRegistry};
pub use store::{FinishedRecord, FinishedStore};
pub use task::{
    Priority, Task, TaskDescriptor, TaskSpec, TaskState, TaskSummary, SPAWN_FAILED_EXIT_CODE,
};
