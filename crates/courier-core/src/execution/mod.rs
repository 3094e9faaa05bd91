pub mod listener;
pub mod remote;
pub mod snapshot;
pub mod task;

pub use listener::{CancelListener, ListenerId, ListenerSet};
pub use remote::{
    ExecutionInvocationCallback, ExecutionProgressCallback, ExecutionQuestionCallback,
    attach_server_execution,
};
pub use snapshot::ExecutionSnapshot;
pub use task::{ExecutionEvent, ExecutionTask, ExecutionTaskListener, UserQuestionResult};
