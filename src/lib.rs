pub mod graph;
pub mod retry;
pub mod operator;
pub mod task;
pub mod state;
pub mod store;
pub mod executor;
pub mod logging;

pub use graph::Graph;
pub use retry::{ConstantDelay, ExponentialBackoff, RetryConfig, RetryPolicy};
pub use operator::{BoxOperator, FnOperator, Operator, OperatorError, OperatorResult, from_fn};
pub use task::{Completion, Readiness, Task, TaskOptions, TaskState, TriggerRule};
pub use state::{JobSnapshot, JobState, StateTable, TaskRecord, Transition};
pub use store::{Execution, MemoryStore, Store, TaskExecution, read_executions};
pub use executor::Job;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DagflowError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagflowError {
    #[error("\"\" is not a valid task name")]
    InvalidName,
    #[error("job already contains task {0}")]
    DuplicateTask(String),
    #[error("job does not contain task {0}")]
    TaskNotFound(String),
    #[error("task {0} cannot be downstream of itself")]
    SelfDependency(String),
    #[error("{upstream} is already upstream of {downstream}")]
    DuplicateEdge { upstream: String, downstream: String },
    #[error("invalid DAG: the task graph contains a cycle")]
    InvalidDag,
    #[error("job is already running")]
    AlreadyRunning,
    #[error("job failed on tasks: {}", .0.join(", "))]
    TasksFailed(Vec<String>),
    #[error("job run was cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(String),
}
