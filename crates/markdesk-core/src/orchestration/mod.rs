pub mod retry;
pub mod task_queue;

pub use retry::RetryPolicy;
pub use task_queue::{
    DEFAULT_MAX_RETRIES, DEFAULT_WORKERS, QueueConfig, TaskContext, TaskFuture, TaskOperation,
    TaskOptions, TaskPanicked, TaskQueue,
};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
