use std::error::Error;
use std::sync::Arc;

use crate::models::TaskId;

pub type TaskFailure = Arc<dyn Error + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    NotFound,
    InvalidInput,
    InvalidBundle,
    Timeout,
    Cancelled,
    TaskFailed,
    ShutDown,
    StorageFailure,
    Io,
    Internal,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub kind: CoreErrorKind,
    pub message: String,
    pub task: Option<TaskId>,
    pub attempts: Option<u32>,
    #[source]
    pub cause: Option<TaskFailure>,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            task: None,
            attempts: None,
            cause: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::InvalidInput, message)
    }

    pub fn invalid_bundle(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::InvalidBundle, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Internal, message)
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task = Some(task_id);
        self
    }

    /// Original error returned by a task callable, when this error reports a
    /// task failure.
    pub fn failure(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}
