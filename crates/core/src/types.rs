use crate::error::TaskError;
use crate::roles::RoleFlags;

/// Farm task ids are non-negative integers assigned by the scheduler.
pub type TaskId = u32;

/// Opaque identifier the worker assigns to a submitted prompt.
pub type PromptId = String;

/// Identity of the farm task being processed.
///
/// Built once when the task starts and never reassigned afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub job_id: String,
    pub task_id: TaskId,
    /// Number of prompts this task must execute (at least 1).
    pub chunk_size: u32,
    /// GPU the worker instance is bound to, if any.
    pub gpu_index: Option<u32>,
    pub roles: RoleFlags,
}

impl TaskContext {
    /// Validate and build a task context.
    pub fn new(
        job_id: impl Into<String>,
        task_id: TaskId,
        chunk_size: u32,
        gpu_index: Option<u32>,
        roles: RoleFlags,
    ) -> Result<Self, TaskError> {
        if chunk_size == 0 {
            return Err(TaskError::Validation(
                "Chunk size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            job_id: job_id.into(),
            task_id,
            chunk_size,
            gpu_index,
            roles,
        })
    }
}
