/// Fatal task conditions surfaced to the farm host.
///
/// Non-fatal conditions (transient poll errors, per-prompt errors inside
/// a batch, non-numeric seeds) are only logged and never appear here.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// No worker endpoint, missing install files, uncreatable directories.
    #[error("Setup failed: {0}")]
    Setup(String),

    /// The first prompt of a chunk could not be queued.
    #[error("Error queuing prompt: {0}")]
    Submission(String),

    /// The worker reported an execution error for a single-prompt chunk.
    #[error("ComfyUI workflow failed: {0}")]
    PromptFailed(String),

    /// Every queued prompt resolved but the chunk was under-submitted.
    #[error("Chunk incomplete: {executed} of {expected} prompts executed ({submitted} queued)")]
    Incomplete {
        executed: u32,
        expected: u32,
        submitted: u32,
    },

    /// The monitoring loop exceeded its wall-clock ceiling.
    #[error("Timeout waiting for workflow to complete after {secs} seconds")]
    Timeout { secs: u64 },

    /// The task was asked to stop before the chunk finished.
    #[error("Task stopped before completion")]
    Stopped,

    #[error("Validation failed: {0}")]
    Validation(String),
}
