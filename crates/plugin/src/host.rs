//! Callbacks into the farm host.

/// Reporting surface the farm exposes to a running task.
///
/// Called from both the poll task and the log-stream reader, so
/// implementations must be thread-safe.
pub trait FarmHost: Send + Sync {
    /// Task progress in `[0, 100]`.
    fn set_progress(&self, percent: f64);

    fn set_status(&self, message: &str);

    /// Terminal failure with a human-readable reason.
    fn fail_task(&self, reason: &str);

    /// Tell the scheduler this task is done.
    fn complete_task(&self);
}

/// Host used by the standalone binary: the farm captures process
/// output, so every callback becomes a log line.
#[derive(Debug, Default)]
pub struct LoggingFarmHost;

impl FarmHost for LoggingFarmHost {
    fn set_progress(&self, percent: f64) {
        tracing::info!(percent, "Progress: {percent:.1}%");
    }

    fn set_status(&self, message: &str) {
        tracing::info!(status = message, "Status");
    }

    fn fail_task(&self, reason: &str) {
        tracing::error!(reason, "Task failed");
    }

    fn complete_task(&self) {
        tracing::info!("Task complete");
    }
}
