//! Task lifecycle hooks and the two reporting paths into the host.
//!
//! [`TaskLifecycle`] is the start/run/end capability the farm drives.
//! [`ChunkEventSink`] turns log-stream events into tracker signals, and
//! [`HostReporter`] turns tracker transitions from either channel into
//! host progress and status calls.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use comfybridge_core::error::TaskError;
use comfybridge_core::log_events::{LogEvent, LogEventSink};
use comfybridge_core::ports::WorkerEndpoint;
use comfybridge_core::progress::{Channel, ChunkTracker, Transition, TransitionObserver};
use tokio_util::sync::CancellationToken;

use crate::claim::{ClaimTrigger, SubmissionClaim};
use crate::host::FarmHost;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Result of pre-task setup.
#[derive(Debug, Clone)]
pub struct PreparedTask {
    pub endpoint: WorkerEndpoint,
    pub output_dir: PathBuf,
    /// `true` when the job specified its own output directory.
    pub custom_output_dir: bool,
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Completion was reported to the scheduler.
    Completed,
    /// Distributed worker: completion withheld, keep-alive ended by
    /// cancellation.
    KeptAlive,
    Failed(String),
    Stopped,
}

/// Hooks the farm invokes around a task.
pub trait TaskLifecycle: Send + Sync {
    /// Endpoint arbitration and directory setup.
    fn pre_task(&self) -> impl Future<Output = Result<PreparedTask, TaskError>> + Send;

    /// Launch or adopt the worker, submit the chunk, and monitor it.
    fn run(&self, prepared: &PreparedTask) -> impl Future<Output = Result<TaskOutcome, TaskError>> + Send;

    /// Settle delay and output verification.
    fn post_task(&self, prepared: &PreparedTask) -> impl Future<Output = ()> + Send;
}

/// Run the hooks in order, reporting any fatal error to the host once.
pub async fn drive_task<L, H>(lifecycle: &L, host: &H) -> TaskOutcome
where
    L: TaskLifecycle,
    H: FarmHost + ?Sized,
{
    let prepared = match lifecycle.pre_task().await {
        Ok(prepared) => prepared,
        Err(e) => return fail(host, e),
    };

    let outcome = match lifecycle.run(&prepared).await {
        Ok(TaskOutcome::Failed(reason)) => {
            host.fail_task(&reason);
            TaskOutcome::Failed(reason)
        }
        Ok(outcome) => outcome,
        Err(e) => fail(host, e),
    };

    if let TaskOutcome::Failed(reason) = &outcome {
        tracing::error!(reason = %reason, "Task failed");
    } else {
        lifecycle.post_task(&prepared).await;
    }
    outcome
}

fn fail<H: FarmHost + ?Sized>(host: &H, error: TaskError) -> TaskOutcome {
    if error == TaskError::Stopped {
        tracing::info!("Task stopped");
        return TaskOutcome::Stopped;
    }
    let reason = error.to_string();
    host.fail_task(&reason);
    TaskOutcome::Failed(reason)
}

// ---------------------------------------------------------------------------
// Host reporting
// ---------------------------------------------------------------------------

/// Forwards tracker transitions to the host and wakes the monitor when
/// the chunk turns terminal.
pub struct HostReporter<H: ?Sized> {
    host: Arc<H>,
    chunk_size: u32,
    terminal: CancellationToken,
}

impl<H: FarmHost + ?Sized> HostReporter<H> {
    /// `terminal` is cancelled on the first terminal transition.
    pub fn new(host: Arc<H>, chunk_size: u32, terminal: CancellationToken) -> Self {
        Self {
            host,
            chunk_size,
            terminal,
        }
    }
}

impl<H: FarmHost + ?Sized> TransitionObserver for HostReporter<H> {
    fn observe(&self, channel: Channel, transition: &Transition) {
        match transition {
            Transition::Ignored => {}
            Transition::Progress { percent } => self.host.set_progress(*percent),
            Transition::PromptCompleted {
                prompt_id,
                executed,
                percent,
            } => {
                tracing::info!(prompt_id = %prompt_id, %channel, executed, "Prompt completed");
                self.host.set_progress(*percent);
                self.host.set_status(&format!(
                    "Completed {executed} of {} prompts ({percent:.1}%)",
                    self.chunk_size
                ));
            }
            Transition::PromptErrored {
                prompt_id,
                error,
                executed,
                percent,
            } => {
                tracing::warn!(prompt_id = %prompt_id, %channel, error = %error, "Prompt errored, counted as done");
                self.host.set_progress(*percent);
                self.host.set_status(&format!(
                    "Completed {executed} of {} prompts, prompt {prompt_id} errored",
                    self.chunk_size
                ));
            }
            Transition::ChunkComplete { .. } => {
                tracing::info!(%channel, chunk_size = self.chunk_size, "All prompts executed, chunk complete");
                self.host.set_progress(100.0);
                self.host.set_status("Completed");
                self.terminal.cancel();
            }
            Transition::ChunkFailed { reason } => {
                tracing::error!(%channel, reason = %reason, "Chunk failed");
                self.terminal.cancel();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Log-stream sink
// ---------------------------------------------------------------------------

/// Log-stream channel of a chunk.
pub struct ChunkEventSink {
    tracker: Arc<ChunkTracker>,
    observer: Arc<dyn TransitionObserver>,
    claim: Arc<SubmissionClaim>,
}

impl ChunkEventSink {
    pub fn new(
        tracker: Arc<ChunkTracker>,
        observer: Arc<dyn TransitionObserver>,
        claim: Arc<SubmissionClaim>,
    ) -> Self {
        Self {
            tracker,
            observer,
            claim,
        }
    }

    fn report(&self, transition: Transition) {
        self.observer.observe(Channel::LogStream, &transition);
    }
}

impl LogEventSink for ChunkEventSink {
    fn on_event(&self, event: LogEvent) {
        match event {
            LogEvent::StepProgress {
                percent,
                current,
                total,
            } => {
                let transition = self.tracker.record_progress(percent / 100.0);
                if let Transition::Progress { percent: overall } = &transition {
                    let snap = self.tracker.snapshot();
                    if snap.chunk_size > 1 {
                        tracing::info!(
                            prompt = snap.prompts_executed + 1,
                            chunk_size = snap.chunk_size,
                            step = current,
                            steps = total,
                            "Chunk progress: {overall:.2}%",
                        );
                    }
                }
                self.report(transition);
            }
            LogEvent::PercentProgress { percent } => {
                self.report(self.tracker.record_progress(percent / 100.0));
            }
            LogEvent::PromptExecuted { seconds } => {
                tracing::info!(seconds, "Prompt executed (log stream)");
                self.report(self.tracker.log_prompt_executed());
            }
            LogEvent::ServerStarted => {
                self.claim.try_claim(ClaimTrigger::ServerStartedLog);
            }
            LogEvent::ErrorLine { line } => {
                tracing::warn!(line = %line, "ComfyUI reported an error");
            }
        }
    }
}
