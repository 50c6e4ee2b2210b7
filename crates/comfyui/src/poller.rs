//! History poll channel.
//!
//! Queries `GET /history/{id}` for the tracked prompt on a fixed
//! interval and feeds the result into the [`ChunkTracker`]. When the
//! tracked prompt has no entry yet and other prompts are outstanding,
//! or when nothing is tracked, it sweeps the full history to recover
//! completions of prompts it was not watching.
//!
//! Transient HTTP or parse failures are logged and retried on the next
//! interval. Each request is bounded by the time left before the
//! deadline. The loop ends when the chunk is terminal, the token is
//! cancelled, or the wall-clock ceiling passes.

use std::time::Duration;

use comfybridge_core::error::TaskError;
use comfybridge_core::progress::{Channel, ChunkState, ChunkTracker, Transition, TransitionObserver};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::WorkerApi;
use crate::history::{classify_in, HistoryEntry, PromptOutcome};

/// Log poll detail on the first poll and every n-th one after it.
pub const PROGRESS_LOG_INTERVAL: u64 = 10;

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(6000),
        }
    }
}

/// How the poll loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Complete,
    Failed(String),
    /// Cancelled before the chunk reached a terminal state.
    Stopped,
}

pub struct PollChannel<'a, A> {
    api: &'a A,
    tracker: &'a ChunkTracker,
    observer: &'a dyn TransitionObserver,
    config: PollConfig,
}

impl<'a, A: WorkerApi> PollChannel<'a, A> {
    pub fn new(
        api: &'a A,
        tracker: &'a ChunkTracker,
        observer: &'a dyn TransitionObserver,
        config: PollConfig,
    ) -> Self {
        Self {
            api,
            tracker,
            observer,
            config,
        }
    }

    /// Run until the chunk is terminal, `cancel` fires, or the timeout
    /// passes. A timeout fails the chunk.
    pub async fn run(&self, cancel: &CancellationToken) -> PollOutcome {
        let deadline = Instant::now() + self.config.timeout;
        let mut poll_count: u64 = 0;
        tracing::info!(
            chunk_size = self.tracker.chunk_size(),
            prompt_ids = ?self.tracker.pending_prompts(),
            "Beginning to monitor workflow execution",
        );

        loop {
            match self.tracker.state() {
                ChunkState::Complete => return PollOutcome::Complete,
                ChunkState::Failed(reason) => return PollOutcome::Failed(reason),
                ChunkState::Running => {}
            }
            if cancel.is_cancelled() {
                tracing::info!(poll_count, "Poll loop stopping");
                return PollOutcome::Stopped;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let reason = TaskError::Timeout {
                    secs: self.config.timeout.as_secs(),
                }
                .to_string();
                tracing::error!(poll_count, "{reason}");
                self.apply(self.tracker.fail(reason));
                continue;
            }
            if let Some(transition) = self.tracker.fail_if_exhausted() {
                tracing::error!(?transition, "Every queued prompt resolved below chunk size");
                self.apply(transition);
                continue;
            }

            // A request that never answers must not outlive the deadline.
            let verbose = poll_count % PROGRESS_LOG_INTERVAL == 0;
            tokio::select! {
                _ = cancel.cancelled() => continue,
                step = tokio::time::timeout(remaining, self.poll_once(verbose)) => {
                    if step.is_err() {
                        tracing::warn!(poll_count, "History request still pending at the deadline");
                    }
                }
            }
            poll_count += 1;

            if self.tracker.is_terminal() {
                continue;
            }
            let wait = self
                .config
                .interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn poll_once(&self, verbose: bool) {
        match self.tracker.tracked_prompt() {
            Some(prompt_id) => self.poll_tracked(&prompt_id, verbose).await,
            None => self.sweep(verbose).await,
        }
    }

    async fn poll_tracked(&self, prompt_id: &str, verbose: bool) {
        let entry = match self.api.get_history(prompt_id).await {
            Ok(entry) => entry,
            Err(e) if e.is_stopped() => return,
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Error checking history endpoint");
                return;
            }
        };

        let Some(entry) = entry else {
            if verbose {
                tracing::info!(prompt_id, "History entry not found yet for prompt");
            }
            if self.tracker.has_untracked_pending() {
                self.sweep(verbose).await;
            }
            return;
        };

        match HistoryEntry::from_value(&entry).map(|e| e.classify()) {
            Some(outcome) => self.apply_outcome(prompt_id, outcome, verbose),
            None => tracing::warn!(prompt_id, "Unreadable history entry, retrying next poll"),
        }
    }

    /// Check every pending prompt against the full history, in
    /// submission order.
    async fn sweep(&self, verbose: bool) {
        let history = match self.api.get_all_history().await {
            Ok(history) => history,
            Err(e) if e.is_stopped() => return,
            Err(e) => {
                tracing::warn!(error = %e, "Error looking for completed prompts");
                return;
            }
        };
        if verbose {
            tracing::debug!(entries = history_len(&history), "Sweeping full history");
        }

        for prompt_id in self.tracker.pending_prompts() {
            match classify_in(&history, &prompt_id) {
                Some(outcome @ (PromptOutcome::Completed { .. } | PromptOutcome::Errored { .. })) => {
                    tracing::info!(prompt_id = %prompt_id, "Found resolved prompt that wasn't tracked");
                    self.apply_outcome(&prompt_id, outcome, verbose);
                }
                _ => {}
            }
            if self.tracker.is_terminal() {
                break;
            }
        }
    }

    fn apply_outcome(&self, prompt_id: &str, outcome: PromptOutcome, verbose: bool) {
        let transition = match outcome {
            PromptOutcome::Completed { images } => {
                for image in &images {
                    tracing::info!(prompt_id, filename = %image, "Generated image");
                }
                self.tracker.mark_completed(prompt_id, Channel::Poll)
            }
            PromptOutcome::Errored { message } => {
                tracing::warn!(prompt_id, error = %message, "ComfyUI reported error for prompt");
                self.tracker.mark_errored(prompt_id, &message, Channel::Poll)
            }
            PromptOutcome::Progress(p) => {
                // Progress only describes the tracked prompt.
                if self.tracker.tracked_prompt().as_deref() != Some(prompt_id) {
                    return;
                }
                let transition = self.tracker.record_progress(p);
                if verbose {
                    if let Transition::Progress { percent } = &transition {
                        tracing::info!(prompt_id, percent, "Executing");
                    }
                }
                transition
            }
            PromptOutcome::Pending => return,
        };
        self.apply(transition);
    }

    fn apply(&self, transition: Transition) {
        if transition != Transition::Ignored {
            self.observer.observe(Channel::Poll, &transition);
        }
    }
}

fn history_len(history: &Value) -> usize {
    history.as_object().map_or(0, |m| m.len())
}
