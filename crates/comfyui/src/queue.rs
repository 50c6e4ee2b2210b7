//! Chunk prompt submission.
//!
//! Prompt 0 is the task-seeded graph and must be accepted before
//! anything else is queued. Prompts `1..chunk_size` are deep copies of
//! it with per-prompt seeding, submitted sequentially with a short delay.
//! A failure after the first prompt stops submission but keeps what was
//! already queued.

use std::time::Duration;

use comfybridge_core::error::TaskError;
use comfybridge_core::progress::{ChunkTracker, PromptRecord};
use comfybridge_core::seed::{SeedPlan, SeedingApplied};
use serde_json::Value;

use crate::api::WorkerApi;

/// Pause between successive submissions.
pub const DEFAULT_SUBMIT_DELAY: Duration = Duration::from_millis(500);

/// What was queued for a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOutcome {
    pub records: Vec<PromptRecord>,
    /// Fewer prompts than the chunk size were accepted.
    pub degraded: bool,
}

/// Submits a chunk's prompts and registers them with the tracker.
pub struct PromptQueueManager<'a, A> {
    api: &'a A,
    tracker: &'a ChunkTracker,
    client_id: &'a str,
    plan: SeedPlan,
    submit_delay: Duration,
}

impl<'a, A: WorkerApi> PromptQueueManager<'a, A> {
    pub fn new(api: &'a A, tracker: &'a ChunkTracker, client_id: &'a str, plan: SeedPlan) -> Self {
        Self {
            api,
            tracker,
            client_id,
            plan,
            submit_delay: DEFAULT_SUBMIT_DELAY,
        }
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Queue the chunk. `base` is prompt 0, already seeded for the task.
    ///
    /// Only a rejected first prompt is an error. Submission is closed on
    /// the tracker when this returns, whatever the outcome.
    pub async fn submit(&self, base: &Value) -> Result<QueueOutcome, TaskError> {
        let result = self.submit_all(base).await;
        self.tracker.close_submission();
        result
    }

    async fn submit_all(&self, base: &Value) -> Result<QueueOutcome, TaskError> {
        let chunk_size = self.tracker.chunk_size();

        let first = self
            .api
            .submit_workflow(base, self.client_id)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Error queuing prompt");
                TaskError::Submission(e.to_string())
            })?;
        self.register(&first.prompt_id, 0);

        if chunk_size > 1 {
            tracing::info!(chunk_size, "Batch chunk, queueing additional prompts");
        }

        for index in 1..chunk_size {
            tokio::time::sleep(self.submit_delay).await;

            let (graph, seeding) = self.plan.seed_chunk_prompt(base, index);
            log_seeding(index, &seeding);

            match self.api.submit_workflow(&graph, self.client_id).await {
                Ok(resp) => self.register(&resp.prompt_id, index),
                Err(e) => {
                    tracing::warn!(
                        index,
                        error = %e,
                        "Error queuing additional prompt, continuing with {index} queued",
                    );
                    break;
                }
            }
        }

        let records = self.tracker.records();
        let degraded = (records.len() as u32) < chunk_size;
        let ids: Vec<&str> = records.iter().map(|r| r.prompt_id.as_str()).collect();
        tracing::info!(queued = records.len(), chunk_size, prompt_ids = ?ids, "Queued prompts");
        if degraded {
            tracing::warn!(
                queued = records.len(),
                chunk_size,
                "Chunk under-submitted, it cannot complete normally",
            );
        }
        Ok(QueueOutcome { records, degraded })
    }

    fn register(&self, prompt_id: &str, index: u32) {
        match self.tracker.register_prompt(prompt_id) {
            Some(_) => tracing::info!(prompt_id, index, "Queued prompt"),
            None => tracing::warn!(prompt_id, index, "Worker returned a duplicate prompt id"),
        }
    }
}

fn log_seeding(index: u32, seeding: &SeedingApplied) {
    match seeding {
        SeedingApplied::DistributedSeed { nodes } => {
            tracing::debug!(index, nodes, "Offset DeadlineSeed nodes for prompt")
        }
        SeedingApplied::Mutated(report) if report.is_modified() => {
            tracing::info!(index, changed = report.changed.len(), "Modified seeds for additional prompt")
        }
        SeedingApplied::Mutated(_) => {}
    }
}
