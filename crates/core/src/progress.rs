//! Chunk progress reconciliation.
//!
//! Two unsynchronized channels report on the same chunk: the log stream
//! of the ComfyUI process (push, no prompt ids on completion lines) and
//! the history poll loop (pull, keyed by prompt id). [`ChunkTracker`]
//! is the single synchronized state object both channels write to.
//!
//! Completion accounting is append-only and keyed by prompt id, so a
//! prompt is counted at most once whichever channel reports it first.
//! Each mutating method validates, mutates and reports its
//! [`Transition`] inside one critical section; exactly one call ever
//! returns [`Transition::ChunkComplete`] or [`Transition::ChunkFailed`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::error::TaskError;
use crate::types::PromptId;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Completion status of one submitted prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStatus {
    Pending,
    Completed,
    /// Counted as completed so a batch can still reach its target.
    Errored,
}

/// One prompt submitted for the chunk, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRecord {
    /// 0-based position in the chunk, assigned at queue time.
    pub index: u32,
    pub prompt_id: PromptId,
    pub status: PromptStatus,
}

/// Which channel produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    LogStream,
    Poll,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogStream => f.write_str("log_stream"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

/// Lifecycle of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkState {
    Running,
    Complete,
    Failed(String),
}

impl ChunkState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Point-in-time copy of the chunk counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkProgress {
    pub chunk_size: u32,
    pub prompts_executed: u32,
    pub completed_ids: HashSet<PromptId>,
    /// Index into the submission order of the prompt being polled.
    pub current_tracking_index: Option<usize>,
    /// Overall chunk percent in `[0, 100]`.
    pub overall_percent: f64,
    pub submitted: u32,
    pub state: ChunkState,
}

/// Result of applying one signal to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Duplicate id, unknown id, or chunk already terminal.
    Ignored,
    /// In-progress fraction of the tracked prompt was applied.
    Progress { percent: f64 },
    /// A prompt was counted; the chunk is still running.
    PromptCompleted {
        prompt_id: PromptId,
        executed: u32,
        percent: f64,
    },
    /// A prompt errored inside a batch and was counted as completed.
    PromptErrored {
        prompt_id: PromptId,
        error: String,
        executed: u32,
        percent: f64,
    },
    /// This signal made the chunk complete.
    ChunkComplete { prompt_id: Option<PromptId> },
    /// This signal made the chunk fail.
    ChunkFailed { reason: String },
}

/// Receives every transition a channel produced, for host reporting.
pub trait TransitionObserver: Send + Sync {
    fn observe(&self, channel: Channel, transition: &Transition);
}

// ---------------------------------------------------------------------------
// Percent math
// ---------------------------------------------------------------------------

/// Overall chunk percent for `executed` finished prompts and a fraction
/// `p` of the current one. Capped at 99 until every prompt is counted.
pub fn overall_percent(executed: u32, chunk_size: u32, p: f64) -> f64 {
    if executed >= chunk_size {
        return 100.0;
    }
    let size = f64::from(chunk_size.max(1));
    let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
    let value = (f64::from(executed) / size) * 100.0 + (p * 100.0) / size;
    value.min(99.0)
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TrackerState {
    records: Vec<PromptRecord>,
    completed: HashSet<PromptId>,
    prompts_executed: u32,
    tracking: Option<usize>,
    /// Next record the log stream will attribute a completion line to.
    log_cursor: usize,
    percent: f64,
    submission_closed: bool,
    state: ChunkState,
}

impl TrackerState {
    fn position(&self, prompt_id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.prompt_id == prompt_id)
    }

    fn first_pending(&self) -> Option<usize> {
        self.records
            .iter()
            .position(|r| !self.completed.contains(&r.prompt_id))
    }

    fn bump_percent(&mut self, value: f64) -> f64 {
        if value > self.percent {
            self.percent = value;
        }
        self.percent
    }

    fn check_invariants(&self, chunk_size: u32) {
        debug_assert_eq!(self.prompts_executed as usize, self.completed.len());
        debug_assert!(self.prompts_executed <= chunk_size);
    }
}

/// Synchronized per-chunk progress state.
#[derive(Debug)]
pub struct ChunkTracker {
    chunk_size: u32,
    inner: Mutex<TrackerState>,
}

impl ChunkTracker {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            inner: Mutex::new(TrackerState {
                records: Vec::new(),
                completed: HashSet::new(),
                prompts_executed: 0,
                tracking: None,
                log_cursor: 0,
                percent: 0.0,
                submission_closed: false,
                state: ChunkState::Running,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // A poisoned lock only means another thread panicked mid-call;
        // every mutation leaves the state consistent before it can panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    // ---- submission side ----

    /// Append a queued prompt. Returns its 0-based submission index, or
    /// `None` when the id is already known or the chunk is terminal.
    pub fn register_prompt(&self, prompt_id: impl Into<PromptId>) -> Option<u32> {
        let prompt_id = prompt_id.into();
        let mut st = self.lock();
        if st.state.is_terminal() || st.submission_closed || st.position(&prompt_id).is_some() {
            return None;
        }
        let index = st.records.len() as u32;
        st.records.push(PromptRecord {
            index,
            prompt_id,
            status: PromptStatus::Pending,
        });
        if st.tracking.is_none() {
            st.tracking = st.first_pending();
        }
        Some(index)
    }

    /// No further prompts will be registered for this chunk.
    pub fn close_submission(&self) {
        self.lock().submission_closed = true;
    }

    // ---- queries ----

    pub fn state(&self) -> ChunkState {
        self.lock().state.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    pub fn snapshot(&self) -> ChunkProgress {
        let st = self.lock();
        ChunkProgress {
            chunk_size: self.chunk_size,
            prompts_executed: st.prompts_executed,
            completed_ids: st.completed.clone(),
            current_tracking_index: st.tracking,
            overall_percent: st.percent,
            submitted: st.records.len() as u32,
            state: st.state.clone(),
        }
    }

    pub fn records(&self) -> Vec<PromptRecord> {
        self.lock().records.clone()
    }

    /// Prompt the poll channel should query next.
    pub fn tracked_prompt(&self) -> Option<PromptId> {
        let st = self.lock();
        st.tracking.map(|i| st.records[i].prompt_id.clone())
    }

    /// Pending prompts in submission order.
    pub fn pending_prompts(&self) -> Vec<PromptId> {
        let st = self.lock();
        st.records
            .iter()
            .filter(|r| !st.completed.contains(&r.prompt_id))
            .map(|r| r.prompt_id.clone())
            .collect()
    }

    /// `true` when some pending prompt is not the tracked one.
    pub fn has_untracked_pending(&self) -> bool {
        let st = self.lock();
        let tracked = st.tracking;
        st.records
            .iter()
            .enumerate()
            .any(|(i, r)| Some(i) != tracked && !st.completed.contains(&r.prompt_id))
    }

    // ---- signals ----

    /// Apply an in-progress fraction `p ∈ [0, 1]` of the tracked prompt.
    pub fn record_progress(&self, p: f64) -> Transition {
        let mut st = self.lock();
        if st.state.is_terminal() {
            return Transition::Ignored;
        }
        let value = overall_percent(st.prompts_executed, self.chunk_size, p);
        let percent = st.bump_percent(value);
        Transition::Progress { percent }
    }

    /// Count `prompt_id` as completed. Idempotent by id.
    pub fn mark_completed(&self, prompt_id: &str, channel: Channel) -> Transition {
        let mut st = self.lock();
        self.complete_locked(&mut st, prompt_id, PromptStatus::Completed, channel)
            .map_or(Transition::Ignored, |(executed, percent)| {
                if st.state == ChunkState::Complete {
                    Transition::ChunkComplete {
                        prompt_id: Some(prompt_id.to_string()),
                    }
                } else {
                    Transition::PromptCompleted {
                        prompt_id: prompt_id.to_string(),
                        executed,
                        percent,
                    }
                }
            })
    }

    /// Apply a per-prompt execution error.
    ///
    /// A single-prompt chunk fails. In a batch the prompt is counted as
    /// completed and tracking moves on.
    pub fn mark_errored(&self, prompt_id: &str, error: &str, channel: Channel) -> Transition {
        let mut st = self.lock();
        if st.state.is_terminal() || st.completed.contains(prompt_id) || st.position(prompt_id).is_none() {
            return Transition::Ignored;
        }

        if self.chunk_size == 1 {
            let reason = TaskError::PromptFailed(error.to_string()).to_string();
            if let Some(i) = st.position(prompt_id) {
                st.records[i].status = PromptStatus::Errored;
            }
            st.state = ChunkState::Failed(reason.clone());
            tracing::error!(prompt_id, %channel, error, "Prompt failed, failing task");
            return Transition::ChunkFailed { reason };
        }

        tracing::warn!(prompt_id, %channel, error, "Prompt errored, continuing with remaining prompts in chunk");
        match self.complete_locked(&mut st, prompt_id, PromptStatus::Errored, channel) {
            Some(_) if st.state == ChunkState::Complete => Transition::ChunkComplete {
                prompt_id: Some(prompt_id.to_string()),
            },
            Some((executed, percent)) => Transition::PromptErrored {
                prompt_id: prompt_id.to_string(),
                error: error.to_string(),
                executed,
                percent,
            },
            None => Transition::Ignored,
        }
    }

    /// Apply a log-stream "Prompt executed" line.
    ///
    /// The line carries no id, so the log channel keeps its own cursor
    /// over the submission order and attributes the n-th line to the n-th
    /// prompt. ComfyUI prints the line for errored prompts too, so an
    /// errored prompt still consumes its line. When the poll channel
    /// already counted that prompt, this is a no-op.
    pub fn log_prompt_executed(&self) -> Transition {
        let prompt_id = {
            let mut st = self.lock();
            if st.state.is_terminal() {
                return Transition::Ignored;
            }
            let Some(record) = st.records.get(st.log_cursor) else {
                tracing::warn!(
                    submitted = st.records.len(),
                    "Prompt executed line with no matching submitted prompt",
                );
                return Transition::Ignored;
            };
            let prompt_id = record.prompt_id.clone();
            st.log_cursor += 1;
            prompt_id
        };
        self.mark_completed(&prompt_id, Channel::LogStream)
    }

    /// Fail the chunk unless it already reached a terminal state.
    pub fn fail(&self, reason: impl Into<String>) -> Transition {
        let mut st = self.lock();
        if st.state.is_terminal() {
            return Transition::Ignored;
        }
        let reason = reason.into();
        st.state = ChunkState::Failed(reason.clone());
        Transition::ChunkFailed { reason }
    }

    /// Fail an under-submitted chunk once every queued prompt resolved.
    ///
    /// Returns `None` while the chunk can still complete normally.
    pub fn fail_if_exhausted(&self) -> Option<Transition> {
        let mut st = self.lock();
        if st.state.is_terminal() || !st.submission_closed {
            return None;
        }
        let submitted = st.records.len() as u32;
        if st.first_pending().is_some() || st.prompts_executed >= self.chunk_size {
            return None;
        }
        let reason = TaskError::Incomplete {
            executed: st.prompts_executed,
            expected: self.chunk_size,
            submitted,
        }
        .to_string();
        st.state = ChunkState::Failed(reason.clone());
        Some(Transition::ChunkFailed { reason })
    }

    /// Shared body of every completion path. Returns `(executed, percent)`
    /// when the prompt was newly counted.
    fn complete_locked(
        &self,
        st: &mut TrackerState,
        prompt_id: &str,
        status: PromptStatus,
        channel: Channel,
    ) -> Option<(u32, f64)> {
        if st.state.is_terminal() {
            return None;
        }
        let Some(pos) = st.position(prompt_id) else {
            tracing::warn!(prompt_id, %channel, "Completion for unknown prompt ignored");
            return None;
        };
        if !st.completed.insert(prompt_id.to_string()) {
            tracing::debug!(prompt_id, %channel, "Prompt already counted");
            return None;
        }

        st.records[pos].status = status;
        st.prompts_executed += 1;
        let executed = st.prompts_executed;

        // Tracking advances to the first prompt, in submission order,
        // not yet counted.
        st.tracking = st.first_pending();

        if executed >= self.chunk_size {
            st.state = ChunkState::Complete;
            st.percent = 100.0;
        } else {
            let value = overall_percent(executed, self.chunk_size, 0.0);
            st.bump_percent(value);
        }
        st.check_invariants(self.chunk_size);

        tracing::info!(
            prompt_id,
            %channel,
            executed,
            chunk_size = self.chunk_size,
            "Prompt execution {executed} of {} completed",
            self.chunk_size,
        );
        match st.tracking {
            Some(i) => tracing::debug!(prompt_id = %st.records[i].prompt_id, "Tracking next prompt"),
            None if executed < self.chunk_size => tracing::info!(
                remaining = self.chunk_size - executed,
                "No more prompts to track, waiting for remaining executions",
            ),
            None => {}
        }

        Some((executed, st.percent))
    }
}
