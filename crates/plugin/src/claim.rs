//! Claim-once guard for workflow submission.
//!
//! Several triggers may declare the worker ready: the "server started"
//! log line, the readiness probe, or the reuse path. The first to flip
//! the flag wins and wakes the submitter; every later trigger is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimTrigger {
    ServerStartedLog,
    ReadinessProbe,
    ReusedInstance,
}

impl fmt::Display for ClaimTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerStartedLog => f.write_str("server_started_log"),
            Self::ReadinessProbe => f.write_str("readiness_probe"),
            Self::ReusedInstance => f.write_str("reused_instance"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SubmissionClaim {
    claimed: AtomicBool,
    ready: Notify,
}

impl SubmissionClaim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the single winning trigger.
    pub fn try_claim(&self, trigger: ClaimTrigger) -> bool {
        let won = self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            tracing::info!(%trigger, "Worker ready, submitting workflow");
            self.ready.notify_one();
        } else {
            tracing::debug!(%trigger, "Workflow submission already claimed");
        }
        won
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Resolves once some trigger has claimed the submission.
    pub async fn wait(&self) {
        if self.is_claimed() {
            return;
        }
        self.ready.notified().await;
    }
}
