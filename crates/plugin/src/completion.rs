//! Final step of a completed chunk.
//!
//! Plain roles report completion to the scheduler exactly once. A
//! distributed worker (worker and distributed flags both set) never
//! reports: it keeps the task slot alive so a coordinator can keep
//! dispatching work to the same endpoint, logging periodically until
//! cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use comfybridge_core::roles::RoleFlags;
use tokio_util::sync::CancellationToken;

use crate::host::FarmHost;

/// What [`CompletionSignaler::finalize`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    Reported,
    /// Another caller already reported.
    AlreadyReported,
    /// Keep-alive ran until cancellation.
    KeptAlive,
}

pub struct CompletionSignaler<H: ?Sized> {
    host: Arc<H>,
    roles: RoleFlags,
    keepalive_interval: Duration,
    reported: AtomicBool,
}

impl<H: FarmHost + ?Sized> CompletionSignaler<H> {
    pub fn new(host: Arc<H>, roles: RoleFlags, keepalive_interval: Duration) -> Self {
        Self {
            host,
            roles,
            keepalive_interval,
            reported: AtomicBool::new(false),
        }
    }

    /// Act on a completed chunk. For a distributed worker this returns
    /// only once `cancel` fires.
    pub async fn finalize(&self, cancel: &CancellationToken) -> CompletionAction {
        if self.roles.is_distributed_worker() {
            tracing::info!("Distributed worker mode: registration completed, entering keep-alive mode");
            self.keep_alive(cancel).await;
            return CompletionAction::KeptAlive;
        }

        if self
            .reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Completion already reported");
            return CompletionAction::AlreadyReported;
        }
        tracing::info!("Signaling scheduler that the task is complete");
        self.host.complete_task();
        CompletionAction::Reported
    }

    async fn keep_alive(&self, cancel: &CancellationToken) {
        self.host.set_status("Distributed worker ready");
        tracing::info!(
            interval_secs = self.keepalive_interval.as_secs(),
            "Worker will remain active until stopped or the job is cancelled",
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Distributed worker keep-alive ended");
                    return;
                }
                _ = tokio::time::sleep(self.keepalive_interval) => {
                    tracing::info!("Distributed worker is alive and ready for workflows");
                }
            }
        }
    }
}
