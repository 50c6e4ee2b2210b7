//! Exponential-backoff wait for a freshly launched ComfyUI server.
//!
//! A launched instance takes a while to load models before it answers
//! HTTP. [`wait_until_ready`] polls `GET /prompt` with growing delays
//! until the server answers or the [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{PromptInfo, WorkerApi};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReadinessConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReadinessConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Poll the server until it answers.
///
/// Returns `Some(info)` on the first successful `GET /prompt`, or `None`
/// if `cancel` fires first.
pub async fn wait_until_ready<A: WorkerApi>(
    api: &A,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> Option<PromptInfo> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(attempt, "Readiness wait cancelled");
                return None;
            }
            result = api.get_prompt() => {
                match result {
                    Ok(info) => {
                        tracing::info!(attempt, "ComfyUI server is ready");
                        return Some(info);
                    }
                    Err(e) if e.is_stopped() => return None,
                    Err(e) => {
                        tracing::debug!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Server not ready yet (attempt {attempt})",
                        );
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::Value;

    use super::*;
    use crate::api::{ComfyUIApiError, SubmitResponse};

    #[test]
    fn next_delay_doubles() {
        let config = ReadinessConfig::default();
        assert_eq!(next_delay(Duration::from_secs(1), &config), Duration::from_secs(2));
    }

    #[test]
    fn full_backoff_sequence() {
        let config = ReadinessConfig::default();
        let mut delay = config.initial_delay;
        let expected = [1, 2, 4, 8, 10, 10];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &config);
        }
    }

    /// Answers after a fixed number of failed attempts.
    struct SlowStart {
        fail_first: u32,
        calls: AtomicU32,
    }

    impl WorkerApi for SlowStart {
        async fn get_prompt(&self) -> Result<PromptInfo, ComfyUIApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ComfyUIApiError::ApiError {
                    status: 503,
                    body: "loading".into(),
                })
            } else {
                Ok(PromptInfo {
                    client_id: Some("ready".into()),
                    exec_info: None,
                })
            }
        }

        async fn submit_workflow(
            &self,
            _workflow: &Value,
            _client_id: &str,
        ) -> Result<SubmitResponse, ComfyUIApiError> {
            unreachable!()
        }

        async fn get_history(&self, _prompt_id: &str) -> Result<Option<Value>, ComfyUIApiError> {
            unreachable!()
        }

        async fn get_all_history(&self) -> Result<Value, ComfyUIApiError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn retries_until_server_answers() {
        let api = SlowStart {
            fail_first: 3,
            calls: AtomicU32::new(0),
        };
        let config = ReadinessConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let info = wait_until_ready(&api, &config, &CancellationToken::new()).await;
        assert_eq!(info.and_then(|i| i.client_id).as_deref(), Some("ready"));
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_stops_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let api = SlowStart {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        };
        assert!(wait_until_ready(&api, &ReadinessConfig::default(), &cancel).await.is_none());
    }
}
