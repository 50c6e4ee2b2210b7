//! ComfyUI process launch and log-stream wiring.
//!
//! The executor starts the process and feeds every stdout/stderr line
//! through the [`LogPatternTable`] into a [`LogEventSink`]. Dropping or
//! shutting down the returned [`InstanceHandle`] kills the process.

use std::process::Stdio;
use std::sync::Arc;

use comfybridge_core::launch::LaunchCommand;
use comfybridge_core::log_events::{LogEventSink, LogPatternTable};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to start ComfyUI process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Everything needed to start one instance.
#[derive(Clone)]
pub struct LaunchSpec {
    pub command: LaunchCommand,
    /// Extra environment for the child process.
    pub env: Vec<(String, String)>,
    pub patterns: LogPatternTable,
    pub sink: Arc<dyn LogEventSink>,
}

/// Starts ComfyUI processes.
pub trait ProcessExecutor: Send + Sync {
    fn launch(&self, spec: LaunchSpec) -> Result<InstanceHandle, LaunchError>;
}

/// A launched process and its output readers.
#[derive(Debug, Default)]
pub struct InstanceHandle {
    child: Option<Child>,
    readers: Vec<JoinHandle<()>>,
}

impl InstanceHandle {
    /// Handle with no process behind it.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Kill the process and stop the readers.
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => tracing::info!("ComfyUI process stopped"),
                Err(e) => tracing::warn!(error = %e, "Failed to stop ComfyUI process"),
            }
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

/// [`ProcessExecutor`] backed by [`tokio::process`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn launch(&self, spec: LaunchSpec) -> Result<InstanceHandle, LaunchError> {
        tracing::info!(command = %spec.command.display(), "Launching ComfyUI");

        let mut child = Command::new(&spec.command.program)
            .args(&spec.command.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tracing::info!(pid = child.id(), "ComfyUI process started");

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, "stdout", spec.patterns.clone(), Arc::clone(&spec.sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, "stderr", spec.patterns, spec.sink));
        }

        Ok(InstanceHandle {
            child: Some(child),
            readers,
        })
    }
}

/// Forward each line of `stream` to the task log and the pattern table.
pub fn spawn_reader<R>(
    stream: R,
    name: &'static str,
    patterns: LogPatternTable,
    sink: Arc<dyn LogEventSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::info!(target: "comfyui", stream = name, "{line}");
                    patterns.dispatch(&line, sink.as_ref());
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(stream = name, error = %e, "Error reading ComfyUI output");
                    break;
                }
            }
        }
        tracing::debug!(stream = name, "ComfyUI output closed");
    })
}
