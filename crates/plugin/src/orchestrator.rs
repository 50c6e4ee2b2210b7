//! Per-task orchestration: endpoint arbitration, launch or reuse, chunk
//! submission, dual-channel monitoring, and completion.
//!
//! One [`TaskOrchestrator`] owns one farm task. It is generic over the
//! farm host, the process executor, the port probe, and the API
//! connector so each seam can be replaced in tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use comfybridge_comfyui::api::{
    http_client, resolve_client_id, ComfyUIApi, ComfyUIApiError, WorkerApi, REQUEST_TIMEOUT,
};
use comfybridge_comfyui::poller::{PollChannel, PollConfig, PollOutcome};
use comfybridge_comfyui::queue::PromptQueueManager;
use comfybridge_comfyui::readiness::{wait_until_ready, ReadinessConfig};
use comfybridge_core::error::TaskError;
use comfybridge_core::launch::{build_launch_command, HostPlatform, LaunchOptions};
use comfybridge_core::log_events::{LogEventSink, LogPatternTable};
use comfybridge_core::ports::{PortAllocator, PortProbe, PortRequest, WorkerEndpoint};
use comfybridge_core::progress::ChunkTracker;
use comfybridge_core::seed::SeedingApplied;
use comfybridge_core::types::TaskContext;
use comfybridge_core::workflow::normalize_workflow;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::claim::{ClaimTrigger, SubmissionClaim};
use crate::completion::{CompletionAction, CompletionSignaler};
use crate::config::{BridgeConfig, TaskSettings};
use crate::host::FarmHost;
use crate::launcher::{InstanceHandle, LaunchSpec, ProcessExecutor};
use crate::lifecycle::{ChunkEventSink, HostReporter, PreparedTask, TaskLifecycle, TaskOutcome};

/// Number of output file names listed after a task.
const OUTPUT_SAMPLE_SIZE: usize = 5;

// ---------------------------------------------------------------------------
// API connector
// ---------------------------------------------------------------------------

/// Builds the API client for an endpoint.
pub trait ApiConnector: Send + Sync {
    type Api: WorkerApi;

    fn connect(&self, endpoint: &WorkerEndpoint, running: CancellationToken) -> Self::Api;
}

/// [`ApiConnector`] producing [`ComfyUIApi`] HTTP clients.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    /// Share one client, with [`REQUEST_TIMEOUT`] per request, across
    /// every endpoint.
    pub fn new() -> Result<Self, ComfyUIApiError> {
        Ok(Self {
            client: http_client(REQUEST_TIMEOUT)?,
        })
    }
}

impl ApiConnector for HttpConnector {
    type Api = ComfyUIApi;

    fn connect(&self, endpoint: &WorkerEndpoint, running: CancellationToken) -> ComfyUIApi {
        ComfyUIApi::with_client(self.client.clone(), endpoint.base_url.clone(), running)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The seams a [`TaskOrchestrator`] drives.
pub struct TaskDeps<H, E, P, C> {
    pub host: Arc<H>,
    pub executor: E,
    pub probe: P,
    pub connector: C,
}

pub struct TaskOrchestrator<H, E, P, C> {
    config: BridgeConfig,
    task: TaskContext,
    settings: TaskSettings,
    worker_name: String,
    host: Arc<H>,
    executor: E,
    allocator: PortAllocator<P>,
    connector: C,
    patterns: LogPatternTable,
    completion: CompletionSignaler<H>,
    running: CancellationToken,
}

impl<H, E, P, C> TaskOrchestrator<H, E, P, C>
where
    H: FarmHost + 'static,
    E: ProcessExecutor,
    P: PortProbe,
    C: ApiConnector,
{
    /// `running` is the task-wide stop signal: cancelling it ends any
    /// wait, poll, or keep-alive in progress.
    pub fn new(
        config: BridgeConfig,
        task: TaskContext,
        settings: TaskSettings,
        worker_name: impl Into<String>,
        deps: TaskDeps<H, E, P, C>,
        running: CancellationToken,
    ) -> Self {
        let completion = CompletionSignaler::new(
            Arc::clone(&deps.host),
            task.roles,
            config.keepalive_interval,
        );
        Self {
            config,
            task,
            settings,
            worker_name: worker_name.into(),
            host: deps.host,
            executor: deps.executor,
            allocator: PortAllocator::new(deps.probe),
            connector: deps.connector,
            patterns: LogPatternTable::standard(),
            completion,
            running,
        }
    }

    /// Custom job directory, else the host default, else
    /// `<install root>/ComfyUI/output`. The flag marks a custom choice.
    fn output_dir(&self) -> (PathBuf, bool) {
        if let Some(dir) = &self.settings.job_output_directory {
            return (dir.clone(), true);
        }
        let dir = self
            .config
            .default_output_dir
            .clone()
            .unwrap_or_else(|| self.config.comfyui_path.join("ComfyUI").join("output"));
        (dir, false)
    }

    /// Read, normalize, and seed the task's base workflow.
    async fn load_workflow(&self) -> Result<Value, TaskError> {
        let path = self
            .settings
            .workflow_file
            .as_deref()
            .ok_or_else(|| TaskError::Setup("No workflow file specified".into()))?;
        tracing::info!(path = %path.display(), "Loading workflow");

        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            TaskError::Setup(format!("Could not read workflow file {}: {e}", path.display()))
        })?;
        let raw: Value = serde_json::from_str(&text).map_err(|e| {
            TaskError::Setup(format!("Invalid workflow JSON in {}: {e}", path.display()))
        })?;
        let mut graph = normalize_workflow(raw)?;

        match self.settings.seed_plan().seed_task_graph(&mut graph, self.task.task_id) {
            SeedingApplied::DistributedSeed { nodes } => {
                tracing::info!(nodes, "DeadlineSeed nodes detected, skipping automatic seed modification");
            }
            SeedingApplied::Mutated(report) => {
                if report.is_modified() {
                    tracing::info!(
                        changed = report.changed.len(),
                        policy = self.settings.seed_policy.as_str(),
                        "Modified workflow seeds",
                    );
                }
                for skipped in &report.skipped {
                    tracing::warn!(
                        node = %skipped.node_id,
                        param = %skipped.param,
                        value = %skipped.value,
                        "Non-integer seed left unchanged",
                    );
                }
            }
        }
        Ok(graph)
    }

    fn launch(
        &self,
        prepared: &PreparedTask,
        sink: Arc<dyn LogEventSink>,
    ) -> Result<InstanceHandle, TaskError> {
        let options = LaunchOptions {
            install_root: self.config.comfyui_path.clone(),
            port: prepared.endpoint.port,
            gpu_index: self.task.gpu_index,
            roles: self.task.roles,
            no_user_site: self.settings.python_no_user_site,
            output_directory: prepared.custom_output_dir.then(|| prepared.output_dir.clone()),
            platform: HostPlatform::current(),
        };
        let command = build_launch_command(&options)?;
        let env = vec![
            ("DEADLINE_SLAVE_NAME".to_string(), self.worker_name.clone()),
            ("DEADLINE_JOB_ID".to_string(), self.task.job_id.clone()),
            ("DEADLINE_TASK_ID".to_string(), self.task.task_id.to_string()),
        ];
        self.host.set_status("Starting ComfyUI");
        self.executor
            .launch(LaunchSpec {
                command,
                env,
                patterns: self.patterns.clone(),
                sink,
            })
            .map_err(|e| TaskError::Setup(e.to_string()))
    }

    /// Block until a readiness trigger claims the submission.
    async fn wait_for_worker<A: WorkerApi>(
        &self,
        api: &A,
        claim: &SubmissionClaim,
        deadline: Instant,
    ) -> Result<(), TaskError> {
        if claim.is_claimed() {
            return Ok(());
        }
        self.host.set_status("Waiting for ComfyUI to start");

        let probe = async {
            if wait_until_ready(api, &ReadinessConfig::default(), &self.running)
                .await
                .is_some()
            {
                claim.try_claim(ClaimTrigger::ReadinessProbe);
            }
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = claim.wait() => Ok(()),
            _ = probe => Ok(()),
            _ = self.running.cancelled() => Err(TaskError::Stopped),
            _ = tokio::time::sleep_until(deadline) => Err(TaskError::Setup(format!(
                "ComfyUI did not become ready within {} seconds",
                self.config.timeout.as_secs()
            ))),
        }
    }

    async fn submit_and_monitor<A: WorkerApi>(
        &self,
        api: &A,
        tracker: &ChunkTracker,
        reporter: &HostReporter<H>,
        monitor: &CancellationToken,
        graph: &Value,
        deadline: Instant,
    ) -> Result<TaskOutcome, TaskError> {
        let client_id = resolve_client_id(api).await.map_err(|e| match e {
            ComfyUIApiError::Stopped => TaskError::Stopped,
            e => TaskError::Setup(format!("Error connecting to ComfyUI API: {e}")),
        })?;

        let queued = PromptQueueManager::new(api, tracker, &client_id, self.settings.seed_plan())
            .with_submit_delay(self.config.submit_delay)
            .submit(graph)
            .await?;
        if queued.degraded {
            tracing::warn!(
                queued = queued.records.len(),
                chunk_size = self.task.chunk_size,
                "Chunk only partially queued",
            );
        }
        self.host.set_status(&format!(
            "Queued {} of {} prompts",
            queued.records.len(),
            self.task.chunk_size
        ));

        // Startup and submission already spent part of the budget.
        let poll = PollConfig {
            interval: self.config.poll_interval,
            timeout: deadline.saturating_duration_since(Instant::now()),
        };
        match PollChannel::new(api, tracker, reporter, poll).run(monitor).await {
            PollOutcome::Complete => match self.completion.finalize(&self.running).await {
                CompletionAction::KeptAlive => Ok(TaskOutcome::KeptAlive),
                CompletionAction::Reported | CompletionAction::AlreadyReported => {
                    Ok(TaskOutcome::Completed)
                }
            },
            PollOutcome::Failed(reason) => Ok(TaskOutcome::Failed(reason)),
            PollOutcome::Stopped => Err(TaskError::Stopped),
        }
    }
}

impl<H, E, P, C> TaskLifecycle for TaskOrchestrator<H, E, P, C>
where
    H: FarmHost + 'static,
    E: ProcessExecutor,
    P: PortProbe,
    C: ApiConnector,
{
    async fn pre_task(&self) -> Result<PreparedTask, TaskError> {
        tracing::info!(
            job_id = %self.task.job_id,
            task_id = self.task.task_id,
            chunk_size = self.task.chunk_size,
            gpu = ?self.task.gpu_index,
            "Starting task",
        );

        let request = PortRequest {
            base_port: self.settings.base_port,
            gpu_index: self.task.gpu_index,
            roles: self.task.roles,
            task_id: Some(self.task.task_id),
        };
        let endpoint = self.allocator.allocate(&request).await;

        let (output_dir, custom_output_dir) = self.output_dir();
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            TaskError::Setup(format!(
                "Could not create output directory {}: {e}",
                output_dir.display()
            ))
        })?;
        tracing::info!(
            output_dir = %output_dir.display(),
            custom = custom_output_dir,
            endpoint = %endpoint.base_url,
            reused = endpoint.is_reused(),
            "Task prepared",
        );

        Ok(PreparedTask {
            endpoint,
            output_dir,
            custom_output_dir,
        })
    }

    async fn run(&self, prepared: &PreparedTask) -> Result<TaskOutcome, TaskError> {
        let graph = self.load_workflow().await?;
        let deadline = Instant::now() + self.config.timeout;

        let tracker = Arc::new(ChunkTracker::new(self.task.chunk_size));
        let monitor = self.running.child_token();
        let reporter = Arc::new(HostReporter::new(
            Arc::clone(&self.host),
            self.task.chunk_size,
            monitor.clone(),
        ));
        let claim = Arc::new(SubmissionClaim::new());
        let api = self.connector.connect(&prepared.endpoint, self.running.clone());

        let instance = if prepared.endpoint.is_reused() {
            claim.try_claim(ClaimTrigger::ReusedInstance);
            None
        } else {
            let sink = Arc::new(ChunkEventSink::new(
                Arc::clone(&tracker),
                reporter.clone(),
                Arc::clone(&claim),
            ));
            Some(self.launch(prepared, sink)?)
        };

        // Readiness and polling share one budget.
        let outcome = match self.wait_for_worker(&api, &claim, deadline).await {
            Ok(()) => {
                self.submit_and_monitor(&api, &tracker, &reporter, &monitor, &graph, deadline)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Some(instance) = instance {
            instance.shutdown().await;
        }
        outcome
    }

    async fn post_task(&self, prepared: &PreparedTask) {
        tracing::info!("Waiting for files to be written to disk");
        tokio::time::sleep(self.config.settle_delay).await;

        match summarize_output_dir(&prepared.output_dir).await {
            Some(summary) => tracing::info!(
                dir = %prepared.output_dir.display(),
                count = summary.count,
                sample = ?summary.sample,
                newest = ?summary.newest,
                "Output directory contents",
            ),
            None => tracing::warn!(dir = %prepared.output_dir.display(), "Output directory does not exist"),
        }
    }
}

// ---------------------------------------------------------------------------
// Output verification
// ---------------------------------------------------------------------------

/// What the output directory held after a task.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSummary {
    pub count: usize,
    /// Up to five file names, sorted.
    pub sample: Vec<String>,
    /// Most recent modification time among the entries.
    pub newest: Option<DateTime<Utc>>,
}

/// `None` when `dir` cannot be read.
pub async fn summarize_output_dir(dir: &Path) -> Option<OutputSummary> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut names = Vec::new();
    let mut newest: Option<DateTime<Utc>> = None;

    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                names.push(entry.file_name().to_string_lossy().into_owned());
                let modified = entry
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from);
                newest = newest.max(modified);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Error listing output directory");
                break;
            }
        }
    }

    names.sort();
    let count = names.len();
    names.truncate(OUTPUT_SAMPLE_SIZE);
    Some(OutputSummary {
        count,
        sample: names,
        newest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summary_lists_sorted_sample() {
        let dir = tempfile::tempdir().unwrap();
        for i in (0..7).rev() {
            std::fs::write(dir.path().join(format!("frame_{i:04}.png")), b"png").unwrap();
        }

        let summary = summarize_output_dir(dir.path()).await.unwrap();
        assert_eq!(summary.count, 7);
        assert_eq!(summary.sample.len(), OUTPUT_SAMPLE_SIZE);
        assert_eq!(summary.sample[0], "frame_0000.png");
        assert!(summary.newest.is_some());
    }

    #[tokio::test]
    async fn missing_directory_has_no_summary() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(summarize_output_dir(&dir.path().join("nope")).await, None);
    }
}
