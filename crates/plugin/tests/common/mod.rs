//! Fake farm host, ComfyUI process, and worker API for task-level tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use comfybridge_comfyui::api::{ComfyUIApiError, PromptInfo, SubmitResponse, WorkerApi};
use comfybridge_core::launch::LaunchCommand;
use comfybridge_core::ports::{PortProbe, WorkerEndpoint};
use comfybridge_core::roles::RoleFlags;
use comfybridge_core::seed::SeedPolicy;
use comfybridge_core::types::TaskContext;
use comfybridge_plugin::config::{BridgeConfig, TaskSettings};
use comfybridge_plugin::host::FarmHost;
use comfybridge_plugin::launcher::{InstanceHandle, LaunchError, LaunchSpec, ProcessExecutor};
use comfybridge_plugin::orchestrator::{ApiConnector, TaskDeps, TaskOrchestrator};
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingHost {
    pub progress: Mutex<Vec<f64>>,
    pub statuses: Mutex<Vec<String>>,
    pub failures: Mutex<Vec<String>>,
    pub completes: AtomicU32,
}

impl RecordingHost {
    pub fn completes(&self) -> u32 {
        self.completes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    pub fn last_progress(&self) -> Option<f64> {
        self.progress.lock().unwrap().last().copied()
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.statuses.lock().unwrap().iter().any(|s| s == status)
    }
}

impl FarmHost for RecordingHost {
    fn set_progress(&self, percent: f64) {
        self.progress.lock().unwrap().push(percent);
    }

    fn set_status(&self, message: &str) {
        self.statuses.lock().unwrap().push(message.to_string());
    }

    fn fail_task(&self, reason: &str) {
        self.failures.lock().unwrap().push(reason.to_string());
    }

    fn complete_task(&self) {
        self.completes.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct WorkerState {
    /// Submission index from which every submit is rejected.
    pub reject_from: Mutex<Option<u32>>,
    pub submitted: Mutex<Vec<Value>>,
    pub history: Mutex<Map<String, Value>>,
    /// Lines the fake process prints as soon as it starts.
    pub startup_lines: Mutex<Vec<String>>,
    /// Lines printed just before the first history lookup is answered.
    pub lines_before_first_poll: Mutex<Vec<String>>,
    /// How long the first `GET /prompt` takes to answer.
    pub first_answer_delay: Mutex<Option<Duration>>,
    pub launches: Mutex<Vec<LaunchSpec>>,
    pub connections: Mutex<Vec<WorkerEndpoint>>,
    pub history_calls: AtomicU32,
}

/// One fake ComfyUI install: executor, connector, and API in one.
/// Ids are `prompt-0`, `prompt-1`, ...
#[derive(Clone, Default)]
pub struct FakeWorker(pub Arc<WorkerState>);

impl FakeWorker {
    /// Worker that prints the server banner on launch.
    pub fn new() -> Self {
        let worker = Self::default();
        worker.print_on_start("Starting server");
        worker
    }

    pub fn print_on_start(&self, line: &str) {
        self.0.startup_lines.lock().unwrap().push(line.to_string());
    }

    pub fn print_before_first_poll(&self, line: &str) {
        self.0.lines_before_first_poll.lock().unwrap().push(line.to_string());
    }

    pub fn answer_first_after(&self, delay: Duration) {
        *self.0.first_answer_delay.lock().unwrap() = Some(delay);
    }

    pub fn reject_from(&self, index: u32) {
        *self.0.reject_from.lock().unwrap() = Some(index);
    }

    pub fn complete(&self, prompt_id: &str) {
        self.0.history.lock().unwrap().insert(
            prompt_id.to_string(),
            json!({
                "outputs": {"9": {"images": [{"filename": format!("{prompt_id}.png")}]}},
                "status": {"status_str": "success", "completed": true}
            }),
        );
    }

    pub fn error(&self, prompt_id: &str, message: &str) {
        self.0.history.lock().unwrap().insert(
            prompt_id.to_string(),
            json!({"outputs": {}, "status": {"status_str": "error", "error": message}}),
        );
    }

    pub fn submitted(&self) -> Vec<Value> {
        self.0.submitted.lock().unwrap().clone()
    }

    pub fn launched_commands(&self) -> Vec<LaunchCommand> {
        self.0
            .launches
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.command.clone())
            .collect()
    }

    pub fn launch_env(&self) -> Vec<(String, String)> {
        self.0
            .launches
            .lock()
            .unwrap()
            .last()
            .map(|spec| spec.env.clone())
            .unwrap_or_default()
    }

    pub fn connections(&self) -> Vec<WorkerEndpoint> {
        self.0.connections.lock().unwrap().clone()
    }

    /// Feed `line` through the running process's log stream.
    pub fn print(&self, line: &str) {
        let spec = self.0.launches.lock().unwrap().last().cloned();
        if let Some(spec) = spec {
            spec.patterns.dispatch(line, spec.sink.as_ref());
        }
    }
}

impl ProcessExecutor for FakeWorker {
    fn launch(&self, spec: LaunchSpec) -> Result<InstanceHandle, LaunchError> {
        self.0.launches.lock().unwrap().push(spec);
        let lines = self.0.startup_lines.lock().unwrap().clone();
        for line in lines {
            self.print(&line);
        }
        Ok(InstanceHandle::detached())
    }
}

impl ApiConnector for FakeWorker {
    type Api = FakeWorker;

    fn connect(&self, endpoint: &WorkerEndpoint, _running: CancellationToken) -> FakeWorker {
        self.0.connections.lock().unwrap().push(endpoint.clone());
        self.clone()
    }
}

impl WorkerApi for FakeWorker {
    async fn get_prompt(&self) -> Result<PromptInfo, ComfyUIApiError> {
        let delay = self.0.first_answer_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(PromptInfo {
            client_id: Some("fake-client".into()),
            exec_info: None,
        })
    }

    async fn submit_workflow(
        &self,
        workflow: &Value,
        _client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let reject_from = *self.0.reject_from.lock().unwrap();
        let mut submitted = self.0.submitted.lock().unwrap();
        let index = submitted.len() as u32;
        if reject_from.is_some_and(|from| index >= from) {
            return Err(ComfyUIApiError::ApiError {
                status: 400,
                body: "invalid prompt".into(),
            });
        }
        submitted.push(workflow.clone());
        Ok(SubmitResponse {
            prompt_id: format!("prompt-{index}"),
            number: i64::from(index),
        })
    }

    async fn get_history(&self, prompt_id: &str) -> Result<Option<Value>, ComfyUIApiError> {
        if self.0.history_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let lines = std::mem::take(&mut *self.0.lines_before_first_poll.lock().unwrap());
            for line in lines {
                self.print(&line);
            }
        }
        Ok(self.0.history.lock().unwrap().get(prompt_id).cloned())
    }

    async fn get_all_history(&self) -> Result<Value, ComfyUIApiError> {
        Ok(Value::Object(self.0.history.lock().unwrap().clone()))
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Probe reporting a fixed set of ports as in use.
#[derive(Default)]
pub struct FakeProbe(pub HashSet<u16>);

impl FakeProbe {
    pub fn busy(ports: impl IntoIterator<Item = u16>) -> Self {
        Self(ports.into_iter().collect())
    }
}

impl PortProbe for FakeProbe {
    async fn is_in_use(&self, port: u16) -> bool {
        self.0.contains(&port)
    }
}

// ---------------------------------------------------------------------------
// Install fixture
// ---------------------------------------------------------------------------

/// Temporary ComfyUI install root with `ComfyUI/main.py` and a workflow.
pub struct Install {
    pub dir: TempDir,
}

impl Install {
    pub fn new() -> Self {
        let install = Self::without_main_script();
        std::fs::write(install.dir.path().join("ComfyUI").join("main.py"), "# comfy").unwrap();
        install
    }

    pub fn without_main_script() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ComfyUI")).unwrap();
        std::fs::write(dir.path().join("workflow.json"), workflow().to_string()).unwrap();
        Self { dir }
    }

    pub fn workflow_path(&self) -> PathBuf {
        self.dir.path().join("workflow.json")
    }

    pub fn config(&self) -> BridgeConfig {
        BridgeConfig {
            comfyui_path: self.dir.path().to_path_buf(),
            default_output_dir: None,
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_secs(10),
            submit_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            keepalive_interval: Duration::from_millis(5),
        }
    }

    pub fn settings(&self, roles: RoleFlags, batch_mode: bool) -> TaskSettings {
        TaskSettings {
            roles,
            batch_mode,
            seed_policy: SeedPolicy::Fixed,
            base_port: 8188,
            gpu_index: Some(0),
            job_output_directory: None,
            python_no_user_site: true,
            workflow_file: Some(self.workflow_path()),
        }
    }
}

pub type FakeOrchestrator = TaskOrchestrator<RecordingHost, FakeWorker, FakeProbe, FakeWorker>;

/// Orchestrator for task 7 of `job-1` wired to the fakes.
pub fn orchestrator(
    install: &Install,
    settings: TaskSettings,
    chunk_size: u32,
    worker: &FakeWorker,
    probe: FakeProbe,
    host: &Arc<RecordingHost>,
    running: &CancellationToken,
) -> FakeOrchestrator {
    orchestrator_with_config(install.config(), settings, chunk_size, worker, probe, host, running)
}

pub fn orchestrator_with_config(
    config: BridgeConfig,
    settings: TaskSettings,
    chunk_size: u32,
    worker: &FakeWorker,
    probe: FakeProbe,
    host: &Arc<RecordingHost>,
    running: &CancellationToken,
) -> FakeOrchestrator {
    let task = TaskContext::new("job-1", 7, chunk_size, settings.gpu_index, settings.roles).unwrap();
    TaskOrchestrator::new(
        config,
        task,
        settings,
        "render-01",
        TaskDeps {
            host: Arc::clone(host),
            executor: worker.clone(),
            probe,
            connector: worker.clone(),
        },
        running.clone(),
    )
}

/// Workflow with one seeded sampler and a save node.
pub fn workflow() -> Value {
    json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 1000, "steps": 20}},
        "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "out"}}
    })
}
