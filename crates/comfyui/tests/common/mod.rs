//! In-memory ComfyUI worker shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use comfybridge_comfyui::api::{ComfyUIApiError, PromptInfo, SubmitResponse, WorkerApi};
use comfybridge_core::progress::{Channel, Transition, TransitionObserver};
use serde_json::{json, Map, Value};

/// Fake worker: assigns ids `prompt-0`, `prompt-1`, ... and serves a
/// history map the test fills in.
#[derive(Default)]
pub struct FakeApi {
    pub client_id: Option<String>,
    /// Submission index from which every submit is rejected.
    pub reject_from: Option<u32>,
    /// Number of history calls that fail before the fake answers.
    pub history_failures: AtomicU32,
    /// History requests never answer, like a worker that accepted the
    /// connection and went silent.
    pub hang_history: bool,
    pub submitted: Mutex<Vec<Value>>,
    pub history: Mutex<Map<String, Value>>,
    pub history_calls: AtomicU32,
    pub sweep_calls: AtomicU32,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_from(index: u32) -> Self {
        Self {
            reject_from: Some(index),
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang_history: true,
            ..Self::default()
        }
    }

    pub fn set_entry(&self, prompt_id: &str, entry: Value) {
        self.history.lock().unwrap().insert(prompt_id.to_string(), entry);
    }

    pub fn complete(&self, prompt_id: &str) {
        self.set_entry(
            prompt_id,
            json!({
                "outputs": {"9": {"images": [{"filename": format!("{prompt_id}.png")}]}},
                "status": {"status_str": "success", "completed": true}
            }),
        );
    }

    pub fn error(&self, prompt_id: &str, message: &str) {
        self.set_entry(
            prompt_id,
            json!({"outputs": {}, "status": {"status_str": "error", "error": message}}),
        );
    }

    pub fn submitted_graphs(&self) -> Vec<Value> {
        self.submitted.lock().unwrap().clone()
    }

    fn take_failure(&self) -> bool {
        self.history_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl WorkerApi for FakeApi {
    async fn get_prompt(&self) -> Result<PromptInfo, ComfyUIApiError> {
        Ok(PromptInfo {
            client_id: self.client_id.clone(),
            exec_info: None,
        })
    }

    async fn submit_workflow(
        &self,
        workflow: &Value,
        _client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let mut submitted = self.submitted.lock().unwrap();
        let index = submitted.len() as u32;
        if self.reject_from.is_some_and(|from| index >= from) {
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
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_history {
            return std::future::pending().await;
        }
        if self.take_failure() {
            return Err(ComfyUIApiError::ApiError {
                status: 500,
                body: "boom".into(),
            });
        }
        Ok(self.history.lock().unwrap().get(prompt_id).cloned())
    }

    async fn get_all_history(&self) -> Result<Value, ComfyUIApiError> {
        self.sweep_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_history {
            return std::future::pending().await;
        }
        Ok(Value::Object(self.history.lock().unwrap().clone()))
    }
}

/// Records every transition the poll channel reports.
#[derive(Default)]
pub struct Recorder(pub Mutex<Vec<(Channel, Transition)>>);

impl Recorder {
    pub fn transitions(&self) -> Vec<Transition> {
        self.0.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn completions(&self) -> usize {
        self.transitions()
            .iter()
            .filter(|t| matches!(t, Transition::ChunkComplete { .. }))
            .count()
    }
}

impl TransitionObserver for Recorder {
    fn observe(&self, channel: Channel, transition: &Transition) {
        self.0.lock().unwrap().push((channel, transition.clone()));
    }
}

/// Minimal workflow with one seeded sampler and a save node.
pub fn workflow() -> Value {
    json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 1000, "steps": 20}},
        "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "out"}}
    })
}
