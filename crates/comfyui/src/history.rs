//! ComfyUI history entries and their classification.
//!
//! `GET /history/{id}` returns `{"<prompt_id>": {"outputs": {...},
//! "status": {...}}}`. An entry is classified as completed when it
//! carries non-empty outputs, errored when its status says so, and
//! in-progress when `status.exec_info.progress` is present.

use serde::Deserialize;
use serde_json::{Map, Value};

/// One prompt's entry in the history map.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: Option<Map<String, Value>>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// The `status` object of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"` on current ComfyUI builds.
    #[serde(default)]
    pub status_str: Option<String>,
    /// Older builds report the same value under `status`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub exec_info: Option<HistoryExecInfo>,
    /// `[["execution_error", {...}], ...]` event pairs.
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryExecInfo {
    /// Fraction in `[0, 1]`.
    #[serde(default)]
    pub progress: Option<f64>,
}

/// What a history entry says about its prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    Completed { images: Vec<String> },
    Errored { message: String },
    Progress(f64),
    /// Entry exists but carries nothing actionable yet.
    Pending,
}

impl HistoryStatus {
    fn is_error(&self) -> bool {
        self.status_str.as_deref() == Some("error")
            || self.status.as_deref() == Some("error")
            || self.error.as_ref().is_some_and(|e| !e.is_null())
    }

    fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(s)) => return s.clone(),
            Some(v) if !v.is_null() => return v.to_string(),
            _ => {}
        }
        self.messages
            .iter()
            .filter_map(Value::as_array)
            .find(|pair| pair.first().and_then(Value::as_str) == Some("execution_error"))
            .and_then(|pair| pair.get(1))
            .and_then(|data| data.get("exception_message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

impl HistoryEntry {
    /// Parse one entry. Malformed entries yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "Malformed history entry");
                None
            }
        }
    }

    pub fn classify(&self) -> PromptOutcome {
        if let Some(outputs) = self.outputs.as_ref().filter(|o| !o.is_empty()) {
            return PromptOutcome::Completed {
                images: image_filenames(outputs),
            };
        }
        let Some(status) = &self.status else {
            return PromptOutcome::Pending;
        };
        if status.is_error() {
            return PromptOutcome::Errored {
                message: status.error_message(),
            };
        }
        match status.exec_info.as_ref().and_then(|e| e.progress) {
            Some(p) => PromptOutcome::Progress(p),
            None => PromptOutcome::Pending,
        }
    }
}

/// Look up and classify `prompt_id` in a full history map.
pub fn classify_in(history: &Value, prompt_id: &str) -> Option<PromptOutcome> {
    history
        .get(prompt_id)
        .and_then(HistoryEntry::from_value)
        .map(|entry| entry.classify())
}

/// Filenames of every image listed under `outputs.<node>.images`.
pub fn image_filenames(outputs: &Map<String, Value>) -> Vec<String> {
    outputs
        .values()
        .filter_map(|node| node.get("images").and_then(Value::as_array))
        .flatten()
        .filter_map(|img| img.get("filename").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
