//! Plugin-info settings and host-level configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use comfybridge_core::error::TaskError;
use comfybridge_core::ports::DEFAULT_PORT;
use comfybridge_core::roles::RoleFlags;
use comfybridge_core::seed::{SeedPlan, SeedPolicy};
use comfybridge_core::types::{TaskContext, TaskId};

/// Values accepted as `true` for boolean settings and env flags.
const TRUTHY: [&str; 3] = ["1", "true", "yes"];

pub fn parse_bool(value: &str) -> Option<bool> {
    let value = value.trim().to_ascii_lowercase();
    if TRUTHY.contains(&value.as_str()) {
        Some(true)
    } else if ["0", "false", "no", ""].contains(&value.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}'")]
    Invalid { key: String, value: String },
}

// ---------------------------------------------------------------------------
// Plugin info store
// ---------------------------------------------------------------------------

/// Per-job key/value settings handed over by the farm.
#[derive(Debug, Clone, Default)]
pub struct PluginInfo {
    entries: HashMap<String, String>,
}

impl PluginInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), value.into());
    }

    /// Collect `PLUGIN_INFO_<Key>` variables, e.g. `PLUGIN_INFO_SeedMode`.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let entries = vars
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix("PLUGIN_INFO_").map(|key| (key.to_string(), v)))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Trimmed, non-empty value.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    /// `None` when the entry is absent or not a boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        let raw = self.get(key)?;
        let parsed = parse_bool(raw);
        if parsed.is_none() {
            tracing::warn!(key, value = raw, "Ignoring non-boolean plugin info entry");
        }
        parsed
    }

    pub fn get_bool_with_default(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }
}

// ---------------------------------------------------------------------------
// Task settings
// ---------------------------------------------------------------------------

/// Farm-side facts about where the task runs.
#[derive(Debug, Clone, Default)]
pub struct WorkerSlot {
    pub worker_name: String,
    pub thread_number: u32,
    /// GPU ids the farm pinned this worker to; empty when not overridden.
    pub gpu_affinity: Vec<u32>,
}

/// Settings resolved from [`PluginInfo`] for one task.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub roles: RoleFlags,
    pub batch_mode: bool,
    pub seed_policy: SeedPolicy,
    pub base_port: u16,
    pub gpu_index: Option<u32>,
    /// User-specified output directory (`JobOutputDirectory`).
    pub job_output_directory: Option<PathBuf>,
    pub python_no_user_site: bool,
    pub workflow_file: Option<PathBuf>,
}

impl TaskSettings {
    /// Resolve settings. Role flags fall back to `env` lookups only when
    /// none of the three plugin-info flags is set.
    pub fn resolve(
        info: &PluginInfo,
        slot: &WorkerSlot,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let roles = resolve_roles(info, env);
        tracing::info!(
            worker = roles.worker,
            distributed = roles.distributed,
            force_new = roles.force_new,
            "Distributed config",
        );

        let base_port = match info.get_non_empty("ComfyUIPort") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "ComfyUIPort".into(),
                value: raw.into(),
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            roles,
            batch_mode: info.get_bool_with_default("BatchMode", false),
            seed_policy: SeedPolicy::from_setting(info.get_non_empty("SeedMode").unwrap_or("fixed")),
            base_port,
            gpu_index: select_gpu(info, slot),
            job_output_directory: info.get_non_empty("JobOutputDirectory").map(PathBuf::from),
            python_no_user_site: info.get_bool_with_default("PythonNoUserSite", true),
            workflow_file: workflow_file(info, roles),
        })
    }

    /// Prompts in this task's chunk: the farm chunk size in batch mode,
    /// otherwise one.
    pub fn effective_chunk_size(&self, farm_chunk_size: u32) -> u32 {
        if self.batch_mode {
            farm_chunk_size.max(1)
        } else {
            1
        }
    }

    pub fn seed_plan(&self) -> SeedPlan {
        SeedPlan::new(self.seed_policy, self.batch_mode)
    }

    /// Build the task identity from the farm assignment.
    pub fn task_context(
        &self,
        job_id: &str,
        task_id: TaskId,
        farm_chunk_size: u32,
    ) -> Result<TaskContext, TaskError> {
        let chunk_size = self.effective_chunk_size(farm_chunk_size);
        if self.batch_mode {
            tracing::info!(chunk_size, "Batch mode enabled");
        } else {
            tracing::info!("Batch mode disabled, processing single prompt");
        }
        TaskContext::new(job_id, task_id, chunk_size, self.gpu_index, self.roles)
    }
}

fn resolve_roles(info: &PluginInfo, env: impl Fn(&str) -> Option<String>) -> RoleFlags {
    let roles = RoleFlags::new(
        info.get_bool_with_default("WorkerMode", false),
        info.get_bool_with_default("DistributedMode", false),
        info.get_bool_with_default("ForceNewInstance", false),
    );
    if !roles.is_plain() {
        return roles;
    }

    let flag = |key: &str| env(key).and_then(|v| parse_bool(&v)).unwrap_or(false);
    let from_env = RoleFlags::new(
        flag("COMFY_WORKER_MODE"),
        flag("DEADLINE_DIST_MODE"),
        flag("COMFY_FORCE_NEW_INSTANCE"),
    );
    if !from_env.is_plain() {
        tracing::warn!("Using environment variables for distributed config. Consider updating to plugin info entries");
    }
    from_env
}

/// GPU for the task: `CudaDeviceID`, then the farm affinity list indexed
/// by thread number, then device 0 when `DefaultCudaDeviceZero` holds.
pub fn select_gpu(info: &PluginInfo, slot: &WorkerSlot) -> Option<u32> {
    if let Some(raw) = info.get_non_empty("CudaDeviceID") {
        match raw.parse::<u32>() {
            Ok(gpu) => {
                tracing::info!(gpu, "Using specific CUDA device ID from plugin info");
                return Some(gpu);
            }
            Err(_) => tracing::warn!(value = raw, "Invalid CudaDeviceID in plugin info, ignoring"),
        }
    }

    if !slot.gpu_affinity.is_empty() {
        let idx = slot.thread_number as usize % slot.gpu_affinity.len();
        let gpu = slot.gpu_affinity[idx];
        tracing::info!(gpu, affinity = ?slot.gpu_affinity, "Assigning CUDA device from worker affinity");
        return Some(gpu);
    }

    if info.get_bool_with_default("DefaultCudaDeviceZero", true) {
        tracing::info!("No CUDA device assigned, defaulting to device 0");
        Some(0)
    } else {
        tracing::info!("No CUDA device assigned, ComfyUI will use its default GPU");
        None
    }
}

fn workflow_file(info: &PluginInfo, roles: RoleFlags) -> Option<PathBuf> {
    let path = if roles.uses_worker_port() {
        info.get_non_empty("WorkflowFile")
            .or_else(|| info.get_non_empty("ComfyWorkflowFile"))
    } else {
        info.get_non_empty("ComfyWorkflowFile")
    };
    path.map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Host configuration
// ---------------------------------------------------------------------------

/// Host-level configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// ComfyUI install root, containing `ComfyUI/main.py`.
    pub comfyui_path: PathBuf,
    /// Output directory used when the job does not specify one.
    pub default_output_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub submit_delay: Duration,
    /// Wait before post-task output verification.
    pub settle_delay: Duration,
    pub keepalive_interval: Duration,
}

impl BridgeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default      |
    /// |--------------------------------|--------------|
    /// | `COMFYUI_PATH`                 | (required)   |
    /// | `COMFYUI_DEFAULT_OUTPUT_DIR`   | unset        |
    /// | `FARM_POLL_INTERVAL_SECS`      | `10`         |
    /// | `FARM_TIMEOUT_SECS`            | `6000`       |
    /// | `FARM_SUBMIT_DELAY_MS`         | `500`        |
    /// | `FARM_SETTLE_DELAY_SECS`       | `2`          |
    /// | `FARM_KEEPALIVE_INTERVAL_SECS` | `300`        |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let comfyui_path = env("COMFYUI_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("COMFYUI_PATH"))?;

        let number = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match env(key) {
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value: raw,
                }),
                None => Ok(default),
            }
        };

        Ok(Self {
            comfyui_path,
            default_output_dir: env("COMFYUI_DEFAULT_OUTPUT_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            poll_interval: Duration::from_secs(number("FARM_POLL_INTERVAL_SECS", 10)?),
            timeout: Duration::from_secs(number("FARM_TIMEOUT_SECS", 6000)?),
            submit_delay: Duration::from_millis(number("FARM_SUBMIT_DELAY_MS", 500)?),
            settle_delay: Duration::from_secs(number("FARM_SETTLE_DELAY_SECS", 2)?),
            keepalive_interval: Duration::from_secs(number("FARM_KEEPALIVE_INTERVAL_SECS", 300)?),
        })
    }
}
