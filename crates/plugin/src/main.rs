//! `comfybridge-plugin` -- runs one farm task against ComfyUI.
//!
//! The farm starts one process per task. Task identity comes from
//! `FARM_*` variables and job settings from `PLUGIN_INFO_<Key>`
//! variables; host configuration is documented on
//! [`BridgeConfig::from_env`].
//!
//! # Environment variables
//!
//! | Variable             | Required | Default | Description                         |
//! |----------------------|----------|---------|-------------------------------------|
//! | `FARM_JOB_ID`        | yes      | --      | Farm job id                         |
//! | `FARM_TASK_ID`       | yes      | --      | Task index within the job           |
//! | `FARM_CHUNK_SIZE`    | no       | `1`     | Frames per task (used in batch mode)|
//! | `FARM_WORKER_NAME`   | no       | --      | Render node name                    |
//! | `FARM_THREAD_NUMBER` | no       | `0`     | Worker thread on the node           |
//! | `FARM_GPU_AFFINITY`  | no       | --      | Comma-separated GPU ids             |

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use comfybridge_core::ports::{TcpProbe, LOCAL_HOST, PROBE_TIMEOUT};
use comfybridge_plugin::config::{BridgeConfig, PluginInfo, TaskSettings, WorkerSlot};
use comfybridge_plugin::host::LoggingFarmHost;
use comfybridge_plugin::launcher::TokioProcessExecutor;
use comfybridge_plugin::lifecycle::{drive_task, TaskOutcome};
use comfybridge_plugin::orchestrator::{HttpConnector, TaskDeps, TaskOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comfybridge_plugin=info,comfybridge_comfyui=info,comfybridge_core=info,comfyui=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(TaskOutcome::Completed | TaskOutcome::KeptAlive | TaskOutcome::Stopped) => ExitCode::SUCCESS,
        Ok(TaskOutcome::Failed(_)) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("Task could not start: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<TaskOutcome> {
    let config = BridgeConfig::from_env().context("Invalid host configuration")?;

    let job_id = required("FARM_JOB_ID")?;
    let task_id: u32 = required("FARM_TASK_ID")?
        .parse()
        .context("FARM_TASK_ID must be a non-negative integer")?;
    let farm_chunk_size: u32 = optional_number("FARM_CHUNK_SIZE", 1)?;

    let slot = WorkerSlot {
        worker_name: std::env::var("FARM_WORKER_NAME").unwrap_or_default(),
        thread_number: optional_number("FARM_THREAD_NUMBER", 0)?,
        gpu_affinity: gpu_affinity()?,
    };

    let info = PluginInfo::from_vars(std::env::vars());
    let settings = TaskSettings::resolve(&info, &slot, |key| std::env::var(key).ok())
        .context("Invalid plugin info")?;
    let task = settings.task_context(&job_id, task_id, farm_chunk_size)?;

    let running = CancellationToken::new();
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Stop requested, ending task");
                running.cancel();
            }
        });
    }

    let host = Arc::new(LoggingFarmHost);
    let orchestrator = TaskOrchestrator::new(
        config,
        task,
        settings,
        slot.worker_name,
        TaskDeps {
            host: Arc::clone(&host),
            executor: TokioProcessExecutor,
            probe: TcpProbe::new(LOCAL_HOST, PROBE_TIMEOUT),
            connector: HttpConnector::new().context("Could not build the HTTP client")?,
        },
        running,
    );

    Ok(drive_task(&orchestrator, host.as_ref()).await)
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("{key} environment variable is required"))
}

fn optional_number(key: &str, default: u32) -> anyhow::Result<u32> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn gpu_affinity() -> anyhow::Result<Vec<u32>> {
    let Ok(raw) = std::env::var("FARM_GPU_AFFINITY") else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("Invalid GPU id '{s}' in FARM_GPU_AFFINITY")))
        .collect()
}
