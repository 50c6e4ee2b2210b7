//! End-to-end task flows against a fake ComfyUI install.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use comfybridge_core::roles::RoleFlags;
use comfybridge_plugin::config::BridgeConfig;
use comfybridge_plugin::lifecycle::{drive_task, TaskOutcome};
use tokio_util::sync::CancellationToken;

use common::{orchestrator, orchestrator_with_config, FakeProbe, FakeWorker, Install, RecordingHost};

fn plain() -> RoleFlags {
    RoleFlags::default()
}

// ---- Test: plain task launches, completes, and reports once ----

/// A plain task with nothing listening launches on the GPU base port,
/// completes its single prompt through the history API, and reports
/// completion exactly once.
#[tokio::test]
async fn plain_task_launches_and_completes() {
    let install = Install::new();
    let worker = FakeWorker::new();
    worker.complete("prompt-0");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let task = orchestrator(&install, install.settings(plain(), false), 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(host.completes(), 1);
    assert!(host.failures().is_empty());
    assert_eq!(host.last_progress(), Some(100.0));

    let commands = worker.launched_commands();
    assert_eq!(commands.len(), 1);
    let args = &commands[0].args;
    assert!(args.windows(2).any(|w| w == ["--port", "8188"]));
    assert!(args.windows(2).any(|w| w == ["--cuda-device", "0"]));
    assert!(!args.iter().any(|a| a == "--listen"));
    assert!(!args.iter().any(|a| a == "--output-directory"));

    assert!(worker
        .launch_env()
        .contains(&("DEADLINE_TASK_ID".to_string(), "7".to_string())));
    assert!(install.dir.path().join("ComfyUI").join("output").is_dir());
    assert_eq!(worker.submitted().len(), 1);
}

// ---- Test: reuse of a running instance ----

/// When the base port already answers, a plain task adopts that
/// instance instead of launching one.
#[tokio::test]
async fn plain_task_reuses_running_instance() {
    let install = Install::new();
    let worker = FakeWorker::new();
    worker.complete("prompt-0");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let task = orchestrator(&install, install.settings(plain(), false), 1, &worker, FakeProbe::busy([8188]), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert!(worker.launched_commands().is_empty());
    assert_eq!(worker.connections()[0].port, 8188);
    assert!(worker.connections()[0].is_reused());
    assert_eq!(host.completes(), 1);
}

// ---- Test: readiness probe claims submission without a banner ----

/// A process that never prints the server banner is still picked up by
/// the readiness probe.
#[tokio::test]
async fn readiness_probe_claims_without_banner() {
    let install = Install::new();
    let worker = FakeWorker::default();
    worker.complete("prompt-0");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let task = orchestrator(&install, install.settings(plain(), false), 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(worker.submitted().len(), 1);
}

// ---- Test: startup time counts against the task timeout ----

/// A slow startup leaves only the rest of the budget for polling, so a
/// prompt that never finishes fails about one timeout after the start.
#[tokio::test]
async fn slow_startup_shortens_the_poll_budget() {
    let install = Install::new();
    let worker = FakeWorker::default();
    worker.answer_first_after(Duration::from_millis(250));
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();
    let config = BridgeConfig {
        timeout: Duration::from_millis(400),
        ..install.config()
    };

    let task = orchestrator_with_config(config, install.settings(plain(), false), 1, &worker, FakeProbe::default(), &host, &running);
    let start = std::time::Instant::now();
    let outcome = drive_task(&task, host.as_ref()).await;
    let elapsed = start.elapsed();

    assert_matches!(outcome, TaskOutcome::Failed(reason) if reason.contains("Timeout"));
    assert_eq!(worker.submitted().len(), 1);
    assert_eq!(host.failures().len(), 1);
    assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
}

// ---- Test: worker role port and completion ----

/// Worker-only tasks always launch on `base + 100 + task_id`, listen
/// externally, and still report completion exactly once.
#[tokio::test]
async fn worker_role_uses_offset_port_and_reports_once() {
    let install = Install::new();
    let worker = FakeWorker::new();
    worker.complete("prompt-0");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let roles = RoleFlags::new(true, false, false);
    let task = orchestrator(&install, install.settings(roles, false), 1, &worker, FakeProbe::busy([8188]), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(host.completes(), 1);
    let args = &worker.launched_commands()[0].args;
    assert!(args.windows(2).any(|w| w == ["--port", "8295"]));
    assert!(args.iter().any(|a| a == "--listen"));
}

// ---- Test: distributed worker keeps the slot alive ----

/// With worker and distributed both set, completion is never reported;
/// the task stays alive until stopped.
#[tokio::test]
async fn distributed_worker_never_reports_completion() {
    let install = Install::new();
    let worker = FakeWorker::new();
    worker.complete("prompt-0");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let stopper = {
        let host = Arc::clone(&host);
        let running = running.clone();
        tokio::spawn(async move {
            while !host.has_status("Distributed worker ready") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.cancel();
        })
    };

    let roles = RoleFlags::new(true, true, false);
    let task = orchestrator(&install, install.settings(roles, false), 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;
    stopper.await.unwrap();

    assert_eq!(outcome, TaskOutcome::KeptAlive);
    assert_eq!(host.completes(), 0);
    assert!(host.failures().is_empty());
}

// ---- Test: single-prompt error fails the task ----

/// An errored prompt in a one-prompt chunk fails the task once with the
/// worker's message.
#[tokio::test]
async fn single_prompt_error_fails_task() {
    let install = Install::new();
    let worker = FakeWorker::new();
    worker.error("prompt-0", "CUDA out of memory");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let task = orchestrator(&install, install.settings(plain(), false), 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_matches!(outcome, TaskOutcome::Failed(reason) if reason.contains("CUDA out of memory"));
    assert_eq!(host.failures().len(), 1);
    assert_eq!(host.completes(), 0);
}

// ---- Test: batch chunk completed across both channels ----

/// In batch mode a three-prompt chunk finishes when one prompt is seen
/// on the log stream and the other two through history.
#[tokio::test]
async fn batch_chunk_completes_across_channels() {
    let install = Install::new();
    let worker = FakeWorker::new();
    worker.print_before_first_poll("Prompt executed in 1.50 seconds");
    worker.complete("prompt-1");
    worker.complete("prompt-2");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let task = orchestrator(&install, install.settings(plain(), true), 3, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(worker.submitted().len(), 3);
    assert_eq!(host.completes(), 1);
    assert_eq!(host.last_progress(), Some(100.0));

    let progress = host.progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");
}

// ---- Test: setup failures ----

/// A missing `ComfyUI/main.py` fails the task before anything is queued.
#[tokio::test]
async fn missing_main_script_fails_setup() {
    let install = Install::without_main_script();
    let worker = FakeWorker::new();
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let task = orchestrator(&install, install.settings(plain(), false), 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_matches!(outcome, TaskOutcome::Failed(reason) if reason.contains("main.py not found"));
    assert!(worker.submitted().is_empty());
    assert_eq!(host.failures().len(), 1);
}

/// A task without a workflow file fails with a setup error.
#[tokio::test]
async fn missing_workflow_setting_fails_setup() {
    let install = Install::new();
    let worker = FakeWorker::new();
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let mut settings = install.settings(plain(), false);
    settings.workflow_file = None;
    let task = orchestrator(&install, settings, 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_matches!(outcome, TaskOutcome::Failed(reason) if reason.contains("No workflow file specified"));
    assert!(worker.launched_commands().is_empty());
}

/// The worker rejecting the first prompt fails the task with the
/// queueing error.
#[tokio::test]
async fn rejected_first_prompt_fails_task() {
    let install = Install::new();
    let worker = FakeWorker::new();
    worker.reject_from(0);
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let task = orchestrator(&install, install.settings(plain(), false), 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_matches!(outcome, TaskOutcome::Failed(reason) if reason.starts_with("Error queuing prompt"));
    assert_eq!(host.failures().len(), 1);
}

// ---- Test: custom output directory ----

/// A job output directory is created and passed to the launched
/// instance.
#[tokio::test]
async fn custom_output_directory_is_created_and_passed() {
    let install = Install::new();
    let out = install.dir.path().join("renders").join("shot_010");
    let worker = FakeWorker::new();
    worker.complete("prompt-0");
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let mut settings = install.settings(plain(), false);
    settings.job_output_directory = Some(out.clone());
    let task = orchestrator(&install, settings, 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert!(out.is_dir());
    let args = &worker.launched_commands()[0].args;
    let expected = out.display().to_string();
    assert!(args.windows(2).any(|w| w[0] == "--output-directory" && w[1] == expected));
}

// ---- Test: stop while monitoring ----

/// Stopping the task while prompts are still pending ends it without
/// reporting failure or completion.
#[tokio::test]
async fn stop_during_monitoring_is_not_a_failure() {
    let install = Install::new();
    let worker = FakeWorker::new();
    let host = Arc::new(RecordingHost::default());
    let running = CancellationToken::new();

    let stopper = {
        let worker = worker.clone();
        let running = running.clone();
        tokio::spawn(async move {
            while worker.submitted().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            running.cancel();
        })
    };

    let task = orchestrator(&install, install.settings(plain(), false), 1, &worker, FakeProbe::default(), &host, &running);
    let outcome = drive_task(&task, host.as_ref()).await;
    stopper.await.unwrap();

    assert_eq!(outcome, TaskOutcome::Stopped);
    assert!(host.failures().is_empty());
    assert_eq!(host.completes(), 0);
}
