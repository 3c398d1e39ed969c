//! Agent controller tests

mod common;

use std::sync::Arc;

use common::{harness, harness_with_health, FakeHealth, FakeLifecycle, FakeVersionSource};
use iotagent::app::controller::UpdateOutcome;
use iotagent::deploy::fsm::{UpdatePhase, UpdateTrigger};
use iotagent::http::backend::{LogSeverity, LogType};
use iotagent::models::command::Command;
use iotagent::models::identity::ImageRef;
use iotagent::workers::scheduler::{ScheduledTask, TaskRunner};
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

fn pulls(calls: &[String]) -> usize {
    calls.iter().filter(|call| call.starts_with("pull")).count()
}

#[tokio::test]
async fn test_newer_version_is_deployed() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.2"),
        FakeVersionSource::tag("v1.5"),
    );

    let outcome = h.controller.request_update(UpdateTrigger::Scheduled).await.unwrap();

    let job = match outcome {
        UpdateOutcome::Completed(job) => job,
        other => panic!("expected a completed job, got {:?}", other),
    };
    assert_eq!(job.target_image.to_string(), "team/app:v1.5");
    assert_eq!(job.trigger, UpdateTrigger::Scheduled);
    assert_eq!(job.phase(), UpdatePhase::Succeeded);
    assert_eq!(h.lifecycle.image(), Some(ImageRef::parse("team/app:v1.5")));
    assert!(!h.controller.update_in_progress());
}

#[tokio::test]
async fn test_up_to_date_creates_no_job() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.5"),
        FakeVersionSource::tag("v1.5"),
    );

    let outcome = h.controller.request_update(UpdateTrigger::Scheduled).await.unwrap();

    let decision = match outcome {
        UpdateOutcome::UpToDate(decision) => decision,
        other => panic!("expected up to date, got {:?}", other),
    };
    assert_eq!(decision.current_tag, "v1.5");
    assert_eq!(decision.latest_tag, "v1.5");
    assert!(decision.target.is_none());
    assert_eq!(pulls(&h.lifecycle.calls()), 0);
    assert!(h.controller.status().await.last_job.is_none());
}

#[tokio::test]
async fn test_lookup_failure_never_updates() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.2"),
        FakeVersionSource::unreachable(),
    );

    let outcome = h.controller.request_update(UpdateTrigger::Scheduled).await.unwrap();

    let decision = match outcome {
        UpdateOutcome::UpToDate(decision) => decision,
        other => panic!("expected up to date, got {:?}", other),
    };
    assert_eq!(decision.latest_tag, "v1.0");
    assert_eq!(pulls(&h.lifecycle.calls()), 0);
}

#[tokio::test]
async fn test_lookup_failure_leaves_unversioned_tag_alone() {
    let h = harness(
        FakeLifecycle::running("team/app:latest"),
        FakeVersionSource::unreachable(),
    );

    let outcome = h.controller.request_update(UpdateTrigger::Scheduled).await.unwrap();

    let decision = match outcome {
        UpdateOutcome::UpToDate(decision) => decision,
        other => panic!("expected up to date, got {:?}", other),
    };
    assert_eq!(decision.current_tag, "latest");
    assert_eq!(decision.latest_tag, "v1.0");
    assert!(decision.target.is_none());
    assert_eq!(h.lifecycle.calls(), vec!["current_image"]);
    assert!(h.controller.status().await.last_job.is_none());
}

#[tokio::test]
async fn test_untagged_image_counts_as_sentinel() {
    let h = harness(
        FakeLifecycle::running("team/app"),
        FakeVersionSource::tag("v1.1"),
    );

    let outcome = h.controller.request_update(UpdateTrigger::Scheduled).await.unwrap();

    let job = match outcome {
        UpdateOutcome::Completed(job) => job,
        other => panic!("expected a completed job, got {:?}", other),
    };
    assert_eq!(job.target_image.tag.as_deref(), Some("v1.1"));
}

#[tokio::test]
async fn test_runtime_unavailable_is_an_error() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.2").failing("current_image"),
        FakeVersionSource::tag("v1.5"),
    );

    assert_err!(h.controller.request_update(UpdateTrigger::Scheduled).await);
    assert!(!h.controller.update_in_progress());
    assert_eq!(pulls(&h.lifecycle.calls()), 0);

    // Scheduled checks report the failure and count it against the loop
    assert_err!(h.controller.run_task(ScheduledTask::UpdateCheck).await);
    let last = h.backend.logs().pop().unwrap();
    assert_eq!(last.level, LogSeverity::Error);
    assert_eq!(last.log_type, LogType::Rollback);
    assert!(last.message.starts_with("Error during version check/update"));
}

#[tokio::test]
async fn test_concurrent_update_is_rejected() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        FakeLifecycle::running("team/app:v1.2").with_pull_gate(gate.clone()),
        FakeVersionSource::tag("v1.5"),
    );

    let controller = h.controller.clone();
    let first = tokio::spawn(async move { controller.request_update(UpdateTrigger::Scheduled).await });

    // Wait until the first job is parked inside pull
    h.lifecycle.pull_started.notified().await;
    assert!(h.controller.update_in_progress());

    let second = h.controller.request_update(UpdateTrigger::Command).await.unwrap();
    assert!(matches!(second, UpdateOutcome::Rejected));

    let manual = h
        .controller
        .deploy(UpdateTrigger::Manual, ImageRef::parse("team/app:v1.3"))
        .await;
    assert!(matches!(manual, UpdateOutcome::Rejected));

    let current = h.controller.status().await.current_job.unwrap();
    assert_eq!(current.phase(), UpdatePhase::Pulling);

    gate.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, UpdateOutcome::Completed(ref job) if job.phase() == UpdatePhase::Succeeded));

    // Exactly one job ran
    assert_eq!(pulls(&h.lifecycle.calls()), 1);
    let started = h
        .backend
        .logs()
        .iter()
        .filter(|log| log.message.starts_with("Updating to"))
        .count();
    assert_eq!(started, 1);
    assert!(!h.controller.update_in_progress());
}

#[tokio::test]
async fn test_explicit_deploy() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.5"),
        FakeVersionSource::tag("v1.5"),
    );

    let target = h.controller.identity().image.with_tag("v1.3");
    let outcome = h.controller.deploy(UpdateTrigger::Manual, target).await;

    let job = match outcome {
        UpdateOutcome::Completed(job) => job,
        other => panic!("expected a completed job, got {:?}", other),
    };
    assert_eq!(job.phase(), UpdatePhase::Succeeded);
    assert_eq!(h.lifecycle.image(), Some(ImageRef::parse("team/app:v1.3")));
}

#[tokio::test]
async fn test_heartbeat_reports_running_image() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.2"),
        FakeVersionSource::tag("v1.2"),
    );

    assert_ok!(h.controller.heartbeat().await);
    assert_eq!(
        h.backend.heartbeats(),
        vec![("team/app:v1.2".to_string(), "online".to_string())]
    );
}

#[tokio::test]
async fn test_heartbeat_falls_back_to_configured_image() {
    let h = harness(FakeLifecycle::absent(), FakeVersionSource::tag("v1.2"));

    assert_ok!(h.controller.run_task(ScheduledTask::Heartbeat).await);
    assert_eq!(h.backend.heartbeats()[0].0, "team/app:v1.0");
}

#[tokio::test]
async fn test_health_report_sends_summary_and_alerts() {
    let h = harness_with_health(
        FakeLifecycle::running("team/app:v1.2"),
        FakeVersionSource::tag("v1.2"),
        FakeHealth::usage(95.0, 40.0, 91.0),
    );

    assert_ok!(h.controller.run_task(ScheduledTask::Monitor).await);

    let logs = h.backend.logs();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].level, LogSeverity::Info);
    assert!(logs[0].message.starts_with("System health: warning"));
    assert_eq!(logs[1].message, "High CPU usage: 95.0%");
    assert_eq!(logs[1].level, LogSeverity::Warning);
    assert_eq!(logs[2].message, "High disk usage: 91.0%");
    assert!(logs.iter().all(|log| log.log_type == LogType::General));
}

#[tokio::test]
async fn test_health_failure_is_soft() {
    let h = harness_with_health(
        FakeLifecycle::running("team/app:v1.2"),
        FakeVersionSource::tag("v1.2"),
        FakeHealth::failing("sensor offline"),
    );

    assert_ok!(h.controller.run_task(ScheduledTask::Monitor).await);

    let logs = h.backend.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogSeverity::Error);
    assert_eq!(logs[0].message, "System monitoring error: sensor offline");
}

#[tokio::test]
async fn test_status_aggregate() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.2"),
        FakeVersionSource::tag("v1.2"),
    );

    let status = h.controller.status().await;
    assert!(status.agent_running);
    assert_eq!(status.agent_version, "0.1.0");
    assert_eq!(status.config.device_id, 7);
    assert_eq!(status.config.image, "team/app:v1.0");
    assert_eq!(status.container_status["status"], "running");
    assert_eq!(status.container_status["image"]["tag"], "v1.2");
    assert_eq!(status.system_health["status"], "healthy");
    assert!(status.current_job.is_none());
    assert!(status.last_job.is_none());
}

#[tokio::test]
async fn test_status_embeds_collection_errors() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.2").failing("status"),
        FakeVersionSource::tag("v1.2"),
    );

    let status = h.controller.status().await;
    assert!(status.container_status["error"]
        .as_str()
        .unwrap()
        .contains("status failed"));
}

#[tokio::test]
async fn test_commands() {
    let h = harness(
        FakeLifecycle::running("team/app:v1.2"),
        FakeVersionSource::tag("v1.4"),
    );

    let reply = h.controller.handle_command(Command::Status).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["agent_running"], true);
    assert_eq!(value["config"]["device_name"], "edge-01");

    assert!(h
        .controller
        .handle_command(Command::Unknown("reboot".to_string()))
        .await
        .is_none());

    assert!(h.controller.handle_command(Command::Update).await.is_none());
    assert_eq!(h.lifecycle.image(), Some(ImageRef::parse("team/app:v1.4")));
    let last_job = h.controller.status().await.last_job.unwrap();
    assert_eq!(last_job.trigger, UpdateTrigger::Command);

    assert!(!h.stop.is_requested());
    assert!(h.controller.handle_command(Command::Restart).await.is_none());
    assert!(h.stop.is_requested());
    assert!(h.controller.stop_requested());
    assert!(!h.controller.status().await.agent_running);
}
