//! Docker lifecycle tests against a scripted stand-in for the runtime CLI
#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use iotagent::deploy::docker::{DockerLifecycle, DockerOptions};
use iotagent::deploy::lifecycle::ContainerLifecycle;
use iotagent::errors::AgentError;
use iotagent::models::container::ContainerStatus;
use iotagent::models::identity::ImageRef;
use tempfile::TempDir;

const NOT_FOUND: &str = r#"echo "Error response from daemon: No such container: app" >&2; exit 1"#;

const INSPECT_RUNNING: &str = r#"cat <<'JSON'
{"Created":"2024-05-01T10:00:00.5Z","State":{"Status":"running"},"Config":{"Image":"team/app:v1.2"},"NetworkSettings":{"Ports":{"80/tcp":[{"HostIp":"0.0.0.0","HostPort":"8080"}]}}}
JSON"#;

struct FakeRuntime {
    dir: TempDir,
}

impl FakeRuntime {
    /// A runtime whose subcommands run the given shell snippets. Every
    /// invocation is appended to `calls.log`; unlisted subcommands succeed.
    fn new(handlers: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");

        let mut script = format!("#!/bin/sh\necho \"$@\" >> \"{}\"\ncase \"$1\" in\n", log.display());
        for (verb, body) in handlers {
            script.push_str(&format!("  {})\n{}\n;;\n", verb, body));
        }
        script.push_str("esac\nexit 0\n");

        std::fs::write(dir.path().join("docker.sh"), script).unwrap();
        Self { dir }
    }

    fn script(&self) -> PathBuf {
        self.dir.path().join("docker.sh")
    }

    fn lifecycle(&self) -> DockerLifecycle {
        lifecycle_for(&format!("sh {}", self.script().display()))
    }

    fn calls(&self) -> Vec<String> {
        read_lines(&self.dir.path().join("calls.log"))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn lifecycle_for(command: &str) -> DockerLifecycle {
    let options = DockerOptions {
        command: command.to_string(),
        stop_timeout: Duration::from_secs(10),
        command_timeout: Duration::from_secs(10),
    };
    DockerLifecycle::new(options, &common::identity())
}

#[tokio::test]
async fn test_absent_container() {
    let runtime = FakeRuntime::new(&[("inspect", NOT_FOUND), ("stop", NOT_FOUND), ("rm", NOT_FOUND)]);
    let lifecycle = runtime.lifecycle();

    let state = lifecycle.status().await.unwrap();
    assert_eq!(state.status, ContainerStatus::Absent);
    assert!(lifecycle.current_image().await.unwrap().is_none());

    // Nothing to stop or remove is still a success
    lifecycle.stop().await.unwrap();
    lifecycle.remove().await.unwrap();

    assert_eq!(
        runtime.calls(),
        vec![
            "inspect --type container --format {{json .}} app",
            "inspect --type container --format {{json .}} app",
            "stop -t 10 app",
            "rm -f app",
        ]
    );
}

#[tokio::test]
async fn test_running_container() {
    let runtime = FakeRuntime::new(&[("inspect", INSPECT_RUNNING)]);
    let lifecycle = runtime.lifecycle();

    let state = lifecycle.status().await.unwrap();
    assert!(state.is_running());
    assert_eq!(state.image, Some(ImageRef::parse("team/app:v1.2")));
    assert_eq!(state.ports, vec!["0.0.0.0:8080->80/tcp"]);
    assert!(state.created_at.is_some());

    assert_eq!(
        lifecycle.current_image().await.unwrap(),
        Some(ImageRef::parse("team/app:v1.2"))
    );
}

#[tokio::test]
async fn test_run_passes_environment() {
    let runtime = FakeRuntime::new(&[("run", "echo 0123456789abcdef0123")]);
    let lifecycle = runtime.lifecycle();

    let mut env = BTreeMap::new();
    env.insert("MODE".to_string(), "prod".to_string());
    env.insert("DEVICE_NAME".to_string(), "renamed".to_string());

    lifecycle
        .run(&ImageRef::parse("team/app:v1.5"), &env)
        .await
        .unwrap();

    assert_eq!(
        runtime.calls(),
        vec![
            "run -d --name app --restart always --network host \
             -e BACKEND_URL=http://backend.local:8000 -e DEVICE_ID=7 \
             -e DEVICE_NAME=renamed -e MODE=prod team/app:v1.5"
        ]
    );
}

#[tokio::test]
async fn test_pull_failure() {
    let runtime = FakeRuntime::new(&[(
        "pull",
        r#"echo "Error response from daemon: manifest for team/app:v9.9 not found" >&2; exit 1"#,
    )]);

    let err = runtime
        .lifecycle()
        .pull(&ImageRef::parse("team/app:v9.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::RuntimeError(ref msg) if msg.contains("manifest")));
}

#[tokio::test]
async fn test_daemon_unreachable() {
    let runtime = FakeRuntime::new(&[(
        "inspect",
        r#"echo "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?" >&2; exit 1"#,
    )]);

    let err = runtime.lifecycle().status().await.unwrap_err();
    assert!(matches!(err, AgentError::RuntimeUnavailable(_)));
}

#[tokio::test]
async fn test_missing_runtime_binary() {
    let lifecycle = lifecycle_for("/nonexistent/bin/docker");

    let err = lifecycle.status().await.unwrap_err();
    assert!(matches!(err, AgentError::RuntimeUnavailable(_)));
}

#[tokio::test]
async fn test_command_timeout() {
    let runtime = FakeRuntime::new(&[("pull", "sleep 5")]);
    let options = DockerOptions {
        command: format!("sh {}", runtime.script().display()),
        stop_timeout: Duration::from_secs(10),
        command_timeout: Duration::from_millis(200),
    };
    let lifecycle = DockerLifecycle::new(options, &common::identity());

    let err = lifecycle
        .pull(&ImageRef::parse("team/app:v1.5"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Timeout(_)));
}
