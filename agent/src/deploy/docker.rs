//! Docker CLI lifecycle implementation

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::deploy::lifecycle::ContainerLifecycle;
use crate::errors::AgentError;
use crate::models::container::{ContainerState, ContainerStatus};
use crate::models::identity::{DeviceIdentity, ImageRef};

/// Docker runtime options
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Runtime command line, split on whitespace (`docker`, `sudo docker`,
    /// `podman`)
    pub command: String,

    /// Grace period handed to `docker stop -t`
    pub stop_timeout: Duration,

    /// Upper bound for every other runtime call
    pub command_timeout: Duration,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            command: "docker".to_string(),
            stop_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
        }
    }
}

/// How a failed runtime command failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The workload container does not exist
    NotFound,

    /// The runtime daemon could not be reached
    Unreachable,

    Other,
}

/// Classify a runtime error message
pub fn classify_failure(stderr: &str) -> FailureKind {
    let stderr = stderr.to_lowercase();
    if stderr.contains("no such container") || stderr.contains("no such object") {
        FailureKind::NotFound
    } else if stderr.contains("cannot connect to the docker daemon")
        || stderr.contains("is the docker daemon running")
        || stderr.contains("permission denied while trying to connect")
    {
        FailureKind::Unreachable
    } else {
        FailureKind::Other
    }
}

#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Lifecycle manager driving the `docker` command line
pub struct DockerLifecycle {
    options: DockerOptions,
    container_name: String,
    base_env: BTreeMap<String, String>,
}

impl DockerLifecycle {
    pub fn new(options: DockerOptions, identity: &DeviceIdentity) -> Self {
        let mut base_env = BTreeMap::new();
        base_env.insert("DEVICE_ID".to_string(), identity.device_id.to_string());
        base_env.insert("DEVICE_NAME".to_string(), identity.device_name.clone());
        base_env.insert("BACKEND_URL".to_string(), identity.backend_url.clone());

        Self {
            options,
            container_name: identity.container_name.clone(),
            base_env,
        }
    }

    /// Environment passed to `docker run`: the base set overlaid by `env`
    pub fn merged_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.base_env.clone();
        merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    async fn exec(&self, args: &[String], bound: Duration) -> Result<CommandOutput, AgentError> {
        let mut parts = self.options.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| AgentError::ConfigError("Runtime command is empty".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let verb = args.first().map(String::as_str).unwrap_or_default();
        debug!("Running {} {}", program, args.join(" "));

        match tokio::time::timeout(bound, command.output()).await {
            Err(_) => Err(AgentError::Timeout(format!(
                "{} {} did not finish within {:?}",
                program, verb, bound
            ))),
            Ok(Err(e)) => Err(AgentError::RuntimeUnavailable(format!(
                "Failed to run {}: {}",
                program, e
            ))),
            Ok(Ok(output)) => Ok(CommandOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    /// Turn a failed command into an error. `NotFound` is reported as `Ok(false)`
    /// so callers can decide whether absence counts as success.
    fn check(&self, verb: &str, output: &CommandOutput) -> Result<bool, AgentError> {
        if output.success {
            return Ok(true);
        }
        match classify_failure(&output.stderr) {
            FailureKind::NotFound => Ok(false),
            FailureKind::Unreachable => Err(AgentError::RuntimeUnavailable(output.stderr.clone())),
            FailureKind::Other => Err(AgentError::RuntimeError(format!(
                "docker {} failed: {}",
                verb, output.stderr
            ))),
        }
    }
}

#[async_trait]
impl ContainerLifecycle for DockerLifecycle {
    fn container_name(&self) -> &str {
        &self.container_name
    }

    async fn current_image(&self) -> Result<Option<ImageRef>, AgentError> {
        let state = self.status().await?;
        Ok(state.image)
    }

    async fn pull(&self, image: &ImageRef) -> Result<(), AgentError> {
        info!("Pulling image: {}", image);
        let args = vec!["pull".to_string(), image.to_string()];
        let output = self.exec(&args, self.options.command_timeout).await?;
        if !output.success {
            error!("Failed to pull image {}: {}", image, output.stderr);
            return Err(match classify_failure(&output.stderr) {
                FailureKind::Unreachable => AgentError::RuntimeUnavailable(output.stderr),
                _ => AgentError::RuntimeError(format!("docker pull failed for {}: {}", image, output.stderr)),
            });
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        info!("Stopping container: {}", self.container_name);
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.options.stop_timeout.as_secs().to_string(),
            self.container_name.clone(),
        ];
        // The runtime kills the container after the grace period; allow some
        // slack on top before giving up on the command itself.
        let bound = self.options.stop_timeout + Duration::from_secs(15);
        let output = self.exec(&args, bound).await?;
        if self.check("stop", &output)? {
            info!("Container stopped successfully");
        } else {
            info!("Container {} not found, nothing to stop", self.container_name);
        }
        Ok(())
    }

    async fn remove(&self) -> Result<(), AgentError> {
        info!("Removing container: {}", self.container_name);
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            self.container_name.clone(),
        ];
        let output = self.exec(&args, self.options.command_timeout).await?;
        if self.check("rm", &output)? {
            info!("Container removed successfully");
        } else {
            info!("Container {} not found, nothing to remove", self.container_name);
        }
        Ok(())
    }

    async fn run(&self, image: &ImageRef, env: &BTreeMap<String, String>) -> Result<(), AgentError> {
        info!("Starting new container {} from {}", self.container_name, image);
        let args = run_args(&self.container_name, image, &self.merged_env(env));
        let output = self.exec(&args, self.options.command_timeout).await?;
        if !output.success {
            error!("Failed to start container: {}", output.stderr);
            return Err(match classify_failure(&output.stderr) {
                FailureKind::Unreachable => AgentError::RuntimeUnavailable(output.stderr),
                _ => AgentError::RuntimeError(format!("docker run failed for {}: {}", image, output.stderr)),
            });
        }
        let id: String = output.stdout.trim().chars().take(12).collect();
        info!("Container started successfully with ID: {}", id);
        Ok(())
    }

    async fn status(&self) -> Result<ContainerState, AgentError> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            self.container_name.clone(),
        ];
        let output = self.exec(&args, self.options.command_timeout).await?;
        if !self.check("inspect", &output)? {
            return Ok(ContainerState::absent());
        }
        parse_inspect(&output.stdout)
    }
}

/// Arguments for `docker run`
pub fn run_args(name: &str, image: &ImageRef, env: &BTreeMap<String, String>) -> Vec<String> {
    let mut args: Vec<String> = [
        "run", "-d", "--name", name, "--restart", "always", "--network", "host",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(image.to_string());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspect {
    state: InspectState,
    config: InspectConfig,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<InspectPortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

/// Parse the output of `docker inspect --format '{{json .}}'`
pub fn parse_inspect(json: &str) -> Result<ContainerState, AgentError> {
    let inspect: Inspect = serde_json::from_str(json.trim())?;

    // Containers created from a bare image ID carry no usable reference
    let image = Some(inspect.config.image.trim())
        .filter(|image| !image.is_empty() && !image.starts_with("sha256:"))
        .map(ImageRef::parse);

    let created_at = inspect
        .created
        .as_deref()
        .and_then(|created| DateTime::parse_from_rfc3339(created).ok())
        .map(|created| created.with_timezone(&Utc));

    let mut ports = Vec::new();
    let published = inspect.network_settings.and_then(|settings| settings.ports);
    for (container_port, bindings) in published.unwrap_or_default() {
        for binding in bindings.unwrap_or_default() {
            if binding.host_ip.is_empty() {
                ports.push(format!("{}->{}", binding.host_port, container_port));
            } else {
                ports.push(format!(
                    "{}:{}->{}",
                    binding.host_ip, binding.host_port, container_port
                ));
            }
        }
    }

    Ok(ContainerState {
        status: ContainerStatus::from_runtime(&inspect.state.status),
        image,
        created_at,
        ports,
    })
}
