//! Agent controller: the single admission point for every intent

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::app::state::{AdmissionGate, StopFlag};
use crate::deploy::fsm::{UpdateJob, UpdatePhase, UpdateTrigger};
use crate::deploy::lifecycle::ContainerLifecycle;
use crate::deploy::orchestrator::{OrchestratorOptions, UpdateOrchestrator};
use crate::deploy::policy::{UpdateDecision, UpdatePolicy, VersionSource};
use crate::errors::AgentError;
use crate::http::backend::{Backend, LogSeverity, LogType};
use crate::models::command::Command;
use crate::models::identity::{DeviceIdentity, ImageRef};
use crate::telemetry::{HealthSource, HealthStatus};
use crate::workers::scheduler::{ScheduledTask, TaskRunner};

/// Status reported in heartbeats
const ONLINE: &str = "online";

/// Everything the controller talks to
pub struct Collaborators {
    pub lifecycle: Arc<dyn ContainerLifecycle>,
    pub backend: Arc<dyn Backend>,
    pub health: Arc<dyn HealthSource>,
    pub versions: Arc<dyn VersionSource>,
}

/// Result of an update request
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Another update holds the gate
    Rejected,

    /// The running version is already the newest
    UpToDate(UpdateDecision),

    /// A job ran to a terminal phase
    Completed(UpdateJob),
}

/// Identity echo in the status document
#[derive(Debug, Clone, Serialize)]
pub struct StatusConfig {
    pub device_name: String,
    pub device_id: u64,
    pub backend_url: String,
    pub image: String,
    pub container_name: String,
}

/// Aggregate agent status. Sub-collection failures are embedded as
/// `{"error": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_running: bool,
    pub agent_version: String,
    pub config: StatusConfig,
    pub container_status: Value,
    pub current_job: Option<UpdateJob>,
    pub last_job: Option<UpdateJob>,
    pub system_health: Value,
}

pub struct AgentController {
    identity: DeviceIdentity,
    agent_version: String,
    lifecycle: Arc<dyn ContainerLifecycle>,
    backend: Arc<dyn Backend>,
    health: Arc<dyn HealthSource>,
    policy: UpdatePolicy,
    orchestrator: UpdateOrchestrator,
    gate: AdmissionGate,
    stop: Arc<StopFlag>,
}

impl AgentController {
    pub fn new(
        identity: DeviceIdentity,
        agent_version: String,
        collaborators: Collaborators,
        orchestrator_options: OrchestratorOptions,
        stop: Arc<StopFlag>,
    ) -> Self {
        let policy = UpdatePolicy::new(
            collaborators.versions,
            collaborators.lifecycle.clone(),
            &identity.image.repository,
        );
        let orchestrator = UpdateOrchestrator::new(
            collaborators.lifecycle.clone(),
            collaborators.backend.clone(),
            orchestrator_options,
        );

        Self {
            identity,
            agent_version,
            lifecycle: collaborators.lifecycle,
            backend: collaborators.backend,
            health: collaborators.health,
            policy,
            orchestrator,
            gate: AdmissionGate::new(),
            stop,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    pub fn stop_flag(&self) -> &Arc<StopFlag> {
        &self.stop
    }

    /// Whether an update currently holds the gate
    pub fn update_in_progress(&self) -> bool {
        self.gate.is_busy()
    }

    /// Check for a newer version and, if there is one, run an update job.
    ///
    /// Rejected immediately while another update holds the gate.
    pub async fn request_update(&self, trigger: UpdateTrigger) -> Result<UpdateOutcome, AgentError> {
        let Some(_guard) = self.gate.try_acquire() else {
            warn!("Update already in progress, rejecting {} request", trigger);
            return Ok(UpdateOutcome::Rejected);
        };

        let decision = self.policy.evaluate().await?;
        match decision.target.clone() {
            Some(target) => {
                let job = self
                    .orchestrator
                    .execute(UpdateJob::new(trigger, target))
                    .await;
                Ok(UpdateOutcome::Completed(job))
            }
            None => Ok(UpdateOutcome::UpToDate(decision)),
        }
    }

    /// Deploy an explicit image through the same gate
    pub async fn deploy(&self, trigger: UpdateTrigger, target: ImageRef) -> UpdateOutcome {
        let Some(_guard) = self.gate.try_acquire() else {
            warn!("Update already in progress, rejecting {} deploy of {}", trigger, target);
            return UpdateOutcome::Rejected;
        };

        let job = self
            .orchestrator
            .execute(UpdateJob::new(trigger, target))
            .await;
        UpdateOutcome::Completed(job)
    }

    /// Send a liveness heartbeat. Backend failures are logged, not returned.
    pub async fn heartbeat(&self) -> Result<(), AgentError> {
        let version = match self.lifecycle.current_image().await {
            Ok(Some(image)) => image.to_string(),
            Ok(None) => self.identity.image.to_string(),
            Err(e) => {
                debug!("Could not read current image for heartbeat: {}", e);
                self.identity.image.to_string()
            }
        };

        if !self.backend.send_heartbeat(&version, ONLINE).await {
            warn!("Failed to send heartbeat");
        }
        Ok(())
    }

    /// Report host health and any threshold alerts to the backend
    pub async fn report_health(&self) {
        let health = self.health.health_status().await;
        let summary = health.summary();
        info!("{}", summary);

        if health.system_info.is_some() {
            self.backend
                .send_log(&summary, LogSeverity::Info, LogType::General)
                .await;
        }

        for alert in health.alerts() {
            self.backend
                .send_log(&alert.message, alert.level, LogType::General)
                .await;
        }
    }

    pub async fn health(&self) -> HealthStatus {
        self.health.health_status().await
    }

    /// Aggregate status snapshot
    pub async fn status(&self) -> AgentStatus {
        let container_status = match self.lifecycle.status().await {
            Ok(state) => serde_json::to_value(state).unwrap_or_else(|e| json!({ "error": e.to_string() })),
            Err(e) => json!({ "error": e.to_string() }),
        };

        let health = self.health.health_status().await;
        let system_health =
            serde_json::to_value(health).unwrap_or_else(|e| json!({ "error": e.to_string() }));

        AgentStatus {
            agent_running: !self.stop.is_requested(),
            agent_version: self.agent_version.clone(),
            config: StatusConfig {
                device_name: self.identity.device_name.clone(),
                device_id: self.identity.device_id,
                backend_url: self.identity.backend_url.clone(),
                image: self.identity.image.to_string(),
                container_name: self.identity.container_name.clone(),
            },
            container_status,
            current_job: self.orchestrator.current_job().await,
            last_job: self.orchestrator.last_job().await,
            system_health,
        }
    }

    /// Dispatch a remote command. Returns the reply to publish, if any.
    pub async fn handle_command(&self, command: Command) -> Option<String> {
        match command {
            Command::Update => {
                info!("Received update command");
                if let Err(e) = self.request_update(UpdateTrigger::Command).await.map(log_outcome) {
                    self.report_update_error(&e).await;
                }
                None
            }
            Command::Restart => {
                info!("Received restart command, stopping agent");
                self.stop.request();
                None
            }
            Command::Status => {
                info!("Received status command");
                match serde_json::to_string(&self.status().await) {
                    Ok(reply) => Some(reply),
                    Err(e) => {
                        error!("Failed to serialize status: {}", e);
                        None
                    }
                }
            }
            Command::Unknown(raw) => {
                info!("Unknown command: {}", raw);
                None
            }
        }
    }

    async fn report_update_error(&self, e: &AgentError) {
        let message = format!("Error during version check/update: {}", e);
        error!("{}", message);
        self.backend
            .send_log(&message, LogSeverity::Error, LogType::Rollback)
            .await;
    }
}

fn log_outcome(outcome: UpdateOutcome) {
    match outcome {
        UpdateOutcome::Rejected => {}
        UpdateOutcome::UpToDate(decision) => {
            debug!("Workload is up to date at {}", decision.current_tag)
        }
        UpdateOutcome::Completed(job) => match job.phase() {
            UpdatePhase::Succeeded => info!("Update {} succeeded", job.id),
            phase => warn!("Update {} ended in {}", job.id, phase),
        },
    }
}

#[async_trait]
impl TaskRunner for AgentController {
    async fn run_task(&self, task: ScheduledTask) -> Result<(), AgentError> {
        match task {
            ScheduledTask::Heartbeat => self.heartbeat().await,
            ScheduledTask::Monitor => {
                // Telemetry failures are soft and never count against the loop
                self.report_health().await;
                Ok(())
            }
            ScheduledTask::UpdateCheck => match self.request_update(UpdateTrigger::Scheduled).await {
                Ok(outcome) => {
                    log_outcome(outcome);
                    Ok(())
                }
                Err(e) => {
                    self.report_update_error(&e).await;
                    Err(e)
                }
            },
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    async fn stopped(&self) {
        self.stop.wait().await
    }
}
