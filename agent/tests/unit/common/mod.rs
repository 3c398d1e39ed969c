//! Shared fakes for the integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use iotagent::app::controller::{AgentController, Collaborators};
use iotagent::app::state::StopFlag;
use iotagent::deploy::lifecycle::ContainerLifecycle;
use iotagent::deploy::orchestrator::OrchestratorOptions;
use iotagent::deploy::policy::VersionSource;
use iotagent::errors::AgentError;
use iotagent::http::backend::{Backend, LogSeverity, LogType, UpdateInfo};
use iotagent::models::container::{ContainerState, ContainerStatus};
use iotagent::models::identity::{DeviceIdentity, ImageRef};
use iotagent::telemetry::{
    CpuInfo, DiskInfo, HealthSource, HealthStatus, HostInfo, MemoryInfo, NetworkInfo, SystemInfo,
    Thresholds,
};
use iotagent::workers::commands::StatusPublisher;
use tokio::sync::Notify;

pub const REPOSITORY: &str = "team/app";
pub const CONTAINER: &str = "app";

// ================================ LIFECYCLE ================================== //

#[derive(Debug)]
struct FakeContainer {
    image: Option<ImageRef>,
    status: ContainerStatus,
    calls: Vec<String>,
    fail_always: HashSet<String>,
    fail_once: VecDeque<String>,
    start_stopped: bool,
}

/// In-memory container runtime recording every call
pub struct FakeLifecycle {
    container: Mutex<FakeContainer>,
    pull_gate: Option<Arc<Notify>>,
    pub pull_started: Arc<Notify>,
}

impl FakeLifecycle {
    /// A workload running `image`
    pub fn running(image: &str) -> Self {
        Self::with_container(Some(ImageRef::parse(image)), ContainerStatus::Running)
    }

    /// No workload container at all
    pub fn absent() -> Self {
        Self::with_container(None, ContainerStatus::Absent)
    }

    fn with_container(image: Option<ImageRef>, status: ContainerStatus) -> Self {
        Self {
            container: Mutex::new(FakeContainer {
                image,
                status,
                calls: Vec::new(),
                fail_always: HashSet::new(),
                fail_once: VecDeque::new(),
                start_stopped: false,
            }),
            pull_gate: None,
            pull_started: Arc::new(Notify::new()),
        }
    }

    /// Every call to `op` fails
    pub fn failing(self, op: &str) -> Self {
        self.container.lock().unwrap().fail_always.insert(op.to_string());
        self
    }

    /// The next call to `op` fails, later ones succeed
    pub fn failing_once(self, op: &str) -> Self {
        self.container.lock().unwrap().fail_once.push_back(op.to_string());
        self
    }

    /// Containers started from the new image exit immediately
    pub fn exiting_after_start(self) -> Self {
        self.container.lock().unwrap().start_stopped = true;
        self
    }

    /// `pull` blocks until `gate` is notified
    pub fn with_pull_gate(mut self, gate: Arc<Notify>) -> Self {
        self.pull_gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.container.lock().unwrap().calls.clone()
    }

    pub fn image(&self) -> Option<ImageRef> {
        self.container.lock().unwrap().image.clone()
    }

    pub fn container_status(&self) -> ContainerStatus {
        self.container.lock().unwrap().status
    }

    fn record(&self, call: String, op: &str) -> Result<(), AgentError> {
        let mut container = self.container.lock().unwrap();
        container.calls.push(call);

        if container.fail_always.contains(op) {
            return Err(AgentError::RuntimeError(format!("{} failed", op)));
        }
        if let Some(pos) = container.fail_once.iter().position(|o| o == op) {
            container.fail_once.remove(pos);
            return Err(AgentError::RuntimeError(format!("{} failed", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerLifecycle for FakeLifecycle {
    fn container_name(&self) -> &str {
        CONTAINER
    }

    async fn current_image(&self) -> Result<Option<ImageRef>, AgentError> {
        self.record("current_image".to_string(), "current_image")
            .map_err(|e| AgentError::RuntimeUnavailable(e.to_string()))?;
        Ok(self.image())
    }

    async fn pull(&self, image: &ImageRef) -> Result<(), AgentError> {
        self.pull_started.notify_one();
        if let Some(gate) = &self.pull_gate {
            gate.notified().await;
        }
        self.record(format!("pull {}", image), "pull")
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.record("stop".to_string(), "stop")?;
        let mut container = self.container.lock().unwrap();
        if container.status != ContainerStatus::Absent {
            container.status = ContainerStatus::Exited;
        }
        Ok(())
    }

    async fn remove(&self) -> Result<(), AgentError> {
        self.record("remove".to_string(), "remove")?;
        let mut container = self.container.lock().unwrap();
        container.status = ContainerStatus::Absent;
        container.image = None;
        Ok(())
    }

    async fn run(&self, image: &ImageRef, env: &BTreeMap<String, String>) -> Result<(), AgentError> {
        let mut call = format!("run {}", image);
        for (key, value) in env {
            call.push_str(&format!(" {}={}", key, value));
        }
        self.record(call, "run")?;

        let mut container = self.container.lock().unwrap();
        // Only the first start honours `start_stopped`; the rollback start is healthy
        container.status = if container.start_stopped {
            container.start_stopped = false;
            ContainerStatus::Exited
        } else {
            ContainerStatus::Running
        };
        container.image = Some(image.clone());
        Ok(())
    }

    async fn status(&self) -> Result<ContainerState, AgentError> {
        self.record("status".to_string(), "status")?;
        let container = self.container.lock().unwrap();
        Ok(ContainerState {
            status: container.status,
            image: container.image.clone(),
            created_at: None,
            ports: Vec::new(),
        })
    }
}

// ================================= BACKEND =================================== //

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMessage {
    pub message: String,
    pub level: LogSeverity,
    pub log_type: LogType,
}

/// Backend that records what it is sent
#[derive(Default)]
pub struct RecordingBackend {
    logs: Mutex<Vec<LoggedMessage>>,
    heartbeats: Mutex<Vec<(String, String)>>,
    pub update_info: Option<UpdateInfo>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<LoggedMessage> {
        self.logs.lock().unwrap().clone()
    }

    pub fn heartbeats(&self) -> Vec<(String, String)> {
        self.heartbeats.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn send_heartbeat(&self, version: &str, status: &str) -> bool {
        self.heartbeats
            .lock()
            .unwrap()
            .push((version.to_string(), status.to_string()));
        true
    }

    async fn send_log(&self, message: &str, level: LogSeverity, log_type: LogType) -> bool {
        self.logs.lock().unwrap().push(LoggedMessage {
            message: message.to_string(),
            level,
            log_type,
        });
        true
    }

    async fn check_for_updates(&self) -> Option<UpdateInfo> {
        self.update_info.clone()
    }
}

// ================================= VERSIONS ================================== //

/// Version source with a fixed answer
pub struct FakeVersionSource {
    latest: Result<String, String>,
}

impl FakeVersionSource {
    pub fn tag(tag: &str) -> Self {
        Self {
            latest: Ok(tag.to_string()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            latest: Err("registry unreachable".to_string()),
        }
    }
}

#[async_trait]
impl VersionSource for FakeVersionSource {
    async fn latest_tag(&self, _repository: &str) -> Result<String, AgentError> {
        self.latest
            .clone()
            .map_err(AgentError::RegistryError)
    }
}

// ================================== HEALTH =================================== //

pub fn system_info(cpu: f32, memory: f32, disk: f32) -> SystemInfo {
    SystemInfo {
        timestamp: Utc::now(),
        cpu: CpuInfo {
            percent: cpu,
            count: 4,
            frequency_mhz: 1500,
        },
        memory: MemoryInfo {
            total: 4 << 30,
            available: 2 << 30,
            used: 2 << 30,
            free: 2 << 30,
            percent: memory,
        },
        disk: DiskInfo {
            total: 32 << 30,
            used: 8 << 30,
            free: 24 << 30,
            percent: disk,
        },
        network: NetworkInfo::default(),
        system: HostInfo {
            hostname: "edge-01".to_string(),
            boot_time: 0,
            uptime_secs: 3600,
        },
    }
}

/// Health source returning a fixed verdict
pub struct FakeHealth {
    status: HealthStatus,
}

impl FakeHealth {
    pub fn healthy() -> Self {
        Self::usage(20.0, 40.0, 10.0)
    }

    pub fn usage(cpu: f32, memory: f32, disk: f32) -> Self {
        Self {
            status: HealthStatus::evaluate(system_info(cpu, memory, disk), &Thresholds::default()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            status: HealthStatus::failed(message),
        }
    }
}

#[async_trait]
impl HealthSource for FakeHealth {
    async fn health_status(&self) -> HealthStatus {
        self.status.clone()
    }
}

// ================================ PUBLISHER ================================== //

/// Status publisher that records replies
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusPublisher for RecordingPublisher {
    async fn publish_status(&self, payload: &str) -> Result<(), AgentError> {
        self.published.lock().unwrap().push(payload.to_string());
        Ok(())
    }
}

// ================================ CONTROLLER ================================= //

pub fn identity() -> DeviceIdentity {
    DeviceIdentity {
        device_name: "edge-01".to_string(),
        device_id: 7,
        backend_url: "http://backend.local:8000".to_string(),
        image: ImageRef::parse(&format!("{}:v1.0", REPOSITORY)),
        container_name: CONTAINER.to_string(),
    }
}

pub fn orchestrator_options() -> OrchestratorOptions {
    OrchestratorOptions {
        settle_delay: Duration::ZERO,
        env: BTreeMap::new(),
        report_flush_timeout: Duration::from_secs(30),
    }
}

pub struct Harness {
    pub controller: Arc<AgentController>,
    pub lifecycle: Arc<FakeLifecycle>,
    pub backend: Arc<RecordingBackend>,
    pub stop: Arc<StopFlag>,
}

pub fn harness(lifecycle: FakeLifecycle, versions: FakeVersionSource) -> Harness {
    harness_with_health(lifecycle, versions, FakeHealth::healthy())
}

pub fn harness_with_health(
    lifecycle: FakeLifecycle,
    versions: FakeVersionSource,
    health: FakeHealth,
) -> Harness {
    let lifecycle = Arc::new(lifecycle);
    let backend = Arc::new(RecordingBackend::new());
    let stop = Arc::new(StopFlag::new());

    let controller = AgentController::new(
        identity(),
        "0.1.0".to_string(),
        Collaborators {
            lifecycle: lifecycle.clone(),
            backend: backend.clone(),
            health: Arc::new(health),
            versions: Arc::new(versions),
        },
        orchestrator_options(),
        stop.clone(),
    );

    Harness {
        controller: Arc::new(controller),
        lifecycle,
        backend,
        stop,
    }
}
