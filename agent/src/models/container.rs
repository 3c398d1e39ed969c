//! Container state as observed from the runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::identity::ImageRef;

/// Workload container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// No container with the workload name exists
    Absent,
    Created,
    Running,
    Exited,
    /// Any runtime state that is neither healthy nor cleanly stopped
    Error,
}

impl ContainerStatus {
    /// Map a runtime `State.Status` string.
    ///
    /// `restarting`, `paused`, `removing` and `dead` all count as `Error`: with
    /// a restart-always policy a restarting container is crash-looping.
    pub fn from_runtime(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            _ => ContainerStatus::Error,
        }
    }
}

/// Snapshot of the workload container. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,

    /// Image reference the container was created from
    pub image: Option<ImageRef>,

    pub created_at: Option<DateTime<Utc>>,

    /// Published ports as `host_ip:host_port->container_port`
    pub ports: Vec<String>,
}

impl ContainerState {
    pub fn absent() -> Self {
        Self {
            status: ContainerStatus::Absent,
            image: None,
            created_at: None,
            ports: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}
