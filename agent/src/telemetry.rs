//! Telemetry and health checks

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::error;

use crate::errors::AgentError;
use crate::http::backend::LogSeverity;

/// Usage thresholds in percent. Reaching a threshold is a warning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu: f32,
    pub memory: f32,
    pub disk: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory: 85.0,
            disk: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub percent: f32,
    pub count: usize,
    pub frequency_mhz: u64,
}

/// Memory figures in bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f32,
}

/// Disk figures in bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,

    /// Unix epoch seconds
    pub boot_time: u64,
    pub uptime_secs: u64,
}

/// Point-in-time system snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    pub network: NetworkInfo,
    pub system: HostInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Error,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Healthy => "healthy",
            HealthState::Warning => "warning",
            HealthState::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: CheckStatus,
    pub value: f32,
    pub threshold: f32,
}

impl HealthCheck {
    fn new(value: f32, threshold: f32) -> Self {
        let status = if value < threshold {
            CheckStatus::Ok
        } else {
            CheckStatus::Warning
        };
        Self {
            status,
            value,
            threshold,
        }
    }

    fn is_ok(&self) -> bool {
        self.status == CheckStatus::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChecks {
    pub cpu: HealthCheck,
    pub memory: HealthCheck,
    pub disk: HealthCheck,
}

/// Health verdict plus the data it was derived from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,

    /// Collection failure, set only when `status` is `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<HealthChecks>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
}

/// A threshold breach or collection failure worth reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: LogSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    /// Grade a snapshot against thresholds
    pub fn evaluate(info: SystemInfo, thresholds: &Thresholds) -> Self {
        let checks = HealthChecks {
            cpu: HealthCheck::new(info.cpu.percent, thresholds.cpu),
            memory: HealthCheck::new(info.memory.percent, thresholds.memory),
            disk: HealthCheck::new(info.disk.percent, thresholds.disk),
        };

        let status = if checks.cpu.is_ok() && checks.memory.is_ok() && checks.disk.is_ok() {
            HealthState::Healthy
        } else {
            HealthState::Warning
        };

        Self {
            status,
            message: None,
            checks: Some(checks),
            system_info: Some(info),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Error,
            message: Some(message.into()),
            checks: None,
            system_info: None,
        }
    }

    /// Warnings for every breached threshold, or a single error when
    /// collection failed
    pub fn alerts(&self) -> Vec<Alert> {
        let now = Utc::now();

        let Some(checks) = &self.checks else {
            return vec![Alert {
                level: LogSeverity::Error,
                message: format!(
                    "System monitoring error: {}",
                    self.message.as_deref().unwrap_or("Unknown error")
                ),
                timestamp: now,
            }];
        };

        [
            ("CPU", &checks.cpu),
            ("memory", &checks.memory),
            ("disk", &checks.disk),
        ]
        .into_iter()
        .filter(|(_, check)| !check.is_ok())
        .map(|(name, check)| Alert {
            level: LogSeverity::Warning,
            message: format!("High {} usage: {:.1}%", name, check.value),
            timestamp: now,
        })
        .collect()
    }

    /// One-line summary: `System health: warning, CPU: 91.0%, Memory: 40.2%, Disk: 12.0%`
    pub fn summary(&self) -> String {
        match &self.system_info {
            Some(info) => format!(
                "System health: {}, CPU: {:.1}%, Memory: {:.1}%, Disk: {:.1}%",
                self.status,
                info.cpu.percent,
                info.memory.percent,
                info.disk.percent
            ),
            None => format!(
                "System health: error, {}",
                self.message.as_deref().unwrap_or("Unknown error")
            ),
        }
    }
}

/// Anything that can report host health
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn health_status(&self) -> HealthStatus;
}

/// sysinfo-backed system monitor
#[derive(Debug, Clone, Default)]
pub struct SystemMonitor {
    thresholds: Thresholds,
}

impl SystemMonitor {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Collect a system snapshot. CPU usage is measured over sysinfo's minimum
    /// update interval, so this blocks a worker thread briefly.
    pub async fn system_info(&self) -> Result<SystemInfo, AgentError> {
        tokio::task::spawn_blocking(collect_system_info)
            .await
            .map_err(|e| AgentError::TelemetryError(e.to_string()))
    }
}

#[async_trait]
impl HealthSource for SystemMonitor {
    async fn health_status(&self) -> HealthStatus {
        match self.system_info().await {
            Ok(info) => HealthStatus::evaluate(info, &self.thresholds),
            Err(e) => {
                error!("Error getting system info: {}", e);
                HealthStatus::failed(e.to_string())
            }
        }
    }
}

fn percent(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64 * 100.0) as f32
    }
}

fn collect_system_info() -> SystemInfo {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_all();
    sys.refresh_memory();

    let cpu = CpuInfo {
        percent: sys.global_cpu_usage(),
        count: sys.cpus().len(),
        frequency_mhz: sys.cpus().first().map(|cpu| cpu.frequency()).unwrap_or(0),
    };

    let memory_total = sys.total_memory();
    let memory_available = sys.available_memory();
    let memory = MemoryInfo {
        total: memory_total,
        available: memory_available,
        used: sys.used_memory(),
        free: sys.free_memory(),
        percent: percent(memory_total.saturating_sub(memory_available), memory_total),
    };

    // Root filesystem, or every disk summed when `/` is not a mount point
    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_free) = match disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
    {
        Some(root) => (root.total_space(), root.available_space()),
        None => disks.iter().fold((0u64, 0u64), |(total, free), disk| {
            (total + disk.total_space(), free + disk.available_space())
        }),
    };
    let disk_used = disk_total.saturating_sub(disk_free);
    let disk = DiskInfo {
        total: disk_total,
        used: disk_used,
        free: disk_free,
        percent: percent(disk_used, disk_total),
    };

    let networks = Networks::new_with_refreshed_list();
    let network = networks
        .iter()
        .fold(NetworkInfo::default(), |acc, (_, data)| NetworkInfo {
            bytes_sent: acc.bytes_sent + data.total_transmitted(),
            bytes_recv: acc.bytes_recv + data.total_received(),
            packets_sent: acc.packets_sent + data.total_packets_transmitted(),
            packets_recv: acc.packets_recv + data.total_packets_received(),
        });

    SystemInfo {
        timestamp: Utc::now(),
        cpu,
        memory,
        disk,
        network,
        system: HostInfo {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            boot_time: System::boot_time(),
            uptime_secs: System::uptime(),
        },
    }
}
