//! Application configuration options

use std::time::Duration;

use crate::deploy::docker::DockerOptions;
use crate::deploy::orchestrator::OrchestratorOptions;
use crate::http::client::RetryOptions;
use crate::models::identity::DeviceIdentity;
use crate::mqtt::client::{MqttAddress, MqttCredentials};
use crate::mqtt::topics::Topics;
use crate::storage::settings::{Settings, UpdateSource};
use crate::workers::{commands, scheduler};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub identity: DeviceIdentity,

    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    pub backend: BackendOptions,

    pub docker: DockerOptions,

    pub orchestrator: OrchestratorOptions,

    pub update: UpdateOptions,

    pub scheduler: scheduler::Options,

    /// Enable the MQTT command worker
    pub enable_commands: bool,

    pub commands: commands::Options,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let identity = settings.device_identity();
        let device_id = identity.device_id;

        let credentials = settings
            .mqtt
            .username
            .clone()
            .zip(settings.mqtt.password.clone())
            .map(|(username, password)| MqttCredentials { username, password });

        Self {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(settings.lifecycle.max_shutdown_delay_secs),
            },
            backend: BackendOptions {
                timeout: Duration::from_secs(settings.backend.timeout_secs),
                retry: RetryOptions {
                    max_retries: settings.backend.max_retries,
                    retry_delay: Duration::from_secs(settings.backend.retry_delay_secs),
                },
            },
            docker: DockerOptions {
                command: settings.workload.runtime_command.clone(),
                stop_timeout: Duration::from_secs(settings.workload.stop_timeout_secs),
                command_timeout: Duration::from_secs(settings.workload.command_timeout_secs),
            },
            orchestrator: OrchestratorOptions {
                settle_delay: Duration::from_secs(settings.workload.settle_delay_secs),
                env: settings.workload.env.clone(),
                ..Default::default()
            },
            update: UpdateOptions {
                source: settings.update.source,
                registry_url: settings.update.registry_url.clone(),
                lookup_timeout: Duration::from_secs(settings.update.lookup_timeout_secs),
            },
            scheduler: scheduler::Options {
                tick: Duration::from_secs(1),
                heartbeat_interval: Duration::from_secs(settings.schedule.heartbeat_interval_secs),
                monitor_interval: Duration::from_secs(settings.schedule.monitor_interval_secs),
                update_check_interval: Duration::from_secs(
                    settings.schedule.update_check_interval_secs,
                ),
                retry_delay: Duration::from_secs(settings.backend.retry_delay_secs),
                max_consecutive_errors: settings.schedule.max_consecutive_errors,
                error_wait: Duration::from_secs(settings.schedule.error_wait_secs),
            },
            enable_commands: settings.mqtt.enabled,
            commands: commands::Options {
                broker_address: MqttAddress {
                    host: settings.mqtt.host.clone(),
                    port: settings.mqtt.port,
                    use_tls: settings.mqtt.tls,
                    ca_cert_path: settings.mqtt.ca_cert_path.clone(),
                },
                credentials,
                client_id: format!("iotagent-{}", device_id),
                command_topic: settings
                    .mqtt
                    .command_topic
                    .clone()
                    .unwrap_or_else(|| Topics::command(device_id)),
                status_topic: settings
                    .mqtt
                    .status_topic
                    .clone()
                    .unwrap_or_else(|| Topics::status(device_id)),
                ..Default::default()
            },
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            identity,
        }
    }
}

/// Lifecycle options for the agent
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(600),
        }
    }
}

/// Backend client options
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub timeout: Duration,
    pub retry: RetryOptions,
}

/// Version source options
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub source: UpdateSource,
    pub registry_url: String,
    pub lookup_timeout: Duration,
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
