//! Settings file and environment overrides

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::filesys::file::File;
use crate::http::registry::DOCKER_HUB_API;
use crate::logs::LogLevel;
use crate::models::identity::{DeviceIdentity, ImageRef};

/// Agent settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub backend: BackendSettings,

    /// Managed workload
    #[serde(default)]
    pub workload: WorkloadSettings,

    #[serde(default)]
    pub update: UpdateSettings,

    #[serde(default)]
    pub schedule: ScheduleSettings,

    #[serde(default)]
    pub mqtt: MqttSettings,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub log: LogSettings,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Device name, the host name when unset
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_device_id")]
    pub id: u64,
}

fn default_device_id() -> u64 {
    1
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: None,
            id: default_device_id(),
        }
    }
}

/// Backend API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL for the backend API
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            timeout_secs: default_backend_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSettings {
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Container runtime command line
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Wait before verifying a freshly started container
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Extra environment for the workload
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_image() -> String {
    "taipham2710/agent:latest".to_string()
}

fn default_container_name() -> String {
    "iot_app".to_string()
}

fn default_runtime_command() -> String {
    "docker".to_string()
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    300
}

fn default_settle_delay() -> u64 {
    5
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_name: default_container_name(),
            runtime_command: default_runtime_command(),
            stop_timeout_secs: default_stop_timeout(),
            command_timeout_secs: default_command_timeout(),
            settle_delay_secs: default_settle_delay(),
            env: BTreeMap::new(),
        }
    }
}

/// Where the latest workload version comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    #[default]
    Registry,
    Backend,
}

impl FromStr for UpdateSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "registry" => Ok(UpdateSource::Registry),
            "backend" => Ok(UpdateSource::Backend),
            _ => Err(format!("Invalid update source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSettings {
    #[serde(default)]
    pub source: UpdateSource,

    /// Docker Hub compatible API root
    #[serde(default = "default_registry_url")]
    pub registry_url: String,

    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_secs: u64,
}

fn default_registry_url() -> String {
    DOCKER_HUB_API.to_string()
}

fn default_lookup_timeout() -> u64 {
    5
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            source: UpdateSource::default(),
            registry_url: default_registry_url(),
            lookup_timeout_secs: default_lookup_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Health report interval
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    #[serde(default = "default_update_check_interval")]
    pub update_check_interval_secs: u64,

    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    #[serde(default = "default_error_wait")]
    pub error_wait_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    300
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_update_check_interval() -> u64 {
    600
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_error_wait() -> u64 {
    30
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            monitor_interval_secs: default_monitor_interval(),
            update_check_interval_secs: default_update_check_interval(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_wait_secs: default_error_wait(),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default)]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,

    /// Command topic, `agent/{device_id}/cmd` when unset
    #[serde(default)]
    pub command_topic: Option<String>,

    /// Status topic, `agent/{device_id}/status` when unset
    #[serde(default)]
    pub status_topic: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: false,
            ca_cert_path: None,
            username: None,
            password: None,
            command_topic: None,
            status_topic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_true")]
    pub stdout: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            dir: None,
            json: false,
            stdout: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Upper bound on a graceful shutdown
    #[serde(default = "default_max_shutdown_delay")]
    pub max_shutdown_delay_secs: u64,
}

fn default_max_shutdown_delay() -> u64 {
    600
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_shutdown_delay_secs: default_max_shutdown_delay(),
        }
    }
}

impl Settings {
    /// Load settings from `file`. A missing file yields defaults; an unreadable
    /// one yields defaults plus a warning.
    pub async fn load(file: &File) -> (Self, Vec<String>) {
        if !file.exists().await {
            return (
                Self::default(),
                vec![format!(
                    "Settings file {} not found, using defaults",
                    file.path().display()
                )],
            );
        }

        match file.read_json::<Settings>().await {
            Ok(settings) => (settings, Vec::new()),
            Err(e) => (
                Self::default(),
                vec![format!(
                    "Failed to read settings file {}: {}, using defaults",
                    file.path().display(),
                    e
                )],
            ),
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Values that do not parse keep the
    /// current setting and produce a warning.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = Overrides {
            lookup: &lookup,
            warnings: Vec::new(),
        };

        env.string("DOCKER_IMAGE", &mut self.workload.image);
        env.string("CONTAINER_NAME", &mut self.workload.container_name);
        env.string("RUNTIME_COMMAND", &mut self.workload.runtime_command);
        env.string("BACKEND_URL", &mut self.backend.base_url);
        env.parsed("BACKEND_TIMEOUT", &mut self.backend.timeout_secs);
        env.parsed("MAX_RETRIES", &mut self.backend.max_retries);
        env.parsed("RETRY_DELAY", &mut self.backend.retry_delay_secs);
        env.optional("DEVICE_NAME", &mut self.device.name);
        env.parsed("DEVICE_ID", &mut self.device.id);
        env.parsed("HEARTBEAT_INTERVAL", &mut self.schedule.heartbeat_interval_secs);
        env.parsed("UPDATE_CHECK_INTERVAL", &mut self.schedule.update_check_interval_secs);
        env.parsed("LOG_INTERVAL", &mut self.schedule.monitor_interval_secs);
        env.parsed("MAX_CONSECUTIVE_ERRORS", &mut self.schedule.max_consecutive_errors);
        env.parsed("ERROR_WAIT_TIME", &mut self.schedule.error_wait_secs);
        env.parsed("LOG_LEVEL", &mut self.log.level);
        env.parsed("UPDATE_SOURCE", &mut self.update.source);
        env.string("MQTT_BROKER", &mut self.mqtt.host);
        env.parsed("MQTT_PORT", &mut self.mqtt.port);
        env.optional("MQTT_TOPIC_SUB", &mut self.mqtt.command_topic);
        env.optional("MQTT_TOPIC_PUB", &mut self.mqtt.status_topic);
        env.optional("MQTT_USERNAME", &mut self.mqtt.username);

        let mut log_dir = None;
        env.optional("LOG_DIR", &mut log_dir);
        if let Some(dir) = log_dir {
            self.log.dir = Some(PathBuf::from(dir));
        }

        let mut password = None;
        env.optional("MQTT_PASSWORD", &mut password);
        if let Some(password) = password {
            self.mqtt.password = Some(SecretString::from(password));
        }

        env.warnings
    }

    /// Resolve the device identity, defaulting the name to the host name
    pub fn device_identity(&self) -> DeviceIdentity {
        let device_name = self
            .device
            .name
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "unknown".to_string());

        DeviceIdentity {
            device_name,
            device_id: self.device.id,
            backend_url: self.backend.base_url.trim_end_matches('/').to_string(),
            image: ImageRef::parse(&self.workload.image),
            container_name: self.workload.container_name.clone(),
        }
    }

    /// Sanity checks that do not stop the agent from starting
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, value) in [
            ("backend.base_url", &self.backend.base_url),
            ("update.registry_url", &self.update.registry_url),
        ] {
            match Url::parse(value) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => warnings.push(format!(
                    "{} has unsupported scheme {:?}: {}",
                    name,
                    url.scheme(),
                    value
                )),
                Err(e) => warnings.push(format!("{} is not a valid URL ({}): {}", name, e, value)),
            }
        }

        if self.workload.image.trim().is_empty() {
            warnings.push("workload.image is empty".to_string());
        }
        if self.workload.container_name.trim().is_empty() {
            warnings.push("workload.container_name is empty".to_string());
        }

        warnings
    }
}

struct Overrides<'a, F> {
    lookup: &'a F,
    warnings: Vec<String>,
}

impl<F> Overrides<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&mut self, key: &str) -> Option<String> {
        let value = (self.lookup)(key)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.warnings.push(format!("Ignoring empty {}", key));
            return None;
        }
        Some(trimmed.to_string())
    }

    fn string(&mut self, key: &str, target: &mut String) {
        if let Some(value) = self.raw(key) {
            *target = value;
        }
    }

    fn optional(&mut self, key: &str, target: &mut Option<String>) {
        if let Some(value) = self.raw(key) {
            *target = Some(value);
        }
    }

    fn parsed<T>(&mut self, key: &str, target: &mut T)
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        if let Some(value) = self.raw(key) {
            match value.parse() {
                Ok(parsed) => *target = parsed,
                Err(e) => self
                    .warnings
                    .push(format!("Ignoring {}={:?}: {}", key, value, e)),
            }
        }
    }
}
