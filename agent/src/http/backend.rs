//! Backend API client

use std::fmt;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::http::client::HttpClient;

/// Severity attached to a backend log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warning",
            LogSeverity::Error => "error",
        })
    }
}

/// Category of a backend log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    General,
    Deploy,
    Rollback,
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogType::General => "general",
            LogType::Deploy => "deploy",
            LogType::Rollback => "rollback",
        })
    }
}

/// Update availability as reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    #[serde(default)]
    pub update_available: bool,

    #[serde(default)]
    pub version: Option<String>,
}

/// Remote backend. Every call swallows failures: the result is `false` or
/// `None` once retries are exhausted.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send_heartbeat(&self, version: &str, status: &str) -> bool;

    async fn send_log(&self, message: &str, level: LogSeverity, log_type: LogType) -> bool;

    async fn check_for_updates(&self) -> Option<UpdateInfo>;
}

/// Backend client over HTTP
pub struct BackendClient {
    http: HttpClient,
    device_name: String,
    device_id: u64,
}

impl BackendClient {
    pub fn new(http: HttpClient, device_name: &str, device_id: u64) -> Self {
        Self {
            http,
            device_name: device_name.to_string(),
            device_id,
        }
    }

    pub fn base_url(&self) -> &str {
        self.http.base_url()
    }

    /// Device record as the backend sees it
    pub async fn get_device_status(&self) -> Option<Value> {
        let path = format!("/device/{}/status", self.device_id);
        self.http.request_with_retry(Method::GET, &path, None).await
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn send_heartbeat(&self, version: &str, status: &str) -> bool {
        let body = json!({
            "name": self.device_name,
            "version": version,
            "status": status,
        });

        match self
            .http
            .request_with_retry(Method::POST, "/device/heartbeat", Some(&body))
            .await
        {
            Some(_) => {
                info!("Heartbeat sent successfully");
                true
            }
            None => {
                error!("Failed to send heartbeat");
                false
            }
        }
    }

    async fn send_log(&self, message: &str, level: LogSeverity, log_type: LogType) -> bool {
        let body = json!({
            "device_id": self.device_id,
            "message": message,
            "log_level": level,
            "type": log_type,
        });

        match self
            .http
            .request_with_retry(Method::POST, "/logs", Some(&body))
            .await
        {
            Some(_) => {
                debug!("Log sent successfully: {}", message);
                true
            }
            None => {
                error!("Failed to send log: {}", message);
                false
            }
        }
    }

    async fn check_for_updates(&self) -> Option<UpdateInfo> {
        let path = format!("/device/{}/updates", self.device_id);
        let value = self.http.request_with_retry(Method::GET, &path, None).await?;
        match serde_json::from_value(value) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Unexpected update check response: {}", e);
                None
            }
        }
    }
}
