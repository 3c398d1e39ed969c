//! Utility functions

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::app::options::AppOptions;
use crate::app::run::{backend_client, version_source};
use crate::deploy::docker::DockerLifecycle;
use crate::deploy::lifecycle::ContainerLifecycle;
use crate::http::backend::Backend;
use crate::http::client::RetryOptions;

/// Version information for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(exponent);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

/// Run the self-checks behind `--diagnostic`. Returns true if every check
/// passed.
pub async fn run_diagnostic(options: &AppOptions) -> bool {
    println!("{}", "iotagent diagnostics".bold());
    println!(
        "  device {} (id {}), workload {} from {}",
        options.identity.device_name,
        options.identity.device_id,
        options.identity.container_name,
        options.identity.image
    );

    let mut passed = true;
    passed &= report("Container runtime", check_runtime(options).await);
    passed &= report("Backend", check_backend(options).await);
    passed &= report("Latest tag lookup", check_latest_tag(options).await);
    passed
}

fn report(name: &str, result: anyhow::Result<String>) -> bool {
    match result {
        Ok(detail) => {
            println!("{} {}: {}", "PASS".green().bold(), name, detail);
            true
        }
        Err(e) => {
            println!("{} {}: {:#}", "FAIL".red().bold(), name, e);
            false
        }
    }
}

async fn check_runtime(options: &AppOptions) -> anyhow::Result<String> {
    let lifecycle = DockerLifecycle::new(options.docker.clone(), &options.identity);
    let state = lifecycle
        .status()
        .await
        .with_context(|| format!("querying `{}`", options.docker.command))?;

    let image = state
        .image
        .map(|image| image.to_string())
        .unwrap_or_else(|| "-".to_string());
    Ok(format!(
        "container {} is {:?} (image {})",
        lifecycle.container_name(),
        state.status,
        image
    ))
}

fn single_attempt(options: &AppOptions) -> AppOptions {
    let mut options = options.clone();
    options.backend.retry = RetryOptions {
        max_retries: 0,
        retry_delay: Duration::ZERO,
    };
    options
}

async fn check_backend(options: &AppOptions) -> anyhow::Result<String> {
    let backend = backend_client(&single_attempt(options)).context("building backend client")?;
    match backend.get_device_status().await {
        Some(_) => Ok(format!("{} reachable", backend.base_url())),
        None => bail!("{} unreachable", backend.base_url()),
    }
}

async fn check_latest_tag(options: &AppOptions) -> anyhow::Result<String> {
    let options = single_attempt(options);
    let backend: Arc<dyn Backend> =
        Arc::new(backend_client(&options).context("building backend client")?);
    let versions = version_source(&options, backend).context("building version source")?;

    let repository = &options.identity.image.repository;
    let tag = versions
        .latest_tag(repository)
        .await
        .with_context(|| format!("looking up tags for {}", repository))?;
    Ok(format!("latest tag for {} is {}", repository, tag))
}
