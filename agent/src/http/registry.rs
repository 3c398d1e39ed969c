//! Version sources: Docker Hub tag listing and backend-announced versions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::deploy::policy::VersionSource;
use crate::deploy::version::VersionTag;
use crate::errors::AgentError;
use crate::http::backend::Backend;

/// Default Docker Hub API root
pub const DOCKER_HUB_API: &str = "https://hub.docker.com/v2";

#[derive(Debug, Deserialize)]
struct TagPage {
    #[serde(default)]
    results: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Latest tag from a Docker Hub compatible tag listing
pub struct RegistryVersionSource {
    client: Client,
    api_url: String,
}

impl RegistryVersionSource {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VersionSource for RegistryVersionSource {
    async fn latest_tag(&self, repository: &str) -> Result<String, AgentError> {
        let (namespace, name) = split_repository(repository)?;
        let url = format!(
            "{}/repositories/{}/{}/tags?page_size=100",
            self.api_url, namespace, name
        );
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::RegistryError(format!(
                "Tag listing for {} returned {}",
                repository,
                response.status()
            )));
        }

        let page: TagPage = response.json().await?;
        select_latest(page.results.into_iter().map(|entry| entry.name)).ok_or_else(|| {
            AgentError::RegistryError(format!("No version tags published for {}", repository))
        })
    }
}

/// Split `namespace/name` for the Docker Hub API. Bare names live in
/// `library/`; references to other registries cannot be resolved here.
pub fn split_repository(repository: &str) -> Result<(String, String), AgentError> {
    let parts: Vec<&str> = repository.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok(("library".to_string(), name.to_string())),
        [host, ..] if host.contains('.') || host.contains(':') || *host == "localhost" => {
            Err(AgentError::RegistryError(format!(
                "Repository {} is not hosted on Docker Hub",
                repository
            )))
        }
        [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(AgentError::RegistryError(format!(
            "Invalid repository: {}",
            repository
        ))),
    }
}

/// Pick the highest version tag. Only tags starting with `v<n>.<n>` count;
/// they are ordered by every run of digits they contain.
pub fn select_latest(tags: impl IntoIterator<Item = String>) -> Option<String> {
    tags.into_iter()
        .filter(|tag| tag.starts_with('v') && VersionTag::try_parse(tag).is_some())
        .max_by(|a, b| digit_runs(a).cmp(&digit_runs(b)))
}

fn digit_runs(tag: &str) -> Vec<u64> {
    tag.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .map(|run| run.parse().unwrap_or(u64::MAX))
        .collect()
}

/// Latest tag as announced by the backend's update check
pub struct BackendVersionSource {
    backend: Arc<dyn Backend>,
}

impl BackendVersionSource {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl VersionSource for BackendVersionSource {
    async fn latest_tag(&self, _repository: &str) -> Result<String, AgentError> {
        let info = self
            .backend
            .check_for_updates()
            .await
            .ok_or_else(|| AgentError::BackendError("Update check unavailable".to_string()))?;

        match (info.update_available, info.version) {
            (true, Some(version)) if !version.trim().is_empty() => Ok(version.trim().to_string()),
            _ => Err(AgentError::BackendError(
                "Backend announced no version".to_string(),
            )),
        }
    }
}
