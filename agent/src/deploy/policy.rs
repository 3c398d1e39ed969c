//! Update-check policy

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::deploy::lifecycle::ContainerLifecycle;
use crate::deploy::version::{self, SENTINEL_TAG};
use crate::errors::AgentError;
use crate::models::identity::ImageRef;

/// Source of the newest published tag for a repository
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn latest_tag(&self, repository: &str) -> Result<String, AgentError>;
}

/// Outcome of one update check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateDecision {
    pub current_tag: String,
    pub latest_tag: String,

    /// Image to deploy, present only when `latest_tag` is newer
    pub target: Option<ImageRef>,
}

/// Decides whether a newer version of the workload exists
pub struct UpdatePolicy {
    versions: Arc<dyn VersionSource>,
    lifecycle: Arc<dyn ContainerLifecycle>,
    repository: String,
}

impl UpdatePolicy {
    pub fn new(
        versions: Arc<dyn VersionSource>,
        lifecycle: Arc<dyn ContainerLifecycle>,
        repository: &str,
    ) -> Self {
        Self {
            versions,
            lifecycle,
            repository: repository.to_string(),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Compare the latest published tag against the running one.
    ///
    /// A failed tag lookup reports the sentinel as latest and never produces
    /// a target. A runtime that cannot be queried is an error.
    pub async fn evaluate(&self) -> Result<UpdateDecision, AgentError> {
        let lookup = self.versions.latest_tag(&self.repository).await;

        let current_tag = self
            .lifecycle
            .current_image()
            .await?
            .map(|image| image.tag_or(SENTINEL_TAG).to_string())
            .unwrap_or_else(|| SENTINEL_TAG.to_string());

        let latest_tag = match lookup {
            Ok(tag) => tag,
            Err(e) => {
                // The running tag may not be a version at all (`latest`)
                warn!("Latest tag lookup for {} failed: {}", self.repository, e);
                return Ok(UpdateDecision {
                    current_tag,
                    latest_tag: SENTINEL_TAG.to_string(),
                    target: None,
                });
            }
        };

        let target = if version::is_newer(&latest_tag, &current_tag) {
            info!(
                "New version available: {} > {}",
                latest_tag, current_tag
            );
            Some(ImageRef::new(self.repository.as_str(), Some(latest_tag.clone())))
        } else {
            info!(
                "No update needed. Current: {}, Latest: {}",
                current_tag, latest_tag
            );
            None
        };

        Ok(UpdateDecision {
            current_tag,
            latest_tag,
            target,
        })
    }
}
