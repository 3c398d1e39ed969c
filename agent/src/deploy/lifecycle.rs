//! Container lifecycle primitives

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::errors::AgentError;
use crate::models::container::ContainerState;
use crate::models::identity::ImageRef;

/// Idempotent operations against the container runtime for the single
/// managed workload.
///
/// Implementations re-query the runtime on every call. An absent workload is
/// a success for `stop` and `remove` and a valid answer for `status`.
#[async_trait]
pub trait ContainerLifecycle: Send + Sync {
    /// Name of the managed workload container
    fn container_name(&self) -> &str;

    /// Image the workload was created from, if it exists and is referenced by
    /// name rather than by image ID
    async fn current_image(&self) -> Result<Option<ImageRef>, AgentError>;

    /// Fetch an image into the local store
    async fn pull(&self, image: &ImageRef) -> Result<(), AgentError>;

    /// Stop the workload within a bounded wait
    async fn stop(&self) -> Result<(), AgentError>;

    /// Delete the workload container
    async fn remove(&self) -> Result<(), AgentError>;

    /// Create and start the workload from `image`. `env` is merged over the
    /// base environment.
    async fn run(&self, image: &ImageRef, env: &BTreeMap<String, String>) -> Result<(), AgentError>;

    /// Snapshot of the workload container
    async fn status(&self) -> Result<ContainerState, AgentError>;
}
