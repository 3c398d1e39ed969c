//! Update orchestrator
//!
//! Drives one [`UpdateJob`] through pull, stop, remove, start and verify, and
//! falls back to the previously running image when any of those steps fails.
//! Callers must hold the admission gate while a job executes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{UpdateJob, UpdatePhase};
use crate::deploy::lifecycle::ContainerLifecycle;
use crate::errors::AgentError;
use crate::http::backend::{Backend, LogSeverity, LogType};

const FORWARD_STEPS: [UpdatePhase; 5] = [
    UpdatePhase::Pulling,
    UpdatePhase::Stopping,
    UpdatePhase::Removing,
    UpdatePhase::Starting,
    UpdatePhase::Verifying,
];

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Wait between starting the new container and checking it is running
    pub settle_delay: Duration,

    /// Extra environment for started containers
    pub env: BTreeMap<String, String>,

    /// How long a finished job waits for its phase reports to reach the
    /// backend. Reports still queued afterwards are delivered in the background.
    pub report_flush_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(5),
            env: BTreeMap::new(),
            report_flush_timeout: Duration::from_secs(30),
        }
    }
}

/// A phase report on its way to the backend
#[derive(Debug)]
enum Report {
    Log {
        message: String,
        severity: LogSeverity,
        log_type: LogType,
    },
    Flush(oneshot::Sender<()>),
}

/// Deliver reports in order until every sender is gone
async fn deliver_reports(backend: Arc<dyn Backend>, mut reports: mpsc::UnboundedReceiver<Report>) {
    while let Some(report) = reports.recv().await {
        match report {
            Report::Log {
                message,
                severity,
                log_type,
            } => {
                if !backend.send_log(&message, severity, log_type).await {
                    debug!("Phase report dropped: {}", message);
                }
            }
            Report::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Runs update jobs. Must be created inside a Tokio runtime; phase reports
/// reach the backend in order from a background task.
pub struct UpdateOrchestrator {
    lifecycle: Arc<dyn ContainerLifecycle>,
    reports: mpsc::UnboundedSender<Report>,
    options: OrchestratorOptions,
    current: RwLock<Option<UpdateJob>>,
    last: RwLock<Option<UpdateJob>>,
}

impl UpdateOrchestrator {
    pub fn new(
        lifecycle: Arc<dyn ContainerLifecycle>,
        backend: Arc<dyn Backend>,
        options: OrchestratorOptions,
    ) -> Self {
        let (reports, queue) = mpsc::unbounded_channel();
        tokio::spawn(deliver_reports(backend, queue));

        Self {
            lifecycle,
            reports,
            options,
            current: RwLock::new(None),
            last: RwLock::new(None),
        }
    }

    /// Snapshot of the job in flight, if any
    pub async fn current_job(&self) -> Option<UpdateJob> {
        self.current.read().await.clone()
    }

    /// The most recently finished job
    pub async fn last_job(&self) -> Option<UpdateJob> {
        self.last.read().await.clone()
    }

    /// Run `job` to a terminal phase and return it
    pub async fn execute(&self, mut job: UpdateJob) -> UpdateJob {
        info!(
            "Update {} ({}) towards {} started",
            job.id, job.trigger, job.target_image
        );

        self.transition(&mut job, UpdatePhase::CapturingState, None).await;
        match self.lifecycle.current_image().await {
            Ok(Some(image)) => {
                info!("Current image: {}", image);
                job.previous_image = Some(image);
            }
            Ok(None) => warn!("No current image found, rollback will not be possible"),
            Err(e) => warn!("Failed to capture current image: {}", e),
        }

        for phase in FORWARD_STEPS {
            if let Err(e) = self.attempt(&mut job, phase).await {
                job.record_error(format!("{} failed: {}", phase, e));
                self.roll_back(&mut job).await;
                return self.finish(job).await;
            }
        }

        self.transition(&mut job, UpdatePhase::Succeeded, None).await;
        self.finish(job).await
    }

    /// Enter a forward phase and run its step; any error aborts the forward path
    async fn attempt(&self, job: &mut UpdateJob, phase: UpdatePhase) -> Result<(), AgentError> {
        self.transition(job, phase, None).await;
        match phase {
            UpdatePhase::Pulling => self.lifecycle.pull(&job.target_image).await,
            UpdatePhase::Stopping => self.lifecycle.stop().await,
            UpdatePhase::Removing => self.lifecycle.remove().await,
            UpdatePhase::Starting => {
                self.lifecycle
                    .run(&job.target_image, &self.options.env)
                    .await
            }
            UpdatePhase::Verifying => self.verify().await,
            _ => Ok(()),
        }
    }

    async fn verify(&self) -> Result<(), AgentError> {
        tokio::time::sleep(self.options.settle_delay).await;
        let state = self.lifecycle.status().await?;
        if state.is_running() {
            Ok(())
        } else {
            Err(AgentError::UpdateError(format!(
                "container is {:?} after start",
                state.status
            )))
        }
    }

    async fn roll_back(&self, job: &mut UpdateJob) {
        let Some(previous) = job.previous_image.clone() else {
            self.transition(job, UpdatePhase::Failed, None).await;
            return;
        };

        self.transition(job, UpdatePhase::RollingBack, None).await;
        best_effort("stop", self.lifecycle.stop()).await;
        best_effort("remove", self.lifecycle.remove()).await;

        match self.lifecycle.run(&previous, &self.options.env).await {
            Ok(()) => self.transition(job, UpdatePhase::RolledBack, None).await,
            Err(e) => {
                let detail = e.to_string();
                self.transition(job, UpdatePhase::Failed, Some(&detail)).await
            }
        }
    }

    async fn transition(&self, job: &mut UpdateJob, next: UpdatePhase, detail: Option<&str>) {
        if let Err(e) = job.advance(next) {
            error!("Update {}: {}", job.id, e);
            return;
        }
        *self.current.write().await = Some(job.clone());
        self.report(job, detail);
    }

    fn report(&self, job: &UpdateJob, detail: Option<&str>) {
        let rolling_back = job.history().contains(&UpdatePhase::RollingBack);
        let log_type = if rolling_back {
            LogType::Rollback
        } else {
            LogType::Deploy
        };

        let message = describe(job, detail);
        let severity = match job.phase() {
            UpdatePhase::RolledBack => {
                warn!(job_id = %job.id, phase = %job.phase(), "{}", message);
                LogSeverity::Warning
            }
            UpdatePhase::Failed => {
                error!(job_id = %job.id, phase = %job.phase(), "{}", message);
                LogSeverity::Error
            }
            _ => {
                info!(job_id = %job.id, phase = %job.phase(), "{}", message);
                LogSeverity::Info
            }
        };

        let report = Report::Log {
            message,
            severity,
            log_type,
        };
        if self.reports.send(report).is_err() {
            warn!("Phase reporter is gone, report not sent");
        }
    }

    /// Wait, within the flush timeout, until queued reports have been sent
    async fn flush_reports(&self) {
        let (done, flushed) = oneshot::channel();
        if self.reports.send(Report::Flush(done)).is_err() {
            return;
        }
        if tokio::time::timeout(self.options.report_flush_timeout, flushed)
            .await
            .is_err()
        {
            warn!(
                "Backend reports still pending after {:?}, continuing in background",
                self.options.report_flush_timeout
            );
        }
    }

    async fn finish(&self, job: UpdateJob) -> UpdateJob {
        self.flush_reports().await;
        *self.current.write().await = None;
        *self.last.write().await = Some(job.clone());
        job
    }
}

/// Run a rollback step whose failure must not stop the rollback
async fn best_effort<F>(step: &str, operation: F)
where
    F: Future<Output = Result<(), AgentError>>,
{
    if let Err(e) = operation.await {
        warn!("Rollback {} failed, continuing: {}", step, e);
    }
}

fn describe(job: &UpdateJob, detail: Option<&str>) -> String {
    let target = &job.target_image;
    let previous = job
        .previous_image
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    let cause = job.error.as_deref().unwrap_or("unknown error");

    match job.phase() {
        UpdatePhase::Idle => format!("Update to {} queued", target),
        UpdatePhase::CapturingState => format!("Updating to {}", target),
        UpdatePhase::Pulling => format!("Pulling image {}", target),
        UpdatePhase::Stopping => "Stopping current container".to_string(),
        UpdatePhase::Removing => "Removing current container".to_string(),
        UpdatePhase::Starting => format!("Starting container from {}", target),
        UpdatePhase::Verifying => "Verifying new container is running".to_string(),
        UpdatePhase::Succeeded => format!("Agent updated to {} successfully.", target),
        UpdatePhase::RollingBack => format!(
            "Agent update to {} failed ({}). Rolling back to {}.",
            target, cause, previous
        ),
        UpdatePhase::RolledBack => format!("Rollback to previous image {} successful.", previous),
        UpdatePhase::Failed => match detail {
            Some(detail) => format!("Rollback to previous image {} failed: {}", previous, detail),
            None => format!(
                "Agent update to {} failed ({}). No previous image to roll back to.",
                target, cause
            ),
        },
    }
}
