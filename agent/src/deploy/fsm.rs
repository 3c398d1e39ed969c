//! Finite state machine for a single update attempt

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::identity::ImageRef;

/// What caused an update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateTrigger {
    /// Periodic update check
    Scheduled,

    /// Remote command channel
    Command,

    /// Local operator request
    Manual,
}

impl fmt::Display for UpdateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateTrigger::Scheduled => "scheduled",
            UpdateTrigger::Command => "command",
            UpdateTrigger::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Update phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    CapturingState,
    Pulling,
    Stopping,
    Removing,
    Starting,
    Verifying,
    Succeeded,
    RollingBack,
    RolledBack,

    /// Update failed and the previous version could not be restored
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdatePhase::Succeeded | UpdatePhase::RolledBack | UpdatePhase::Failed
        )
    }

    /// Phases of the forward path that mutate the container and escalate to
    /// rollback on failure
    pub fn is_forward_step(&self) -> bool {
        matches!(
            self,
            UpdatePhase::Pulling
                | UpdatePhase::Stopping
                | UpdatePhase::Removing
                | UpdatePhase::Starting
                | UpdatePhase::Verifying
        )
    }

    fn can_transition_to(&self, next: UpdatePhase) -> bool {
        use UpdatePhase::*;
        match (self, next) {
            (Idle, CapturingState)
            | (CapturingState, Pulling)
            | (Pulling, Stopping)
            | (Stopping, Removing)
            | (Removing, Starting)
            | (Starting, Verifying)
            | (Verifying, Succeeded)
            | (RollingBack, RolledBack)
            | (RollingBack, Failed) => true,
            (from, RollingBack) | (from, Failed) => from.is_forward_step(),
            _ => false,
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::CapturingState => "capturing_state",
            UpdatePhase::Pulling => "pulling",
            UpdatePhase::Stopping => "stopping",
            UpdatePhase::Removing => "removing",
            UpdatePhase::Starting => "starting",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Succeeded => "succeeded",
            UpdatePhase::RollingBack => "rolling_back",
            UpdatePhase::RolledBack => "rolled_back",
            UpdatePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A single update attempt, from admission to a terminal phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    pub id: Uuid,
    pub trigger: UpdateTrigger,

    /// Image running before the update, if it could be determined
    pub previous_image: Option<ImageRef>,

    pub target_image: ImageRef,

    phase: UpdatePhase,

    /// Every phase entered, in order, starting with `Idle`
    history: Vec<UpdatePhase>,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// First failure that pushed the job off the forward path
    pub error: Option<String>,
}

impl UpdateJob {
    /// Create a job in the `Idle` phase
    pub fn new(trigger: UpdateTrigger, target_image: ImageRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            previous_image: None,
            target_image,
            phase: UpdatePhase::Idle,
            history: vec![UpdatePhase::Idle],
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Get current phase
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Phases entered so far
    pub fn history(&self) -> &[UpdatePhase] {
        &self.history
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether the rollback path has a previous image to return to
    pub fn can_roll_back(&self) -> bool {
        self.previous_image.is_some()
    }

    /// Move to `next`, stamping `ended_at` on terminal phases
    pub fn advance(&mut self, next: UpdatePhase) -> Result<(), String> {
        if !self.phase.can_transition_to(next) {
            return Err(format!("Invalid transition: {} -> {}", self.phase, next));
        }

        self.phase = next;
        self.history.push(next);
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record the failure that ended the forward path. Later failures (during
    /// rollback) do not overwrite it.
    pub fn record_error(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }
}
