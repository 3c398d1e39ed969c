//! Periodic task scheduler

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::errors::AgentError;

/// Scheduler options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sleep after a clean iteration
    pub tick: Duration,

    pub heartbeat_interval: Duration,

    /// Health report interval
    pub monitor_interval: Duration,

    pub update_check_interval: Duration,

    /// Sleep after a failed iteration
    pub retry_delay: Duration,

    /// Failed iterations tolerated before cooling down
    pub max_consecutive_errors: u32,

    /// Sleep after a failed iteration once the threshold is exceeded
    pub error_wait: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(60),
            update_check_interval: Duration::from_secs(600),
            retry_delay: Duration::from_secs(5),
            max_consecutive_errors: 5,
            error_wait: Duration::from_secs(30),
        }
    }
}

/// Periodic actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledTask {
    Heartbeat,
    Monitor,
    UpdateCheck,
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScheduledTask::Heartbeat => "heartbeat",
            ScheduledTask::Monitor => "monitor",
            ScheduledTask::UpdateCheck => "update_check",
        })
    }
}

/// Executes scheduled tasks and owns the stop flag the loop obeys
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run one task. An error counts against the iteration.
    async fn run_task(&self, task: ScheduledTask) -> Result<(), AgentError>;

    fn stop_requested(&self) -> bool;

    /// Resolves once a stop has been requested
    async fn stopped(&self);
}

/// Consecutive-error backoff for the scheduler loop
#[derive(Debug, Clone)]
pub struct ErrorBackoff {
    consecutive_errors: u32,
    max_consecutive_errors: u32,
    tick: Duration,
    retry_delay: Duration,
    error_wait: Duration,
}

impl ErrorBackoff {
    pub fn new(options: &Options) -> Self {
        Self {
            consecutive_errors: 0,
            max_consecutive_errors: options.max_consecutive_errors,
            tick: options.tick,
            retry_delay: options.retry_delay,
            error_wait: options.error_wait,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// More consecutive errors than tolerated
    pub fn is_cooling_down(&self) -> bool {
        self.consecutive_errors > self.max_consecutive_errors
    }

    /// Reset the counter; returns the sleep before the next iteration
    pub fn on_success(&mut self) -> Duration {
        self.consecutive_errors = 0;
        self.tick
    }

    /// Count a failed iteration; returns the sleep before the next one
    pub fn on_error(&mut self) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.is_cooling_down() {
            self.error_wait
        } else {
            self.retry_delay
        }
    }
}

struct Entry {
    task: ScheduledTask,
    interval: Duration,
    next_due: Instant,
}

/// Run the scheduler until the runner reports a stop.
///
/// Heartbeat and health report are due immediately; the update check first
/// fires after one interval. A failed task keeps its interval; the failure
/// ends the iteration and only lengthens the sleep before the next one.
pub async fn run<R, S, F>(options: &Options, runner: &R, sleep_fn: S)
where
    R: TaskRunner + ?Sized,
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Scheduler starting...");

    let start = Instant::now();
    let mut table = [
        Entry {
            task: ScheduledTask::Heartbeat,
            interval: options.heartbeat_interval,
            next_due: start,
        },
        Entry {
            task: ScheduledTask::Monitor,
            interval: options.monitor_interval,
            next_due: start,
        },
        Entry {
            task: ScheduledTask::UpdateCheck,
            interval: options.update_check_interval,
            next_due: start + options.update_check_interval,
        },
    ];
    let mut backoff = ErrorBackoff::new(options);

    loop {
        if runner.stop_requested() {
            info!("Scheduler stopping...");
            return;
        }

        let mut outcome = Ok(());
        for entry in table.iter_mut() {
            if entry.next_due > Instant::now() {
                continue;
            }
            debug!("Running scheduled task: {}", entry.task);
            let result = runner.run_task(entry.task).await;
            entry.next_due = Instant::now() + entry.interval;
            if let Err(e) = result {
                outcome = Err(e);
                break;
            }
        }

        let delay = match outcome {
            Ok(()) => backoff.on_success(),
            Err(e) => {
                let delay = backoff.on_error();
                error!(
                    "Error in scheduler loop (attempt {}): {}",
                    backoff.consecutive_errors(),
                    e
                );
                if backoff.is_cooling_down() {
                    warn!(
                        "Too many consecutive errors, waiting {:?} before retry",
                        delay
                    );
                }
                delay
            }
        };

        tokio::select! {
            _ = runner.stopped() => {}
            _ = sleep_fn(delay) => {}
        }
    }
}
