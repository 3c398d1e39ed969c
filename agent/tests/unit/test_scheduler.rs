//! Scheduler loop tests, run on a paused clock

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iotagent::app::state::StopFlag;
use iotagent::errors::AgentError;
use iotagent::workers::scheduler::{self, Options, ScheduledTask, TaskRunner};
use tokio::time::Instant;

struct FakeRunner {
    start: Instant,
    stop: Arc<StopFlag>,
    script: Mutex<HashMap<ScheduledTask, VecDeque<bool>>>,
    calls: Mutex<Vec<(ScheduledTask, Duration)>>,
}

impl FakeRunner {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            stop: Arc::new(StopFlag::new()),
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `task` fails its next `times` runs
    fn failing(self, task: ScheduledTask, times: usize) -> Self {
        self.scripted(task, &vec![false; times])
    }

    /// Outcomes of the next runs of `task`, `true` for success. Runs past the
    /// end of the script succeed.
    fn scripted(self, task: ScheduledTask, outcomes: &[bool]) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(task, outcomes.iter().copied().collect());
        self
    }

    fn stop_after(&self, delay: Duration) {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            stop.request();
        });
    }

    /// Seconds since start at which `task` ran
    fn runs(&self, task: ScheduledTask) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, at)| at.as_secs())
            .collect()
    }
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn run_task(&self, task: ScheduledTask) -> Result<(), AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((task, self.start.elapsed()));

        let succeeded = self
            .script
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(VecDeque::pop_front)
            .unwrap_or(true);
        if succeeded {
            Ok(())
        } else {
            Err(AgentError::Internal(format!("{} failed", task)))
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_requested()
    }

    async fn stopped(&self) {
        self.stop.wait().await
    }
}

fn options() -> Options {
    Options {
        tick: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(10),
        monitor_interval: Duration::from_secs(5),
        update_check_interval: Duration::from_secs(20),
        retry_delay: Duration::from_secs(5),
        max_consecutive_errors: 2,
        error_wait: Duration::from_secs(30),
    }
}

#[tokio::test(start_paused = true)]
async fn test_task_cadence() {
    let runner = FakeRunner::new();
    runner.stop_after(Duration::from_millis(24_500));

    scheduler::run(&options(), &runner, tokio::time::sleep).await;

    assert_eq!(runner.runs(ScheduledTask::Heartbeat), vec![0, 10, 20]);
    assert_eq!(runner.runs(ScheduledTask::Monitor), vec![0, 5, 10, 15, 20]);
    // The first update check waits a full interval
    assert_eq!(runner.runs(ScheduledTask::UpdateCheck), vec![20]);
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_errors_escalate_backoff() {
    let runner = FakeRunner::new().failing(ScheduledTask::UpdateCheck, 100);
    let options = Options {
        heartbeat_interval: Duration::from_secs(1000),
        monitor_interval: Duration::from_secs(1000),
        update_check_interval: Duration::from_secs(1),
        ..options()
    };
    runner.stop_after(Duration::from_secs(75));

    scheduler::run(&options, &runner, tokio::time::sleep).await;

    // retry_delay twice, then error_wait once past the threshold
    assert_eq!(
        runner.runs(ScheduledTask::UpdateCheck),
        vec![1, 6, 11, 41, 71]
    );
    // The stop interrupts the last error wait
    assert!(runner.start.elapsed() < Duration::from_secs(76));
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_keeps_its_interval() {
    let runner = FakeRunner::new().failing(ScheduledTask::Heartbeat, 2);
    let options = Options {
        heartbeat_interval: Duration::from_secs(20),
        monitor_interval: Duration::from_secs(1000),
        update_check_interval: Duration::from_secs(1000),
        ..options()
    };
    runner.stop_after(Duration::from_secs(45));

    scheduler::run(&options, &runner, tokio::time::sleep).await;

    // Failures are not retried early; the rest of the failed iteration runs
    // after the retry delay
    assert_eq!(runner.runs(ScheduledTask::Heartbeat), vec![0, 20, 40]);
    assert_eq!(runner.runs(ScheduledTask::Monitor), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_error_count() {
    let runner = FakeRunner::new().scripted(
        ScheduledTask::UpdateCheck,
        &[false, false, true, false, false, false],
    );
    let options = Options {
        heartbeat_interval: Duration::from_secs(1000),
        monitor_interval: Duration::from_secs(1000),
        update_check_interval: Duration::from_secs(1),
        ..options()
    };
    runner.stop_after(Duration::from_millis(52_500));

    scheduler::run(&options, &runner, tokio::time::sleep).await;

    // The success at 11 clears the count, so 12 and 17 retry quickly again
    // and only the third failure at 22 cools down
    assert_eq!(
        runner.runs(ScheduledTask::UpdateCheck),
        vec![1, 6, 11, 12, 17, 22, 52]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_start_runs_nothing() {
    let runner = FakeRunner::new();
    runner.stop.request();

    scheduler::run(&options(), &runner, tokio::time::sleep).await;

    assert!(runner.calls.lock().unwrap().is_empty());
}
