//! Periodic worker loops scheduled around the shutdown signal.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use cb_types::{CbError, CbResult};

use crate::config::{ScheduleConfig, ScheduleMode};
use crate::context::ShutdownSignal;

/// Outcome of one iteration that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    Completed,
    /// Not enough data to do anything useful; retried after the retry wait.
    Skipped(String),
}

/// Unit of work a worker loop repeats.
pub trait PeriodicTask: Send {
    fn name(&self) -> &str;

    fn run_once(&mut self) -> CbResult<Iteration>;

    /// Called once after the loop exits.
    fn on_stop(&mut self) {}
}

/// How long to wait before the next iteration.
fn next_wait(schedule: &ScheduleConfig, outcome: &CbResult<Iteration>, elapsed: Duration) -> Duration {
    match outcome {
        Ok(Iteration::Completed) => match schedule.mode {
            ScheduleMode::FixedInterval => schedule.interval().saturating_sub(elapsed),
            ScheduleMode::Continuous => Duration::ZERO,
        },
        Ok(Iteration::Skipped(_)) | Err(_) => schedule.retry_wait(),
    }
}

/// Run `task` until shutdown. Every wait is on the shutdown signal, so the
/// loop exits within one iteration of the signal firing.
pub fn run_periodic(task: &mut dyn PeriodicTask, schedule: &ScheduleConfig, shutdown: &ShutdownSignal) {
    let name = task.name().to_string();
    info!(
        worker = %name,
        mode = ?schedule.mode,
        interval_secs = schedule.interval_secs,
        retry_wait_secs = schedule.error_retry_wait_secs,
        "worker started"
    );

    let mut iterations: u64 = 0;
    while !shutdown.is_triggered() {
        let started = Instant::now();
        let outcome = task.run_once();
        let elapsed = started.elapsed();
        iterations += 1;

        match &outcome {
            Ok(Iteration::Completed) => info!(
                worker = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                "iteration completed"
            ),
            Ok(Iteration::Skipped(reason)) => info!(
                worker = %name,
                reason = %reason,
                retry_in_secs = schedule.error_retry_wait_secs,
                "iteration skipped"
            ),
            Err(err) => error!(
                worker = %name,
                error = %err,
                transient = err.is_transient(),
                retry_in_secs = schedule.error_retry_wait_secs,
                "iteration failed"
            ),
        }

        let wait = next_wait(schedule, &outcome, elapsed);
        if wait.is_zero() {
            if schedule.mode == ScheduleMode::FixedInterval && outcome.is_ok() {
                warn!(
                    worker = %name,
                    elapsed_secs = elapsed.as_secs_f64(),
                    interval_secs = schedule.interval_secs,
                    "iteration overran its interval, starting next immediately"
                );
            }
            continue;
        }
        if shutdown.wait_timeout(wait) {
            break;
        }
    }

    task.on_stop();
    info!(worker = %name, iterations, "worker stopped");
}

/// A spawned worker loop with a bounded join.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    done: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        mut task: Box<dyn PeriodicTask>,
        schedule: ScheduleConfig,
        shutdown: Arc<ShutdownSignal>,
    ) -> CbResult<Self> {
        let name = task.name().to_string();
        let (exit_tx, done) = bounded::<()>(0);
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _exit = exit_tx;
                run_periodic(task.as_mut(), &schedule, &shutdown);
            })
            .map_err(|e| CbError::Internal(format!("failed to spawn worker {}: {}", name, e)))?;

        Ok(Self {
            name,
            done,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the loop to exit. Returns whether it did.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.join.take() {
                    if handle.join().is_err() {
                        error!(worker = %self.name, "worker panicked");
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted task recording when each iteration started.
    struct Scripted {
        outcomes: Vec<CbResult<Iteration>>,
        starts: Arc<Mutex<Vec<Instant>>>,
        work: Duration,
    }

    impl PeriodicTask for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn run_once(&mut self) -> CbResult<Iteration> {
            self.starts.lock().push(Instant::now());
            std::thread::sleep(self.work);
            if self.outcomes.is_empty() {
                Ok(Iteration::Completed)
            } else {
                self.outcomes.remove(0)
            }
        }
    }

    fn schedule(mode: ScheduleMode, interval_secs: f64, retry_secs: f64) -> ScheduleConfig {
        ScheduleConfig {
            mode,
            interval_secs,
            error_retry_wait_secs: retry_secs,
        }
    }

    #[test]
    fn test_next_wait_rules() {
        let fixed = schedule(ScheduleMode::FixedInterval, 10.0, 3.0);
        let done: CbResult<Iteration> = Ok(Iteration::Completed);
        assert_eq!(next_wait(&fixed, &done, Duration::from_secs(4)), Duration::from_secs(6));
        assert_eq!(next_wait(&fixed, &done, Duration::from_secs(12)), Duration::ZERO);
        let failed: CbResult<Iteration> = Err(CbError::Internal("boom".to_string()));
        assert_eq!(next_wait(&fixed, &failed, Duration::ZERO), Duration::from_secs(3));
        let skipped: CbResult<Iteration> = Ok(Iteration::Skipped("no data".to_string()));
        assert_eq!(next_wait(&fixed, &skipped, Duration::ZERO), Duration::from_secs(3));

        let continuous = schedule(ScheduleMode::Continuous, 10.0, 3.0);
        assert_eq!(next_wait(&continuous, &done, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_fixed_interval_spacing_and_prompt_exit() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let task = Scripted {
            outcomes: Vec::new(),
            starts: Arc::clone(&starts),
            work: Duration::from_millis(10),
        };
        let shutdown = Arc::new(ShutdownSignal::new());
        let mut worker = WorkerHandle::spawn(
            Box::new(task),
            schedule(ScheduleMode::FixedInterval, 0.1, 1.0),
            Arc::clone(&shutdown),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(350));
        shutdown.trigger();
        let stop_requested = Instant::now();
        assert!(worker.join_timeout(Duration::from_secs(2)));
        assert!(stop_requested.elapsed() < Duration::from_millis(200));

        let starts = starts.lock();
        assert!(starts.len() >= 3, "only {} iterations", starts.len());
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(95));
        }
    }

    #[test]
    fn test_failure_waits_retry_then_recovers() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let task = Scripted {
            outcomes: vec![Err(CbError::Internal("read failed".to_string()))],
            starts: Arc::clone(&starts),
            work: Duration::from_millis(1),
        };
        let shutdown = Arc::new(ShutdownSignal::new());
        let mut worker = WorkerHandle::spawn(
            Box::new(task),
            schedule(ScheduleMode::Continuous, 0.0, 0.2),
            Arc::clone(&shutdown),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        shutdown.trigger();
        assert!(worker.join_timeout(Duration::from_secs(2)));

        let starts = starts.lock();
        assert!(starts.len() >= 2);
        assert!(starts[1] - starts[0] >= Duration::from_millis(190));
    }

    #[test]
    fn test_shutdown_before_start_runs_nothing() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let mut task = Scripted {
            outcomes: Vec::new(),
            starts: Arc::clone(&starts),
            work: Duration::ZERO,
        };
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        run_periodic(&mut task, &schedule(ScheduleMode::Continuous, 0.0, 0.0), &shutdown);
        assert!(starts.lock().is_empty());
    }

    #[test]
    fn test_join_timeout_reports_stuck_worker() {
        struct Stuck;
        impl PeriodicTask for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }
            fn run_once(&mut self) -> CbResult<Iteration> {
                std::thread::sleep(Duration::from_millis(400));
                Ok(Iteration::Completed)
            }
        }

        let shutdown = Arc::new(ShutdownSignal::new());
        let mut worker = WorkerHandle::spawn(
            Box::new(Stuck),
            schedule(ScheduleMode::FixedInterval, 60.0, 60.0),
            Arc::clone(&shutdown),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        assert!(!worker.join_timeout(Duration::from_millis(50)));
        assert!(worker.join_timeout(Duration::from_secs(2)));
    }
}
