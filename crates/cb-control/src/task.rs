//! Worker thread handle with a bounded join.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

use cb_types::{CbResult, ControlError, DeviceId};

/// Unique identifier of one optimization run.
pub type TaskId = Uuid;

/// Diagnostic snapshot of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub device: DeviceId,
    pub algorithm: String,
    pub thread_name: String,
    pub started_at: DateTime<Utc>,
}

/// Handle to a spawned worker thread.
///
/// The worker holds the sending half of a zero-traffic channel and drops it
/// on exit, including on panic, so every clone of the receiver observes
/// `Disconnected` once the thread is done. That turns thread exit into
/// something we can wait on with a timeout.
#[derive(Debug)]
pub struct TaskHandle {
    info: TaskInfo,
    done: Receiver<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub fn spawn<F>(id: TaskId, device: &DeviceId, algorithm: &str, work: F) -> CbResult<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        let (exit_tx, done) = bounded::<()>(0);
        let short_id = id.simple().to_string();
        let thread_name = format!("opt-{}-{}", device, &short_id[..8]);

        let join = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _exit = exit_tx;
                work();
            })
            .map_err(|e| ControlError::SpawnFailed {
                message: e.to_string(),
            })?;

        Ok(Arc::new(Self {
            info: TaskInfo {
                id,
                device: device.clone(),
                algorithm: algorithm.to_string(),
                thread_name,
                started_at: Utc::now(),
            },
            done,
            join: Mutex::new(Some(join)),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.info.id
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait up to `timeout` for the worker to exit. Returns `true` if it did.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            // Nothing is ever sent; any other outcome means the sender is gone.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.reap();
                true
            }
        }
    }

    /// Release the OS thread once it has fully terminated.
    fn reap(&self) {
        let mut slot = self.join.lock();
        if slot.as_ref().map_or(false, |h| h.is_finished()) {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_join_timeout_on_quick_task() {
        let task = TaskHandle::spawn(Uuid::new_v4(), &DeviceId::from("crac-01"), "grid_search", || {}).unwrap();
        assert!(task.join_timeout(Duration::from_secs(2)));
        assert!(task.is_finished());
        assert!(task.info().thread_name.starts_with("opt-crac-01-"));
    }

    #[test]
    fn test_join_timeout_expires_on_slow_task() {
        let task = TaskHandle::spawn(Uuid::new_v4(), &DeviceId::from("crac-01"), "slow", || {
            std::thread::sleep(Duration::from_millis(500));
        })
        .unwrap();

        let started = Instant::now();
        assert!(!task.join_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(!task.is_finished());
        assert!(task.join_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn test_panicking_task_counts_as_finished() {
        let task = TaskHandle::spawn(Uuid::new_v4(), &DeviceId::from("crac-01"), "panics", || {
            panic!("strategy blew up");
        })
        .unwrap();
        assert!(task.join_timeout(Duration::from_secs(2)));
    }
}
