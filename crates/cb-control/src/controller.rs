//! Per-device controller: history buffer, last good result and the
//! Idle/Running/Resetting state machine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use cb_types::{CancellationToken, CbResult, DeviceId, Observation, Setpoint};

use crate::task::{TaskHandle, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Running,
    Resetting,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::Resetting => "resetting",
        };
        f.write_str(s)
    }
}

/// Everything guarded by the state mutex.
#[derive(Debug)]
struct StateCell {
    state: ControllerState,
    active_id: Option<TaskId>,
    // Owned by the session; the controller only needs it to join on reset.
    active: Option<Weak<TaskHandle>>,
}

/// Owns one device's optimization state.
///
/// The state and params mutexes are never held at the same time, and neither
/// is held across a thread join.
#[derive(Debug)]
pub struct DeviceController {
    device: DeviceId,
    state: Mutex<StateCell>,
    params: Mutex<Option<Setpoint>>,
    history: Mutex<VecDeque<Observation>>,
    max_history: usize,
    cancel: CancellationToken,
    reset_join_timeout: Duration,
    resets: AtomicU64,
}

impl DeviceController {
    pub fn new(device: DeviceId, max_history: usize, reset_join_timeout: Duration) -> Self {
        let max_history = max_history.max(1);
        Self {
            device,
            state: Mutex::new(StateCell {
                state: ControllerState::Idle,
                active_id: None,
                active: None,
            }),
            params: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(max_history.min(1024))),
            max_history,
            cancel: CancellationToken::new(),
            reset_join_timeout,
            resets: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn state(&self) -> ControllerState {
        self.state.lock().state
    }

    pub fn is_idle(&self) -> bool {
        self.state() == ControllerState::Idle
    }

    /// Controller-wide token. Each run watches its own child of it, so
    /// raising this cancels the active run and any abandoned one.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of resets that actually ran.
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Move Idle -> Running, spawning the worker through `spawn` while the
    /// state mutex is held. `spawn` receives the task id and the run's own
    /// cancellation token.
    ///
    /// Returns `Ok(None)` without calling `spawn` when the controller is not
    /// idle. A spawn failure leaves the controller idle.
    pub fn try_start<F>(&self, spawn: F) -> CbResult<Option<Arc<TaskHandle>>>
    where
        F: FnOnce(TaskId, CancellationToken) -> CbResult<Arc<TaskHandle>>,
    {
        let mut cell = self.state.lock();
        if cell.state != ControllerState::Idle {
            info!(
                device = %self.device,
                state = %cell.state,
                "optimization already in progress, start ignored"
            );
            return Ok(None);
        }

        self.cancel.clear();
        let task = spawn(uuid::Uuid::new_v4(), self.cancel.child())?;
        cell.state = ControllerState::Running;
        cell.active_id = Some(task.id());
        cell.active = Some(Arc::downgrade(&task));
        debug!(device = %self.device, task = %task.id(), "controller running");
        Ok(Some(task))
    }

    /// Called by the worker when its run ends. Only the active task may move
    /// the controller back to Idle or publish a result; a late zombie or a
    /// worker finishing during reset is ignored.
    pub fn complete_run(&self, task_id: TaskId, result: Option<Setpoint>) -> bool {
        {
            let mut cell = self.state.lock();
            if cell.state != ControllerState::Running || cell.active_id != Some(task_id) {
                debug!(
                    device = %self.device,
                    task = %task_id,
                    state = %cell.state,
                    "stale run completion ignored"
                );
                return false;
            }
            cell.state = ControllerState::Idle;
            cell.active_id = None;
            cell.active = None;
        }

        if let Some(params) = result {
            *self.params.lock() = Some(params);
            debug!(device = %self.device, %params, "published new best params");
        }
        true
    }

    /// Return a stuck run's controller to Idle without waiting for it.
    pub fn force_idle(&self, task_id: TaskId) -> bool {
        let mut cell = self.state.lock();
        if cell.state != ControllerState::Running || cell.active_id != Some(task_id) {
            return false;
        }
        cell.state = ControllerState::Idle;
        cell.active_id = None;
        cell.active = None;
        warn!(device = %self.device, task = %task_id, "controller forced idle");
        true
    }

    /// Cancel any run, wait a bounded time for it, and return to Idle.
    ///
    /// Returns the last published params. A caller that finds a reset already
    /// in progress returns them immediately without resetting again.
    pub fn reset(&self) -> Option<Setpoint> {
        let task = {
            let mut cell = self.state.lock();
            if cell.state == ControllerState::Resetting {
                info!(device = %self.device, "reset already in progress");
                drop(cell);
                return self.previous_best();
            }
            cell.state = ControllerState::Resetting;
            self.cancel.cancel();
            cell.active.as_ref().and_then(Weak::upgrade)
        };

        if let Some(task) = task {
            if !task.join_timeout(self.reset_join_timeout) {
                warn!(
                    device = %self.device,
                    task = %task.id(),
                    timeout_secs = self.reset_join_timeout.as_secs_f64(),
                    "worker did not exit within reset timeout"
                );
            }
        }

        self.cancel.clear();
        {
            let mut cell = self.state.lock();
            cell.state = ControllerState::Idle;
            cell.active_id = None;
            cell.active = None;
        }
        self.resets.fetch_add(1, Ordering::Relaxed);
        info!(device = %self.device, "controller reset");
        self.previous_best()
    }

    pub fn previous_best(&self) -> Option<Setpoint> {
        *self.params.lock()
    }

    pub fn clear_previous_best(&self) {
        *self.params.lock() = None;
    }

    /// Append one observation, evicting the oldest past capacity.
    pub fn append_observation(&self, observation: Observation) {
        let mut history = self.history.lock();
        if history.len() == self.max_history {
            history.pop_front();
        }
        history.push_back(observation);
    }

    /// Replace the buffer with the newest `max_history` of `observations`.
    pub fn replace_history(&self, observations: Vec<Observation>) {
        let skip = observations.len().saturating_sub(self.max_history);
        let mut history = self.history.lock();
        history.clear();
        history.extend(observations.into_iter().skip(skip));
    }

    pub fn history_snapshot(&self) -> Vec<Observation> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}
