//! One strategy bound to one controller: runs the search on a worker
//! thread, bounds the wait for it and tracks workers that ignore
//! cancellation.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use cb_optimizer::{build_strategy, Objective, OptimizerSettings, SearchStrategy};
use cb_types::{
    CbResult, ControlError, ObservedState, SafetyBounds, Setpoint, StrategyError, StrategyResult,
};

use crate::controller::DeviceController;
use crate::task::{TaskHandle, TaskInfo};

/// Timing and buffer settings for sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default wait for a run in [`OptimizationSession::get_safe_params`].
    pub timeout_secs: f64,
    /// Extra wait after cancellation before a worker counts as a zombie.
    pub grace_secs: f64,
    /// How long a controller reset waits for the worker.
    pub reset_join_secs: f64,
    pub max_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600.0,
            grace_secs: 5.0,
            reset_join_secs: 30.0,
            max_history: 1000,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs_f64(self.grace_secs.max(0.0))
    }

    pub fn reset_join(&self) -> Duration {
        Duration::from_secs_f64(self.reset_join_secs.max(0.0))
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("timeout_secs", self.timeout_secs),
            ("grace_secs", self.grace_secs),
            ("reset_join_secs", self.reset_join_secs),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("session.{} must be positive, got {}", name, value));
            }
        }
        if self.max_history == 0 {
            return Err("session.max_history must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A worker that did not exit within the grace period after cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZombieRecord {
    pub task: TaskInfo,
    pub registered_at: DateTime<Utc>,
}

/// Unresolved task handles kept for diagnostics.
#[derive(Debug, Default)]
pub struct ZombieRegistry {
    entries: Mutex<Vec<(ZombieRecord, Arc<TaskHandle>)>>,
}

impl ZombieRegistry {
    pub fn register(&self, task: Arc<TaskHandle>) {
        let record = ZombieRecord {
            task: task.info().clone(),
            registered_at: Utc::now(),
        };
        warn!(
            device = %record.task.device,
            task = %record.task.id,
            thread = %record.task.thread_name,
            algorithm = %record.task.algorithm,
            started_at = %record.task.started_at,
            "worker ignored cancellation, registered as zombie"
        );
        self.entries.lock().push((record, task));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ZombieRecord> {
        self.entries.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    /// Number of registered zombies whose thread is still alive.
    pub fn alive(&self) -> usize {
        self.entries.lock().iter().filter(|(_, t)| !t.is_finished()).count()
    }

    /// Drop entries whose thread eventually exited; returns how many.
    pub fn prune_finished(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(record, task)| {
            let finished = task.is_finished();
            if finished {
                info!(task = %record.task.id, "zombie worker finally exited");
            }
            !finished
        });
        before - entries.len()
    }
}

/// What a worker hands back: the strategy it borrowed and the run outcome.
struct RunOutcome {
    strategy: Box<dyn SearchStrategy>,
    result: StrategyResult<Setpoint>,
}

struct InFlight {
    task: Arc<TaskHandle>,
    outcome: Receiver<RunOutcome>,
}

/// Binds one strategy to one [`DeviceController`].
///
/// The strategy is moved onto the worker for the duration of a run and
/// returned with the result. If a worker never comes back, a fresh strategy
/// is built from the settings for the next run.
pub struct OptimizationSession {
    controller: Arc<DeviceController>,
    settings: OptimizerSettings,
    bounds: SafetyBounds,
    config: SessionConfig,
    strategy: Mutex<Option<Box<dyn SearchStrategy>>>,
    in_flight: Mutex<Option<InFlight>>,
    initial_params: Mutex<Option<Setpoint>>,
    zombies: ZombieRegistry,
}

impl OptimizationSession {
    /// Build the configured strategy (with grid fallback) for `controller`.
    pub fn new(
        controller: Arc<DeviceController>,
        settings: OptimizerSettings,
        bounds: SafetyBounds,
        config: SessionConfig,
    ) -> Self {
        let strategy = build_strategy(&settings, &bounds, controller.cancel_token());
        Self::with_strategy(controller, strategy, settings, bounds, config)
    }

    /// Use a caller-built strategy. Each run rebinds it to that run's
    /// cancellation token.
    pub fn with_strategy(
        controller: Arc<DeviceController>,
        strategy: Box<dyn SearchStrategy>,
        settings: OptimizerSettings,
        bounds: SafetyBounds,
        config: SessionConfig,
    ) -> Self {
        info!(
            device = %controller.device(),
            algorithm = strategy.name(),
            timeout_secs = config.timeout_secs,
            grace_secs = config.grace_secs,
            "optimization session created"
        );
        Self {
            controller,
            settings,
            bounds,
            config,
            strategy: Mutex::new(Some(strategy)),
            in_flight: Mutex::new(None),
            initial_params: Mutex::new(None),
            zombies: ZombieRegistry::default(),
        }
    }

    pub fn controller(&self) -> &Arc<DeviceController> {
        &self.controller
    }

    pub fn bounds(&self) -> &SafetyBounds {
        &self.bounds
    }

    /// Name of the held strategy, or `None` while a worker owns it.
    pub fn algorithm(&self) -> Option<String> {
        self.strategy.lock().as_ref().map(|s| s.name().to_string())
    }

    pub fn is_running(&self) -> bool {
        self.in_flight
            .lock()
            .as_ref()
            .map_or(false, |f| !f.task.is_finished())
    }

    pub fn zombies(&self) -> &ZombieRegistry {
        &self.zombies
    }

    pub fn zombie_count(&self) -> usize {
        self.zombies.len()
    }

    /// Seed the next runs with a starting point.
    pub fn set_initial_params(&self, params: Setpoint) -> CbResult<()> {
        if !params.is_complete() {
            return Err(ControlError::InvalidInitialParams {
                message: format!("non-finite field in {}", params),
            }
            .into());
        }
        if !self.bounds.is_admissible(&params) {
            return Err(ControlError::InvalidInitialParams {
                message: format!("{} is outside the admissible ranges", params),
            }
            .into());
        }
        if !self.bounds.is_candidate_feasible(&params) {
            warn!(
                device = %self.controller.device(),
                %params,
                "initial params are outside the safe envelope and will be pruned"
            );
        }
        *self.initial_params.lock() = Some(params);
        Ok(())
    }

    /// Spawn a run against `observed` and return without waiting.
    ///
    /// Returns `Ok(false)` when the controller is not idle.
    pub fn start(&self, observed: ObservedState) -> CbResult<bool> {
        if observed.is_empty() {
            return Err(ControlError::EmptyObservedState {
                device: observed.device.to_string(),
            }
            .into());
        }

        self.reclaim_finished();
        let objective = Objective::new(
            self.controller.history_snapshot(),
            observed,
            self.bounds.clone(),
            self.settings.objective.clone(),
        );

        let controller = Arc::clone(&self.controller);
        let bounds = self.bounds.clone();
        let started = self.controller.try_start(|task_id, run_token| {
            let mut strategy = self
                .strategy
                .lock()
                .take()
                .unwrap_or_else(|| self.rebuild_strategy());
            strategy.bind_cancel(run_token);
            if let Some(initial) = *self.initial_params.lock() {
                strategy.set_initial_params(initial);
            }
            let algorithm = strategy.name().to_string();
            let (tx, rx) = bounded(1);

            let task = TaskHandle::spawn(task_id, self.controller.device(), &algorithm, move || {
                let result = strategy.optimize(&objective);
                match &result {
                    Ok(best) => info!(
                        device = %controller.device(),
                        algorithm = strategy.name(),
                        %best,
                        objective = strategy.best_objective(),
                        "optimization finished"
                    ),
                    Err(StrategyError::Pruned { evaluated }) => info!(
                        device = %controller.device(),
                        evaluated,
                        "optimization cancelled"
                    ),
                    Err(err) => warn!(
                        device = %controller.device(),
                        error = %err,
                        "optimization failed"
                    ),
                }
                let published = result.as_ref().ok().map(|best| bounds.clamp(best));
                controller.complete_run(task_id, published);
                // The receiver is gone once the run was abandoned.
                let _ = tx.send(RunOutcome { strategy, result });
            })?;

            *self.in_flight.lock() = Some(InFlight {
                task: Arc::clone(&task),
                outcome: rx,
            });
            Ok(task)
        })?;

        Ok(started.is_some())
    }

    /// Wait for the current run, bounded by `timeout` plus the grace period.
    ///
    /// Returns `None` when there is no run, it was cancelled, it failed, or
    /// it did not finish in time.
    pub fn await_result(&self, timeout: Duration) -> Option<Setpoint> {
        let Some(run) = self.in_flight.lock().take() else {
            debug!(device = %self.controller.device(), "no optimization in flight");
            return None;
        };

        match run.outcome.recv_timeout(timeout) {
            Ok(outcome) => return self.settle(outcome),
            Err(RecvTimeoutError::Disconnected) => return self.lost_worker(&run),
            Err(RecvTimeoutError::Timeout) => {}
        }

        warn!(
            device = %self.controller.device(),
            timeout_secs = timeout.as_secs_f64(),
            "optimization timed out, cancelling"
        );
        self.controller.cancel_token().cancel();

        match run.outcome.recv_timeout(self.config.grace()) {
            Ok(outcome) => self.settle(outcome),
            Err(RecvTimeoutError::Disconnected) => self.lost_worker(&run),
            Err(RecvTimeoutError::Timeout) => {
                self.zombies.register(Arc::clone(&run.task));
                self.controller.force_idle(run.task.id());
                None
            }
        }
    }

    /// Wait for the run and return a setpoint that is always safe to apply.
    pub fn get_safe_params(&self, defaults: &Setpoint) -> Setpoint {
        self.get_safe_params_within(self.config.timeout(), defaults)
    }

    pub fn get_safe_params_within(&self, timeout: Duration, defaults: &Setpoint) -> Setpoint {
        let device = self.controller.device().as_str();
        match self.await_result(timeout) {
            Some(params) if params.is_complete() => self.bounds.enforce(device, &params),
            Some(params) => {
                warn!(device, %params, "optimizer result incomplete, using defaults");
                self.bounds.enforce(device, defaults)
            }
            None => {
                warn!(device, "no optimizer result, using defaults");
                self.bounds.enforce(device, defaults)
            }
        }
    }

    /// Raise the cancellation flag for the current run. Idempotent.
    pub fn stop(&self) {
        match self.strategy.lock().as_ref() {
            Some(strategy) => strategy.stop(),
            None => self.controller.cancel_token().cancel(),
        }
    }

    /// Reset the controller and forget history, cached params and seeds.
    ///
    /// Returns the params cached before the reset.
    pub fn reset_optimization(&self) -> Option<Setpoint> {
        let cached = self.controller.reset();
        self.reclaim_finished();
        if let Some(run) = self.in_flight.lock().take() {
            warn!(
                device = %self.controller.device(),
                task = %run.task.id(),
                "abandoning worker that survived reset"
            );
        }
        self.controller.clear_history();
        self.controller.clear_previous_best();
        *self.initial_params.lock() = None;
        *self.strategy.lock() = Some(self.rebuild_strategy());
        info!(device = %self.controller.device(), "optimization state reset");
        cached
    }

    fn settle(&self, outcome: RunOutcome) -> Option<Setpoint> {
        let RunOutcome { strategy, result } = outcome;
        *self.strategy.lock() = Some(strategy);
        result.ok()
    }

    fn lost_worker(&self, run: &InFlight) -> Option<Setpoint> {
        error!(
            device = %self.controller.device(),
            task = %run.task.id(),
            "optimization worker exited without a result"
        );
        self.controller.force_idle(run.task.id());
        None
    }

    /// Take back the strategy from a run nobody awaited.
    fn reclaim_finished(&self) {
        let mut in_flight = self.in_flight.lock();
        let Some(run) = in_flight.as_ref() else {
            return;
        };
        match run.outcome.try_recv() {
            Ok(outcome) => {
                debug!(device = %self.controller.device(), "discarding unclaimed optimization result");
                *self.strategy.lock() = Some(outcome.strategy);
                *in_flight = None;
            }
            Err(TryRecvError::Disconnected) => *in_flight = None,
            Err(TryRecvError::Empty) => {}
        }
    }

    fn rebuild_strategy(&self) -> Box<dyn SearchStrategy> {
        debug!(device = %self.controller.device(), "rebuilding optimizer strategy");
        build_strategy(&self.settings, &self.bounds, self.controller.cancel_token())
    }
}
