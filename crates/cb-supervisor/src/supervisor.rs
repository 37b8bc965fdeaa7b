//! Startup and ordered shutdown of the worker loops.

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use cb_control::{DeviceController, OptimizationSession};
use cb_data::LinearTrendForecaster;
use cb_types::{internal_error, CbResult};

use crate::context::{AppContext, ShutdownSignal};
use crate::logging::LoggingGuard;
use crate::tasks::{DeviceSlot, InferenceTask, OptimizationTask, SharedForecaster, TrainingTask};
use crate::worker::WorkerHandle;

/// What happened during [`Supervisor::shutdown`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub critical_drained: bool,
    pub workers_joined: Vec<String>,
    pub workers_timed_out: Vec<String>,
    /// Optimization threads abandoned after ignoring cancellation.
    pub zombies: usize,
    pub io_closed: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.critical_drained && self.workers_timed_out.is_empty() && self.io_closed
    }
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "critical_drained={} joined=[{}] timed_out=[{}] zombies={} io_closed={}",
            self.critical_drained,
            self.workers_joined.join(", "),
            self.workers_timed_out.join(", "),
            self.zombies,
            self.io_closed
        )
    }
}

/// Owns the three worker loops and the per-device sessions.
pub struct Supervisor {
    ctx: Arc<AppContext>,
    forecaster: SharedForecaster,
    sessions: Vec<Arc<OptimizationSession>>,
    slots: Option<Vec<DeviceSlot>>,
    workers: Vec<WorkerHandle>,
}

impl Supervisor {
    pub fn new(ctx: Arc<AppContext>) -> CbResult<Self> {
        let config = &ctx.config;
        let mut slots = Vec::new();
        for device in ctx.catalog.get_devices() {
            let points = ctx.catalog.get_device_points(&device)?;
            let controller = Arc::new(DeviceController::new(
                device.clone(),
                config.session.max_history,
                config.session.reset_join(),
            ));
            let session = Arc::new(OptimizationSession::new(
                controller,
                config.optimizer.clone(),
                config.safety.clone(),
                config.session.clone(),
            ));
            slots.push(DeviceSlot {
                device,
                points,
                session,
            });
        }
        let sessions = slots.iter().map(|s| Arc::clone(&s.session)).collect();
        let forecaster = Arc::new(RwLock::new(restore_forecaster(
            &config.telemetry.checkpoint_path,
            config.telemetry.forecast_min_samples,
        )));

        info!(devices = slots.len(), "supervisor initialized");
        Ok(Self {
            ctx,
            forecaster,
            sessions,
            slots: Some(slots),
            workers: Vec::new(),
        })
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.ctx.shutdown)
    }

    pub fn sessions(&self) -> &[Arc<OptimizationSession>] {
        &self.sessions
    }

    /// Spawn the training, inference and optimization loops.
    pub fn start(&mut self) -> CbResult<()> {
        let slots = self
            .slots
            .take()
            .ok_or_else(|| internal_error!("supervisor already started"))?;
        let threads = &self.ctx.config.threads;
        let shutdown = Arc::clone(&self.ctx.shutdown);

        self.workers.push(WorkerHandle::spawn(
            Box::new(TrainingTask::new(Arc::clone(&self.ctx), Arc::clone(&self.forecaster))),
            threads.prediction_training.clone(),
            Arc::clone(&shutdown),
        )?);
        self.workers.push(WorkerHandle::spawn(
            Box::new(InferenceTask::new(Arc::clone(&self.ctx), Arc::clone(&self.forecaster))),
            threads.prediction_inference.clone(),
            Arc::clone(&shutdown),
        )?);
        self.workers.push(WorkerHandle::spawn(
            Box::new(OptimizationTask::new(Arc::clone(&self.ctx), slots)),
            threads.optimization.clone(),
            shutdown,
        )?);

        info!(workers = self.workers.len(), "all workers started");
        Ok(())
    }

    /// Block the calling thread until shutdown is requested.
    pub fn run_until_shutdown(&self) {
        self.ctx.shutdown.wait();
    }

    /// Stop everything in order: raise the signal, drain critical sections,
    /// cancel optimizations and join workers, close telemetry clients, then
    /// flush logs.
    pub fn shutdown(mut self, logging: Option<LoggingGuard>) -> ShutdownReport {
        let config = Arc::clone(&self.ctx.config);
        let mut report = ShutdownReport::default();

        self.ctx.shutdown.trigger();
        info!("shutdown started");

        report.critical_drained = self.ctx.critical.wait_for_drain(config.shutdown.timeout());

        for session in &self.sessions {
            session.stop();
        }
        for worker in &mut self.workers {
            if worker.join_timeout(config.shutdown.worker_grace()) {
                info!(worker = worker.name(), "worker joined");
                report.workers_joined.push(worker.name().to_string());
            } else {
                warn!(
                    worker = worker.name(),
                    grace_secs = config.shutdown.worker_grace_secs,
                    "worker did not stop in time"
                );
                report.workers_timed_out.push(worker.name().to_string());
            }
        }
        report.zombies = self.sessions.iter().map(|s| s.zombies().alive()).sum();

        self.ctx.reader.close();
        self.ctx.writer.close();
        report.io_closed = true;

        info!(clean = report.is_clean(), %report, "shutdown complete");
        if let Some(guard) = logging {
            guard.flush();
        }
        report
    }
}

fn restore_forecaster(path: &str, min_samples: usize) -> LinearTrendForecaster {
    if !Path::new(path).exists() {
        return LinearTrendForecaster::new(min_samples);
    }
    match LinearTrendForecaster::load(path) {
        Ok(model) => {
            info!(checkpoint = path, "forecaster restored");
            model
        }
        Err(err) => {
            warn!(checkpoint = path, error = %err, "checkpoint unreadable, starting untrained");
            LinearTrendForecaster::new(min_samples)
        }
    }
}
