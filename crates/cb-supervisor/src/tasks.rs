//! The three periodic tasks: forecaster training, forecast inference and
//! setpoint optimization.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use cb_control::{ControlPlan, OptimizationSession};
use cb_data::{
    DeviceCatalog, Forecaster, LinearTrendForecaster, QuerySpec, TelemetryFrame, WriteMetadata, WriteSpec,
};
use cb_types::{
    CbResult, DeviceId, Observation, ObservationSource, PointId, PointRole, Setpoint, TelemetryError,
};

use crate::context::{clients, AppContext};
use crate::worker::{Iteration, PeriodicTask};

const SHUTDOWN_REQUESTED: &str = "shutdown requested";

/// How closely a reported setpoint must track a written command to count
/// as applied by optimization.
const COMMAND_TEMPERATURE_TOLERANCE: f64 = 0.05;
const COMMAND_HUMIDITY_TOLERANCE: f64 = 0.5;

/// Forecaster shared between training (writer) and inference (reader).
pub type SharedForecaster = Arc<RwLock<LinearTrendForecaster>>;

fn catalog_points(catalog: &dyn DeviceCatalog) -> CbResult<Vec<PointId>> {
    let mut points = Vec::new();
    for device in catalog.get_devices() {
        points.extend(catalog.get_device_points(&device)?.into_values());
    }
    points.sort();
    points.dedup();
    Ok(points)
}

fn history_query(ctx: &AppContext, points: Vec<PointId>) -> QuerySpec {
    QuerySpec::trailing(
        points,
        chrono::Duration::seconds(ctx.config.telemetry.history_window_secs),
    )
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

pub struct TrainingTask {
    ctx: Arc<AppContext>,
    forecaster: SharedForecaster,
}

impl TrainingTask {
    pub fn new(ctx: Arc<AppContext>, forecaster: SharedForecaster) -> Self {
        Self { ctx, forecaster }
    }
}

impl PeriodicTask for TrainingTask {
    fn name(&self) -> &str {
        "prediction-training"
    }

    fn run_once(&mut self) -> CbResult<Iteration> {
        let points = catalog_points(self.ctx.catalog.as_ref())?;
        let history = self
            .ctx
            .reader
            .read(clients::DC_STATUS, &history_query(&self.ctx, points))?;
        if history.is_empty() {
            return Ok(Iteration::Skipped("no history returned".to_string()));
        }
        if self.ctx.is_shutting_down() {
            return Ok(Iteration::Skipped(SHUTDOWN_REQUESTED.to_string()));
        }

        let settings = &self.ctx.config.telemetry;
        let mut model = LinearTrendForecaster::new(settings.forecast_min_samples);
        let fitted = model.fit(&history);
        if fitted == 0 {
            return Ok(Iteration::Skipped(format!(
                "no point has {} samples yet",
                settings.forecast_min_samples
            )));
        }

        self.ctx.critical.run(|| model.save(&settings.checkpoint_path))?;
        *self.forecaster.write() = model;
        info!(
            points = fitted,
            checkpoint = %settings.checkpoint_path,
            "forecaster trained"
        );
        Ok(Iteration::Completed)
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

pub struct InferenceTask {
    ctx: Arc<AppContext>,
    forecaster: SharedForecaster,
}

impl InferenceTask {
    pub fn new(ctx: Arc<AppContext>, forecaster: SharedForecaster) -> Self {
        Self { ctx, forecaster }
    }
}

impl PeriodicTask for InferenceTask {
    fn name(&self) -> &str {
        "prediction-inference"
    }

    fn run_once(&mut self) -> CbResult<Iteration> {
        let horizon = chrono::Duration::seconds(self.ctx.config.telemetry.forecast_horizon_secs);
        let at = Utc::now() + horizon;
        let (predictions, trained_at) = {
            let forecaster = self.forecaster.read();
            if !forecaster.is_trained() {
                return Ok(Iteration::Skipped("forecaster not trained yet".to_string()));
            }
            (forecaster.predict(at), forecaster.trained_at())
        };

        let values: HashMap<PointId, f64> = predictions
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(point, v)| (format!("{}.forecast", point), v))
            .collect();
        if values.is_empty() {
            return Ok(Iteration::Skipped("forecaster produced no finite values".to_string()));
        }

        let mut spec = WriteSpec::new("prediction");
        spec.timestamp = at;
        let metadata: WriteMetadata = [
            ("horizon_secs".to_string(), json!(horizon.num_seconds())),
            ("trained_at".to_string(), json!(trained_at.map(|t| t.to_rfc3339()))),
        ]
        .into_iter()
        .collect();

        let Some(written) = self
            .ctx
            .run_critical(|| self.ctx.writer.write(clients::PREDICTION, &spec, &values, &metadata))
        else {
            return Ok(Iteration::Skipped(SHUTDOWN_REQUESTED.to_string()));
        };
        if !written {
            return Err(TelemetryError::WriteFailed {
                client: clients::PREDICTION.to_string(),
                message: format!("{} forecast values not acknowledged", values.len()),
            }
            .into());
        }
        debug!(points = values.len(), "forecasts written");
        Ok(Iteration::Completed)
    }
}

// ---------------------------------------------------------------------------
// Optimization
// ---------------------------------------------------------------------------

/// One controlled device: its points and its session.
pub struct DeviceSlot {
    pub device: DeviceId,
    pub points: HashMap<PointRole, PointId>,
    pub session: Arc<OptimizationSession>,
}

pub struct OptimizationTask {
    ctx: Arc<AppContext>,
    slots: Vec<DeviceSlot>,
    /// Last acknowledged command per device, as the device would report it.
    commanded: HashMap<DeviceId, (Setpoint, DateTime<Utc>)>,
}

impl OptimizationTask {
    pub fn new(ctx: Arc<AppContext>, slots: Vec<DeviceSlot>) -> Self {
        Self {
            ctx,
            slots,
            commanded: HashMap::new(),
        }
    }

    /// Mark rows recorded after our last command to `device` while its
    /// setpoint still matched that command.
    fn tag_commanded(&self, device: &DeviceId, observations: Vec<Observation>) -> Vec<Observation> {
        let Some((command, written_at)) = self.commanded.get(device) else {
            return observations;
        };
        observations
            .into_iter()
            .map(|obs| {
                let ours = obs.timestamp > *written_at
                    && obs.setpoint.matches(command, COMMAND_TEMPERATURE_TOLERANCE, COMMAND_HUMIDITY_TOLERANCE);
                if ours {
                    obs.with_source(ObservationSource::Optimization)
                } else {
                    obs
                }
            })
            .collect()
    }

    fn device_ids(&self) -> Vec<DeviceId> {
        self.slots.iter().map(|s| s.device.clone()).collect()
    }

    /// Refresh each controller's history and start a run for every device
    /// with a fresh current state. Returns how many runs started.
    fn start_runs(&self, frame: &TelemetryFrame) -> usize {
        let safety = &self.ctx.config.safety;
        let freshness = chrono::Duration::seconds(self.ctx.config.telemetry.current_window_secs);
        let now = Utc::now();
        let mut started = 0;

        for slot in &self.slots {
            let controller = slot.session.controller();
            let observations = self.tag_commanded(
                &slot.device,
                frame.observations(&slot.device, &slot.points, safety.default_setpoint.mode),
            );
            debug!(
                device = %slot.device,
                observations = observations.len(),
                commanded = observations.iter().filter(|o| o.applied_during_optimization()).count(),
                "history refreshed"
            );
            controller.replace_history(observations);

            let state = frame
                .latest_state(&slot.device, &slot.points, safety.default_setpoint.mode)
                .filter(|s| now - s.timestamp <= freshness && !s.is_empty());
            let Some(state) = state else {
                warn!(device = %slot.device, "no current state, device will receive defaults");
                continue;
            };

            match slot.session.start(state) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(err) => warn!(device = %slot.device, error = %err, "could not start optimization"),
            }
        }
        started
    }

    /// Write one command per device. Stops at the first device reached
    /// after shutdown was requested.
    fn write_plan(&mut self, plan: &ControlPlan) -> CbResult<Iteration> {
        let default_mode = self.ctx.config.safety.default_setpoint.mode;
        let mut failed = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            let Some(setpoint) = plan.setpoint(i) else { continue };
            let mut values = HashMap::new();
            for (role, value) in [
                (PointRole::SetpointTemperature, setpoint.temperature),
                (PointRole::SetpointHumidity, setpoint.humidity),
                (PointRole::Mode, setpoint.mode as f64),
            ] {
                if let Some(point) = slot.points.get(&role) {
                    values.insert(point.clone(), value);
                }
            }

            let spec = WriteSpec::new("control_command").with_tag("device", slot.device.as_str());
            let metadata: WriteMetadata = [
                ("algorithm".to_string(), json!(slot.session.algorithm())),
                ("fallback".to_string(), json!(plan.metadata.fallback)),
            ]
            .into_iter()
            .collect();

            let Some(written) = self
                .ctx
                .run_critical(|| self.ctx.writer.write(clients::OPTIMIZATION, &spec, &values, &metadata))
            else {
                info!(device = %slot.device, "shutdown requested, remaining commands withheld");
                return Ok(Iteration::Skipped(SHUTDOWN_REQUESTED.to_string()));
            };
            if written {
                info!(device = %slot.device, %setpoint, "control command written");
                // Devices without a mode point report the default mode.
                let reported = if slot.points.contains_key(&PointRole::Mode) {
                    setpoint
                } else {
                    Setpoint { mode: default_mode, ..setpoint }
                };
                self.commanded.insert(slot.device.clone(), (reported, spec.timestamp));
            } else {
                warn!(device = %slot.device, "control command not acknowledged");
                failed.push(slot.device.to_string());
            }
        }

        if failed.is_empty() {
            Ok(Iteration::Completed)
        } else {
            Err(TelemetryError::WriteFailed {
                client: clients::OPTIMIZATION.to_string(),
                message: format!("commands failed for {}", failed.join(", ")),
            }
            .into())
        }
    }

    fn stop_all(&self) {
        for slot in &self.slots {
            slot.session.stop();
        }
    }
}

impl PeriodicTask for OptimizationTask {
    fn name(&self) -> &str {
        "optimization"
    }

    fn run_once(&mut self) -> CbResult<Iteration> {
        let points = catalog_points(self.ctx.catalog.as_ref())?;
        let history = self
            .ctx
            .reader
            .read(clients::DC_STATUS, &history_query(&self.ctx, points))?;
        if history.is_empty() {
            return Ok(Iteration::Skipped("no telemetry returned".to_string()));
        }

        let frame = TelemetryFrame::align(&history);
        let started = self.start_runs(&frame);
        if started == 0 && self.slots.iter().all(|s| s.session.controller().is_idle()) {
            return Ok(Iteration::Skipped("no device has a current state".to_string()));
        }
        if self.ctx.is_shutting_down() {
            self.stop_all();
            return Ok(Iteration::Skipped(SHUTDOWN_REQUESTED.to_string()));
        }

        let defaults = self.ctx.config.safety.default_setpoint;
        let setpoints: Vec<_> = self
            .slots
            .iter()
            .map(|slot| slot.session.get_safe_params(&defaults))
            .collect();
        // Collecting results can wait out a whole session timeout.
        if self.ctx.is_shutting_down() {
            self.stop_all();
            return Ok(Iteration::Skipped(SHUTDOWN_REQUESTED.to_string()));
        }

        let plan = ControlPlan::finalize(
            Ok(ControlPlan::from_setpoints(&setpoints)),
            &self.ctx.config.safety,
            &defaults,
            &self.device_ids(),
        );
        self.write_plan(&plan)
    }

    fn on_stop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AppConfig;
    use cb_control::DeviceController;
    use cb_data::{DeviceSpec, InMemoryTelemetry};
    use std::time::Duration;

    pub(crate) const CONFIG: &str = r#"{
        "session": {"timeout_secs": 10, "grace_secs": 0.5},
        "optimizer": {"algorithm": "grid_search"},
        "devices": [
            {"id": "crac-01", "points": {
                "setpoint_temperature": "a.sp_t", "setpoint_humidity": "a.sp_h",
                "return_temperature": "a.rt", "return_humidity": "a.rh", "power": "a.kw"}},
            {"id": "crac-02", "points": {
                "setpoint_temperature": "b.sp_t", "setpoint_humidity": "b.sp_h",
                "return_temperature": "b.rt", "return_humidity": "b.rh", "power": "b.kw",
                "mode": "b.mode"}}
        ]
    }"#;

    /// Thirty minutes of one-minute samples for every device.
    pub(crate) fn seeded_store(config: &AppConfig) -> Arc<InMemoryTelemetry> {
        let store = Arc::new(InMemoryTelemetry::new());
        let now = Utc::now();
        for spec in &config.devices {
            for i in 0..30i64 {
                let ts = now - chrono::Duration::minutes(30 - i);
                let (t, h, kw) = if i % 2 == 0 { (22.0, 45.0, 100.0) } else { (24.0, 50.0, 150.0) };
                let p = |role: PointRole| spec.points.get(&role).cloned();
                for (role, value) in [
                    (PointRole::SetpointTemperature, t),
                    (PointRole::SetpointHumidity, h),
                    (PointRole::ReturnTemperature, 24.0),
                    (PointRole::ReturnHumidity, 50.0),
                    (PointRole::Power, kw),
                    (PointRole::Mode, 1.0),
                ] {
                    if let Some(point) = p(role) {
                        store.insert(&point, ts, value);
                    }
                }
            }
        }
        store
    }

    pub(crate) fn context_with(config: AppConfig, store: Arc<InMemoryTelemetry>) -> Arc<AppContext> {
        let catalog = Arc::new(config.catalog().unwrap());
        Arc::new(AppContext::new(Arc::new(config), catalog, store.clone(), store))
    }

    fn slots(ctx: &Arc<AppContext>) -> Vec<DeviceSlot> {
        ctx.config
            .devices
            .iter()
            .map(|spec: &DeviceSpec| {
                let controller = Arc::new(DeviceController::new(spec.id.clone(), 100, Duration::from_secs(2)));
                DeviceSlot {
                    device: spec.id.clone(),
                    points: spec.points.clone(),
                    session: Arc::new(OptimizationSession::new(
                        controller,
                        ctx.config.optimizer.clone(),
                        ctx.config.safety.clone(),
                        ctx.config.session.clone(),
                    )),
                }
            })
            .collect()
    }

    #[test]
    fn test_optimization_writes_one_command_per_device() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();
        let store = seeded_store(&config);
        let ctx = context_with(config, Arc::clone(&store));
        let mut task = OptimizationTask::new(Arc::clone(&ctx), slots(&ctx));

        assert_eq!(task.run_once().unwrap(), Iteration::Completed);
        let writes: Vec<_> = store
            .writes()
            .into_iter()
            .filter(|w| w.measurement == "control_command")
            .collect();
        assert_eq!(writes.len(), 2);
        for w in &writes {
            let t = w.values.iter().find(|(k, _)| k.ends_with("sp_t")).map(|(_, v)| *v).unwrap();
            assert!(ctx.config.safety.temperature.contains(t));
            assert_eq!(w.metadata["fallback"], json!(false));
        }
        // Only the second device maps a mode point.
        assert_eq!(writes.iter().filter(|w| w.values.contains_key("b.mode")).count(), 1);
        assert_eq!(ctx.critical.count(), 0);
    }

    #[test]
    fn test_shutdown_withholds_commands() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();
        let store = seeded_store(&config);
        let ctx = context_with(config, Arc::clone(&store));
        let slots = slots(&ctx);
        let controllers: Vec<_> = slots.iter().map(|s| Arc::clone(s.session.controller())).collect();
        let mut task = OptimizationTask::new(Arc::clone(&ctx), slots);

        ctx.shutdown.trigger();
        assert_eq!(
            task.run_once().unwrap(),
            Iteration::Skipped(SHUTDOWN_REQUESTED.to_string())
        );
        assert!(store.writes().iter().all(|w| w.measurement != "control_command"));
        assert_eq!(ctx.critical.count(), 0);
        for controller in &controllers {
            assert!(controller.cancel_token().is_cancelled());
        }
    }

    #[test]
    fn test_history_after_command_is_tagged() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();
        let store = seeded_store(&config);
        let ctx = context_with(config, Arc::clone(&store));
        let slots = slots(&ctx);
        let controller = Arc::clone(slots[0].session.controller());
        let mut task = OptimizationTask::new(Arc::clone(&ctx), slots);

        // Nothing commanded yet: every row is natural.
        assert_eq!(task.run_once().unwrap(), Iteration::Completed);
        let command = store
            .writes()
            .into_iter()
            .find(|w| w.measurement == "control_command" && w.values.contains_key("a.sp_t"))
            .unwrap();
        assert!(controller.history_snapshot().iter().all(|o| !o.applied_during_optimization()));

        // The device reports the commanded setpoint, then a manual override.
        let applied = command.timestamp + chrono::Duration::milliseconds(10);
        let overridden = applied + chrono::Duration::milliseconds(10);
        std::thread::sleep(Duration::from_millis(50));
        for (point, value) in [("a.rt", 23.5), ("a.rh", 48.0), ("a.kw", 120.0)] {
            store.insert(point, applied, value);
        }
        store.insert("a.sp_t", applied, command.values["a.sp_t"]);
        store.insert("a.sp_h", applied, command.values["a.sp_h"]);
        store.insert("a.sp_t", overridden, command.values["a.sp_t"] + 2.0);

        task.run_once().unwrap();
        let history = controller.history_snapshot();
        let tagged: Vec<_> = history.iter().filter(|o| o.applied_during_optimization()).collect();
        assert!(tagged.iter().any(|o| o.timestamp == applied));
        for o in &tagged {
            assert!(o.timestamp > command.timestamp && o.timestamp < overridden);
            assert_eq!(o.setpoint.temperature, command.values["a.sp_t"]);
        }
        let last = history.iter().find(|o| o.timestamp == overridden).unwrap();
        assert_eq!(last.source, ObservationSource::Natural);
        assert!(history
            .iter()
            .filter(|o| o.timestamp < command.timestamp)
            .all(|o| o.source == ObservationSource::Natural));
    }

    #[test]
    fn test_optimization_skips_without_telemetry() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();
        let ctx = context_with(config, Arc::new(InMemoryTelemetry::new()));
        let mut task = OptimizationTask::new(Arc::clone(&ctx), slots(&ctx));
        assert!(matches!(task.run_once().unwrap(), Iteration::Skipped(_)));
    }

    #[test]
    fn test_read_failure_is_transient_error() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();
        let store = seeded_store(&config);
        store.fail_next_reads(1);
        let ctx = context_with(config, Arc::clone(&store));
        let mut task = OptimizationTask::new(Arc::clone(&ctx), slots(&ctx));
        let err = task.run_once().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(task.run_once().unwrap(), Iteration::Completed);
    }

    #[test]
    fn test_write_failure_reported() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();
        let store = seeded_store(&config);
        store.set_fail_writes(true);
        let ctx = context_with(config, Arc::clone(&store));
        let mut task = OptimizationTask::new(Arc::clone(&ctx), slots(&ctx));
        assert!(task.run_once().unwrap_err().is_transient());
        assert_eq!(ctx.critical.count(), 0);
    }

    #[test]
    fn test_training_then_inference() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::from_json_str(CONFIG).unwrap();
        config.telemetry.checkpoint_path = dir.path().join("forecaster.json").display().to_string();
        let store = seeded_store(&config);
        let ctx = context_with(config, Arc::clone(&store));
        let forecaster: SharedForecaster = Arc::new(RwLock::new(LinearTrendForecaster::new(3)));

        let mut inference = InferenceTask::new(Arc::clone(&ctx), Arc::clone(&forecaster));
        assert!(matches!(inference.run_once().unwrap(), Iteration::Skipped(_)));

        let mut training = TrainingTask::new(Arc::clone(&ctx), Arc::clone(&forecaster));
        assert_eq!(training.run_once().unwrap(), Iteration::Completed);
        assert!(forecaster.read().is_trained());
        assert!(dir.path().join("forecaster.json").exists());

        assert_eq!(inference.run_once().unwrap(), Iteration::Completed);
        let predictions: Vec<_> = store
            .writes()
            .into_iter()
            .filter(|w| w.measurement == "prediction")
            .collect();
        assert_eq!(predictions.len(), 1);
        assert!(predictions[0].values.contains_key("a.kw.forecast"));
    }

    #[test]
    fn test_stale_state_skips_iteration() {
        let config = AppConfig::from_json_str(CONFIG).unwrap();
        let store = Arc::new(InMemoryTelemetry::new());
        // Only old data: history exists but no current state.
        let old = Utc::now() - chrono::Duration::hours(2);
        for point in ["a.sp_t", "b.sp_t"] {
            store.insert(point, old, 23.0);
        }
        let ctx = context_with(config, Arc::clone(&store));
        let mut task = OptimizationTask::new(Arc::clone(&ctx), slots(&ctx));
        assert!(matches!(task.run_once().unwrap(), Iteration::Skipped(_)));
        assert!(store.writes().is_empty());
    }
}
