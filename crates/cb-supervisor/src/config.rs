//! Application configuration, loaded once at startup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use cb_control::SessionConfig;
use cb_data::{DeviceSpec, StaticCatalog};
use cb_optimizer::OptimizerSettings;
use cb_types::{config_error, CbResult, SafetyBounds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// Start iterations `interval` apart, waiting out the remainder.
    FixedInterval,
    /// Start the next iteration as soon as the previous one ends.
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub mode: ScheduleMode,
    pub interval_secs: f64,
    /// Wait after a failed or skipped iteration.
    pub error_retry_wait_secs: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::every(600.0)
    }
}

impl ScheduleConfig {
    pub fn every(interval_secs: f64) -> Self {
        Self {
            mode: ScheduleMode::FixedInterval,
            interval_secs,
            error_retry_wait_secs: 60.0,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs.max(0.0))
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs_f64(self.error_retry_wait_secs.max(0.0))
    }

    fn validate(&self, name: &str) -> CbResult<()> {
        if self.mode == ScheduleMode::FixedInterval && !(self.interval_secs.is_finite() && self.interval_secs > 0.0) {
            return Err(config_error!(
                "threads.{}.interval_secs must be positive, got {}",
                name,
                self.interval_secs
            ));
        }
        if !(self.error_retry_wait_secs.is_finite() && self.error_retry_wait_secs >= 0.0) {
            return Err(config_error!(
                "threads.{}.error_retry_wait_secs must be non-negative, got {}",
                name,
                self.error_retry_wait_secs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    pub prediction_training: ScheduleConfig,
    pub prediction_inference: ScheduleConfig,
    pub optimization: ScheduleConfig,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            prediction_training: ScheduleConfig::every(3600.0),
            prediction_inference: ScheduleConfig::every(60.0),
            optimization: ScheduleConfig::every(600.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Wait for in-flight critical sections.
    pub timeout_secs: f64,
    /// Wait for each worker loop to exit.
    pub worker_grace_secs: f64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30.0,
            worker_grace_secs: 5.0,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    pub fn worker_grace(&self) -> Duration {
        Duration::from_secs_f64(self.worker_grace_secs.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub file: String,
    /// Default filter directive; `RUST_LOG` overrides it.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            file: "coolback.log".to_string(),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Lookback used to build device history and train forecasts.
    pub history_window_secs: i64,
    /// Lookback used to find each device's current state.
    pub current_window_secs: i64,
    /// How far ahead inference predicts.
    pub forecast_horizon_secs: i64,
    /// Minimum samples per point before a trend is fitted.
    pub forecast_min_samples: usize,
    pub checkpoint_path: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_window_secs: 24 * 3600,
            current_window_secs: 15 * 60,
            forecast_horizon_secs: 10 * 60,
            forecast_min_samples: 3,
            checkpoint_path: "models/forecaster.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub threads: ThreadsConfig,
    pub shutdown: ShutdownConfig,
    pub session: SessionConfig,
    pub safety: SafetyBounds,
    pub optimizer: OptimizerSettings,
    pub logging: LoggingConfig,
    pub telemetry: TelemetryConfig,
    pub devices: Vec<DeviceSpec>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            threads: ThreadsConfig::default(),
            shutdown: ShutdownConfig::default(),
            session: SessionConfig::default(),
            safety: SafetyBounds::default(),
            optimizer: OptimizerSettings::default(),
            logging: LoggingConfig::default(),
            telemetry: TelemetryConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Read, parse and validate a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> CbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read config {}: {}", path.display(), e))?;
        Self::from_json_str(&text)
            .map_err(|e| config_error!("invalid config {}: {}", path.display(), e))
    }

    pub fn from_json_str(text: &str) -> CbResult<Self> {
        let config: AppConfig =
            serde_json::from_str(text).map_err(|e| config_error!("{}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CbResult<()> {
        // Device-level checks (non-empty, unique ids, required roles).
        self.catalog()?;

        self.safety
            .validate()
            .map_err(|e| config_error!("safety: {}", e))?;
        self.optimizer
            .objective
            .validate()
            .map_err(|e| config_error!("optimizer.objective: {}", e))?;
        self.session.validate().map_err(|e| config_error!("{}", e))?;

        self.threads.prediction_training.validate("prediction_training")?;
        self.threads.prediction_inference.validate("prediction_inference")?;
        self.threads.optimization.validate("optimization")?;

        if !(self.shutdown.timeout_secs.is_finite() && self.shutdown.timeout_secs >= 0.0)
            || !(self.shutdown.worker_grace_secs.is_finite() && self.shutdown.worker_grace_secs >= 0.0)
        {
            return Err(config_error!("shutdown timeouts must be non-negative"));
        }
        if self.telemetry.history_window_secs <= 0 || self.telemetry.current_window_secs <= 0 {
            return Err(config_error!("telemetry windows must be positive"));
        }
        Ok(())
    }

    pub fn catalog(&self) -> CbResult<StaticCatalog> {
        StaticCatalog::new(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "devices": [
            {
                "id": "crac-01",
                "name": "Row A",
                "points": {
                    "setpoint_temperature": "a.sp_t",
                    "setpoint_humidity": "a.sp_h",
                    "return_temperature": "a.rt",
                    "return_humidity": "a.rh",
                    "power": "a.kw"
                }
            }
        ]
    }"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = AppConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.threads.prediction_training.interval_secs, 3600.0);
        assert_eq!(config.threads.prediction_inference.interval_secs, 60.0);
        assert_eq!(config.threads.optimization.interval_secs, 600.0);
        assert_eq!(config.shutdown.timeout_secs, 30.0);
        assert_eq!(config.optimizer.objective.historical_weight, 0.7);
        assert_eq!(config.catalog().unwrap().len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.logging.file, "coolback.log");
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/coolback.json");
        let config = AppConfig::load(path).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.optimizer.algorithm, "bayesian");
        assert_eq!(config.session.timeout_secs, 600.0);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = AppConfig::load("/nonexistent/coolback.json").unwrap_err();
        assert!(matches!(err, cb_types::CbError::Config(_)));
    }

    #[test]
    fn test_empty_devices_rejected() {
        assert!(AppConfig::from_json_str("{}").is_err());
    }

    #[test]
    fn test_device_without_setpoint_rejected() {
        let text = r#"{"devices": [{"id": "crac-01", "points": {"power": "kw"}}]}"#;
        assert!(AppConfig::from_json_str(text).is_err());
    }

    #[test]
    fn test_bad_weight_and_interval_rejected() {
        let mut config = AppConfig::from_json_str(MINIMAL).unwrap();
        config.optimizer.objective.historical_weight = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_json_str(MINIMAL).unwrap();
        config.threads.optimization.interval_secs = 0.0;
        assert!(config.validate().is_err());
        config.threads.optimization.mode = ScheduleMode::Continuous;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = AppConfig::from_json_str(MINIMAL).unwrap();
        config.safety.temperature.min = 30.0;
        config.safety.temperature.max = 16.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schedule_mode_parsing() {
        let text = r#"{"mode": "continuous", "error_retry_wait_secs": 5}"#;
        let schedule: ScheduleConfig = serde_json::from_str(text).unwrap();
        assert_eq!(schedule.mode, ScheduleMode::Continuous);
        assert_eq!(schedule.retry_wait(), Duration::from_secs(5));
    }
}
