//! # cb-supervisor
//!
//! Process supervision for CoolBack: configuration, logging, the three
//! periodic workers (forecaster training, forecast inference, setpoint
//! optimization) and the ordered shutdown that drains critical writes
//! before closing telemetry clients.

pub mod config;
pub mod context;
pub mod critical;
pub mod logging;
pub mod simulator;
pub mod supervisor;
pub mod tasks;
pub mod worker;

pub use config::{AppConfig, LoggingConfig, ScheduleConfig, ScheduleMode, ShutdownConfig, TelemetryConfig, ThreadsConfig};
pub use context::{clients, AppContext, ShutdownSignal};
pub use critical::{CriticalSection, CriticalSectionTracker};
pub use logging::{init_logging, LoggingGuard};
pub use simulator::PlantSimulator;
pub use supervisor::{ShutdownReport, Supervisor};
pub use tasks::{DeviceSlot, InferenceTask, OptimizationTask, SharedForecaster, TrainingTask};
pub use worker::{run_periodic, Iteration, PeriodicTask, WorkerHandle};
