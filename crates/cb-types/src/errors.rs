use thiserror::Error;

/// Main error type for the CoolBack system
#[derive(Error, Debug)]
pub enum CbError {
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CbError {
    /// Transient failures are retried by the worker loops after a wait;
    /// everything else is logged and the iteration is skipped.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CbError::Telemetry(TelemetryError::ReadFailed { .. })
                | CbError::Telemetry(TelemetryError::WriteFailed { .. })
                | CbError::Io(_)
        )
    }
}

/// Errors raised at the telemetry store boundary
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry read failed for client {client}: {message}")]
    ReadFailed { client: String, message: String },

    #[error("Telemetry write failed for client {client}: {message}")]
    WriteFailed { client: String, message: String },

    #[error("No data returned for query {query}")]
    EmptyResult { query: String },

    #[error("Unknown device: {device}")]
    UnknownDevice { device: String },

    #[error("Device {device} has no point for role {role}")]
    MissingPoint { device: String, role: String },

    #[error("Telemetry client {client} is closed")]
    Closed { client: String },
}

/// Search strategy errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrategyError {
    #[error("Search pruned by cancellation after {evaluated} evaluations")]
    Pruned { evaluated: usize },

    #[error("Invalid strategy configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown algorithm: {name}")]
    UnknownAlgorithm { name: String },

    #[error("No feasible candidate found after {evaluated} evaluations")]
    NoFeasibleCandidate { evaluated: usize },

    #[error("Strategy execution error: {message}")]
    ExecutionError { message: String },

    #[error("Strategy timeout: operation took longer than {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },
}

/// Controller and session errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Observed state for device {device} is empty")]
    EmptyObservedState { device: String },

    #[error("Invalid initial parameters: {message}")]
    InvalidInitialParams { message: String },

    #[error("Failed to spawn optimization worker: {message}")]
    SpawnFailed { message: String },

    #[error("Invalid control plan: {message}")]
    InvalidPlan { message: String },
}

/// Result type alias for CoolBack operations
pub type CbResult<T> = Result<T, CbError>;

/// Result type alias for strategy runs
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::CbError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::CbError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CbError::Config(format!($($arg)*))
    };
}
