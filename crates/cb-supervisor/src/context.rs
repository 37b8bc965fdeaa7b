//! Process-wide context shared by every worker.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use cb_data::{CommandWriter, DeviceCatalog, TelemetryReader};

use crate::config::AppConfig;
use crate::critical::CriticalSectionTracker;

/// Client keys handed to the telemetry store, one per concern.
pub mod clients {
    pub const DC_STATUS: &str = "dc_status";
    pub const PREDICTION: &str = "prediction";
    pub const OPTIMIZATION: &str = "optimization";
}

/// Broadcast shutdown flag. Triggering is idempotent and wakes every waiter.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` only for the call that actually set it.
    pub fn trigger(&self) -> bool {
        let mut triggered = self.triggered.lock();
        if *triggered {
            return false;
        }
        *triggered = true;
        self.cond.notify_all();
        info!("shutdown signal raised");
        true
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Block until triggered or `timeout` elapses. Returns whether the
    /// signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.triggered.lock();
        while !*triggered {
            if self.cond.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }
        *triggered
    }

    /// Block until triggered.
    pub fn wait(&self) {
        let mut triggered = self.triggered.lock();
        while !*triggered {
            self.cond.wait(&mut triggered);
        }
    }
}

/// Everything a worker needs, constructed once at startup.
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub shutdown: Arc<ShutdownSignal>,
    pub critical: CriticalSectionTracker,
    pub catalog: Arc<dyn DeviceCatalog>,
    pub reader: Arc<dyn TelemetryReader>,
    pub writer: Arc<dyn CommandWriter>,
}

impl AppContext {
    pub fn new(
        config: Arc<AppConfig>,
        catalog: Arc<dyn DeviceCatalog>,
        reader: Arc<dyn TelemetryReader>,
        writer: Arc<dyn CommandWriter>,
    ) -> Self {
        Self {
            config,
            shutdown: Arc::new(ShutdownSignal::new()),
            critical: CriticalSectionTracker::new(),
            catalog,
            reader,
            writer,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Run `f` inside a critical section, or return `None` once shutdown has
    /// been requested. The section is entered before the flag is read, so a
    /// drain that has seen zero sections is never followed by a write.
    pub fn run_critical<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let _section = self.critical.enter();
        if self.is_shutting_down() {
            return None;
        }
        Some(f())
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("devices", &self.catalog.get_devices().len())
            .field("shutdown", &self.shutdown.is_triggered())
            .field("critical_sections", &self.critical.count())
            .finish()
    }
}
