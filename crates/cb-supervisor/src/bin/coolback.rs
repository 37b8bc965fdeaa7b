use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use cb_data::InMemoryTelemetry;
use cb_supervisor::{init_logging, AppConfig, AppContext, PlantSimulator, Supervisor};

const DEFAULT_CONFIG: &str = "config/coolback.json";

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COOLBACK_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    let config = AppConfig::load(&config_path).with_context(|| format!("loading {}", config_path))?;
    let logging = init_logging(&config.logging).context("initializing logging")?;
    info!(config = %config_path, devices = config.devices.len(), "coolback starting");

    // No live store is wired in; serve a simulated plant from memory.
    let store = Arc::new(InMemoryTelemetry::new());
    PlantSimulator::default().seed_history(&store, &config.devices, 6 * 60, Utc::now());

    let catalog = Arc::new(config.catalog()?);
    let ctx = Arc::new(AppContext::new(Arc::new(config), catalog, store.clone(), store));

    let mut supervisor = Supervisor::new(ctx)?;
    let signal = supervisor.shutdown_signal();
    ctrlc::set_handler(move || {
        signal.trigger();
    })
    .context("installing signal handler")?;

    supervisor.start()?;
    supervisor.run_until_shutdown();

    let report = supervisor.shutdown(Some(logging));
    println!("coolback stopped: {}", report);
    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
