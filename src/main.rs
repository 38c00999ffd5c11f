//! Corsair device daemon.
//!
//! Takes no arguments: configuration comes from `config.json` next to the
//! database directory. Runs until a termination signal arrives, then
//! returns every device to hardware-autonomous mode and exits 0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use corsair_link_devices::config::{DaemonConfig, SchedulerConfig};
use corsair_link_devices::cooling::SpeedProfileStore;
use corsair_link_devices::device::registry::Registry;
use corsair_link_devices::device::DeviceContext;
use corsair_link_devices::storage::{Database, ProfileStore, RgbStore};
use corsair_link_devices::utils::HostSensors;

fn config_dir() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("corsair-link")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_dir = config_dir();
    let config = DaemonConfig::load(&config_dir).context("Failed to load config.json")?;
    let scheduler = SchedulerConfig::load(&config_dir).context("Failed to load scheduler.json")?;
    info!(
        address = config.listen_address,
        port = config.listen_port,
        scheduler = scheduler.enabled,
        "configuration loaded"
    );

    let database = Database::new(config.database_path.clone());
    database.ensure_layout().context("Failed to create database layout")?;
    let speeds = SpeedProfileStore::new(database.temperatures_dir());
    speeds
        .ensure_builtins()
        .context("Failed to seed built-in speed profiles")?;

    let registry = Registry::initialize(Arc::new(DeviceContext {
        profiles: ProfileStore::new(database.profiles_dir()),
        rgb: RgbStore::new(database.rgb_dir()),
        speeds,
        probe: Arc::new(HostSensors::new(&config.cpu_sensor_chip)),
    }))
    .context("Failed to initialize device registry")?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("Failed to install signal handler")?;

    info!("daemon running; send SIGINT or SIGTERM to stop");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    info!("termination signal received; restoring hardware mode");
    registry.stop_all();
    Ok(())
}
