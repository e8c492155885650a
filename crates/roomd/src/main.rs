use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use roomd::occupancy::monitor::RoomMonitor;
use roomd::platform::DevicePlatform;
use roomd::platform::MemoryPlatform;
use roomd::platform::CAPABILITY_CONTACT;
use roomd::platform::CAPABILITY_MOTION;
use roomd::store::FileStore;
use roomd::Config;
use roomd::LogLevel;
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Parser)]
#[command(name = "roomd", about = "Room occupancy inference daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "roomd.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    let level = args.log_level.unwrap_or(config.logging.level);
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(level))
        .init();

    tracing::info!("roomd starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    // In-memory platform standing in for a real device transport; configured
    // sensors are registered so each room's subscriptions come up.
    let platform = Arc::new(MemoryPlatform::new());
    for room in config.rooms.values() {
        for id in &room.door_sensors {
            platform.add_device(id, id, &[CAPABILITY_CONTACT]);
        }
        for id in &room.motion_sensors {
            platform.add_device(id, id, &[CAPABILITY_MOTION]);
        }
    }

    let store = Arc::new(FileStore::new(config.defaults.store_path.clone()));
    let options = config.defaults.monitor_options();

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for (name, room) in &config.rooms {
        tracing::info!(
            "Monitoring room '{}' ({} doors, {} motion sensors)",
            name,
            room.door_sensors.len(),
            room.motion_sensors.len()
        );

        let (monitor, handle) = RoomMonitor::new(
            platform.clone() as Arc<dyn DevicePlatform>,
            store.clone(),
            name.clone(),
            &room.door_sensors,
            &room.motion_sensors,
            options.clone(),
        )
        .await;

        // Log every state change with its trigger provenance
        let mut state_changes = handle.subscribe();
        let room_name = name.clone();
        tokio::spawn(async move {
            while let Ok(change) = state_changes.recv().await {
                tracing::info!(
                    room = %room_name,
                    state = %change.state,
                    device = change.trigger.device_name.as_deref().unwrap_or("-"),
                    "state change"
                );
            }
        });

        tasks.push(tokio::spawn(monitor.run()));
        handles.push(handle);
    }

    if handles.is_empty() {
        tracing::warn!("No rooms configured, nothing to monitor");
    }

    tracing::info!("All room monitors started, press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    for handle in &handles {
        handle.shutdown();
    }
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Monitor task failed during shutdown: {}", e);
        }
    }

    tracing::info!("roomd shutdown complete");
    Ok(())
}
