//! Command-line entry point for the control-plane binary.
//!
//! Two subcommands:
//! - `run`: loads configuration, builds the device hub from the configured
//!   roster, connects every device, and parks until a shutdown signal.
//! - `check-config`: loads and validates configuration only; touches no
//!   hardware. Useful in CI and before a deployment roll.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scope_ctl::channel::ChannelControl;
use scope_ctl::config::Settings;
use scope_ctl::drivers::{mock_camera::MockCameraDriver, mock_optics::MockOpticsDriver};
use scope_ctl::hub::DeviceHub;
use scope_ctl::image::ImageManager;
use scope_ctl::supervisor::ExperimentSupervisor;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "scope_ctl", about = "Microscope instrument control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load configuration, connect devices, and run until interrupted.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Load and validate configuration without touching any hardware.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let settings = Settings::load(config_path.as_deref())?;
    init_tracing(&settings.log_level);
    tracing::info!("configuration loaded");

    let hub = DeviceHub::new(256);
    let mut device_names = Vec::new();
    // The camera needs its concrete `CameraDriver` handle kept alongside the
    // `dyn Driver` handle the hub owns, since the hub's storage only needs
    // the narrower trait (design §6 treats the acquisition operations as a
    // camera-specific extension, not part of every driver).
    let mut camera: Option<(String, Arc<dyn scope_ctl::driver::CameraDriver>)> = None;

    for (name, table) in &settings.devices {
        let driver_kind = table
            .get("driver")
            .and_then(|v| v.as_str())
            .context("device table missing 'driver'")?;
        match driver_kind {
            "mock_camera" => {
                let driver = MockCameraDriver::new();
                hub.add_device(name.clone(), driver.clone()).await;
                camera = Some((name.clone(), driver));
            }
            "mock_optics" => {
                hub.add_device(name.clone(), MockOpticsDriver::new()).await;
            }
            other => anyhow::bail!("unknown driver kind '{other}' for device '{name}'"),
        }
        device_names.push(name.clone());
    }

    hub.connect_all().await.context("failed to connect configured devices")?;
    tracing::info!(devices = ?device_names, "devices connected");

    let images = ImageManager::new(hub.clone());
    let presets = settings.channel_presets()?;
    let channel = ChannelControl::new(hub.clone(), presets);

    match camera {
        Some((camera_name, camera_driver)) => {
            let _supervisor = ExperimentSupervisor::new(
                hub.clone(),
                images,
                channel,
                camera_driver,
                camera_name,
                device_names,
            );
            tracing::info!("supervisor ready");
        }
        None => {
            tracing::warn!(
                "no camera device configured; live view and multi-channel acquisition are unavailable"
            );
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    hub.disconnect_all().await.context("failed to disconnect devices cleanly")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create async runtime")?;

    match cli.command {
        Command::Run { config } => runtime.block_on(run(config)),
        Command::CheckConfig { config } => {
            let settings = Settings::load(config.as_deref())?;
            println!("configuration is valid: {} device(s), {} channel preset(s)", settings.devices.len(), settings.channels.len());
            Ok(())
        }
    }
}
