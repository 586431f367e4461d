//! CLI Entry Point for rig_control
//!
//! Provides command-line access to the orchestration layer:
//! - listing serial ports
//! - printing the effective configuration
//! - compiling (and exporting) a pose file
//! - homing the rig and running an imaging pass, on hardware or against the
//!   built-in simulator
//!
//! # Usage
//!
//! ```bash
//! rig_control ports
//! rig_control config --config config/rig.toml
//! rig_control compile --poses scan.json --export scan.txt
//! rig_control home --simulate
//! rig_control run --poses scan.json --simulate
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rig_control::adapters::{self, MockTransportFactory, SerialTransportFactory, TransportFactory};
use rig_control::capture::sdk::CaptureSdk;
use rig_control::capture::MockCaptureSdk;
use rig_control::compiler;
use rig_control::config::RigConfig;
use rig_control::logging::{self, LoggingConfig, OutputFormat};
use rig_control::model::DeviceKind;
use rig_control::notify::TracingNotifier;
use rig_control::runner::{RunKind, RunState};
use rig_control::Orchestrator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Image quality the simulated cameras report (large fine JPEG).
const SIMULATED_QUALITY: u32 = 0x0013_FF0F;

#[derive(Parser)]
#[command(name = "rig_control")]
#[command(about = "Photogrammetry rig device orchestration", long_about = None)]
struct Cli {
    /// Rig configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports visible to the OS
    Ports,

    /// Print the effective configuration, after environment overrides
    Config,

    /// Compile a pose file and print or export the run
    Compile {
        /// JSON array of poses
        #[arg(long)]
        poses: PathBuf,

        /// Write the compiled run to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Home the rig, then run an imaging pass
    Run {
        /// JSON array of poses
        #[arg(long)]
        poses: PathBuf,

        /// Use the simulated rig and cameras
        #[arg(long)]
        simulate: bool,

        /// Give up after this many seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Home every connected positioner
    Home {
        /// Use the simulated rig
        #[arg(long)]
        simulate: bool,

        #[arg(long, default_value = "120")]
        timeout: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let mut logging_config = LoggingConfig::from_config(&config)?;
    if let Some(format) = &cli.log_format {
        let format: OutputFormat = format.parse()?;
        logging_config = logging_config.with_format(format);
    }
    logging::init(logging_config)?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Compile { poses, export } => compile(&config, &poses, export.as_deref()),
        Commands::Run {
            poses,
            simulate,
            timeout,
        } => run(&config, &poses, simulate, Duration::from_secs(timeout)),
        Commands::Home { simulate, timeout } => {
            home(&config, simulate, Duration::from_secs(timeout))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RigConfig> {
    let config = match path {
        Some(path) => RigConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RigConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn list_ports() -> Result<()> {
    let ports = adapters::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn compile(config: &RigConfig, poses: &Path, export: Option<&Path>) -> Result<()> {
    let poses = compiler::load_poses(poses)
        .with_context(|| format!("reading poses from {}", poses.display()))?;
    let actions = compiler::compile(&poses, &config.devices())?;
    match export {
        Some(path) => {
            compiler::export(&actions, path)
                .with_context(|| format!("exporting to {}", path.display()))?;
            info!(actions = actions.len(), path = %path.display(), "Run exported");
        }
        None => {
            for line in compiler::export_lines(&actions) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn build_rig(config: &RigConfig, simulate: bool) -> Orchestrator {
    let notifier = Arc::new(TracingNotifier);
    let cameras: Vec<String> = config
        .devices()
        .into_iter()
        .filter(|d| d.kind == DeviceKind::RemoteCapture)
        .map(|d| d.hardware_id.unwrap_or(d.name))
        .collect();

    if simulate {
        let factory: Arc<dyn TransportFactory> = Arc::new(MockTransportFactory::simulated_locked());
        let sdk = MockCaptureSdk::new();
        for hardware_id in &cameras {
            sdk.add_camera(hardware_id, SIMULATED_QUALITY);
        }
        let sdk: Arc<dyn CaptureSdk> = Arc::new(sdk);
        return Orchestrator::new(config, notifier, factory, Some(sdk));
    }

    if !cameras.is_empty() {
        warn!(
            count = cameras.len(),
            "No vendor capture SDK is linked; remote-capture devices are disabled"
        );
    }
    let factory: Arc<dyn TransportFactory> =
        Arc::new(SerialTransportFactory::new(config.serial.clone()));
    Orchestrator::new(config, notifier, factory, None)
}

fn connect(rig: &Orchestrator, timeout: Duration) -> Result<()> {
    if rig.configured_ports().is_empty() {
        bail!("no device in the configuration is bound to a serial port");
    }
    rig.connect_all().context("connecting to the rig")?;
    if !rig.wait_until_ready(timeout) {
        bail!("rig did not report ready within {}s", timeout.as_secs());
    }
    Ok(())
}

fn home(config: &RigConfig, simulate: bool, timeout: Duration) -> Result<()> {
    let rig = build_rig(config, simulate);
    connect(&rig, timeout)?;
    rig.start_homing()?;
    let state = rig.wait_for_run(RunKind::Homing, timeout);
    rig.disconnect()?;
    if state != RunState::Complete {
        bail!("homing ended {state}");
    }
    println!("Homing complete");
    Ok(())
}

fn run(config: &RigConfig, poses: &Path, simulate: bool, timeout: Duration) -> Result<()> {
    let poses = compiler::load_poses(poses)
        .with_context(|| format!("reading poses from {}", poses.display()))?;
    let rig = build_rig(config, simulate);
    connect(&rig, timeout)?;

    rig.start_homing()?;
    let homed = rig.wait_for_run(RunKind::Homing, timeout);
    if homed != RunState::Complete {
        rig.disconnect()?;
        bail!("homing ended {homed}");
    }

    rig.start_imaging(&poses)?;
    let state = rig.wait_for_run(RunKind::Imaging, timeout);
    rig.disconnect()?;
    if state != RunState::Complete {
        bail!("imaging ended {state}");
    }
    println!("Imaging complete: {} pose(s)", poses.len());
    Ok(())
}
