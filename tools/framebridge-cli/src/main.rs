//! FrameBridge CLI: run a compositing host or a session, inspect state.
//!
//! Usage:
//!   framebridge host                    Run a compositing host until Ctrl+C
//!   framebridge session [OPTIONS]       Run a session with outputs and layers
//!   framebridge bus-info <NAME>         Show a Frame Bus header
//!   framebridge devices --catalog FILE  List devices in a catalog file
//!   framebridge check                   Check helpers and shared memory

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use framebridge_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "framebridge",
    about = "Realtime broadcast graphics to SDI, displays and streams",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the standard location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a compositing host with the software engine
    Host,

    /// Start a session, apply outputs, send layers and wait for Ctrl+C
    Session {
        /// Output configuration JSON
        #[arg(short, long)]
        outputs: Option<PathBuf>,

        /// Device catalog JSON
        #[arg(short, long)]
        catalog: Option<PathBuf>,

        /// Layer JSON files to send once the session is up
        #[arg(short, long)]
        layer: Vec<PathBuf>,

        /// Re-apply the last-known-good output on start
        #[arg(long)]
        restore: bool,

        /// Push frames to helpers on stdin instead of the Frame Bus
        #[arg(long)]
        legacy: bool,
    },

    /// Show the header of a Frame Bus region
    BusInfo {
        /// Frame Bus name
        name: String,

        /// Directory holding the region
        #[arg(long)]
        shm_dir: Option<PathBuf>,
    },

    /// List devices and ports from a catalog file
    Devices {
        #[arg(short, long)]
        catalog: PathBuf,
    },

    /// Check helper binaries and the shared-memory directory
    Check {
        /// Write the effective config to the standard location if none exists
        #[arg(long)]
        write_config: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {e}", path.display())),
        None => Ok(AppConfig::load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    framebridge_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Host => commands::host::run(config).await,
        Commands::Session {
            outputs,
            catalog,
            layer,
            restore,
            legacy,
        } => {
            if legacy {
                config.output.use_frame_bus = false;
            }
            commands::session::run(config, outputs, catalog, layer, restore).await
        }
        Commands::BusInfo { name, shm_dir } => {
            let dir = shm_dir.or_else(|| config.frame_bus.shm_dir.clone());
            commands::bus_info::run(&name, dir)
        }
        Commands::Devices { catalog } => commands::devices::run(catalog),
        Commands::Check { write_config } => commands::check::run(&config, write_config),
    }
}
