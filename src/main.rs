//! Synapse - tiered shared artifact store
//!
//! Command-line helper for inspecting a store's configuration and the
//! spill files it leaves on disk.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use synapse_store::{
    config::{LeaseBackendKind, LockMode, SynapseConfig},
    memory::SpillManager,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "synapse")]
#[command(version)]
#[command(about = "Tiered shared artifact store")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SYNAPSE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },

    /// Check that the configuration and storage directories are usable
    Doctor,

    /// List spill files and their recorded layout
    Spills,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("synapse_store={},synapse={}", log_level, log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &cli.config {
        Some(path) => SynapseConfig::load(path)?,
        None => SynapseConfig::default(),
    };

    match cli.command {
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
        Commands::Doctor => {
            run_doctor(&config, cli.config.as_deref());
        }
        Commands::Spills => {
            list_spills(&config)?;
        }
    }

    Ok(())
}

fn show_config(config: Option<&SynapseConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

fn run_doctor(config: &SynapseConfig, config_path: Option<&Path>) {
    println!("Synapse Doctor");
    println!();

    println!("Checking configuration...");
    match config_path {
        Some(path) => println!("  ✓ Loaded {}", path.display()),
        None => println!("  ℹ No configuration file given (using defaults)"),
    }
    match config.validate() {
        Ok(()) => println!("  ✓ Configuration is valid"),
        Err(e) => println!("  ✗ {}", e),
    }

    println!();
    println!("Checking storage directories...");
    report_dir("spill", &config.spill.directory);
    if config.lock.mode == LockMode::Distributed && config.lock.backend == LeaseBackendKind::File {
        report_dir("lease", &config.lock.directory);
    } else {
        println!("  ℹ Lease directory unused ({:?} locking)", config.lock.mode);
    }

    println!();
    println!("Doctor check complete!");
}

fn report_dir(label: &str, dir: &Path) {
    match check_writable(dir) {
        Ok(()) => println!("  ✓ {} directory writable: {}", label, dir.display()),
        Err(e) => println!("  ✗ {} directory {}: {}", label, dir.display(), e),
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let scratch = dir.join(format!(".doctor-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&scratch, b"ok")?;
    std::fs::remove_file(&scratch)
}

fn list_spills(config: &SynapseConfig) -> Result<()> {
    let spill = SpillManager::new(config.spill.directory.clone(), config.spill.verify_checksum)?;
    let descriptors = spill.list()?;
    if descriptors.is_empty() {
        println!("No spill files in {}", spill.directory().display());
        return Ok(());
    }

    println!("{} spill file(s) in {}", descriptors.len(), spill.directory().display());
    for d in descriptors {
        println!(
            "  {}  {} {:?}  {} bytes  written {}  sha256 {}",
            d.key,
            d.dtype,
            d.shape,
            d.len,
            d.written_at.to_rfc3339(),
            &d.checksum[..d.checksum.len().min(12)]
        );
    }
    Ok(())
}
