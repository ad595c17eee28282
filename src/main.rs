//! # Paperdock CLI (`pdk`)
//!
//! The `pdk` binary is the operator interface for Paperdock. It watches a
//! scanner inbox, walks each new document through an interactive review
//! flow, and files verified copies into the archive.
//!
//! ## Usage
//!
//! ```bash
//! pdk --config ./pdk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pdk init` | Write an example configuration file |
//! | `pdk check` | Validate the configuration and list pending inbox files |
//! | `pdk process <file>` | Review and archive a single file, no watching |
//! | `pdk run` | Watch the inbox and process documents as they arrive |

use clap::{Parser, Subcommand};
use paperdock::config;
use paperdock::extract::CommandExtractor;
use paperdock::nav::StdinInput;
use paperdock::orchestrator::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;

/// Paperdock — a watched-inbox ingestion pipeline for scanned documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Run `pdk init` to write a commented example.
#[derive(Parser)]
#[command(
    name = "pdk",
    about = "Paperdock — watched-inbox ingestion for scanned documents",
    version,
    long_about = "Paperdock watches an inbox for new scans, extracts bibliographic metadata \
    from multiple sources, reconciles their answers with operator help, matches each document \
    against a personal reference catalog, and files verified copies into an archive tree."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./pdk.toml`. All watch, extraction, catalog, matching,
    /// and archive settings are read from this file.
    #[arg(long, global = true, default_value = "./pdk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration file.
    ///
    /// Refuses to overwrite an existing file.
    Init,

    /// Validate the configuration and report pending inbox files.
    ///
    /// Loads and validates the config, probes archive reachability through
    /// the configured bridge, then scans the inbox once and lists the
    /// size-stable files that `pdk run` would pick up.
    Check,

    /// Review and archive a single file without watching.
    Process {
        /// Path to the document to process.
        file: PathBuf,
    },

    /// Watch the inbox and process new documents as they arrive.
    ///
    /// Holds a single-instance guard on the inbox; a second `pdk run`
    /// against the same inbox refuses to start.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("paperdock=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        if cli.config.exists() {
            anyhow::bail!("{} already exists, not overwriting", cli.config.display());
        }
        std::fs::write(&cli.config, config::EXAMPLE_CONFIG)?;
        println!("Wrote example configuration to {}", cli.config.display());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let extractor = Arc::new(CommandExtractor::new(cfg.extraction.clone()));
    let orchestrator = Orchestrator::new(cfg, extractor);

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Check => {
            println!("Configuration OK.");
            if orchestrator.archive_accessible().await {
                println!("Archive root reachable.");
            } else {
                println!("WARNING: archive root is not reachable with the current bridge setup.");
            }
            let pending = orchestrator.preview()?;
            if pending.is_empty() {
                println!("No pending files in the inbox.");
            } else {
                println!("{} pending file(s):", pending.len());
                for detection in pending {
                    println!("  {} ({} bytes)", detection.path.display(), detection.len);
                }
            }
        }
        Commands::Process { file } => {
            let mut input = StdinInput::new();
            let state = orchestrator.process_path(&file, &mut input).await?;
            println!("Final state: {}", state);
        }
        Commands::Run => {
            let mut input = StdinInput::new();
            orchestrator.run_daemon(&mut input).await?;
        }
    }

    Ok(())
}
