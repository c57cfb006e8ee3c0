#![deny(unsafe_code)]

mod commands;
mod config;
mod exit_code;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rs3f_core::{
    OrchestratorError, ResolutionError, SupervisorError, TemplateError, VolumeParseError,
};
use rs3f_mount::LayoutError;
use tracing_subscriber::EnvFilter;

use crate::commands::{mount, umount, version};
use crate::config::{Config, ConfigError};

/// Mount remote rs3f volumes: sshfs for transport, gocryptfs for encryption
#[derive(Parser)]
#[command(name = "rs3f")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Mount volume 'alice' from the configured server on ./alice
    rs3f mount alice

    # Mount from an explicit server and port onto a chosen directory
    rs3f mount alice@nas.example.org:2222 ~/secure

    # Only ask on the terminal, never consult a password store
    rs3f mount --password-fetchers stdin alice

    # Unmount again
    rs3f umount ~/secure
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress log output, progress and error messages
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug output, same as -vv
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file [default: ~/.config/rs3f/config.toml, then ~/.rs3f.toml]
    #[arg(long, value_name = "PATH", env = "RS3F_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a remote volume
    #[command(visible_alias = "open")]
    Mount(mount::Args),

    /// Unmount a mounted volume
    #[command(visible_alias = "close")]
    Umount(umount::Args),

    /// Print the version
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let quiet = cli.quiet;

    match run(cli) {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            if !quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::from(categorize_error(&e))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if !cli.quiet {
        let verbose = if cli.debug { cli.verbose.max(2) } else { cli.verbose };
        setup_tracing(verbose);
    }

    match cli.command {
        Commands::Version => version::execute(),
        Commands::Mount(args) => {
            mount::execute(&args, &Config::load(cli.config.as_deref())?, cli.quiet)
        }
        Commands::Umount(args) => {
            umount::execute(&args, &Config::load(cli.config.as_deref())?, cli.quiet)
        }
    }
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting.
///
/// The outermost typed error in the chain decides, so an orchestration failure caused
/// by a missing tool is still reported as such.
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(err) = cause.downcast_ref::<OrchestratorError>() {
            return match err {
                OrchestratorError::AlreadyMounted { .. } => exit_code::ALREADY_MOUNTED,
                OrchestratorError::NotMounted { .. } => exit_code::NOT_MOUNTED,
                OrchestratorError::Inspect { .. } => exit_code::GENERAL_ERROR,
                OrchestratorError::TransportMountFailed {
                    source: SupervisorError::MissingTool(_),
                    ..
                } => exit_code::MISSING_TOOL,
                OrchestratorError::TransportMountFailed { .. } => {
                    exit_code::TRANSPORT_MOUNT_FAILED
                }
                OrchestratorError::OverlayMountFailed { .. } => exit_code::OVERLAY_MOUNT_FAILED,
                OrchestratorError::OverlayUnmountFailed { .. } => {
                    exit_code::OVERLAY_UNMOUNT_FAILED
                }
                OrchestratorError::TransportUnmountFailed { .. } => {
                    exit_code::TRANSPORT_UNMOUNT_FAILED
                }
                OrchestratorError::RollbackFailed { .. } => exit_code::ROLLBACK_FAILED,
            };
        }

        if let Some(err) = cause.downcast_ref::<ResolutionError>() {
            return match err {
                ResolutionError::NoCredentialAvailable { .. } => exit_code::NO_CREDENTIAL,
                ResolutionError::Template(_) => exit_code::USAGE_ERROR,
            };
        }

        if let Some(SupervisorError::MissingTool(_)) = cause.downcast_ref::<SupervisorError>() {
            return exit_code::MISSING_TOOL;
        }

        if cause.is::<ConfigError>()
            || cause.is::<LayoutError>()
            || cause.is::<VolumeParseError>()
            || cause.is::<TemplateError>()
        {
            return exit_code::USAGE_ERROR;
        }
    }

    exit_code::GENERAL_ERROR
}
