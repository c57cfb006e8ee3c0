//! Umount command - unmount the overlay, then the transport of a mounted volume.

use std::path::{PathBuf, absolute};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use rs3f_core::MountOrchestrator;
use rs3f_mount::{FuseSupervisor, RuntimeLayout, Toolbox};
use tracing::instrument;

use crate::config::Config;

#[derive(ClapArgs, Clone, Debug)]
pub struct Args {
    /// Directory the decrypted volume is mounted on
    #[arg(value_name = "TARGET")]
    pub target: PathBuf,
}

#[instrument(level = "info", name = "cmd::umount", skip_all, fields(target = %args.target.display()))]
pub fn execute(args: &Args, config: &Config, quiet: bool) -> Result<()> {
    let target = absolute(&args.target)
        .with_context(|| format!("cannot resolve target {}", args.target.display()))?;

    let supervisor = FuseSupervisor::new(RuntimeLayout::from_env()?, Toolbox::from_env())
        .with_mount_timeout(config.mount_timeout);
    let orchestrator = MountOrchestrator::new(supervisor);

    let state = orchestrator.umount(&target)?;
    if quiet {
        return Ok(());
    }
    if state.overlay_mounted {
        eprintln!("Unmounted {}", target.display());
    } else {
        eprintln!("Removed stranded transport mount of {}", target.display());
    }
    Ok(())
}
