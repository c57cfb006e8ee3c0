//! Mount command - mount a remote rs3f volume on a local directory.
//!
//! The passphrase is resolved before anything is mounted, and the interrupt handler is
//! only installed afterwards so that Ctrl+C still aborts an interactive prompt.

use std::path::{PathBuf, absolute};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use rs3f_core::template;
use rs3f_core::{
    CancelToken, CredentialResolver, FetchContext, FetcherKind, MountOrchestrator, MountSpec,
    VolumeRef,
};
use rs3f_mount::{FuseSupervisor, RuntimeLayout, Toolbox, install_cancel_handler};
use tracing::instrument;

use crate::config::Config;

#[derive(ClapArgs, Clone, Debug)]
pub struct Args {
    /// Volume to mount, as `volume[@server[:port]]`
    #[arg(value_name = "VOLUME")]
    pub volume: String,

    /// Directory to mount the decrypted volume on [default: from the mountpoint template]
    #[arg(value_name = "TARGET")]
    pub target: Option<PathBuf>,

    /// Create the encrypted volume if the server does not hold one yet
    #[arg(short = 'i', long)]
    pub allow_init: bool,

    /// Password sources to try, in order (comma separated: keepassxc, pass, stdin)
    #[arg(long, value_name = "FETCHERS", value_delimiter = ',')]
    pub password_fetchers: Option<Vec<FetcherKind>>,

    /// Password store key, with {volume}, {server} and {port} placeholders
    /// [default: rs3f/{volume}@{server}, plus :{port} when a port is given]
    #[arg(long, value_name = "PATTERN")]
    pub password_pattern: Option<String>,

    /// KeePassXC database to look the password up in
    #[arg(long, value_name = "PATH")]
    pub keepassxc_database: Option<PathBuf>,

    /// Extra argument passed to sshfs (repeatable)
    #[arg(long = "sshfs-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub sshfs_args: Vec<String>,

    /// Extra argument passed to gocryptfs (repeatable)
    #[arg(long = "gocryptfs-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub gocryptfs_args: Vec<String>,
}

#[instrument(level = "info", name = "cmd::mount", skip_all, fields(volume = %args.volume))]
pub fn execute(args: &Args, config: &Config, quiet: bool) -> Result<()> {
    let spec = build_spec(args, config)?;

    let cancel = CancelToken::new();
    let supervisor = FuseSupervisor::new(RuntimeLayout::from_env()?, Toolbox::from_env())
        .with_mount_timeout(config.mount_timeout)
        .with_cancel(&cancel);
    let orchestrator = MountOrchestrator::with_cancel(supervisor, cancel.clone());

    // Refuse before asking for a password.
    orchestrator.check_available(&spec.local_target)?;

    let resolver = CredentialResolver::new(FetchContext {
        keepassxc_database: spec.keepassxc_database.clone(),
        timeout: config.fetch_timeout,
        ..FetchContext::default()
    });
    let credential = resolver.resolve(&spec.identity, &spec.password_pattern, &spec.fetchers)?;

    install_cancel_handler(&cancel).context("failed to install signal handler")?;

    if !quiet {
        eprintln!(
            "Mounting {} on {}...",
            spec.identity,
            spec.local_target.display()
        );
    }
    let mounted = orchestrator.mount(&spec, &credential)?;
    if !quiet {
        eprintln!("Mounted {} on {}", spec.identity, mounted.target.display());
    }
    Ok(())
}

/// Merge the command line over the configuration.
fn build_spec(args: &Args, config: &Config) -> Result<MountSpec> {
    let volume: VolumeRef = args.volume.parse()?;
    let explicit_port = volume.port.is_some() || config.port.is_some();
    let identity = volume.resolve(config.server.as_deref(), config.port)?;

    let target = match &args.target {
        Some(target) => target.clone(),
        None => config.expand(&template::mountpoint(&config.mountpoint, &identity.volume)?),
    };
    let local_target = absolute(&target)
        .with_context(|| format!("cannot resolve target {}", target.display()))?;

    let password_pattern = args
        .password_pattern
        .clone()
        .unwrap_or_else(|| config.password_pattern_for(explicit_port).to_string());
    // Catch a bad pattern now rather than after the first fetcher ran.
    template::password_key(&password_pattern, &identity)?;

    Ok(MountSpec {
        identity,
        local_target,
        password_pattern,
        fetchers: args
            .password_fetchers
            .clone()
            .unwrap_or_else(|| config.fetchers.clone()),
        keepassxc_database: args
            .keepassxc_database
            .clone()
            .or_else(|| config.keepassxc_database.clone()),
        allow_init: args.allow_init,
        sshfs_extra_args: override_list(&args.sshfs_args, &config.sshfs_extra_args),
        gocryptfs_extra_args: override_list(&args.gocryptfs_args, &config.gocryptfs_extra_args),
    })
}

fn override_list(cli: &[String], config: &[String]) -> Vec<String> {
    let chosen = if cli.is_empty() { config } else { cli };
    chosen.to_vec()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use rs3f_core::{TemplateError, VolumeParseError};

    use super::*;

    fn config() -> Config {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rs3f.toml");
        std::fs::write(
            &path,
            r#"
[rs3f]
server = "nas"
port = 2222
mountpoint = "/mnt/{volume}"
fetchers = ["pass"]
sshfs_extra_args = ["-o", "compression=yes"]
"#,
        )
        .unwrap();
        Config::load(Some(&path)).unwrap()
    }

    fn args(volume: &str) -> Args {
        Args {
            volume: volume.to_string(),
            target: None,
            allow_init: false,
            password_fetchers: None,
            password_pattern: None,
            keepassxc_database: None,
            sshfs_args: Vec::new(),
            gocryptfs_args: Vec::new(),
        }
    }

    #[test]
    fn test_config_fills_in_defaults() {
        let spec = build_spec(&args("alice"), &config()).unwrap();

        assert_eq!(spec.identity.to_string(), "alice@nas:2222");
        assert_eq!(spec.local_target, Path::new("/mnt/alice"));
        assert_eq!(spec.fetchers, [FetcherKind::Pass]);
        assert_eq!(spec.password_pattern, "rs3f/{volume}@{server}:{port}");
        assert_eq!(spec.sshfs_extra_args, ["-o", "compression=yes"]);
        assert!(spec.gocryptfs_extra_args.is_empty());
        assert!(!spec.allow_init);
    }

    #[test]
    fn test_password_key_follows_port() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rs3f.toml");
        std::fs::write(&path, "[rs3f]\nserver = \"nas\"\n").unwrap();
        let mut config = Config::load(Some(&path)).unwrap();

        let spec = build_spec(&args("alice"), &config).unwrap();
        assert_eq!(spec.identity.port, 22);
        assert_eq!(spec.password_pattern, "rs3f/{volume}@{server}");

        let spec = build_spec(&args("alice@nas:22"), &config).unwrap();
        assert_eq!(spec.password_pattern, "rs3f/{volume}@{server}:{port}");

        config.port = Some(2022);
        let spec = build_spec(&args("alice"), &config).unwrap();
        assert_eq!(spec.password_pattern, "rs3f/{volume}@{server}:{port}");
    }

    #[test]
    fn test_command_line_wins() {
        let mut args = args("alice@backup:22");
        args.target = Some(PathBuf::from("/srv/alice"));
        args.password_fetchers = Some(vec![FetcherKind::Stdin]);
        args.password_pattern = Some("vol/{volume}".to_string());
        args.keepassxc_database = Some(PathBuf::from("/tmp/db.kdbx"));
        args.sshfs_args = vec!["-C".to_string()];
        args.allow_init = true;

        let spec = build_spec(&args, &config()).unwrap();

        assert_eq!(spec.identity.to_string(), "alice@backup:22");
        assert_eq!(spec.local_target, Path::new("/srv/alice"));
        assert_eq!(spec.fetchers, [FetcherKind::Stdin]);
        assert_eq!(spec.password_pattern, "vol/{volume}");
        assert_eq!(spec.keepassxc_database.as_deref(), Some(Path::new("/tmp/db.kdbx")));
        assert_eq!(spec.sshfs_extra_args, ["-C"]);
        assert!(spec.allow_init);
    }

    #[test]
    fn test_relative_target_is_made_absolute() {
        let mut args = args("alice");
        args.target = Some(PathBuf::from("vol"));

        let spec = build_spec(&args, &config()).unwrap();
        assert_eq!(
            spec.local_target,
            std::env::current_dir().unwrap().join("vol")
        );
    }

    #[test]
    fn test_invalid_volume() {
        let err = build_spec(&args("Bad!"), &config()).unwrap_err();
        assert!(err.downcast_ref::<VolumeParseError>().is_some());
    }

    #[test]
    fn test_bad_password_pattern() {
        let mut args = args("alice");
        args.password_pattern = Some("rs3f/{user}".to_string());

        let err = build_spec(&args, &config()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TemplateError>(),
            Some(TemplateError::UnknownPlaceholder { name, .. }) if name == "user"
        ));
    }
}
