//! Configuration file support for rs3f.
//!
//! The configuration is read from the first of these that exists:
//!
//! 1. `--config <path>` / `RS3F_CONFIG` (must exist)
//! 2. `~/.config/rs3f/config.toml` (`$XDG_CONFIG_HOME` is honoured)
//! 3. `~/.rs3f.toml`
//!
//! # Example configuration
//!
//! ```toml
//! [rs3f]
//! server = "nas.example.org"
//! port = 2222
//! mountpoint = "~/Volumes/{volume}"
//! fetchers = ["pass", "stdin"]
//! password_pattern = "rs3f/{volume}@{server}"
//! password_pattern_port = "rs3f/{volume}@{server}:{port}"
//! sshfs_extra_args = ["-o", "compression=yes"]
//! ```
//!
//! Command-line flags override everything set here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use rs3f_core::FetcherKind;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Mountpoint template used when neither the command line nor the file set one.
pub const DEFAULT_MOUNTPOINT: &str = "./{volume}";

/// Default password store key when no port was given.
pub const DEFAULT_PASSWORD_PATTERN: &str = "rs3f/{volume}@{server}";

/// Default password store key when a port was given on the command line or in the file.
pub const DEFAULT_PASSWORD_PATTERN_PORT: &str = "rs3f/{volume}@{server}:{port}";

/// Default KeePassXC database.
pub const DEFAULT_KEEPASSXC_DATABASE: &str = "~/Passwords.kdbx";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Errors from locating or parsing the configuration file. All of them are usage errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("config file {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for '{key}' in {}: {message}", path.display())]
    Invalid {
        path: PathBuf,
        key: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    rs3f: FileSettings,
}

/// The `[rs3f]` table as written in the file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    mountpoint: Option<String>,
    fetchers: Option<Vec<FetcherKind>>,
    password_pattern: Option<String>,
    password_pattern_port: Option<String>,
    keepassxc_database: Option<String>,
    server: Option<String>,
    port: Option<u16>,
    sshfs_extra_args: Option<Vec<String>>,
    gocryptfs_extra_args: Option<Vec<String>>,
    mount_timeout_secs: Option<u64>,
    fetch_timeout_secs: Option<u64>,
}

/// Effective settings: built-in defaults overlaid with the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Mountpoint template, `{volume}` is the only placeholder.
    pub mountpoint: String,
    /// Fetchers to try, in order.
    pub fetchers: Vec<FetcherKind>,
    /// Password store key template for volumes without an explicit port.
    pub password_pattern: String,
    /// Password store key template for volumes with an explicit port.
    pub password_pattern_port: String,
    /// KeePassXC database, `~` already expanded.
    pub keepassxc_database: Option<PathBuf>,
    /// Server for volumes given without `@server`.
    pub server: Option<String>,
    /// Port for volumes given without `:port`.
    pub port: Option<u16>,
    pub sshfs_extra_args: Vec<String>,
    pub gocryptfs_extra_args: Vec<String>,
    /// Bound for each sshfs, gocryptfs and fusermount run.
    pub mount_timeout: Duration,
    /// Bound for each password store lookup.
    pub fetch_timeout: Duration,
    /// Home directory used for `~` expansion.
    pub home: Option<PathBuf>,
}

impl Config {
    fn with_home(home: Option<PathBuf>) -> Self {
        Self {
            mountpoint: DEFAULT_MOUNTPOINT.to_string(),
            fetchers: vec![FetcherKind::KeepassXC, FetcherKind::Pass, FetcherKind::Stdin],
            password_pattern: DEFAULT_PASSWORD_PATTERN.to_string(),
            password_pattern_port: DEFAULT_PASSWORD_PATTERN_PORT.to_string(),
            keepassxc_database: Some(expand_tilde(DEFAULT_KEEPASSXC_DATABASE, home.as_deref())),
            server: None,
            port: None,
            sshfs_extra_args: Vec::new(),
            gocryptfs_extra_args: Vec::new(),
            mount_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            home,
        }
    }

    /// Load `explicit`, or the first default location that exists, or built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let dirs = BaseDirs::new();
        let home = dirs.as_ref().map(|d| d.home_dir().to_path_buf());

        let path = match explicit {
            Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => candidate_paths(dirs.as_ref()).into_iter().find(|p| p.exists()),
        };

        let Some(path) = path else {
            debug!("no config file found, using defaults");
            return Ok(Self::with_home(home));
        };

        debug!(path = %path.display(), "loading config file");
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&content, &path, home)
    }

    /// Parse the contents of the file at `path`.
    fn parse(content: &str, path: &Path, home: Option<PathBuf>) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = file.rs3f;
        let mut config = Self::with_home(home);

        if let Some(mountpoint) = settings.mountpoint {
            config.mountpoint = mountpoint;
        }
        if let Some(fetchers) = settings.fetchers {
            config.fetchers = fetchers;
        }
        if let Some(pattern) = settings.password_pattern {
            config.password_pattern = pattern;
        }
        if let Some(pattern) = settings.password_pattern_port {
            config.password_pattern_port = pattern;
        }
        if let Some(database) = settings.keepassxc_database {
            config.keepassxc_database = Some(config.expand(&database));
        }
        config.server = settings.server;
        config.port = settings.port;
        config.sshfs_extra_args = settings.sshfs_extra_args.unwrap_or_default();
        config.gocryptfs_extra_args = settings.gocryptfs_extra_args.unwrap_or_default();
        if let Some(secs) = settings.mount_timeout_secs {
            config.mount_timeout = positive_secs(secs, "mount_timeout_secs", path)?;
        }
        if let Some(secs) = settings.fetch_timeout_secs {
            config.fetch_timeout = positive_secs(secs, "fetch_timeout_secs", path)?;
        }
        if config.port == Some(0) {
            return Err(ConfigError::Invalid {
                path: path.to_path_buf(),
                key: "port",
                message: "must be between 1 and 65535",
            });
        }

        Ok(config)
    }

    /// Password key template for a volume, by whether its port was given explicitly.
    pub fn password_pattern_for(&self, explicit_port: bool) -> &str {
        if explicit_port {
            &self.password_pattern_port
        } else {
            &self.password_pattern
        }
    }

    /// Expand a leading `~` against the home directory.
    pub fn expand(&self, path: &str) -> PathBuf {
        expand_tilde(path, self.home.as_deref())
    }
}

fn positive_secs(secs: u64, key: &'static str, path: &Path) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            key,
            message: "must be at least 1 second",
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Default config file locations, in lookup order.
fn candidate_paths(dirs: Option<&BaseDirs>) -> Vec<PathBuf> {
    dirs.map(|dirs| {
        vec![
            dirs.config_dir().join("rs3f").join("config.toml"),
            dirs.home_dir().join(".rs3f.toml"),
        ]
    })
    .unwrap_or_default()
}

/// `~` and `~/rest` are resolved against `home`; anything else is taken literally.
pub fn expand_tilde(path: &str, home: Option<&Path>) -> PathBuf {
    if let Some(home) = home {
        if path == "~" {
            return home.to_path_buf();
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
