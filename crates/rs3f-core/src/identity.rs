use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Port used when neither the command line nor the configuration names one.
pub const DEFAULT_SSH_PORT: u16 = 22;

const MAX_VOLUME_LEN: usize = 32;

/// Errors from parsing `volume[@server[:port]]` or completing it from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeParseError {
    /// Volume names start with `[a-z_]` and continue with up to 31 of `[a-zA-Z0-9_-]`.
    #[error("invalid volume name '{0}'")]
    InvalidVolume(String),

    /// Server names are non-empty and must not contain `:`, `@` or `/`.
    #[error("invalid server name '{0}'")]
    InvalidServer(String),

    /// Ports are 1 to 5 digits between 1 and 65535.
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// No server on the command line and none configured.
    #[error("no server given for volume '{0}' and none configured")]
    MissingServer(String),
}

/// A volume reference as typed by the user, with optional server and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    /// Volume (and remote user) name.
    pub volume: String,
    /// Server, when given explicitly.
    pub server: Option<String>,
    /// Port, when given explicitly.
    pub port: Option<u16>,
}

/// Fully resolved identity of a remote volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeIdentity {
    /// Volume name, also the login name on the server.
    pub volume: String,
    /// SSH server hosting the volume.
    pub server: String,
    /// SSH port.
    pub port: u16,
}

impl VolumeRef {
    /// Fill in the server and port from configuration.
    ///
    /// Explicit values win. A missing port falls back to `default_port`, then to
    /// [`DEFAULT_SSH_PORT`].
    pub fn resolve(
        self,
        default_server: Option<&str>,
        default_port: Option<u16>,
    ) -> Result<VolumeIdentity, VolumeParseError> {
        let server = match self.server {
            Some(server) => server,
            None => match default_server {
                Some(server) => validate_server(server)?.to_string(),
                None => return Err(VolumeParseError::MissingServer(self.volume)),
            },
        };

        Ok(VolumeIdentity {
            volume: self.volume,
            server,
            port: self.port.or(default_port).unwrap_or(DEFAULT_SSH_PORT),
        })
    }
}

impl FromStr for VolumeRef {
    type Err = VolumeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (volume, location) = match s.split_once('@') {
            Some((volume, location)) => (volume, Some(location)),
            None => (s, None),
        };

        let volume = validate_volume(volume)?.to_string();

        let (server, port) = match location {
            None => (None, None),
            Some(location) => {
                let (server, port) = match location.split_once(':') {
                    Some((server, port)) => (server, Some(parse_port(port)?)),
                    None => (location, None),
                };
                (Some(validate_server(server)?.to_string()), port)
            }
        };

        Ok(Self {
            volume,
            server,
            port,
        })
    }
}

impl VolumeIdentity {
    /// `volume@server`, the SSH destination.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.volume, self.server)
    }
}

impl fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.volume, self.server, self.port)
    }
}

fn validate_volume(volume: &str) -> Result<&str, VolumeParseError> {
    let mut chars = volume.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid_head && valid_tail && volume.len() <= MAX_VOLUME_LEN {
        Ok(volume)
    } else {
        Err(VolumeParseError::InvalidVolume(volume.to_string()))
    }
}

fn validate_server(server: &str) -> Result<&str, VolumeParseError> {
    if server.is_empty() || server.contains([':', '@', '/']) {
        Err(VolumeParseError::InvalidServer(server.to_string()))
    } else {
        Ok(server)
    }
}

fn parse_port(port: &str) -> Result<u16, VolumeParseError> {
    let well_formed = (1..=5).contains(&port.len()) && port.bytes().all(|b| b.is_ascii_digit());
    if !well_formed {
        return Err(VolumeParseError::InvalidPort(port.to_string()));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(VolumeParseError::InvalidPort(port.to_string())),
        Ok(port) => Ok(port),
    }
}
