use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::command::{self, CommandError, ToolCommand};
use crate::{Credential, VolumeIdentity};

/// A source a volume passphrase can be fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum FetcherKind {
    /// `keepassxc-cli show` against the configured database.
    KeepassXC,
    /// The `pass` password store.
    Pass,
    /// Interactive prompt on the terminal, echo disabled.
    Stdin,
}

/// A fetcher name that is none of `keepassxc`, `pass` or `stdin`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown password fetcher '{0}' (expected keepassxc, pass or stdin)")]
pub struct UnknownFetcher(pub String);

/// Why a fetcher produced no passphrase. Never fatal: the resolver moves on to the next
/// fetcher.
#[derive(Debug, Error)]
pub enum SoftFailure {
    /// The backing tool is not installed.
    #[error("{0} is not installed")]
    ToolMissing(String),

    /// No KeePassXC database configured.
    #[error("no password database configured")]
    NoDatabase,

    /// The configured KeePassXC database does not exist.
    #[error("password database {} does not exist", .0.display())]
    DatabaseMissing(PathBuf),

    /// The tool ran but did not hand out the entry (absent, locked, wrong master password).
    #[error("{tool} exited with status {status:?}: {diagnostic}")]
    Rejected {
        /// Tool name.
        tool: String,
        /// Exit code, if any.
        status: Option<i32>,
        /// Trimmed stderr.
        diagnostic: String,
    },

    /// The tool timed out or could not be run.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The terminal prompt failed.
    #[error("passphrase prompt failed: {0}")]
    Prompt(#[source] io::Error),

    /// The source returned a passphrase that is not valid UTF-8.
    #[error("passphrase is not valid UTF-8")]
    InvalidUtf8,

    /// The source returned an empty passphrase.
    #[error("empty passphrase")]
    Empty,
}

/// Reads a passphrase from the user.
pub trait PassphrasePrompt {
    /// Show `message` and read one line without echo.
    fn read_passphrase(&self, message: &str) -> io::Result<String>;
}

/// [`PassphrasePrompt`] on the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn read_passphrase(&self, message: &str) -> io::Result<String> {
        rpassword::prompt_password(message)
    }
}

/// Everything the fetchers need besides the volume itself.
pub struct FetchContext {
    /// `keepassxc-cli` executable.
    pub keepassxc_cli: PathBuf,
    /// `pass` executable.
    pub pass: PathBuf,
    /// KeePassXC database to query.
    pub keepassxc_database: Option<PathBuf>,
    /// Prompt used by [`FetcherKind::Stdin`].
    pub prompt: Box<dyn PassphrasePrompt>,
    /// Bound for each password-store invocation, including master password entry.
    pub timeout: Duration,
}

impl Default for FetchContext {
    fn default() -> Self {
        Self {
            keepassxc_cli: PathBuf::from("keepassxc-cli"),
            pass: PathBuf::from("pass"),
            keepassxc_database: None,
            prompt: Box::new(TerminalPrompt),
            timeout: command::DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("keepassxc_cli", &self.keepassxc_cli)
            .field("pass", &self.pass)
            .field("keepassxc_database", &self.keepassxc_database)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FetcherKind {
    /// Try to obtain the passphrase for `identity`, stored under `key`.
    pub fn attempt(
        self,
        ctx: &FetchContext,
        identity: &VolumeIdentity,
        key: &str,
    ) -> Result<Credential, SoftFailure> {
        match self {
            Self::KeepassXC => {
                let database = ctx
                    .keepassxc_database
                    .as_deref()
                    .ok_or(SoftFailure::NoDatabase)?;
                if !database.exists() {
                    return Err(SoftFailure::DatabaseMissing(database.to_path_buf()));
                }
                // keepassxc-cli asks for the master password on the terminal.
                let command = ToolCommand::new(&ctx.keepassxc_cli)
                    .args(["show", "--attributes", "password"])
                    .arg(database)
                    .arg(key);
                run_password_store(command, &ctx.keepassxc_cli, ctx.timeout)
            }
            Self::Pass => {
                let command = ToolCommand::new(&ctx.pass).arg("show").arg(key);
                run_password_store(command, &ctx.pass, ctx.timeout)
            }
            Self::Stdin => {
                let message = format!("gocryptfs password for {identity}? ");
                let passphrase = ctx
                    .prompt
                    .read_passphrase(&message)
                    .map_err(SoftFailure::Prompt)?;
                let credential = Credential::new(passphrase);
                if credential.is_empty() {
                    return Err(SoftFailure::Empty);
                }
                Ok(credential)
            }
        }
    }
}

fn run_password_store(
    command: ToolCommand,
    tool: &Path,
    timeout: Duration,
) -> Result<Credential, SoftFailure> {
    let tool = tool.display().to_string();
    let output = command.interactive().timeout(timeout).run().map_err(|e| {
        if e.is_not_found() {
            SoftFailure::ToolMissing(tool.clone())
        } else {
            SoftFailure::Command(e)
        }
    })?;

    if !output.success() {
        return Err(SoftFailure::Rejected {
            tool,
            status: output.status,
            diagnostic: output.diagnostic(),
        });
    }

    debug!(tool = %tool, "password store returned an entry");
    first_line(&output.stdout)
}

/// The passphrase is the first line of a password store's output.
fn first_line(stdout: &[u8]) -> Result<Credential, SoftFailure> {
    let line = stdout.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let passphrase = std::str::from_utf8(line).map_err(|_| SoftFailure::InvalidUtf8)?;
    if passphrase.is_empty() {
        return Err(SoftFailure::Empty);
    }
    Ok(Credential::new(passphrase.to_owned()))
}

impl FromStr for FetcherKind {
    type Err = UnknownFetcher;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keepassxc" => Ok(Self::KeepassXC),
            "pass" => Ok(Self::Pass),
            "stdin" => Ok(Self::Stdin),
            _ => Err(UnknownFetcher(s.to_string())),
        }
    }
}

impl TryFrom<String> for FetcherKind {
    type Error = UnknownFetcher;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for FetcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeepassXC => "keepassxc",
            Self::Pass => "pass",
            Self::Stdin => "stdin",
        })
    }
}
