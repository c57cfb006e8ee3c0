//! Pre-mount checks against the SSH server.

use std::path::Path;
use std::time::Duration;

use rs3f_core::command::{CommandError, ToolCommand};
use rs3f_core::{CancelToken, SupervisorError, VolumeIdentity};
use tracing::{debug, info, instrument};

use crate::idmap;

/// Seconds ssh waits for the TCP connection.
const CONNECT_TIMEOUT_SECS: u32 = 60;

/// Marker ssh prints when the server answered but refused every auth method.
const PERMISSION_DENIED: &str = "Permission denied";

/// Check that the server answers SSH.
///
/// Every authentication method is disabled, so a reachable server always replies
/// "Permission denied". Anything else means the connection failed.
#[instrument(level = "debug", skip_all, fields(volume = %identity))]
pub fn probe(
    ssh: &Path,
    identity: &VolumeIdentity,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(), SupervisorError> {
    info!("checking that {identity} is reachable");
    let output = ToolCommand::new(ssh)
        .args(probe_args(identity))
        .env("LC_ALL", "C")
        .timeout(timeout)
        .cancel_on(cancel)
        .run()
        .map_err(|e| command_error("ssh", e))?;

    if output.stderr.contains(PERMISSION_DENIED) {
        return Ok(());
    }
    debug!(status = ?output.status, stderr = %output.stderr.trim(), "ssh probe failed");
    Err(SupervisorError::Unreachable {
        server: identity.server.clone(),
        port: identity.port,
        diagnostic: output.diagnostic(),
    })
}

fn probe_args(identity: &VolumeIdentity) -> Vec<String> {
    let options = [
        ("BatchMode", "yes".to_string()),
        ("HostBasedAuthentication", "no".to_string()),
        ("PasswordAuthentication", "no".to_string()),
        ("PubkeyAuthentication", "no".to_string()),
        ("ConnectTimeout", CONNECT_TIMEOUT_SECS.to_string()),
    ];
    let mut args = Vec::with_capacity(options.len() * 2 + 3);
    for (key, value) in options {
        args.push("-o".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(identity.destination());
    args.push("-p".to_string());
    args.push(identity.port.to_string());
    args
}

/// Uid owning the encrypted volume on the server, read over sftp.
///
/// The server was probed just before, so a failing sftp means the login was refused.
#[instrument(level = "debug", skip_all, fields(volume = %identity))]
pub fn remote_uid(
    sftp: &Path,
    identity: &VolumeIdentity,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<u32, SupervisorError> {
    let output = ToolCommand::new(sftp)
        .args(["-q", "-b", "-", "-P"])
        .arg(identity.port.to_string())
        .arg(identity.destination())
        .input(b"ls -ln\n")
        .timeout(timeout)
        .cancel_on(cancel)
        .run()
        .map_err(|e| command_error("sftp", e))?;

    if !output.success() {
        return Err(SupervisorError::Authentication {
            destination: identity.destination(),
            diagnostic: output.diagnostic(),
        });
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    let uid = idmap::parse_remote_uid(&listing)
        .ok_or_else(|| SupervisorError::NotAnRs3fVolume(identity.destination()))?;
    debug!(uid, "remote uid");
    Ok(uid)
}

/// Translate a failure to run a tool into the supervisor's vocabulary.
pub(crate) fn command_error(tool: &str, error: CommandError) -> SupervisorError {
    match error {
        e if e.is_not_found() => SupervisorError::MissingTool(tool.to_string()),
        CommandError::TimedOut { timeout, .. } => SupervisorError::Timeout {
            operation: tool.to_string(),
            after: timeout,
        },
        CommandError::Cancelled { .. } => SupervisorError::Cancelled,
        CommandError::Spawn { source, .. } | CommandError::Io { source, .. } => {
            SupervisorError::io(format!("running {tool}"), source)
        }
    }
}
