//! Timed execution of external tools.
//!
//! Every blocking call to `sshfs`, `gocryptfs`, `keepassxc-cli`, `pass` and friends goes
//! through [`ToolCommand`], which bounds it by a timeout, honours a [`CancelToken`], and
//! feeds secrets over stdin instead of the command line.

use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};
use zeroize::{Zeroize, Zeroizing};

use crate::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to keep collecting output after the child exited.
///
/// Daemonizing tools (sshfs, gocryptfs) can hand their pipes to a background process that
/// keeps them open for the lifetime of the mount.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Default bound for a single tool invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from running an external tool. A non-zero exit is *not* an error here; callers
/// inspect [`ToolOutput::status`].
#[derive(Debug, Error)]
pub enum CommandError {
    /// The tool could not be started at all.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Talking to the running child failed.
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The tool was killed after exceeding its time bound.
    #[error("{program} timed out after {}s", timeout.as_secs_f32())]
    TimedOut { program: String, timeout: Duration },

    /// The tool was killed because the invocation was cancelled.
    #[error("{program} was interrupted")]
    Cancelled { program: String },
}

impl CommandError {
    /// The executable could not be found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Captured result of a finished tool.
#[derive(Debug)]
pub struct ToolOutput {
    /// Exit code, `None` when the tool was terminated by a signal.
    pub status: Option<i32>,
    /// Raw stdout. May hold a secret (e.g. `pass show`), so it is wiped on drop.
    pub stdout: Zeroizing<Vec<u8>>,
    /// Captured stderr, empty for interactive runs.
    pub stderr: String,
}

impl ToolOutput {
    /// Exit code zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed stderr, suitable for error messages. Stdout is never used since it may
    /// carry secrets.
    pub fn diagnostic(&self) -> String {
        let trimmed = self.stderr.trim();
        if trimmed.is_empty() {
            "no additional output".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Builder for a single bounded tool invocation.
#[derive(Debug)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    input: Option<Zeroizing<Vec<u8>>>,
    interactive: bool,
    timeout: Duration,
    cancel: Option<CancelToken>,
}

impl ToolCommand {
    /// A command for `program` with the default timeout.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            envs: Vec::new(),
            input: None,
            interactive: false,
            timeout: DEFAULT_TIMEOUT,
            cancel: None,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Bytes written to the child's stdin, after which stdin is closed.
    #[must_use]
    pub fn input(mut self, bytes: &[u8]) -> Self {
        self.input = Some(Zeroizing::new(bytes.to_vec()));
        self
    }

    /// Let the child talk to the user's terminal: stdin and stderr are inherited, only
    /// stdout is captured.
    #[must_use]
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Override [`DEFAULT_TIMEOUT`].
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Kill the child as soon as `token` is raised.
    #[must_use]
    pub fn cancel_on(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Run the tool to completion, killing it on timeout or cancellation.
    pub fn run(self) -> Result<ToolOutput, CommandError> {
        let program = self.program_name();
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(CommandError::Cancelled { program });
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.stdout(Stdio::piped());
        if self.interactive {
            command.stdin(Stdio::inherit());
            command.stderr(Stdio::inherit());
        } else {
            command.stdin(if self.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
            command.stderr(Stdio::piped());
        }

        debug!(program = %program, args = ?self.args, "spawning tool");
        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout = SharedBuffer::default();
        let stderr = SharedBuffer::default();
        let stdout_reader = spawn_output_reader(child.stdout.take(), stdout.clone());
        let stderr_reader = spawn_output_reader(child.stderr.take(), stderr.clone());

        if let (Some(payload), Some(mut stdin)) = (self.input.as_ref(), child.stdin.take()) {
            // A tool that fails early may exit before reading its input.
            match stdin.write_all(payload).and_then(|()| stdin.flush()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    trace!(program = %program, "tool closed stdin before reading input");
                }
                Err(source) => {
                    kill_and_reap(&mut child);
                    return Err(CommandError::Io { program, source });
                }
            }
        }

        let status = self.wait_with_timeout(&mut child, &program)?;

        let deadline = Instant::now() + DRAIN_GRACE;
        while !(stdout_reader.is_finished() && stderr_reader.is_finished())
            && Instant::now() < deadline
        {
            thread::sleep(POLL_INTERVAL);
        }

        let output = ToolOutput {
            status: status.code(),
            stdout: stdout.take(),
            stderr: String::from_utf8_lossy(&stderr.take()).into_owned(),
        };
        debug!(program = %program, status = ?output.status, "tool finished");
        Ok(output)
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
        program: &str,
    ) -> Result<ExitStatus, CommandError> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    kill_and_reap(child);
                    return Err(CommandError::Io {
                        program: program.to_string(),
                        source,
                    });
                }
            }

            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                kill_and_reap(child);
                return Err(CommandError::Cancelled {
                    program: program.to_string(),
                });
            }

            if start.elapsed() > self.timeout {
                kill_and_reap(child);
                return Err(CommandError::TimedOut {
                    program: program.to_string(),
                    timeout: self.timeout,
                });
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Zeroizing<Vec<u8>>>>);

impl SharedBuffer {
    fn append(&self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    fn take(&self) -> Zeroizing<Vec<u8>> {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Zeroizing::new(std::mem::take(&mut **guard))
    }
}

fn spawn_output_reader<R>(pipe: Option<R>, sink: SharedBuffer) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let Some(mut reader) = pipe else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink.append(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        chunk.zeroize();
    })
}
