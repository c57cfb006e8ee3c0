//! Interrupt handling using signal-hook.
//!
//! SIGINT, SIGTERM and SIGHUP raise a [`CancelToken`]: the running sshfs or gocryptfs is
//! killed and the orchestrator rolls back whatever was already mounted. Further signals
//! do not force an exit, so the rollback always gets to finish.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rs3f_core::CancelToken;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::consts::signal::SIGHUP;
use signal_hook::flag;

/// Tracks if the handler has been installed
static INSTALLED: AtomicBool = AtomicBool::new(false);

const MONITOR_INTERVAL: Duration = Duration::from_millis(50);

/// Raise `token` on SIGINT, SIGTERM or SIGHUP.
///
/// Safe to call multiple times; only the first token is registered.
pub fn install_cancel_handler(token: &CancelToken) -> io::Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    for &sig in TERM_SIGNALS.iter().chain(&[SIGHUP]) {
        flag::register(sig, token.flag())?;
    }

    // Tell the user why the mount is being torn down.
    let token = token.clone();
    thread::spawn(move || {
        while !token.is_cancelled() {
            thread::sleep(MONITOR_INTERVAL);
        }
        eprintln!("\nInterrupted, rolling back");
    });

    Ok(())
}
