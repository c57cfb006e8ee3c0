//! Cooperative cancellation shared between the signal handler and blocking steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable interruption flag.
///
/// The flag is raised from a signal handler (see `rs3f_mount::signal`) and polled by
/// the timed command runner and the orchestrator. Once raised it stays raised for the
/// rest of the invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registration with `signal_hook::flag::register`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}
