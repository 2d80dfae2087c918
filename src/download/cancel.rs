//! Cooperative cancellation and interrupt handling.
//!
//! A single [`CancellationToken`] is threaded through every long-running
//! call (batch submission, strategy iteration, and the chunked read loop)
//! and polled at bounded intervals, so worst-case cancellation latency is
//! one chunk's transfer time rather than a whole file's.
//!
//! Interrupt semantics: the first Ctrl-C sets the flag and arms a watchdog
//! that force-terminates the process if graceful shutdown does not finish
//! within the grace period; a second Ctrl-C terminates immediately,
//! bypassing cleanup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, warn};

/// Exit code used when an interrupt terminates the process.
const INTERRUPT_EXIT_CODE: i32 = 130;

/// Shared cancellation flag, cheap to clone and poll.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag. Every poller observes it at its next boundary check.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Installs the two-stage Ctrl-C handler.
///
/// First interrupt: sets `token`, logs, and arms a watchdog that exits the
/// process after `grace` if shutdown stalls. Second interrupt: exits
/// immediately.
pub fn install_interrupt_handler(token: CancellationToken, grace: Duration) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received - finishing in-flight work, press Ctrl-C again to force quit");
        token.cancel();
        arm_watchdog(grace);

        if tokio::signal::ctrl_c().await.is_ok() {
            error!("second interrupt - terminating immediately");
            std::process::exit(INTERRUPT_EXIT_CODE);
        }
    });
}

/// Arms a timer that force-terminates the process if it is still alive
/// after `grace`. Bounds how long a wedged shutdown can hang the terminal.
pub fn arm_watchdog(grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        error!(
            grace_secs = grace.as_secs(),
            "graceful shutdown did not complete in time - force quitting"
        );
        std::process::exit(INTERRUPT_EXIT_CODE);
    });
}
