//! Termination signals during a prepared session.
//!
//! The listener only raises a flag. The session code checks it between steps
//! and the caller restores and exits with [`exit_code`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SessionError;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    signal: Arc<AtomicI32>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `signo`. The first signal received is the one reported.
    pub fn raise(&self, signo: i32) {
        let _ = self
            .signal
            .compare_exchange(0, signo, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn raised(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            signo => Some(signo),
        }
    }

    pub fn check(&self) -> Result<(), SessionError> {
        match self.raised() {
            Some(signo) => Err(SessionError::Interrupted(signo)),
            None => Ok(()),
        }
    }
}

/// Process exit status after being interrupted by `signo`.
pub fn exit_code(signo: i32) -> i32 {
    128 + signo
}

/// Waits for SIGINT, SIGTERM or SIGHUP and returns its number.
pub async fn wait_for_termination() -> std::io::Result<i32> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let signo = tokio::select! {
        _ = sigint.recv() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
        _ = sighup.recv() => libc::SIGHUP,
    };
    Ok(signo)
}

/// Spawns the listener that raises `interrupt`. Abort the handle once the
/// session is no longer prepared.
pub fn listen(interrupt: Interrupt) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_termination().await {
            Ok(signo) => {
                info!(target: "session", signo, "termination_signal_received");
                interrupt.raise(signo);
            }
            Err(e) => warn!(target: "session", error = %e, "signal_listener_failed"),
        }
    })
}
