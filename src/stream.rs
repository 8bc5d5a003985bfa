//! Supervision of the screen-streaming child process.
//!
//! A [`StreamSupervisor`] owns at most one child. The child runs in its own
//! process group, so a Ctrl-C on the controller's terminal does not reach it
//! and its exit does not affect the controller. Stopping sends SIGTERM only;
//! there is no escalation to SIGKILL.

use serde::Serialize;
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use tracing::{debug, info, warn};

use crate::backend::{
    build_args, validate_target, BackendSelector, ResolvedStream, StreamBackend, StreamRequest,
};
use crate::error::{StreamError, StreamErrorCode};

/// The running stream and the parameters it was started with.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub pid: u32,
    pub backend: StreamBackend,
    pub program: PathBuf,
    pub params: ResolvedStream,
}

pub struct StreamSupervisor {
    selector: BackendSelector,
    backend: Option<StreamBackend>,
    verbose: bool,
    child: Option<Child>,
    current: Option<StreamInfo>,
    last_error: Option<StreamError>,
}

impl StreamSupervisor {
    pub fn new(selector: BackendSelector) -> Self {
        Self {
            selector,
            backend: None,
            verbose: false,
            child: None,
            current: None,
            last_error: None,
        }
    }

    /// Pins a backend; `None` selects automatically.
    pub fn set_backend(&mut self, backend: Option<StreamBackend>) {
        self.backend = backend;
    }

    /// Keeps the child's stdout and stderr attached instead of discarding them.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn fail(&mut self, code: StreamErrorCode, message: String) -> StreamError {
        let err = StreamError::new(code, message);
        self.last_error = Some(err.clone());
        err
    }

    /// Spawns the streaming child and returns its pid without waiting.
    pub fn start_stream(&mut self, request: &StreamRequest) -> Result<u32, StreamError> {
        self.last_error = None;

        if let Some(current) = &self.current {
            let message = format!(
                "Stream already running with PID {}, stop it first",
                current.pid
            );
            return Err(self.fail(StreamErrorCode::AlreadyRunning, message));
        }

        if let Err(e) = validate_target(&request.target) {
            return Err(self.fail(e.code, e.message));
        }

        let params = request.resolve();
        let backend = self.selector.select(self.backend);
        let program = self.selector.program(backend);
        let args = build_args(backend, &program, &params);

        info!(
            target: "stream",
            backend = %backend,
            target_addr = %params.target,
            port = params.port,
            resolution = %params.resolution_label(),
            fps = params.fps,
            bitrate = params.bitrate,
            "stream_starting"
        );
        debug!(target: "stream", program = %program.display(), ?args, "stream_exec");

        let mut cmd = Command::new(&program);
        cmd.args(&args).stdin(Stdio::null()).process_group(0);
        if let Some(path) = self.selector.search_path() {
            cmd.env("PATH", path);
        }
        if !self.verbose {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let code = match e.kind() {
                    ErrorKind::NotFound | ErrorKind::PermissionDenied => StreamErrorCode::ExecFailed,
                    _ => StreamErrorCode::ForkFailed,
                };
                let message = format!("Failed to execute {} streaming: {}", backend, e);
                warn!(target: "stream", ?code, error = %e, "stream_spawn_failed");
                return Err(self.fail(code, message));
            }
        };

        let pid = child.id();
        info!(target: "stream", pid, target_addr = %params.target, port = params.port, "stream_started");
        self.current = Some(StreamInfo {
            pid,
            backend,
            program,
            params,
        });
        self.child = Some(child);
        Ok(pid)
    }

    /// Sends SIGTERM to the running child and forgets it.
    pub fn stop_stream(&mut self) -> Result<(), StreamError> {
        self.last_error = None;

        let (Some(current), Some(child)) = (self.current.take(), self.child.take()) else {
            info!(target: "stream", "no_stream_running");
            return Err(self.fail(StreamErrorCode::NotRunning, "No stream is running".to_string()));
        };

        signal_term(current.pid);
        reap_in_background(child);
        info!(target: "stream", pid = current.pid, "stream_stopped");
        Ok(())
    }

    pub fn is_streaming_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&StreamInfo> {
        self.current.as_ref()
    }

    pub fn last_error(&self) -> Option<&StreamError> {
        self.last_error.as_ref()
    }

    /// Clears the tracked child if it has exited on its own.
    pub fn try_reap(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(target: "stream", pid = child.id(), %status, "stream_exited");
                self.child = None;
                self.current = None;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(target: "stream", error = %e, "stream_wait_failed");
                None
            }
        }
    }

    /// Stops the child if one is running.
    pub fn cleanup(&mut self) {
        if self.is_streaming_active() {
            let _ = self.stop_stream();
        }
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn signal_term(pid: u32) {
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a positive pid only signals that process.
    if unsafe { libc::kill(pid_t, libc::SIGTERM) } != 0 {
        let err = std::io::Error::last_os_error();
        debug!(target: "stream", pid, error = %err, "sigterm_failed");
    }
}

fn reap_in_background(mut child: Child) {
    thread::spawn(move || match child.wait() {
        Ok(status) => debug!(target: "stream", %status, "stream_reaped"),
        Err(e) => debug!(target: "stream", error = %e, "stream_reap_failed"),
    });
}
