//! Renderer process supervision.
//!
//! Spawns the renderer binary with its port and shared secret in the
//! child environment (never argv, which would leak the token to process
//! listings), probes liveness cheaply, and tears the process down in two
//! phases — a graceful stop first, force-kill only after a bounded grace
//! period, because the renderer needs the chance to run its own
//! per-session shutdown sequence.
//!
//! Launch failures are reported, never retried here; retry policy belongs
//! to the session manager's health loop.

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use rustix::process::{kill_process, Pid, Signal};
use thiserror::Error;

use crate::config::{PORT_ENV, TOKEN_ENV};
use crate::trace::{info, warn};

/// File name of the renderer binary.
pub const RENDERER_BINARY: &str = "vitrine-renderer";
/// Fixed installation directory checked after the executable-adjacent
/// location.
const INSTALL_DIR: &str = "/usr/lib/vitrine";

const TERMINATE_GRACE: Duration = Duration::from_secs(3);
const TERMINATE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("renderer binary not found")]
    BinaryNotFound,
    #[error("failed to spawn `{path}`: {source}")]
    Spawn {
        path: String,
        source: std::io::Error,
    },
}

/// Locates the renderer binary for this platform.
///
/// Order: explicit override, adjacent to the host executable, then the
/// fixed installation directory. Returns `None` when nothing exists —
/// callers degrade to "browser sources unavailable", they do not crash.
#[must_use]
pub fn resolve_renderer_path(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        if path.exists() {
            return Some(path.to_owned());
        }
        warn!(path = %path.display(), "configured renderer path does not exist");
        return None;
    }

    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(RENDERER_BINARY);
            if sibling.exists() {
                return Some(sibling);
            }
        }
    }

    let installed = Path::new(INSTALL_DIR).join(RENDERER_BINARY);
    if installed.exists() {
        return Some(installed);
    }
    None
}

/// Tracks at most one renderer child process.
#[derive(Default)]
pub struct RendererSupervisor {
    child: Option<Child>,
}

impl RendererSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the renderer with its control port and token in the
    /// environment. No-op when a live child is already tracked.
    ///
    /// # Errors
    ///
    /// [`SpawnError::Spawn`] when the OS refuses; the caller decides
    /// whether and when to retry.
    pub fn launch(&mut self, path: &Path, port: u16, token: &str) -> Result<(), SpawnError> {
        if self.is_alive() {
            return Ok(());
        }

        let child = Command::new(path)
            .env(PORT_ENV, port.to_string())
            .env(TOKEN_ENV, token)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                path: path.display().to_string(),
                source,
            })?;

        info!(pid = child.id(), port, "renderer launched");
        self.child = Some(child);
        Ok(())
    }

    /// Cheap existence probe: true until the child has exited. Reaps an
    /// exited child as a side effect.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.child {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    info!(status = %status, "renderer exited");
                    self.child = None;
                    false
                }
                Err(error) => {
                    warn!(error = %error, "liveness probe failed, assuming dead");
                    self.child = None;
                    false
                }
            },
        }
    }

    /// Graceful-then-forceful termination. Idempotent: a no-op when no
    /// process is tracked. Safe to call while sessions are mid-paint.
    pub fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        let pid = child.id();
        match Pid::from_raw(pid as i32) {
            Some(pid_handle) => {
                info!(pid, "sending SIGTERM to renderer");
                let _ = kill_process(pid_handle, Signal::Term);
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }

        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid, status = %status, "renderer exited gracefully");
                    return;
                }
                Ok(None) => std::thread::sleep(TERMINATE_POLL),
                Err(_) => return, // already gone
            }
        }

        warn!(pid, "renderer ignored SIGTERM, force-killing");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for RendererSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}
