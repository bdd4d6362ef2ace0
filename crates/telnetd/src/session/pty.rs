//! Pseudo-terminal collaborators.
//!
//! The engine only needs a non-blocking master descriptor, a way to push
//! window sizes to it, and a child it can poll. `NativeSpawner` provides all
//! three with portable-pty; tests substitute socket pairs.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::PathBuf;
use telnet_core::{TelnetError, TelnetResult, WindowSize};
use tracing::{debug, info};

/// How a login child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: u32,
}

/// Applies window-size changes to the terminal.
pub trait Resize: Send {
    fn resize(&mut self, size: WindowSize) -> TelnetResult<()>;
}

/// The login process attached to the slave side. Never waited on blocking.
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking status check; `None` while the child is running.
    fn try_wait(&mut self) -> TelnetResult<Option<ChildExit>>;

    fn kill(&mut self) -> TelnetResult<()>;
}

/// A freshly spawned login process and its terminal.
pub struct SpawnedPty {
    /// Master side, duplicated and owned by the session.
    pub master: OwnedFd,
    pub resizer: Box<dyn Resize>,
    pub child: Box<dyn ChildProcess>,
}

/// Allocates a pseudo-terminal and starts the login program on it.
pub trait PtySpawner: Send {
    fn spawn(&self, size: WindowSize) -> TelnetResult<SpawnedPty>;
}

/// Spawns the configured executable on a native pseudo-terminal.
#[derive(Debug, Clone)]
pub struct NativeSpawner {
    login: PathBuf,
    term: String,
}

impl NativeSpawner {
    pub fn new(login: PathBuf, term: String) -> Self {
        Self { login, term }
    }
}

impl PtySpawner for NativeSpawner {
    fn spawn(&self, size: WindowSize) -> TelnetResult<SpawnedPty> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| TelnetError::Pty(format!("failed to open PTY: {e}")))?;

        let raw = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| TelnetError::Pty("PTY master has no descriptor".into()))?;
        // SAFETY: `raw` belongs to `pair.master`, which outlives this borrow.
        // The duplicate is close-on-exec, so the child never inherits it.
        let master = unsafe { BorrowedFd::borrow_raw(raw) }.try_clone_to_owned()?;

        let mut cmd = CommandBuilder::new(&self.login);
        cmd.env("TERM", &self.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TelnetError::Spawn(format!("failed to spawn {}: {e}", self.login.display())))?;

        // Only the child may hold the slave open, so its exit reads as EOF.
        drop(pair.slave);

        info!(
            login = %self.login.display(),
            pid = ?child.process_id(),
            cols = size.cols,
            rows = size.rows,
            "PTY spawned"
        );

        Ok(SpawnedPty {
            master,
            resizer: Box::new(NativeResizer { master: pair.master }),
            child: Box::new(NativeChild { child }),
        })
    }
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct NativeResizer {
    master: Box<dyn MasterPty + Send>,
}

impl Resize for NativeResizer {
    fn resize(&mut self, size: WindowSize) -> TelnetResult<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| TelnetError::Resize(format!("PTY resize failed: {e}")))?;
        debug!(cols = size.cols, rows = size.rows, "PTY resized");
        Ok(())
    }
}

struct NativeChild {
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl ChildProcess for NativeChild {
    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn try_wait(&mut self) -> TelnetResult<Option<ChildExit>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| TelnetError::Other(format!("wait error: {e}")))?;
        Ok(status.map(|s| ChildExit {
            code: s.exit_code(),
        }))
    }

    fn kill(&mut self) -> TelnetResult<()> {
        let Some(pid) = self.child.process_id() else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(TelnetError::Other(format!("kill failed: {e}"))),
        }
    }
}
