use std::{
    ffi::OsString,
    net::TcpListener,
    os::fd::{AsRawFd, FromRawFd, RawFd},
    path::PathBuf,
};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// Environment marker set on worker processes.
pub const WORKER_ENV: &str = "LUMEN_WORKER";

/// Descriptor a worker finds the shared listener at.
pub const LISTENER_FD: RawFd = 3;

/// Whether this process was started by a supervisor.
#[must_use]
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some_and(|v| v == "1")
}

/// Rebuilds the listener handed down at [`LISTENER_FD`]. It is switched to
/// non-blocking mode and closed on exec so script subprocesses do not keep it.
///
/// # Errors
/// Returns [`Error::Supervision`] when not running as a worker or when the
/// descriptor is not a listening socket.
pub fn inherited_listener() -> Result<TcpListener> {
    if !is_worker() {
        return Err(Error::Supervision(format!("{WORKER_ENV} is not set")));
    }
    let invalid =
        |err: &dyn std::fmt::Display| Error::Supervision(format!("inherited listener: {err}"));

    fcntl(LISTENER_FD, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|err| invalid(&err))?;
    // SAFETY: the supervisor placed a listening socket at this descriptor and
    // nothing else in this process owns it.
    let listener = unsafe { TcpListener::from_raw_fd(LISTENER_FD) };
    listener.local_addr().map_err(|err| invalid(&err))?;
    listener.set_nonblocking(true).map_err(|err| invalid(&err))?;
    Ok(listener)
}

/// How workers are launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

impl WorkerCommand {
    /// Re-runs the current executable with the current arguments.
    ///
    /// # Errors
    /// Returns an I/O error if the executable or directory cannot be resolved.
    pub fn current() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
            working_dir: std::env::current_dir()?,
        })
    }

    /// Starts a worker that inherits the environment and finds `listener`
    /// at [`LISTENER_FD`].
    ///
    /// # Errors
    /// Returns [`Error::Supervision`] if the process cannot be started.
    pub fn spawn(&self, listener: &TcpListener) -> Result<Child> {
        let fd = listener.as_raw_fd();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env(WORKER_ENV, "1")
            .kill_on_drop(true);
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if fd != LISTENER_FD {
                    nix::unistd::dup2(fd, LISTENER_FD)?;
                }
                fcntl(LISTENER_FD, FcntlArg::F_SETFD(FdFlag::empty()))?;
                Ok(())
            });
        }
        command.spawn().map_err(|err| {
            Error::Supervision(format!("spawn worker {}: {err}", self.program.display()))
        })
    }
}
