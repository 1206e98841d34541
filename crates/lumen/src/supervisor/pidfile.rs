use std::{fs, io, path::Path};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};

use crate::error::{Error, Result};

/// Writes the current process id to `path`, creating parent directories.
///
/// # Errors
/// Returns [`Error::Supervision`] if the file cannot be written.
pub fn write_pid(path: &Path) -> Result<()> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, std::process::id().to_string())
    };
    write().map_err(|err| Error::Supervision(format!("write pid file {}: {err}", path.display())))
}

/// Reads the pid stored at `path`; a missing file reads as `None`.
///
/// # Errors
/// Returns [`Error::Supervision`] if the file is unreadable or does not hold
/// a pid.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::Supervision(format!(
                "read pid file {}: {err}",
                path.display()
            )));
        }
    };
    match text.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => Err(Error::Supervision(format!(
            "pid file {} holds {:?}, not a pid",
            path.display(),
            text.trim()
        ))),
    }
}

pub fn remove_pid(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), %err, "Failed to remove pid file"),
    }
}

/// Sends `signal` to the process recorded in the pid file.
///
/// # Errors
/// Returns [`Error::Supervision`] when no pid is recorded or the signal
/// cannot be delivered.
pub fn signal_pid(path: &Path, signal: Signal) -> Result<i32> {
    let pid = read_pid(path)?.ok_or_else(|| {
        Error::Supervision(format!("no pid file at {}; is the server running?", path.display()))
    })?;
    kill(Pid::from_raw(pid), signal)
        .map_err(|err| Error::Supervision(format!("signal {signal} to {pid}: {err}")))?;
    Ok(pid)
}
