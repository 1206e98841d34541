//! Zero-downtime process supervision.
//!
//! The supervisor binds nothing itself: it holds a listener bound by the
//! caller and hands it to worker processes at fd 3. On reload a new worker
//! is started against the same listener before the old one is told to
//! drain, so the socket always has at least one holder.

mod pidfile;
mod signal;
mod worker;

use std::{net::TcpListener, path::PathBuf, process::ExitStatus, time::Duration};

use futures::{Stream, StreamExt};
use nix::{sys::signal::kill, unistd::Pid};
use tokio::{process::Child, time::timeout};
use tracing::{error, info, warn};

pub use pidfile::{read_pid, remove_pid, signal_pid, write_pid};
pub use signal::{Signal, SignalListener, signals};
pub use worker::{LISTENER_FD, WORKER_ENV, WorkerCommand, inherited_listener, is_worker};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Supervising,
    Reloading,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: WorkerCommand,
    pub pid_file: Option<PathBuf>,
    /// Time a retiring worker gets to finish in-flight work before it is
    /// killed.
    pub drain_timeout: Duration,
    /// A fresh worker must stay up this long before it counts as started.
    pub settle: Duration,
}

impl SupervisorConfig {
    #[must_use]
    pub const fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            pid_file: None,
            drain_timeout: Duration::from_secs(10),
            settle: Duration::from_millis(500),
        }
    }
}

struct Worker {
    child: Child,
    pid: i32,
    generation: u64,
}

enum Event {
    Signal(Option<Signal>),
    Exited(std::io::Result<ExitStatus>),
}

pub struct Supervisor {
    config: SupervisorConfig,
    listener: TcpListener,
    state: State,
    current: Option<Worker>,
    generation: u64,
}

impl Supervisor {
    #[must_use]
    pub const fn new(config: SupervisorConfig, listener: TcpListener) -> Self {
        Self {
            config,
            listener,
            state: State::NotStarted,
            current: None,
            generation: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn worker_pid(&self) -> Option<i32> {
        self.current.as_ref().map(|w| w.pid)
    }

    /// Writes the pid file and starts the first worker.
    ///
    /// # Errors
    /// Any failure here is fatal: the pid file is removed and
    /// [`Error::Supervision`] returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != State::NotStarted {
            return Err(Error::Supervision(format!(
                "cannot start from {:?}",
                self.state
            )));
        }
        if let Some(path) = &self.config.pid_file {
            write_pid(path)?;
        }
        match self.launch().await {
            Ok(worker) => {
                info!(pid = worker.pid, generation = worker.generation, "Worker started");
                self.current = Some(worker);
                self.state = State::Supervising;
                Ok(())
            }
            Err(err) => {
                self.cleanup();
                self.state = State::Stopped;
                Err(err)
            }
        }
    }

    /// Replaces the current worker with a new one. On failure the previous
    /// worker keeps serving.
    ///
    /// # Errors
    /// Returns [`Error::Supervision`] if the new worker could not be started.
    pub async fn reload(&mut self) -> Result<()> {
        if self.state != State::Supervising {
            return Err(Error::Supervision(format!(
                "cannot reload from {:?}",
                self.state
            )));
        }
        self.state = State::Reloading;
        let launched = self.launch().await;
        self.state = State::Supervising;

        let worker = match launched {
            Ok(worker) => worker,
            Err(err) => {
                metrics::counter!("lumen_supervisor_reloads_total", "outcome" => "failed")
                    .increment(1);
                error!(%err, "Reload failed; previous worker keeps serving");
                return Err(err);
            }
        };
        info!(pid = worker.pid, generation = worker.generation, "Worker started");
        metrics::counter!("lumen_supervisor_reloads_total", "outcome" => "ok").increment(1);
        if let Some(old) = self.current.replace(worker) {
            self.retire(old).await;
        }
        Ok(())
    }

    /// Drains the current worker and removes the pid file.
    pub async fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }
        self.state = State::Stopping;
        if let Some(worker) = self.current.take() {
            self.retire(worker).await;
        }
        self.cleanup();
        self.state = State::Stopped;
        info!("Supervisor stopped");
    }

    /// Starts the first worker and reacts to `signals` until a shutdown
    /// signal arrives. A worker that dies on its own is replaced.
    ///
    /// # Errors
    /// Returns [`Error::Supervision`] if the first worker or a replacement for
    /// a dead worker cannot be started.
    pub async fn run(mut self, mut signals: impl Stream<Item = Signal> + Unpin) -> Result<()> {
        self.start().await?;
        loop {
            let event = match self.current.as_mut() {
                Some(worker) => tokio::select! {
                    signal = signals.next() => Event::Signal(signal),
                    status = worker.child.wait() => Event::Exited(status),
                },
                None => Event::Signal(signals.next().await),
            };

            match event {
                Event::Signal(Some(Signal::Hangup)) => {
                    info!("Reloading");
                    // failures are logged and leave the old worker in place
                    let _ = self.reload().await;
                }
                Event::Signal(Some(signal)) => {
                    info!(%signal, "Shutting down");
                    self.stop().await;
                    return Ok(());
                }
                Event::Signal(None) => {
                    self.stop().await;
                    return Ok(());
                }
                Event::Exited(status) => {
                    let pid = self.current.take().map(|w| w.pid);
                    warn!(?pid, ?status, "Worker exited unexpectedly; starting a replacement");
                    match self.launch().await {
                        Ok(worker) => self.current = Some(worker),
                        Err(err) => {
                            self.stop().await;
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    async fn launch(&mut self) -> Result<Worker> {
        self.generation += 1;
        let mut child = self.config.command.spawn(&self.listener)?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| Error::Supervision("worker has no pid".to_string()))?;

        // a worker that dies right away (bad entry script, bad config) never
        // replaces a running one
        if let Ok(status) = timeout(self.config.settle, child.wait()).await {
            let status = status.map_err(|err| Error::Supervision(err.to_string()))?;
            return Err(Error::Supervision(format!(
                "worker {pid} exited during startup ({status})"
            )));
        }
        Ok(Worker {
            child,
            pid,
            generation: self.generation,
        })
    }

    async fn retire(&self, mut worker: Worker) {
        let pid = worker.pid;
        if let Err(err) = kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM) {
            warn!(pid, %err, "Failed to signal worker");
        }
        match timeout(self.config.drain_timeout, worker.child.wait()).await {
            Ok(status) => info!(pid, ?status, generation = worker.generation, "Worker retired"),
            Err(_) => {
                warn!(pid, "Worker did not drain in time; killing");
                if let Err(err) = worker.child.kill().await {
                    warn!(pid, %err, "Failed to kill worker");
                }
            }
        }
    }

    fn cleanup(&self) {
        if let Some(path) = &self.config.pid_file {
            remove_pid(path);
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state)
            .field("worker", &self.worker_pid())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![OsString::from("-c"), OsString::from(script)],
            working_dir: std::env::temp_dir(),
        }
    }

    fn supervisor(script: &str, pid_file: Option<PathBuf>) -> Supervisor {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = SupervisorConfig::new(shell(script));
        config.pid_file = pid_file;
        config.settle = Duration::from_millis(200);
        config.drain_timeout = Duration::from_secs(2);
        Supervisor::new(config, listener)
    }

    #[tokio::test]
    async fn worker_sees_marker_and_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seen");
        let script = format!(
            "[ \"${WORKER_ENV}\" = 1 ] && [ -e /proc/self/fd/{LISTENER_FD} ] && echo ok > {}; sleep 30",
            out.display()
        );
        let mut sup = supervisor(&script, None);
        sup.start().await.unwrap();
        assert_eq!(sup.state(), State::Supervising);
        sup.stop().await;
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "ok");
    }

    #[tokio::test]
    async fn startup_failure_is_fatal_and_cleans_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("lumen.pid");
        let mut sup = supervisor("exit 3", Some(pid_file.clone()));
        let err = sup.start().await.unwrap_err();
        assert!(err.is_fatal_at_startup());
        assert_eq!(sup.state(), State::Stopped);
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn reload_replaces_worker_and_stop_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("lumen.pid");
        let mut sup = supervisor("sleep 30", Some(pid_file.clone()));
        sup.start().await.unwrap();
        assert_eq!(
            read_pid(&pid_file).unwrap(),
            Some(i32::try_from(std::process::id()).unwrap())
        );

        let first = sup.worker_pid().unwrap();
        sup.reload().await.unwrap();
        let second = sup.worker_pid().unwrap();
        assert_ne!(first, second);
        // the retired worker is gone
        assert!(kill(Pid::from_raw(first), None).is_err());

        sup.stop().await;
        assert_eq!(sup.state(), State::Stopped);
        assert!(sup.worker_pid().is_none());
        assert!(!pid_file.exists());
        assert!(sup.reload().await.is_err());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_worker() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("started");
        // the first worker leaves a flag behind; later ones see it and fail
        let script = format!(
            "if [ -e {0} ]; then exit 1; fi; touch {0}; sleep 30",
            flag.display()
        );
        let mut sup = supervisor(&script, None);
        sup.start().await.unwrap();
        let first = sup.worker_pid().unwrap();

        assert!(sup.reload().await.is_err());
        assert_eq!(sup.state(), State::Supervising);
        assert_eq!(sup.worker_pid(), Some(first));
        assert!(kill(Pid::from_raw(first), None).is_ok());
        sup.stop().await;
    }
}
