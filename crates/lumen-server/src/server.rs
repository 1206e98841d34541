use std::time::Duration;

use anyhow::Context;
use axum::Router;
use lumen::{
    ProjectConfig,
    supervisor::{self, Signal, SignalListener, Supervisor, SupervisorConfig, WorkerCommand},
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

use crate::routes;

/// Extra time the supervisor grants a worker beyond its own drain window.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Parent process: binds the listener and keeps a worker serving it.
pub async fn supervise(config: &ProjectConfig) -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind(config.listen)
        .with_context(|| format!("bind {}", config.listen))?;
    info!(listen = %config.listen, pid = std::process::id(), "Supervisor listening");

    let mut supervisor_config = SupervisorConfig::new(WorkerCommand::current()?);
    supervisor_config.pid_file = Some(config.pid.clone());
    supervisor_config.drain_timeout = config.drain_timeout() + DRAIN_GRACE;

    let signals = supervisor::signals(&Signal::SUPERVISED)?;
    Supervisor::new(supervisor_config, listener)
        .run(signals)
        .await?;
    Ok(())
}

/// Worker process: serves the inherited listener until told to stop.
pub async fn worker(config: &ProjectConfig) -> anyhow::Result<()> {
    let listener = TcpListener::from_std(supervisor::inherited_listener()?)?;
    let state = routes::AppState::new(config)?;
    let app = routes::router(&state)?;
    info!(pid = std::process::id(), "Worker serving");

    serve(app, listener, config.drain_timeout()).await?;
    state.shutdown();
    Ok(())
}

/// Serves `app` until a shutdown signal, then lets in-flight requests finish
/// for at most `drain`.
pub async fn serve(app: Router, listener: TcpListener, drain: Duration) -> anyhow::Result<()> {
    let (stop, stopping) = watch::channel(false);
    let signals = SignalListener::listen(&Signal::SUPERVISED, move |signal| {
        if signal.is_shutdown() {
            info!(%signal, "Draining");
            stop.send_replace(true);
        } else {
            // reloads are the supervisor's business
            info!(%signal, "Ignoring signal");
        }
    })?;

    let server = axum::serve(listener, app).with_graceful_shutdown(stopped(stopping.clone()));
    let deadline = async move {
        stopped(stopping).await;
        tokio::time::sleep(drain).await;
    };
    let outcome = tokio::select! {
        result = server.into_future() => result.map_err(anyhow::Error::from),
        () = deadline => {
            warn!(?drain, "Drain timeout reached; dropping remaining connections");
            Ok(())
        }
    };
    signals.cancel().await;
    outcome
}

/// Resolves once a shutdown signal arrived; never if the listener went away.
async fn stopped(mut stopping: watch::Receiver<bool>) {
    if stopping.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use nix::{sys::signal, unistd::Pid};

    use super::*;

    #[tokio::test]
    async fn reload_signal_is_ignored_and_shutdown_drains() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(serve(Router::new(), listener, Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        signal::kill(Pid::this(), signal::Signal::SIGHUP).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.is_finished());

        signal::kill(Pid::this(), signal::Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
