use std::fmt;

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_stream::wrappers::SignalStream;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hangup,
    Interrupt,
    Terminate,
    Quit,
}

impl Signal {
    /// Signals a supervisor reacts to.
    pub const SUPERVISED: [Self; 4] = [Self::Hangup, Self::Interrupt, Self::Terminate, Self::Quit];

    const fn kind(self) -> SignalKind {
        match self {
            Self::Hangup => SignalKind::hangup(),
            Self::Interrupt => SignalKind::interrupt(),
            Self::Terminate => SignalKind::terminate(),
            Self::Quit => SignalKind::quit(),
        }
    }

    /// Whether the signal asks for a graceful shutdown.
    #[must_use]
    pub const fn is_shutdown(self) -> bool {
        !matches!(self, Self::Hangup)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hangup => "SIGHUP",
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Quit => "SIGQUIT",
        })
    }
}

/// Merged stream of the requested signals.
///
/// # Errors
/// Returns [`Error::Supervision`] if a handler cannot be registered.
pub fn signals(kinds: &[Signal]) -> Result<BoxStream<'static, Signal>> {
    let mut streams = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let listener = signal(kind.kind())
            .map_err(|err| Error::Supervision(format!("listen for {kind}: {err}")))?;
        streams.push(SignalStream::new(listener).map(move |()| kind).boxed());
    }
    Ok(stream::select_all(streams).boxed())
}

/// Runs `handler` on a dedicated task for every delivered signal until
/// cancelled.
pub struct SignalListener {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SignalListener {
    /// # Errors
    /// Returns [`Error::Supervision`] if a handler cannot be registered.
    pub fn listen<F>(kinds: &[Signal], mut handler: F) -> Result<Self>
    where
        F: FnMut(Signal) + Send + 'static,
    {
        let mut stream = signals(kinds)?;
        let (cancel, mut cancelled) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    signal = stream.next() => match signal {
                        Some(signal) => {
                            debug!(%signal, "Received signal");
                            handler(signal);
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(Self {
            cancel: Some(cancel),
            task,
        })
    }

    /// Stops listening and waits for the listener task to finish.
    pub async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}
