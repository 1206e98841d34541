use std::{path::PathBuf, sync::Arc};

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Message raised inside the interpreter when a deadline hook fires.
pub(crate) const DEADLINE_MESSAGE: &str = "execution deadline exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
    Supervision,
    Configuration,
    Internal,
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Syntax error or implicit global assignment found while compiling.
    #[error("compile error near {}:{line}: {message}", path.display())]
    Compile {
        path: PathBuf,
        line: u32,
        message: String,
    },

    /// Error raised by a running script.
    #[error("{message}")]
    Runtime {
        message: String,
        traceback: Option<String>,
    },

    /// The execution deadline attached to a child engine expired.
    #[error("{DEADLINE_MESSAGE}")]
    DeadlineExceeded,

    /// Worker spawn, descriptor handoff, pid file or signal setup failed.
    #[error("supervision error: {0}")]
    Supervision(String),

    /// Project configuration is malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Interpreter failure outside of script execution.
    #[error("interpreter error: {0}")]
    Lua(#[from] mlua::Error),

    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl Error {
    /// Converts an error surfaced by script execution, keeping the traceback
    /// apart from the message shown to clients.
    #[must_use]
    pub fn from_script(err: &mlua::Error) -> Self {
        let text = err.to_string();
        if text.contains(DEADLINE_MESSAGE) {
            return Self::DeadlineExceeded;
        }
        match text.split_once("\nstack traceback:") {
            Some((message, rest)) => Self::Runtime {
                message: message.trim_end().to_string(),
                traceback: Some(format!("stack traceback:{rest}")),
            },
            None => Self::Runtime {
                message: text,
                traceback: None,
            },
        }
    }

    pub(crate) fn compile(path: impl Into<PathBuf>, line: u32, message: impl Into<String>) -> Self {
        Self::Compile {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Compile { .. } => ErrorKind::Compile,
            Self::Runtime { .. } | Self::DeadlineExceeded => ErrorKind::Runtime,
            Self::Supervision(_) => ErrorKind::Supervision,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Lua(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error is a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }

    /// Whether this error must abort process startup.
    #[must_use]
    pub const fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Supervision | ErrorKind::Configuration | ErrorKind::Compile
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_traceback_from_message() {
        let err = mlua::Error::RuntimeError(
            "handler.lua:3: boom\nstack traceback:\n\t[C]: in ?".to_string(),
        );
        match Error::from_script(&err) {
            Error::Runtime { message, traceback } => {
                assert_eq!(message, "handler.lua:3: boom");
                assert!(traceback.expect("traceback").starts_with("stack traceback:"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn recognizes_deadline() {
        let err = mlua::Error::RuntimeError(format!("x.lua:1: {DEADLINE_MESSAGE}"));
        assert!(matches!(Error::from_script(&err), Error::DeadlineExceeded));
    }
}
