use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors that end a run. Anything that goes wrong inside a single probe is a
/// [`ProbeError`] instead and never escapes its task.
#[derive(Debug, Error)]
pub enum Error {
    #[error("can't list endpoint configs in {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't write report: {0}")]
    ReportWrite(#[source] io::Error),
    #[error("couldn't write to console: {0}")]
    Console(#[source] io::Error),
    #[error("couldn't build geolocation client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Why a single endpoint produced no measurement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The task's deadline elapsed before the probe answered.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The probe mechanism itself failed: bad address, no route, etc.
    #[error("{0}")]
    Transport(String),
    /// The run was cancelled before the probe finished.
    #[error("cancelled")]
    Cancelled,
    #[error("probe panicked: {0}")]
    Panicked(String),
}

impl ProbeError {
    pub fn transport(reason: impl ToString) -> Self {
        Self::Transport(reason.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
