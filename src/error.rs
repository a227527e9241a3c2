use crate::backends::BackendKind;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Fieldless classification handed to `SpeechListener::on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    BackendUnavailable,
    ProcessSpawnFailure,
    SynthesisFailure,
    PlaybackDeviceUnavailable,
    Timeout,
    Cancelled,
    InvalidRequest,
}

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("{0} backend is not available: no executable found")]
    BackendUnavailable(BackendKind),

    #[error("failed to spawn {program}: {source}")]
    ProcessSpawnFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Carries the stderr of the failing process verbatim.
    #[error("synthesis failed: {0}")]
    SynthesisFailure(String),

    #[error("no audio player available: {0}")]
    PlaybackDeviceUnavailable(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SpeechError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpeechError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            SpeechError::ProcessSpawnFailure { .. } => ErrorKind::ProcessSpawnFailure,
            SpeechError::SynthesisFailure(_) => ErrorKind::SynthesisFailure,
            SpeechError::PlaybackDeviceUnavailable(_) => ErrorKind::PlaybackDeviceUnavailable,
            SpeechError::Timeout { .. } => ErrorKind::Timeout,
            SpeechError::Cancelled => ErrorKind::Cancelled,
            SpeechError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SpeechError::Cancelled)
    }

    pub(crate) fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        SpeechError::ProcessSpawnFailure {
            program: program.into(),
            source,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        SpeechError::Timeout {
            what: what.into(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, SpeechError>;
