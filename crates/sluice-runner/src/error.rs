//! Runner error types.

use std::time::Duration;

use thiserror::Error;

use crate::container::ContainerError;
use crate::materialize::MaterializeError;

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while running a connector.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The connector image is not available locally yet. Nothing was spawned.
    #[error("connector image {image} is not ready yet")]
    NotReady { image: String },

    /// The runner was already closed. Nothing was spawned.
    #[error("connector runner has already been terminated")]
    AlreadyTerminated,

    /// The expected message never arrived, or a streamed line was malformed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connector reported a FAILED connection status. Displays the
    /// connector's own message unchanged.
    #[error("{0}")]
    ConnectorFailure(String),

    /// The connector reported a status outside SUCCEEDED/FAILED.
    #[error("unknown connection status [{status}]: {message}")]
    UnknownStatus { status: String, message: String },

    /// Spawn failure, non-zero exit, or I/O error on a killed process.
    #[error("connector process error: {0}")]
    Process(String),

    /// The invocation deadline elapsed and the process was killed.
    #[error("connector run timed out after {0:?}")]
    Timeout(Duration),

    /// A defect while handling connector output. Always fatal for the task.
    #[error("internal fault while processing connector output: {0}")]
    InternalFault(String),

    /// The data consumer rejected a record or checkpoint.
    #[error("data consumer rejected {what}: {message}")]
    Consumer { what: String, message: String },

    /// Writing the configuration file for the container failed.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    /// Invalid container input (image or container name).
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Any of the above, annotated with everything the connector printed.
    #[error("{message}")]
    Diagnosed {
        message: String,
        #[source]
        source: Box<RunnerError>,
    },
}

impl RunnerError {
    /// The underlying error with any diagnostic wrapping removed.
    pub fn root(&self) -> &RunnerError {
        match self {
            RunnerError::Diagnosed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self.root(), RunnerError::NotReady { .. })
    }

    pub fn is_already_terminated(&self) -> bool {
        matches!(self.root(), RunnerError::AlreadyTerminated)
    }

    /// Whether the owning task must be marked as failed without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), RunnerError::InternalFault(_))
    }
}
