use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::RemoteFailure;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker client has been shut down")]
    Disposed,
    #[error("worker did not answer within {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },
    #[error("worker exited ({status})")]
    Exited { status: String },
    #[error("worker stopped")]
    Stopped,
    #[error("failed to send request to worker: {0}")]
    Write(#[source] io::Error),
    #[error("failed to encode worker request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Remote(RemoteFailure),
    /// The first attempt failed after it was sent and the retry could not run.
    #[error("worker retry failed after {attempt}: {source}")]
    RetryFailed {
        attempt: Box<WorkerError>,
        #[source]
        source: Box<WorkerError>,
    },
}

impl WorkerError {
    /// Whether restarting the worker may help.
    ///
    /// A worker that answered `ok: false` is alive and will answer the same
    /// way again; a worker that cannot be spawned will not spawn on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkerError::Timeout { .. }
                | WorkerError::Exited { .. }
                | WorkerError::Stopped
                | WorkerError::Write(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
