//! Client for the workbook automation worker.
//!
//! The worker is a long-lived child process that performs the privileged
//! writes against the live workbook. It speaks line-delimited JSON over its
//! standard streams ([`protocol`]); [`WorkerClient`] supervises it, correlates
//! responses to requests and restarts it after crashes and timeouts.

mod client;
mod error;
pub mod protocol;

pub use client::{
    shutdown_signal, RequestOptions, WorkerClient, WorkerCommand, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_WARMUP_TIMEOUT,
};
pub use error::{Result, WorkerError};
pub use protocol::{RemoteFailure, WorkerResponse};
