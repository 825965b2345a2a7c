//! Commit path for intake orders.
//!
//! Ties the ledger cache ([`intake_ledger`]) to a writer backend
//! ([`LedgerWriter`], normally the automation worker) and guarantees that a
//! client request id is written at most once ([`IdempotencyStore`]).

mod config;
mod error;
pub mod idempotency;
mod orchestrator;
pub mod writer;

pub use config::{
    ConfigError, IdempotencyConfig, LedgerConfig, WorkerConfig, WriterBackend, ENV_EXCEL_PATH,
    ENV_WORKER_PROGRAM, ENV_WORKER_TIMEOUT_MS, ENV_YEAR_SHEET,
};
pub use error::{CommitError, Result, WORKBOOK_NOT_OPEN_MESSAGE, WORKBOOK_READONLY_MESSAGE};
pub use idempotency::{BeginOutcome, CommitState, IdempotencyStore, PendingCommit};
pub use orchestrator::{
    CommitOrchestrator, CommitOutcome, CommitPreview, CommitRequest, CommitResult,
};
pub use writer::{
    AppendOutcome, AppendRequest, FallbackWriter, LedgerWriter, OrderPayload, UnavailableWriter,
    WorkerLedgerWriter, WriteError,
};
