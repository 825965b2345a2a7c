use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read workbook {path:?}: {source}")]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("year sheet {0:?} not found")]
    SheetNotFound(String),
    #[error("daily order sequence exhausted for prefix {prefix}")]
    SequenceExhausted { prefix: String },
    #[error("append row {row} already holds content after a full rescan")]
    AppendRowOccupied { row: u32 },
    #[error("invalid cell reference: {0:?}")]
    InvalidCellReference(String),
}

impl LedgerError {
    /// Whether the error means the ledger could not be scanned at all.
    ///
    /// Scan errors abort a commit before anything is written.
    pub fn is_scan_error(&self) -> bool {
        matches!(
            self,
            LedgerError::Io(_)
                | LedgerError::Workbook { .. }
                | LedgerError::SheetNotFound(_)
                | LedgerError::AppendRowOccupied { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
