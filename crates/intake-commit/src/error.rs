use intake_ledger::LedgerError;
use intake_worker::RemoteFailure;
use thiserror::Error;

use crate::writer::WriteError;

pub const WORKBOOK_NOT_OPEN_MESSAGE: &str =
    "Fehler: Annahme muss geöffnet sein. Bitte öffnen und erneut versuchen";
pub const WORKBOOK_READONLY_MESSAGE: &str = concat!(
    "Annahme.xlsx ist schreibgeschützt oder von einem anderen Benutzer gesperrt. ",
    "Bitte in Excel schreibbar öffnen oder Sperre lösen."
);

const NOT_OPEN_CODE: &str = "WORKBOOK_NOT_OPEN";
const READONLY_CODE: &str = "WORKBOOK_READONLY";
const NOT_OPEN_PHRASES: [&str; 3] = ["muss offen sein", "muss geöffnet sein", "must be open"];

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// The live workbook is not open; raw diagnostics are dropped.
    #[error("{}", WORKBOOK_NOT_OPEN_MESSAGE)]
    WorkbookNotOpen { backend: String },
    #[error("{}", WORKBOOK_READONLY_MESSAGE)]
    WorkbookReadonly {
        backend: String,
        diagnostics: Option<RemoteFailure>,
    },
    #[error("Writer fehlgeschlagen ({backend}): {message}")]
    Writer {
        backend: String,
        message: String,
        diagnostics: Option<RemoteFailure>,
    },
    #[error("background task failed: {0}")]
    Task(String),
}

impl CommitError {
    /// Classify a writer failure.
    pub fn from_write(backend: &str, err: WriteError) -> CommitError {
        let backend = backend.to_string();
        let (message, diagnostics) = match err {
            WriteError::Remote(failure) => (failure.message(), Some(failure)),
            other => (other.to_string(), None),
        };
        let code = diagnostics.as_ref().and_then(|d| d.code.as_deref());

        let error_text = diagnostics.as_ref().map_or(message.as_str(), |d| d.error.as_str());
        if code == Some(NOT_OPEN_CODE) || is_not_open_message(error_text) {
            return CommitError::WorkbookNotOpen { backend };
        }
        if code == Some(READONLY_CODE) {
            return CommitError::WorkbookReadonly {
                backend,
                diagnostics,
            };
        }
        CommitError::Writer {
            backend,
            message,
            diagnostics,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CommitError::WorkbookReadonly { .. } => 409,
            CommitError::Ledger(LedgerError::SequenceExhausted { .. }) => 409,
            CommitError::WorkbookNotOpen { .. } | CommitError::Writer { .. } => 400,
            CommitError::Ledger(_) | CommitError::Task(_) => 500,
        }
    }

    /// Text suitable for showing to the person at the intake desk.
    pub fn user_message(&self) -> String {
        match self {
            CommitError::Writer {
                backend,
                message,
                diagnostics,
            } => {
                let text = diagnostics.as_ref().map_or(message.as_str(), |d| d.error.as_str());
                format!("Writer fehlgeschlagen ({backend}): {text}")
            }
            other => other.to_string(),
        }
    }

    /// Diagnostic fields worth returning to the caller, if any.
    pub fn diagnostics(&self) -> Option<&RemoteFailure> {
        match self {
            CommitError::WorkbookReadonly { diagnostics, .. }
            | CommitError::Writer { diagnostics, .. } => diagnostics.as_ref(),
            _ => None,
        }
    }
}

fn is_not_open_message(text: &str) -> bool {
    NOT_OPEN_PHRASES.iter().any(|phrase| text.contains(phrase))
}

pub type Result<T> = std::result::Result<T, CommitError>;
