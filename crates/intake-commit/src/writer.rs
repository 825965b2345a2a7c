//! Writer backends that perform the actual append against the workbook.

use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use intake_ledger::CommitHint;
use intake_worker::{RemoteFailure, RequestOptions, WorkerClient, WorkerError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// A validated order as received from the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderPayload(pub Value);

impl OrderPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Number of samples in the order (`proben`, or `samples`).
    pub fn sample_count(&self) -> usize {
        self.0
            .get("proben")
            .or_else(|| self.0.get("samples"))
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub workbook_path: PathBuf,
    pub sheet_name: String,
    pub now: DateTime<Local>,
    pub order: OrderPayload,
    pub hint: Option<CommitHint>,
}

/// What a writer reports back. Every field is optional; missing ones are
/// filled from the hint by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppendOutcome {
    pub append_row: Option<u32>,
    pub end_row_range: Option<String>,
    pub start_lab_no: Option<u64>,
    pub sample_nos: Option<Vec<u64>>,
    pub order_no: Option<String>,
    pub today_prefix: Option<String>,
    pub max_order_seq_today: Option<u32>,
    pub next_seq: Option<u32>,
    pub used_hint: Option<bool>,
    pub saved: Option<bool>,
    /// Backend that performed the write.
    pub writer: Option<String>,
}

#[derive(Debug, Error)]
pub enum WriteError {
    /// Nothing was attempted; a fallback backend may take over.
    #[error("{backend} writer unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("{0}")]
    Remote(RemoteFailure),
    #[error(transparent)]
    Worker(WorkerError),
    #[error("invalid writer response: {0}")]
    InvalidResponse(String),
}

pub trait LedgerWriter: Send + Sync {
    fn backend(&self) -> &'static str;

    fn append(
        &self,
        request: AppendRequest,
    ) -> impl Future<Output = Result<AppendOutcome, WriteError>> + Send;
}

/// Appends through the live automation worker.
#[derive(Debug, Clone)]
pub struct WorkerLedgerWriter {
    client: WorkerClient,
    options: RequestOptions,
}

impl WorkerLedgerWriter {
    pub const BACKEND: &'static str = "worker";

    pub fn new(client: WorkerClient, options: RequestOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &WorkerClient {
        &self.client
    }

    /// Only failures before the request reached a worker count as unavailable.
    /// A failed retry keeps its [`WorkerError::RetryFailed`] wrapper so that no
    /// fallback runs on a write that may already have happened.
    fn write_error(err: WorkerError) -> WriteError {
        match err {
            WorkerError::Spawn { .. } | WorkerError::Disposed => WriteError::Unavailable {
                backend: Self::BACKEND,
                reason: err.to_string(),
            },
            WorkerError::Remote(failure) => WriteError::Remote(failure),
            other => WriteError::Worker(other),
        }
    }

    fn payload(request: &AppendRequest) -> Value {
        json!({
            "action": "append",
            "excelPath": request.workbook_path.to_string_lossy(),
            "yearSheetName": request.sheet_name,
            "now": request.now.to_rfc3339(),
            "order": request.order,
            "hint": request.hint,
        })
    }
}

impl LedgerWriter for WorkerLedgerWriter {
    fn backend(&self) -> &'static str {
        Self::BACKEND
    }

    fn append(
        &self,
        request: AppendRequest,
    ) -> impl Future<Output = Result<AppendOutcome, WriteError>> + Send {
        let payload = Self::payload(&request);
        let client = self.client.clone();
        let options = self.options;
        async move {
            let body = client
                .request(&payload, options)
                .await
                .map_err(Self::write_error)?;
            let mut outcome: AppendOutcome = serde_json::from_value(Value::Object(body))
                .map_err(|err| WriteError::InvalidResponse(err.to_string()))?;
            outcome.writer.get_or_insert_with(|| Self::BACKEND.to_string());
            Ok(outcome)
        }
    }
}

/// A backend that is configured but not provided by this process.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableWriter {
    backend: &'static str,
}

impl UnavailableWriter {
    pub fn new(backend: &'static str) -> Self {
        Self { backend }
    }
}

impl LedgerWriter for UnavailableWriter {
    fn backend(&self) -> &'static str {
        self.backend
    }

    fn append(
        &self,
        _request: AppendRequest,
    ) -> impl Future<Output = Result<AppendOutcome, WriteError>> + Send {
        let backend = self.backend;
        async move {
            Err(WriteError::Unavailable {
                backend,
                reason: "no writer registered for this backend".to_string(),
            })
        }
    }
}

/// Uses `fallback` only when `primary` could not attempt the write at all.
#[derive(Debug, Clone)]
pub struct FallbackWriter<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackWriter<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }
}

impl<P: LedgerWriter, F: LedgerWriter> LedgerWriter for FallbackWriter<P, F> {
    fn backend(&self) -> &'static str {
        self.primary.backend()
    }

    fn append(
        &self,
        request: AppendRequest,
    ) -> impl Future<Output = Result<AppendOutcome, WriteError>> + Send {
        async move {
            match self.primary.append(request.clone()).await {
                Err(WriteError::Unavailable { backend, reason }) => {
                    log::warn!(
                        "[commit] {backend} writer unavailable ({reason}), using {}",
                        self.fallback.backend()
                    );
                    let mut outcome = self.fallback.append(request).await?;
                    outcome
                        .writer
                        .get_or_insert_with(|| self.fallback.backend().to_string());
                    Ok(outcome)
                }
                other => other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Mode {
        Succeed,
        Unavailable,
        /// Timed out, then the worker could not be restarted.
        RetryFailed,
    }

    struct Scripted {
        name: &'static str,
        mode: Mode,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, mode: Mode) -> Self {
            Self {
                name,
                mode,
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn spawn_failure() -> WorkerError {
        WorkerError::Spawn {
            program: "worker.exe".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
    }

    fn retry_failure() -> WorkerError {
        WorkerError::RetryFailed {
            attempt: Box::new(WorkerError::Timeout {
                timeout: std::time::Duration::from_millis(300),
            }),
            source: Box::new(spawn_failure()),
        }
    }

    impl LedgerWriter for Scripted {
        fn backend(&self) -> &'static str {
            self.name
        }

        fn append(
            &self,
            _request: AppendRequest,
        ) -> impl Future<Output = Result<AppendOutcome, WriteError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (name, mode) = (self.name, self.mode);
            async move {
                match mode {
                    Mode::Succeed => Ok(AppendOutcome {
                        append_row: Some(2),
                        ..AppendOutcome::default()
                    }),
                    Mode::Unavailable => Err(WriteError::Unavailable {
                        backend: name,
                        reason: "not running".into(),
                    }),
                    Mode::RetryFailed => Err(WorkerLedgerWriter::write_error(retry_failure())),
                }
            }
        }
    }

    fn request() -> AppendRequest {
        AppendRequest {
            workbook_path: PathBuf::from("/data/Auftragsbuch.xlsx"),
            sheet_name: "2026".into(),
            now: Local::now(),
            order: OrderPayload::new(json!({"proben": [1, 2]})),
            hint: None,
        }
    }

    #[test]
    fn sample_count_reads_either_key() {
        assert_eq!(OrderPayload::new(json!({"proben": [1, 2, 3]})).sample_count(), 3);
        assert_eq!(OrderPayload::new(json!({"samples": [1]})).sample_count(), 1);
        assert_eq!(OrderPayload::new(json!({"kunde": "x"})).sample_count(), 0);
    }

    #[test]
    fn worker_payload_carries_hint_and_order() {
        let mut req = request();
        req.hint = Some(CommitHint {
            append_row: 4,
            start_lab_no: 26204,
            today_prefix: "2602268".into(),
            max_order_seq_today: 1,
            next_seq: 2,
            computed_order_no: "260226802".into(),
        });
        let payload = WorkerLedgerWriter::payload(&req);
        assert_eq!(payload["action"], json!("append"));
        assert_eq!(payload["yearSheetName"], json!("2026"));
        assert_eq!(payload["order"]["proben"], json!([1, 2]));
        assert_eq!(payload["hint"]["appendRow"], json!(4));
        assert_eq!(payload["hint"]["computedOrderNo"], json!("260226802"));
    }

    #[test]
    fn outcome_tolerates_unknown_and_missing_fields() {
        let outcome: AppendOutcome = serde_json::from_value(json!({
            "appendRow": 4,
            "sampleNos": [26204],
            "excelHwnd": 1234
        }))
        .unwrap();
        assert_eq!(outcome.append_row, Some(4));
        assert_eq!(outcome.sample_nos, Some(vec![26204]));
        assert_eq!(outcome.saved, None);
    }

    #[test]
    fn only_pre_send_worker_failures_are_unavailable() {
        assert!(matches!(
            WorkerLedgerWriter::write_error(spawn_failure()),
            WriteError::Unavailable { backend: "worker", .. }
        ));
        assert!(matches!(
            WorkerLedgerWriter::write_error(WorkerError::Disposed),
            WriteError::Unavailable { .. }
        ));
        assert!(matches!(
            WorkerLedgerWriter::write_error(retry_failure()),
            WriteError::Worker(WorkerError::RetryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn fallback_only_when_primary_is_unavailable() {
        let writer = FallbackWriter::new(
            Scripted::new("worker", Mode::Unavailable),
            Scripted::new("direct", Mode::Succeed),
        );
        let outcome = writer.append(request()).await.unwrap();
        assert_eq!(outcome.writer.as_deref(), Some("direct"));
        assert_eq!(writer.fallback.calls.load(Ordering::SeqCst), 1);

        let writer = FallbackWriter::new(
            Scripted::new("worker", Mode::Succeed),
            Scripted::new("direct", Mode::Succeed),
        );
        writer.append(request()).await.unwrap();
        assert_eq!(writer.primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(writer.fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_retry_does_not_fall_back() {
        let writer = FallbackWriter::new(
            Scripted::new("worker", Mode::RetryFailed),
            Scripted::new("direct", Mode::Succeed),
        );
        let err = writer.append(request()).await.unwrap_err();
        assert!(matches!(err, WriteError::Worker(WorkerError::RetryFailed { .. })), "{err}");
        assert_eq!(writer.fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_worker_program_falls_back_before_sending() {
        let client = WorkerClient::new(intake_worker::WorkerCommand::new(
            "/nonexistent/intake-worker-binary",
        ));
        let writer = FallbackWriter::new(
            WorkerLedgerWriter::new(client, RequestOptions::default()),
            Scripted::new("direct", Mode::Succeed),
        );
        let outcome = writer.append(request()).await.unwrap();
        assert_eq!(outcome.writer.as_deref(), Some("direct"));
        assert_eq!(writer.fallback.calls.load(Ordering::SeqCst), 1);
    }
}
