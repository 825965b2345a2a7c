//! Commit orchestration.
//!
//! A commit moves through `validated -> hinted -> writing -> reconciled`, or
//! ends in `failed` after the write step with the cache left untouched:
//!
//! 1. the caller hands over a validated [`OrderPayload`]
//! 2. the ledger cache is validated (or rebuilt) and a [`CommitHint`] derived
//! 3. the configured [`LedgerWriter`] appends the block
//! 4. the cache entry is advanced from the writer's answer and the result is
//!    stored under the client's request id
//!
//! Errors before step 3 mean nothing was written. A failure in step 3 drops
//! the request id so that a client retry runs as a fresh commit.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Local, NaiveDate};
use intake_ledger::{
    lab_number_range, next_lab_numbers, resolve_year_sheet_name, CacheEntry, CommitHint,
    CommitRecord, FileMeta, LedgerCache,
};
use serde::{Deserialize, Serialize};

use crate::idempotency::{BeginOutcome, CommitState, IdempotencyStore};
use crate::writer::{AppendOutcome, AppendRequest, LedgerWriter, OrderPayload};
use crate::{CommitError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub order: OrderPayload,
    pub client_request_id: Option<String>,
}

/// Response of a finished commit, also replayed for duplicate requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub ok: bool,
    pub order_no: String,
    pub sample_nos: Vec<u64>,
    pub append_row: u32,
    pub end_row_range: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_ignored: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_request_id: Option<String>,
    pub writer: String,
    pub saved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(CommitResult),
    /// The request id was already completed; this is the original response.
    Replayed(CommitResult),
    /// The request id is still being written by an earlier call.
    StillProcessing { client_request_id: String },
}

impl CommitOutcome {
    pub fn result(&self) -> Option<&CommitResult> {
        match self {
            CommitOutcome::Committed(result) | CommitOutcome::Replayed(result) => Some(result),
            CommitOutcome::StillProcessing { .. } => None,
        }
    }
}

/// Identifiers the next commit would receive, without writing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitPreview {
    pub sheet_name: String,
    pub order_no: String,
    pub sample_nos: Vec<u64>,
    pub append_row: u32,
    pub end_row_range: String,
    pub today_prefix: String,
    pub next_seq: u32,
}

pub struct CommitOrchestrator<W> {
    workbook_path: PathBuf,
    year_sheet_name: String,
    cache: Arc<Mutex<LedgerCache>>,
    requests: Mutex<IdempotencyStore>,
    writer: W,
}

impl<W: LedgerWriter> CommitOrchestrator<W> {
    pub fn new(
        workbook_path: impl Into<PathBuf>,
        year_sheet_name: impl Into<String>,
        cache: LedgerCache,
        requests: IdempotencyStore,
        writer: W,
    ) -> Self {
        Self {
            workbook_path: workbook_path.into(),
            year_sheet_name: year_sheet_name.into(),
            cache: Arc::new(Mutex::new(cache)),
            requests: Mutex::new(requests),
            writer,
        }
    }

    pub fn workbook_path(&self) -> &Path {
        &self.workbook_path
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn cache(&self) -> MutexGuard<'_, LedgerCache> {
        self.cache.lock().expect("ledger cache mutex poisoned")
    }

    fn requests(&self) -> MutexGuard<'_, IdempotencyStore> {
        self.requests.lock().expect("commit request store mutex poisoned")
    }

    pub fn sheet_name_for(&self, today: NaiveDate) -> String {
        resolve_year_sheet_name(&self.year_sheet_name, today)
    }

    pub async fn commit(&self, request: CommitRequest) -> Result<CommitOutcome> {
        self.commit_at(request, Local::now()).await
    }

    pub async fn commit_at(
        &self,
        request: CommitRequest,
        now: DateTime<Local>,
    ) -> Result<CommitOutcome> {
        let request_id = request
            .client_request_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        if let Some(id) = &request_id {
            let begin = self.requests().begin(id, Instant::now());
            if let BeginOutcome::Duplicate(existing) = begin {
                return Ok(match (existing.state, existing.response) {
                    (CommitState::Done, Some(mut response)) => {
                        log::info!("[commit] duplicate request {id} answered from store");
                        response.duplicate_ignored = Some(true);
                        CommitOutcome::Replayed(response)
                    }
                    _ => CommitOutcome::StillProcessing {
                        client_request_id: id.clone(),
                    },
                });
            }
        }

        let result = self.execute(&request.order, request_id.as_deref(), now).await;
        if let Some(id) = &request_id {
            let mut requests = self.requests();
            match &result {
                Ok(response) => {
                    requests.complete(id, response.clone());
                }
                Err(_) => {
                    requests.remove(id);
                }
            }
            requests.prune(Instant::now());
        }
        result.map(CommitOutcome::Committed)
    }

    async fn execute(
        &self,
        order: &OrderPayload,
        request_id: Option<&str>,
        now: DateTime<Local>,
    ) -> Result<CommitResult> {
        let today = now.date_naive();
        let sheet_name = self.sheet_name_for(today);
        let entry = self.ensure_entry(&sheet_name, today).await?;
        let hint = CommitHint::from_entry(&entry, today)?;
        let sample_count = order.sample_count();

        let backend = self.writer.backend();
        let outcome = self
            .writer
            .append(AppendRequest {
                workbook_path: entry.workbook_path.clone(),
                sheet_name,
                now,
                order: order.clone(),
                hint: Some(hint.clone()),
            })
            .await
            .map_err(|err| {
                let err = CommitError::from_write(backend, err);
                log::warn!("[commit] write failed: {err}");
                err
            })?;

        let resolved = ResolvedWrite::new(&outcome, &hint, sample_count);
        let saved = outcome.saved != Some(false);
        if saved {
            let record = CommitRecord {
                append_row: resolved.append_row,
                end_row: resolved.end_row,
                last_lab_number: resolved.sample_nos.last().copied(),
                today_prefix: resolved.today_prefix.clone(),
                order_seq: resolved.order_seq,
            };
            let meta = FileMeta::probe(&entry.workbook_path);
            if !self.cache().record_commit(&record, meta) {
                log::debug!("[commit] no cache entry to advance");
            }
        }

        let writer = outcome.writer.unwrap_or_else(|| backend.to_string());
        log::info!(
            "[commit] writer={writer} order={} rows={}",
            resolved.order_no,
            resolved.end_row_range
        );
        Ok(CommitResult {
            ok: true,
            order_no: resolved.order_no,
            sample_nos: resolved.sample_nos,
            append_row: resolved.append_row,
            end_row_range: resolved.end_row_range,
            duplicate_ignored: None,
            client_request_id: request_id.map(str::to_string),
            writer,
            saved,
        })
    }

    /// Valid cache entry for the sheet in use on `today`.
    pub async fn ensure_entry(&self, sheet_name: &str, today: NaiveDate) -> Result<CacheEntry> {
        let cache = Arc::clone(&self.cache);
        let path = self.workbook_path.clone();
        let sheet_name = sheet_name.to_string();
        tokio::task::spawn_blocking(move || {
            let mut cache = cache.lock().expect("ledger cache mutex poisoned");
            cache.ensure(&path, &sheet_name, today)
        })
        .await
        .map_err(|err| CommitError::Task(err.to_string()))?
        .map_err(CommitError::from)
    }

    /// What the next commit of an order with `sample_count` samples would get.
    pub async fn preview(
        &self,
        sample_count: usize,
        now: DateTime<Local>,
    ) -> Result<CommitPreview> {
        let today = now.date_naive();
        let sheet_name = self.sheet_name_for(today);
        let entry = self.ensure_entry(&sheet_name, today).await?;
        let hint = CommitHint::from_entry(&entry, today)?;
        let end_row = block_end_row(hint.append_row, sample_count);
        Ok(CommitPreview {
            sheet_name,
            order_no: hint.computed_order_no,
            sample_nos: next_lab_numbers(&entry, sample_count),
            append_row: hint.append_row,
            end_row_range: format!("A{}:J{end_row}", hint.append_row),
            today_prefix: hint.today_prefix,
            next_seq: hint.next_seq,
        })
    }

    /// Write the current cache entry to the snapshot file.
    pub fn persist_snapshot(&self) -> Result<bool> {
        Ok(self.cache().persist()?)
    }

    /// Drop the cached ledger state and its snapshot; the next commit rescans.
    pub fn reset(&self) -> Result<()> {
        self.cache().reset()?;
        log::info!("[commit] ledger cache reset");
        Ok(())
    }

    pub fn cached_entry(&self) -> Option<CacheEntry> {
        self.cache().current().cloned()
    }
}

/// Header row plus one row per sample.
fn block_end_row(append_row: u32, sample_count: usize) -> u32 {
    append_row.saturating_add(u32::try_from(sample_count).unwrap_or(u32::MAX))
}

/// Writer answer with gaps filled from the hint.
struct ResolvedWrite {
    append_row: u32,
    end_row: u32,
    end_row_range: String,
    sample_nos: Vec<u64>,
    order_no: String,
    today_prefix: String,
    order_seq: u32,
}

impl ResolvedWrite {
    fn new(outcome: &AppendOutcome, hint: &CommitHint, sample_count: usize) -> Self {
        let append_row = outcome.append_row.unwrap_or(hint.append_row);
        let end_row = block_end_row(append_row, sample_count);
        let start_lab_no = outcome.start_lab_no.unwrap_or(hint.start_lab_no);
        let sample_nos = outcome
            .sample_nos
            .clone()
            .unwrap_or_else(|| lab_number_range(start_lab_no, sample_count));
        let order_no = outcome
            .order_no
            .clone()
            .unwrap_or_else(|| hint.computed_order_no.clone());
        let today_prefix = outcome
            .today_prefix
            .clone()
            .or_else(|| order_no.get(..7).map(str::to_string))
            .unwrap_or_else(|| hint.today_prefix.clone());
        let order_seq = outcome
            .next_seq
            .or_else(|| order_no.get(7..).and_then(|seq| seq.parse().ok()))
            .unwrap_or(hint.next_seq);
        let end_row_range = outcome
            .end_row_range
            .clone()
            .unwrap_or_else(|| format!("A{append_row}:J{end_row}"));

        Self {
            append_row,
            end_row,
            end_row_range,
            sample_nos,
            order_no,
            today_prefix,
            order_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hint() -> CommitHint {
        CommitHint {
            append_row: 4,
            start_lab_no: 26204,
            today_prefix: "2602268".into(),
            max_order_seq_today: 1,
            next_seq: 2,
            computed_order_no: "260226802".into(),
        }
    }

    #[test]
    fn empty_outcome_falls_back_to_the_hint() {
        let resolved = ResolvedWrite::new(&AppendOutcome::default(), &hint(), 2);
        assert_eq!(resolved.append_row, 4);
        assert_eq!(resolved.end_row, 6);
        assert_eq!(resolved.end_row_range, "A4:J6");
        assert_eq!(resolved.sample_nos, vec![26204, 26205]);
        assert_eq!(resolved.order_no, "260226802");
        assert_eq!(resolved.today_prefix, "2602268");
        assert_eq!(resolved.order_seq, 2);
    }

    #[test]
    fn writer_values_win_over_the_hint() {
        let outcome = AppendOutcome {
            append_row: Some(9),
            start_lab_no: Some(26210),
            order_no: Some("260226805".into()),
            ..AppendOutcome::default()
        };
        let resolved = ResolvedWrite::new(&outcome, &hint(), 1);
        assert_eq!(resolved.append_row, 9);
        assert_eq!(resolved.end_row_range, "A9:J10");
        assert_eq!(resolved.sample_nos, vec![26210]);
        assert_eq!(resolved.today_prefix, "2602268");
        assert_eq!(resolved.order_seq, 5);
    }
}
