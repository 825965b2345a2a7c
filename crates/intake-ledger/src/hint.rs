//! Commit hints and append planning.
//!
//! A [`CommitHint`] lets a writer skip its own rescan, but a hint is only a
//! guess derived from the cache. [`plan_append`] trusts it only when the
//! target row is still blank and it was computed for the same day; in every
//! other case the sheet is rescanned.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::numbering::{
    lab_number_range, make_order_number, next_sequence, start_lab_number, today_prefix,
};
use crate::scanner::{scan, LedgerState};
use crate::sheet::LedgerSheet;
use crate::{CacheEntry, LedgerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitHint {
    pub append_row: u32,
    pub start_lab_no: u64,
    pub today_prefix: String,
    pub max_order_seq_today: u32,
    pub next_seq: u32,
    pub computed_order_no: String,
}

impl CommitHint {
    /// Derive the hint for the next commit from a valid cache entry.
    ///
    /// Fails with [`LedgerError::SequenceExhausted`] once today's 99 orders
    /// are used up, before anything is written.
    pub fn from_entry(entry: &CacheEntry, today: NaiveDate) -> Result<CommitHint> {
        let prefix = today_prefix(today);
        let max_order_seq_today = entry.max_order_seq(&prefix);
        let next_seq = next_sequence(&prefix, max_order_seq_today)?;
        let computed_order_no = make_order_number(&prefix, next_seq)?;
        Ok(CommitHint {
            append_row: entry.last_used_row.saturating_add(1),
            start_lab_no: start_lab_number(entry.last_lab_number),
            today_prefix: prefix,
            max_order_seq_today,
            next_seq,
            computed_order_no,
        })
    }
}

/// Why a hint was not trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HintRejection {
    #[error("append row {row} is not blank")]
    RowOccupied { row: u32 },
    #[error("hint prefix {hint} does not match today's prefix {today}")]
    PrefixMismatch { hint: String, today: String },
}

/// Check a hint against the live sheet.
pub fn verify_hint<S: LedgerSheet + ?Sized>(
    sheet: &S,
    hint: &CommitHint,
    today: NaiveDate,
) -> std::result::Result<(), HintRejection> {
    let prefix = today_prefix(today);
    if hint.today_prefix != prefix {
        return Err(HintRejection::PrefixMismatch {
            hint: hint.today_prefix.clone(),
            today: prefix,
        });
    }
    if hint.append_row == 0 || sheet.row_has_content(hint.append_row) {
        return Err(HintRejection::RowOccupied {
            row: hint.append_row,
        });
    }
    Ok(())
}

/// Where and under which identifiers the next order block is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendPlan {
    pub append_row: u32,
    pub start_lab_no: u64,
    pub today_prefix: String,
    pub max_order_seq_today: u32,
    pub next_seq: u32,
    pub order_no: String,
    pub from_hint: bool,
}

impl AppendPlan {
    /// Plan from a fresh scan, leaving one blank row after the last block.
    pub fn from_state(state: &LedgerState, today: NaiveDate) -> Result<AppendPlan> {
        let prefix = today_prefix(today);
        let next_seq = next_sequence(&prefix, state.max_order_seq_today)?;
        let order_no = make_order_number(&prefix, next_seq)?;
        Ok(AppendPlan {
            append_row: state.last_used_row.saturating_add(2),
            start_lab_no: start_lab_number(state.max_lab_number),
            today_prefix: prefix,
            max_order_seq_today: state.max_order_seq_today,
            next_seq,
            order_no,
            from_hint: false,
        })
    }

    fn from_hint(hint: &CommitHint) -> AppendPlan {
        AppendPlan {
            append_row: hint.append_row,
            start_lab_no: start_lab_number(hint.start_lab_no.saturating_sub(1)),
            today_prefix: hint.today_prefix.clone(),
            max_order_seq_today: hint.max_order_seq_today,
            next_seq: hint.next_seq,
            order_no: hint.computed_order_no.clone(),
            from_hint: true,
        }
    }

    pub fn sample_numbers(&self, count: usize) -> Vec<u64> {
        lab_number_range(self.start_lab_no, count)
    }

    /// Last row of the block: the header row plus one row per sample.
    pub fn end_row(&self, count: usize) -> u32 {
        self.append_row.saturating_add(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub fn end_row_range(&self, count: usize) -> String {
        format!("A{}:J{}", self.append_row, self.end_row(count))
    }

    /// Re-check the whole target block right before writing it.
    ///
    /// The sheet may have been edited since the plan was made; a busy row is
    /// reported instead of overwritten.
    pub fn check_free<S: LedgerSheet + ?Sized>(&self, sheet: &S, count: usize) -> Result<()> {
        match (self.append_row..=self.end_row(count)).find(|row| sheet.row_has_content(*row)) {
            Some(row) => Err(LedgerError::AppendRowOccupied { row }),
            None => Ok(()),
        }
    }
}

/// Decide where the next order block goes.
pub fn plan_append<S: LedgerSheet + ?Sized>(
    sheet: &S,
    hint: Option<&CommitHint>,
    today: NaiveDate,
) -> Result<AppendPlan> {
    if let Some(hint) = hint {
        match verify_hint(sheet, hint, today) {
            Ok(()) => return Ok(AppendPlan::from_hint(hint)),
            Err(rejection) => log::warn!("[append] hint rejected, rescanning: {rejection}"),
        }
    }

    let state = scan(sheet, today);
    AppendPlan::from_state(&state, today)
}
