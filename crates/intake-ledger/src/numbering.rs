//! Order numbering and lab number allocation.
//!
//! Order codes have the shape `DDMMYY` + [`ORDER_FAULT_DIGIT`] + a two digit
//! daily sequence, e.g. `260226801` for the first order on 2026-02-26. Lab
//! (sample) numbers are a single global counter that never drops below
//! [`LAB_NUMBER_FLOOR`].
//!
//! Everything here is pure; callers pass "today" explicitly.

use chrono::{Datelike, NaiveDate};

use crate::{CacheEntry, LedgerError, Result};

/// Fixed digit between the date and the daily sequence of an order code.
pub const ORDER_FAULT_DIGIT: char = '8';

/// The daily sequence is a two digit field.
pub const MAX_DAILY_SEQUENCE: u32 = 99;

/// Historical baseline: lab numbers are always allocated above this value.
pub const LAB_NUMBER_FLOOR: u64 = 9_999;

/// `DDMMYY` for `date`.
pub fn format_order_date(date: NaiveDate) -> String {
    date.format("%d%m%y").to_string()
}

/// The 7 character order code prefix for `date` (`DDMMYY8`).
pub fn today_prefix(date: NaiveDate) -> String {
    let mut prefix = format_order_date(date);
    prefix.push(ORDER_FAULT_DIGIT);
    prefix
}

/// Join a prefix and a daily sequence into an order code.
pub fn make_order_number(prefix: &str, seq: u32) -> Result<String> {
    if seq == 0 || seq > MAX_DAILY_SEQUENCE {
        return Err(LedgerError::SequenceExhausted {
            prefix: prefix.to_string(),
        });
    }
    Ok(format!("{prefix}{seq:02}"))
}

/// Sequence following `max_seq_today`, failing once the two digit field is used up.
pub fn next_sequence(prefix: &str, max_seq_today: u32) -> Result<u32> {
    let seq = max_seq_today.saturating_add(1);
    if seq > MAX_DAILY_SEQUENCE {
        return Err(LedgerError::SequenceExhausted {
            prefix: prefix.to_string(),
        });
    }
    Ok(seq)
}

/// Next order code for `today` according to the cached per-prefix sequences.
pub fn next_order_no(entry: &CacheEntry, today: NaiveDate) -> Result<String> {
    let prefix = today_prefix(today);
    let seq = next_sequence(&prefix, entry.max_order_seq(&prefix))?;
    make_order_number(&prefix, seq)
}

/// First lab number allocated after `last_lab_number`.
pub fn start_lab_number(last_lab_number: u64) -> u64 {
    last_lab_number.max(LAB_NUMBER_FLOOR).saturating_add(1)
}

/// `count` consecutive lab numbers following the cached maximum.
pub fn next_lab_numbers(entry: &CacheEntry, count: usize) -> Vec<u64> {
    lab_number_range(start_lab_number(entry.last_lab_number), count)
}

/// `count` consecutive lab numbers beginning at `start`.
pub fn lab_number_range(start: u64, count: usize) -> Vec<u64> {
    (0..count as u64).map(|offset| start.saturating_add(offset)).collect()
}

/// Name of the year sheet: the configured name, or the current four digit year.
pub fn resolve_year_sheet_name(configured: &str, today: NaiveDate) -> String {
    let configured = configured.trim();
    if configured.is_empty() {
        today.year().to_string()
    } else {
        configured.to_string()
    }
}

/// Two digit year the sheet belongs to.
///
/// A sheet named after a year (`"2025"`) pins the prefix to that year; any
/// other name follows the calendar.
pub fn resolve_year_prefix(sheet_name: &str, today: NaiveDate) -> String {
    let trimmed = sheet_name.trim();
    let year = if trimmed.len() == 4 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        trimmed.parse::<i32>().unwrap_or_else(|_| today.year())
    } else {
        today.year()
    };
    format!("{:02}", year.rem_euclid(100))
}
