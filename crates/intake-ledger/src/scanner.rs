//! Ledger scanner.
//!
//! The identifier column (A) of the year sheet has been maintained by hand for
//! decades. Besides clean order codes and lab numbers it holds annotated
//! variants (`26203A`, `26203-1`, `120226801 Nachtrag`), foreign-year numbers
//! and free text. The parsers below accept exactly these shapes:
//!
//! | cell text              | order code core | lab number |
//! |------------------------|-----------------|------------|
//! | `130226801`            | `130226801`     | -          |
//! | `130226801A`           | `130226801`     | -          |
//! | `130226802 Zusatz`     | `130226802`     | -          |
//! | `1302268012`           | -               | -          |
//! | `26203`                | -               | `26203`    |
//! | `26203A`, `26203-1`    | -               | `26203`    |
//! | `262031`               | -               | `262031`   |
//! | `26203 B`              | -               | -          |
//! | `1234`, `12345678`     | -               | -          |
//!
//! Order codes for another day never count towards today's sequence, and a
//! cell that carries an order code is never read as a lab number.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::numbering::today_prefix;
use crate::sheet::LedgerSheet;

/// Rows of column A covered by [`content_hash`].
pub const CONTENT_HASH_ROWS: u32 = 50;

/// Facts derived from one full pass over the ledger sheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerState {
    /// Last row with content in any of the columns A..J (`0` for a blank sheet).
    pub last_used_row: u32,
    /// Highest lab number found in column A.
    pub max_lab_number: u64,
    /// Highest daily sequence of an order code carrying today's prefix.
    pub max_order_seq_today: u32,
}

fn order_code_re() -> &'static Regex {
    static ORDER_CODE_RE: OnceLock<Regex> = OnceLock::new();
    // DDMMYY, the fault digit, two sequence digits, then anything but another digit.
    ORDER_CODE_RE
        .get_or_init(|| Regex::new(r"^([0-9]{6}8[0-9]{2})(?:[^0-9]|$)").expect("valid regex"))
}

fn lab_number_re() -> &'static Regex {
    static LAB_NUMBER_RE: OnceLock<Regex> = OnceLock::new();
    LAB_NUMBER_RE
        .get_or_init(|| Regex::new(r"^([0-9]{5,6})(?:[A-Za-z]|-[0-9]+)?$").expect("valid regex"))
}

/// The 9 digit order code at the start of `text`, if any.
pub fn extract_order_core(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    order_code_re()
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Daily sequence of an order code that carries `today_prefix`.
pub fn extract_order_seq(text: &str, today_prefix: &str) -> Option<u32> {
    let core = extract_order_core(text)?;
    core.strip_prefix(today_prefix)?.parse().ok()
}

/// Numeric value of a lab number cell, ignoring letter and `-n` suffixes.
pub fn extract_lab_number(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    if trimmed.is_empty() || extract_order_core(trimmed).is_some() {
        return None;
    }
    let caps = lab_number_re().captures(trimmed)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Scan the whole sheet.
pub fn scan<S: LedgerSheet + ?Sized>(sheet: &S, today: NaiveDate) -> LedgerState {
    let prefix = today_prefix(today);
    let mut state = LedgerState::default();

    for row in 1..=sheet.row_count() {
        if sheet.row_has_content(row) {
            state.last_used_row = row;
        }

        let raw = sheet.cell_text(row, 1);
        let text = raw.trim();
        if text.is_empty() {
            continue;
        }

        if let Some(seq) = extract_order_seq(text, &prefix) {
            state.max_order_seq_today = state.max_order_seq_today.max(seq);
            continue;
        }
        if let Some(lab_number) = extract_lab_number(text) {
            state.max_lab_number = state.max_lab_number.max(lab_number);
            continue;
        }

        if text.starts_with(|c: char| c.is_ascii_digit()) {
            let reason = if extract_order_core(text).is_some() {
                "foreign_order"
            } else if text.len() >= 8 && text.as_bytes()[..8].iter().all(u8::is_ascii_digit) {
                "foreign_labno"
            } else {
                "non_matching_labno"
            };
            log::debug!("[ledger-scan] row={row} value={text:?} ignored ({reason})");
        }
    }

    state
}

/// SHA-1 over the trimmed text of column A in rows `1..=CONTENT_HASH_ROWS`.
pub fn content_hash<S: LedgerSheet + ?Sized>(sheet: &S) -> String {
    let mut hasher = Sha1::new();
    for row in 1..=CONTENT_HASH_ROWS {
        if row > 1 {
            hasher.update(b"\n");
        }
        hasher.update(sheet.cell_text(row, 1).trim().as_bytes());
    }
    hex::encode(hasher.finalize())
}
