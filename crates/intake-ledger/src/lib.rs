//! Ledger state for the intake workbook.
//!
//! The intake ledger is a single worksheet ("year sheet") that humans and the
//! automation worker both append order blocks to. This crate derives the
//! next identifiers from that sheet without rescanning it on every commit:
//! - tolerant parsing of order codes and lab numbers ([`scanner`])
//! - day-prefixed order numbering and lab number allocation ([`numbering`])
//! - a validity-checked cache of the last scan ([`LedgerCache`]) with an
//!   advisory on-disk snapshot ([`snapshot`])
//! - commit hints and the append planner that refuses to trust a stale hint
//!   ([`hint`])

mod cache;
mod error;
pub mod hint;
pub mod numbering;
pub mod scanner;
mod sheet;
pub mod snapshot;

pub use cache::{CacheEntry, CacheIdentity, CommitRecord, FileMeta, LedgerCache};
pub use error::{LedgerError, Result};
pub use hint::{plan_append, verify_hint, AppendPlan, CommitHint, HintRejection};
pub use numbering::{
    lab_number_range, next_lab_numbers, next_order_no, resolve_year_prefix,
    resolve_year_sheet_name, today_prefix, LAB_NUMBER_FLOOR, MAX_DAILY_SEQUENCE, ORDER_FAULT_DIGIT,
};
pub use scanner::{content_hash, scan, LedgerState};
pub use sheet::{cell_text, LedgerSheet, MemorySheet, WorksheetGrid, RECORD_WIDTH};
pub use snapshot::CacheSnapshot;
