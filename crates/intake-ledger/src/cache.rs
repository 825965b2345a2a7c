use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::numbering::{resolve_year_prefix, today_prefix};
use crate::scanner::{content_hash, scan};
use crate::sheet::{LedgerSheet, WorksheetGrid};
use crate::snapshot::CacheSnapshot;
use crate::Result;

/// Modification time and size of the workbook file.
///
/// Both are `-1` when the file cannot be stat'ed, which never equals the
/// metadata of a real file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub mtime_ms: i64,
    pub size_bytes: i64,
}

impl FileMeta {
    pub const UNKNOWN: FileMeta = FileMeta {
        mtime_ms: -1,
        size_bytes: -1,
    };

    pub fn probe(path: &Path) -> FileMeta {
        let Ok(meta) = fs::metadata(path) else {
            return FileMeta::UNKNOWN;
        };
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok())
            .unwrap_or(-1);
        FileMeta {
            mtime_ms,
            size_bytes: i64::try_from(meta.len()).unwrap_or(-1),
        }
    }
}

/// The five fields a cache entry must match to be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIdentity {
    pub workbook_path: PathBuf,
    pub sheet_name: String,
    pub file_mtime_ms: i64,
    pub file_size_bytes: i64,
    pub year_prefix: String,
}

impl CacheIdentity {
    pub fn probe(workbook_path: &Path, sheet_name: &str, today: NaiveDate) -> CacheIdentity {
        let workbook_path = absolute_path(workbook_path);
        let meta = FileMeta::probe(&workbook_path);
        CacheIdentity {
            workbook_path,
            sheet_name: sheet_name.to_string(),
            file_mtime_ms: meta.mtime_ms,
            file_size_bytes: meta.size_bytes,
            year_prefix: resolve_year_prefix(sheet_name, today),
        }
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Cached ledger state for one workbook/sheet pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub workbook_path: PathBuf,
    pub sheet_name: String,
    pub file_mtime_ms: i64,
    pub file_size_bytes: i64,
    pub content_hash: String,
    pub year_prefix: String,
    /// The blank separator row after the last record block.
    pub last_used_row: u32,
    pub last_lab_number: u64,
    #[serde(default)]
    pub order_seq_by_prefix: BTreeMap<String, u32>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Build an entry from a full scan of `sheet`.
    pub fn from_scan<S: LedgerSheet + ?Sized>(
        identity: CacheIdentity,
        sheet: &S,
        today: NaiveDate,
    ) -> CacheEntry {
        let state = scan(sheet, today);
        let mut order_seq_by_prefix = BTreeMap::new();
        order_seq_by_prefix.insert(today_prefix(today), state.max_order_seq_today);

        CacheEntry {
            workbook_path: identity.workbook_path,
            sheet_name: identity.sheet_name,
            file_mtime_ms: identity.file_mtime_ms,
            file_size_bytes: identity.file_size_bytes,
            content_hash: content_hash(sheet),
            year_prefix: identity.year_prefix,
            last_used_row: state.last_used_row.saturating_add(1),
            last_lab_number: state.max_lab_number,
            order_seq_by_prefix,
            updated_at: Utc::now(),
        }
    }

    /// Highest sequence issued for `prefix`, `0` if none.
    pub fn max_order_seq(&self, prefix: &str) -> u32 {
        self.order_seq_by_prefix.get(prefix).copied().unwrap_or(0)
    }

    pub fn identity(&self) -> CacheIdentity {
        CacheIdentity {
            workbook_path: self.workbook_path.clone(),
            sheet_name: self.sheet_name.clone(),
            file_mtime_ms: self.file_mtime_ms,
            file_size_bytes: self.file_size_bytes,
            year_prefix: self.year_prefix.clone(),
        }
    }

    pub fn matches(&self, identity: &CacheIdentity) -> bool {
        self.workbook_path == identity.workbook_path
            && self.sheet_name == identity.sheet_name
            && self.file_mtime_ms == identity.file_mtime_ms
            && self.file_size_bytes == identity.file_size_bytes
            && self.year_prefix == identity.year_prefix
    }

    /// Advance the entry past a confirmed write instead of rescanning.
    pub fn apply_commit(&mut self, record: &CommitRecord, meta: FileMeta) {
        self.last_used_row = record.end_row.saturating_add(1);
        if let Some(last) = record.last_lab_number {
            self.last_lab_number = self.last_lab_number.max(last);
        }
        let seq = self
            .order_seq_by_prefix
            .entry(record.today_prefix.clone())
            .or_insert(0);
        *seq = (*seq).max(record.order_seq);
        self.file_mtime_ms = meta.mtime_ms;
        self.file_size_bytes = meta.size_bytes;
        self.updated_at = Utc::now();
    }
}

/// What a writer reported after appending one order block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub append_row: u32,
    pub end_row: u32,
    /// Last lab number written, `None` for an order without samples.
    pub last_lab_number: Option<u64>,
    pub today_prefix: String,
    pub order_seq: u32,
}

/// Single-instance ledger cache, owned by whoever orchestrates commits.
#[derive(Debug, Default)]
pub struct LedgerCache {
    snapshot: Option<CacheSnapshot>,
    entry: Option<CacheEntry>,
}

impl LedgerCache {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self {
            snapshot: snapshot_path.map(CacheSnapshot::new),
            entry: None,
        }
    }

    pub fn current(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    pub fn snapshot(&self) -> Option<&CacheSnapshot> {
        self.snapshot.as_ref()
    }

    /// Return a valid entry for the workbook, scanning only when neither the
    /// in-memory entry nor the snapshot matches the live file.
    pub fn ensure(
        &mut self,
        workbook_path: &Path,
        sheet_name: &str,
        today: NaiveDate,
    ) -> Result<CacheEntry> {
        let identity = CacheIdentity::probe(workbook_path, sheet_name, today);

        if let Some(entry) = self.entry.as_ref().filter(|e| e.matches(&identity)) {
            return Ok(entry.clone());
        }

        if let Some(entry) = self
            .snapshot
            .as_ref()
            .and_then(CacheSnapshot::read)
            .filter(|e| e.matches(&identity))
        {
            log::debug!("[ledger-cache] restored from snapshot");
            self.entry = Some(entry.clone());
            return Ok(entry);
        }

        self.entry = None;
        let sheet = WorksheetGrid::open(&identity.workbook_path, sheet_name)?;
        let entry = CacheEntry::from_scan(identity, &sheet, today);
        log::info!(
            "[ledger-cache] rebuilt from full scan: sheet={} lastUsedRow={} lastLabNumber={}",
            entry.sheet_name,
            entry.last_used_row,
            entry.last_lab_number
        );
        self.entry = Some(entry.clone());
        Ok(entry)
    }

    /// Apply a confirmed write to the in-memory entry.
    ///
    /// Returns `false` when there is no entry to advance.
    pub fn record_commit(&mut self, record: &CommitRecord, meta: FileMeta) -> bool {
        match self.entry.as_mut() {
            Some(entry) => {
                entry.apply_commit(record, meta);
                true
            }
            None => false,
        }
    }

    /// Write the in-memory entry to the snapshot file, if both exist.
    pub fn persist(&self) -> Result<bool> {
        match (&self.snapshot, &self.entry) {
            (Some(snapshot), Some(entry)) => {
                snapshot.write(entry)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Forget the in-memory entry and delete the snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.entry = None;
        if let Some(snapshot) = &self.snapshot {
            snapshot.remove()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemorySheet;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()
    }

    fn identity() -> CacheIdentity {
        CacheIdentity {
            workbook_path: PathBuf::from("/data/Auftragsbuch.xlsx"),
            sheet_name: "2026".to_string(),
            file_mtime_ms: 1_000,
            file_size_bytes: 2_000,
            year_prefix: "26".to_string(),
        }
    }

    #[test]
    fn scan_entry_keeps_a_separator_row() {
        let mut sheet = MemorySheet::new("2026");
        sheet.set_a1("A4", "26203").unwrap();
        let entry = CacheEntry::from_scan(identity(), &sheet, today());
        assert_eq!(entry.last_used_row, 5);
        assert_eq!(entry.last_lab_number, 26203);
        assert_eq!(entry.max_order_seq("1302268"), 0);
        assert!(entry.matches(&identity()));
        assert_eq!(entry.identity(), identity());
    }

    #[test]
    fn apply_commit_advances_counters_monotonically() {
        let sheet = MemorySheet::new("2026");
        let mut entry = CacheEntry::from_scan(identity(), &sheet, today());
        entry.order_seq_by_prefix.insert("1302268".into(), 4);

        let record = CommitRecord {
            append_row: 2,
            end_row: 5,
            last_lab_number: Some(10_002),
            today_prefix: "1302268".into(),
            order_seq: 3,
        };
        let meta = FileMeta {
            mtime_ms: 5_000,
            size_bytes: 6_000,
        };
        entry.apply_commit(&record, meta);

        assert_eq!(entry.last_used_row, 6);
        assert_eq!(entry.last_lab_number, 10_002);
        assert_eq!(entry.max_order_seq("1302268"), 4);
        assert_eq!(entry.file_mtime_ms, 5_000);
        assert_eq!(entry.file_size_bytes, 6_000);
    }

    #[test]
    fn missing_file_probes_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(FileMeta::probe(&dir.path().join("missing.xlsx")), FileMeta::UNKNOWN);
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let id = CacheIdentity::probe(Path::new("book.xlsx"), "Eingang", today());
        assert!(id.workbook_path.is_absolute());
        assert_eq!(id.year_prefix, "26");
    }

    #[test]
    fn record_commit_without_entry_is_a_no_op() {
        let mut cache = LedgerCache::new(None);
        let record = CommitRecord {
            append_row: 2,
            end_row: 2,
            last_lab_number: None,
            today_prefix: "1302268".into(),
            order_seq: 1,
        };
        assert!(!cache.record_commit(&record, FileMeta::UNKNOWN));
        assert!(cache.current().is_none());
        assert!(!cache.persist().unwrap());
    }
}
