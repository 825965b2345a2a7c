//! Advisory on-disk copy of the ledger cache.
//!
//! The snapshot only speeds up a cold start. It is read through by
//! [`LedgerCache::ensure`](crate::LedgerCache::ensure) and written only on
//! explicit request; commits never touch it.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::{CacheEntry, Result};

/// Schema version written to and required from snapshot files.
pub const SNAPSHOT_VERSION: u32 = 2;

#[derive(Serialize)]
struct SnapshotFile<'a> {
    version: u32,
    #[serde(flatten)]
    entry: &'a CacheEntry,
}

/// Location of the snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    path: PathBuf,
}

impl CacheSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot.
    ///
    /// Missing, empty, unparsable and wrong-version files all read as `None`.
    pub fn read(&self) -> Option<CacheEntry> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                log::warn!("[ledger-cache] snapshot {:?} unreadable: {err}", self.path);
                return None;
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match parse_snapshot(&bytes) {
            Some(entry) => Some(entry),
            None => {
                log::warn!("[ledger-cache] ignoring invalid snapshot {:?}", self.path);
                None
            }
        }
    }

    /// Atomically replace the snapshot with `entry`.
    pub fn write(&self, entry: &CacheEntry) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let body = serde_json::to_vec_pretty(&SnapshotFile {
            version: SNAPSHOT_VERSION,
            entry,
        })?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Delete the snapshot; a missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn parse_snapshot(bytes: &[u8]) -> Option<CacheEntry> {
    let mut value: Value = serde_json::from_slice(bytes).ok()?;
    let obj = value.as_object_mut()?;
    if obj.get("version").and_then(Value::as_u64) != Some(u64::from(SNAPSHOT_VERSION)) {
        return None;
    }
    obj.remove("version");

    // Hand-edited snapshots may carry junk sequence values; keep only valid ones.
    if let Some(Value::Object(seqs)) = obj.get_mut("orderSeqByPrefix") {
        seqs.retain(|_, seq| seq.as_u64().is_some_and(|n| n <= u64::from(u32::MAX)));
    }

    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json(version: u32) -> Value {
        json!({
            "version": version,
            "workbookPath": "/data/Auftragsbuch.xlsx",
            "sheetName": "2026",
            "fileMtimeMs": 1_770_000_000_000_i64,
            "fileSizeBytes": 4096,
            "contentHash": "abc",
            "yearPrefix": "26",
            "lastUsedRow": 12,
            "lastLabNumber": 26203,
            "orderSeqByPrefix": { "1302268": 3, "1202268": -1, "1102268": "x", "1002268": 1.5 },
            "updatedAt": "2026-02-13T08:00:00Z"
        })
    }

    #[test]
    fn drops_invalid_sequence_values() {
        let bytes = serde_json::to_vec(&sample_json(SNAPSHOT_VERSION)).unwrap();
        let entry = parse_snapshot(&bytes).unwrap();
        assert_eq!(entry.order_seq_by_prefix.len(), 1);
        assert_eq!(entry.max_order_seq("1302268"), 3);
        assert_eq!(entry.last_lab_number, 26203);
    }

    #[test]
    fn rejects_other_versions() {
        let bytes = serde_json::to_vec(&sample_json(1)).unwrap();
        assert!(parse_snapshot(&bytes).is_none());
        assert!(parse_snapshot(b"[]").is_none());
        assert!(parse_snapshot(b"{not json").is_none());
    }

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = CacheSnapshot::new(dir.path().join("nested").join("ledger-cache.json"));
        assert!(snapshot.read().is_none());

        let bytes = serde_json::to_vec(&sample_json(SNAPSHOT_VERSION)).unwrap();
        let entry = parse_snapshot(&bytes).unwrap();
        snapshot.write(&entry).unwrap();

        let raw: Value = serde_json::from_slice(&fs::read(snapshot.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], json!(SNAPSHOT_VERSION));
        assert_eq!(snapshot.read(), Some(entry));

        snapshot.remove().unwrap();
        snapshot.remove().unwrap();
        assert!(snapshot.read().is_none());
    }

    #[test]
    fn empty_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger-cache.json");
        fs::write(&path, "  \n").unwrap();
        assert!(CacheSnapshot::new(path).read().is_none());
    }
}
