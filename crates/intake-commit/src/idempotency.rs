use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

use crate::CommitResult;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_ENTRIES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Processing,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommit {
    pub client_request_id: String,
    pub state: CommitState,
    pub response: Option<CommitResult>,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// No request id: the commit runs without deduplication.
    Untracked,
    /// First sighting; a `processing` entry was recorded.
    Fresh,
    /// Seen before; the store was left untouched.
    Duplicate(PendingCommit),
}

/// Remembers recent client request ids so a retried commit is not written twice.
///
/// Entries live for a fixed TTL; beyond `max_entries` the oldest are evicted.
/// Lookups never promote entries, so LRU order is arrival order.
#[derive(Debug)]
pub struct IdempotencyStore {
    entries: LruCache<String, PendingCommit>,
    ttl: Duration,
    max_entries: NonZeroUsize,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl IdempotencyStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            ttl,
            max_entries: NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN),
        }
    }

    pub fn begin(&mut self, request_id: &str, now: Instant) -> BeginOutcome {
        let id = request_id.trim();
        if id.is_empty() {
            return BeginOutcome::Untracked;
        }
        self.prune(now);
        if let Some(existing) = self.entries.peek(id) {
            return BeginOutcome::Duplicate(existing.clone());
        }
        self.entries.put(
            id.to_string(),
            PendingCommit {
                client_request_id: id.to_string(),
                state: CommitState::Processing,
                response: None,
                enqueued_at: now,
            },
        );
        self.prune(now);
        BeginOutcome::Fresh
    }

    /// Store the final response for a request id still present in the store.
    pub fn complete(&mut self, request_id: &str, response: CommitResult) -> bool {
        match self.entries.peek_mut(request_id.trim()) {
            Some(entry) => {
                entry.state = CommitState::Done;
                entry.response = Some(response);
                true
            }
            None => false,
        }
    }

    /// Forget a request id so its next attempt runs as a fresh commit.
    pub fn remove(&mut self, request_id: &str) -> Option<PendingCommit> {
        self.entries.pop(request_id.trim())
    }

    pub fn get(&self, request_id: &str) -> Option<&PendingCommit> {
        self.entries.peek(request_id.trim())
    }

    /// Drop expired entries, then the oldest ones above the size limit.
    pub fn prune(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((_, oldest)) = self.entries.peek_lru() {
            if now.saturating_duration_since(oldest.enqueued_at) <= self.ttl {
                break;
            }
            self.entries.pop_lru();
            removed += 1;
        }
        while self.entries.len() > self.max_entries.get() {
            self.entries.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(order_no: &str) -> CommitResult {
        CommitResult {
            ok: true,
            order_no: order_no.to_string(),
            sample_nos: vec![10_000],
            append_row: 2,
            end_row_range: "A2:J3".to_string(),
            duplicate_ignored: None,
            client_request_id: None,
            writer: "worker".to_string(),
            saved: true,
        }
    }

    #[test]
    fn blank_ids_are_untracked() {
        let mut store = IdempotencyStore::default();
        assert_eq!(store.begin("", Instant::now()), BeginOutcome::Untracked);
        assert_eq!(store.begin("   ", Instant::now()), BeginOutcome::Untracked);
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_returns_existing_without_mutation() {
        let mut store = IdempotencyStore::default();
        let now = Instant::now();
        assert_eq!(store.begin("req-1", now), BeginOutcome::Fresh);

        let BeginOutcome::Duplicate(pending) = store.begin("req-1", now) else {
            panic!("expected duplicate");
        };
        assert_eq!(pending.state, CommitState::Processing);
        assert!(pending.response.is_none());

        assert!(store.complete("req-1", result("260226801")));
        let BeginOutcome::Duplicate(done) = store.begin(" req-1 ", now) else {
            panic!("expected duplicate");
        };
        assert_eq!(done.state, CommitState::Done);
        assert_eq!(done.response, Some(result("260226801")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn removed_id_starts_fresh() {
        let mut store = IdempotencyStore::default();
        let now = Instant::now();
        store.begin("req-1", now);
        assert!(store.remove("req-1").is_some());
        assert!(!store.complete("req-1", result("260226801")));
        assert_eq!(store.begin("req-1", now), BeginOutcome::Fresh);
    }

    #[test]
    fn expired_entries_are_pruned() {
        let mut store = IdempotencyStore::new(Duration::from_secs(600), 200);
        let start = Instant::now();
        store.begin("old", start);
        store.begin("newer", start + Duration::from_secs(300));

        assert_eq!(store.prune(start + Duration::from_secs(601)), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("newer").is_some());
        assert_eq!(
            store.begin("old", start + Duration::from_secs(601)),
            BeginOutcome::Fresh
        );
    }

    #[test]
    fn oldest_entries_are_evicted_above_the_limit() {
        let mut store = IdempotencyStore::new(Duration::from_secs(600), 3);
        let now = Instant::now();
        for id in ["a", "b", "c", "d", "e"] {
            store.begin(id, now);
        }
        assert_eq!(store.len(), 3);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_none());
        assert!(store.get("e").is_some());
    }
}
