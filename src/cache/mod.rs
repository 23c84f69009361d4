//! Shared fast cache for ephemeral session state.
//!
//! Consumed as the external cache's interface shape: string key -> JSON
//! blob with TTL, list-append-with-trim, delete. The turn record and turn
//! timer living here are the source of truth for "whose turn is it";
//! the durable store's copy is advisory only.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::sync::ChangeRecord;
use crate::util::time::unix_millis;

/// Retained change records per session; older entries are trimmed away
pub const CHANGE_LOG_CAP: usize = 256;

/// Turn record TTL - refreshed on every rewrite while combat runs
const TURN_RECORD_TTL: Duration = Duration::from_secs(6 * 3600);

/// Extra lifetime past the turn deadline before the timer record expires
const TIMER_GRACE: Duration = Duration::from_secs(10);

struct Blob {
    value: Value,
    expires_at: Option<u64>,
}

/// In-process key/value + list store with the cache interface shape
pub struct MemoryCache {
    blobs: DashMap<String, Blob>,
    lists: DashMap<String, VecDeque<Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            lists: DashMap::new(),
        }
    }

    pub fn put(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| unix_millis() + d.as_millis() as u64);
        self.blobs
            .insert(key.to_string(), Blob { value, expires_at });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let expired = match self.blobs.get(key) {
            Some(blob) => match blob.expires_at {
                Some(at) if unix_millis() >= at => true,
                _ => return Some(blob.value.clone()),
            },
            None => return None,
        };
        if expired {
            self.blobs.remove(key);
        }
        None
    }

    pub fn delete(&self, key: &str) {
        self.blobs.remove(key);
        self.lists.remove(key);
    }

    /// Append to a list, trimming the oldest entries beyond `cap`
    pub fn list_push(&self, key: &str, value: Value, cap: usize) {
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        while list.len() > cap {
            list.pop_front();
        }
    }

    pub fn list_all(&self, key: &str) -> Vec<Value> {
        self.lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache-resident pointer into the initiative order.
/// Invariant: never contains a dead or removed participant once a round
/// has rolled over; it may transiently mid-round (skipped, not removed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRecord {
    pub order: Vec<Uuid>,
    pub index: usize,
    pub round: u32,
}

/// Cache-resident turn clock. At most one live timer per session; its
/// existence implies combat is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnTimer {
    pub participant_id: Uuid,
    /// Unix milliseconds
    pub started_at: u64,
    /// Unix milliseconds
    pub deadline: u64,
    /// Nominal duration in seconds
    pub seconds: u32,
}

impl TurnTimer {
    pub fn expired(&self, now_millis: u64) -> bool {
        now_millis >= self.deadline
    }
}

/// Typed access to the per-session cache records
#[derive(Clone)]
pub struct SessionCache {
    inner: std::sync::Arc<MemoryCache>,
}

impl SessionCache {
    pub fn new(inner: std::sync::Arc<MemoryCache>) -> Self {
        Self { inner }
    }

    fn turn_key(session_id: Uuid) -> String {
        format!("session:{}:turn", session_id)
    }

    fn timer_key(session_id: Uuid) -> String {
        format!("session:{}:timer", session_id)
    }

    fn changes_key(session_id: Uuid) -> String {
        format!("session:{}:changes", session_id)
    }

    pub fn put_turn_record(&self, session_id: Uuid, record: &TurnRecord) {
        let value = serde_json::to_value(record).expect("turn record serializes");
        self.inner
            .put(&Self::turn_key(session_id), value, Some(TURN_RECORD_TTL));
    }

    pub fn turn_record(&self, session_id: Uuid) -> Option<TurnRecord> {
        self.inner
            .get(&Self::turn_key(session_id))
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn delete_turn_record(&self, session_id: Uuid) {
        self.inner.delete(&Self::turn_key(session_id));
    }

    pub fn put_timer(&self, session_id: Uuid, timer: &TurnTimer) {
        let ttl = Duration::from_secs(timer.seconds as u64) + TIMER_GRACE;
        let value = serde_json::to_value(timer).expect("turn timer serializes");
        self.inner.put(&Self::timer_key(session_id), value, Some(ttl));
    }

    pub fn timer(&self, session_id: Uuid) -> Option<TurnTimer> {
        self.inner
            .get(&Self::timer_key(session_id))
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn delete_timer(&self, session_id: Uuid) {
        self.inner.delete(&Self::timer_key(session_id));
    }

    pub fn append_change(&self, session_id: Uuid, change: &ChangeRecord) {
        let value = serde_json::to_value(change).expect("change record serializes");
        self.inner
            .list_push(&Self::changes_key(session_id), value, CHANGE_LOG_CAP);
    }

    /// All retained changes strictly newer than `since`, oldest first,
    /// plus a truncation flag: true when the trimmed window can no longer
    /// prove completeness back to `since`, so the caller must fall back
    /// to a full snapshot.
    pub fn changes_since(&self, session_id: Uuid, since: u64) -> (Vec<ChangeRecord>, bool) {
        let key = Self::changes_key(session_id);
        let all: Vec<ChangeRecord> = self
            .inner
            .list_all(&key)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();

        let truncated = all.len() >= CHANGE_LOG_CAP
            && all.first().map(|c| c.timestamp > since).unwrap_or(false);

        let changes = all.into_iter().filter(|c| c.timestamp > since).collect();
        (changes, truncated)
    }

    /// Drop every cache record for a session (end of combat / session)
    pub fn purge_session(&self, session_id: Uuid) {
        self.inner.delete(&Self::turn_key(session_id));
        self.inner.delete(&Self::timer_key(session_id));
        self.inner.delete(&Self::changes_key(session_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{ChangeKind, ChangeRecord};

    fn change(t: u64) -> ChangeRecord {
        ChangeRecord {
            kind: ChangeKind::Ap,
            participant_id: Some(Uuid::new_v4()),
            data: serde_json::json!({ "ap": 5 }),
            timestamp: t,
        }
    }

    #[tokio::test]
    async fn blob_ttl_expires() {
        let cache = MemoryCache::new();
        cache.put("k", serde_json::json!(1), Some(Duration::from_millis(20)));
        assert!(cache.get("k").is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn change_log_trims_to_cap() {
        let cache = SessionCache::new(std::sync::Arc::new(MemoryCache::new()));
        let sid = Uuid::new_v4();
        for t in 0..(CHANGE_LOG_CAP as u64 + 50) {
            cache.append_change(sid, &change(t + 1));
        }
        let (changes, _) = cache.changes_since(sid, 0);
        assert_eq!(changes.len(), CHANGE_LOG_CAP);
        // Oldest entries were trimmed away
        assert_eq!(changes.first().unwrap().timestamp, 51);
    }

    #[test]
    fn delta_window_flags_truncation() {
        let cache = SessionCache::new(std::sync::Arc::new(MemoryCache::new()));
        let sid = Uuid::new_v4();
        for t in 0..(CHANGE_LOG_CAP as u64 * 2) {
            cache.append_change(sid, &change(t + 1));
        }
        // Asking from before the retained window: truncated
        let (_, truncated) = cache.changes_since(sid, 10);
        assert!(truncated);
        // Asking from inside the retained window: complete
        let (changes, truncated) = cache.changes_since(sid, CHANGE_LOG_CAP as u64 * 2 - 5);
        assert!(!truncated);
        assert_eq!(changes.len(), 5);
    }

    #[test]
    fn purge_removes_all_records() {
        let cache = SessionCache::new(std::sync::Arc::new(MemoryCache::new()));
        let sid = Uuid::new_v4();
        cache.put_turn_record(
            sid,
            &TurnRecord {
                order: vec![Uuid::new_v4()],
                index: 0,
                round: 1,
            },
        );
        cache.append_change(sid, &change(1));
        cache.purge_session(sid);
        assert!(cache.turn_record(sid).is_none());
        let (changes, _) = cache.changes_since(sid, 0);
        assert!(changes.is_empty());
    }
}
