//! C2 (part 1): `KV` and `SortedSet` abstractions over a backing store (§4.2). Production
//! uses `MemoryStore`, an in-process engine guarded by a single mutex per map — adequate for
//! the single-process event-loop model of §5; a Redis-backed implementation would satisfy
//! the same traits without touching callers.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Score(pub i64);

/// `Get/Set/Del/Exists/Incr/HSet/HGet/HGetAll/HIncr/Expire` (§4.2).
pub trait Kv: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn del(&self, key: &str) -> bool;
    fn exists(&self, key: &str) -> bool;
    fn incr(&self, key: &str, by: i64) -> i64;
    fn hset(&self, key: &str, field: &str, value: &str);
    fn hget(&self, key: &str, field: &str) -> Option<String>;
    fn hget_all(&self, key: &str) -> HashMap<String, String>;
    fn hincr(&self, key: &str, field: &str, by: i64) -> i64;
    /// `Expire` is advisory cleanup metadata here; the in-memory store has no TTL sweep of
    /// its own, mirroring how the lock manager implements leases independently (§4.2).
    fn expire(&self, key: &str, ttl_ms: i64);
}

/// `ZAdd/ZRem/ZRangeByScore/ZPopMin/ZCard/ZScore/ZRemRangeByScore` (§4.2), upsert-by-member.
pub trait SortedSet: Send + Sync {
    fn zadd(&self, key: &str, score: i64, member: &str);
    fn zrem(&self, key: &str, members: &[&str]) -> usize;
    fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Vec<(String, i64)>;
    /// Atomic pop of the minimum-score member, if any.
    fn zpop_min(&self, key: &str) -> Option<(String, i64)>;
    fn zcard(&self, key: &str) -> usize;
    fn zscore(&self, key: &str, member: &str) -> Option<i64>;
    fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> usize;
}

#[derive(Default)]
struct HashEntry {
    fields: HashMap<String, String>,
}

/// Leased-lock primitives backing `LockManager` (§4.2). Kept distinct from the generic
/// `Kv` get/set pair because acquisition must be a single atomic check-and-set, and release
/// must be a guarded compare-and-delete on the lease token — not expressible safely as two
/// separate `Kv` calls.
pub trait LockBackend: Send + Sync {
    /// Atomically claims `key` for `token` with a TTL if unclaimed or expired.
    fn try_acquire(&self, key: &str, token: &str, ttl_ms: i64, now_ms: i64) -> bool;
    /// Releases `key` only if it is still held by `token` (compare-and-delete). A caller
    /// whose lease already expired and was claimed by someone else will not match and will
    /// not clear the new holder's lock.
    fn release(&self, key: &str, token: &str) -> bool;
}

#[derive(Default)]
pub struct MemoryStore {
    strings: Mutex<HashMap<String, String>>,
    hashes: Mutex<HashMap<String, HashEntry>>,
    zsets: Mutex<HashMap<String, Vec<(String, i64)>>>,
    locks: Mutex<HashMap<String, (String, i64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockBackend for MemoryStore {
    fn try_acquire(&self, key: &str, token: &str, ttl_ms: i64, now_ms: i64) -> bool {
        let mut guard = self.locks.lock().unwrap();
        let expired = guard.get(key).map(|(_, exp)| *exp <= now_ms).unwrap_or(true);
        if expired {
            guard.insert(key.to_string(), (token.to_string(), now_ms + ttl_ms));
            true
        } else {
            false
        }
    }

    fn release(&self, key: &str, token: &str) -> bool {
        let mut guard = self.locks.lock().unwrap();
        match guard.get(key) {
            Some((held_token, _)) if held_token == token => {
                guard.remove(key);
                true
            }
            _ => false,
        }
    }
}

impl Kv for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.strings.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.strings.lock().unwrap().insert(key.to_string(), value.to_string());
    }

    fn del(&self, key: &str) -> bool {
        self.strings.lock().unwrap().remove(key).is_some()
    }

    fn exists(&self, key: &str) -> bool {
        self.strings.lock().unwrap().contains_key(key)
    }

    fn incr(&self, key: &str, by: i64) -> i64 {
        let mut guard = self.strings.lock().unwrap();
        let current: i64 = guard.get(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + by;
        guard.insert(key.to_string(), next.to_string());
        next
    }

    fn hset(&self, key: &str, field: &str, value: &str) {
        let mut guard = self.hashes.lock().unwrap();
        guard.entry(key.to_string()).or_default().fields.insert(field.to_string(), value.to_string());
    }

    fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.lock().unwrap().get(key).and_then(|h| h.fields.get(field).cloned())
    }

    fn hget_all(&self, key: &str) -> HashMap<String, String> {
        self.hashes.lock().unwrap().get(key).map(|h| h.fields.clone()).unwrap_or_default()
    }

    fn hincr(&self, key: &str, field: &str, by: i64) -> i64 {
        let mut guard = self.hashes.lock().unwrap();
        let entry = guard.entry(key.to_string()).or_default();
        let current: i64 = entry.fields.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + by;
        entry.fields.insert(field.to_string(), next.to_string());
        next
    }

    fn expire(&self, _key: &str, _ttl_ms: i64) {
        // No-op in the in-memory engine: callers that need TTL semantics (locks) track
        // expiry themselves (`LockManager`). A Redis-backed `Kv` would forward this directly.
    }
}

impl SortedSet for MemoryStore {
    fn zadd(&self, key: &str, score: i64, member: &str) {
        let mut guard = self.zsets.lock().unwrap();
        let set = guard.entry(key.to_string()).or_default();
        if let Some(existing) = set.iter_mut().find(|(m, _)| m == member) {
            existing.1 = score;
        } else {
            set.push((member.to_string(), score));
        }
    }

    fn zrem(&self, key: &str, members: &[&str]) -> usize {
        let mut guard = self.zsets.lock().unwrap();
        let Some(set) = guard.get_mut(key) else { return 0 };
        let before = set.len();
        set.retain(|(m, _)| !members.contains(&m.as_str()));
        before - set.len()
    }

    fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> Vec<(String, i64)> {
        let guard = self.zsets.lock().unwrap();
        let Some(set) = guard.get(key) else { return Vec::new() };
        let mut result: Vec<(String, i64)> =
            set.iter().filter(|(_, s)| *s >= min && *s <= max).cloned().collect();
        result.sort_by_key(|(_, s)| *s);
        result
    }

    fn zpop_min(&self, key: &str) -> Option<(String, i64)> {
        let mut guard = self.zsets.lock().unwrap();
        let set = guard.get_mut(key)?;
        if set.is_empty() {
            return None;
        }
        let min_idx = set.iter().enumerate().min_by_key(|(_, (_, s))| *s).map(|(i, _)| i)?;
        Some(set.remove(min_idx))
    }

    fn zcard(&self, key: &str) -> usize {
        self.zsets.lock().unwrap().get(key).map(|s| s.len()).unwrap_or(0)
    }

    fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.zsets.lock().unwrap().get(key)?.iter().find(|(m, _)| m == member).map(|(_, s)| *s)
    }

    fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> usize {
        let mut guard = self.zsets.lock().unwrap();
        let Some(set) = guard.get_mut(key) else { return 0 };
        let before = set.len();
        set.retain(|(_, s)| !(*s >= min && *s <= max));
        before - set.len()
    }
}
