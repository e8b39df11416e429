//! Bounded, time-expiring memory of recently sent payloads.
//!
//! The transport asks for "what was message X" while running its own retry
//! protocol. Entries are advisory: a miss yields the empty payload.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::types::MessagePayload;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CAPACITY: usize = 5_000;
/// Longest lifetime any entry gets; larger TTLs are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: MessagePayload,
    expires_at: Instant,
}

/// Internally synchronized; clones share the same entries.
#[derive(Debug, Clone)]
pub struct RetryMessageCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    capacity: usize,
    default_ttl: Duration,
}

impl RetryMessageCache {
    /// Create a cache holding at most `capacity` entries (`capacity >= 1`).
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            default_ttl: default_ttl.min(MAX_TTL),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn put(&self, id: impl Into<String>, payload: MessagePayload, ttl: Duration) {
        self.put_at(id, payload, ttl, Instant::now());
    }

    /// Remember `payload` for the default TTL.
    pub fn record(&self, id: impl Into<String>, payload: MessagePayload) {
        self.put(id, payload, self.default_ttl);
    }

    /// Payload for `id`, or the empty payload when unset or expired.
    pub fn get(&self, id: &str) -> MessagePayload {
        self.get_at(id, Instant::now())
    }

    /// Drop every expired entry and return how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put_at(&self, id: impl Into<String>, payload: MessagePayload, ttl: Duration, now: Instant) {
        let id = id.into();
        let expires_at = now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now);
        let mut entries = self.lock();
        if !entries.contains_key(&id) && entries.len() >= self.capacity {
            evict_one(&mut entries, now);
        }
        entries.insert(
            id,
            CacheEntry {
                payload,
                expires_at,
            },
        );
    }

    pub fn get_at(&self, id: &str, now: Instant) -> MessagePayload {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(entry) if entry.expires_at > now => entry.payload.clone(),
            Some(_) => {
                entries.remove(id);
                MessagePayload::empty()
            }
            None => MessagePayload::empty(),
        }
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    // A poisoned lock still holds usable advisory data.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RetryMessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

/// Prefer dropping expired entries; otherwise drop the one closest to expiry.
fn evict_one(entries: &mut HashMap<String, CacheEntry>, now: Instant) {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    if entries.len() < before {
        return;
    }

    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_recorded_payload_before_expiry() {
        let cache = RetryMessageCache::default();
        let now = Instant::now();
        cache.put_at("msg-1", MessagePayload::text("hello"), DEFAULT_TTL, now);

        assert_eq!(
            cache.get_at("msg-1", now + Duration::from_secs(599)),
            MessagePayload::text("hello")
        );
    }

    #[test]
    fn miss_and_expiry_yield_empty_payload() {
        let cache = RetryMessageCache::default();
        let now = Instant::now();
        assert!(cache.get_at("unknown", now).is_empty());

        cache.put_at("msg-1", MessagePayload::text("hello"), Duration::from_secs(10), now);
        assert!(cache.get_at("msg-1", now + Duration::from_secs(10)).is_empty());
        assert!(cache.is_empty(), "expired entry is dropped on read");
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = RetryMessageCache::default();
        let now = Instant::now();
        cache.put_at("short", MessagePayload::text("a"), Duration::from_secs(5), now);
        cache.put_at("long", MessagePayload::text("b"), Duration::from_secs(500), now);

        assert_eq!(cache.sweep_at(now + Duration::from_secs(60)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get_at("long", now + Duration::from_secs(60)),
            MessagePayload::text("b")
        );
    }

    #[test]
    fn stays_bounded_and_evicts_expired_first() {
        let cache = RetryMessageCache::new(2, DEFAULT_TTL);
        let now = Instant::now();
        cache.put_at("expired", MessagePayload::text("x"), Duration::from_secs(1), now);
        cache.put_at("keep", MessagePayload::text("y"), DEFAULT_TTL, now);

        let later = now + Duration::from_secs(5);
        cache.put_at("new", MessagePayload::text("z"), DEFAULT_TTL, later);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_at("keep", later), MessagePayload::text("y"));
        assert_eq!(cache.get_at("new", later), MessagePayload::text("z"));
    }

    #[test]
    fn evicts_entry_closest_to_expiry_when_full() {
        let cache = RetryMessageCache::new(2, DEFAULT_TTL);
        let now = Instant::now();
        cache.put_at("first", MessagePayload::text("1"), DEFAULT_TTL, now);
        cache.put_at(
            "second",
            MessagePayload::text("2"),
            DEFAULT_TTL,
            now + Duration::from_secs(1),
        );
        cache.put_at(
            "third",
            MessagePayload::text("3"),
            DEFAULT_TTL,
            now + Duration::from_secs(2),
        );

        let read_at = now + Duration::from_secs(3);
        assert!(cache.get_at("first", read_at).is_empty());
        assert_eq!(cache.get_at("third", read_at), MessagePayload::text("3"));
    }

    #[test]
    fn oversized_ttl_is_clamped() {
        let cache = RetryMessageCache::new(10, Duration::from_secs(u64::MAX));
        assert_eq!(cache.default_ttl(), MAX_TTL);

        let now = Instant::now();
        cache.put_at("m1", MessagePayload::text("kept"), Duration::MAX, now);
        assert_eq!(
            cache.get_at("m1", now + MAX_TTL - Duration::from_secs(1)),
            MessagePayload::text("kept")
        );
        assert!(cache.get_at("m1", now + MAX_TTL).is_empty());

        cache.record("m2", MessagePayload::text("recorded"));
        assert_eq!(cache.get("m2"), MessagePayload::text("recorded"));
    }

    #[test]
    fn clones_share_entries() {
        let cache = RetryMessageCache::default();
        let clone = cache.clone();
        clone.record("msg-1", MessagePayload::text("shared"));
        assert_eq!(cache.get("msg-1"), MessagePayload::text("shared"));
    }
}
