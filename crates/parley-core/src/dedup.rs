//! Recently-seen delivery ids.
//!
//! Every session keeps a small [`SeenCache`] so the same envelope arriving
//! twice (local fan-out plus the relay echo, or a replayed publish) is
//! observed at most once by the client.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Default time an id is remembered.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(60);

/// Default number of ids a session expects to hold; ids past it are still
/// remembered until they expire.
pub const DEFAULT_SEEN_CAPACITY: usize = 512;

/// TTL-evicted set of delivery ids.
///
/// An id is only forgotten once its TTL has passed. `capacity` sizes the
/// cache; a burst beyond it grows the cache instead of dropping live ids.
#[derive(Debug)]
pub struct SeenCache {
    ttl: Duration,
    capacity: usize,
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl SeenCache {
    /// Create a cache remembering ids for `ttl`, sized for `capacity` ids.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ttl,
            capacity,
            order: VecDeque::with_capacity(capacity.min(64)),
            ids: HashSet::with_capacity(capacity.min(64)),
        }
    }

    /// Record an id. Returns `true` if it was not seen within the TTL.
    pub fn insert(&mut self, id: &str) -> bool {
        self.insert_at(id, Instant::now())
    }

    /// Record an id at an explicit instant.
    pub fn insert_at(&mut self, id: &str, now: Instant) -> bool {
        self.evict_expired(now);

        if self.ids.contains(id) {
            return false;
        }

        if self.order.len() == self.capacity {
            trace!(
                capacity = self.capacity,
                "Seen cache over capacity; keeping unexpired ids"
            );
        }

        self.order.push_back((id.to_owned(), now));
        self.ids.insert(id.to_owned());
        true
    }

    /// Whether the id is currently remembered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, seen_at)) = self.order.front() {
            if now.saturating_duration_since(*seen_at) < self.ttl {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.ids.remove(&id);
            }
        }
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_TTL, DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_within_ttl_is_rejected() {
        let mut cache = SeenCache::new(Duration::from_secs(10), 8);
        let now = Instant::now();

        assert!(cache.insert_at("m-1", now));
        assert!(!cache.insert_at("m-1", now + Duration::from_secs(9)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_ids_are_forgotten() {
        let mut cache = SeenCache::new(Duration::from_secs(10), 8);
        let now = Instant::now();

        assert!(cache.insert_at("m-1", now));
        assert!(cache.insert_at("m-2", now + Duration::from_secs(5)));

        // m-1 expires, m-2 is still inside its window
        let later = now + Duration::from_secs(11);
        assert!(cache.insert_at("m-1", later));
        assert!(!cache.insert_at("m-2", later));
    }

    #[test]
    fn test_unexpired_ids_survive_past_capacity() {
        let mut cache = SeenCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();

        for id in ["a", "b", "c", "d"] {
            assert!(cache.insert_at(id, now));
        }
        assert_eq!(cache.len(), 4);
        assert!(!cache.insert_at("a", now + Duration::from_secs(1)));

        // once expired, the burst is released
        let later = now + Duration::from_secs(61);
        assert!(cache.insert_at("e", later));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_follows_tokio_clock() {
        let mut cache = SeenCache::new(Duration::from_millis(100), 4);
        assert!(cache.insert("m-1"));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!cache.insert("m-1"));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(cache.insert("m-1"));
    }
}
