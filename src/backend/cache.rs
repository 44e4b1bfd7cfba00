//! Bounded, expiring map used for sticky assignments.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Minimum spacing between full expiry sweeps triggered by inserts.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A concurrent map whose entries expire a fixed TTL after their last access.
///
/// The entry count is held near `capacity`: when an insert finds the map
/// full it first sweeps expired entries, then evicts an arbitrary one.
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
    capacity: usize,
    last_sweep: Mutex<Instant>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a live entry and push its expiry out by a full TTL, so an
    /// entry only lapses after `ttl` without access. Expired entries are
    /// removed and reported absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let hit = self.entries.get_mut(key).map(|mut entry| {
            let live = entry.expires_at > now;
            if live {
                entry.expires_at = now + self.ttl;
            }
            (entry.value.clone(), live)
        });

        match hit {
            Some((value, true)) => Some(value),
            Some((_, false)) => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an entry.
    pub fn insert(&self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.make_room();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Drop every entry whose value fails `keep`.
    pub fn retain_values(&self, keep: impl Fn(&V) -> bool) {
        self.entries.retain(|_, entry| keep(&entry.value));
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        *self.last_sweep.lock() = now;
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn make_room(&self) {
        let sweep_due = self.last_sweep.lock().elapsed() >= SWEEP_INTERVAL;
        if sweep_due {
            self.purge_expired();
        }
        if self.entries.len() >= self.capacity {
            // The iterator's shard guard must be gone before removing.
            let victim = self.entries.iter().next().map(|entry| entry.key().clone());
            if let Some(key) = victim {
                self.entries.remove(&key);
            }
        }
    }
}
