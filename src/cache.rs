// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Short-TTL read cache for hot lookups.
//!
//! The database stays the source of truth; this cache only shields it from
//! per-request template and node reads, and lets read paths keep serving
//! during a short database blip. Entries expire after the TTL (<= 60 s) and
//! writes always go to the database first.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// The template cache shared by the session manager and execution engine.
pub type TemplateCache = TtlCache<String, crate::db::templates::TemplateRecord>;

struct Entry<V> {
    stored_at: Instant,
    value: V,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    /// A fresh (within-TTL) value, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() <= self.ttl)
            .map(|e| e.value.clone())
    }

    /// Any cached value regardless of age. Degraded-mode reads only: used
    /// when the database is unreachable and a stale answer beats an error.
    pub fn get_stale(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        self.entries
            .write()
            .insert(key, Entry { stored_at: Instant::now(), value });
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Drop expired entries so an idle process does not accrete memory.
    pub fn evict_expired(&self) {
        let mut entries = self.entries.write();
        entries.retain(|_, e| e.stored_at.elapsed() <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_within_ttl() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_secs(60));
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn test_expired_entries_are_invisible_but_stale_readable() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_millis(0));
        cache.put("a".into(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get_stale(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_invalidate_and_evict() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_millis(0));
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.len(), 1);
        std::thread::sleep(Duration::from_millis(5));
        cache.evict_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_refreshes_age() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_secs(60));
        cache.put("a".into(), 1);
        cache.put("a".into(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some(2));
        assert_eq!(cache.len(), 1);
    }
}
