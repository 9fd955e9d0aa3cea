// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Per-template warm pool of pre-instantiated containers.
//!
//! Each template has its own bucket behind its own mutex; claim and stock
//! are O(1) pops/pushes and no I/O ever happens while a bucket lock is held.
//! The pool is process-local and advisory: the database remains the source
//! of truth once a container is claimed by a session.
//!
//! Warm containers are spawned against a pre-generated session id so their
//! workspace prefix is already mounted; a claiming request adopts that id.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A pre-instantiated container waiting to be claimed.
#[derive(Debug, Clone)]
pub struct WarmContainer {
    /// The pre-generated session id whose workspace the container mounted.
    pub session_id: String,
    pub container_id: String,
    pub node_id: Option<String>,
    /// Node capacity reserved at spawn time, released on drain.
    pub cpu_millis: i64,
    pub memory_mb: i64,
    /// Executor URL, filled in once the container's ready callback arrives.
    pub executor_url: Option<String>,
}

type Bucket = Arc<Mutex<Vec<WarmContainer>>>;

pub struct WarmPool {
    enabled: bool,
    default_target: usize,
    targets: HashMap<String, usize>,
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl WarmPool {
    pub fn new(
        enabled: bool,
        default_target: usize,
        targets: impl IntoIterator<Item = (String, usize)>,
    ) -> Self {
        Self {
            enabled,
            default_target,
            targets: targets.into_iter().collect(),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Replenish target for a template (by name).
    pub fn target_for(&self, template_name: &str) -> usize {
        self.targets
            .get(template_name)
            .copied()
            .unwrap_or(self.default_target)
    }

    fn bucket(&self, template_id: &str) -> Bucket {
        if let Some(b) = self.buckets.read().get(template_id) {
            return b.clone();
        }
        self.buckets
            .write()
            .entry(template_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Claim a warm container, preferring ones whose executor already
    /// reported ready. O(1) aside from the bounded ready scan.
    pub fn claim(&self, template_id: &str) -> Option<WarmContainer> {
        if !self.enabled {
            return None;
        }
        let bucket = self.bucket(template_id);
        let mut entries = bucket.lock();
        if let Some(pos) = entries.iter().rposition(|c| c.executor_url.is_some()) {
            let claimed = entries.swap_remove(pos);
            debug!("Claimed warm container {} for template {}", claimed.container_id, template_id);
            return Some(claimed);
        }
        entries.pop()
    }

    pub fn stock(&self, template_id: &str, container: WarmContainer) {
        let bucket = self.bucket(template_id);
        bucket.lock().push(container);
    }

    /// Record the ready callback for a warm container that has no session
    /// row yet. Returns true when the id belonged to the pool.
    pub fn note_ready(&self, session_id: &str, executor_url: &str) -> bool {
        let buckets = self.buckets.read();
        for bucket in buckets.values() {
            let mut entries = bucket.lock();
            if let Some(entry) = entries.iter_mut().find(|c| c.session_id == session_id) {
                entry.executor_url = Some(executor_url.to_string());
                return true;
            }
        }
        false
    }

    /// Whether a pre-generated session id belongs to an unclaimed warm
    /// container (the orphan sweep must not kill those).
    pub fn contains(&self, session_id: &str) -> bool {
        let buckets = self.buckets.read();
        buckets
            .values()
            .any(|b| b.lock().iter().any(|c| c.session_id == session_id))
    }

    /// Remove an entry by its pre-generated session id (e.g. the container
    /// died before being claimed). Returns the removed entry.
    pub fn evict(&self, session_id: &str) -> Option<WarmContainer> {
        let buckets = self.buckets.read();
        for bucket in buckets.values() {
            let mut entries = bucket.lock();
            if let Some(pos) = entries.iter().position(|c| c.session_id == session_id) {
                return Some(entries.swap_remove(pos));
            }
        }
        None
    }

    pub fn size(&self, template_id: &str) -> usize {
        self.buckets
            .read()
            .get(template_id)
            .map(|b| b.lock().len())
            .unwrap_or(0)
    }

    /// How many containers a template's bucket is short of its target.
    pub fn deficit(&self, template_id: &str, template_name: &str) -> usize {
        self.target_for(template_name)
            .saturating_sub(self.size(template_id))
    }

    /// Containers over target (template shrunk or deactivated); drained by
    /// the replenisher.
    pub fn surplus(&self, template_id: &str, target: usize) -> Vec<WarmContainer> {
        let bucket = self.bucket(template_id);
        let mut entries = bucket.lock();
        let excess = entries.len().saturating_sub(target);
        let split_at = entries.len() - excess;
        entries.split_off(split_at)
    }

    /// Drain an entire bucket (template deleted).
    pub fn drain(&self, template_id: &str) -> Vec<WarmContainer> {
        let bucket = self.bucket(template_id);
        let mut entries = bucket.lock();
        std::mem::take(&mut *entries)
    }

    /// Snapshot of (template_id, size) for metrics.
    pub fn sizes(&self) -> Vec<(String, usize)> {
        self.buckets
            .read()
            .iter()
            .map(|(k, b)| (k.clone(), b.lock().len()))
            .collect()
    }

    pub fn total_size(&self) -> usize {
        self.buckets.read().values().map(|b| b.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warm(id: &str, ready: bool) -> WarmContainer {
        WarmContainer {
            session_id: format!("sess_{:0>16}", id),
            container_id: format!("ctr-{}", id),
            node_id: None,
            cpu_millis: 1000,
            memory_mb: 512,
            executor_url: ready.then(|| format!("http://10.0.0.1:8000/{}", id)),
        }
    }

    fn pool() -> WarmPool {
        WarmPool::new(true, 5, vec![("python-datasci".to_string(), 20)])
    }

    #[test]
    fn test_claim_empty_pool() {
        assert!(pool().claim("tmpl_abc").is_none());
    }

    #[test]
    fn test_stock_then_claim() {
        let p = pool();
        p.stock("tmpl_abc", warm("1", false));
        assert_eq!(p.size("tmpl_abc"), 1);
        let claimed = p.claim("tmpl_abc").unwrap();
        assert_eq!(claimed.container_id, "ctr-1");
        assert_eq!(p.size("tmpl_abc"), 0);
    }

    #[test]
    fn test_claim_prefers_ready_containers() {
        let p = pool();
        p.stock("tmpl_abc", warm("cold", false));
        p.stock("tmpl_abc", warm("ready", true));
        p.stock("tmpl_abc", warm("cold2", false));
        let claimed = p.claim("tmpl_abc").unwrap();
        assert_eq!(claimed.container_id, "ctr-ready");
    }

    #[test]
    fn test_disabled_pool_never_claims() {
        let p = WarmPool::new(false, 5, vec![]);
        p.stock("tmpl_abc", warm("1", true));
        assert!(p.claim("tmpl_abc").is_none());
    }

    #[test]
    fn test_targets_and_deficit() {
        let p = pool();
        assert_eq!(p.target_for("python-datasci"), 20);
        assert_eq!(p.target_for("unknown-template"), 5);
        p.stock("tmpl_ds", warm("1", false));
        p.stock("tmpl_ds", warm("2", false));
        assert_eq!(p.deficit("tmpl_ds", "python-datasci"), 18);
        assert_eq!(p.deficit("tmpl_other", "whatever"), 5);
    }

    #[test]
    fn test_note_ready_marks_entry() {
        let p = pool();
        p.stock("tmpl_abc", warm("1", false));
        let sid = format!("sess_{:0>16}", "1");
        assert!(p.note_ready(&sid, "http://10.0.0.9:8000"));
        let claimed = p.claim("tmpl_abc").unwrap();
        assert_eq!(claimed.executor_url.as_deref(), Some("http://10.0.0.9:8000"));
        assert!(!p.note_ready("sess_unknown0000000", "http://x"));
    }

    #[test]
    fn test_contains() {
        let p = pool();
        p.stock("tmpl_abc", warm("1", false));
        let sid = format!("sess_{:0>16}", "1");
        assert!(p.contains(&sid));
        p.claim("tmpl_abc");
        assert!(!p.contains(&sid));
    }

    #[test]
    fn test_evict_removes_entry() {
        let p = pool();
        p.stock("tmpl_abc", warm("1", false));
        let sid = format!("sess_{:0>16}", "1");
        assert!(p.evict(&sid).is_some());
        assert_eq!(p.size("tmpl_abc"), 0);
        assert!(p.evict(&sid).is_none());
    }

    #[test]
    fn test_surplus_and_drain() {
        let p = pool();
        for i in 0..4 {
            p.stock("tmpl_abc", warm(&i.to_string(), false));
        }
        let extra = p.surplus("tmpl_abc", 3);
        assert_eq!(extra.len(), 1);
        assert_eq!(p.size("tmpl_abc"), 3);
        let rest = p.drain("tmpl_abc");
        assert_eq!(rest.len(), 3);
        assert_eq!(p.total_size(), 0);
    }
}
