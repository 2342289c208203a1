// Tahlil Engine — Insights Cache
//
// In-memory bundle of per-agent analysis results keyed
// (user_id, upload_id, agent class), with a TTL. Last-writer-wins;
// readers tolerate stale entries. The cache is strictly a latency
// optimisation: every consumer falls back to the workspace store on a
// miss, and the system stays correct with the cache disabled entirely.

use crate::atoms::types::AnalysisResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Bundle cache key. The upload_id is used VERBATIM: historically a
/// rewritten "upload_" prefix here diverged from the database key and
/// silently disabled the cache, so the construction is pinned by tests.
pub fn cache_key(user_id: &str, upload_id: &str, class: &str) -> String {
    format!("{}:{}:{}", user_id, upload_id, class)
}

struct CacheEntry {
    bundle: HashMap<String, AnalysisResult>,
    stored_at: Instant,
}

pub struct InsightsCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InsightsCache {
    pub fn new(ttl: Duration) -> Self {
        InsightsCache { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// The bundle under `key`, unless expired. Expired entries are
    /// dropped on read.
    pub fn get(&self, key: &str) -> Option<HashMap<String, AnalysisResult>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.bundle.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Last-writer-wins insert.
    pub fn put(&self, key: String, bundle: HashMap<String, AnalysisResult>) {
        self.entries
            .lock()
            .insert(key, CacheEntry { bundle, stored_at: Instant::now() });
    }

    /// Drop every entry belonging to an upload (any user, any class).
    /// Part of the workspace delete cascade.
    pub fn purge_upload(&self, upload_id: &str) {
        let needle = format!(":{}:", upload_id);
        self.entries.lock().retain(|key, _| !key.contains(&needle));
    }

    /// Drop everything. Used by tests exercising the database fallback.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn contains_upload(&self, upload_id: &str) -> bool {
        let needle = format!(":{}:", upload_id);
        self.entries.lock().keys().any(|key| key.contains(&needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::AnalysisStatus;

    fn bundle(agent: &str) -> HashMap<String, AnalysisResult> {
        let mut b = HashMap::new();
        b.insert(
            agent.to_string(),
            AnalysisResult {
                status: AnalysisStatus::Completed,
                summary: "ok".into(),
                findings: serde_json::Map::new(),
            },
        );
        b
    }

    #[test]
    fn test_cache_key_golden_values() {
        // Pinned: the upload_id passes through verbatim, prefix included.
        assert_eq!(cache_key("u1", "upload_abc", "transaction"), "u1:upload_abc:transaction");
        assert_eq!(cache_key("anon-7", "xyz", "financial"), "anon-7:xyz:financial");
    }

    #[test]
    fn test_put_get_round_trip() {
        let cache = InsightsCache::new(Duration::from_secs(60));
        let key = cache_key("u1", "up1", "transaction");
        cache.put(key.clone(), bundle("expense"));
        let got = cache.get(&key).unwrap();
        assert!(got.contains_key("expense"));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = InsightsCache::new(Duration::from_millis(0));
        let key = cache_key("u1", "up1", "transaction");
        cache.put(key.clone(), bundle("expense"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = InsightsCache::new(Duration::from_secs(60));
        let key = cache_key("u1", "up1", "transaction");
        cache.put(key.clone(), bundle("expense"));
        cache.put(key.clone(), bundle("income"));
        let got = cache.get(&key).unwrap();
        assert!(got.contains_key("income"));
        assert!(!got.contains_key("expense"));
    }

    #[test]
    fn test_purge_upload_removes_all_classes_and_users() {
        let cache = InsightsCache::new(Duration::from_secs(60));
        cache.put(cache_key("u1", "up1", "transaction"), bundle("a"));
        cache.put(cache_key("u1", "up1", "financial"), bundle("b"));
        cache.put(cache_key("u2", "up1", "transaction"), bundle("c"));
        cache.put(cache_key("u1", "up2", "transaction"), bundle("d"));

        cache.purge_upload("up1");
        assert!(!cache.contains_upload("up1"));
        assert!(cache.contains_upload("up2"));
    }
}
