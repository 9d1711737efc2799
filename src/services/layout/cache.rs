//! Layout cache
//!
//! Timestamp-keyed snapshots of the visible element set, backing the
//! instant-seek contract. Eviction is pluggable: plain LRU, LFU, or an
//! adaptive score blending age, access frequency, and recency rank.
//!
//! Compression is a packed-serialization marker: `optimize` folds old
//! entries' elements into a compact byte buffer, and `get` transparently
//! unpacks them, so callers never observe the difference.

use crate::config::{CacheStrategy, LayoutCacheConfig};
use crate::models::layout::{CanvasElement, ElementTransition};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One cached layout snapshot
#[derive(Debug, Clone)]
pub struct LayoutCacheEntry {
    /// Visible elements at the keyed timestamp (empty while compressed)
    pub elements: Vec<CanvasElement>,

    /// Element id to region id assignments
    pub region_assignments: HashMap<String, String>,

    /// Enter/exit transitions recorded with the snapshot
    pub transition_data: Vec<ElementTransition>,

    /// When the entry was cached
    pub created_at: Instant,

    /// How many times the entry has been read
    pub access_count: u64,

    /// How long the original layout computation took, in milliseconds
    pub computation_time_ms: u64,

    /// Whether `elements` is currently packed into `compact`
    pub compressed: bool,

    /// Packed element payload while compressed
    compact: Option<Vec<u8>>,
}

impl LayoutCacheEntry {
    pub fn new(
        elements: Vec<CanvasElement>,
        region_assignments: HashMap<String, String>,
        transition_data: Vec<ElementTransition>,
        computation_time_ms: u64,
    ) -> Self {
        Self {
            elements,
            region_assignments,
            transition_data,
            created_at: Instant::now(),
            access_count: 0,
            computation_time_ms,
            compressed: false,
            compact: None,
        }
    }

    /// Approximate memory footprint in bytes
    fn memory_size(&self) -> usize {
        if let Some(compact) = &self.compact {
            return compact.len();
        }
        serde_json::to_vec(&self.elements).map(|v| v.len()).unwrap_or(0)
    }

    fn compress(&mut self) {
        if self.compressed {
            return;
        }
        match serde_json::to_vec(&self.elements) {
            Ok(packed) => {
                self.compact = Some(packed);
                self.elements = Vec::new();
                self.compressed = true;
            }
            Err(error) => {
                warn!(event = "layout_compress_failed", error = %error, "Entry left uncompressed");
            }
        }
    }

    fn decompress(&mut self) {
        if !self.compressed {
            return;
        }
        if let Some(packed) = self.compact.take() {
            match serde_json::from_slice(&packed) {
                Ok(elements) => {
                    self.elements = elements;
                    self.compressed = false;
                }
                Err(error) => {
                    warn!(event = "layout_decompress_failed", error = %error, "Entry dropped");
                    self.elements = Vec::new();
                    self.compressed = false;
                }
            }
        }
    }
}

/// Timestamp-keyed layout snapshot cache with pluggable eviction
pub struct LayoutCache {
    config: LayoutCacheConfig,
    entries: HashMap<u64, LayoutCacheEntry>,
    /// Access order, least recent at the front
    access_order: VecDeque<u64>,
}

impl LayoutCache {
    pub fn new(config: LayoutCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            access_order: VecDeque::new(),
        }
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total approximate memory held by entries
    pub fn memory_usage(&self) -> usize {
        self.entries.values().map(|e| e.memory_size()).sum()
    }

    fn touch(&mut self, timestamp: u64) {
        if let Some(pos) = self.access_order.iter().position(|&t| t == timestamp) {
            self.access_order.remove(pos);
        }
        self.access_order.push_back(timestamp);
    }

    /// Fetch a snapshot, refreshing recency and frequency bookkeeping
    ///
    /// Entries older than the TTL are misses and removed. Compressed
    /// entries are transparently unpacked before being returned.
    pub fn get(&mut self, timestamp: u64) -> Option<&LayoutCacheEntry> {
        let ttl = Duration::from_millis(self.config.ttl_ms);
        let expired = self
            .entries
            .get(&timestamp)
            .is_some_and(|e| e.created_at.elapsed() > ttl);
        if expired {
            self.remove(timestamp);
            return None;
        }

        if !self.entries.contains_key(&timestamp) {
            return None;
        }

        self.touch(timestamp);
        let entry = self.entries.get_mut(&timestamp)?;
        entry.access_count += 1;
        entry.decompress();
        Some(&*entry)
    }

    /// Insert a snapshot, evicting per strategy to stay under capacity
    pub fn set(&mut self, timestamp: u64, entry: LayoutCacheEntry) {
        while self.entries.len() >= self.config.max_entries
            && !self.entries.contains_key(&timestamp)
        {
            if !self.evict_one() {
                break;
            }
        }

        if self.entries.insert(timestamp, entry).is_none() {
            self.access_order.push_back(timestamp);
        } else {
            self.touch(timestamp);
        }
    }

    fn remove(&mut self, timestamp: u64) -> Option<LayoutCacheEntry> {
        if let Some(pos) = self.access_order.iter().position(|&t| t == timestamp) {
            self.access_order.remove(pos);
        }
        self.entries.remove(&timestamp)
    }

    /// Evict one entry per the configured strategy; false when empty
    fn evict_one(&mut self) -> bool {
        let victim = match self.config.strategy {
            CacheStrategy::Lru => self.access_order.front().copied(),
            CacheStrategy::Lfu => self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.access_count)
                .map(|(&t, _)| t),
            CacheStrategy::Adaptive => self.adaptive_victim(),
        };

        match victim {
            Some(timestamp) => {
                debug!(event = "layout_cache_evicted", timestamp = timestamp, "Cache entry evicted");
                self.remove(timestamp);
                true
            }
            None => false,
        }
    }

    /// Adaptive score: age + 1/frequency + 0.1 · recency rank; the highest
    /// score is evicted
    fn adaptive_victim(&self) -> Option<u64> {
        let order: HashMap<u64, usize> = self
            .access_order
            .iter()
            .rev()
            .enumerate()
            .map(|(rank, &t)| (t, rank))
            .collect();

        self.entries
            .iter()
            .map(|(&t, e)| {
                let age = e.created_at.elapsed().as_secs_f64();
                let freq = 1.0 / (e.access_count.max(1) as f64);
                let recent_index = order.get(&t).copied().unwrap_or(0) as f64;
                (t, age + freq + 0.1 * recent_index)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(t, _)| t)
    }

    /// Closest cached timestamp within `max_distance` of `t`
    pub fn find_closest(&self, t: u64, max_distance: u64) -> Option<u64> {
        self.entries
            .keys()
            .map(|&key| (key, key.abs_diff(t)))
            .filter(|&(_, distance)| distance <= max_distance)
            .min_by_key(|&(_, distance)| distance)
            .map(|(key, _)| key)
    }

    /// Housekeeping pass: compress old entries, drop expired ones, and
    /// evict until the memory ceiling holds
    pub fn optimize(&mut self) {
        let ttl = Duration::from_millis(self.config.ttl_ms);
        let compression_age = Duration::from_millis(self.config.compression_threshold_ms);

        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() > ttl)
            .map(|(&t, _)| t)
            .collect();
        for timestamp in expired {
            self.remove(timestamp);
        }

        for entry in self.entries.values_mut() {
            if entry.created_at.elapsed() > compression_age {
                entry.compress();
            }
        }

        while self.memory_usage() > self.config.max_memory_bytes {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.access_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::layout::{ElementKind, ElementStyle};

    fn element(id: &str) -> CanvasElement {
        CanvasElement {
            id: id.to_string(),
            kind: ElementKind::Text,
            x: 10.0,
            y: 10.0,
            width: 100.0,
            height: 30.0,
            style: ElementStyle::default(),
            text: Some("hello".to_string()),
            font_size: Some(16.0),
            source_event_id: "e1".to_string(),
        }
    }

    fn entry(ids: &[&str]) -> LayoutCacheEntry {
        LayoutCacheEntry::new(
            ids.iter().map(|id| element(id)).collect(),
            HashMap::new(),
            Vec::new(),
            5,
        )
    }

    fn cache(strategy: CacheStrategy, max_entries: usize) -> LayoutCache {
        LayoutCache::new(LayoutCacheConfig {
            max_entries,
            strategy,
            ..LayoutCacheConfig::default()
        })
    }

    #[test]
    fn test_get_miss_and_hit() {
        let mut c = cache(CacheStrategy::Lru, 8);
        assert!(c.get(1000).is_none());

        c.set(1000, entry(&["a"]));
        let hit = c.get(1000).expect("hit");
        assert_eq!(hit.elements.len(), 1);
        assert_eq!(hit.access_count, 1);
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let mut c = LayoutCache::new(LayoutCacheConfig {
            ttl_ms: 0,
            ..LayoutCacheConfig::default()
        });
        c.set(1000, entry(&["a"]));
        std::thread::sleep(Duration::from_millis(2));
        assert!(c.get(1000).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let mut c = cache(CacheStrategy::Lru, 2);
        c.set(1, entry(&["a"]));
        c.set(2, entry(&["b"]));

        // Touch 1 so 2 becomes the LRU victim
        c.get(1);
        c.set(3, entry(&["c"]));

        assert!(c.get(2).is_none());
        assert!(c.get(1).is_some());
        assert!(c.get(3).is_some());
    }

    #[test]
    fn test_lfu_evicts_least_frequent() {
        let mut c = cache(CacheStrategy::Lfu, 2);
        c.set(1, entry(&["a"]));
        c.set(2, entry(&["b"]));

        c.get(1);
        c.get(1);
        c.get(2);

        c.set(3, entry(&["c"]));
        assert!(c.get(2).is_none());
        assert!(c.get(1).is_some());
    }

    #[test]
    fn test_adaptive_prefers_evicting_cold_entries() {
        let mut c = cache(CacheStrategy::Adaptive, 2);
        c.set(1, entry(&["a"]));
        c.set(2, entry(&["b"]));

        // Entry 1 is hot; entry 2 never read
        c.get(1);
        c.get(1);
        c.get(1);

        c.set(3, entry(&["c"]));
        assert!(c.get(2).is_none(), "cold entry should be the victim");
        assert!(c.get(1).is_some());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut c = cache(CacheStrategy::Lru, 4);
        for t in 0..20u64 {
            c.set(t, entry(&["a"]));
            assert!(c.len() <= 4);
        }
    }

    #[test]
    fn test_find_closest_respects_max_distance() {
        let mut c = cache(CacheStrategy::Lru, 8);
        c.set(1000, entry(&["a"]));
        c.set(5000, entry(&["b"]));

        assert_eq!(c.find_closest(1200, 500), Some(1000));
        assert_eq!(c.find_closest(3200, 500), None);
        assert_eq!(c.find_closest(4800, 500), Some(5000));
    }

    #[test]
    fn test_compression_is_transparent_on_get() {
        let mut c = LayoutCache::new(LayoutCacheConfig {
            compression_threshold_ms: 0,
            ..LayoutCacheConfig::default()
        });
        c.set(1000, entry(&["a", "b"]));

        std::thread::sleep(Duration::from_millis(2));
        c.optimize();

        // Entry is now packed
        assert!(c.entries.get(&1000).unwrap().compressed);

        // get unpacks without the caller noticing
        let hit = c.get(1000).expect("hit");
        assert!(!hit.compressed);
        assert_eq!(hit.elements.len(), 2);
    }

    #[test]
    fn test_optimize_enforces_memory_ceiling() {
        let mut c = LayoutCache::new(LayoutCacheConfig {
            max_memory_bytes: 1,
            ..LayoutCacheConfig::default()
        });
        c.set(1, entry(&["a"]));
        c.set(2, entry(&["b"]));

        c.optimize();
        assert!(c.memory_usage() <= 1 || c.is_empty());
    }
}
