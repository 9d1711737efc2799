use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Lifecycle of a buffered time region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionStatus {
    /// Source chunks requested but not all available yet
    Loading,
    /// All source chunks present; playable
    Ready,
    /// A source chunk failed to arrive or decode
    Error,
}

/// Eviction priority of a buffered region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionPriority {
    Low,
    Medium,
    High,
}

/// A contiguous `[start, end)` range of timeline time with available content
#[derive(Debug, Clone)]
pub struct BufferRegion {
    /// Region start in milliseconds (inclusive)
    pub start_time: u64,

    /// Region end in milliseconds (exclusive, always > start)
    pub end_time: u64,

    /// Ids of the chunks backing this region
    pub source_chunks: Vec<String>,

    /// Region lifecycle state
    pub status: RegionStatus,

    /// Eviction priority
    pub priority: RegionPriority,

    /// Last time the region served a read, for LRU eviction
    pub last_accessed: Instant,
}

impl BufferRegion {
    /// Region length in milliseconds
    pub fn span(&self) -> u64 {
        self.end_time - self.start_time
    }

    /// Whether position `p` falls inside `[start, end]`
    ///
    /// Inclusive at the end so a position sitting exactly on a region
    /// boundary still reads the region it just finished.
    pub fn covers(&self, p: u64) -> bool {
        self.start_time <= p && p <= self.end_time
    }
}

/// Read-only projection of a region for event payloads and queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionSnapshot {
    /// Region start in milliseconds
    pub start_time: u64,

    /// Region end in milliseconds
    pub end_time: u64,

    /// Ids of the chunks backing this region
    pub source_chunks: Vec<String>,

    /// Region lifecycle state
    pub status: RegionStatus,

    /// Eviction priority
    pub priority: RegionPriority,
}

impl From<&BufferRegion> for RegionSnapshot {
    fn from(region: &BufferRegion) -> Self {
        Self {
            start_time: region.start_time,
            end_time: region.end_time,
            source_chunks: region.source_chunks.clone(),
            status: region.status,
            priority: region.priority,
        }
    }
}

/// Aggregate buffer state for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferHealth {
    /// Milliseconds of ready content ahead of the playback position
    pub buffer_level: u64,

    /// Number of tracked regions
    pub region_count: usize,

    /// Approximate memory held by buffered events, in bytes
    pub memory_usage_bytes: usize,

    /// Whether playback can start or continue from the current position
    pub is_ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_covers_is_inclusive_at_end() {
        let region = BufferRegion {
            start_time: 5000,
            end_time: 10_000,
            source_chunks: vec!["c1".to_string()],
            status: RegionStatus::Ready,
            priority: RegionPriority::Medium,
            last_accessed: Instant::now(),
        };

        assert!(region.covers(5000));
        assert!(region.covers(10_000));
        assert!(!region.covers(4999));
        assert!(!region.covers(10_001));
        assert_eq!(region.span(), 5000);
    }

    #[test]
    fn test_priority_ordering_for_eviction() {
        assert!(RegionPriority::Low < RegionPriority::Medium);
        assert!(RegionPriority::Medium < RegionPriority::High);
    }
}
