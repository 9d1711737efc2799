//! Progressive Buffer Manager
//!
//! Tracks which time ranges of the lesson are playable. Chunk ingest turns
//! chunks into buffer regions keyed by quantized time buckets; adjacent
//! ready regions chain together when computing the buffer level, so a
//! position near a bucket boundary sees the full contiguous runway ahead.
//!
//! Readiness gating: playback may start or resume at `p` only when
//! `buffer_level(p) >= min_start_buffer`. Crossing that threshold emits
//! `playbackReady`; falling under the urgent threshold emits
//! `bufferUrgent`.

use crate::config::BufferConfig;
use crate::events::{EngineEvent, EventBus};
use crate::models::buffer::{BufferRegion, RegionPriority, RegionSnapshot, RegionStatus};
use crate::models::timeline::{TimelineChunk, TimelineEvent};
use crate::utils::time::bucket_start;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Narrow readiness surface consumed by the playback controller
///
/// Breaking the buffer/controller reference cycle: the controller holds
/// `Arc<dyn BufferReadiness>` instead of the concrete manager.
#[async_trait]
pub trait BufferReadiness: Send + Sync {
    /// Milliseconds of contiguous ready content ahead of `position`,
    /// capped at the target buffer
    async fn buffer_level(&self, position: u64) -> u64;

    /// Whether playback may start or continue at `position`
    async fn is_ready(&self, position: u64) -> bool;

    /// Whether the whole `[start, end]` range is ready
    async fn is_buffered(&self, start: u64, end: u64) -> bool;

    /// Observe the playback position for urgency checks and eviction
    async fn set_playback_position(&self, position: u64);

    /// Attempt a seek; a blocked seek reports `seekBlocked` and requests
    /// an urgent load around the target
    async fn request_seek(&self, position: u64) -> bool;
}

struct TrackedRegion {
    region: BufferRegion,
    events: Vec<TimelineEvent>,
}

struct BufferState {
    regions: HashMap<u64, TrackedRegion>,
    current_position: u64,
    was_ready: bool,
    was_urgent: bool,
    memory_usage: usize,
}

/// Time-range buffer bookkeeping and playback-readiness gating
pub struct ProgressiveBufferManager {
    config: RwLock<BufferConfig>,
    events: EventBus,
    state: RwLock<BufferState>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ProgressiveBufferManager {
    pub fn new(config: BufferConfig, events: EventBus) -> Self {
        Self {
            config: RwLock::new(config),
            events,
            state: RwLock::new(BufferState {
                regions: HashMap::new(),
                current_position: 0,
                was_ready: false,
                was_urgent: false,
                memory_usage: 0,
            }),
            cleanup_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Ingest a globalized chunk, merging it into its bucket's region
    pub async fn ingest_chunk(&self, chunk: &TimelineChunk) {
        let config = self.config.read().await.clone();
        let key = bucket_start(chunk.start_time_offset, config.region_bucket_ms);
        let chunk_start = chunk.start_time_offset;
        let chunk_end = chunk.end_time();

        let mut state = self.state.write().await;
        let priority = Self::priority_for_distance(
            state.current_position,
            chunk_start,
            &config,
        );

        match state.regions.get_mut(&key) {
            Some(tracked) => {
                tracked.region.start_time = tracked.region.start_time.min(chunk_start);
                tracked.region.end_time = tracked.region.end_time.max(chunk_end);
                if !tracked.region.source_chunks.contains(&chunk.chunk_id) {
                    tracked.region.source_chunks.push(chunk.chunk_id.clone());
                }
                tracked.region.status = RegionStatus::Ready;
                tracked.region.priority = tracked.region.priority.max(priority);
                tracked.region.last_accessed = Instant::now();
                tracked.events.extend(chunk.events.iter().cloned());
            }
            None => {
                state.regions.insert(
                    key,
                    TrackedRegion {
                        region: BufferRegion {
                            start_time: chunk_start,
                            end_time: chunk_end,
                            source_chunks: vec![chunk.chunk_id.clone()],
                            status: RegionStatus::Ready,
                            priority,
                            last_accessed: Instant::now(),
                        },
                        events: chunk.events.clone(),
                    },
                );
            }
        }

        Self::recompute_memory(&mut state);

        debug!(
            event = "region_buffered",
            chunk_id = %chunk.chunk_id,
            region_key = key,
            start = chunk_start,
            end = chunk_end,
            "Chunk merged into buffer region"
        );

        let position = state.current_position;
        let level = Self::level_at(&state, position, &config);
        let ready = level >= config.min_start_buffer_ms;
        if ready && !state.was_ready {
            state.was_ready = true;
            drop(state);
            self.events.emit(EngineEvent::PlaybackReady {
                position,
                buffer_level: level,
            });
        }
    }

    /// Mark the bucket containing `position` as loading
    ///
    /// Used when a seek lands in an unbuffered range and an urgent load has
    /// been requested; the next matching ingest flips the region to ready.
    pub async fn mark_loading(&self, position: u64) {
        let config = self.config.read().await.clone();
        let key = bucket_start(position, config.region_bucket_ms);
        let mut state = self.state.write().await;
        state.regions.entry(key).or_insert_with(|| TrackedRegion {
            region: BufferRegion {
                start_time: key,
                end_time: key + config.region_bucket_ms,
                source_chunks: Vec::new(),
                status: RegionStatus::Loading,
                priority: RegionPriority::High,
                last_accessed: Instant::now(),
            },
            events: Vec::new(),
        });
    }

    /// Mark every region backed by `chunk_id` as failed
    pub async fn mark_chunk_error(&self, chunk_id: &str) {
        let mut state = self.state.write().await;
        for tracked in state.regions.values_mut() {
            if tracked.region.source_chunks.iter().any(|c| c == chunk_id) {
                tracked.region.status = RegionStatus::Error;
                warn!(
                    event = "region_errored",
                    chunk_id = %chunk_id,
                    start = tracked.region.start_time,
                    "Buffer region marked errored"
                );
            }
        }
    }

    fn priority_for_distance(position: u64, region_start: u64, config: &BufferConfig) -> RegionPriority {
        let distance = region_start.abs_diff(position);
        if distance <= config.target_buffer_ms {
            RegionPriority::High
        } else if distance <= config.max_buffer_ms {
            RegionPriority::Medium
        } else {
            RegionPriority::Low
        }
    }

    /// Contiguous ready runway ahead of `position`, capped at the target
    fn level_at(state: &BufferState, position: u64, config: &BufferConfig) -> u64 {
        let mut end: Option<u64> = None;
        for tracked in state.regions.values() {
            if tracked.region.status == RegionStatus::Ready && tracked.region.covers(position) {
                end = Some(end.map_or(tracked.region.end_time, |e: u64| e.max(tracked.region.end_time)));
            }
        }
        let Some(mut chained_end) = end else {
            return 0;
        };

        // Chain ready regions that start at or before the current edge
        loop {
            let mut extended = false;
            for tracked in state.regions.values() {
                if tracked.region.status == RegionStatus::Ready
                    && tracked.region.start_time <= chained_end
                    && tracked.region.end_time > chained_end
                {
                    chained_end = tracked.region.end_time;
                    extended = true;
                }
            }
            if !extended {
                break;
            }
        }

        (chained_end - position).min(config.target_buffer_ms)
    }

    fn recompute_memory(state: &mut BufferState) {
        state.memory_usage = state
            .regions
            .values()
            .map(|t| serde_json::to_vec(&t.events).map(|v| v.len()).unwrap_or(0))
            .sum();
    }

    /// Attempt a seek; true when the target is sufficiently buffered
    ///
    /// A blocked seek reports the nearest ready region and leaves a loading
    /// placeholder so urgent ingest can be observed.
    pub async fn seek(&self, position: u64) -> bool {
        let config = self.config.read().await.clone();
        let mut state = self.state.write().await;
        let level = Self::level_at(&state, position, &config);

        if level >= config.min_start_buffer_ms {
            for tracked in state.regions.values_mut() {
                if tracked.region.covers(position) {
                    tracked.region.last_accessed = Instant::now();
                }
            }
            return true;
        }

        let nearest = state
            .regions
            .values()
            .filter(|t| t.region.status == RegionStatus::Ready)
            .min_by_key(|t| {
                t.region
                    .start_time
                    .abs_diff(position)
                    .min(t.region.end_time.abs_diff(position))
            })
            .map(|t| RegionSnapshot::from(&t.region));

        drop(state);
        self.mark_loading(position).await;

        info!(
            event = "seek_blocked",
            position = position,
            "Seek target unbuffered; urgent load requested"
        );
        self.events.emit(EngineEvent::SeekBlocked {
            position,
            nearest_region: nearest,
        });
        false
    }

    /// Unique ready events overlapping `[start, end]`, in timestamp order
    pub async fn events_in_range(&self, start: u64, end: u64) -> Vec<TimelineEvent> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let mut seen: HashSet<String> = HashSet::new();
        let mut result: Vec<TimelineEvent> = Vec::new();

        for tracked in state.regions.values_mut() {
            if tracked.region.status != RegionStatus::Ready {
                continue;
            }
            if tracked.region.start_time > end || tracked.region.end_time < start {
                continue;
            }
            tracked.region.last_accessed = now;
            for event in &tracked.events {
                if event.overlaps(start, end) && seen.insert(event.id.clone()) {
                    result.push(event.clone());
                }
            }
        }

        result.sort_by_key(|e| e.timestamp);
        result
    }

    /// Aggregate health snapshot at the current playback position
    pub async fn health(&self) -> crate::models::buffer::BufferHealth {
        let config = self.config.read().await.clone();
        let state = self.state.read().await;
        let level = Self::level_at(&state, state.current_position, &config);
        crate::models::buffer::BufferHealth {
            buffer_level: level,
            region_count: state.regions.len(),
            memory_usage_bytes: state.memory_usage,
            is_ready: level >= config.min_start_buffer_ms,
        }
    }

    /// Read-only projections of all regions
    pub async fn region_snapshots(&self) -> Vec<RegionSnapshot> {
        let state = self.state.read().await;
        let mut snapshots: Vec<RegionSnapshot> = state
            .regions
            .values()
            .map(|t| RegionSnapshot::from(&t.region))
            .collect();
        snapshots.sort_by_key(|s| s.start_time);
        snapshots
    }

    /// Approximate memory held by buffered events, in bytes
    pub async fn memory_usage(&self) -> usize {
        self.state.read().await.memory_usage
    }

    /// Replace the adaptive buffer-size parameters
    pub async fn set_buffer_params(&self, min_start: u64, target: u64, max: u64) {
        let mut config = self.config.write().await;
        config.min_start_buffer_ms = min_start;
        config.target_buffer_ms = target;
        config.max_buffer_ms = max;
        info!(
            event = "buffer_params_updated",
            min_start = min_start,
            target = target,
            max = max,
            "Buffer parameters retuned"
        );
    }

    /// Current buffer-size parameters `(min_start, target, max)`
    pub async fn buffer_params(&self) -> (u64, u64, u64) {
        let config = self.config.read().await;
        (
            config.min_start_buffer_ms,
            config.target_buffer_ms,
            config.max_buffer_ms,
        )
    }

    /// Spawn the periodic memory-cleanup task
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock().await;
        if task.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                let interval = manager.config.read().await.cleanup_interval_ms;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {
                        manager.run_cleanup().await;
                    }
                }
            }
        }));
    }

    /// Stop the cleanup task
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.cleanup_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// One cleanup pass: evict cold, distant, low-priority regions when
    /// memory is above the threshold
    pub async fn run_cleanup(&self) -> usize {
        let config = self.config.read().await.clone();
        let mut state = self.state.write().await;

        if state.memory_usage < config.cleanup_threshold_bytes {
            return 0;
        }

        let position = state.current_position;
        self.events.emit(EngineEvent::PerformanceAlert {
            message: "buffer memory above cleanup threshold".to_string(),
            memory_usage_bytes: state.memory_usage as u64,
        });

        let now = Instant::now();
        let max_age = Duration::from_millis(config.region_max_age_ms);

        // Refresh priorities against the current position before judging
        for tracked in state.regions.values_mut() {
            tracked.region.priority =
                Self::priority_for_distance(position, tracked.region.start_time, &config);
        }

        let keys: Vec<u64> = state
            .regions
            .iter()
            .filter(|(_, t)| {
                let distance = t
                    .region
                    .start_time
                    .abs_diff(position)
                    .min(t.region.end_time.abs_diff(position));
                now.duration_since(t.region.last_accessed) > max_age
                    && distance > config.max_buffer_ms
                    && t.region.priority == RegionPriority::Low
            })
            .map(|(k, _)| *k)
            .collect();

        let removed = keys.len();
        for key in keys {
            if let Some(tracked) = state.regions.remove(&key) {
                debug!(
                    event = "region_evicted",
                    start = tracked.region.start_time,
                    end = tracked.region.end_time,
                    "Buffer region evicted"
                );
            }
        }

        if removed > 0 {
            Self::recompute_memory(&mut state);
        }
        removed
    }
}

#[async_trait]
impl BufferReadiness for ProgressiveBufferManager {
    async fn buffer_level(&self, position: u64) -> u64 {
        let config = self.config.read().await.clone();
        let state = self.state.read().await;
        Self::level_at(&state, position, &config)
    }

    async fn is_ready(&self, position: u64) -> bool {
        let config = self.config.read().await.clone();
        let state = self.state.read().await;
        Self::level_at(&state, position, &config) >= config.min_start_buffer_ms
    }

    async fn is_buffered(&self, start: u64, end: u64) -> bool {
        let config = self.config.read().await.clone();
        let state = self.state.read().await;
        if Self::level_at(&state, start, &config) == 0 {
            return false;
        }
        // The chained runway from `start` must reach `end`
        let level = Self::level_at(&state, start, &config);
        start + level >= end || {
            // Capped levels can hide coverage; fall back to direct checks
            let mut t = start;
            let step = config.region_bucket_ms.max(1);
            loop {
                let covered = state.regions.values().any(|r| {
                    r.region.status == RegionStatus::Ready && r.region.covers(t)
                });
                if !covered {
                    break false;
                }
                if t >= end {
                    break true;
                }
                t = (t + step).min(end);
            }
        }
    }

    async fn request_seek(&self, position: u64) -> bool {
        self.seek(position).await
    }

    async fn set_playback_position(&self, position: u64) {
        let config = self.config.read().await.clone();
        let mut state = self.state.write().await;
        state.current_position = position;

        let level = Self::level_at(&state, position, &config);
        let urgent = level < config.urgent_threshold_ms;
        let ready = level >= config.min_start_buffer_ms;

        let entered_urgent = urgent && !state.was_urgent;
        let entered_ready = ready && !state.was_ready;
        state.was_urgent = urgent;
        state.was_ready = ready;
        drop(state);

        if entered_urgent {
            self.events.emit(EngineEvent::BufferUrgent {
                position,
                buffer_level: level,
            });
        }
        if entered_ready {
            self.events.emit(EngineEvent::PlaybackReady {
                position,
                buffer_level: level,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::timeline::{ChunkMetadata, EventContent, NarrationContent};

    fn narration(id: &str, timestamp: u64, duration: u64) -> TimelineEvent {
        TimelineEvent {
            id: id.to_string(),
            timestamp,
            duration,
            semantic_type: None,
            content: EventContent::Narration(NarrationContent {
                text: "text".to_string(),
                ssml: None,
                voice: None,
                audio_url: None,
                emphasis: None,
            }),
            layout_hints: None,
            dependencies: Vec::new(),
        }
    }

    /// Chunk with globalized events, as the coordinator would hand over
    fn chunk(number: u32, offset: u64, duration: u64, events: Vec<TimelineEvent>) -> TimelineChunk {
        TimelineChunk {
            chunk_id: format!("chunk-{number}"),
            chunk_number: number,
            start_time_offset: offset,
            duration,
            content_type: "explanation".to_string(),
            events,
            metadata: ChunkMetadata::now(),
        }
    }

    fn manager() -> ProgressiveBufferManager {
        ProgressiveBufferManager::new(BufferConfig::default(), EventBus::default())
    }

    #[tokio::test]
    async fn test_buffer_level_chains_adjacent_regions() {
        let m = manager();
        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;
        m.ingest_chunk(&chunk(2, 5000, 5000, Vec::new())).await;

        // Near the end of chunk 1 the runway continues through chunk 2
        assert_eq!(m.buffer_level(4500).await, 5500);
        // Capped at the target buffer
        assert_eq!(m.buffer_level(0).await, 10_000);
    }

    #[tokio::test]
    async fn test_readiness_threshold() {
        let m = manager();
        assert!(!m.is_ready(0).await);

        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;
        assert!(m.is_ready(0).await);
        // 1.5s of runway left is under the 2s start threshold
        assert!(!m.is_ready(3500).await);
    }

    #[tokio::test]
    async fn test_playback_ready_emitted_on_transition() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = ProgressiveBufferManager::new(BufferConfig::default(), bus);

        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;

        let mut saw_ready = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::PlaybackReady { buffer_level, .. } = event {
                assert!(buffer_level >= 2000);
                saw_ready = true;
            }
        }
        assert!(saw_ready);
    }

    #[tokio::test]
    async fn test_seek_into_buffered_region() {
        let m = manager();
        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;
        m.ingest_chunk(&chunk(2, 5000, 5000, Vec::new())).await;

        assert!(m.seek(4500).await);
    }

    #[tokio::test]
    async fn test_seek_into_unbuffered_region_reports_blocked() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = ProgressiveBufferManager::new(BufferConfig::default(), bus);
        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;

        assert!(!m.seek(9000).await);

        let mut saw_blocked = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::SeekBlocked { position, nearest_region } = event {
                assert_eq!(position, 9000);
                let nearest = nearest_region.expect("nearest region reported");
                assert_eq!(nearest.end_time, 5000);
                saw_blocked = true;
            }
        }
        assert!(saw_blocked);

        // A loading placeholder now tracks the urgent range
        let snapshots = m.region_snapshots().await;
        assert!(snapshots.iter().any(|s| s.status == RegionStatus::Loading));
    }

    #[tokio::test]
    async fn test_urgent_emitted_when_level_falls_below_threshold() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = ProgressiveBufferManager::new(BufferConfig::default(), bus);
        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;

        m.set_playback_position(4800).await;

        let mut saw_urgent = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::BufferUrgent { buffer_level, .. } = event {
                assert!(buffer_level < 1000);
                saw_urgent = true;
            }
        }
        assert!(saw_urgent);
    }

    #[tokio::test]
    async fn test_events_in_range_deduplicates_and_sorts() {
        let m = manager();
        m.ingest_chunk(&chunk(
            1,
            0,
            5000,
            vec![narration("e2", 3000, 1000), narration("e1", 0, 1000)],
        ))
        .await;
        // Same chunk merged again (re-ingest) must not duplicate events
        m.ingest_chunk(&chunk(1, 0, 5000, vec![narration("e1", 0, 1000)]))
            .await;

        let events = m.events_in_range(0, 5000).await;
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn test_is_buffered_range() {
        let m = manager();
        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;
        m.ingest_chunk(&chunk(2, 5000, 5000, Vec::new())).await;

        assert!(m.is_buffered(0, 9000).await);
        assert!(m.is_buffered(4000, 5500).await);
        assert!(!m.is_buffered(9500, 12_000).await);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_cold_distant_low_priority_regions() {
        let config = BufferConfig {
            cleanup_threshold_bytes: 0,
            region_max_age_ms: 0,
            max_buffer_ms: 10_000,
            ..BufferConfig::default()
        };
        let m = ProgressiveBufferManager::new(config, EventBus::default());

        m.ingest_chunk(&chunk(1, 0, 5000, vec![narration("e1", 0, 1000)]))
            .await;
        m.ingest_chunk(&chunk(14, 65_000, 5000, vec![narration("e9", 65_000, 1000)]))
            .await;

        // Playback sits far past the first chunk but within reach of the
        // second
        m.set_playback_position(60_000).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let removed = m.run_cleanup().await;
        assert_eq!(removed, 1);

        let snapshots = m.region_snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].start_time, 65_000);
    }

    #[tokio::test]
    async fn test_memory_usage_tracks_serialized_events() {
        let m = manager();
        assert_eq!(m.memory_usage().await, 0);

        m.ingest_chunk(&chunk(1, 0, 5000, vec![narration("e1", 0, 1000)]))
            .await;
        assert!(m.memory_usage().await > 0);
    }

    #[tokio::test]
    async fn test_mark_chunk_error_fails_region() {
        let m = manager();
        m.ingest_chunk(&chunk(1, 0, 5000, Vec::new())).await;
        m.mark_chunk_error("chunk-1").await;

        assert!(!m.is_ready(0).await);
        let snapshots = m.region_snapshots().await;
        assert_eq!(snapshots[0].status, RegionStatus::Error);
    }
}
