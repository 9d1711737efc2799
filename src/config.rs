//! Engine configuration
//!
//! One config struct per component, aggregated into [`EngineConfig`].
//! Defaults reflect smooth playback on a mid-range connection; the adaptive
//! buffer controller retunes the buffer-related values at runtime.

use serde::{Deserialize, Serialize};

/// Priority task queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Maximum queued items before inserts fail
    pub capacity: usize,

    /// Age in milliseconds after which an item is demoted one priority band
    /// per threshold multiple. `None` disables decay.
    pub decay_threshold_ms: Option<u64>,

    /// Items older than this are removed regardless of state
    pub max_age_ms: u64,

    /// Base retry backoff in milliseconds (doubles per attempt)
    pub retry_backoff_base_ms: u64,

    /// Ceiling on retry backoff in milliseconds
    pub retry_backoff_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            decay_threshold_ms: None,
            max_age_ms: 300_000,
            retry_backoff_base_ms: 1000,
            retry_backoff_cap_ms: 30_000,
        }
    }
}

/// Pre-generation pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PregenerationConfig {
    /// Number of generation workers
    pub worker_count: usize,

    /// How many upcoming chunks to predict per pass
    pub prediction_count: usize,

    /// Prediction window ahead of the playback position in milliseconds,
    /// scaled by playback speed
    pub lookahead_distance_ms: u64,

    /// Completed chunks kept in the LRU cache
    pub max_cache_size: usize,

    /// Fraction of busy workers at which dispatch is suspended
    pub busy_threshold: f64,

    /// Per-request generation timeout in milliseconds
    pub generation_timeout_ms: u64,

    /// Retries per request before it is dropped
    pub max_retries: u32,
}

impl Default for PregenerationConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            prediction_count: 3,
            lookahead_distance_ms: 30_000,
            max_cache_size: 24,
            busy_threshold: 0.8,
            generation_timeout_ms: 30_000,
            max_retries: 2,
        }
    }
}

/// Chunk validation behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Whether structural and timing validation runs at all
    pub enabled: bool,

    /// Whether an invalid chunk is still ingested (errors become warnings)
    pub continue_on_error: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            continue_on_error: false,
        }
    }
}

/// Chunk coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Validation behavior for incoming chunks
    pub validation: ValidationConfig,

    /// Chunk count above which eviction is considered
    pub max_cached_chunks: usize,

    /// Chunks ending more than this far behind playback are evictable
    pub retention_window_ms: u64,

    /// Chunks always retained for backward seeking
    pub min_retained_chunks: usize,

    /// Conceptual-overlap score above which a continuity hint flags repetition
    pub continuity_overlap_threshold: f64,

    /// How many recent chunks feed context extraction and continuity hints
    pub recent_chunk_window: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            max_cached_chunks: 16,
            retention_window_ms: 300_000,
            min_retained_chunks: 3,
            continuity_overlap_threshold: 0.3,
            recent_chunk_window: 3,
        }
    }
}

/// Progressive buffer manager tuning
///
/// The buffer-size fields are the knobs the adaptive controller turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConfig {
    /// Region key quantization in milliseconds
    pub region_bucket_ms: u64,

    /// Minimum buffered milliseconds ahead before playback may start
    pub min_start_buffer_ms: u64,

    /// Buffer level at which readiness is capped
    pub target_buffer_ms: u64,

    /// Regions farther than this from the playback position are evictable
    pub max_buffer_ms: u64,

    /// Buffer level below which `bufferUrgent` fires
    pub urgent_threshold_ms: u64,

    /// Memory cleanup cadence in milliseconds
    pub cleanup_interval_ms: u64,

    /// Approximate memory usage at which cleanup starts evicting
    pub cleanup_threshold_bytes: usize,

    /// Regions unread for longer than this are evictable
    pub region_max_age_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            region_bucket_ms: 5000,
            min_start_buffer_ms: 2000,
            target_buffer_ms: 15_000,
            max_buffer_ms: 30_000,
            urgent_threshold_ms: 1000,
            cleanup_interval_ms: 10_000,
            cleanup_threshold_bytes: 32 * 1024 * 1024,
            region_max_age_ms: 300_000,
        }
    }
}

/// Progressive audio manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    /// Chunks within this window of the playback position decode eagerly
    pub target_audio_buffer_ms: u64,

    /// Minimum decoded milliseconds ahead before audio playback starts
    pub min_audio_buffer_ms: u64,

    /// Equal-power crossfade length at both chunk ends in milliseconds
    pub crossfade_duration_ms: u64,

    /// Concurrent background preloads
    pub preload_concurrency: usize,

    /// How long `play` polls for buffer before giving up, in milliseconds
    pub buffering_timeout_ms: u64,

    /// Measured/estimated deviation above which a duration change is flagged
    pub significant_change_threshold: f64,

    /// Deviation above which recalibration adopts the measured duration
    pub recalibration_threshold: f64,

    /// Master volume in `[0, 1]`
    pub master_volume: f64,

    /// Base audio speed multiplier
    pub speed: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            target_audio_buffer_ms: 10_000,
            min_audio_buffer_ms: 2000,
            crossfade_duration_ms: 150,
            preload_concurrency: 3,
            buffering_timeout_ms: 5000,
            significant_change_threshold: 0.15,
            recalibration_threshold: 0.20,
            master_volume: 1.0,
            speed: 1.0,
        }
    }
}

/// Layout cache eviction strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Lru,
    Lfu,
    Adaptive,
}

/// Layout cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutCacheConfig {
    /// Maximum cached layout snapshots
    pub max_entries: usize,

    /// Entries older than this are treated as misses
    pub ttl_ms: u64,

    /// Eviction strategy
    pub strategy: CacheStrategy,

    /// Entries older than this are compressed during `optimize`
    pub compression_threshold_ms: u64,

    /// Total memory ceiling enforced by `optimize`
    pub max_memory_bytes: usize,
}

impl Default for LayoutCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            ttl_ms: 300_000,
            strategy: CacheStrategy::Adaptive,
            compression_threshold_ms: 60_000,
            max_memory_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Collision detector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollisionConfig {
    /// Spatial grid cell size in pixels
    pub cell_size: f64,

    /// Placement attempts before accepting the best-scoring candidate
    pub max_attempts: usize,

    /// Multiplier applied to overlap area when scoring a candidate
    pub severity_penalty: f64,

    /// Penalty for candidates that leave their assigned region
    pub out_of_region_penalty: f64,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            cell_size: 64.0,
            max_attempts: 15,
            severity_penalty: 2.0,
            out_of_region_penalty: 500.0,
        }
    }
}

/// Timeline layout engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutConfig {
    /// Canvas width in pixels
    pub canvas_width: f64,

    /// Canvas height in pixels
    pub canvas_height: f64,

    /// Cache behavior
    pub cache: LayoutCacheConfig,

    /// Collision detector behavior
    pub collision: CollisionConfig,

    /// Enter/exit transition length in milliseconds
    pub default_transition_duration_ms: u64,

    /// Precache window around a seek target in milliseconds
    pub precache_radius_ms: u64,

    /// Maximum keyframes precached per seek
    pub precache_max_keyframes: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            canvas_width: 1280.0,
            canvas_height: 720.0,
            cache: LayoutCacheConfig::default(),
            collision: CollisionConfig::default(),
            default_transition_duration_ms: 400,
            precache_radius_ms: 10_000,
            precache_max_keyframes: 6,
        }
    }
}

/// Event scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Lookahead window over which events are pre-enqueued, in milliseconds
    pub lookahead_ms: u64,

    /// Negative dispatch offset absorbing visual latency, in milliseconds
    pub visual_compensation_ms: u64,

    /// Maximum events executing at once
    pub max_concurrent_events: usize,

    /// Per-event execution budget in milliseconds
    pub execution_timeout_ms: u64,

    /// Retries per event before it is dropped
    pub max_retries: u32,

    /// A/V sync tolerance in milliseconds
    pub sync_tolerance_ms: u64,

    /// When true, the virtual clock aligns to the audio manager's position
    pub audio_driven: bool,

    /// Scheduler tick cadence in milliseconds (~render rate)
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 3000,
            visual_compensation_ms: 16,
            max_concurrent_events: 8,
            execution_timeout_ms: 5000,
            max_retries: 3,
            sync_tolerance_ms: 50,
            audio_driven: false,
            tick_interval_ms: 16,
        }
    }
}

/// Playback controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackConfig {
    /// Position timer cadence in milliseconds
    pub position_interval_ms: u64,

    /// How long a blocked seek waits for buffer before escalating
    pub max_buffer_wait_ms: u64,

    /// Whether an urgent buffer condition auto-pauses into `Buffering`
    pub auto_pause_on_underrun: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            position_interval_ms: 100,
            max_buffer_wait_ms: 5000,
            auto_pause_on_underrun: true,
        }
    }
}

/// Adaptive buffer controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveConfig {
    /// Environment sampling cadence in milliseconds
    pub sample_interval_ms: u64,

    /// Relative target-buffer change below which a new strategy is ignored
    pub apply_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5000,
            apply_threshold: 0.2,
        }
    }
}

/// Aggregate engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub pregeneration: PregenerationConfig,
    pub coordinator: CoordinatorConfig,
    pub buffer: BufferConfig,
    pub audio: AudioConfig,
    pub layout: LayoutConfig,
    pub scheduler: SchedulerConfig,
    pub playback: PlaybackConfig,
    pub adaptive: AdaptiveConfig,
}
