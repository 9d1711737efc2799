//! Chunk Coordinator
//!
//! Owns the lesson's chunk index. Chunks arrive in any order from the
//! pre-generation pipeline; the coordinator validates them, globalizes
//! their event timestamps onto the lesson timeline, and maintains the
//! derived views everything else reads: the stable time-sorted event list,
//! chunk boundaries, total duration, and per-type event counts.
//!
//! The coordinator also feeds the producer loop: on demand it consolidates
//! recent chunks into a lesson context (entity frequencies, relationships,
//! visual themes, narrative thread) and scores continuity hints for the
//! next chunk to generate.

use crate::config::CoordinatorConfig;
use crate::error::ChunkError;
use crate::events::{EngineEvent, EventBus};
use crate::models::timeline::{EventContent, EventType, TimelineChunk, TimelineEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of validating one incoming chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Whether the chunk may be ingested as-is
    pub is_valid: bool,

    /// Hard failures
    pub errors: Vec<String>,

    /// Issues worth reporting that do not block ingest
    pub warnings: Vec<String>,

    /// Observations about continuity with already-indexed chunks
    pub continuity_notes: Vec<String>,
}

/// Per-chunk boundary on the global timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkBoundary {
    pub chunk_id: String,
    pub chunk_number: u32,
    pub start_time: u64,
    pub end_time: u64,
}

/// Consolidated context over recent chunks, for generator feedback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonContext {
    /// How often each entity (significant narration word or declared
    /// concept) appeared in the recent window
    pub entity_frequencies: HashMap<String, usize>,

    /// Concept pairs that co-occurred within one chunk
    pub relationships: Vec<(String, String)>,

    /// Visual element types used recently
    pub visual_themes: Vec<String>,

    /// Chunk summaries in timeline order
    pub narrative_thread: Vec<String>,
}

/// Continuity hint categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityHintKind {
    Narrative,
    Conceptual,
    Visual,
    KnowledgeLevel,
    Transition,
}

/// Producer-facing suggestion for the next chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuityHint {
    pub kind: ContinuityHintKind,

    /// Human-readable suggestion
    pub suggestion: String,

    /// Conceptual overlap score in `[0, 1]` between the newest chunk and
    /// the window before it
    pub overlap_score: f64,

    /// True when the overlap exceeded the configured threshold and the
    /// next chunk should bridge instead of repeat
    pub flags_repetition: bool,
}

/// Narrow query surface other components depend on
///
/// Breaking the coordinator/buffer/controller reference cycle: consumers
/// hold `Arc<dyn CoordinatorQuery>` instead of the concrete coordinator.
#[async_trait]
pub trait CoordinatorQuery: Send + Sync {
    /// Events overlapping `[start, end]`, in timestamp order
    async fn events_in_range(&self, start: u64, end: u64) -> Vec<TimelineEvent>;

    /// Events active at time `t`
    async fn events_at_time(&self, t: u64) -> Vec<TimelineEvent>;

    /// The chunk whose boundary contains `t`
    async fn chunk_at_time(&self, t: u64) -> Option<TimelineChunk>;

    /// Total lesson duration in milliseconds
    async fn total_duration(&self) -> u64;
}

struct CoordinatorState {
    chunks: HashMap<String, TimelineChunk>,
    sorted_events: Vec<TimelineEvent>,
    chunk_boundaries: Vec<ChunkBoundary>,
    event_type_counts: HashMap<EventType, usize>,
    total_duration: u64,
    current_position: u64,
}

/// Accepts, validates, globalizes, and indexes lesson chunks
pub struct ChunkCoordinator {
    config: CoordinatorConfig,
    events: EventBus,
    state: RwLock<CoordinatorState>,
}

impl ChunkCoordinator {
    pub fn new(config: CoordinatorConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            state: RwLock::new(CoordinatorState {
                chunks: HashMap::new(),
                sorted_events: Vec::new(),
                chunk_boundaries: Vec::new(),
                event_type_counts: HashMap::new(),
                total_duration: 0,
                current_position: 0,
            }),
        }
    }

    /// Validate a chunk against the current index without ingesting it
    pub async fn validate(&self, chunk: &TimelineChunk) -> ValidationReport {
        let state = self.state.read().await;
        self.validate_chunk(chunk, &state)
    }

    fn validate_chunk(&self, chunk: &TimelineChunk, state: &CoordinatorState) -> ValidationReport {
        let mut report = ValidationReport {
            is_valid: true,
            ..Default::default()
        };

        if chunk.chunk_id.is_empty() {
            report.errors.push("chunk id is empty".to_string());
        }
        if chunk.chunk_number == 0 {
            report
                .errors
                .push("chunk number must be 1-based".to_string());
        }
        if chunk.duration == 0 {
            report.errors.push("chunk duration must be positive".to_string());
        }

        for event in &chunk.events {
            if event.duration == 0 {
                report
                    .errors
                    .push(format!("event '{}' has zero duration", event.id));
            }
            if event.end_time() > chunk.duration {
                report.errors.push(format!(
                    "event '{}' ends at {}ms, past the chunk duration {}ms",
                    event.id,
                    event.end_time(),
                    chunk.duration
                ));
            }
        }

        // Dependencies should reference events inside the chunk or already
        // indexed ones; unknown ids are only a warning
        let known: HashSet<&str> = chunk
            .events
            .iter()
            .map(|e| e.id.as_str())
            .chain(state.sorted_events.iter().map(|e| e.id.as_str()))
            .collect();
        for event in &chunk.events {
            for dep in &event.dependencies {
                if !known.contains(dep.as_str()) {
                    report
                        .warnings
                        .push(format!("event '{}' depends on unknown id '{}'", event.id, dep));
                }
            }
        }

        // Timing continuity against the preceding chunk
        if let Some(previous) = state
            .chunks
            .values()
            .find(|c| c.chunk_number + 1 == chunk.chunk_number)
        {
            if chunk.start_time_offset < previous.end_time() {
                report.continuity_notes.push(format!(
                    "chunk {} starts at {}ms, before chunk {} ends at {}ms",
                    chunk.chunk_number,
                    chunk.start_time_offset,
                    previous.chunk_number,
                    previous.end_time()
                ));
                report
                    .errors
                    .push("chunk overlaps its predecessor".to_string());
            }
        }

        report.is_valid = report.errors.is_empty();
        report
    }

    /// Ingest one chunk: validate, globalize, index, emit, evict
    pub async fn add_chunk(&self, chunk: TimelineChunk) -> Result<ValidationReport, ChunkError> {
        let chunk_id = chunk.chunk_id.clone();
        self.events.emit(EngineEvent::ChunkProcessingStarted {
            chunk_id: chunk_id.clone(),
        });

        let mut state = self.state.write().await;

        if state.chunks.contains_key(&chunk_id) {
            self.events.emit(EngineEvent::ChunkProcessingError {
                chunk_id: chunk_id.clone(),
                message: "duplicate chunk".to_string(),
            });
            return Err(ChunkError::DuplicateChunk(chunk_id));
        }

        let report = if self.config.validation.enabled {
            self.validate_chunk(&chunk, &state)
        } else {
            ValidationReport {
                is_valid: true,
                ..Default::default()
            }
        };

        if !report.is_valid && !self.config.validation.continue_on_error {
            warn!(
                event = "chunk_rejected",
                chunk_id = %chunk_id,
                errors = ?report.errors,
                "Chunk failed validation"
            );
            self.events.emit(EngineEvent::ChunkProcessingError {
                chunk_id: chunk_id.clone(),
                message: report.errors.join("; "),
            });
            return Err(ChunkError::ValidationFailed {
                chunk_id,
                reasons: report.errors.clone(),
            });
        }

        // Globalize event timestamps onto the lesson timeline
        let mut globalized = chunk;
        for event in globalized.events.iter_mut() {
            event.timestamp += globalized.start_time_offset;
        }

        let event_count = globalized.events.len();
        let start_time = globalized.start_time_offset;
        let end_time = globalized.end_time();
        let chunk_number = globalized.chunk_number;

        state.chunks.insert(chunk_id.clone(), globalized);
        Self::rebuild_indexes(&mut state);

        info!(
            event = "chunk_added",
            chunk_id = %chunk_id,
            chunk_number = chunk_number,
            start_time = start_time,
            end_time = end_time,
            event_count = event_count,
            "Chunk indexed"
        );

        self.events.emit(EngineEvent::ChunkAdded {
            chunk_id: chunk_id.clone(),
            chunk_number,
            start_time,
            end_time,
        });
        self.events.emit(EngineEvent::ChunkProcessingCompleted {
            chunk_id: chunk_id.clone(),
            event_count,
        });

        self.evict_stale(&mut state);

        Ok(report)
    }

    /// Rebuild the derived views after the chunk set changes
    fn rebuild_indexes(state: &mut CoordinatorState) {
        let mut events: Vec<TimelineEvent> = state
            .chunks
            .values()
            .flat_map(|c| c.events.iter().cloned())
            .collect();
        // Stable sort keeps in-chunk sequence for equal timestamps
        events.sort_by_key(|e| e.timestamp);
        state.sorted_events = events;

        let mut boundaries: Vec<ChunkBoundary> = state
            .chunks
            .values()
            .map(|c| ChunkBoundary {
                chunk_id: c.chunk_id.clone(),
                chunk_number: c.chunk_number,
                start_time: c.start_time_offset,
                end_time: c.end_time(),
            })
            .collect();
        boundaries.sort_by_key(|b| b.chunk_number);
        state.chunk_boundaries = boundaries;

        state.total_duration = state.chunks.values().map(|c| c.end_time()).max().unwrap_or(0);

        let mut counts: HashMap<EventType, usize> = HashMap::new();
        for event in &state.sorted_events {
            *counts.entry(event.event_type()).or_insert(0) += 1;
        }
        state.event_type_counts = counts;
    }

    /// Drop chunks far behind playback once the index grows past its cap
    ///
    /// At least `min_retained_chunks` always survive for backward seeks.
    fn evict_stale(&self, state: &mut CoordinatorState) {
        if state.chunks.len() <= self.config.max_cached_chunks {
            return;
        }

        let horizon = state
            .current_position
            .saturating_sub(self.config.retention_window_ms);

        let mut candidates: Vec<(String, u64)> = state
            .chunks
            .values()
            .filter(|c| c.end_time() < horizon)
            .map(|c| (c.chunk_id.clone(), c.end_time()))
            .collect();
        // Oldest-ending first
        candidates.sort_by_key(|(_, end)| *end);

        let mut removable = state
            .chunks
            .len()
            .saturating_sub(self.config.min_retained_chunks)
            .min(candidates.len());

        let mut removed = 0usize;
        for (chunk_id, _) in candidates {
            if removable == 0 {
                break;
            }
            state.chunks.remove(&chunk_id);
            debug!(event = "chunk_evicted", chunk_id = %chunk_id, "Stale chunk evicted");
            removable -= 1;
            removed += 1;
        }

        if removed > 0 {
            Self::rebuild_indexes(state);
        }
    }

    /// Record the playback position, used by the eviction policy
    pub async fn set_playback_position(&self, position: u64) {
        self.state.write().await.current_position = position;
    }

    /// All chunks ordered by chunk number
    pub async fn ordered_chunks(&self) -> Vec<TimelineChunk> {
        let state = self.state.read().await;
        let mut chunks: Vec<TimelineChunk> = state.chunks.values().cloned().collect();
        chunks.sort_by_key(|c| c.chunk_number);
        chunks
    }

    /// Fetch one chunk by id
    pub async fn chunk(&self, chunk_id: &str) -> Option<TimelineChunk> {
        self.state.read().await.chunks.get(chunk_id).cloned()
    }

    /// Ids of all indexed chunks
    pub async fn indexed_chunk_ids(&self) -> HashSet<String> {
        self.state.read().await.chunks.keys().cloned().collect()
    }

    /// Number of indexed chunks
    pub async fn chunk_count(&self) -> usize {
        self.state.read().await.chunks.len()
    }

    /// Per-chunk boundaries in chunk-number order
    pub async fn chunk_boundaries(&self) -> Vec<ChunkBoundary> {
        self.state.read().await.chunk_boundaries.clone()
    }

    /// Current event counts by type
    pub async fn event_type_counts(&self) -> HashMap<EventType, usize> {
        self.state.read().await.event_type_counts.clone()
    }

    /// Consolidate the recent chunk window into generator-facing context
    pub async fn extract_context(&self) -> LessonContext {
        let state = self.state.read().await;
        let mut recent: Vec<&TimelineChunk> = state.chunks.values().collect();
        recent.sort_by_key(|c| c.chunk_number);
        let window = self.config.recent_chunk_window;
        let recent: Vec<&TimelineChunk> = recent.into_iter().rev().take(window).rev().collect();

        let mut context = LessonContext::default();

        for chunk in &recent {
            if let Some(summary) = &chunk.metadata.summary {
                context.narrative_thread.push(summary.clone());
            }

            let concepts: Vec<String> = chunk
                .metadata
                .concepts_introduced
                .clone()
                .unwrap_or_default();
            for concept in &concepts {
                *context
                    .entity_frequencies
                    .entry(concept.to_lowercase())
                    .or_insert(0) += 1;
            }
            for pair in concepts.windows(2) {
                context
                    .relationships
                    .push((pair[0].to_lowercase(), pair[1].to_lowercase()));
            }

            for event in &chunk.events {
                match &event.content {
                    EventContent::Narration(n) => {
                        for word in Self::significant_words(&n.text) {
                            *context.entity_frequencies.entry(word).or_insert(0) += 1;
                        }
                    }
                    EventContent::Visual(v) => {
                        if !context.visual_themes.contains(&v.element_type) {
                            context.visual_themes.push(v.element_type.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        context
    }

    /// Score the newest chunk's conceptual overlap with the window before
    /// it and produce continuity hints for the next generation request
    pub async fn continuity_hints(&self) -> Vec<ContinuityHint> {
        let state = self.state.read().await;
        let mut ordered: Vec<&TimelineChunk> = state.chunks.values().collect();
        ordered.sort_by_key(|c| c.chunk_number);

        let Some(newest) = ordered.last() else {
            return Vec::new();
        };
        let window = self.config.recent_chunk_window;
        let prior: Vec<&&TimelineChunk> = ordered
            .iter()
            .rev()
            .skip(1)
            .take(window)
            .collect();

        let newest_concepts: HashSet<String> = newest
            .metadata
            .concepts_introduced
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        let prior_concepts: HashSet<String> = prior
            .iter()
            .flat_map(|c| c.metadata.concepts_introduced.clone().unwrap_or_default())
            .map(|c| c.to_lowercase())
            .collect();

        let overlap_score = if newest_concepts.is_empty() {
            0.0
        } else {
            newest_concepts.intersection(&prior_concepts).count() as f64
                / newest_concepts.len() as f64
        };
        let flags_repetition = overlap_score > self.config.continuity_overlap_threshold;

        let mut hints = Vec::new();

        if let Some(summary) = &newest.metadata.summary {
            hints.push(ContinuityHint {
                kind: ContinuityHintKind::Narrative,
                suggestion: format!("continue the thread from: {summary}"),
                overlap_score,
                flags_repetition,
            });
        }

        hints.push(ContinuityHint {
            kind: ContinuityHintKind::Conceptual,
            suggestion: if flags_repetition {
                "recent concepts repeat heavily; bridge to new material instead of restating"
                    .to_string()
            } else {
                "introduce the next concept, referencing at most one recent concept".to_string()
            },
            overlap_score,
            flags_repetition,
        });

        let visual_types: HashSet<String> = newest
            .events
            .iter()
            .filter_map(|e| match &e.content {
                EventContent::Visual(v) => Some(v.element_type.clone()),
                _ => None,
            })
            .collect();
        if !visual_types.is_empty() {
            let mut types: Vec<String> = visual_types.into_iter().collect();
            types.sort();
            hints.push(ContinuityHint {
                kind: ContinuityHintKind::Visual,
                suggestion: format!("reuse the established visual vocabulary: {}", types.join(", ")),
                overlap_score,
                flags_repetition,
            });
        }

        hints.push(ContinuityHint {
            kind: ContinuityHintKind::KnowledgeLevel,
            suggestion: format!(
                "the learner has seen {} concepts so far; keep difficulty incremental",
                prior_concepts.len() + newest_concepts.len()
            ),
            overlap_score,
            flags_repetition,
        });

        hints.push(ContinuityHint {
            kind: ContinuityHintKind::Transition,
            suggestion: "open with a one-sentence link to the previous chunk's closing idea"
                .to_string(),
            overlap_score,
            flags_repetition,
        });

        hints
    }

    fn significant_words(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3)
            .map(|w| w.to_lowercase())
            .collect()
    }
}

#[async_trait]
impl CoordinatorQuery for ChunkCoordinator {
    async fn events_in_range(&self, start: u64, end: u64) -> Vec<TimelineEvent> {
        let state = self.state.read().await;
        state
            .sorted_events
            .iter()
            .filter(|e| e.overlaps(start, end))
            .cloned()
            .collect()
    }

    async fn events_at_time(&self, t: u64) -> Vec<TimelineEvent> {
        let state = self.state.read().await;
        state
            .sorted_events
            .iter()
            .filter(|e| e.is_active_at(t))
            .cloned()
            .collect()
    }

    async fn chunk_at_time(&self, t: u64) -> Option<TimelineChunk> {
        let state = self.state.read().await;
        state.chunks.values().find(|c| c.contains(t)).cloned()
    }

    async fn total_duration(&self) -> u64 {
        self.state.read().await.total_duration
    }
}
