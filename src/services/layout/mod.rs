//! Timeline Layout Engine
//!
//! Answers "what does the canvas look like at timestamp t" for any t, fast
//! enough to back scrubbing. A seek first consults the layout cache; on a
//! miss the engine rebuilds from scratch: active events at t are turned
//! into canvas elements (a text element per event plus semantic extras),
//! assigned to responsive regions, and nudged apart by the collision
//! detector. Rebuilds are deterministic, so cached and cold layouts agree.
//!
//! After each miss the engine precaches nearby keyframe layouts in the
//! background, staggered to stay off the seek path.

pub mod cache;
pub mod collision;
pub mod regions;

use crate::config::LayoutConfig;
use crate::models::layout::{
    Bounds, CanvasElement, ElementKind, ElementStyle, ElementTransition, LayoutSnapshot,
    TransitionKind,
};
use crate::models::timeline::{SemanticType, TimelineEvent};
use crate::services::chunk_coordinator::CoordinatorQuery;
use cache::{LayoutCache, LayoutCacheEntry};
use collision::CollisionDetector;
use regions::ResponsiveRegionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

fn role_of(semantic: SemanticType) -> &'static str {
    match semantic {
        SemanticType::Definition => "definition",
        SemanticType::Process => "process",
        SemanticType::Comparison => "comparison",
        SemanticType::Example => "example",
        SemanticType::List => "list",
        SemanticType::ConceptMap => "concept_map",
        SemanticType::Formula => "formula",
        SemanticType::Story => "story",
    }
}

/// Seek-anywhere layout reconstruction over the lesson timeline
pub struct TimelineLayoutEngine {
    config: LayoutConfig,
    coordinator: Arc<dyn CoordinatorQuery>,
    cache: Arc<Mutex<LayoutCache>>,
    canvas_size: Mutex<(f64, f64)>,
    previous_visible: Mutex<HashMap<String, CanvasElement>>,
}

impl TimelineLayoutEngine {
    pub fn new(config: LayoutConfig, coordinator: Arc<dyn CoordinatorQuery>) -> Self {
        let cache = LayoutCache::new(config.cache.clone());
        let canvas = (config.canvas_width, config.canvas_height);
        Self {
            config,
            coordinator,
            cache: Arc::new(Mutex::new(cache)),
            canvas_size: Mutex::new(canvas),
            previous_visible: Mutex::new(HashMap::new()),
        }
    }

    /// Reconstruct the canvas state at `t`
    ///
    /// Cache hits reconstruct in O(|elements|); misses rebuild and then
    /// precache nearby keyframes in the background.
    pub async fn seek_to_timestamp(self: &Arc<Self>, t: u64) -> LayoutSnapshot {
        let started = Instant::now();

        if let Some(entry) = self.cache.lock().await.get(t) {
            let elements = entry.elements.clone();
            let seek_time_ms = started.elapsed().as_millis() as u64;
            debug!(event = "layout_cache_hit", timestamp = t, seek_time_ms, "Layout served from cache");

            let transitions = self.diff_transitions(&elements).await;
            self.remember_visible(&elements).await;
            return LayoutSnapshot {
                elements,
                transitions,
                seek_time_ms,
            };
        }

        let (elements, assignments) = self.compute_layout(t).await;
        let computation_time_ms = started.elapsed().as_millis() as u64;

        let transitions = self.diff_transitions(&elements).await;
        self.remember_visible(&elements).await;

        self.cache.lock().await.set(
            t,
            LayoutCacheEntry::new(
                elements.clone(),
                assignments,
                transitions.clone(),
                computation_time_ms,
            ),
        );

        self.spawn_precache(t);

        info!(
            event = "layout_rebuilt",
            timestamp = t,
            elements = elements.len(),
            computation_time_ms,
            "Layout reconstructed"
        );

        LayoutSnapshot {
            elements,
            transitions,
            seek_time_ms: computation_time_ms,
        }
    }

    /// Deterministic cold rebuild of the layout at `t`
    async fn compute_layout(&self, t: u64) -> (Vec<CanvasElement>, HashMap<String, String>) {
        let (width, height) = *self.canvas_size.lock().await;
        let mut region_manager = ResponsiveRegionManager::new(width, height);
        let mut collision = CollisionDetector::new(self.config.collision.clone());

        let mut active = self.coordinator.events_at_time(t).await;
        active.sort_by_key(|e| e.timestamp);

        let mut elements = Vec::new();
        let mut assignments: HashMap<String, String> = HashMap::new();

        for event in &active {
            for mut element in self.synthesize_elements(event) {
                let role = event.semantic_type.map(role_of);

                let region_id = match region_manager.select_region(role) {
                    Some(id) => id,
                    None => continue,
                };
                let Some(desired) = region_manager.reserve(&region_id, &mut element) else {
                    continue;
                };
                let region_bounds = region_manager
                    .region_bounds(&region_id)
                    .unwrap_or(Bounds::new(0.0, 0.0, width, height));

                let placement = collision.place(desired, &region_bounds);
                element.place_at(placement.bounds.x, placement.bounds.y);

                assignments.insert(element.id.clone(), region_id);
                elements.push(element);
            }
        }

        (elements, assignments)
    }

    /// Elements an event contributes to the canvas
    ///
    /// Always a text element sized from the content length, plus semantic
    /// extras: an arrow for processes, paired panels for comparisons, a
    /// highlight box for definitions, linked nodes for concept maps.
    fn synthesize_elements(&self, event: &TimelineEvent) -> Vec<CanvasElement> {
        let label = match &event.content {
            crate::models::timeline::EventContent::Narration(n) => n.text.clone(),
            crate::models::timeline::EventContent::Visual(v) => v.element_type.clone(),
            crate::models::timeline::EventContent::Transition(t) => t.target.clone(),
            _ => String::new(),
        };

        let text_width = (140.0 + label.len() as f64 * 6.5).clamp(140.0, 420.0);
        let mut elements = vec![CanvasElement {
            id: format!("{}:text", event.id),
            kind: ElementKind::Text,
            x: 0.0,
            y: 0.0,
            width: text_width,
            height: 32.0,
            style: ElementStyle::default(),
            text: Some(label),
            font_size: Some(16.0),
            source_event_id: event.id.clone(),
        }];

        match event.semantic_type {
            Some(SemanticType::Process) => {
                elements.push(self.extra(event, "arrow", ElementKind::Arrow, 160.0, 24.0));
            }
            Some(SemanticType::Comparison) => {
                elements.push(self.extra(event, "left", ElementKind::Rectangle, 150.0, 90.0));
                elements.push(self.extra(event, "right", ElementKind::Rectangle, 150.0, 90.0));
            }
            Some(SemanticType::Definition) => {
                elements.push(self.extra(event, "highlight", ElementKind::Rectangle, 260.0, 70.0));
            }
            Some(SemanticType::ConceptMap) => {
                elements.push(self.extra(event, "node-a", ElementKind::Ellipse, 90.0, 50.0));
                elements.push(self.extra(event, "node-b", ElementKind::Ellipse, 90.0, 50.0));
                elements.push(self.extra(event, "link", ElementKind::Arrow, 120.0, 20.0));
            }
            _ => {}
        }

        elements
    }

    fn extra(
        &self,
        event: &TimelineEvent,
        suffix: &str,
        kind: ElementKind,
        width: f64,
        height: f64,
    ) -> CanvasElement {
        CanvasElement {
            id: format!("{}:{suffix}", event.id),
            kind,
            x: 0.0,
            y: 0.0,
            width,
            height,
            style: ElementStyle::default(),
            text: None,
            font_size: None,
            source_event_id: event.id.clone(),
        }
    }

    /// Enter/exit transitions between the previous visible set and `next`
    async fn diff_transitions(&self, next: &[CanvasElement]) -> Vec<ElementTransition> {
        let previous = self.previous_visible.lock().await;
        let duration = self.config.default_transition_duration_ms;
        let mut transitions = Vec::new();

        for element in next {
            if !previous.contains_key(&element.id) {
                transitions.push(ElementTransition {
                    element_id: element.id.clone(),
                    kind: TransitionKind::Enter,
                    duration,
                    easing: "ease-in".to_string(),
                });
            }
        }
        for id in previous.keys() {
            if !next.iter().any(|e| &e.id == id) {
                transitions.push(ElementTransition {
                    element_id: id.clone(),
                    kind: TransitionKind::Exit,
                    duration,
                    easing: "ease-out".to_string(),
                });
            }
        }

        transitions
    }

    async fn remember_visible(&self, elements: &[CanvasElement]) {
        let mut previous = self.previous_visible.lock().await;
        previous.clear();
        for element in elements {
            previous.insert(element.id.clone(), element.clone());
        }
    }

    /// Precache keyframe layouts around `t` without blocking the seek
    fn spawn_precache(self: &Arc<Self>, t: u64) {
        let engine = Arc::clone(self);
        let radius = self.config.precache_radius_ms;
        let max_keyframes = self.config.precache_max_keyframes;

        tokio::spawn(async move {
            let start = t.saturating_sub(radius);
            let end = t + radius;
            let events = engine.coordinator.events_in_range(start, end).await;

            let mut keyframes: Vec<u64> = events.iter().map(|e| e.timestamp).collect();
            keyframes.sort_unstable();
            keyframes.dedup();
            keyframes.retain(|&k| k != t);
            keyframes.truncate(max_keyframes);

            for keyframe in keyframes {
                // Staggered so precache never competes with a live seek
                tokio::time::sleep(Duration::from_millis(10)).await;

                if engine.cache.lock().await.get(keyframe).is_some() {
                    continue;
                }
                let started = Instant::now();
                let (elements, assignments) = engine.compute_layout(keyframe).await;
                let computation_time_ms = started.elapsed().as_millis() as u64;
                engine.cache.lock().await.set(
                    keyframe,
                    LayoutCacheEntry::new(elements, assignments, Vec::new(), computation_time_ms),
                );
                debug!(event = "layout_precached", timestamp = keyframe, "Keyframe precached");
            }
        });
    }

    /// Resize the canvas, rebuilding regions and invalidating every cached
    /// layout
    pub async fn resize(&self, width: f64, height: f64) {
        *self.canvas_size.lock().await = (width, height);
        self.cache.lock().await.clear();
        info!(event = "canvas_resized", width = width, height = height, "Canvas resized; layouts invalidated");
    }

    /// Run the cache housekeeping pass
    pub async fn optimize_cache(&self) {
        self.cache.lock().await.optimize();
    }

    /// Nearest cached timestamp within `max_distance` of `t`
    pub async fn find_cached_near(&self, t: u64, max_distance: u64) -> Option<u64> {
        self.cache.lock().await.find_closest(t, max_distance)
    }

    /// Number of cached layouts
    pub async fn cached_layouts(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::events::EventBus;
    use crate::models::timeline::{
        ChunkMetadata, EventContent, NarrationContent, TimelineChunk,
    };
    use crate::services::chunk_coordinator::ChunkCoordinator;

    fn narration(id: &str, timestamp: u64, duration: u64, semantic: Option<SemanticType>) -> TimelineEvent {
        TimelineEvent {
            id: id.to_string(),
            timestamp,
            duration,
            semantic_type: semantic,
            content: EventContent::Narration(NarrationContent {
                text: "a narration line to size the text element".to_string(),
                ssml: None,
                voice: None,
                audio_url: None,
                emphasis: None,
            }),
            layout_hints: None,
            dependencies: Vec::new(),
        }
    }

    async fn engine_with_events(events: Vec<TimelineEvent>) -> Arc<TimelineLayoutEngine> {
        let coordinator = Arc::new(ChunkCoordinator::new(
            CoordinatorConfig::default(),
            EventBus::default(),
        ));
        coordinator
            .add_chunk(TimelineChunk {
                chunk_id: "chunk-1".to_string(),
                chunk_number: 1,
                start_time_offset: 0,
                duration: 60_000,
                content_type: "explanation".to_string(),
                events,
                metadata: ChunkMetadata::now(),
            })
            .await
            .expect("chunk ingested");

        Arc::new(TimelineLayoutEngine::new(
            LayoutConfig::default(),
            coordinator,
        ))
    }

    #[tokio::test]
    async fn test_seek_builds_elements_for_active_events() {
        let engine = engine_with_events(vec![
            narration("e1", 0, 5000, None),
            narration("e2", 10_000, 5000, None),
        ])
        .await;

        let snapshot = engine.seek_to_timestamp(2000).await;
        assert_eq!(snapshot.elements.len(), 1);
        assert_eq!(snapshot.elements[0].source_event_id, "e1");

        let snapshot = engine.seek_to_timestamp(12_000).await;
        assert_eq!(snapshot.elements.len(), 1);
        assert_eq!(snapshot.elements[0].source_event_id, "e2");
    }

    #[tokio::test]
    async fn test_semantic_types_add_extras() {
        let engine = engine_with_events(vec![
            narration("proc", 0, 5000, Some(SemanticType::Process)),
            narration("cmp", 10_000, 5000, Some(SemanticType::Comparison)),
            narration("map", 20_000, 5000, Some(SemanticType::ConceptMap)),
        ])
        .await;

        let snapshot = engine.seek_to_timestamp(1000).await;
        assert!(snapshot.elements.iter().any(|e| e.kind == ElementKind::Arrow));

        let snapshot = engine.seek_to_timestamp(11_000).await;
        let rectangles = snapshot
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Rectangle)
            .count();
        assert_eq!(rectangles, 2);

        let snapshot = engine.seek_to_timestamp(21_000).await;
        let ellipses = snapshot
            .elements
            .iter()
            .filter(|e| e.kind == ElementKind::Ellipse)
            .count();
        assert_eq!(ellipses, 2);
    }

    #[tokio::test]
    async fn test_cache_hit_matches_cold_rebuild() {
        let engine = engine_with_events(vec![
            narration("e1", 0, 5000, Some(SemanticType::Definition)),
            narration("e2", 1000, 5000, None),
        ])
        .await;

        let cold = engine.seek_to_timestamp(2000).await;
        let cached = engine.seek_to_timestamp(2000).await;

        let cold_ids: Vec<&str> = cold.elements.iter().map(|e| e.id.as_str()).collect();
        let cached_ids: Vec<&str> = cached.elements.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(cold_ids, cached_ids);

        for (a, b) in cold.elements.iter().zip(cached.elements.iter()) {
            assert_eq!((a.x, a.y, a.width, a.height), (b.x, b.y, b.width, b.height));
        }
    }

    #[tokio::test]
    async fn test_elements_do_not_overlap_after_collision_refinement() {
        let engine = engine_with_events(vec![
            narration("e1", 0, 5000, None),
            narration("e2", 0, 5000, None),
            narration("e3", 0, 5000, None),
        ])
        .await;

        let snapshot = engine.seek_to_timestamp(1000).await;
        assert_eq!(snapshot.elements.len(), 3);

        for (i, a) in snapshot.elements.iter().enumerate() {
            for b in snapshot.elements.iter().skip(i + 1) {
                let overlap = a.bounds().intersection_area(&b.bounds());
                let smaller = (a.width * a.height).min(b.width * b.height);
                assert!(
                    overlap < smaller * 0.25,
                    "elements {} and {} overlap heavily",
                    a.id,
                    b.id
                );
            }
        }
    }

    #[tokio::test]
    async fn test_enter_and_exit_transitions() {
        let engine = engine_with_events(vec![
            narration("e1", 0, 5000, None),
            narration("e2", 10_000, 5000, None),
        ])
        .await;

        let first = engine.seek_to_timestamp(1000).await;
        assert!(first
            .transitions
            .iter()
            .all(|t| t.kind == TransitionKind::Enter));

        let second = engine.seek_to_timestamp(12_000).await;
        let enters = second
            .transitions
            .iter()
            .filter(|t| t.kind == TransitionKind::Enter)
            .count();
        let exits = second
            .transitions
            .iter()
            .filter(|t| t.kind == TransitionKind::Exit)
            .count();
        assert_eq!(enters, 1);
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn test_resize_invalidates_cache() {
        let engine = engine_with_events(vec![narration("e1", 0, 5000, None)]).await;

        engine.seek_to_timestamp(1000).await;
        assert!(engine.cached_layouts().await >= 1);

        engine.resize(480.0, 640.0).await;
        assert_eq!(engine.cached_layouts().await, 0);
    }

    #[tokio::test]
    async fn test_precache_fills_nearby_keyframes() {
        let engine = engine_with_events(vec![
            narration("e1", 0, 5000, None),
            narration("e2", 2000, 5000, None),
            narration("e3", 4000, 5000, None),
        ])
        .await;

        engine.seek_to_timestamp(0).await;
        // Allow the staggered precache task to run
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(engine.cached_layouts().await >= 2);
    }
}
