//! Lesson fixture builders
//!
//! Builders for chunks and events used across unit and integration tests.
//! Event timestamps are chunk-local, as a producer would emit them.

use crate::models::timeline::{
    ChunkMetadata, EventContent, NarrationContent, SemanticType, TimelineChunk, TimelineEvent,
    TransitionContent, VisualAction, VisualContent,
};

/// Builder for one lesson chunk
pub struct ChunkFixtureBuilder {
    chunk_number: u32,
    start_time_offset: u64,
    duration: u64,
    content_type: String,
    events: Vec<TimelineEvent>,
    summary: Option<String>,
    concepts: Option<Vec<String>>,
}

impl ChunkFixtureBuilder {
    /// Chunk `number` starting at `start_time_offset` with `duration` ms
    pub fn new(chunk_number: u32, start_time_offset: u64, duration: u64) -> Self {
        Self {
            chunk_number,
            start_time_offset,
            duration,
            content_type: "explanation".to_string(),
            events: Vec::new(),
            summary: None,
            concepts: None,
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    pub fn concepts(mut self, concepts: &[&str]) -> Self {
        self.concepts = Some(concepts.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Add a narration event at a chunk-local timestamp
    pub fn narration(mut self, id: &str, timestamp: u64, duration: u64, text: &str) -> Self {
        self.events.push(narration_event(id, timestamp, duration, text));
        self
    }

    /// Add a narration event with a semantic classification
    pub fn semantic_narration(
        mut self,
        id: &str,
        timestamp: u64,
        duration: u64,
        text: &str,
        semantic: SemanticType,
    ) -> Self {
        let mut event = narration_event(id, timestamp, duration, text);
        event.semantic_type = Some(semantic);
        self.events.push(event);
        self
    }

    /// Add a visual creation event at a chunk-local timestamp
    pub fn visual(mut self, id: &str, timestamp: u64, duration: u64, element_type: &str) -> Self {
        self.events.push(visual_event(id, timestamp, duration, element_type));
        self
    }

    /// Add a view transition event at a chunk-local timestamp
    pub fn transition(mut self, id: &str, timestamp: u64, target: &str) -> Self {
        self.events.push(transition_event(id, timestamp, target));
        self
    }

    pub fn build(self) -> TimelineChunk {
        TimelineChunk {
            chunk_id: format!("chunk-{}", self.chunk_number),
            chunk_number: self.chunk_number,
            start_time_offset: self.start_time_offset,
            duration: self.duration,
            content_type: self.content_type,
            events: self.events,
            metadata: ChunkMetadata {
                generated_at: chrono::Utc::now(),
                summary: self.summary,
                concepts_introduced: self.concepts,
            },
        }
    }
}

/// A narration event with chunk-local timing
pub fn narration_event(id: &str, timestamp: u64, duration: u64, text: &str) -> TimelineEvent {
    TimelineEvent {
        id: id.to_string(),
        timestamp,
        duration,
        semantic_type: None,
        content: EventContent::Narration(NarrationContent {
            text: text.to_string(),
            ssml: None,
            voice: None,
            audio_url: None,
            emphasis: None,
        }),
        layout_hints: None,
        dependencies: Vec::new(),
    }
}

/// A visual creation event with chunk-local timing
pub fn visual_event(id: &str, timestamp: u64, duration: u64, element_type: &str) -> TimelineEvent {
    TimelineEvent {
        id: id.to_string(),
        timestamp,
        duration,
        semantic_type: None,
        content: EventContent::Visual(VisualContent {
            action: VisualAction::Create,
            element_type: element_type.to_string(),
            properties: serde_json::Value::Null,
        }),
        layout_hints: None,
        dependencies: Vec::new(),
    }
}

/// A 500ms view transition event with chunk-local timing
pub fn transition_event(id: &str, timestamp: u64, target: &str) -> TimelineEvent {
    TimelineEvent {
        id: id.to_string(),
        timestamp,
        duration: 500,
        semantic_type: None,
        content: EventContent::Transition(TransitionContent {
            transition_type: "pan".to_string(),
            target: target.to_string(),
            duration: 500,
            easing: "ease-in-out".to_string(),
            parameters: None,
        }),
        layout_hints: None,
        dependencies: Vec::new(),
    }
}

/// Two contiguous 5-second chunks with narration in each
pub fn two_chunk_lesson() -> Vec<TimelineChunk> {
    vec![
        ChunkFixtureBuilder::new(1, 0, 5000)
            .narration("a-n1", 0, 2500, "First the setup")
            .narration("a-n2", 2500, 2500, "then the idea")
            .build(),
        ChunkFixtureBuilder::new(2, 5000, 5000)
            .narration("b-n1", 100, 2400, "Now the development")
            .visual("b-v1", 2500, 2500, "diagram")
            .build(),
    ]
}
