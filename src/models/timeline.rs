use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event categories carried on the lesson timeline
/// All timestamps are in MILLISECONDS from lesson start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Narration,
    Visual,
    Transition,
    Emphasis,
    LayoutChange,
}

/// Semantic classification of an event's teaching content
///
/// Drives layout synthesis: a `Process` event gets an arrow, a `Comparison`
/// gets paired panels, a `ConceptMap` gets linked nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Definition,
    Process,
    Comparison,
    Example,
    List,
    ConceptMap,
    Formula,
    Story,
}

/// Spoken narration payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrationContent {
    /// Plain text to speak
    pub text: String,

    /// Optional SSML markup (takes precedence over plain text when present)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssml: Option<String>,

    /// Voice identifier for the TTS service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Pre-synthesized audio location, if the producer already rendered it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,

    /// Words or phrases to emphasize during synthesis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emphasis: Option<Vec<String>>,
}

/// What a visual event does to the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualAction {
    Create,
    Modify,
    Remove,
}

/// Visual element manipulation payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualContent {
    /// Create, modify, or remove
    pub action: VisualAction,

    /// Drawable kind understood by the element surface (e.g. "text", "arrow")
    pub element_type: String,

    /// Free-form element properties forwarded to the renderer
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// View transition payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionContent {
    /// Transition kind (e.g. "pan", "zoom", "fade")
    #[serde(rename = "type")]
    pub transition_type: String,

    /// Target of the transition (element id or named viewport)
    pub target: String,

    /// Transition length in milliseconds
    pub duration: u64,

    /// Easing curve name
    pub easing: String,

    /// Additional transition parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Event payload, tagged by the event type
///
/// Executors dispatch exhaustively on this sum type; there is no untyped
/// content escape hatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum EventContent {
    Narration(NarrationContent),
    Visual(VisualContent),
    Transition(TransitionContent),
    Emphasis(serde_json::Value),
    LayoutChange(serde_json::Value),
}

impl EventContent {
    /// The event type this payload belongs to
    pub fn event_type(&self) -> EventType {
        match self {
            EventContent::Narration(_) => EventType::Narration,
            EventContent::Visual(_) => EventType::Visual,
            EventContent::Transition(_) => EventType::Transition,
            EventContent::Emphasis(_) => EventType::Emphasis,
            EventContent::LayoutChange(_) => EventType::LayoutChange,
        }
    }
}

/// Hint from the producer about where an event's visuals should land
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutHint {
    /// Preferred region type (e.g. "main", "sidebar")
    pub region: String,

    /// Relative weight when several hints compete
    #[serde(default)]
    pub weight: f64,
}

/// A single timed action on the lesson timeline
///
/// Timestamps are local to the owning chunk until the coordinator
/// globalizes them by adding the chunk's start offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    /// Unique identifier
    pub id: String,

    /// Start time in milliseconds
    pub timestamp: u64,

    /// Duration in milliseconds (always positive)
    pub duration: u64,

    /// Semantic classification, when the producer supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_type: Option<SemanticType>,

    /// Typed payload, tagged by event type
    #[serde(flatten)]
    pub content: EventContent,

    /// Producer layout hints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_hints: Option<Vec<LayoutHint>>,

    /// Ids of events that must complete before this one executes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl TimelineEvent {
    /// The event's type, derived from its payload
    pub fn event_type(&self) -> EventType {
        self.content.event_type()
    }

    /// End time in milliseconds (exclusive)
    pub fn end_time(&self) -> u64 {
        self.timestamp + self.duration
    }

    /// Whether the event is active at time `t` (covers `[timestamp, end)`)
    pub fn is_active_at(&self, t: u64) -> bool {
        self.timestamp <= t && t < self.end_time()
    }

    /// Whether the event's span overlaps `[start, end]`
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.timestamp <= end && self.end_time() >= start
    }
}

/// Chunk metadata recorded by the producer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// When the producer generated this chunk
    pub generated_at: DateTime<Utc>,

    /// Producer summary of the chunk's content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Concepts introduced by this chunk, used for continuity scoring
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concepts_introduced: Option<Vec<String>>,
}

impl ChunkMetadata {
    /// Metadata stamped with the current time and nothing else
    pub fn now() -> Self {
        Self {
            generated_at: Utc::now(),
            summary: None,
            concepts_introduced: None,
        }
    }
}

/// A contiguous, independently produced slice of the lesson timeline
///
/// The atomic unit of buffering and caching. `start_time_offset` is the
/// chunk's position on the global timeline; event timestamps inside a
/// freshly produced chunk are chunk-local until globalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineChunk {
    /// Unique identifier
    pub chunk_id: String,

    /// 1-based position within the lesson, monotonic
    pub chunk_number: u32,

    /// Offset of the chunk on the global timeline in milliseconds
    pub start_time_offset: u64,

    /// Chunk length in milliseconds
    pub duration: u64,

    /// Producer content type tag (e.g. "explanation", "worked_example")
    pub content_type: String,

    /// Timeline events carried by this chunk
    pub events: Vec<TimelineEvent>,

    /// Producer metadata
    pub metadata: ChunkMetadata,
}

impl TimelineChunk {
    /// End of the chunk on the global timeline (exclusive)
    pub fn end_time(&self) -> u64 {
        self.start_time_offset + self.duration
    }

    /// Whether the chunk's boundary contains time `t`
    pub fn contains(&self, t: u64) -> bool {
        self.start_time_offset <= t && t < self.end_time()
    }

    /// Whether the chunk's boundary overlaps `[start, end]`
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start_time_offset <= end && self.end_time() >= start
    }
}
