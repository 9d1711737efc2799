//! Engine event bus
//!
//! Every component reports through a single broadcast channel of tagged
//! [`EngineEvent`]s. Consumers (UI layer, collaborators, tests) subscribe
//! and filter; emitting never blocks and tolerates having no subscribers.

use crate::models::buffer::RegionSnapshot;
use crate::services::adaptive_buffer::AdaptiveBufferStrategy;
use crate::services::playback_controller::PlaybackState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why the controller entered the `Buffering` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferingReason {
    /// Initial buffering before playback starts
    Startup,
    /// Playback caught up with the buffered edge
    Underrun,
    /// A seek landed in an unbuffered range
    Seek,
}

/// All events emitted by the engine, tagged for serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A chunk passed validation and entered the timeline index
    #[serde(rename_all = "camelCase")]
    ChunkAdded {
        chunk_id: String,
        chunk_number: u32,
        start_time: u64,
        end_time: u64,
    },

    /// Chunk ingest began
    #[serde(rename_all = "camelCase")]
    ChunkProcessingStarted { chunk_id: String },

    /// Chunk ingest finished; events are globalized and indexed
    #[serde(rename_all = "camelCase")]
    ChunkProcessingCompleted { chunk_id: String, event_count: usize },

    /// Chunk ingest failed validation or indexing
    #[serde(rename_all = "camelCase")]
    ChunkProcessingError { chunk_id: String, message: String },

    /// Buffer level at the playback position crossed the start threshold
    #[serde(rename_all = "camelCase")]
    PlaybackReady { position: u64, buffer_level: u64 },

    /// A seek requested an unbuffered position
    #[serde(rename_all = "camelCase")]
    SeekBlocked {
        position: u64,
        nearest_region: Option<RegionSnapshot>,
    },

    /// Buffer level at the playback position fell below the urgent threshold
    #[serde(rename_all = "camelCase")]
    BufferUrgent { position: u64, buffer_level: u64 },

    /// The controller began waiting on buffer
    #[serde(rename_all = "camelCase")]
    BufferingStarted { reason: BufferingReason },

    /// Buffering resolved and playback resumed or re-paused
    BufferingEnded,

    /// A seek began
    #[serde(rename_all = "camelCase")]
    SeekStarted { from: u64, to: u64 },

    /// A seek resolved
    #[serde(rename_all = "camelCase")]
    SeekCompleted { position: u64, was_immediate: bool },

    /// Enough content is buffered to begin playback
    #[serde(rename_all = "camelCase")]
    ReadyToPlay { position: u64 },

    /// Playback state machine transition
    #[serde(rename_all = "camelCase")]
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },

    /// Periodic playback position report, emitted after the buffer manager
    /// has observed the same position
    #[serde(rename_all = "camelCase")]
    PositionChanged { position: u64, buffer_level: u64 },

    /// A TTS duration report replaced an estimate
    #[serde(rename_all = "camelCase")]
    DurationUpdated {
        chunk_id: String,
        estimated_ms: Option<u64>,
        measured_ms: u64,
        significant: bool,
    },

    /// Measured audio durations reflowed the chunk timeline
    #[serde(rename_all = "camelCase")]
    TimelineRecalibrated {
        adjustments: usize,
        total_duration: u64,
    },

    /// The adaptive controller applied a new buffer strategy
    #[serde(rename_all = "camelCase")]
    StrategyChanged {
        reason: String,
        strategy: AdaptiveBufferStrategy,
    },

    /// Memory or performance pressure detected; playback continues degraded
    #[serde(rename_all = "camelCase")]
    PerformanceAlert {
        message: String,
        memory_usage_bytes: u64,
    },

    /// A component-level failure, recoverable unless stated otherwise
    #[serde(rename_all = "camelCase")]
    Error {
        component: String,
        message: String,
        recoverable: bool,
    },
}

/// Broadcast fan-out for engine events
///
/// Cheap to clone; all clones share the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers
    ///
    /// Lagging or absent subscribers never block the emitter.
    pub fn emit(&self, event: EngineEvent) {
        // send only fails when there are no receivers, which is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::ReadyToPlay { position: 0 });

        match rx.recv().await.expect("event") {
            EngineEvent::ReadyToPlay { position } => assert_eq!(position, 0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.emit(EngineEvent::BufferingEnded);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = EngineEvent::SeekCompleted {
            position: 4500,
            was_immediate: true,
        };
        let json = serde_json::to_string(&event).expect("serialize");

        assert!(json.contains("\"event\":\"seekCompleted\""));
        assert!(json.contains("\"wasImmediate\":true"));
    }
}
