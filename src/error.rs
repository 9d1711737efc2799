//! Error taxonomy for the playback engine
//!
//! Errors are reported across component boundaries as events, never thrown
//! through them. Each service has a typed error; component-local recovery
//! (retry, demote, shrink) is always attempted before anything is surfaced.

use thiserror::Error;

/// Errors raised by the priority task queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Item with id '{0}' is already queued")]
    DuplicateId(String),

    #[error("No handler registered for dispatch")]
    NoHandler,
}

/// Errors raised while ingesting or validating chunks
#[derive(Error, Debug, Clone)]
pub enum ChunkError {
    #[error("Chunk '{chunk_id}' failed validation: {reasons:?}")]
    ValidationFailed {
        chunk_id: String,
        reasons: Vec<String>,
    },

    #[error("Chunk '{0}' is already indexed")]
    DuplicateChunk(String),
}

/// Errors raised by the pre-generation pipeline
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Generator returned no chunk for request '{0}'")]
    EmptyResult(String),

    #[error("Generation of '{request_id}' timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("Generation of '{request_id}' failed: {source}")]
    Failed {
        request_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Pipeline is stopped")]
    Stopped,
}

/// Errors raised by the audio manager
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Audio chunk '{0}' could not be decoded")]
    DecodeFailed(String),

    #[error("Synthesis for chunk '{chunk_id}' failed: {message}")]
    SynthesisFailed { chunk_id: String, message: String },

    #[error("Buffering timed out after {0}ms")]
    BufferTimeout(u64),
}

/// Errors raised by the event executor
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("Event '{event_id}' execution timed out after {timeout_ms}ms")]
    Timeout { event_id: String, timeout_ms: u64 },

    #[error("Event '{event_id}' execution failed: {message}")]
    Failed { event_id: String, message: String },

    #[error("Event '{0}' is in a terminal state and cannot re-execute")]
    TerminalState(String),
}

/// Errors raised by the playback controller
#[derive(Error, Debug, Clone)]
pub enum PlaybackError {
    #[error("Seek target {target}ms exceeds lesson duration {total}ms")]
    SeekOutOfRange { target: u64, total: u64 },

    #[error("Playback speed {0} is outside (0, 4]")]
    InvalidSpeed(f64),

    #[error("Buffer wait timed out after {0}ms")]
    BufferWaitTimeout(u64),

    #[error("Unrecoverable playback failure: {0}")]
    Unrecoverable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_messages() {
        let full = QueueError::QueueFull { capacity: 100 };
        assert_eq!(full.to_string(), "Queue is full (capacity 100)");

        let dup = QueueError::DuplicateId("chunk-3".to_string());
        assert!(dup.to_string().contains("chunk-3"));
    }

    #[test]
    fn test_playback_error_messages() {
        let err = PlaybackError::SeekOutOfRange {
            target: 12_000,
            total: 10_000,
        };
        assert!(err.to_string().contains("12000ms"));
    }
}
