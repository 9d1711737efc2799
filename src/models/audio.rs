use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Lifecycle of an audio chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioChunkStatus {
    /// Created from a narration event, nothing fetched yet
    Pending,
    /// Synthesis or fetch in progress
    Loading,
    /// Decoded and schedulable
    Ready,
    /// Currently feeding a live source
    Playing,
    /// Synthesis, fetch, or decode failed
    Error,
}

/// Decode priority for audio chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioPriority {
    Low,
    Normal,
    High,
}

/// How well the chunk's scheduled timing matches its measured duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingAccuracy {
    /// Timing based on the producer's estimate only
    Estimated,
    /// Measured duration reported and within tolerance of the estimate
    Accurate,
    /// Measured duration deviated significantly from the estimate
    Drifted,
}

/// A schedulable slice of narration audio
///
/// One audio chunk per narration event. Durations start as producer
/// estimates and are replaced by measured values once the TTS service
/// reports them.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Unique identifier (mirrors the originating event id)
    pub id: String,

    /// Scheduled start on the global timeline in milliseconds
    pub start_time: u64,

    /// Scheduled end on the global timeline in milliseconds
    pub end_time: u64,

    /// Text to synthesize
    pub text: String,

    /// Optional SSML markup
    pub ssml: Option<String>,

    /// Pre-rendered audio location, when the producer supplied one
    pub audio_url: Option<String>,

    /// Decoded audio payload, present once loading completes
    pub audio_data: Option<Bytes>,

    /// Lifecycle state
    pub status: AudioChunkStatus,

    /// Decode priority
    pub priority: AudioPriority,

    /// Producer's duration estimate in milliseconds
    pub estimated_duration: Option<u64>,

    /// Duration measured by the TTS service in milliseconds
    pub measured_duration: Option<u64>,

    /// Confidence in the scheduled timing
    pub timing_accuracy: TimingAccuracy,
}

impl AudioChunk {
    /// Scheduled length in milliseconds
    pub fn scheduled_duration(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    /// Best known duration: measured when available, estimate otherwise
    pub fn effective_duration(&self) -> u64 {
        self.measured_duration
            .or(self.estimated_duration)
            .unwrap_or_else(|| self.scheduled_duration())
    }

    /// Relative deviation of the measured duration from the estimate
    ///
    /// Returns `None` until both values are known or when the estimate is
    /// zero.
    pub fn duration_deviation(&self) -> Option<f64> {
        let measured = self.measured_duration? as f64;
        let estimated = self.estimated_duration? as f64;
        if estimated == 0.0 {
            return None;
        }
        Some((measured - estimated).abs() / estimated)
    }
}

/// Handle to a scheduled audio source, released on stop or pause
///
/// The audio manager owns live sources; consumers receive handles and the
/// per-source gain envelope to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSourceHandle {
    /// Backing audio chunk id
    pub chunk_id: String,

    /// When the source starts on the audio clock, in milliseconds
    pub scheduled_at: u64,

    /// Source length in milliseconds
    pub duration: u64,

    /// Fade-in length at the head of the source, in milliseconds
    pub fade_in: u64,

    /// Fade-out length at the tail of the source, in milliseconds
    pub fade_out: u64,

    /// Peak gain for the source, already clamped to `[0, 1]`
    pub gain: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(estimated: Option<u64>, measured: Option<u64>) -> AudioChunk {
        AudioChunk {
            id: "a1".to_string(),
            start_time: 0,
            end_time: 3000,
            text: "narration".to_string(),
            ssml: None,
            audio_url: None,
            audio_data: None,
            status: AudioChunkStatus::Pending,
            priority: AudioPriority::Normal,
            estimated_duration: estimated,
            measured_duration: measured,
            timing_accuracy: TimingAccuracy::Estimated,
        }
    }

    #[test]
    fn test_effective_duration_prefers_measured() {
        assert_eq!(chunk(Some(3000), Some(4200)).effective_duration(), 4200);
        assert_eq!(chunk(Some(3000), None).effective_duration(), 3000);
        assert_eq!(chunk(None, None).effective_duration(), 3000);
    }

    #[test]
    fn test_duration_deviation() {
        let c = chunk(Some(3000), Some(4200));
        let deviation = c.duration_deviation().expect("both durations known");
        assert!((deviation - 0.4).abs() < 1e-9);

        assert!(chunk(Some(3000), None).duration_deviation().is_none());
        assert!(chunk(Some(0), Some(100)).duration_deviation().is_none());
    }
}
