//! Progressive Audio Manager
//!
//! Turns narration events into schedulable audio chunks, decodes them
//! eagerly or in the background depending on proximity to playback, and
//! schedules them as gain-enveloped sources with an equal-power crossfade
//! at both ends.
//!
//! Durations start as producer estimates. When the TTS service reports a
//! measured duration that deviates past the recalibration threshold, a
//! recalibration pass reflows chunk start/end times so the audio timeline
//! stays a gapless partition, and live playback re-schedules from the
//! current position.

use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::events::{EngineEvent, EventBus};
use crate::models::audio::{
    AudioChunk, AudioChunkStatus, AudioPriority, AudioSourceHandle, TimingAccuracy,
};
use crate::models::timeline::{EventContent, TimelineEvent};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request handed to the TTS collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisRequest {
    /// Audio chunk being synthesized
    pub chunk_id: String,

    /// Plain text to speak
    pub text: String,

    /// Optional SSML markup; the service may ignore it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssml: Option<String>,

    /// Requested voice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Synthesizes narration audio
///
/// The engine tolerates services that ignore SSML and never report
/// measured durations; estimates are used until told otherwise.
#[async_trait]
pub trait TtsSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<Bytes>;
}

/// Audio playback states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioPlaybackState {
    Stopped,
    Playing,
    Paused,
    Buffering,
    Error,
}

/// Equal-power crossfade gains at `progress ∈ [0, 1]` through the fade
///
/// Returns `(outgoing, incoming)`; the two gains always satisfy
/// `out² + in² = 1`, keeping perceived loudness constant through the fade.
pub fn crossfade_gains(progress: f64) -> (f64, f64) {
    let clamped = progress.clamp(0.0, 1.0);
    let angle = clamped * std::f64::consts::FRAC_PI_2;
    (angle.cos(), angle.sin())
}

struct AudioState {
    chunks: Vec<AudioChunk>,
    playback: AudioPlaybackState,
    clock_anchor: Option<Instant>,
    start_position: u64,
    paused_at: u64,
    scheduled: Vec<AudioSourceHandle>,
}

/// Scheduled, crossfaded audio playback over generated narration
pub struct ProgressiveAudioManager {
    config: RwLock<AudioConfig>,
    events: EventBus,
    tts: Arc<dyn TtsSynthesizer>,
    state: Arc<RwLock<AudioState>>,
    preload_permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl ProgressiveAudioManager {
    pub fn new(config: AudioConfig, tts: Arc<dyn TtsSynthesizer>, events: EventBus) -> Self {
        let permits = config.preload_concurrency.max(1);
        Self {
            config: RwLock::new(config),
            events,
            tts,
            state: Arc::new(RwLock::new(AudioState {
                chunks: Vec::new(),
                playback: AudioPlaybackState::Stopped,
                clock_anchor: None,
                start_position: 0,
                paused_at: 0,
                scheduled: Vec::new(),
            })),
            preload_permits: Arc::new(Semaphore::new(permits)),
            cancel: CancellationToken::new(),
        }
    }

    /// Ingest a globalized narration event as an audio chunk
    ///
    /// Chunks near the playback position (or explicitly high priority) are
    /// decoded immediately; the rest preload in the background behind the
    /// bounded semaphore.
    pub async fn ingest_event(&self, event: &TimelineEvent, playback_position: u64) {
        let EventContent::Narration(narration) = &event.content else {
            return;
        };

        let config = self.config.read().await.clone();
        let near = event
            .timestamp
            .saturating_sub(playback_position)
            <= config.target_audio_buffer_ms;
        let priority = if near {
            AudioPriority::High
        } else {
            AudioPriority::Normal
        };

        let chunk = AudioChunk {
            id: event.id.clone(),
            start_time: event.timestamp,
            end_time: event.end_time(),
            text: narration.text.clone(),
            ssml: narration.ssml.clone(),
            audio_url: narration.audio_url.clone(),
            audio_data: None,
            status: AudioChunkStatus::Pending,
            priority,
            estimated_duration: Some(event.duration),
            measured_duration: None,
            timing_accuracy: TimingAccuracy::Estimated,
        };

        {
            let mut state = self.state.write().await;
            if state.chunks.iter().any(|c| c.id == chunk.id) {
                return;
            }
            state.chunks.push(chunk);
            state.chunks.sort_by_key(|c| c.start_time);
        }

        debug!(
            event = "audio_chunk_ingested",
            chunk_id = %event.id,
            start = event.timestamp,
            priority = ?priority,
            "Narration event ingested"
        );

        if priority == AudioPriority::High {
            self.spawn_load(event.id.clone());
        } else {
            self.spawn_preload(event.id.clone());
        }
    }

    /// Decode immediately, bypassing the preload semaphore
    fn spawn_load(&self, chunk_id: String) {
        let state = Arc::clone(&self.state);
        let tts = Arc::clone(&self.tts);
        let events = self.events.clone();
        tokio::spawn(async move {
            Self::load_chunk_inner(&state, &tts, &events, &chunk_id).await;
        });
    }

    fn spawn_preload(&self, chunk_id: String) {
        let state = Arc::clone(&self.state);
        let tts = Arc::clone(&self.tts);
        let permits = Arc::clone(&self.preload_permits);
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };
            Self::load_chunk_inner(&state, &tts, &events, &chunk_id).await;
        });
    }

    /// Decode one chunk now
    pub async fn load_chunk(&self, chunk_id: String) {
        Self::load_chunk_inner(&self.state, &self.tts, &self.events, &chunk_id).await;
    }

    async fn load_chunk_inner(
        state: &Arc<RwLock<AudioState>>,
        tts: &Arc<dyn TtsSynthesizer>,
        events: &EventBus,
        chunk_id: &str,
    ) {
        let request = {
            let mut guard = state.write().await;
            let Some(chunk) = guard.chunks.iter_mut().find(|c| c.id == chunk_id) else {
                return;
            };
            if chunk.status != AudioChunkStatus::Pending {
                return;
            }
            chunk.status = AudioChunkStatus::Loading;
            SynthesisRequest {
                chunk_id: chunk.id.clone(),
                text: chunk.text.clone(),
                ssml: chunk.ssml.clone(),
                voice: None,
            }
        };

        match tts.synthesize(&request).await {
            Ok(data) => {
                let mut guard = state.write().await;
                if let Some(chunk) = guard.chunks.iter_mut().find(|c| c.id == chunk_id) {
                    chunk.audio_data = Some(data);
                    chunk.status = AudioChunkStatus::Ready;
                    debug!(event = "audio_chunk_ready", chunk_id = %chunk_id, "Audio chunk decoded");
                }
            }
            Err(error) => {
                warn!(event = "audio_decode_failed", chunk_id = %chunk_id, error = %error, "Audio chunk failed to decode");
                let mut guard = state.write().await;
                if let Some(chunk) = guard.chunks.iter_mut().find(|c| c.id == chunk_id) {
                    chunk.status = AudioChunkStatus::Error;
                }
                drop(guard);
                events.emit(EngineEvent::Error {
                    component: "audio".to_string(),
                    message: AudioError::DecodeFailed(chunk_id.to_string()).to_string(),
                    recoverable: true,
                });
            }
        }
    }

    /// Milliseconds of contiguous ready audio ahead of `position`
    pub async fn buffer_level(&self, position: u64) -> u64 {
        let state = self.state.read().await;
        Self::level_at(&state.chunks, position)
    }

    fn level_at(chunks: &[AudioChunk], position: u64) -> u64 {
        let mut runway_end = position;
        let mut extended = true;
        while extended {
            extended = false;
            for chunk in chunks {
                if chunk.status == AudioChunkStatus::Ready
                    && chunk.start_time <= runway_end
                    && chunk.end_time > runway_end
                {
                    runway_end = chunk.end_time;
                    extended = true;
                }
            }
        }
        runway_end - position
    }

    /// Whether undecoded chunks are still expected near `position`
    async fn has_pending_audio(&self, position: u64, config: &AudioConfig) -> bool {
        let state = self.state.read().await;
        state.chunks.iter().any(|c| {
            matches!(c.status, AudioChunkStatus::Pending | AudioChunkStatus::Loading)
                && c.end_time > position
                && c.start_time < position + config.target_audio_buffer_ms
        })
    }

    /// Start playback at `start_position`
    ///
    /// While decoded audio is below the minimum and undecoded chunks are
    /// still inbound, enters `Buffering` and polls; gives up after the
    /// buffering timeout. Silence (no upcoming chunks at all) plays
    /// through immediately.
    pub async fn play(&self, start_position: u64) -> Result<(), AudioError> {
        let config = self.config.read().await.clone();

        if self.buffer_level(start_position).await < config.min_audio_buffer_ms
            && self.has_pending_audio(start_position, &config).await
        {
            {
                let mut state = self.state.write().await;
                state.playback = AudioPlaybackState::Buffering;
            }
            info!(
                event = "audio_buffering",
                position = start_position,
                "Audio buffering before playback"
            );

            let deadline = Instant::now() + Duration::from_millis(config.buffering_timeout_ms);
            loop {
                if self.buffer_level(start_position).await >= config.min_audio_buffer_ms {
                    break;
                }
                if !self.has_pending_audio(start_position, &config).await {
                    break;
                }
                if Instant::now() >= deadline {
                    let mut state = self.state.write().await;
                    state.playback = AudioPlaybackState::Error;
                    return Err(AudioError::BufferTimeout(config.buffering_timeout_ms));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        self.schedule_from(start_position, &config).await;
        Ok(())
    }

    /// Schedule every eligible ready chunk as a crossfaded source
    async fn schedule_from(&self, start_position: u64, config: &AudioConfig) {
        let mut state = self.state.write().await;
        state.clock_anchor = Some(Instant::now());
        state.start_position = start_position;
        state.playback = AudioPlaybackState::Playing;

        let gain = config.master_volume.clamp(0.0, 1.0);
        let crossfade = config.crossfade_duration_ms;

        state.scheduled = state
            .chunks
            .iter()
            .filter(|c| c.status == AudioChunkStatus::Ready && c.end_time > start_position)
            .map(|c| AudioSourceHandle {
                chunk_id: c.id.clone(),
                scheduled_at: c.start_time.max(start_position),
                duration: c.end_time.saturating_sub(c.start_time.max(start_position)),
                fade_in: crossfade.min(c.scheduled_duration() / 2),
                fade_out: crossfade.min(c.scheduled_duration() / 2),
                gain,
            })
            .collect();

        info!(
            event = "audio_scheduled",
            position = start_position,
            sources = state.scheduled.len(),
            "Audio sources scheduled"
        );
    }

    /// Current audio playback position in milliseconds
    pub async fn current_position(&self) -> u64 {
        let state = self.state.read().await;
        match state.playback {
            AudioPlaybackState::Playing => {
                let elapsed = state
                    .clock_anchor
                    .map(|a| a.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                state.start_position + elapsed
            }
            AudioPlaybackState::Paused => state.paused_at,
            _ => state.start_position,
        }
    }

    /// Stop every live source cleanly; idempotent
    pub async fn pause(&self) {
        let position = self.current_position().await;
        let mut state = self.state.write().await;
        if state.playback == AudioPlaybackState::Paused {
            return;
        }
        state.paused_at = position;
        state.playback = AudioPlaybackState::Paused;
        state.scheduled.clear();
        state.clock_anchor = None;
        for chunk in state.chunks.iter_mut() {
            if chunk.status == AudioChunkStatus::Playing {
                chunk.status = AudioChunkStatus::Ready;
            }
        }
        debug!(event = "audio_paused", position = position, "Audio paused");
    }

    /// Re-enter playback at the paused position
    pub async fn resume(&self) -> Result<(), AudioError> {
        let paused_at = {
            let state = self.state.read().await;
            if state.playback != AudioPlaybackState::Paused {
                return Ok(());
            }
            state.paused_at
        };
        self.play(paused_at).await
    }

    /// Stop playback and release all sources
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        state.playback = AudioPlaybackState::Stopped;
        state.scheduled.clear();
        state.clock_anchor = None;
        state.start_position = 0;
        state.paused_at = 0;
    }

    /// Cancel background preloads
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Current playback state
    pub async fn playback_state(&self) -> AudioPlaybackState {
        self.state.read().await.playback
    }

    /// Set the master volume, clamped to `[0, 1]`
    pub async fn set_volume(&self, volume: f64) {
        let clamped = volume.clamp(0.0, 1.0);
        self.config.write().await.master_volume = clamped;
        let mut state = self.state.write().await;
        for source in state.scheduled.iter_mut() {
            source.gain = clamped;
        }
    }

    /// Currently scheduled sources
    pub async fn scheduled_sources(&self) -> Vec<AudioSourceHandle> {
        self.state.read().await.scheduled.clone()
    }

    /// Snapshot of all audio chunks, in start order
    pub async fn chunk_snapshots(&self) -> Vec<AudioChunk> {
        self.state.read().await.chunks.clone()
    }

    /// Record a measured duration reported by the TTS service
    ///
    /// Deviations past the significant-change threshold are flagged in the
    /// emitted `durationUpdated` event; the caller decides when to run the
    /// recalibration pass.
    pub async fn report_measured_duration(&self, chunk_id: &str, measured_ms: u64) -> bool {
        let config = self.config.read().await.clone();

        let (estimated, significant) = {
            let mut state = self.state.write().await;
            let Some(chunk) = state.chunks.iter_mut().find(|c| c.id == chunk_id) else {
                return false;
            };
            chunk.measured_duration = Some(measured_ms);
            let deviation = chunk.duration_deviation().unwrap_or(0.0);
            let significant = deviation > config.significant_change_threshold;
            chunk.timing_accuracy = if significant {
                TimingAccuracy::Drifted
            } else {
                TimingAccuracy::Accurate
            };
            (chunk.estimated_duration, significant)
        };

        info!(
            event = "audio_duration_measured",
            chunk_id = %chunk_id,
            measured_ms = measured_ms,
            significant = significant,
            "Measured duration recorded"
        );

        self.events.emit(EngineEvent::DurationUpdated {
            chunk_id: chunk_id.to_string(),
            estimated_ms: estimated,
            measured_ms,
            significant,
        });
        significant
    }

    /// Reflow chunk start/end times from measured durations
    ///
    /// Chunks are processed in start order; each starts no earlier than its
    /// original start and no earlier than the previous chunk's new end, so
    /// the result is a partition with no overlaps. A chunk adopts its
    /// measured duration only when the deviation exceeds the recalibration
    /// threshold. When playing, upcoming sources re-schedule from the
    /// current position.
    pub async fn recalibrate(&self) -> usize {
        let config = self.config.read().await.clone();
        let position = self.current_position().await;

        let (adjustments, total_duration, was_playing) = {
            let mut state = self.state.write().await;
            state.chunks.sort_by_key(|c| c.start_time);

            let mut adjustments = 0usize;
            let mut running_end: u64 = 0;

            for chunk in state.chunks.iter_mut() {
                let original_start = chunk.start_time;
                let new_start = original_start.max(running_end);

                let deviation = chunk.duration_deviation().unwrap_or(0.0);
                let duration = if deviation > config.recalibration_threshold {
                    chunk.measured_duration.unwrap_or_else(|| chunk.scheduled_duration())
                } else {
                    chunk.scheduled_duration()
                };

                let new_end = new_start + duration;
                if new_start != chunk.start_time || new_end != chunk.end_time {
                    adjustments += 1;
                }
                chunk.start_time = new_start;
                chunk.end_time = new_end;
                running_end = new_end;
            }

            let was_playing = state.playback == AudioPlaybackState::Playing;
            (adjustments, running_end, was_playing)
        };

        info!(
            event = "audio_recalibrated",
            adjustments = adjustments,
            total_duration = total_duration,
            "Audio timeline recalibrated"
        );

        self.events.emit(EngineEvent::TimelineRecalibrated {
            adjustments,
            total_duration,
        });

        if was_playing && adjustments > 0 {
            let config = self.config.read().await.clone();
            self.schedule_from(position, &config).await;
        }

        adjustments
    }
}

#[async_trait]
impl crate::services::event_scheduler::AudioPositionSource for ProgressiveAudioManager {
    async fn audio_position(&self) -> u64 {
        self.current_position().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::timeline::NarrationContent;

    struct InstantTts;

    #[async_trait]
    impl TtsSynthesizer for InstantTts {
        async fn synthesize(&self, _request: &SynthesisRequest) -> anyhow::Result<Bytes> {
            Ok(Bytes::from_static(b"pcm"))
        }
    }

    struct FailingTts;

    #[async_trait]
    impl TtsSynthesizer for FailingTts {
        async fn synthesize(&self, _request: &SynthesisRequest) -> anyhow::Result<Bytes> {
            anyhow::bail!("voice model unavailable")
        }
    }

    struct HungTts;

    #[async_trait]
    impl TtsSynthesizer for HungTts {
        async fn synthesize(&self, _request: &SynthesisRequest) -> anyhow::Result<Bytes> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Bytes::new())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn narration_event(id: &str, timestamp: u64, duration: u64) -> TimelineEvent {
        TimelineEvent {
            id: id.to_string(),
            timestamp,
            duration,
            semantic_type: None,
            content: EventContent::Narration(NarrationContent {
                text: "spoken line".to_string(),
                ssml: None,
                voice: None,
                audio_url: None,
                emphasis: None,
            }),
            layout_hints: None,
            dependencies: Vec::new(),
        }
    }

    fn manager() -> ProgressiveAudioManager {
        ProgressiveAudioManager::new(AudioConfig::default(), Arc::new(InstantTts), EventBus::default())
    }

    #[test]
    fn test_crossfade_gains_are_equal_power() {
        for step in 0..=10 {
            let progress = step as f64 / 10.0;
            let (out_gain, in_gain) = crossfade_gains(progress);
            let power = out_gain * out_gain + in_gain * in_gain;
            assert!((power - 1.0).abs() < 1e-9, "power {power} at {progress}");
        }

        let (out_start, in_start) = crossfade_gains(0.0);
        assert!((out_start - 1.0).abs() < 1e-9);
        assert!(in_start.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_near_events_decode_eagerly() {
        let m = manager();
        m.ingest_event(&narration_event("n1", 1000, 3000), 0).await;
        settle().await;

        let chunks = m.chunk_snapshots().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].status, AudioChunkStatus::Ready);
        assert_eq!(chunks[0].priority, AudioPriority::High);
    }

    #[tokio::test]
    async fn test_play_schedules_crossfaded_sources() {
        let m = manager();
        m.ingest_event(&narration_event("n1", 0, 3000), 0).await;
        m.ingest_event(&narration_event("n2", 3000, 3000), 0).await;
        settle().await;

        m.play(0).await.expect("playable");
        assert_eq!(m.playback_state().await, AudioPlaybackState::Playing);

        let sources = m.scheduled_sources().await;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].fade_in, 150);
        assert_eq!(sources[0].fade_out, 150);
        assert!((sources[0].gain - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_play_times_out_when_decode_never_finishes() {
        let config = AudioConfig {
            buffering_timeout_ms: 100,
            ..AudioConfig::default()
        };
        let m = ProgressiveAudioManager::new(config, Arc::new(HungTts), EventBus::default());
        m.ingest_event(&narration_event("n1", 0, 3000), 0).await;

        let err = m.play(0).await.expect_err("decode never completes");
        assert!(matches!(err, AudioError::BufferTimeout(_)));
        assert_eq!(m.playback_state().await, AudioPlaybackState::Error);
    }

    #[tokio::test]
    async fn test_silence_plays_through_without_buffering() {
        let m = manager();
        // No narration anywhere: playback proceeds with nothing scheduled
        m.play(0).await.expect("silence is playable");
        assert_eq!(m.playback_state().await, AudioPlaybackState::Playing);
        assert!(m.scheduled_sources().await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_and_releases_sources() {
        let m = manager();
        m.ingest_event(&narration_event("n1", 0, 3000), 0).await;
        settle().await;
        m.play(0).await.unwrap();

        m.pause().await;
        assert_eq!(m.playback_state().await, AudioPlaybackState::Paused);
        assert!(m.scheduled_sources().await.is_empty());

        // Second pause is a no-op
        m.pause().await;
        assert_eq!(m.playback_state().await, AudioPlaybackState::Paused);

        m.resume().await.unwrap();
        assert_eq!(m.playback_state().await, AudioPlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_decode_failure_marks_chunk_error() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = ProgressiveAudioManager::new(AudioConfig::default(), Arc::new(FailingTts), bus);

        m.ingest_event(&narration_event("n1", 0, 3000), 0).await;
        settle().await;

        let chunks = m.chunk_snapshots().await;
        assert_eq!(chunks[0].status, AudioChunkStatus::Error);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Error { component, recoverable, .. } = event {
                assert_eq!(component, "audio");
                assert!(recoverable);
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_measured_duration_flags_significant_change() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = ProgressiveAudioManager::new(AudioConfig::default(), Arc::new(InstantTts), bus);
        m.ingest_event(&narration_event("n1", 0, 3000), 0).await;

        // 4200 vs 3000 estimated: 40% deviation, well past 15%
        let significant = m.report_measured_duration("n1", 4200).await;
        assert!(significant);

        let mut saw_update = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::DurationUpdated { measured_ms, significant, .. } = event {
                assert_eq!(measured_ms, 4200);
                assert!(significant);
                saw_update = true;
            }
        }
        assert!(saw_update);

        let chunks = m.chunk_snapshots().await;
        assert_eq!(chunks[0].timing_accuracy, TimingAccuracy::Drifted);
    }

    #[tokio::test]
    async fn test_recalibration_shifts_subsequent_chunks() {
        let m = manager();
        m.ingest_event(&narration_event("n1", 0, 3000), 0).await;
        m.ingest_event(&narration_event("n2", 3000, 3000), 0).await;
        m.ingest_event(&narration_event("n3", 6000, 3000), 0).await;

        m.report_measured_duration("n1", 4200).await;
        let adjustments = m.recalibrate().await;

        // n1 grows to 4200; n2 and n3 shift by +1200
        assert_eq!(adjustments, 3);
        let chunks = m.chunk_snapshots().await;
        assert_eq!(chunks[0].end_time, 4200);
        assert_eq!(chunks[1].start_time, 4200);
        assert_eq!(chunks[1].end_time, 7200);
        assert_eq!(chunks[2].start_time, 7200);
        assert_eq!(chunks[2].end_time, 10_200);
    }

    #[tokio::test]
    async fn test_recalibration_yields_partition() {
        let m = manager();
        m.ingest_event(&narration_event("n1", 0, 2000), 0).await;
        m.ingest_event(&narration_event("n2", 2500, 2000), 0).await;
        m.report_measured_duration("n1", 3500).await;
        m.recalibrate().await;

        let chunks = m.chunk_snapshots().await;
        for pair in chunks.windows(2) {
            assert!(pair[0].end_time <= pair[1].start_time, "chunks overlap");
        }
    }

    #[tokio::test]
    async fn test_volume_clamped_and_applied_to_sources() {
        let m = manager();
        m.ingest_event(&narration_event("n1", 0, 3000), 0).await;
        settle().await;
        m.play(0).await.unwrap();

        m.set_volume(2.5).await;
        let sources = m.scheduled_sources().await;
        assert!((sources[0].gain - 1.0).abs() < 1e-9);

        m.set_volume(0.3).await;
        let sources = m.scheduled_sources().await;
        assert!((sources[0].gain - 0.3).abs() < 1e-9);
    }
}
