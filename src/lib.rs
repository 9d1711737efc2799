//! Progressive playback engine for generated lessons
//!
//! A lesson is a sequence of independently produced chunks, each carrying
//! timed narration, visual, transition, emphasis, and layout events. The
//! engine coordinates three tracks against one monotonic timeline: chunk
//! production (predictive pre-generation), audio playback (scheduled,
//! crossfaded narration), and visual layout (instant-seek reconstruction),
//! with network-adaptive buffering underneath.
//!
//! [`LessonEngine`] wires the components together; collaborators (the
//! chunk generator, the TTS service, the network probe, the rendering
//! surface) are injected as traits and channels.

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod services;
pub mod utils;

// Fixture builders used by both unit and integration tests
pub mod test_utils;

use crate::config::EngineConfig;
use crate::error::ChunkError;
use crate::events::{EngineEvent, EventBus};
use crate::models::layout::LayoutSnapshot;
use crate::models::timeline::TimelineChunk;
use crate::services::adaptive_buffer::{AdaptiveBufferController, NetworkProbe};
use crate::services::audio_manager::{ProgressiveAudioManager, TtsSynthesizer};
use crate::services::buffer_manager::{BufferReadiness, ProgressiveBufferManager};
use crate::services::chunk_coordinator::{ChunkCoordinator, ContinuityHint, CoordinatorQuery};
use crate::services::event_executor::{EventExecutor, ExecutorInstruction};
use crate::services::event_scheduler::TimelineEventScheduler;
use crate::services::layout::TimelineLayoutEngine;
use crate::services::playback_controller::{PlaybackState, StreamingPlaybackController};
use crate::services::pregeneration::{ChunkGenerator, PregenerationPipeline};
use anyhow::Context;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with EnvFilter, a file layer, and a stdout layer
///
/// `log_dir` defaults to the platform data directory under `chalkstream/logs`.
pub fn init_logging(log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .context("Could not determine data directory")?
            .join("chalkstream")
            .join("logs"),
    };
    fs::create_dir_all(&log_dir)?;

    let log_file = log_dir.join("engine.log");
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    let file_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .with(stdout_layer)
        .init();

    tracing::info!(
        event = "logging_initialized",
        log_file = ?log_file,
        "Logging system initialized"
    );

    Ok(())
}

/// The assembled playback engine
///
/// Owns every component and the cancellation tree. Shutdown runs in
/// dependency-reverse order: controller and adaptive tuning first, then
/// the scheduler, audio, buffering, and finally the generation pipeline.
pub struct LessonEngine {
    events: EventBus,
    coordinator: Arc<ChunkCoordinator>,
    buffer: Arc<ProgressiveBufferManager>,
    pipeline: Arc<PregenerationPipeline>,
    audio: Arc<ProgressiveAudioManager>,
    layout: Arc<TimelineLayoutEngine>,
    scheduler: Arc<TimelineEventScheduler>,
    controller: Arc<StreamingPlaybackController>,
    adaptive: Arc<AdaptiveBufferController>,
    audio_speed: f64,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl LessonEngine {
    /// Assemble an engine from its configuration and collaborators
    ///
    /// Returns the engine plus the instruction stream for the rendering
    /// surface.
    pub fn new(
        config: EngineConfig,
        generator: Arc<dyn ChunkGenerator>,
        tts: Arc<dyn TtsSynthesizer>,
        probe: Arc<dyn NetworkProbe>,
    ) -> (Arc<Self>, mpsc::Receiver<ExecutorInstruction>) {
        let events = EventBus::default();

        let coordinator = Arc::new(ChunkCoordinator::new(
            config.coordinator.clone(),
            events.clone(),
        ));
        let buffer = Arc::new(ProgressiveBufferManager::new(
            config.buffer.clone(),
            events.clone(),
        ));
        let pipeline = Arc::new(PregenerationPipeline::new(
            config.pregeneration.clone(),
            config.queue.clone(),
            generator,
            events.clone(),
        ));
        let audio = Arc::new(ProgressiveAudioManager::new(
            config.audio.clone(),
            tts,
            events.clone(),
        ));

        let (instruction_tx, instruction_rx) = mpsc::channel(256);
        let executor = Arc::new(EventExecutor::new(config.scheduler.clone(), instruction_tx));
        let scheduler = Arc::new(
            TimelineEventScheduler::new(
                config.scheduler.clone(),
                coordinator.clone() as Arc<dyn CoordinatorQuery>,
                executor,
            )
            .with_audio_source(audio.clone()),
        );

        let layout = Arc::new(TimelineLayoutEngine::new(
            config.layout.clone(),
            coordinator.clone() as Arc<dyn CoordinatorQuery>,
        ));

        let controller = Arc::new(StreamingPlaybackController::new(
            config.playback.clone(),
            buffer.clone() as Arc<dyn BufferReadiness>,
            coordinator.clone() as Arc<dyn CoordinatorQuery>,
            scheduler.clone(),
            Some(audio.clone()),
            events.clone(),
        ));

        let adaptive = Arc::new(AdaptiveBufferController::new(
            config.adaptive.clone(),
            config.buffer.clone(),
            buffer.clone(),
            probe,
            events.clone(),
        ));

        let engine = Arc::new(Self {
            events,
            coordinator,
            buffer,
            pipeline,
            audio,
            layout,
            scheduler,
            controller,
            adaptive,
            audio_speed: config.audio.speed,
            ingest_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        (engine, instruction_rx)
    }

    /// Start every component and the chunk ingest loop
    pub async fn start(self: &Arc<Self>) {
        self.scheduler.set_audio_speed(self.audio_speed).await;
        self.buffer.start().await;

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<TimelineChunk>(16);
        self.pipeline.start(chunk_tx).await;

        let engine = Arc::clone(self);
        let cancel = self.cancel.clone();
        *self.ingest_task.lock().await = Some(tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = chunk_rx.recv() => match received {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                if let Err(error) = engine.ingest_chunk(chunk).await {
                    tracing::warn!(event = "ingest_failed", error = %error, "Generated chunk rejected");
                }
            }
        }));

        self.scheduler.start().await;
        self.controller.start().await;

        let controller = self.controller.clone();
        self.adaptive
            .start(move || {
                let controller = controller.clone();
                async move { controller.behavior().await }
            })
            .await;

        tracing::info!(event = "engine_started", "Lesson engine started");
    }

    /// Ingest one chunk: index it, buffer it, and feed its narration to
    /// the audio manager
    pub async fn ingest_chunk(&self, chunk: TimelineChunk) -> Result<(), ChunkError> {
        let chunk_id = chunk.chunk_id.clone();
        self.coordinator.add_chunk(chunk).await?;

        // The coordinator holds the globalized version
        if let Some(globalized) = self.coordinator.chunk(&chunk_id).await {
            self.buffer.ingest_chunk(&globalized).await;

            let position = self.controller.position().await;
            for event in &globalized.events {
                self.audio.ingest_event(event, position).await;
            }
        }
        Ok(())
    }

    /// Record a TTS-measured duration; a significant deviation triggers
    /// the recalibration pass
    pub async fn report_audio_duration(&self, chunk_id: &str, measured_ms: u64) {
        if self.audio.report_measured_duration(chunk_id, measured_ms).await {
            self.audio.recalibrate().await;
        }
    }

    // User controls

    pub async fn play(&self) -> Result<(), crate::error::PlaybackError> {
        self.controller.play().await
    }

    pub async fn pause(&self) {
        self.controller.pause().await;
    }

    pub async fn resume(&self) -> Result<(), crate::error::PlaybackError> {
        self.controller.resume().await
    }

    pub async fn stop(&self) {
        self.controller.stop().await;
    }

    pub async fn seek(&self, position_ms: u64) -> Result<(), crate::error::PlaybackError> {
        self.controller.seek(position_ms).await
    }

    pub async fn set_speed(&self, speed: f64) -> Result<(), crate::error::PlaybackError> {
        self.controller.set_speed(speed).await
    }

    pub async fn set_volume(&self, volume: f64) {
        self.controller.set_volume(volume).await;
    }

    // Queries

    pub async fn playback_state(&self) -> PlaybackState {
        self.controller.playback_state().await
    }

    pub async fn position(&self) -> u64 {
        self.controller.position().await
    }

    pub async fn total_duration(&self) -> u64 {
        self.coordinator.total_duration().await
    }

    /// Canvas state at any timestamp
    pub async fn layout_at(&self, timestamp_ms: u64) -> LayoutSnapshot {
        self.layout.seek_to_timestamp(timestamp_ms).await
    }

    /// Producer-facing continuity hints for the next chunk
    pub async fn continuity_hints(&self) -> Vec<ContinuityHint> {
        self.coordinator.continuity_hints().await
    }

    /// Subscribe to the engine event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Component handles for advanced integration
    pub fn coordinator(&self) -> &Arc<ChunkCoordinator> {
        &self.coordinator
    }

    pub fn pipeline(&self) -> &Arc<PregenerationPipeline> {
        &self.pipeline
    }

    pub fn audio(&self) -> &Arc<ProgressiveAudioManager> {
        &self.audio
    }

    pub fn adaptive(&self) -> &Arc<AdaptiveBufferController> {
        &self.adaptive
    }

    /// Shut everything down in dependency-reverse order
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        self.adaptive.shutdown().await;
        self.scheduler.shutdown().await;
        self.audio.shutdown();
        self.audio.stop().await;
        self.buffer.shutdown().await;
        self.cancel.cancel();
        if let Some(task) = self.ingest_task.lock().await.take() {
            let _ = task.await;
        }
        self.pipeline.stop().await;
        tracing::info!(event = "engine_stopped", "Lesson engine stopped");
    }
}
