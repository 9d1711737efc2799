//! Streaming Playback Controller
//!
//! The playback state machine tying buffer readiness to user intent.
//! States: stopped, paused, playing, buffering, seeking, loading, error.
//! The `is_user_paused` flag is orthogonal and prevents auto-resume: a
//! buffer becoming ready never restarts playback the user paused.
//!
//! A monitor task subscribes to the engine bus and reacts to buffer
//! events: `playbackReady` resumes a buffering/loading session (and
//! completes a deferred seek), `bufferUrgent` auto-pauses into buffering
//! when underrun protection is on.

use crate::config::PlaybackConfig;
use crate::error::PlaybackError;
use crate::events::{BufferingReason, EngineEvent, EventBus};
use crate::services::audio_manager::ProgressiveAudioManager;
use crate::services::buffer_manager::BufferReadiness;
use crate::services::chunk_coordinator::CoordinatorQuery;
use crate::services::event_scheduler::TimelineEventScheduler;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Playback states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Paused,
    Playing,
    Buffering,
    Seeking,
    Loading,
    Error,
}

/// User-behavior snapshot feeding the adaptive controller
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBehavior {
    /// Seeks per minute over the recent window
    pub seek_frequency: f64,

    /// Pauses per minute over the recent window
    pub pause_frequency: f64,

    /// Fraction of the lesson reached, in `[0, 1]`
    pub completion_rate: f64,
}

struct ControllerState {
    state: PlaybackState,
    is_user_paused: bool,
    position: u64,
    /// State to restore once a blocked seek resolves
    pre_seek_intent: Option<PlaybackState>,
    /// Seek target still waiting on buffer
    pending_seek: Option<u64>,
    recent_seeks: VecDeque<Instant>,
    recent_pauses: VecDeque<Instant>,
}

/// User-facing playback surface and state machine
pub struct StreamingPlaybackController {
    config: PlaybackConfig,
    buffer: Arc<dyn BufferReadiness>,
    coordinator: Arc<dyn CoordinatorQuery>,
    scheduler: Arc<TimelineEventScheduler>,
    audio: Option<Arc<ProgressiveAudioManager>>,
    events: EventBus,
    state: Arc<Mutex<ControllerState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl StreamingPlaybackController {
    pub fn new(
        config: PlaybackConfig,
        buffer: Arc<dyn BufferReadiness>,
        coordinator: Arc<dyn CoordinatorQuery>,
        scheduler: Arc<TimelineEventScheduler>,
        audio: Option<Arc<ProgressiveAudioManager>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            buffer,
            coordinator,
            scheduler,
            audio,
            events,
            state: Arc::new(Mutex::new(ControllerState {
                state: PlaybackState::Stopped,
                is_user_paused: false,
                position: 0,
                pre_seek_intent: None,
                pending_seek: None,
                recent_seeks: VecDeque::new(),
                recent_pauses: VecDeque::new(),
            })),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    async fn transition(&self, to: PlaybackState) {
        let from = {
            let mut state = self.state.lock().await;
            let from = state.state;
            if from == to {
                return;
            }
            state.state = to;
            from
        };
        debug!(event = "playback_state_changed", from = ?from, to = ?to, "State transition");
        self.events.emit(EngineEvent::StateChanged { from, to });
    }

    /// Current playback state
    pub async fn playback_state(&self) -> PlaybackState {
        self.state.lock().await.state
    }

    /// Current playback position in milliseconds
    pub async fn position(&self) -> u64 {
        self.state.lock().await.position
    }

    /// Whether the user explicitly paused
    pub async fn is_user_paused(&self) -> bool {
        self.state.lock().await.is_user_paused
    }

    /// Start playback from the current position
    ///
    /// Goes straight to `Playing` when the buffer is ready; otherwise
    /// enters `Buffering` and lets the monitor task resume on readiness.
    pub async fn play(&self) -> Result<(), PlaybackError> {
        let position = {
            let mut state = self.state.lock().await;
            state.is_user_paused = false;
            state.position
        };

        if self.buffer.is_ready(position).await {
            self.begin_playing(position).await;
            Ok(())
        } else {
            info!(event = "playback_waiting_on_buffer", position = position, "Buffering before start");
            self.transition(PlaybackState::Buffering).await;
            self.events.emit(EngineEvent::BufferingStarted {
                reason: BufferingReason::Startup,
            });
            self.schedule_buffer_timeout(position);
            Ok(())
        }
    }

    async fn begin_playing(&self, position: u64) {
        self.scheduler.play(position).await;
        if let Some(audio) = &self.audio {
            if let Err(error) = audio.play(position).await {
                warn!(event = "audio_start_failed", error = %error, "Audio start failed; continuing without it");
            }
        }
        self.events.emit(EngineEvent::ReadyToPlay { position });
        self.transition(PlaybackState::Playing).await;
    }

    /// Escalate to `Loading` if buffering outlasts the wait budget
    fn schedule_buffer_timeout(&self, position: u64) {
        let controller_state = Arc::clone(&self.state);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let wait = Duration::from_millis(self.config.max_buffer_wait_ms);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let mut state = controller_state.lock().await;
                    if state.state == PlaybackState::Buffering {
                        let from = state.state;
                        state.state = PlaybackState::Loading;
                        drop(state);
                        warn!(event = "buffer_wait_timeout", position = position, "Buffer wait exceeded budget");
                        events.emit(EngineEvent::StateChanged {
                            from,
                            to: PlaybackState::Loading,
                        });
                    }
                }
            }
        });
    }

    /// Pause playback on explicit user intent
    pub async fn pause(&self) {
        {
            let mut state = self.state.lock().await;
            state.is_user_paused = true;
            state.recent_pauses.push_back(Instant::now());
        }
        self.scheduler.pause().await;
        if let Some(audio) = &self.audio {
            audio.pause().await;
        }
        self.transition(PlaybackState::Paused).await;
    }

    /// Resume after a user pause
    pub async fn resume(&self) -> Result<(), PlaybackError> {
        let position = self.scheduler.current_position().await;
        {
            let mut state = self.state.lock().await;
            state.is_user_paused = false;
            state.position = position;
        }
        self.play().await
    }

    /// Stop playback and reset the position
    pub async fn stop(&self) {
        self.scheduler.pause().await;
        if let Some(audio) = &self.audio {
            audio.stop().await;
        }
        {
            let mut state = self.state.lock().await;
            state.position = 0;
            state.is_user_paused = false;
            state.pending_seek = None;
        }
        self.transition(PlaybackState::Stopped).await;
    }

    /// Seek to `target` milliseconds
    ///
    /// Immediate when the next second of content is buffered; otherwise
    /// blocks into `Buffering` and completes when the range arrives or the
    /// wait budget escalates to `Loading`.
    pub async fn seek(&self, target: u64) -> Result<(), PlaybackError> {
        let total = self.coordinator.total_duration().await;
        if total > 0 && target > total {
            return Err(PlaybackError::SeekOutOfRange { target, total });
        }

        let (from_position, _prior_state) = {
            let mut state = self.state.lock().await;
            state.recent_seeks.push_back(Instant::now());
            let prior = state.state;
            if !matches!(prior, PlaybackState::Seeking) {
                state.pre_seek_intent = Some(prior);
            }
            (state.position, prior)
        };

        info!(event = "seek_requested", from = from_position, to = target, "Seek");
        self.events.emit(EngineEvent::SeekStarted {
            from: from_position,
            to: target,
        });
        self.transition(PlaybackState::Seeking).await;

        if self.buffer.is_buffered(target, target + 1000).await {
            self.complete_seek(target, true).await;
            return Ok(());
        }

        // Unbuffered target: report, request urgent load, wait
        self.buffer.request_seek(target).await;
        self.buffer.set_playback_position(target).await;
        {
            let mut state = self.state.lock().await;
            state.pending_seek = Some(target);
            state.position = target;
        }
        self.transition(PlaybackState::Buffering).await;
        self.events.emit(EngineEvent::BufferingStarted {
            reason: BufferingReason::Seek,
        });
        self.schedule_buffer_timeout(target);
        Ok(())
    }

    /// Finish a seek: align every component to the target and restore the
    /// pre-seek intent
    async fn complete_seek(&self, target: u64, was_immediate: bool) {
        self.scheduler.seek(target).await;
        self.buffer.set_playback_position(target).await;

        let intent = {
            let mut state = self.state.lock().await;
            state.position = target;
            state.pending_seek = None;
            state.pre_seek_intent.take()
        };

        let resume_playing = matches!(intent, Some(PlaybackState::Playing))
            && !self.state.lock().await.is_user_paused;

        if resume_playing {
            self.begin_playing(target).await;
        } else {
            self.scheduler.pause().await;
            if let Some(audio) = &self.audio {
                audio.pause().await;
            }
            self.transition(PlaybackState::Paused).await;
        }

        self.events.emit(EngineEvent::SeekCompleted {
            position: target,
            was_immediate,
        });
    }

    /// Change playback speed
    pub async fn set_speed(&self, speed: f64) -> Result<(), PlaybackError> {
        self.scheduler.set_speed(speed).await
    }

    /// Change volume
    pub async fn set_volume(&self, volume: f64) {
        self.scheduler.set_volume(volume).await;
        if let Some(audio) = &self.audio {
            audio.set_volume(volume).await;
        }
    }

    /// Behavior snapshot over the trailing minute
    pub async fn behavior(&self) -> UserBehavior {
        let total = self.coordinator.total_duration().await;
        let mut state = self.state.lock().await;
        if let Some(cutoff) = Instant::now().checked_sub(Duration::from_secs(60)) {
            while state.recent_seeks.front().is_some_and(|&t| t < cutoff) {
                state.recent_seeks.pop_front();
            }
            while state.recent_pauses.front().is_some_and(|&t| t < cutoff) {
                state.recent_pauses.pop_front();
            }
        }

        UserBehavior {
            seek_frequency: state.recent_seeks.len() as f64,
            pause_frequency: state.recent_pauses.len() as f64,
            completion_rate: if total > 0 {
                (state.position as f64 / total as f64).min(1.0)
            } else {
                0.0
            },
        }
    }

    /// Spawn the position timer and the buffer-event monitor
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.spawn_position_timer());
        tasks.push(self.spawn_monitor());
    }

    /// Stop all controller tasks
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Periodic position advance: observe the scheduler clock, inform the
    /// buffer manager first, then emit `positionChanged`
    fn spawn_position_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_millis(self.config.position_interval_ms);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if controller.playback_state().await != PlaybackState::Playing {
                    continue;
                }

                let position = controller.scheduler.current_position().await;
                {
                    let mut state = controller.state.lock().await;
                    state.position = position;
                }

                // Buffer sees the position before anyone hears about it
                controller.buffer.set_playback_position(position).await;
                let buffer_level = controller.buffer.buffer_level(position).await;
                controller.events.emit(EngineEvent::PositionChanged {
                    position,
                    buffer_level,
                });

                let total = controller.coordinator.total_duration().await;
                if total > 0 && position >= total {
                    info!(event = "lesson_finished", position = position, "End of lesson reached");
                    controller.stop().await;
                }
            }
        })
    }

    /// React to buffer readiness and urgency from the engine bus
    fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let cancel = self.cancel.clone();
        let mut rx = self.events.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_closed) => break,
                    },
                };

                match event {
                    EngineEvent::PlaybackReady { .. } => {
                        controller.on_playback_ready().await;
                    }
                    EngineEvent::BufferUrgent { position, .. } => {
                        controller.on_buffer_urgent(position).await;
                    }
                    _ => {}
                }
            }
        })
    }

    async fn on_playback_ready(&self) {
        let (current, user_paused, pending_seek) = {
            let state = self.state.lock().await;
            (state.state, state.is_user_paused, state.pending_seek)
        };

        if let Some(target) = pending_seek {
            if self.buffer.is_ready(target).await {
                self.complete_seek(target, false).await;
                self.events.emit(EngineEvent::BufferingEnded);
            }
            return;
        }

        if matches!(current, PlaybackState::Buffering | PlaybackState::Loading) && !user_paused {
            let position = self.position().await;
            if self.buffer.is_ready(position).await {
                self.events.emit(EngineEvent::BufferingEnded);
                self.begin_playing(position).await;
            }
        }
    }

    async fn on_buffer_urgent(&self, position: u64) {
        if !self.config.auto_pause_on_underrun {
            return;
        }
        if self.playback_state().await != PlaybackState::Playing {
            return;
        }

        warn!(event = "underrun_auto_pause", position = position, "Buffer underrun; pausing into buffering");
        self.scheduler.pause().await;
        if let Some(audio) = &self.audio {
            audio.pause().await;
        }
        self.transition(PlaybackState::Buffering).await;
        self.events.emit(EngineEvent::BufferingStarted {
            reason: BufferingReason::Underrun,
        });
        self.schedule_buffer_timeout(position);
    }
}
