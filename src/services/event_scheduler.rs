//! Timeline Event Scheduler
//!
//! Drives a monotonic virtual clock and dispatches timeline events to the
//! executor at the right moment. Events enter tracking when they fall into
//! the lookahead window; they fire when the clock passes their timestamp
//! (minus a small visual-compensation offset), their dependencies are
//! complete, and the concurrency cap has room.
//!
//! A seek cancels everything in flight, recomputes the events active at
//! the target, and executes the critical/high ones synchronously before
//! playback resumes. Cancelled or completed events never execute again.

use crate::config::SchedulerConfig;
use crate::error::PlaybackError;
use crate::models::timeline::{EventType, TimelineEvent};
use crate::services::chunk_coordinator::CoordinatorQuery;
use crate::services::event_executor::{EventExecutor, ExecutionContext};
use crate::services::priority_queue::TaskPriority;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a tracked event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledEventState {
    Pending,
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

impl ScheduledEventState {
    /// Whether the event can never execute again
    pub fn is_terminal(self) -> bool {
        matches!(self, ScheduledEventState::Completed | ScheduledEventState::Cancelled)
    }
}

/// A timeline event under scheduler tracking
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub event: TimelineEvent,
    pub state: ScheduledEventState,

    /// When the event should fire, in global milliseconds
    pub scheduled_time: u64,

    pub priority: TaskPriority,
    pub retry_count: u32,

    /// Backoff gate after a failed execution
    pub not_before: Option<Instant>,

    pub execution_started: Option<Instant>,
    pub execution_ended: Option<Instant>,
}

/// Default dispatch priorities by event type
pub fn default_priority(event_type: EventType) -> TaskPriority {
    match event_type {
        EventType::Transition => TaskPriority::Critical,
        EventType::Visual => TaskPriority::High,
        EventType::Narration | EventType::Emphasis => TaskPriority::Normal,
        EventType::LayoutChange => TaskPriority::Low,
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub tracked: usize,
    pub active: usize,
    pub completed: u64,
    pub cancelled: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
}

/// The virtual playback clock
///
/// `position = start_position + (now − real_start) · speed` while playing.
struct PlaybackClock {
    start_position: f64,
    real_start: Option<Instant>,
    speed: f64,
}

impl PlaybackClock {
    fn new() -> Self {
        Self {
            start_position: 0.0,
            real_start: None,
            speed: 1.0,
        }
    }

    fn position(&self) -> u64 {
        match self.real_start {
            Some(anchor) => {
                (self.start_position + anchor.elapsed().as_secs_f64() * 1000.0 * self.speed) as u64
            }
            None => self.start_position as u64,
        }
    }

    fn play_from(&mut self, position: u64) {
        self.start_position = position as f64;
        self.real_start = Some(Instant::now());
    }

    fn pause(&mut self) {
        self.start_position = self.position() as f64;
        self.real_start = None;
    }

    fn is_playing(&self) -> bool {
        self.real_start.is_some()
    }

    /// Change speed while preserving the current position
    fn set_speed(&mut self, speed: f64) {
        let position = self.position() as f64;
        self.start_position = position;
        if self.real_start.is_some() {
            self.real_start = Some(Instant::now());
        }
        self.speed = speed;
    }
}

struct SchedulerState {
    clock: PlaybackClock,
    tracked: HashMap<String, ScheduledEvent>,
    completed_ids: HashSet<String>,
    stats: SchedulerStats,
    execution_ctx: ExecutionContext,
}

/// Frame-accurate event dispatch within a lookahead window
pub struct TimelineEventScheduler {
    config: SchedulerConfig,
    coordinator: Arc<dyn CoordinatorQuery>,
    executor: Arc<EventExecutor>,
    /// Audio position source for audio-driven clock alignment
    audio_position: Option<Arc<dyn AudioPositionSource>>,
    state: Arc<Mutex<SchedulerState>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// Position source used when the clock is audio-driven
#[async_trait::async_trait]
pub trait AudioPositionSource: Send + Sync {
    async fn audio_position(&self) -> u64;
}

impl TimelineEventScheduler {
    pub fn new(
        config: SchedulerConfig,
        coordinator: Arc<dyn CoordinatorQuery>,
        executor: Arc<EventExecutor>,
    ) -> Self {
        Self {
            config,
            coordinator,
            executor,
            audio_position: None,
            state: Arc::new(Mutex::new(SchedulerState {
                clock: PlaybackClock::new(),
                tracked: HashMap::new(),
                completed_ids: HashSet::new(),
                stats: SchedulerStats::default(),
                execution_ctx: ExecutionContext::default(),
            })),
            tick_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach an audio position source for audio-driven alignment
    pub fn with_audio_source(mut self, source: Arc<dyn AudioPositionSource>) -> Self {
        self.audio_position = Some(source);
        self
    }

    /// Current virtual position in milliseconds
    pub async fn current_position(&self) -> u64 {
        if self.config.audio_driven {
            if let Some(source) = &self.audio_position {
                return source.audio_position().await;
            }
        }
        self.state.lock().await.clock.position()
    }

    /// Begin advancing the clock from `position`
    pub async fn play(&self, position: u64) {
        let mut state = self.state.lock().await;
        state.clock.play_from(position);
        info!(event = "scheduler_playing", position = position, "Scheduler clock running");
    }

    /// Freeze the clock
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        state.clock.pause();
        debug!(event = "scheduler_paused", position = state.clock.position(), "Scheduler clock paused");
    }

    /// Whether the clock is advancing
    pub async fn is_playing(&self) -> bool {
        self.state.lock().await.clock.is_playing()
    }

    /// Change playback speed, preserving the current position
    pub async fn set_speed(&self, speed: f64) -> Result<(), PlaybackError> {
        if !(speed > 0.0 && speed <= 4.0) {
            return Err(PlaybackError::InvalidSpeed(speed));
        }
        let mut state = self.state.lock().await;
        state.clock.set_speed(speed);
        state.execution_ctx.playback_speed = speed;
        Ok(())
    }

    /// Update the volume forwarded to narration dispatches
    pub async fn set_volume(&self, volume: f64) {
        self.state.lock().await.execution_ctx.volume = volume.clamp(0.0, 1.0);
    }

    /// Set the base audio speed multiplied into narration dispatches
    pub async fn set_audio_speed(&self, speed: f64) {
        self.state.lock().await.execution_ctx.audio_speed = speed;
    }

    /// Spawn the periodic tick loop at the render cadence
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.tick_task.lock().await;
        if task.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_millis(self.config.tick_interval_ms.max(1));
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        scheduler.tick().await;
                    }
                }
            }
        }));
    }

    /// Stop the tick loop and cancel everything in flight
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.tick_task.lock().await.take() {
            let _ = task.await;
        }
        let mut state = self.state.lock().await;
        Self::cancel_all(&mut state);
    }

    /// One scheduler pass: enqueue the lookahead window, then dispatch due
    /// events in priority order
    pub async fn tick(&self) {
        let position = self.current_position().await;
        let mut state = self.state.lock().await;
        if !state.clock.is_playing() && !self.config.audio_driven {
            return;
        }

        self.enqueue_window(&mut state, position).await;
        self.dispatch_due(&mut state, position).await;
    }

    /// Track every untracked event in `[position, position + lookahead)`
    async fn enqueue_window(&self, state: &mut SchedulerState, position: u64) {
        let window_end = position + self.config.lookahead_ms;
        let events = self.coordinator.events_in_range(position, window_end).await;

        for event in events {
            if event.timestamp < position || event.timestamp >= window_end {
                continue;
            }
            if state.tracked.contains_key(&event.id) || state.completed_ids.contains(&event.id) {
                continue;
            }

            let priority = default_priority(event.event_type());
            debug!(
                event = "event_tracked",
                event_id = %event.id,
                timestamp = event.timestamp,
                priority = ?priority,
                "Event entered lookahead window"
            );
            state.tracked.insert(
                event.id.clone(),
                ScheduledEvent {
                    scheduled_time: event.timestamp,
                    event,
                    state: ScheduledEventState::Scheduled,
                    priority,
                    retry_count: 0,
                    not_before: None,
                    execution_started: None,
                    execution_ended: None,
                },
            );
            state.stats.tracked = state.tracked.len();
        }
    }

    /// Dispatch events whose time has come, priority first
    async fn dispatch_due(&self, state: &mut SchedulerState, position: u64) {
        let now = Instant::now();
        let fire_line = position + self.config.visual_compensation_ms;

        let mut due: Vec<String> = state
            .tracked
            .values()
            .filter(|s| s.state == ScheduledEventState::Scheduled)
            .filter(|s| s.scheduled_time <= fire_line)
            .filter(|s| s.not_before.is_none_or(|t| t <= now))
            .filter(|s| {
                s.event
                    .dependencies
                    .iter()
                    .all(|dep| state.completed_ids.contains(dep))
            })
            .map(|s| s.event.id.clone())
            .collect();

        due.sort_by(|a, b| {
            let sa = &state.tracked[a];
            let sb = &state.tracked[b];
            sb.priority
                .cmp(&sa.priority)
                .then(sa.scheduled_time.cmp(&sb.scheduled_time))
        });

        for id in due {
            let active = state
                .tracked
                .values()
                .filter(|s| s.state == ScheduledEventState::Active)
                .count();
            if active >= self.config.max_concurrent_events {
                break;
            }

            if let Some(scheduled) = state.tracked.get(&id) {
                let lateness = position.saturating_sub(scheduled.scheduled_time);
                if lateness > self.config.sync_tolerance_ms {
                    warn!(
                        event = "event_dispatch_late",
                        event_id = %id,
                        lateness_ms = lateness,
                        "Event fired outside the sync tolerance"
                    );
                }
            }
            self.execute_tracked(state, &id).await;
        }
    }

    /// Execute one tracked event and settle its outcome
    async fn execute_tracked(&self, state: &mut SchedulerState, id: &str) {
        let ctx = state.execution_ctx;
        let event = {
            let Some(scheduled) = state.tracked.get_mut(id) else {
                return;
            };
            if scheduled.state.is_terminal() {
                return;
            }
            scheduled.state = ScheduledEventState::Active;
            scheduled.execution_started = Some(Instant::now());
            scheduled.event.clone()
        };
        state.stats.active = state
            .tracked
            .values()
            .filter(|s| s.state == ScheduledEventState::Active)
            .count();

        let result = self.executor.execute(&event, &ctx).await;

        let Some(scheduled) = state.tracked.get_mut(id) else {
            return;
        };
        scheduled.execution_ended = Some(Instant::now());

        match result {
            Ok(()) => {
                // A cancellation that raced the execution wins; cancelled
                // events never report completion
                if scheduled.state == ScheduledEventState::Cancelled {
                    return;
                }
                scheduled.state = ScheduledEventState::Completed;
                state.completed_ids.insert(id.to_string());
                state.stats.completed += 1;
                state.tracked.remove(id);
                state.stats.tracked = state.tracked.len();
            }
            Err(error) => {
                state.stats.failed_attempts += 1;
                if scheduled.retry_count >= self.config.max_retries {
                    warn!(
                        event = "event_dropped",
                        event_id = %id,
                        error = %error,
                        retries = scheduled.retry_count,
                        "Event exhausted retries"
                    );
                    scheduled.state = ScheduledEventState::Cancelled;
                    state.stats.dropped += 1;
                    state.stats.cancelled += 1;
                    state.tracked.remove(id);
                    state.stats.tracked = state.tracked.len();
                } else {
                    let backoff_ms = 100u64 * (1 << scheduled.retry_count.min(10));
                    scheduled.retry_count += 1;
                    scheduled.state = ScheduledEventState::Scheduled;
                    scheduled.not_before = Some(Instant::now() + Duration::from_millis(backoff_ms));
                    debug!(
                        event = "event_retry_scheduled",
                        event_id = %id,
                        retry_count = scheduled.retry_count,
                        backoff_ms = backoff_ms,
                        "Event execution will retry"
                    );
                }
            }
        }
    }

    fn cancel_all(state: &mut SchedulerState) {
        for scheduled in state.tracked.values_mut() {
            if !scheduled.state.is_terminal() {
                scheduled.state = ScheduledEventState::Cancelled;
                state.stats.cancelled += 1;
            }
        }
        state.tracked.clear();
        state.stats.tracked = 0;
        state.stats.active = 0;
    }

    /// Seek: cancel all in-flight events, then synchronously execute the
    /// critical/high events active at the target before playback resumes
    pub async fn seek(&self, position: u64) {
        let started = Instant::now();
        let was_playing;
        {
            let mut state = self.state.lock().await;
            was_playing = state.clock.is_playing();
            Self::cancel_all(&mut state);
            state.clock.pause();
            state.clock.start_position = position as f64;
        }

        let mut active = self.coordinator.events_at_time(position).await;
        active.sort_by(|a, b| {
            default_priority(b.event_type())
                .cmp(&default_priority(a.event_type()))
                .then(a.timestamp.cmp(&b.timestamp))
        });
        {
            let mut state = self.state.lock().await;
            for event in active {
                let priority = default_priority(event.event_type());
                let id = event.id.clone();
                state.tracked.insert(
                    id.clone(),
                    ScheduledEvent {
                        scheduled_time: event.timestamp,
                        event,
                        state: ScheduledEventState::Scheduled,
                        priority,
                        retry_count: 0,
                        not_before: None,
                        execution_started: None,
                        execution_ended: None,
                    },
                );
                if priority >= TaskPriority::High {
                    self.execute_tracked(&mut state, &id).await;
                }
            }
            state.stats.tracked = state.tracked.len();

            if was_playing {
                state.clock.play_from(position);
            }
        }

        info!(
            event = "scheduler_seeked",
            position = position,
            seek_ms = started.elapsed().as_millis() as u64,
            "Scheduler seek complete"
        );
    }

    /// Current statistics
    pub async fn stats(&self) -> SchedulerStats {
        self.state.lock().await.stats.clone()
    }

    /// States of currently tracked events, for inspection
    pub async fn tracked_states(&self) -> HashMap<String, ScheduledEventState> {
        self.state
            .lock()
            .await
            .tracked
            .iter()
            .map(|(id, s)| (id.clone(), s.state))
            .collect()
    }
}
