//! Event Executor
//!
//! Turns due timeline events into instructions for the downstream
//! collaborators: the element surface, the TTS pipeline, and the viewport.
//! Dispatch is exhaustive over the typed event content; there is no
//! untyped passthrough.
//!
//! Each execution is bounded by the scheduler's execution timeout. The
//! executor reports failures; retry policy lives in the scheduler.

use crate::config::SchedulerConfig;
use crate::error::ExecutionError;
use crate::models::timeline::{EventContent, TimelineEvent, VisualAction};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Narration dispatch payload for the TTS pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrationDispatch {
    /// Text to speak
    pub text: String,

    /// Optional SSML markup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssml: Option<String>,

    /// Requested voice
    pub voice: String,

    /// Effective speech rate: audio speed times playback speed
    pub speed: f64,

    /// Playback volume in `[0, 1]`
    pub volume: f64,

    /// Words or phrases to emphasize
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emphasis: Vec<String>,
}

/// Instruction emitted to a collaborator for one executed event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "camelCase")]
pub enum ExecutorInstruction {
    /// Element manipulation for the drawing surface
    #[serde(rename_all = "camelCase")]
    VisualExecuted {
        event_id: String,
        action: VisualAction,
        element_type: String,
        properties: serde_json::Value,
        /// Id of the element created, modified, or removed
        element_id: String,
    },

    /// TTS request plus an audio handle id
    #[serde(rename_all = "camelCase")]
    NarrationExecuted {
        event_id: String,
        audio_handle: String,
        request: NarrationDispatch,
    },

    /// Viewport change, duration already adjusted for playback speed
    #[serde(rename_all = "camelCase")]
    TransitionExecuted {
        event_id: String,
        transition_type: String,
        target: String,
        duration_ms: u64,
        easing: String,
    },

    /// Emphasis notification
    #[serde(rename_all = "camelCase")]
    EmphasisExecuted {
        event_id: String,
        payload: serde_json::Value,
    },

    /// Layout-change notification
    #[serde(rename_all = "camelCase")]
    LayoutChangeExecuted {
        event_id: String,
        payload: serde_json::Value,
    },
}

/// Execution context captured at dispatch time
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    /// Current playback speed multiplier
    pub playback_speed: f64,

    /// Current volume in `[0, 1]`
    pub volume: f64,

    /// Base audio speed multiplier
    pub audio_speed: f64,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            playback_speed: 1.0,
            volume: 1.0,
            audio_speed: 1.0,
        }
    }
}

/// Per-type event execution against the instruction channel
pub struct EventExecutor {
    config: SchedulerConfig,
    instructions: mpsc::Sender<ExecutorInstruction>,
}

impl EventExecutor {
    pub fn new(config: SchedulerConfig, instructions: mpsc::Sender<ExecutorInstruction>) -> Self {
        Self {
            config,
            instructions,
        }
    }

    /// Build the instruction for an event without sending it
    fn instruction_for(event: &TimelineEvent, ctx: &ExecutionContext) -> ExecutorInstruction {
        match &event.content {
            EventContent::Visual(visual) => ExecutorInstruction::VisualExecuted {
                event_id: event.id.clone(),
                action: visual.action,
                element_type: visual.element_type.clone(),
                properties: visual.properties.clone(),
                element_id: format!("el-{}", Uuid::new_v4()),
            },
            EventContent::Narration(narration) => ExecutorInstruction::NarrationExecuted {
                event_id: event.id.clone(),
                audio_handle: format!("audio-{}", Uuid::new_v4()),
                request: NarrationDispatch {
                    text: narration.text.clone(),
                    ssml: narration.ssml.clone(),
                    voice: narration
                        .voice
                        .clone()
                        .unwrap_or_else(|| "default".to_string()),
                    speed: ctx.audio_speed * ctx.playback_speed,
                    volume: ctx.volume,
                    emphasis: narration.emphasis.clone().unwrap_or_default(),
                },
            },
            EventContent::Transition(transition) => {
                let speed = ctx.playback_speed.max(f64::EPSILON);
                ExecutorInstruction::TransitionExecuted {
                    event_id: event.id.clone(),
                    transition_type: transition.transition_type.clone(),
                    target: transition.target.clone(),
                    duration_ms: (transition.duration as f64 / speed) as u64,
                    easing: transition.easing.clone(),
                }
            }
            EventContent::Emphasis(payload) => ExecutorInstruction::EmphasisExecuted {
                event_id: event.id.clone(),
                payload: payload.clone(),
            },
            EventContent::LayoutChange(payload) => ExecutorInstruction::LayoutChangeExecuted {
                event_id: event.id.clone(),
                payload: payload.clone(),
            },
        }
    }

    /// Execute one event: emit its instruction within the timeout budget
    pub async fn execute(
        &self,
        event: &TimelineEvent,
        ctx: &ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let instruction = Self::instruction_for(event, ctx);
        let budget = Duration::from_millis(self.config.execution_timeout_ms);

        debug!(
            event = "event_executing",
            event_id = %event.id,
            event_type = ?event.event_type(),
            "Executing timeline event"
        );

        match tokio::time::timeout(budget, self.instructions.send(instruction)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_closed)) => {
                warn!(event = "instruction_sink_closed", event_id = %event.id, "Instruction channel closed");
                Err(ExecutionError::Failed {
                    event_id: event.id.clone(),
                    message: "instruction channel closed".to_string(),
                })
            }
            Err(_elapsed) => Err(ExecutionError::Timeout {
                event_id: event.id.clone(),
                timeout_ms: self.config.execution_timeout_ms,
            }),
        }
    }
}
