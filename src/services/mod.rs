pub mod adaptive_buffer;
pub mod audio_manager;
pub mod buffer_manager;
pub mod chunk_coordinator;
pub mod chunk_store;
pub mod event_executor;
pub mod event_scheduler;
pub mod layout;
pub mod playback_controller;
pub mod pregeneration;
pub mod priority_queue;

pub use adaptive_buffer::{AdaptiveBufferController, AdaptiveBufferStrategy, NetworkProbe, NoopNetworkProbe};
pub use audio_manager::{ProgressiveAudioManager, TtsSynthesizer};
pub use buffer_manager::{BufferReadiness, ProgressiveBufferManager};
pub use chunk_coordinator::{ChunkCoordinator, CoordinatorQuery};
pub use chunk_store::{ChunkStore, InMemoryChunkStore};
pub use event_executor::{EventExecutor, ExecutorInstruction};
pub use event_scheduler::TimelineEventScheduler;
pub use layout::TimelineLayoutEngine;
pub use playback_controller::{PlaybackState, StreamingPlaybackController};
pub use pregeneration::{ChunkGenerator, PregenerationPipeline};
pub use priority_queue::{PriorityTaskQueue, TaskPriority};
