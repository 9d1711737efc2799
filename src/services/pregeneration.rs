//! Pre-generation Pipeline
//!
//! Predicts which chunks playback will need next and schedules their
//! production on a fixed worker pool, ordered by the priority task queue.
//! Completed chunks land in an LRU cache and are forwarded to the chunk
//! sink (normally the coordinator's ingest channel).
//!
//! Stopping the pipeline frees all workers immediately; in-flight
//! generations are abandoned and their late completions dropped.

use crate::config::PregenerationConfig;
use crate::error::GenerationError;
use crate::events::{EngineEvent, EventBus};
use crate::models::timeline::TimelineChunk;
use crate::services::priority_queue::{PriorityTaskQueue, QueuedTask, TaskPriority};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer-facing generation priority, derived from playback context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationPriority {
    Background,
    Low,
    Medium,
    High,
    Immediate,
}

impl GenerationPriority {
    /// Queue band for this priority
    pub fn task_priority(self) -> TaskPriority {
        match self {
            GenerationPriority::Immediate => TaskPriority::Critical,
            GenerationPriority::High => TaskPriority::High,
            GenerationPriority::Medium => TaskPriority::Normal,
            GenerationPriority::Low => TaskPriority::Low,
            GenerationPriority::Background => TaskPriority::Idle,
        }
    }

    /// Deadline budget for this priority; unbounded below `High`
    pub fn deadline(self) -> Option<Duration> {
        match self {
            GenerationPriority::Immediate => Some(Duration::from_secs(5)),
            GenerationPriority::High => Some(Duration::from_secs(15)),
            _ => None,
        }
    }
}

/// A request for one chunk's production
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Chunk to produce
    pub chunk_id: String,

    /// 1-based chunk position in the lesson
    pub chunk_number: u32,

    /// Lesson topic handed to the generator
    pub topic: String,

    /// Producer configuration passthrough
    pub config: serde_json::Value,

    /// Scheduling priority
    pub priority: GenerationPriority,

    /// Chunk ids that must exist before this one generates
    pub dependencies: Vec<String>,

    /// Expected chunk length in milliseconds
    pub estimated_duration: u64,

    /// Playback position when the request was made, in milliseconds
    pub user_position: u64,
}

/// Playback context feeding prediction
#[derive(Debug, Clone, Copy)]
pub struct PlaybackContext {
    /// Current playback position in milliseconds
    pub position: u64,

    /// Current playback speed multiplier
    pub speed: f64,

    /// Seeks per minute over the recent window
    pub seek_frequency: f64,
}

/// One entry of the lesson's chunk plan, used for prediction
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub chunk_id: String,
    pub chunk_number: u32,
    pub start_time_offset: u64,
    pub estimated_duration: u64,
    pub topic: String,
}

/// Produces chunks on demand
///
/// Returning `Ok(None)` counts as a failure and is retried like an error.
#[async_trait]
pub trait ChunkGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
        -> anyhow::Result<Option<TimelineChunk>>;
}

/// Pipeline statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    /// Chunks generated successfully
    pub generated_count: u64,

    /// Terminal generation failures
    pub failed_count: u64,

    /// Requests collapsed onto an existing cache or queue entry
    pub collapsed_count: u64,

    /// Chunks currently cached
    pub cached_count: usize,

    /// Workers currently generating
    pub busy_workers: usize,
}

struct ChunkCache {
    chunks: HashMap<String, TimelineChunk>,
    lru: VecDeque<String>,
    max_size: usize,
}

impl ChunkCache {
    fn insert(&mut self, chunk: TimelineChunk) {
        let id = chunk.chunk_id.clone();
        if self.chunks.insert(id.clone(), chunk).is_none() {
            self.lru.push_back(id);
        } else if let Some(pos) = self.lru.iter().position(|c| c == &id) {
            self.lru.remove(pos);
            self.lru.push_back(id);
        }

        while self.chunks.len() > self.max_size {
            if let Some(oldest) = self.lru.pop_front() {
                self.chunks.remove(&oldest);
                debug!(event = "pregen_cache_evicted", chunk_id = %oldest, "Cached chunk evicted");
            } else {
                break;
            }
        }
    }

    fn get(&mut self, id: &str) -> Option<TimelineChunk> {
        let chunk = self.chunks.get(id).cloned()?;
        if let Some(pos) = self.lru.iter().position(|c| c == id) {
            self.lru.remove(pos);
            self.lru.push_back(id.to_string());
        }
        Some(chunk)
    }
}

/// Predictive chunk production pipeline
pub struct PregenerationPipeline {
    config: PregenerationConfig,
    queue: Arc<PriorityTaskQueue<GenerationRequest>>,
    generator: Arc<dyn ChunkGenerator>,
    cache: Arc<Mutex<ChunkCache>>,
    busy_workers: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    events: EventBus,
    generated_count: Arc<AtomicUsize>,
    failed_count: Arc<AtomicUsize>,
    collapsed_count: AtomicUsize,
}

impl PregenerationPipeline {
    pub fn new(
        config: PregenerationConfig,
        queue_config: crate::config::QueueConfig,
        generator: Arc<dyn ChunkGenerator>,
        events: EventBus,
    ) -> Self {
        let max_cache = config.max_cache_size;
        Self {
            config,
            queue: Arc::new(PriorityTaskQueue::new(queue_config)),
            generator,
            cache: Arc::new(Mutex::new(ChunkCache {
                chunks: HashMap::new(),
                lru: VecDeque::new(),
                max_size: max_cache,
            })),
            busy_workers: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            events,
            generated_count: Arc::new(AtomicUsize::new(0)),
            failed_count: Arc::new(AtomicUsize::new(0)),
            collapsed_count: AtomicUsize::new(0),
        }
    }

    /// Derive a generation priority from how far ahead of playback a chunk
    /// starts
    pub fn priority_for_offset(&self, start_offset: u64, ctx: &PlaybackContext) -> GenerationPriority {
        let distance = start_offset.saturating_sub(ctx.position);
        if distance <= 5000 {
            GenerationPriority::Immediate
        } else if distance <= 15_000 {
            GenerationPriority::High
        } else if distance <= self.config.lookahead_distance_ms {
            GenerationPriority::Medium
        } else if distance <= self.config.lookahead_distance_ms * 2 {
            GenerationPriority::Low
        } else {
            GenerationPriority::Background
        }
    }

    /// Request a chunk, collapsing duplicates
    ///
    /// A request already satisfied by the cache is dropped; a request
    /// already queued is promoted when the new priority is higher.
    pub async fn request_chunk(&self, request: GenerationRequest) -> anyhow::Result<bool> {
        if self.cache.lock().await.chunks.contains_key(&request.chunk_id) {
            self.collapsed_count.fetch_add(1, Ordering::Relaxed);
            debug!(event = "pregen_request_collapsed", chunk_id = %request.chunk_id, "Chunk already cached");
            return Ok(false);
        }

        if self.queue.contains(&request.chunk_id).await {
            self.collapsed_count.fetch_add(1, Ordering::Relaxed);
            let promoted = self
                .queue
                .promote(&request.chunk_id, request.priority.task_priority())
                .await;
            debug!(
                event = "pregen_request_collapsed",
                chunk_id = %request.chunk_id,
                promoted = promoted,
                "Chunk already queued"
            );
            return Ok(false);
        }

        let mut task = QueuedTask::new(
            request.chunk_id.clone(),
            request.clone(),
            request.priority.task_priority(),
        )
        .with_dependencies(request.dependencies.clone())
        .with_max_retries(self.config.max_retries)
        .with_timeout_ms(self.config.generation_timeout_ms);

        if let Some(deadline) = request.priority.deadline() {
            task = task.with_deadline_in(deadline);
        }

        self.queue.enqueue(task).await?;
        Ok(true)
    }

    /// Predict the next chunks to produce from the lesson plan
    ///
    /// Selects up to `prediction_count` unproduced chunks whose start falls
    /// within `lookahead_distance · speed_factor` of the playback position.
    /// Frequent seeking widens the selection by one chunk, since the user
    /// is likely to land somewhere unbuffered.
    pub async fn predict(
        &self,
        plan: &[PlannedChunk],
        ctx: &PlaybackContext,
        available: &HashSet<String>,
    ) -> Vec<GenerationRequest> {
        let speed_factor = ctx.speed.max(0.5);
        let window = (self.config.lookahead_distance_ms as f64 * speed_factor) as u64;
        let horizon = ctx.position.saturating_add(window);

        let mut count = self.config.prediction_count;
        if ctx.seek_frequency > 2.0 {
            count += 1;
        }

        let mut requests = Vec::new();
        let mut ordered: Vec<&PlannedChunk> = plan.iter().collect();
        ordered.sort_by_key(|p| p.chunk_number);

        for planned in ordered {
            if requests.len() >= count {
                break;
            }
            let end = planned.start_time_offset + planned.estimated_duration;
            if end < ctx.position || planned.start_time_offset > horizon {
                continue;
            }
            if available.contains(&planned.chunk_id) {
                continue;
            }
            if self.cache.lock().await.chunks.contains_key(&planned.chunk_id) {
                continue;
            }

            let priority = self.priority_for_offset(planned.start_time_offset, ctx);
            requests.push(GenerationRequest {
                chunk_id: planned.chunk_id.clone(),
                chunk_number: planned.chunk_number,
                topic: planned.topic.clone(),
                config: serde_json::Value::Null,
                priority,
                dependencies: Vec::new(),
                estimated_duration: planned.estimated_duration,
                user_position: ctx.position,
            });
        }

        requests
    }

    /// Predict and enqueue in one pass; returns how many requests were
    /// actually enqueued after duplicate collapse
    pub async fn predict_and_schedule(
        &self,
        plan: &[PlannedChunk],
        ctx: &PlaybackContext,
        available: &HashSet<String>,
    ) -> anyhow::Result<usize> {
        let mut scheduled = 0;
        for request in self.predict(plan, ctx, available).await {
            if self.request_chunk(request).await? {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Spawn the worker pool
    ///
    /// Completed chunks are cached and forwarded to `chunk_tx`.
    pub async fn start(&self, chunk_tx: mpsc::Sender<TimelineChunk>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }

        info!(
            event = "pregen_started",
            worker_count = self.config.worker_count,
            "Pre-generation pipeline started"
        );

        for worker_id in 0..self.config.worker_count {
            workers.push(self.spawn_worker(worker_id, chunk_tx.clone()));
        }
    }

    fn spawn_worker(&self, worker_id: usize, chunk_tx: mpsc::Sender<TimelineChunk>) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let generator = Arc::clone(&self.generator);
        let busy = Arc::clone(&self.busy_workers);
        let generated = Arc::clone(&self.generated_count);
        let failed = Arc::clone(&self.failed_count);
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        let worker_count = self.config.worker_count;
        let busy_threshold = self.config.busy_threshold;
        let timeout = Duration::from_millis(self.config.generation_timeout_ms);
        let cache = Arc::clone(&self.cache);

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                // Resource throttle: leave headroom when most workers are busy
                let busy_fraction = busy.load(Ordering::SeqCst) as f64 / worker_count as f64;
                if busy_fraction >= busy_threshold {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                    }
                }

                let Some(task) = queue.take_next_ready().await else {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(25)) => continue,
                    }
                };

                busy.fetch_add(1, Ordering::SeqCst);
                let request = task.payload.clone();
                debug!(
                    event = "pregen_dispatch",
                    worker_id = worker_id,
                    chunk_id = %request.chunk_id,
                    retry_count = task.retry_count,
                    "Generating chunk"
                );

                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        // Abandoned: the eventual completion is dropped
                        busy.fetch_sub(1, Ordering::SeqCst);
                        break;
                    }
                    result = tokio::time::timeout(timeout, generator.generate(&request)) => result,
                };

                match outcome {
                    Ok(Ok(Some(chunk))) => {
                        queue.complete(&task.id).await;
                        generated.fetch_add(1, Ordering::SeqCst);
                        cache.lock().await.insert(chunk.clone());
                        if chunk_tx.send(chunk).await.is_err() {
                            warn!(event = "pregen_sink_closed", "Chunk sink closed; stopping worker");
                            busy.fetch_sub(1, Ordering::SeqCst);
                            break;
                        }
                    }
                    Ok(Ok(None)) => {
                        warn!(event = "pregen_empty_result", chunk_id = %request.chunk_id, "Generator returned no chunk");
                        if !queue.fail(task, false).await {
                            failed.fetch_add(1, Ordering::SeqCst);
                            events.emit(EngineEvent::Error {
                                component: "pregeneration".to_string(),
                                message: GenerationError::EmptyResult(request.chunk_id.clone())
                                    .to_string(),
                                recoverable: true,
                            });
                        }
                    }
                    Ok(Err(error)) => {
                        warn!(event = "pregen_failed", chunk_id = %request.chunk_id, error = %error, "Generation failed");
                        if !queue.fail(task, false).await {
                            failed.fetch_add(1, Ordering::SeqCst);
                            events.emit(EngineEvent::Error {
                                component: "pregeneration".to_string(),
                                message: GenerationError::Failed {
                                    request_id: request.chunk_id.clone(),
                                    source: error,
                                }
                                .to_string(),
                                recoverable: true,
                            });
                        }
                    }
                    Err(_elapsed) => {
                        warn!(event = "pregen_timeout", chunk_id = %request.chunk_id, "Generation timed out");
                        if !queue.fail(task, true).await {
                            failed.fetch_add(1, Ordering::SeqCst);
                            events.emit(EngineEvent::Error {
                                component: "pregeneration".to_string(),
                                message: GenerationError::Timeout {
                                    request_id: request.chunk_id.clone(),
                                    timeout_ms: timeout.as_millis() as u64,
                                }
                                .to_string(),
                                recoverable: true,
                            });
                        }
                    }
                }

                busy.fetch_sub(1, Ordering::SeqCst);
            }

            debug!(event = "pregen_worker_stopped", worker_id = worker_id, "Worker stopped");
        })
    }

    /// Stop the pipeline, freeing all workers immediately
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        self.busy_workers.store(0, Ordering::SeqCst);
        info!(event = "pregen_stopped", "Pre-generation pipeline stopped");
    }

    /// Fetch a cached chunk, refreshing its LRU position
    pub async fn cached_chunk(&self, chunk_id: &str) -> Option<TimelineChunk> {
        self.cache.lock().await.get(chunk_id)
    }

    /// Current statistics
    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            generated_count: self.generated_count.load(Ordering::SeqCst) as u64,
            failed_count: self.failed_count.load(Ordering::SeqCst) as u64,
            collapsed_count: self.collapsed_count.load(Ordering::Relaxed) as u64,
            cached_count: self.cache.lock().await.chunks.len(),
            busy_workers: self.busy_workers.load(Ordering::SeqCst),
        }
    }

    /// The underlying task queue, for inspection
    pub fn queue(&self) -> &PriorityTaskQueue<GenerationRequest> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::timeline::ChunkMetadata;
    use std::sync::atomic::AtomicU32;

    struct ScriptedGenerator {
        fail_first: AtomicU32,
    }

    #[async_trait]
    impl ChunkGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> anyhow::Result<Option<TimelineChunk>> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient generator failure");
            }
            Ok(Some(TimelineChunk {
                chunk_id: request.chunk_id.clone(),
                chunk_number: request.chunk_number,
                start_time_offset: 0,
                duration: request.estimated_duration,
                content_type: "explanation".to_string(),
                events: Vec::new(),
                metadata: ChunkMetadata::now(),
            }))
        }
    }

    fn pipeline(fail_first: u32) -> PregenerationPipeline {
        let queue_config = crate::config::QueueConfig {
            retry_backoff_base_ms: 1,
            ..Default::default()
        };
        PregenerationPipeline::new(
            PregenerationConfig::default(),
            queue_config,
            Arc::new(ScriptedGenerator {
                fail_first: AtomicU32::new(fail_first),
            }),
            EventBus::default(),
        )
    }

    fn request(chunk_id: &str, number: u32, priority: GenerationPriority) -> GenerationRequest {
        GenerationRequest {
            chunk_id: chunk_id.to_string(),
            chunk_number: number,
            topic: "photosynthesis".to_string(),
            config: serde_json::Value::Null,
            priority,
            dependencies: Vec::new(),
            estimated_duration: 5000,
            user_position: 0,
        }
    }

    fn plan() -> Vec<PlannedChunk> {
        (1..=6)
            .map(|n| PlannedChunk {
                chunk_id: format!("chunk-{n}"),
                chunk_number: n,
                start_time_offset: (n as u64 - 1) * 5000,
                estimated_duration: 5000,
                topic: "photosynthesis".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_priority_from_playback_distance() {
        let p = pipeline(0);
        let ctx = PlaybackContext {
            position: 10_000,
            speed: 1.0,
            seek_frequency: 0.0,
        };

        assert_eq!(p.priority_for_offset(12_000, &ctx), GenerationPriority::Immediate);
        assert_eq!(p.priority_for_offset(20_000, &ctx), GenerationPriority::High);
        assert_eq!(p.priority_for_offset(38_000, &ctx), GenerationPriority::Medium);
        assert_eq!(p.priority_for_offset(65_000, &ctx), GenerationPriority::Low);
        assert_eq!(p.priority_for_offset(200_000, &ctx), GenerationPriority::Background);
    }

    #[tokio::test]
    async fn test_duplicate_requests_collapse_with_promotion() {
        let p = pipeline(0);

        assert!(p
            .request_chunk(request("chunk-1", 1, GenerationPriority::Low))
            .await
            .unwrap());
        assert!(!p
            .request_chunk(request("chunk-1", 1, GenerationPriority::Immediate))
            .await
            .unwrap());

        let task = p.queue().take_next_ready().await.expect("queued task");
        assert_eq!(task.priority, TaskPriority::Critical);

        let stats = p.stats().await;
        assert_eq!(stats.collapsed_count, 1);
    }

    #[tokio::test]
    async fn test_prediction_respects_window_and_availability() {
        let p = pipeline(0);
        let ctx = PlaybackContext {
            position: 0,
            speed: 1.0,
            seek_frequency: 0.0,
        };
        let mut available = HashSet::new();
        available.insert("chunk-1".to_string());

        let requests = p.predict(&plan(), &ctx, &available).await;

        // chunk-1 is available; the next three fall inside the window
        let ids: Vec<&str> = requests.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["chunk-2", "chunk-3", "chunk-4"]);
        assert_eq!(requests[0].priority, GenerationPriority::Immediate);
    }

    #[tokio::test]
    async fn test_seek_frequency_widens_prediction() {
        let p = pipeline(0);
        let ctx = PlaybackContext {
            position: 0,
            speed: 1.0,
            seek_frequency: 5.0,
        };

        let requests = p.predict(&plan(), &ctx, &HashSet::new()).await;
        assert_eq!(requests.len(), 4);
    }

    #[tokio::test]
    async fn test_workers_generate_and_cache_chunks() {
        let p = Arc::new(pipeline(0));
        let (tx, mut rx) = mpsc::channel(8);
        p.start(tx).await;

        p.request_chunk(request("chunk-1", 1, GenerationPriority::Immediate))
            .await
            .unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("chunk within deadline")
            .expect("sink open");
        assert_eq!(chunk.chunk_id, "chunk-1");

        assert!(p.cached_chunk("chunk-1").await.is_some());
        let stats = p.stats().await;
        assert_eq!(stats.generated_count, 1);

        p.stop().await;
    }

    #[tokio::test]
    async fn test_failure_then_success_is_retried() {
        let p = Arc::new(pipeline(1));
        let (tx, mut rx) = mpsc::channel(8);
        p.start(tx).await;

        p.request_chunk(request("chunk-x", 1, GenerationPriority::Immediate))
            .await
            .unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("retried chunk within deadline")
            .expect("sink open");
        assert_eq!(chunk.chunk_id, "chunk-x");

        let queue_stats = p.queue().stats().await;
        assert_eq!(queue_stats.failure_count, 1);
        assert_eq!(queue_stats.success_count, 1);

        p.stop().await;
    }

    #[tokio::test]
    async fn test_stop_frees_workers() {
        let p = Arc::new(pipeline(0));
        let (tx, _rx) = mpsc::channel(8);
        p.start(tx).await;
        p.stop().await;

        let stats = p.stats().await;
        assert_eq!(stats.busy_workers, 0);
    }
}
