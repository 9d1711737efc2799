//! Priority Task Queue
//!
//! Generic ordered scheduler underpinning chunk pre-generation. Items carry
//! a priority band, an optional deadline, dependencies on other items, and
//! a retry budget. Ordering is priority first, then deadline (items without
//! a deadline rank after those with one), then creation time.
//!
//! Two consumption modes:
//! - a registered [`TaskHandler`] driven by [`PriorityTaskQueue::tick`],
//!   one dispatch per tick raced against the item's timeout
//! - direct [`take_next_ready`](PriorityTaskQueue::take_next_ready) /
//!   [`complete`](PriorityTaskQueue::complete) /
//!   [`fail`](PriorityTaskQueue::fail) calls from an external worker pool

use crate::config::QueueConfig;
use crate::error::QueueError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Priority bands, critical first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    /// One band lower, saturating at `Idle`
    pub fn demoted(self) -> Self {
        match self {
            TaskPriority::Critical => TaskPriority::High,
            TaskPriority::High => TaskPriority::Normal,
            TaskPriority::Normal => TaskPriority::Low,
            TaskPriority::Low | TaskPriority::Idle => TaskPriority::Idle,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
            TaskPriority::Idle => "idle",
        }
    }
}

/// A queued unit of work
#[derive(Debug, Clone)]
pub struct QueuedTask<T> {
    /// Unique identifier within the queue
    pub id: String,

    /// Caller payload
    pub payload: T,

    /// Current priority band (demoted on retries and by decay)
    pub priority: TaskPriority,

    /// When the item entered the queue
    pub created_at: Instant,

    /// Hard deadline; items past it are never dispatched
    pub deadline: Option<Instant>,

    /// Ids that must be completed before this item is ready
    pub dependencies: Vec<String>,

    /// Retry budget
    pub max_retries: u32,

    /// Handler budget per dispatch in milliseconds
    pub timeout_ms: u64,

    /// Free-form labels for diagnostics
    pub tags: Vec<String>,

    /// Attempts so far
    pub retry_count: u32,

    /// Backoff gate; the item is unready before this instant
    pub not_before: Option<Instant>,
}

impl<T> QueuedTask<T> {
    /// Build a task with defaults for the retry/timeout knobs
    pub fn new(id: impl Into<String>, payload: T, priority: TaskPriority) -> Self {
        Self {
            id: id.into(),
            payload,
            priority,
            created_at: Instant::now(),
            deadline: None,
            dependencies: Vec::new(),
            max_retries: 3,
            timeout_ms: 30_000,
            tags: Vec::new(),
            retry_count: 0,
            not_before: None,
        }
    }

    /// Set a deadline relative to now
    pub fn with_deadline_in(mut self, duration: Duration) -> Self {
        self.deadline = Some(Instant::now() + duration);
        self
    }

    /// Set dependency ids
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the per-dispatch timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Heap wrapper ordering tasks by priority, deadline, then creation time
struct HeapEntry<T> {
    task: QueuedTask<T>,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_keys(other) == Ordering::Equal
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> HeapEntry<T> {
    fn cmp_keys(&self, other: &Self) -> Ordering {
        // Higher priority first
        match self.task.priority.cmp(&other.task.priority) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        // Earlier deadline first; items without a deadline rank last
        let deadline_order = match (self.task.deadline, other.task.deadline) {
            (Some(a), Some(b)) => b.cmp(&a),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        match deadline_order {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        // FIFO within the same band and deadline
        other.task.created_at.cmp(&self.task.created_at)
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_keys(other)
    }
}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Handler invoked by [`PriorityTaskQueue::tick`]
#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    async fn handle(&self, task: &QueuedTask<T>) -> anyhow::Result<()>;
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Items accepted over the queue's lifetime
    pub total_enqueued: u64,

    /// Items currently queued
    pub current_size: usize,

    /// Current queue composition by priority band
    pub per_priority: HashMap<String, usize>,

    /// Completed dispatches
    pub success_count: u64,

    /// Failed attempts, including timeouts
    pub failure_count: u64,

    /// Timed-out attempts
    pub timeout_count: u64,

    /// Items dropped after exhausting retries
    pub dropped_count: u64,

    /// Items removed by cleanup or expired deadlines
    pub expired_count: u64,
}

impl QueueStats {
    /// success / (success + failure); 1.0 when nothing has run
    pub fn efficiency(&self) -> f64 {
        let attempts = self.success_count + self.failure_count;
        if attempts == 0 {
            return 1.0;
        }
        self.success_count as f64 / attempts as f64
    }
}

/// Outcome of a single [`tick`](PriorityTaskQueue::tick)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing ready to dispatch
    Idle,
    /// The dispatched item completed
    Completed(String),
    /// The dispatched item failed and was re-enqueued for retry
    Retrying(String),
    /// The dispatched item failed terminally and was dropped
    Dropped(String),
}

struct QueueState<T> {
    heap: BinaryHeap<HeapEntry<T>>,
    queued_ids: HashSet<String>,
    completed: HashSet<String>,
    stats: QueueStats,
}

impl<T> QueueState<T> {
    fn refresh_stats(&mut self) {
        self.stats.current_size = self.heap.len();
        let mut per_priority: HashMap<String, usize> = HashMap::new();
        for entry in self.heap.iter() {
            *per_priority
                .entry(entry.task.priority.label().to_string())
                .or_insert(0) += 1;
        }
        self.stats.per_priority = per_priority;
    }
}

/// Generic priority + dependency + retry scheduler
pub struct PriorityTaskQueue<T> {
    state: Mutex<QueueState<T>>,
    handler: RwLock<Option<Arc<dyn TaskHandler<T>>>>,
    config: QueueConfig,
}

impl<T: Send + Clone> PriorityTaskQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                queued_ids: HashSet::new(),
                completed: HashSet::new(),
                stats: QueueStats::default(),
            }),
            handler: RwLock::new(None),
            config,
        }
    }

    /// Register the dispatch handler used by `tick`
    pub async fn set_handler(&self, handler: Arc<dyn TaskHandler<T>>) {
        *self.handler.write().await = Some(handler);
    }

    /// Insert a task
    ///
    /// Fails with `QueueFull` at capacity and `DuplicateId` when the id is
    /// already queued.
    pub async fn enqueue(&self, task: QueuedTask<T>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if state.heap.len() >= self.config.capacity {
            return Err(QueueError::QueueFull {
                capacity: self.config.capacity,
            });
        }
        if state.queued_ids.contains(&task.id) {
            return Err(QueueError::DuplicateId(task.id.clone()));
        }

        debug!(
            event = "task_enqueued",
            id = %task.id,
            priority = task.priority.label(),
            retry_count = task.retry_count,
            "Task enqueued"
        );

        state.queued_ids.insert(task.id.clone());
        state.heap.push(HeapEntry { task });
        state.stats.total_enqueued += 1;
        state.refresh_stats();
        Ok(())
    }

    /// Whether an id is currently queued
    pub async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.queued_ids.contains(id)
    }

    /// Number of queued items
    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    /// Whether the queue is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Raise a queued item's priority if the new band is higher
    ///
    /// Returns true when the item was found and promoted.
    pub async fn promote(&self, id: &str, priority: TaskPriority) -> bool {
        let mut state = self.state.lock().await;
        if !state.queued_ids.contains(id) {
            return false;
        }

        let mut entries: Vec<HeapEntry<T>> = state.heap.drain().collect();
        let mut promoted = false;
        for entry in entries.iter_mut() {
            if entry.task.id == id && priority > entry.task.priority {
                entry.task.priority = priority;
                promoted = true;
            }
        }
        state.heap.extend(entries);
        state.refresh_stats();
        promoted
    }

    /// Remove a queued item by id; returns true when found
    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.queued_ids.remove(id) {
            return false;
        }
        let entries: Vec<HeapEntry<T>> = state.heap.drain().collect();
        state
            .heap
            .extend(entries.into_iter().filter(|e| e.task.id != id));
        state.refresh_stats();
        true
    }

    /// Mark an id completed, unblocking dependents
    pub async fn complete(&self, id: &str) {
        let mut state = self.state.lock().await;
        state.completed.insert(id.to_string());
        state.stats.success_count += 1;
        state.refresh_stats();
    }

    /// Record a failed attempt and either re-enqueue with backoff or drop
    ///
    /// The retried item is demoted one priority band and gated behind an
    /// exponential backoff. Returns true when the item will retry.
    pub async fn fail(&self, mut task: QueuedTask<T>, timed_out: bool) -> bool {
        let mut state = self.state.lock().await;
        state.stats.failure_count += 1;
        if timed_out {
            state.stats.timeout_count += 1;
        }

        if task.retry_count >= task.max_retries {
            warn!(
                event = "task_dropped",
                id = %task.id,
                retries = task.retry_count,
                "Task exhausted retries and was dropped"
            );
            state.stats.dropped_count += 1;
            state.refresh_stats();
            return false;
        }

        let backoff = self.backoff_for(task.retry_count);
        task.retry_count += 1;
        task.priority = task.priority.demoted();
        task.not_before = Some(Instant::now() + backoff);

        debug!(
            event = "task_retry_scheduled",
            id = %task.id,
            retry_count = task.retry_count,
            backoff_ms = backoff.as_millis() as u64,
            priority = task.priority.label(),
            "Task re-enqueued for retry"
        );

        state.queued_ids.insert(task.id.clone());
        state.heap.push(HeapEntry { task });
        state.refresh_stats();
        true
    }

    fn backoff_for(&self, retry_count: u32) -> Duration {
        let base = self.config.retry_backoff_base_ms;
        let exp = base.saturating_mul(1u64 << retry_count.min(10));
        Duration::from_millis(exp.min(self.config.retry_backoff_cap_ms))
    }

    /// Pop the highest-ranked ready item
    ///
    /// Ready means: deadline not passed, backoff gate open, and every
    /// dependency in the completed set. Unready items are retained; items
    /// past their deadline are removed and counted as expired.
    pub async fn take_next_ready(&self) -> Option<QueuedTask<T>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut stash: Vec<HeapEntry<T>> = Vec::new();
        let mut taken: Option<QueuedTask<T>> = None;

        while let Some(entry) = state.heap.pop() {
            let task = &entry.task;

            if task.deadline.is_some_and(|d| d <= now) {
                debug!(event = "task_expired", id = %task.id, "Task deadline passed");
                state.queued_ids.remove(&task.id);
                state.stats.expired_count += 1;
                continue;
            }

            let gated = task.not_before.is_some_and(|t| t > now);
            let blocked = !task
                .dependencies
                .iter()
                .all(|dep| state.completed.contains(dep));

            if gated || blocked {
                stash.push(entry);
                continue;
            }

            state.queued_ids.remove(&task.id);
            taken = Some(entry.task);
            break;
        }

        state.heap.extend(stash);
        state.refresh_stats();
        taken
    }

    /// Dispatch up to one ready item to the registered handler
    ///
    /// The handler is raced against the item's timeout; losing the race is
    /// a failure like any other.
    pub async fn tick(&self) -> Result<TickOutcome, QueueError> {
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or(QueueError::NoHandler)?;

        let Some(task) = self.take_next_ready().await else {
            return Ok(TickOutcome::Idle);
        };

        let budget = Duration::from_millis(task.timeout_ms);
        let result = tokio::time::timeout(budget, handler.handle(&task)).await;

        match result {
            Ok(Ok(())) => {
                self.complete(&task.id).await;
                Ok(TickOutcome::Completed(task.id))
            }
            Ok(Err(error)) => {
                debug!(event = "task_failed", id = %task.id, error = %error, "Handler failed");
                let id = task.id.clone();
                if self.fail(task, false).await {
                    Ok(TickOutcome::Retrying(id))
                } else {
                    Ok(TickOutcome::Dropped(id))
                }
            }
            Err(_elapsed) => {
                warn!(event = "task_timeout", id = %task.id, timeout_ms = task.timeout_ms, "Handler timed out");
                let id = task.id.clone();
                if self.fail(task, true).await {
                    Ok(TickOutcome::Retrying(id))
                } else {
                    Ok(TickOutcome::Dropped(id))
                }
            }
        }
    }

    /// Demote items that have waited past the decay threshold
    ///
    /// An item older than `n` threshold-multiples is demoted `n` bands.
    pub async fn apply_decay(&self) {
        let Some(threshold_ms) = self.config.decay_threshold_ms else {
            return;
        };
        if threshold_ms == 0 {
            return;
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut entries: Vec<HeapEntry<T>> = state.heap.drain().collect();

        for entry in entries.iter_mut() {
            let age_ms = now.duration_since(entry.task.created_at).as_millis() as u64;
            let bands = age_ms / threshold_ms;
            for _ in 0..bands {
                entry.task.priority = entry.task.priority.demoted();
            }
        }

        state.heap.extend(entries);
        state.refresh_stats();
    }

    /// Remove items older than the configured max age, regardless of state
    pub async fn cleanup(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let max_age = Duration::from_millis(self.config.max_age_ms);

        let entries: Vec<HeapEntry<T>> = state.heap.drain().collect();
        let before = entries.len();
        let (kept, removed): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| now.duration_since(e.task.created_at) < max_age);

        for entry in &removed {
            state.queued_ids.remove(&entry.task.id);
        }
        state.stats.expired_count += removed.len() as u64;
        state.heap.extend(kept);
        state.refresh_stats();
        before - state.heap.len()
    }

    /// Snapshot of current statistics
    pub async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn queue() -> PriorityTaskQueue<u32> {
        PriorityTaskQueue::new(QueueConfig::default())
    }

    #[tokio::test]
    async fn test_pop_order_priority_then_deadline_then_fifo() {
        let q = queue();

        q.enqueue(QueuedTask::new("normal-early", 1, TaskPriority::Normal))
            .await
            .unwrap();
        q.enqueue(QueuedTask::new("normal-late", 2, TaskPriority::Normal))
            .await
            .unwrap();
        q.enqueue(QueuedTask::new("critical", 3, TaskPriority::Critical))
            .await
            .unwrap();
        q.enqueue(
            QueuedTask::new("normal-deadline", 4, TaskPriority::Normal)
                .with_deadline_in(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        assert_eq!(q.take_next_ready().await.unwrap().id, "critical");
        // Deadline-bearing item outranks deadline-free ones in the same band
        assert_eq!(q.take_next_ready().await.unwrap().id, "normal-deadline");
        assert_eq!(q.take_next_ready().await.unwrap().id, "normal-early");
        assert_eq!(q.take_next_ready().await.unwrap().id, "normal-late");
        assert!(q.take_next_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_dependencies_gate_readiness() {
        let q = queue();

        q.enqueue(
            QueuedTask::new("dependent", 1, TaskPriority::Critical)
                .with_dependencies(vec!["base".to_string()]),
        )
        .await
        .unwrap();
        q.enqueue(QueuedTask::new("base", 2, TaskPriority::Low))
            .await
            .unwrap();

        // Dependent is highest priority but blocked, so the base comes out
        assert_eq!(q.take_next_ready().await.unwrap().id, "base");
        assert!(q.take_next_ready().await.is_none());

        q.complete("base").await;
        assert_eq!(q.take_next_ready().await.unwrap().id, "dependent");
    }

    #[tokio::test]
    async fn test_duplicate_and_capacity_errors() {
        let config = QueueConfig {
            capacity: 2,
            ..QueueConfig::default()
        };
        let q: PriorityTaskQueue<u32> = PriorityTaskQueue::new(config);

        q.enqueue(QueuedTask::new("a", 1, TaskPriority::Normal))
            .await
            .unwrap();
        let dup = q
            .enqueue(QueuedTask::new("a", 1, TaskPriority::Normal))
            .await;
        assert_eq!(dup, Err(QueueError::DuplicateId("a".to_string())));

        q.enqueue(QueuedTask::new("b", 2, TaskPriority::Normal))
            .await
            .unwrap();
        let full = q
            .enqueue(QueuedTask::new("c", 3, TaskPriority::Normal))
            .await;
        assert_eq!(full, Err(QueueError::QueueFull { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_failure_demotes_and_gates_retry() {
        let q = queue();
        let task = QueuedTask::new("flaky", 1, TaskPriority::High).with_max_retries(2);

        let retrying = q.fail(task, false).await;
        assert!(retrying);

        // Backoff gate keeps the retried item unready for now
        assert!(q.take_next_ready().await.is_none());
        assert_eq!(q.len().await, 1);

        let stats = q.stats().await;
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.dropped_count, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted_drops_item() {
        let q = queue();
        let mut task = QueuedTask::new("doomed", 1, TaskPriority::Normal).with_max_retries(1);
        task.retry_count = 1;

        let retrying = q.fail(task, true).await;
        assert!(!retrying);

        let stats = q.stats().await;
        assert_eq!(stats.dropped_count, 1);
        assert_eq!(stats.timeout_count, 1);
    }

    #[tokio::test]
    async fn test_promote_raises_priority_only_upward() {
        let q = queue();
        q.enqueue(QueuedTask::new("x", 1, TaskPriority::Low))
            .await
            .unwrap();

        assert!(q.promote("x", TaskPriority::Critical).await);
        assert!(!q.promote("x", TaskPriority::Low).await);
        assert!(!q.promote("missing", TaskPriority::Critical).await);

        assert_eq!(q.take_next_ready().await.unwrap().priority, TaskPriority::Critical);
    }

    #[tokio::test]
    async fn test_tick_dispatches_to_handler() {
        struct CountingHandler {
            attempts: AtomicU32,
        }

        #[async_trait]
        impl TaskHandler<u32> for CountingHandler {
            async fn handle(&self, _task: &QueuedTask<u32>) -> anyhow::Result<()> {
                let attempt = self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
                if attempt == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            }
        }

        let config = QueueConfig {
            retry_backoff_base_ms: 1,
            ..QueueConfig::default()
        };
        let q: PriorityTaskQueue<u32> = PriorityTaskQueue::new(config);
        let handler = Arc::new(CountingHandler {
            attempts: AtomicU32::new(0),
        });
        q.set_handler(handler.clone()).await;

        q.enqueue(QueuedTask::new("x", 7, TaskPriority::Normal))
            .await
            .unwrap();

        // First dispatch fails and schedules a retry
        assert_eq!(q.tick().await.unwrap(), TickOutcome::Retrying("x".to_string()));

        // Wait out the backoff gate, then the retry succeeds
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.tick().await.unwrap(), TickOutcome::Completed("x".to_string()));
        assert_eq!(q.tick().await.unwrap(), TickOutcome::Idle);

        let stats = q.stats().await;
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert!((stats.efficiency() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cleanup_removes_aged_items() {
        let config = QueueConfig {
            max_age_ms: 0,
            ..QueueConfig::default()
        };
        let q: PriorityTaskQueue<u32> = PriorityTaskQueue::new(config);
        q.enqueue(QueuedTask::new("old", 1, TaskPriority::Normal))
            .await
            .unwrap();

        let removed = q.cleanup().await;
        assert_eq!(removed, 1);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_decay_demotes_aged_items() {
        let config = QueueConfig {
            decay_threshold_ms: Some(1),
            ..QueueConfig::default()
        };
        let q: PriorityTaskQueue<u32> = PriorityTaskQueue::new(config);
        q.enqueue(QueuedTask::new("aging", 1, TaskPriority::Critical))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        q.apply_decay().await;

        let task = q.take_next_ready().await.unwrap();
        assert!(task.priority < TaskPriority::Critical);
    }
}
