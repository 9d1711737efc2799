//! Adaptive Buffer Controller
//!
//! Samples network conditions, device performance, and user behavior on an
//! interval and derives a buffer strategy: minimum/target/maximum buffer
//! sizes, preload aggressiveness, and load concurrency. Rules apply in
//! order (network, then memory, then behavior) with later rules winning
//! inside the clamped bounds.
//!
//! A derived strategy is only applied when it moves the target by more
//! than the apply threshold or flips the concurrency/aggressive flags,
//! keeping the buffer manager from thrashing on noisy signals.

use crate::config::{AdaptiveConfig, BufferConfig};
use crate::events::{EngineEvent, EventBus};
use crate::services::buffer_manager::ProgressiveBufferManager;
use crate::services::playback_controller::UserBehavior;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Read-only network signal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConditions {
    /// Effective connection type ("slow-2g", "2g", "3g", "4g")
    pub effective_type: String,

    /// Downlink estimate in Mbps
    pub downlink_mbps: f64,

    /// Round-trip time estimate in milliseconds
    pub rtt_ms: u64,

    /// Whether the user requested reduced data usage
    pub save_data: bool,
}

/// Supplies network readings; all signals optional
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn sample(&self) -> Option<NetworkConditions>;
}

/// Probe used when no network information is available
pub struct NoopNetworkProbe;

#[async_trait]
impl NetworkProbe for NoopNetworkProbe {
    async fn sample(&self) -> Option<NetworkConditions> {
        None
    }
}

/// Process memory pressure bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Low,
    Normal,
    High,
    Critical,
}

/// Device performance snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePerformance {
    pub memory_pressure: MemoryPressure,
    pub total_memory_mb: u64,
    pub cpu_cores: usize,
}

impl DevicePerformance {
    /// Sample the current host via sysinfo
    pub fn sample() -> Self {
        let mut system = System::new_all();
        system.refresh_memory();

        let total = system.total_memory().max(1);
        let used = system.used_memory();
        let usage = used as f64 / total as f64;

        let memory_pressure = if usage > 0.9 {
            MemoryPressure::Critical
        } else if usage > 0.75 {
            MemoryPressure::High
        } else if usage < 0.5 {
            MemoryPressure::Low
        } else {
            MemoryPressure::Normal
        };

        Self {
            memory_pressure,
            total_memory_mb: total / 1_048_576,
            cpu_cores: num_cores(),
        }
    }
}

fn num_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// The tuple of buffer-size, concurrency, preloading, and quality flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveBufferStrategy {
    /// Minimum buffered milliseconds before playback starts
    pub min_buffer_ms: u64,

    /// Buffer level the preloader aims for
    pub target_buffer_ms: u64,

    /// Upper bound on buffered content
    pub max_buffer_ms: u64,

    /// Whether to preload well past the target
    pub aggressive_preloading: bool,

    /// Whether downstream producers should adapt content quality
    pub quality_adaptation: bool,

    /// Whether caches should stay small
    pub memory_conscious: bool,

    /// Concurrent chunk loads allowed
    pub max_concurrent_loads: usize,
}

impl AdaptiveBufferStrategy {
    /// Baseline strategy from the static buffer configuration
    pub fn from_buffer_config(config: &BufferConfig) -> Self {
        Self {
            min_buffer_ms: config.min_start_buffer_ms,
            target_buffer_ms: config.target_buffer_ms,
            max_buffer_ms: config.max_buffer_ms,
            aggressive_preloading: false,
            quality_adaptation: false,
            memory_conscious: false,
            max_concurrent_loads: 2,
        }
    }

    /// Restore the invariant `min <= target <= max`, concurrency >= 1
    ///
    /// Caps win: an aggressive target is pulled down to a reduced max, not
    /// the other way around.
    fn clamp(mut self) -> Self {
        self.target_buffer_ms = self.target_buffer_ms.min(self.max_buffer_ms);
        self.min_buffer_ms = self.min_buffer_ms.min(self.target_buffer_ms);
        self.max_concurrent_loads = self.max_concurrent_loads.max(1);
        self
    }
}

/// Network/device/behavior driven tuning of the buffer manager
pub struct AdaptiveBufferController {
    config: AdaptiveConfig,
    baseline: BufferConfig,
    buffer: Arc<ProgressiveBufferManager>,
    probe: Arc<dyn NetworkProbe>,
    events: EventBus,
    current: Mutex<AdaptiveBufferStrategy>,
    sample_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl AdaptiveBufferController {
    pub fn new(
        config: AdaptiveConfig,
        baseline: BufferConfig,
        buffer: Arc<ProgressiveBufferManager>,
        probe: Arc<dyn NetworkProbe>,
        events: EventBus,
    ) -> Self {
        let current = AdaptiveBufferStrategy::from_buffer_config(&baseline);
        Self {
            config,
            baseline,
            buffer,
            probe,
            events,
            current: Mutex::new(current),
            sample_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// The strategy currently in force
    pub async fn current_strategy(&self) -> AdaptiveBufferStrategy {
        self.current.lock().await.clone()
    }

    /// Derive a strategy from the current signals
    ///
    /// Rule order: network, then memory, then behavior; later rules win
    /// within the clamped bounds.
    pub fn derive_strategy(
        &self,
        network: Option<&NetworkConditions>,
        device: &DevicePerformance,
        behavior: &UserBehavior,
    ) -> AdaptiveBufferStrategy {
        let mut strategy = AdaptiveBufferStrategy::from_buffer_config(&self.baseline);

        if let Some(net) = network {
            match net.effective_type.as_str() {
                "slow-2g" | "2g" => {
                    strategy.min_buffer_ms = 8000;
                    strategy.target_buffer_ms = 20_000;
                    strategy.max_concurrent_loads = 1;
                    strategy.aggressive_preloading = false;
                    strategy.quality_adaptation = true;
                }
                "3g" => {
                    strategy.min_buffer_ms = 5000;
                    strategy.target_buffer_ms = 15_000;
                    strategy.quality_adaptation = true;
                }
                "4g" => {
                    strategy.aggressive_preloading = true;
                    strategy.max_concurrent_loads = 4;
                }
                _ => {}
            }

            if net.rtt_ms > 300 {
                strategy.min_buffer_ms += 2000;
                strategy.target_buffer_ms += 5000;
            }
            if net.save_data {
                strategy.target_buffer_ms = strategy.target_buffer_ms.min(10_000);
                strategy.max_buffer_ms = strategy.max_buffer_ms.min(15_000);
                strategy.aggressive_preloading = false;
            }
        }

        match device.memory_pressure {
            MemoryPressure::Critical => {
                strategy.max_buffer_ms = 10_000;
                strategy.max_concurrent_loads = 1;
                strategy.memory_conscious = true;
                strategy.aggressive_preloading = false;
            }
            MemoryPressure::High => {
                strategy.max_buffer_ms = strategy.max_buffer_ms.min(20_000);
                strategy.memory_conscious = true;
            }
            MemoryPressure::Low => {
                strategy.aggressive_preloading = true;
            }
            MemoryPressure::Normal => {}
        }

        if behavior.seek_frequency > 3.0 {
            strategy.aggressive_preloading = true;
            strategy.target_buffer_ms = strategy.target_buffer_ms.max(20_000);
        }
        if behavior.completion_rate > 0.0 && behavior.completion_rate < 0.5 {
            strategy.target_buffer_ms = (strategy.target_buffer_ms as f64 * 0.75) as u64;
        }
        if behavior.pause_frequency > 2.0 {
            strategy.target_buffer_ms = (strategy.target_buffer_ms as f64 * 0.8) as u64;
        }

        strategy.clamp()
    }

    /// Whether `candidate` differs enough from the active strategy
    pub async fn should_apply(&self, candidate: &AdaptiveBufferStrategy) -> bool {
        let current = self.current.lock().await;
        let target_delta = candidate.target_buffer_ms.abs_diff(current.target_buffer_ms) as f64
            / current.target_buffer_ms.max(1) as f64;

        target_delta > self.config.apply_threshold
            || candidate.max_concurrent_loads != current.max_concurrent_loads
            || candidate.aggressive_preloading != current.aggressive_preloading
    }

    /// Install a strategy: retune the buffer manager and announce it
    pub async fn apply_strategy(&self, strategy: AdaptiveBufferStrategy, reason: &str) {
        self.buffer
            .set_buffer_params(
                strategy.min_buffer_ms,
                strategy.target_buffer_ms,
                strategy.max_buffer_ms,
            )
            .await;

        info!(
            event = "strategy_applied",
            reason = reason,
            min = strategy.min_buffer_ms,
            target = strategy.target_buffer_ms,
            max = strategy.max_buffer_ms,
            concurrency = strategy.max_concurrent_loads,
            aggressive = strategy.aggressive_preloading,
            "Adaptive buffer strategy applied"
        );

        *self.current.lock().await = strategy.clone();
        self.events.emit(EngineEvent::StrategyChanged {
            reason: reason.to_string(),
            strategy,
        });
    }

    /// One sampling pass: derive and conditionally apply
    pub async fn sample_once(&self, behavior: &UserBehavior) {
        let network = self.probe.sample().await;
        let device = DevicePerformance::sample();
        let candidate = self.derive_strategy(network.as_ref(), &device, behavior);

        debug!(
            event = "strategy_sampled",
            network = ?network.as_ref().map(|n| n.effective_type.clone()),
            memory = ?device.memory_pressure,
            target = candidate.target_buffer_ms,
            "Adaptive sample"
        );

        if self.should_apply(&candidate).await {
            let reason = match (&network, device.memory_pressure) {
                (_, MemoryPressure::Critical | MemoryPressure::High) => "memory pressure",
                (Some(_), _) => "network conditions",
                _ => "user behavior",
            };
            self.apply_strategy(candidate, reason).await;
        }
    }

    /// React to a buffer underrun: grow min/target toward the max
    pub async fn on_buffer_underrun(&self) {
        let boosted = {
            let current = self.current.lock().await;
            AdaptiveBufferStrategy {
                min_buffer_ms: ((current.min_buffer_ms as f64 * 1.5) as u64)
                    .min(current.max_buffer_ms),
                target_buffer_ms: ((current.target_buffer_ms as f64 * 1.3) as u64)
                    .min(current.max_buffer_ms),
                ..current.clone()
            }
            .clamp()
        };
        self.apply_strategy(boosted, "buffer underrun").await;
    }

    /// React to slow loads: shed concurrency and stop preloading ahead
    pub async fn on_poor_performance(&self, average_load_ms: u64) {
        if average_load_ms <= 5000 {
            return;
        }
        let reduced = {
            let current = self.current.lock().await;
            AdaptiveBufferStrategy {
                max_concurrent_loads: current.max_concurrent_loads.saturating_sub(1).max(1),
                aggressive_preloading: false,
                ..current.clone()
            }
        };
        self.apply_strategy(reduced, "slow chunk loads").await;
    }

    /// React to memory pressure: shrink without ever stopping playback
    pub async fn on_memory_pressure(&self) {
        let shrunk = {
            let current = self.current.lock().await;
            AdaptiveBufferStrategy {
                target_buffer_ms: (current.target_buffer_ms as f64 * 0.7) as u64,
                memory_conscious: true,
                aggressive_preloading: false,
                ..current.clone()
            }
            .clamp()
        };
        self.apply_strategy(shrunk, "memory pressure").await;
    }

    /// Spawn the periodic sampling loop
    ///
    /// `behavior_source` is polled each pass; the playback controller's
    /// `behavior()` is the usual source.
    pub async fn start<F, Fut>(self: &Arc<Self>, behavior_source: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = UserBehavior> + Send,
    {
        let mut task = self.sample_task.lock().await;
        if task.is_some() {
            return;
        }

        let controller = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_millis(self.config.sample_interval_ms);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let behavior = behavior_source().await;
                        controller.sample_once(&behavior).await;
                    }
                }
            }
        }));
    }

    /// Stop the sampling loop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.sample_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;

    fn controller(probe: Arc<dyn NetworkProbe>) -> Arc<AdaptiveBufferController> {
        let bus = EventBus::default();
        let buffer = Arc::new(ProgressiveBufferManager::new(
            BufferConfig::default(),
            bus.clone(),
        ));
        Arc::new(AdaptiveBufferController::new(
            AdaptiveConfig::default(),
            BufferConfig::default(),
            buffer,
            probe,
            bus,
        ))
    }

    fn device(pressure: MemoryPressure) -> DevicePerformance {
        DevicePerformance {
            memory_pressure: pressure,
            total_memory_mb: 8192,
            cpu_cores: 8,
        }
    }

    fn network(effective_type: &str) -> NetworkConditions {
        NetworkConditions {
            effective_type: effective_type.to_string(),
            downlink_mbps: 10.0,
            rtt_ms: 50,
            save_data: false,
        }
    }

    #[tokio::test]
    async fn test_slow_network_raises_minimums_and_drops_concurrency() {
        let c = controller(Arc::new(NoopNetworkProbe));
        let strategy = c.derive_strategy(
            Some(&network("2g")),
            &device(MemoryPressure::Normal),
            &UserBehavior::default(),
        );

        assert_eq!(strategy.min_buffer_ms, 8000);
        assert_eq!(strategy.target_buffer_ms, 20_000);
        assert_eq!(strategy.max_concurrent_loads, 1);
        assert!(!strategy.aggressive_preloading);
        assert!(strategy.quality_adaptation);
    }

    #[tokio::test]
    async fn test_fast_network_enables_aggressive_preloading() {
        let c = controller(Arc::new(NoopNetworkProbe));
        let strategy = c.derive_strategy(
            Some(&network("4g")),
            &device(MemoryPressure::Normal),
            &UserBehavior::default(),
        );

        assert!(strategy.aggressive_preloading);
        assert_eq!(strategy.max_concurrent_loads, 4);
    }

    #[tokio::test]
    async fn test_high_rtt_raises_buffers() {
        let c = controller(Arc::new(NoopNetworkProbe));
        let mut slow = network("4g");
        slow.rtt_ms = 400;
        let baseline = c.derive_strategy(
            Some(&network("4g")),
            &device(MemoryPressure::Normal),
            &UserBehavior::default(),
        );
        let strategy = c.derive_strategy(
            Some(&slow),
            &device(MemoryPressure::Normal),
            &UserBehavior::default(),
        );

        assert_eq!(strategy.min_buffer_ms, baseline.min_buffer_ms + 2000);
        assert_eq!(strategy.target_buffer_ms, baseline.target_buffer_ms + 5000);
    }

    #[tokio::test]
    async fn test_data_saver_caps_buffers() {
        let c = controller(Arc::new(NoopNetworkProbe));
        let mut saver = network("4g");
        saver.save_data = true;
        let strategy = c.derive_strategy(
            Some(&saver),
            &device(MemoryPressure::Normal),
            &UserBehavior::default(),
        );

        assert!(strategy.target_buffer_ms <= 10_000);
        assert!(strategy.max_buffer_ms <= 15_000);
        assert!(!strategy.aggressive_preloading);
    }

    #[tokio::test]
    async fn test_critical_memory_wins_over_fast_network() {
        let c = controller(Arc::new(NoopNetworkProbe));
        let strategy = c.derive_strategy(
            Some(&network("4g")),
            &device(MemoryPressure::Critical),
            &UserBehavior::default(),
        );

        assert_eq!(strategy.max_buffer_ms, 10_000);
        assert_eq!(strategy.max_concurrent_loads, 1);
        assert!(strategy.memory_conscious);
        assert!(!strategy.aggressive_preloading);
        // Invariant restored after the memory cap
        assert!(strategy.target_buffer_ms <= strategy.max_buffer_ms);
    }

    #[tokio::test]
    async fn test_frequent_seeking_extends_target() {
        let c = controller(Arc::new(NoopNetworkProbe));
        let behavior = UserBehavior {
            seek_frequency: 5.0,
            pause_frequency: 0.0,
            completion_rate: 0.8,
        };
        let strategy =
            c.derive_strategy(None, &device(MemoryPressure::Normal), &behavior);

        assert!(strategy.aggressive_preloading);
        assert!(strategy.target_buffer_ms >= 20_000);
    }

    #[tokio::test]
    async fn test_small_changes_are_not_applied() {
        let c = controller(Arc::new(NoopNetworkProbe));
        let current = c.current_strategy().await;

        // Nudge target by 10%: under the 20% threshold, same flags
        let candidate = AdaptiveBufferStrategy {
            target_buffer_ms: (current.target_buffer_ms as f64 * 1.1) as u64,
            ..current.clone()
        };
        assert!(!c.should_apply(&candidate).await);

        // Flag flips always apply
        let flipped = AdaptiveBufferStrategy {
            aggressive_preloading: !current.aggressive_preloading,
            ..current
        };
        assert!(c.should_apply(&flipped).await);
    }

    #[tokio::test]
    async fn test_underrun_boosts_and_emits_strategy_changed() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let buffer = Arc::new(ProgressiveBufferManager::new(
            BufferConfig::default(),
            bus.clone(),
        ));
        let c = Arc::new(AdaptiveBufferController::new(
            AdaptiveConfig::default(),
            BufferConfig::default(),
            buffer.clone(),
            Arc::new(NoopNetworkProbe),
            bus,
        ));

        let before = c.current_strategy().await;
        c.on_buffer_underrun().await;
        let after = c.current_strategy().await;

        assert!(after.min_buffer_ms > before.min_buffer_ms);
        assert!(after.target_buffer_ms > before.target_buffer_ms);

        // Buffer manager got retuned
        let (min, target, _max) = buffer.buffer_params().await;
        assert_eq!(min, after.min_buffer_ms);
        assert_eq!(target, after.target_buffer_ms);

        let mut saw_change = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::StrategyChanged { reason, .. } = event {
                assert_eq!(reason, "buffer underrun");
                saw_change = true;
            }
        }
        assert!(saw_change);
    }

    #[tokio::test]
    async fn test_poor_performance_sheds_concurrency() {
        let c = controller(Arc::new(NoopNetworkProbe));
        c.on_poor_performance(6000).await;

        let strategy = c.current_strategy().await;
        assert_eq!(strategy.max_concurrent_loads, 1);
        assert!(!strategy.aggressive_preloading);

        // Fast loads change nothing
        let before = c.current_strategy().await;
        c.on_poor_performance(1000).await;
        assert_eq!(c.current_strategy().await, before);
    }
}
