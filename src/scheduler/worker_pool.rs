//! Worker pool that drains the clone queue.
//!
//! Each worker runs as an independent async task:
//!
//! ```text
//!   loop {
//!       dequeue ──► none ──► sleep(poll_interval) or stop signal
//!          │
//!          ▼
//!       resolve via manager ──► initialize if CREATED ──► start
//!          │
//!          ▼
//!       release from processing once terminal (or unknown)
//!   }
//! ```
//!
//! # Features
//!
//! - Pool size kept within `[min_workers, max_workers]`
//! - [`WorkerPool::adjust_pool_size`] adds or stops only the difference
//! - Graceful shutdown with broadcast channel; each worker also has its own
//!   stop signal
//! - `worker.stop` bus events stop one worker (`worker_id`) or all of them
//! - `pool.resized` is published after every size change
//! - Pool statistics tracking

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Map;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::manager::CloneManager;
use super::queue::CloneQueue;
use crate::clones::CloneStatus;
use crate::error::PoolError;
use crate::events::bus::panic_message;
use crate::events::{Event, EventBus, EventHandler, SubscribeOptions};

/// Event type that stops one worker (payload `worker_id`) or all workers.
pub const WORKER_STOP_EVENT: &str = "worker.stop";
/// Event type published after the pool changes size.
pub const POOL_RESIZED_EVENT: &str = "pool.resized";

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Lower bound on the number of workers.
    pub min_workers: usize,
    /// Upper bound on the number of workers.
    pub max_workers: usize,
    /// Workers spawned by `start`.
    pub initial_workers: usize,
    /// How long a worker sleeps when the queue is empty.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            initial_workers: 2,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration starting with `initial_workers` workers.
    pub fn new(initial_workers: usize) -> Self {
        Self {
            initial_workers,
            ..Default::default()
        }
    }

    /// Sets the size bounds.
    pub fn with_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Clamps `target` into `[min_workers, max_workers]`.
    pub fn clamp(&self, target: usize) -> usize {
        let max = self.max_workers.max(self.min_workers);
        target.clamp(self.min_workers, max)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently driving a clone.
    pub busy_workers: usize,
    /// Clones that ended COMPLETED.
    pub clones_completed: u64,
    /// Clones that ended FAILED (or whose worker panicked).
    pub clones_failed: u64,
    /// Clones handled that ended in any other status.
    pub clones_other: u64,
    /// Average time spent per dequeued clone.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of clones handled.
    pub fn total_processed(&self) -> u64 {
        self.clones_completed + self.clones_failed + self.clones_other
    }

    /// Returns the completed share of handled clones as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.clones_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    other: AtomicU64,
    total_duration_ms: AtomicU64,
    busy_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            other: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            busy_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: Option<CloneStatus>, duration: Duration) {
        let counter = match outcome {
            Some(CloneStatus::Completed) => &self.completed,
            Some(CloneStatus::Failed) | None => &self.failed,
            Some(_) => &self.other,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_busy(&self) {
        self.busy_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_busy(&self) {
        self.busy_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let other = self.other.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed + other;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            busy_workers: self.busy_workers.load(Ordering::SeqCst) as usize,
            clones_completed: completed,
            clones_failed: failed,
            clones_other: other,
            average_duration,
        }
    }
}

/// Handle kept by the pool for each spawned worker.
struct WorkerSlot {
    id: String,
    stop_tx: broadcast::Sender<()>,
    current: Arc<Mutex<Option<String>>>,
    handle: JoinHandle<()>,
}

impl WorkerSlot {
    fn is_idle(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn signal_stop(&self) {
        // Ignore send error - the worker may have already stopped
        let _ = self.stop_tx.send(());
    }
}

/// Dynamically sized pool of workers draining a [`CloneQueue`].
pub struct WorkerPool {
    config: WorkerPoolConfig,
    manager: Arc<CloneManager>,
    queue: Arc<CloneQueue>,
    bus: EventBus,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<WorkerSlot>>,
    target_workers: AtomicUsize,
    next_worker: AtomicU64,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    subscriber_id: String,
}

impl WorkerPool {
    /// Creates a worker pool and subscribes it to `worker.stop`.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool configuration
    /// * `manager` - Manager resolving clone ids
    /// * `queue` - Queue the workers drain
    /// * `bus` - Bus for control and resize events
    pub fn new(
        config: WorkerPoolConfig,
        manager: Arc<CloneManager>,
        queue: Arc<CloneQueue>,
        bus: EventBus,
    ) -> Arc<Self> {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let target = config.clamp(config.initial_workers);

        let pool = Arc::new(Self {
            config,
            manager,
            queue,
            bus,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            target_workers: AtomicUsize::new(target),
            next_worker: AtomicU64::new(0),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            subscriber_id: format!("worker_pool:{}", Uuid::new_v4()),
        });
        pool.subscribe_control_events();
        pool
    }

    fn subscribe_control_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus.subscribe_with(
            WORKER_STOP_EVENT,
            EventHandler::sync(move |event: &Event| {
                if let Some(pool) = weak.upgrade() {
                    match event.field_str("worker_id") {
                        Some(worker_id) => {
                            pool.stop_worker(worker_id);
                        }
                        None => pool.stop_all_workers(),
                    }
                }
                Ok(())
            }),
            SubscribeOptions::new().with_subscriber_id(self.subscriber_id.clone()),
        );
    }

    /// Starts the configured initial number of workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&self) -> Result<(), PoolError> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PoolError::AlreadyRunning);
        }

        let target = self.target_workers.load(Ordering::SeqCst);
        {
            let mut workers = self.workers();
            for _ in 0..target {
                workers.push(self.spawn_worker());
            }
        }

        info!(num_workers = target, "Worker pool started");
        self.publish_resized(0, target);
        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal and waits for each worker to finish the clone
    /// it is driving.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool was not started, or
    /// `PoolError::ShutdownTimeout` if workers don't stop in time.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let slots: Vec<WorkerSlot> = self.workers().drain(..).collect();
        let previous = slots.len();
        let shutdown_future = async {
            for slot in slots {
                if let Err(e) = slot.handle.await {
                    error!(worker_id = %slot.id, error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = match tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        };
        self.publish_resized(previous, 0);
        result
    }

    /// Converges the pool on `target` workers, clamped to the configured
    /// bounds. Only the difference is started or stopped; idle workers are
    /// stopped first. Returns the resulting size.
    ///
    /// When the pool is not running the target is recorded for `start`.
    pub fn adjust_pool_size(&self, target: usize) -> usize {
        let target = self.config.clamp(target);
        self.target_workers.store(target, Ordering::SeqCst);
        if !self.is_running() {
            return target;
        }

        let previous = {
            let mut workers = self.workers();
            workers.retain(|slot| !slot.handle.is_finished());
            let previous = workers.len();

            if target > previous {
                for _ in previous..target {
                    workers.push(self.spawn_worker());
                }
            } else if target < previous {
                let mut excess = previous - target;
                // Idle workers first, then the most recently spawned.
                let mut index = workers.len();
                while excess > 0 && index > 0 {
                    index -= 1;
                    if workers[index].is_idle() {
                        workers.remove(index).signal_stop();
                        excess -= 1;
                    }
                }
                while excess > 0 {
                    if let Some(slot) = workers.pop() {
                        slot.signal_stop();
                    }
                    excess -= 1;
                }
            }
            previous
        };

        if previous != target {
            info!(previous = previous, target = target, "Adjusted worker pool size");
            self.publish_resized(previous, target);
        }
        target
    }

    /// Stops the worker with `worker_id`. Returns whether it was found.
    ///
    /// The worker finishes the clone it is driving before exiting.
    pub fn stop_worker(&self, worker_id: &str) -> bool {
        let (previous, found) = {
            let mut workers = self.workers();
            let previous = workers.len();
            match workers.iter().position(|slot| slot.id == worker_id) {
                Some(index) => {
                    workers.remove(index).signal_stop();
                    (previous, true)
                }
                None => (previous, false),
            }
        };

        if found {
            info!(worker_id = worker_id, "Stopped worker");
            self.publish_resized(previous, previous - 1);
        } else {
            warn!(worker_id = worker_id, "Worker not found");
        }
        found
    }

    fn stop_all_workers(&self) {
        let slots: Vec<WorkerSlot> = self.workers().drain(..).collect();
        let previous = slots.len();
        for slot in &slots {
            slot.signal_stop();
        }
        info!(stopped = previous, "Stopped all workers");
        self.publish_resized(previous, 0);
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.workers().len()
    }

    /// Returns the ids of the pool's workers.
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers().iter().map(|slot| slot.id.clone()).collect()
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    fn workers(&self) -> MutexGuard<'_, Vec<WorkerSlot>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(&self) -> WorkerSlot {
        let id = format!("worker-{}", self.next_worker.fetch_add(1, Ordering::SeqCst));
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let current = Arc::new(Mutex::new(None));

        let worker = Worker {
            id: id.clone(),
            manager: Arc::clone(&self.manager),
            queue: Arc::clone(&self.queue),
            stop_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            poll_interval: self.config.poll_interval,
            current: Arc::clone(&current),
            stats: Arc::clone(&self.stats),
        };
        let handle = tokio::spawn(worker.run());

        WorkerSlot {
            id,
            stop_tx,
            current,
            handle,
        }
    }

    fn publish_resized(&self, previous: usize, current: usize) {
        self.bus.publish(
            Event::new(POOL_RESIZED_EVENT, "worker_pool")
                .with_field("previous", previous)
                .with_field("current", current),
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscriber_id, None);
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers())
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// A single worker that drives clones taken from the queue.
struct Worker {
    id: String,
    manager: Arc<CloneManager>,
    queue: Arc<CloneQueue>,
    stop_rx: broadcast::Receiver<()>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    current: Arc<Mutex<Option<String>>>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Polls for clones until its own stop signal or the pool-wide shutdown
    /// signal arrives.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            if self.should_stop() {
                info!(worker_id = %self.id, "Worker received stop signal");
                break;
            }

            match self.queue.dequeue().await {
                Some(clone_id) => self.process(clone_id).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.stop_rx.recv() => break,
                        _ = self.shutdown_rx.recv() => break,
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    fn should_stop(&mut self) -> bool {
        use broadcast::error::TryRecvError;

        [&mut self.stop_rx, &mut self.shutdown_rx]
            .into_iter()
            .any(|rx| !matches!(rx.try_recv(), Err(TryRecvError::Empty)))
    }

    /// Drives one clone. Never panics out of the worker loop.
    async fn process(&self, clone_id: String) {
        let start_time = Instant::now();
        self.stats.increment_busy();
        self.set_current(Some(clone_id.clone()));
        debug!(worker_id = %self.id, clone_id = %clone_id, "Processing clone");

        let outcome = match AssertUnwindSafe(self.drive(&clone_id)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    worker_id = %self.id,
                    clone_id = %clone_id,
                    panic = %panic_message(panic.as_ref()),
                    "Worker panicked while processing clone"
                );
                self.queue.release(&clone_id).await;
                tokio::time::sleep(self.poll_interval).await;
                None
            }
        };

        let duration = start_time.elapsed();
        self.stats.record(outcome, duration);
        self.set_current(None);
        self.stats.decrement_busy();

        match outcome {
            Some(status) => info!(
                worker_id = %self.id,
                clone_id = %clone_id,
                status = %status,
                duration_ms = duration.as_millis() as u64,
                "Finished processing clone"
            ),
            None => warn!(worker_id = %self.id, clone_id = %clone_id, "Clone could not be processed"),
        }
    }

    async fn drive(&self, clone_id: &str) -> Option<CloneStatus> {
        let Some(clone) = self.manager.get(clone_id) else {
            warn!(worker_id = %self.id, clone_id = clone_id, "Dequeued unknown clone");
            self.queue.release(clone_id).await;
            return None;
        };

        if clone.status() == CloneStatus::Created
            && !self.manager.initialize(clone_id, Map::new()).await
        {
            warn!(worker_id = %self.id, clone_id = clone_id, "Clone initialization failed");
        }

        match clone.status() {
            CloneStatus::Initialized | CloneStatus::Paused => {
                self.manager.start(clone_id).await;
            }
            status => {
                warn!(
                    worker_id = %self.id,
                    clone_id = clone_id,
                    status = %status,
                    "Clone is not startable"
                );
            }
        }

        let status = clone.status();
        if status.is_terminal() {
            self.queue.release(clone_id).await;
        }
        Some(status)
    }

    fn set_current(&self, clone_id: Option<String>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = clone_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clones::CloneRegistry;
    use crate::scheduler::ManagerConfig;
    use crate::storage::{MemoryStore, NamespacedStore};

    fn pool_with(config: WorkerPoolConfig) -> (Arc<WorkerPool>, Arc<CloneManager>, Arc<CloneQueue>, EventBus) {
        let bus = EventBus::new();
        let manager = CloneManager::new(
            ManagerConfig::default(),
            Arc::new(CloneRegistry::with_builtins()),
            bus.clone(),
            NamespacedStore::new(Arc::new(MemoryStore::new()), "test"),
        );
        let queue = CloneQueue::in_memory(bus.clone());
        let pool = WorkerPool::new(config, Arc::clone(&manager), Arc::clone(&queue), bus.clone());
        (pool, manager, queue, bus)
    }

    fn fast_config(initial: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(initial)
            .with_bounds(1, 4)
            .with_poll_interval(Duration::from_millis(5))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.initial_workers, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_worker_pool_config_clamp() {
        let config = WorkerPoolConfig::new(3).with_bounds(2, 5);
        assert_eq!(config.clamp(0), 2);
        assert_eq!(config.clamp(4), 4);
        assert_eq!(config.clamp(99), 5);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            busy_workers: 2,
            clones_completed: 80,
            clones_failed: 15,
            clones_other: 5,
            average_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(Some(CloneStatus::Completed), Duration::from_secs(10));
        stats.record(Some(CloneStatus::Completed), Duration::from_secs(20));
        stats.record(None, Duration::from_secs(5));
        stats.record(Some(CloneStatus::Terminated), Duration::from_secs(1));

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.clones_completed, 2);
        assert_eq!(pool_stats.clones_failed, 1);
        assert_eq!(pool_stats.clones_other, 1);
        // Average: (10000 + 20000 + 5000 + 1000) / 4 = 9000 ms
        assert_eq!(pool_stats.average_duration.as_millis(), 9000);

        stats.increment_busy();
        stats.increment_busy();
        stats.decrement_busy();
        assert_eq!(stats.to_pool_stats(4).busy_workers, 1);
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_when_stopped() {
        let (pool, _, _, _) = pool_with(fast_config(2));
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));

        pool.start().unwrap();
        assert_eq!(pool.num_workers(), 2);
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert_eq!(pool.num_workers(), 0);
    }

    #[tokio::test]
    async fn test_workers_drive_queued_clones_to_completion() {
        let (pool, manager, queue, _) = pool_with(fast_config(2));
        let mut ids = Vec::new();
        for _ in 0..3 {
            let clone = manager.create("Echo", None, None).await.unwrap();
            assert!(queue.enqueue(clone.id(), 1).await);
            ids.push(clone.id().to_string());
        }

        pool.start().unwrap();
        for _ in 0..400 {
            if pool.stats().clones_completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for id in &ids {
            assert_eq!(manager.get(id).unwrap().status(), CloneStatus::Completed);
        }
        assert_eq!(queue.queue_size().await, 0);
        assert_eq!(queue.processing_size().await, 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_clone_is_released() {
        let (pool, _, queue, _) = pool_with(fast_config(1));
        queue.enqueue("ghost", 1).await;

        pool.start().unwrap();
        for _ in 0..400 {
            if pool.stats().total_processed() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats().clones_failed, 1);
        assert_eq!(queue.processing_size().await, 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_adjust_pool_size_clamps_and_converges() {
        let (pool, _, _, bus) = pool_with(fast_config(2));
        let resized = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&resized);
        bus.subscribe(
            POOL_RESIZED_EVENT,
            EventHandler::sync(move |event| {
                sink.lock().unwrap().push(event.field_u64("current").unwrap());
                Ok(())
            }),
        );

        // Not running: only the target changes.
        assert_eq!(pool.adjust_pool_size(3), 3);
        assert_eq!(pool.num_workers(), 0);

        pool.start().unwrap();
        assert_eq!(pool.num_workers(), 3);

        assert_eq!(pool.adjust_pool_size(10), 4);
        assert_eq!(pool.num_workers(), 4);
        assert_eq!(pool.adjust_pool_size(0), 1);
        assert_eq!(pool.num_workers(), 1);
        assert_eq!(pool.adjust_pool_size(1), 1);

        assert_eq!(*resized.lock().unwrap(), vec![3, 4, 1]);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stop_event() {
        let (pool, _, _, bus) = pool_with(fast_config(3));
        pool.start().unwrap();
        let ids = pool.worker_ids();

        bus.publish(Event::new(WORKER_STOP_EVENT, "test").with_field("worker_id", ids[1].clone()));
        assert_eq!(pool.num_workers(), 2);
        assert!(!pool.worker_ids().contains(&ids[1]));
        assert!(!pool.stop_worker("worker-missing"));

        bus.publish(Event::new(WORKER_STOP_EVENT, "test"));
        assert_eq!(pool.num_workers(), 0);
        pool.shutdown().await.unwrap();
    }
}
