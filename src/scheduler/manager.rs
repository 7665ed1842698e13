//! Clone manager: owns every clone, persists snapshots, and runs the
//! heartbeat that terminates stale clones.
//!
//! # Persistence
//!
//! Snapshots ([`CloneInfo`]) are written under `clone:<id>` in the manager's
//! namespaced store:
//!
//! - when a clone is created
//! - on every heartbeat while the clone is active
//! - on every terminal event (completed, failed, terminated)
//!
//! # Restart recovery
//!
//! [`CloneManager::startup`] scans the store for snapshots that are not
//! terminal and re-creates each as a fresh CREATED clone with the same id,
//! type and name. Internal state of the previous instance is not restored and
//! the placeholder is not enqueued: it runs from scratch once something
//! initializes and starts it.
//!
//! # Heartbeat
//!
//! Every `heartbeat_interval` the manager records a heartbeat on each active
//! clone and persists it. Any active clone whose last reported activity is
//! older than `stale_threshold` is terminated unconditionally via
//! [`CloneUnit::terminate_stale`]. That path may leave resources held by an
//! uncooperative `execute` unreleased.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clones::{CloneEventKind, CloneInfo, CloneRegistry, CloneStatus, CloneUnit};
use crate::error::ManagerError;
use crate::events::bus::panic_message;
use crate::events::{Event, EventBus, EventHandler, EventPriority, SubscribeOptions};
use crate::storage::{KeyValueStore, NamespacedStore};

const SNAPSHOT_PREFIX: &str = "clone:";

/// Configuration for the clone manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How often the heartbeat runs.
    pub heartbeat_interval: Duration,
    /// Inactivity after which an active clone is considered stale.
    pub stale_threshold: Duration,
    /// Upper bound on a stale clone's cleanup hook.
    pub hook_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(300),
            hook_timeout: Duration::from_secs(10),
        }
    }
}

impl ManagerConfig {
    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the stale threshold.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Sets the cleanup timeout for stale clones.
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }
}

/// Owns the canonical instance of every clone.
pub struct CloneManager {
    config: ManagerConfig,
    registry: Arc<CloneRegistry>,
    bus: EventBus,
    store: NamespacedStore,
    clones: RwLock<HashMap<String, Arc<CloneUnit>>>,
    shutdown_tx: broadcast::Sender<()>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
    subscriber_id: String,
}

impl CloneManager {
    /// Creates a manager and subscribes it to terminal clone events.
    ///
    /// # Arguments
    ///
    /// * `config` - Heartbeat settings
    /// * `registry` - Clone types available to `create`
    /// * `bus` - Bus shared with the clones, queue and pool
    /// * `store` - Namespaced store for snapshots
    pub fn new(
        config: ManagerConfig,
        registry: Arc<CloneRegistry>,
        bus: EventBus,
        store: NamespacedStore,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = Arc::new(Self {
            config,
            registry,
            bus,
            store,
            clones: RwLock::new(HashMap::new()),
            shutdown_tx,
            heartbeat: Mutex::new(None),
            is_running: AtomicBool::new(false),
            subscriber_id: format!("clone_manager:{}", Uuid::new_v4()),
        });
        manager.subscribe_terminal_events();
        manager
    }

    fn subscribe_terminal_events(self: &Arc<Self>) {
        for kind in CloneEventKind::TERMINAL {
            let weak = Arc::downgrade(self);
            let handler = EventHandler::asynchronous(move |event: Arc<Event>| {
                let weak = weak.clone();
                async move {
                    let Some(manager) = weak.upgrade() else {
                        return Ok(());
                    };
                    if let Some(clone) = event.field_str("clone_id").and_then(|id| manager.get(id)) {
                        manager.persist(&clone).await;
                    }
                    Ok(())
                }
            });
            self.bus.subscribe_with(
                kind.as_str(),
                handler,
                SubscribeOptions::new()
                    .with_subscriber_id(self.subscriber_id.clone())
                    .with_priority(EventPriority::High),
            );
        }
    }

    /// Returns the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns the clone type registry.
    pub fn registry(&self) -> &Arc<CloneRegistry> {
        &self.registry
    }

    /// Whether the heartbeat is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Creates a clone of a registered type and records it.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Registry` for an unknown type and
    /// `ManagerError::DuplicateId` if `id` is already in use.
    pub async fn create(
        &self,
        clone_type: &str,
        id: Option<String>,
        name: Option<String>,
    ) -> Result<Arc<CloneUnit>, ManagerError> {
        if let Some(id) = id.as_deref() {
            if self.contains(id) {
                return Err(ManagerError::DuplicateId(id.to_string()));
            }
        }

        let clone = Arc::new(self.registry.create(clone_type, id, name, &self.bus)?);
        {
            let mut clones = self.clones.write().unwrap_or_else(PoisonError::into_inner);
            if clones.contains_key(clone.id()) {
                return Err(ManagerError::DuplicateId(clone.id().to_string()));
            }
            clones.insert(clone.id().to_string(), Arc::clone(&clone));
        }

        info!(clone_id = %clone.id(), clone_type = clone_type, "Created clone");
        self.persist(&clone).await;
        Ok(clone)
    }

    /// Returns the clone with `clone_id`.
    pub fn get(&self, clone_id: &str) -> Option<Arc<CloneUnit>> {
        self.clones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(clone_id)
            .cloned()
    }

    /// Whether a clone with `clone_id` is known.
    pub fn contains(&self, clone_id: &str) -> bool {
        self.clones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(clone_id)
    }

    /// All clones, in no particular order.
    pub fn list(&self) -> Vec<Arc<CloneUnit>> {
        self.clones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Clones currently in `status`.
    pub fn list_by_status(&self, status: CloneStatus) -> Vec<Arc<CloneUnit>> {
        self.list()
            .into_iter()
            .filter(|clone| clone.status() == status)
            .collect()
    }

    /// Number of known clones.
    pub fn len(&self) -> usize {
        self.clones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no clones are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone counts per status.
    pub fn status_counts(&self) -> HashMap<CloneStatus, usize> {
        let mut counts = HashMap::new();
        for clone in self.list() {
            *counts.entry(clone.status()).or_insert(0) += 1;
        }
        counts
    }

    /// Initializes a CREATED clone with `config`.
    pub async fn initialize(&self, clone_id: &str, config: Map<String, Value>) -> bool {
        let Some(clone) = self.lookup(clone_id, "initialize") else {
            return false;
        };
        if clone.status() != CloneStatus::Created {
            warn!(clone_id = clone_id, status = %clone.status(), "Clone already initialized");
            return false;
        }
        clone.initialize(config).await
    }

    /// Starts an INITIALIZED or PAUSED clone and waits for execution to
    /// return.
    pub async fn start(&self, clone_id: &str) -> bool {
        let Some(clone) = self.lookup(clone_id, "start") else {
            return false;
        };
        if !matches!(clone.status(), CloneStatus::Initialized | CloneStatus::Paused) {
            warn!(clone_id = clone_id, status = %clone.status(), "Clone cannot be started");
            return false;
        }
        clone.start().await
    }

    /// Stops a RUNNING or PAUSED clone.
    pub async fn stop(&self, clone_id: &str) -> bool {
        let Some(clone) = self.lookup(clone_id, "stop") else {
            return false;
        };
        if !clone.is_active() {
            warn!(clone_id = clone_id, status = %clone.status(), "Clone is not active");
            return false;
        }
        clone.stop().await
    }

    /// Pauses a RUNNING clone.
    pub async fn pause(&self, clone_id: &str) -> bool {
        let Some(clone) = self.lookup(clone_id, "pause") else {
            return false;
        };
        if clone.status() != CloneStatus::Running {
            warn!(clone_id = clone_id, status = %clone.status(), "Clone is not running");
            return false;
        }
        clone.pause().await
    }

    /// Resumes a PAUSED clone and waits for execution to return.
    pub async fn resume(&self, clone_id: &str) -> bool {
        let Some(clone) = self.lookup(clone_id, "resume") else {
            return false;
        };
        if clone.status() != CloneStatus::Paused {
            warn!(clone_id = clone_id, status = %clone.status(), "Clone is not paused");
            return false;
        }
        clone.resume().await
    }

    /// Removes a clone and its snapshot.
    ///
    /// An active clone is only removed with `force`, in which case it is
    /// stopped first.
    pub async fn remove(&self, clone_id: &str, force: bool) -> bool {
        let Some(clone) = self.lookup(clone_id, "remove") else {
            return false;
        };
        if clone.is_active() {
            if !force {
                warn!(clone_id = clone_id, "Refusing to remove active clone without force");
                return false;
            }
            info!(clone_id = clone_id, "Stopping active clone before removal");
            clone.stop().await;
        }

        self.clones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(clone_id);
        if let Err(e) = self.store.delete(&snapshot_key(clone_id)).await {
            warn!(clone_id = clone_id, error = %e, "Failed to delete clone snapshot");
        }
        info!(clone_id = clone_id, "Removed clone");
        true
    }

    /// Reads persisted snapshots, including terminal ones.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Storage` if the store cannot be listed.
    pub async fn snapshots(&self) -> Result<Vec<CloneInfo>, ManagerError> {
        let mut infos = Vec::new();
        for key in self.store.keys(&format!("{}*", SNAPSHOT_PREFIX)).await? {
            match self.store.get(&key).await? {
                Some(value) => match serde_json::from_value::<CloneInfo>(value) {
                    Ok(info) => infos.push(info),
                    Err(e) => warn!(key = %key, error = %e, "Skipping unreadable snapshot"),
                },
                None => debug!(key = %key, "Snapshot vanished while listing"),
            }
        }
        infos.sort_by(|a, b| a.creation_time.cmp(&b.creation_time));
        Ok(infos)
    }

    /// Re-creates placeholders for persisted clones that never reached a
    /// terminal state. Returns how many were recovered.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Storage` if the store cannot be read.
    pub async fn recover(&self) -> Result<usize, ManagerError> {
        let mut recovered = 0;
        for info in self.snapshots().await? {
            if info.status.is_terminal() || self.contains(&info.clone_id) {
                continue;
            }
            if !self.registry.contains(&info.clone_type) {
                warn!(
                    clone_id = %info.clone_id,
                    clone_type = %info.clone_type,
                    "Cannot recover clone of unregistered type"
                );
                continue;
            }
            match self
                .create(&info.clone_type, Some(info.clone_id.clone()), Some(info.name.clone()))
                .await
            {
                Ok(_) => {
                    info!(
                        clone_id = %info.clone_id,
                        previous_status = %info.status,
                        "Recovered clone placeholder"
                    );
                    recovered += 1;
                }
                Err(e) => warn!(clone_id = %info.clone_id, error = %e, "Failed to recover clone"),
            }
        }
        Ok(recovered)
    }

    /// Recovers persisted clones and starts the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::AlreadyRunning` if called twice, or a storage
    /// error from recovery.
    pub async fn startup(self: &Arc<Self>) -> Result<usize, ManagerError> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ManagerError::AlreadyRunning);
        }

        let recovered = match self.recover().await {
            Ok(recovered) => recovered,
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let handle = tokio::spawn(heartbeat_loop(
            Arc::downgrade(self),
            self.shutdown_tx.subscribe(),
            self.config.heartbeat_interval,
        ));
        *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            recovered = recovered,
            interval_ms = self.config.heartbeat_interval.as_millis() as u64,
            "Clone manager started"
        );
        Ok(recovered)
    }

    /// Stops the heartbeat and every active clone, then persists them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Heartbeat task panicked during shutdown");
            }
        }

        for clone in self.list().into_iter().filter(|c| c.is_active()) {
            clone.stop().await;
            self.persist(&clone).await;
        }
        self.is_running.store(false, Ordering::SeqCst);
        info!("Clone manager shut down");
    }

    /// Runs one heartbeat pass. Returns the number of stale clones terminated.
    pub async fn heartbeat_once(&self) -> usize {
        let now = Utc::now();
        let active: Vec<Arc<CloneUnit>> =
            self.list().into_iter().filter(|c| c.is_active()).collect();

        let mut terminated = 0;
        for clone in active {
            if clone.is_stale(now, self.config.stale_threshold) {
                warn!(
                    clone_id = %clone.id(),
                    last_active = ?clone.last_active_time(),
                    "Terminating stale clone"
                );
                if clone.terminate_stale(self.config.hook_timeout).await {
                    terminated += 1;
                }
            } else {
                clone.record_heartbeat();
            }
            self.persist(&clone).await;
        }
        terminated
    }

    /// Writes the clone's snapshot. Failures are logged, not returned.
    pub async fn persist(&self, clone: &CloneUnit) -> bool {
        let value = match serde_json::to_value(clone.info()) {
            Ok(value) => value,
            Err(e) => {
                error!(clone_id = %clone.id(), error = %e, "Failed to serialize clone snapshot");
                return false;
            }
        };
        match self.store.set(&snapshot_key(clone.id()), value, None).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(clone_id = %clone.id(), error = %e, "Failed to persist clone snapshot");
                false
            }
        }
    }

    fn lookup(&self, clone_id: &str, operation: &str) -> Option<Arc<CloneUnit>> {
        let clone = self.get(clone_id);
        if clone.is_none() {
            warn!(clone_id = clone_id, operation = operation, "Clone not found");
        }
        clone
    }
}

impl Drop for CloneManager {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscriber_id, None);
    }
}

impl std::fmt::Debug for CloneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneManager")
            .field("clones", &self.len())
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn snapshot_key(clone_id: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, clone_id)
}

async fn heartbeat_loop(
    manager: Weak<CloneManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };
        match AssertUnwindSafe(manager.heartbeat_once()).catch_unwind().await {
            Ok(0) => {}
            Ok(terminated) => info!(terminated = terminated, "Heartbeat terminated stale clones"),
            Err(panic) => {
                error!(panic = %panic_message(panic.as_ref()), "Heartbeat pass panicked");
                drop(manager);
                tokio::time::sleep(interval).await;
            }
        }
    }
    debug!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clones::unit::tests::ScriptedWork;
    use crate::clones::CloneFactory;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use tokio::sync::Notify;

    fn gated_registry(gate: Arc<Notify>) -> Arc<CloneRegistry> {
        let registry = CloneRegistry::with_builtins();
        let factory: CloneFactory = Arc::new(move || -> Box<dyn crate::clones::CloneWork> {
            Box::new(ScriptedWork {
                gate: Some(Arc::clone(&gate)),
                ..Default::default()
            })
        });
        registry.register("Gated", factory).unwrap();
        Arc::new(registry)
    }

    fn manager_with(
        registry: Arc<CloneRegistry>,
        backend: Arc<dyn KeyValueStore>,
        config: ManagerConfig,
    ) -> Arc<CloneManager> {
        CloneManager::new(
            config,
            registry,
            EventBus::new(),
            NamespacedStore::new(backend, "manager"),
        )
    }

    fn manager() -> Arc<CloneManager> {
        manager_with(
            Arc::new(CloneRegistry::with_builtins()),
            Arc::new(MemoryStore::new()),
            ManagerConfig::default(),
        )
    }

    async fn start_in_background(manager: &Arc<CloneManager>, id: &str) -> JoinHandle<bool> {
        let runner = Arc::clone(manager);
        let id_owned = id.to_string();
        let handle = tokio::spawn(async move { runner.start(&id_owned).await });
        let clone = manager.get(id).unwrap();
        while clone.status() != CloneStatus::Running {
            tokio::task::yield_now().await;
        }
        handle
    }

    #[test]
    fn test_manager_config_builder() {
        let config = ManagerConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_stale_threshold(Duration::from_secs(1))
            .with_hook_timeout(Duration::from_millis(5));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(config.stale_threshold, Duration::from_secs(1));
        assert_eq!(config.hook_timeout, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_create_and_duplicate_id() {
        let manager = manager();
        let clone = manager
            .create("Echo", Some("c-1".to_string()), None)
            .await
            .unwrap();
        assert_eq!(clone.status(), CloneStatus::Created);
        assert!(manager.contains("c-1"));

        let err = manager
            .create("Echo", Some("c-1".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateId(_)));

        let err = manager.create("Nope", None, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::Registry(_)));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_return_false() {
        let manager = manager();
        assert!(!manager.initialize("missing", Map::new()).await);
        assert!(!manager.start("missing").await);
        assert!(!manager.stop("missing").await);
        assert!(!manager.pause("missing").await);
        assert!(!manager.resume("missing").await);
        assert!(!manager.remove("missing", true).await);
    }

    #[tokio::test]
    async fn test_lifecycle_through_manager_persists_terminal_snapshot() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let manager = manager_with(
            Arc::new(CloneRegistry::with_builtins()),
            Arc::clone(&backend),
            ManagerConfig::default(),
        );
        manager
            .create("Echo", Some("e-1".to_string()), None)
            .await
            .unwrap();

        let mut config = Map::new();
        config.insert("message".to_string(), json!("hi"));
        assert!(manager.initialize("e-1", config).await);
        assert!(!manager.initialize("e-1", Map::new()).await);
        assert!(manager.start("e-1").await);

        let store = NamespacedStore::new(backend, "manager");
        let mut status = None;
        for _ in 0..100 {
            status = store
                .get("clone:e-1")
                .await
                .unwrap()
                .and_then(|v| v.get("status").cloned());
            if status == Some(json!("COMPLETED")) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(status, Some(json!("COMPLETED")));
    }

    #[tokio::test]
    async fn test_remove_active_requires_force() {
        let gate = Arc::new(Notify::new());
        let manager = manager_with(
            gated_registry(Arc::clone(&gate)),
            Arc::new(MemoryStore::new()),
            ManagerConfig::default(),
        );
        manager
            .create("Gated", Some("g-1".to_string()), None)
            .await
            .unwrap();
        assert!(manager.initialize("g-1", Map::new()).await);
        let run = start_in_background(&manager, "g-1").await;

        assert!(!manager.remove("g-1", false).await);
        assert_eq!(manager.get("g-1").unwrap().status(), CloneStatus::Running);

        let clone = manager.get("g-1").unwrap();
        assert!(manager.remove("g-1", true).await);
        assert!(!manager.contains("g-1"));
        assert_eq!(clone.status(), CloneStatus::Terminated);

        gate.notify_one();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_terminates_stale_clone() {
        let gate = Arc::new(Notify::new());
        let manager = manager_with(
            gated_registry(Arc::clone(&gate)),
            Arc::new(MemoryStore::new()),
            ManagerConfig::default().with_stale_threshold(Duration::from_secs(60)),
        );
        manager
            .create("Gated", Some("fresh".to_string()), None)
            .await
            .unwrap();
        manager
            .create("Gated", Some("stale".to_string()), None)
            .await
            .unwrap();
        for id in ["fresh", "stale"] {
            assert!(manager.initialize(id, Map::new()).await);
        }
        let _fresh = start_in_background(&manager, "fresh").await;
        let _stale = start_in_background(&manager, "stale").await;

        manager
            .get("stale")
            .unwrap()
            .mark_active_at(Utc::now() - chrono::Duration::seconds(120));

        assert_eq!(manager.heartbeat_once().await, 1);
        assert_eq!(manager.get("stale").unwrap().status(), CloneStatus::Terminated);
        assert_eq!(manager.get("fresh").unwrap().status(), CloneStatus::Running);
        assert!(manager.get("fresh").unwrap().info().last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_recover_creates_placeholders_for_unfinished_clones() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let gate = Arc::new(Notify::new());
        let first = manager_with(
            gated_registry(Arc::clone(&gate)),
            Arc::clone(&backend),
            ManagerConfig::default(),
        );
        first
            .create("Gated", Some("running".to_string()), Some("keep-me".to_string()))
            .await
            .unwrap();
        first
            .create("Echo", Some("done".to_string()), None)
            .await
            .unwrap();
        assert!(first.initialize("running", Map::new()).await);
        let _run = start_in_background(&first, "running").await;
        assert!(first.persist(&first.get("running").unwrap()).await);
        assert!(first.initialize("done", Map::new()).await);
        assert!(first.start("done").await);
        assert!(first.persist(&first.get("done").unwrap()).await);

        let second = manager_with(
            gated_registry(Arc::clone(&gate)),
            Arc::clone(&backend),
            ManagerConfig::default(),
        );
        assert_eq!(second.startup().await.unwrap(), 1);
        assert!(matches!(
            second.startup().await,
            Err(ManagerError::AlreadyRunning)
        ));

        let placeholder = second.get("running").unwrap();
        assert_eq!(placeholder.status(), CloneStatus::Created);
        assert_eq!(placeholder.name(), "keep-me");
        assert!(!second.contains("done"));

        second.shutdown().await;
        assert!(!second.is_running());
    }

    #[tokio::test]
    async fn test_background_heartbeat_runs_until_shutdown() {
        let gate = Arc::new(Notify::new());
        let manager = manager_with(
            gated_registry(Arc::clone(&gate)),
            Arc::new(MemoryStore::new()),
            ManagerConfig::default()
                .with_heartbeat_interval(Duration::from_millis(10))
                .with_stale_threshold(Duration::from_secs(60)),
        );
        manager
            .create("Gated", Some("s".to_string()), None)
            .await
            .unwrap();
        assert!(manager.initialize("s", Map::new()).await);
        manager.startup().await.unwrap();
        let _run = start_in_background(&manager, "s").await;

        manager
            .get("s")
            .unwrap()
            .mark_active_at(Utc::now() - chrono::Duration::seconds(120));

        let clone = manager.get("s").unwrap();
        for _ in 0..200 {
            if clone.status() == CloneStatus::Terminated {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(clone.status(), CloneStatus::Terminated);
        assert_eq!(clone.failure_reason().as_deref(), Some(crate::clones::STALE_REASON));

        manager.shutdown().await;
    }
}
