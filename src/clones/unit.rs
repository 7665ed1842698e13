//! A clone: one schedulable unit of work with its own lifecycle.
//!
//! [`CloneUnit`] owns the state machine and event emission; the work itself
//! is supplied by a [`CloneWork`] implementation with two required hooks
//! (`initialize`, `execute`) and two optional ones (`pause`, `cleanup`).
//!
//! # Hook boundary
//!
//! Hooks return `anyhow::Result<()>`. The unit invokes each hook behind a
//! single `catch_unwind` so neither an `Err` nor a panic ever reaches the
//! caller:
//!
//! | Hook | `Err` | panic |
//! |------|-------|-------|
//! | initialize | FAILED | FAILED |
//! | execute | FAILED | FAILED |
//! | pause | pause refused, state unchanged | FAILED |
//! | cleanup | TERMINATED, `stop` returns false | TERMINATED, `stop` returns false |
//!
//! # Ordering
//!
//! State is mutated under the unit's lock, the lock is released, then the
//! event is published. Subscribers never see an event for a state the unit
//! has not entered.

use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::status::{CloneEventKind, CloneStatus};
use crate::events::bus::panic_message;
use crate::events::{Event, EventBus};

/// Failure reason recorded when the heartbeat terminates a stale clone.
pub const STALE_REASON: &str = "stale";

/// The work performed by a clone type.
///
/// Implementations receive the owning [`CloneUnit`] so they can read their
/// configuration, report progress and store results.
#[async_trait]
pub trait CloneWork: Send + Sync {
    /// Prepares resources. Runs once, from CREATED.
    async fn initialize(&self, clone: &CloneUnit) -> anyhow::Result<()>;

    /// Performs the work. Runs on start and again on every resume.
    ///
    /// Returning while the clone is PAUSED is treated as a yield: the clone
    /// stays PAUSED and the next resume calls `execute` again.
    async fn execute(&self, clone: &CloneUnit) -> anyhow::Result<()>;

    /// Called before RUNNING -> PAUSED. An `Err` refuses the pause.
    async fn pause(&self, _clone: &CloneUnit) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called before RUNNING/PAUSED -> TERMINATED.
    async fn cleanup(&self, _clone: &CloneUnit) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Serializable snapshot of a clone, used for persistence and inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloneInfo {
    pub clone_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub clone_type: String,
    pub status: CloneStatus,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_active_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Seconds between start and end (or now, while active).
    pub runtime_secs: Option<f64>,
    pub progress: f64,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub results: Map<String, Value>,
}

#[derive(Debug)]
struct CloneState {
    status: CloneStatus,
    creation_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_active_time: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    progress: f64,
    failure_reason: Option<String>,
    metadata: Map<String, Value>,
    results: Map<String, Value>,
    config: Map<String, Value>,
    initializing: bool,
}

impl CloneState {
    fn execution_secs(&self, until: DateTime<Utc>) -> Option<f64> {
        self.start_time
            .map(|start| (until - start).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Initialize,
    Execute,
    Pause,
    Cleanup,
}

enum HookOutcome {
    Ok,
    Err(String),
    Panicked(String),
}

impl HookOutcome {
    fn is_ok(&self) -> bool {
        matches!(self, HookOutcome::Ok)
    }
}

/// One instance of schedulable work.
///
/// The [`CloneManager`](crate::scheduler::CloneManager) owns the canonical
/// `Arc<CloneUnit>`; the queue only ever holds the id.
pub struct CloneUnit {
    id: String,
    type_name: String,
    name: String,
    state: Mutex<CloneState>,
    work: Box<dyn CloneWork>,
    bus: EventBus,
}

impl std::fmt::Debug for CloneUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneUnit")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl CloneUnit {
    /// Creates a clone in CREATED state and publishes `clone.created`.
    ///
    /// # Arguments
    ///
    /// * `id` - Clone id; a UUID is generated when `None`
    /// * `type_name` - Registered type name
    /// * `name` - Display name; defaults to `<type>_<first 8 chars of id>`
    /// * `work` - The hooks implementing this clone type
    /// * `bus` - Bus receiving lifecycle events
    pub fn new(
        id: Option<String>,
        type_name: impl Into<String>,
        name: Option<String>,
        work: Box<dyn CloneWork>,
        bus: EventBus,
    ) -> Self {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let type_name = type_name.into();
        let name = name.unwrap_or_else(|| {
            format!("{}_{}", type_name, id.chars().take(8).collect::<String>())
        });
        let creation_time = Utc::now();

        let unit = Self {
            id,
            type_name,
            name,
            state: Mutex::new(CloneState {
                status: CloneStatus::Created,
                creation_time,
                start_time: None,
                end_time: None,
                last_active_time: None,
                last_heartbeat: None,
                progress: 0.0,
                failure_reason: None,
                metadata: Map::new(),
                results: Map::new(),
                config: Map::new(),
                initializing: false,
            }),
            work,
            bus,
        };

        unit.emit(
            CloneEventKind::Created,
            payload([
                ("creation_time", json!(creation_time.to_rfc3339())),
                ("clone_type", json!(unit.type_name)),
            ]),
        );
        unit
    }

    /// Clone id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registered type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub fn status(&self) -> CloneStatus {
        self.state().status
    }

    /// Current progress in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        self.state().progress
    }

    /// Configuration supplied at initialization.
    pub fn config(&self) -> Map<String, Value> {
        self.state().config.clone()
    }

    /// Results recorded so far.
    pub fn results(&self) -> Map<String, Value> {
        self.state().results.clone()
    }

    /// Metadata recorded so far.
    pub fn metadata(&self) -> Map<String, Value> {
        self.state().metadata.clone()
    }

    /// Failure reason, if FAILED (or `stale` if terminated by the heartbeat).
    pub fn failure_reason(&self) -> Option<String> {
        self.state().failure_reason.clone()
    }

    /// Last time the clone reported activity.
    pub fn last_active_time(&self) -> Option<DateTime<Utc>> {
        self.state().last_active_time
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Completed, failed or terminated.
    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    /// Whether the clone is active and has not reported activity for longer
    /// than `threshold` as of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let state = self.state();
        if !state.status.is_active() {
            return false;
        }
        state
            .last_active_time
            .and_then(|last| (now - last).to_std().ok())
            .map(|age| age > threshold)
            .unwrap_or(false)
    }

    /// Snapshot of the clone.
    pub fn info(&self) -> CloneInfo {
        let state = self.state();
        let runtime_secs = state.execution_secs(state.end_time.unwrap_or_else(Utc::now));
        CloneInfo {
            clone_id: self.id.clone(),
            name: self.name.clone(),
            clone_type: self.type_name.clone(),
            status: state.status,
            creation_time: state.creation_time,
            start_time: state.start_time,
            end_time: state.end_time,
            last_active_time: state.last_active_time,
            last_heartbeat: state.last_heartbeat,
            runtime_secs,
            progress: state.progress,
            failure_reason: state.failure_reason.clone(),
            metadata: state.metadata.clone(),
            results: state.results.clone(),
        }
    }

    /// CREATED -> INITIALIZED, or CREATED -> FAILED if the hook fails.
    ///
    /// Returns false without side effects when the clone is not CREATED or an
    /// initialization is already in flight.
    pub async fn initialize(&self, config: Map<String, Value>) -> bool {
        {
            let mut state = self.state();
            if state.status != CloneStatus::Created || state.initializing {
                warn!(
                    clone_id = %self.id,
                    status = %state.status,
                    "Cannot initialize clone"
                );
                return false;
            }
            state.initializing = true;
            state.config = config;
        }

        info!(clone_id = %self.id, "Initializing clone");
        let outcome = self.run_hook(Hook::Initialize).await;

        let mut state = self.state();
        state.initializing = false;
        match outcome {
            HookOutcome::Ok => {
                if !self.apply(&mut state, CloneStatus::Initialized) {
                    return false;
                }
                drop(state);
                self.emit(
                    CloneEventKind::Initialized,
                    payload([("initialized_time", json!(Utc::now().to_rfc3339()))]),
                );
                info!(clone_id = %self.id, "Clone initialized");
                true
            }
            HookOutcome::Err(e) | HookOutcome::Panicked(e) => {
                let event = self.fail(&mut state, format!("Initialization error: {}", e));
                drop(state);
                if let Some(event) = event {
                    self.emit(CloneEventKind::Failed, event);
                }
                false
            }
        }
    }

    /// INITIALIZED/PAUSED -> RUNNING, then runs `execute` to completion.
    ///
    /// Returns true when execution succeeded (or yielded while paused),
    /// false when the start was illegal or execution failed.
    pub async fn start(&self) -> bool {
        let started = {
            let mut state = self.state();
            let resumed = match state.status {
                CloneStatus::Initialized => false,
                CloneStatus::Paused => true,
                other => {
                    warn!(clone_id = %self.id, status = %other, "Cannot start clone");
                    return false;
                }
            };
            let now = Utc::now();
            if !resumed {
                state.start_time = Some(now);
            }
            if !self.apply(&mut state, CloneStatus::Running) {
                return false;
            }
            state.last_active_time = Some(now);
            payload([
                ("start_time", json!(state.start_time.map(|t| t.to_rfc3339()))),
                ("last_active_time", json!(now.to_rfc3339())),
                ("resumed", json!(resumed)),
            ])
        };
        self.emit(CloneEventKind::Started, started);
        info!(clone_id = %self.id, "Clone started");

        let outcome = self.run_hook(Hook::Execute).await;

        let mut state = self.state();
        let now = Utc::now();
        match (state.status, outcome) {
            (CloneStatus::Running, HookOutcome::Ok) => {
                state.status = CloneStatus::Completed;
                state.end_time = Some(now);
                state.progress = 1.0;
                let event = payload([
                    ("end_time", json!(now.to_rfc3339())),
                    ("execution_time", json!(state.execution_secs(now))),
                    ("results", Value::Object(state.results.clone())),
                ]);
                drop(state);
                self.emit(CloneEventKind::Completed, event);
                info!(clone_id = %self.id, "Clone execution completed");
                true
            }
            (CloneStatus::Paused, HookOutcome::Ok) => {
                debug!(clone_id = %self.id, "Execution yielded while paused");
                true
            }
            (CloneStatus::Running | CloneStatus::Paused, HookOutcome::Err(e))
            | (CloneStatus::Running | CloneStatus::Paused, HookOutcome::Panicked(e)) => {
                let event = self.fail(&mut state, format!("Execution error: {}", e));
                drop(state);
                if let Some(event) = event {
                    self.emit(CloneEventKind::Failed, event);
                }
                false
            }
            (status, outcome) => {
                debug!(
                    clone_id = %self.id,
                    status = %status,
                    "Execution finished after terminal transition, outcome discarded"
                );
                outcome.is_ok()
            }
        }
    }

    /// RUNNING -> PAUSED.
    ///
    /// Returns false without side effects unless the clone is RUNNING and the
    /// pause hook accepts.
    pub async fn pause(&self) -> bool {
        {
            let state = self.state();
            if state.status != CloneStatus::Running {
                warn!(clone_id = %self.id, status = %state.status, "Cannot pause clone");
                return false;
            }
        }

        info!(clone_id = %self.id, "Pausing clone");
        let outcome = self.run_hook(Hook::Pause).await;

        let mut state = self.state();
        match outcome {
            HookOutcome::Ok => {
                if state.status != CloneStatus::Running || !self.apply(&mut state, CloneStatus::Paused)
                {
                    return false;
                }
                let now = Utc::now();
                let event = payload([
                    ("pause_time", json!(now.to_rfc3339())),
                    ("execution_time_so_far", json!(state.execution_secs(now))),
                ]);
                drop(state);
                self.emit(CloneEventKind::Paused, event);
                true
            }
            HookOutcome::Err(e) => {
                error!(clone_id = %self.id, error = %e, "Pause refused by clone");
                false
            }
            HookOutcome::Panicked(e) => {
                let event = self.fail(&mut state, format!("Pause error: {}", e));
                drop(state);
                if let Some(event) = event {
                    self.emit(CloneEventKind::Failed, event);
                }
                false
            }
        }
    }

    /// PAUSED -> RUNNING by re-entering [`start`](Self::start).
    pub async fn resume(&self) -> bool {
        let status = self.status();
        if status != CloneStatus::Paused {
            warn!(clone_id = %self.id, status = %status, "Cannot resume clone");
            return false;
        }
        self.start().await
    }

    /// RUNNING/PAUSED -> TERMINATED after running the cleanup hook.
    ///
    /// Stopping is cooperative: an `execute` still in flight is not
    /// interrupted, its outcome is discarded when it returns. Returns false if
    /// the clone was not active or cleanup failed (the clone is terminated
    /// either way in the latter case).
    pub async fn stop(&self) -> bool {
        let status = self.status();
        if !status.is_active() {
            warn!(clone_id = %self.id, status = %status, "Cannot stop clone");
            return false;
        }

        info!(clone_id = %self.id, "Stopping clone");
        let cleanup_error = match self.run_hook(Hook::Cleanup).await {
            HookOutcome::Ok => None,
            HookOutcome::Err(e) | HookOutcome::Panicked(e) => Some(e),
        };
        let terminated = self.terminate(None, cleanup_error.clone());
        terminated && cleanup_error.is_none()
    }

    /// Unconditional termination used by the heartbeat for stale clones.
    ///
    /// Cleanup gets at most `cleanup_timeout`; the clone becomes TERMINATED
    /// with reason [`STALE_REASON`] whatever the hook does. Resources owned by
    /// an uncooperative `execute` may stay unreleased.
    pub async fn terminate_stale(&self, cleanup_timeout: Duration) -> bool {
        if !self.is_active() {
            return false;
        }

        let cleanup_error =
            match tokio::time::timeout(cleanup_timeout, self.run_hook(Hook::Cleanup)).await {
                Ok(HookOutcome::Ok) => None,
                Ok(HookOutcome::Err(e)) | Ok(HookOutcome::Panicked(e)) => Some(e),
                Err(_) => Some(format!("cleanup timed out after {:?}", cleanup_timeout)),
            };
        self.terminate(Some(STALE_REASON), cleanup_error)
    }

    /// Clamps `progress` to `[0.0, 1.0]`, refreshes activity and publishes
    /// `clone.progress`. Never changes status. NaN is ignored.
    pub fn update_progress(&self, progress: f64, message: Option<&str>) {
        if progress.is_nan() {
            warn!(clone_id = %self.id, "Ignoring NaN progress update");
            return;
        }
        let event = {
            let mut state = self.state();
            let now = Utc::now();
            state.progress = progress.clamp(0.0, 1.0);
            state.last_active_time = Some(now);
            payload([
                ("progress", json!(state.progress)),
                ("message", json!(message)),
                ("time", json!(now.to_rfc3339())),
            ])
        };
        self.emit(CloneEventKind::Progress, event);
    }

    /// Merges `metadata` into the clone's metadata.
    pub fn update_metadata(&self, metadata: Map<String, Value>) {
        {
            let mut state = self.state();
            state
                .metadata
                .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.emit(
            CloneEventKind::MetadataUpdated,
            payload([
                ("metadata", Value::Object(metadata)),
                ("time", json!(Utc::now().to_rfc3339())),
            ]),
        );
    }

    /// Records a result value.
    pub fn set_result(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.state().results.insert(key.clone(), value);
        self.emit(
            CloneEventKind::Result,
            payload([
                ("key", json!(key)),
                ("time", json!(Utc::now().to_rfc3339())),
            ]),
        );
    }

    /// Reports liveness without changing progress.
    pub fn touch(&self) {
        self.mark_active_at(Utc::now());
    }

    /// Sets the last activity time explicitly.
    pub fn mark_active_at(&self, at: DateTime<Utc>) {
        self.state().last_active_time = Some(at);
    }

    /// Records that the manager's heartbeat observed this clone.
    ///
    /// Does not count as clone activity.
    pub fn record_heartbeat(&self) {
        self.state().last_heartbeat = Some(Utc::now());
    }

    fn state(&self) -> MutexGuard<'_, CloneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, state: &mut CloneState, to: CloneStatus) -> bool {
        if !state.status.can_transition(to) {
            warn!(
                clone_id = %self.id,
                from = %state.status,
                to = %to,
                "Illegal clone transition"
            );
            return false;
        }
        state.status = to;
        true
    }

    /// Moves to FAILED if legal, returning the event payload.
    fn fail(&self, state: &mut CloneState, reason: String) -> Option<Map<String, Value>> {
        if !self.apply(state, CloneStatus::Failed) {
            return None;
        }
        let now = Utc::now();
        error!(clone_id = %self.id, reason = %reason, "Clone failed");
        state.end_time = Some(now);
        state.failure_reason = Some(reason.clone());
        Some(payload([
            ("failure_time", json!(now.to_rfc3339())),
            ("execution_time", json!(state.execution_secs(now))),
            ("failure_reason", json!(reason)),
        ]))
    }

    fn terminate(&self, reason: Option<&str>, cleanup_error: Option<String>) -> bool {
        let event = {
            let mut state = self.state();
            if !state.status.is_active() || !self.apply(&mut state, CloneStatus::Terminated) {
                return false;
            }
            let now = Utc::now();
            state.end_time = Some(now);
            if let Some(reason) = reason {
                state.failure_reason = Some(reason.to_string());
            }
            payload([
                ("termination_time", json!(now.to_rfc3339())),
                ("execution_time", json!(state.execution_secs(now))),
                ("reason", json!(reason)),
                ("error", json!(cleanup_error)),
            ])
        };
        if let Some(e) = &cleanup_error {
            error!(clone_id = %self.id, error = %e, "Clone cleanup failed");
        }
        self.emit(CloneEventKind::Terminated, event);
        info!(clone_id = %self.id, "Clone terminated");
        true
    }

    async fn run_hook(&self, hook: Hook) -> HookOutcome {
        let future = match hook {
            Hook::Initialize => self.work.initialize(self),
            Hook::Execute => self.work.execute(self),
            Hook::Pause => self.work.pause(self),
            Hook::Cleanup => self.work.cleanup(self),
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => HookOutcome::Ok,
            Ok(Err(e)) => HookOutcome::Err(format!("{:#}", e)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(clone_id = %self.id, hook = ?hook, panic = %message, "Clone hook panicked");
                HookOutcome::Panicked(message)
            }
        }
    }

    fn emit(&self, kind: CloneEventKind, payload: Map<String, Value>) {
        let event = Event::new(kind.as_str(), format!("clone:{}", self.id))
            .with_payload(payload)
            .with_field("clone_id", self.id.clone());
        self.bus.publish(event);
    }
}

fn payload<const N: usize>(fields: [(&str, Value); N]) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::EventHandler;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Configurable work used across the crate's tests.
    #[derive(Default)]
    pub(crate) struct ScriptedWork {
        pub fail_init: bool,
        pub fail_execute: bool,
        pub panic_execute: bool,
        pub refuse_pause: bool,
        pub fail_cleanup: bool,
        pub hang_cleanup: bool,
        /// When set, execute waits for a notification before returning.
        pub gate: Option<Arc<Notify>>,
        pub cleaned_up: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CloneWork for ScriptedWork {
        async fn initialize(&self, _clone: &CloneUnit) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("init refused");
            }
            Ok(())
        }

        async fn execute(&self, clone: &CloneUnit) -> anyhow::Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.panic_execute {
                panic!("execute exploded");
            }
            if self.fail_execute {
                anyhow::bail!("execute refused");
            }
            clone.set_result("done", json!(true));
            Ok(())
        }

        async fn pause(&self, _clone: &CloneUnit) -> anyhow::Result<()> {
            if self.refuse_pause {
                anyhow::bail!("cannot pause now");
            }
            Ok(())
        }

        async fn cleanup(&self, _clone: &CloneUnit) -> anyhow::Result<()> {
            if self.hang_cleanup {
                futures::future::pending::<()>().await;
            }
            self.cleaned_up.store(true, Ordering::SeqCst);
            if self.fail_cleanup {
                anyhow::bail!("cleanup refused");
            }
            Ok(())
        }
    }

    fn recording_bus() -> (EventBus, Arc<Mutex<Vec<Event>>>) {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        bus.subscribe(
            crate::events::WILDCARD,
            EventHandler::sync(move |event| {
                sink.lock().unwrap().push(event.clone());
                Ok(())
            }),
        );
        (bus, log)
    }

    fn types(log: &Arc<Mutex<Vec<Event>>>) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .filter(|t| t != "clone.result")
            .collect()
    }

    fn unit(work: ScriptedWork, bus: &EventBus) -> Arc<CloneUnit> {
        Arc::new(CloneUnit::new(None, "Scripted", None, Box::new(work), bus.clone()))
    }

    #[tokio::test]
    async fn test_happy_path_lifecycle() {
        let (bus, log) = recording_bus();
        let clone = unit(ScriptedWork::default(), &bus);
        assert_eq!(clone.status(), CloneStatus::Created);
        assert!(clone.name().starts_with("Scripted_"));

        assert!(clone.initialize(Map::new()).await);
        assert_eq!(clone.status(), CloneStatus::Initialized);

        assert!(clone.start().await);
        assert_eq!(clone.status(), CloneStatus::Completed);
        assert_eq!(clone.progress(), 1.0);
        assert_eq!(clone.results().get("done"), Some(&json!(true)));

        let info = clone.info();
        assert!(info.start_time.is_some());
        assert!(info.end_time.is_some());

        assert_eq!(
            types(&log),
            vec![
                "clone.created",
                "clone.initialized",
                "clone.started",
                "clone.completed"
            ]
        );
        for event in log.lock().unwrap().iter() {
            assert_eq!(event.field_str("clone_id"), Some(clone.id()));
        }
    }

    #[tokio::test]
    async fn test_illegal_pause_has_no_side_effects() {
        let (bus, log) = recording_bus();
        let clone = unit(ScriptedWork::default(), &bus);
        let before = clone.info();
        let events_before = log.lock().unwrap().len();

        assert!(!clone.pause().await);
        assert!(!clone.resume().await);
        assert!(!clone.stop().await);
        assert!(!clone.start().await);

        let after = clone.info();
        assert_eq!(after.status, CloneStatus::Created);
        assert_eq!(after.progress, before.progress);
        assert_eq!(after.start_time, before.start_time);
        assert_eq!(after.last_active_time, before.last_active_time);
        assert_eq!(log.lock().unwrap().len(), events_before);
    }

    #[tokio::test]
    async fn test_initialize_failure_marks_failed() {
        let (bus, log) = recording_bus();
        let clone = unit(
            ScriptedWork {
                fail_init: true,
                ..Default::default()
            },
            &bus,
        );

        assert!(!clone.initialize(Map::new()).await);
        assert_eq!(clone.status(), CloneStatus::Failed);
        assert!(clone
            .failure_reason()
            .unwrap()
            .contains("init refused"));
        assert_eq!(types(&log).last().unwrap(), "clone.failed");

        // Terminal: nothing further is legal.
        assert!(!clone.initialize(Map::new()).await);
        assert!(!clone.start().await);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_rejected() {
        let bus = EventBus::new();
        let clone = unit(ScriptedWork::default(), &bus);
        let mut config = Map::new();
        config.insert("message".to_string(), json!("hi"));

        assert!(clone.initialize(config).await);
        assert!(!clone.initialize(Map::new()).await);
        assert_eq!(clone.config().get("message"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_execute_error_and_panic_become_failed() {
        let bus = EventBus::new();

        let failing = unit(
            ScriptedWork {
                fail_execute: true,
                ..Default::default()
            },
            &bus,
        );
        assert!(failing.initialize(Map::new()).await);
        assert!(!failing.start().await);
        assert_eq!(failing.status(), CloneStatus::Failed);
        assert!(failing.failure_reason().unwrap().contains("execute refused"));

        let panicking = unit(
            ScriptedWork {
                panic_execute: true,
                ..Default::default()
            },
            &bus,
        );
        assert!(panicking.initialize(Map::new()).await);
        assert!(!panicking.start().await);
        assert_eq!(panicking.status(), CloneStatus::Failed);
        assert!(panicking
            .failure_reason()
            .unwrap()
            .contains("execute exploded"));
    }

    #[tokio::test]
    async fn test_pause_resume_and_stop() {
        let (bus, log) = recording_bus();
        let gate = Arc::new(Notify::new());
        let clone = unit(
            ScriptedWork {
                gate: Some(Arc::clone(&gate)),
                ..Default::default()
            },
            &bus,
        );
        assert!(clone.initialize(Map::new()).await);

        let runner = Arc::clone(&clone);
        let first_run = tokio::spawn(async move { runner.start().await });
        while clone.status() != CloneStatus::Running {
            tokio::task::yield_now().await;
        }

        assert!(clone.pause().await);
        assert_eq!(clone.status(), CloneStatus::Paused);

        // Execution returning while paused is a yield.
        gate.notify_one();
        assert!(first_run.await.unwrap());
        assert_eq!(clone.status(), CloneStatus::Paused);

        let runner = Arc::clone(&clone);
        let second_run = tokio::spawn(async move { runner.resume().await });
        while clone.status() != CloneStatus::Running {
            tokio::task::yield_now().await;
        }

        assert!(clone.stop().await);
        assert_eq!(clone.status(), CloneStatus::Terminated);

        // The in-flight execution finishes after termination and is discarded.
        gate.notify_one();
        assert!(second_run.await.unwrap());
        assert_eq!(clone.status(), CloneStatus::Terminated);

        let types = types(&log);
        assert!(types.ends_with(&[
            "clone.started".to_string(),
            "clone.paused".to_string(),
            "clone.started".to_string(),
            "clone.terminated".to_string(),
        ]));
    }

    #[tokio::test]
    async fn test_refused_pause_keeps_running() {
        let bus = EventBus::new();
        let gate = Arc::new(Notify::new());
        let clone = unit(
            ScriptedWork {
                gate: Some(Arc::clone(&gate)),
                refuse_pause: true,
                ..Default::default()
            },
            &bus,
        );
        assert!(clone.initialize(Map::new()).await);
        let runner = Arc::clone(&clone);
        let run = tokio::spawn(async move { runner.start().await });
        while clone.status() != CloneStatus::Running {
            tokio::task::yield_now().await;
        }

        assert!(!clone.pause().await);
        assert_eq!(clone.status(), CloneStatus::Running);

        gate.notify_one();
        assert!(run.await.unwrap());
        assert_eq!(clone.status(), CloneStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_with_failing_cleanup_still_terminates() {
        let bus = EventBus::new();
        let gate = Arc::new(Notify::new());
        let clone = unit(
            ScriptedWork {
                gate: Some(Arc::clone(&gate)),
                fail_cleanup: true,
                ..Default::default()
            },
            &bus,
        );
        assert!(clone.initialize(Map::new()).await);
        let runner = Arc::clone(&clone);
        let run = tokio::spawn(async move { runner.start().await });
        while clone.status() != CloneStatus::Running {
            tokio::task::yield_now().await;
        }

        assert!(!clone.stop().await);
        assert_eq!(clone.status(), CloneStatus::Terminated);
        gate.notify_one();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_stale_ignores_hanging_cleanup() {
        let bus = EventBus::new();
        let gate = Arc::new(Notify::new());
        let clone = unit(
            ScriptedWork {
                gate: Some(Arc::clone(&gate)),
                hang_cleanup: true,
                ..Default::default()
            },
            &bus,
        );
        assert!(clone.initialize(Map::new()).await);
        let runner = Arc::clone(&clone);
        let _run = tokio::spawn(async move { runner.start().await });
        while clone.status() != CloneStatus::Running {
            tokio::task::yield_now().await;
        }

        assert!(clone.terminate_stale(Duration::from_millis(20)).await);
        assert_eq!(clone.status(), CloneStatus::Terminated);
        assert_eq!(clone.failure_reason().as_deref(), Some(STALE_REASON));
    }

    #[tokio::test]
    async fn test_progress_is_clamped_and_never_changes_status() {
        let (bus, log) = recording_bus();
        let clone = unit(ScriptedWork::default(), &bus);

        clone.update_progress(1.7, Some("overshoot"));
        assert_eq!(clone.progress(), 1.0);
        clone.update_progress(-0.3, None);
        assert_eq!(clone.progress(), 0.0);
        clone.update_progress(f64::NAN, None);
        assert_eq!(clone.progress(), 0.0);

        assert_eq!(clone.status(), CloneStatus::Created);
        assert!(clone.last_active_time().is_some());
        let progress_events = types(&log)
            .iter()
            .filter(|t| *t == "clone.progress")
            .count();
        assert_eq!(progress_events, 2);
    }

    #[tokio::test]
    async fn test_metadata_and_results_are_not_activity() {
        let bus = EventBus::new();
        let clone = unit(ScriptedWork::default(), &bus);

        let mut metadata = Map::new();
        metadata.insert("stage".to_string(), json!("warmup"));
        clone.update_metadata(metadata);
        clone.set_result("partial", json!(3));
        assert!(clone.last_active_time().is_none());
        assert_eq!(clone.metadata()["stage"], "warmup");

        clone.touch();
        assert!(clone.last_active_time().is_some());
    }

    #[tokio::test]
    async fn test_staleness_uses_last_activity() {
        let bus = EventBus::new();
        let gate = Arc::new(Notify::new());
        let clone = unit(
            ScriptedWork {
                gate: Some(Arc::clone(&gate)),
                ..Default::default()
            },
            &bus,
        );
        let threshold = Duration::from_secs(60);
        assert!(!clone.is_stale(Utc::now(), threshold));

        assert!(clone.initialize(Map::new()).await);
        let runner = Arc::clone(&clone);
        let run = tokio::spawn(async move { runner.start().await });
        while clone.status() != CloneStatus::Running {
            tokio::task::yield_now().await;
        }

        assert!(!clone.is_stale(Utc::now(), threshold));
        clone.mark_active_at(Utc::now() - chrono::Duration::seconds(120));
        clone.record_heartbeat();
        assert!(clone.is_stale(Utc::now(), threshold));

        gate.notify_one();
        run.await.unwrap();
        assert!(!clone.is_stale(Utc::now(), threshold));
    }

    #[test]
    fn test_info_serializes_type_field() {
        let bus = EventBus::new();
        let clone = CloneUnit::new(
            Some("abc".to_string()),
            "Echo",
            Some("echo-1".to_string()),
            Box::new(ScriptedWork::default()),
            bus,
        );
        let value = serde_json::to_value(clone.info()).unwrap();
        assert_eq!(value["type"], "Echo");
        assert_eq!(value["status"], "CREATED");
        assert_eq!(value["clone_id"], "abc");

        let back: CloneInfo = serde_json::from_value(value).unwrap();
        assert_eq!(back.name, "echo-1");
    }
}
