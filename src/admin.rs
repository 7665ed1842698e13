//! Administrative request layer.
//!
//! Transport-free operations over the manager and the queue. Every failure is
//! an [`AdminError`] carrying the status code a transport would answer with;
//! requests for unknown clones are `NotFound`, illegal transitions and
//! malformed input are `BadRequest`. Nothing here panics, and a rejected
//! request leaves the manager and the queue untouched.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::clones::{CloneInfo, CloneStatus, CloneUnit};
use crate::error::AdminError;
use crate::scheduler::{CloneManager, CloneQueue};

/// Body of a create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Registered clone type.
    pub type_name: String,
    /// Display name; defaults to `<type>-<id prefix>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Queue priority used with `auto_start`.
    #[serde(default)]
    pub priority: i64,
    /// Passed to the initialize hook.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Enqueue the clone once initialized.
    #[serde(default)]
    pub auto_start: bool,
}

impl CreateRequest {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_auto_start(mut self, priority: i64) -> Self {
        self.auto_start = true;
        self.priority = priority;
        self
    }
}

/// Lifecycle action requested on a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneAction {
    Start,
    Stop,
    Pause,
    Resume,
}

impl CloneAction {
    pub fn as_str(self) -> &'static str {
        match self {
            CloneAction::Start => "start",
            CloneAction::Stop => "stop",
            CloneAction::Pause => "pause",
            CloneAction::Resume => "resume",
        }
    }
}

impl FromStr for CloneAction {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(CloneAction::Start),
            "stop" => Ok(CloneAction::Stop),
            "pause" => Ok(CloneAction::Pause),
            "resume" => Ok(CloneAction::Resume),
            other => Err(AdminError::BadRequest(format!("Invalid action '{}'", other))),
        }
    }
}

/// Acknowledgement returned by mutating requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ActionResponse {
    fn success(message: String) -> Self {
        Self {
            status: "success".to_string(),
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Queue introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub queue_size: usize,
    pub processing_size: usize,
    pub queued_clones: Vec<String>,
    pub processing_clones: Vec<String>,
    /// Whether the queue is running on its in-process fallback.
    pub degraded: bool,
}

/// Administrative operations over one runtime.
#[derive(Debug, Clone)]
pub struct AdminService {
    manager: Arc<CloneManager>,
    queue: Arc<CloneQueue>,
}

impl AdminService {
    pub fn new(manager: Arc<CloneManager>, queue: Arc<CloneQueue>) -> Self {
        Self { manager, queue }
    }

    /// Registered clone type names, sorted.
    pub fn clone_types(&self) -> Vec<String> {
        self.manager.registry().type_names()
    }

    /// Creates and initializes a clone, enqueueing it if `auto_start` is set.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an unknown type or a duplicate id, `Internal` if the
    /// initialize hook or the enqueue fails. A clone that fails here is
    /// removed again, so a failed request leaves nothing behind.
    pub async fn create(&self, request: CreateRequest) -> Result<CloneInfo, AdminError> {
        if request.type_name.trim().is_empty() {
            return Err(AdminError::BadRequest("type_name cannot be empty".to_string()));
        }

        let clone = self
            .manager
            .create(&request.type_name, None, request.name.clone())
            .await?;
        let clone_id = clone.id().to_string();

        if !self.manager.initialize(&clone_id, request.config).await {
            let reason = clone
                .failure_reason()
                .unwrap_or_else(|| "initialize refused".to_string());
            self.manager.remove(&clone_id, true).await;
            return Err(AdminError::Internal(format!(
                "Failed to initialize clone '{}': {}",
                clone_id, reason
            )));
        }

        if request.auto_start && !self.queue.enqueue(&clone_id, request.priority).await {
            self.manager.remove(&clone_id, true).await;
            return Err(AdminError::Internal(format!(
                "Failed to enqueue clone '{}'",
                clone_id
            )));
        }

        info!(clone_id = %clone_id, clone_type = %request.type_name, "Created clone via admin");
        Ok(clone.info())
    }

    /// Lists clones, optionally filtered by a status name (case-insensitive).
    pub fn list(&self, status: Option<&str>) -> Result<Vec<CloneInfo>, AdminError> {
        let clones = match status {
            Some(raw) => {
                let status = CloneStatus::from_str(raw)
                    .map_err(|_| AdminError::BadRequest(format!("Invalid status '{}'", raw)))?;
                self.manager.list_by_status(status)
            }
            None => self.manager.list(),
        };
        Ok(clones.iter().map(|clone| clone.info()).collect())
    }

    pub fn get(&self, clone_id: &str) -> Result<CloneInfo, AdminError> {
        Ok(self.clone_unit(clone_id)?.info())
    }

    /// Enqueues an initialized clone.
    ///
    /// Re-enqueueing a queued clone updates its priority.
    pub async fn enqueue(&self, clone_id: &str, priority: i64) -> Result<ActionResponse, AdminError> {
        let clone = self.clone_unit(clone_id)?;
        match clone.status() {
            CloneStatus::Created => {
                return Err(AdminError::BadRequest(format!(
                    "Clone '{}' is not initialized",
                    clone_id
                )));
            }
            status if status.is_terminal() => {
                return Err(AdminError::BadRequest(format!(
                    "Clone '{}' is {}",
                    clone_id, status
                )));
            }
            _ => {}
        }

        if !self.queue.enqueue(clone_id, priority).await {
            return Err(AdminError::Internal(format!(
                "Failed to enqueue clone '{}'",
                clone_id
            )));
        }
        Ok(ActionResponse::success(format!("Clone '{}' enqueued", clone_id)))
    }

    /// Applies a lifecycle action.
    ///
    /// `start` and `resume` are validated here and then run in a background
    /// task, since execution lasts as long as the clone's work.
    pub async fn action(&self, clone_id: &str, action: &str) -> Result<ActionResponse, AdminError> {
        let action = CloneAction::from_str(action)?;
        let clone = self.clone_unit(clone_id)?;
        let status = clone.status();

        let applied = match action {
            CloneAction::Start | CloneAction::Resume => {
                let allowed = match action {
                    CloneAction::Start => {
                        matches!(status, CloneStatus::Initialized | CloneStatus::Paused)
                    }
                    _ => status == CloneStatus::Paused,
                };
                if allowed {
                    self.spawn_execution(clone_id, action);
                }
                allowed
            }
            CloneAction::Stop => self.manager.stop(clone_id).await,
            CloneAction::Pause => self.manager.pause(clone_id).await,
        };

        if !applied {
            warn!(clone_id = clone_id, action = action.as_str(), status = %status, "Rejected clone action");
            return Err(AdminError::BadRequest(format!(
                "Cannot {} clone '{}' in status {}",
                action.as_str(),
                clone_id,
                status
            )));
        }

        Ok(ActionResponse::success(format!(
            "Action '{}' performed on clone '{}'",
            action.as_str(),
            clone_id
        )))
    }

    /// Removes a clone and its queue entry. Active clones need `force`.
    pub async fn delete(&self, clone_id: &str, force: bool) -> Result<ActionResponse, AdminError> {
        let clone = self.clone_unit(clone_id)?;
        if clone.is_active() && !force {
            return Err(AdminError::BadRequest(format!(
                "Cannot remove active clone '{}' without force flag",
                clone_id
            )));
        }

        self.queue.remove(clone_id).await;
        if !self.manager.remove(clone_id, force).await {
            return Err(AdminError::Internal(format!(
                "Failed to remove clone '{}'",
                clone_id
            )));
        }
        Ok(ActionResponse::success(format!("Clone '{}' removed", clone_id)))
    }

    pub async fn queue_info(&self) -> QueueInfo {
        QueueInfo {
            queue_size: self.queue.queue_size().await,
            processing_size: self.queue.processing_size().await,
            queued_clones: self.queue.queued_ids().await,
            processing_clones: self.queue.processing_ids().await,
            degraded: self.queue.is_degraded(),
        }
    }

    fn clone_unit(&self, clone_id: &str) -> Result<Arc<CloneUnit>, AdminError> {
        self.manager
            .get(clone_id)
            .ok_or_else(|| AdminError::NotFound(format!("Clone '{}' not found", clone_id)))
    }

    fn spawn_execution(&self, clone_id: &str, action: CloneAction) {
        let manager = Arc::clone(&self.manager);
        let clone_id = clone_id.to_string();
        tokio::spawn(async move {
            let ok = match action {
                CloneAction::Resume => manager.resume(&clone_id).await,
                _ => manager.start(&clone_id).await,
            };
            if !ok {
                warn!(clone_id = %clone_id, action = action.as_str(), "Background execution did not run");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clones::unit::tests::ScriptedWork;
    use crate::clones::{CloneFactory, CloneRegistry};
    use crate::events::EventBus;
    use crate::scheduler::ManagerConfig;
    use crate::storage::{MemoryStore, NamespacedStore};
    use tokio::sync::Notify;

    fn service_with_gate(gate: Arc<Notify>) -> AdminService {
        let bus = EventBus::new();
        let registry = CloneRegistry::with_builtins();
        let factory: CloneFactory = Arc::new(move || -> Box<dyn crate::clones::CloneWork> {
            Box::new(ScriptedWork {
                gate: Some(Arc::clone(&gate)),
                ..Default::default()
            })
        });
        registry.register("Gated", factory).unwrap();
        let manager = CloneManager::new(
            ManagerConfig::default(),
            Arc::new(registry),
            bus.clone(),
            NamespacedStore::new(Arc::new(MemoryStore::new()), "admin"),
        );
        let queue = CloneQueue::in_memory(bus);
        AdminService::new(manager, queue)
    }

    fn service() -> AdminService {
        service_with_gate(Arc::new(Notify::new()))
    }

    fn service_with_broken_type() -> AdminService {
        let service = service();
        let factory: CloneFactory = Arc::new(|| -> Box<dyn crate::clones::CloneWork> {
            Box::new(ScriptedWork {
                fail_init: true,
                ..Default::default()
            })
        });
        service.manager.registry().register("Broken", factory).unwrap();
        service
    }

    async fn wait_for(service: &AdminService, clone_id: &str, status: CloneStatus) {
        for _ in 0..400 {
            if matches!(service.get(clone_id), Ok(info) if info.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("clone {} never reached {}", clone_id, status);
    }

    #[tokio::test]
    async fn test_clone_types() {
        let types = service().clone_types();
        assert_eq!(types, vec!["Echo", "Gated", "Sleep"]);
    }

    #[tokio::test]
    async fn test_create_initializes_and_auto_starts() {
        let service = service();
        let info = service
            .create(CreateRequest::new("Echo").with_auto_start(7))
            .await
            .unwrap();
        assert_eq!(info.status, CloneStatus::Initialized);

        let queue = service.queue_info().await;
        assert_eq!(queue.queue_size, 1);
        assert_eq!(queue.queued_clones, vec![info.clone_id]);
        assert!(!queue.degraded);
    }

    #[tokio::test]
    async fn test_create_unknown_type_is_bad_request() {
        let err = service().create(CreateRequest::new("Nope")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_no_clone_behind() {
        let service = service_with_broken_type();
        let err = service
            .create(CreateRequest::new("Broken").with_auto_start(3))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("init refused"));
        assert!(service.list(None).unwrap().is_empty());
        assert_eq!(service.queue_info().await.queue_size, 0);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let service = service();
        assert_eq!(service.get("missing").unwrap_err().status_code(), 404);
        assert_eq!(service.enqueue("missing", 1).await.unwrap_err().status_code(), 404);
        assert_eq!(service.action("missing", "stop").await.unwrap_err().status_code(), 404);
        assert_eq!(service.delete("missing", true).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let service = service();
        service.create(CreateRequest::new("Echo")).await.unwrap();
        service.create(CreateRequest::new("Echo")).await.unwrap();

        assert_eq!(service.list(None).unwrap().len(), 2);
        assert_eq!(service.list(Some("initialized")).unwrap().len(), 2);
        assert!(service.list(Some("RUNNING")).unwrap().is_empty());
        assert_eq!(service.list(Some("bogus")).unwrap_err().status_code(), 400);
    }

    #[tokio::test]
    async fn test_invalid_and_illegal_actions_are_bad_requests() {
        let service = service();
        let info = service.create(CreateRequest::new("Echo")).await.unwrap();

        let err = service.action(&info.clone_id, "explode").await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = service.action(&info.clone_id, "pause").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(service.get(&info.clone_id).unwrap().status, CloneStatus::Initialized);
    }

    #[tokio::test]
    async fn test_start_runs_in_background() {
        let gate = Arc::new(Notify::new());
        let service = service_with_gate(Arc::clone(&gate));
        let info = service.create(CreateRequest::new("Gated")).await.unwrap();

        let response = service.action(&info.clone_id, "start").await.unwrap();
        assert_eq!(response.status, "success");
        wait_for(&service, &info.clone_id, CloneStatus::Running).await;

        gate.notify_one();
        wait_for(&service, &info.clone_id, CloneStatus::Completed).await;

        let err = service.enqueue(&info.clone_id, 1).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_delete_requires_force_for_active_clone() {
        let gate = Arc::new(Notify::new());
        let service = service_with_gate(Arc::clone(&gate));
        let info = service.create(CreateRequest::new("Gated")).await.unwrap();
        service.enqueue(&info.clone_id, 3).await.unwrap();
        service.action(&info.clone_id, "start").await.unwrap();
        wait_for(&service, &info.clone_id, CloneStatus::Running).await;

        let err = service.delete(&info.clone_id, false).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(service.get(&info.clone_id).is_ok());
        assert_eq!(service.queue_info().await.queue_size, 1);

        service.delete(&info.clone_id, true).await.unwrap();
        assert_eq!(service.get(&info.clone_id).unwrap_err().status_code(), 404);
        assert_eq!(service.queue_info().await.queue_size, 0);
        gate.notify_one();
    }

    #[tokio::test]
    async fn test_enqueue_uninitialized_clone_is_bad_request() {
        let service = service();
        let clone = service.manager.create("Echo", None, None).await.unwrap();
        let err = service.enqueue(clone.id(), 1).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(service.queue_info().await.queue_size, 0);
    }
}
