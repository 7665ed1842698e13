//! Priority queue of clone ids with a degrade-in-place fallback.
//!
//! [`CloneQueue`] routes every operation to its primary [`QueueBackend`]
//! (normally Redis). When the primary reports a connectivity failure the
//! queue switches to its in-process [`MemoryQueue`] for the rest of the
//! process lifetime, retrying the failed operation there. Callers see the
//! same contract either way.
//!
//! ```text
//!   enqueue/dequeue/...
//!          │
//!          ▼
//!   ┌──────────────┐  Unavailable   ┌──────────────┐
//!   │   primary    │ ─────────────► │   fallback   │
//!   │   (Redis)    │   (one way)    │  (in-memory) │
//!   └──────────────┘                └──────────────┘
//!          ▲                               │
//!          └──────── reconnect(backend) ───┘
//! ```
//!
//! Degradation is monotonic: only an explicit [`CloneQueue::reconnect`]
//! promotes the queue back, so two views of the queue never coexist.
//!
//! The queue also listens for terminal clone events and drops the clone from
//! the processing set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::{MemoryQueue, QueueBackend, QueueEntry};
use crate::clones::CloneEventKind;
use crate::error::QueueError;
use crate::events::{Event, EventBus, EventHandler, EventPriority, SubscribeOptions};

/// Source name on queue events.
pub const QUEUE_EVENT_SOURCE: &str = "clone_queue";

macro_rules! route {
    ($queue:expr, $op:expr, |$backend:ident| $call:expr) => {{
        match $queue.active_primary() {
            Some(primary) => {
                let $backend: &dyn QueueBackend = primary.as_ref();
                match $call.await {
                    Err(e) if e.is_unavailable() => {
                        $queue.degrade($op, &e);
                        let $backend: &dyn QueueBackend = &$queue.fallback;
                        $call.await
                    }
                    other => other,
                }
            }
            None => {
                let $backend: &dyn QueueBackend = &$queue.fallback;
                $call.await
            }
        }
    }};
}

/// Priority queue of clone ids.
pub struct CloneQueue {
    primary: RwLock<Option<Arc<dyn QueueBackend>>>,
    fallback: MemoryQueue,
    degraded: AtomicBool,
    bus: EventBus,
    subscriber_id: String,
}

impl CloneQueue {
    /// Creates a queue that only ever uses in-process storage.
    pub fn in_memory(bus: EventBus) -> Arc<Self> {
        Self::build(None, bus)
    }

    /// Creates a queue backed by `backend`, falling back to memory when it
    /// becomes unreachable.
    pub fn with_backend(backend: Arc<dyn QueueBackend>, bus: EventBus) -> Arc<Self> {
        Self::build(Some(backend), bus)
    }

    fn build(primary: Option<Arc<dyn QueueBackend>>, bus: EventBus) -> Arc<Self> {
        let queue = Arc::new(Self {
            primary: RwLock::new(primary),
            fallback: MemoryQueue::new(),
            degraded: AtomicBool::new(false),
            bus,
            subscriber_id: format!("{}:{}", QUEUE_EVENT_SOURCE, Uuid::new_v4()),
        });
        queue.subscribe_terminal_events();
        queue
    }

    fn subscribe_terminal_events(self: &Arc<Self>) {
        for kind in CloneEventKind::TERMINAL {
            let weak = Arc::downgrade(self);
            let handler = EventHandler::asynchronous(move |event: Arc<Event>| {
                let weak = weak.clone();
                async move {
                    let clone_id = event.field_str("clone_id").map(str::to_string);
                    if let (Some(queue), Some(clone_id)) = (weak.upgrade(), clone_id) {
                        queue.release(&clone_id).await;
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

    /// Whether the queue has switched to its in-process fallback.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Name of the backend currently serving requests.
    pub fn backend_name(&self) -> &'static str {
        match self.active_primary() {
            Some(primary) => primary.name(),
            None => self.fallback.name(),
        }
    }

    /// Adds `clone_id` with `priority`, or updates its priority if already
    /// queued. Returns false only if the backend rejected the operation.
    pub async fn enqueue(&self, clone_id: &str, priority: i64) -> bool {
        match route!(self, "enqueue", |backend| backend.upsert(clone_id, Some(priority))) {
            Ok(priority) => {
                debug!(clone_id = clone_id, priority = priority, "Enqueued clone");
                self.emit("queue.enqueued", Some(clone_id), Some(priority))
                    .await;
                true
            }
            Err(e) => {
                error!(clone_id = clone_id, error = %e, "Failed to enqueue clone");
                false
            }
        }
    }

    /// Moves the highest-priority, earliest-queued id into processing and
    /// returns it.
    pub async fn dequeue(&self) -> Option<String> {
        match route!(self, "dequeue", |backend| backend.dequeue()) {
            Ok(Some(entry)) => {
                self.emit("queue.dequeued", Some(&entry.clone_id), Some(entry.priority))
                    .await;
                Some(entry.clone_id)
            }
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "Failed to dequeue clone");
                None
            }
        }
    }

    /// Moves `clone_id` back from processing to queued, optionally with a new
    /// priority. Without one, the last known priority is kept.
    pub async fn requeue(&self, clone_id: &str, priority: Option<i64>) -> bool {
        match route!(self, "requeue", |backend| backend.upsert(clone_id, priority)) {
            Ok(priority) => {
                info!(clone_id = clone_id, priority = priority, "Requeued clone");
                self.emit("queue.requeued", Some(clone_id), Some(priority))
                    .await;
                true
            }
            Err(e) => {
                error!(clone_id = clone_id, error = %e, "Failed to requeue clone");
                false
            }
        }
    }

    /// Removes `clone_id` from both queued and processing.
    pub async fn remove(&self, clone_id: &str) -> bool {
        let removed = match route!(self, "remove", |backend| backend.remove(clone_id)) {
            Ok(removed) => removed,
            Err(e) => {
                error!(clone_id = clone_id, error = %e, "Failed to remove clone");
                return false;
            }
        };
        let removed = self.settle_leftover(clone_id, removed).await;
        if removed {
            self.emit("queue.removed", Some(clone_id), None).await;
        }
        removed
    }

    /// Removes `clone_id` from processing. Called when a clone reaches a
    /// terminal state.
    pub async fn release(&self, clone_id: &str) -> bool {
        let released = match route!(self, "release", |backend| backend.release(clone_id)) {
            Ok(released) => released,
            Err(e) => {
                error!(clone_id = clone_id, error = %e, "Failed to release clone");
                return false;
            }
        };
        let released = self.settle_leftover(clone_id, released).await;
        if released {
            self.emit("queue.released", Some(clone_id), None).await;
        }
        released
    }

    /// Empties the queued set. In-flight entries are untouched.
    pub async fn clear(&self) -> bool {
        match route!(self, "clear", |backend| backend.clear()) {
            Ok(cleared) => {
                info!(cleared = cleared, "Cleared clone queue");
                self.emit("queue.cleared", None, None).await;
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to clear clone queue");
                false
            }
        }
    }

    /// Number of queued ids.
    pub async fn queue_size(&self) -> usize {
        route!(self, "queue_size", |backend| backend.queue_size())
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to read queue size");
                0
            })
    }

    /// Number of ids in processing.
    pub async fn processing_size(&self) -> usize {
        self.processing_ids().await.len()
    }

    /// Queued entries in dequeue order.
    pub async fn queued_entries(&self) -> Vec<QueueEntry> {
        route!(self, "queued_entries", |backend| backend.queued_entries())
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to list queued clones");
                Vec::new()
            })
    }

    /// Queued ids in dequeue order.
    pub async fn queued_ids(&self) -> Vec<String> {
        self.queued_entries()
            .await
            .into_iter()
            .map(|entry| entry.clone_id)
            .collect()
    }

    /// Ids in processing, in dequeue order.
    pub async fn processing_ids(&self) -> Vec<String> {
        let mut ids = route!(self, "processing_ids", |backend| backend.processing_ids())
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to list processing clones");
                Vec::new()
            });
        if !self.is_degraded() {
            ids.extend(self.leftover_processing().await);
        }
        ids
    }

    /// Promotes the queue back onto `backend`.
    ///
    /// Queued entries accumulated in the fallback are moved across in order.
    /// Entries the fallback handed out before the reconnect stay tracked
    /// there until released. Returns the number of migrated entries.
    ///
    /// # Errors
    ///
    /// Returns the backend error if migration fails; the queue then stays on
    /// its current path.
    pub async fn reconnect(&self, backend: Arc<dyn QueueBackend>) -> Result<usize, QueueError> {
        let pending = self.fallback.queued_entries().await?;
        for entry in &pending {
            backend.upsert(&entry.clone_id, Some(entry.priority)).await?;
        }
        for entry in &pending {
            self.fallback.remove(&entry.clone_id).await?;
        }

        *self.primary.write().unwrap_or_else(PoisonError::into_inner) = Some(backend);
        self.degraded.store(false, Ordering::SeqCst);
        info!(migrated = pending.len(), "Queue reconnected to shared backend");
        Ok(pending.len())
    }

    fn active_primary(&self) -> Option<Arc<dyn QueueBackend>> {
        if self.is_degraded() {
            return None;
        }
        self.primary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn degrade(&self, operation: &str, err: &QueueError) {
        if self
            .degraded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!(
                operation = operation,
                error = %err,
                "Queue backend unavailable, switching to in-memory fallback"
            );
        }
    }

    /// Ids the fallback still holds in processing while the primary is active.
    async fn leftover_processing(&self) -> Vec<String> {
        if self.active_primary().is_none() {
            return Vec::new();
        }
        self.fallback.processing_ids().await.unwrap_or_default()
    }

    async fn settle_leftover(&self, clone_id: &str, already: bool) -> bool {
        if self.active_primary().is_none() {
            return already;
        }
        let leftover = self.fallback.release(clone_id).await.unwrap_or(false);
        already || leftover
    }

    async fn emit(&self, event_type: &str, clone_id: Option<&str>, priority: Option<i64>) {
        let queue_size = self.queue_size().await;
        let processing_size = self.processing_size().await;

        let mut event = Event::new(event_type, QUEUE_EVENT_SOURCE)
            .with_field("queue_size", queue_size)
            .with_field("processing_size", processing_size);
        if let Some(clone_id) = clone_id {
            event = event.with_field("clone_id", clone_id);
        }
        if let Some(priority) = priority {
            event = event.with_field("priority", priority);
        }
        self.bus.publish(event);
    }
}

impl Drop for CloneQueue {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscriber_id, None);
    }
}

impl std::fmt::Debug for CloneQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneQueue")
            .field("backend", &self.backend_name())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}
