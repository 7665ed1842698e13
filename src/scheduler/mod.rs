//! Clone scheduling: priority queue, manager and worker pool.
//!
//! - **CloneQueue**: Priority queue over a Redis backend, degrading to an
//!   in-process fallback when Redis is unreachable
//! - **CloneManager**: Owns every live clone, persists snapshots and runs the
//!   heartbeat that terminates stale clones
//! - **WorkerPool**: Resizable pool of workers that drain the queue
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Admin     │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue(id, priority)
//!                      ┌──────▼───────┐
//!                      │  CloneQueue  │──── fallback: MemoryQueue
//!                      │   (Redis)    │
//!                      └──────┬───────┘
//!                             │ dequeue
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────────────► CloneManager ◄─────────┘
//!                             │ clone.* events
//!                      ┌──────▼───────┐
//!                      │   EventBus   │──► queue release, persistence
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use clone_forge::clones::CloneRegistry;
//! use clone_forge::events::EventBus;
//! use clone_forge::scheduler::{CloneManager, CloneQueue, ManagerConfig, WorkerPool, WorkerPoolConfig};
//! use clone_forge::storage::{MemoryStore, NamespacedStore};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new();
//! let store = NamespacedStore::new(Arc::new(MemoryStore::new()), "clones");
//! let manager = CloneManager::new(ManagerConfig::default(), Arc::new(CloneRegistry::with_builtins()), bus.clone(), store);
//! let queue = CloneQueue::in_memory(bus.clone());
//!
//! let clone = manager.create("Echo", None, None).await?;
//! queue.enqueue(clone.id(), 5).await;
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new(2), manager, queue, bus);
//! pool.start()?;
//! pool.adjust_pool_size(4);
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: Lua scripts move the top entry to the processing set
//! - **Fallback**: Connection failures degrade the queue once, with identical ordering
//! - **Release on completion**: Terminal clone events drop processing entries
//! - **Graceful shutdown**: Workers finish the clone they are driving before stopping

pub mod backend;
pub mod manager;
pub mod queue;
pub mod worker_pool;

// Re-export main types for convenience
pub use backend::{MemoryQueue, QueueBackend, QueueEntry, RedisQueueBackend};
pub use manager::{CloneManager, ManagerConfig};
pub use queue::{CloneQueue, QUEUE_EVENT_SOURCE};
pub use worker_pool::{
    PoolStats, WorkerPool, WorkerPoolConfig, POOL_RESIZED_EVENT, WORKER_STOP_EVENT,
};
