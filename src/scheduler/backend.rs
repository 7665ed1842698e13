//! Queue storage backends.
//!
//! A backend holds two collections of clone ids:
//!
//! - **queued**: ordered by priority (descending), ties by insertion order
//! - **processing**: ids handed out by `dequeue`, in dequeue order
//!
//! An id is in at most one of them. Every operation that touches both is a
//! single atomic step: [`MemoryQueue`] holds one lock around the combined
//! read-modify-write, [`RedisQueueBackend`] runs each one as a Lua script.
//!
//! # Redis layout
//!
//! ```text
//! {prefix}:queue        LIST  queued ids, already in dequeue order
//! {prefix}:processing   LIST  ids handed to workers
//! {prefix}:priority     HASH  id -> priority (kept across dequeue for requeue)
//! {prefix}:seq          HASH  id -> insertion sequence of queued ids
//! {prefix}:seq_counter  STRING  monotonic sequence source
//! ```

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A queued id with its priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub clone_id: String,
    pub priority: i64,
}

/// Storage behind a [`CloneQueue`](super::CloneQueue).
///
/// Implementations must give identical observable behaviour; the queue may
/// swap one for another at any point.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Inserts or re-prioritizes `clone_id`.
    ///
    /// A queued id keeps its place among equal priorities; an id in
    /// processing moves back to queued as a new arrival. `priority = None`
    /// keeps the last known priority (0 if none).
    async fn upsert(&self, clone_id: &str, priority: Option<i64>) -> Result<i64, QueueError>;

    /// Moves the head of the queue into processing.
    async fn dequeue(&self) -> Result<Option<QueueEntry>, QueueError>;

    /// Removes `clone_id` from both collections. Returns whether it was present.
    async fn remove(&self, clone_id: &str) -> Result<bool, QueueError>;

    /// Removes `clone_id` from processing only.
    async fn release(&self, clone_id: &str) -> Result<bool, QueueError>;

    /// Empties the queued collection. Returns how many entries were dropped.
    async fn clear(&self) -> Result<usize, QueueError>;

    async fn queue_size(&self) -> Result<usize, QueueError>;

    async fn processing_size(&self) -> Result<usize, QueueError>;

    /// Queued entries in dequeue order.
    async fn queued_entries(&self) -> Result<Vec<QueueEntry>, QueueError>;

    /// Processing ids in dequeue order.
    async fn processing_ids(&self) -> Result<Vec<String>, QueueError>;
}

#[derive(Debug, Clone)]
struct Slot {
    clone_id: String,
    priority: i64,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    queued: Vec<Slot>,
    processing: Vec<String>,
    priorities: HashMap<String, i64>,
    next_seq: u64,
}

impl MemoryState {
    fn insert_sorted(&mut self, slot: Slot) {
        let key = (slot.priority, Reverse(slot.seq));
        let index = self
            .queued
            .partition_point(|s| (s.priority, Reverse(s.seq)) >= key);
        self.queued.insert(index, slot);
    }

    fn take_queued(&mut self, clone_id: &str) -> Option<Slot> {
        let index = self.queued.iter().position(|s| s.clone_id == clone_id)?;
        Some(self.queued.remove(index))
    }

    fn take_processing(&mut self, clone_id: &str) -> bool {
        let before = self.processing.len();
        self.processing.retain(|id| id != clone_id);
        self.processing.len() != before
    }
}

/// In-process backend. Used as the fallback and on its own in tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn remembered_priorities(&self) -> usize {
        self.state().priorities.len()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, clone_id: &str, priority: Option<i64>) -> Result<i64, QueueError> {
        let mut state = self.state();
        let priority = priority
            .or_else(|| state.priorities.get(clone_id).copied())
            .unwrap_or(0);

        let seq = match state.take_queued(clone_id) {
            Some(existing) => existing.seq,
            None => {
                state.take_processing(clone_id);
                let seq = state.next_seq;
                state.next_seq += 1;
                seq
            }
        };
        state.priorities.insert(clone_id.to_string(), priority);
        state.insert_sorted(Slot {
            clone_id: clone_id.to_string(),
            priority,
            seq,
        });
        Ok(priority)
    }

    async fn dequeue(&self) -> Result<Option<QueueEntry>, QueueError> {
        let mut state = self.state();
        if state.queued.is_empty() {
            return Ok(None);
        }
        let slot = state.queued.remove(0);
        state.processing.push(slot.clone_id.clone());
        Ok(Some(QueueEntry {
            clone_id: slot.clone_id,
            priority: slot.priority,
        }))
    }

    async fn remove(&self, clone_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state();
        let queued = state.take_queued(clone_id).is_some();
        let processing = state.take_processing(clone_id);
        state.priorities.remove(clone_id);
        Ok(queued || processing)
    }

    async fn release(&self, clone_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state();
        if !state.take_processing(clone_id) {
            return Ok(false);
        }
        state.priorities.remove(clone_id);
        Ok(true)
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let mut state = self.state();
        let dropped: Vec<Slot> = state.queued.drain(..).collect();
        for slot in &dropped {
            state.priorities.remove(&slot.clone_id);
        }
        Ok(dropped.len())
    }

    async fn queue_size(&self) -> Result<usize, QueueError> {
        Ok(self.state().queued.len())
    }

    async fn processing_size(&self) -> Result<usize, QueueError> {
        Ok(self.state().processing.len())
    }

    async fn queued_entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self
            .state()
            .queued
            .iter()
            .map(|s| QueueEntry {
                clone_id: s.clone_id.clone(),
                priority: s.priority,
            })
            .collect())
    }

    async fn processing_ids(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.state().processing.clone())
    }
}

// KEYS: queue, processing, priority, seq, seq_counter
// ARGV: clone_id, priority ('' keeps the stored one)
const UPSERT_SCRIPT: &str = r#"
local id = ARGV[1]
local priority = tonumber(ARGV[2])
if priority == nil then
  priority = tonumber(redis.call('HGET', KEYS[3], id) or '0') or 0
end
local seq
if redis.call('LREM', KEYS[1], 0, id) > 0 then
  seq = tonumber(redis.call('HGET', KEYS[4], id) or '0') or 0
else
  redis.call('LREM', KEYS[2], 0, id)
  seq = redis.call('INCR', KEYS[5])
end
redis.call('HSET', KEYS[3], id, priority)
redis.call('HSET', KEYS[4], id, seq)
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, other in ipairs(ids) do
  local p = tonumber(redis.call('HGET', KEYS[3], other) or '0') or 0
  local s = tonumber(redis.call('HGET', KEYS[4], other) or '0') or 0
  if p < priority or (p == priority and s > seq) then
    redis.call('LINSERT', KEYS[1], 'BEFORE', other, id)
    return priority
  end
end
redis.call('RPUSH', KEYS[1], id)
return priority
"#;

// KEYS: queue, processing, priority, seq
const DEQUEUE_SCRIPT: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
  return false
end
redis.call('RPUSH', KEYS[2], id)
redis.call('HDEL', KEYS[4], id)
return {id, redis.call('HGET', KEYS[3], id) or '0'}
"#;

// KEYS: queue, processing, priority, seq
const REMOVE_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1]) + redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return removed
"#;

// KEYS: processing, priority
const RELEASE_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
if removed > 0 then
  redis.call('HDEL', KEYS[2], ARGV[1])
end
return removed
"#;

// KEYS: queue, priority, seq
const CLEAR_SCRIPT: &str = r#"
local ids = redis.call('LRANGE', KEYS[1], 0, -1)
for _, id in ipairs(ids) do
  redis.call('HDEL', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
end
redis.call('DEL', KEYS[1])
return #ids
"#;

// KEYS: queue, priority
const ENTRIES_SCRIPT: &str = r#"
local out = {}
for _, id in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  out[#out + 1] = id
  out[#out + 1] = redis.call('HGET', KEYS[2], id) or '0'
end
return out
"#;

struct Scripts {
    upsert: Script,
    dequeue: Script,
    remove: Script,
    release: Script,
    clear: Script,
    entries: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            upsert: Script::new(UPSERT_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            clear: Script::new(CLEAR_SCRIPT),
            entries: Script::new(ENTRIES_SCRIPT),
        }
    }
}

struct Keys {
    queue: String,
    processing: String,
    priority: String,
    seq: String,
    seq_counter: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            queue: format!("{}:queue", prefix),
            processing: format!("{}:processing", prefix),
            priority: format!("{}:priority", prefix),
            seq: format!("{}:seq", prefix),
            seq_counter: format!("{}:seq_counter", prefix),
        }
    }
}

/// Shared backend on Redis.
///
/// Connectivity failures surface as [`QueueError::Unavailable`], which is what
/// makes the owning queue degrade to its fallback.
pub struct RedisQueueBackend {
    redis: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
}

impl RedisQueueBackend {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Key prefix; all keys live under `{prefix}:*`
    /// * `timeout` - Upper bound on connection setup
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectTimeout` or `QueueError::Unavailable` when
    /// Redis cannot be reached.
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let redis = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::ConnectTimeout(timeout))??;
        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a backend from an existing connection.
    ///
    /// Useful when sharing a connection with the snapshot store.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            keys: Keys::new(prefix),
            scripts: Scripts::load(),
        }
    }

    /// Returns a handle to the underlying connection.
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn upsert(&self, clone_id: &str, priority: Option<i64>) -> Result<i64, QueueError> {
        let mut conn = self.redis.clone();
        let priority_arg = priority.map(|p| p.to_string()).unwrap_or_default();
        let mut invocation = self.scripts.upsert.prepare_invoke();
        invocation
            .key(&self.keys.queue)
            .key(&self.keys.processing)
            .key(&self.keys.priority)
            .key(&self.keys.seq)
            .key(&self.keys.seq_counter)
            .arg(clone_id)
            .arg(priority_arg);
        Ok(invocation.invoke_async::<_, i64>(&mut conn).await?)
    }

    async fn dequeue(&self) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.dequeue.prepare_invoke();
        invocation
            .key(&self.keys.queue)
            .key(&self.keys.processing)
            .key(&self.keys.priority)
            .key(&self.keys.seq);
        let popped: Option<(String, String)> = invocation.invoke_async(&mut conn).await?;
        Ok(popped.map(|(clone_id, priority)| QueueEntry {
            clone_id,
            priority: priority.parse().unwrap_or(0),
        }))
    }

    async fn remove(&self, clone_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.remove.prepare_invoke();
        invocation
            .key(&self.keys.queue)
            .key(&self.keys.processing)
            .key(&self.keys.priority)
            .key(&self.keys.seq)
            .arg(clone_id);
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn release(&self, clone_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.release.prepare_invoke();
        invocation
            .key(&self.keys.processing)
            .key(&self.keys.priority)
            .arg(clone_id);
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.clear.prepare_invoke();
        invocation
            .key(&self.keys.queue)
            .key(&self.keys.priority)
            .key(&self.keys.seq);
        let cleared: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(cleared.max(0) as usize)
    }

    async fn queue_size(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.keys.queue).await?)
    }

    async fn processing_size(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(&self.keys.processing).await?)
    }

    async fn queued_entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.entries.prepare_invoke();
        invocation.key(&self.keys.queue).key(&self.keys.priority);
        let flat: Vec<String> = invocation.invoke_async(&mut conn).await?;
        Ok(flat
            .chunks(2)
            .filter_map(|pair| match pair {
                [clone_id, priority] => Some(QueueEntry {
                    clone_id: clone_id.clone(),
                    priority: priority.parse().unwrap_or(0),
                }),
                _ => None,
            })
            .collect())
    }

    async fn processing_ids(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.lrange(&self.keys.processing, 0, -1).await?)
    }
}
