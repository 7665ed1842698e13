//! Publish/subscribe event bus with priority-ordered dispatch.
//!
//! # Dispatch rules
//!
//! - `publish` takes a snapshot of the matching subscriptions (exact type plus
//!   the `*` wildcard) and releases the lock before any handler runs, so
//!   subscribe/unsubscribe during dispatch never affects an in-flight publish.
//! - Handlers run in descending [`EventPriority`]; equal priorities run in
//!   subscription order.
//! - A failing or panicking handler is logged and skipped; remaining handlers
//!   still run.
//! - [`EventHandler::Async`] handlers are spawned onto the tokio runtime and
//!   never awaited by the publisher.
//! - An event with no subscribers for its type goes to a bounded dead-letter
//!   ring instead of being dropped.
//!
//! ```text
//!  publish(event)
//!      │  snapshot (type ∪ "*"), sorted by (priority desc, seq asc)
//!      ├──► CRITICAL  sync handler   (inline)
//!      ├──► HIGH      async handler  (tokio::spawn, fire-and-forget)
//!      └──► NORMAL    sync handler   (inline)
//! ```

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::event::{Event, EventPriority};

/// Subscription key matching every event type.
pub const WILDCARD: &str = "*";

/// Default number of dead-letter events retained.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

type SyncHandlerFn = dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync;
type AsyncHandlerFn = dyn Fn(Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;
type FilterFn = dyn Fn(&Event) -> bool + Send + Sync;

/// A handler, tagged at subscribe time as synchronous or asynchronous.
#[derive(Clone)]
pub enum EventHandler {
    /// Runs inline inside `publish`.
    Sync(Arc<SyncHandlerFn>),
    /// Spawned onto the runtime; the publisher does not wait for it.
    Async(Arc<AsyncHandlerFn>),
}

impl EventHandler {
    /// Wraps a synchronous closure.
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        EventHandler::Sync(Arc::new(handler))
    }

    /// Wraps an asynchronous closure.
    pub fn asynchronous<F, Fut>(handler: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        EventHandler::Async(Arc::new(move |event| handler(event).boxed()))
    }

    fn kind(&self) -> &'static str {
        match self {
            EventHandler::Sync(_) => "sync",
            EventHandler::Async(_) => "async",
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventHandler::{}", self.kind())
    }
}

/// Optional subscription settings.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Identifier used for unsubscribing. Generated when absent.
    pub subscriber_id: Option<String>,
    /// Dispatch priority.
    pub priority: EventPriority,
    /// Predicate an event must pass for the handler to run.
    pub filter: Option<Arc<FilterFn>>,
}

impl SubscribeOptions {
    /// Creates default options (generated id, NORMAL priority, no filter).
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the subscriber id.
    pub fn with_subscriber_id(mut self, id: impl Into<String>) -> Self {
        self.subscriber_id = Some(id.into());
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the filter predicate.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

#[derive(Clone)]
struct Subscription {
    subscriber_id: String,
    priority: EventPriority,
    filter: Option<Arc<FilterFn>>,
    handler: EventHandler,
    seq: u64,
}

impl Subscription {
    fn accepts(&self, event: &Event) -> bool {
        match &self.filter {
            Some(filter) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| filter(event))) {
                    Ok(accepted) => accepted,
                    Err(_) => {
                        error!(
                            subscriber_id = %self.subscriber_id,
                            event_type = %event.event_type,
                            "Event filter panicked, skipping handler"
                        );
                        false
                    }
                }
            }
            None => true,
        }
    }
}

struct BusInner {
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    dead_letters: Mutex<VecDeque<Arc<Event>>>,
    dead_letter_capacity: usize,
    next_seq: AtomicU64,
    runtime: Option<Handle>,
}

/// Process-wide publish/subscribe broker.
///
/// Cheap to clone: clones share the same subscription table and dead-letter
/// ring. Construct one per runtime and pass it to every component.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("dead_letter_capacity", &self.inner.dead_letter_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with the default dead-letter capacity.
    pub fn new() -> Self {
        Self::with_dead_letter_capacity(DEFAULT_DEAD_LETTER_CAPACITY)
    }

    /// Creates a bus retaining at most `capacity` dead-letter events.
    ///
    /// If called inside a tokio runtime, that runtime is remembered for async
    /// handlers published from threads that are not runtime workers.
    pub fn with_dead_letter_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(HashMap::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                dead_letter_capacity: capacity.max(1),
                next_seq: AtomicU64::new(0),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    /// Subscribes `handler` to `event_type` with default options.
    ///
    /// Returns the generated subscriber id.
    pub fn subscribe(&self, event_type: &str, handler: EventHandler) -> String {
        self.subscribe_with(event_type, handler, SubscribeOptions::default())
    }

    /// Subscribes `handler` to `event_type` (or [`WILDCARD`]).
    ///
    /// Returns the subscriber id, either the one supplied in `options` or a
    /// generated UUID. Several subscriptions may share one id.
    pub fn subscribe_with(
        &self,
        event_type: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> String {
        let subscriber_id = options
            .subscriber_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let subscription = Subscription {
            subscriber_id: subscriber_id.clone(),
            priority: options.priority,
            filter: options.filter,
            handler,
            seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst),
        };

        {
            let mut subscriptions = self.subscriptions();
            let list = subscriptions.entry(event_type.to_string()).or_default();
            list.push(subscription);
            // Stable sort keeps subscription order among equal priorities.
            list.sort_by(|a, b| b.priority.cmp(&a.priority));
        }

        debug!(
            subscriber_id = %subscriber_id,
            event_type = event_type,
            priority = %options.priority,
            "Subscribed"
        );
        subscriber_id
    }

    /// Removes subscriptions owned by `subscriber_id`.
    ///
    /// With `event_type = None` the id is removed from every event type.
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe(&self, subscriber_id: &str, event_type: Option<&str>) -> usize {
        let mut removed = 0;
        let mut subscriptions = self.subscriptions();

        match event_type {
            Some(event_type) => {
                if let Some(list) = subscriptions.get_mut(event_type) {
                    let before = list.len();
                    list.retain(|s| s.subscriber_id != subscriber_id);
                    removed = before - list.len();
                }
            }
            None => {
                for list in subscriptions.values_mut() {
                    let before = list.len();
                    list.retain(|s| s.subscriber_id != subscriber_id);
                    removed += before - list.len();
                }
            }
        }
        subscriptions.retain(|_, list| !list.is_empty());

        debug!(subscriber_id = subscriber_id, removed = removed, "Unsubscribed");
        removed
    }

    /// Publishes an event to every matching subscription.
    ///
    /// Returns the number of handlers dispatched (sync handlers invoked plus
    /// async handlers spawned). Handler failures never reach the caller.
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let snapshot = self.snapshot(&event.event_type);

        if snapshot.is_empty() {
            debug!(event_type = %event.event_type, "No subscribers, moving to dead letters");
            self.push_dead_letter(event);
            return 0;
        }

        let mut dispatched = 0;
        for subscription in snapshot {
            if !subscription.accepts(&event) {
                continue;
            }
            match &subscription.handler {
                EventHandler::Sync(handler) => {
                    dispatched += 1;
                    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(
                            subscriber_id = %subscription.subscriber_id,
                            event_type = %event.event_type,
                            error = %e,
                            "Event handler failed"
                        ),
                        Err(panic) => error!(
                            subscriber_id = %subscription.subscriber_id,
                            event_type = %event.event_type,
                            panic = %panic_message(panic.as_ref()),
                            "Event handler panicked"
                        ),
                    }
                }
                EventHandler::Async(handler) => {
                    if self.spawn_async(handler, &subscription.subscriber_id, &event) {
                        dispatched += 1;
                    }
                }
            }
        }
        dispatched
    }

    /// Returns the retained dead-letter events, oldest first.
    pub fn dead_letters(&self, clear: bool) -> Vec<Arc<Event>> {
        let mut dead_letters = self
            .inner
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let events: Vec<Arc<Event>> = dead_letters.iter().cloned().collect();
        if clear {
            dead_letters.clear();
        }
        events
    }

    /// Returns every event type with at least one subscription.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.subscriptions().keys().cloned().collect();
        types.sort();
        types
    }

    /// Returns the number of subscriptions registered for exactly `event_type`.
    pub fn subscription_count(&self, event_type: &str) -> usize {
        self.subscriptions()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, event_type: &str) -> Vec<Subscription> {
        let subscriptions = self.subscriptions();
        let mut snapshot: Vec<Subscription> = subscriptions
            .get(event_type)
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        if event_type != WILDCARD {
            if let Some(wildcard) = subscriptions.get(WILDCARD) {
                snapshot.extend(wildcard.iter().cloned());
            }
        }
        drop(subscriptions);

        snapshot.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        snapshot
    }

    fn push_dead_letter(&self, event: Arc<Event>) {
        let mut dead_letters = self
            .inner
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while dead_letters.len() >= self.inner.dead_letter_capacity {
            dead_letters.pop_front();
        }
        dead_letters.push_back(event);
    }

    fn spawn_async(&self, handler: &Arc<AsyncHandlerFn>, subscriber_id: &str, event: &Arc<Event>) -> bool {
        let runtime = match Handle::try_current().ok().or_else(|| self.inner.runtime.clone()) {
            Some(runtime) => runtime,
            None => {
                warn!(
                    subscriber_id = subscriber_id,
                    event_type = %event.event_type,
                    "No tokio runtime available, async handler skipped"
                );
                return false;
            }
        };

        let subscriber_id = subscriber_id.to_string();
        let event_type = event.event_type.clone();
        let future = handler(Arc::clone(event));
        runtime.spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    subscriber_id = %subscriber_id,
                    event_type = %event_type,
                    error = %e,
                    "Async event handler failed"
                ),
                Err(panic) => error!(
                    subscriber_id = %subscriber_id,
                    event_type = %event_type,
                    panic = %panic_message(panic.as_ref()),
                    "Async event handler panicked"
                ),
            }
        });
        true
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
