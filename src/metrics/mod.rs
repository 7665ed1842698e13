//! Prometheus metrics fed from the event bus.
//!
//! [`RuntimeMetrics`] owns its own registry so several runtimes (or tests) can
//! coexist in one process. It never queries the queue or the pool directly;
//! every value comes from the events they publish.
//!
//! # Example
//!
//! ```ignore
//! use clone_forge::events::EventBus;
//! use clone_forge::metrics::RuntimeMetrics;
//!
//! let bus = EventBus::new();
//! let metrics = RuntimeMetrics::attach(&bus)?;
//!
//! // ... run clones ...
//!
//! println!("{}", metrics.encode());
//! ```

use prometheus::{CounterVec, Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder};
use uuid::Uuid;

use crate::clones::CloneEventKind;
use crate::events::{Event, EventBus, EventHandler, SubscribeOptions};
use crate::scheduler::POOL_RESIZED_EVENT;

const QUEUE_EVENTS: [&str; 6] = [
    "queue.enqueued",
    "queue.dequeued",
    "queue.requeued",
    "queue.removed",
    "queue.released",
    "queue.cleared",
];

/// Metric handles updated by bus events.
#[derive(Clone)]
struct Instruments {
    queue_depth: Gauge,
    processing_depth: Gauge,
    workers: Gauge,
    clones_created: IntCounter,
    clone_outcomes: CounterVec,
}

impl Instruments {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let queue_depth = Gauge::new("clone_forge_queue_depth", "Number of clones waiting in the queue")?;
        let processing_depth = Gauge::new(
            "clone_forge_processing_depth",
            "Number of dequeued clones not yet released",
        )?;
        let workers = Gauge::new("clone_forge_workers", "Number of workers in the pool")?;
        let clones_created = IntCounter::new("clone_forge_clones_created_total", "Total clones created")?;
        let clone_outcomes = CounterVec::new(
            Opts::new("clone_forge_clone_outcomes_total", "Clones reaching a terminal status"),
            &["status"],
        )?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(processing_depth.clone()))?;
        registry.register(Box::new(workers.clone()))?;
        registry.register(Box::new(clones_created.clone()))?;
        registry.register(Box::new(clone_outcomes.clone()))?;

        Ok(Self {
            queue_depth,
            processing_depth,
            workers,
            clones_created,
            clone_outcomes,
        })
    }

    fn observe(&self, event: &Event) {
        let event_type = event.event_type.as_str();
        if event_type.starts_with("queue.") {
            if let Some(size) = event.field_u64("queue_size") {
                self.queue_depth.set(size as f64);
            }
            if let Some(size) = event.field_u64("processing_size") {
                self.processing_depth.set(size as f64);
            }
        } else if event_type == POOL_RESIZED_EVENT {
            if let Some(current) = event.field_u64("current") {
                self.workers.set(current as f64);
            }
        } else if event_type == CloneEventKind::Created.as_str() {
            self.clones_created.inc();
        } else if let Some(status) = event_type.strip_prefix("clone.") {
            self.clone_outcomes.with_label_values(&[status]).inc();
        }
    }
}

/// Queue, pool and clone outcome metrics for one runtime.
pub struct RuntimeMetrics {
    registry: Registry,
    instruments: Instruments,
    bus: EventBus,
    subscriber_id: String,
}

impl RuntimeMetrics {
    /// Registers the metrics and subscribes them to `bus`.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if metric registration fails.
    pub fn attach(bus: &EventBus) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let instruments = Instruments::register(&registry)?;
        let subscriber_id = format!("runtime_metrics:{}", Uuid::new_v4());

        let event_types = QUEUE_EVENTS
            .iter()
            .copied()
            .chain([POOL_RESIZED_EVENT, CloneEventKind::Created.as_str()])
            .chain(CloneEventKind::TERMINAL.into_iter().map(CloneEventKind::as_str));
        for event_type in event_types {
            let handle = instruments.clone();
            bus.subscribe_with(
                event_type,
                EventHandler::sync(move |event: &Event| {
                    handle.observe(event);
                    Ok(())
                }),
                SubscribeOptions::new().with_subscriber_id(subscriber_id.clone()),
            );
        }

        tracing::info!("Runtime metrics attached");
        Ok(Self {
            registry,
            instruments,
            bus: bus.clone(),
            subscriber_id,
        })
    }

    /// Returns the registry holding these metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> f64 {
        self.instruments.queue_depth.get()
    }

    /// Current processing depth.
    pub fn processing_depth(&self) -> f64 {
        self.instruments.processing_depth.get()
    }

    /// Current worker count.
    pub fn workers(&self) -> f64 {
        self.instruments.workers.get()
    }

    /// Total clones created.
    pub fn clones_created(&self) -> u64 {
        self.instruments.clones_created.get()
    }

    /// Clones that ended with `status` (`completed`, `failed`, `terminated`).
    pub fn outcomes(&self, status: &str) -> f64 {
        self.instruments
            .clone_outcomes
            .get_metric_with_label_values(&[status])
            .map(|counter| counter.get())
            .unwrap_or(0.0)
    }

    /// Encodes every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

impl Drop for RuntimeMetrics {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscriber_id, None);
    }
}

impl std::fmt::Debug for RuntimeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeMetrics")
            .field("subscriber_id", &self.subscriber_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_and_pool_events_update_gauges() {
        let bus = EventBus::new();
        let metrics = RuntimeMetrics::attach(&bus).unwrap();

        bus.publish(
            Event::new("queue.enqueued", "test")
                .with_field("queue_size", 3u64)
                .with_field("processing_size", 1u64),
        );
        bus.publish(Event::new(POOL_RESIZED_EVENT, "test").with_field("current", 4u64));

        assert!((metrics.queue_depth() - 3.0).abs() < f64::EPSILON);
        assert!((metrics.processing_depth() - 1.0).abs() < f64::EPSILON);
        assert!((metrics.workers() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clone_events_count_outcomes() {
        let bus = EventBus::new();
        let metrics = RuntimeMetrics::attach(&bus).unwrap();

        bus.publish(Event::new("clone.created", "c1").with_field("clone_id", "c1"));
        bus.publish(Event::new("clone.completed", "c1").with_field("clone_id", "c1"));
        bus.publish(Event::new("clone.failed", "c2").with_field("clone_id", "c2"));
        bus.publish(Event::new("clone.completed", "c3").with_field("clone_id", "c3"));
        // Not a terminal event: ignored.
        bus.publish(Event::new("clone.progress", "c3").with_field("clone_id", "c3"));

        assert_eq!(metrics.clones_created(), 1);
        assert!((metrics.outcomes("completed") - 2.0).abs() < f64::EPSILON);
        assert!((metrics.outcomes("failed") - 1.0).abs() < f64::EPSILON);
        assert!((metrics.outcomes("progress") - 0.0).abs() < f64::EPSILON);
        assert!(metrics.encode().contains("clone_forge_clone_outcomes_total"));
    }

    #[test]
    fn test_separate_registries_and_drop_unsubscribes() {
        let bus = EventBus::new();
        let first = RuntimeMetrics::attach(&bus).unwrap();
        let second = RuntimeMetrics::attach(&bus).unwrap();
        assert_eq!(bus.subscription_count("queue.enqueued"), 2);

        drop(first);
        assert_eq!(bus.subscription_count("queue.enqueued"), 1);
        drop(second);
        assert_eq!(bus.subscription_count("queue.enqueued"), 0);
    }
}
