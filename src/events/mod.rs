//! Decoupled publish/subscribe signalling between components.
//!
//! Every lifecycle transition, queue mutation and pool resize is published
//! here; monitoring, persistence and tuning observers subscribe without the
//! publisher knowing about them.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventHandler, SubscribeOptions, DEFAULT_DEAD_LETTER_CAPACITY, WILDCARD};
pub use event::{Event, EventPriority};
