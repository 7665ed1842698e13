//! clone-forge: lifecycle runtime for managed clone units.
//!
//! Clones are long-running units of work driven through a strict lifecycle.
//! A priority queue (Redis, with an in-process fallback) feeds a resizable
//! worker pool, a manager owns and persists every live clone, and every
//! transition is published on an in-process event bus.

// Core modules
pub mod admin;
pub mod cli;
pub mod clones;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, RuntimeConfig};
pub use error::{
    AdminError, ManagerError, PoolError, QueueError, RegistryError, RuntimeError, StoreError,
};
pub use runtime::CloneRuntime;
