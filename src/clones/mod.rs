//! Clones: units of schedulable work and their lifecycle.
//!
//! ```text
//!             initialize ok            start
//!   CREATED ───────────────► INITIALIZED ─────► RUNNING ──► COMPLETED
//!      │                                        │  ▲  │
//!      │ initialize err              pause      │  │  └───► FAILED
//!      ▼                                        ▼  │ resume
//!    FAILED                                    PAUSED
//!                                               │
//!                 stop (from RUNNING or PAUSED) └──────► TERMINATED
//! ```

pub mod builtin;
pub mod registry;
pub mod status;
pub mod unit;

pub use builtin::{EchoClone, SleepClone};
pub use registry::{CloneFactory, CloneRegistry};
pub use status::{CloneEventKind, CloneStatus};
pub use unit::{CloneInfo, CloneUnit, CloneWork, STALE_REASON};
