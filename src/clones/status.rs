//! Clone status values and the legal transition table.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a clone.
///
/// Lifecycle is strictly forward except `Paused` <-> `Running`.
/// `Completed`, `Failed` and `Terminated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloneStatus {
    /// Created but not initialized.
    Created,
    /// Initialized, waiting to be started.
    Initialized,
    /// Actively executing.
    Running,
    /// Execution paused; `resume` re-enters execution.
    Paused,
    /// Execution finished successfully.
    Completed,
    /// Initialization or execution failed.
    Failed,
    /// Stopped before completion.
    Terminated,
}

impl CloneStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [CloneStatus; 7] = [
        CloneStatus::Created,
        CloneStatus::Initialized,
        CloneStatus::Running,
        CloneStatus::Paused,
        CloneStatus::Completed,
        CloneStatus::Failed,
        CloneStatus::Terminated,
    ];

    /// Running or paused.
    pub fn is_active(self) -> bool {
        matches!(self, CloneStatus::Running | CloneStatus::Paused)
    }

    /// Completed, failed or terminated. No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CloneStatus::Completed | CloneStatus::Failed | CloneStatus::Terminated
        )
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Legal transitions:
    /// - Created -> Initialized | Failed
    /// - Initialized -> Running
    /// - Running -> Paused | Completed | Failed | Terminated
    /// - Paused -> Running | Failed | Terminated
    pub fn can_transition(self, to: CloneStatus) -> bool {
        use CloneStatus::*;
        matches!(
            (self, to),
            (Created, Initialized)
                | (Created, Failed)
                | (Initialized, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Terminated)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Terminated)
        )
    }

    /// Upper-case name used in snapshots and events.
    pub fn as_str(self) -> &'static str {
        match self {
            CloneStatus::Created => "CREATED",
            CloneStatus::Initialized => "INITIALIZED",
            CloneStatus::Running => "RUNNING",
            CloneStatus::Paused => "PAUSED",
            CloneStatus::Completed => "COMPLETED",
            CloneStatus::Failed => "FAILED",
            CloneStatus::Terminated => "TERMINATED",
        }
    }
}

impl std::fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloneStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CloneStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown clone status '{}'", s))
    }
}

/// Lifecycle event kinds emitted by a clone.
///
/// Each is published as `clone.<kind>` with at least `clone_id` in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloneEventKind {
    Created,
    Initialized,
    Started,
    Paused,
    Completed,
    Failed,
    Terminated,
    Progress,
    MetadataUpdated,
    Result,
}

impl CloneEventKind {
    /// Kinds after which the clone is terminal.
    pub const TERMINAL: [CloneEventKind; 3] = [
        CloneEventKind::Completed,
        CloneEventKind::Failed,
        CloneEventKind::Terminated,
    ];

    /// Full event type string.
    pub fn as_str(self) -> &'static str {
        match self {
            CloneEventKind::Created => "clone.created",
            CloneEventKind::Initialized => "clone.initialized",
            CloneEventKind::Started => "clone.started",
            CloneEventKind::Paused => "clone.paused",
            CloneEventKind::Completed => "clone.completed",
            CloneEventKind::Failed => "clone.failed",
            CloneEventKind::Terminated => "clone.terminated",
            CloneEventKind::Progress => "clone.progress",
            CloneEventKind::MetadataUpdated => "clone.metadata_updated",
            CloneEventKind::Result => "clone.result",
        }
    }
}

impl std::fmt::Display for CloneEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
