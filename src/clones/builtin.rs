//! Built-in clone types used by the CLI and tests.
//!
//! - `Echo` copies `config.message` into its results and completes.
//! - `Sleep` sleeps in steps, reporting progress after each one. It checks
//!   its own status between steps, so it honours pause (yielding, then
//!   continuing from the same step on resume) and stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::status::CloneStatus;
use super::unit::{CloneUnit, CloneWork};

/// Echoes its configured message.
#[derive(Debug, Default)]
pub struct EchoClone;

impl EchoClone {
    pub const TYPE_NAME: &'static str = "Echo";
}

#[async_trait]
impl CloneWork for EchoClone {
    async fn initialize(&self, _clone: &CloneUnit) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, clone: &CloneUnit) -> anyhow::Result<()> {
        let message = clone
            .config()
            .get("message")
            .cloned()
            .unwrap_or(Value::Null);
        clone.set_result("echo", message);
        clone.update_progress(1.0, Some("echoed"));
        Ok(())
    }
}

/// Sleeps for `duration_secs` (default 1.0) split into `steps` (default 10).
#[derive(Debug, Default)]
pub struct SleepClone {
    completed_steps: AtomicU64,
}

impl SleepClone {
    pub const TYPE_NAME: &'static str = "Sleep";
    const DEFAULT_DURATION_SECS: f64 = 1.0;
    const DEFAULT_STEPS: u64 = 10;

    fn plan(clone: &CloneUnit) -> anyhow::Result<(Duration, u64)> {
        let config = clone.config();
        let duration_secs = config
            .get("duration_secs")
            .and_then(Value::as_f64)
            .unwrap_or(Self::DEFAULT_DURATION_SECS);
        let steps = config
            .get("steps")
            .and_then(Value::as_u64)
            .unwrap_or(Self::DEFAULT_STEPS);

        if !duration_secs.is_finite() || duration_secs < 0.0 {
            anyhow::bail!("duration_secs must be a non-negative number");
        }
        if steps == 0 {
            anyhow::bail!("steps must be at least 1");
        }
        Ok((Duration::from_secs_f64(duration_secs / steps as f64), steps))
    }
}

#[async_trait]
impl CloneWork for SleepClone {
    async fn initialize(&self, clone: &CloneUnit) -> anyhow::Result<()> {
        Self::plan(clone)?;
        Ok(())
    }

    async fn execute(&self, clone: &CloneUnit) -> anyhow::Result<()> {
        let (step, steps) = Self::plan(clone)?;

        loop {
            let done = self.completed_steps.load(Ordering::SeqCst);
            if done >= steps {
                break;
            }
            if clone.status() != CloneStatus::Running {
                debug!(clone_id = %clone.id(), step = done, "Sleep clone yielding");
                return Ok(());
            }

            tokio::time::sleep(step).await;
            let done = self.completed_steps.fetch_add(1, Ordering::SeqCst) + 1;
            clone.update_progress(
                done as f64 / steps as f64,
                Some(&format!("step {}/{}", done, steps)),
            );
        }

        clone.set_result("slept_secs", json!(step.as_secs_f64() * steps as f64));
        Ok(())
    }
}
