use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use evolve_core::error::EvolveError;
use evolve_core::migration::StepKey;

use super::applier::ApplyReport;

/// Receives progress events from the applier.
///
/// All methods default to doing nothing.
pub trait MigrationObserver: Send + Sync {
    fn batch_started(&self, _run_id: Uuid, _pending: usize) {}

    fn step_started(&self, _key: &StepKey) {}

    fn step_skipped(&self, _key: &StepKey) {}

    fn step_applied(&self, _key: &StepKey, _elapsed: Duration) {}

    fn step_failed(&self, _key: &StepKey, _error: &EvolveError) {}

    fn batch_finished(&self, _report: &ApplyReport) {}
}

/// Logs applier events through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    slow_step_threshold: Duration,
}

impl TracingObserver {
    pub fn new(slow_step_threshold: Duration) -> Self {
        Self {
            slow_step_threshold,
        }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl MigrationObserver for TracingObserver {
    fn batch_started(&self, run_id: Uuid, pending: usize) {
        info!(%run_id, pending, "Starting migration batch");
    }

    fn step_started(&self, key: &StepKey) {
        info!("Applying migration: {}", key);
    }

    fn step_applied(&self, key: &StepKey, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed >= self.slow_step_threshold {
            warn!(elapsed_ms, "Slow migration applied: {}", key);
        } else {
            info!(elapsed_ms, "Migration applied: {}", key);
        }
    }

    fn step_failed(&self, key: &StepKey, error: &EvolveError) {
        warn!("Migration {} failed: {}", key, error);
    }

    fn batch_finished(&self, report: &ApplyReport) {
        info!(
            run_id = %report.run_id,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "Migration batch finished"
        );
    }
}
