use std::fmt;

use evolve_core::error::{EvolveError, Result};

/// Lifecycle of a step within one batch.
///
/// `Pending -> Applying -> Applied`, or `Applying -> Failed`. A failed step
/// goes back to `Pending` only through [`StepState::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl StepState {
    pub fn start(self) -> Result<Self> {
        self.transition(StepState::Applying)
    }

    pub fn succeed(self) -> Result<Self> {
        self.transition(StepState::Applied)
    }

    pub fn fail(self) -> Result<Self> {
        self.transition(StepState::Failed)
    }

    /// Manually clear a failure so the step can be retried.
    pub fn clear(self) -> Result<Self> {
        self.transition(StepState::Pending)
    }

    /// Abandon an in-flight step whose work was never committed.
    pub fn abandon(self) -> Result<Self> {
        self.transition(StepState::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Applied | StepState::Failed)
    }

    fn transition(self, next: StepState) -> Result<Self> {
        use StepState::*;
        let allowed = matches!(
            (self, next),
            (Pending, Applying)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Applying, Pending)
                | (Failed, Pending)
        );
        if allowed {
            Ok(next)
        } else {
            Err(EvolveError::InvalidState(format!(
                "step cannot move from {} to {}",
                self, next
            )))
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Applying => "applying",
            StepState::Applied => "applied",
            StepState::Failed => "failed",
        };
        f.write_str(s)
    }
}
