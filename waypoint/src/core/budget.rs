//! Time and step budget helpers for the execution loop.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

/// Raised when a session consumes its global step budget. Fatal: the mission
/// halts and the condition is reported to the operator, never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetExceededError {
    pub steps_taken: u32,
    pub max_steps: u32,
}

impl fmt::Display for BudgetExceededError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step budget exceeded: {} steps taken, budget {}",
            self.steps_taken, self.max_steps
        )
    }
}

impl std::error::Error for BudgetExceededError {}

/// Fail with [`BudgetExceededError`] once the budget is consumed.
pub fn check_step_budget(steps_taken: u32, max_steps: u32) -> Result<()> {
    if steps_taken >= max_steps {
        return Err(anyhow!(BudgetExceededError {
            steps_taken,
            max_steps,
        }));
    }
    Ok(())
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("step timed out"));
    }
    Ok(remaining)
}
