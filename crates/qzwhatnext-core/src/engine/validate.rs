use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::models::{OverflowReason, Task};
use crate::timezone::local_midnight;

/// Per-task feasibility verdict at rebuild time. Write-time validation
/// already rejected malformed rows; this stage catches tasks that became
/// infeasible as `now` moved past their constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feasibility {
    Feasible,
    Infeasible(OverflowReason),
}

/// Flag tasks whose hard constraints can no longer be met. Flagged tasks
/// skip placement and surface as overflow records, never as rebuild errors.
pub fn check_feasibility(
    task: &Task,
    now: DateTime<Utc>,
    timezone: &str,
) -> Result<Feasibility, EngineError> {
    let duration = task.duration();

    if let Some((flex_start, flex_end)) = task.flexibility_window() {
        let usable_start = flex_start.max(now);
        if flex_end <= usable_start || flex_end - usable_start < duration {
            return Ok(Feasibility::Infeasible(OverflowReason::FlexWindowEmpty));
        }
    }

    if let Some(deadline) = task.deadline {
        let mut earliest = now;
        if let Some(start_after) = task.start_after {
            earliest = earliest.max(local_midnight(start_after, timezone)?);
        }
        if deadline <= earliest || deadline - earliest < duration {
            return Ok(Feasibility::Infeasible(OverflowReason::DeadlineUnreachable));
        }
    }

    Ok(Feasibility::Feasible)
}
