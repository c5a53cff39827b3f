use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

use crate::engine::tiers::TierAssignment;
use crate::error::EngineError;
use crate::models::Task;
use crate::timezone::local_end_of_day;

/// Precomputed sort key. Tasks order ascending by tier, then by the six-part
/// tuple; the id tiebreak makes the order total and the walk deterministic.
#[derive(Debug, Clone)]
struct RankKey {
    tier_rank: i32,
    deadline: Option<DateTime<Utc>>,
    due_by_eod: Option<DateTime<Utc>>,
    impact: f64,
    risk: f64,
    created_at: DateTime<Utc>,
    id: Uuid,
}

impl RankKey {
    fn compare(&self, other: &Self) -> Ordering {
        self.tier_rank
            .cmp(&other.tier_rank)
            .then_with(|| cmp_option_instant(self.deadline, other.deadline))
            .then_with(|| cmp_option_instant(self.due_by_eod, other.due_by_eod))
            .then_with(|| other.impact.total_cmp(&self.impact))
            .then_with(|| other.risk.total_cmp(&self.risk))
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// None sorts last: an absent deadline or due date is "+infinity".
fn cmp_option_instant(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Produce the final placement walk order: tiers high to low, stable
/// six-key ordering within each tier. Runtime adjustments never cross tiers.
pub fn rank_tasks(
    tasks: &[Task],
    assignments: &[TierAssignment],
    timezone: &str,
) -> Result<Vec<Uuid>, EngineError> {
    let tier_by_task: HashMap<Uuid, i32> = assignments
        .iter()
        .map(|a| (a.task_id, a.tier.rank()))
        .collect();

    let mut keys = Vec::with_capacity(tasks.len());
    for task in tasks {
        let Some(&tier_rank) = tier_by_task.get(&task.id) else {
            continue;
        };
        let due_by_eod = task
            .due_by
            .map(|date| local_end_of_day(date, timezone))
            .transpose()?;

        keys.push(RankKey {
            tier_rank,
            deadline: task.deadline,
            due_by_eod,
            impact: task.impact_score,
            risk: task.risk_score,
            created_at: task.created_at,
            id: task.id,
        });
    }

    keys.sort_by(|a, b| a.compare(b));
    Ok(keys.into_iter().map(|k| k.id).collect())
}
