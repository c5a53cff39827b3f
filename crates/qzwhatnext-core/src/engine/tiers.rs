use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditRecorder};
use crate::config::EngineConfig;
use crate::engine::inference::AppliedInference;
use crate::models::{Category, Task, Tier};

/// Outcome of tier assignment for one task.
#[derive(Debug, Clone)]
pub struct TierAssignment {
    pub task_id: Uuid,
    /// The governing tier for this rebuild.
    pub tier: Tier,
    /// Staged inference-driven change awaiting user confirmation.
    pub pending: Option<Tier>,
}

/// Deterministic mapping into the nine-level hierarchy; the first trigger
/// that matches wins.
pub fn compute_tier(
    task: &Task,
    now: DateTime<Utc>,
    unlocks_other: bool,
    config: &EngineConfig,
) -> Tier {
    if let Some(deadline) = task.deadline {
        if deadline - now <= Duration::hours(24) {
            return Tier::DeadlineProximity;
        }
    }
    if task.risk_score >= config.risk_tier_threshold {
        return Tier::Risk;
    }
    if task.impact_score >= config.impact_tier_threshold || unlocks_other {
        return Tier::DownstreamImpact;
    }
    match task.category {
        Category::Child => Tier::Child,
        Category::Health => Tier::Health,
        Category::Work => Tier::Work,
        Category::Personal => Tier::StressReduction,
        Category::Family => Tier::Family,
        Category::Home | Category::Admin | Category::Ideas | Category::Unknown => Tier::HomeCare,
    }
}

/// Ids of tasks that at least one other open task depends on.
pub fn unlocking_tasks(tasks: &[Task]) -> HashSet<Uuid> {
    let open_ids: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
    let mut unlocked = HashSet::new();
    for task in tasks {
        for dep in &task.dependencies {
            if open_ids.contains(dep) {
                unlocked.insert(*dep);
            }
        }
    }
    unlocked
}

/// Assign every task exactly one governing tier.
///
/// `manual_priority_locked` freezes the recorded tier. AI-excluded tasks
/// never auto-change a recorded tier. A change driven by inference below the
/// confirmation threshold is staged into `pending` instead of applied.
pub fn assign_tiers(
    tasks: &[Task],
    excluded_ids: &HashSet<Uuid>,
    inference: &HashMap<Uuid, AppliedInference>,
    now: DateTime<Utc>,
    config: &EngineConfig,
    audit: &mut AuditRecorder,
) -> Vec<TierAssignment> {
    let unlocks = unlocking_tasks(tasks);
    let mut assignments = Vec::with_capacity(tasks.len());

    for task in tasks {
        let computed = compute_tier(task, now, unlocks.contains(&task.id), config);

        let assignment = match task.tier {
            Some(previous) if task.manual_priority_locked => TierAssignment {
                task_id: task.id,
                tier: previous,
                pending: task.pending_tier,
            },
            Some(previous) if previous == computed => TierAssignment {
                task_id: task.id,
                tier: previous,
                // A pending change that the recomputation no longer wants is
                // dropped.
                pending: task.pending_tier.filter(|p| *p != previous),
            },
            Some(previous) => {
                if excluded_ids.contains(&task.id) {
                    // Excluded tasks keep their recorded tier.
                    TierAssignment {
                        task_id: task.id,
                        tier: previous,
                        pending: task.pending_tier,
                    }
                } else {
                    let driven_by_inference = inference
                        .get(&task.id)
                        .and_then(|a| a.min_tier_relevant_confidence);
                    let staged = driven_by_inference
                        .is_some_and(|c| c < config.tier_change_confirm_threshold);

                    if staged {
                        TierAssignment {
                            task_id: task.id,
                            tier: previous,
                            pending: Some(computed),
                        }
                    } else {
                        audit.record(
                            AuditEventType::TierChanged,
                            Some(task.id),
                            json!({
                                "from": previous.rank(),
                                "to": computed.rank(),
                                "trigger": computed.reason_token(),
                            }),
                        );
                        TierAssignment {
                            task_id: task.id,
                            tier: computed,
                            pending: None,
                        }
                    }
                }
            }
            None => TierAssignment {
                task_id: task.id,
                tier: computed,
                pending: None,
            },
        };

        assignments.push(assignment);
    }

    assignments
}
