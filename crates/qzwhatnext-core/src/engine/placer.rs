use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditRecorder};
use crate::engine::availability::Interval;
use crate::error::EngineError;
use crate::models::{OverflowReason, ScheduledBlock, ScheduledBy, Task, Tier};
use crate::timezone::local_midnight;

/// A task the placer could not fit, with its structured reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowRecord {
    pub task_id: Uuid,
    pub reason: OverflowReason,
}

/// Everything the placement walk produces.
#[derive(Debug, Default)]
pub struct PlacerResult {
    pub blocks: Vec<ScheduledBlock>,
    pub overflows: Vec<OverflowRecord>,
}

/// Immutable inputs for one placement walk.
pub struct PlacerContext<'a> {
    pub user_id: Uuid,
    pub timezone: &'a str,
    pub now: DateTime<Utc>,
    pub horizon_end: DateTime<Utc>,
    pub granularity_minutes: i64,
    /// Latest end time per task that already holds locked or user-scheduled
    /// blocks; these tasks are not re-placed.
    pub pinned_task_ends: &'a HashMap<Uuid, DateTime<Utc>>,
    /// Tasks flagged infeasible by the validator, with their reasons.
    pub infeasible: &'a HashMap<Uuid, OverflowReason>,
}

/// A fragment of free time, remembering which availability interval it came
/// from. Dependent tasks must move to an interval after the one their
/// dependency occupies, so fragments keep their origin as they shrink.
#[derive(Debug, Clone, Copy)]
struct FreeSlot {
    interval: Interval,
    origin: usize,
}

/// Walk tasks in final rank order and place each into the earliest feasible
/// free time. Every task ends in exactly one of {placed, overflow, pinned}.
pub fn place_tasks(
    ranked: &[Uuid],
    tasks: &HashMap<Uuid, &Task>,
    tiers: &HashMap<Uuid, Tier>,
    free: Vec<Interval>,
    ctx: &PlacerContext<'_>,
    audit: &mut AuditRecorder,
) -> Result<PlacerResult, EngineError> {
    let mut slots: Vec<FreeSlot> = free
        .into_iter()
        .enumerate()
        .map(|(origin, interval)| FreeSlot { interval, origin })
        .collect();

    let mut result = PlacerResult::default();
    let mut placed_ends: HashMap<Uuid, DateTime<Utc>> = ctx.pinned_task_ends.clone();
    let mut placed_origins: HashMap<Uuid, usize> = HashMap::new();
    let mut overflowed: HashSet<Uuid> = HashSet::new();
    let open_ids: HashSet<Uuid> = tasks.keys().copied().collect();

    for task_id in ranked {
        let Some(task) = tasks.get(task_id).copied() else {
            continue;
        };

        // Pinned tasks keep their existing blocks; nothing to place.
        if ctx.pinned_task_ends.contains_key(task_id) {
            continue;
        }

        if let Some(&reason) = ctx.infeasible.get(task_id) {
            overflow(&mut result, &mut overflowed, audit, *task_id, reason);
            continue;
        }

        // Dependencies force order: an open dependency that is overflowed or
        // not yet placed drags this task into overflow.
        let mut dep_bound: Option<DateTime<Utc>> = None;
        let mut dep_origin: Option<usize> = None;
        let mut dep_blocked = false;
        for dep in &task.dependencies {
            if overflowed.contains(dep) {
                dep_blocked = true;
                break;
            }
            match placed_ends.get(dep) {
                Some(end) => {
                    dep_bound = Some(dep_bound.map_or(*end, |b: DateTime<Utc>| b.max(*end)));
                    if let Some(origin) = placed_origins.get(dep) {
                        dep_origin = Some(dep_origin.map_or(*origin, |o: usize| o.max(*origin)));
                    }
                }
                None if open_ids.contains(dep) => {
                    dep_blocked = true;
                    break;
                }
                // Completed or absent dependencies no longer constrain.
                None => {}
            }
        }
        if dep_blocked {
            overflow(
                &mut result,
                &mut overflowed,
                audit,
                *task_id,
                OverflowReason::DepUnplaced,
            );
            continue;
        }

        let mut earliest = ctx.now;
        if let Some(start_after) = task.start_after {
            earliest = earliest.max(local_midnight(start_after, ctx.timezone)?);
        }
        if let Some((flex_start, _)) = task.flexibility_window() {
            earliest = earliest.max(flex_start);
        }
        if let Some(bound) = dep_bound {
            earliest = earliest.max(bound);
        }
        // A dependent task starts in an interval after its dependency's.
        let min_origin = dep_origin.map(|o| o + 1).unwrap_or(0);

        let flex_end = task.flexibility_window().map(|(_, end)| end);
        let mut latest = ctx.horizon_end;
        if let Some(deadline) = task.deadline {
            latest = latest.min(deadline);
        }
        if let Some(flex_end) = flex_end {
            latest = latest.min(flex_end);
        }

        let constraint_reason = tightest_bound_reason(task, latest, ctx.horizon_end);

        if latest <= earliest {
            overflow(&mut result, &mut overflowed, audit, *task_id, constraint_reason);
            continue;
        }

        let duration = Duration::minutes(task.estimated_duration);
        match fit(
            &slots,
            min_origin,
            earliest,
            latest,
            duration,
            ctx.granularity_minutes,
        ) {
            Some(chunks) => {
                let split = chunks.len() > 1;
                let mut block_ids = Vec::with_capacity(chunks.len());
                let mut task_end = earliest;
                let mut last_origin = min_origin;

                for chunk in &chunks {
                    subtract_slot(&mut slots, chunk.interval);
                    let block = ScheduledBlock {
                        id: Uuid::now_v7(),
                        user_id: ctx.user_id,
                        task_id: *task_id,
                        start_time: chunk.interval.start,
                        end_time: chunk.interval.end,
                        scheduled_by: ScheduledBy::System,
                        locked: false,
                        ..Default::default()
                    };
                    task_end = task_end.max(chunk.interval.end);
                    last_origin = last_origin.max(chunk.origin);
                    block_ids.push(block.id);
                    result.blocks.push(block);
                }

                placed_ends.insert(*task_id, task_end);
                placed_origins.insert(*task_id, last_origin);

                let tier_token = tiers
                    .get(task_id)
                    .map(|t| t.reason_token())
                    .unwrap_or("home_care_default");
                let fit_token = if split { "split_fit" } else { "earliest_fit" };
                audit.record(
                    AuditEventType::ScheduleBuilt,
                    Some(*task_id),
                    json!({
                        "reasons": [tier_token, fit_token],
                        "block_ids": block_ids,
                    }),
                );
            }
            None => {
                overflow(&mut result, &mut overflowed, audit, *task_id, constraint_reason);
            }
        }
    }

    Ok(result)
}

/// Which structured reason applies when no placement exists inside
/// `[earliest, latest]`: the constraint that produced the binding upper
/// bound names the failure.
fn tightest_bound_reason(
    task: &Task,
    latest: DateTime<Utc>,
    horizon_end: DateTime<Utc>,
) -> OverflowReason {
    if let Some((_, flex_end)) = task.flexibility_window() {
        if latest == flex_end && flex_end < horizon_end {
            return OverflowReason::FlexWindowEmpty;
        }
    }
    if let Some(deadline) = task.deadline {
        if latest == deadline && deadline < horizon_end {
            return OverflowReason::DeadlineUnreachable;
        }
    }
    OverflowReason::NoCapacity
}

fn overflow(
    result: &mut PlacerResult,
    overflowed: &mut HashSet<Uuid>,
    audit: &mut AuditRecorder,
    task_id: Uuid,
    reason: OverflowReason,
) {
    overflowed.insert(task_id);
    result.overflows.push(OverflowRecord { task_id, reason });
    audit.record(
        AuditEventType::OverflowFlagged,
        Some(task_id),
        json!({ "reason": reason.as_token() }),
    );
}

/// Find the earliest placement inside `[earliest, latest]`, using only
/// slots from `min_origin` onwards.
///
/// A single contiguous slot that holds the whole duration wins. Failing
/// that, the duration splits across slots: every chunk spans at least one
/// granularity slot, and the final chunk may equal the exact remaining
/// duration. Returns None when cumulative capacity falls short.
fn fit(
    slots: &[FreeSlot],
    min_origin: usize,
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
    duration: Duration,
    granularity_minutes: i64,
) -> Option<Vec<FreeSlot>> {
    let clipped: Vec<FreeSlot> = slots
        .iter()
        .filter(|slot| slot.origin >= min_origin)
        .map(|slot| FreeSlot {
            interval: slot.interval.clipped(earliest, latest),
            origin: slot.origin,
        })
        .filter(|slot| !slot.interval.is_empty())
        .collect();

    // Contiguous fit first.
    for slot in &clipped {
        if slot.interval.length() >= duration {
            return Some(vec![FreeSlot {
                interval: Interval::new(slot.interval.start, slot.interval.start + duration),
                origin: slot.origin,
            }]);
        }
    }

    // Split fit.
    let granularity = Duration::minutes(granularity_minutes);
    let mut remaining = duration;
    let mut chunks = Vec::new();

    for slot in &clipped {
        if remaining <= Duration::zero() {
            break;
        }
        let avail = slot.interval.length();
        if avail < granularity {
            continue;
        }

        let mut chunk = remaining.min(avail);
        if chunk < remaining {
            // Keep chunks slot-aligned and the tail placeable.
            let aligned = chunk.num_minutes() / granularity_minutes * granularity_minutes;
            chunk = Duration::minutes(aligned);
            let tail = remaining - chunk;
            if tail > Duration::zero() && tail < granularity {
                chunk = chunk - granularity;
            }
            if chunk < granularity {
                continue;
            }
        }

        chunks.push(FreeSlot {
            interval: Interval::new(slot.interval.start, slot.interval.start + chunk),
            origin: slot.origin,
        });
        remaining = remaining - chunk;
    }

    (remaining <= Duration::zero()).then_some(chunks)
}

/// Remove a placed interval from the slot list, splitting fragments while
/// preserving their origin.
fn subtract_slot(slots: &mut Vec<FreeSlot>, placed: Interval) {
    let mut result = Vec::with_capacity(slots.len() + 1);
    for slot in slots.drain(..) {
        if !slot.interval.intersects(&placed) {
            result.push(slot);
            continue;
        }
        if slot.interval.start < placed.start {
            result.push(FreeSlot {
                interval: Interval::new(slot.interval.start, placed.start),
                origin: slot.origin,
            });
        }
        if placed.end < slot.interval.end {
            result.push(FreeSlot {
                interval: Interval::new(placed.end, slot.interval.end),
                origin: slot.origin,
            });
        }
    }
    *slots = result;
}
