use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ScheduledBlock, Task, User};
use crate::recurrence::{MaterializationSummary, RecurrenceRule};
use crate::repository::{Repository, TierUpdate};

pub mod availability;
pub mod exclusion;
pub mod inference;
pub mod placer;
pub mod ranking;
pub mod tiers;
pub mod validate;

use availability::{
    build_free_intervals, fetch_busy_intervals, AvailabilityProvider, Interval, SnapshotCache,
};
use inference::InferenceProvider;
use placer::{OverflowRecord, PlacerContext};

/// Everything one rebuild needs, captured once at pipeline entry so every
/// stage is a pure function of this context plus its inputs.
#[derive(Debug, Clone)]
pub struct RebuildContext {
    pub rebuild_id: Uuid,
    pub user: User,
    pub now: DateTime<Utc>,
    pub horizon_end: DateTime<Utc>,
}

/// The result of one full pipeline run.
#[derive(Debug)]
pub struct RebuildOutcome {
    pub rebuild_id: Uuid,
    /// Final system-scheduled blocks, calendar linkage preserved where the
    /// interval did not move.
    pub blocks: Vec<ScheduledBlock>,
    pub overflows: Vec<OverflowRecord>,
    /// External events whose blocks vanished; input for the synchronizer.
    pub orphaned_calendar_event_ids: Vec<String>,
    pub materialization: MaterializationSummary,
}

/// The deterministic per-user scheduling pipeline.
///
/// At most one rebuild per user runs at a time (advisory lock held for the
/// whole pipeline); rebuilds for distinct users proceed in parallel.
/// Additional triggers arriving mid-rebuild coalesce into a single follow-up
/// run.
pub struct SchedulingEngine {
    repository: Arc<dyn Repository>,
    availability: Arc<dyn AvailabilityProvider>,
    inference: Arc<dyn InferenceProvider>,
    config: EngineConfig,
    snapshot_cache: SnapshotCache,
    user_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<HashSet<Uuid>>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl SchedulingEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        availability: Arc<dyn AvailabilityProvider>,
        inference: Arc<dyn InferenceProvider>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            repository,
            availability,
            inference,
            config,
            snapshot_cache: SnapshotCache::new(),
            user_locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cooperative cancellation for one user's in-flight rebuild, observed
    /// at the suspension points.
    pub fn cancel_user(&self, user_id: Uuid) {
        let mut tokens = self.cancel_tokens.lock().expect("cancel token lock poisoned");
        if let Some(token) = tokens.remove(&user_id) {
            token.cancel();
        }
    }

    /// Cancel everything; used on process shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn user_lock(&self, user_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.user_locks.lock().expect("user lock map poisoned");
        locks.entry(user_id).or_default().clone()
    }

    fn cancel_token(&self, user_id: Uuid) -> CancellationToken {
        let mut tokens = self.cancel_tokens.lock().expect("cancel token lock poisoned");
        tokens
            .entry(user_id)
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }

    /// Run a rebuild now, waiting for any in-flight rebuild for this user.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn rebuild(&self, user_id: Uuid) -> Result<RebuildOutcome, EngineError> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.run_pipeline(user_id).await
    }

    /// Trigger-driven entry point with coalescing: if a rebuild for this
    /// user is already queued behind the in-flight one, the trigger folds
    /// into it and `None` comes back.
    pub async fn trigger_rebuild(
        &self,
        user_id: Uuid,
    ) -> Result<Option<RebuildOutcome>, EngineError> {
        {
            let mut pending = self.pending.lock().expect("pending set poisoned");
            if !pending.insert(user_id) {
                return Ok(None);
            }
        }

        let lock = self.user_lock(user_id);
        let guard = lock.lock().await;
        self.pending
            .lock()
            .expect("pending set poisoned")
            .remove(&user_id);
        let outcome = self.run_pipeline(user_id).await?;
        drop(guard);
        Ok(Some(outcome))
    }

    /// The ten stages, strictly in order. Holds the caller's user lock.
    async fn run_pipeline(&self, user_id: Uuid) -> Result<RebuildOutcome, EngineError> {
        let cancel = self.cancel_token(user_id);
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let user = self
            .repository
            .find_user(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;
        crate::timezone::validate_timezone(&user.timezone)?;

        let now = Utc::now();
        let ctx = RebuildContext {
            rebuild_id: Uuid::now_v7(),
            horizon_end: now + self.config.horizon(),
            user,
            now,
        };
        let mut audit = AuditRecorder::new(user_id, Some(ctx.rebuild_id));

        info!(rebuild_id = %ctx.rebuild_id, horizon_end = %ctx.horizon_end, "rebuild started");

        // Stage 1: materialize recurring series.
        let materialization = self
            .repository
            .materialize_habits(&ctx.user, ctx.now, ctx.horizon_end, Some(ctx.rebuild_id))
            .await?;

        // Stage 2: load the active open task set.
        let tasks = self.repository.list_open_tasks(user_id).await?;

        // Stage 3: exclusion gate, ahead of any inference call.
        let excluded_ids: HashSet<Uuid> = tasks
            .iter()
            .filter(|t| exclusion::is_ai_excluded(t))
            .map(|t| t.id)
            .collect();
        let (mut eligible, excluded_tasks) = exclusion::partition_excluded(tasks);

        // Stage 4: structured attribute inference for eligible tasks.
        let inference_outcomes = inference::enrich_tasks(
            self.inference.as_ref(),
            &self.config,
            &mut eligible,
            &mut audit,
            &cancel,
        )
        .await?;

        let mut all_tasks = eligible;
        all_tasks.extend(excluded_tasks);

        // Stage 5: rebuild-time feasibility check.
        let mut infeasible = HashMap::new();
        for task in &all_tasks {
            if let validate::Feasibility::Infeasible(reason) =
                validate::check_feasibility(task, ctx.now, &ctx.user.timezone)?
            {
                infeasible.insert(task.id, reason);
            }
        }

        // Stage 6: governing tier assignment.
        let assignments = tiers::assign_tiers(
            &all_tasks,
            &excluded_ids,
            &inference_outcomes,
            ctx.now,
            &self.config,
            &mut audit,
        );

        // Stage 7: stable intra-tier ranking.
        let ranked = ranking::rank_tasks(&all_tasks, &assignments, &ctx.user.timezone)?;

        // Stage 8: free time from the horizon minus every reservation.
        let (free, pinned_task_ends) = self.build_availability(&ctx, &cancel).await?;

        // Stage 9: placement walk.
        let task_map: HashMap<Uuid, &Task> = all_tasks.iter().map(|t| (t.id, t)).collect();
        let tier_map: HashMap<Uuid, crate::models::Tier> =
            assignments.iter().map(|a| (a.task_id, a.tier)).collect();
        let placer_ctx = PlacerContext {
            user_id,
            timezone: &ctx.user.timezone,
            now: ctx.now,
            horizon_end: ctx.horizon_end,
            granularity_minutes: self.config.scheduling_granularity,
            pinned_task_ends: &pinned_task_ends,
            infeasible: &infeasible,
        };
        let placed = placer::place_tasks(&ranked, &task_map, &tier_map, free, &placer_ctx, &mut audit)?;

        // Stage 10: persist schedule, tier columns and the audit trail in
        // one transaction.
        let tier_updates: Vec<TierUpdate> = assignments
            .iter()
            .map(|a| TierUpdate {
                task_id: a.task_id,
                tier: Some(a.tier),
                pending_tier: a.pending,
            })
            .collect();
        let persisted = self
            .repository
            .persist_rebuild(user_id, &tier_updates, &placed.blocks, &mut audit)
            .await?;

        info!(
            rebuild_id = %ctx.rebuild_id,
            blocks = persisted.blocks.len(),
            overflows = placed.overflows.len(),
            "rebuild complete"
        );

        Ok(RebuildOutcome {
            rebuild_id: ctx.rebuild_id,
            blocks: persisted.blocks,
            overflows: placed.overflows,
            orphaned_calendar_event_ids: persisted.orphaned_calendar_event_ids,
            materialization,
        })
    }

    /// Stage 8 worker: horizon minus locked blocks, user-scheduled blocks,
    /// recurring time blocks, and non-managed external events.
    async fn build_availability(
        &self,
        ctx: &RebuildContext,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Interval>, HashMap<Uuid, DateTime<Utc>>), EngineError> {
        let horizon = Interval::new(ctx.now, ctx.horizon_end);
        let mut reserved: Vec<Interval> = Vec::new();
        let mut pinned_task_ends: HashMap<Uuid, DateTime<Utc>> = HashMap::new();

        // Every stored block's external id proves engine management; the
        // marker alone is not trusted (users copy events across calendars).
        let all_blocks = self.repository.list_all_blocks(ctx.user.id).await?;
        let known_event_ids: HashSet<&str> = all_blocks
            .iter()
            .filter_map(|b| b.calendar_event_id.as_deref())
            .collect();

        for block in &all_blocks {
            let pinned = block.locked || block.scheduled_by == crate::models::ScheduledBy::User;
            if !pinned {
                continue;
            }
            reserved.push(Interval::new(block.start_time, block.end_time));
            pinned_task_ends
                .entry(block.task_id)
                .and_modify(|end| *end = (*end).max(block.end_time))
                .or_insert(block.end_time);
        }

        // Recurring reserved time, expanded across the horizon. Expansion
        // starts one occurrence-length early so a reservation already
        // underway still claims its tail.
        for time_block in self.repository.list_time_blocks(ctx.user.id).await? {
            let rule = RecurrenceRule::parse(&time_block.rrule)?;
            let duration = chrono::Duration::minutes(time_block.duration_minutes);
            for occurrence in rule.occurrences_between(ctx.now - duration, ctx.horizon_end) {
                reserved.push(Interval::new(occurrence, occurrence + duration));
            }
        }

        // External calendar, intervals only. Managed events are the
        // engine's own output and must not shrink its input.
        let busy = fetch_busy_intervals(
            self.availability.as_ref(),
            &self.snapshot_cache,
            &self.config,
            ctx.user.id,
            horizon,
            ctx.now,
            cancel,
        )
        .await?;

        for interval in busy {
            let managed = interval.engine_managed
                || interval
                    .event_id
                    .as_deref()
                    .is_some_and(|id| known_event_ids.contains(id));
            if managed {
                continue;
            }
            reserved.push(Interval::new(interval.start, interval.end));
        }

        Ok((build_free_intervals(horizon, &reserved), pinned_task_ends))
    }
}
