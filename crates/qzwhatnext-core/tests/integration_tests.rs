use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use qzwhatnext_core::audit::AuditEventType;
use qzwhatnext_core::config::EngineConfig;
use qzwhatnext_core::db::establish_connection;
use qzwhatnext_core::engine::availability::{AvailabilityProvider, BusyInterval, Interval};
use qzwhatnext_core::engine::inference::{
    FixedInferenceProvider, InferenceProposals, InferenceProvider, Proposal,
};
use qzwhatnext_core::engine::SchedulingEngine;
use qzwhatnext_core::error::EngineError;
use qzwhatnext_core::models::*;
use qzwhatnext_core::recurrence::RecurrenceRule;
use qzwhatnext_core::repository::{
    AuditSink, BlockRepository, MaterializationRepository, SeriesRepository, SqliteRepository,
    TaskRepository, TimeBlockRepository, TokenRepository, UserRepository,
};
use qzwhatnext_core::sync::calendar::InMemoryCalendar;
use qzwhatnext_core::sync::CalendarSynchronizer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

/// Install the test subscriber once; `RUST_LOG` widens it when debugging a
/// failing scenario.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Helper to create a test database-backed repository
async fn setup_repository() -> (Arc<SqliteRepository>, TempDir) {
    init_tracing();
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");

    let pool = establish_connection(&db_path.to_string_lossy())
        .await
        .expect("Failed to establish test database connection");

    (Arc::new(SqliteRepository::new(pool)), temp_dir)
}

/// Availability provider scripted per test: a fixed busy list plus a
/// failure switch for outage scenarios.
#[derive(Default)]
struct ScriptedAvailability {
    busy: Mutex<Vec<BusyInterval>>,
    failing: AtomicBool,
    delay: Option<std::time::Duration>,
}

impl ScriptedAvailability {
    fn new(busy: Vec<BusyInterval>) -> Self {
        Self {
            busy: Mutex::new(busy),
            failing: AtomicBool::new(false),
            delay: None,
        }
    }

    fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AvailabilityProvider for ScriptedAvailability {
    async fn busy_intervals(
        &self,
        _user_id: Uuid,
        _window: Interval,
    ) -> Result<Vec<BusyInterval>, EngineError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "provider down",
            )));
        }
        Ok(self.busy.lock().unwrap().clone())
    }
}

fn busy(start: DateTime<Utc>, end: DateTime<Utc>) -> BusyInterval {
    BusyInterval {
        start,
        end,
        engine_managed: false,
        event_id: None,
    }
}

/// Busy everywhere in the horizon except the given free windows.
fn busy_except(
    now: DateTime<Utc>,
    free_windows: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<BusyInterval> {
    let far_future = now + Duration::days(40);
    let mut intervals = Vec::new();
    let mut cursor = now - Duration::hours(1);
    for (start, end) in free_windows {
        intervals.push(busy(cursor, *start));
        cursor = *end;
    }
    intervals.push(busy(cursor, far_future));
    intervals
}

fn test_config() -> EngineConfig {
    EngineConfig {
        remote_retry_attempts: 1,
        ..Default::default()
    }
}

fn engine_with(
    repository: Arc<SqliteRepository>,
    availability: Arc<dyn AvailabilityProvider>,
    inference: Arc<dyn InferenceProvider>,
) -> SchedulingEngine {
    SchedulingEngine::new(repository, availability, inference, test_config())
        .expect("engine construction failed")
}

async fn create_user(repo: &SqliteRepository, timezone: &str) -> User {
    repo.create_user(timezone).await.expect("create user")
}

fn work_task(title: &str, duration: i64) -> NewTaskData {
    NewTaskData {
        title: title.to_string(),
        estimated_duration: Some(duration),
        category: Some(Category::Work),
        ..Default::default()
    }
}

// ============================================================================
// Repository behaviour
// ============================================================================

#[tokio::test]
async fn tasks_are_invisible_across_users() {
    let (repo, _tmp) = setup_repository().await;
    let alice = create_user(&repo, "UTC").await;
    let bob = create_user(&repo, "UTC").await;

    let task = repo
        .add_task(alice.id, work_task("alice's report", 30))
        .await
        .unwrap();

    assert!(repo.find_task(bob.id, task.id).await.unwrap().is_none());
    assert!(repo.list_tasks(bob.id, true).await.unwrap().is_empty());
    assert_eq!(repo.list_tasks(alice.id, false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn soft_delete_restore_and_purge_cycle() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    let task = repo.add_task(user.id, work_task("ephemeral", 30)).await.unwrap();

    assert_ok!(repo.soft_delete_task(user.id, task.id).await);
    assert!(repo.list_tasks(user.id, false).await.unwrap().is_empty());
    assert_eq!(repo.list_tasks(user.id, true).await.unwrap().len(), 1);

    let restored = repo.restore_task(user.id, task.id).await.unwrap();
    assert!(restored.deleted_at.is_none());

    assert_ok!(repo.purge_task(user.id, task.id).await);
    assert!(repo.list_tasks(user.id, true).await.unwrap().is_empty());
    assert!(matches!(
        repo.restore_task(user.id, task.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn soft_delete_cascades_to_scheduled_blocks() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    let task = repo.add_task(user.id, work_task("scheduled", 60)).await.unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );
    let outcome = engine.rebuild(user.id).await.unwrap();
    assert_eq!(outcome.blocks.len(), 1);

    repo.soft_delete_task(user.id, task.id).await.unwrap();
    let remaining = repo
        .list_blocks_in_window(user.id, now - Duration::days(1), now + Duration::days(30))
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn dependency_cycles_are_rejected_at_write_time() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    let a = repo.add_task(user.id, work_task("a", 30)).await.unwrap();
    let b = repo
        .add_task(
            user.id,
            NewTaskData {
                dependencies: vec![a.id],
                ..work_task("b", 30)
            },
        )
        .await
        .unwrap();

    let result = repo
        .update_task(
            user.id,
            a.id,
            UpdateTaskData {
                set_dependencies: Some(vec![b.id]),
                ..Default::default()
            },
        )
        .await;

    assert!(matches!(result, Err(EngineError::CircularDependency(_, _))));
}

#[tokio::test]
async fn invalid_durations_are_constraint_violations() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    for duration in [2, 601] {
        let error = assert_err!(repo.add_task(user.id, work_task("bad", duration)).await);
        assert!(matches!(error, EngineError::ConstraintViolation(_)));
    }
}

#[tokio::test]
async fn series_occurrence_key_deduplicates_instances() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let occurrence = Utc::now();
    let series_id = Uuid::now_v7();

    let instance = |title: &str| NewTaskData {
        recurrence_series_id: Some(series_id),
        recurrence_occurrence_start: Some(occurrence),
        ..work_task(title, 30)
    };

    repo.add_task(user.id, instance("first")).await.unwrap();
    let duplicate = repo.add_task(user.id, instance("second")).await;
    assert!(matches!(duplicate, Err(EngineError::ConstraintViolation(_))));
}

#[tokio::test]
async fn schedule_relevant_updates_are_audited() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let task = repo.add_task(user.id, work_task("audited", 30)).await.unwrap();

    repo.update_task(
        user.id,
        task.id,
        UpdateTaskData {
            estimated_duration: Some(45),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let events = repo.list_audit_events(user.id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == AuditEventType::TaskUpdated && e.entity_id == Some(task.id)));
}

#[tokio::test]
async fn token_bookkeeping_stores_hash_and_revocation() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    let token = repo
        .create_token(user.id, "sha256:abcdef", "qzw_12ab")
        .await
        .unwrap();
    assert!(!token.is_revoked());

    repo.revoke_token(user.id, token.id).await.unwrap();
    let tokens = repo.list_tokens(user.id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].is_revoked());
}

// ============================================================================
// Deadline preemption
// ============================================================================

#[tokio::test]
async fn deadline_task_preempts_work_task() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "America/New_York").await;
    let now = Utc::now();

    let a = repo.add_task(user.id, work_task("deep work", 60)).await.unwrap();
    let b = repo
        .add_task(
            user.id,
            NewTaskData {
                title: "return library book".to_string(),
                estimated_duration: Some(30),
                category: Some(Category::Home),
                deadline: Some(now + Duration::hours(2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let free_start = now + Duration::minutes(30);
    let free_end = now + Duration::hours(5);
    let availability = Arc::new(ScriptedAvailability::new(busy_except(
        now,
        &[(free_start, free_end)],
    )));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );

    let outcome = engine.rebuild(user.id).await.unwrap();
    assert_eq!(outcome.blocks.len(), 2);
    assert!(outcome.overflows.is_empty());

    let block_b = outcome.blocks.iter().find(|x| x.task_id == b.id).unwrap();
    let block_a = outcome.blocks.iter().find(|x| x.task_id == a.id).unwrap();

    assert_eq!(block_b.start_time, free_start);
    assert_eq!(block_b.end_time, free_start + Duration::minutes(30));
    assert_eq!(block_a.start_time, block_b.end_time);
    assert_eq!(block_a.end_time, block_b.end_time + Duration::minutes(60));

    // Tiers persisted: B under deadline proximity, A under work.
    let b_after = repo.find_task(user.id, b.id).await.unwrap().unwrap();
    let a_after = repo.find_task(user.id, a.id).await.unwrap().unwrap();
    assert_eq!(b_after.tier, Some(Tier::DeadlineProximity));
    assert_eq!(a_after.tier, Some(Tier::Work));

    // The placement reason names the trigger.
    let events = repo.list_audit_events(user.id).await.unwrap();
    let built_for_b = events
        .iter()
        .find(|e| e.event_type == AuditEventType::ScheduleBuilt && e.entity_id == Some(b.id))
        .expect("schedule_built for B");
    let reasons = built_for_b.details.0["reasons"].clone();
    assert_eq!(reasons[0], "deadline_within_24h");
}

// ============================================================================
// AI exclusion respected
// ============================================================================

#[tokio::test]
async fn dot_prefixed_task_never_reaches_inference() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    let c = repo
        .add_task(
            user.id,
            NewTaskData {
                title: ".meds".to_string(),
                estimated_duration: Some(30),
                category: Some(Category::Unknown),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The adapter would gladly classify it, were it ever asked.
    let inference = Arc::new(FixedInferenceProvider::new().with_proposal(
        c.id,
        InferenceProposals {
            category: Some(Proposal::new(Category::Health, 0.95)),
            ..Default::default()
        },
    ));

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(repo.clone(), availability, inference);
    engine.rebuild(user.id).await.unwrap();

    let c_after = repo.find_task(user.id, c.id).await.unwrap().unwrap();
    assert_eq!(c_after.category, Category::Unknown);
    assert_eq!(c_after.tier, Some(Tier::HomeCare));

    let events = repo.list_audit_events(user.id).await.unwrap();
    assert!(!events
        .iter()
        .any(|e| e.event_type == AuditEventType::AttributeInferred && e.entity_id == Some(c.id)));
    assert!(!events
        .iter()
        .any(|e| e.event_type == AuditEventType::TierChanged && e.entity_id == Some(c.id)));
}

// ============================================================================
// Overflow with a structured reason
// ============================================================================

#[tokio::test]
async fn capacity_shortfall_flags_every_task() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    for i in 0..5 {
        repo.add_task(user.id, work_task(&format!("long {i}"), 180))
            .await
            .unwrap();
    }

    let free_start = now + Duration::hours(1);
    let availability = Arc::new(ScriptedAvailability::new(busy_except(
        now,
        &[(free_start, free_start + Duration::minutes(120))],
    )));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );

    let outcome = engine.rebuild(user.id).await.unwrap();
    assert!(outcome.blocks.is_empty());
    assert_eq!(outcome.overflows.len(), 5);
    assert!(outcome
        .overflows
        .iter()
        .all(|o| o.reason == OverflowReason::NoCapacity));

    let events = repo.list_audit_events(user.id).await.unwrap();
    let flagged = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::OverflowFlagged)
        .count();
    assert_eq!(flagged, 5);
}

// ============================================================================
// A user calendar move locks the block across rebuilds
// ============================================================================

#[tokio::test]
async fn user_calendar_move_locks_the_block() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    repo.add_task(user.id, work_task("movable", 60)).await.unwrap();

    let free_start = now + Duration::hours(2);
    let availability = Arc::new(ScriptedAvailability::new(busy_except(
        now,
        &[(free_start, free_start + Duration::hours(8))],
    )));
    let engine = engine_with(
        repo.clone(),
        availability.clone(),
        Arc::new(FixedInferenceProvider::new()),
    );

    let calendar = Arc::new(InMemoryCalendar::new());
    let synchronizer = CalendarSynchronizer::new(repo.clone(), calendar.clone(), test_config());

    let outcome = engine.rebuild(user.id).await.unwrap();
    let summary = synchronizer
        .sync_user(user.id, &outcome.orphaned_calendar_event_ids)
        .await
        .unwrap();
    assert_eq!(summary.created, 1);

    let block = repo.list_all_blocks(user.id).await.unwrap().pop().unwrap();
    let event_id = block.calendar_event_id.clone().unwrap();

    // The user drags the event out by four hours in their calendar client.
    let moved_start = block.start_time + Duration::hours(4);
    let moved_end = block.end_time + Duration::hours(4);
    calendar.user_moves_event(user.id, &event_id, moved_start, moved_end);

    let summary = synchronizer.sync_user(user.id, &[]).await.unwrap();
    assert_eq!(summary.imported_moves, 1);

    let block = repo.find_block(user.id, block.id).await.unwrap().unwrap();
    assert!(block.locked);
    assert_eq!(block.start_time, moved_start);
    assert_eq!(block.end_time, moved_end);

    // Later rebuilds leave the pinned interval alone even though earlier
    // free time exists.
    engine.rebuild(user.id).await.unwrap();
    let block = repo.find_block(user.id, block.id).await.unwrap().unwrap();
    assert_eq!(block.start_time, moved_start);
    assert_eq!(block.end_time, moved_end);

    let events = repo.list_audit_events(user.id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == AuditEventType::CalendarEditImported));
}

#[tokio::test]
async fn in_app_reschedule_locks_and_pushes_to_the_calendar() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    repo.add_task(user.id, work_task("pinnable", 30)).await.unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );
    let calendar = Arc::new(InMemoryCalendar::new());
    let synchronizer = CalendarSynchronizer::new(repo.clone(), calendar.clone(), test_config());

    let outcome = engine.rebuild(user.id).await.unwrap();
    synchronizer
        .sync_user(user.id, &outcome.orphaned_calendar_event_ids)
        .await
        .unwrap();

    let block = repo.list_all_blocks(user.id).await.unwrap().pop().unwrap();
    let new_start = block.start_time + Duration::hours(6);
    let new_end = new_start + Duration::minutes(30);

    let moved = repo
        .reschedule_block(user.id, block.id, new_start, new_end)
        .await
        .unwrap();
    assert!(moved.locked);
    assert_eq!(moved.scheduled_by, ScheduledBy::User);

    // The next sync pushes the engine-side move out to the calendar.
    let summary = synchronizer.sync_user(user.id, &[]).await.unwrap();
    assert_eq!(summary.pushed, 1);

    let event = calendar
        .event(user.id, block.calendar_event_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(event.start, new_start);
    assert_eq!(event.end, new_end);

    let events = repo.list_audit_events(user.id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == AuditEventType::Rescheduled));
}

// ============================================================================
// Dependency ordering
// ============================================================================

#[tokio::test]
async fn dependent_task_waits_for_a_later_interval() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    let p = repo.add_task(user.id, work_task("prepare slides", 30)).await.unwrap();
    let q = repo
        .add_task(
            user.id,
            NewTaskData {
                dependencies: vec![p.id],
                ..work_task("rehearse talk", 30)
            },
        )
        .await
        .unwrap();

    let morning = now + Duration::hours(2);
    let late = morning + Duration::hours(2);
    let availability = Arc::new(ScriptedAvailability::new(busy_except(
        now,
        &[
            (morning, morning + Duration::hours(1)),
            (late, late + Duration::hours(1)),
        ],
    )));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );

    let outcome = engine.rebuild(user.id).await.unwrap();
    assert!(outcome.overflows.is_empty());

    let block_p = outcome.blocks.iter().find(|b| b.task_id == p.id).unwrap();
    let block_q = outcome.blocks.iter().find(|b| b.task_id == q.id).unwrap();

    assert_eq!(block_p.start_time, morning);
    assert_eq!(block_p.end_time, morning + Duration::minutes(30));
    // Q starts in the interval after P's, not in P's remainder.
    assert_eq!(block_q.start_time, late);
    assert_eq!(block_q.end_time, late + Duration::minutes(30));
}

// ============================================================================
// Habit recurrence does not accumulate
// ============================================================================

#[tokio::test]
async fn missed_habit_rolls_to_todays_occurrence() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "America/New_York").await;
    let now = Utc::now();

    let series = repo
        .create_series(
            user.id,
            NewSeriesData {
                title: "morning stretch".to_string(),
                notes: None,
                duration_minutes: 15,
                category: Category::Health,
                rrule: "FREQ=DAILY;INTERVAL=1".to_string(),
                dtstart: now - Duration::hours(26),
                ai_excluded: false,
            },
        )
        .await
        .unwrap();

    // Yesterday's occurrence was materialized and never completed.
    let rule = RecurrenceRule::parse(&series.rrule).unwrap();
    let yesterday = rule
        .occurrences_between(now - Duration::hours(27), now - Duration::hours(20))
        .pop()
        .expect("yesterday's occurrence");
    let stale = repo
        .add_task(
            user.id,
            NewTaskData {
                title: series.title.clone(),
                estimated_duration: Some(series.duration_minutes),
                category: Some(series.category),
                recurrence_series_id: Some(series.id),
                recurrence_occurrence_start: Some(yesterday),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let summary = repo
        .materialize_habits(&user, now, now + Duration::days(7), None)
        .await
        .unwrap();
    assert_eq!(summary.missed_marked, 1);
    assert_eq!(summary.instances_created, 1);

    let tasks = repo.list_tasks(user.id, false).await.unwrap();
    let stale_after = tasks.iter().find(|t| t.id == stale.id).unwrap();
    assert_eq!(stale_after.status, TaskStatus::Missed);

    let open: Vec<_> = tasks.iter().filter(|t| t.status == TaskStatus::Open).collect();
    assert_eq!(open.len(), 1);
    assert_eq!(
        open[0].recurrence_occurrence_start,
        rule.current_occurrence_at(now)
    );

    // Idempotent: a second pass changes nothing.
    let summary = repo
        .materialize_habits(&user, now, now + Duration::days(7), None)
        .await
        .unwrap();
    assert_eq!(summary.instances_created, 0);
    assert_eq!(summary.missed_marked, 0);
    assert_eq!(repo.list_tasks(user.id, false).await.unwrap().len(), tasks.len());
}

// ============================================================================
// Quantified invariants
// ============================================================================

#[tokio::test]
async fn placed_blocks_respect_ordering_and_horizon_invariants() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    for i in 0..6 {
        let category = match i % 3 {
            0 => Category::Work,
            1 => Category::Health,
            _ => Category::Home,
        };
        repo.add_task(
            user.id,
            NewTaskData {
                title: format!("task {i}"),
                estimated_duration: Some(30 + 15 * (i % 3)),
                category: Some(category),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    let free_start = now + Duration::hours(1);
    let availability = Arc::new(ScriptedAvailability::new(busy_except(
        now,
        &[(free_start, free_start + Duration::hours(6))],
    )));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );

    let outcome = engine.rebuild(user.id).await.unwrap();
    let horizon_end = now + Duration::days(8);

    for block in &outcome.blocks {
        assert!(block.start_time < block.end_time);
        assert!(block.start_time >= now - Duration::minutes(1));
        assert!(block.end_time <= horizon_end);
    }
    for (i, a) in outcome.blocks.iter().enumerate() {
        for b in outcome.blocks.iter().skip(i + 1) {
            assert!(!a.overlaps(b), "blocks {} and {} overlap", a.id, b.id);
        }
    }
}

#[tokio::test]
async fn rebuilds_are_deterministic_given_identical_inputs() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    for i in 0..4 {
        repo.add_task(user.id, work_task(&format!("t{i}"), 30 + 30 * (i % 2)))
            .await
            .unwrap();
    }

    let free_start = now + Duration::hours(3);
    let availability = Arc::new(ScriptedAvailability::new(busy_except(
        now,
        &[(free_start, free_start + Duration::hours(5))],
    )));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );

    let first = engine.rebuild(user.id).await.unwrap();
    let second = engine.rebuild(user.id).await.unwrap();

    let shape = |blocks: &[ScheduledBlock]| {
        let mut s: Vec<(Uuid, DateTime<Utc>, DateTime<Utc>)> = blocks
            .iter()
            .map(|b| (b.task_id, b.start_time, b.end_time))
            .collect();
        s.sort();
        s
    };
    assert_eq!(shape(&first.blocks), shape(&second.blocks));

    // Reason tokens are identical, modulo timestamps and ids.
    let events = repo.list_audit_events(user.id).await.unwrap();
    let reasons_for = |rebuild_id: Uuid| -> Vec<String> {
        events
            .iter()
            .filter(|e| {
                e.rebuild_id == Some(rebuild_id) && e.event_type == AuditEventType::ScheduleBuilt
            })
            .map(|e| e.details.0["reasons"].to_string())
            .collect()
    };
    assert_eq!(reasons_for(first.rebuild_id), reasons_for(second.rebuild_id));
}

#[tokio::test]
async fn recurring_time_blocks_reserve_their_occurrences() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    // A daily one-hour reservation starting two hours from now.
    repo.create_time_block(user.id, "school run", "FREQ=DAILY;INTERVAL=1", 60, None)
        .await
        .unwrap();
    let task = repo.add_task(user.id, work_task("around the block", 480)).await.unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );
    let outcome = engine.rebuild(user.id).await.unwrap();

    let time_block_rule = RecurrenceRule::parse(
        &repo.list_time_blocks(user.id).await.unwrap()[0].rrule,
    )
    .unwrap();
    let reserved: Vec<(DateTime<Utc>, DateTime<Utc>)> = time_block_rule
        .occurrences_between(now, now + Duration::days(8))
        .into_iter()
        .map(|start| (start, start + Duration::minutes(60)))
        .collect();
    assert!(!reserved.is_empty());

    for block in outcome.blocks.iter().filter(|b| b.task_id == task.id) {
        for (start, end) in &reserved {
            assert!(
                block.end_time <= *start || block.start_time >= *end,
                "block overlaps a reserved time block"
            );
        }
    }
}

// ============================================================================
// Availability outage policy
// ============================================================================

#[tokio::test]
async fn availability_outage_falls_back_to_fresh_snapshot() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    repo.add_task(user.id, work_task("steady", 30)).await.unwrap();

    let free_start = now + Duration::hours(1);
    let availability = Arc::new(ScriptedAvailability::new(busy_except(
        now,
        &[(free_start, free_start + Duration::hours(2))],
    )));
    let engine = engine_with(
        repo.clone(),
        availability.clone(),
        Arc::new(FixedInferenceProvider::new()),
    );

    let first = engine.rebuild(user.id).await.unwrap();
    assert_eq!(first.blocks.len(), 1);

    // Provider goes dark; the snapshot is seconds old, so the rebuild
    // proceeds on it.
    availability.set_failing(true);
    let second = engine.rebuild(user.id).await.unwrap();
    assert_eq!(second.blocks.len(), 1);
}

#[tokio::test]
async fn availability_outage_without_snapshot_aborts_and_preserves_schedule() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    repo.add_task(user.id, work_task("stranded", 30)).await.unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(
        repo.clone(),
        availability.clone(),
        Arc::new(FixedInferenceProvider::new()),
    );

    let first = engine.rebuild(user.id).await.unwrap();
    assert_eq!(first.blocks.len(), 1);

    // A fresh engine has no snapshot cache to lean on.
    let cold_engine = engine_with(
        repo.clone(),
        availability.clone(),
        Arc::new(FixedInferenceProvider::new()),
    );
    availability.set_failing(true);
    let result = cold_engine.rebuild(user.id).await;
    assert!(matches!(result, Err(EngineError::AvailabilityUnavailable)));

    // The last good schedule is untouched.
    let blocks = repo.list_all_blocks(user.id).await.unwrap();
    assert_eq!(blocks.len(), 1);
}

// ============================================================================
// Inference staging and confirmation
// ============================================================================

#[tokio::test]
async fn low_confidence_tier_change_stages_until_confirmed() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    let task = repo
        .add_task(
            user.id,
            NewTaskData {
                title: "sort out insurance".to_string(),
                estimated_duration: Some(30),
                category: Some(Category::Unknown),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));

    // First rebuild records the default tier without inference help.
    let engine = engine_with(
        repo.clone(),
        availability.clone(),
        Arc::new(FixedInferenceProvider::new()),
    );
    engine.rebuild(user.id).await.unwrap();
    let after_first = repo.find_task(user.id, task.id).await.unwrap().unwrap();
    assert_eq!(after_first.tier, Some(Tier::HomeCare));

    // Now the adapter proposes a health classification at 0.7: above the
    // acceptance threshold, below the auto-apply threshold.
    let staged_engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new().with_proposal(
            task.id,
            InferenceProposals {
                category: Some(Proposal::new(Category::Health, 0.7)),
                ..Default::default()
            },
        )),
    );
    staged_engine.rebuild(user.id).await.unwrap();

    let staged = repo.find_task(user.id, task.id).await.unwrap().unwrap();
    assert_eq!(staged.tier, Some(Tier::HomeCare));
    assert_eq!(staged.pending_tier, Some(Tier::Health));

    let confirmed = repo.confirm_pending_tier(user.id, task.id).await.unwrap();
    assert_eq!(confirmed.tier, Some(Tier::Health));
    assert_eq!(confirmed.pending_tier, None);
}

// ============================================================================
// Calendar sync idempotence and ownership
// ============================================================================

#[tokio::test]
async fn second_sync_pass_performs_zero_writes() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    repo.add_task(user.id, work_task("sync me", 60)).await.unwrap();
    repo.add_task(user.id, work_task("me too", 30)).await.unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );
    let calendar = Arc::new(InMemoryCalendar::new());
    let synchronizer = CalendarSynchronizer::new(repo.clone(), calendar.clone(), test_config());

    let outcome = engine.rebuild(user.id).await.unwrap();
    synchronizer
        .sync_user(user.id, &outcome.orphaned_calendar_event_ids)
        .await
        .unwrap();
    let writes_after_first = calendar.write_count();
    assert_eq!(writes_after_first, 2);

    let summary = synchronizer.sync_user(user.id, &[]).await.unwrap();
    assert_eq!(summary, Default::default());
    assert_eq!(calendar.write_count(), writes_after_first);
}

#[tokio::test]
async fn external_title_edit_imports_into_the_task() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    let task = repo.add_task(user.id, work_task("draft title", 30)).await.unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );
    let calendar = Arc::new(InMemoryCalendar::new());
    let synchronizer = CalendarSynchronizer::new(repo.clone(), calendar.clone(), test_config());

    let outcome = engine.rebuild(user.id).await.unwrap();
    synchronizer
        .sync_user(user.id, &outcome.orphaned_calendar_event_ids)
        .await
        .unwrap();

    let block = repo.list_all_blocks(user.id).await.unwrap().pop().unwrap();
    let event_id = block.calendar_event_id.clone().unwrap();
    calendar.user_edits_title(user.id, &event_id, "final title");

    let summary = synchronizer.sync_user(user.id, &[]).await.unwrap();
    assert_eq!(summary.imported_titles, 1);

    let task_after = repo.find_task(user.id, task.id).await.unwrap().unwrap();
    assert_eq!(task_after.title, "final title");
    // A title-only edit does not lock the block.
    let block_after = repo.find_block(user.id, block.id).await.unwrap().unwrap();
    assert!(!block_after.locked);
}

#[tokio::test]
async fn unmanaged_events_are_never_touched() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;
    let now = Utc::now();

    let calendar = Arc::new(InMemoryCalendar::new());
    calendar.insert_unmanaged_event(
        user.id,
        "foreign-1",
        now + Duration::hours(1),
        now + Duration::hours(2),
    );
    let synchronizer = CalendarSynchronizer::new(repo.clone(), calendar.clone(), test_config());

    // Even when an orphan list names the event, the missing ownership proof
    // protects it.
    let summary = synchronizer
        .sync_user(user.id, &["foreign-1".to_string()])
        .await
        .unwrap();
    assert_eq!(summary.deleted, 0);
    assert!(calendar.event(user.id, "foreign-1").is_some());
}

#[tokio::test]
async fn stale_blocks_delete_their_external_events() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    let task = repo.add_task(user.id, work_task("to be done", 30)).await.unwrap();

    let availability = Arc::new(ScriptedAvailability::new(vec![]));
    let engine = engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    );
    let calendar = Arc::new(InMemoryCalendar::new());
    let synchronizer = CalendarSynchronizer::new(repo.clone(), calendar.clone(), test_config());

    let outcome = engine.rebuild(user.id).await.unwrap();
    synchronizer
        .sync_user(user.id, &outcome.orphaned_calendar_event_ids)
        .await
        .unwrap();
    assert_eq!(calendar.event_count(user.id), 1);

    // Completing the task removes its future blocks and reports their
    // external events; sync deletes them.
    let completion = repo.complete_task(user.id, task.id).await.unwrap();
    assert_eq!(completion.task.status, TaskStatus::Completed);
    assert_eq!(completion.orphaned_calendar_event_ids.len(), 1);

    let summary = synchronizer
        .sync_user(user.id, &completion.orphaned_calendar_event_ids)
        .await
        .unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(calendar.event_count(user.id), 0);
}

// ============================================================================
// Concurrency: coalescing
// ============================================================================

#[tokio::test]
async fn concurrent_triggers_coalesce_to_one_follow_up() {
    let (repo, _tmp) = setup_repository().await;
    let user = create_user(&repo, "UTC").await;

    repo.add_task(user.id, work_task("churn", 30)).await.unwrap();

    // A slow provider keeps the first rebuild in flight while the burst of
    // triggers arrives.
    let availability = Arc::new(
        ScriptedAvailability::new(vec![]).with_delay(std::time::Duration::from_millis(200)),
    );
    let engine = Arc::new(engine_with(
        repo.clone(),
        availability,
        Arc::new(FixedInferenceProvider::new()),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let user_id = user.id;
        handles.push(tokio::spawn(
            async move { engine.trigger_rebuild(user_id).await },
        ));
    }

    let mut ran = 0;
    let mut coalesced = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Some(_) => ran += 1,
            None => coalesced += 1,
        }
    }

    assert!(ran >= 1, "at least one trigger must run");
    assert_eq!(ran + coalesced, 8);
    // The burst folds into at most the in-flight rebuild plus one follow-up.
    assert!(ran <= 2, "expected coalescing, got {ran} runs");
}
