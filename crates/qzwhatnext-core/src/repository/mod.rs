use crate::audit::AuditRecorder;
use crate::db::DbPool;
use crate::error::EngineError;
use crate::models::{
    AutomationToken, CompletionOutcome, NewSeriesData, NewTaskData, RecurringTaskSeries,
    RecurringTimeBlock, ScheduledBlock, Task, Tier, UpdateTaskData, User,
};
use crate::recurrence::MaterializationSummary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// Re-export domain modules
pub mod blocks;
pub mod materialization;
pub mod series;
pub mod tasks;
pub mod time_blocks;
pub mod tokens;
pub mod users;

// Traits are defined in this module and implemented in respective domain modules

/// Tier columns to persist for one task at the end of a rebuild.
#[derive(Debug, Clone)]
pub struct TierUpdate {
    pub task_id: Uuid,
    pub tier: Option<Tier>,
    pub pending_tier: Option<Tier>,
}

/// Result of swapping in a rebuilt schedule.
#[derive(Debug, Clone, Default)]
pub struct SchedulePersistResult {
    /// The persisted system blocks, with calendar linkage inherited from
    /// surviving rows where the interval did not move.
    pub blocks: Vec<ScheduledBlock>,
    /// External event ids whose blocks no longer exist; the synchronizer
    /// deletes these.
    pub orphaned_calendar_event_ids: Vec<String>,
}

/// Domain-specific trait for user operations
#[async_trait]
pub trait UserRepository {
    async fn create_user(&self, timezone: &str) -> Result<User, EngineError>;
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, EngineError>;
    async fn set_user_timezone(&self, user_id: Uuid, timezone: &str) -> Result<User, EngineError>;
}

/// Domain-specific trait for task operations. Every operation is scoped to
/// an owner; cross-user reads are structurally impossible.
#[async_trait]
pub trait TaskRepository {
    async fn add_task(&self, user_id: Uuid, data: NewTaskData) -> Result<Task, EngineError>;
    async fn find_task(&self, user_id: Uuid, id: Uuid) -> Result<Option<Task>, EngineError>;
    async fn list_tasks(
        &self,
        user_id: Uuid,
        include_deleted: bool,
    ) -> Result<Vec<Task>, EngineError>;
    /// Active (non-deleted) open tasks, dependencies populated.
    async fn list_open_tasks(&self, user_id: Uuid) -> Result<Vec<Task>, EngineError>;
    async fn update_task(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: UpdateTaskData,
    ) -> Result<Task, EngineError>;
    /// Completion removes the task's future blocks; the returned event ids
    /// belong to the synchronizer's next delete pass.
    async fn complete_task(&self, user_id: Uuid, id: Uuid)
        -> Result<CompletionOutcome, EngineError>;
    /// Cascades to scheduled blocks; returns their external event ids.
    async fn soft_delete_task(&self, user_id: Uuid, id: Uuid) -> Result<Vec<String>, EngineError>;
    async fn restore_task(&self, user_id: Uuid, id: Uuid) -> Result<Task, EngineError>;
    /// Irreversible removal; cascades to scheduled blocks and dependencies
    /// and returns the removed blocks' external event ids.
    async fn purge_task(&self, user_id: Uuid, id: Uuid) -> Result<Vec<String>, EngineError>;
    /// Promote a staged inference-driven tier change.
    async fn confirm_pending_tier(&self, user_id: Uuid, id: Uuid) -> Result<Task, EngineError>;
}

/// Domain-specific trait for recurring series operations
#[async_trait]
pub trait SeriesRepository {
    async fn create_series(
        &self,
        user_id: Uuid,
        data: NewSeriesData,
    ) -> Result<RecurringTaskSeries, EngineError>;
    async fn find_series(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<RecurringTaskSeries>, EngineError>;
    async fn list_active_series(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecurringTaskSeries>, EngineError>;
    async fn soft_delete_series(&self, user_id: Uuid, id: Uuid) -> Result<(), EngineError>;
}

/// Habit materialization, run as the first pipeline stage. Audit events for
/// missed flips and new instances commit with the task writes themselves.
#[async_trait]
pub trait MaterializationRepository {
    async fn materialize_habits(
        &self,
        user: &User,
        now: DateTime<Utc>,
        horizon_end: DateTime<Utc>,
        rebuild_id: Option<Uuid>,
    ) -> Result<MaterializationSummary, EngineError>;
}

/// Domain-specific trait for recurring reserved time
#[async_trait]
pub trait TimeBlockRepository {
    async fn create_time_block(
        &self,
        user_id: Uuid,
        title: &str,
        rrule: &str,
        duration_minutes: i64,
        calendar_event_id: Option<String>,
    ) -> Result<RecurringTimeBlock, EngineError>;
    async fn list_time_blocks(&self, user_id: Uuid) -> Result<Vec<RecurringTimeBlock>, EngineError>;
    async fn soft_delete_time_block(&self, user_id: Uuid, id: Uuid) -> Result<(), EngineError>;
}

/// Domain-specific trait for scheduled block operations
#[async_trait]
pub trait BlockRepository {
    async fn find_block(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<ScheduledBlock>, EngineError>;
    async fn list_blocks_in_window(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>, EngineError>;
    async fn list_all_blocks(&self, user_id: Uuid) -> Result<Vec<ScheduledBlock>, EngineError>;
    /// User pins a block to a new interval; the block becomes user-scheduled
    /// and locked so rebuilds preserve it.
    async fn reschedule_block(
        &self,
        user_id: Uuid,
        id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ScheduledBlock, EngineError>;
    /// Swap in a rebuilt schedule: tier columns, new system blocks, and the
    /// buffered audit events commit in one transaction. Locked and
    /// user-scheduled blocks survive; unchanged blocks keep their calendar
    /// linkage.
    async fn persist_rebuild(
        &self,
        user_id: Uuid,
        tier_updates: &[TierUpdate],
        new_blocks: &[ScheduledBlock],
        audit: &mut AuditRecorder,
    ) -> Result<SchedulePersistResult, EngineError>;
    /// Synchronizer write-back of external linkage and lock state.
    async fn update_block_sync_state(&self, block: &ScheduledBlock) -> Result<(), EngineError>;
}

/// Append-only audit sink, multi-writer. Used by collaborators (the
/// calendar synchronizer) that run outside a repository transaction.
#[async_trait]
pub trait AuditSink {
    async fn append_audit(
        &self,
        user_id: Uuid,
        event_type: crate::audit::AuditEventType,
        entity_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> Result<(), EngineError>;
    /// The user's trail in emit order.
    async fn list_audit_events(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<crate::audit::AuditEvent>, EngineError>;
}

/// Domain-specific trait for automation token bookkeeping
#[async_trait]
pub trait TokenRepository {
    async fn create_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        prefix: &str,
    ) -> Result<AutomationToken, EngineError>;
    async fn list_tokens(&self, user_id: Uuid) -> Result<Vec<AutomationToken>, EngineError>;
    async fn revoke_token(&self, user_id: Uuid, id: Uuid) -> Result<(), EngineError>;
}

/// Main repository trait that composes all domain traits
#[async_trait]
pub trait Repository:
    UserRepository
    + TaskRepository
    + SeriesRepository
    + MaterializationRepository
    + TimeBlockRepository
    + BlockRepository
    + TokenRepository
    + AuditSink
    + Send
    + Sync
{
}

/// SQLite implementation of the repository pattern
pub struct SqliteRepository {
    pool: DbPool,
}

impl SqliteRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool for internal use across modules
    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl AuditSink for SqliteRepository {
    async fn append_audit(
        &self,
        user_id: Uuid,
        event_type: crate::audit::AuditEventType,
        entity_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;
        crate::audit::write_event_in_tx(&mut tx, user_id, event_type, entity_id, details).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_audit_events(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<crate::audit::AuditEvent>, EngineError> {
        let events =
            sqlx::query_as("SELECT * FROM audit_events WHERE user_id = $1 ORDER BY seq")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?;
        Ok(events)
    }
}

impl Repository for SqliteRepository {}
