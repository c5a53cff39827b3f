use crate::audit::{write_event_in_tx, AuditEventType};
use crate::error::EngineError;
use crate::models::{
    CompletionOutcome, NewTaskData, Task, TaskStatus, Tier, UpdateTaskData, User,
    MAX_TASK_DURATION_MINUTES, MIN_TASK_DURATION_MINUTES,
};
use crate::repository::SqliteRepository;
use crate::timezone::local_midnight;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
impl super::TaskRepository for SqliteRepository {
    async fn add_task(&self, user_id: Uuid, data: NewTaskData) -> Result<Task, EngineError> {
        let mut tx = self.pool().begin().await?;

        let user = Self::find_user_in_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

        let task = Self::add_task_in_tx(&mut tx, &user, data).await?;

        write_event_in_tx(
            &mut tx,
            user_id,
            AuditEventType::TaskImported,
            Some(task.id),
            json!({ "title": task.title, "category": task.category }),
        )
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    async fn find_task(&self, user_id: Uuid, id: Uuid) -> Result<Option<Task>, EngineError> {
        let task: Option<Task> = sqlx::query_as("SELECT * FROM tasks WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        match task {
            Some(mut task) => {
                task.dependencies = self.load_dependencies_for(id).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn list_tasks(
        &self,
        user_id: Uuid,
        include_deleted: bool,
    ) -> Result<Vec<Task>, EngineError> {
        let mut tasks: Vec<Task> = if include_deleted {
            sqlx::query_as("SELECT * FROM tasks WHERE user_id = $1 ORDER BY created_at, id")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?
        } else {
            sqlx::query_as(
                "SELECT * FROM tasks WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at, id",
            )
            .bind(user_id)
            .fetch_all(self.pool())
            .await?
        };

        self.fill_dependencies(user_id, &mut tasks).await?;
        Ok(tasks)
    }

    async fn list_open_tasks(&self, user_id: Uuid) -> Result<Vec<Task>, EngineError> {
        let mut tasks: Vec<Task> = sqlx::query_as(
            r#"SELECT * FROM tasks
            WHERE user_id = $1 AND deleted_at IS NULL AND status = 'open'
            ORDER BY created_at, id"#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        self.fill_dependencies(user_id, &mut tasks).await?;
        Ok(tasks)
    }

    async fn update_task(
        &self,
        user_id: Uuid,
        id: Uuid,
        data: UpdateTaskData,
    ) -> Result<Task, EngineError> {
        let mut tx = self.pool().begin().await?;

        let user = Self::find_user_in_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

        let current: Task = sqlx::query_as("SELECT * FROM tasks WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        // Validate the merged state before touching the row.
        let merged_deadline = data.deadline.unwrap_or(current.deadline);
        let merged_start_after = data.start_after.unwrap_or(current.start_after);
        let merged_flex_start = data.flex_earliest_start.unwrap_or(current.flex_earliest_start);
        let merged_flex_end = data.flex_latest_end.unwrap_or(current.flex_latest_end);
        let merged_duration = data.estimated_duration.unwrap_or(current.estimated_duration);
        Self::validate_constraints(
            &user,
            merged_duration,
            merged_start_after,
            merged_deadline,
            merged_flex_start,
            merged_flex_end,
        )?;

        Self::update_task_fields(&mut tx, user_id, id, &data).await?;

        if let Some(dependency_ids) = &data.set_dependencies {
            Self::replace_dependencies(&mut tx, &user, id, &current.title, dependency_ids).await?;
            sqlx::query("UPDATE tasks SET updated_at = $1 WHERE user_id = $2 AND id = $3")
                .bind(Utc::now())
                .bind(user_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        if data.is_schedule_relevant() {
            write_event_in_tx(
                &mut tx,
                user_id,
                AuditEventType::TaskUpdated,
                Some(id),
                json!({ "schedule_relevant": true }),
            )
            .await?;
        }

        let mut updated: Task = sqlx::query_as("SELECT * FROM tasks WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        updated.dependencies = Self::load_dependencies_in_tx(&mut tx, id).await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn complete_task(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<CompletionOutcome, EngineError> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let completed: Task = sqlx::query_as(
            r#"UPDATE tasks
            SET status = $1, updated_at = $2
            WHERE user_id = $3 AND id = $4 AND deleted_at IS NULL
            RETURNING *"#,
        )
        .bind(TaskStatus::Completed)
        .bind(now)
        .bind(user_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        // Blocks that have not started yet are no longer needed. Their
        // external events must outlive this transaction only as ids for the
        // synchronizer's delete pass.
        let orphaned: Vec<String> = sqlx::query_scalar(
            r#"SELECT calendar_event_id FROM scheduled_blocks
            WHERE user_id = $1 AND task_id = $2 AND start_time > $3
              AND calendar_event_id IS NOT NULL"#,
        )
        .bind(user_id)
        .bind(id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM scheduled_blocks WHERE user_id = $1 AND task_id = $2 AND start_time > $3",
        )
        .bind(user_id)
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        write_event_in_tx(
            &mut tx,
            user_id,
            AuditEventType::Completed,
            Some(id),
            json!({ "completed_at": now }),
        )
        .await?;

        tx.commit().await?;
        Ok(CompletionOutcome {
            task: completed,
            orphaned_calendar_event_ids: orphaned,
        })
    }

    async fn soft_delete_task(&self, user_id: Uuid, id: Uuid) -> Result<Vec<String>, EngineError> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE tasks SET deleted_at = $1, updated_at = $1 WHERE user_id = $2 AND id = $3 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(user_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }

        let orphaned: Vec<String> = sqlx::query_scalar(
            r#"SELECT calendar_event_id FROM scheduled_blocks
            WHERE user_id = $1 AND task_id = $2 AND calendar_event_id IS NOT NULL"#,
        )
        .bind(user_id)
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM scheduled_blocks WHERE user_id = $1 AND task_id = $2")
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        write_event_in_tx(
            &mut tx,
            user_id,
            AuditEventType::TaskUpdated,
            Some(id),
            json!({ "soft_deleted": true }),
        )
        .await?;

        tx.commit().await?;
        Ok(orphaned)
    }

    async fn restore_task(&self, user_id: Uuid, id: Uuid) -> Result<Task, EngineError> {
        let mut tx = self.pool().begin().await?;

        let restored: Task = sqlx::query_as(
            r#"UPDATE tasks
            SET deleted_at = NULL, updated_at = $1
            WHERE user_id = $2 AND id = $3 AND deleted_at IS NOT NULL
            RETURNING *"#,
        )
        .bind(Utc::now())
        .bind(user_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        write_event_in_tx(
            &mut tx,
            user_id,
            AuditEventType::TaskUpdated,
            Some(id),
            json!({ "restored": true }),
        )
        .await?;

        tx.commit().await?;
        Ok(restored)
    }

    async fn purge_task(&self, user_id: Uuid, id: Uuid) -> Result<Vec<String>, EngineError> {
        let mut tx = self.pool().begin().await?;

        let orphaned: Vec<String> = sqlx::query_scalar(
            r#"SELECT calendar_event_id FROM scheduled_blocks
            WHERE user_id = $1 AND task_id = $2 AND calendar_event_id IS NOT NULL"#,
        )
        .bind(user_id)
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        // Foreign keys cascade to scheduled_blocks and task_dependencies.
        let result = sqlx::query("DELETE FROM tasks WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }

        write_event_in_tx(
            &mut tx,
            user_id,
            AuditEventType::TaskUpdated,
            Some(id),
            json!({ "purged": true }),
        )
        .await?;

        tx.commit().await?;
        Ok(orphaned)
    }

    async fn confirm_pending_tier(&self, user_id: Uuid, id: Uuid) -> Result<Task, EngineError> {
        let mut tx = self.pool().begin().await?;

        let current: Task = sqlx::query_as("SELECT * FROM tasks WHERE user_id = $1 AND id = $2")
            .bind(user_id)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let pending = current.pending_tier.ok_or_else(|| {
            EngineError::InvalidInput(format!("task {id} has no pending tier change"))
        })?;

        let confirmed: Task = sqlx::query_as(
            r#"UPDATE tasks
            SET tier = $1, pending_tier = NULL, updated_at = $2
            WHERE user_id = $3 AND id = $4
            RETURNING *"#,
        )
        .bind(pending)
        .bind(Utc::now())
        .bind(user_id)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        write_event_in_tx(
            &mut tx,
            user_id,
            AuditEventType::TierChanged,
            Some(id),
            json!({
                "from": current.tier.map(Tier::rank),
                "to": pending.rank(),
                "confirmed_by_user": true,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(confirmed)
    }
}

impl SqliteRepository {
    pub(crate) async fn find_user_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: Uuid,
    ) -> Result<Option<User>, EngineError> {
        let user = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(user)
    }

    /// Insert a task within an existing transaction. Used by `add_task` and
    /// by habit materialization.
    pub(crate) async fn add_task_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user: &User,
        data: NewTaskData,
    ) -> Result<Task, EngineError> {
        let duration = data
            .estimated_duration
            .unwrap_or(crate::models::Task::default().estimated_duration);

        Self::validate_constraints(
            user,
            duration,
            data.start_after,
            data.deadline,
            data.flex_earliest_start,
            data.flex_latest_end,
        )?;

        let defaults = Task::default();
        let task = Task {
            id: Uuid::now_v7(),
            user_id: user.id,
            title: data.title,
            notes: data.notes,
            deadline: data.deadline,
            start_after: data.start_after,
            due_by: data.due_by,
            estimated_duration: duration,
            // A user-supplied duration is authoritative; only unset ones are
            // open to inference.
            duration_confidence: if data.estimated_duration.is_some() { 1.0 } else { 0.0 },
            category: data.category.unwrap_or(defaults.category),
            energy_intensity: data.energy_intensity.unwrap_or(defaults.energy_intensity),
            risk_score: data.risk_score.unwrap_or(defaults.risk_score).clamp(0.0, 1.0),
            impact_score: data.impact_score.unwrap_or(defaults.impact_score).clamp(0.0, 1.0),
            flex_earliest_start: data.flex_earliest_start,
            flex_latest_end: data.flex_latest_end,
            ai_excluded: data.ai_excluded,
            title_autogenerated: data.title_autogenerated,
            source_type: data.source_type,
            source_id: data.source_id,
            recurrence_series_id: data.recurrence_series_id,
            recurrence_occurrence_start: data.recurrence_occurrence_start,
            dependencies: data.dependencies.clone(),
            ..defaults
        };

        let insert = sqlx::query(
            r#"INSERT INTO tasks (
                id, user_id, created_at, updated_at, deleted_at, title, notes, status,
                deadline, start_after, due_by, estimated_duration, duration_confidence,
                category, energy_intensity, risk_score, impact_score,
                flex_earliest_start, flex_latest_end, ai_excluded, manual_priority_locked,
                user_locked, manually_scheduled, title_autogenerated, tier, pending_tier,
                source_type, source_id, recurrence_series_id, recurrence_occurrence_start
            ) VALUES (
                $1, $2, $3, $4, NULL, $5, $6, $7,
                $8, $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19, 0,
                0, 0, $20, NULL, NULL,
                $21, $22, $23, $24
            )"#,
        )
        .bind(task.id)
        .bind(task.user_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(&task.title)
        .bind(&task.notes)
        .bind(task.status)
        .bind(task.deadline)
        .bind(task.start_after)
        .bind(task.due_by)
        .bind(task.estimated_duration)
        .bind(task.duration_confidence)
        .bind(task.category)
        .bind(task.energy_intensity)
        .bind(task.risk_score)
        .bind(task.impact_score)
        .bind(task.flex_earliest_start)
        .bind(task.flex_latest_end)
        .bind(task.ai_excluded)
        .bind(task.title_autogenerated)
        .bind(&task.source_type)
        .bind(&task.source_id)
        .bind(task.recurrence_series_id)
        .bind(task.recurrence_occurrence_start)
        .execute(&mut **tx)
        .await;

        if let Err(e) = insert {
            if is_unique_violation(&e) {
                return Err(EngineError::ConstraintViolation(format!(
                    "duplicate task for dedupe key (source or series occurrence): {}",
                    task.title
                )));
            }
            return Err(e.into());
        }

        if !data.dependencies.is_empty() {
            Self::replace_dependencies(tx, user, task.id, &task.title, &data.dependencies).await?;
        }

        Ok(task)
    }

    pub(crate) fn validate_constraints(
        user: &User,
        duration_minutes: i64,
        start_after: Option<NaiveDate>,
        deadline: Option<DateTime<Utc>>,
        flex_earliest_start: Option<DateTime<Utc>>,
        flex_latest_end: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        if !(MIN_TASK_DURATION_MINUTES..=MAX_TASK_DURATION_MINUTES).contains(&duration_minutes) {
            return Err(EngineError::ConstraintViolation(format!(
                "estimated_duration must lie in [{MIN_TASK_DURATION_MINUTES}, {MAX_TASK_DURATION_MINUTES}] minutes, got {duration_minutes}"
            )));
        }

        let start_after_instant = start_after
            .map(|date| local_midnight(date, &user.timezone))
            .transpose()?;

        if let (Some(start), Some(deadline)) = (start_after_instant, deadline) {
            if start > deadline {
                return Err(EngineError::ConstraintViolation(
                    "start_after is later than the deadline".to_string(),
                ));
            }
        }

        if let (Some(flex_start), Some(flex_end)) = (flex_earliest_start, flex_latest_end) {
            if flex_start >= flex_end {
                return Err(EngineError::ConstraintViolation(
                    "flexibility window is empty".to_string(),
                ));
            }
            if let Some(start) = start_after_instant {
                if flex_start > start {
                    return Err(EngineError::ConstraintViolation(
                        "flexibility window does not contain start_after".to_string(),
                    ));
                }
            }
            if let Some(deadline) = deadline {
                if flex_end < deadline {
                    return Err(EngineError::ConstraintViolation(
                        "flexibility window does not contain the deadline".to_string(),
                    ));
                }
            }
        } else if flex_earliest_start.is_some() != flex_latest_end.is_some() {
            return Err(EngineError::ConstraintViolation(
                "flexibility window needs both bounds".to_string(),
            ));
        }

        Ok(())
    }

    /// Replace the dependency edges of a task, rejecting cross-user edges,
    /// self-edges and cycles.
    async fn replace_dependencies(
        tx: &mut Transaction<'_, Sqlite>,
        user: &User,
        task_id: Uuid,
        task_title: &str,
        dependency_ids: &[Uuid],
    ) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut **tx)
            .await?;

        for depends_on_id in dependency_ids {
            if *depends_on_id == task_id {
                return Err(EngineError::ConstraintViolation(
                    "a task cannot depend on itself".to_string(),
                ));
            }

            let dep: Option<Task> =
                sqlx::query_as("SELECT * FROM tasks WHERE user_id = $1 AND id = $2")
                    .bind(user.id)
                    .bind(depends_on_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            let dep = dep.ok_or_else(|| {
                EngineError::NotFound(format!("dependency {depends_on_id}"))
            })?;

            if Self::path_exists(tx, *depends_on_id, task_id).await? {
                return Err(EngineError::CircularDependency(
                    task_title.to_string(),
                    dep.title,
                ));
            }

            sqlx::query("INSERT INTO task_dependencies (task_id, depends_on_id) VALUES ($1, $2)")
                .bind(task_id)
                .bind(depends_on_id)
                .execute(&mut **tx)
                .await?;
        }

        Ok(())
    }

    /// Check if a dependency path exists from start_node to end_node (for circular dependency detection)
    pub(crate) async fn path_exists(
        tx: &mut Transaction<'_, Sqlite>,
        start_node_id: Uuid,
        end_node_id: Uuid,
    ) -> Result<bool, EngineError> {
        let path_found: Option<i32> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE dependency_path (id) AS (
                SELECT depends_on_id FROM task_dependencies WHERE task_id = $1
                UNION ALL
                SELECT td.depends_on_id
                FROM task_dependencies td
                JOIN dependency_path dp ON td.task_id = dp.id
                WHERE td.depends_on_id IS NOT NULL
            )
            SELECT 1 FROM dependency_path WHERE id = $2 LIMIT 1;
            "#,
        )
        .bind(start_node_id)
        .bind(end_node_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(path_found.is_some())
    }

    async fn load_dependencies_for(&self, task_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT depends_on_id FROM task_dependencies WHERE task_id = $1 ORDER BY depends_on_id",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    pub(crate) async fn load_dependencies_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        task_id: Uuid,
    ) -> Result<Vec<Uuid>, EngineError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT depends_on_id FROM task_dependencies WHERE task_id = $1 ORDER BY depends_on_id",
        )
        .bind(task_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(ids)
    }

    /// Populate `dependencies` for a batch of tasks with one edge query.
    async fn fill_dependencies(
        &self,
        user_id: Uuid,
        tasks: &mut [Task],
    ) -> Result<(), EngineError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let edges: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"SELECT td.task_id, td.depends_on_id
            FROM task_dependencies td
            JOIN tasks t ON td.task_id = t.id
            WHERE t.user_id = $1
            ORDER BY td.task_id, td.depends_on_id"#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        let mut by_task: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (task_id, depends_on_id) in edges {
            by_task.entry(task_id).or_default().push(depends_on_id);
        }

        for task in tasks.iter_mut() {
            if let Some(deps) = by_task.remove(&task.id) {
                task.dependencies = deps;
            }
        }

        Ok(())
    }

    async fn update_task_fields(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: Uuid,
        id: Uuid,
        data: &UpdateTaskData,
    ) -> Result<(), EngineError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE tasks SET ");
        let mut updated = false;

        macro_rules! push_field {
            ($name:literal, $value:expr) => {
                if updated {
                    qb.push(", ");
                }
                qb.push(concat!($name, " = "));
                qb.push_bind($value);
                updated = true;
            };
        }

        if let Some(title) = &data.title {
            push_field!("title", title);
        }
        if let Some(notes) = &data.notes {
            push_field!("notes", notes.clone());
        }
        if let Some(status) = &data.status {
            push_field!("status", *status);
        }
        if let Some(deadline) = &data.deadline {
            push_field!("deadline", *deadline);
        }
        if let Some(start_after) = &data.start_after {
            push_field!("start_after", *start_after);
        }
        if let Some(due_by) = &data.due_by {
            push_field!("due_by", *due_by);
        }
        if let Some(duration) = &data.estimated_duration {
            push_field!("estimated_duration", *duration);
            if data.duration_confidence.is_none() {
                push_field!("duration_confidence", 1.0_f64);
            }
        }
        if let Some(confidence) = &data.duration_confidence {
            push_field!("duration_confidence", *confidence);
        }
        if let Some(category) = &data.category {
            push_field!("category", *category);
        }
        if let Some(energy) = &data.energy_intensity {
            push_field!("energy_intensity", *energy);
        }
        if let Some(risk) = &data.risk_score {
            push_field!("risk_score", risk.clamp(0.0, 1.0));
        }
        if let Some(impact) = &data.impact_score {
            push_field!("impact_score", impact.clamp(0.0, 1.0));
        }
        if let Some(flex_start) = &data.flex_earliest_start {
            push_field!("flex_earliest_start", *flex_start);
        }
        if let Some(flex_end) = &data.flex_latest_end {
            push_field!("flex_latest_end", *flex_end);
        }
        if let Some(excluded) = &data.ai_excluded {
            push_field!("ai_excluded", *excluded);
        }
        if let Some(locked) = &data.manual_priority_locked {
            push_field!("manual_priority_locked", *locked);
        }
        if let Some(locked) = &data.user_locked {
            push_field!("user_locked", *locked);
        }

        if !updated && data.set_dependencies.is_none() {
            return Ok(());
        }

        if updated {
            qb.push(", updated_at = ");
            qb.push_bind(Utc::now());
            qb.push(" WHERE user_id = ");
            qb.push_bind(user_id);
            qb.push(" AND id = ");
            qb.push_bind(id);
            qb.build().execute(&mut **tx).await?;
        }

        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation))
        .unwrap_or(false)
}
