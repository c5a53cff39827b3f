use crate::audit::{write_rebuild_event_in_tx, AuditEventType};
use crate::error::EngineError;
use crate::models::{NewTaskData, RecurringTaskSeries, Task, TaskStatus, User};
use crate::recurrence::{MaterializationSummary, RecurrenceRule};
use crate::repository::{SeriesRepository, SqliteRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{Sqlite, Transaction};
use tracing::debug;
use uuid::Uuid;

#[async_trait]
impl super::MaterializationRepository for SqliteRepository {
    /// Habit (non-accumulating) semantics: at most one open occurrence per
    /// series. Past-window open occurrences flip to `missed`, then exactly
    /// the next upcoming occurrence is materialized. Re-running within the
    /// same horizon creates nothing new.
    async fn materialize_habits(
        &self,
        user: &User,
        now: DateTime<Utc>,
        horizon_end: DateTime<Utc>,
        rebuild_id: Option<Uuid>,
    ) -> Result<MaterializationSummary, EngineError> {
        let mut summary = MaterializationSummary::default();
        let series_list = self.list_active_series(user.id).await?;

        for series in series_list {
            summary.series_processed += 1;
            let mut tx = self.pool().begin().await?;

            let created =
                Self::materialize_one_series(&mut tx, user, &series, now, horizon_end, rebuild_id, &mut summary)
                    .await?;

            tx.commit().await?;

            if created {
                summary.instances_created += 1;
            }
        }

        debug!(
            user_id = %user.id,
            series = summary.series_processed,
            created = summary.instances_created,
            missed = summary.missed_marked,
            "habit materialization pass complete"
        );

        Ok(summary)
    }
}

impl SqliteRepository {
    async fn materialize_one_series(
        tx: &mut Transaction<'_, Sqlite>,
        user: &User,
        series: &RecurringTaskSeries,
        now: DateTime<Utc>,
        horizon_end: DateTime<Utc>,
        rebuild_id: Option<Uuid>,
        summary: &mut MaterializationSummary,
    ) -> Result<bool, EngineError> {
        let rule = RecurrenceRule::parse(&series.rrule)?;

        let open_tasks: Vec<Task> = sqlx::query_as(
            r#"SELECT * FROM tasks
            WHERE user_id = $1 AND recurrence_series_id = $2
              AND status = 'open' AND deleted_at IS NULL"#,
        )
        .bind(user.id)
        .bind(series.id)
        .fetch_all(&mut **tx)
        .await?;

        let mut open_in_window = false;
        for task in &open_tasks {
            let Some(occurrence) = task.recurrence_occurrence_start else {
                // An instance without an occurrence key cannot be windowed;
                // leave it alone and treat the series as occupied.
                open_in_window = true;
                continue;
            };

            match rule.window_end(occurrence) {
                Some(window_end) if window_end <= now => {
                    sqlx::query(
                        "UPDATE tasks SET status = $1, updated_at = $2 WHERE user_id = $3 AND id = $4",
                    )
                    .bind(TaskStatus::Missed)
                    .bind(now)
                    .bind(user.id)
                    .bind(task.id)
                    .execute(&mut **tx)
                    .await?;

                    write_rebuild_event_in_tx(
                        tx,
                        user.id,
                        rebuild_id,
                        AuditEventType::ScheduleUpdated,
                        Some(task.id),
                        json!({
                            "reason": "habit_window_passed",
                            "series_id": series.id,
                            "occurrence_start": occurrence,
                        }),
                    )
                    .await?;

                    summary.missed_marked += 1;
                }
                _ => open_in_window = true,
            }
        }

        // Non-accumulating: one open occurrence at a time.
        if open_in_window {
            return Ok(false);
        }

        // The current window's occurrence when one is underway, otherwise
        // the next upcoming one.
        let candidate = match rule.current_occurrence_at(now) {
            Some(current) if rule.window_end(current).map_or(true, |end| end > now) => Some(current),
            _ => rule.next_occurrence_after(now),
        };

        let Some(occurrence) = candidate else {
            return Ok(false);
        };
        if occurrence >= horizon_end {
            // No window inside the horizon: nothing to materialize.
            return Ok(false);
        }

        // Idempotence: the occurrence key may already exist as a completed
        // or missed instance.
        let already: Option<i32> = sqlx::query_scalar(
            r#"SELECT 1 FROM tasks
            WHERE user_id = $1 AND recurrence_series_id = $2 AND recurrence_occurrence_start = $3
            LIMIT 1"#,
        )
        .bind(user.id)
        .bind(series.id)
        .bind(occurrence)
        .fetch_optional(&mut **tx)
        .await?;
        if already.is_some() {
            return Ok(false);
        }

        let tz = crate::timezone::validate_timezone(&user.timezone)?;
        let due_by = occurrence.with_timezone(&tz).date_naive();

        let data = NewTaskData {
            title: series.title.clone(),
            notes: series.notes.clone(),
            due_by: Some(due_by),
            estimated_duration: Some(series.duration_minutes),
            category: Some(series.category),
            ai_excluded: series.ai_excluded,
            recurrence_series_id: Some(series.id),
            recurrence_occurrence_start: Some(occurrence),
            ..Default::default()
        };

        let task = Self::add_task_in_tx(tx, user, data).await?;

        write_rebuild_event_in_tx(
            tx,
            user.id,
            rebuild_id,
            AuditEventType::TaskImported,
            Some(task.id),
            json!({
                "reason": "habit_materialized",
                "series_id": series.id,
                "occurrence_start": occurrence,
            }),
        )
        .await?;

        Ok(true)
    }
}
