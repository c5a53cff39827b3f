use crate::error::EngineError;
use crate::models::{NewSeriesData, RecurringTaskSeries};
use crate::recurrence::RecurrenceRule;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

#[async_trait]
impl super::SeriesRepository for SqliteRepository {
    async fn create_series(
        &self,
        user_id: Uuid,
        data: NewSeriesData,
    ) -> Result<RecurringTaskSeries, EngineError> {
        let mut tx = self.pool().begin().await?;

        let user = Self::find_user_in_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

        if !(crate::models::MIN_TASK_DURATION_MINUTES..=crate::models::MAX_TASK_DURATION_MINUTES)
            .contains(&data.duration_minutes)
        {
            return Err(EngineError::ConstraintViolation(format!(
                "series duration {} outside the legal task range",
                data.duration_minutes
            )));
        }

        // Store the canonical form so every later expansion sees the same
        // DTSTART and timezone.
        let rrule = RecurrenceRule::normalize(&data.rrule, data.dtstart, &user.timezone)?;

        let series = RecurringTaskSeries {
            id: Uuid::now_v7(),
            user_id,
            title: data.title,
            notes: data.notes,
            duration_minutes: data.duration_minutes,
            category: data.category,
            rrule,
            ai_excluded: data.ai_excluded,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO recurring_task_series
            (id, user_id, title, notes, duration_minutes, category, rrule, ai_excluded, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(series.id)
        .bind(series.user_id)
        .bind(&series.title)
        .bind(&series.notes)
        .bind(series.duration_minutes)
        .bind(series.category)
        .bind(&series.rrule)
        .bind(series.ai_excluded)
        .bind(series.created_at)
        .bind(series.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(series)
    }

    async fn find_series(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<RecurringTaskSeries>, EngineError> {
        let series =
            sqlx::query_as("SELECT * FROM recurring_task_series WHERE user_id = $1 AND id = $2")
                .bind(user_id)
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(series)
    }

    async fn list_active_series(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecurringTaskSeries>, EngineError> {
        let series = sqlx::query_as(
            r#"SELECT * FROM recurring_task_series
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at, id"#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(series)
    }

    async fn soft_delete_series(&self, user_id: Uuid, id: Uuid) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE recurring_task_series SET deleted_at = $1, updated_at = $1 WHERE user_id = $2 AND id = $3 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(user_id)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
