use crate::error::EngineError;
use crate::models::RecurringTimeBlock;
use crate::recurrence::RecurrenceRule;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

#[async_trait]
impl super::TimeBlockRepository for SqliteRepository {
    async fn create_time_block(
        &self,
        user_id: Uuid,
        title: &str,
        rrule: &str,
        duration_minutes: i64,
        calendar_event_id: Option<String>,
    ) -> Result<RecurringTimeBlock, EngineError> {
        let mut tx = self.pool().begin().await?;

        let user = Self::find_user_in_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;

        if duration_minutes <= 0 {
            return Err(EngineError::InvalidInput(
                "time block duration must be positive".to_string(),
            ));
        }

        let normalized = if rrule.contains("DTSTART") {
            RecurrenceRule::parse(rrule)?;
            rrule.to_string()
        } else {
            RecurrenceRule::normalize(rrule, Utc::now(), &user.timezone)?
        };

        let block = RecurringTimeBlock {
            id: Uuid::now_v7(),
            user_id,
            title: title.to_string(),
            rrule: normalized,
            duration_minutes,
            calendar_event_id,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO recurring_time_blocks
            (id, user_id, title, rrule, duration_minutes, calendar_event_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(block.id)
        .bind(block.user_id)
        .bind(&block.title)
        .bind(&block.rrule)
        .bind(block.duration_minutes)
        .bind(&block.calendar_event_id)
        .bind(block.created_at)
        .bind(block.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(block)
    }

    async fn list_time_blocks(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<RecurringTimeBlock>, EngineError> {
        let blocks = sqlx::query_as(
            r#"SELECT * FROM recurring_time_blocks
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at, id"#,
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(blocks)
    }

    async fn soft_delete_time_block(&self, user_id: Uuid, id: Uuid) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE recurring_time_blocks SET deleted_at = $1, updated_at = $1 WHERE user_id = $2 AND id = $3 AND deleted_at IS NULL",
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
