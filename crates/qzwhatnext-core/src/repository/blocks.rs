use crate::audit::{write_event_in_tx, AuditEventType, AuditRecorder};
use crate::error::EngineError;
use crate::models::{ScheduledBlock, ScheduledBy};
use crate::repository::{SchedulePersistResult, SqliteRepository, TierUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
impl super::BlockRepository for SqliteRepository {
    async fn find_block(
        &self,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<Option<ScheduledBlock>, EngineError> {
        let block =
            sqlx::query_as("SELECT * FROM scheduled_blocks WHERE user_id = $1 AND id = $2")
                .bind(user_id)
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        Ok(block)
    }

    async fn list_blocks_in_window(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScheduledBlock>, EngineError> {
        let blocks = sqlx::query_as(
            r#"SELECT * FROM scheduled_blocks
            WHERE user_id = $1 AND start_time < $2 AND end_time > $3
            ORDER BY start_time, id"#,
        )
        .bind(user_id)
        .bind(end)
        .bind(start)
        .fetch_all(self.pool())
        .await?;
        Ok(blocks)
    }

    async fn list_all_blocks(&self, user_id: Uuid) -> Result<Vec<ScheduledBlock>, EngineError> {
        let blocks = sqlx::query_as(
            "SELECT * FROM scheduled_blocks WHERE user_id = $1 ORDER BY start_time, id",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(blocks)
    }

    async fn reschedule_block(
        &self,
        user_id: Uuid,
        id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ScheduledBlock, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInput(
                "block start must precede its end".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;

        let moved: ScheduledBlock = sqlx::query_as(
            r#"UPDATE scheduled_blocks
            SET start_time = $1, end_time = $2, scheduled_by = $3, locked = 1, updated_at = $4
            WHERE user_id = $5 AND id = $6
            RETURNING *"#,
        )
        .bind(start)
        .bind(end)
        .bind(ScheduledBy::User)
        .bind(Utc::now())
        .bind(user_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        write_event_in_tx(
            &mut tx,
            user_id,
            AuditEventType::Rescheduled,
            Some(moved.task_id),
            json!({
                "block_id": moved.id,
                "start_time": moved.start_time,
                "end_time": moved.end_time,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(moved)
    }

    async fn persist_rebuild(
        &self,
        user_id: Uuid,
        tier_updates: &[TierUpdate],
        new_blocks: &[ScheduledBlock],
        audit: &mut AuditRecorder,
    ) -> Result<SchedulePersistResult, EngineError> {
        let mut tx = self.pool().begin().await?;

        for update in tier_updates {
            sqlx::query(
                "UPDATE tasks SET tier = $1, pending_tier = $2 WHERE user_id = $3 AND id = $4",
            )
            .bind(update.tier)
            .bind(update.pending_tier)
            .bind(user_id)
            .bind(update.task_id)
            .execute(&mut *tx)
            .await?;
        }

        // Movable blocks from the previous schedule. Locked and
        // user-scheduled rows are never touched here.
        let previous: Vec<ScheduledBlock> = sqlx::query_as(
            r#"SELECT * FROM scheduled_blocks
            WHERE user_id = $1 AND locked = 0 AND scheduled_by = 'system'"#,
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut survivors: HashMap<(Uuid, DateTime<Utc>, DateTime<Utc>), ScheduledBlock> =
            previous
                .into_iter()
                .map(|b| ((b.task_id, b.start_time, b.end_time), b))
                .collect();

        let mut result = SchedulePersistResult::default();

        for block in new_blocks {
            let key = (block.task_id, block.start_time, block.end_time);
            if let Some(existing) = survivors.remove(&key) {
                // Same task, same interval: keep the row and its calendar
                // linkage so sync stays a no-op.
                result.blocks.push(existing);
                continue;
            }

            sqlx::query(
                r#"INSERT INTO scheduled_blocks
                (id, user_id, task_id, start_time, end_time, scheduled_by, locked, sync_pending, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $8)"#,
            )
            .bind(block.id)
            .bind(user_id)
            .bind(block.task_id)
            .bind(block.start_time)
            .bind(block.end_time)
            .bind(block.scheduled_by)
            .bind(block.locked)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            result.blocks.push(block.clone());
        }

        for (_, stale) in survivors {
            sqlx::query("DELETE FROM scheduled_blocks WHERE user_id = $1 AND id = $2")
                .bind(user_id)
                .bind(stale.id)
                .execute(&mut *tx)
                .await?;
            if let Some(event_id) = stale.calendar_event_id {
                result.orphaned_calendar_event_ids.push(event_id);
            }
        }

        audit.flush_in_tx(&mut tx).await?;

        tx.commit().await?;
        Ok(result)
    }

    async fn update_block_sync_state(&self, block: &ScheduledBlock) -> Result<(), EngineError> {
        let result = sqlx::query(
            r#"UPDATE scheduled_blocks
            SET start_time = $1, end_time = $2, locked = $3, sync_pending = $4,
                calendar_event_id = $5, calendar_etag = $6, calendar_updated = $7, updated_at = $8
            WHERE user_id = $9 AND id = $10"#,
        )
        .bind(block.start_time)
        .bind(block.end_time)
        .bind(block.locked)
        .bind(block.sync_pending)
        .bind(&block.calendar_event_id)
        .bind(&block.calendar_etag)
        .bind(block.calendar_updated)
        .bind(Utc::now())
        .bind(block.user_id)
        .bind(block.id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(block.id.to_string()));
        }
        Ok(())
    }
}
