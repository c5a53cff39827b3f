use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, Sqlite, Transaction};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Every decision the engine makes lands here. Events are append-only and
/// flushed inside the same transaction as the state change they describe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TaskImported,
    TaskUpdated,
    AttributeInferred,
    TierChanged,
    ScheduleBuilt,
    ScheduleUpdated,
    Rescheduled,
    Completed,
    OverflowFlagged,
    CalendarEditImported,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid audit event type: {0}")]
pub struct ParseAuditEventTypeError(String);

impl FromStr for AuditEventType {
    type Err = ParseAuditEventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_imported" => Ok(AuditEventType::TaskImported),
            "task_updated" => Ok(AuditEventType::TaskUpdated),
            "attribute_inferred" => Ok(AuditEventType::AttributeInferred),
            "tier_changed" => Ok(AuditEventType::TierChanged),
            "schedule_built" => Ok(AuditEventType::ScheduleBuilt),
            "schedule_updated" => Ok(AuditEventType::ScheduleUpdated),
            "rescheduled" => Ok(AuditEventType::Rescheduled),
            "completed" => Ok(AuditEventType::Completed),
            "overflow_flagged" => Ok(AuditEventType::OverflowFlagged),
            "calendar_edit_imported" => Ok(AuditEventType::CalendarEditImported),
            _ => Err(ParseAuditEventTypeError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub seq: i64,
    #[serde(with = "uuid::serde::compact")]
    pub user_id: Uuid,
    pub rebuild_id: Option<Uuid>,
    pub event_type: AuditEventType,
    pub entity_id: Option<Uuid>,
    pub details: sqlx::types::Json<Value>,
    pub created_at: DateTime<Utc>,
}

/// An event recorded during a rebuild, waiting for its transactional flush.
#[derive(Debug, Clone)]
pub struct PendingAudit {
    pub event_type: AuditEventType,
    pub entity_id: Option<Uuid>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// Collects audit events during a rebuild. The buffer preserves emit order;
/// `flush_in_tx` writes it atomically with the schedule it documents.
#[derive(Debug)]
pub struct AuditRecorder {
    user_id: Uuid,
    rebuild_id: Option<Uuid>,
    buffer: Vec<PendingAudit>,
}

impl AuditRecorder {
    pub fn new(user_id: Uuid, rebuild_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            rebuild_id,
            buffer: Vec::new(),
        }
    }

    pub fn record(&mut self, event_type: AuditEventType, entity_id: Option<Uuid>, details: Value) {
        self.buffer.push(PendingAudit {
            event_type,
            entity_id,
            details,
            created_at: Utc::now(),
        });
    }

    pub fn events(&self) -> &[PendingAudit] {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Writes the buffered events and clears the buffer. Runs inside the
    /// caller's transaction so a failed schedule write also drops the events.
    pub async fn flush_in_tx(
        &mut self,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<(), crate::error::EngineError> {
        let events: Vec<PendingAudit> = self.buffer.drain(..).collect();
        for event in events {
            sqlx::query(
                r#"INSERT INTO audit_events (user_id, rebuild_id, event_type, entity_id, details, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(self.user_id)
            .bind(self.rebuild_id)
            .bind(event.event_type)
            .bind(event.entity_id)
            .bind(sqlx::types::Json(event.details))
            .bind(event.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

/// One-shot audit write carrying a rebuild id, for pipeline stages that
/// commit their own transactions (materialization).
pub async fn write_rebuild_event_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Uuid,
    rebuild_id: Option<Uuid>,
    event_type: AuditEventType,
    entity_id: Option<Uuid>,
    details: Value,
) -> Result<(), crate::error::EngineError> {
    sqlx::query(
        r#"INSERT INTO audit_events (user_id, rebuild_id, event_type, entity_id, details, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(user_id)
    .bind(rebuild_id)
    .bind(event_type)
    .bind(entity_id)
    .bind(sqlx::types::Json(details))
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// One-shot audit write for repository operations that already run inside a
/// transaction of their own.
pub async fn write_event_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Uuid,
    event_type: AuditEventType,
    entity_id: Option<Uuid>,
    details: Value,
) -> Result<(), crate::error::EngineError> {
    sqlx::query(
        r#"INSERT INTO audit_events (user_id, rebuild_id, event_type, entity_id, details, created_at)
        VALUES ($1, NULL, $2, $3, $4, $5)"#,
    )
    .bind(user_id)
    .bind(event_type)
    .bind(entity_id)
    .bind(sqlx::types::Json(details))
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
