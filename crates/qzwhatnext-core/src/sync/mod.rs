//! Managed calendar synchronizer.
//!
//! Reconciles engine-emitted scheduled blocks with the user's external
//! calendar, bidirectionally but only for events the engine can prove it
//! owns: the managed marker property must be present AND the event id must
//! be recorded on a stored block. Either signal alone is not ownership.
//!
//! Per managed event the lifecycle is:
//! `Unsynced -> Synced`, `Synced -> UserEditedTitle -> Synced` (title and
//! notes import into the task), and
//! `Synced -> UserMovedInTime -> LockedSynced -> Synced` (the block adopts
//! the moved interval and locks so rebuilds preserve the user's choice).
//! Calendar edits never trigger a rebuild; they import on the next sync.

use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditEventType;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ScheduledBlock, UpdateTaskData};
use crate::repository::Repository;

pub mod calendar;

use calendar::{CalendarPort, NewCalendarEvent};

/// Counts of what one sync pass did. A pass over an already-synced,
/// externally-untouched schedule is all zeros.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub pushed: usize,
    pub imported_titles: usize,
    pub imported_moves: usize,
    pub deleted: usize,
    pub conflicts: usize,
    pub marked_pending: usize,
}

pub struct CalendarSynchronizer {
    repository: Arc<dyn Repository>,
    port: Arc<dyn CalendarPort>,
    config: EngineConfig,
}

impl CalendarSynchronizer {
    pub fn new(
        repository: Arc<dyn Repository>,
        port: Arc<dyn CalendarPort>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            port,
            config,
        }
    }

    /// Reconcile all of a user's blocks with the external calendar.
    /// `orphaned_event_ids` are events whose blocks vanished in the last
    /// rebuild. Idempotent: a second pass with no external edits performs
    /// zero writes.
    pub async fn sync_user(
        &self,
        user_id: Uuid,
        orphaned_event_ids: &[String],
    ) -> Result<SyncSummary, EngineError> {
        let mut summary = SyncSummary::default();

        for event_id in orphaned_event_ids {
            self.delete_orphan(user_id, event_id, &mut summary).await?;
        }

        let blocks = self.repository.list_all_blocks(user_id).await?;
        for block in blocks {
            self.sync_block(user_id, block, &mut summary).await?;
        }

        info!(
            user_id = %user_id,
            created = summary.created,
            pushed = summary.pushed,
            imported = summary.imported_titles + summary.imported_moves,
            deleted = summary.deleted,
            conflicts = summary.conflicts,
            "calendar sync pass complete"
        );

        Ok(summary)
    }

    async fn delete_orphan(
        &self,
        user_id: Uuid,
        event_id: &str,
        summary: &mut SyncSummary,
    ) -> Result<(), EngineError> {
        let event = match self
            .with_retries(|| self.port.fetch_event(user_id, event_id))
            .await
        {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(()),
            Err(e @ EngineError::Unauthorized(_)) => return Err(e),
            Err(e) => {
                warn!(event_id, error = %e, "orphan fetch failed, retrying next sync");
                return Ok(());
            }
        };

        // Ownership proof: marker plus the block property. An event missing
        // either is left strictly alone.
        if !event.managed_marker || event.block_id.is_none() {
            warn!(event_id, "orphaned event lacks ownership proof, leaving it untouched");
            return Ok(());
        }

        match self
            .with_retries(|| self.port.delete_event(user_id, event_id))
            .await
        {
            Ok(()) => summary.deleted += 1,
            Err(e @ EngineError::Unauthorized(_)) => return Err(e),
            Err(e) => warn!(event_id, error = %e, "orphan delete failed, retrying next sync"),
        }
        Ok(())
    }

    async fn sync_block(
        &self,
        user_id: Uuid,
        mut block: ScheduledBlock,
        summary: &mut SyncSummary,
    ) -> Result<(), EngineError> {
        let Some(task) = self.repository.find_task(user_id, block.task_id).await? else {
            return Ok(());
        };

        let Some(event_id) = block.calendar_event_id.clone() else {
            return self.create_event_for(user_id, block, &task.title, task.notes.clone(), summary).await;
        };

        let event = match self
            .with_retries(|| self.port.fetch_event(user_id, &event_id))
            .await
        {
            Ok(Some(event)) => event,
            Ok(None) => {
                // The user deleted the managed event; the schedule is the
                // source of truth, so recreate it.
                block.calendar_event_id = None;
                return self
                    .create_event_for(user_id, block, &task.title, task.notes.clone(), summary)
                    .await;
            }
            Err(e @ EngineError::Unauthorized(_)) => return Err(e),
            Err(e) => {
                warn!(block_id = %block.id, error = %e, "event fetch failed, marking sync_pending");
                self.mark_pending(&mut block, summary).await?;
                return Ok(());
            }
        };

        if !event.managed_marker || event.block_id != Some(block.id) {
            error!(
                block_id = %block.id,
                event_id = %event.id,
                "stored event no longer carries ownership proof, skipping"
            );
            summary.conflicts += 1;
            return Ok(());
        }

        let stored_etag = block.calendar_etag.clone().unwrap_or_default();
        if event.etag == stored_etag {
            // No external edit. Push the engine's interval if a rebuild
            // moved the block since the last sync.
            if event.start != block.start_time || event.end != block.end_time {
                match self
                    .with_retries(|| {
                        self.port.update_event(
                            user_id,
                            &event_id,
                            &stored_etag,
                            block.start_time,
                            block.end_time,
                        )
                    })
                    .await
                {
                    Ok(receipt) => {
                        block.calendar_etag = Some(receipt.etag);
                        block.calendar_updated = Some(receipt.updated);
                        block.sync_pending = false;
                        self.repository.update_block_sync_state(&block).await?;
                        summary.pushed += 1;
                    }
                    Err(e @ EngineError::Unauthorized(_)) => return Err(e),
                    Err(EngineError::SyncConflict(_)) => {
                        // Raced with an external edit; next pass imports it.
                        error!(block_id = %block.id, "etag conflict while pushing interval");
                        self.mark_pending(&mut block, summary).await?;
                        summary.conflicts += 1;
                    }
                    Err(e) => {
                        warn!(block_id = %block.id, error = %e, "interval push failed");
                        self.mark_pending(&mut block, summary).await?;
                    }
                }
            } else if block.sync_pending {
                block.sync_pending = false;
                self.repository.update_block_sync_state(&block).await?;
            }
            return Ok(());
        }

        // The etag moved: the user edited the event externally.
        let moved = event.start != block.start_time || event.end != block.end_time;
        let retitled = event.title != task.title || event.notes != task.notes;

        if moved {
            // The user's manual move wins over every future rebuild.
            block.start_time = event.start;
            block.end_time = event.end;
            block.locked = true;
        }
        block.calendar_etag = Some(event.etag.clone());
        block.calendar_updated = Some(event.updated);
        block.sync_pending = false;
        self.repository.update_block_sync_state(&block).await?;

        if moved {
            self.repository
                .append_audit(
                    user_id,
                    AuditEventType::CalendarEditImported,
                    Some(block.task_id),
                    json!({
                        "kind": "moved",
                        "block_id": block.id,
                        "start_time": block.start_time,
                        "end_time": block.end_time,
                    }),
                )
                .await?;
            summary.imported_moves += 1;
        }

        if retitled {
            self.repository
                .update_task(
                    user_id,
                    block.task_id,
                    UpdateTaskData {
                        title: Some(event.title.clone()),
                        notes: Some(event.notes.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            self.repository
                .append_audit(
                    user_id,
                    AuditEventType::CalendarEditImported,
                    Some(block.task_id),
                    json!({ "kind": "title", "block_id": block.id }),
                )
                .await?;
            summary.imported_titles += 1;
        }

        Ok(())
    }

    async fn create_event_for(
        &self,
        user_id: Uuid,
        mut block: ScheduledBlock,
        title: &str,
        notes: Option<String>,
        summary: &mut SyncSummary,
    ) -> Result<(), EngineError> {
        let new_event = NewCalendarEvent {
            start: block.start_time,
            end: block.end_time,
            title: title.to_string(),
            notes,
            block_id: block.id,
        };

        match self
            .with_retries(|| self.port.create_event(user_id, new_event.clone()))
            .await
        {
            Ok(receipt) => {
                block.calendar_event_id = Some(receipt.event_id);
                block.calendar_etag = Some(receipt.etag);
                block.calendar_updated = Some(receipt.updated);
                block.sync_pending = false;
                self.repository.update_block_sync_state(&block).await?;
                summary.created += 1;
                Ok(())
            }
            Err(e @ EngineError::Unauthorized(_)) => Err(e),
            Err(e) => {
                warn!(block_id = %block.id, error = %e, "event create failed, marking sync_pending");
                self.mark_pending(&mut block, summary).await?;
                Ok(())
            }
        }
    }

    async fn mark_pending(
        &self,
        block: &mut ScheduledBlock,
        summary: &mut SyncSummary,
    ) -> Result<(), EngineError> {
        if !block.sync_pending {
            block.sync_pending = true;
            self.repository.update_block_sync_state(block).await?;
        }
        summary.marked_pending += 1;
        Ok(())
    }

    /// Bounded timeout plus exponential backoff around one remote call.
    /// `Unauthorized` and `SyncConflict` are terminal, not transient.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let attempts = self.config.remote_retry_attempts.max(1);
        let mut backoff = std::time::Duration::from_millis(500);
        let backoff_cap = std::time::Duration::from_secs(8);
        let mut last_error: Option<EngineError> = None;

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.remote_timeout(), op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e @ EngineError::Unauthorized(_)))
                | Ok(Err(e @ EngineError::SyncConflict(_))) => return Err(e),
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "calendar call failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(attempt, "calendar call timed out");
                    last_error = Some(EngineError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "calendar call timed out",
                    )));
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_cap);
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "calendar call exhausted its retry budget",
            ))
        }))
    }
}
