use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::EngineError;

/// Name of the private extended property carrying the owning block id.
pub const BLOCK_ID_PROPERTY: &str = "qzwhatnext_block_id";
/// Name of the managed-marker property.
pub const MANAGED_MARKER_PROPERTY: &str = "qzwhatnext_managed";

/// An external calendar event as the write boundary sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub id: String,
    pub etag: String,
    pub updated: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub notes: Option<String>,
    /// Value of the `qzwhatnext_block_id` private extended property.
    pub block_id: Option<Uuid>,
    /// Whether the managed-marker property is present.
    pub managed_marker: bool,
}

#[derive(Debug, Clone)]
pub struct NewCalendarEvent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub notes: Option<String>,
    pub block_id: Uuid,
}

/// Returned by every successful write: the external id plus optimistic
/// concurrency state.
#[derive(Debug, Clone)]
pub struct CalendarWriteReceipt {
    pub event_id: String,
    pub etag: String,
    pub updated: DateTime<Utc>,
}

/// Boundary 2: managed calendar writes. Updates carry the stored etag;
/// a mismatch comes back as `SyncConflict`.
#[async_trait]
pub trait CalendarPort: Send + Sync {
    async fn create_event(
        &self,
        user_id: Uuid,
        event: NewCalendarEvent,
    ) -> Result<CalendarWriteReceipt, EngineError>;
    async fn fetch_event(
        &self,
        user_id: Uuid,
        event_id: &str,
    ) -> Result<Option<CalendarEvent>, EngineError>;
    async fn update_event(
        &self,
        user_id: Uuid,
        event_id: &str,
        etag: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CalendarWriteReceipt, EngineError>;
    async fn delete_event(&self, user_id: Uuid, event_id: &str) -> Result<(), EngineError>;
}

/// Deterministic in-memory calendar for tests: counts writes, and lets a
/// test play the part of the user editing events externally.
#[derive(Debug, Default)]
pub struct InMemoryCalendar {
    events: Mutex<HashMap<(Uuid, String), CalendarEvent>>,
    next_id: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn event(&self, user_id: Uuid, event_id: &str) -> Option<CalendarEvent> {
        self.events
            .lock()
            .expect("calendar store poisoned")
            .get(&(user_id, event_id.to_string()))
            .cloned()
    }

    pub fn event_count(&self, user_id: Uuid) -> usize {
        self.events
            .lock()
            .expect("calendar store poisoned")
            .keys()
            .filter(|(owner, _)| *owner == user_id)
            .count()
    }

    /// Simulate the user dragging the event to a new interval in their
    /// calendar client.
    pub fn user_moves_event(
        &self,
        user_id: Uuid,
        event_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) {
        let mut events = self.events.lock().expect("calendar store poisoned");
        if let Some(event) = events.get_mut(&(user_id, event_id.to_string())) {
            event.start = start;
            event.end = end;
            event.updated = Utc::now();
            event.etag = format!("etag-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        }
    }

    /// Simulate the user retitling the event externally.
    pub fn user_edits_title(&self, user_id: Uuid, event_id: &str, title: &str) {
        let mut events = self.events.lock().expect("calendar store poisoned");
        if let Some(event) = events.get_mut(&(user_id, event_id.to_string())) {
            event.title = title.to_string();
            event.updated = Utc::now();
            event.etag = format!("etag-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        }
    }

    /// Insert a foreign event the engine does not own (no marker, no block
    /// property).
    pub fn insert_unmanaged_event(
        &self,
        user_id: Uuid,
        event_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) {
        let mut events = self.events.lock().expect("calendar store poisoned");
        events.insert(
            (user_id, event_id.to_string()),
            CalendarEvent {
                id: event_id.to_string(),
                etag: format!("etag-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                updated: Utc::now(),
                start,
                end,
                title: "external".to_string(),
                notes: None,
                block_id: None,
                managed_marker: false,
            },
        );
    }
}

#[async_trait]
impl CalendarPort for InMemoryCalendar {
    async fn create_event(
        &self,
        user_id: Uuid,
        event: NewCalendarEvent,
    ) -> Result<CalendarWriteReceipt, EngineError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let serial = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event_id = format!("evt-{serial}");
        let etag = format!("etag-{serial}");
        let updated = Utc::now();

        self.events.lock().expect("calendar store poisoned").insert(
            (user_id, event_id.clone()),
            CalendarEvent {
                id: event_id.clone(),
                etag: etag.clone(),
                updated,
                start: event.start,
                end: event.end,
                title: event.title,
                notes: event.notes,
                block_id: Some(event.block_id),
                managed_marker: true,
            },
        );

        Ok(CalendarWriteReceipt {
            event_id,
            etag,
            updated,
        })
    }

    async fn fetch_event(
        &self,
        user_id: Uuid,
        event_id: &str,
    ) -> Result<Option<CalendarEvent>, EngineError> {
        Ok(self.event(user_id, event_id))
    }

    async fn update_event(
        &self,
        user_id: Uuid,
        event_id: &str,
        etag: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CalendarWriteReceipt, EngineError> {
        let mut events = self.events.lock().expect("calendar store poisoned");
        let event = events
            .get_mut(&(user_id, event_id.to_string()))
            .ok_or_else(|| EngineError::NotFound(event_id.to_string()))?;

        if event.etag != etag {
            return Err(EngineError::SyncConflict(event.block_id.unwrap_or(Uuid::nil())));
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        event.start = start;
        event.end = end;
        event.updated = Utc::now();
        event.etag = format!("etag-{}", self.next_id.fetch_add(1, Ordering::SeqCst));

        Ok(CalendarWriteReceipt {
            event_id: event.id.clone(),
            etag: event.etag.clone(),
            updated: event.updated,
        })
    }

    async fn delete_event(&self, user_id: Uuid, event_id: &str) -> Result<(), EngineError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .expect("calendar store poisoned")
            .remove(&(user_id, event_id.to_string()));
        Ok(())
    }
}
