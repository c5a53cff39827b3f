use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Duration bounds enforced on every task write, in minutes.
pub const MIN_TASK_DURATION_MINUTES: i64 = 5;
pub const MAX_TASK_DURATION_MINUTES: i64 = 600;

/// Owner boundary for every other entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    /// IANA timezone name, e.g. "America/New_York".
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for User {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7(),
            timezone: "UTC".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Completed,
    Missed,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid task status: {0}")]
pub struct ParseTaskStatusError(String);

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(TaskStatus::Open),
            "completed" => Ok(TaskStatus::Completed),
            "missed" => Ok(TaskStatus::Missed),
            _ => Err(ParseTaskStatusError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Work,
    Child,
    Family,
    Health,
    Personal,
    Ideas,
    Home,
    Admin,
    Unknown,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid category: {0}")]
pub struct ParseCategoryError(String);

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "work" => Ok(Category::Work),
            "child" => Ok(Category::Child),
            "family" => Ok(Category::Family),
            "health" => Ok(Category::Health),
            "personal" => Ok(Category::Personal),
            "ideas" => Ok(Category::Ideas),
            "home" => Ok(Category::Home),
            "admin" => Ok(Category::Admin),
            "unknown" => Ok(Category::Unknown),
            _ => Err(ParseCategoryError(s.to_string())),
        }
    }
}

/// Reserved for future placement heuristics; carried through storage and
/// inference but never read by the placer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EnergyIntensity {
    Low,
    Medium,
    High,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid energy intensity: {0}")]
pub struct ParseEnergyIntensityError(String);

impl FromStr for EnergyIntensity {
    type Err = ParseEnergyIntensityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(EnergyIntensity::Low),
            "medium" => Ok(EnergyIntensity::Medium),
            "high" => Ok(EnergyIntensity::High),
            _ => Err(ParseEnergyIntensityError(s.to_string())),
        }
    }
}

/// The nine-level governing priority hierarchy. Tier 1 is highest.
/// A task holds exactly one governing tier at a time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[repr(i32)]
pub enum Tier {
    DeadlineProximity = 1,
    Risk = 2,
    DownstreamImpact = 3,
    Child = 4,
    Health = 5,
    Work = 6,
    StressReduction = 7,
    Family = 8,
    HomeCare = 9,
}

impl Tier {
    pub fn rank(self) -> i32 {
        self as i32
    }

    /// Stable audit token naming the trigger that selected this tier.
    pub fn reason_token(self) -> &'static str {
        match self {
            Tier::DeadlineProximity => "deadline_within_24h",
            Tier::Risk => "high_risk",
            Tier::DownstreamImpact => "high_impact",
            Tier::Child => "child_category",
            Tier::Health => "health_category",
            Tier::Work => "work_category",
            Tier::StressReduction => "personal_category",
            Tier::Family => "family_category",
            Tier::HomeCare => "home_care_default",
        }
    }

    pub fn from_rank(rank: i32) -> Option<Self> {
        match rank {
            1 => Some(Tier::DeadlineProximity),
            2 => Some(Tier::Risk),
            3 => Some(Tier::DownstreamImpact),
            4 => Some(Tier::Child),
            5 => Some(Tier::Health),
            6 => Some(Tier::Work),
            7 => Some(Tier::StressReduction),
            8 => Some(Tier::Family),
            9 => Some(Tier::HomeCare),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; null means active.
    pub deleted_at: Option<DateTime<Utc>>,
    pub title: String,
    pub notes: Option<String>,
    pub status: TaskStatus,
    /// Hard due instant. The scheduler must not place any part of the task
    /// after it.
    pub deadline: Option<DateTime<Utc>>,
    /// User-local date; the task is not schedulable before its midnight in
    /// the user's timezone.
    pub start_after: Option<NaiveDate>,
    /// User-local soft date; affects intra-tier urgency only.
    pub due_by: Option<NaiveDate>,
    /// Minutes; bounded to [5, 600].
    pub estimated_duration: i64,
    pub duration_confidence: f64,
    pub category: Category,
    pub energy_intensity: EnergyIntensity,
    pub risk_score: f64,
    pub impact_score: f64,
    pub flex_earliest_start: Option<DateTime<Utc>>,
    pub flex_latest_end: Option<DateTime<Utc>>,
    pub ai_excluded: bool,
    pub manual_priority_locked: bool,
    pub user_locked: bool,
    pub manually_scheduled: bool,
    /// Set when the title came out of the smart-capture flow; exclusion then
    /// also honours a leading '.' in the notes.
    pub title_autogenerated: bool,
    /// Last applied governing tier, if one was ever recorded.
    pub tier: Option<Tier>,
    /// Inference-driven tier change staged for user confirmation.
    pub pending_tier: Option<Tier>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub recurrence_series_id: Option<Uuid>,
    pub recurrence_occurrence_start: Option<DateTime<Utc>>,
    /// Ids of tasks this task depends on. Persisted in `task_dependencies`;
    /// populated by the repository after the row fetch.
    #[sqlx(skip)]
    pub dependencies: Vec<Uuid>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: Uuid::nil(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            title: String::new(),
            notes: None,
            status: TaskStatus::Open,
            deadline: None,
            start_after: None,
            due_by: None,
            estimated_duration: 30,
            duration_confidence: 0.0,
            category: Category::Unknown,
            energy_intensity: EnergyIntensity::Medium,
            risk_score: 0.3,
            impact_score: 0.3,
            flex_earliest_start: None,
            flex_latest_end: None,
            ai_excluded: false,
            manual_priority_locked: false,
            user_locked: false,
            manually_scheduled: false,
            title_autogenerated: false,
            tier: None,
            pending_tier: None,
            source_type: None,
            source_id: None,
            recurrence_series_id: None,
            recurrence_occurrence_start: None,
            dependencies: Vec::new(),
        }
    }
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Both window bounds, when the task carries a flexibility window.
    pub fn flexibility_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.flex_earliest_start, self.flex_latest_end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.estimated_duration)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewTaskData {
    pub title: String,
    pub notes: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub start_after: Option<NaiveDate>,
    pub due_by: Option<NaiveDate>,
    pub estimated_duration: Option<i64>,
    pub category: Option<Category>,
    pub energy_intensity: Option<EnergyIntensity>,
    pub risk_score: Option<f64>,
    pub impact_score: Option<f64>,
    pub flex_earliest_start: Option<DateTime<Utc>>,
    pub flex_latest_end: Option<DateTime<Utc>>,
    pub ai_excluded: bool,
    pub title_autogenerated: bool,
    pub dependencies: Vec<Uuid>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub recurrence_series_id: Option<Uuid>,
    pub recurrence_occurrence_start: Option<DateTime<Utc>>,
}

/// Field update payload. `Option<Option<T>>` distinguishes "leave unchanged"
/// from "set to null".
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskData {
    pub title: Option<String>,
    pub notes: Option<Option<String>>,
    pub status: Option<TaskStatus>,
    pub deadline: Option<Option<DateTime<Utc>>>,
    pub start_after: Option<Option<NaiveDate>>,
    pub due_by: Option<Option<NaiveDate>>,
    pub estimated_duration: Option<i64>,
    pub duration_confidence: Option<f64>,
    pub category: Option<Category>,
    pub energy_intensity: Option<EnergyIntensity>,
    pub risk_score: Option<f64>,
    pub impact_score: Option<f64>,
    pub flex_earliest_start: Option<Option<DateTime<Utc>>>,
    pub flex_latest_end: Option<Option<DateTime<Utc>>>,
    pub ai_excluded: Option<bool>,
    pub manual_priority_locked: Option<bool>,
    pub user_locked: Option<bool>,
    pub set_dependencies: Option<Vec<Uuid>>,
}

impl UpdateTaskData {
    /// Whether the update touches anything the scheduler reads. Drives the
    /// `task_updated` audit emission.
    pub fn is_schedule_relevant(&self) -> bool {
        self.status.is_some()
            || self.deadline.is_some()
            || self.start_after.is_some()
            || self.due_by.is_some()
            || self.estimated_duration.is_some()
            || self.category.is_some()
            || self.risk_score.is_some()
            || self.impact_score.is_some()
            || self.flex_earliest_start.is_some()
            || self.flex_latest_end.is_some()
            || self.ai_excluded.is_some()
            || self.manual_priority_locked.is_some()
            || self.user_locked.is_some()
            || self.set_dependencies.is_some()
    }
}

/// A recurring task series under habit (non-accumulating) semantics: at most
/// one open occurrence exists at any time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurringTaskSeries {
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    #[serde(with = "uuid::serde::compact")]
    pub user_id: Uuid,
    pub title: String,
    pub notes: Option<String>,
    pub duration_minutes: i64,
    pub category: Category,
    /// Canonical RFC 5545 rule with explicit DTSTART;TZID.
    pub rrule: String,
    pub ai_excluded: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RecurringTaskSeries {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: Uuid::nil(),
            title: String::new(),
            notes: None,
            duration_minutes: 30,
            category: Category::Unknown,
            rrule: String::new(),
            ai_excluded: false,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSeriesData {
    pub title: String,
    pub notes: Option<String>,
    pub duration_minutes: i64,
    pub category: Category,
    /// Raw rule; normalized against the owner's timezone before storage.
    pub rrule: String,
    pub dtstart: DateTime<Utc>,
    pub ai_excluded: bool,
}

/// Recurring reserved time. Never a schedulable task; the availability
/// builder subtracts its expanded occurrences from the horizon.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurringTimeBlock {
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    #[serde(with = "uuid::serde::compact")]
    pub user_id: Uuid,
    pub title: String,
    pub rrule: String,
    pub duration_minutes: i64,
    /// External id of the recurring master event, when one exists.
    pub calendar_event_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScheduledBy {
    System,
    User,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid scheduled_by: {0}")]
pub struct ParseScheduledByError(String);

impl FromStr for ScheduledBy {
    type Err = ParseScheduledByError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(ScheduledBy::System),
            "user" => Ok(ScheduledBy::User),
            _ => Err(ParseScheduledByError(s.to_string())),
        }
    }
}

/// One placed interval of calendar time for a task. Half-open `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledBlock {
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    #[serde(with = "uuid::serde::compact")]
    pub user_id: Uuid,
    #[serde(with = "uuid::serde::compact")]
    pub task_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub scheduled_by: ScheduledBy,
    /// Locked blocks are immune to rebuild movement.
    pub locked: bool,
    /// Set when a calendar write failed and the block awaits the next sync.
    pub sync_pending: bool,
    pub calendar_event_id: Option<String>,
    pub calendar_etag: Option<String>,
    pub calendar_updated: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ScheduledBlock {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id: Uuid::nil(),
            task_id: Uuid::nil(),
            start_time: now,
            end_time: now,
            scheduled_by: ScheduledBy::System,
            locked: false,
            sync_pending: false,
            calendar_event_id: None,
            calendar_etag: None,
            calendar_updated: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl ScheduledBlock {
    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    pub fn overlaps(&self, other: &ScheduledBlock) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }
}

/// Why a task could not be placed. A first-class outcome, not an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowReason {
    NoCapacity,
    DeadlineUnreachable,
    FlexWindowEmpty,
    DepUnplaced,
}

impl OverflowReason {
    pub fn as_token(self) -> &'static str {
        match self {
            OverflowReason::NoCapacity => "no_capacity",
            OverflowReason::DeadlineUnreachable => "deadline_unreachable",
            OverflowReason::FlexWindowEmpty => "flex_window_empty",
            OverflowReason::DepUnplaced => "dep_unplaced",
        }
    }
}

/// Result of completing a task: the updated row plus external event ids of
/// removed future blocks, which the synchronizer must delete.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub task: Task,
    pub orphaned_calendar_event_ids: Vec<String>,
}

/// API-token bookkeeping for the auth collaborator. Only the hash and a
/// display prefix are ever stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutomationToken {
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    #[serde(with = "uuid::serde::compact")]
    pub user_id: Uuid,
    pub token_hash: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AutomationToken {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}
