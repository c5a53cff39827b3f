use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("Migration error")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Circular dependency detected: task '{0}' cannot depend on '{1}'")]
    CircularDependency(String, String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid recurrence rule: {0}")]
    InvalidRecurrence(String),

    #[error("Access revoked for user {0}")]
    Unauthorized(uuid::Uuid),

    #[error("Availability provider unreachable and no fresh snapshot exists")]
    AvailabilityUnavailable,

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Sync conflict on block {0}")]
    SyncConflict(uuid::Uuid),

    #[error("Rebuild cancelled")]
    Cancelled,
}
