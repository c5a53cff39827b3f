use crate::error::EngineError;
use crate::models::User;
use crate::repository::SqliteRepository;
use crate::timezone::validate_timezone;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

#[async_trait]
impl super::UserRepository for SqliteRepository {
    async fn create_user(&self, timezone: &str) -> Result<User, EngineError> {
        validate_timezone(timezone)?;

        let user = User {
            id: Uuid::now_v7(),
            timezone: timezone.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query("INSERT INTO users (id, timezone, created_at, updated_at) VALUES ($1, $2, $3, $4)")
            .bind(user.id)
            .bind(&user.timezone)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(self.pool())
            .await?;

        Ok(user)
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, EngineError> {
        let user = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(user)
    }

    async fn set_user_timezone(&self, user_id: Uuid, timezone: &str) -> Result<User, EngineError> {
        validate_timezone(timezone)?;

        let user: User = sqlx::query_as(
            r#"UPDATE users SET timezone = $1, updated_at = $2 WHERE id = $3 RETURNING *"#,
        )
        .bind(timezone)
        .bind(Utc::now())
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| EngineError::NotFound(user_id.to_string()))?;

        Ok(user)
    }
}
