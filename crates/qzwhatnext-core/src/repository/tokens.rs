use crate::error::EngineError;
use crate::models::AutomationToken;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

#[async_trait]
impl super::TokenRepository for SqliteRepository {
    async fn create_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        prefix: &str,
    ) -> Result<AutomationToken, EngineError> {
        if token_hash.is_empty() {
            return Err(EngineError::InvalidInput(
                "token hash must not be empty".to_string(),
            ));
        }

        let token = AutomationToken {
            id: Uuid::now_v7(),
            user_id,
            token_hash: token_hash.to_string(),
            prefix: prefix.to_string(),
            created_at: Utc::now(),
            revoked_at: None,
        };

        sqlx::query(
            r#"INSERT INTO automation_tokens (id, user_id, token_hash, prefix, created_at)
            VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token_hash)
        .bind(&token.prefix)
        .bind(token.created_at)
        .execute(self.pool())
        .await?;

        Ok(token)
    }

    async fn list_tokens(&self, user_id: Uuid) -> Result<Vec<AutomationToken>, EngineError> {
        let tokens =
            sqlx::query_as("SELECT * FROM automation_tokens WHERE user_id = $1 ORDER BY created_at")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?;
        Ok(tokens)
    }

    async fn revoke_token(&self, user_id: Uuid, id: Uuid) -> Result<(), EngineError> {
        let result = sqlx::query(
            "UPDATE automation_tokens SET revoked_at = $1 WHERE user_id = $2 AND id = $3 AND revoked_at IS NULL",
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
