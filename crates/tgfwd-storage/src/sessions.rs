use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use tgfwd_core::{
    domain::UserId,
    repo::{SessionRepo, SessionRow},
    Result,
};

use crate::{db_err, SqliteStore};

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRow> {
    Ok(SessionRow {
        user_id: UserId(row.try_get::<i64, _>("user_id").map_err(db_err)?),
        blob: row.try_get::<Vec<u8>, _>("blob").map_err(db_err)?,
        content_hash: row.try_get::<String, _>("content_hash").map_err(db_err)?,
        is_valid: row.try_get::<bool, _>("is_valid").map_err(db_err)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(db_err)?,
        last_used_at: row
            .try_get::<DateTime<Utc>, _>("last_used_at")
            .map_err(db_err)?,
    })
}

#[async_trait]
impl SessionRepo for SqliteStore {
    async fn upsert(&self, user_id: UserId, blob: Vec<u8>, content_hash: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO sessions (user_id, blob, content_hash, is_valid, created_at, last_used_at)
             VALUES (?, ?, ?, 1, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 blob = excluded.blob,
                 content_hash = excluded.content_hash,
                 is_valid = 1,
                 last_used_at = excluded.last_used_at",
        )
        .bind(user_id.0)
        .bind(blob)
        .bind(content_hash)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_valid(&self, user_id: UserId) -> Result<Option<SessionRow>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE user_id = ? AND is_valid = 1")
            .bind(user_id.0)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn touch(&self, user_id: UserId) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_used_at = ? WHERE user_id = ?")
            .bind(Utc::now())
            .bind(user_id.0)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn invalidate(&self, user_id: UserId) -> Result<()> {
        sqlx::query("UPDATE sessions SET is_valid = 0 WHERE user_id = ?")
            .bind(user_id.0)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn users_with_valid_session(&self) -> Result<Vec<UserId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT user_id FROM sessions WHERE is_valid = 1")
                .fetch_all(self.pool())
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }
}
