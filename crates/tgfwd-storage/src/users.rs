use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use tgfwd_core::{
    domain::{UserId, UserState},
    repo::{User, UserRepo},
    Result,
};

use crate::{db_err, SqliteStore};

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: UserId(row.try_get::<i64, _>("id").map_err(db_err)?),
        state: UserState::parse(&row.try_get::<String, _>("state").map_err(db_err)?),
        is_active: row.try_get::<bool, _>("is_active").map_err(db_err)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(db_err)?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(db_err)?,
    })
}

#[async_trait]
impl UserRepo for SqliteStore {
    async fn ensure(&self, user_id: UserId) -> Result<User> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, state, is_active, created_at, updated_at)
             VALUES (?, 'idle', 1, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(user_id.0)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;
        user_from_row(&row)
    }

    async fn get(&self, user_id: UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_state(&self, user_id: UserId, state: UserState) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, state, is_active, created_at, updated_at)
             VALUES (?, ?, 1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(user_id.0)
        .bind(state.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn by_state(&self, state: UserState) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users WHERE state = ? AND is_active = 1")
            .bind(state.as_str())
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(user_from_row).collect()
    }
}
