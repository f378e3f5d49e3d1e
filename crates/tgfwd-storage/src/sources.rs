use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use tgfwd_core::{
    domain::{ChatDescriptor, ChatId, MessageId, UserId},
    repo::{Source, SourceRepo},
    Result,
};

use crate::{db_err, SqliteStore};

fn source_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Source> {
    Ok(Source {
        id: row.try_get::<i64, _>("id").map_err(db_err)?,
        user_id: UserId(row.try_get::<i64, _>("user_id").map_err(db_err)?),
        channel_id: ChatId(row.try_get::<i64, _>("channel_id").map_err(db_err)?),
        channel_handle: row
            .try_get::<Option<String>, _>("channel_handle")
            .map_err(db_err)?,
        channel_title: row.try_get::<String, _>("channel_title").map_err(db_err)?,
        is_active: row.try_get::<bool, _>("is_active").map_err(db_err)?,
        high_water: MessageId(row.try_get::<i64, _>("high_water").map_err(db_err)?),
        added_at: row
            .try_get::<DateTime<Utc>, _>("added_at")
            .map_err(db_err)?,
    })
}

#[async_trait]
impl SourceRepo for SqliteStore {
    async fn add(&self, user_id: UserId, chat: &ChatDescriptor) -> Result<Source> {
        let result = sqlx::query(
            "INSERT INTO sources
                 (user_id, channel_id, channel_handle, channel_title, is_active, high_water, added_at)
             VALUES (?, ?, ?, ?, 1, 0, ?)",
        )
        .bind(user_id.0)
        .bind(chat.wire_id.0)
        .bind(&chat.handle)
        .bind(&chat.title)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;
        source_from_row(&row)
    }

    async fn get(&self, id: i64) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn by_channel(&self, user_id: UserId, channel_id: ChatId) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE user_id = ? AND channel_id = ?")
            .bind(user_id.0)
            .bind(channel_id.0)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn by_user(
        &self,
        user_id: UserId,
        active_only: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Source>> {
        let sql = if active_only {
            "SELECT * FROM sources WHERE user_id = ? AND is_active = 1
             ORDER BY added_at LIMIT ? OFFSET ?"
        } else {
            "SELECT * FROM sources WHERE user_id = ?
             ORDER BY added_at LIMIT ? OFFSET ?"
        };
        let rows = sqlx::query(sql)
            .bind(user_id.0)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(source_from_row).collect()
    }

    async fn count_by_user(&self, user_id: UserId) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sources WHERE user_id = ? AND is_active = 1")
                .bind(user_id.0)
                .fetch_one(self.pool())
                .await
                .map_err(db_err)?;
        Ok(count)
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE sources SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn advance_high_water(&self, id: i64, msg_id: MessageId) -> Result<()> {
        sqlx::query("UPDATE sources SET high_water = MAX(high_water, ?) WHERE id = ?")
            .bind(msg_id.0)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn users_with_active_sources(&self) -> Result<Vec<UserId>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT DISTINCT user_id FROM sources WHERE is_active = 1")
                .fetch_all(self.pool())
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }
}
