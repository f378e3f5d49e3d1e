use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use tgfwd_core::{
    domain::{ChatDescriptor, ChatId, UserId},
    repo::{Destination, DestinationRepo},
    Result,
};

use crate::{db_err, SqliteStore};

fn destination_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Destination> {
    Ok(Destination {
        id: row.try_get::<i64, _>("id").map_err(db_err)?,
        user_id: UserId(row.try_get::<i64, _>("user_id").map_err(db_err)?),
        channel_id: ChatId(row.try_get::<i64, _>("channel_id").map_err(db_err)?),
        channel_handle: row
            .try_get::<Option<String>, _>("channel_handle")
            .map_err(db_err)?,
        channel_title: row.try_get::<String, _>("channel_title").map_err(db_err)?,
        is_active: row.try_get::<bool, _>("is_active").map_err(db_err)?,
        configured_at: row
            .try_get::<DateTime<Utc>, _>("configured_at")
            .map_err(db_err)?,
    })
}

#[async_trait]
impl DestinationRepo for SqliteStore {
    async fn upsert(&self, user_id: UserId, chat: &ChatDescriptor) -> Result<Destination> {
        sqlx::query(
            "INSERT INTO destinations
                 (user_id, channel_id, channel_handle, channel_title, is_active, configured_at)
             VALUES (?, ?, ?, ?, 1, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 channel_id = excluded.channel_id,
                 channel_handle = excluded.channel_handle,
                 channel_title = excluded.channel_title,
                 is_active = 1,
                 configured_at = excluded.configured_at",
        )
        .bind(user_id.0)
        .bind(chat.wire_id.0)
        .bind(&chat.handle)
        .bind(&chat.title)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM destinations WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;
        destination_from_row(&row)
    }

    async fn active_by_user(&self, user_id: UserId) -> Result<Option<Destination>> {
        let row = sqlx::query("SELECT * FROM destinations WHERE user_id = ? AND is_active = 1")
            .bind(user_id.0)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.as_ref().map(destination_from_row).transpose()
    }

    async fn clear(&self, user_id: UserId) -> Result<()> {
        sqlx::query("UPDATE destinations SET is_active = 0 WHERE user_id = ?")
            .bind(user_id.0)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
