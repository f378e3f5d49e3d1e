use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use tgfwd_core::{
    domain::{MessageId, UserId},
    repo::{DeliveryRecord, DeliveryRepo, DeliveryStats, DeliveryStatus},
    Result,
};

use crate::{db_err, SqliteStore};

fn delivery_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DeliveryRecord> {
    Ok(DeliveryRecord {
        id: row.try_get::<i64, _>("id").map_err(db_err)?,
        user_id: UserId(row.try_get::<i64, _>("user_id").map_err(db_err)?),
        source_id: row.try_get::<i64, _>("source_id").map_err(db_err)?,
        destination_id: row
            .try_get::<Option<i64>, _>("destination_id")
            .map_err(db_err)?,
        original_msg_id: MessageId(row.try_get::<i64, _>("original_msg_id").map_err(db_err)?),
        forwarded_msg_id: row
            .try_get::<Option<i64>, _>("forwarded_msg_id")
            .map_err(db_err)?
            .map(MessageId),
        status: DeliveryStatus::parse(&row.try_get::<String, _>("status").map_err(db_err)?),
        error: row.try_get::<Option<String>, _>("error").map_err(db_err)?,
        will_retry: row.try_get::<bool, _>("will_retry").map_err(db_err)?,
        retry_count: row.try_get::<i64, _>("retry_count").map_err(db_err)?,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(db_err)?,
        completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("completed_at")
            .map_err(db_err)?,
    })
}

#[async_trait]
impl DeliveryRepo for SqliteStore {
    async fn find(
        &self,
        user_id: UserId,
        source_id: i64,
        original: MessageId,
    ) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query(
            "SELECT * FROM deliveries
             WHERE user_id = ? AND source_id = ? AND original_msg_id = ?",
        )
        .bind(user_id.0)
        .bind(source_id)
        .bind(original.0)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn open(
        &self,
        user_id: UserId,
        source_id: i64,
        destination_id: Option<i64>,
        original: MessageId,
    ) -> Result<i64> {
        // Reopen an existing row for the semantic key rather than
        // inserting a sibling; the key is unique.
        sqlx::query(
            "INSERT INTO deliveries
                 (user_id, source_id, destination_id, original_msg_id,
                  status, will_retry, retry_count, created_at)
             VALUES (?, ?, ?, ?, 'pending', 1, 0, ?)
             ON CONFLICT(user_id, source_id, original_msg_id) DO UPDATE SET
                 status = 'pending',
                 destination_id = excluded.destination_id,
                 error = NULL,
                 will_retry = 1,
                 completed_at = NULL",
        )
        .bind(user_id.0)
        .bind(source_id)
        .bind(destination_id)
        .bind(original.0)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        let (id,): (i64,) = sqlx::query_as(
            "SELECT id FROM deliveries
             WHERE user_id = ? AND source_id = ? AND original_msg_id = ?",
        )
        .bind(user_id.0)
        .bind(source_id)
        .bind(original.0)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    async fn mark_success(&self, record_id: i64, forwarded: MessageId) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries
             SET status = 'success', forwarded_msg_id = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(forwarded.0)
        .bind(Utc::now())
        .bind(record_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_failed(&self, record_id: i64, error: &str, will_retry: bool) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries
             SET status = 'failed',
                 error = ?,
                 will_retry = ?,
                 retry_count = retry_count + ?,
                 completed_at = ?
             WHERE id = ?",
        )
        .bind(error)
        .bind(will_retry)
        .bind(i64::from(will_retry))
        .bind(Utc::now())
        .bind(record_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn stats(&self, user_id: UserId, window_hours: i64) -> Result<DeliveryStats> {
        let cutoff = Utc::now() - Duration::hours(window_hours);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM deliveries
             WHERE user_id = ? AND created_at >= ?
             GROUP BY status",
        )
        .bind(user_id.0)
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        let mut stats = DeliveryStats::default();
        for (status, count) in rows {
            match DeliveryStatus::parse(&status) {
                DeliveryStatus::Success => stats.success = count,
                DeliveryStatus::Failed => stats.failed = count,
                DeliveryStatus::Pending => stats.pending = count,
            }
        }
        Ok(stats)
    }

    async fn last_success(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            "SELECT MAX(completed_at) FROM deliveries
             WHERE user_id = ? AND status = 'success'",
        )
        .bind(user_id.0)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        Ok(row.and_then(|(ts,)| ts))
    }

    async fn due_retries(&self, max_retries: i64, limit: i64) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM deliveries
             WHERE status = 'failed' AND will_retry = 1 AND retry_count < ?
             ORDER BY completed_at LIMIT ?",
        )
        .bind(max_retries)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(delivery_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStore;
    use tgfwd_core::domain::{ChatDescriptor, ChatId, ChatKind, UserState};
    use tgfwd_core::repo::{SessionRepo, SourceRepo, UserRepo};

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    async fn seed_user_and_source(store: &SqliteStore) -> (UserId, i64) {
        let user = UserId(1);
        store.ensure(user).await.unwrap();
        let source = store
            .add(
                user,
                &ChatDescriptor {
                    wire_id: ChatId(-1001234567890),
                    title: "News".to_string(),
                    handle: Some("newschan".to_string()),
                    kind: ChatKind::Channel,
                },
            )
            .await
            .unwrap();
        (user, source.id)
    }

    #[tokio::test]
    async fn open_is_an_upsert_on_the_semantic_key() {
        let store = store().await;
        let (user, source_id) = seed_user_and_source(&store).await;

        let a = store.open(user, source_id, None, MessageId(101)).await.unwrap();
        store.mark_failed(a, "flood", true).await.unwrap();
        let b = store.open(user, source_id, Some(3), MessageId(101)).await.unwrap();

        assert_eq!(a, b);
        let record = store
            .find(user, source_id, MessageId(101))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.destination_id, Some(3));
        assert!(record.error.is_none());
        assert_eq!(record.retry_count, 1, "the retry counter survives reopen");
    }

    #[tokio::test]
    async fn success_and_failure_round_trip() {
        let store = store().await;
        let (user, source_id) = seed_user_and_source(&store).await;

        let rec = store.open(user, source_id, None, MessageId(7)).await.unwrap();
        store.mark_success(rec, MessageId(900)).await.unwrap();
        let record = store.find(user, source_id, MessageId(7)).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Success);
        assert_eq!(record.forwarded_msg_id, Some(MessageId(900)));
        assert!(record.completed_at.is_some());

        let rec = store.open(user, source_id, None, MessageId(8)).await.unwrap();
        store.mark_failed(rec, "peer id invalid", false).await.unwrap();
        let record = store.find(user, source_id, MessageId(8)).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert!(!record.will_retry);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn due_retries_excludes_permanent_failures() {
        let store = store().await;
        let (user, source_id) = seed_user_and_source(&store).await;

        let a = store.open(user, source_id, None, MessageId(1)).await.unwrap();
        store.mark_failed(a, "flood", true).await.unwrap();
        let b = store.open(user, source_id, None, MessageId(2)).await.unwrap();
        store.mark_failed(b, "gone", false).await.unwrap();

        let due = store.due_retries(5, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].original_msg_id, MessageId(1));
    }

    #[tokio::test]
    async fn stats_and_last_success() {
        let store = store().await;
        let (user, source_id) = seed_user_and_source(&store).await;

        let a = store.open(user, source_id, None, MessageId(1)).await.unwrap();
        store.mark_success(a, MessageId(10)).await.unwrap();
        let b = store.open(user, source_id, None, MessageId(2)).await.unwrap();
        store.mark_failed(b, "boom", true).await.unwrap();
        store.open(user, source_id, None, MessageId(3)).await.unwrap();

        let stats = store.stats(user, 24).await.unwrap();
        assert_eq!((stats.success, stats.failed, stats.pending), (1, 1, 1));
        assert!(store.last_success(user).await.unwrap().is_some());
        assert!(store.last_success(UserId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_rows_survive_round_trip() {
        let store = store().await;
        let user = UserId(1);
        store.ensure(user).await.unwrap();

        SessionRepo::upsert(&store, user, vec![1, 2, 3], "abc123")
            .await
            .unwrap();
        let row = store.get_valid(user).await.unwrap().unwrap();
        assert_eq!(row.blob, vec![1, 2, 3]);
        assert_eq!(row.content_hash, "abc123");

        store.invalidate(user).await.unwrap();
        assert!(store.get_valid(user).await.unwrap().is_none());
        assert!(store.users_with_valid_session().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn high_water_is_monotonic() {
        let store = store().await;
        let (_user, source_id) = seed_user_and_source(&store).await;

        store.advance_high_water(source_id, MessageId(100)).await.unwrap();
        store.advance_high_water(source_id, MessageId(90)).await.unwrap();

        let source = SourceRepo::get(&store, source_id).await.unwrap().unwrap();
        assert_eq!(source.high_water, MessageId(100));
    }

    #[tokio::test]
    async fn user_state_round_trips() {
        let store = store().await;
        let user = UserId(42);
        store.ensure(user).await.unwrap();
        store.set_state(user, UserState::Running).await.unwrap();

        let loaded = UserRepo::get(&store, user).await.unwrap().unwrap();
        assert_eq!(loaded.state, UserState::Running);
        assert_eq!(store.by_state(UserState::Running).await.unwrap().len(), 1);
        assert!(store.by_state(UserState::Idle).await.unwrap().is_empty());
    }
}
