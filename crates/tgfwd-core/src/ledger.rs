//! Delivery accounting: dedup, outcome recording, retry bookkeeping.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    domain::{MessageId, UserId},
    repo::{DeliveryRecord, DeliveryRepo, DeliveryStats, DeliveryStatus},
    Result,
};

pub struct DeliveryLedger {
    deliveries: Arc<dyn DeliveryRepo>,
}

impl DeliveryLedger {
    pub fn new(deliveries: Arc<dyn DeliveryRepo>) -> Self {
        Self { deliveries }
    }

    /// True iff a *successful* record exists for the semantic key.
    /// Pending and failed attempts do not count; they may be retried.
    pub async fn is_duplicate(
        &self,
        user_id: UserId,
        source_id: i64,
        original: MessageId,
    ) -> Result<bool> {
        let existing = self.deliveries.find(user_id, source_id, original).await?;
        Ok(matches!(
            existing,
            Some(DeliveryRecord {
                status: DeliveryStatus::Success,
                ..
            })
        ))
    }

    /// Persist the pending record before the send attempt.
    pub async fn open(
        &self,
        user_id: UserId,
        source_id: i64,
        destination_id: Option<i64>,
        original: MessageId,
    ) -> Result<i64> {
        self.deliveries
            .open(user_id, source_id, destination_id, original)
            .await
    }

    pub async fn mark_success(&self, record_id: i64, forwarded: MessageId) -> Result<()> {
        debug!(record_id, forwarded = forwarded.0, "delivery succeeded");
        self.deliveries.mark_success(record_id, forwarded).await
    }

    pub async fn mark_failed(&self, record_id: i64, error: &str, will_retry: bool) -> Result<()> {
        warn!(record_id, error, will_retry, "delivery failed");
        self.deliveries
            .mark_failed(record_id, error, will_retry)
            .await
    }

    pub async fn stats(&self, user_id: UserId, window_hours: i64) -> Result<DeliveryStats> {
        self.deliveries.stats(user_id, window_hours).await
    }

    pub async fn last_success(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>> {
        self.deliveries.last_success(user_id).await
    }

    /// Failed rows still inside the retry budget.
    pub async fn due_retries(&self, max_retries: i64, limit: i64) -> Result<Vec<DeliveryRecord>> {
        self.deliveries.due_retries(max_retries, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemStore;

    #[tokio::test]
    async fn duplicate_only_after_success() {
        let mem = Arc::new(MemStore::default());
        let ledger = DeliveryLedger::new(mem.clone());

        assert!(!ledger.is_duplicate(UserId(1), 10, MessageId(101)).await.unwrap());

        let rec = ledger.open(UserId(1), 10, None, MessageId(101)).await.unwrap();
        assert!(!ledger.is_duplicate(UserId(1), 10, MessageId(101)).await.unwrap());

        ledger.mark_failed(rec, "boom", true).await.unwrap();
        assert!(!ledger.is_duplicate(UserId(1), 10, MessageId(101)).await.unwrap());

        let rec = ledger.open(UserId(1), 10, None, MessageId(101)).await.unwrap();
        ledger.mark_success(rec, MessageId(555)).await.unwrap();
        assert!(ledger.is_duplicate(UserId(1), 10, MessageId(101)).await.unwrap());
    }

    #[tokio::test]
    async fn open_reuses_the_semantic_key() {
        let mem = Arc::new(MemStore::default());
        let ledger = DeliveryLedger::new(mem.clone());

        let a = ledger.open(UserId(1), 10, None, MessageId(7)).await.unwrap();
        ledger.mark_failed(a, "flood", true).await.unwrap();
        let b = ledger.open(UserId(1), 10, Some(3), MessageId(7)).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(mem.deliveries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_budget_limits_due_rows() {
        let mem = Arc::new(MemStore::default());
        let ledger = DeliveryLedger::new(mem.clone());

        let rec = ledger.open(UserId(1), 10, None, MessageId(1)).await.unwrap();
        for _ in 0..3 {
            ledger.mark_failed(rec, "flood", true).await.unwrap();
        }

        assert_eq!(ledger.due_retries(5, 10).await.unwrap().len(), 1);
        assert!(ledger.due_retries(3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let mem = Arc::new(MemStore::default());
        let ledger = DeliveryLedger::new(mem.clone());

        let a = ledger.open(UserId(1), 10, None, MessageId(1)).await.unwrap();
        ledger.mark_success(a, MessageId(100)).await.unwrap();
        let b = ledger.open(UserId(1), 10, None, MessageId(2)).await.unwrap();
        ledger.mark_failed(b, "nope", false).await.unwrap();
        ledger.open(UserId(1), 10, None, MessageId(3)).await.unwrap();

        let stats = ledger.stats(UserId(1), 24).await.unwrap();
        assert_eq!((stats.success, stats.failed, stats.pending), (1, 1, 1));
        assert!(ledger.last_success(UserId(1)).await.unwrap().is_some());
    }
}
