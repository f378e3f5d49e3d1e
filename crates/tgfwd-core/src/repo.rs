//! Persistent entities and the repository contracts the storage crate
//! implements. The storage engine itself is opaque to the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatDescriptor, ChatId, MessageId, UserId, UserState},
    Result,
};

#[derive(Clone, Debug)]
pub struct User {
    pub id: UserId,
    pub state: UserState,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct SessionRow {
    pub user_id: UserId,
    /// Encrypted session blob; the only confidential field at rest.
    pub blob: Vec<u8>,
    /// SHA-256 of the plaintext, for audit.
    pub content_hash: String,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Source {
    pub id: i64,
    pub user_id: UserId,
    pub channel_id: ChatId,
    pub channel_handle: Option<String>,
    pub channel_title: String,
    pub is_active: bool,
    /// Highest message id fully processed; monotonic non-decreasing.
    pub high_water: MessageId,
    pub added_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Destination {
    pub id: i64,
    pub user_id: UserId,
    pub channel_id: ChatId,
    pub channel_handle: Option<String>,
    pub channel_title: String,
    pub is_active: bool,
    pub configured_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => DeliveryStatus::Success,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeliveryRecord {
    pub id: i64,
    pub user_id: UserId,
    pub source_id: i64,
    pub destination_id: Option<i64>,
    pub original_msg_id: MessageId,
    pub forwarded_msg_id: Option<MessageId>,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    /// Cleared on permanent failures; such rows are never due again.
    pub will_retry: bool,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub success: i64,
    pub failed: i64,
    pub pending: i64,
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Create the row on first contact, or return the existing one.
    async fn ensure(&self, user_id: UserId) -> Result<User>;
    async fn get(&self, user_id: UserId) -> Result<Option<User>>;
    async fn set_state(&self, user_id: UserId, state: UserState) -> Result<()>;
    async fn by_state(&self, state: UserState) -> Result<Vec<User>>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Insert or replace; resets the valid flag and touches `last_used_at`.
    async fn upsert(&self, user_id: UserId, blob: Vec<u8>, content_hash: &str) -> Result<()>;
    async fn get_valid(&self, user_id: UserId) -> Result<Option<SessionRow>>;
    async fn touch(&self, user_id: UserId) -> Result<()>;
    async fn invalidate(&self, user_id: UserId) -> Result<()>;
    async fn users_with_valid_session(&self) -> Result<Vec<UserId>>;
}

#[async_trait]
pub trait SourceRepo: Send + Sync {
    async fn add(&self, user_id: UserId, chat: &ChatDescriptor) -> Result<Source>;
    async fn get(&self, id: i64) -> Result<Option<Source>>;
    async fn by_channel(&self, user_id: UserId, channel_id: ChatId) -> Result<Option<Source>>;
    async fn by_user(
        &self,
        user_id: UserId,
        active_only: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Source>>;
    async fn count_by_user(&self, user_id: UserId) -> Result<i64>;
    async fn set_active(&self, id: i64, active: bool) -> Result<()>;
    /// Monotonic: never moves the mark backwards.
    async fn advance_high_water(&self, id: i64, msg_id: MessageId) -> Result<()>;
    async fn users_with_active_sources(&self) -> Result<Vec<UserId>>;
}

#[async_trait]
pub trait DestinationRepo: Send + Sync {
    /// At most one active destination per owner.
    async fn upsert(&self, user_id: UserId, chat: &ChatDescriptor) -> Result<Destination>;
    async fn active_by_user(&self, user_id: UserId) -> Result<Option<Destination>>;
    /// Back to DM-fallback mode.
    async fn clear(&self, user_id: UserId) -> Result<()>;
}

#[async_trait]
pub trait DeliveryRepo: Send + Sync {
    async fn find(
        &self,
        user_id: UserId,
        source_id: i64,
        original: MessageId,
    ) -> Result<Option<DeliveryRecord>>;

    /// Create (or reopen) the pending record for the semantic key
    /// (owner, source, original message id); returns the record id.
    async fn open(
        &self,
        user_id: UserId,
        source_id: i64,
        destination_id: Option<i64>,
        original: MessageId,
    ) -> Result<i64>;

    async fn mark_success(&self, record_id: i64, forwarded: MessageId) -> Result<()>;

    /// `will_retry` also drives the retry counter: it increments iff set.
    async fn mark_failed(&self, record_id: i64, error: &str, will_retry: bool) -> Result<()>;

    async fn stats(&self, user_id: UserId, window_hours: i64) -> Result<DeliveryStats>;
    async fn last_success(&self, user_id: UserId) -> Result<Option<DateTime<Utc>>>;

    /// Retryable failed rows still inside the budget.
    async fn due_retries(&self, max_retries: i64, limit: i64) -> Result<Vec<DeliveryRecord>>;
}
