//! MTProto capability surface and the per-user client registry.
//!
//! The wire protocol itself lives behind the [`MtProto`] port; the engine
//! only ever talks through this capability set. Adapters map upstream
//! flood waits into `Error::RateLimited` with the retry-after attached.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    domain::{
        AlbumPart, ChannelPost, ChatDescriptor, ChatId, MessageId, PollSpec, QrPollOutcome,
        QrToken, SentCode, SignInOutcome, UserId,
    },
    ident::ChannelRef,
    Result,
};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback invoked for every pushed channel post.
pub type PostHandler = Arc<dyn Fn(ChannelPost) -> BoxFuture + Send + Sync>;

/// Capability surface over an MTProto client, one instance per user.
///
/// Without a session plaintext the client can only run the
/// code-request / QR-export handshakes.
#[async_trait]
pub trait MtProto: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    // Auth primitives.
    async fn request_code(&self, phone: &str) -> Result<SentCode>;
    async fn sign_in(&self, phone: &str, code_hash: &str, code: &str) -> Result<SignInOutcome>;
    async fn check_password(&self, password: &str) -> Result<()>;
    async fn export_qr_token(&self) -> Result<QrToken>;
    async fn poll_qr_token(&self) -> Result<QrPollOutcome>;

    /// Serialised, portable form of the auth key. Encrypted before rest.
    async fn export_session(&self) -> Result<String>;

    /// Identity check against the upstream; fails with `AuthRejected`
    /// when the session is no longer valid.
    async fn who_am_i(&self) -> Result<UserId>;

    /// Load dialogs so peer lookups carry valid access hashes. Never raises.
    async fn warm_peer_cache(&self, limit: u32) -> u32;

    async fn resolve_chat(&self, ident: &ChannelRef) -> Result<ChatDescriptor>;

    /// Messages with id greater than `since_id`, newest first.
    async fn fetch_history(
        &self,
        chat: ChatId,
        since_id: MessageId,
        limit: u32,
    ) -> Result<Vec<ChannelPost>>;

    async fn copy_message(&self, dst: ChatId, src: ChatId, msg_id: MessageId)
        -> Result<MessageId>;

    /// Rebuild an album in the destination; returns the forwarded ids.
    async fn send_album(
        &self,
        dst: ChatId,
        src: ChatId,
        parts: &[AlbumPart],
    ) -> Result<Vec<MessageId>>;

    async fn send_poll(&self, dst: ChatId, poll: &PollSpec) -> Result<MessageId>;

    async fn download_media(&self, chat: ChatId, msg_id: MessageId) -> Result<Vec<u8>>;

    /// Register a handler for pushed channel posts; returns a handle
    /// usable with [`MtProto::unsubscribe`].
    async fn subscribe(&self, handler: PostHandler) -> Result<u64>;
    async fn unsubscribe(&self, subscription: u64) -> Result<()>;
}

/// Builds connected clients; the process owns exactly one connector.
#[async_trait]
pub trait MtConnector: Send + Sync {
    async fn connect(&self, user_id: UserId, session: Option<String>)
        -> Result<Arc<dyn MtProto>>;
}

struct RegistryEntry {
    session: Option<String>,
    client: Arc<dyn MtProto>,
}

/// Mutex-guarded user → client map.
///
/// Clients are expensive and hold the peer cache, so concurrent handlers
/// for the same user must share one instance. When a caller supplies a
/// session that differs from the live client's, the old client is
/// disconnected and replaced atomically.
pub struct ClientRegistry {
    connector: Arc<dyn MtConnector>,
    clients: Mutex<HashMap<UserId, RegistryEntry>>,
}

impl ClientRegistry {
    pub fn new(connector: Arc<dyn MtConnector>) -> Self {
        Self {
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        user_id: UserId,
        session: Option<String>,
    ) -> Result<Arc<dyn MtProto>> {
        let mut clients = self.clients.lock().await;

        if let Some(entry) = clients.get(&user_id) {
            let rotated = session.is_some() && entry.session != session;
            if !rotated {
                return Ok(entry.client.clone());
            }
            info!(user_id = user_id.0, "recreating client with new session");
            let _ = entry.client.disconnect().await;
        }

        let client = self.connector.connect(user_id, session.clone()).await?;
        clients.insert(
            user_id,
            RegistryEntry {
                session,
                client: client.clone(),
            },
        );
        Ok(client)
    }

    pub async fn remove(&self, user_id: UserId) {
        let entry = self.clients.lock().await.remove(&user_id);
        if let Some(entry) = entry {
            let _ = entry.client.disconnect().await;
        }
    }

    pub async fn close_all(&self) {
        let entries: Vec<_> = self.clients.lock().await.drain().collect();
        for (_, entry) in entries {
            let _ = entry.client.disconnect().await;
        }
    }
}
