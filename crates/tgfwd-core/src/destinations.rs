//! Destination management. Absence of an active destination means
//! DM-fallback mode.

use std::sync::Arc;

use tracing::info;

use crate::{
    domain::{ChatKind, UserId},
    errors::Error,
    ident::parse_channel_ref,
    mtproto::ClientRegistry,
    repo::{Destination, DestinationRepo},
    session_store::SessionStore,
    Result,
};

pub struct DestinationService {
    store: Arc<SessionStore>,
    registry: Arc<ClientRegistry>,
    destinations: Arc<dyn DestinationRepo>,
}

impl DestinationService {
    pub fn new(
        store: Arc<SessionStore>,
        registry: Arc<ClientRegistry>,
        destinations: Arc<dyn DestinationRepo>,
    ) -> Self {
        Self {
            store,
            registry,
            destinations,
        }
    }

    /// Resolve and upsert the destination channel. Admin rights of the
    /// companion bot are not probed here; a missing permission surfaces
    /// on the first send.
    pub async fn set(&self, user_id: UserId, input: &str) -> Result<Destination> {
        let reference = parse_channel_ref(input)?;

        let session = self
            .store
            .load(user_id)
            .await?
            .ok_or(Error::NoSession(user_id.0))?;
        let client = self.registry.get(user_id, Some(session)).await?;
        client.connect().await?;

        let chat = client.resolve_chat(&reference).await?;
        if !matches!(chat.kind, ChatKind::Channel | ChatKind::Supergroup) {
            return Err(Error::InputInvalid("not a channel".to_string()));
        }

        let dest = self.destinations.upsert(user_id, &chat).await?;
        info!(
            user_id = user_id.0,
            channel_id = dest.channel_id.0,
            title = %dest.channel_title,
            "destination configured"
        );
        Ok(dest)
    }

    /// Drop the destination; posts fall back to direct messages.
    pub async fn clear(&self, user_id: UserId) -> Result<()> {
        self.destinations.clear(user_id).await?;
        info!(user_id = user_id.0, "destination cleared, DM mode");
        Ok(())
    }

    pub async fn get(&self, user_id: UserId) -> Result<Option<Destination>> {
        self.destinations.active_by_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoBox;
    use crate::domain::{ChatDescriptor, ChatId};
    use crate::testutil::{FakeConnector, FakeMt, MemStore};

    const CHAT: i64 = -1009999999999;

    fn rig() -> (DestinationService, Arc<MemStore>) {
        let client = Arc::new(FakeMt::default());
        client.add_chat(ChatDescriptor {
            wire_id: ChatId(CHAT),
            title: "My Feed".to_string(),
            handle: Some("myfeed".to_string()),
            kind: ChatKind::Channel,
        });
        let connector = FakeConnector::with_template(client);
        let mem = Arc::new(MemStore::default());
        let store = Arc::new(SessionStore::new(
            CryptoBox::new("master"),
            mem.clone(),
            connector.clone(),
        ));
        let service = DestinationService::new(
            store,
            Arc::new(ClientRegistry::new(connector)),
            mem.clone(),
        );
        (service, mem)
    }

    async fn with_session(mem: &Arc<MemStore>, user: UserId) {
        let store = SessionStore::new(
            CryptoBox::new("master"),
            mem.clone(),
            Arc::new(FakeConnector::default()),
        );
        store.save(user, "session").await.unwrap();
    }

    #[tokio::test]
    async fn upsert_keeps_a_single_active_destination() {
        let (service, mem) = rig();
        let user = UserId(1);
        with_session(&mem, user).await;

        service.set(user, "@myfeed").await.unwrap();
        service.set(user, "@myfeed").await.unwrap();

        assert_eq!(mem.dests.lock().unwrap().len(), 1);
        assert!(service.get(user).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_returns_to_dm_mode() {
        let (service, mem) = rig();
        let user = UserId(1);
        with_session(&mem, user).await;

        service.set(user, "@myfeed").await.unwrap();
        service.clear(user).await.unwrap();
        assert!(service.get(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unresolvable_destination_is_an_error() {
        let (service, mem) = rig();
        let user = UserId(1);
        with_session(&mem, user).await;

        assert!(service.set(user, "@nowhere").await.is_err());
        assert!(service.get(user).await.unwrap().is_none());
    }
}
