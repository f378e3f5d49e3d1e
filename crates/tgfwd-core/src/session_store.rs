//! Encrypted session persistence and upstream health checks.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    crypto::CryptoBox,
    domain::UserId,
    mtproto::MtConnector,
    repo::SessionRepo,
    Result,
};

pub struct SessionStore {
    crypto: CryptoBox,
    sessions: Arc<dyn SessionRepo>,
    connector: Arc<dyn MtConnector>,
}

impl SessionStore {
    pub fn new(
        crypto: CryptoBox,
        sessions: Arc<dyn SessionRepo>,
        connector: Arc<dyn MtConnector>,
    ) -> Self {
        Self {
            crypto,
            sessions,
            connector,
        }
    }

    /// Encrypt and upsert; resets the valid flag and touches `last_used_at`.
    pub async fn save(&self, user_id: UserId, plaintext: &str) -> Result<()> {
        let encrypted = self.crypto.encrypt(user_id, plaintext.as_bytes())?;
        let content_hash = CryptoBox::hash(plaintext.as_bytes());
        self.sessions.upsert(user_id, encrypted, &content_hash).await?;
        info!(user_id = user_id.0, "session saved");
        Ok(())
    }

    /// Decrypted session plaintext, or `None` when absent.
    ///
    /// A blob that fails authentication is invalidated on the spot and
    /// reported as absent; the caller never sees the crypto error.
    pub async fn load(&self, user_id: UserId) -> Result<Option<String>> {
        let Some(row) = self.sessions.get_valid(user_id).await? else {
            return Ok(None);
        };

        let plaintext = match self.crypto.decrypt(user_id, &row.blob) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(_) => {
                    warn!(user_id = user_id.0, "session blob is not utf-8, invalidating");
                    self.sessions.invalidate(user_id).await?;
                    return Ok(None);
                }
            },
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "session decrypt failed, invalidating");
                self.sessions.invalidate(user_id).await?;
                return Ok(None);
            }
        };

        self.sessions.touch(user_id).await?;
        Ok(Some(plaintext))
    }

    pub async fn invalidate(&self, user_id: UserId) -> Result<()> {
        info!(user_id = user_id.0, "invalidating session");
        self.sessions.invalidate(user_id).await
    }

    pub async fn has_valid(&self, user_id: UserId) -> Result<bool> {
        Ok(self.sessions.get_valid(user_id).await?.is_some())
    }

    pub async fn users_with_valid(&self) -> Result<Vec<UserId>> {
        self.sessions.users_with_valid_session().await
    }

    /// Check the session against the upstream with a throwaway client.
    ///
    /// Normalises every failure into a boolean: auth rejection
    /// invalidates the row and yields `false`; transient transport
    /// trouble leaves the session presumed valid until proven otherwise.
    pub async fn verify(&self, user_id: UserId) -> bool {
        let plaintext = match self.load(user_id).await {
            Ok(Some(p)) => p,
            Ok(None) => return false,
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "session load failed during verify");
                return false;
            }
        };

        let client = match self.connector.connect(user_id, Some(plaintext)).await {
            Ok(c) => c,
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "verify connect failed");
                return true;
            }
        };

        let valid = match client.who_am_i().await {
            Ok(_) => true,
            Err(e) if e.is_auth_rejected() => {
                warn!(user_id = user_id.0, "upstream rejected session");
                let _ = self.sessions.invalidate(user_id).await;
                false
            }
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "verify failed transiently");
                true
            }
        };

        let _ = client.disconnect().await;
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeConnector, FakeMt, MemStore};
    use std::sync::atomic::Ordering;

    fn store_with(connector: Arc<FakeConnector>) -> (SessionStore, Arc<MemStore>) {
        let mem = Arc::new(MemStore::default());
        let store = SessionStore::new(
            CryptoBox::new("master"),
            mem.clone(),
            connector,
        );
        (store, mem)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (store, mem) = store_with(Arc::new(FakeConnector::default()));

        store.save(UserId(1), "1BVts...plaintext").await.unwrap();
        assert_eq!(
            store.load(UserId(1)).await.unwrap().as_deref(),
            Some("1BVts...plaintext")
        );

        let row = mem.sessions.lock().unwrap()[&1].clone();
        assert!(row.is_valid);
        assert_eq!(row.content_hash, CryptoBox::hash(b"1BVts...plaintext"));
        assert_ne!(row.blob, b"1BVts...plaintext".to_vec());
    }

    #[tokio::test]
    async fn corrupt_blob_invalidates_and_returns_none() {
        let (store, mem) = store_with(Arc::new(FakeConnector::default()));

        store.save(UserId(1), "good").await.unwrap();
        mem.sessions.lock().unwrap().get_mut(&1).unwrap().blob = vec![0xde, 0xad];

        assert!(store.load(UserId(1)).await.unwrap().is_none());
        assert!(!mem.sessions.lock().unwrap()[&1].is_valid);
    }

    #[tokio::test]
    async fn verify_invalidates_on_auth_rejection() {
        let client = Arc::new(FakeMt::default());
        client.who_fails_auth.store(true, Ordering::SeqCst);
        let (store, mem) = store_with(FakeConnector::with_template(client.clone()));

        store.save(UserId(1), "session").await.unwrap();
        assert!(!store.verify(UserId(1)).await);
        assert!(!mem.sessions.lock().unwrap()[&1].is_valid);
        assert_eq!(client.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verify_tolerates_transient_transport_errors() {
        let client = Arc::new(FakeMt::default());
        client.who_fails_transport.store(true, Ordering::SeqCst);
        let (store, mem) = store_with(FakeConnector::with_template(client));

        store.save(UserId(1), "session").await.unwrap();
        assert!(store.verify(UserId(1)).await);
        assert!(mem.sessions.lock().unwrap()[&1].is_valid);
    }

    #[tokio::test]
    async fn verify_without_session_is_false() {
        let (store, _mem) = store_with(Arc::new(FakeConnector::default()));
        assert!(!store.verify(UserId(9)).await);
    }
}
