//! Authentication flows: phone → code → optional 2FA, and the QR-token
//! flow with its background poller. Success materialises an encrypted
//! session through the [`SessionStore`].

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    botapi::Notifier,
    config::Config,
    domain::{QrPollOutcome, SignInOutcome, UserId, UserState},
    errors::Error,
    ident::normalize_phone,
    mtproto::{ClientRegistry, MtProto},
    repo::UserRepo,
    session_store::SessionStore,
    Result,
};

const QR_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuthStage {
    AwaitingCode,
    Awaiting2fa,
    AwaitingQr,
}

struct PendingAuth {
    phone: Option<String>,
    phone_code_hash: Option<String>,
    stage: AuthStage,
    expires_at: Instant,
    code_attempts: u32,
}

struct QrPoller {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Outcome surfaced to the chat-UI collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A confirmation code is on its way; `delivery` names the channel.
    CodeSent { delivery: String },
    NeedsPassword,
    Authorized,
}

/// Payload to render as a QR code, plus its expiry.
#[derive(Clone, Debug)]
pub struct QrCode {
    pub payload: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub struct AuthCoordinator {
    cfg: Arc<Config>,
    registry: Arc<ClientRegistry>,
    store: Arc<SessionStore>,
    users: Arc<dyn UserRepo>,
    notifier: Arc<dyn Notifier>,
    pending: Mutex<HashMap<UserId, PendingAuth>>,
    qr_pollers: Mutex<HashMap<UserId, QrPoller>>,
}

impl AuthCoordinator {
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<ClientRegistry>,
        store: Arc<SessionStore>,
        users: Arc<dyn UserRepo>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry,
            store,
            users,
            notifier,
            pending: Mutex::new(HashMap::new()),
            qr_pollers: Mutex::new(HashMap::new()),
        })
    }

    // ── Phone flow ─────────────────────────────────────────────────────

    /// Request a confirmation code; transitions the user to
    /// `awaiting_code`.
    pub async fn start(&self, user_id: UserId, phone: &str) -> Result<AuthOutcome> {
        let phone = normalize_phone(phone)?;
        self.users.ensure(user_id).await?;

        let client = self.registry.get(user_id, None).await?;
        client.connect().await?;

        let sent = client.request_code(&phone).await?;
        info!(user_id = user_id.0, delivery = %sent.delivery, "login code requested");

        self.pending.lock().await.insert(
            user_id,
            PendingAuth {
                phone: Some(phone),
                phone_code_hash: Some(sent.phone_code_hash),
                stage: AuthStage::AwaitingCode,
                expires_at: Instant::now() + self.cfg.auth_code_timeout,
                code_attempts: 0,
            },
        );
        self.users.set_state(user_id, UserState::AwaitingCode).await?;

        Ok(AuthOutcome::CodeSent {
            delivery: sent.delivery,
        })
    }

    /// Verify the confirmation code. Non-digits are stripped from the
    /// input; 4–6 digits are required.
    pub async fn submit_code(&self, user_id: UserId, code: &str) -> Result<AuthOutcome> {
        let digits: String = code.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 4 || digits.len() > 6 {
            return Err(Error::InputInvalid(
                "the confirmation code is 4-6 digits".to_string(),
            ));
        }

        let (phone, code_hash) = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get(&user_id) else {
                return Err(Error::InputInvalid(
                    "no pending authentication".to_string(),
                ));
            };
            if entry.stage != AuthStage::AwaitingCode {
                return Err(Error::InputInvalid(
                    "not waiting for a confirmation code".to_string(),
                ));
            }
            if Instant::now() >= entry.expires_at {
                pending.remove(&user_id);
                return Err(Error::CodeExpired);
            }
            (
                entry.phone.clone().unwrap_or_default(),
                entry.phone_code_hash.clone().unwrap_or_default(),
            )
        };

        let client = self.registry.get(user_id, None).await?;
        match client.sign_in(&phone, &code_hash, &digits).await {
            Ok(SignInOutcome::Authorized) => {
                self.finalize(user_id, client.as_ref()).await?;
                Ok(AuthOutcome::Authorized)
            }
            Ok(SignInOutcome::NeedsPassword) => {
                if let Some(entry) = self.pending.lock().await.get_mut(&user_id) {
                    entry.stage = AuthStage::Awaiting2fa;
                }
                self.users.set_state(user_id, UserState::Awaiting2fa).await?;
                Ok(AuthOutcome::NeedsPassword)
            }
            Err(Error::CodeInvalid) => {
                let exhausted = {
                    let mut pending = self.pending.lock().await;
                    match pending.get_mut(&user_id) {
                        Some(entry) => {
                            entry.code_attempts += 1;
                            let exhausted = entry.code_attempts >= self.cfg.max_auth_attempts;
                            if exhausted {
                                pending.remove(&user_id);
                            }
                            exhausted
                        }
                        None => false,
                    }
                };
                if exhausted {
                    warn!(user_id = user_id.0, "code attempt budget exhausted");
                    self.users.set_state(user_id, UserState::Idle).await?;
                }
                Err(Error::CodeInvalid)
            }
            Err(e) => Err(e),
        }
    }

    /// Verify the cloud password (2FA).
    pub async fn submit_password(&self, user_id: UserId, password: &str) -> Result<AuthOutcome> {
        {
            let pending = self.pending.lock().await;
            match pending.get(&user_id) {
                Some(entry) if entry.stage == AuthStage::Awaiting2fa => {}
                _ => {
                    return Err(Error::InputInvalid(
                        "not waiting for a password".to_string(),
                    ))
                }
            }
        }

        let client = self.registry.get(user_id, None).await?;
        client.check_password(password).await?;
        self.finalize(user_id, client.as_ref()).await?;
        Ok(AuthOutcome::Authorized)
    }

    // ── QR flow ────────────────────────────────────────────────────────

    /// Export a fresh login token and start (or restart) the poller.
    /// Idempotent: at most one poller per user survives this call.
    pub async fn start_qr(self: &Arc<Self>, user_id: UserId) -> Result<QrCode> {
        self.users.ensure(user_id).await?;
        self.cancel_qr_poller(user_id).await;

        let client = self.registry.get(user_id, None).await?;
        client.connect().await?;
        let token = client.export_qr_token().await?;

        self.pending.lock().await.insert(
            user_id,
            PendingAuth {
                phone: None,
                phone_code_hash: None,
                stage: AuthStage::AwaitingQr,
                expires_at: Instant::now() + self.cfg.auth_code_timeout,
                code_attempts: 0,
            },
        );
        self.users.set_state(user_id, UserState::AwaitingQr).await?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::qr_poll_loop(
            self.clone(),
            user_id,
            client.clone(),
            token.expires_at,
            cancel.clone(),
        ));
        self.qr_pollers.lock().await.insert(
            user_id,
            QrPoller {
                cancel,
                _handle: handle,
            },
        );

        Ok(QrCode {
            payload: format!("tg://login?token={}", token.token),
            expires_at: token.expires_at,
        })
    }

    /// Cancels the old poller, exports a new token, restarts the poller.
    pub async fn refresh_qr(self: &Arc<Self>, user_id: UserId) -> Result<QrCode> {
        self.start_qr(user_id).await
    }

    /// User abort or conversation reset: tear down both the pending
    /// entry and any poller.
    pub async fn cancel(&self, user_id: UserId) -> Result<()> {
        self.pending.lock().await.remove(&user_id);
        self.cancel_qr_poller(user_id).await;
        self.users.set_state(user_id, UserState::Idle).await
    }

    pub async fn qr_poller_count(&self) -> usize {
        self.qr_pollers.lock().await.len()
    }

    async fn qr_poll_loop(
        this: Arc<Self>,
        user_id: UserId,
        client: Arc<dyn MtProto>,
        expires_at: chrono::DateTime<chrono::Utc>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(QR_POLL_INTERVAL) => {}
            }

            if chrono::Utc::now() >= expires_at {
                warn!(user_id = user_id.0, "qr token expired");
                this.notifier
                    .notify(user_id, "The QR code expired. Request a fresh one to continue.")
                    .await;
                this.pending.lock().await.remove(&user_id);
                return;
            }

            match client.poll_qr_token().await {
                Ok(QrPollOutcome::Pending) => continue,
                Ok(QrPollOutcome::Authorized) => {
                    if let Err(e) = this.finalize(user_id, client.as_ref()).await {
                        warn!(user_id = user_id.0, error = %e, "qr finalise failed");
                    }
                    return;
                }
                Ok(QrPollOutcome::NeedsPassword) => {
                    if let Some(entry) = this.pending.lock().await.get_mut(&user_id) {
                        entry.stage = AuthStage::Awaiting2fa;
                    }
                    let _ = this.users.set_state(user_id, UserState::Awaiting2fa).await;
                    return;
                }
                Err(Error::RateLimited { retry_after }) => {
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                }
                Err(e) => {
                    warn!(user_id = user_id.0, error = %e, "qr poll failed");
                }
            }
        }
    }

    async fn cancel_qr_poller(&self, user_id: UserId) {
        if let Some(poller) = self.qr_pollers.lock().await.remove(&user_id) {
            poller.cancel.cancel();
        }
    }

    /// Export → save → drop pending state → evict the registry client so
    /// the next `get` picks up the stored session.
    async fn finalize(&self, user_id: UserId, client: &dyn MtProto) -> Result<()> {
        let plaintext = client.export_session().await?;
        self.store.save(user_id, &plaintext).await?;

        self.pending.lock().await.remove(&user_id);
        self.cancel_qr_poller(user_id).await;
        self.registry.remove(user_id).await;

        self.users.set_state(user_id, UserState::MainMenu).await?;
        info!(user_id = user_id.0, "authentication finalised");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::crypto::CryptoBox;
    use crate::testutil::{FakeConnector, FakeMt, FakeNotifier, MemStore};
    use std::sync::atomic::Ordering;

    struct Rig {
        auth: Arc<AuthCoordinator>,
        client: Arc<FakeMt>,
        mem: Arc<MemStore>,
        store: Arc<SessionStore>,
    }

    fn rig() -> Rig {
        let client = Arc::new(FakeMt::default());
        let connector = FakeConnector::with_template(client.clone());
        let mem = Arc::new(MemStore::default());
        let store = Arc::new(SessionStore::new(
            CryptoBox::new("master"),
            mem.clone(),
            connector.clone(),
        ));
        let auth = AuthCoordinator::new(
            Arc::new(test_config()),
            Arc::new(ClientRegistry::new(connector)),
            store.clone(),
            mem.clone(),
            Arc::new(FakeNotifier::default()),
        );
        Rig {
            auth,
            client,
            mem,
            store,
        }
    }

    async fn user_state(mem: &MemStore, user: UserId) -> UserState {
        mem.get(user).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn phone_happy_path_saves_decryptable_session() {
        let rig = rig();
        let user = UserId(1);

        let out = rig.auth.start(user, "+79991234567").await.unwrap();
        assert_eq!(
            out,
            AuthOutcome::CodeSent {
                delivery: "app".to_string()
            }
        );
        assert_eq!(user_state(&rig.mem, user).await, UserState::AwaitingCode);

        // Spaces in the code input are stripped before the sign-in call.
        let out = rig.auth.submit_code(user, "1 2 3 4 5").await.unwrap();
        assert_eq!(out, AuthOutcome::Authorized);
        assert_eq!(
            rig.client.sign_in_codes.lock().unwrap().as_slice(),
            ["12345".to_string()]
        );

        let row = rig.mem.sessions.lock().unwrap()[&1].clone();
        assert!(row.is_valid);
        assert_eq!(
            rig.store.load(user).await.unwrap().as_deref(),
            Some("exported-session-plaintext")
        );
        assert_eq!(user_state(&rig.mem, user).await, UserState::MainMenu);
    }

    #[tokio::test]
    async fn two_factor_path_requires_password() {
        let rig = rig();
        let user = UserId(1);
        rig.client.needs_password.store(true, Ordering::SeqCst);

        rig.auth.start(user, "+79991234567").await.unwrap();
        let out = rig.auth.submit_code(user, "12345").await.unwrap();
        assert_eq!(out, AuthOutcome::NeedsPassword);
        assert_eq!(user_state(&rig.mem, user).await, UserState::Awaiting2fa);

        let out = rig.auth.submit_password(user, "hunter2").await.unwrap();
        assert_eq!(out, AuthOutcome::Authorized);
        assert_eq!(user_state(&rig.mem, user).await, UserState::MainMenu);
        // Pending auth data is gone: another code submit is rejected.
        assert!(rig.auth.submit_code(user, "12345").await.is_err());
    }

    #[tokio::test]
    async fn bad_code_consumes_the_attempt_budget() {
        let rig = rig();
        let user = UserId(1);
        rig.auth.start(user, "+79991234567").await.unwrap();

        for _ in 0..3 {
            let err = rig.auth.submit_code(user, "00000").await.unwrap_err();
            assert!(matches!(err, Error::CodeInvalid));
        }

        // Budget exhausted: the pending entry was dropped.
        let err = rig.auth.submit_code(user, "12345").await.unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));
        assert_eq!(user_state(&rig.mem, user).await, UserState::Idle);
    }

    #[tokio::test]
    async fn malformed_code_is_rejected_before_upstream() {
        let rig = rig();
        let user = UserId(1);
        rig.auth.start(user, "+79991234567").await.unwrap();

        assert!(rig.auth.submit_code(user, "12").await.is_err());
        assert!(rig.auth.submit_code(user, "1234567").await.is_err());
        assert!(rig.client.sign_in_codes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_phone_is_rejected() {
        let rig = rig();
        let err = rig.auth.start(UserId(1), "12345").await.unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));
    }

    #[tokio::test]
    async fn refresh_qr_leaves_exactly_one_poller() {
        let rig = rig();
        let user = UserId(1);

        let qr = rig.auth.start_qr(user).await.unwrap();
        assert!(qr.payload.starts_with("tg://login?token="));
        assert_eq!(rig.auth.qr_poller_count().await, 1);

        rig.auth.refresh_qr(user).await.unwrap();
        rig.auth.refresh_qr(user).await.unwrap();
        assert_eq!(rig.auth.qr_poller_count().await, 1);
        assert_eq!(rig.client.qr_exports.load(Ordering::SeqCst), 3);

        rig.auth.cancel(user).await.unwrap();
        assert_eq!(rig.auth.qr_poller_count().await, 0);
        assert_eq!(user_state(&rig.mem, user).await, UserState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn qr_poller_finalises_on_authorized() {
        let rig = rig();
        let user = UserId(1);
        rig.client
            .qr_outcomes
            .lock()
            .unwrap()
            .push_back(QrPollOutcome::Authorized);

        rig.auth.start_qr(user).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(rig.mem.sessions.lock().unwrap().contains_key(&1));
        assert_eq!(user_state(&rig.mem, user).await, UserState::MainMenu);
    }
}
