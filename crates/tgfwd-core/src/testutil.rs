//! Shared fakes for engine tests: a scriptable MTProto client, Bot API
//! sink, notifier, and in-memory repositories.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::{
    botapi::{BotApi, DmMedia, Notifier},
    domain::*,
    errors::Error,
    ident::ChannelRef,
    mtproto::{MtConnector, MtProto, PostHandler},
    repo::*,
    Result,
};

pub fn chan_post(chat: i64, id: i64, kind: MessageKind, text: Option<&str>) -> ChannelPost {
    ChannelPost {
        chat_id: ChatId(chat),
        chat_title: Some("Test Channel".to_string()),
        chat_handle: Some("testchan".to_string()),
        msg_id: MessageId(id),
        group_id: None,
        kind,
        text: text.map(|t| t.to_string()),
        entities: None,
        file_size: if kind.has_media() { Some(1024) } else { None },
        file_name: None,
        poll: None,
        location: None,
        contact: None,
    }
}

#[derive(Clone, Debug)]
pub enum FailKind {
    RateLimited(u64),
    Transport(String),
    AuthRejected,
}

impl FailKind {
    fn to_error(&self) -> Error {
        match self {
            FailKind::RateLimited(secs) => Error::RateLimited { retry_after: *secs },
            FailKind::Transport(msg) => Error::Transport(msg.clone()),
            FailKind::AuthRejected => Error::AuthRejected("auth key unregistered".to_string()),
        }
    }
}

#[derive(Default)]
pub struct FakeMt {
    pub session: Mutex<Option<String>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,

    // Auth scripting.
    pub needs_password: AtomicBool,
    pub sign_in_codes: Mutex<Vec<String>>,
    pub passwords: Mutex<Vec<String>>,
    pub exported_session: Mutex<Option<String>>,
    pub who_fails_auth: AtomicBool,
    pub who_fails_transport: AtomicBool,
    pub qr_outcomes: Mutex<VecDeque<QrPollOutcome>>,
    pub qr_exports: AtomicUsize,

    // Resolution and history.
    pub chats: Mutex<HashMap<i64, ChatDescriptor>>,
    pub handles: Mutex<HashMap<String, ChatDescriptor>>,
    pub history: Mutex<HashMap<i64, Vec<ChannelPost>>>,

    // Egress recording.
    pub next_forward_id: AtomicI64,
    pub copied: Mutex<Vec<(ChatId, ChatId, MessageId)>>,
    pub albums: Mutex<Vec<(ChatId, ChatId, Vec<AlbumPart>)>>,
    pub polls: Mutex<Vec<(ChatId, PollSpec)>>,
    pub downloads: Mutex<Vec<(ChatId, MessageId)>>,
    pub download_payload: Mutex<Vec<u8>>,
    /// Consumed one per egress attempt (copy/album/poll).
    pub egress_failures: Mutex<VecDeque<FailKind>>,

    // Subscriptions.
    pub next_sub: AtomicU64,
    pub subs: Mutex<HashMap<u64, PostHandler>>,
}

impl FakeMt {
    pub fn with_session(session: Option<String>) -> Self {
        let fake = Self::default();
        *fake.session.lock().unwrap() = session;
        fake
    }

    pub fn add_chat(&self, desc: ChatDescriptor) {
        if let Some(handle) = &desc.handle {
            self.handles.lock().unwrap().insert(handle.clone(), desc.clone());
        }
        self.chats.lock().unwrap().insert(desc.wire_id.0, desc);
    }

    pub fn add_history(&self, chat: i64, post: ChannelPost) {
        self.history.lock().unwrap().entry(chat).or_default().push(post);
    }

    pub fn fail_next_egress(&self, kind: FailKind) {
        self.egress_failures.lock().unwrap().push_back(kind);
    }

    fn take_egress_failure(&self) -> Option<Error> {
        self.egress_failures
            .lock()
            .unwrap()
            .pop_front()
            .map(|k| k.to_error())
    }

    fn alloc_id(&self) -> MessageId {
        MessageId(1000 + self.next_forward_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// Push a post through every registered subscription handler.
    pub async fn push(&self, post: ChannelPost) {
        let handlers: Vec<PostHandler> = self.subs.lock().unwrap().values().cloned().collect();
        for handler in handlers {
            handler(post.clone()).await;
        }
    }
}

#[async_trait]
impl MtProto for FakeMt {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_code(&self, _phone: &str) -> Result<SentCode> {
        Ok(SentCode {
            phone_code_hash: "hash123".to_string(),
            delivery: "app".to_string(),
        })
    }

    async fn sign_in(&self, _phone: &str, _code_hash: &str, code: &str) -> Result<SignInOutcome> {
        self.sign_in_codes.lock().unwrap().push(code.to_string());
        if code != "12345" {
            return Err(Error::CodeInvalid);
        }
        if self.needs_password.load(Ordering::SeqCst) {
            Ok(SignInOutcome::NeedsPassword)
        } else {
            Ok(SignInOutcome::Authorized)
        }
    }

    async fn check_password(&self, password: &str) -> Result<()> {
        self.passwords.lock().unwrap().push(password.to_string());
        if password == "hunter2" {
            Ok(())
        } else {
            Err(Error::PasswordInvalid)
        }
    }

    async fn export_qr_token(&self) -> Result<QrToken> {
        self.qr_exports.fetch_add(1, Ordering::SeqCst);
        Ok(QrToken {
            token: "cXJ0b2tlbg".to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(60),
        })
    }

    async fn poll_qr_token(&self) -> Result<QrPollOutcome> {
        Ok(self
            .qr_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(QrPollOutcome::Pending))
    }

    async fn export_session(&self) -> Result<String> {
        Ok(self
            .exported_session
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "exported-session-plaintext".to_string()))
    }

    async fn who_am_i(&self) -> Result<UserId> {
        if self.who_fails_auth.load(Ordering::SeqCst) {
            return Err(Error::AuthRejected("auth key unregistered".to_string()));
        }
        if self.who_fails_transport.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection reset".to_string()));
        }
        Ok(UserId(1))
    }

    async fn warm_peer_cache(&self, limit: u32) -> u32 {
        limit.min(self.chats.lock().unwrap().len() as u32)
    }

    async fn resolve_chat(&self, ident: &ChannelRef) -> Result<ChatDescriptor> {
        let found = match ident {
            ChannelRef::Id(id) => self.chats.lock().unwrap().get(&id.0).cloned(),
            ChannelRef::Handle(h) => self.handles.lock().unwrap().get(h).cloned(),
            ChannelRef::Invite(h) => self.handles.lock().unwrap().get(h).cloned(),
        };
        found.ok_or_else(|| Error::NotFound(format!("chat {ident:?}")))
    }

    async fn fetch_history(
        &self,
        chat: ChatId,
        since_id: MessageId,
        limit: u32,
    ) -> Result<Vec<ChannelPost>> {
        let mut page: Vec<ChannelPost> = self
            .history
            .lock()
            .unwrap()
            .get(&chat.0)
            .map(|v| {
                v.iter()
                    .filter(|m| m.msg_id > since_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.sort_by_key(|m| std::cmp::Reverse(m.msg_id));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn copy_message(
        &self,
        dst: ChatId,
        src: ChatId,
        msg_id: MessageId,
    ) -> Result<MessageId> {
        if let Some(err) = self.take_egress_failure() {
            return Err(err);
        }
        self.copied.lock().unwrap().push((dst, src, msg_id));
        Ok(self.alloc_id())
    }

    async fn send_album(
        &self,
        dst: ChatId,
        src: ChatId,
        parts: &[AlbumPart],
    ) -> Result<Vec<MessageId>> {
        if let Some(err) = self.take_egress_failure() {
            return Err(err);
        }
        self.albums.lock().unwrap().push((dst, src, parts.to_vec()));
        Ok(parts.iter().map(|_| self.alloc_id()).collect())
    }

    async fn send_poll(&self, dst: ChatId, poll: &PollSpec) -> Result<MessageId> {
        if let Some(err) = self.take_egress_failure() {
            return Err(err);
        }
        self.polls.lock().unwrap().push((dst, poll.clone()));
        Ok(self.alloc_id())
    }

    async fn download_media(&self, chat: ChatId, msg_id: MessageId) -> Result<Vec<u8>> {
        self.downloads.lock().unwrap().push((chat, msg_id));
        Ok(self.download_payload.lock().unwrap().clone())
    }

    async fn subscribe(&self, handler: PostHandler) -> Result<u64> {
        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        self.subs.lock().unwrap().insert(id, handler);
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: u64) -> Result<()> {
        self.subs.lock().unwrap().remove(&subscription);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub connects: AtomicUsize,
    pub clients: Mutex<Vec<Arc<FakeMt>>>,
    /// When set, every connect hands out this client.
    pub template: Mutex<Option<Arc<FakeMt>>>,
}

impl FakeConnector {
    pub fn with_template(client: Arc<FakeMt>) -> Arc<Self> {
        let c = Self::default();
        *c.template.lock().unwrap() = Some(client);
        Arc::new(c)
    }
}

#[async_trait]
impl MtConnector for FakeConnector {
    async fn connect(
        &self,
        _user_id: UserId,
        session: Option<String>,
    ) -> Result<Arc<dyn MtProto>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(template) = self.template.lock().unwrap().clone() {
            return Ok(template);
        }
        let client = Arc::new(FakeMt::with_session(session));
        self.clients.lock().unwrap().push(client.clone());
        Ok(client)
    }
}

#[derive(Default)]
pub struct FakeBotApi {
    pub next_id: AtomicI64,
    pub htmls: Mutex<Vec<(ChatId, String)>>,
    pub media: Mutex<Vec<(ChatId, MessageKind, usize, Option<String>)>>,
    pub groups: Mutex<Vec<(ChatId, usize, Option<String>)>>,
}

impl FakeBotApi {
    fn alloc_id(&self) -> MessageId {
        MessageId(5000 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl BotApi for FakeBotApi {
    async fn send_html(&self, chat: ChatId, html: &str) -> Result<MessageId> {
        self.htmls.lock().unwrap().push((chat, html.to_string()));
        Ok(self.alloc_id())
    }

    async fn send_media(
        &self,
        chat: ChatId,
        media: DmMedia,
        caption_html: Option<&str>,
    ) -> Result<MessageId> {
        self.media.lock().unwrap().push((
            chat,
            media.kind,
            media.bytes.len(),
            caption_html.map(|c| c.to_string()),
        ));
        Ok(self.alloc_id())
    }

    async fn send_media_group(
        &self,
        chat: ChatId,
        media: Vec<DmMedia>,
        caption_html: Option<&str>,
    ) -> Result<MessageId> {
        self.groups.lock().unwrap().push((
            chat,
            media.len(),
            caption_html.map(|c| c.to_string()),
        ));
        Ok(self.alloc_id())
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub notes: Mutex<Vec<(UserId, String)>>,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, user_id: UserId, text: &str) {
        self.notes.lock().unwrap().push((user_id, text.to_string()));
    }
}

/// In-memory implementation of every repository trait.
#[derive(Default)]
pub struct MemStore {
    pub users: Mutex<HashMap<i64, User>>,
    pub sessions: Mutex<HashMap<i64, SessionRow>>,
    pub sources: Mutex<Vec<Source>>,
    pub dests: Mutex<Vec<Destination>>,
    pub deliveries: Mutex<Vec<DeliveryRecord>>,
    next_source_id: AtomicI64,
    next_dest_id: AtomicI64,
    next_delivery_id: AtomicI64,
}

impl MemStore {
    pub fn seed_source(&self, user_id: UserId, channel_id: ChatId, title: &str) -> Source {
        let source = Source {
            id: 1 + self.next_source_id.fetch_add(1, Ordering::SeqCst),
            user_id,
            channel_id,
            channel_handle: None,
            channel_title: title.to_string(),
            is_active: true,
            high_water: MessageId(0),
            added_at: Utc::now(),
        };
        self.sources.lock().unwrap().push(source.clone());
        source
    }
}

#[async_trait]
impl UserRepo for MemStore {
    async fn ensure(&self, user_id: UserId) -> Result<User> {
        let mut users = self.users.lock().unwrap();
        let user = users.entry(user_id.0).or_insert_with(|| User {
            id: user_id,
            state: UserState::Idle,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        Ok(user.clone())
    }

    async fn get(&self, user_id: UserId) -> Result<Option<User>> {
        Ok(self.users.lock().unwrap().get(&user_id.0).cloned())
    }

    async fn set_state(&self, user_id: UserId, state: UserState) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        let user = users.entry(user_id.0).or_insert_with(|| User {
            id: user_id,
            state: UserState::Idle,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        user.state = state;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn by_state(&self, state: UserState) -> Result<Vec<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|u| u.state == state)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionRepo for MemStore {
    async fn upsert(&self, user_id: UserId, blob: Vec<u8>, content_hash: &str) -> Result<()> {
        self.sessions.lock().unwrap().insert(
            user_id.0,
            SessionRow {
                user_id,
                blob,
                content_hash: content_hash.to_string(),
                is_valid: true,
                created_at: Utc::now(),
                last_used_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_valid(&self, user_id: UserId) -> Result<Option<SessionRow>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(&user_id.0)
            .filter(|s| s.is_valid)
            .cloned())
    }

    async fn touch(&self, user_id: UserId) -> Result<()> {
        if let Some(row) = self.sessions.lock().unwrap().get_mut(&user_id.0) {
            row.last_used_at = Utc::now();
        }
        Ok(())
    }

    async fn invalidate(&self, user_id: UserId) -> Result<()> {
        if let Some(row) = self.sessions.lock().unwrap().get_mut(&user_id.0) {
            row.is_valid = false;
        }
        Ok(())
    }

    async fn users_with_valid_session(&self) -> Result<Vec<UserId>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_valid)
            .map(|s| s.user_id)
            .collect())
    }
}

#[async_trait]
impl SourceRepo for MemStore {
    async fn add(&self, user_id: UserId, chat: &ChatDescriptor) -> Result<Source> {
        let source = Source {
            id: 1 + self.next_source_id.fetch_add(1, Ordering::SeqCst),
            user_id,
            channel_id: chat.wire_id,
            channel_handle: chat.handle.clone(),
            channel_title: chat.title.clone(),
            is_active: true,
            high_water: MessageId(0),
            added_at: Utc::now(),
        };
        self.sources.lock().unwrap().push(source.clone());
        Ok(source)
    }

    async fn get(&self, id: i64) -> Result<Option<Source>> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn by_channel(&self, user_id: UserId, channel_id: ChatId) -> Result<Option<Source>> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.user_id == user_id && s.channel_id == channel_id)
            .cloned())
    }

    async fn by_user(
        &self,
        user_id: UserId,
        active_only: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Source>> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.user_id == user_id && (!active_only || s.is_active))
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_by_user(&self, user_id: UserId) -> Result<i64> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.user_id == user_id && s.is_active)
            .count() as i64)
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<()> {
        if let Some(s) = self.sources.lock().unwrap().iter_mut().find(|s| s.id == id) {
            s.is_active = active;
        }
        Ok(())
    }

    async fn advance_high_water(&self, id: i64, msg_id: MessageId) -> Result<()> {
        if let Some(s) = self.sources.lock().unwrap().iter_mut().find(|s| s.id == id) {
            if msg_id > s.high_water {
                s.high_water = msg_id;
            }
        }
        Ok(())
    }

    async fn users_with_active_sources(&self) -> Result<Vec<UserId>> {
        let mut out: Vec<UserId> = self
            .sources
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_active)
            .map(|s| s.user_id)
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[async_trait]
impl DestinationRepo for MemStore {
    async fn upsert(&self, user_id: UserId, chat: &ChatDescriptor) -> Result<Destination> {
        let mut dests = self.dests.lock().unwrap();
        dests.retain(|d| d.user_id != user_id);
        let dest = Destination {
            id: 1 + self.next_dest_id.fetch_add(1, Ordering::SeqCst),
            user_id,
            channel_id: chat.wire_id,
            channel_handle: chat.handle.clone(),
            channel_title: chat.title.clone(),
            is_active: true,
            configured_at: Utc::now(),
        };
        dests.push(dest.clone());
        Ok(dest)
    }

    async fn active_by_user(&self, user_id: UserId) -> Result<Option<Destination>> {
        Ok(self
            .dests
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.user_id == user_id && d.is_active)
            .cloned())
    }

    async fn clear(&self, user_id: UserId) -> Result<()> {
        for d in self
            .dests
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|d| d.user_id == user_id)
        {
            d.is_active = false;
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryRepo for MemStore {
    async fn find(
        &self,
        user_id: UserId,
        source_id: i64,
        original: MessageId,
    ) -> Result<Option<DeliveryRecord>> {
        Ok(self
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                r.user_id == user_id && r.source_id == source_id && r.original_msg_id == original
            })
            .cloned())
    }

    async fn open(
        &self,
        user_id: UserId,
        source_id: i64,
        destination_id: Option<i64>,
        original: MessageId,
    ) -> Result<i64> {
        let mut rows = self.deliveries.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|r| {
            r.user_id == user_id && r.source_id == source_id && r.original_msg_id == original
        }) {
            row.status = DeliveryStatus::Pending;
            row.destination_id = destination_id;
            row.error = None;
            row.will_retry = true;
            row.completed_at = None;
            return Ok(row.id);
        }

        let id = 1 + self.next_delivery_id.fetch_add(1, Ordering::SeqCst);
        rows.push(DeliveryRecord {
            id,
            user_id,
            source_id,
            destination_id,
            original_msg_id: original,
            forwarded_msg_id: None,
            status: DeliveryStatus::Pending,
            error: None,
            will_retry: true,
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
        });
        Ok(id)
    }

    async fn mark_success(&self, record_id: i64, forwarded: MessageId) -> Result<()> {
        if let Some(row) = self
            .deliveries
            .lock()
            .unwrap()
            .iter_mut()
            .find(|r| r.id == record_id)
        {
            row.status = DeliveryStatus::Success;
            row.forwarded_msg_id = Some(forwarded);
            row.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, record_id: i64, error: &str, will_retry: bool) -> Result<()> {
        if let Some(row) = self
            .deliveries
            .lock()
            .unwrap()
            .iter_mut()
            .find(|r| r.id == record_id)
        {
            row.status = DeliveryStatus::Failed;
            row.error = Some(error.to_string());
            row.will_retry = will_retry;
            row.completed_at = Some(Utc::now());
            if will_retry {
                row.retry_count += 1;
            }
        }
        Ok(())
    }

    async fn stats(&self, user_id: UserId, window_hours: i64) -> Result<DeliveryStats> {
        let cutoff = Utc::now() - ChronoDuration::hours(window_hours);
        let mut stats = DeliveryStats::default();
        for row in self
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.created_at >= cutoff)
        {
            match row.status {
                DeliveryStatus::Success => stats.success += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Pending => stats.pending += 1,
            }
        }
        Ok(stats)
    }

    async fn last_success(&self, user_id: UserId) -> Result<Option<chrono::DateTime<Utc>>> {
        Ok(self
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.status == DeliveryStatus::Success)
            .filter_map(|r| r.completed_at)
            .max())
    }

    async fn due_retries(&self, max_retries: i64, limit: i64) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.status == DeliveryStatus::Failed && r.will_retry && r.retry_count < max_retries
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
