//! Egress: takes a normalised unit (single post or ordered album),
//! resolves the owning source, dedups, filters, and performs the send
//! through one of the two egress paths.
//!
//! Everything for one user is serialised through a per-user mutex, and
//! the send pace is bounded by a cooperative gate that also absorbs
//! upstream flood waits.

use std::{
    collections::HashMap,
    sync::{atomic::AtomicI64, atomic::Ordering, Arc},
    time::Duration,
};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{
    botapi::{BotApi, DmMedia, Notifier},
    config::Config,
    domain::{AlbumPart, ChannelPost, ChatId, MessageId, MessageKind, UserId},
    errors::Error,
    filter::FilterEngine,
    ident,
    ledger::DeliveryLedger,
    mtproto::MtProto,
    repo::{Destination, SourceRepo},
    Result,
};

const DM_TEXT_LIMIT: usize = 4096;
const DM_CAPTION_LIMIT: usize = 1024;

/// Where a user's posts go.
pub enum Egress {
    Channel(Destination),
    DirectMessage(UserId),
}

/// Per-source runtime state shared by the ingestor and the dispatcher.
pub struct SourceState {
    pub id: i64,
    pub wire_chat_id: ChatId,
    /// Highest message id fully processed (sent or deliberately dropped).
    pub high_water: AtomicI64,
}

impl SourceState {
    fn advance(&self, msg_id: MessageId) {
        self.high_water.fetch_max(msg_id.0, Ordering::SeqCst);
    }
}

/// Source lookup by chat id, accepting both the raw configured id and
/// the resolved wire id.
#[derive(Default)]
pub struct SourceTable {
    by_chat: HashMap<i64, Arc<SourceState>>,
    states: Vec<Arc<SourceState>>,
}

impl SourceTable {
    pub fn insert(&mut self, state: Arc<SourceState>, accepted_ids: &[ChatId]) {
        for id in accepted_ids {
            self.by_chat.insert(id.0, state.clone());
        }
        self.by_chat.insert(state.wire_chat_id.0, state.clone());
        self.states.push(state);
    }

    pub fn resolve(&self, chat: ChatId) -> Option<Arc<SourceState>> {
        self.by_chat
            .get(&chat.0)
            .or_else(|| self.by_chat.get(&ident::to_wire_id(chat.0).0))
            .cloned()
    }

    pub fn accepts(&self, chat: ChatId) -> bool {
        self.resolve(chat).is_some()
    }

    pub fn states(&self) -> &[Arc<SourceState>] {
        &self.states
    }
}

struct GateState {
    next_allowed: Instant,
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    user_id: UserId,
    egress: Egress,
    sources: Arc<SourceTable>,
    filter: Arc<FilterEngine>,
    ledger: Arc<DeliveryLedger>,
    source_repo: Arc<dyn SourceRepo>,
    mt: Arc<dyn MtProto>,
    bot: Arc<dyn BotApi>,
    notifier: Arc<dyn Notifier>,
    serial: Mutex<()>,
    gate: Mutex<GateState>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        user_id: UserId,
        egress: Egress,
        sources: Arc<SourceTable>,
        filter: Arc<FilterEngine>,
        ledger: Arc<DeliveryLedger>,
        source_repo: Arc<dyn SourceRepo>,
        mt: Arc<dyn MtProto>,
        bot: Arc<dyn BotApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cfg,
            user_id,
            egress,
            sources,
            filter,
            ledger,
            source_repo,
            mt,
            bot,
            notifier,
            serial: Mutex::new(()),
            gate: Mutex::new(GateState {
                next_allowed: Instant::now(),
            }),
        }
    }

    /// Dispatch one unit: a single post (`batch.len() == 1`) or an album
    /// already sorted ascending by message id.
    pub async fn dispatch(&self, batch: Vec<ChannelPost>) {
        if batch.is_empty() {
            return;
        }
        let _serial = self.serial.lock().await;
        if let Err(e) = self.dispatch_inner(&batch).await {
            warn!(
                user_id = self.user_id.0,
                msg_id = batch[0].msg_id.0,
                error = %e,
                "dispatch bookkeeping failed"
            );
        }
    }

    async fn dispatch_inner(&self, batch: &[ChannelPost]) -> Result<()> {
        let first = &batch[0];
        let max_id = batch
            .iter()
            .map(|m| m.msg_id)
            .max()
            .unwrap_or(first.msg_id);

        let Some(source) = self.sources.resolve(first.chat_id) else {
            debug!(chat_id = first.chat_id.0, "post from unmonitored chat");
            return Ok(());
        };

        if self
            .ledger
            .is_duplicate(self.user_id, source.id, first.msg_id)
            .await?
        {
            debug!(msg_id = first.msg_id.0, "duplicate skipped");
            source.advance(max_id);
            return Ok(());
        }

        if !self.filter.passes(first.text.as_deref()) {
            info!(
                user_id = self.user_id.0,
                msg_id = first.msg_id.0,
                "post blocked by keyword filter"
            );
            source.advance(max_id);
            return Ok(());
        }

        let destination_id = match &self.egress {
            Egress::Channel(dest) => Some(dest.id),
            Egress::DirectMessage(_) => None,
        };
        let record = self
            .ledger
            .open(self.user_id, source.id, destination_id, first.msg_id)
            .await?;

        self.wait_turn().await;

        let outcome = if batch.len() > 1 {
            self.send_album(batch).await
        } else {
            self.send_single(first).await
        };

        match outcome {
            Ok(forwarded) => {
                self.ledger.mark_success(record, forwarded).await?;
                source.advance(max_id);
                self.source_repo.advance_high_water(source.id, max_id).await?;
                info!(
                    user_id = self.user_id.0,
                    source_id = source.id,
                    msg_id = first.msg_id.0,
                    forwarded = forwarded.0,
                    count = batch.len(),
                    "forwarded"
                );
            }
            Err(Error::RateLimited { retry_after }) => {
                self.ledger
                    .mark_failed(record, &format!("rate limited for {retry_after}s"), true)
                    .await?;
                warn!(
                    user_id = self.user_id.0,
                    retry_after, "flood wait, pausing dispatcher"
                );
                self.pause_for(retry_after).await;
            }
            Err(e) => {
                self.ledger.mark_failed(record, &e.to_string(), false).await?;
                warn!(user_id = self.user_id.0, msg_id = first.msg_id.0, error = %e, "forward failed");
                self.notifier
                    .notify(self.user_id, &format!("Forwarding failed: {e}"))
                    .await;
            }
        }

        Ok(())
    }

    // ── Egress paths ───────────────────────────────────────────────────

    async fn send_single(&self, post: &ChannelPost) -> Result<MessageId> {
        match &self.egress {
            Egress::Channel(dest) => match post.kind {
                MessageKind::Poll => {
                    let poll = post
                        .poll
                        .as_ref()
                        .ok_or_else(|| Error::Internal("poll post without poll data".to_string()))?;
                    self.mt.send_poll(dest.channel_id, poll).await
                }
                _ => {
                    self.mt
                        .copy_message(dest.channel_id, post.chat_id, post.msg_id)
                        .await
                }
            },
            Egress::DirectMessage(user) => self.send_single_dm(*user, post).await,
        }
    }

    async fn send_album(&self, batch: &[ChannelPost]) -> Result<MessageId> {
        match &self.egress {
            Egress::Channel(dest) => {
                let parts: Vec<AlbumPart> = batch
                    .iter()
                    .filter(|m| m.kind.album_eligible())
                    .enumerate()
                    .map(|(i, m)| AlbumPart {
                        msg_id: m.msg_id,
                        kind: m.kind,
                        // Caption and entities ride on the first item only.
                        caption: if i == 0 { m.text.clone() } else { None },
                        entities: if i == 0 { m.entities.clone() } else { None },
                    })
                    .collect();

                if parts.is_empty() {
                    return Err(Error::Permanent(
                        "album has no forwardable media".to_string(),
                    ));
                }

                let ids = self
                    .mt
                    .send_album(dest.channel_id, batch[0].chat_id, &parts)
                    .await?;
                ids.first().copied().ok_or_else(|| {
                    Error::Internal("album send returned no message ids".to_string())
                })
            }
            Egress::DirectMessage(user) => self.send_album_dm(*user, batch).await,
        }
    }

    // ── DM fallback ────────────────────────────────────────────────────

    async fn send_single_dm(&self, user: UserId, post: &ChannelPost) -> Result<MessageId> {
        let chat = ChatId(user.0);
        let header = dm_header(post);

        match post.kind {
            MessageKind::Text => {
                let body = post.text.as_deref().unwrap_or("");
                let text = format!("{header}\n\n{}", escape_html(body));
                self.bot
                    .send_html(chat, &truncate_html(&text, DM_TEXT_LIMIT))
                    .await
            }
            MessageKind::Poll => {
                let text = render_poll(&header, post);
                self.bot
                    .send_html(chat, &truncate_html(&text, DM_TEXT_LIMIT))
                    .await
            }
            MessageKind::Location => {
                let text = match &post.location {
                    Some(p) => format!("{header}\n\n📍 {:.6}, {:.6}", p.latitude, p.longitude),
                    None => format!("{header}\n\n📍 Location"),
                };
                self.bot.send_html(chat, &text).await
            }
            MessageKind::Contact => {
                let text = match &post.contact {
                    Some(c) => {
                        let mut name = c.first_name.clone();
                        if let Some(last) = &c.last_name {
                            name.push(' ');
                            name.push_str(last);
                        }
                        format!(
                            "{header}\n\n👤 {} — {}",
                            escape_html(&name),
                            escape_html(&c.phone_number)
                        )
                    }
                    None => format!("{header}\n\n👤 Contact"),
                };
                self.bot.send_html(chat, &text).await
            }
            kind if kind.has_media() => {
                let size = post.file_size.unwrap_or(0);
                if size > self.cfg.dm_max_media_bytes() {
                    let text = format!("{header}\n\n{}", oversize_note(size, &self.cfg));
                    return self.bot.send_html(chat, &text).await;
                }

                let bytes = self.mt.download_media(post.chat_id, post.msg_id).await?;
                let caption = dm_caption(&header, post.text.as_deref());
                self.bot
                    .send_media(
                        chat,
                        DmMedia {
                            kind: post.kind,
                            bytes,
                            file_name: post.file_name.clone(),
                        },
                        Some(&caption),
                    )
                    .await
            }
            _ => {
                let text = format!(
                    "{header}\n\nThis post type cannot be delivered as a direct message."
                );
                self.bot.send_html(chat, &text).await
            }
        }
    }

    async fn send_album_dm(&self, user: UserId, batch: &[ChannelPost]) -> Result<MessageId> {
        let chat = ChatId(user.0);
        let first = &batch[0];
        let header = dm_header(first);

        let items: Vec<&ChannelPost> = batch.iter().filter(|m| m.kind.album_eligible()).collect();
        if items.is_empty() {
            return Err(Error::Permanent(
                "album has no forwardable media".to_string(),
            ));
        }

        let max_bytes = self.cfg.dm_max_media_bytes();
        let total: u64 = items.iter().map(|m| m.file_size.unwrap_or(0)).sum();
        let oversized = items
            .iter()
            .any(|m| m.file_size.unwrap_or(0) > max_bytes)
            || total > max_bytes;
        if oversized {
            let text = format!("{header}\n\n{}", oversize_note(total, &self.cfg));
            return self.bot.send_html(chat, &text).await;
        }

        let mut media = Vec::with_capacity(items.len());
        for item in &items {
            let bytes = self.mt.download_media(item.chat_id, item.msg_id).await?;
            media.push(DmMedia {
                kind: item.kind,
                bytes,
                file_name: item.file_name.clone(),
            });
        }

        let caption = dm_caption(&header, first.text.as_deref());
        self.bot.send_media_group(chat, media, Some(&caption)).await
    }

    // ── Cooperative pacing gate ────────────────────────────────────────

    /// Reserve the next send slot; waits out both the steady-state pace
    /// and any flood cooldown set by [`Dispatcher::pause_for`].
    async fn wait_turn(&self) {
        let interval =
            Duration::from_secs_f64(1.0 / f64::from(self.cfg.max_messages_per_second));
        let wait = {
            let mut gate = self.gate.lock().await;
            let now = Instant::now();
            let start = if now >= gate.next_allowed {
                now
            } else {
                gate.next_allowed
            };
            gate.next_allowed = start + interval;
            start.saturating_duration_since(now)
        };
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }

    async fn pause_for(&self, retry_after: u64) {
        let delay = Duration::from_secs_f64(retry_after as f64 * self.cfg.flood_wait_multiplier);
        let mut gate = self.gate.lock().await;
        let until = Instant::now() + delay;
        if until > gate.next_allowed {
            gate.next_allowed = until;
        }
    }
}

// ── DM formatting helpers ──────────────────────────────────────────────

pub(crate) fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn dm_header(post: &ChannelPost) -> String {
    format!(
        "📢 <b>{}</b> • <a href=\"{}\">Original</a>",
        escape_html(post.title()),
        post.link()
    )
}

fn dm_caption(header: &str, text: Option<&str>) -> String {
    let caption = match text.filter(|t| !t.is_empty()) {
        Some(t) => format!("{header}\n\n{}", escape_html(t)),
        None => header.to_string(),
    };
    truncate_html(&caption, DM_CAPTION_LIMIT)
}

fn truncate_html(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn oversize_note(size: u64, cfg: &Config) -> String {
    format!(
        "Media omitted: {:.1} MB exceeds the {} MB direct-message limit.",
        size as f64 / (1024.0 * 1024.0),
        cfg.dm_max_media_size_mb
    )
}

fn render_poll(header: &str, post: &ChannelPost) -> String {
    let Some(poll) = &post.poll else {
        return format!("{header}\n\n📊 Poll");
    };
    let mut out = format!("{header}\n\n📊 <b>{}</b>", escape_html(&poll.question));
    for option in &poll.options {
        out.push_str("\n• ");
        out.push_str(&escape_html(option));
    }
    out
}
