//! Per-user ingestion: an upstream subscription for instant delivery
//! plus a fixed-interval fallback poller over the configured sources.
//!
//! Both feeds funnel through the same handler: accepted-chat check,
//! classification, then either the media-group assembler or a direct
//! dispatch.

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    assembler::MediaGroupAssembler,
    dispatch::{Dispatcher, SourceTable},
    domain::{ChannelPost, MessageId, MessageKind, UserId},
    errors::Error,
    mtproto::{MtProto, PostHandler},
};

pub struct Ingestor {
    user_id: UserId,
    sources: Arc<SourceTable>,
    assembler: Arc<MediaGroupAssembler>,
    dispatcher: Arc<Dispatcher>,
    mt: Arc<dyn MtProto>,
    poll_interval: Duration,
    poll_page_size: u32,
}

impl Ingestor {
    pub fn new(
        user_id: UserId,
        sources: Arc<SourceTable>,
        assembler: Arc<MediaGroupAssembler>,
        dispatcher: Arc<Dispatcher>,
        mt: Arc<dyn MtProto>,
        poll_interval: Duration,
        poll_page_size: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            sources,
            assembler,
            dispatcher,
            mt,
            poll_interval,
            poll_page_size,
        })
    }

    /// Handler installed as the upstream subscription; the fallback
    /// poller feeds the same path.
    pub fn handler(self: &Arc<Self>) -> PostHandler {
        let this = self.clone();
        Arc::new(move |post: ChannelPost| {
            let this = this.clone();
            Box::pin(async move {
                this.handle(post).await;
            })
        })
    }

    async fn handle(&self, post: ChannelPost) {
        let Some(source) = self.sources.resolve(post.chat_id) else {
            debug!(
                user_id = self.user_id.0,
                chat_id = post.chat_id.0,
                "dropping post from unmonitored chat"
            );
            return;
        };

        if post.kind == MessageKind::Unsupported {
            debug!(
                user_id = self.user_id.0,
                msg_id = post.msg_id.0,
                "dropping unsupported post"
            );
            source.high_water.fetch_max(post.msg_id.0, Ordering::SeqCst);
            return;
        }

        if post.group_id.is_some() {
            self.assembler.add(post).await;
        } else {
            self.dispatcher.dispatch(vec![post]).await;
        }
    }

    /// Fixed-interval fallback loop; cancellation is checked at every
    /// sleep.
    pub async fn run_poller(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of `interval` fires immediately; consume it so
        // the initial cycle happens one full period after start.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.poll_once().await;
        }
        debug!(user_id = self.user_id.0, "fallback poller stopped");
    }

    /// One poll cycle: page every source forward from its high-water
    /// mark, replaying oldest-first through the shared handler.
    pub async fn poll_once(&self) {
        for state in self.sources.states() {
            let since = MessageId(state.high_water.load(Ordering::SeqCst));
            let page = match self
                .mt
                .fetch_history(state.wire_chat_id, since, self.poll_page_size)
                .await
            {
                Ok(page) => page,
                Err(Error::RateLimited { retry_after }) => {
                    warn!(
                        user_id = self.user_id.0,
                        retry_after, "history fetch rate limited, ending poll cycle"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        user_id = self.user_id.0,
                        chat_id = state.wire_chat_id.0,
                        error = %e,
                        "history fetch failed"
                    );
                    continue;
                }
            };

            // Pages arrive newest-first.
            for post in page.into_iter().rev() {
                if post.msg_id <= since {
                    continue;
                }
                self.handle(post).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::dispatch::{Egress, SourceState};
    use crate::domain::ChatId;
    use crate::filter::FilterEngine;
    use crate::ledger::DeliveryLedger;
    use crate::testutil::{chan_post, FakeBotApi, FakeMt, FakeNotifier, MemStore};
    use std::sync::atomic::AtomicI64;

    const CHAT: i64 = -1001234567890;

    fn rig() -> (Arc<Ingestor>, Arc<FakeMt>, Arc<MemStore>, Arc<SourceState>) {
        let cfg = Arc::new(test_config());
        let mem = Arc::new(MemStore::default());
        let seeded = mem.seed_source(UserId(1), ChatId(CHAT), "Test Channel");

        let state = Arc::new(SourceState {
            id: seeded.id,
            wire_chat_id: ChatId(CHAT),
            high_water: AtomicI64::new(100),
        });
        let mut table = SourceTable::default();
        table.insert(state.clone(), &[ChatId(CHAT)]);
        let table = Arc::new(table);

        let mt = Arc::new(FakeMt::default());
        let dispatcher = Arc::new(Dispatcher::new(
            cfg.clone(),
            UserId(1),
            Egress::DirectMessage(UserId(1)),
            table.clone(),
            Arc::new(FilterEngine::new(&[], cfg.filter_mode, false).unwrap()),
            Arc::new(DeliveryLedger::new(mem.clone())),
            mem.clone(),
            mt.clone(),
            Arc::new(FakeBotApi::default()),
            Arc::new(FakeNotifier::default()),
        ));

        let dispatcher_for_albums = dispatcher.clone();
        let assembler = MediaGroupAssembler::new(
            cfg.media_group_timeout,
            Arc::new(move |batch| {
                let dispatcher = dispatcher_for_albums.clone();
                Box::pin(async move {
                    dispatcher.dispatch(batch).await;
                })
            }),
        );

        let ingestor = Ingestor::new(
            UserId(1),
            table,
            assembler,
            dispatcher,
            mt.clone(),
            cfg.poll_interval,
            cfg.poll_page_size,
        );
        (ingestor, mt, mem, state)
    }

    #[tokio::test]
    async fn poller_replays_oldest_first_above_high_water() {
        let (ingestor, mt, mem, _state) = rig();
        mt.add_history(CHAT, chan_post(CHAT, 99, MessageKind::Text, Some("old")));
        mt.add_history(CHAT, chan_post(CHAT, 102, MessageKind::Text, Some("b")));
        mt.add_history(CHAT, chan_post(CHAT, 101, MessageKind::Text, Some("a")));

        ingestor.poll_once().await;

        let rows = mem.deliveries.lock().unwrap();
        assert_eq!(rows.len(), 2, "post 99 is below the baseline");
        assert_eq!(rows[0].original_msg_id.0, 101);
        assert_eq!(rows[1].original_msg_id.0, 102);
    }

    #[tokio::test]
    async fn poll_cycles_do_not_redeliver() {
        let (ingestor, mt, mem, _state) = rig();
        mt.add_history(CHAT, chan_post(CHAT, 101, MessageKind::Text, Some("a")));

        ingestor.poll_once().await;
        ingestor.poll_once().await;

        assert_eq!(mem.deliveries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handler_drops_unmonitored_and_unsupported() {
        let (ingestor, mt, mem, state) = rig();
        let handler = ingestor.handler();

        handler(chan_post(-1000000000042, 5, MessageKind::Text, Some("x"))).await;
        handler(chan_post(CHAT, 103, MessageKind::Unsupported, None)).await;
        let _ = mt;

        assert!(mem.deliveries.lock().unwrap().is_empty());
        assert_eq!(
            state.high_water.load(Ordering::SeqCst),
            103,
            "unsupported posts still advance the mark"
        );
    }

    #[tokio::test]
    async fn grouped_posts_flow_through_the_assembler() {
        let (ingestor, _mt, mem, _state) = rig();
        let handler = ingestor.handler();

        let mut a = chan_post(CHAT, 205, MessageKind::Photo, Some("cap"));
        a.group_id = Some("g".to_string());
        let mut b = chan_post(CHAT, 203, MessageKind::Photo, None);
        b.group_id = Some("g".to_string());
        handler(a).await;
        handler(b).await;

        // Not dispatched until the assembler window elapses.
        assert!(mem.deliveries.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let rows = mem.deliveries.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].original_msg_id.0, 203, "keyed by the lowest id");
    }
}
