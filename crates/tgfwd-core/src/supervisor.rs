//! Per-user forwarding lifecycle.
//!
//! Each running user is one actor: the MTProto client, the ingest loop
//! (subscription + fallback poller), the dispatcher serialiser, and the
//! high-water cache. The supervisor owns the user → actor map.

use std::{
    collections::HashMap,
    sync::{atomic::AtomicI64, Arc},
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    assembler::MediaGroupAssembler,
    botapi::{BotApi, Notifier},
    config::Config,
    dispatch::{Dispatcher, Egress, SourceState, SourceTable},
    domain::{MessageId, UserId, UserState},
    errors::Error,
    filter::FilterEngine,
    ident::ChannelRef,
    ingest::Ingestor,
    ledger::DeliveryLedger,
    mtproto::{ClientRegistry, MtProto},
    repo::{DestinationRepo, SourceRepo, UserRepo},
    session_store::SessionStore,
    Result,
};

struct UserActor {
    cancel: CancellationToken,
    subscription: u64,
    client: Arc<dyn MtProto>,
    dispatcher: Arc<Dispatcher>,
}

pub struct ForwarderSupervisor {
    cfg: Arc<Config>,
    registry: Arc<ClientRegistry>,
    store: Arc<SessionStore>,
    users: Arc<dyn UserRepo>,
    sources: Arc<dyn SourceRepo>,
    destinations: Arc<dyn DestinationRepo>,
    ledger: Arc<DeliveryLedger>,
    filter: Arc<FilterEngine>,
    bot: Arc<dyn BotApi>,
    notifier: Arc<dyn Notifier>,
    actors: Mutex<HashMap<UserId, UserActor>>,
}

impl ForwarderSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        registry: Arc<ClientRegistry>,
        store: Arc<SessionStore>,
        users: Arc<dyn UserRepo>,
        sources: Arc<dyn SourceRepo>,
        destinations: Arc<dyn DestinationRepo>,
        ledger: Arc<DeliveryLedger>,
        filter: Arc<FilterEngine>,
        bot: Arc<dyn BotApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry,
            store,
            users,
            sources,
            destinations,
            ledger,
            filter,
            bot,
            notifier,
            actors: Mutex::new(HashMap::new()),
        })
    }

    /// Start monitoring for a user. Idempotent restart: a running actor
    /// is stopped first so config changes take effect.
    pub async fn start(&self, user_id: UserId) -> Result<()> {
        self.stop(user_id).await;
        info!(user_id = user_id.0, "starting monitoring");

        let session = self
            .store
            .load(user_id)
            .await?
            .ok_or(Error::NoSession(user_id.0))?;
        let client = self.registry.get(user_id, Some(session)).await?;
        client.connect().await?;

        let sources = self
            .sources
            .by_user(user_id, true, self.cfg.max_sources_per_user, 0)
            .await?;
        if sources.is_empty() {
            return Err(Error::NotConfigured("no active sources".to_string()));
        }
        let destination = self.destinations.active_by_user(user_id).await?;
        let egress = match destination {
            Some(dest) => Egress::Channel(dest),
            None => Egress::DirectMessage(user_id),
        };

        let warmed = client.warm_peer_cache(200).await;
        info!(user_id = user_id.0, dialogs = warmed, "peer cache warmed");

        let mut table = SourceTable::default();
        for source in &sources {
            // The resolved wire id may differ from the configured one;
            // accept posts under either.
            let mut accepted = vec![source.channel_id];
            let wire_id = match client.resolve_chat(&ChannelRef::Id(source.channel_id)).await {
                Ok(desc) => {
                    accepted.push(desc.wire_id);
                    desc.wire_id
                }
                Err(e) => {
                    warn!(
                        user_id = user_id.0,
                        channel_id = source.channel_id.0,
                        error = %e,
                        "source resolution failed, using configured id"
                    );
                    source.channel_id
                }
            };

            // Baseline at the newest message so history is not replayed.
            let baseline = match client.fetch_history(wire_id, MessageId(0), 1).await {
                Ok(page) => page.first().map(|m| m.msg_id.0).unwrap_or(0),
                Err(e) => {
                    warn!(
                        user_id = user_id.0,
                        channel_id = wire_id.0,
                        error = %e,
                        "baseline fetch failed, falling back to stored mark"
                    );
                    source.high_water.0
                }
            };
            let mark = baseline.max(source.high_water.0);
            if mark > source.high_water.0 {
                let _ = self
                    .sources
                    .advance_high_water(source.id, MessageId(mark))
                    .await;
            }

            table.insert(
                Arc::new(SourceState {
                    id: source.id,
                    wire_chat_id: wire_id,
                    high_water: AtomicI64::new(mark),
                }),
                &accepted,
            );
        }
        let table = Arc::new(table);

        let dispatcher = Arc::new(Dispatcher::new(
            self.cfg.clone(),
            user_id,
            egress,
            table.clone(),
            self.filter.clone(),
            self.ledger.clone(),
            self.sources.clone(),
            client.clone(),
            self.bot.clone(),
            self.notifier.clone(),
        ));

        let dispatcher_for_albums = dispatcher.clone();
        let assembler = MediaGroupAssembler::new(
            self.cfg.media_group_timeout,
            Arc::new(move |batch| {
                let dispatcher = dispatcher_for_albums.clone();
                Box::pin(async move {
                    dispatcher.dispatch(batch).await;
                })
            }),
        );

        let ingestor = Ingestor::new(
            user_id,
            table,
            assembler,
            dispatcher.clone(),
            client.clone(),
            self.cfg.poll_interval,
            self.cfg.poll_page_size,
        );

        let subscription = client.subscribe(ingestor.handler()).await?;
        let cancel = CancellationToken::new();
        tokio::spawn(ingestor.clone().run_poller(cancel.clone()));

        self.users.set_state(user_id, UserState::Running).await?;
        self.actors.lock().await.insert(
            user_id,
            UserActor {
                cancel,
                subscription,
                client,
                dispatcher,
            },
        );

        info!(
            user_id = user_id.0,
            sources = sources.len(),
            "monitoring started"
        );
        Ok(())
    }

    /// Cancel the poller and drop the subscription. The client stays in
    /// the registry for reuse; in-flight dispatches run to completion.
    pub async fn stop(&self, user_id: UserId) {
        let actor = self.actors.lock().await.remove(&user_id);
        if let Some(actor) = actor {
            actor.cancel.cancel();
            let _ = actor.client.unsubscribe(actor.subscription).await;
            info!(user_id = user_id.0, "monitoring stopped");
        }
    }

    /// At process start: start every user with a valid session and at
    /// least one active source.
    pub async fn bootstrap(&self) {
        let with_session = match self.store.users_with_valid().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "bootstrap: session scan failed");
                return;
            }
        };
        let with_sources = match self.sources.users_with_active_sources().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "bootstrap: source scan failed");
                return;
            }
        };

        for user_id in with_session {
            if !with_sources.contains(&user_id) {
                continue;
            }
            if let Err(e) = self.start(user_id).await {
                warn!(user_id = user_id.0, error = %e, "bootstrap start failed");
            }
        }
    }

    pub async fn is_running(&self, user_id: UserId) -> bool {
        self.actors.lock().await.contains_key(&user_id)
    }

    pub async fn running_count(&self) -> usize {
        self.actors.lock().await.len()
    }

    /// Client and dispatcher of a running actor, for retry replays.
    pub async fn replay_context(
        &self,
        user_id: UserId,
    ) -> Option<(Arc<dyn MtProto>, Arc<Dispatcher>)> {
        self.actors
            .lock()
            .await
            .get(&user_id)
            .map(|actor| (actor.client.clone(), actor.dispatcher.clone()))
    }

    pub async fn shutdown(&self) {
        let users: Vec<UserId> = self.actors.lock().await.keys().copied().collect();
        for user_id in users {
            self.stop(user_id).await;
        }
        self.registry.close_all().await;
    }
}
