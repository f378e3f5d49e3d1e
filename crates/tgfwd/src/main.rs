use std::sync::Arc;

use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tgfwd_core::{
    config::Config,
    crypto::CryptoBox,
    filter::FilterEngine,
    ledger::DeliveryLedger,
    monitor::SessionMonitor,
    mtproto::ClientRegistry,
    retry::RetryWorker,
    session_store::SessionStore,
    supervisor::ForwarderSupervisor,
};
use tgfwd_mtproto::{BridgeConfig, BridgeConnector};
use tgfwd_storage::SqliteStore;
use tgfwd_telegram::{TelegramEgress, TelegramNotifier};

#[tokio::main]
async fn main() -> Result<(), tgfwd_core::Error> {
    let cfg = Arc::new(Config::load()?);
    tgfwd_core::logging::init(&cfg);

    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);

    let bot = Bot::new(cfg.bot_token.clone());
    let egress = Arc::new(TelegramEgress::new(bot.clone()));
    let notifier = Arc::new(TelegramNotifier::new(bot));

    let connector = Arc::new(BridgeConnector::new(BridgeConfig {
        command: cfg.mtproto_bridge_cmd.clone(),
        api_id: cfg.api_id,
        api_hash: cfg.api_hash.clone(),
    }));
    let registry = Arc::new(ClientRegistry::new(connector.clone()));

    let session_store = Arc::new(SessionStore::new(
        CryptoBox::new(&cfg.session_encryption_key),
        store.clone(),
        connector,
    ));
    let ledger = Arc::new(DeliveryLedger::new(store.clone()));
    let filter = Arc::new(FilterEngine::new(
        &cfg.filter_keywords,
        cfg.filter_mode,
        cfg.filter_case_sensitive,
    )?);

    let supervisor = ForwarderSupervisor::new(
        cfg.clone(),
        registry,
        session_store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        ledger.clone(),
        filter,
        egress,
        notifier.clone(),
    );
    supervisor.bootstrap().await;

    let shutdown = CancellationToken::new();

    let monitor = SessionMonitor::new(
        session_store,
        store.clone(),
        notifier,
        cfg.session_check_interval,
    );
    tokio::spawn(monitor.run(shutdown.clone()));

    let retry = RetryWorker::new(cfg.clone(), ledger, store, supervisor.clone());
    tokio::spawn(retry.run(shutdown.clone()));

    info!("relay is up");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    shutdown.cancel();
    supervisor.shutdown().await;
    Ok(())
}
