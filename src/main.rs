use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

use venue_bridge::Config;
use venue_bridge::correlation::Correlator;
use venue_bridge::execution::{EngineDeps, TradeEngine};
use venue_bridge::hub::StreamHub;
use venue_bridge::hub::session::SessionServer;
use venue_bridge::mirror::Mirror;
use venue_bridge::store::audit::TracingAudit;
use venue_bridge::store::{MemoryAccountStore, MemoryCopyTradeStore, MemorySymbolStore, MemoryTradeStore};
use venue_bridge::transport::{ConnectionRegistry, Dispatcher, MessageKind, VenueServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Config first: it carries the fallback log filter
    let config_path = Config::default_path();
    let (config, load_error) = Config::load_or_default(&config_path);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},venue_bridge=debug", config.app.log_level)));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 Venue Bridge starting...");
    match load_error {
        None => tracing::info!("📋 Loaded config from {}", config_path.display()),
        Some(e) => tracing::warn!("⚠️ {} ({}), using defaults", e, config_path.display()),
    }

    // 2. Stores and shared state
    let accounts = Arc::new(MemoryAccountStore::default());
    let trades = Arc::new(MemoryTradeStore::default());
    let symbols = Arc::new(MemorySymbolStore::default());
    let copy_trades = Arc::new(MemoryCopyTradeStore::default());
    let audit = Arc::new(TracingAudit);
    let registry = Arc::new(ConnectionRegistry::new());
    let correlator = Arc::new(Correlator::new());

    let (hub, publisher) = StreamHub::new(&config.stream);
    let subscribers = hub.subscribers();
    tokio::spawn(hub.run());

    // 3. Engine, with successful direct placements feeding the mirror
    let (leaders_tx, leaders_rx) = flume::unbounded();
    let engine = Arc::new(
        TradeEngine::new(
            EngineDeps {
                accounts: accounts.clone(),
                trades,
                symbols,
                audit: audit.clone(),
                venue: registry.clone(),
                correlator: correlator.clone(),
                hub: publisher,
            },
            &config.trading,
        )
        .with_mirror(leaders_tx),
    );

    let mirror = Arc::new(Mirror::new(engine.clone(), accounts, copy_trades, audit));
    tokio::spawn(mirror.run(leaders_rx));

    // 4. Venue server
    let mut dispatcher = Dispatcher::new();
    dispatcher.register_all(&MessageKind::APPLICATION_INBOUND, engine.clone());
    let venue = VenueServer::bind(config.venue.clone(), registry.clone(), dispatcher, correlator).await?;

    // 5. Client streaming sessions
    let sessions = SessionServer::bind(&config.stream, subscribers).await?;
    tokio::spawn(sessions.run());

    // 6. Periodic housekeeping
    let sweeper = engine.clone();
    let sweep_every = Duration::from_secs(config.trading.expiry_sweep_secs.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_every);
        loop {
            tick.tick().await;
            match sweeper.sweep_expired() {
                Ok(0) => {}
                Ok(n) => tracing::info!("⌛ Expired {} pending trade(s)", n),
                Err(e) => tracing::error!("expiry sweep failed: {}", e),
            }
        }
    });

    let reconciler = engine.clone();
    let reconcile_every = Duration::from_secs(config.trading.reconcile_interval_secs.max(1));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(reconcile_every);
        loop {
            tick.tick().await;
            if registry.is_empty() {
                continue;
            }
            if let Err(e) = reconciler.request_all_order_streams() {
                tracing::error!("reconciliation round failed: {}", e);
            }
        }
    });

    tracing::info!("⏳ Bridge up. Waiting for venue terminals...");

    // 7. Serve until ctrl-c
    let shutdown = venue.registry();
    tokio::select! {
        _ = venue.run() => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!("signal handler failed: {}", e);
            }
        }
    }

    tracing::info!("👋 Disconnecting {} venue connection(s)", shutdown.len());
    shutdown.disconnect_all("server shutdown");
    // let writers flush the disconnect notices
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
