//! Composition root: wires config, store, cache, and every engine
//! collaborator together, then runs the round supervisor and the HTTP/ws
//! server side by side. Grounded on `main.rs`'s `async fn main` — load
//! env, init tracing, construct state, build the router, `axum::serve`.

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use crash_row_engine::auth::JwtHandler;
use crash_row_engine::config::Config;
use crash_row_engine::engine::price_feed::{PriceFeed, PriceFeedEvent};
use crash_row_engine::engine::{self, EngineDeps};
use crash_row_engine::gateway::{self, GatewayState};
use crash_row_engine::ledger::{FinancialLedger, HousePoolLedger};
use crash_row_engine::locks::{CacheStore, InProcessCache, LockService};
use crash_row_engine::risk::RiskManager;
use crash_row_engine::settlement;
use crash_row_engine::store::{SqliteStore, Store};
use crash_row_engine::telemetry;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    let config = Arc::new(Config::from_env().context("loading configuration")?);
    info!(asset = %config.asset, port = config.port, "starting crash-row engine");

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::new(&config.database_path).context("opening sqlite store")?,
    );
    let cache: Arc<dyn CacheStore> = Arc::new(InProcessCache::new());
    let locks = LockService::new(cache.clone());
    let risk = RiskManager::new(
        cache.clone(),
        Decimal::try_from(config.max_round_payout_cap).unwrap_or_default(),
        config.max_round_payout_ratio,
    );
    let house_pool = HousePoolLedger::new(store.clone());
    let snapshots = Arc::new(engine::snapshots::SnapshotBuffer::new(config.snapshot_buffer_capacity));

    let (events_tx, _events_rx) = tokio::sync::broadcast::channel(4096);

    let settlement_handle = settlement::spawn(
        store.clone(),
        events_tx.clone(),
        config.snapshot_batch_size,
    );
    let ledger = FinancialLedger::new(store.clone());

    // The shutdown sender is never signalled; held here only so the
    // channel stays open (dropping it would close the receiver and stop
    // the flush loop) for the process's lifetime, since `main` never
    // returns before `axum::serve` does.
    let (_snapshot_shutdown_tx, snapshot_shutdown_rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(engine::snapshots::run_flush_loop(
        snapshots.clone(),
        store.clone(),
        config.snapshot_batch_size,
        std::time::Duration::from_millis(config.snapshot_retry_backoff_min_ms),
        std::time::Duration::from_millis(config.snapshot_retry_backoff_max_ms),
        snapshot_shutdown_rx,
    ));

    let (price_feed, mut price_feed_events) =
        PriceFeed::new(config.asset.clone(), config.price_feed_url.clone(), cache.clone());
    price_feed.start();

    let engine_deps = EngineDeps {
        store: store.clone(),
        cache: cache.clone(),
        locks,
        risk,
        ledger,
        house_pool,
        snapshots,
        settlement: settlement_handle,
        events: events_tx.clone(),
        config: config.clone(),
    };
    let engine_handle = engine::spawn(engine_deps);

    tokio::spawn(run_round_supervisor(engine_handle.clone()));

    {
        let engine_handle = engine_handle.clone();
        tokio::spawn(async move {
            loop {
                match price_feed_events.recv().await {
                    Ok(PriceFeedEvent::Critical) => {
                        warn!("price feed critical, cancelling active round");
                        engine_handle.cancel_round("price_unavailable").await;
                    }
                    Ok(PriceFeedEvent::CriticalFailure) => {
                        error!("price feed exhausted reconnect attempts, cancelling active round");
                        engine_handle.cancel_round("price_feed_failure").await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let gateway_state = GatewayState {
        engine: engine_handle,
        events: events_tx,
        store,
        jwt,
        config: config.clone(),
    };

    let cors = if config.origin_allowlist.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .origin_allowlist
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(gateway::router(gateway_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("binding listener")?;
    info!(addr, "gateway listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

/// Keeps a round continuously in flight: start one, wait for it to reach a
/// terminal state (the engine clears `GameState` on completion/
/// cancellation), then start the next after a short pause. There is
/// exactly one engine per asset per process, so no coordination with other
/// processes is needed here (round-lock TTL already guards against two
/// processes racing on the same asset).
async fn run_round_supervisor(engine: engine::GameEngineHandle) {
    loop {
        match engine.start_round().await {
            Ok(round_id) => info!(round_id, "round supervisor started a new round"),
            Err(err) => {
                warn!(error = %err, "round supervisor failed to start round, retrying shortly");
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            if engine.state_snapshot().await.is_none() {
                break;
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}
