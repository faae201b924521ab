//! End-to-end admission -> tick -> settlement scenarios (S1-S6), run
//! against `InProcessCache` + `SqliteStore::in_memory()` with a real
//! engine actor. Mirrors `tests/backtest_run_integration.rs`'s placement
//! of full-pipeline tests outside any single module's `#[cfg(test)]`
//! block.

use crash_row_engine::config::Config;
use crash_row_engine::engine::{self, EngineDeps, PlaceBetRequest};
use crash_row_engine::ledger::{FinancialLedger, HousePoolLedger};
use crash_row_engine::locks::{CacheStore, InProcessCache, LockService};
use crash_row_engine::models::{BetStatus, TransactionType};
use crash_row_engine::protocol::{EventTarget, RoutedEvent, ServerEvent};
use crash_row_engine::risk::RiskManager;
use crash_row_engine::settlement;
use crash_row_engine::store::{SqliteStore, Store};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One asset, a fast tick so tests don't wait on wall-clock minutes, a
/// short betting/max duration, and a generous house pool so admission
/// isn't incidentally denied by the payout cap.
fn test_config() -> Config {
    Config {
        database_path: ":memory:".into(),
        port: 0,
        jwt_secret: "test-secret".into(),
        asset: "BTC-USD".into(),
        betting_duration: Duration::from_millis(150),
        max_duration: Duration::from_secs(5),
        min_bet_amount: 1.0,
        max_bet_amount: 1000.0,
        max_bets_per_user: 10,
        max_bets_per_second: 50,
        hit_tolerance_rows: 0.4,
        tick_interval: Duration::from_millis(10),
        max_active_bets: 1000,
        snapshot_buffer_capacity: 1000,
        snapshot_batch_size: 100,
        snapshot_retry_backoff_min_ms: 50,
        snapshot_retry_backoff_max_ms: 500,
        rate_limit_window: Duration::from_secs(1),
        house_pool_initial_balance: 10_000.0,
        max_round_payout_ratio: 0.5,
        max_round_payout_cap: 50_000.0,
        price_feed_url: "wss://example.invalid/ws".into(),
        origin_allowlist: vec!["*".into()],
        history_limit: 200,
    }
}

struct Harness {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheStore>,
    engine: engine::GameEngineHandle,
    events: tokio::sync::broadcast::Receiver<RoutedEvent>,
}

async fn spin_up(config: Config) -> Harness {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let cache: Arc<dyn CacheStore> = Arc::new(InProcessCache::new());
    let config = Arc::new(config);

    let locks = LockService::new(cache.clone());
    let risk = RiskManager::new(
        cache.clone(),
        Decimal::try_from(config.max_round_payout_cap).unwrap(),
        config.max_round_payout_ratio,
    );
    let house_pool = HousePoolLedger::new(store.clone());
    let snapshots = Arc::new(engine::snapshots::SnapshotBuffer::new(config.snapshot_buffer_capacity));
    let (events_tx, events_rx) = tokio::sync::broadcast::channel(256);

    let settlement_handle = settlement::spawn(
        store.clone(),
        events_tx.clone(),
        config.snapshot_batch_size,
    );

    let deps = EngineDeps {
        store: store.clone(),
        cache: cache.clone(),
        locks,
        risk,
        ledger: FinancialLedger::new(store.clone()),
        house_pool,
        snapshots,
        settlement: settlement_handle,
        events: events_tx,
        config,
    };
    let engine = engine::spawn(deps);

    Harness { store, cache, engine, events: events_rx }
}

async fn seed_user(store: &Arc<dyn Store>, user_id: &str, balance: Decimal) {
    store
        .change_balance(user_id, balance, TransactionType::Deposit, false, None, None)
        .await
        .unwrap();
}

async fn wait_for_bet_status(store: &Arc<dyn Store>, order_id: &str, status: BetStatus, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(bet)) = store.get_bet_by_order_id(order_id).await {
            if bet.status == status {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S1 - Normal win: price lands on the target row at the target time, the
/// bet settles WON with a rounded-to-cents payout, and the balance
/// reflects stake-out/payout-in.
#[tokio::test]
async fn s1_normal_win_settles_and_credits_balance() {
    let h = spin_up(test_config()).await;
    let start_price = dec!(100);
    h.cache.set_latest_price("BTC-USD", start_price, Instant::now());
    seed_user(&h.store, "u1", dec!(100)).await;

    h.engine.start_round().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await; // clear BETTING -> RUNNING

    let outcome = h
        .engine
        .place_bet(PlaceBetRequest {
            order_id: "a1".into(),
            user_id: "u1".into(),
            target_row: 6.5,
            target_time: 1.0,
            amount: dec!(10),
            is_play_mode: false,
        })
        .await
        .expect("bet should be admitted");
    assert!(outcome.multiplier > 1.01 && outcome.multiplier <= 100.0);

    // Row stays centered on 6.5 (price unchanged) so the bet lands a hit
    // once its target_time elapses.
    let settled = wait_for_bet_status(&h.store, "a1", BetStatus::Won, Duration::from_secs(3)).await;
    assert!(settled, "bet should settle as WON");

    let bet = h.store.get_bet_by_order_id("a1").await.unwrap().unwrap();
    assert!(bet.payout > Decimal::ZERO);

    let user = h.store.get_user("u1").await.unwrap().unwrap();
    // balance = 100 - 10 (stake) + payout
    assert_eq!(user.balance, dec!(100) - dec!(10) + bet.payout);
}

/// S2 - Miss: price moves far enough from the target row that the bet
/// never hits, and it settles LOST with a zero payout and untouched
/// balance beyond the stake.
#[tokio::test]
async fn s2_missed_bet_settles_lost_without_payout() {
    let h = spin_up(test_config()).await;
    let start_price = dec!(100);
    h.cache.set_latest_price("BTC-USD", start_price, Instant::now());
    seed_user(&h.store, "u2", dec!(100)).await;

    h.engine.start_round().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Target row far from the current (centered) row: a bet on row 0 will
    // never be hit while price stays flat at start_price (row 6.5).
    h.engine
        .place_bet(PlaceBetRequest {
            order_id: "a2".into(),
            user_id: "u2".into(),
            target_row: 0.0,
            target_time: 1.0,
            amount: dec!(10),
            is_play_mode: false,
        })
        .await
        .unwrap();

    let settled = wait_for_bet_status(&h.store, "a2", BetStatus::Lost, Duration::from_secs(3)).await;
    assert!(settled, "bet should settle as LOST");

    let bet = h.store.get_bet_by_order_id("a2").await.unwrap().unwrap();
    assert_eq!(bet.payout, Decimal::ZERO);

    let user = h.store.get_user("u2").await.unwrap().unwrap();
    assert_eq!(user.balance, dec!(100) - dec!(10));
}

/// S3 - Duplicate order id: a same-user replay of an already-admitted
/// orderId is an idempotent no-op that returns the original bet's fields
/// (§4.10 step 11), while a different user on the same orderId is a real
/// collision and is rejected.
#[tokio::test]
async fn s3_duplicate_order_id_is_rejected() {
    let h = spin_up(test_config()).await;
    h.cache.set_latest_price("BTC-USD", dec!(100), Instant::now());
    seed_user(&h.store, "u3", dec!(100)).await;
    seed_user(&h.store, "u3b", dec!(100)).await;

    h.engine.start_round().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let req = PlaceBetRequest {
        order_id: "dup1".into(),
        user_id: "u3".into(),
        target_row: 6.5,
        target_time: 3.0,
        amount: dec!(5),
        is_play_mode: false,
    };
    let first = h.engine.place_bet(req.clone()).await.unwrap();

    // Same user, same order_id: idempotent replay, not a rejection.
    let replay = h.engine.place_bet(req).await.unwrap();
    assert_eq!(replay.bet_id, first.bet_id);
    assert_eq!(replay.multiplier, first.multiplier);

    // Only one stake was ever debited.
    let user = h.store.get_user("u3").await.unwrap().unwrap();
    assert_eq!(user.balance, dec!(100) - dec!(5));

    // Different user, same order_id: genuine collision.
    let err = h
        .engine
        .place_bet(PlaceBetRequest {
            order_id: "dup1".into(),
            user_id: "u3b".into(),
            target_row: 6.5,
            target_time: 3.0,
            amount: dec!(5),
            is_play_mode: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), crash_row_engine::ErrorCode::DuplicateBet);
}

/// S4 - Insufficient balance: a bet larger than the user's balance is
/// rejected and no stake is ever debited.
#[tokio::test]
async fn s4_insufficient_balance_is_rejected() {
    let h = spin_up(test_config()).await;
    h.cache.set_latest_price("BTC-USD", dec!(100), Instant::now());
    seed_user(&h.store, "u4", dec!(5)).await;

    h.engine.start_round().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = h
        .engine
        .place_bet(PlaceBetRequest {
            order_id: "a4".into(),
            user_id: "u4".into(),
            target_row: 6.5,
            target_time: 3.0,
            amount: dec!(10),
            is_play_mode: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), crash_row_engine::ErrorCode::InsufficientBalance);

    let user = h.store.get_user("u4").await.unwrap().unwrap();
    assert_eq!(user.balance, dec!(5));
}

/// S5 - Round cancellation: every pending bet is refunded and
/// `round:cancelled` is broadcast. Invokes `cancel_round` directly (what
/// the tick loop's price-staleness check schedules) rather than waiting
/// out the real `PRICE_CRITICAL_SECS` threshold, since the behavior under
/// test is the refund fan-out, not the elapsed-time comparison itself.
#[tokio::test]
async fn s5_round_cancellation_refunds_pending_bets() {
    let mut h = spin_up(test_config()).await;
    h.cache.set_latest_price("BTC-USD", dec!(100), Instant::now());
    seed_user(&h.store, "u5", dec!(100)).await;

    h.engine.start_round().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    h.engine
        .place_bet(PlaceBetRequest {
            order_id: "a5".into(),
            user_id: "u5".into(),
            target_row: 6.5,
            target_time: 3.0,
            amount: dec!(10),
            is_play_mode: false,
        })
        .await
        .unwrap();

    h.engine.cancel_round("price_unavailable").await;

    let refunded = wait_for_bet_status(&h.store, "a5", BetStatus::Refunded, Duration::from_secs(2)).await;
    assert!(refunded, "bet should be refunded on round cancellation");

    let user = h.store.get_user("u5").await.unwrap().unwrap();
    assert_eq!(user.balance, dec!(100), "stake should be fully returned");

    let mut saw_cancelled = false;
    while let Ok(routed) = h.events.try_recv() {
        if matches!(routed.target, EventTarget::Broadcast)
            && matches!(routed.event, ServerEvent::RoundCancelled { .. })
        {
            saw_cancelled = true;
        }
    }
    assert!(saw_cancelled, "round:cancelled should have been broadcast");
}

/// S6 - Engine restart mid-round: a bet stuck at PENDING (as if the
/// process died after insert but before its heap entry was ever drained)
/// is still resolved by the compensation sweep using the end-of-round
/// price/row, with no double-settlement on a second sweep pass.
#[tokio::test]
async fn s6_compensation_sweep_resolves_stragglers_exactly_once() {
    let config = Arc::new(test_config());
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let cache: Arc<dyn CacheStore> = Arc::new(InProcessCache::new());
    let (events_tx, mut events_rx) = tokio::sync::broadcast::channel(64);

    seed_user(&store, "u6", dec!(100)).await;
    let round = crash_row_engine::models::Round {
        id: "r6".into(),
        asset: "BTC-USD".into(),
        status: crash_row_engine::models::RoundStatus::Settling,
        start_price: dec!(100),
        end_price: None,
        started_at: chrono::Utc::now(),
        ended_at: None,
        total_bets: 0,
        total_volume: Decimal::ZERO,
        total_payout: Decimal::ZERO,
    };
    store.insert_round(&round).await.unwrap();

    let bet = crash_row_engine::models::Bet {
        id: "b6".into(),
        order_id: "a6".into(),
        user_id: "u6".into(),
        round_id: "r6".into(),
        amount: dec!(10),
        multiplier: 2.0,
        target_row: 6.5,
        target_time: 2.0,
        asset: "BTC-USD".into(),
        is_play_mode: false,
        status: BetStatus::Pending,
        payout: Decimal::ZERO,
        hit_price: None,
        hit_row: None,
        hit_time: None,
        created_at: chrono::Utc::now(),
        settled_at: None,
    };
    store.insert_bet(&bet).await.unwrap();
    // The debit that admission would have performed before the process
    // died, so the post-sweep balance assertion below is meaningful.
    store
        .conditional_change_balance(
            "u6",
            -bet.amount,
            bet.amount,
            TransactionType::Bet,
            false,
            Some(&bet.id),
            Some("stake debit"),
        )
        .await
        .unwrap()
        .unwrap();

    let locks = LockService::new(cache.clone());
    let risk = RiskManager::new(cache.clone(), dec!(50000), 0.5);
    let house_pool = HousePoolLedger::new(store.clone());
    let snapshots = Arc::new(engine::snapshots::SnapshotBuffer::new(100));
    let settlement_handle = settlement::spawn(
        store.clone(),
        events_tx.clone(),
        50,
    );
    let deps = EngineDeps {
        store: store.clone(),
        cache,
        locks,
        risk,
        ledger: FinancialLedger::new(store.clone()),
        house_pool,
        snapshots,
        settlement: settlement_handle,
        events: events_tx,
        config,
    };

    // Row 6.5 at the final price matches the bet's target row exactly, so
    // the sweep should resolve it WON.
    settlement::run_compensation_sweep(&deps, "r6", 6.5, dec!(100)).await;

    let settled = wait_for_bet_status(&store, "a6", BetStatus::Won, Duration::from_secs(2)).await;
    assert!(settled);
    let settled_bet = store.get_bet_by_order_id("a6").await.unwrap().unwrap();
    assert!(settled_bet.payout > Decimal::ZERO);

    let routed = tokio::time::timeout(Duration::from_millis(500), events_rx.recv())
        .await
        .expect("bet:settled within timeout")
        .unwrap();
    match routed.event {
        ServerEvent::BetSettled(payload) => assert_eq!(payload.order_id, "a6"),
        other => panic!("expected BetSettled, got {other:?}"),
    }

    // A second sweep pass over the same round must not find the bet again
    // (it's no longer PENDING/SETTLING) and must not double-credit it.
    settlement::run_compensation_sweep(&deps, "r6", 6.5, dec!(100)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let user = store.get_user("u6").await.unwrap().unwrap();
    assert_eq!(user.balance, dec!(100) - dec!(10) + settled_bet.payout);
}

/// §9's resolved ambiguity: bets are admitted iff DB `rounds.status =
/// BETTING`, not while RUNNING too. Once the round clears the betting
/// window, further admissions must see `BettingClosed`.
#[tokio::test]
async fn betting_closes_once_round_is_running() {
    let h = spin_up(test_config()).await;
    h.cache.set_latest_price("BTC-USD", dec!(100), Instant::now());
    seed_user(&h.store, "u7", dec!(100)).await;

    h.engine.start_round().await.unwrap();
    // test_config's betting_duration is 150ms; wait well past it so the
    // tick loop has flipped the round to RUNNING.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = h
        .engine
        .place_bet(PlaceBetRequest {
            order_id: "a7".into(),
            user_id: "u7".into(),
            target_row: 6.5,
            target_time: 4.0,
            amount: dec!(10),
            is_play_mode: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), crash_row_engine::ErrorCode::BettingClosed);

    let user = h.store.get_user("u7").await.unwrap().unwrap();
    assert_eq!(user.balance, dec!(100), "no stake should be taken for a rejected bet");
}
