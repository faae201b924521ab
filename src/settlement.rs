//! SettlementQueue (§4.7): off-hot-path bet settlement.
//!
//! The tick loop only classifies a bet as hit/miss and hands the verdict
//! off through an unbounded channel — it never waits on the database.
//! Grounded on `settlement_engine.rs`'s channel-producer /
//! batch-drain-consumer split (`enqueue_bet_fast` / background batch
//! flush / bounded retry queue with backoff), adapted from its
//! `sqlx`-over-Postgres shape to our `Store` trait and from its
//! fire-and-forget batch result to per-bet conditional settlement plus a
//! per-user ledger credit.

use crate::engine::EngineDeps;
use crate::models::{BetStatus, HitDetails};
use crate::protocol::{BetSettledPayload, EventTarget, ServerEvent};
use crate::store::Store;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 3;

/// One settled verdict handed off by the tick loop, identified by the
/// order id the bet was admitted under (§4.8 step "classify").
#[derive(Debug, Clone)]
pub struct SettlementItem {
    pub order_id: String,
    pub is_win: bool,
    pub hit: Option<HitDetails>,
    pub retry_count: u32,
}

impl SettlementItem {
    pub fn new(order_id: impl Into<String>, is_win: bool, hit: Option<HitDetails>) -> Self {
        Self {
            order_id: order_id.into(),
            is_win,
            hit,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SettlementStats {
    pub total_settled: u64,
    pub total_won: u64,
    pub total_lost: u64,
    pub total_failed: u64,
    pub retry_queue_size: usize,
}

/// Cloneable producer handle; the gateway/engine never talks to the
/// background task directly.
#[derive(Clone)]
pub struct SettlementQueueHandle {
    tx: mpsc::UnboundedSender<SettlementItem>,
    stats: Arc<RwLock<SettlementStats>>,
}

impl SettlementQueueHandle {
    /// Instant, non-blocking enqueue — the only thing the tick loop calls.
    pub fn enqueue(&self, item: SettlementItem) {
        if self.tx.send(item).is_err() {
            error!("settlement queue is closed, bet settlement dropped");
        }
    }

    pub fn stats(&self) -> SettlementStats {
        self.stats.read().clone()
    }
}

struct Worker {
    store: Arc<dyn Store>,
    stats: Arc<RwLock<SettlementStats>>,
    retry_queue: Mutex<VecDeque<SettlementItem>>,
}

impl Worker {
    async fn settle_one(
        &self,
        item: &SettlementItem,
        events: &tokio::sync::broadcast::Sender<crate::protocol::RoutedEvent>,
    ) -> anyhow::Result<()> {
        let Some(bet) = self.store.get_bet_by_order_id(&item.order_id).await? else {
            // The bet row vanished (should not happen outside tests); not
            // retryable.
            error!(order_id = %item.order_id, "settlement item has no matching bet row");
            return Ok(());
        };

        let to_status = if item.is_win { BetStatus::Won } else { BetStatus::Lost };
        let payout = if item.is_win {
            (bet.amount * Decimal::try_from(bet.multiplier).unwrap_or(Decimal::ONE)).round_dp(2)
        } else {
            Decimal::ZERO
        };

        // Bets reach here straight from `pending` (the tick loop never
        // writes `settling` to the DB on the hot path); `settle_bet_and_credit`
        // additionally tolerates a `settling` row so a compensation-sweep
        // retry of an in-flight settlement still lands exactly once. The
        // status flip and its paired financial effect (balance credit,
        // ledger row, win/loss stat) commit in one transaction, so a
        // mid-sequence failure can't strand a credit behind an already-
        // terminal bet row.
        let changed = self
            .store
            .settle_bet_and_credit(&bet, to_status, payout, item.hit)
            .await?;
        if !changed {
            // Already settled by a previous attempt, a retry, or a
            // compensation sweep that beat us to it.
            debug!(bet_id = %bet.id, "bet already settled, skipping");
            return Ok(());
        }

        {
            let mut stats = self.stats.write();
            stats.total_settled += 1;
            if item.is_win {
                stats.total_won += 1;
            } else {
                stats.total_lost += 1;
            }
        }

        let _ = events.send(crate::protocol::RoutedEvent {
            target: EventTarget::User(bet.user_id.clone()),
            event: ServerEvent::BetSettled(BetSettledPayload {
                order_id: bet.order_id.clone(),
                status: to_status,
                payout,
                hit_row: item.hit.map(|h| h.hit_row),
                hit_price: item.hit.map(|h| h.hit_price),
                hit_time: item.hit.map(|h| h.hit_time),
            }),
        });

        Ok(())
    }

    async fn drain_retry_candidates(&self, max: usize) -> Vec<SettlementItem> {
        let mut queue = self.retry_queue.lock().await;
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    async fn requeue_for_retry(&self, mut item: SettlementItem) {
        item.retry_count += 1;
        if item.retry_count > MAX_RETRIES {
            let mut stats = self.stats.write();
            stats.total_failed += 1;
            error!(order_id = %item.order_id, "bet settlement permanently failed after max retries");
            return;
        }
        self.retry_queue.lock().await.push_back(item);
    }
}

/// Spawns the settlement background task. Returns the handle the tick loop
/// holds; the worker drains both fresh items and retries on every batch
/// tick, mirroring `settlement_engine.rs`'s retry-queue-first ordering.
pub fn spawn(
    store: Arc<dyn Store>,
    events: tokio::sync::broadcast::Sender<crate::protocol::RoutedEvent>,
    batch_size: usize,
) -> SettlementQueueHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<SettlementItem>();
    let stats = Arc::new(RwLock::new(SettlementStats::default()));
    let worker = Arc::new(Worker {
        store,
        stats: stats.clone(),
        retry_queue: Mutex::new(VecDeque::new()),
    });

    {
        let worker = worker.clone();
        tokio::spawn(async move {
            let mut batch_interval = tokio::time::interval(Duration::from_millis(25));
            loop {
                tokio::select! {
                    maybe_item = rx.recv() => {
                        match maybe_item {
                            Some(item) => {
                                if let Err(err) = worker.settle_one(&item, &events).await {
                                    warn!(error = %err, order_id = %item.order_id, "settlement attempt failed, queuing retry");
                                    worker.requeue_for_retry(item).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = batch_interval.tick() => {
                        let retries = worker.drain_retry_candidates(batch_size).await;
                        for item in retries {
                            if let Err(err) = worker.settle_one(&item, &events).await {
                                warn!(error = %err, order_id = %item.order_id, "settlement retry failed");
                                worker.requeue_for_retry(item).await;
                            }
                        }
                        worker.stats.write().retry_queue_size = worker.retry_queue.lock().await.len();
                    }
                }
            }
            info!("settlement queue channel closed, worker exiting");
        });
    }

    SettlementQueueHandle { tx, stats }
}

/// Spin-waits (bounded by `timeout`) until the retry queue shows nothing
/// outstanding — used at round end before the final compensation sweep
/// (§4.9 `endRound`). Items still in the unbounded channel itself are not
/// observable from here, so callers schedule the compensation sweep after
/// this returns, as a backstop rather than a guarantee.
pub async fn flush_queue(handle: &SettlementQueueHandle, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if handle.stats().retry_queue_size == 0 || tokio::time::Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Resolves any bet still `Pending`/`Settling` for a round once the round
/// itself has ended, using the final price/row as the verdict — covers
/// restarts and heap entries dropped mid-tick (§4.9, §8 scenario "engine
/// restart mid-round").
pub async fn run_compensation_sweep(deps: &EngineDeps, round_id: &str, final_row: f64, final_price: Decimal) {
    let pending = match deps.store.list_bets_by_status(round_id, BetStatus::Pending).await {
        Ok(bets) => bets,
        Err(err) => {
            error!(error = %err, round_id, "compensation sweep failed to list pending bets");
            return;
        }
    };
    let settling = match deps.store.list_bets_by_status(round_id, BetStatus::Settling).await {
        Ok(bets) => bets,
        Err(err) => {
            error!(error = %err, round_id, "compensation sweep failed to list settling bets");
            Vec::new()
        }
    };

    for bet in pending.into_iter().chain(settling.into_iter()) {
        let hit = (bet.target_row - final_row).abs() <= deps.config.hit_tolerance_rows;
        let item = SettlementItem::new(
            bet.order_id.clone(),
            hit,
            hit.then_some(HitDetails {
                hit_price: final_price,
                hit_row: final_row,
                hit_time: bet.target_time,
            }),
        );
        deps.settlement.enqueue(item);
        warn!(bet_id = %bet.id, round_id, "compensation sweep resolved straggling bet");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bet, BetStatus};
    use crate::store::SqliteStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_bet(id: &str, order_id: &str) -> Bet {
        Bet {
            id: id.to_string(),
            order_id: order_id.to_string(),
            user_id: "u1".to_string(),
            round_id: "r1".to_string(),
            amount: dec!(10),
            multiplier: 2.0,
            target_row: 6.5,
            target_time: 5.0,
            asset: "BTC-USD".to_string(),
            is_play_mode: false,
            status: BetStatus::Settling,
            payout: dec!(0),
            hit_price: None,
            hit_row: None,
            hit_time: None,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    #[tokio::test]
    async fn settling_a_win_credits_the_user_and_emits_bet_settled() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bet = sample_bet("b1", "o1");
        store.insert_bet(&bet).await.unwrap();

        let (events_tx, mut events_rx) = tokio::sync::broadcast::channel(16);
        let handle = spawn(store.clone(), events_tx, 50);

        handle.enqueue(SettlementItem::new("o1", true, None));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = store.get_bet_by_order_id("o1").await.unwrap().unwrap();
        assert_eq!(stored.status, BetStatus::Won);

        let routed = tokio::time::timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .expect("event within timeout")
            .unwrap();
        matches!(routed.event, ServerEvent::BetSettled(_));
    }

    #[tokio::test]
    async fn settling_a_loss_leaves_balance_untouched_and_records_stat() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let bet = sample_bet("b2", "o2");
        store.insert_bet(&bet).await.unwrap();

        let (events_tx, _events_rx) = tokio::sync::broadcast::channel(16);
        let handle = spawn(store.clone(), events_tx, 50);

        handle.enqueue(SettlementItem::new("o2", false, None));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stored = store.get_bet_by_order_id("o2").await.unwrap().unwrap();
        assert_eq!(stored.status, BetStatus::Lost);
        assert_eq!(stored.payout, dec!(0));
    }
}
