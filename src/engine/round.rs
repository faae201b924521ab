//! Round lifecycle (§4.9): start, the BETTING→RUNNING transition (handled
//! in `tick.rs` since it is time-driven), end, and cancel. Every terminal
//! transition releases the round lock on every exit path, including
//! early-return error paths, mirroring the teacher's consistent
//! lock-then-defer-unlock discipline in `vault::pool`.

use super::EngineActor;
use crate::errors::EngineError;
use crate::models::{GameState, Round, RoundStatus};
use crate::protocol::{EventTarget, RoundEndPayload, RoundStartPayload, ServerEvent};
use crate::settlement;
use chrono::Utc;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const ROUND_LOCK_TTL: Duration = Duration::from_secs(300);
const SETTLEMENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const SNAPSHOT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

impl EngineActor {
    /// Starts a new round on the engine's configured asset. A round already
    /// in flight, or an unavailable price feed, both fail closed.
    pub async fn start_round(&mut self) -> Result<String, EngineError> {
        if self.state.is_some() {
            return Err(EngineError::InvalidRequest("a round is already active".into()));
        }

        let asset = self.deps.config.asset.clone();
        let token = self
            .deps
            .locks
            .acquire_round_lock(&asset, ROUND_LOCK_TTL)
            .ok_or(EngineError::InvalidRequest("round lock already held".into()))?;

        let start_price = match self.deps.cache.get_latest_price(&asset) {
            Some((price, _)) => price,
            None => {
                self.deps.locks.release_round_lock(&asset, &token);
                return Err(EngineError::PriceUnavailable);
            }
        };

        self.deps
            .house_pool
            .initialize(&asset, Decimal::try_from(self.deps.config.house_pool_initial_balance).unwrap_or_default())
            .await
            .map_err(EngineError::Internal)?;

        let round_id = Uuid::new_v4().to_string();
        let round_start_time_ms = Self::now_ms();

        let round = Round {
            id: round_id.clone(),
            asset: asset.clone(),
            status: RoundStatus::Betting,
            start_price,
            end_price: None,
            started_at: Utc::now(),
            ended_at: None,
            total_bets: 0,
            total_volume: Decimal::ZERO,
            total_payout: Decimal::ZERO,
        };

        if let Err(err) = self.deps.store.insert_round(&round).await {
            self.deps.locks.release_round_lock(&asset, &token);
            return Err(EngineError::Internal(err));
        }

        self.state = Some(GameState::new(round_id.clone(), asset.clone(), start_price, round_start_time_ms));
        self.heap = super::bet_heap::BetHeap::new();
        self.round_lock_token = Some(token);
        self.last_state_update_emit_ms = 0;
        self.last_snapshot_elapsed = -1.0;

        info!(round_id, asset, %start_price, "round started");
        self.deps.broadcast(ServerEvent::RoundStart(RoundStartPayload {
            round_id: round_id.clone(),
            asset,
            start_price,
            betting_duration_secs: self.deps.config.betting_duration.as_secs_f64(),
            max_duration_secs: self.deps.config.max_duration.as_secs_f64(),
        }));

        Ok(round_id)
    }

    /// Ends a round normally (target duration reached). Sets `Settling`
    /// in-memory first so concurrent admissions see `BettingClosed`
    /// immediately, then drains the remaining heap, flushes settlement and
    /// snapshots, runs the compensation sweep, and finalizes the row.
    pub async fn end_round(&mut self, reason: &str) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if state.status.is_terminal() {
            return;
        }
        state.status = RoundStatus::Settling;
        let round_id = state.round_id.clone();
        let asset = state.asset.clone();
        let final_row = state.current_row;
        let final_price = state.current_price;
        let total_bets_remaining = state.active_bets.len();

        info!(round_id, reason, total_bets_remaining, "ending round");

        let _ = self
            .deps
            .store
            .conditional_update_round_status(&round_id, RoundStatus::Running, RoundStatus::Settling)
            .await;

        // Every bet still tracked in memory gets a final verdict against
        // the closing row rather than waiting on a heap entry that may
        // never become due again.
        let remaining: Vec<_> = self.state.as_mut().unwrap().active_bets.drain().collect();
        for (order_id, active) in remaining {
            let hit = (final_row - active.target_row).abs() <= self.deps.config.hit_tolerance_rows;
            self.deps.risk.release_expected_payout(&round_id, &order_id);
            self.deps.settlement.enqueue(crate::settlement::SettlementItem::new(
                order_id,
                hit,
                hit.then_some(crate::models::HitDetails {
                    hit_price: final_price,
                    hit_row: final_row,
                    hit_time: active.target_time,
                }),
            ));
        }

        settlement::flush_queue(&self.deps.settlement, SETTLEMENT_FLUSH_TIMEOUT).await;
        crate::engine::snapshots::flush_all(
            &self.deps.snapshots,
            &self.deps.store,
            self.deps.config.snapshot_batch_size,
            SNAPSHOT_FLUSH_TIMEOUT,
        )
        .await;
        settlement::run_compensation_sweep(&self.deps, &round_id, final_row, final_price).await;
        self.deps.risk.clear_round(&round_id);

        let (total_bets, total_volume, total_payout) = self.round_totals(&round_id).await;
        if let Err(err) = self
            .deps
            .store
            .finalize_round(&round_id, final_price, total_bets, total_volume, total_payout)
            .await
        {
            error!(error = %err, round_id, "failed to finalize round row");
        }
        let _ = self
            .deps
            .store
            .conditional_update_round_status(&round_id, RoundStatus::Settling, RoundStatus::Completed)
            .await;

        self.deps.broadcast(ServerEvent::RoundEnd(RoundEndPayload {
            round_id: round_id.clone(),
            reason: reason.to_string(),
            end_price: Some(final_price),
        }));

        if let Some(token) = self.round_lock_token.take() {
            self.deps.locks.release_round_lock(&asset, &token);
        }
        self.state = None;
        info!(round_id, "round ended and lock released");
    }

    /// Cancels a round outright (e.g. the price feed went dark). Every
    /// pending/settling bet is refunded rather than settled against a row
    /// the game never actually produced.
    pub async fn cancel_round(&mut self, reason: &str) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if state.status.is_terminal() {
            return;
        }
        state.status = RoundStatus::Settling;
        let round_id = state.round_id.clone();
        let asset = state.asset.clone();

        warn!(round_id, reason, "cancelling round");

        let active_order_ids: Vec<String> = self.state.as_ref().unwrap().active_bets.keys().cloned().collect();
        for order_id in active_order_ids {
            if let Err(err) = self.refund(&order_id).await {
                warn!(error = %err, order_id, "refund during round cancellation failed");
            }
        }

        settlement::flush_queue(&self.deps.settlement, SETTLEMENT_FLUSH_TIMEOUT).await;
        self.deps.risk.clear_round(&round_id);

        if let Err(err) = self
            .deps
            .store
            .conditional_update_round_status(&round_id, RoundStatus::Settling, RoundStatus::Cancelled)
            .await
        {
            error!(error = %err, round_id, "failed to mark round cancelled");
        }

        self.deps.broadcast(ServerEvent::RoundCancelled {
            round_id: round_id.clone(),
            reason: reason.to_string(),
        });

        if let Some(token) = self.round_lock_token.take() {
            self.deps.locks.release_round_lock(&asset, &token);
        }
        self.state = None;
        info!(round_id, "round cancelled and lock released");
    }

    async fn round_totals(&self, round_id: &str) -> (i64, Decimal, Decimal) {
        let won = self
            .deps
            .store
            .list_bets_by_status(round_id, crate::models::BetStatus::Won)
            .await
            .unwrap_or_default();
        let lost = self
            .deps
            .store
            .list_bets_by_status(round_id, crate::models::BetStatus::Lost)
            .await
            .unwrap_or_default();
        let total_bets = (won.len() + lost.len()) as i64;
        let total_volume = won.iter().chain(lost.iter()).map(|b| b.amount).sum();
        let total_payout = won.iter().map(|b| b.payout).sum();
        (total_bets, total_volume, total_payout)
    }
}
