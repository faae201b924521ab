//! Bet admission and refund (§4.10, §4.11): the synchronous validation
//! chain followed by a single DB round-trip, run to completion before the
//! next command the actor dequeues — this ordering, not a lock, is what
//! makes two concurrent `placeBet`s for the same order id impossible.

use super::EngineActor;
use crate::config::MIN_TARGET_TIME_OFFSET_SECS;
use crate::engine::multiplier::compute_multiplier;
use crate::errors::EngineError;
use crate::models::{ActiveBet, Bet, BetStatus, RoundStatus};
use crate::protocol::{BetConfirmedPayload, BetRefundedPayload, EventTarget, ServerEvent};
use crate::risk::RiskManager;
use chrono::Utc;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

const BET_LOCK_TTL: Duration = Duration::from_secs(5);
const RESERVATION_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct PlaceBetRequest {
    pub order_id: String,
    pub user_id: String,
    pub target_row: f64,
    pub target_time: f64,
    pub amount: Decimal,
    pub is_play_mode: bool,
}

#[derive(Debug, Clone)]
pub struct PlaceBetOutcome {
    pub bet_id: String,
    pub order_id: String,
    pub multiplier: f64,
    pub target_row: f64,
    pub target_time: f64,
    pub new_balance: Decimal,
}

impl EngineActor {
    pub async fn place_bet(
        &mut self,
        req: PlaceBetRequest,
    ) -> Result<PlaceBetOutcome, EngineError> {
        if req.order_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("order_id must not be empty".into()));
        }

        let state = self
            .state
            .as_ref()
            .ok_or(EngineError::NoActiveRound)?;
        if state.status != RoundStatus::Betting {
            return Err(EngineError::BettingClosed);
        }

        let round_id = state.round_id.clone();
        let asset = state.asset.clone();
        let current_row = state.current_row;
        let elapsed = state.elapsed;

        if state.active_bets.len() >= self.deps.config.max_active_bets {
            return Err(EngineError::MaxBetsReached);
        }

        if !self.deps.cache.record_and_check_rate(
            &req.user_id,
            self.deps.config.rate_limit_window,
            self.deps.config.max_bets_per_second,
        ) {
            return Err(EngineError::RateLimited);
        }

        let remaining_time = req.target_time - elapsed;
        if remaining_time < MIN_TARGET_TIME_OFFSET_SECS
            || req.target_time > self.deps.config.max_duration.as_secs_f64()
        {
            return Err(EngineError::TargetTimePassed);
        }

        if req.amount < Decimal::try_from(self.deps.config.min_bet_amount).unwrap_or_default()
            || req.amount > Decimal::try_from(self.deps.config.max_bet_amount).unwrap_or_default()
        {
            return Err(EngineError::InvalidAmount(format!(
                "amount must be between {} and {}",
                self.deps.config.min_bet_amount, self.deps.config.max_bet_amount
            )));
        }

        if !(0.0..=crate::config::MAX_ROW_INDEX).contains(&req.target_row) {
            return Err(EngineError::InvalidRequest("target_row out of range".into()));
        }

        let pending_count = state.pending_by_user.get(&req.user_id).copied().unwrap_or(0);
        if pending_count >= self.deps.config.max_bets_per_user {
            return Err(EngineError::MaxBetsReached);
        }

        // Anonymous sessions carry no ledger/house-pool identity (§9); real
        // money flows are only ever in scope for an authenticated user.
        if crate::models::User::is_anonymous(&req.user_id) && !req.is_play_mode {
            return Err(EngineError::Unauthorized);
        }

        if let Some(user) = self
            .deps
            .store
            .get_user(&req.user_id)
            .await
            .map_err(EngineError::Internal)?
        {
            if !user.active {
                return Err(EngineError::UserBanned);
            }
            if user.silenced && !req.is_play_mode {
                return Err(EngineError::UserSilenced);
            }
        } else if !req.is_play_mode {
            return Err(EngineError::UserNotFound);
        }

        // Idempotency fast path (§4.10 step 11): a previously accepted
        // order_id placed by this same user is a replay, not a conflict —
        // return the original bet's fields rather than re-admitting it. A
        // different user on the same order_id is a genuine collision.
        if let Some(existing) = self
            .deps
            .store
            .get_bet_by_order_id(&req.order_id)
            .await
            .map_err(EngineError::Internal)?
        {
            if existing.user_id != req.user_id {
                return Err(EngineError::DuplicateBet);
            }
            let new_balance = match self.deps.store.get_user(&existing.user_id).await.map_err(EngineError::Internal)? {
                Some(user) if existing.is_play_mode => user.play_balance,
                Some(user) => user.balance,
                None => Decimal::ZERO,
            };
            return Ok(PlaceBetOutcome {
                bet_id: existing.id,
                order_id: existing.order_id,
                multiplier: existing.multiplier,
                target_row: existing.target_row,
                target_time: existing.target_time,
                new_balance,
            });
        }

        let multiplier = compute_multiplier(current_row, req.target_row, remaining_time);

        // Best-effort: bet-lock contention never blocks an otherwise-valid
        // admission (§4.10 step 12). DB uniqueness on order_id remains the
        // true authority; the lock only reduces duplicate work in the race.
        let bet_lock_token = self.deps.locks.acquire_bet_lock(&req.order_id, BET_LOCK_TTL);

        let result = self.place_bet_locked(&req, &round_id, &asset, multiplier).await;

        if let Some(token) = &bet_lock_token {
            self.deps.locks.release_bet_lock(&req.order_id, token);
        }
        if result.is_err() && !req.is_play_mode {
            self.deps.risk.release_expected_payout(&round_id, &req.order_id);
        }
        result
    }

    async fn place_bet_locked(
        &mut self,
        req: &PlaceBetRequest,
        round_id: &str,
        asset: &str,
        multiplier: f64,
    ) -> Result<PlaceBetOutcome, EngineError> {
        // Risk reservation only guards real-money liability (§4.10 step 13:
        // "(real mode)"); play-mode bets never touch the house pool's cap.
        if !req.is_play_mode {
            let expected_net_payout = RiskManager::expected_net_payout(req.amount, multiplier);
            let pool_balance = self
                .deps
                .house_pool
                .get_balance(asset)
                .await
                .map_err(EngineError::Internal)?;
            let max_round_payout = self.deps.risk.max_round_payout(pool_balance);
            if !self.deps.risk.reserve_expected_payout(
                round_id,
                &req.order_id,
                expected_net_payout,
                max_round_payout,
                RESERVATION_TTL,
            ) {
                return Err(EngineError::MaxBetsReached);
            }
        }

        // Defends against the round having transitioned out from under us
        // between admission's read and this write (engine restart race).
        // Spec §9: bets are admitted iff DB rounds.status = BETTING.
        match self.deps.store.get_round(round_id).await.map_err(EngineError::Internal)? {
            Some(round) if round.status == RoundStatus::Betting => {}
            _ => return Err(EngineError::BettingClosed),
        }

        let bet = Bet {
            id: Uuid::new_v4().to_string(),
            order_id: req.order_id.clone(),
            user_id: req.user_id.clone(),
            round_id: round_id.to_string(),
            amount: req.amount,
            multiplier,
            target_row: req.target_row,
            target_time: req.target_time,
            asset: asset.to_string(),
            is_play_mode: req.is_play_mode,
            status: BetStatus::Pending,
            payout: Decimal::ZERO,
            hit_price: None,
            hit_row: None,
            hit_time: None,
            created_at: Utc::now(),
            settled_at: None,
        };

        // Debit before the row ever exists: if the stake can't be taken,
        // nothing is left behind for a later compensation sweep to find and
        // mistakenly pay out.
        let debit = self
            .deps
            .ledger
            .debit_stake(&req.user_id, req.amount, req.is_play_mode, &bet.id)
            .await?;

        self.deps
            .store
            .insert_bet(&bet)
            .await
            .map_err(EngineError::Internal)?;

        if !req.is_play_mode {
            if let Err(err) = self.deps.house_pool.apply_delta(asset, req.amount).await {
                warn!(error = %err, asset, "house pool credit failed after stake debit");
            }
        }

        let _ = self.deps.store.record_bet_stat(&req.user_id).await;

        self.state.as_mut().unwrap().active_bets.insert(
            bet.order_id.clone(),
            ActiveBet {
                order_id: bet.order_id.clone(),
                user_id: bet.user_id.clone(),
                round_id: bet.round_id.clone(),
                amount: bet.amount,
                multiplier: bet.multiplier,
                target_row: bet.target_row,
                target_time: bet.target_time,
                is_play_mode: bet.is_play_mode,
            },
        );
        self.heap.push(bet.order_id.clone(), bet.target_time);
        *self
            .state
            .as_mut()
            .unwrap()
            .pending_by_user
            .entry(req.user_id.clone())
            .or_insert(0) += 1;

        self.deps.emit(
            EventTarget::User(req.user_id.clone()),
            ServerEvent::BetConfirmed(BetConfirmedPayload {
                order_id: bet.order_id.clone(),
                bet_id: bet.id.clone(),
                multiplier,
                target_row: bet.target_row,
                target_time: bet.target_time,
                new_balance: debit.balance_after,
            }),
        );

        Ok(PlaceBetOutcome {
            bet_id: bet.id,
            order_id: bet.order_id,
            multiplier,
            target_row: bet.target_row,
            target_time: bet.target_time,
            new_balance: debit.balance_after,
        })
    }

    /// Refunds a still-pending bet (§4.11): used for user-initiated
    /// cancellation before target time and for round cancellation cleanup.
    pub async fn refund(&mut self, order_id: &str) -> Result<(), EngineError> {
        let Some(state) = self.state.as_mut() else {
            return Err(EngineError::NoActiveRound);
        };
        let Some(active) = state.active_bets.remove(order_id) else {
            return Err(EngineError::RoundNotFound);
        };
        if let Some(count) = state.pending_by_user.get_mut(&active.user_id) {
            *count = count.saturating_sub(1);
        }

        let bet = self
            .deps
            .store
            .get_bet_by_order_id(order_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or(EngineError::RoundNotFound)?;

        let refunded = self
            .deps
            .store
            .refund_bet(&bet.id)
            .await
            .map_err(EngineError::Internal)?;
        if !refunded {
            return Err(EngineError::DuplicateBet);
        }

        self.deps
            .ledger
            .credit_refund(&active.user_id, active.amount, active.is_play_mode, &bet.id)
            .await
            .map_err(EngineError::Internal)?;

        if !active.is_play_mode {
            if let Err(err) = self.deps.house_pool.apply_delta(&bet.asset, -active.amount).await {
                warn!(error = %err, "house pool debit failed during refund");
            }
        }

        self.deps.risk.release_expected_payout(&active.round_id, order_id);

        self.deps.emit(
            EventTarget::User(active.user_id.clone()),
            ServerEvent::BetRefunded(BetRefundedPayload {
                order_id: order_id.to_string(),
                amount: active.amount,
            }),
        );

        Ok(())
    }
}
