//! The tick loop (§4.8): advances `elapsed`, maps the sampled price to a
//! row, and drains due bets off the `BetHeap` for settlement. Runs on a
//! fixed interval inside the actor's own task — never concurrently with
//! admission, because both go through the same command channel.

use super::{EngineActor, PendingRoundAction};
use crate::config::{HIT_TIME_TOLERANCE_SECS, MISS_TIME_BUFFER_SECS};
use crate::models::{price_to_row, PriceSnapshot, RoundStatus};
use crate::protocol::{PriceUpdatePayload, ServerEvent, StateUpdatePayload};
use crate::settlement::SettlementItem;
use tracing::{info, warn};

/// Snapshots are diagnostic, not every tick's worth is needed.
const SNAPSHOT_INTERVAL_SECS: f64 = 0.1;
/// `state:update` is throttled independently of the tick rate so a 16ms
/// tick doesn't also mean a 16ms broadcast fan-out.
const STATE_UPDATE_INTERVAL_MS: i64 = 100;

impl EngineActor {
    pub(crate) async fn on_tick(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if matches!(
            state.status,
            RoundStatus::Pending | RoundStatus::Settling | RoundStatus::Completed | RoundStatus::Cancelled
        ) {
            return;
        }

        let now_ms = Self::now_ms();
        state.elapsed = ((now_ms - state.round_start_time_ms) as f64 / 1000.0).max(0.0);

        if state.status == RoundStatus::Betting
            && state.elapsed >= self.deps.config.betting_duration.as_secs_f64()
        {
            let round_id = state.round_id.clone();
            match self
                .deps
                .store
                .conditional_update_round_status(&round_id, RoundStatus::Betting, RoundStatus::Running)
                .await
            {
                Ok(true) => {
                    self.state.as_mut().unwrap().status = RoundStatus::Running;
                    self.deps.broadcast(ServerEvent::RoundRunning { round_id });
                }
                Ok(false) => warn!("betting->running transition raced and lost, retrying next tick"),
                Err(err) => warn!(error = %err, "betting->running transition failed"),
            }
        }

        let state = self.state.as_ref().unwrap();
        let asset = state.asset.clone();
        let Some((price, observed_at)) = self.deps.cache.get_latest_price(&asset) else {
            return;
        };

        if state.status == RoundStatus::Running
            && observed_at.elapsed().as_secs_f64() >= crate::config::PRICE_CRITICAL_SECS
        {
            self.pending_action = Some(PendingRoundAction::Cancel("price_unavailable".into()));
            return;
        }

        let new_row = price_to_row(price, state.start_price, crate::config::PRICE_SENSITIVITY);
        let elapsed = state.elapsed;
        let round_id = state.round_id.clone();
        let hit_tolerance_rows = self.deps.config.hit_tolerance_rows;
        let max_duration_secs = self.deps.config.max_duration.as_secs_f64();
        let status = state.status;

        let state = self.state.as_mut().unwrap();
        let prev_row = state.current_row;
        state.prev_row = prev_row;
        state.current_row = new_row;
        state.current_price = price;

        if status == RoundStatus::Running {
            self.drain_due_bets(elapsed, prev_row, new_row, hit_tolerance_rows, price);
        }

        if elapsed - self.last_snapshot_elapsed >= SNAPSHOT_INTERVAL_SECS {
            self.last_snapshot_elapsed = elapsed;
            self.deps.snapshots.push(PriceSnapshot {
                round_id: round_id.clone(),
                timestamp: elapsed,
                price,
                row_index: new_row,
            });
        }

        if now_ms - self.last_state_update_emit_ms >= STATE_UPDATE_INTERVAL_MS {
            self.last_state_update_emit_ms = now_ms;
            self.deps.broadcast(ServerEvent::StateUpdate(StateUpdatePayload {
                round_id: round_id.clone(),
                current_price: price,
                current_row: new_row,
                elapsed,
            }));
            self.deps
                .broadcast(ServerEvent::PriceUpdate(PriceUpdatePayload { asset, price }));
        }

        if status == RoundStatus::Running && elapsed >= max_duration_secs {
            info!(round_id, elapsed, "round reached max duration, scheduling end");
            self.pending_action = Some(PendingRoundAction::End("timeout".into()));
        }
    }

    /// Drains the heap top per §4.8 point 4, in the spec's exact branch
    /// order: too-far-future stops the whole drain for this tick; past the
    /// miss buffer is an unconditional loss; otherwise the row window swept
    /// between `prevRow` and `currentRow` (not just `currentRow` alone —
    /// a fast-moving price can cross a target row between ticks without
    /// resting near it) decides hit vs. "leave in place and stop".
    fn drain_due_bets(
        &mut self,
        elapsed: f64,
        prev_row: f64,
        current_row: f64,
        hit_tolerance_rows: f64,
        current_price: rust_decimal::Decimal,
    ) {
        let window_lo = prev_row.min(current_row) - hit_tolerance_rows;
        let window_hi = prev_row.max(current_row) + hit_tolerance_rows;

        let mut processed = 0usize;
        while processed < crate::config::MAX_SETTLEMENTS_PER_TICK {
            let Some((peek_id, target_time)) = self.heap.peek() else {
                break;
            };
            if target_time > elapsed + HIT_TIME_TOLERANCE_SECS {
                break;
            }

            let past_miss_buffer = elapsed > target_time + MISS_TIME_BUFFER_SECS;
            if !past_miss_buffer {
                let state = self.state.as_ref().unwrap();
                let hit = state
                    .active_bets
                    .get(peek_id)
                    .map(|active| active.target_row >= window_lo && active.target_row <= window_hi)
                    .unwrap_or(true); // already resolved out-of-band: pop it to drop the stale entry
                // Spec §4.8 point 4: not-yet-missed and not-a-hit means stop
                // this tick's drain entirely, not skip ahead to later entries.
                if !hit {
                    break;
                }
            }

            let Some((order_id, target_time)) = self.heap.pop() else {
                break;
            };
            processed += 1;

            let state = self.state.as_mut().unwrap();
            let Some(active) = state.active_bets.get(&order_id) else {
                // Already refunded or resolved out-of-band.
                continue;
            };
            let target_row = active.target_row;
            let user_id = active.user_id.clone();
            let hit = !past_miss_buffer && target_row >= window_lo && target_row <= window_hi;

            state.active_bets.remove(&order_id);
            if let Some(count) = state.pending_by_user.get_mut(&user_id) {
                *count = count.saturating_sub(1);
            }
            let round_id = state.round_id.clone();
            self.deps.risk.release_expected_payout(&round_id, &order_id);

            let hit_details = hit.then_some(crate::models::HitDetails {
                hit_price: current_price,
                hit_row: current_row,
                hit_time: target_time,
            });
            self.deps.settlement.enqueue(SettlementItem::new(order_id, hit, hit_details));
        }
    }
}
