//! Core data model: rounds, bets, users, ledger entries, the house pool,
//! and the in-memory game state the engine's tick loop and admission
//! handler mutate directly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type UserId = String;
pub type RoundId = String;
pub type OrderId = String;

/// Row space is [0, MAX_ROW_INDEX] with this as its midpoint.
pub const CENTER_ROW_INDEX: f64 = 6.5;
pub const MAX_ROW_INDEX: f64 = 13.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Betting,
    Running,
    Settling,
    Completed,
    Cancelled,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::Betting => "betting",
            RoundStatus::Running => "running",
            RoundStatus::Settling => "settling",
            RoundStatus::Completed => "completed",
            RoundStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RoundStatus::Pending),
            "betting" => Some(RoundStatus::Betting),
            "running" => Some(RoundStatus::Running),
            "settling" => Some(RoundStatus::Settling),
            "completed" => Some(RoundStatus::Completed),
            "cancelled" => Some(RoundStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundStatus::Completed | RoundStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Pending,
    Settling,
    Won,
    Lost,
    Refunded,
    Cancelled,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Pending => "pending",
            BetStatus::Settling => "settling",
            BetStatus::Won => "won",
            BetStatus::Lost => "lost",
            BetStatus::Refunded => "refunded",
            BetStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BetStatus::Pending),
            "settling" => Some(BetStatus::Settling),
            "won" => Some(BetStatus::Won),
            "lost" => Some(BetStatus::Lost),
            "refunded" => Some(BetStatus::Refunded),
            "cancelled" => Some(BetStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BetStatus::Won | BetStatus::Lost | BetStatus::Refunded | BetStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Bet,
    Win,
    Refund,
    Deposit,
    Withdrawal,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Bet => "bet",
            TransactionType::Win => "win",
            TransactionType::Refund => "refund",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Adjustment => "adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bet" => Some(TransactionType::Bet),
            "win" => Some(TransactionType::Win),
            "refund" => Some(TransactionType::Refund),
            "deposit" => Some(TransactionType::Deposit),
            "withdrawal" => Some(TransactionType::Withdrawal),
            "adjustment" => Some(TransactionType::Adjustment),
            _ => None,
        }
    }
}

/// One play of the game on one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub asset: String,
    pub status: RoundStatus,
    pub start_price: Decimal,
    pub end_price: Option<Decimal>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_bets: i64,
    pub total_volume: Decimal,
    pub total_payout: Decimal,
}

/// A single wager. `order_id` is the client-supplied idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub round_id: RoundId,
    pub amount: Decimal,
    pub multiplier: f64,
    pub target_row: f64,
    pub target_time: f64,
    pub asset: String,
    pub is_play_mode: bool,
    pub status: BetStatus,
    pub payout: Decimal,
    pub hit_price: Option<Decimal>,
    pub hit_row: Option<f64>,
    pub hit_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Player account. `balance` is real money; `play_balance` is synthetic and
/// never touches the ledger or house pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance: Decimal,
    pub play_balance: Decimal,
    pub total_bets: i64,
    pub total_wins: i64,
    pub total_losses: i64,
    pub total_profit: Decimal,
    pub active: bool,
    pub silenced: bool,
}

impl User {
    pub fn is_anonymous(id: &str) -> bool {
        id.starts_with("anon-")
    }
}

/// Append-only ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: UserId,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub related_bet_id: Option<String>,
    pub remark: Option<String>,
    pub status: String,
    pub completed_at: DateTime<Utc>,
}

/// Per-asset shared liability counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousePool {
    pub asset: String,
    pub balance: Decimal,
    pub version: i64,
}

/// A sampled (time, price, row) point for a round, for diagnostics/replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub round_id: RoundId,
    pub timestamp: f64,
    pub price: Decimal,
    pub row_index: f64,
}

/// Hit details recorded once a bet resolves as a win.
#[derive(Debug, Clone, Copy)]
pub struct HitDetails {
    pub hit_price: Decimal,
    pub hit_row: f64,
    pub hit_time: f64,
}

/// The engine's hot-path mirror of `Bet`, owned exclusively by the tick
/// task. Tracked both in `GameState.active_bets` (by order id) and in the
/// `BetHeap` (by target time) — see `engine::bet_heap`.
#[derive(Debug, Clone)]
pub struct ActiveBet {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub round_id: RoundId,
    pub amount: Decimal,
    pub multiplier: f64,
    pub target_row: f64,
    pub target_time: f64,
    pub is_play_mode: bool,
}

/// The canonical live image of a round. Mutated only by the engine's single
/// owning task (tick loop + synchronous admission handler).
#[derive(Debug, Clone)]
pub struct GameState {
    pub round_id: RoundId,
    pub status: RoundStatus,
    pub asset: String,
    pub start_price: Decimal,
    pub current_price: Decimal,
    pub current_row: f64,
    pub prev_row: f64,
    pub elapsed: f64,
    pub round_start_time_ms: i64,
    pub active_bets: HashMap<OrderId, ActiveBet>,
    pub pending_by_user: HashMap<UserId, u32>,
}

impl GameState {
    pub fn new(round_id: RoundId, asset: String, start_price: Decimal, round_start_time_ms: i64) -> Self {
        Self {
            round_id,
            status: RoundStatus::Betting,
            asset,
            start_price,
            current_price: start_price,
            current_row: CENTER_ROW_INDEX,
            prev_row: CENTER_ROW_INDEX,
            elapsed: 0.0,
            round_start_time_ms,
            active_bets: HashMap::new(),
            pending_by_user: HashMap::new(),
        }
    }
}

/// `clamp(6.5 - (price/startPrice - 1) * PRICE_SENSITIVITY)`, PRICE_SENSITIVITY = 1000.
pub fn price_to_row(price: Decimal, start_price: Decimal, sensitivity: f64) -> f64 {
    if start_price.is_zero() {
        return CENTER_ROW_INDEX;
    }
    let ratio: f64 = ((price - start_price) / start_price)
        .to_string()
        .parse()
        .unwrap_or(0.0);
    (CENTER_ROW_INDEX - ratio * sensitivity).clamp(0.0, MAX_ROW_INDEX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_to_row_is_centered_at_start_price() {
        let row = price_to_row(dec!(100), dec!(100), 1000.0);
        assert!((row - CENTER_ROW_INDEX).abs() < 1e-9);
    }

    #[test]
    fn price_to_row_clamps_to_bounds() {
        let row = price_to_row(dec!(200), dec!(100), 1000.0);
        assert_eq!(row, 0.0);
        let row = price_to_row(dec!(1), dec!(100), 1000.0);
        assert_eq!(row, MAX_ROW_INDEX);
    }

    #[test]
    fn round_status_round_trips_through_str() {
        for s in ["pending", "betting", "running", "settling", "completed", "cancelled"] {
            let status = RoundStatus::from_str(s).unwrap();
            assert_eq!(status.as_str(), s);
        }
    }
}
