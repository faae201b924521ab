//! Client wire protocol (§6, §4.12): tagged envelopes over the realtime
//! duplex transport, matching the teacher's externally-tagged
//! `models::WsServerEvent` style (`#[serde(tag = "type")]`).

use crate::models::{Bet, BetStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    StateRequest {
        #[serde(default)]
        include_history: bool,
        #[serde(default)]
        history_limit: Option<usize>,
    },
    PlaceBet {
        order_id: String,
        target_row: f64,
        target_time: f64,
        amount: Decimal,
        #[serde(default)]
        is_play_mode: bool,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshotPayload {
    pub round_id: Option<String>,
    pub status: Option<String>,
    pub start_price: Option<Decimal>,
    pub current_price: Option<Decimal>,
    pub current_row: Option<f64>,
    pub elapsed: Option<f64>,
    pub round_start_time_ms: Option<i64>,
    pub balance: Option<Decimal>,
    pub play_balance: Option<Decimal>,
    pub recent_bets: Vec<Bet>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BetConfirmedPayload {
    pub order_id: String,
    pub bet_id: String,
    pub multiplier: f64,
    pub target_row: f64,
    pub target_time: f64,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BetSettledPayload {
    pub order_id: String,
    pub status: BetStatus,
    pub payout: Decimal,
    pub hit_row: Option<f64>,
    pub hit_price: Option<Decimal>,
    pub hit_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BetRefundedPayload {
    pub order_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BetRejectedPayload {
    pub order_id: String,
    pub code: crate::errors::ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundStartPayload {
    pub round_id: String,
    pub asset: String,
    pub start_price: Decimal,
    pub betting_duration_secs: f64,
    pub max_duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateUpdatePayload {
    pub round_id: String,
    pub current_price: Decimal,
    pub current_row: f64,
    pub elapsed: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdatePayload {
    pub asset: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundEndPayload {
    pub round_id: String,
    pub reason: String,
    pub end_price: Option<Decimal>,
}

/// The closed set of server→client events (§2, §4.12). Each carries a
/// fixed payload shape; dispatch on the tag, never on a dynamic bag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    RoundStart(RoundStartPayload),
    RoundRunning { round_id: String },
    RoundEnd(RoundEndPayload),
    RoundCancelled { round_id: String, reason: String },
    StateUpdate(StateUpdatePayload),
    PriceUpdate(PriceUpdatePayload),
    StateSnapshot(StateSnapshotPayload),
    BetConfirmed(BetConfirmedPayload),
    BetSettled(BetSettledPayload),
    BetRejected(BetRejectedPayload),
    BetRefunded(BetRefundedPayload),
    AuthResult { ok: bool, user_id: Option<String> },
    Pong,
    Error { code: crate::errors::ErrorCode, message: String },
}

/// Routing target for a `ServerEvent` (§4.12): broadcast to everyone, or
/// delivered only to the socket(s) bound to one user/anonymous id.
#[derive(Debug, Clone)]
pub enum EventTarget {
    Broadcast,
    User(String),
}

#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub target: EventTarget,
    pub event: ServerEvent,
}
