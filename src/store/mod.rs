//! The relational store seam (spec §6). `trait Store` is the contract the
//! engine depends on; `SqliteStore` is the reference implementation used in
//! dev/test. A production deployment swaps in a Postgres-backed
//! implementation without touching engine code.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::models::{
    Bet, BetStatus, HitDetails, HousePool, PriceSnapshot, Round, RoundStatus, Transaction,
    TransactionType, User,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Result of a conditional balance mutation (§4.3).
#[derive(Debug, Clone)]
pub struct BalanceChange {
    pub balance_before: Decimal,
    pub balance_after: Decimal,
}

/// One leg of a `batch_change_balance` call.
#[derive(Debug, Clone)]
pub struct BalanceDelta {
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub related_bet_id: Option<String>,
    pub remark: Option<String>,
}

/// The relational contract the engine, settlement queue, and snapshot
/// buffer depend on. All methods that mutate shared money state are
/// expected to run inside a single implementation-owned transaction.
#[async_trait]
pub trait Store: Send + Sync {
    // -- rounds --------------------------------------------------------
    async fn insert_round(&self, round: &Round) -> anyhow::Result<()>;
    async fn get_round(&self, round_id: &str) -> anyhow::Result<Option<Round>>;
    /// `UPDATE rounds SET status = to WHERE id = ? AND status = from`.
    /// Returns true iff exactly one row changed.
    async fn conditional_update_round_status(
        &self,
        round_id: &str,
        from: RoundStatus,
        to: RoundStatus,
    ) -> anyhow::Result<bool>;
    async fn finalize_round(
        &self,
        round_id: &str,
        end_price: Decimal,
        total_bets: i64,
        total_volume: Decimal,
        total_payout: Decimal,
    ) -> anyhow::Result<()>;

    // -- bets ------------------------------------------------------------
    /// Inserts a bet row; the unique constraint on `order_id` is the
    /// authoritative idempotency guard (§4.10 step 11/14).
    async fn insert_bet(&self, bet: &Bet) -> anyhow::Result<()>;
    async fn get_bet_by_order_id(&self, order_id: &str) -> anyhow::Result<Option<Bet>>;
    async fn list_bets_by_status(
        &self,
        round_id: &str,
        status: BetStatus,
    ) -> anyhow::Result<Vec<Bet>>;
    /// Settles one bet and, in the same transaction, applies the matching
    /// financial effect — the balance credit plus ledger row for a real-mode
    /// win, or the win/loss stat bump either way (§4.7 steps 2-3). A
    /// conditional `status IN (PENDING, SETTLING) -> (WON|LOST)` update gates
    /// the whole transaction: `SETTLING` is accepted alongside `PENDING` so a
    /// compensation-sweep retry of an in-flight settlement still lands
    /// exactly once. Returns true iff this call performed the settlement
    /// (false if the row was already terminal), so a mid-sequence failure
    /// can never flip the bet to terminal without its paired financial
    /// effect landing, or credit a bet that never actually flipped.
    async fn settle_bet_and_credit(
        &self,
        bet: &Bet,
        to: BetStatus,
        payout: Decimal,
        hit: Option<HitDetails>,
    ) -> anyhow::Result<bool>;
    /// Conditional refund: `status IN (PENDING, SETTLING) -> REFUNDED`.
    async fn refund_bet(&self, bet_id: &str) -> anyhow::Result<bool>;

    // -- users / ledger --------------------------------------------------
    async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<User>>;
    /// Unconditional balance mutation with a ledger row (play-mode bets
    /// skip the ledger and mutate `play_balance` only); §4.3.
    async fn change_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        transaction_type: TransactionType,
        is_play_mode: bool,
        related_bet_id: Option<&str>,
        remark: Option<&str>,
    ) -> anyhow::Result<BalanceChange>;
    /// `WHERE balance >= min_balance`; the only legal way to debit a stake.
    async fn conditional_change_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        min_balance: Decimal,
        transaction_type: TransactionType,
        is_play_mode: bool,
        related_bet_id: Option<&str>,
        remark: Option<&str>,
    ) -> anyhow::Result<Option<BalanceChange>>;
    /// Applies a sequence of deltas for one user as a single update plus a
    /// chained sequence of ledger rows (§4.3 `batchChangeBalance`).
    async fn batch_change_balance(
        &self,
        user_id: &str,
        deltas: &[BalanceDelta],
        is_play_mode: bool,
    ) -> anyhow::Result<BalanceChange>;
    async fn record_bet_stat(&self, user_id: &str) -> anyhow::Result<()>;
    async fn list_transactions(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<Transaction>>;
    async fn list_recent_bets(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<Bet>>;

    // -- house pool --------------------------------------------------------
    async fn get_house_pool(&self, asset: &str) -> anyhow::Result<Option<HousePool>>;
    /// Insert-if-absent; returns the existing row on conflict.
    async fn initialize_house_pool(&self, asset: &str, initial: Decimal) -> anyhow::Result<HousePool>;
    /// Optimistic `version` compare-and-swap; caller retries on `Ok(false)`.
    async fn try_apply_house_pool_delta(
        &self,
        asset: &str,
        delta: Decimal,
        expected_version: i64,
    ) -> anyhow::Result<bool>;

    // -- price snapshots --------------------------------------------------
    async fn insert_price_snapshots(&self, snapshots: &[PriceSnapshot]) -> anyhow::Result<()>;
}
