//! Atomic balance mutations with an append-only ledger (§4.3). Thin
//! wrapper over `Store`: the conditional/batched semantics live in the
//! store implementation (the predicate must be evaluated by whatever
//! holds the authoritative row), this module is the typed seam the
//! engine calls through, grounded on `vault::pool::PooledVault`'s
//! `anyhow::Result`-returning read-modify-write methods.

use crate::errors::EngineError;
use crate::store::{BalanceChange, BalanceDelta, Store};
use crate::models::TransactionType;
use rust_decimal::Decimal;
use std::sync::Arc;

pub struct FinancialLedger {
    store: Arc<dyn Store>,
}

impl FinancialLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn change_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        transaction_type: TransactionType,
        is_play_mode: bool,
        related_bet_id: Option<&str>,
        remark: Option<&str>,
    ) -> anyhow::Result<BalanceChange> {
        self.store
            .change_balance(
                user_id,
                amount,
                transaction_type,
                is_play_mode,
                related_bet_id,
                remark,
            )
            .await
    }

    /// The only permitted way to debit a stake: fails with
    /// `InsufficientBalance` rather than silently allowing an overdraft.
    pub async fn debit_stake(
        &self,
        user_id: &str,
        amount: Decimal,
        is_play_mode: bool,
        related_bet_id: &str,
    ) -> Result<BalanceChange, EngineError> {
        let result = self
            .store
            .conditional_change_balance(
                user_id,
                -amount,
                amount,
                TransactionType::Bet,
                is_play_mode,
                Some(related_bet_id),
                Some("stake debit"),
            )
            .await
            .map_err(EngineError::Internal)?;

        result.ok_or(EngineError::InsufficientBalance)
    }

    pub async fn credit_refund(
        &self,
        user_id: &str,
        amount: Decimal,
        is_play_mode: bool,
        related_bet_id: &str,
    ) -> anyhow::Result<BalanceChange> {
        self.store
            .change_balance(
                user_id,
                amount,
                TransactionType::Refund,
                is_play_mode,
                Some(related_bet_id),
                Some("bet refunded"),
            )
            .await
    }

    pub async fn batch_change_balance(
        &self,
        user_id: &str,
        deltas: &[BalanceDelta],
        is_play_mode: bool,
    ) -> anyhow::Result<BalanceChange> {
        self.store
            .batch_change_balance(user_id, deltas, is_play_mode)
            .await
    }
}
