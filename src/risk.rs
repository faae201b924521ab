//! RiskManager (§4.5): per-round reservation of projected payout against a
//! pool-derived cap.
//!
//! This is new domain logic — the cap/reservation problem here is not the
//! Kelly-criterion position sizing the teacher's original `risk.rs` solved.
//! What carries over from it is the *shape*: a small struct built with
//! `new()` plus `clamp`-bounded derived values, and pure methods returning
//! `Result`/`bool` rather than mutating global state directly.

use crate::locks::CacheStore;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Derives the per-round payout cap and reserves/releases expected net
/// payout against it via the shared cache (§4.5).
pub struct RiskManager {
    cache: Arc<dyn CacheStore>,
    configured_cap: Decimal,
    pool_ratio: f64,
}

impl RiskManager {
    pub fn new(cache: Arc<dyn CacheStore>, configured_cap: Decimal, pool_ratio: f64) -> Self {
        Self {
            cache,
            configured_cap,
            pool_ratio: pool_ratio.clamp(0.0, 1.0),
        }
    }

    /// `min(configured_cap, pool_balance * ratio)`.
    pub fn max_round_payout(&self, pool_balance: Decimal) -> Decimal {
        let ratio_cap = pool_balance * Decimal::try_from(self.pool_ratio).unwrap_or_default();
        self.configured_cap.min(ratio_cap)
    }

    /// Admit a reservation of `expected_payout` for `order_id` in
    /// `round_id` iff the running total stays within `max_round_payout`.
    pub fn reserve_expected_payout(
        &self,
        round_id: &str,
        order_id: &str,
        expected_payout: Decimal,
        max_round_payout: Decimal,
        ttl: Duration,
    ) -> bool {
        if expected_payout <= Decimal::ZERO {
            return true;
        }
        self.cache
            .reserve_payout(round_id, order_id, expected_payout, max_round_payout, ttl)
    }

    pub fn release_expected_payout(&self, round_id: &str, order_id: &str) {
        self.cache.release_payout(round_id, order_id);
    }

    /// Called on round end: drops the whole per-round reservation hash.
    pub fn clear_round(&self, round_id: &str) {
        self.cache.clear_round_reservations(round_id);
    }

    /// `net = max(0, amount * multiplier - amount)`, the expected payout
    /// above stake that risk must cover (§4.10 step 13).
    pub fn expected_net_payout(amount: Decimal, multiplier: f64) -> Decimal {
        let multiplier = Decimal::try_from(multiplier).unwrap_or(Decimal::ONE);
        let gross = (amount * multiplier).round_dp(2);
        (gross - amount).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::InProcessCache;
    use rust_decimal_macros::dec;

    #[test]
    fn max_round_payout_takes_the_tighter_bound() {
        let risk = RiskManager::new(Arc::new(InProcessCache::new()), dec!(1000), 0.1);
        assert_eq!(risk.max_round_payout(dec!(5000)), dec!(500));
        assert_eq!(risk.max_round_payout(dec!(50000)), dec!(1000));
    }

    #[test]
    fn reservations_respect_the_cap_and_release_cleanly() {
        let risk = RiskManager::new(Arc::new(InProcessCache::new()), dec!(1000), 1.0);
        let cap = dec!(100);
        assert!(risk.reserve_expected_payout("r1", "o1", dec!(60), cap, Duration::from_secs(30)));
        assert!(!risk.reserve_expected_payout("r1", "o2", dec!(60), cap, Duration::from_secs(30)));
        risk.release_expected_payout("r1", "o1");
        assert!(risk.reserve_expected_payout("r1", "o2", dec!(60), cap, Duration::from_secs(30)));
    }

    #[test]
    fn expected_net_payout_floors_at_zero() {
        let net = RiskManager::expected_net_payout(dec!(10), 0.5);
        assert_eq!(net, dec!(0));
        let net = RiskManager::expected_net_payout(dec!(10), 3.0);
        assert_eq!(net, dec!(20));
    }
}
