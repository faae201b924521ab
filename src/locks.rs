//! LockService (spec §4.2): round and bet leases over the shared cache,
//! plus the cache surface the rest of the engine treats as advisory
//! (risk reservations, the active-bet sorted-set mirror, rate-limit
//! counters, the sampled price cache).
//!
//! Grounded on the teacher's recurring `Arc<parking_lot::Mutex<HashMap<K,
//! Entry>>>` shape for in-memory shared state, generalized behind `trait
//! CacheStore` so a Redis-backed implementation is a drop-in swap.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The cache operations the engine depends on (§6). `InProcessCache` is the
/// single-node reference implementation; a Redis client would implement the
/// same trait using `SET NX PX` / Lua compare-and-delete / sorted sets.
pub trait CacheStore: Send + Sync {
    /// Atomic set-if-absent with expiry. Returns a fencing token on success.
    fn try_lock(&self, key: &str, ttl: Duration) -> Option<String>;
    /// Scripted compare-and-delete: only the token holder can release.
    fn unlock(&self, key: &str, token: &str) -> bool;
    /// Scripted compare-and-extend.
    fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> bool;

    /// Admit a risk reservation iff the round's running total (including
    /// this one) would not exceed `max_round_payout`. Returns whether it
    /// was admitted.
    fn reserve_payout(
        &self,
        round_id: &str,
        order_id: &str,
        expected_payout: Decimal,
        max_round_payout: Decimal,
        ttl: Duration,
    ) -> bool;
    fn release_payout(&self, round_id: &str, order_id: &str);
    fn clear_round_reservations(&self, round_id: &str);

    /// Sliding-window admission counter for per-user rate limiting.
    fn record_and_check_rate(&self, user_id: &str, window: Duration, max_events: u32) -> bool;

    fn set_latest_price(&self, asset: &str, price: Decimal, at: Instant);
    fn get_latest_price(&self, asset: &str) -> Option<(Decimal, Instant)>;
}

#[derive(Default)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

struct RateEntry {
    events: Vec<Instant>,
}

/// Single-node reference cache. Tests and single-engine deployments use
/// this directly; it is what `InProcessLocks`-style fallback degrades to
/// when a real cache is unreachable (§9 "Rate limit fallback").
pub struct InProcessCache {
    locks: Mutex<HashMap<String, LockEntry>>,
    reservations: Mutex<HashMap<String, HashMap<String, (Decimal, Instant)>>>,
    rate_windows: Mutex<HashMap<String, RateEntry>>,
    prices: Mutex<HashMap<String, (Decimal, Instant)>>,
}

impl InProcessCache {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            rate_windows: Mutex::new(HashMap::new()),
            prices: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InProcessCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InProcessCache {
    fn try_lock(&self, key: &str, ttl: Duration) -> Option<String> {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        if let Some(existing) = locks.get(key) {
            if existing.expires_at > now {
                return None;
            }
        }
        let token = Uuid::new_v4().to_string();
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Some(token)
    }

    fn unlock(&self, key: &str, token: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(entry) if entry.token == token => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }

    fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let mut locks = self.locks.lock();
        match locks.get_mut(key) {
            Some(entry) if entry.token == token => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    fn reserve_payout(
        &self,
        round_id: &str,
        order_id: &str,
        expected_payout: Decimal,
        max_round_payout: Decimal,
        ttl: Duration,
    ) -> bool {
        let mut reservations = self.reservations.lock();
        let now = Instant::now();
        let round = reservations.entry(round_id.to_string()).or_default();
        round.retain(|_, (_, expires)| *expires > now);
        let total: Decimal = round.values().map(|(amount, _)| *amount).sum();
        if total + expected_payout > max_round_payout {
            return false;
        }
        round.insert(order_id.to_string(), (expected_payout, now + ttl));
        true
    }

    fn release_payout(&self, round_id: &str, order_id: &str) {
        let mut reservations = self.reservations.lock();
        if let Some(round) = reservations.get_mut(round_id) {
            round.remove(order_id);
        }
    }

    fn clear_round_reservations(&self, round_id: &str) {
        self.reservations.lock().remove(round_id);
    }

    fn record_and_check_rate(&self, user_id: &str, window: Duration, max_events: u32) -> bool {
        let mut windows = self.rate_windows.lock();
        let now = Instant::now();
        let entry = windows.entry(user_id.to_string()).or_insert(RateEntry {
            events: Vec::new(),
        });
        entry.events.retain(|t| now.duration_since(*t) < window);
        if entry.events.len() as u32 >= max_events {
            return false;
        }
        entry.events.push(now);
        true
    }

    fn set_latest_price(&self, asset: &str, price: Decimal, at: Instant) {
        self.prices.lock().insert(asset.to_string(), (price, at));
    }

    fn get_latest_price(&self, asset: &str) -> Option<(Decimal, Instant)> {
        self.prices.lock().get(asset).copied()
    }
}

/// Thin, semantically-named wrapper over `CacheStore` for the round/bet
/// lease operations (§4.2). Kept distinct from the raw cache trait so
/// engine code reads as "acquire the round lock", not "try_lock a string".
pub struct LockService {
    cache: Arc<dyn CacheStore>,
}

impl LockService {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    pub fn acquire_round_lock(&self, asset: &str, ttl: Duration) -> Option<String> {
        self.cache.try_lock(&format!("lock:round:{asset}"), ttl)
    }

    pub fn release_round_lock(&self, asset: &str, token: &str) -> bool {
        self.cache.unlock(&format!("lock:round:{asset}"), token)
    }

    pub fn acquire_bet_lock(&self, order_id: &str, ttl: Duration) -> Option<String> {
        self.cache.try_lock(&format!("lock:bet:{order_id}"), ttl)
    }

    pub fn release_bet_lock(&self, order_id: &str, token: &str) -> bool {
        self.cache.unlock(&format!("lock:bet:{order_id}"), token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_lock_is_exclusive_until_released() {
        let cache = InProcessCache::new();
        let locks = LockService::new(Arc::new(cache));
        let token = locks.acquire_round_lock("BTC-USD", Duration::from_secs(5)).unwrap();
        assert!(locks.acquire_round_lock("BTC-USD", Duration::from_secs(5)).is_none());
        assert!(locks.release_round_lock("BTC-USD", &token));
        assert!(locks.acquire_round_lock("BTC-USD", Duration::from_secs(5)).is_some());
    }

    #[test]
    fn unlock_requires_matching_token() {
        let cache = InProcessCache::new();
        let locks = LockService::new(Arc::new(cache));
        let token = locks.acquire_bet_lock("o1", Duration::from_secs(5)).unwrap();
        assert!(!locks.release_bet_lock("o1", "wrong-token"));
        assert!(locks.release_bet_lock("o1", &token));
    }

    #[test]
    fn payout_reservation_respects_cap() {
        let cache = InProcessCache::new();
        assert!(cache.reserve_payout("r1", "o1", dec!(50), dec!(100), Duration::from_secs(60)));
        assert!(cache.reserve_payout("r1", "o2", dec!(40), dec!(100), Duration::from_secs(60)));
        assert!(!cache.reserve_payout("r1", "o3", dec!(20), dec!(100), Duration::from_secs(60)));
        cache.release_payout("r1", "o1");
        assert!(cache.reserve_payout("r1", "o3", dec!(20), dec!(100), Duration::from_secs(60)));
    }

    #[test]
    fn rate_limit_resets_after_window() {
        let cache = InProcessCache::new();
        assert!(cache.record_and_check_rate("u1", Duration::from_millis(20), 2));
        assert!(cache.record_and_check_rate("u1", Duration::from_millis(20), 2));
        assert!(!cache.record_and_check_rate("u1", Duration::from_millis(20), 2));
    }
}
