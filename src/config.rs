//! Environment-driven configuration, generalizing the old
//! `models::Config::from_env`'s `env::var(...).unwrap_or_else(...).parse()`
//! idiom to every option in the round/engine configuration table.

use std::time::Duration;

/// Fixed constants from the spec's configuration table. Not env-overridable
/// because they define game fairness, not deployment tuning.
pub const HIT_TIME_TOLERANCE_SECS: f64 = 0.5;
pub const MISS_TIME_BUFFER_SECS: f64 = 0.6;
pub const MIN_TARGET_TIME_OFFSET_SECS: f64 = 0.5;
pub const MAX_ROW_INDEX: f64 = 13.0;
pub const CENTER_ROW_INDEX: f64 = 6.5;
pub const PRICE_SENSITIVITY: f64 = 1000.0;
pub const HOUSE_EDGE: f64 = 0.08;
pub const MIN_MULTIPLIER: f64 = 1.01;
pub const MAX_MULTIPLIER: f64 = 100.0;
pub const PRICE_STALE_SECS: f64 = 5.0;
pub const PRICE_CRITICAL_SECS: f64 = 10.0;
pub const MAX_SETTLEMENTS_PER_TICK: usize = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub jwt_secret: String,

    /// Asset this engine instance runs a round for, e.g. "BTC-USD".
    pub asset: String,
    pub betting_duration: Duration,
    pub max_duration: Duration,
    pub min_bet_amount: f64,
    pub max_bet_amount: f64,
    pub max_bets_per_user: u32,
    pub max_bets_per_second: u32,
    pub hit_tolerance_rows: f64,
    pub tick_interval: Duration,

    pub max_active_bets: usize,
    pub snapshot_buffer_capacity: usize,
    pub snapshot_batch_size: usize,
    pub snapshot_retry_backoff_min_ms: u64,
    pub snapshot_retry_backoff_max_ms: u64,
    pub rate_limit_window: Duration,
    pub house_pool_initial_balance: f64,
    pub max_round_payout_ratio: f64,
    pub max_round_payout_cap: f64,

    pub price_feed_url: String,
    pub origin_allowlist: Vec<String>,
    pub history_limit: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        fn env_str(key: &str, default: &str) -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        }

        fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let database_path = env_str("DATABASE_PATH", "./crash_row.db");
        let port = env_parse("PORT", 8080u16);
        let jwt_secret = env_str("JWT_SECRET", "dev-secret-change-me");

        let asset = env_str("GAME_ASSET", "BTC-USD");
        let betting_duration = Duration::from_secs_f64(env_parse("BETTING_DURATION_SECS", 5.0));
        let max_duration = Duration::from_secs_f64(env_parse("MAX_DURATION_SECS", 60.0));
        let min_bet_amount = env_parse("MIN_BET_AMOUNT", 1.0);
        let max_bet_amount = env_parse("MAX_BET_AMOUNT", 1000.0);
        let max_bets_per_user = env_parse("MAX_BETS_PER_USER", 10u32);
        let max_bets_per_second = env_parse("MAX_BETS_PER_SECOND", 5u32);
        let hit_tolerance_rows = env_parse("HIT_TOLERANCE_ROWS", 0.4);
        let tick_interval = Duration::from_millis(env_parse("TICK_INTERVAL_MS", 16u64));

        let max_active_bets = env_parse("MAX_ACTIVE_BETS", 10_000usize);
        let snapshot_buffer_capacity = env_parse("SNAPSHOT_BUFFER_CAPACITY", 10_000usize);
        let snapshot_batch_size = env_parse("SNAPSHOT_BATCH_SIZE", 500usize);
        let snapshot_retry_backoff_min_ms = env_parse("SNAPSHOT_RETRY_BACKOFF_MIN_MS", 200u64);
        let snapshot_retry_backoff_max_ms = env_parse("SNAPSHOT_RETRY_BACKOFF_MAX_MS", 5_000u64);
        let rate_limit_window = Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECS", 1u64));
        let house_pool_initial_balance = env_parse("HOUSE_POOL_INITIAL_BALANCE", 10_000.0);
        let max_round_payout_ratio = env_parse("MAX_ROUND_PAYOUT_RATIO", 0.15);
        let max_round_payout_cap = env_parse("MAX_ROUND_PAYOUT_CAP", 50_000.0);

        let price_feed_url = env_str("PRICE_FEED_URL", "wss://stream.example.com/ws");
        let origin_allowlist = env_str("ORIGIN_ALLOWLIST", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
        let history_limit = env_parse("HISTORY_LIMIT", 200usize).min(200);

        Ok(Self {
            database_path,
            port,
            jwt_secret,
            asset,
            betting_duration,
            max_duration,
            min_bet_amount,
            max_bet_amount,
            max_bets_per_user,
            max_bets_per_second,
            hit_tolerance_rows,
            tick_interval,
            max_active_bets,
            snapshot_buffer_capacity,
            snapshot_batch_size,
            snapshot_retry_backoff_min_ms,
            snapshot_retry_backoff_max_ms,
            rate_limit_window,
            house_pool_initial_balance,
            max_round_payout_ratio,
            max_round_payout_cap,
            price_feed_url,
            origin_allowlist,
            history_limit,
        })
    }

}
