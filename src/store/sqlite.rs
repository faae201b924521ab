//! `rusqlite`-backed reference implementation of `Store`, grounded on
//! `vault::user_accounts::UserAccountsDB`'s `Arc<tokio::sync::Mutex<Connection>>`
//! + `CREATE TABLE IF NOT EXISTS` shape.

use super::{BalanceChange, BalanceDelta, Store};
use crate::models::{
    Bet, BetStatus, HitDetails, HousePool, PriceSnapshot, Round, RoundStatus, Transaction,
    TransactionType, User,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn dec(s: String) -> Result<Decimal> {
    Decimal::from_str(&s).context("corrupt decimal column")
}

fn dts(d: Decimal) -> String {
    d.round_dp(2).to_string()
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rounds (
                id TEXT PRIMARY KEY,
                asset TEXT NOT NULL,
                status TEXT NOT NULL,
                start_price TEXT NOT NULL,
                end_price TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                total_bets INTEGER NOT NULL DEFAULT 0,
                total_volume TEXT NOT NULL DEFAULT '0',
                total_payout TEXT NOT NULL DEFAULT '0'
            );
            CREATE TABLE IF NOT EXISTS bets (
                id TEXT PRIMARY KEY,
                order_id TEXT UNIQUE NOT NULL,
                user_id TEXT NOT NULL,
                round_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                multiplier REAL NOT NULL,
                target_row REAL NOT NULL,
                target_time REAL NOT NULL,
                asset TEXT NOT NULL,
                is_play_mode INTEGER NOT NULL,
                status TEXT NOT NULL,
                payout TEXT NOT NULL DEFAULT '0',
                hit_price TEXT,
                hit_row REAL,
                hit_time REAL,
                created_at TEXT NOT NULL,
                settled_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_bets_round_status ON bets(round_id, status);
            CREATE INDEX IF NOT EXISTS idx_bets_user ON bets(user_id);
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                balance TEXT NOT NULL DEFAULT '0',
                play_balance TEXT NOT NULL DEFAULT '1000',
                total_bets INTEGER NOT NULL DEFAULT 0,
                total_wins INTEGER NOT NULL DEFAULT 0,
                total_losses INTEGER NOT NULL DEFAULT 0,
                total_profit TEXT NOT NULL DEFAULT '0',
                active INTEGER NOT NULL DEFAULT 1,
                silenced INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                transaction_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                balance_before TEXT NOT NULL,
                balance_after TEXT NOT NULL,
                related_bet_id TEXT,
                remark TEXT,
                status TEXT NOT NULL,
                completed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id);
            CREATE TABLE IF NOT EXISTS house_pools (
                asset TEXT PRIMARY KEY,
                balance TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS price_snapshots (
                round_id TEXT NOT NULL,
                timestamp REAL NOT NULL,
                price TEXT NOT NULL,
                row_index REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_round ON price_snapshots(round_id);
            ",
        )?;
        Ok(())
    }

    fn row_to_round(row: &rusqlite::Row) -> rusqlite::Result<Round> {
        let status: String = row.get(2)?;
        let start_price: String = row.get(3)?;
        let end_price: Option<String> = row.get(4)?;
        let started_at: String = row.get(5)?;
        let ended_at: Option<String> = row.get(6)?;
        let total_volume: String = row.get(8)?;
        let total_payout: String = row.get(9)?;
        Ok(Round {
            id: row.get(0)?,
            asset: row.get(1)?,
            status: RoundStatus::from_str(&status).unwrap_or(RoundStatus::Pending),
            start_price: dec(start_price).unwrap_or_default(),
            end_price: end_price.and_then(|s| dec(s).ok()),
            started_at: parse_rfc3339(&started_at).unwrap_or_else(|_| Utc::now()),
            ended_at: ended_at.and_then(|s| parse_rfc3339(&s).ok()),
            total_bets: row.get(7)?,
            total_volume: dec(total_volume).unwrap_or_default(),
            total_payout: dec(total_payout).unwrap_or_default(),
        })
    }

    fn row_to_bet(row: &rusqlite::Row) -> rusqlite::Result<Bet> {
        let amount: String = row.get(4)?;
        let status: String = row.get(9)?;
        let payout: String = row.get(10)?;
        let hit_price: Option<String> = row.get(11)?;
        let created_at: String = row.get(14)?;
        let settled_at: Option<String> = row.get(15)?;
        Ok(Bet {
            id: row.get(0)?,
            order_id: row.get(1)?,
            user_id: row.get(2)?,
            round_id: row.get(3)?,
            amount: dec(amount).unwrap_or_default(),
            multiplier: row.get(5)?,
            target_row: row.get(6)?,
            target_time: row.get(7)?,
            asset: row.get(8)?,
            is_play_mode: row.get::<_, i64>(16)? != 0,
            status: BetStatus::from_str(&status).unwrap_or(BetStatus::Pending),
            payout: dec(payout).unwrap_or_default(),
            hit_price: hit_price.and_then(|s| dec(s).ok()),
            hit_row: row.get(12)?,
            hit_time: row.get(13)?,
            created_at: parse_rfc3339(&created_at).unwrap_or_else(|_| Utc::now()),
            settled_at: settled_at.and_then(|s| parse_rfc3339(&s).ok()),
        })
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        let balance: String = row.get(1)?;
        let play_balance: String = row.get(2)?;
        let total_profit: String = row.get(6)?;
        Ok(User {
            id: row.get(0)?,
            balance: dec(balance).unwrap_or_default(),
            play_balance: dec(play_balance).unwrap_or_default(),
            total_bets: row.get(3)?,
            total_wins: row.get(4)?,
            total_losses: row.get(5)?,
            total_profit: dec(total_profit).unwrap_or_default(),
            active: row.get::<_, i64>(7)? != 0,
            silenced: row.get::<_, i64>(8)? != 0,
        })
    }

    fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
        let transaction_type: String = row.get(2)?;
        let amount: String = row.get(3)?;
        let balance_before: String = row.get(4)?;
        let balance_after: String = row.get(5)?;
        let completed_at: String = row.get(8)?;
        Ok(Transaction {
            id: row.get(0)?,
            user_id: row.get(1)?,
            transaction_type: TransactionType::from_str(&transaction_type)
                .unwrap_or(TransactionType::Adjustment),
            amount: dec(amount).unwrap_or_default(),
            balance_before: dec(balance_before).unwrap_or_default(),
            balance_after: dec(balance_after).unwrap_or_default(),
            related_bet_id: row.get(6)?,
            remark: row.get(7)?,
            status: "completed".to_string(),
            completed_at: parse_rfc3339(&completed_at).unwrap_or_else(|_| Utc::now()),
        })
    }

    async fn ensure_user(conn: &Connection, user_id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO users (id) VALUES (?)",
            params![user_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_round(&self, round: &Round) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO rounds (id, asset, status, start_price, started_at, total_bets, total_volume, total_payout)
             VALUES (?, ?, ?, ?, ?, 0, '0', '0')",
            params![
                round.id,
                round.asset,
                round.status.as_str(),
                dts(round.start_price),
                round.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn get_round(&self, round_id: &str) -> Result<Option<Round>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, asset, status, start_price, end_price, started_at, ended_at, total_bets, total_volume, total_payout
             FROM rounds WHERE id = ?",
            params![round_id],
            Self::row_to_round,
        )
        .optional()
        .context("get_round")
    }

    async fn conditional_update_round_status(
        &self,
        round_id: &str,
        from: RoundStatus,
        to: RoundStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE rounds SET status = ? WHERE id = ? AND status = ?",
            params![to.as_str(), round_id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    async fn finalize_round(
        &self,
        round_id: &str,
        end_price: Decimal,
        total_bets: i64,
        total_volume: Decimal,
        total_payout: Decimal,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE rounds SET end_price = ?, ended_at = ?, total_bets = ?, total_volume = ?, total_payout = ?
             WHERE id = ?",
            params![
                dts(end_price),
                Utc::now().to_rfc3339(),
                total_bets,
                dts(total_volume),
                dts(total_payout),
                round_id,
            ],
        )?;
        Ok(())
    }

    async fn insert_bet(&self, bet: &Bet) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::ensure_user(&conn, &bet.user_id).await?;
        conn.execute(
            "INSERT INTO bets (id, order_id, user_id, round_id, amount, multiplier, target_row, target_time,
                                asset, is_play_mode, status, payout, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '0', ?)",
            params![
                bet.id,
                bet.order_id,
                bet.user_id,
                bet.round_id,
                dts(bet.amount),
                bet.multiplier,
                bet.target_row,
                bet.target_time,
                bet.asset,
                bet.is_play_mode as i64,
                bet.status.as_str(),
                bet.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                anyhow!("duplicate order_id: {e}")
            }
            _ => anyhow!(e),
        })?;
        Ok(())
    }

    async fn get_bet_by_order_id(&self, order_id: &str) -> Result<Option<Bet>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, order_id, user_id, round_id, amount, multiplier, target_row, target_time,
                    asset, status, payout, hit_price, hit_row, hit_time, created_at, settled_at, is_play_mode
             FROM bets WHERE order_id = ?",
            params![order_id],
            Self::row_to_bet,
        )
        .optional()
        .context("get_bet_by_order_id")
    }

    async fn list_bets_by_status(&self, round_id: &str, status: BetStatus) -> Result<Vec<Bet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, order_id, user_id, round_id, amount, multiplier, target_row, target_time,
                    asset, status, payout, hit_price, hit_row, hit_time, created_at, settled_at, is_play_mode
             FROM bets WHERE round_id = ? AND status = ?",
        )?;
        let rows = stmt
            .query_map(params![round_id, status.as_str()], Self::row_to_bet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn settle_bet_and_credit(
        &self,
        bet: &Bet,
        to: BetStatus,
        payout: Decimal,
        hit: Option<HitDetails>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let (hit_price, hit_row, hit_time) = match hit {
            Some(h) => (Some(dts(h.hit_price)), Some(h.hit_row), Some(h.hit_time)),
            None => (None, None, None),
        };
        // Bets reach here straight off the tick loop's drain at `pending`,
        // but `settling` is also accepted unconditionally: a bet this sweep
        // reaches after a prior attempt crashed mid-update, or one a future
        // caller explicitly marked settling first, must still settle
        // exactly once rather than get silently skipped.
        let changed = tx.execute(
            "UPDATE bets SET status = ?, payout = ?, hit_price = ?, hit_row = ?, hit_time = ?, settled_at = ?
             WHERE id = ? AND status IN ('pending', 'settling')",
            params![
                to.as_str(),
                dts(payout),
                hit_price,
                hit_row,
                hit_time,
                Utc::now().to_rfc3339(),
                bet.id,
            ],
        )?;
        if changed != 1 {
            // Already settled by a previous attempt, a retry, or a
            // compensation sweep that beat us to it: nothing else to apply.
            tx.commit()?;
            return Ok(false);
        }

        // The balance credit, ledger row, and stat bump ride in the same
        // transaction as the status flip above: if any of these fail, the
        // whole settlement rolls back instead of leaving a bet permanently
        // WON/LOST with its payout never credited (a retry would see the
        // row already terminal and skip it, stranding the credit for good).
        let is_win = to == BetStatus::Won;
        if is_win && payout > Decimal::ZERO {
            Self::ensure_user(&tx, &bet.user_id).await?;
            let field = if bet.is_play_mode { "play_balance" } else { "balance" };
            let current: String = tx.query_row(
                &format!("SELECT {field} FROM users WHERE id = ?"),
                params![bet.user_id],
                |r| r.get(0),
            )?;
            let before = dec(current)?;
            let after = (before + payout).round_dp(2);
            tx.execute(
                &format!("UPDATE users SET {field} = ? WHERE id = ?"),
                params![dts(after), bet.user_id],
            )?;
            if !bet.is_play_mode {
                tx.execute(
                    "INSERT INTO transactions (id, user_id, transaction_type, amount, balance_before, balance_after, related_bet_id, remark, status, completed_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'completed', ?)",
                    params![
                        Uuid::new_v4().to_string(),
                        bet.user_id,
                        TransactionType::Win.as_str(),
                        dts(payout),
                        dts(before),
                        dts(after),
                        bet.id,
                        "bet won",
                        Utc::now().to_rfc3339(),
                    ],
                )?;
            }
            tx.execute(
                "UPDATE users SET total_wins = total_wins + 1 WHERE id = ?",
                params![bet.user_id],
            )?;
            let profit = (payout - bet.amount).round_dp(2);
            let current_profit: String = tx.query_row(
                "SELECT total_profit FROM users WHERE id = ?",
                params![bet.user_id],
                |r| r.get(0),
            )?;
            let updated_profit = (dec(current_profit)? + profit).round_dp(2);
            tx.execute(
                "UPDATE users SET total_profit = ? WHERE id = ?",
                params![dts(updated_profit), bet.user_id],
            )?;
        } else if !is_win {
            tx.execute(
                "UPDATE users SET total_losses = total_losses + 1 WHERE id = ?",
                params![bet.user_id],
            )?;
            let current_profit: String = tx.query_row(
                "SELECT total_profit FROM users WHERE id = ?",
                params![bet.user_id],
                |r| r.get(0),
            )?;
            let updated_profit = (dec(current_profit)? - bet.amount).round_dp(2);
            tx.execute(
                "UPDATE users SET total_profit = ? WHERE id = ?",
                params![dts(updated_profit), bet.user_id],
            )?;
        }

        tx.commit()?;
        Ok(true)
    }

    async fn refund_bet(&self, bet_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE bets SET status = 'refunded', settled_at = ?
             WHERE id = ? AND status IN ('pending', 'settling')",
            params![Utc::now().to_rfc3339(), bet_id],
        )?;
        Ok(changed == 1)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, balance, play_balance, total_bets, total_wins, total_losses, total_profit, active, silenced
             FROM users WHERE id = ?",
            params![user_id],
            Self::row_to_user,
        )
        .optional()
        .context("get_user")
    }

    async fn change_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        transaction_type: TransactionType,
        is_play_mode: bool,
        related_bet_id: Option<&str>,
        remark: Option<&str>,
    ) -> Result<BalanceChange> {
        let conn = self.conn.lock().await;
        Self::ensure_user(&conn, user_id).await?;
        let field = if is_play_mode { "play_balance" } else { "balance" };
        let current: String = conn.query_row(
            &format!("SELECT {field} FROM users WHERE id = ?"),
            params![user_id],
            |r| r.get(0),
        )?;
        let before = dec(current)?;
        let after = (before + amount).round_dp(2);
        conn.execute(
            &format!("UPDATE users SET {field} = ? WHERE id = ?"),
            params![dts(after), user_id],
        )?;
        if !is_play_mode {
            conn.execute(
                "INSERT INTO transactions (id, user_id, transaction_type, amount, balance_before, balance_after, related_bet_id, remark, status, completed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'completed', ?)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    transaction_type.as_str(),
                    dts(amount),
                    dts(before),
                    dts(after),
                    related_bet_id,
                    remark,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        Ok(BalanceChange {
            balance_before: before,
            balance_after: after,
        })
    }

    async fn conditional_change_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        min_balance: Decimal,
        transaction_type: TransactionType,
        is_play_mode: bool,
        related_bet_id: Option<&str>,
        remark: Option<&str>,
    ) -> Result<Option<BalanceChange>> {
        let conn = self.conn.lock().await;
        Self::ensure_user(&conn, user_id).await?;
        let field = if is_play_mode { "play_balance" } else { "balance" };
        let current: Option<String> = conn
            .query_row(
                &format!("SELECT {field} FROM users WHERE id = ?"),
                params![user_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(current) = current else { return Ok(None) };
        let before = dec(current)?;
        if before < min_balance {
            return Ok(None);
        }
        let after = (before + amount).round_dp(2);
        // Balances are stored as decimal-string TEXT, so a bare `{field} >=
        // ?` predicate would compare them under SQLite's BINARY/lexical
        // text collation (e.g. "100.00" >= "60.00" is false under text
        // ordering) instead of numerically. Cast both sides to REAL so the
        // guard matches the Rust-level `before < min_balance` check above.
        let changed = conn.execute(
            &format!("UPDATE users SET {field} = ? WHERE id = ? AND CAST({field} AS REAL) >= CAST(? AS REAL)"),
            params![dts(after), user_id, dts(min_balance)],
        )?;
        if changed != 1 {
            return Ok(None);
        }
        if !is_play_mode {
            conn.execute(
                "INSERT INTO transactions (id, user_id, transaction_type, amount, balance_before, balance_after, related_bet_id, remark, status, completed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'completed', ?)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    transaction_type.as_str(),
                    dts(amount),
                    dts(before),
                    dts(after),
                    related_bet_id,
                    remark,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        Ok(Some(BalanceChange {
            balance_before: before,
            balance_after: after,
        }))
    }

    async fn batch_change_balance(
        &self,
        user_id: &str,
        deltas: &[BalanceDelta],
        is_play_mode: bool,
    ) -> Result<BalanceChange> {
        let conn = self.conn.lock().await;
        Self::ensure_user(&conn, user_id).await?;
        let field = if is_play_mode { "play_balance" } else { "balance" };
        let current: String = conn.query_row(
            &format!("SELECT {field} FROM users WHERE id = ?"),
            params![user_id],
            |r| r.get(0),
        )?;
        let mut running = dec(current)?;
        let initial = running;
        for delta in deltas {
            let before = running;
            running = (running + delta.amount).round_dp(2);
            if !is_play_mode {
                conn.execute(
                    "INSERT INTO transactions (id, user_id, transaction_type, amount, balance_before, balance_after, related_bet_id, remark, status, completed_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'completed', ?)",
                    params![
                        Uuid::new_v4().to_string(),
                        user_id,
                        delta.transaction_type.as_str(),
                        dts(delta.amount),
                        dts(before),
                        dts(running),
                        delta.related_bet_id,
                        delta.remark,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
            }
        }
        conn.execute(
            &format!("UPDATE users SET {field} = ? WHERE id = ?"),
            params![dts(running), user_id],
        )?;
        Ok(BalanceChange {
            balance_before: initial,
            balance_after: running,
        })
    }

    async fn record_bet_stat(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::ensure_user(&conn, user_id).await?;
        conn.execute(
            "UPDATE users SET total_bets = total_bets + 1 WHERE id = ?",
            params![user_id],
        )?;
        Ok(())
    }

    async fn list_transactions(&self, user_id: &str, limit: usize) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, transaction_type, amount, balance_before, balance_after, related_bet_id, remark, completed_at
             FROM transactions WHERE user_id = ? ORDER BY completed_at DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], Self::row_to_transaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn list_recent_bets(&self, user_id: &str, limit: usize) -> Result<Vec<Bet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, order_id, user_id, round_id, amount, multiplier, target_row, target_time,
                    asset, status, payout, hit_price, hit_row, hit_time, created_at, settled_at, is_play_mode
             FROM bets WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], Self::row_to_bet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn get_house_pool(&self, asset: &str) -> Result<Option<HousePool>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT asset, balance, version FROM house_pools WHERE asset = ?",
            params![asset],
            |row| {
                let balance: String = row.get(1)?;
                Ok(HousePool {
                    asset: row.get(0)?,
                    balance: dec(balance).unwrap_or_default(),
                    version: row.get(2)?,
                })
            },
        )
        .optional()
        .context("get_house_pool")
    }

    async fn initialize_house_pool(&self, asset: &str, initial: Decimal) -> Result<HousePool> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO house_pools (asset, balance, version) VALUES (?, ?, 0)",
            params![asset, dts(initial)],
        )?;
        conn.query_row(
            "SELECT asset, balance, version FROM house_pools WHERE asset = ?",
            params![asset],
            |row| {
                let balance: String = row.get(1)?;
                Ok(HousePool {
                    asset: row.get(0)?,
                    balance: dec(balance).unwrap_or_default(),
                    version: row.get(2)?,
                })
            },
        )
        .context("initialize_house_pool")
    }

    async fn try_apply_house_pool_delta(
        &self,
        asset: &str,
        delta: Decimal,
        expected_version: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let current: String = conn.query_row(
            "SELECT balance FROM house_pools WHERE asset = ? AND version = ?",
            params![asset, expected_version],
            |r| r.get(0),
        )?;
        let new_balance = (dec(current)? + delta).round_dp(2);
        let changed = conn.execute(
            "UPDATE house_pools SET balance = ?, version = version + 1 WHERE asset = ? AND version = ?",
            params![dts(new_balance), asset, expected_version],
        )?;
        Ok(changed == 1)
    }

    async fn insert_price_snapshots(&self, snapshots: &[PriceSnapshot]) -> Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO price_snapshots (round_id, timestamp, price, row_index) VALUES (?, ?, ?, ?)",
            )?;
            for snap in snapshots {
                stmt.execute(params![
                    snap.round_id,
                    snap.timestamp,
                    dts(snap.price),
                    snap.row_index
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn insert_and_fetch_round() {
        let store = SqliteStore::in_memory().unwrap();
        let round = Round {
            id: "r1".into(),
            asset: "BTC-USD".into(),
            status: RoundStatus::Betting,
            start_price: dec!(100),
            end_price: None,
            started_at: Utc::now(),
            ended_at: None,
            total_bets: 0,
            total_volume: dec!(0),
            total_payout: dec!(0),
        };
        store.insert_round(&round).await.unwrap();
        let fetched = store.get_round("r1").await.unwrap().unwrap();
        assert_eq!(fetched.status, RoundStatus::Betting);
        assert_eq!(fetched.start_price, dec!(100));
    }

    #[tokio::test]
    async fn conditional_status_update_only_succeeds_once() {
        let store = SqliteStore::in_memory().unwrap();
        let round = Round {
            id: "r1".into(),
            asset: "BTC-USD".into(),
            status: RoundStatus::Betting,
            start_price: dec!(100),
            end_price: None,
            started_at: Utc::now(),
            ended_at: None,
            total_bets: 0,
            total_volume: dec!(0),
            total_payout: dec!(0),
        };
        store.insert_round(&round).await.unwrap();
        let first = store
            .conditional_update_round_status("r1", RoundStatus::Betting, RoundStatus::Running)
            .await
            .unwrap();
        assert!(first);
        let second = store
            .conditional_update_round_status("r1", RoundStatus::Betting, RoundStatus::Running)
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn conditional_change_balance_rejects_when_insufficient() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .change_balance("u1", dec!(50), TransactionType::Deposit, false, None, None)
            .await
            .unwrap();
        let ok = store
            .conditional_change_balance(
                "u1",
                dec!(-60),
                dec!(60),
                TransactionType::Bet,
                false,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(ok.is_none());
        let ok = store
            .conditional_change_balance(
                "u1",
                dec!(-40),
                dec!(40),
                TransactionType::Bet,
                false,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(ok.is_some());
    }

    #[tokio::test]
    async fn duplicate_order_id_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let bet = Bet {
            id: "b1".into(),
            order_id: "o1".into(),
            user_id: "u1".into(),
            round_id: "r1".into(),
            amount: dec!(10),
            multiplier: 2.0,
            target_row: 6.5,
            target_time: 2.0,
            asset: "BTC-USD".into(),
            is_play_mode: false,
            status: BetStatus::Pending,
            payout: dec!(0),
            hit_price: None,
            hit_row: None,
            hit_time: None,
            created_at: Utc::now(),
            settled_at: None,
        };
        store.insert_bet(&bet).await.unwrap();
        let mut dup = bet.clone();
        dup.id = "b2".into();
        let result = store.insert_bet(&dup).await;
        assert!(result.is_err());
    }
}
