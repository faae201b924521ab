//! PriceFeed (§4.1): single long-lived connection to an external trade
//! stream for one asset.
//!
//! Grounded on `scrapers::dome_websocket::DomeWebSocketClient`'s
//! `run`/`connect_and_stream` split: an outer loop applying exponential
//! backoff (capped per spec at 30s, not the teacher's 60s) around an inner
//! loop that subscribes, sends keepalives, and parses each trade frame.
//! Cache writes go through the same `CacheStore` the rest of the engine
//! depends on (§6), sampled to at most one write per `CACHE_SAMPLE_INTERVAL`
//! to bound I/O, mirroring `scrapers::binance_price_feed`'s downsampling of
//! its in-memory trade history.

use crate::config::{PRICE_CRITICAL_SECS, PRICE_STALE_SECS};
use crate::locks::CacheStore;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const MAX_RECONNECT_ATTEMPTS: u32 = 20;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const CACHE_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Events the health timer and reconnect loop emit for the engine (and any
/// other observer, e.g. an ops dashboard) to react to.
#[derive(Debug, Clone)]
pub enum PriceFeedEvent {
    Price { price: Decimal, at_ms: i64 },
    Stale,
    Critical,
    CriticalFailure,
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    channel: &'a str,
    symbol: &'a str,
}

/// Trade frame shape tolerant of the two most common field namings
/// (`price`/`timestamp` vs the terser `p`/`t`) so the feed isn't wedded to
/// one upstream's exact schema — the framing detail spec §4.1 says stays
/// isolated inside this module.
#[derive(Debug, Deserialize)]
struct TradeMessage {
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    p: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    t: Option<i64>,
}

impl TradeMessage {
    fn price(&self) -> Option<Decimal> {
        self.price
            .as_deref()
            .or(self.p.as_deref())
            .and_then(|s| Decimal::from_str(s).ok())
    }

    fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp.or(self.t)
    }
}

/// Reconnecting price feed for one asset. `start()` spawns its background
/// tasks and returns immediately; `stop()` is idempotent and cancels them
/// synchronously via an atomic flag the tasks poll on every iteration.
pub struct PriceFeed {
    asset: String,
    url: String,
    cache: Arc<dyn CacheStore>,
    events: broadcast::Sender<PriceFeedEvent>,
    stopped: Arc<AtomicBool>,
}

impl PriceFeed {
    pub fn new(
        asset: String,
        url: String,
        cache: Arc<dyn CacheStore>,
    ) -> (Arc<Self>, broadcast::Receiver<PriceFeedEvent>) {
        let (events, rx) = broadcast::channel(256);
        let feed = Arc::new(Self {
            asset,
            url,
            cache,
            events,
            stopped: Arc::new(AtomicBool::new(false)),
        });
        (feed, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceFeedEvent> {
        self.events.subscribe()
    }

    /// The last price if fresher than `PRICE_STALE_SECS`, else none.
    pub fn latest_price(&self) -> Option<(Decimal, Instant)> {
        self.cache
            .get_latest_price(&self.asset)
            .filter(|(_, at)| at.elapsed().as_secs_f64() < PRICE_STALE_SECS)
    }

    pub fn is_available(&self) -> bool {
        self.latest_price().is_some()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn start(self: &Arc<Self>) {
        let feed = self.clone();
        tokio::spawn(async move { feed.run_reconnect_loop().await });
        let feed = self.clone();
        tokio::spawn(async move { feed.run_health_timer().await });
    }

    async fn run_reconnect_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(1);
        let mut attempts = 0u32;
        while !self.stopped.load(Ordering::SeqCst) {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!(asset = %self.asset, "price feed connection closed, reconnecting");
                    backoff = Duration::from_secs(1);
                    attempts = 0;
                }
                Err(err) => {
                    attempts += 1;
                    warn!(asset = %self.asset, error = %err, attempt = attempts, "price feed connection error");
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        error!(asset = %self.asset, "price feed exhausted reconnect attempts");
                        let _ = self.events.send(PriceFeedEvent::CriticalFailure);
                        return;
                    }
                }
            }
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect_and_stream(&self) -> anyhow::Result<()> {
        info!(asset = %self.asset, url = %self.url, "connecting to price feed");
        let (ws_stream, response) = connect_async(&self.url).await?;
        debug!(status = %response.status(), "price feed connected");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeMessage {
            msg_type: "subscribe",
            channel: "trades",
            symbol: &self.asset,
        };
        write
            .send(Message::Text(serde_json::to_string(&subscribe)?))
            .await?;

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately; consume it

        let mut last_sample_at = Instant::now() - CACHE_SAMPLE_INTERVAL;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            tokio::select! {
                _ = keepalive.tick() => {
                    if write.send(Message::Text("{\"type\":\"ping\"}".to_string())).await.is_err() {
                        return Err(anyhow::anyhow!("keepalive send failed"));
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(trade) = serde_json::from_str::<TradeMessage>(&text) {
                                if let (Some(price), Some(ts)) = (trade.price(), trade.timestamp_ms()) {
                                    let now = Instant::now();
                                    if now.duration_since(last_sample_at) >= CACHE_SAMPLE_INTERVAL {
                                        last_sample_at = now;
                                        self.cache.set_latest_price(&self.asset, price, now);
                                    }
                                    let _ = self.events.send(PriceFeedEvent::Price { price, at_ms: ts });
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
            }
        }
    }

    /// Independent 1s health timer: watches the age of the cached price
    /// rather than the connection state, so a connection that stops
    /// delivering trades (without closing) is still caught.
    async fn run_health_timer(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        let mut was_stale = false;
        let mut was_critical = false;
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let age = self
                .cache
                .get_latest_price(&self.asset)
                .map(|(_, at)| at.elapsed().as_secs_f64());

            match age {
                Some(age) if age > PRICE_CRITICAL_SECS => {
                    if !was_critical {
                        was_critical = true;
                        let _ = self.events.send(PriceFeedEvent::Critical);
                    }
                }
                Some(age) if age > PRICE_STALE_SECS => {
                    was_critical = false;
                    if !was_stale {
                        was_stale = true;
                        let _ = self.events.send(PriceFeedEvent::Stale);
                    }
                }
                Some(_) => {
                    was_stale = false;
                    was_critical = false;
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::InProcessCache;

    #[test]
    fn trade_message_accepts_either_field_naming() {
        let long: TradeMessage = serde_json::from_str(r#"{"price":"100.5","timestamp":1000}"#).unwrap();
        assert_eq!(long.price(), Some(Decimal::from_str("100.5").unwrap()));
        assert_eq!(long.timestamp_ms(), Some(1000));

        let short: TradeMessage = serde_json::from_str(r#"{"p":"99.1","t":2000}"#).unwrap();
        assert_eq!(short.price(), Some(Decimal::from_str("99.1").unwrap()));
        assert_eq!(short.timestamp_ms(), Some(2000));
    }

    #[test]
    fn latest_price_is_none_once_stale() {
        let cache: Arc<dyn CacheStore> = Arc::new(InProcessCache::new());
        let (feed, _rx) = PriceFeed::new("BTC-USD".to_string(), "wss://example.invalid".to_string(), cache.clone());
        assert!(feed.latest_price().is_none());

        cache.set_latest_price("BTC-USD", Decimal::from_str("100").unwrap(), Instant::now());
        assert!(feed.latest_price().is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let cache: Arc<dyn CacheStore> = Arc::new(InProcessCache::new());
        let (feed, _rx) = PriceFeed::new("BTC-USD".to_string(), "wss://example.invalid".to_string(), cache);
        feed.stop();
        feed.stop();
        assert!(feed.stopped.load(Ordering::SeqCst));
    }
}
