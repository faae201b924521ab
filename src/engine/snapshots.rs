//! SnapshotBuffer (§4.6): rate-limited capture and batched, backoff-
//! retrying flush of (time, price, row) samples.
//!
//! Grounded on the teacher's `VecDeque`-based ring buffers (`risk.rs`'s
//! `VecDeque`-with-`max_history`-and-`pop_front` eviction style); the
//! flush loop's batch-then-backoff shape mirrors
//! `settlement_engine.rs`'s drain loop (§4.7).

use crate::models::PriceSnapshot;
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

pub struct SnapshotBuffer {
    buffer: Mutex<VecDeque<PriceSnapshot>>,
    capacity: usize,
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Appends a sample, dropping the oldest entry via the head index on
    /// overflow (no array shift).
    pub fn push(&self, snapshot: PriceSnapshot) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(snapshot);
    }

    fn drain_batch(&self, max: usize) -> Vec<PriceSnapshot> {
        let mut buffer = self.buffer.lock();
        let n = max.min(buffer.len());
        buffer.drain(..n).collect()
    }

    /// Puts an un-written batch back at the front, respecting the capacity
    /// bound (oldest entries overall are dropped, never the batch itself).
    fn requeue_front(&self, mut batch: Vec<PriceSnapshot>) {
        let mut buffer = self.buffer.lock();
        while buffer.len() + batch.len() > self.capacity && !buffer.is_empty() {
            buffer.pop_back();
        }
        for item in batch.drain(..).rev() {
            buffer.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

/// Background flush coroutine: drains up to `batch_size` entries on a
/// fixed tick, writes them through `Store`; on failure the un-written
/// remainder is requeued and a bounded exponential backoff suppresses the
/// next attempt.
pub async fn run_flush_loop(
    buffer: Arc<SnapshotBuffer>,
    store: Arc<dyn Store>,
    batch_size: usize,
    backoff_min: Duration,
    backoff_max: Duration,
    mut shutdown: tokio::sync::mpsc::Receiver<()>,
) {
    let mut backoff = backoff_min;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                flush_all(&buffer, &store, batch_size, Duration::from_secs(30)).await;
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        if buffer.is_empty() {
            continue;
        }
        let batch = buffer.drain_batch(batch_size);
        if batch.is_empty() {
            continue;
        }
        match store.insert_price_snapshots(&batch).await {
            Ok(()) => {
                backoff = backoff_min;
            }
            Err(err) => {
                warn!(error = %err, count = batch.len(), "snapshot flush failed, requeuing");
                buffer.requeue_front(batch);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(backoff_max);
            }
        }
    }
}

/// Drains the buffer fully (modulo a wall-clock ceiling), used at round
/// end. Snapshots are diagnostic, not authoritative, so giving up once the
/// timeout elapses is acceptable (§3).
pub async fn flush_all(
    buffer: &Arc<SnapshotBuffer>,
    store: &Arc<dyn Store>,
    batch_size: usize,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !buffer.is_empty() && tokio::time::Instant::now() < deadline {
        let batch = buffer.drain_batch(batch_size);
        if batch.is_empty() {
            break;
        }
        if let Err(err) = store.insert_price_snapshots(&batch).await {
            error!(error = %err, count = batch.len(), "final snapshot flush failed, samples dropped");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(round_id: &str, t: f64) -> PriceSnapshot {
        PriceSnapshot {
            round_id: round_id.to_string(),
            timestamp: t,
            price: dec!(100),
            row_index: 6.5,
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let buffer = SnapshotBuffer::new(2);
        buffer.push(sample("r1", 1.0));
        buffer.push(sample("r1", 2.0));
        buffer.push(sample("r1", 3.0));
        assert_eq!(buffer.len(), 2);
        let drained = buffer.drain_batch(10);
        assert_eq!(drained[0].timestamp, 2.0);
        assert_eq!(drained[1].timestamp, 3.0);
    }

    #[test]
    fn requeue_preserves_capacity_bound() {
        let buffer = SnapshotBuffer::new(3);
        buffer.push(sample("r1", 1.0));
        let batch = vec![sample("r1", 2.0), sample("r1", 3.0), sample("r1", 4.0)];
        buffer.requeue_front(batch);
        assert_eq!(buffer.len(), 3);
    }
}
