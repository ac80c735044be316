// =============================================================================
// Trade Write Buffer — batched, at-least-once persistence
// =============================================================================
//
// Appends go to a bounded queue. A timer drains at most `batch_size` trades per
// tick and bulk-inserts them; a failed insert puts the batch back at the front
// so it is retried first on the next tick. The store dedupes by id, so a retry
// after a partial success cannot create duplicate rows.
//
// The flush path swaps the whole queue out (take-and-replace) and only locks
// again to hand back the remainder, so appends never wait on a storage round
// trip.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::trade_store::TradeStore;
use crate::types::Trade;

/// What a single flush tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Idle,
    Persisted { attempted: usize, inserted: usize },
    Requeued { count: usize },
}

pub struct TradeBuffer {
    pending: Mutex<VecDeque<Trade>>,
    batch_size: usize,
    capacity: usize,
}

impl TradeBuffer {
    pub fn new(batch_size: usize, capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            capacity: capacity.max(batch_size.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append trades. Returns how many buffered trades were dropped to stay
    /// within capacity.
    pub fn push(&self, trades: impl IntoIterator<Item = Trade>) -> usize {
        let mut pending = self.pending.lock();
        pending.extend(trades);
        self.enforce_capacity(&mut pending)
    }

    /// Remove up to one batch from the front.
    pub fn take_batch(&self) -> Vec<Trade> {
        let mut taken = std::mem::take(&mut *self.pending.lock());
        if taken.len() > self.batch_size {
            let rest = taken.split_off(self.batch_size);
            let mut pending = self.pending.lock();
            // Anything appended while we held the swapped-out queue goes after
            // the remainder.
            let appended = std::mem::replace(&mut *pending, rest);
            pending.extend(appended);
        }
        taken.into()
    }

    /// Put a failed batch back at the front, preserving its order.
    pub fn requeue_front(&self, batch: Vec<Trade>) -> usize {
        let mut pending = self.pending.lock();
        for trade in batch.into_iter().rev() {
            pending.push_front(trade);
        }
        self.enforce_capacity(&mut pending)
    }

    fn enforce_capacity(&self, pending: &mut VecDeque<Trade>) -> usize {
        let mut dropped = 0;
        while pending.len() > self.capacity {
            let n = self.batch_size.min(pending.len());
            pending.drain(..n);
            dropped += n;
        }
        if dropped > 0 {
            error!(
                dropped,
                capacity = self.capacity,
                "trade buffer saturated, oldest unpersisted batch dropped"
            );
        }
        dropped
    }

    /// Drain one batch into `store`.
    pub async fn flush_once(&self, store: &dyn TradeStore) -> FlushOutcome {
        let batch = self.take_batch();
        if batch.is_empty() {
            return FlushOutcome::Idle;
        }

        match store.insert_batch(&batch).await {
            Ok(inserted) => {
                debug!(attempted = batch.len(), inserted, "trade batch persisted");
                FlushOutcome::Persisted {
                    attempted: batch.len(),
                    inserted,
                }
            }
            Err(e) => {
                let count = batch.len();
                warn!(error = %e, count, "trade batch insert failed, requeued");
                self.requeue_front(batch);
                FlushOutcome::Requeued { count }
            }
        }
    }

    /// Flush on a fixed interval until cancelled, then make one last attempt
    /// per remaining batch.
    pub async fn run_flusher(
        self: Arc<Self>,
        store: Arc<dyn TradeStore>,
        every: Duration,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.flush_once(store.as_ref()).await;
                }
            }
        }

        while !self.is_empty() {
            if let FlushOutcome::Requeued { count } = self.flush_once(store.as_ref()).await {
                warn!(count, "final trade flush failed, remaining trades discarded");
                break;
            }
        }
        info!("trade flusher stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
