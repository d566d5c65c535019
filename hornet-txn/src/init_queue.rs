//! Per-partition init queue for distributed transactions.
//!
//! Entries drain in `(txn id, site id)` order, which is the global
//! commit-precedence order; every partition agrees on it, so lock
//! acquisition across partitions is deadlock-free.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use hornet_common::ids::{SiteId, TxnId};
use hornet_common::partition_set::PartitionSet;

use crate::init_callback::TransactionInitCallback;

/// One queued transaction awaiting this partition's lock.
#[derive(Debug, Clone)]
pub struct InitQueueEntry {
    /// Transaction id; the primary ordering key.
    pub txn_id: TxnId,
    /// Originating site; breaks ordering ties.
    pub site_id: SiteId,
    /// Every partition the transaction needs.
    pub partitions: PartitionSet,
    /// Accumulation callback to notify on grant or rejection.
    pub callback: Arc<TransactionInitCallback>,
    /// When the entry was queued; feeds init-timeout expiry.
    pub enqueued_at: Instant,
}

/// Outcome of offering an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Entry inserted.
    Accepted,
    /// An entry with this transaction id is already queued; nothing changed.
    Duplicate,
    /// The partition has already granted a larger id, so this transaction
    /// can no longer be ordered here; the coordinator should retry once the
    /// blocker finishes.
    Rejected {
        /// Largest transaction id this partition has granted.
        blocker: TxnId,
    },
}

/// Priority queue over init entries, ordered by transaction id ascending.
#[derive(Debug, Default)]
pub struct TransactionInitQueue {
    entries: BTreeMap<(TxnId, SiteId), InitQueueEntry>,
    last_granted: Option<TxnId>,
}

impl TransactionInitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry unless it duplicates a queued id or arrives below
    /// the granted watermark.
    pub fn offer(&mut self, entry: InitQueueEntry) -> Offer {
        if let Some(granted) = self.last_granted
            && entry.txn_id < granted
        {
            return Offer::Rejected { blocker: granted };
        }
        if self.contains(entry.txn_id) {
            return Offer::Duplicate;
        }
        let key = (entry.txn_id, entry.site_id);
        let _ = self.entries.insert(key, entry);
        Offer::Accepted
    }

    /// Pops the head entry when the partition can admit it: either no
    /// transaction holds the partition, or the holder is the head itself
    /// (an idempotent re-notify).
    pub fn poll_if_head_ready(&mut self, holder: Option<TxnId>) -> Option<InitQueueEntry> {
        let head_key = *self.entries.keys().next()?;
        match holder {
            None => {}
            Some(holder_id) if holder_id == head_key.0 => {}
            Some(_) => return None,
        }
        let entry = self.entries.remove(&head_key)?;
        self.last_granted = Some(match self.last_granted {
            Some(granted) => granted.max(entry.txn_id),
            None => entry.txn_id,
        });
        Some(entry)
    }

    /// Removes and returns the entry for a transaction id.
    pub fn remove(&mut self, txn_id: TxnId) -> Option<InitQueueEntry> {
        let key = *self
            .entries
            .range((txn_id, SiteId::MIN)..=(txn_id, SiteId::MAX))
            .next()?
            .0;
        self.entries.remove(&key)
    }

    /// Returns whether a transaction id is queued.
    #[must_use]
    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.entries
            .range((txn_id, SiteId::MIN)..=(txn_id, SiteId::MAX))
            .next()
            .is_some()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Transaction id at the head, if any.
    #[must_use]
    pub fn head_id(&self) -> Option<TxnId> {
        self.entries.keys().next().map(|(txn_id, _)| *txn_id)
    }

    /// Largest transaction id granted by this partition so far.
    #[must_use]
    pub fn last_granted(&self) -> Option<TxnId> {
        self.last_granted
    }

    /// Drains entries older than `timeout` relative to `now`.
    pub fn drain_expired(&mut self, now: Instant, timeout: std::time::Duration) -> Vec<InitQueueEntry> {
        let expired_keys = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.enqueued_at) >= timeout)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        expired_keys
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{InitQueueEntry, Offer, TransactionInitQueue};
    use crate::init_callback::TransactionInitCallback;
    use googletest::prelude::*;
    use hornet_common::partition_set::PartitionSet;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn entry(txn_id: u64) -> InitQueueEntry {
        InitQueueEntry {
            txn_id,
            site_id: 0,
            partitions: PartitionSet::from(&[0_u32, 1][..]),
            callback: Arc::new(TransactionInitCallback::new()),
            enqueued_at: Instant::now(),
        }
    }

    #[rstest]
    fn entries_drain_in_id_order_regardless_of_arrival() {
        let mut queue = TransactionInitQueue::new();
        assert_that!(queue.offer(entry(20)), eq(Offer::Accepted));
        assert_that!(queue.offer(entry(10)), eq(Offer::Accepted));

        let first = queue.poll_if_head_ready(None).expect("head must be ready");
        assert_that!(first.txn_id, eq(10));
        // The remaining head waits while txn 10 holds the partition.
        assert_that!(queue.poll_if_head_ready(Some(10)).is_none(), eq(true));
    }

    #[rstest]
    fn holder_blocks_the_head_until_released() {
        let mut queue = TransactionInitQueue::new();
        let _ = queue.offer(entry(10));
        let _ = queue.offer(entry(20));
        let first = queue.poll_if_head_ready(None).expect("head must be ready");
        assert_that!(first.txn_id, eq(10));

        assert_that!(queue.poll_if_head_ready(Some(10)).is_none(), eq(true));
        let second = queue
            .poll_if_head_ready(None)
            .expect("head must be ready after release");
        assert_that!(second.txn_id, eq(20));
    }

    #[rstest]
    fn re_offer_of_the_holder_is_granted_again() {
        let mut queue = TransactionInitQueue::new();
        let _ = queue.offer(entry(10));
        let first = queue.poll_if_head_ready(None).expect("head must be ready");
        assert_that!(first.txn_id, eq(10));

        assert_that!(queue.offer(entry(10)), eq(Offer::Accepted));
        let renotify = queue
            .poll_if_head_ready(Some(10))
            .expect("holder re-notify must be granted");
        assert_that!(renotify.txn_id, eq(10));
    }

    #[rstest]
    fn duplicate_offer_is_refused_without_change() {
        let mut queue = TransactionInitQueue::new();
        let _ = queue.offer(entry(10));
        assert_that!(queue.offer(entry(10)), eq(Offer::Duplicate));
        assert_that!(queue.size(), eq(1_usize));
    }

    #[rstest]
    fn late_smaller_id_is_rejected_with_the_granted_blocker() {
        let mut queue = TransactionInitQueue::new();
        let _ = queue.offer(entry(20));
        let granted = queue.poll_if_head_ready(None).expect("head must be ready");
        assert_that!(granted.txn_id, eq(20));

        assert_that!(queue.offer(entry(10)), eq(Offer::Rejected { blocker: 20 }));
        assert_that!(queue.contains(10), eq(false));
    }

    #[rstest]
    fn offer_then_remove_leaves_the_queue_unchanged() {
        let mut queue = TransactionInitQueue::new();
        let _ = queue.offer(entry(10));
        let before = queue.size();
        let _ = queue.offer(entry(15));
        let removed = queue.remove(15).expect("entry must be removable");
        assert_that!(removed.txn_id, eq(15));
        assert_that!(queue.size(), eq(before));
        assert_that!(queue.head_id(), eq(Some(10)));
    }

    #[rstest]
    fn expired_entries_drain_after_the_timeout() {
        let mut queue = TransactionInitQueue::new();
        let mut old = entry(10);
        old.enqueued_at = Instant::now() - Duration::from_secs(60);
        let _ = queue.offer(old);
        let _ = queue.offer(entry(20));

        let expired = queue.drain_expired(Instant::now(), Duration::from_secs(5));
        assert_that!(expired.len(), eq(1_usize));
        assert_that!(expired[0].txn_id, eq(10));
        assert_that!(queue.size(), eq(1_usize));
    }
}
