//! Site-wide orchestration of the per-partition init queues.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::debug;

use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{PartitionId, SiteId, TxnId};
use hornet_common::partition_set::PartitionSet;

use crate::init_callback::TransactionInitCallback;
use crate::init_queue::{InitQueueEntry, Offer, TransactionInitQueue};
use crate::messages::InitStatus;

#[derive(Debug, Default)]
struct PartitionQueueState {
    queue: TransactionInitQueue,
    holder: Option<TxnId>,
}

/// A rejected transaction waiting out its restart delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartEntry {
    /// The rejected transaction.
    pub txn_id: TxnId,
    /// How many rejections this transaction has absorbed so far.
    pub attempts: u32,
    /// Earliest instant the coordinator should re-register it.
    pub retry_at: Instant,
}

/// Coordinates init queues across the local partitions of one site.
///
/// Each partition's queue state sits behind its own mutex; the manager never
/// holds two partition locks at once, and callback notifications run outside
/// any lock.
#[derive(Debug)]
pub struct TransactionQueueManager {
    local_partitions: Vec<PartitionId>,
    queues: HashMap<PartitionId, Mutex<PartitionQueueState>>,
    restart: Mutex<VecDeque<RestartEntry>>,
    blocked: Mutex<HashMap<TxnId, u64>>,
    restart_delay: Duration,
}

impl TransactionQueueManager {
    /// Creates a manager for the given local partitions.
    #[must_use]
    pub fn new(local_partitions: Vec<PartitionId>, restart_delay: Duration) -> Self {
        let queues = local_partitions
            .iter()
            .map(|partition| (*partition, Mutex::new(PartitionQueueState::default())))
            .collect();
        Self {
            local_partitions,
            queues,
            restart: Mutex::new(VecDeque::new()),
            blocked: Mutex::new(HashMap::new()),
            restart_delay,
        }
    }

    /// Local partitions managed by this site.
    #[must_use]
    pub fn local_partitions(&self) -> &[PartitionId] {
        &self.local_partitions
    }

    /// Lists the local partitions inside a transaction's partition set.
    #[must_use]
    pub fn local_partitions_in(&self, partitions: &PartitionSet) -> Vec<PartitionId> {
        self.local_partitions
            .iter()
            .copied()
            .filter(|partition| partitions.contains(*partition))
            .collect()
    }

    /// Inserts a transaction into the init queue of every local partition it
    /// touches. Grants are issued by [`Self::check_queues`], so transactions
    /// registered between two check passes drain in id order no matter in
    /// which order they arrived.
    ///
    /// A queue rejection is reported through the callback (`AbortReject`
    /// with the rejecting partition and blocker id) and schedules the
    /// transaction for restart; it is not an error of this call.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction touches no local partition.
    pub fn register(
        &self,
        txn_id: TxnId,
        site_id: SiteId,
        partitions: &PartitionSet,
        attempts: u32,
        callback: &Arc<TransactionInitCallback>,
    ) -> HornetResult<()> {
        let locals = self.local_partitions_in(partitions);
        if locals.is_empty() {
            return Err(HornetError::InvalidConfig(
                "transaction init touches no local partition",
            ));
        }

        let mut offered = Vec::with_capacity(locals.len());
        for partition in &locals {
            let offer = {
                let mut state = self.lock_partition(*partition)?;
                state.queue.offer(InitQueueEntry {
                    txn_id,
                    site_id,
                    partitions: partitions.clone(),
                    callback: Arc::clone(callback),
                    enqueued_at: Instant::now(),
                })
            };
            match offer {
                Offer::Accepted => offered.push(*partition),
                Offer::Duplicate => {
                    debug!(txn_id, partition, "init entry already queued");
                }
                Offer::Rejected { blocker } => {
                    self.record_blocked(blocker);
                    for queued in offered {
                        let _ = self.remove_entry(txn_id, queued);
                    }
                    callback.abort(InitStatus::AbortReject, Some(*partition), Some(blocker));
                    self.schedule_restart(txn_id, attempts.saturating_add(1));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Drives every local queue: grants each ready head in id order.
    ///
    /// # Errors
    ///
    /// Returns an error when a partition id is not local to this site.
    pub fn check_queues(&self) -> HornetResult<()> {
        for partition in &self.local_partitions {
            self.check_partition(*partition)?;
        }
        Ok(())
    }

    /// Drives one partition's queue.
    ///
    /// # Errors
    ///
    /// Returns an error when the partition is not local to this site.
    pub fn check_partition(&self, partition: PartitionId) -> HornetResult<()> {
        loop {
            let entry = {
                let mut state = self.lock_partition(partition)?;
                let holder = state.holder;
                let Some(entry) = state.queue.poll_if_head_ready(holder) else {
                    break;
                };
                state.holder = Some(entry.txn_id);
                entry
            };
            debug!(txn_id = entry.txn_id, partition, "partition lock granted");
            entry.callback.granted(partition);
        }
        Ok(())
    }

    /// Releases a partition held by `txn_id` and re-checks its queue.
    ///
    /// # Errors
    ///
    /// Returns an error when the partition is not local to this site.
    pub fn finished(&self, txn_id: TxnId, partition: PartitionId) -> HornetResult<()> {
        {
            let mut state = self.lock_partition(partition)?;
            if state.holder == Some(txn_id) {
                state.holder = None;
            }
            let _ = state.queue.remove(txn_id);
        }
        self.check_partition(partition)
    }

    /// Removes a transaction from the remaining local queues and signals the
    /// abort through its callback.
    ///
    /// # Errors
    ///
    /// Returns an error when a partition id is not local to this site.
    pub fn reject(
        &self,
        txn_id: TxnId,
        rejecting_partition: PartitionId,
        blocker: TxnId,
        attempts: u32,
    ) -> HornetResult<()> {
        self.record_blocked(blocker);
        let mut callback = None;
        for partition in &self.local_partitions {
            if let Some(entry) = self.remove_entry(txn_id, *partition)? {
                callback = Some(entry.callback);
            }
        }
        if let Some(callback) = callback {
            callback.abort(
                InitStatus::AbortReject,
                Some(rejecting_partition),
                Some(blocker),
            );
        }
        self.schedule_restart(txn_id, attempts.saturating_add(1));
        Ok(())
    }

    /// Expires init entries older than `timeout`, aborting their callbacks
    /// with `AbortTimeout`.
    ///
    /// Returns the number of transactions expired.
    pub fn expire_timed_out(&self, now: Instant, timeout: Duration) -> usize {
        let mut expired_txns = HashMap::new();
        for partition in &self.local_partitions {
            let Ok(mut state) = self.lock_partition(*partition) else {
                continue;
            };
            for entry in state.queue.drain_expired(now, timeout) {
                let _ = expired_txns.entry(entry.txn_id).or_insert(entry.callback);
            }
        }
        let count = expired_txns.len();
        for (txn_id, callback) in expired_txns {
            debug!(txn_id, "init round timed out");
            for partition in &self.local_partitions {
                let _ = self.remove_entry(txn_id, *partition);
            }
            callback.abort(InitStatus::AbortTimeout, None, None);
        }
        count
    }

    /// Appends a rejected transaction to the restart queue.
    pub fn schedule_restart(&self, txn_id: TxnId, attempts: u32) {
        let entry = RestartEntry {
            txn_id,
            attempts,
            retry_at: Instant::now() + self.restart_delay,
        };
        self.lock_restart().push_back(entry);
    }

    /// Drains restart entries whose delay has elapsed.
    #[must_use]
    pub fn poll_restarts(&self, now: Instant) -> Vec<RestartEntry> {
        let mut restart = self.lock_restart();
        let mut due = Vec::new();
        while let Some(entry) = restart.front() {
            if entry.retry_at > now {
                break;
            }
            if let Some(entry) = restart.pop_front() {
                due.push(entry);
            }
        }
        due
    }

    /// Depth of one partition's init queue.
    #[must_use]
    pub fn queue_depth(&self, partition: PartitionId) -> usize {
        self.lock_partition(partition)
            .map(|state| state.queue.size())
            .unwrap_or(0)
    }

    /// Transaction currently holding one partition's lock.
    #[must_use]
    pub fn holder(&self, partition: PartitionId) -> Option<TxnId> {
        self.lock_partition(partition)
            .ok()
            .and_then(|state| state.holder)
    }

    /// Snapshot of the blocked histogram, most frequent blockers first.
    #[must_use]
    pub fn blocked_histogram(&self) -> Vec<(TxnId, u64)> {
        let blocked = self
            .blocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut entries = blocked
            .iter()
            .map(|(txn_id, count)| (*txn_id, *count))
            .collect::<Vec<_>>();
        entries.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));
        entries
    }

    fn remove_entry(
        &self,
        txn_id: TxnId,
        partition: PartitionId,
    ) -> HornetResult<Option<InitQueueEntry>> {
        let mut state = self.lock_partition(partition)?;
        Ok(state.queue.remove(txn_id))
    }

    fn record_blocked(&self, blocker: TxnId) {
        let mut blocked = self
            .blocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *blocked.entry(blocker).or_insert(0) += 1;
    }

    fn lock_partition(
        &self,
        partition: PartitionId,
    ) -> HornetResult<MutexGuard<'_, PartitionQueueState>> {
        let state = self
            .queues
            .get(&partition)
            .ok_or(HornetError::InvalidState("partition is not local to this site"))?;
        Ok(state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_restart(&self) -> MutexGuard<'_, VecDeque<RestartEntry>> {
        self.restart.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionQueueManager;
    use crate::init_callback::TransactionInitCallback;
    use crate::messages::{InitStatus, TransactionInitResponse};
    use googletest::prelude::*;
    use hornet_common::partition_set::PartitionSet;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn manager() -> TransactionQueueManager {
        TransactionQueueManager::new(vec![0, 1], Duration::from_millis(1))
    }

    fn armed_callback(
        txn_id: u64,
        locals: Vec<u32>,
    ) -> (
        Arc<TransactionInitCallback>,
        Arc<Mutex<Vec<TransactionInitResponse>>>,
    ) {
        let callback = Arc::new(TransactionInitCallback::new());
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&captured);
        callback.init(
            txn_id,
            locals,
            Box::new(move |response| {
                sink_target.lock().expect("test sink mutex").push(response);
            }),
            None,
        );
        (callback, captured)
    }

    #[rstest]
    fn register_with_no_local_partition_is_a_misconfiguration() {
        let manager = manager();
        let (callback, _captured) = armed_callback(10, Vec::new());
        let result = manager.register(10, 0, &PartitionSet::from(&[7_u32][..]), 0, &callback);
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn smaller_id_is_granted_on_every_partition_first() {
        let manager = manager();
        let partitions = PartitionSet::from(&[0_u32, 1][..]);
        let (cb_late, captured_late) = armed_callback(20, vec![0, 1]);
        let (cb_early, captured_early) = armed_callback(10, vec![0, 1]);

        manager
            .register(20, 0, &partitions, 0, &cb_late)
            .expect("registration must succeed");
        manager
            .register(10, 0, &partitions, 0, &cb_early)
            .expect("registration must succeed");
        manager.check_queues().expect("check must succeed");

        // Txn 20 arrived first but txn 10 owns the smaller id; 20 must still
        // be waiting on both partitions.
        {
            let early = captured_early.lock().unwrap();
            assert_that!(early.len(), eq(1_usize));
            assert_that!(early[0].status, eq(InitStatus::Ok));
        }
        assert_that!(captured_late.lock().unwrap().len(), eq(0_usize));
        assert_that!(manager.holder(0), eq(Some(10)));
        assert_that!(manager.holder(1), eq(Some(10)));

        manager.finished(10, 0).expect("release must succeed");
        manager.finished(10, 1).expect("release must succeed");

        let late = captured_late.lock().unwrap();
        assert_that!(late.len(), eq(1_usize));
        assert_that!(late[0].status, eq(InitStatus::Ok));
        assert_that!(manager.holder(0), eq(Some(20)));
    }

    #[rstest]
    fn late_smaller_id_is_rejected_and_scheduled_for_restart() {
        let manager = manager();
        let partitions = PartitionSet::from(&[0_u32, 1][..]);
        let (cb_big, _captured_big) = armed_callback(20, vec![0, 1]);
        manager
            .register(20, 0, &partitions, 0, &cb_big)
            .expect("registration must succeed");
        manager.check_queues().expect("check must succeed");
        manager.finished(20, 0).expect("release must succeed");
        manager.finished(20, 1).expect("release must succeed");

        let (cb_small, captured_small) = armed_callback(10, vec![0, 1]);
        manager
            .register(10, 0, &partitions, 2, &cb_small)
            .expect("registration must be reported through the callback");

        let responses = captured_small.lock().unwrap();
        assert_that!(responses.len(), eq(1_usize));
        assert_that!(responses[0].status, eq(InitStatus::AbortReject));
        assert_that!(responses[0].reject_blocker, eq(Some(20)));
        assert_that!(manager.queue_depth(0), eq(0_usize));
        assert_that!(manager.queue_depth(1), eq(0_usize));

        let restarts =
            manager.poll_restarts(Instant::now() + Duration::from_secs(1));
        assert_that!(restarts.len(), eq(1_usize));
        assert_that!(restarts[0].txn_id, eq(10));
        assert_that!(restarts[0].attempts, eq(3));

        let histogram = manager.blocked_histogram();
        assert_that!(histogram, eq(&vec![(20, 1)]));
    }

    #[rstest]
    fn reject_aborts_once_and_cleans_every_queue() {
        let manager = manager();
        let partitions = PartitionSet::from(&[0_u32, 1][..]);
        let (cb_first, _c1) = armed_callback(10, vec![0, 1]);
        manager
            .register(10, 0, &partitions, 0, &cb_first)
            .expect("registration must succeed");
        let (cb_second, captured) = armed_callback(20, vec![0, 1]);
        manager
            .register(20, 0, &partitions, 0, &cb_second)
            .expect("registration must succeed");

        manager
            .reject(20, 1, 10, 0)
            .expect("reject must clean the queues");

        let responses = captured.lock().unwrap();
        assert_that!(responses.len(), eq(1_usize));
        assert_that!(responses[0].status, eq(InitStatus::AbortReject));
        assert_that!(responses[0].reject_partition, eq(Some(1)));
        // Only txn 10 is left queued on each partition.
        assert_that!(manager.queue_depth(0), eq(1_usize));
        assert_that!(manager.queue_depth(1), eq(1_usize));
    }

    #[rstest]
    fn expiry_aborts_with_timeout_status() {
        let manager = manager();
        let partitions = PartitionSet::from(&[0_u32, 1][..]);
        let (cb_first, _c1) = armed_callback(10, vec![0, 1]);
        manager
            .register(10, 0, &partitions, 0, &cb_first)
            .expect("registration must succeed");
        let (cb_waiting, captured) = armed_callback(20, vec![0, 1]);
        manager
            .register(20, 0, &partitions, 0, &cb_waiting)
            .expect("registration must succeed");

        let expired = manager.expire_timed_out(
            Instant::now() + Duration::from_secs(60),
            Duration::from_secs(5),
        );
        assert_that!(expired >= 1, eq(true));
        let responses = captured.lock().unwrap();
        assert_that!(responses.len(), eq(1_usize));
        assert_that!(responses[0].status, eq(InitStatus::AbortTimeout));
    }
}
