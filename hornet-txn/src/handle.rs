//! In-flight transaction state containers.

use hashbrown::HashMap;

use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{PartitionId, ProcId, SiteId, TableId, TxnId};
use hornet_common::partition_set::PartitionSet;

use crate::estimate::EstimatorState;
use crate::messages::{ClientResponse, WorkFragment};
use crate::params::ParamSet;

/// Lifecycle of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Handle created, not yet queued or running.
    Initializing,
    /// Waiting in one or more partition init queues.
    Queued,
    /// Granted by every involved partition, not yet executing.
    Holding,
    /// Running on its base partition.
    Executing,
    /// Stalled on remote fragment responses.
    WaitingRemote,
    /// Committed; terminal.
    Finished,
    /// Aborted; terminal except for coordinator-driven restart.
    Aborted,
}

impl TxnState {
    /// Returns whether the lifecycle may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: TxnState) -> bool {
        use TxnState::{Aborted, Executing, Finished, Holding, Initializing, Queued, WaitingRemote};
        matches!(
            (self, next),
            (Initializing, Queued | Executing | Aborted)
                | (Queued, Holding | Aborted)
                // A holder may resolve before any of its local fragments ran.
                | (Holding, Executing | Finished | Aborted)
                | (Executing, WaitingRemote | Finished | Aborted)
                | (WaitingRemote, Executing | Finished | Aborted)
                | (Aborted, Initializing)
        )
    }
}

/// Speculative lifecycle of a candidate run ahead of a stalled holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecState {
    /// Admitted, executing or awaiting its end-of-transaction point.
    Pending,
    /// Finished executing; response buffered until the holder resolves.
    CommittedBuffered,
    /// Holder committed; response released.
    Released,
    /// Holder aborted; effects undone, candidate requeued.
    RolledBack,
}

#[derive(Debug, Clone, Default)]
struct TableBits {
    words: Vec<u64>,
}

impl TableBits {
    fn set(&mut self, table: TableId) {
        let index = usize::from(table);
        let word = index / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    fn get(&self, table: TableId) -> bool {
        let index = usize::from(table);
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }
}

/// Per-partition read/write table bitmaps.
///
/// Bits are monotonic while the transaction executes; they are cleared only
/// when the handle finishes or aborts.
#[derive(Debug, Clone, Default)]
struct TouchedTables {
    read: HashMap<PartitionId, TableBits>,
    write: HashMap<PartitionId, TableBits>,
}

/// State shared by local and remote transaction handles.
#[derive(Debug, Clone)]
pub struct TransactionCore {
    /// Cluster-unique id; the numeric order is commit-precedence order.
    pub txn_id: TxnId,
    /// Site that minted the id.
    pub site_id: SiteId,
    /// Home partition.
    pub base_partition: PartitionId,
    /// Every partition the transaction may touch.
    pub partitions: PartitionSet,
    /// Whether the procedure never writes.
    pub read_only: bool,
    /// Invoked procedure.
    pub proc: ProcId,
    /// Invocation parameters.
    pub params: ParamSet,
    /// Forecast attached by the external estimator, if any.
    pub estimator: Option<EstimatorState>,
    state: TxnState,
    restart_counter: u32,
    touched: TouchedTables,
}

impl TransactionCore {
    /// Creates a handle in the `Initializing` state.
    #[must_use]
    pub fn new(
        txn_id: TxnId,
        site_id: SiteId,
        base_partition: PartitionId,
        partitions: PartitionSet,
        read_only: bool,
        proc: ProcId,
        params: ParamSet,
    ) -> Self {
        Self {
            txn_id,
            site_id,
            base_partition,
            partitions,
            read_only,
            proc,
            params,
            estimator: None,
            state: TxnState::Initializing,
            restart_counter: 0,
            touched: TouchedTables::default(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Moves the lifecycle forward.
    ///
    /// # Errors
    ///
    /// Returns an error when the transition is not in the lifecycle table.
    pub fn transition(&mut self, next: TxnState) -> HornetResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(HornetError::InvalidState(
                "illegal transaction lifecycle transition",
            ));
        }
        self.state = next;
        Ok(())
    }

    /// Returns whether the transaction touches more than one partition.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.partitions.len() > 1
    }

    /// Number of restarts this transaction has absorbed.
    #[must_use]
    pub fn restart_counter(&self) -> u32 {
        self.restart_counter
    }

    /// Counts one more restart.
    pub fn bump_restart_counter(&mut self) {
        self.restart_counter = self.restart_counter.saturating_add(1);
    }

    /// Rearms an aborted handle for a coordinator-driven restart under a
    /// fresh id.
    ///
    /// # Errors
    ///
    /// Returns an error unless the handle is aborted.
    pub fn restart_as(&mut self, txn_id: TxnId) -> HornetResult<()> {
        self.transition(TxnState::Initializing)?;
        self.txn_id = txn_id;
        self.touched = TouchedTables::default();
        Ok(())
    }

    /// Records a read of `table` on `partition`.
    pub fn mark_table_read(&mut self, partition: PartitionId, table: TableId) {
        self.touched.read.entry(partition).or_default().set(table);
    }

    /// Records a write of `table` on `partition`.
    pub fn mark_table_written(&mut self, partition: PartitionId, table: TableId) {
        self.touched.write.entry(partition).or_default().set(table);
    }

    /// Returns whether the transaction has read or written `table` on
    /// `partition`.
    #[must_use]
    pub fn is_table_read_or_written(&self, partition: PartitionId, table: TableId) -> bool {
        self.is_table_written(partition, table)
            || self
                .touched
                .read
                .get(&partition)
                .is_some_and(|bits| bits.get(table))
    }

    /// Returns whether the transaction has written `table` on `partition`.
    #[must_use]
    pub fn is_table_written(&self, partition: PartitionId, table: TableId) -> bool {
        self.touched
            .write
            .get(&partition)
            .is_some_and(|bits| bits.get(table))
    }

    /// Releases the touched bitmaps; legal only once the lifecycle ended.
    pub fn clear_touched_tables(&mut self) {
        debug_assert!(matches!(
            self.state,
            TxnState::Finished | TxnState::Aborted
        ));
        self.touched = TouchedTables::default();
    }
}

/// Prefetch payload carried from the init request until dispatch.
#[derive(Debug, Clone, Default)]
pub struct PrefetchState {
    /// Serialized parameter sets from the init request.
    pub raw_params: Vec<Vec<u8>>,
    /// Fragments to route once the grant completes.
    pub fragments: Vec<WorkFragment>,
    /// Parameter sets after decoding.
    pub decoded: Option<Vec<ParamSet>>,
}

/// Handle for a transaction whose client is attached to this site.
#[derive(Debug, Clone)]
pub struct LocalTransaction {
    /// Shared lifecycle state.
    pub core: TransactionCore,
    client_response: Option<ClientResponse>,
    speculative: Option<SpecState>,
    /// Prefetch payload, when the invocation declared prefetch queries.
    pub prefetch: Option<PrefetchState>,
}

impl LocalTransaction {
    /// Wraps a core handle.
    #[must_use]
    pub fn new(core: TransactionCore) -> Self {
        Self {
            core,
            client_response: None,
            speculative: None,
            prefetch: None,
        }
    }

    /// Stores the final client response.
    ///
    /// # Errors
    ///
    /// Returns an error when a response was already recorded; the final
    /// response is emitted at most once.
    pub fn set_client_response(&mut self, response: ClientResponse) -> HornetResult<()> {
        if self.client_response.is_some() {
            return Err(HornetError::InvalidState(
                "client response is already recorded",
            ));
        }
        self.client_response = Some(response);
        Ok(())
    }

    /// Takes the recorded response for emission.
    #[must_use]
    pub fn take_client_response(&mut self) -> Option<ClientResponse> {
        self.client_response.take()
    }

    /// Returns whether a response is recorded but not yet emitted.
    #[must_use]
    pub fn has_client_response(&self) -> bool {
        self.client_response.is_some()
    }

    /// Current speculative state, `None` for non-speculative transactions.
    #[must_use]
    pub fn speculative_state(&self) -> Option<SpecState> {
        self.speculative
    }

    /// Marks the transaction as an admitted speculative candidate.
    pub fn mark_speculative(&mut self) {
        self.speculative = Some(SpecState::Pending);
    }

    /// Advances the speculative lifecycle.
    pub fn set_speculative_state(&mut self, state: SpecState) {
        self.speculative = Some(state);
    }

    /// Clears all per-run state for pool reuse.
    pub fn reset(&mut self) {
        self.client_response = None;
        self.speculative = None;
        self.prefetch = None;
    }
}

/// Handle for a transaction whose base partition lives on another site.
#[derive(Debug, Clone)]
pub struct RemoteTransaction {
    /// Shared lifecycle state.
    pub core: TransactionCore,
    /// Whether any work fragment has arrived for this handle yet.
    pub work_started: bool,
}

impl RemoteTransaction {
    /// Wraps a core handle.
    #[must_use]
    pub fn new(core: TransactionCore) -> Self {
        Self {
            core,
            work_started: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LocalTransaction, TransactionCore, TxnState};
    use crate::messages::{ClientResponse, ResponseStatus};
    use crate::params::ParamSet;
    use googletest::prelude::*;
    use hornet_common::partition_set::PartitionSet;
    use rstest::rstest;

    fn core(partitions: &[u32]) -> TransactionCore {
        TransactionCore::new(
            100,
            0,
            partitions[0],
            PartitionSet::from(partitions),
            false,
            0,
            ParamSet::default(),
        )
    }

    #[rstest]
    fn lifecycle_rejects_illegal_transitions() {
        let mut txn = core(&[0]);
        assert_that!(txn.transition(TxnState::Finished).is_err(), eq(true));
        txn.transition(TxnState::Executing)
            .expect("direct execution path must be legal");
        txn.transition(TxnState::WaitingRemote)
            .expect("stall must be legal while executing");
        txn.transition(TxnState::Finished)
            .expect("commit must be legal after stall");
        assert_that!(txn.transition(TxnState::Executing).is_err(), eq(true));
    }

    #[rstest]
    fn distributed_lifecycle_passes_through_queue_states() {
        let mut txn = core(&[0, 1]);
        assert_that!(txn.is_distributed(), eq(true));
        txn.transition(TxnState::Queued).expect("queueing is legal");
        txn.transition(TxnState::Holding).expect("grant is legal");
        txn.transition(TxnState::Executing).expect("run is legal");
    }

    #[rstest]
    fn touched_bits_track_reads_and_writes_per_partition() {
        let mut txn = core(&[0, 1]);
        txn.mark_table_read(0, 3);
        txn.mark_table_written(1, 3);

        assert_that!(txn.is_table_read_or_written(0, 3), eq(true));
        assert_that!(txn.is_table_written(0, 3), eq(false));
        assert_that!(txn.is_table_written(1, 3), eq(true));
        assert_that!(txn.is_table_read_or_written(1, 4), eq(false));
    }

    #[rstest]
    fn restart_assigns_fresh_id_and_clears_touched_state() {
        let mut txn = core(&[0, 1]);
        txn.mark_table_written(0, 1);
        txn.transition(TxnState::Queued).expect("queueing is legal");
        txn.transition(TxnState::Aborted).expect("abort is legal");
        txn.bump_restart_counter();
        txn.restart_as(200).expect("aborted handle must restart");

        assert_that!(txn.txn_id, eq(200));
        assert_that!(txn.restart_counter(), eq(1));
        assert_that!(txn.is_table_written(0, 1), eq(false));
        assert_that!(txn.state(), eq(TxnState::Initializing));
    }

    #[rstest]
    fn client_response_is_recorded_at_most_once() {
        let mut txn = LocalTransaction::new(core(&[0]));
        let response = ClientResponse {
            txn_id: 100,
            status: ResponseStatus::Ok,
            restart_counter: 0,
            results: Vec::new(),
        };
        txn.set_client_response(response.clone())
            .expect("first response must be recorded");
        assert_that!(txn.set_client_response(response).is_err(), eq(true));
        assert_that!(txn.take_client_response().is_some(), eq(true));
        assert_that!(txn.has_client_response(), eq(false));
    }
}
