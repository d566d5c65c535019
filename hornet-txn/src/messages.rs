//! Coordinator/site protocol messages.
//!
//! These are the payloads of the init and work RPCs; transport is outside
//! this crate, so the types are plain data carried over whatever channel the
//! embedding site wires up.

use hornet_common::ids::{PartitionId, ProcId, StmtId, TxnId};
use hornet_common::partition_set::PartitionSet;

use crate::params::ParamSet;

/// Outcome carried by a [`TransactionInitResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// Every local partition granted the lock.
    Ok,
    /// A partition queue rejected the transaction; restartable.
    AbortReject,
    /// The transaction exhausted its restart budget.
    AbortRepeatedRestart,
    /// Init acknowledgments did not arrive inside the configured window.
    AbortTimeout,
    /// A fatal fault (such as a prefetch payload that fails to decode)
    /// surfaced while completing the grant.
    AbortUnexpected,
}

/// One prefetch query embedded in an init request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchQuery {
    /// Statement to prefetch.
    pub stmt: StmtId,
    /// Partition the prefetch fragment targets.
    pub partition: PartitionId,
    /// Serialized parameter set; decoded on the receiving site.
    pub params: Vec<u8>,
}

/// Coordinator → site: register a distributed transaction with every local
/// partition it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInitRequest {
    /// Cluster-unique transaction id.
    pub txn_id: TxnId,
    /// Home partition of the transaction.
    pub base_partition: PartitionId,
    /// Every partition the transaction may touch.
    pub partitions: PartitionSet,
    /// Invoked procedure; conflict analysis at the receiving site needs it.
    pub proc: ProcId,
    /// Parameters of the invocation.
    pub params: ParamSet,
    /// Whether the procedure never writes.
    pub read_only: bool,
    /// Optional prefetch batch dispatched once the grant completes.
    pub prefetch: Vec<PrefetchQuery>,
}

/// Site → coordinator: the aggregated answer for one init request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInitResponse {
    /// Transaction the response belongs to.
    pub txn_id: TxnId,
    /// Aggregated outcome.
    pub status: InitStatus,
    /// Partitions granted (on `Ok`) or declined (on abort).
    pub partitions: Vec<PartitionId>,
    /// Partition whose queue emitted the rejection.
    pub reject_partition: Option<PartitionId>,
    /// Transaction id that blocked the rejected transaction.
    pub reject_blocker: Option<TxnId>,
}

/// One unit of work targeting a single partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFragment {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Destination partition.
    pub partition: PartitionId,
    /// Statement to run.
    pub stmt: StmtId,
    /// Invocation counter of the statement inside the procedure.
    pub stmt_counter: u32,
    /// Parameters for this fragment.
    pub params: ParamSet,
    /// Whether the fragment only reads.
    pub read_only: bool,
    /// Whether the fragment was routed ahead of demand.
    pub prefetch: bool,
}

/// One partition's answer for an executed fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentResponse {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Partition that executed the fragment.
    pub partition: PartitionId,
    /// Outcome of the fragment.
    pub status: ResponseStatus,
    /// Result row produced by the fragment.
    pub rows: Vec<i64>,
}

/// Outcome classes of a finished transaction, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Committed.
    Ok,
    /// Procedure-raised abort.
    AbortUser,
    /// Engine or deserialization failure.
    AbortUnexpected,
}

/// Site → client: the single response emitted for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    /// Transaction the response belongs to.
    pub txn_id: TxnId,
    /// Outcome.
    pub status: ResponseStatus,
    /// How many times queue rejections restarted this transaction.
    pub restart_counter: u32,
    /// Accumulated result rows, one entry per executed fragment.
    pub results: Vec<Vec<i64>>,
}
