//! Partition executors.
//!
//! One executor owns one partition: a named worker thread drains an MPSC
//! inbox and serializes every read and write of partition state. While a
//! distributed holder is stalled on remote fragments, the executor asks the
//! speculative scheduler for single-partition candidates and runs them with
//! their client responses buffered until the holder resolves.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};

use hashbrown::HashMap;
use tracing::{debug, warn};

use hornet_catalog::Catalog;
use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{PartitionId, TableId, TxnId};
use hornet_common::partition_set::PartitionSet;
use hornet_common::profiler::ProfileMeasurement;
use hornet_specexec::scheduler::SpeculativeScheduler;
use hornet_txn::estimate::EstimatorState;
use hornet_txn::handle::{LocalTransaction, SpecState, TransactionCore, TxnState};
use hornet_txn::messages::{ClientResponse, FragmentResponse, ResponseStatus, WorkFragment};
use hornet_txn::params::ParamSet;
use hornet_txn::pool::{HandlePool, PoolCounters, PoolRef, ValuePool};
use hornet_txn::queue_manager::TransactionQueueManager;

use crate::engine::ExecutionEngine;

/// Sentinel published while no transaction owns the partition.
const NO_TXN: u64 = u64::MAX;

/// Consumes client responses released by this partition.
pub type ResponseSink = Box<dyn Fn(ClientResponse) + Send>;

/// Consumes fragment responses destined for the coordinator.
pub type FragmentSink = Box<dyn Fn(FragmentResponse) + Send>;

/// What the executor is currently allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Nothing queued, no holder.
    Idle,
    /// No holder; every transaction commits directly.
    CommitAll,
    /// Holder is a read-only distributed transaction; only read-only
    /// candidates are admitted.
    CommitReadonly,
    /// Holder present and speculation disabled.
    CommitNone,
    /// Holder present; candidates are admitted with buffered results.
    Speculative,
}

impl ExecutionMode {
    fn encode(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::CommitAll => 1,
            Self::CommitReadonly => 2,
            Self::CommitNone => 3,
            Self::Speculative => 4,
        }
    }

    fn decode(value: u8) -> Self {
        match value {
            1 => Self::CommitAll,
            2 => Self::CommitReadonly,
            3 => Self::CommitNone,
            4 => Self::Speculative,
            _ => Self::Idle,
        }
    }
}

/// Work accepted by [`PartitionExecutor::enqueue`].
#[derive(Debug)]
pub enum WorkItem {
    /// Fresh single-partition procedure invocation.
    Invoke(LocalTransaction),
    /// The init protocol granted this partition to a distributed
    /// transaction; the executor installs it as the holder.
    SetHolder {
        /// The holder's transaction state, as of the grant.
        core: TransactionCore,
        /// Whether speculative candidates may run under this holder.
        speculation_eligible: bool,
    },
    /// A work fragment for the current (or an arriving) holder.
    Fragment(WorkFragment),
    /// The holder's cluster-wide outcome.
    HolderFinish {
        /// The resolved transaction.
        txn_id: TxnId,
        /// `true` for commit, `false` for abort.
        committed: bool,
    },
    /// Storage pass-through: bulk-load rows into a table.
    LoadTable {
        /// Destination table.
        table: TableId,
        /// Rows as `(key, value)` pairs.
        rows: Vec<(i64, i64)>,
        /// Completion acknowledgment.
        reply: mpsc::Sender<HornetResult<()>>,
    },
    /// Storage pass-through: report engine counters.
    GetStats {
        /// Reply channel.
        reply: mpsc::Sender<crate::engine::EngineStats>,
    },
    /// Storage pass-through: evict rows from a table.
    EvictBlock {
        /// Table to evict from.
        table: TableId,
        /// Maximum rows to evict.
        row_budget: u64,
        /// Reply channel.
        reply: mpsc::Sender<HornetResult<u64>>,
    },
    /// Stop the worker thread.
    Shutdown,
}

/// Per-partition elapsed-time accounting.
#[derive(Debug)]
pub struct ExecutorProfiler {
    /// Time spent executing statements.
    pub exec_time: ProfileMeasurement,
    /// Time spent blocked on the inbox.
    pub idle_time: ProfileMeasurement,
    /// Time spent handing results to sinks.
    pub network_time: ProfileMeasurement,
    /// Time spent on bookkeeping between work items.
    pub utility_time: ProfileMeasurement,
}

impl ExecutorProfiler {
    fn new() -> Self {
        Self {
            exec_time: ProfileMeasurement::new("exec"),
            idle_time: ProfileMeasurement::new("idle"),
            network_time: ProfileMeasurement::new("network"),
            utility_time: ProfileMeasurement::new("utility"),
        }
    }
}

#[derive(Debug)]
struct ExecutorShared {
    mode: AtomicU8,
    current_txn: AtomicU64,
    queue_depth: AtomicUsize,
    inbox_depth: AtomicUsize,
    last_committed: AtomicU64,
    committed_count: AtomicU64,
    pool_created: AtomicU64,
    pool_active: AtomicU64,
    pool_idle: AtomicU64,
}

impl ExecutorShared {
    fn new() -> Self {
        Self {
            mode: AtomicU8::new(ExecutionMode::Idle.encode()),
            current_txn: AtomicU64::new(NO_TXN),
            queue_depth: AtomicUsize::new(0),
            inbox_depth: AtomicUsize::new(0),
            last_committed: AtomicU64::new(0),
            committed_count: AtomicU64::new(0),
            pool_created: AtomicU64::new(0),
            pool_active: AtomicU64::new(0),
            pool_idle: AtomicU64::new(0),
        }
    }
}

/// Public handle of one partition's executor thread.
#[derive(Debug)]
pub struct PartitionExecutor {
    partition: PartitionId,
    sender: mpsc::Sender<WorkItem>,
    shared: Arc<ExecutorShared>,
    profiler: Arc<ExecutorProfiler>,
    worker: Option<JoinHandle<()>>,
}

impl PartitionExecutor {
    /// Spawns the executor thread for one partition.
    #[must_use]
    pub fn spawn(
        partition: PartitionId,
        specexec_enabled: bool,
        catalog: Arc<Catalog>,
        engine: Box<dyn ExecutionEngine>,
        scheduler: Arc<SpeculativeScheduler>,
        queue_manager: Arc<TransactionQueueManager>,
        estimator_pool: Arc<Mutex<ValuePool<EstimatorState>>>,
        response_sink: ResponseSink,
        fragment_sink: FragmentSink,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<WorkItem>();
        let shared = Arc::new(ExecutorShared::new());
        let profiler = Arc::new(ExecutorProfiler::new());
        let context = ExecutorContext {
            partition,
            specexec_enabled,
            catalog,
            engine,
            scheduler,
            queue_manager,
            estimator_pool,
            response_sink,
            fragment_sink,
            shared: Arc::clone(&shared),
            profiler: Arc::clone(&profiler),
            pool: HandlePool::new(),
            work_queue: VecDeque::new(),
            holder: None,
            spec_buffer: Vec::new(),
            early_fragments: HashMap::new(),
        };
        let worker = thread::Builder::new()
            .name(format!("hornet-partition-{partition}"))
            .spawn(move || executor_main(context, &receiver))
            .ok();
        Self {
            partition,
            sender,
            shared,
            profiler,
            worker,
        }
    }

    /// Partition owned by this executor.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Appends a work item; non-blocking and thread-safe.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker thread has shut down.
    pub fn enqueue(&self, item: WorkItem) -> HornetResult<()> {
        self.shared.inbox_depth.fetch_add(1, Ordering::AcqRel);
        self.sender.send(item).map_err(|_| {
            self.shared.inbox_depth.fetch_sub(1, Ordering::AcqRel);
            HornetError::InvalidState("partition executor is shut down")
        })
    }

    /// A cloneable submission handle for this executor's inbox.
    #[must_use]
    pub fn work_sender(&self) -> WorkSender {
        WorkSender {
            sender: self.sender.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns (current transaction, execution mode, queued work depth).
    #[must_use]
    pub fn current_state(&self) -> (Option<TxnId>, ExecutionMode, usize) {
        let txn = match self.shared.current_txn.load(Ordering::Acquire) {
            NO_TXN => None,
            txn_id => Some(txn_id),
        };
        let mode = ExecutionMode::decode(self.shared.mode.load(Ordering::Acquire));
        let depth = self.shared.queue_depth.load(Ordering::Acquire)
            + self.shared.inbox_depth.load(Ordering::Acquire);
        (txn, mode, depth)
    }

    /// Largest committed transaction id at this partition.
    #[must_use]
    pub fn last_committed(&self) -> TxnId {
        self.shared.last_committed.load(Ordering::Acquire)
    }

    /// Transactions committed at this partition since startup.
    #[must_use]
    pub fn committed_count(&self) -> u64 {
        self.shared.committed_count.load(Ordering::Acquire)
    }

    /// Occupancy of the transaction-handle pool.
    #[must_use]
    pub fn pool_counters(&self) -> PoolCounters {
        PoolCounters {
            created: self.shared.pool_created.load(Ordering::Acquire),
            active: self.shared.pool_active.load(Ordering::Acquire) as usize,
            idle: self.shared.pool_idle.load(Ordering::Acquire) as usize,
        }
    }

    /// Per-partition profiling rollup.
    #[must_use]
    pub fn profiler(&self) -> &Arc<ExecutorProfiler> {
        &self.profiler
    }

    /// Stops the worker thread and waits for it to exit.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(WorkItem::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PartitionExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable submission handle used by callbacks and the site glue.
#[derive(Debug, Clone)]
pub struct WorkSender {
    sender: mpsc::Sender<WorkItem>,
    shared: Arc<ExecutorShared>,
}

impl WorkSender {
    /// Appends a work item; non-blocking and thread-safe.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker thread has shut down.
    pub fn enqueue(&self, item: WorkItem) -> HornetResult<()> {
        self.shared.inbox_depth.fetch_add(1, Ordering::AcqRel);
        self.sender.send(item).map_err(|_| {
            self.shared.inbox_depth.fetch_sub(1, Ordering::AcqRel);
            HornetError::InvalidState("partition executor is shut down")
        })
    }
}

struct HolderState {
    core: TransactionCore,
    speculation_eligible: bool,
    pending: VecDeque<WorkFragment>,
    results: Vec<Vec<i64>>,
}

struct ExecutorContext {
    partition: PartitionId,
    specexec_enabled: bool,
    catalog: Arc<Catalog>,
    engine: Box<dyn ExecutionEngine>,
    scheduler: Arc<SpeculativeScheduler>,
    queue_manager: Arc<TransactionQueueManager>,
    estimator_pool: Arc<Mutex<ValuePool<EstimatorState>>>,
    response_sink: ResponseSink,
    fragment_sink: FragmentSink,
    shared: Arc<ExecutorShared>,
    profiler: Arc<ExecutorProfiler>,
    pool: HandlePool<LocalTransaction>,
    work_queue: VecDeque<PoolRef>,
    holder: Option<HolderState>,
    spec_buffer: Vec<(TxnId, PoolRef, ClientResponse)>,
    /// Fragments that arrived before their holder's grant notification.
    early_fragments: HashMap<TxnId, Vec<WorkFragment>>,
}

fn executor_main(mut ctx: ExecutorContext, receiver: &mpsc::Receiver<WorkItem>) {
    loop {
        ctx.publish_state();
        let _ = ctx.profiler.idle_time.start_now();
        let Ok(item) = receiver.recv() else {
            break;
        };
        let _ = ctx.profiler.idle_time.stop_now();
        ctx.shared.inbox_depth.fetch_sub(1, Ordering::AcqRel);
        if ctx.handle(item) {
            break;
        }
        ctx.run_ready_work();
    }
    ctx.publish_state();
}

impl ExecutorContext {
    /// Returns `true` on shutdown.
    fn handle(&mut self, item: WorkItem) -> bool {
        match item {
            WorkItem::Invoke(txn) => {
                let txn_id = txn.core.txn_id;
                let handle = self.pool.checkout(|| {
                    LocalTransaction::new(TransactionCore::new(
                        0,
                        0,
                        0,
                        PartitionSet::new(),
                        false,
                        0,
                        ParamSet::default(),
                    ))
                });
                if let Some(slot) = self.pool.get_mut(handle) {
                    *slot = txn;
                }
                debug!(txn_id, partition = self.partition, "invocation queued");
                self.work_queue.push_back(handle);
            }
            WorkItem::SetHolder {
                mut core,
                speculation_eligible,
            } => {
                let txn_id = core.txn_id;
                if core.state() == TxnState::Queued {
                    let _ = core.transition(TxnState::Holding);
                }
                self.engine.begin(txn_id);
                let pending = self
                    .early_fragments
                    .remove(&txn_id)
                    .map(VecDeque::from)
                    .unwrap_or_default();
                debug!(
                    txn_id,
                    partition = self.partition,
                    speculation_eligible,
                    "distributed holder installed"
                );
                self.holder = Some(HolderState {
                    core,
                    speculation_eligible,
                    pending,
                    results: Vec::new(),
                });
            }
            WorkItem::Fragment(fragment) => match self.holder.as_mut() {
                Some(holder) if holder.core.txn_id == fragment.txn_id => {
                    holder.pending.push_back(fragment);
                }
                _ => {
                    self.early_fragments
                        .entry(fragment.txn_id)
                        .or_default()
                        .push(fragment);
                }
            },
            WorkItem::HolderFinish { txn_id, committed } => {
                self.resolve_holder(txn_id, committed);
            }
            WorkItem::LoadTable { table, rows, reply } => {
                let _ = reply.send(self.engine.load_table(table, rows));
            }
            WorkItem::GetStats { reply } => {
                let _ = reply.send(self.engine.get_stats());
            }
            WorkItem::EvictBlock {
                table,
                row_budget,
                reply,
            } => {
                let _ = reply.send(self.engine.evict_block(table, row_budget));
            }
            WorkItem::Shutdown => return true,
        }
        false
    }

    fn run_ready_work(&mut self) {
        if self.holder.is_some() {
            self.run_holder_fragments();
            self.try_speculate();
        } else {
            while let Some(handle) = self.work_queue.pop_front() {
                self.execute_local(handle, false);
            }
        }
    }

    fn run_holder_fragments(&mut self) {
        loop {
            let Some(holder) = self.holder.as_mut() else {
                return;
            };
            if holder.core.state() == TxnState::Holding && !holder.pending.is_empty() {
                let _ = holder.core.transition(TxnState::Executing);
            }
            let Some(fragment) = holder.pending.pop_front() else {
                // Out of local work; the holder is logically suspended on
                // its remote fragments.
                if holder.core.state() == TxnState::Executing {
                    let _ = holder.core.transition(TxnState::WaitingRemote);
                }
                return;
            };
            let txn_id = holder.core.txn_id;
            let Some(stmt) = self.catalog.statement(fragment.stmt).cloned() else {
                self.send_fragment_response(FragmentResponse {
                    txn_id,
                    partition: self.partition,
                    status: ResponseStatus::AbortUnexpected,
                    rows: Vec::new(),
                });
                continue;
            };
            let _ = self.profiler.exec_time.start_now();
            let outcome = self.engine.execute_statement(txn_id, &stmt, &fragment.params);
            let _ = self.profiler.exec_time.stop_now();
            let holder = self
                .holder
                .as_mut()
                .expect("holder survives fragment execution");
            let response = match outcome {
                Ok(rows) => {
                    for table in &stmt.tables {
                        holder.core.mark_table_read(self.partition, *table);
                    }
                    if stmt.writes {
                        for table in &stmt.tables {
                            holder.core.mark_table_written(self.partition, *table);
                        }
                    }
                    holder.results.push(rows.clone());
                    FragmentResponse {
                        txn_id,
                        partition: self.partition,
                        status: ResponseStatus::Ok,
                        rows,
                    }
                }
                Err(error) => {
                    warn!(txn_id, partition = self.partition, %error, "fragment failed");
                    FragmentResponse {
                        txn_id,
                        partition: self.partition,
                        status: ResponseStatus::AbortUnexpected,
                        rows: Vec::new(),
                    }
                }
            };
            self.send_fragment_response(response);
        }
    }

    fn try_speculate(&mut self) {
        loop {
            let Some(holder) = self.holder.as_ref() else {
                return;
            };
            if !self.specexec_enabled || !holder.speculation_eligible {
                return;
            }
            if !holder.pending.is_empty() {
                return;
            }
            let read_only_only = holder.core.read_only;

            let mut positions = Vec::with_capacity(self.work_queue.len());
            let mut candidates = Vec::with_capacity(self.work_queue.len());
            for (position, handle) in self.work_queue.iter().enumerate() {
                if let Some(txn) = self.pool.get(*handle) {
                    positions.push(position);
                    candidates.push(txn);
                }
            }
            let Some(selected) = self.scheduler.select(
                &holder.core,
                self.partition,
                candidates.into_iter(),
                read_only_only,
                false,
            ) else {
                return;
            };
            let position = positions[selected];
            let holder_id = holder.core.txn_id;
            let Some(handle) = self.work_queue.remove(position) else {
                return;
            };
            if let Some(txn) = self.pool.get_mut(handle) {
                txn.mark_speculative();
                self.scheduler.admit(self.partition, holder_id, txn.core.txn_id);
            }
            self.execute_local(handle, true);
        }
    }

    /// Runs one queued single-partition transaction to its end-of-transaction
    /// point. Non-speculative runs commit and respond immediately;
    /// speculative runs keep their undo scope open and buffer the response.
    fn execute_local(&mut self, handle: PoolRef, speculative: bool) {
        let Some(txn) = self.pool.get_mut(handle) else {
            return;
        };
        let txn_id = txn.core.txn_id;
        let proc = txn.core.proc;
        let restart_counter = txn.core.restart_counter();
        if txn.core.state() == TxnState::Initializing {
            let _ = txn.core.transition(TxnState::Executing);
        }
        self.shared.current_txn.store(txn_id, Ordering::Release);

        let statements = self
            .catalog
            .procedure(proc)
            .map(|proc| proc.statements.clone())
            .unwrap_or_default();
        self.engine.begin(txn_id);

        let mut results = Vec::with_capacity(statements.len());
        let mut failure: Option<HornetError> = None;
        let _ = self.profiler.exec_time.start_now();
        for stmt_id in statements {
            let Some(stmt) = self.catalog.statement(stmt_id).cloned() else {
                failure = Some(HornetError::Unexpected(format!(
                    "unknown statement {stmt_id}"
                )));
                break;
            };
            let params = self
                .pool
                .get(handle)
                .map(|txn| txn.core.params.clone())
                .unwrap_or_default();
            match self.engine.execute_statement(txn_id, &stmt, &params) {
                Ok(rows) => {
                    if let Some(txn) = self.pool.get_mut(handle) {
                        for table in &stmt.tables {
                            txn.core.mark_table_read(self.partition, *table);
                        }
                        if stmt.writes {
                            for table in &stmt.tables {
                                txn.core.mark_table_written(self.partition, *table);
                            }
                        }
                    }
                    results.push(rows);
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        let _ = self.profiler.exec_time.stop_now();

        let response = match failure {
            None => ClientResponse {
                txn_id,
                status: ResponseStatus::Ok,
                restart_counter,
                results,
            },
            Some(error) => {
                self.engine.undo(txn_id);
                let status = match error {
                    HornetError::UserAbort(_) => ResponseStatus::AbortUser,
                    _ => ResponseStatus::AbortUnexpected,
                };
                warn!(txn_id, partition = self.partition, "transaction aborted");
                ClientResponse {
                    txn_id,
                    status,
                    restart_counter,
                    results: Vec::new(),
                }
            }
        };
        let succeeded = response.status == ResponseStatus::Ok;

        if speculative {
            if let Some(txn) = self.pool.get_mut(handle) {
                txn.set_speculative_state(SpecState::CommittedBuffered);
            }
            self.spec_buffer.push((txn_id, handle, response));
        } else {
            if succeeded {
                self.engine.commit(txn_id);
            }
            self.complete_transaction(handle, succeeded);
            self.send_client_response(response);
        }
        self.shared.current_txn.store(
            self.holder
                .as_ref()
                .map_or(NO_TXN, |holder| holder.core.txn_id),
            Ordering::Release,
        );
    }

    fn resolve_holder(&mut self, txn_id: TxnId, committed: bool) {
        let _ = self.early_fragments.remove(&txn_id);
        let Some(mut holder) = self.holder.take() else {
            debug!(txn_id, partition = self.partition, "no holder to resolve");
            return;
        };
        if holder.core.txn_id != txn_id {
            self.holder = Some(holder);
            return;
        }

        let order = self.scheduler.holder_resolved(self.partition, txn_id);
        if committed {
            self.engine.commit(txn_id);
            let _ = holder.core.transition(TxnState::Finished);
            holder.core.clear_touched_tables();
            self.record_commit(txn_id);
            if holder.core.base_partition == self.partition {
                self.send_client_response(ClientResponse {
                    txn_id,
                    status: ResponseStatus::Ok,
                    restart_counter: holder.core.restart_counter(),
                    results: holder.results.clone(),
                });
            }
            self.release_speculative_batch(&order);
        } else {
            // Undo in reverse execution order: candidates ran after the
            // holder's local fragments.
            self.rollback_speculative_batch(&order);
            self.engine.undo(txn_id);
            let _ = holder.core.transition(TxnState::Aborted);
            holder.core.clear_touched_tables();
            if holder.core.base_partition == self.partition {
                self.send_client_response(ClientResponse {
                    txn_id,
                    status: ResponseStatus::AbortUser,
                    restart_counter: holder.core.restart_counter(),
                    results: Vec::new(),
                });
            }
        }

        if let Err(error) = self.queue_manager.finished(txn_id, self.partition) {
            warn!(txn_id, partition = self.partition, %error, "queue release failed");
        }
    }

    /// Commits and releases buffered speculative transactions in their
    /// execution order, directly after the holder's own commit.
    fn release_speculative_batch(&mut self, order: &[TxnId]) {
        for spec_txn in order {
            let Some(position) = self
                .spec_buffer
                .iter()
                .position(|(txn_id, _, _)| txn_id == spec_txn)
            else {
                continue;
            };
            let (txn_id, handle, response) = self.spec_buffer.remove(position);
            let succeeded = response.status == ResponseStatus::Ok;
            if succeeded {
                self.engine.commit(txn_id);
            } else {
                self.engine.undo(txn_id);
            }
            if let Some(txn) = self.pool.get_mut(handle) {
                txn.set_speculative_state(SpecState::Released);
            }
            self.complete_transaction(handle, succeeded);
            self.send_client_response(response);
        }
    }

    /// Rolls back buffered speculative transactions in reverse execution
    /// order and requeues them at the front of the work queue, preserving
    /// their original relative order.
    fn rollback_speculative_batch(&mut self, order: &[TxnId]) {
        for spec_txn in order.iter().rev() {
            let Some(position) = self
                .spec_buffer
                .iter()
                .position(|(txn_id, _, _)| txn_id == spec_txn)
            else {
                continue;
            };
            let (txn_id, handle, _withheld) = self.spec_buffer.remove(position);
            self.engine.undo(txn_id);
            let Some(txn) = self.pool.get_mut(handle) else {
                continue;
            };
            txn.set_speculative_state(SpecState::RolledBack);
            let _ = txn.core.transition(TxnState::Aborted);
            txn.core.clear_touched_tables();
            txn.core.bump_restart_counter();
            let _ = txn.core.restart_as(txn_id);
            txn.reset();
            debug!(txn_id, partition = self.partition, "speculative rollback");
            self.work_queue.push_front(handle);
        }
    }

    /// Final bookkeeping for a transaction leaving the executor: lifecycle,
    /// estimator-state recycling, and handle check-in.
    fn complete_transaction(&mut self, handle: PoolRef, committed: bool) {
        let mut estimator = None;
        let mut committed_id = None;
        if let Some(txn) = self.pool.get_mut(handle) {
            let next = if committed {
                TxnState::Finished
            } else {
                TxnState::Aborted
            };
            if txn.core.state() != next {
                let _ = txn.core.transition(next);
            }
            txn.core.clear_touched_tables();
            estimator = txn.core.estimator.take();
            if committed {
                committed_id = Some(txn.core.txn_id);
            }
        }
        if let Some(state) = estimator {
            let mut pool = self
                .estimator_pool
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pool.give(state, EstimatorState::reset);
        }
        if let Some(txn_id) = committed_id {
            self.record_commit(txn_id);
        }
        let _ = self.pool.checkin(handle, LocalTransaction::reset);
    }

    fn record_commit(&mut self, txn_id: TxnId) {
        let _ = self.shared.committed_count.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .shared
            .last_committed
            .fetch_max(txn_id, Ordering::AcqRel);
    }

    fn send_client_response(&self, response: ClientResponse) {
        let _ = self.profiler.network_time.start_now();
        (self.response_sink)(response);
        let _ = self.profiler.network_time.stop_now();
    }

    fn send_fragment_response(&self, response: FragmentResponse) {
        let _ = self.profiler.network_time.start_now();
        (self.fragment_sink)(response);
        let _ = self.profiler.network_time.stop_now();
    }

    fn publish_state(&self) {
        let _ = self.profiler.utility_time.start_now();
        // Speculation being disabled is the binding constraint; a read-only
        // holder only narrows what an enabled scheduler may admit.
        let mode = match &self.holder {
            None if self.work_queue.is_empty() => ExecutionMode::Idle,
            None => ExecutionMode::CommitAll,
            Some(_) if !self.specexec_enabled => ExecutionMode::CommitNone,
            Some(holder) if holder.core.read_only => ExecutionMode::CommitReadonly,
            Some(_) => ExecutionMode::Speculative,
        };
        self.shared.mode.store(mode.encode(), Ordering::Release);
        self.shared.current_txn.store(
            self.holder
                .as_ref()
                .map_or(NO_TXN, |holder| holder.core.txn_id),
            Ordering::Release,
        );
        self.shared
            .queue_depth
            .store(self.work_queue.len(), Ordering::Release);
        let counters = self.pool.counters();
        self.shared
            .pool_created
            .store(counters.created, Ordering::Release);
        self.shared
            .pool_active
            .store(counters.active as u64, Ordering::Release);
        self.shared
            .pool_idle
            .store(counters.idle as u64, Ordering::Release);
        let _ = self.profiler.utility_time.stop_now();
    }
}
