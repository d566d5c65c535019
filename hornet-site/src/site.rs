//! Site runtime: transaction-id minting, routing, and the site-side ends of
//! the init and work protocols.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError, mpsc};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, info};

use hornet_catalog::Catalog;
use hornet_common::config::SiteConfig;
use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{PartitionId, ProcId, TableId, TxnId, compose_txn_id, txn_id_site};
use hornet_common::partition_set::PartitionSet;
use hornet_specexec::ConflictChecker;
use hornet_specexec::scheduler::SpeculativeScheduler;
use hornet_txn::estimate::{EstimatorState, TransactionEstimate};
use hornet_txn::handle::{
    LocalTransaction, PrefetchState, RemoteTransaction, TransactionCore, TxnState,
};
use hornet_txn::init_callback::{PrefetchDispatch, TransactionInitCallback};
use hornet_txn::messages::{
    ClientResponse, FragmentResponse, InitStatus, PrefetchQuery, TransactionInitRequest,
    TransactionInitResponse, WorkFragment,
};
use hornet_txn::params::ParamSet;
use hornet_txn::pool::ValuePool;
use hornet_txn::queue_manager::TransactionQueueManager;

use crate::engine::{EngineStats, ExecutionEngine, MemoryEngine};
use crate::executor::{PartitionExecutor, WorkItem, WorkSender};

/// Rejections absorbed before an init round gives up with
/// `AbortRepeatedRestart`.
const RESTART_LIMIT: u32 = 8;

/// Receives the single response of an init round.
pub type InitSink = Box<dyn FnOnce(TransactionInitResponse) + Send>;

#[derive(Debug)]
enum DtxnHandle {
    Local(LocalTransaction),
    Remote(RemoteTransaction),
}

impl DtxnHandle {
    fn core(&self) -> &TransactionCore {
        match self {
            Self::Local(txn) => &txn.core,
            Self::Remote(txn) => &txn.core,
        }
    }

    fn core_mut(&mut self) -> &mut TransactionCore {
        match self {
            Self::Local(txn) => &mut txn.core,
            Self::Remote(txn) => &mut txn.core,
        }
    }
}

#[derive(Debug)]
struct DtxnRecord {
    handle: DtxnHandle,
    prefetch: Option<PrefetchState>,
}

/// One site: a set of partition executors plus the queueing machinery that
/// admits distributed transactions to them.
pub struct Site {
    config: SiteConfig,
    catalog: Arc<Catalog>,
    queue_manager: Arc<TransactionQueueManager>,
    executors: HashMap<PartitionId, PartitionExecutor>,
    work_senders: HashMap<PartitionId, WorkSender>,
    dtxns: Arc<Mutex<HashMap<TxnId, DtxnRecord>>>,
    estimator_pool: Arc<Mutex<ValuePool<EstimatorState>>>,
    estimate_cache: Mutex<HashMap<(ProcId, u64), TransactionEstimate>>,
    next_txn_counter: AtomicU64,
    client_rx: Mutex<mpsc::Receiver<ClientResponse>>,
    fragment_rx: Mutex<mpsc::Receiver<FragmentResponse>>,
    init_tx: mpsc::Sender<TransactionInitResponse>,
    init_rx: Mutex<mpsc::Receiver<TransactionInitResponse>>,
    workload_start: Once,
    started_at: Instant,
}

impl Site {
    /// Boots a site backed by in-memory engines.
    #[must_use]
    pub fn new(config: SiteConfig, catalog: Arc<Catalog>) -> Self {
        Self::with_engines(config, catalog, |partition| {
            Box::new(MemoryEngine::new(partition))
        })
    }

    /// Boots a site with one engine per partition from `engine_factory`.
    pub fn with_engines(
        config: SiteConfig,
        catalog: Arc<Catalog>,
        mut engine_factory: impl FnMut(PartitionId) -> Box<dyn ExecutionEngine>,
    ) -> Self {
        let locals = config.local_partitions();
        let queue_manager = Arc::new(TransactionQueueManager::new(
            locals.clone(),
            config.init_queue_restart_delay,
        ));
        let checker = Arc::new(ConflictChecker::from_config(&config, &catalog));
        let scheduler = Arc::new(SpeculativeScheduler::new(checker, &config));
        let estimator_pool = Arc::new(Mutex::new(ValuePool::new(
            config.pool_estimator_states_idle,
        )));

        let (client_tx, client_rx) = mpsc::channel::<ClientResponse>();
        let (fragment_tx, fragment_rx) = mpsc::channel::<FragmentResponse>();
        let (init_tx, init_rx) = mpsc::channel::<TransactionInitResponse>();

        let mut executors = HashMap::new();
        let mut work_senders = HashMap::new();
        for partition in locals {
            let client_tx = client_tx.clone();
            let fragment_tx = fragment_tx.clone();
            let executor = PartitionExecutor::spawn(
                partition,
                config.specexec_enable,
                Arc::clone(&catalog),
                engine_factory(partition),
                Arc::clone(&scheduler),
                Arc::clone(&queue_manager),
                Arc::clone(&estimator_pool),
                Box::new(move |response| {
                    let _ = client_tx.send(response);
                }),
                Box::new(move |response| {
                    let _ = fragment_tx.send(response);
                }),
            );
            let _ = work_senders.insert(partition, executor.work_sender());
            let _ = executors.insert(partition, executor);
        }

        Self {
            config,
            catalog,
            queue_manager,
            executors,
            work_senders,
            dtxns: Arc::new(Mutex::new(HashMap::new())),
            estimator_pool,
            estimate_cache: Mutex::new(HashMap::new()),
            next_txn_counter: AtomicU64::new(1),
            client_rx: Mutex::new(client_rx),
            fragment_rx: Mutex::new(fragment_rx),
            init_tx,
            init_rx: Mutex::new(init_rx),
            workload_start: Once::new(),
            started_at: Instant::now(),
        }
    }

    /// Site configuration.
    #[must_use]
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    /// Catalog snapshot this site runs against.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Init-queue orchestration for this site's partitions.
    #[must_use]
    pub fn queue_manager(&self) -> &Arc<TransactionQueueManager> {
        &self.queue_manager
    }

    /// Executors by partition, for state probes.
    #[must_use]
    pub fn executors(&self) -> impl Iterator<Item = &PartitionExecutor> {
        self.executors.values()
    }

    /// One executor, when the partition is local.
    #[must_use]
    pub fn executor(&self, partition: PartitionId) -> Option<&PartitionExecutor> {
        self.executors.get(&partition)
    }

    /// Instant this site booted.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Estimator-state pool occupancy, for status reporting.
    #[must_use]
    pub fn estimator_pool_counters(&self) -> hornet_txn::pool::PoolCounters {
        self.estimator_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counters()
    }

    /// Mints the next cluster-unique transaction id.
    #[must_use]
    pub fn next_txn_id(&self) -> TxnId {
        let counter = self.next_txn_counter.fetch_add(1, Ordering::AcqRel);
        compose_txn_id(counter, self.config.site_id)
    }

    /// Submits a procedure invocation.
    ///
    /// A single-partition transaction goes straight to its executor with no
    /// init round trip. A distributed transaction is registered with every
    /// involved local partition; its init outcome arrives on the init
    /// response channel and, once granted, the involved executors carry it
    /// as their holder.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown procedure, an empty partition set, or
    /// a partition set with no local member.
    pub fn invoke(
        &self,
        proc: ProcId,
        params: ParamSet,
        base_partition: PartitionId,
        partitions: PartitionSet,
        estimator: Option<EstimatorState>,
    ) -> HornetResult<TxnId> {
        let Some(proc_def) = self.catalog.procedure(proc) else {
            return Err(HornetError::InvalidState("unknown procedure"));
        };
        if partitions.is_empty() {
            return Err(HornetError::InvalidConfig(
                "transaction touches no partition",
            ));
        }
        if !partitions.contains(base_partition) {
            return Err(HornetError::InvalidConfig(
                "base partition is outside the partition set",
            ));
        }
        self.workload_start.call_once(|| {
            info!(site = self.config.site_id, "first transaction received");
        });

        let txn_id = self.next_txn_id();
        let read_only = proc_def.read_only;
        let mut core = TransactionCore::new(
            txn_id,
            self.config.site_id,
            base_partition,
            partitions,
            read_only,
            proc,
            params,
        );
        core.estimator = self.resolve_estimator(proc, &core.params, estimator);

        if !core.is_distributed() {
            let sender = self
                .work_senders
                .get(&base_partition)
                .ok_or(HornetError::InvalidState("base partition is not local"))?;
            debug!(txn_id, base_partition, "single-partition fast path");
            sender.enqueue(WorkItem::Invoke(LocalTransaction::new(core)))?;
            return Ok(txn_id);
        }

        core.transition(TxnState::Queued)?;
        let record = DtxnRecord {
            handle: DtxnHandle::Local(LocalTransaction::new(core.clone())),
            prefetch: None,
        };
        {
            let mut dtxns = self.lock_dtxns();
            let _ = dtxns.insert(txn_id, record);
        }
        let init_tx = self.init_tx.clone();
        let registered = self.register_init(
            core,
            0,
            Vec::new(),
            Box::new(move |response| {
                let _ = init_tx.send(response);
            }),
        );
        if let Err(error) = registered {
            let _ = self.lock_dtxns().remove(&txn_id);
            return Err(error);
        }
        Ok(txn_id)
    }

    /// Site-side handler of the transaction-init RPC.
    ///
    /// # Errors
    ///
    /// Returns an error when the request names no local partition; N = 0 is
    /// a coordinator misconfiguration, not an abort.
    pub fn transaction_init(
        &self,
        request: TransactionInitRequest,
        sink: InitSink,
    ) -> HornetResult<()> {
        let TransactionInitRequest {
            txn_id,
            base_partition,
            partitions,
            proc,
            params,
            read_only,
            prefetch,
        } = request;
        let mut core = TransactionCore::new(
            txn_id,
            txn_id_site(txn_id),
            base_partition,
            partitions,
            read_only,
            proc,
            params,
        );
        core.estimator = self.resolve_estimator(proc, &core.params, None);
        core.transition(TxnState::Queued)?;
        {
            let mut dtxns = self.lock_dtxns();
            let _ = dtxns.insert(
                txn_id,
                DtxnRecord {
                    handle: DtxnHandle::Remote(RemoteTransaction::new(core.clone())),
                    prefetch: None,
                },
            );
        }
        let registered = self.register_init(core, 0, prefetch, sink);
        if registered.is_err() {
            let _ = self.lock_dtxns().remove(&txn_id);
        }
        registered
    }

    /// Drives every init queue; grants are pushed to the granted executors.
    ///
    /// # Errors
    ///
    /// Returns an error when queue state is unreachable.
    pub fn check_queues(&self) -> HornetResult<()> {
        self.queue_manager.check_queues()
    }

    /// Routes work fragments to their owning executors.
    ///
    /// # Errors
    ///
    /// Returns an error when a fragment targets a non-local partition.
    pub fn transaction_work(&self, fragments: Vec<WorkFragment>) -> HornetResult<()> {
        for fragment in fragments {
            let sender = self
                .work_senders
                .get(&fragment.partition)
                .ok_or(HornetError::InvalidState("fragment targets a non-local partition"))?;
            sender.enqueue(WorkItem::Fragment(fragment))?;
        }
        Ok(())
    }

    /// Announces a distributed transaction's cluster-wide outcome to every
    /// involved local partition.
    ///
    /// # Errors
    ///
    /// Returns an error when the transaction is unknown to this site.
    pub fn finish_distributed(&self, txn_id: TxnId, committed: bool) -> HornetResult<()> {
        let record = {
            let mut dtxns = self.lock_dtxns();
            dtxns.remove(&txn_id)
        };
        let Some(record) = record else {
            return Err(HornetError::InvalidState("unknown distributed transaction"));
        };
        for partition in record.handle.core().partitions.iter() {
            if let Some(sender) = self.work_senders.get(&partition) {
                sender.enqueue(WorkItem::HolderFinish { txn_id, committed })?;
            }
        }
        Ok(())
    }

    /// Re-registers queue-rejected transactions whose restart delay has
    /// elapsed; gives up with `AbortRepeatedRestart` past the restart
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns an error when re-registration fails structurally.
    pub fn process_restarts(&self) -> HornetResult<()> {
        for entry in self.queue_manager.poll_restarts(Instant::now()) {
            let record = {
                let mut dtxns = self.lock_dtxns();
                dtxns.remove(&entry.txn_id)
            };
            let Some(mut record) = record else {
                continue;
            };
            if entry.attempts > RESTART_LIMIT {
                let _ = self.init_tx.send(TransactionInitResponse {
                    txn_id: entry.txn_id,
                    status: InitStatus::AbortRepeatedRestart,
                    partitions: Vec::new(),
                    reject_partition: None,
                    reject_blocker: None,
                });
                continue;
            }

            let new_txn_id = self.next_txn_id();
            {
                let core = record.handle.core_mut();
                let _ = core.transition(TxnState::Aborted);
                core.bump_restart_counter();
                core.restart_as(new_txn_id)?;
                core.transition(TxnState::Queued)?;
            }
            let core = record.handle.core().clone();
            {
                let mut dtxns = self.lock_dtxns();
                let _ = dtxns.insert(new_txn_id, record);
            }
            debug!(
                old_txn = entry.txn_id,
                new_txn = new_txn_id,
                attempts = entry.attempts,
                "restarting rejected init"
            );
            let init_tx = self.init_tx.clone();
            self.register_init(
                core,
                entry.attempts,
                Vec::new(),
                Box::new(move |response| {
                    let _ = init_tx.send(response);
                }),
            )?;
        }
        Ok(())
    }

    /// Decoded prefetch parameter sets attached to an in-flight distributed
    /// transaction.
    #[must_use]
    pub fn prefetch_params(&self, txn_id: TxnId) -> Option<Vec<ParamSet>> {
        let dtxns = self.lock_dtxns();
        dtxns.get(&txn_id).and_then(|record| {
            record
                .prefetch
                .as_ref()
                .and_then(|state| state.decoded.clone())
        })
    }

    /// Expires init rounds older than the configured timeout.
    pub fn expire_inits(&self) -> usize {
        self.queue_manager
            .expire_timed_out(Instant::now(), self.config.init_timeout)
    }

    /// Storage pass-through: bulk-loads rows into one partition's table.
    ///
    /// # Errors
    ///
    /// Returns an error when the partition is not local or the engine
    /// rejects the rows.
    pub fn load_table(
        &self,
        partition: PartitionId,
        table: TableId,
        rows: Vec<(i64, i64)>,
    ) -> HornetResult<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender_for(partition)?.enqueue(WorkItem::LoadTable {
            table,
            rows,
            reply: reply_tx,
        })?;
        Self::await_reply(&reply_rx)?
    }

    /// Storage pass-through: engine counters for one partition.
    ///
    /// # Errors
    ///
    /// Returns an error when the partition is not local.
    pub fn get_stats(&self, partition: PartitionId) -> HornetResult<EngineStats> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender_for(partition)?
            .enqueue(WorkItem::GetStats { reply: reply_tx })?;
        Self::await_reply(&reply_rx)
    }

    /// Storage pass-through: evicts rows from one partition's table.
    ///
    /// # Errors
    ///
    /// Returns an error when block eviction is disabled or the partition is
    /// not local.
    pub fn evict_block(
        &self,
        partition: PartitionId,
        table: TableId,
        row_budget: u64,
    ) -> HornetResult<u64> {
        if !self.config.anticache_enable {
            return Err(HornetError::InvalidConfig("block eviction is disabled"));
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender_for(partition)?.enqueue(WorkItem::EvictBlock {
            table,
            row_budget,
            reply: reply_tx,
        })?;
        Self::await_reply(&reply_rx)?
    }

    /// Next client response, waiting up to `timeout`.
    #[must_use]
    pub fn recv_client_response(&self, timeout: Duration) -> Option<ClientResponse> {
        self.client_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(timeout)
            .ok()
    }

    /// Next init response, waiting up to `timeout`.
    #[must_use]
    pub fn recv_init_response(&self, timeout: Duration) -> Option<TransactionInitResponse> {
        self.init_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(timeout)
            .ok()
    }

    /// Next fragment response, waiting up to `timeout`.
    #[must_use]
    pub fn recv_fragment_response(&self, timeout: Duration) -> Option<FragmentResponse> {
        self.fragment_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(timeout)
            .ok()
    }

    /// Stops every executor thread.
    pub fn shutdown(&mut self) {
        for executor in self.executors.values_mut() {
            executor.shutdown();
        }
    }

    fn sender_for(&self, partition: PartitionId) -> HornetResult<&WorkSender> {
        self.work_senders
            .get(&partition)
            .ok_or(HornetError::InvalidState("partition is not local to this site"))
    }

    fn await_reply<T>(reply_rx: &mpsc::Receiver<T>) -> HornetResult<T> {
        reply_rx
            .recv_timeout(Duration::from_secs(1))
            .map_err(|_| HornetError::InvalidState("partition executor did not reply"))
    }

    /// Attaches estimator state: the supplied one (feeding the path cache),
    /// or a cache hit rebuilt on a pooled state.
    fn resolve_estimator(
        &self,
        proc: ProcId,
        params: &ParamSet,
        estimator: Option<EstimatorState>,
    ) -> Option<EstimatorState> {
        if !self.config.markov_enable {
            return estimator;
        }
        let fingerprint = params.fingerprint();
        if let Some(state) = estimator {
            if self.config.markov_path_caching
                && let Some(initial) = state.initial.clone()
            {
                let mut cache = self
                    .estimate_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let _ = cache.insert((proc, fingerprint), initial);
            }
            return Some(state);
        }
        if !self.config.markov_path_caching {
            return None;
        }
        let cached = {
            let cache = self
                .estimate_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cache.get(&(proc, fingerprint)).cloned()
        }?;
        let mut state = self
            .estimator_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(EstimatorState::default);
        state.proc = proc;
        state.params_fingerprint = fingerprint;
        state.initial = Some(cached.clone());
        state.last = Some(cached);
        Some(state)
    }

    /// Shared init path for locally submitted and RPC-delivered
    /// transactions: arms the accumulation callback, wires holder
    /// installation into the grant, and registers with the queue manager.
    fn register_init(
        &self,
        core: TransactionCore,
        attempts: u32,
        prefetch: Vec<PrefetchQuery>,
        sink: InitSink,
    ) -> HornetResult<()> {
        let txn_id = core.txn_id;
        let locals = self.queue_manager.local_partitions_in(&core.partitions);
        if locals.is_empty() {
            return Err(HornetError::InvalidConfig(
                "transaction init touches no local partition",
            ));
        }

        let has_remote = core
            .partitions
            .iter()
            .any(|partition| !self.work_senders.contains_key(&partition));
        let speculation_eligible = has_remote || self.config.specexec_ignore_all_local;

        let dispatch = self.build_prefetch_dispatch(&core, prefetch);

        let senders = self.work_senders.clone();
        let holder_core = core.clone();
        let wrapped: InitSink = Box::new(move |response: TransactionInitResponse| {
            if response.status == InitStatus::Ok {
                for partition in &response.partitions {
                    if let Some(sender) = senders.get(partition) {
                        let _ = sender.enqueue(WorkItem::SetHolder {
                            core: holder_core.clone(),
                            speculation_eligible,
                        });
                    }
                }
            }
            sink(response);
        });

        let callback = Arc::new(TransactionInitCallback::new());
        callback.init(txn_id, locals, wrapped, dispatch);
        self.queue_manager.register(
            txn_id,
            core.site_id,
            &core.partitions,
            attempts,
            &callback,
        )
    }

    fn build_prefetch_dispatch(
        &self,
        core: &TransactionCore,
        prefetch: Vec<PrefetchQuery>,
    ) -> Option<PrefetchDispatch> {
        if !self.config.exec_prefetch_queries || prefetch.is_empty() {
            return None;
        }
        let txn_id = core.txn_id;
        let mut raw_params = Vec::with_capacity(prefetch.len());
        let mut fragments = Vec::with_capacity(prefetch.len());
        for query in prefetch {
            let read_only = self
                .catalog
                .statement(query.stmt)
                .is_some_and(|stmt| !stmt.writes);
            raw_params.push(query.params);
            fragments.push(WorkFragment {
                txn_id,
                partition: query.partition,
                stmt: query.stmt,
                stmt_counter: 0,
                params: ParamSet::default(),
                read_only,
                prefetch: true,
            });
        }
        let senders = self.work_senders.clone();
        let dtxns = Arc::clone(&self.dtxns);
        Some(PrefetchDispatch {
            base_partition: core.base_partition,
            raw_params,
            fragments,
            router: Box::new(move |decoded, fragments| {
                // Remember the decoded sets on the transaction handle, then
                // hand each fragment to its owning executor.
                {
                    let mut dtxns = dtxns.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(record) = dtxns.get_mut(&txn_id) {
                        record.prefetch = Some(PrefetchState {
                            decoded: Some(decoded),
                            ..PrefetchState::default()
                        });
                    }
                }
                for fragment in fragments {
                    if let Some(sender) = senders.get(&fragment.partition) {
                        let _ = sender.enqueue(WorkItem::Fragment(fragment));
                    }
                }
            }),
        })
    }

    fn lock_dtxns(&self) -> MutexGuard<'_, HashMap<TxnId, DtxnRecord>> {
        self.dtxns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Site {
    fn drop(&mut self) {
        self.shutdown();
    }
}
