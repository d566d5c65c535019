//! Accumulation callback for the distributed init protocol.
//!
//! One callback instance converts N per-partition grant/abort signals into a
//! single response to the coordinator. `granted` and `abort` race from
//! partition-executor threads; the response is emitted exactly once, guarded
//! by a compare-and-set on the aborted flag plus taking the pending response
//! out of its slot.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tracing::{debug, warn};

use hornet_common::ids::{PartitionId, TxnId};

use crate::messages::{InitStatus, TransactionInitResponse, WorkFragment};
use crate::params::ParamSet;

/// Consumes the single response produced by the callback.
pub type ResponseSink = Box<dyn FnOnce(TransactionInitResponse) + Send>;

/// Receives decoded prefetch parameter sets plus the fragments to route once
/// the grant completes. The site glue behind this attaches the parameters to
/// the transaction handle and forwards each fragment to its executor.
pub type PrefetchRouter = Box<dyn FnOnce(Vec<ParamSet>, Vec<WorkFragment>) + Send>;

/// Prefetch payload handed to the callback at init time.
pub struct PrefetchDispatch {
    /// Base partition of the transaction; fragments targeting it are
    /// skipped on the receive side.
    pub base_partition: PartitionId,
    /// Serialized parameter sets from the init request.
    pub raw_params: Vec<Vec<u8>>,
    /// Prefetch fragments to route.
    pub fragments: Vec<WorkFragment>,
    /// Site-level routing hook.
    pub router: PrefetchRouter,
}

struct PendingResponse {
    txn_id: TxnId,
    local_partitions: Vec<PartitionId>,
    granted: Vec<PartitionId>,
    sink: ResponseSink,
    prefetch: Option<PrefetchDispatch>,
}

/// Reusable accumulation callback for one init round.
pub struct TransactionInitCallback {
    invoke_even_if_aborted: bool,
    aborted: AtomicBool,
    remaining: AtomicI64,
    pending: Mutex<Option<PendingResponse>>,
}

impl std::fmt::Debug for TransactionInitCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionInitCallback")
            .field("aborted", &self.aborted.load(Ordering::Acquire))
            .field("remaining", &self.remaining.load(Ordering::Acquire))
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl TransactionInitCallback {
    /// Creates an uninitialized callback, ready for `init`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_invoke_even_if_aborted(false)
    }

    /// Creates a callback flavor that still emits once the counter drains
    /// even after an abort consumed the response.
    #[must_use]
    pub fn with_invoke_even_if_aborted(invoke_even_if_aborted: bool) -> Self {
        Self {
            invoke_even_if_aborted,
            aborted: AtomicBool::new(false),
            remaining: AtomicI64::new(0),
            pending: Mutex::new(None),
        }
    }

    /// Arms the callback for one init round.
    ///
    /// `local_partitions` are the local partitions the transaction touches;
    /// the expected acknowledgment count equals its length. The queue
    /// manager validates that the count is at least one before arming.
    pub fn init(
        &self,
        txn_id: TxnId,
        local_partitions: Vec<PartitionId>,
        sink: ResponseSink,
        prefetch: Option<PrefetchDispatch>,
    ) {
        debug!(txn_id, expected = local_partitions.len(), "arming init callback");
        self.aborted.store(false, Ordering::Release);
        self.remaining
            .store(local_partitions.len() as i64, Ordering::Release);
        let mut pending = self.lock_pending();
        *pending = Some(PendingResponse {
            txn_id,
            local_partitions,
            granted: Vec::new(),
            sink,
            prefetch,
        });
    }

    /// Returns whether the callback is armed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lock_pending().is_some()
    }

    /// Returns whether an abort consumed this round.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Acknowledgments still outstanding.
    #[must_use]
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Records the grant of one partition.
    ///
    /// When this was the last outstanding acknowledgment and the round was
    /// not aborted, the OK response is emitted and any prefetch batch is
    /// decoded and routed.
    pub fn granted(&self, partition: PartitionId) {
        if !self.is_aborted() {
            let mut pending = self.lock_pending();
            if let Some(response) = pending.as_mut() {
                response.granted.push(partition);
            }
        }
        let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && (!self.is_aborted() || self.invoke_even_if_aborted) {
            self.emit_granted();
        }
    }

    /// Aborts the round.
    ///
    /// The first abort wins: it consumes the pending response and emits it
    /// with the supplied status, the local partitions listed as declined,
    /// and the rejection metadata. Later aborts and late grants are no-ops.
    pub fn abort(
        &self,
        status: InitStatus,
        reject_partition: Option<PartitionId>,
        reject_blocker: Option<TxnId>,
    ) {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(response) = self.lock_pending().take() else {
            return;
        };
        debug!(txn_id = response.txn_id, ?status, "aborting init round");
        let declined = response.local_partitions.clone();
        (response.sink)(TransactionInitResponse {
            txn_id: response.txn_id,
            status,
            partitions: declined,
            reject_partition,
            reject_blocker,
        });
    }

    /// Releases per-round state for pool reuse.
    pub fn finish(&self) {
        self.aborted.store(false, Ordering::Release);
        self.remaining.store(0, Ordering::Release);
        *self.lock_pending() = None;
    }

    fn emit_granted(&self) {
        let Some(response) = self.lock_pending().take() else {
            return;
        };
        let PendingResponse {
            txn_id,
            granted,
            sink,
            prefetch,
            ..
        } = response;

        // Prefetch parameters must decode before the grant is announced; a
        // malformed payload is fatal to the transaction and turns the round
        // into an unexpected abort.
        let decoded = match &prefetch {
            Some(dispatch) => {
                let mut sets = Vec::with_capacity(dispatch.raw_params.len());
                let mut failure = None;
                for (offset, raw) in dispatch.raw_params.iter().enumerate() {
                    match ParamSet::decode(raw) {
                        Ok(params) => sets.push(params),
                        Err(error) => {
                            failure = Some((offset, error));
                            break;
                        }
                    }
                }
                if let Some((offset, error)) = failure {
                    warn!(txn_id, offset, %error, "prefetch parameter set failed to decode");
                    let _ = self.aborted.compare_exchange(
                        false,
                        true,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    sink(TransactionInitResponse {
                        txn_id,
                        status: InitStatus::AbortUnexpected,
                        partitions: Vec::new(),
                        reject_partition: None,
                        reject_blocker: None,
                    });
                    return;
                }
                Some(sets)
            }
            None => None,
        };

        debug!(txn_id, granted = granted.len(), "init round complete");
        sink(TransactionInitResponse {
            txn_id,
            status: InitStatus::Ok,
            partitions: granted,
            reject_partition: None,
            reject_blocker: None,
        });

        if let (Some(dispatch), Some(decoded)) = (prefetch, decoded) {
            let base = dispatch.base_partition;
            let mut fragments = dispatch.fragments;
            // Pair parameters with fragments positionally before dropping
            // the base-partition fragments.
            for (fragment, params) in fragments.iter_mut().zip(decoded.iter()) {
                fragment.params = params.clone();
            }
            fragments.retain(|fragment| fragment.partition != base);
            (dispatch.router)(decoded, fragments);
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingResponse>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for TransactionInitCallback {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{PrefetchDispatch, TransactionInitCallback};
    use crate::messages::{InitStatus, TransactionInitResponse, WorkFragment};
    use crate::params::{ParamSet, ParamValue};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn capture() -> (
        Arc<Mutex<Vec<TransactionInitResponse>>>,
        super::ResponseSink,
    ) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink_target = Arc::clone(&captured);
        let sink: super::ResponseSink = Box::new(move |response| {
            sink_target.lock().expect("test sink mutex").push(response);
        });
        (captured, sink)
    }

    #[rstest]
    fn emits_once_after_all_grants() {
        let callback = TransactionInitCallback::new();
        let (captured, sink) = capture();
        callback.init(500, vec![0, 1, 2], sink, None);

        callback.granted(0);
        callback.granted(2);
        assert_that!(captured.lock().unwrap().len(), eq(0_usize));
        callback.granted(1);

        let responses = captured.lock().unwrap();
        assert_that!(responses.len(), eq(1_usize));
        assert_that!(responses[0].status, eq(InitStatus::Ok));
        assert_that!(responses[0].partitions, eq(&vec![0, 2, 1]));
    }

    #[rstest]
    fn first_abort_wins_and_later_aborts_are_noops() {
        let callback = TransactionInitCallback::new();
        let (captured, sink) = capture();
        callback.init(500, vec![0, 1, 2], sink, None);

        callback.granted(0);
        callback.abort(InitStatus::AbortReject, Some(1), Some(42));
        callback.abort(InitStatus::AbortTimeout, None, None);
        callback.granted(1);
        callback.granted(2);

        let responses = captured.lock().unwrap();
        assert_that!(responses.len(), eq(1_usize));
        assert_that!(responses[0].status, eq(InitStatus::AbortReject));
        assert_that!(responses[0].partitions, eq(&vec![0, 1, 2]));
        assert_that!(responses[0].reject_partition, eq(Some(1)));
        assert_that!(responses[0].reject_blocker, eq(Some(42)));
    }

    #[rstest]
    fn prefetch_routes_decoded_fragments_skipping_base_partition() {
        let callback = TransactionInitCallback::new();
        let (captured, sink) = capture();
        let routed = Arc::new(Mutex::new(Vec::new()));
        let routed_target = Arc::clone(&routed);
        let params = ParamSet::new(vec![ParamValue::Int(11)]);
        let fragment = |partition: u32| WorkFragment {
            txn_id: 500,
            partition,
            stmt: 0,
            stmt_counter: 0,
            params: ParamSet::default(),
            read_only: true,
            prefetch: true,
        };
        callback.init(
            500,
            vec![0, 1],
            sink,
            Some(PrefetchDispatch {
                base_partition: 0,
                raw_params: vec![params.encode()],
                fragments: vec![fragment(0), fragment(1)],
                router: Box::new(move |decoded, fragments| {
                    routed_target
                        .lock()
                        .expect("test router mutex")
                        .push((decoded, fragments));
                }),
            }),
        );

        callback.granted(0);
        callback.granted(1);

        assert_that!(captured.lock().unwrap()[0].status, eq(InitStatus::Ok));
        let routed = routed.lock().unwrap();
        assert_that!(routed.len(), eq(1_usize));
        assert_that!(routed[0].0, eq(&vec![params.clone()]));
        let targets = routed[0].1.iter().map(|f| f.partition).collect::<Vec<_>>();
        assert_that!(targets, eq(&vec![1]));
    }

    #[rstest]
    fn malformed_prefetch_payload_turns_the_grant_into_an_unexpected_abort() {
        let callback = TransactionInitCallback::new();
        let (captured, sink) = capture();
        callback.init(
            500,
            vec![0],
            sink,
            Some(PrefetchDispatch {
                base_partition: 0,
                raw_params: vec![vec![0xFF, 0xFF]],
                fragments: Vec::new(),
                router: Box::new(|_, _| panic!("router must not run on decode failure")),
            }),
        );

        callback.granted(0);

        let responses = captured.lock().unwrap();
        assert_that!(responses.len(), eq(1_usize));
        assert_that!(responses[0].status, eq(InitStatus::AbortUnexpected));
        assert_that!(callback.is_aborted(), eq(true));
    }

    #[rstest]
    fn finish_clears_state_for_reuse() {
        let callback = TransactionInitCallback::new();
        let (captured, sink) = capture();
        callback.init(500, vec![0], sink, None);
        callback.abort(InitStatus::AbortTimeout, None, None);
        callback.finish();

        assert_that!(callback.is_initialized(), eq(false));
        assert_that!(callback.is_aborted(), eq(false));

        let (_captured2, sink2) = capture();
        callback.init(501, vec![0], sink2, None);
        callback.granted(0);
        assert_that!(captured.lock().unwrap().len(), eq(1_usize));
    }
}
