//! Speculative candidate selection and commit-dependency tracking.

use std::sync::{Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use tracing::debug;

use hornet_common::config::SiteConfig;
use hornet_common::ids::{PartitionId, TxnId};
use hornet_txn::handle::{LocalTransaction, TransactionCore};

use crate::ConflictChecker;

#[derive(Debug, Default)]
struct SpecBatch {
    holder: TxnId,
    admitted: Vec<TxnId>,
}

/// Picks single-partition candidates to run ahead of a stalled distributed
/// holder and remembers which candidates ride on which holder.
///
/// Selection is in arrival order: the first admissible candidate wins.
/// Admitted candidates commit only if their holder commits; the executor
/// asks [`SpeculativeScheduler::holder_resolved`] for the admitted batch, in
/// speculative-execution order, when the holder's outcome is known.
#[derive(Debug)]
pub struct SpeculativeScheduler {
    checker: std::sync::Arc<ConflictChecker>,
    enabled: bool,
    idle_only: bool,
    admitted: Mutex<HashMap<PartitionId, SpecBatch>>,
}

impl SpeculativeScheduler {
    /// Creates a scheduler honoring the site's speculation knobs.
    #[must_use]
    pub fn new(checker: std::sync::Arc<ConflictChecker>, config: &SiteConfig) -> Self {
        Self {
            checker,
            enabled: config.specexec_enable,
            idle_only: config.specexec_idle,
            admitted: Mutex::new(HashMap::new()),
        }
    }

    /// Conflict checker driving admissions.
    #[must_use]
    pub fn checker(&self) -> &ConflictChecker {
        &self.checker
    }

    /// Scans `candidates` in arrival order and returns the position of the
    /// first one that may run ahead of `holder` on `partition`.
    ///
    /// `read_only_only` restricts admission to read-only candidates (the
    /// holder is a read-only distributed transaction). `holder_work_queued`
    /// reports whether the partition still has ready work for the holder;
    /// with `specexec.idle` set, speculation only fires on an otherwise idle
    /// queue.
    #[must_use]
    pub fn select<'a>(
        &self,
        holder: &TransactionCore,
        partition: PartitionId,
        candidates: impl Iterator<Item = &'a LocalTransaction>,
        read_only_only: bool,
        holder_work_queued: bool,
    ) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        if self.idle_only && holder_work_queued {
            return None;
        }
        for (position, candidate) in candidates.enumerate() {
            let core = &candidate.core;
            if core.is_distributed() || core.base_partition != partition {
                continue;
            }
            if read_only_only && !core.read_only {
                continue;
            }
            let admissible = self.checker.ignore_procedure(core.proc)
                || self.checker.can_execute(holder, core, partition);
            if admissible {
                debug!(
                    holder = holder.txn_id,
                    candidate = core.txn_id,
                    partition,
                    "speculative candidate admitted"
                );
                return Some(position);
            }
        }
        None
    }

    /// Links an admitted candidate to its holder.
    pub fn admit(&self, partition: PartitionId, holder: TxnId, candidate: TxnId) {
        let mut admitted = self.lock_admitted();
        let batch = admitted.entry(partition).or_default();
        if batch.holder != holder {
            batch.holder = holder;
            batch.admitted.clear();
        }
        batch.admitted.push(candidate);
    }

    /// Candidates currently riding on `holder` at `partition`, in admission
    /// order.
    #[must_use]
    pub fn admitted_for(&self, partition: PartitionId, holder: TxnId) -> Vec<TxnId> {
        let admitted = self.lock_admitted();
        admitted
            .get(&partition)
            .filter(|batch| batch.holder == holder)
            .map(|batch| batch.admitted.clone())
            .unwrap_or_default()
    }

    /// Drains the admitted batch once the holder's outcome is known.
    ///
    /// Returns the candidates in speculative-execution order; the executor
    /// releases or rolls them back depending on the outcome.
    #[must_use]
    pub fn holder_resolved(&self, partition: PartitionId, holder: TxnId) -> Vec<TxnId> {
        let mut admitted = self.lock_admitted();
        match admitted.get_mut(&partition) {
            Some(batch) if batch.holder == holder => std::mem::take(&mut batch.admitted),
            _ => Vec::new(),
        }
    }

    fn lock_admitted(&self) -> MutexGuard<'_, HashMap<PartitionId, SpecBatch>> {
        self.admitted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::SpeculativeScheduler;
    use crate::ConflictChecker;
    use googletest::prelude::*;
    use hornet_catalog::{CatalogBuilder, ConflictKind};
    use hornet_common::config::SiteConfig;
    use hornet_common::partition_set::PartitionSet;
    use hornet_txn::handle::{LocalTransaction, TransactionCore};
    use hornet_txn::params::ParamSet;
    use rstest::rstest;
    use std::sync::Arc;

    struct Fixture {
        scheduler: SpeculativeScheduler,
        payment: u16,
        browse: u16,
        subscribe: u16,
        warehouse: u16,
    }

    fn fixture(config: &SiteConfig) -> Fixture {
        let mut builder = CatalogBuilder::new();
        let warehouse = builder.table("WAREHOUSE", vec![0]);
        let subscriber = builder.table("SUBSCRIBER", vec![0]);
        let payment = builder.procedure("Payment", false);
        let browse = builder.procedure("BrowseWarehouse", true);
        let subscribe = builder.procedure("Subscribe", false);
        let update =
            builder.statement(payment, "updateWarehouse", vec![warehouse], true, Vec::new());
        let scan = builder.statement(browse, "scanWarehouse", vec![warehouse], false, Vec::new());
        let _insert = builder.statement(
            subscribe,
            "insertSubscriber",
            vec![subscriber],
            true,
            Vec::new(),
        );
        builder.conflict(update, scan, vec![warehouse], ConflictKind::WriteWrite);
        builder.conflict(scan, update, vec![warehouse], ConflictKind::ReadWrite);
        let catalog = Arc::new(builder.build());
        let checker = Arc::new(ConflictChecker::from_config(config, &catalog));
        Fixture {
            scheduler: SpeculativeScheduler::new(checker, config),
            payment,
            browse,
            subscribe,
            warehouse,
        }
    }

    fn local(txn_id: u64, proc: u16, read_only: bool, partitions: &[u32]) -> LocalTransaction {
        LocalTransaction::new(TransactionCore::new(
            txn_id,
            0,
            partitions[0],
            PartitionSet::from(partitions),
            read_only,
            proc,
            ParamSet::default(),
        ))
    }

    #[rstest]
    fn first_admissible_candidate_wins_in_arrival_order() {
        let config = SiteConfig::default();
        let fixture = fixture(&config);
        let mut holder = local(10, fixture.payment, false, &[0, 1]).core;
        holder.mark_table_written(0, fixture.warehouse);

        let conflicting = local(20, fixture.browse, true, &[0]);
        let distributed = local(21, fixture.subscribe, false, &[0, 1]);
        let disjoint = local(22, fixture.subscribe, false, &[0]);
        let queue = vec![conflicting, distributed, disjoint];

        let selected = fixture
            .scheduler
            .select(&holder, 0, queue.iter(), false, false);
        assert_that!(selected, eq(Some(2_usize)));
    }

    #[rstest]
    fn read_only_mode_skips_writers() {
        let config = SiteConfig::default();
        let fixture = fixture(&config);
        let holder = local(10, fixture.payment, false, &[0, 1]).core;

        let writer = local(20, fixture.subscribe, false, &[0]);
        let reader = local(21, fixture.browse, true, &[0]);
        let queue = vec![writer, reader];

        let selected = fixture
            .scheduler
            .select(&holder, 0, queue.iter(), true, false);
        assert_that!(selected, eq(Some(1_usize)));
    }

    #[rstest]
    fn disabled_speculation_never_selects() {
        let config = SiteConfig {
            specexec_enable: false,
            ..SiteConfig::default()
        };
        let fixture = fixture(&config);
        let holder = local(10, fixture.payment, false, &[0, 1]).core;
        let candidate = local(20, fixture.subscribe, false, &[0]);
        let queue = vec![candidate];

        let selected = fixture
            .scheduler
            .select(&holder, 0, queue.iter(), false, false);
        assert_that!(selected, eq(None));
    }

    #[rstest]
    fn idle_mode_waits_for_an_empty_holder_queue() {
        let config = SiteConfig {
            specexec_idle: true,
            ..SiteConfig::default()
        };
        let fixture = fixture(&config);
        let holder = local(10, fixture.payment, false, &[0, 1]).core;
        let candidate = local(20, fixture.subscribe, false, &[0]);
        let queue = vec![candidate];

        assert_that!(
            fixture
                .scheduler
                .select(&holder, 0, queue.iter(), false, true),
            eq(None)
        );
        assert_that!(
            fixture
                .scheduler
                .select(&holder, 0, queue.iter(), false, false),
            eq(Some(0_usize))
        );
    }

    #[rstest]
    fn admitted_batch_drains_in_admission_order() {
        let config = SiteConfig::default();
        let fixture = fixture(&config);
        fixture.scheduler.admit(0, 10, 20);
        fixture.scheduler.admit(0, 10, 21);

        assert_that!(fixture.scheduler.admitted_for(0, 10), eq(&vec![20, 21]));
        assert_that!(fixture.scheduler.holder_resolved(0, 10), eq(&vec![20, 21]));
        assert_that!(fixture.scheduler.holder_resolved(0, 10), eq(&Vec::<u64>::new()));
    }

    #[rstest]
    fn a_new_holder_resets_the_partition_batch() {
        let config = SiteConfig::default();
        let fixture = fixture(&config);
        fixture.scheduler.admit(0, 10, 20);
        fixture.scheduler.admit(0, 11, 30);

        assert_that!(fixture.scheduler.admitted_for(0, 10), eq(&Vec::<u64>::new()));
        assert_that!(fixture.scheduler.holder_resolved(0, 11), eq(&vec![30]));
    }
}
