//! Table-granularity conflict checking.

use std::sync::Arc;

use tracing::debug;

use hornet_catalog::{Catalog, ConflictKind, ConflictMatrix};
use hornet_common::ids::{PartitionId, ProcId};
use hornet_txn::handle::TransactionCore;

/// Conflict checker over the compiled table-conflict bitsets.
///
/// The bitsets answer "may these procedures ever conflict"; when they do,
/// the declared conflict pairs are consulted table by table against what the
/// holder has actually touched on this partition so far.
#[derive(Debug)]
pub struct TableConflictChecker {
    catalog: Arc<Catalog>,
    matrix: ConflictMatrix,
}

impl TableConflictChecker {
    /// Compiles the checker from a catalog.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let matrix = ConflictMatrix::build(&catalog);
        Self { catalog, matrix }
    }

    /// A procedure with no declared conflicts never needs a check.
    #[must_use]
    pub fn ignore_procedure(&self, proc: ProcId) -> bool {
        !self.matrix.has_any_conflicts(proc)
    }

    /// Decides whether `candidate` may run ahead of `holder` on `partition`.
    #[must_use]
    pub fn can_execute(
        &self,
        holder: &TransactionCore,
        candidate: &TransactionCore,
        partition: PartitionId,
    ) -> bool {
        let holder_proc = holder.proc;
        let candidate_proc = candidate.proc;

        let holder_rw = self.matrix.has_rw_conflict(holder_proc, candidate_proc);
        let holder_ww = self.matrix.has_ww_conflict(holder_proc, candidate_proc);
        let candidate_rw = self.matrix.has_rw_conflict(candidate_proc, holder_proc);
        let candidate_ww = self.matrix.has_ww_conflict(candidate_proc, holder_proc);

        if !(holder_rw || holder_ww || candidate_rw || candidate_ww) {
            return true;
        }

        // Same non-read-only procedure twice always collides on its own rows.
        if holder_proc == candidate_proc {
            debug!(
                txn = holder.txn_id,
                candidate = candidate.txn_id,
                "self-conflicting procedure rejected"
            );
            return false;
        }

        // If the candidate would write what the holder reads or writes, the
        // candidate may only proceed while the holder has not touched those
        // tables on this partition yet.
        if holder_rw || holder_ww {
            for pair in self
                .catalog
                .conflict_pairs_between(holder_proc, candidate_proc)
            {
                for table in &pair.tables {
                    if holder.is_table_read_or_written(partition, *table) {
                        debug!(
                            txn = holder.txn_id,
                            candidate = candidate.txn_id,
                            table = *table,
                            "holder already touched conflicting table"
                        );
                        return false;
                    }
                }
            }
        }

        // A candidate that only reads what the holder writes may proceed as
        // long as the holder has not written those tables yet.
        if candidate_rw && !candidate_ww {
            for pair in self
                .catalog
                .conflict_pairs_between(candidate_proc, holder_proc)
            {
                if pair.kind != ConflictKind::ReadWrite {
                    continue;
                }
                for table in &pair.tables {
                    if holder.is_table_written(partition, *table) {
                        debug!(
                            txn = holder.txn_id,
                            candidate = candidate.txn_id,
                            table = *table,
                            "holder already wrote conflicting table"
                        );
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::TableConflictChecker;
    use googletest::prelude::*;
    use hornet_catalog::{CatalogBuilder, ConflictKind};
    use hornet_common::partition_set::PartitionSet;
    use hornet_txn::handle::TransactionCore;
    use hornet_txn::params::ParamSet;
    use rstest::rstest;
    use std::sync::Arc;

    struct Fixture {
        checker: TableConflictChecker,
        payment: u16,
        browse: u16,
        subscribe: u16,
        warehouse: u16,
    }

    fn fixture() -> Fixture {
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
        Fixture {
            checker: TableConflictChecker::new(catalog),
            payment,
            browse,
            subscribe,
            warehouse,
        }
    }

    fn txn(txn_id: u64, proc: u16, read_only: bool, partitions: &[u32]) -> TransactionCore {
        TransactionCore::new(
            txn_id,
            0,
            partitions[0],
            PartitionSet::from(partitions),
            read_only,
            proc,
            ParamSet::default(),
        )
    }

    #[rstest]
    fn disjoint_procedures_are_admissible() {
        let fixture = fixture();
        let holder = txn(10, fixture.payment, false, &[0, 1]);
        let candidate = txn(20, fixture.subscribe, false, &[0]);
        assert_that!(fixture.checker.can_execute(&holder, &candidate, 0), eq(true));
    }

    #[rstest]
    fn same_non_read_only_procedure_is_rejected() {
        let fixture = fixture();
        let holder = txn(10, fixture.payment, false, &[0, 1]);
        let candidate = txn(20, fixture.payment, false, &[0]);
        assert_that!(
            fixture.checker.can_execute(&holder, &candidate, 0),
            eq(false)
        );
    }

    #[rstest]
    fn conflicting_candidate_runs_only_before_the_holder_touches_the_table() {
        let fixture = fixture();
        let mut holder = txn(10, fixture.payment, false, &[0, 1]);
        let candidate = txn(20, fixture.browse, true, &[0]);

        assert_that!(fixture.checker.can_execute(&holder, &candidate, 0), eq(true));
        holder.mark_table_written(0, fixture.warehouse);
        assert_that!(
            fixture.checker.can_execute(&holder, &candidate, 0),
            eq(false)
        );
    }

    #[rstest]
    fn always_pairs_are_gated_by_touched_tables_like_any_other_kind() {
        let mut builder = CatalogBuilder::new();
        let district = builder.table("DISTRICT", vec![0]);
        let pay = builder.procedure("PayDistrict", false);
        let audit = builder.procedure("AuditDistrict", true);
        let update = builder.statement(pay, "updateDistrict", vec![district], true, Vec::new());
        let scan = builder.statement(audit, "scanDistrict", vec![district], false, Vec::new());
        builder.conflict(update, scan, vec![district], ConflictKind::Always);
        let checker = TableConflictChecker::new(Arc::new(builder.build()));

        let mut holder = txn(10, pay, false, &[0, 1]);
        let candidate = txn(20, audit, true, &[0]);

        assert_that!(checker.can_execute(&holder, &candidate, 0), eq(true));
        holder.mark_table_read(0, district);
        assert_that!(checker.can_execute(&holder, &candidate, 0), eq(false));
    }

    #[rstest]
    fn touched_tables_on_other_partitions_do_not_block() {
        let fixture = fixture();
        let mut holder = txn(10, fixture.payment, false, &[0, 1]);
        let candidate = txn(20, fixture.browse, true, &[0]);

        holder.mark_table_written(1, fixture.warehouse);
        assert_that!(fixture.checker.can_execute(&holder, &candidate, 0), eq(true));
    }

    #[rstest]
    fn only_procedures_without_any_declared_or_self_conflict_are_ignorable() {
        let mut builder = CatalogBuilder::new();
        let item = builder.table("ITEM", vec![0]);
        let writer = builder.procedure("Restock", false);
        let reader = builder.procedure("GetItem", true);
        let _ = builder.statement(writer, "restock", vec![item], true, Vec::new());
        let _ = builder.statement(reader, "getItem", vec![item], false, Vec::new());
        let checker = TableConflictChecker::new(Arc::new(builder.build()));

        // Restock self-conflicts because it writes; GetItem declares nothing.
        assert_that!(checker.ignore_procedure(writer), eq(false));
        assert_that!(checker.ignore_procedure(reader), eq(true));
    }

    #[rstest]
    fn fixture_procedures_with_declared_conflicts_are_not_ignorable() {
        let fixture = fixture();
        assert_that!(fixture.checker.ignore_procedure(fixture.subscribe), eq(false));
        assert_that!(fixture.checker.ignore_procedure(fixture.browse), eq(false));
    }
}
