//! Query-estimate conflict checking.
//!
//! Finer-grained than the table checker: instead of asking whether two
//! procedures may ever collide, it compares the queries both transactions
//! are forecast to run on the partition and the concrete values they bind to
//! the primary keys of conflicting statements. Two updates of different
//! warehouse rows are disjoint even though their statements conflict at the
//! table level.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::debug;

use hornet_catalog::{Catalog, ConflictKind, ConflictPair, ParameterMapping, PkeyBinding};
use hornet_common::ids::{PartitionId, ProcId, StmtId};
use hornet_txn::estimate::EstimatedQuery;
use hornet_txn::handle::TransactionCore;
use hornet_txn::params::{ParamSet, ParamValue};

/// Conflict checker over query estimates and bound primary-key values.
#[derive(Debug)]
pub struct MarkovConflictChecker {
    catalog: Arc<Catalog>,
    /// Statement-pair index over the catalog's declared conflicts.
    stmt_conflicts: HashMap<(StmtId, StmtId), ConflictPair>,
}

impl MarkovConflictChecker {
    /// Builds the per-statement conflict cache from a catalog.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let stmt_conflicts = catalog
            .conflict_pairs()
            .map(|pair| ((pair.stmt0, pair.stmt1), pair.clone()))
            .collect();
        Self {
            catalog,
            stmt_conflicts,
        }
    }

    /// The estimate-based checker never skips a procedure outright; absent
    /// estimates are handled per transaction in `can_execute`.
    #[must_use]
    pub fn ignore_procedure(&self, _proc: ProcId) -> bool {
        false
    }

    /// Decides whether `candidate` may run ahead of `holder` on `partition`.
    ///
    /// Missing estimator state or an empty forecast on either side means the
    /// disjointness of the two transactions cannot be proven, which is a
    /// rejection.
    #[must_use]
    pub fn can_execute(
        &self,
        holder: &TransactionCore,
        candidate: &TransactionCore,
        partition: PartitionId,
    ) -> bool {
        let Some(holder_state) = holder.estimator.as_ref() else {
            debug!(txn = holder.txn_id, "holder has no estimator state");
            return false;
        };
        let Some(candidate_state) = candidate.estimator.as_ref() else {
            debug!(txn = candidate.txn_id, "candidate has no estimator state");
            return false;
        };
        let Some(holder_estimate) = holder_state.last_or_initial() else {
            return false;
        };
        let Some(candidate_estimate) = candidate_state.initial.as_ref() else {
            return false;
        };
        if !holder_estimate.has_queries() || !candidate_estimate.has_queries() {
            return false;
        }

        if holder_estimate.is_read_only_at(partition)
            && candidate_estimate.is_read_only_at(partition)
        {
            return true;
        }

        let holder_queries = holder_estimate
            .queries
            .filtered(partition)
            .collect::<Vec<_>>();
        let candidate_queries = candidate_estimate
            .queries
            .filtered(partition)
            .collect::<Vec<_>>();

        for holder_query in &holder_queries {
            for candidate_query in &candidate_queries {
                let Some(pair) = self
                    .stmt_conflicts
                    .get(&(holder_query.stmt, candidate_query.stmt))
                else {
                    continue;
                };
                if pair.kind == ConflictKind::Always {
                    debug!(
                        holder_stmt = holder_query.stmt,
                        candidate_stmt = candidate_query.stmt,
                        "always-conflicting statement pair"
                    );
                    return false;
                }
                if !self.queries_are_disjoint(
                    holder_query,
                    &holder.params,
                    candidate_query,
                    &candidate.params,
                ) {
                    return false;
                }
            }
        }
        true
    }

    /// Compares the primary-key bindings of two conflicting queries.
    ///
    /// Returns `true` only when at least one binding pair resolves to
    /// provably different values. Equal bindings mean the queries hit the
    /// same rows; an unresolvable binding means disjointness cannot be
    /// proven. Both are conflicts.
    fn queries_are_disjoint(
        &self,
        holder_query: &EstimatedQuery,
        holder_params: &ParamSet,
        candidate_query: &EstimatedQuery,
        candidate_params: &ParamSet,
    ) -> bool {
        let Some(holder_stmt) = self.catalog.statement(holder_query.stmt) else {
            return false;
        };
        let Some(candidate_stmt) = self.catalog.statement(candidate_query.stmt) else {
            return false;
        };
        if holder_stmt.pkey_bindings.is_empty() {
            return false;
        }

        let mut any_divergent = false;
        for holder_binding in &holder_stmt.pkey_bindings {
            let Some(candidate_binding) = candidate_stmt
                .pkey_bindings
                .iter()
                .find(|binding| {
                    binding.table == holder_binding.table
                        && binding.column == holder_binding.column
                })
            else {
                return false;
            };

            let Some(holder_value) =
                self.resolve_binding(holder_query, holder_binding, holder_params)
            else {
                return false;
            };
            let Some(candidate_value) =
                self.resolve_binding(candidate_query, candidate_binding, candidate_params)
            else {
                return false;
            };
            if holder_value != candidate_value {
                any_divergent = true;
            }
        }
        any_divergent
    }

    /// Resolves the procedure-parameter value feeding one statement
    /// parameter, honoring array-typed parameters.
    fn resolve_binding<'p>(
        &self,
        query: &EstimatedQuery,
        binding: &PkeyBinding,
        params: &'p ParamSet,
    ) -> Option<&'p ParamValue> {
        let mapping: &ParameterMapping =
            self.catalog
                .mappings()
                .resolve(query.stmt, query.stmt_counter, binding.stmt_param)?;
        let value = params.get(mapping.proc_param)?;
        match mapping.array_offset {
            Some(offset) => value.array_element(offset),
            None => Some(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MarkovConflictChecker;
    use googletest::prelude::*;
    use hornet_catalog::{CatalogBuilder, ConflictKind, ParameterMapping, PkeyBinding};
    use hornet_common::partition_set::PartitionSet;
    use hornet_txn::estimate::{
        EstimatedQuery, EstimatorState, QueryEstimate, TransactionEstimate,
    };
    use hornet_txn::handle::TransactionCore;
    use hornet_txn::params::{ParamSet, ParamValue};
    use rstest::rstest;
    use std::sync::Arc;

    struct Fixture {
        checker: MarkovConflictChecker,
        pay_proc: u16,
        get_proc: u16,
        pay_stmt: u16,
        get_stmt: u16,
    }

    /// Two procedures touching DISTRICT, both binding its primary key from
    /// their first procedure parameter.
    fn fixture() -> Fixture {
        let mut builder = CatalogBuilder::new();
        let district = builder.table("DISTRICT", vec![0]);
        let pay_proc = builder.procedure("PayDistrict", false);
        let get_proc = builder.procedure("GetDistrict", true);
        let pay_stmt = builder.statement(
            pay_proc,
            "updateDistrict",
            vec![district],
            true,
            vec![PkeyBinding {
                table: district,
                column: 0,
                stmt_param: 0,
            }],
        );
        let get_stmt = builder.statement(
            get_proc,
            "getDistrict",
            vec![district],
            false,
            vec![PkeyBinding {
                table: district,
                column: 0,
                stmt_param: 0,
            }],
        );
        builder.conflict(pay_stmt, get_stmt, vec![district], ConflictKind::ReadWrite);
        builder.mapping(ParameterMapping {
            stmt: pay_stmt,
            stmt_counter: None,
            stmt_param: 0,
            proc_param: 0,
            array_offset: None,
        });
        builder.mapping(ParameterMapping {
            stmt: get_stmt,
            stmt_counter: None,
            stmt_param: 0,
            proc_param: 0,
            array_offset: None,
        });
        let catalog = Arc::new(builder.build());
        Fixture {
            checker: MarkovConflictChecker::new(catalog),
            pay_proc,
            get_proc,
            pay_stmt,
            get_stmt,
        }
    }

    fn estimated(stmt: u16, partitions: &[u32]) -> EstimatedQuery {
        EstimatedQuery {
            stmt,
            stmt_counter: 0,
            partitions: PartitionSet::from(partitions),
        }
    }

    fn txn_with_estimate(
        txn_id: u64,
        proc: u16,
        params: ParamSet,
        queries: Vec<EstimatedQuery>,
        read_only_partitions: &[u32],
    ) -> TransactionCore {
        let estimate = TransactionEstimate {
            queries: QueryEstimate { queries },
            read_only_partitions: PartitionSet::from(read_only_partitions),
        };
        let mut core = TransactionCore::new(
            txn_id,
            0,
            0,
            PartitionSet::from(&[0_u32, 1][..]),
            false,
            proc,
            params,
        );
        core.estimator = Some(EstimatorState {
            proc,
            params_fingerprint: core.params.fingerprint(),
            initial: Some(estimate.clone()),
            last: Some(estimate),
        });
        core
    }

    #[rstest]
    fn equal_key_bindings_are_rejected() {
        let fixture = fixture();
        let holder = txn_with_estimate(
            10,
            fixture.pay_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.pay_stmt, &[0])],
            &[],
        );
        let candidate = txn_with_estimate(
            20,
            fixture.get_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.get_stmt, &[0])],
            &[],
        );
        assert_that!(
            fixture.checker.can_execute(&holder, &candidate, 0),
            eq(false)
        );
    }

    #[rstest]
    fn distinct_key_bindings_are_admitted() {
        let fixture = fixture();
        let holder = txn_with_estimate(
            10,
            fixture.pay_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.pay_stmt, &[0])],
            &[],
        );
        let candidate = txn_with_estimate(
            20,
            fixture.get_proc,
            ParamSet::new(vec![ParamValue::Int(6)]),
            vec![estimated(fixture.get_stmt, &[0])],
            &[],
        );
        assert_that!(fixture.checker.can_execute(&holder, &candidate, 0), eq(true));
    }

    #[rstest]
    fn both_read_only_at_partition_is_admitted() {
        let fixture = fixture();
        let holder = txn_with_estimate(
            10,
            fixture.pay_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.pay_stmt, &[0])],
            &[0],
        );
        let candidate = txn_with_estimate(
            20,
            fixture.get_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.get_stmt, &[0])],
            &[0],
        );
        assert_that!(fixture.checker.can_execute(&holder, &candidate, 0), eq(true));
    }

    #[rstest]
    fn missing_estimator_state_rejects() {
        let fixture = fixture();
        let holder = txn_with_estimate(
            10,
            fixture.pay_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.pay_stmt, &[0])],
            &[],
        );
        let mut candidate = txn_with_estimate(
            20,
            fixture.get_proc,
            ParamSet::new(vec![ParamValue::Int(6)]),
            vec![estimated(fixture.get_stmt, &[0])],
            &[],
        );
        candidate.estimator = None;
        assert_that!(
            fixture.checker.can_execute(&holder, &candidate, 0),
            eq(false)
        );
    }

    #[rstest]
    fn queries_on_other_partitions_do_not_collide() {
        let fixture = fixture();
        let holder = txn_with_estimate(
            10,
            fixture.pay_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.pay_stmt, &[1])],
            &[],
        );
        let candidate = txn_with_estimate(
            20,
            fixture.get_proc,
            ParamSet::new(vec![ParamValue::Int(5)]),
            vec![estimated(fixture.get_stmt, &[0])],
            &[],
        );
        assert_that!(fixture.checker.can_execute(&holder, &candidate, 0), eq(true));
    }

    #[rstest]
    fn array_typed_parameters_resolve_through_their_offset() {
        let mut builder = CatalogBuilder::new();
        let account = builder.table("ACCOUNT", vec![0]);
        let batch_proc = builder.procedure("BatchDebit", false);
        let read_proc = builder.procedure("ReadAccount", true);
        let debit = builder.statement(
            batch_proc,
            "debitAccount",
            vec![account],
            true,
            vec![PkeyBinding {
                table: account,
                column: 0,
                stmt_param: 0,
            }],
        );
        let read = builder.statement(
            read_proc,
            "readAccount",
            vec![account],
            false,
            vec![PkeyBinding {
                table: account,
                column: 0,
                stmt_param: 0,
            }],
        );
        builder.conflict(debit, read, vec![account], ConflictKind::ReadWrite);
        builder.mapping(ParameterMapping {
            stmt: debit,
            stmt_counter: Some(1),
            stmt_param: 0,
            proc_param: 0,
            array_offset: Some(1),
        });
        builder.mapping(ParameterMapping {
            stmt: read,
            stmt_counter: None,
            stmt_param: 0,
            proc_param: 0,
            array_offset: None,
        });
        let checker = MarkovConflictChecker::new(Arc::new(builder.build()));

        let mut holder_query = estimated(debit, &[0]);
        holder_query.stmt_counter = 1;
        let holder = txn_with_estimate(
            10,
            batch_proc,
            ParamSet::new(vec![ParamValue::Array(vec![
                ParamValue::Int(3),
                ParamValue::Int(4),
            ])]),
            vec![holder_query],
            &[],
        );
        let same_key = txn_with_estimate(
            20,
            read_proc,
            ParamSet::new(vec![ParamValue::Int(4)]),
            vec![estimated(read, &[0])],
            &[],
        );
        let other_key = txn_with_estimate(
            21,
            read_proc,
            ParamSet::new(vec![ParamValue::Int(9)]),
            vec![estimated(read, &[0])],
            &[],
        );

        assert_that!(checker.can_execute(&holder, &same_key, 0), eq(false));
        assert_that!(checker.can_execute(&holder, &other_key, 0), eq(true));
    }
}
