//! Query forecasts produced by an external estimator.
//!
//! The core consumes these read-only: the conflict checker compares the
//! predicted queries of two transactions, nothing here feeds back into the
//! estimator.

use hornet_common::ids::{PartitionId, ProcId, StmtId};
use hornet_common::partition_set::PartitionSet;

/// One predicted query: which statement, its invocation counter inside the
/// procedure, and the partitions it is expected to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatedQuery {
    /// Predicted statement.
    pub stmt: StmtId,
    /// Invocation counter of the statement inside the procedure.
    pub stmt_counter: u32,
    /// Partitions the query is predicted to touch.
    pub partitions: PartitionSet,
}

/// Ordered list of predicted queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryEstimate {
    /// Queries in predicted execution order.
    pub queries: Vec<EstimatedQuery>,
}

impl QueryEstimate {
    /// Returns the queries predicted to touch `partition`, preserving order.
    pub fn filtered(&self, partition: PartitionId) -> impl Iterator<Item = &EstimatedQuery> {
        self.queries
            .iter()
            .filter(move |query| query.partitions.contains(partition))
    }

    /// Returns whether any query is predicted for `partition`.
    #[must_use]
    pub fn touches(&self, partition: PartitionId) -> bool {
        self.filtered(partition).next().is_some()
    }
}

/// One point-in-time estimate for a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionEstimate {
    /// Predicted query list.
    pub queries: QueryEstimate,
    /// Partitions on which the transaction is predicted to stay read-only.
    pub read_only_partitions: PartitionSet,
}

impl TransactionEstimate {
    /// Returns whether the transaction is predicted read-only at `partition`.
    #[must_use]
    pub fn is_read_only_at(&self, partition: PartitionId) -> bool {
        self.read_only_partitions.contains(partition)
    }

    /// Returns whether the estimate carries a usable query list.
    #[must_use]
    pub fn has_queries(&self) -> bool {
        !self.queries.queries.is_empty()
    }
}

/// Estimator output attached to a transaction handle.
///
/// `initial` is the forecast taken at submission; `last` is refreshed as the
/// transaction progresses. Single-partition candidates are judged by their
/// initial estimate, a distributed holder by its last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstimatorState {
    /// Procedure the forecast was made for.
    pub proc: ProcId,
    /// Fingerprint of the parameters the forecast was made for; the
    /// path-cache key when estimate reuse is enabled.
    pub params_fingerprint: u64,
    /// Forecast taken at submission time.
    pub initial: Option<TransactionEstimate>,
    /// Most recent forecast.
    pub last: Option<TransactionEstimate>,
}

impl EstimatorState {
    /// Clears forecasts for pool reuse.
    pub fn reset(&mut self) {
        self.proc = 0;
        self.params_fingerprint = 0;
        self.initial = None;
        self.last = None;
    }

    /// Returns the most recent estimate, falling back to the initial one.
    #[must_use]
    pub fn last_or_initial(&self) -> Option<&TransactionEstimate> {
        self.last.as_ref().or(self.initial.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::{EstimatedQuery, QueryEstimate, TransactionEstimate};
    use googletest::prelude::*;
    use hornet_common::partition_set::PartitionSet;
    use rstest::rstest;

    fn query(stmt: u16, partitions: &[u32]) -> EstimatedQuery {
        EstimatedQuery {
            stmt,
            stmt_counter: 0,
            partitions: PartitionSet::from(partitions),
        }
    }

    #[rstest]
    fn filtered_preserves_order_and_drops_other_partitions() {
        let estimate = QueryEstimate {
            queries: vec![query(1, &[0]), query(2, &[1]), query(3, &[0, 1])],
        };
        let at_zero = estimate.filtered(0).map(|q| q.stmt).collect::<Vec<_>>();
        assert_that!(at_zero, eq(&vec![1, 3]));
        assert_that!(estimate.touches(2), eq(false));
    }

    #[rstest]
    fn read_only_flag_is_per_partition() {
        let estimate = TransactionEstimate {
            queries: QueryEstimate::default(),
            read_only_partitions: PartitionSet::from(&[1_u32][..]),
        };
        assert_that!(estimate.is_read_only_at(1), eq(true));
        assert_that!(estimate.is_read_only_at(0), eq(false));
    }
}
