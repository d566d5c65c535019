//! Storage-engine seam.
//!
//! The executor drives the engine through this trait; everything below it
//! (row format, indexes, eviction tiers) belongs to the engine. The
//! in-memory implementation backs tests and development.

use hashbrown::HashMap;

use hornet_catalog::StatementDef;
use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{PartitionId, TableId, TxnId};
use hornet_txn::params::{ParamSet, ParamValue};

/// Aggregate counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Rows stored on this partition.
    pub row_count: u64,
    /// Rows written since startup.
    pub rows_written: u64,
    /// Rows evicted through the block-eviction passthrough.
    pub rows_evicted: u64,
}

/// One partition's storage engine.
///
/// Undo is bracketed per transaction: `begin` opens an undo scope, every
/// statement executed for that transaction records into it, and `commit` /
/// `undo` closes it. Engine errors are fatal to the transaction that issued
/// the statement, never to the executor.
pub trait ExecutionEngine: Send {
    /// Opens an undo scope for a transaction.
    fn begin(&mut self, txn_id: TxnId);

    /// Runs one statement and returns its result row.
    ///
    /// # Errors
    ///
    /// Returns an error when the statement cannot be applied; the executor
    /// turns this into an abort of the owning transaction.
    fn execute_statement(
        &mut self,
        txn_id: TxnId,
        stmt: &StatementDef,
        params: &ParamSet,
    ) -> HornetResult<Vec<i64>>;

    /// Makes a transaction's writes permanent and closes its undo scope.
    fn commit(&mut self, txn_id: TxnId);

    /// Reverts a transaction's writes and closes its undo scope.
    fn undo(&mut self, txn_id: TxnId);

    /// Bulk-loads rows into a table.
    ///
    /// # Errors
    ///
    /// Returns an error when the table cannot accept the rows.
    fn load_table(&mut self, table: TableId, rows: Vec<(i64, i64)>) -> HornetResult<()>;

    /// Aggregate engine counters.
    fn get_stats(&self) -> EngineStats;

    /// Evicts up to `row_budget` rows from a table, returning how many were
    /// evicted.
    ///
    /// # Errors
    ///
    /// Returns an error when eviction is unsupported for the table.
    fn evict_block(&mut self, table: TableId, row_budget: u64) -> HornetResult<u64>;
}

#[derive(Debug, Clone, Copy)]
struct UndoRecord {
    table: TableId,
    key: i64,
    previous: Option<i64>,
}

/// Deterministic in-memory engine.
///
/// Rows are `(key, value)` pairs per table. A writing statement stores
/// `params[1]` (default `0`) under key `params[0]`; a reading statement
/// returns the stored value. Undo restores the pre-image in reverse order.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    partition: PartitionId,
    tables: HashMap<(TableId, i64), i64>,
    undo_log: HashMap<TxnId, Vec<UndoRecord>>,
    rows_written: u64,
    rows_evicted: u64,
}

impl MemoryEngine {
    /// Creates an empty engine for one partition.
    #[must_use]
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            ..Self::default()
        }
    }

    /// Partition this engine belongs to.
    #[must_use]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Reads one row, for test assertions.
    #[must_use]
    pub fn read(&self, table: TableId, key: i64) -> Option<i64> {
        self.tables.get(&(table, key)).copied()
    }

    fn int_param(params: &ParamSet, index: usize) -> i64 {
        match params.get(index) {
            Some(ParamValue::Int(value)) => *value,
            _ => 0,
        }
    }
}

impl ExecutionEngine for MemoryEngine {
    fn begin(&mut self, txn_id: TxnId) {
        let _ = self.undo_log.entry(txn_id).or_default();
    }

    fn execute_statement(
        &mut self,
        txn_id: TxnId,
        stmt: &StatementDef,
        params: &ParamSet,
    ) -> HornetResult<Vec<i64>> {
        let Some(table) = stmt.tables.first().copied() else {
            return Err(HornetError::Unexpected(format!(
                "statement {} references no table",
                stmt.name
            )));
        };
        let key = Self::int_param(params, 0);
        if stmt.writes {
            let value = Self::int_param(params, 1);
            let previous = self.tables.insert((table, key), value);
            self.rows_written += 1;
            if let Some(log) = self.undo_log.get_mut(&txn_id) {
                log.push(UndoRecord {
                    table,
                    key,
                    previous,
                });
            }
            Ok(vec![key, value])
        } else {
            Ok(vec![key, self.tables.get(&(table, key)).copied().unwrap_or(0)])
        }
    }

    fn commit(&mut self, txn_id: TxnId) {
        let _ = self.undo_log.remove(&txn_id);
    }

    fn undo(&mut self, txn_id: TxnId) {
        let Some(log) = self.undo_log.remove(&txn_id) else {
            return;
        };
        for record in log.into_iter().rev() {
            match record.previous {
                Some(previous) => {
                    let _ = self.tables.insert((record.table, record.key), previous);
                }
                None => {
                    let _ = self.tables.remove(&(record.table, record.key));
                }
            }
        }
    }

    fn load_table(&mut self, table: TableId, rows: Vec<(i64, i64)>) -> HornetResult<()> {
        for (key, value) in rows {
            let _ = self.tables.insert((table, key), value);
            self.rows_written += 1;
        }
        Ok(())
    }

    fn get_stats(&self) -> EngineStats {
        EngineStats {
            row_count: self.tables.len() as u64,
            rows_written: self.rows_written,
            rows_evicted: self.rows_evicted,
        }
    }

    fn evict_block(&mut self, table: TableId, row_budget: u64) -> HornetResult<u64> {
        let victims = self
            .tables
            .keys()
            .filter(|(candidate, _)| *candidate == table)
            .take(usize::try_from(row_budget).unwrap_or(usize::MAX))
            .copied()
            .collect::<Vec<_>>();
        let evicted = victims.len() as u64;
        for victim in victims {
            let _ = self.tables.remove(&victim);
        }
        self.rows_evicted += evicted;
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionEngine, MemoryEngine};
    use googletest::prelude::*;
    use hornet_catalog::StatementDef;
    use hornet_txn::params::{ParamSet, ParamValue};
    use rstest::rstest;

    fn write_stmt(table: u16) -> StatementDef {
        StatementDef {
            id: 0,
            name: "write".to_owned(),
            proc: 0,
            tables: vec![table],
            writes: true,
            pkey_bindings: Vec::new(),
        }
    }

    fn params(key: i64, value: i64) -> ParamSet {
        ParamSet::new(vec![ParamValue::Int(key), ParamValue::Int(value)])
    }

    #[rstest]
    fn undo_restores_the_pre_image_in_reverse_order() {
        let mut engine = MemoryEngine::new(0);
        engine
            .load_table(1, vec![(5, 100)])
            .expect("load must succeed");

        engine.begin(7);
        let _ = engine
            .execute_statement(7, &write_stmt(1), &params(5, 200))
            .expect("write must succeed");
        let _ = engine
            .execute_statement(7, &write_stmt(1), &params(5, 300))
            .expect("write must succeed");
        let _ = engine
            .execute_statement(7, &write_stmt(1), &params(6, 1))
            .expect("write must succeed");
        engine.undo(7);

        assert_that!(engine.read(1, 5), eq(Some(100)));
        assert_that!(engine.read(1, 6), eq(None));
    }

    #[rstest]
    fn commit_discards_the_undo_scope() {
        let mut engine = MemoryEngine::new(0);
        engine.begin(7);
        let _ = engine
            .execute_statement(7, &write_stmt(1), &params(5, 200))
            .expect("write must succeed");
        engine.commit(7);
        engine.undo(7);

        assert_that!(engine.read(1, 5), eq(Some(200)));
    }

    #[rstest]
    fn evict_block_honors_the_row_budget() {
        let mut engine = MemoryEngine::new(0);
        engine
            .load_table(1, vec![(1, 1), (2, 2), (3, 3)])
            .expect("load must succeed");

        let evicted = engine.evict_block(1, 2).expect("evict must succeed");
        assert_that!(evicted, eq(2));
        assert_that!(engine.get_stats().row_count, eq(1));
        assert_that!(engine.get_stats().rows_evicted, eq(2));
    }
}
