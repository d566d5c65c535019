//! Declared conflict pairs and their compiled bitset form.

use hornet_common::ids::{ProcId, StmtId, TableId};

use crate::schema::Catalog;

/// How two co-executing statements may interfere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// One statement reads rows the other writes.
    ReadWrite,
    /// Both statements write overlapping rows.
    WriteWrite,
    /// The pair conflicts regardless of parameter values.
    Always,
}

/// Catalog-declared assertion that an ordered statement pair may conflict on
/// one or more tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPair {
    /// Procedure owning `stmt0`.
    pub proc0: ProcId,
    /// Procedure owning `stmt1`.
    pub proc1: ProcId,
    /// First statement of the ordered pair.
    pub stmt0: StmtId,
    /// Second statement of the ordered pair.
    pub stmt1: StmtId,
    /// Tables the conflict is asserted over.
    pub tables: Vec<TableId>,
    /// Conflict class.
    pub kind: ConflictKind,
}

/// Fixed-width bitset over procedure ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSet {
    words: Vec<u64>,
}

impl ProcSet {
    fn with_capacity(procedures: usize) -> Self {
        Self {
            words: vec![0; procedures.div_ceil(64)],
        }
    }

    fn set(&mut self, proc: ProcId) {
        let index = usize::from(proc);
        if let Some(word) = self.words.get_mut(index / 64) {
            *word |= 1 << (index % 64);
        }
    }

    /// Returns whether the bit for `proc` is set.
    #[must_use]
    pub fn get(&self, proc: ProcId) -> bool {
        let index = usize::from(proc);
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }

    /// Returns whether no bit is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }
}

/// Compiled conflict relation: per ordered procedure pair, whether a
/// read-write or write-write conflict is declared.
///
/// Construction is a pure function of the catalog; identical catalogs
/// produce identical matrices. The matrix is immutable after construction
/// and freely shared between executor threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMatrix {
    has_conflicts: ProcSet,
    rw_conflicts: Vec<ProcSet>,
    ww_conflicts: Vec<ProcSet>,
}

impl ConflictMatrix {
    /// Compiles the declared conflict pairs of a catalog.
    ///
    /// System procedures are skipped entirely. A procedure that is not
    /// read-only always conflicts with itself, in both classes.
    #[must_use]
    pub fn build(catalog: &Catalog) -> Self {
        let size = catalog.procedure_count();
        let mut has_conflicts = ProcSet::with_capacity(size);
        let mut rw_conflicts = vec![ProcSet::with_capacity(size); size];
        let mut ww_conflicts = vec![ProcSet::with_capacity(size); size];

        for proc in catalog.procedures() {
            if proc.system {
                continue;
            }
            let index = usize::from(proc.id);
            for pair in catalog.conflict_pairs() {
                if pair.proc0 != proc.id {
                    continue;
                }
                match pair.kind {
                    ConflictKind::ReadWrite => rw_conflicts[index].set(pair.proc1),
                    ConflictKind::WriteWrite => ww_conflicts[index].set(pair.proc1),
                    ConflictKind::Always => {
                        rw_conflicts[index].set(pair.proc1);
                        ww_conflicts[index].set(pair.proc1);
                    }
                }
                has_conflicts.set(proc.id);
            }
            if !proc.read_only {
                rw_conflicts[index].set(proc.id);
                ww_conflicts[index].set(proc.id);
                has_conflicts.set(proc.id);
            }
        }

        Self {
            has_conflicts,
            rw_conflicts,
            ww_conflicts,
        }
    }

    /// Returns whether any conflict is declared for this procedure.
    #[must_use]
    pub fn has_any_conflicts(&self, proc: ProcId) -> bool {
        self.has_conflicts.get(proc)
    }

    /// Returns whether a read-write conflict is declared from `proc0` to
    /// `proc1`.
    #[must_use]
    pub fn has_rw_conflict(&self, proc0: ProcId, proc1: ProcId) -> bool {
        self.rw_conflicts
            .get(usize::from(proc0))
            .is_some_and(|set| set.get(proc1))
    }

    /// Returns whether a write-write conflict is declared from `proc0` to
    /// `proc1`.
    #[must_use]
    pub fn has_ww_conflict(&self, proc0: ProcId, proc1: ProcId) -> bool {
        self.ww_conflicts
            .get(usize::from(proc0))
            .is_some_and(|set| set.get(proc1))
    }
}
