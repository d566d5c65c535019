//! Speculative-execution decisions: conflict checking and candidate
//! scheduling.

pub mod markov;
pub mod scheduler;
pub mod table;

use std::sync::Arc;

use hornet_common::config::SiteConfig;
use hornet_common::ids::{PartitionId, ProcId};
use hornet_catalog::Catalog;
use hornet_txn::handle::TransactionCore;

use crate::markov::MarkovConflictChecker;
use crate::table::TableConflictChecker;

/// Conflict predicate between a distributed holder and a speculative
/// candidate.
///
/// The variant is chosen from configuration at startup and never changes;
/// both variants are pure and safe to call from every executor thread
/// without synchronization.
#[derive(Debug)]
pub enum ConflictChecker {
    /// Coarse checker over catalog-declared table conflicts.
    Table(TableConflictChecker),
    /// Fine-grained checker over query estimates and bound key values.
    Markov(MarkovConflictChecker),
}

impl ConflictChecker {
    /// Builds the checker selected by `markov_enable`.
    #[must_use]
    pub fn from_config(config: &SiteConfig, catalog: &Arc<Catalog>) -> Self {
        if config.markov_enable {
            Self::Markov(MarkovConflictChecker::new(Arc::clone(catalog)))
        } else {
            Self::Table(TableConflictChecker::new(Arc::clone(catalog)))
        }
    }

    /// Returns whether conflict analysis can skip this procedure entirely.
    #[must_use]
    pub fn ignore_procedure(&self, proc: ProcId) -> bool {
        match self {
            Self::Table(checker) => checker.ignore_procedure(proc),
            Self::Markov(checker) => checker.ignore_procedure(proc),
        }
    }

    /// Decides whether `candidate` may run ahead of the stalled `holder` on
    /// `partition`.
    #[must_use]
    pub fn can_execute(
        &self,
        holder: &TransactionCore,
        candidate: &TransactionCore,
        partition: PartitionId,
    ) -> bool {
        match self {
            Self::Table(checker) => checker.can_execute(holder, candidate, partition),
            Self::Markov(checker) => checker.can_execute(holder, candidate, partition),
        }
    }
}
