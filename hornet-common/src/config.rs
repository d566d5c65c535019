//! Runtime configuration shared by site bootstrap code.

use std::path::PathBuf;
use std::time::Duration;

use crate::ids::{PartitionCount, SiteId};

/// Bootstrap configuration for one site. Read once at startup; never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    /// Identifier of this site inside the cluster.
    pub site_id: SiteId,
    /// Number of partitions owned by this site.
    pub partition_count: PartitionCount,
    /// Admit speculative candidates while a distributed holder is stalled.
    pub specexec_enable: bool,
    /// Only admit speculative candidates when the partition queue carries no
    /// other ready work.
    pub specexec_idle: bool,
    /// Treat a distributed transaction as speculation-eligible even when all
    /// of its partitions are local to this site.
    pub specexec_ignore_all_local: bool,
    /// Use the query-estimate conflict checker instead of the table checker.
    pub markov_enable: bool,
    /// Reuse prior path estimates for the same procedure and parameter
    /// fingerprint.
    pub markov_path_caching: bool,
    /// Dispatch prefetch fragments when the init grant completes.
    pub exec_prefetch_queries: bool,
    /// High-water mark of idle pooled estimator states per partition.
    pub pool_estimator_states_idle: usize,
    /// Cadence of the observational status snapshot; `None` disables it.
    pub status_interval: Option<Duration>,
    /// Treat two consecutive snapshots without progress as a hung site.
    pub status_kill_if_hung: bool,
    /// Enable storage-engine block eviction pass-throughs.
    pub anticache_enable: bool,
    /// Eviction spill directory handed to the storage engine.
    pub anticache_dir: Option<PathBuf>,
    /// Delay before a queue-rejected transaction re-enters the init queues.
    pub init_queue_restart_delay: Duration,
    /// Wall-clock window for collecting all init acknowledgments.
    pub init_timeout: Duration,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_id: 0,
            partition_count: PartitionCount::new(2).expect("literal partition count must be non-zero"),
            specexec_enable: true,
            specexec_idle: false,
            specexec_ignore_all_local: false,
            markov_enable: false,
            markov_path_caching: true,
            exec_prefetch_queries: true,
            pool_estimator_states_idle: 1000,
            status_interval: None,
            status_kill_if_hung: false,
            anticache_enable: false,
            anticache_dir: None,
            init_queue_restart_delay: Duration::from_millis(10),
            init_timeout: Duration::from_secs(5),
        }
    }
}

impl SiteConfig {
    /// Lists the partition ids owned by this site.
    #[must_use]
    pub fn local_partitions(&self) -> Vec<crate::ids::PartitionId> {
        self.partition_count.iter().collect()
    }
}
