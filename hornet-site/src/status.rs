//! Observational site status: queue depths, pool occupancy, profiling
//! rollups, and optional hang detection. Nothing here has a control effect
//! on transaction processing.

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use hornet_common::ids::{PartitionId, TxnId};
use hornet_common::profiler::ProfileMeasurement;
use hornet_txn::pool::PoolCounters;

use crate::executor::ExecutionMode;
use crate::site::Site;

/// Rollup of one profile measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileRollup {
    /// Measurement label.
    pub label: &'static str,
    /// Accumulated milliseconds.
    pub total_millis: f64,
    /// Completed samples.
    pub invocations: u64,
}

impl ProfileRollup {
    fn capture(pm: &ProfileMeasurement) -> Self {
        Self {
            label: pm.label(),
            total_millis: pm.total_millis(),
            invocations: pm.invocations(),
        }
    }
}

/// Point-in-time view of one partition.
#[derive(Debug, Clone)]
pub struct PartitionStatus {
    /// Partition id.
    pub partition: PartitionId,
    /// Executor mode at capture time.
    pub mode: ExecutionMode,
    /// Transaction the executor was carrying, if any.
    pub current_txn: Option<TxnId>,
    /// Queued work items.
    pub work_depth: usize,
    /// Depth of the partition's init queue.
    pub init_queue_depth: usize,
    /// Transaction holding the partition lock at the queue manager.
    pub lock_holder: Option<TxnId>,
    /// Largest committed transaction id.
    pub last_committed: TxnId,
    /// Transactions committed since startup.
    pub committed_count: u64,
    /// Transaction-handle pool occupancy.
    pub pool: PoolCounters,
    /// Execution / idle / network / utility time rollups.
    pub profile: Vec<ProfileRollup>,
}

/// Point-in-time view of a whole site.
#[derive(Debug, Clone)]
pub struct SiteStatusSnapshot {
    /// Site id.
    pub site_id: u32,
    /// Time since the site booted.
    pub uptime: Duration,
    /// Per-partition details, ascending by partition id.
    pub partitions: Vec<PartitionStatus>,
    /// Estimator-state pool occupancy.
    pub estimator_pool: PoolCounters,
    /// Most frequent init blockers, descending.
    pub blocked_histogram: Vec<(TxnId, u64)>,
    /// Transactions committed across all partitions.
    pub total_committed: u64,
    /// Queued plus held work across all partitions.
    pub inflight: usize,
}

impl SiteStatusSnapshot {
    /// Captures the current state of a site.
    #[must_use]
    pub fn capture(site: &Site) -> Self {
        let manager = site.queue_manager();
        let mut partitions = Vec::new();
        for executor in site.executors() {
            let partition = executor.partition();
            let (current_txn, mode, work_depth) = executor.current_state();
            let profiler = executor.profiler();
            partitions.push(PartitionStatus {
                partition,
                mode,
                current_txn,
                work_depth,
                init_queue_depth: manager.queue_depth(partition),
                lock_holder: manager.holder(partition),
                last_committed: executor.last_committed(),
                committed_count: executor.committed_count(),
                pool: executor.pool_counters(),
                profile: vec![
                    ProfileRollup::capture(&profiler.exec_time),
                    ProfileRollup::capture(&profiler.idle_time),
                    ProfileRollup::capture(&profiler.network_time),
                    ProfileRollup::capture(&profiler.utility_time),
                ],
            });
        }
        partitions.sort_by_key(|status| status.partition);

        let total_committed = partitions.iter().map(|p| p.committed_count).sum();
        let inflight = partitions
            .iter()
            .map(|p| p.work_depth + usize::from(p.lock_holder.is_some()))
            .sum();
        Self {
            site_id: site.config().site_id,
            uptime: site.started_at().elapsed(),
            partitions,
            estimator_pool: site.estimator_pool_counters(),
            blocked_histogram: manager.blocked_histogram(),
            total_committed,
            inflight,
        }
    }
}

impl fmt::Display for SiteStatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "site {} up {:.1}s, committed {}, inflight {}",
            self.site_id,
            self.uptime.as_secs_f64(),
            self.total_committed,
            self.inflight
        )?;
        for status in &self.partitions {
            writeln!(
                f,
                "  partition {:>3} {:?} txn={} work={} initq={} lock={} committed={}",
                status.partition,
                status.mode,
                status
                    .current_txn
                    .map_or_else(|| "-".to_owned(), |txn| txn.to_string()),
                status.work_depth,
                status.init_queue_depth,
                status
                    .lock_holder
                    .map_or_else(|| "-".to_owned(), |txn| txn.to_string()),
                status.committed_count,
            )?;
            for rollup in &status.profile {
                writeln!(
                    f,
                    "    {:>8}: {:>10.3} ms / {} invocations",
                    rollup.label, rollup.total_millis, rollup.invocations
                )?;
            }
        }
        writeln!(
            f,
            "  pools: txn-handles {:?}, estimator-states {:?}",
            self.partitions
                .iter()
                .map(|p| p.pool.active)
                .sum::<usize>(),
            self.estimator_pool
        )?;
        if !self.blocked_histogram.is_empty() {
            writeln!(f, "  top blockers:")?;
            for (txn_id, count) in self.blocked_histogram.iter().take(5) {
                writeln!(f, "    txn {txn_id}: blocked {count}")?;
            }
        }
        Ok(())
    }
}

/// Called when the monitor decides the site is hung.
pub type HangHook = Box<dyn Fn(&SiteStatusSnapshot) + Send>;

/// Background thread logging periodic snapshots and optionally flagging a
/// hung site: two consecutive snapshots with inflight work and no new
/// commits.
pub struct StatusMonitor {
    stop: mpsc::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl StatusMonitor {
    /// Spawns the monitor; returns `None` when `status_interval` is unset.
    #[must_use]
    pub fn spawn(site: Arc<Site>, hang_hook: Option<HangHook>) -> Option<Self> {
        let interval = site.config().status_interval?;
        let kill_if_hung = site.config().status_kill_if_hung;
        let (stop, stop_rx) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name("hornet-site-status".to_owned())
            .spawn(move || {
                monitor_main(&site, &stop_rx, interval, kill_if_hung, hang_hook);
            })
            .ok()?;
        Some(Self {
            stop,
            worker: Some(worker),
        })
    }

    /// Stops the monitor thread.
    pub fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{SiteStatusSnapshot, StatusMonitor};
    use crate::site::Site;
    use googletest::prelude::*;
    use hornet_catalog::CatalogBuilder;
    use hornet_common::config::SiteConfig;
    use hornet_common::ids::PartitionCount;
    use hornet_common::partition_set::PartitionSet;
    use hornet_txn::params::{ParamSet, ParamValue};
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    fn small_site() -> Site {
        let mut builder = CatalogBuilder::new();
        let votes = builder.table("VOTES", vec![0]);
        let vote = builder.procedure("Vote", false);
        let _ = builder.statement(vote, "insertVote", vec![votes], true, Vec::new());
        let config = SiteConfig {
            partition_count: PartitionCount::new(2).expect("test partition count"),
            ..SiteConfig::default()
        };
        Site::new(config, Arc::new(builder.build()))
    }

    #[rstest]
    fn snapshot_covers_every_partition_and_renders() {
        let site = small_site();
        let proc = site
            .catalog()
            .procedure_by_name("Vote")
            .map(|p| p.id)
            .expect("fixture procedure");
        let _ = site
            .invoke(
                proc,
                ParamSet::new(vec![ParamValue::Int(1), ParamValue::Int(2)]),
                0,
                PartitionSet::single(0),
                None,
            )
            .expect("invocation must route");
        let _ = site
            .recv_client_response(Duration::from_secs(2))
            .expect("fast path must answer");

        let snapshot = SiteStatusSnapshot::capture(&site);
        assert_that!(snapshot.partitions.len(), eq(2_usize));
        assert_that!(snapshot.total_committed, eq(1));
        let rendered = snapshot.to_string();
        assert_that!(rendered.contains("partition"), eq(true));
        assert_that!(rendered.contains("exec"), eq(true));
    }

    #[rstest]
    fn monitor_does_not_spawn_without_an_interval() {
        let site = Arc::new(small_site());
        assert_that!(StatusMonitor::spawn(site, None).is_none(), eq(true));
    }

    #[rstest]
    fn monitor_spawns_and_shuts_down_with_an_interval() {
        let mut builder = CatalogBuilder::new();
        let votes = builder.table("VOTES", vec![0]);
        let vote = builder.procedure("Vote", false);
        let _ = builder.statement(vote, "insertVote", vec![votes], true, Vec::new());
        let config = SiteConfig {
            partition_count: PartitionCount::new(1).expect("test partition count"),
            status_interval: Some(Duration::from_millis(5)),
            ..SiteConfig::default()
        };
        let site = Arc::new(Site::new(config, Arc::new(builder.build())));
        let mut monitor =
            StatusMonitor::spawn(Arc::clone(&site), None).expect("monitor must spawn");
        std::thread::sleep(Duration::from_millis(20));
        monitor.shutdown();
    }
}

fn monitor_main(
    site: &Site,
    stop_rx: &mpsc::Receiver<()>,
    interval: Duration,
    kill_if_hung: bool,
    hang_hook: Option<HangHook>,
) {
    let mut previous: Option<SiteStatusSnapshot> = None;
    loop {
        match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        let snapshot = SiteStatusSnapshot::capture(site);
        info!(site = snapshot.site_id, "status\n{snapshot}");

        if kill_if_hung
            && let Some(previous) = &previous
            && previous.inflight > 0
            && snapshot.inflight > 0
            && snapshot.total_committed == previous.total_committed
        {
            error!(
                site = snapshot.site_id,
                inflight = snapshot.inflight,
                "site made no progress across two status intervals"
            );
            if let Some(hook) = &hang_hook {
                hook(&snapshot);
            }
        }
        previous = Some(snapshot);
    }
}
