//! Init-protocol abort propagation across a multi-partition site.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use googletest::prelude::*;
use rstest::rstest;

use hornet_common::partition_set::PartitionSet;
use hornet_txn::messages::{InitStatus, TransactionInitRequest, TransactionInitResponse};
use hornet_txn::params::ParamSet;

use super::testkit::{test_catalog, test_config, wait_until};
use crate::site::Site;

fn request(txn_id: u64, proc: u16, partitions: &[u32]) -> TransactionInitRequest {
    TransactionInitRequest {
        txn_id,
        base_partition: partitions[0],
        partitions: PartitionSet::from(partitions),
        proc,
        params: ParamSet::default(),
        read_only: false,
        prefetch: Vec::new(),
    }
}

fn capture() -> (
    Arc<Mutex<Vec<TransactionInitResponse>>>,
    crate::site::InitSink,
) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let target = Arc::clone(&captured);
    let sink: crate::site::InitSink = Box::new(move |response| {
        target.lock().expect("test sink mutex").push(response);
    });
    (captured, sink)
}

#[rstest]
fn rejection_at_one_partition_yields_a_single_abort_response() {
    let fixture = test_catalog();
    let site = Site::new(test_config(3), fixture.catalog.clone());

    // Partition 1 has already granted txn 4096; a later txn with a smaller
    // id can no longer be ordered there.
    let (blocker_responses, blocker_sink) = capture();
    site.transaction_init(request(4096, fixture.update_votes, &[1]), blocker_sink)
        .expect("init must register");
    site.check_queues().expect("check must run");
    assert_that!(
        wait_until(Duration::from_secs(1), || {
            blocker_responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );

    let (responses, sink) = capture();
    site.transaction_init(request(3000, fixture.update_votes, &[0, 1, 2]), sink)
        .expect("init must register");

    assert_that!(
        wait_until(Duration::from_secs(1), || {
            responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );
    let responses = responses.lock().unwrap();
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].txn_id, eq(3000));
    assert_that!(responses[0].status, eq(InitStatus::AbortReject));
    assert_that!(responses[0].reject_partition, eq(Some(1)));
    assert_that!(responses[0].reject_blocker, eq(Some(4096)));
    assert_that!(responses[0].partitions, eq(&vec![0, 1, 2]));

    // The rejected transaction left no trace: no queue entries, no executed
    // fragments on any partition.
    for partition in [0_u32, 1, 2] {
        assert_that!(site.queue_manager().queue_depth(partition), eq(0_usize));
        let stats = site.get_stats(partition).expect("stats must be reachable");
        assert_that!(stats.rows_written, eq(0));
    }
}

#[rstest]
fn init_that_misses_every_local_partition_is_a_misconfiguration() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let (responses, sink) = capture();
    let result = site.transaction_init(request(100, fixture.update_votes, &[7, 8]), sink);

    assert_that!(result.is_err(), eq(true));
    assert_that!(responses.lock().unwrap().is_empty(), eq(true));
}

#[rstest]
fn stalled_init_round_times_out() {
    let fixture = test_catalog();
    let config = hornet_common::config::SiteConfig {
        init_timeout: Duration::from_millis(0),
        ..test_config(2)
    };
    let site = Site::new(config, fixture.catalog.clone());

    // Grant a holder, then queue a second round behind it and expire it.
    let (holder_responses, holder_sink) = capture();
    site.transaction_init(request(512, fixture.update_votes, &[0, 1]), holder_sink)
        .expect("init must register");
    site.check_queues().expect("check must run");
    assert_that!(
        wait_until(Duration::from_secs(1), || {
            holder_responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );

    let (responses, sink) = capture();
    site.transaction_init(request(1024, fixture.update_votes, &[0, 1]), sink)
        .expect("init must register");
    let expired = site.expire_inits();
    assert_that!(expired >= 1, eq(true));

    let responses = responses.lock().unwrap();
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(InitStatus::AbortTimeout));
}
