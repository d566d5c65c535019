//! Distributed grant ordering by transaction id.

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
fn smaller_id_is_granted_on_all_partitions_before_a_larger_one() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let (late_responses, late_sink) = capture();
    let (early_responses, early_sink) = capture();

    // Txn 2048 arrives first, then txn 1024 with the smaller id.
    site.transaction_init(request(2048, fixture.update_votes, &[0, 1]), late_sink)
        .expect("init must register");
    site.transaction_init(request(1024, fixture.update_votes, &[0, 1]), early_sink)
        .expect("init must register");
    site.check_queues().expect("check must run");

    assert_that!(
        wait_until(Duration::from_secs(1), || {
            early_responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );
    {
        let early = early_responses.lock().unwrap();
        assert_that!(early[0].status, eq(InitStatus::Ok));
        assert_that!(early[0].partitions.len(), eq(2_usize));
    }
    assert_that!(late_responses.lock().unwrap().is_empty(), eq(true));
    assert_that!(site.queue_manager().holder(0), eq(Some(1024)));
    assert_that!(site.queue_manager().holder(1), eq(Some(1024)));

    // Finishing the smaller txn unlocks the larger one on both partitions.
    site.finish_distributed(1024, true)
        .expect("finish must route");
    assert_that!(
        wait_until(Duration::from_secs(2), || {
            late_responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );
    let late = late_responses.lock().unwrap();
    assert_that!(late[0].status, eq(InitStatus::Ok));
    assert_that!(site.queue_manager().holder(0), eq(Some(2048)));
    assert_that!(site.queue_manager().holder(1), eq(Some(2048)));
}

#[rstest]
fn rejected_init_is_restarted_with_a_fresh_id() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());

    // Grant id 1500 on both partitions; the first locally minted id (1024)
    // arrives below the granted watermark and cannot be ordered any more.
    let blocker = 1500_u64;
    let (big_responses, big_sink) = capture();
    site.transaction_init(request(blocker, fixture.update_votes, &[0, 1]), big_sink)
        .expect("init must register");
    site.check_queues().expect("check must run");
    assert_that!(
        wait_until(Duration::from_secs(1), || {
            big_responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );

    let rejected = site
        .invoke(
            fixture.update_votes,
            ParamSet::default(),
            0,
            PartitionSet::from(&[0_u32, 1][..]),
            None,
        )
        .expect("invocation must register");
    let response = site
        .recv_init_response(Duration::from_secs(2))
        .expect("rejection must surface");
    assert_that!(response.txn_id, eq(rejected));
    assert_that!(response.status, eq(InitStatus::AbortReject));
    assert_that!(response.reject_blocker, eq(Some(blocker)));

    // Release the blocker, then let the restart queue re-register the txn
    // under a fresh (larger) id.
    site.finish_distributed(blocker, true)
        .expect("finish must route");
    assert_that!(
        wait_until(Duration::from_secs(1), || {
            site.queue_manager().holder(0).is_none() && site.queue_manager().holder(1).is_none()
        }),
        eq(true)
    );
    std::thread::sleep(site.config().init_queue_restart_delay);
    site.process_restarts().expect("restart must register");
    site.check_queues().expect("check must run");

    let retried = site
        .recv_init_response(Duration::from_secs(2))
        .expect("restart must surface");
    assert_that!(retried.status, eq(InitStatus::Ok));
    assert_that!(retried.txn_id > blocker, eq(true));
}
