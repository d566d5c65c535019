//! Single-partition fast path: no init round trip, direct commit.

use std::time::Duration;

use googletest::prelude::*;
use rstest::rstest;

use hornet_common::partition_set::PartitionSet;
use hornet_txn::messages::ResponseStatus;
use hornet_txn::params::{ParamSet, ParamValue};

use super::testkit::{test_catalog, test_config, wait_until};
use crate::site::Site;

#[rstest]
fn single_partition_txn_commits_without_an_init_round_trip() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());

    let txn_id = site
        .invoke(
            fixture.update_votes,
            ParamSet::new(vec![ParamValue::Int(7), ParamValue::Int(1)]),
            0,
            PartitionSet::single(0),
            None,
        )
        .expect("invocation must route");

    let response = site
        .recv_client_response(Duration::from_secs(2))
        .expect("fast path must answer");
    assert_that!(response.txn_id, eq(txn_id));
    assert_that!(response.status, eq(ResponseStatus::Ok));
    assert_that!(response.restart_counter, eq(0));

    // No init protocol was involved.
    assert_that!(site.recv_init_response(Duration::from_millis(50)).is_none(), eq(true));
    assert_that!(site.queue_manager().queue_depth(0), eq(0_usize));

    let committed = wait_until(Duration::from_secs(1), || {
        site.executor(0)
            .is_some_and(|executor| executor.committed_count() == 1)
    });
    assert_that!(committed, eq(true));
    assert_that!(
        site.executor(0).map(|executor| executor.last_committed()),
        eq(Some(txn_id))
    );

    // The write landed in the engine.
    let stats = site.get_stats(0).expect("stats must be reachable");
    assert_that!(stats.rows_written, eq(1));
}

#[rstest]
fn invoking_an_unknown_partition_is_rejected() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let result = site.invoke(
        fixture.update_votes,
        ParamSet::default(),
        9,
        PartitionSet::single(9),
        None,
    );
    assert_that!(result.is_err(), eq(true));
}
