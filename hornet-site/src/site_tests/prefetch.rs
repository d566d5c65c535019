//! Prefetch dispatch on init grant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use googletest::prelude::*;
use rstest::rstest;

use hornet_common::partition_set::PartitionSet;
use hornet_txn::messages::{
    InitStatus, PrefetchQuery, ResponseStatus, TransactionInitRequest, TransactionInitResponse,
};
use hornet_txn::params::{ParamSet, ParamValue};

use super::testkit::{test_catalog, test_config, wait_until};
use crate::site::Site;

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
fn prefetch_fragments_run_on_non_base_partitions_after_the_grant() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let (responses, sink) = capture();

    let base_params = ParamSet::new(vec![ParamValue::Int(1), ParamValue::Int(100)]);
    let remote_params = ParamSet::new(vec![ParamValue::Int(9), ParamValue::Int(500)]);
    let request = TransactionInitRequest {
        txn_id: 700,
        base_partition: 0,
        partitions: PartitionSet::from(&[0_u32, 1][..]),
        proc: fixture.update_warehouse,
        params: ParamSet::default(),
        read_only: false,
        prefetch: vec![
            PrefetchQuery {
                stmt: fixture.update_warehouse_stmt,
                partition: 0,
                params: base_params.encode(),
            },
            PrefetchQuery {
                stmt: fixture.update_warehouse_stmt,
                partition: 1,
                params: remote_params.encode(),
            },
        ],
    };
    site.transaction_init(request, sink)
        .expect("init must register");
    site.check_queues().expect("check must run");

    assert_that!(
        wait_until(Duration::from_secs(1), || {
            responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );
    assert_that!(responses.lock().unwrap()[0].status, eq(InitStatus::Ok));

    // Only the non-base fragment runs, with its decoded parameters.
    let fragment = site
        .recv_fragment_response(Duration::from_secs(2))
        .expect("prefetch fragment must execute");
    assert_that!(fragment.txn_id, eq(700));
    assert_that!(fragment.partition, eq(1));
    assert_that!(fragment.status, eq(ResponseStatus::Ok));
    assert_that!(fragment.rows, eq(&vec![9, 500]));
    assert_that!(
        site.recv_fragment_response(Duration::from_millis(50)).is_none(),
        eq(true)
    );

    // The base partition saw no prefetch write, and both decoded parameter
    // sets are attached to the transaction handle.
    let stats = site.get_stats(0).expect("stats must be reachable");
    assert_that!(stats.rows_written, eq(0));
    assert_that!(
        site.prefetch_params(700),
        eq(&Some(vec![base_params, remote_params]))
    );

    site.finish_distributed(700, true).expect("finish must route");
}

#[rstest]
fn malformed_prefetch_parameters_turn_the_grant_into_an_unexpected_abort() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let (responses, sink) = capture();

    let request = TransactionInitRequest {
        txn_id: 800,
        base_partition: 0,
        partitions: PartitionSet::from(&[0_u32, 1][..]),
        proc: fixture.update_warehouse,
        params: ParamSet::default(),
        read_only: false,
        prefetch: vec![PrefetchQuery {
            stmt: fixture.update_warehouse_stmt,
            partition: 1,
            params: vec![0xDE, 0xAD],
        }],
    };
    site.transaction_init(request, sink)
        .expect("init must register");
    site.check_queues().expect("check must run");

    assert_that!(
        wait_until(Duration::from_secs(1), || {
            responses.lock().unwrap().len() == 1
        }),
        eq(true)
    );
    let responses = responses.lock().unwrap();
    assert_that!(responses[0].status, eq(InitStatus::AbortUnexpected));
    assert_that!(
        site.recv_fragment_response(Duration::from_millis(50)).is_none(),
        eq(true)
    );
}
