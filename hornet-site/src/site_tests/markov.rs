//! Query-estimate conflict checking end to end.

use std::time::Duration;

use googletest::prelude::*;
use rstest::rstest;

use hornet_common::partition_set::PartitionSet;
use hornet_txn::messages::InitStatus;
use hornet_txn::params::{ParamSet, ParamValue};

use super::testkit::{TestCatalog, estimator_for, test_catalog, test_config};
use crate::site::Site;

fn markov_site(fixture: &TestCatalog) -> Site {
    let config = hornet_common::config::SiteConfig {
        markov_enable: true,
        ..test_config(2)
    };
    Site::new(config, fixture.catalog.clone())
}

fn start_district_holder(site: &Site, fixture: &TestCatalog, district: i64) -> u64 {
    let params = ParamSet::new(vec![ParamValue::Int(district), ParamValue::Int(77)]);
    let estimator = estimator_for(
        fixture.pay_district,
        fixture.pay_district_stmt,
        &[0, 1],
        &[],
        &params,
    );
    let txn_id = site
        .invoke(
            fixture.pay_district,
            params,
            0,
            PartitionSet::from(&[0_u32, 1][..]),
            Some(estimator),
        )
        .expect("distributed invocation must register");
    site.check_queues().expect("check must run");
    let response = site
        .recv_init_response(Duration::from_secs(2))
        .expect("init must complete");
    assert_that!(response.status, eq(InitStatus::Ok));
    txn_id
}

fn invoke_district_candidate(site: &Site, fixture: &TestCatalog, district: i64) -> u64 {
    let params = ParamSet::new(vec![ParamValue::Int(district), ParamValue::Int(5)]);
    let estimator = estimator_for(
        fixture.pay_district,
        fixture.pay_district_stmt,
        &[0],
        &[],
        &params,
    );
    site.invoke(
        fixture.pay_district,
        params,
        0,
        PartitionSet::single(0),
        Some(estimator),
    )
    .expect("candidate must route")
}

#[rstest]
fn equal_district_keys_block_the_candidate() {
    let fixture = test_catalog();
    let site = markov_site(&fixture);
    let holder = start_district_holder(&site, &fixture, 5);

    let _candidate = invoke_district_candidate(&site, &fixture, 5);
    let _ = site.get_stats(0).expect("stats must be reachable");

    // Same primary key: the candidate must still be queued.
    assert_that!(
        site.executor(0).map(|executor| executor.current_state().2),
        eq(Some(1_usize))
    );

    site.finish_distributed(holder, true)
        .expect("finish must route");
}

#[rstest]
fn distinct_district_keys_let_the_candidate_run_ahead() {
    let fixture = test_catalog();
    let site = markov_site(&fixture);
    let holder = start_district_holder(&site, &fixture, 5);

    let _candidate = invoke_district_candidate(&site, &fixture, 6);
    let stats = site.get_stats(0).expect("stats must be reachable");

    // Different primary key: the candidate ran speculatively and its write
    // already reached the engine.
    assert_that!(
        site.executor(0).map(|executor| executor.current_state().2),
        eq(Some(0_usize))
    );
    assert_that!(stats.rows_written, eq(1));

    site.finish_distributed(holder, true)
        .expect("finish must route");
}
