//! Speculative execution under a stalled distributed holder.

use std::time::Duration;

use googletest::prelude::*;
use rstest::rstest;

use hornet_common::partition_set::PartitionSet;
use hornet_txn::messages::{InitStatus, ResponseStatus, WorkFragment};
use hornet_txn::params::{ParamSet, ParamValue};

use super::testkit::{TestCatalog, test_catalog, test_config, wait_until};
use crate::executor::ExecutionMode;
use crate::site::Site;

fn start_holder(site: &Site, proc: u16) -> u64 {
    let txn_id = site
        .invoke(
            proc,
            ParamSet::new(vec![ParamValue::Int(1), ParamValue::Int(10)]),
            0,
            PartitionSet::from(&[0_u32, 1][..]),
            None,
        )
        .expect("distributed invocation must register");
    site.check_queues().expect("check must run");
    let response = site
        .recv_init_response(Duration::from_secs(2))
        .expect("init must complete");
    assert_that!(response.txn_id, eq(txn_id));
    assert_that!(response.status, eq(InitStatus::Ok));
    txn_id
}

fn holder_fragment(fixture: &TestCatalog, txn_id: u64, key: i64) -> WorkFragment {
    WorkFragment {
        txn_id,
        partition: 0,
        stmt: fixture.update_warehouse_stmt,
        stmt_counter: 0,
        params: ParamSet::new(vec![ParamValue::Int(key), ParamValue::Int(500)]),
        read_only: false,
        prefetch: false,
    }
}

#[rstest]
fn disjoint_candidate_runs_ahead_and_answers_right_after_the_holder() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let holder = start_holder(&site, fixture.update_votes);

    // The holder is stalled on remote work; a disjoint single-partition
    // candidate runs speculatively with its response withheld.
    let candidate = site
        .invoke(
            fixture.check_subscriber,
            ParamSet::new(vec![ParamValue::Int(3)]),
            0,
            PartitionSet::single(0),
            None,
        )
        .expect("candidate must route");

    // get_stats flushes the executor inbox: everything enqueued so far has
    // been processed once it answers.
    let _ = site.get_stats(0).expect("stats must be reachable");
    assert_that!(
        site.executor(0)
            .map(|executor| executor.current_state().2),
        eq(Some(0_usize))
    );
    assert_that!(
        site.recv_client_response(Duration::from_millis(50)).is_none(),
        eq(true)
    );

    site.finish_distributed(holder, true)
        .expect("finish must route");
    let first = site
        .recv_client_response(Duration::from_secs(2))
        .expect("holder response must release");
    let second = site
        .recv_client_response(Duration::from_secs(2))
        .expect("candidate response must release");
    assert_that!(first.txn_id, eq(holder));
    assert_that!(first.status, eq(ResponseStatus::Ok));
    assert_that!(second.txn_id, eq(candidate));
    assert_that!(second.status, eq(ResponseStatus::Ok));
    assert_that!(second.restart_counter, eq(0));
}

#[rstest]
fn conflicting_candidate_waits_until_the_holder_commits() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let holder = start_holder(&site, fixture.update_warehouse);

    // The holder writes WAREHOUSE on partition 0 before stalling.
    site.transaction_work(vec![holder_fragment(&fixture, holder, 1)])
        .expect("fragment must route");
    let fragment = site
        .recv_fragment_response(Duration::from_secs(2))
        .expect("fragment must execute");
    assert_that!(fragment.status, eq(ResponseStatus::Ok));

    // A write-write conflicting candidate is rejected and stays queued.
    let candidate = site
        .invoke(
            fixture.restock_warehouse,
            ParamSet::new(vec![ParamValue::Int(1), ParamValue::Int(999)]),
            0,
            PartitionSet::single(0),
            None,
        )
        .expect("candidate must route");
    let _ = site.get_stats(0).expect("stats must be reachable");
    assert_that!(
        site.executor(0)
            .map(|executor| executor.current_state().2),
        eq(Some(1_usize))
    );
    assert_that!(
        site.recv_client_response(Duration::from_millis(50)).is_none(),
        eq(true)
    );

    // Once the holder commits, the candidate drains normally.
    site.finish_distributed(holder, true)
        .expect("finish must route");
    let first = site
        .recv_client_response(Duration::from_secs(2))
        .expect("holder response must release");
    let second = site
        .recv_client_response(Duration::from_secs(2))
        .expect("candidate response must follow");
    assert_that!(first.txn_id, eq(holder));
    assert_that!(second.txn_id, eq(candidate));
    assert_that!(second.status, eq(ResponseStatus::Ok));
}

#[rstest]
fn disabled_speculation_is_reported_as_commit_none_even_for_a_read_only_holder() {
    let fixture = test_catalog();
    let config = hornet_common::config::SiteConfig {
        specexec_enable: false,
        ..test_config(2)
    };
    let site = Site::new(config, fixture.catalog.clone());
    let holder = start_holder(&site, fixture.check_subscriber);

    let _ = site.get_stats(0).expect("stats must be reachable");
    assert_that!(
        site.executor(0).map(|executor| executor.current_state().1),
        eq(Some(ExecutionMode::CommitNone))
    );

    site.finish_distributed(holder, true)
        .expect("finish must route");
}

#[rstest]
fn read_only_holder_with_speculation_enabled_is_reported_as_commit_readonly() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let holder = start_holder(&site, fixture.check_subscriber);

    let _ = site.get_stats(0).expect("stats must be reachable");
    assert_that!(
        site.executor(0).map(|executor| executor.current_state().1),
        eq(Some(ExecutionMode::CommitReadonly))
    );

    site.finish_distributed(holder, true)
        .expect("finish must route");
}

#[rstest]
fn holder_abort_rolls_back_and_restarts_speculative_candidates() {
    let fixture = test_catalog();
    let site = Site::new(test_config(2), fixture.catalog.clone());
    let holder = start_holder(&site, fixture.update_votes);

    // Admitted speculatively: writes WAREHOUSE row 3 ahead of the holder.
    let candidate = site
        .invoke(
            fixture.restock_warehouse,
            ParamSet::new(vec![ParamValue::Int(3), ParamValue::Int(42)]),
            0,
            PartitionSet::single(0),
            None,
        )
        .expect("candidate must route");
    let _ = site.get_stats(0).expect("stats must be reachable");
    assert_that!(
        site.executor(0)
            .map(|executor| executor.current_state().2),
        eq(Some(0_usize))
    );

    // The holder aborts: the candidate's buffered response is discarded and
    // it re-executes with its restart counter bumped.
    site.finish_distributed(holder, false)
        .expect("finish must route");
    let first = site
        .recv_client_response(Duration::from_secs(2))
        .expect("holder abort must answer");
    assert_that!(first.txn_id, eq(holder));
    assert_that!(first.status, eq(ResponseStatus::AbortUser));

    let second = site
        .recv_client_response(Duration::from_secs(2))
        .expect("restarted candidate must answer");
    assert_that!(second.txn_id, eq(candidate));
    assert_that!(second.status, eq(ResponseStatus::Ok));
    assert_that!(second.restart_counter, eq(1));

    // The rerun landed its write.
    assert_that!(
        wait_until(Duration::from_secs(1), || {
            site.get_stats(0)
                .is_ok_and(|stats| stats.row_count == 1)
        }),
        eq(true)
    );
}
