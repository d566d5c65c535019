//! Shared fixtures for site-level scenarios.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hornet_catalog::{Catalog, CatalogBuilder, ConflictKind, ParameterMapping, PkeyBinding};
use hornet_common::ids::{PartitionCount, ProcId, StmtId};
use hornet_common::partition_set::PartitionSet;
use hornet_common::config::SiteConfig;
use hornet_txn::estimate::{EstimatedQuery, EstimatorState, QueryEstimate, TransactionEstimate};
use hornet_txn::params::ParamSet;

/// Catalog ids used by the scenarios.
pub struct TestCatalog {
    pub catalog: Arc<Catalog>,
    pub update_votes: ProcId,
    pub check_subscriber: ProcId,
    pub update_warehouse: ProcId,
    pub restock_warehouse: ProcId,
    pub pay_district: ProcId,
    pub update_warehouse_stmt: StmtId,
    pub pay_district_stmt: StmtId,
}

/// A small vote/retail mix: two disjoint single-table procedures, two
/// warehouse writers that collide at table granularity, and two district
/// procedures whose statements bind the DISTRICT primary key so the
/// query-estimate checker can compare keys.
pub fn test_catalog() -> TestCatalog {
    let mut builder = CatalogBuilder::new();
    let votes = builder.table("VOTES", vec![0]);
    let subscriber = builder.table("SUBSCRIBER", vec![0]);
    let warehouse = builder.table("WAREHOUSE", vec![0]);
    let district = builder.table("DISTRICT", vec![0]);

    let update_votes = builder.procedure("UpdateVotes", false);
    let check_subscriber = builder.procedure("CheckSubscriber", true);
    let update_warehouse = builder.procedure("UpdateWarehouse", false);
    let restock_warehouse = builder.procedure("RestockWarehouse", false);
    let pay_district = builder.procedure("PayDistrict", false);
    let get_district = builder.procedure("GetDistrict", true);

    let _insert_vote_stmt =
        builder.statement(update_votes, "insertVote", vec![votes], true, Vec::new());
    let _get_subscriber_stmt = builder.statement(
        check_subscriber,
        "getSubscriber",
        vec![subscriber],
        false,
        Vec::new(),
    );
    let update_warehouse_stmt = builder.statement(
        update_warehouse,
        "updateWarehouse",
        vec![warehouse],
        true,
        Vec::new(),
    );
    let restock_warehouse_stmt = builder.statement(
        restock_warehouse,
        "restockWarehouse",
        vec![warehouse],
        true,
        Vec::new(),
    );
    let pay_district_stmt = builder.statement(
        pay_district,
        "payDistrict",
        vec![district],
        true,
        vec![PkeyBinding {
            table: district,
            column: 0,
            stmt_param: 0,
        }],
    );
    let get_district_stmt = builder.statement(
        get_district,
        "getDistrict",
        vec![district],
        false,
        vec![PkeyBinding {
            table: district,
            column: 0,
            stmt_param: 0,
        }],
    );

    builder.conflict(
        update_warehouse_stmt,
        restock_warehouse_stmt,
        vec![warehouse],
        ConflictKind::WriteWrite,
    );
    builder.conflict(
        restock_warehouse_stmt,
        update_warehouse_stmt,
        vec![warehouse],
        ConflictKind::WriteWrite,
    );
    builder.conflict(
        pay_district_stmt,
        get_district_stmt,
        vec![district],
        ConflictKind::ReadWrite,
    );
    builder.conflict(
        pay_district_stmt,
        pay_district_stmt,
        vec![district],
        ConflictKind::WriteWrite,
    );
    for stmt in [pay_district_stmt, get_district_stmt] {
        builder.mapping(ParameterMapping {
            stmt,
            stmt_counter: None,
            stmt_param: 0,
            proc_param: 0,
            array_offset: None,
        });
    }

    TestCatalog {
        catalog: Arc::new(builder.build()),
        update_votes,
        check_subscriber,
        update_warehouse,
        restock_warehouse,
        pay_district,
        update_warehouse_stmt,
        pay_district_stmt,
    }
}

/// Site config with `partitions` local partitions and speculation allowed
/// for all-local distributed transactions (every scenario runs on one site).
pub fn test_config(partitions: u32) -> SiteConfig {
    SiteConfig {
        partition_count: PartitionCount::new(partitions).expect("test partition count"),
        specexec_ignore_all_local: true,
        ..SiteConfig::default()
    }
}

/// Builds an estimator state forecasting one statement at the partitions.
pub fn estimator_for(
    proc: ProcId,
    stmt: StmtId,
    partitions: &[u32],
    read_only_partitions: &[u32],
    params: &ParamSet,
) -> EstimatorState {
    let estimate = TransactionEstimate {
        queries: QueryEstimate {
            queries: vec![EstimatedQuery {
                stmt,
                stmt_counter: 0,
                partitions: PartitionSet::from(partitions),
            }],
        },
        read_only_partitions: PartitionSet::from(read_only_partitions),
    };
    EstimatorState {
        proc,
        params_fingerprint: params.fingerprint(),
        initial: Some(estimate.clone()),
        last: Some(estimate),
    }
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
