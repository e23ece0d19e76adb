//! Concurrent harness runs with random cancellation, plus the
//! cancel-then-reuse probe and registry cleanup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tck_harness::config::TckConfig;
use tck_harness::driver::{Credentials, Driver};
use tck_harness::harness::{QueryOrder, RunLimit};
use tck_harness::logging::init_test_tracing;
use tck_harness::mock::{ScriptedDriver, ScriptedResponse};
use tck_harness::probe::probe_cancel_and_reuse;
use tck_harness::registry::ConnectionFactoryRegistry;
use tck_harness::sqlite_driver::SqliteDriver;
use tck_harness::{Expectation, HarnessConfig, run_concurrent_harness};
use tck_types::{ColumnMeta, RowSet, SqlType, Value};

const COUNT_TO_2M: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                           WHERE x < 2000000) SELECT count(*) FROM c";

fn fixture_db(dir: &Path) -> String {
    let path = dir.join("storm.db");
    let conn = rusqlite::Connection::open(&path).expect("create fixture db");
    conn.execute_batch(
        "CREATE TABLE sales_fact_1997 (product_id INTEGER, unit_sales INTEGER);
         INSERT INTO sales_fact_1997 VALUES (1, 100000), (2, 100000), (3, 66773);",
    )
    .expect("populate fixture db");
    format!("sqlite:{}", path.display())
}

fn registry() -> ConnectionFactoryRegistry {
    ConnectionFactoryRegistry::new(Credentials::default(), Duration::from_secs(10))
}

#[test]
fn random_cancellations_against_a_pool_collect_no_errors() {
    init_test_tracing();
    let scripted = ScriptedDriver::new();
    let rows = RowSet::new(vec![ColumnMeta::new("m0", SqlType::BigInt)]).with_row([Value::BigInt(266_773)]);
    scripted.script(
        "fast",
        ScriptedResponse::rows(rows.clone()).with_sql("select sum(unit_sales) as m0 from sales_fact_1997"),
    );
    scripted.script("slow", ScriptedResponse::rows(rows).with_latency(Duration::from_millis(40)));
    let driver: Arc<dyn Driver> = Arc::new(scripted.clone());

    let registry = registry();
    let factory = registry.pooled(&driver, "scripted:storm", 5).expect("pool");
    let queries: Arc<[Expectation]> = vec![
        Expectation::sql("fast")
            .rows(["266,773"])
            .sql("sum(unit_sales) m0")
            .build(),
        Expectation::sql("slow").rows(["266,773"]).build(),
    ]
    .into();
    let config = HarnessConfig {
        workers: 10,
        limit: RunLimit::Duration(Duration::from_secs(2)),
        cancellations: 20,
        cancel_interval: Duration::from_millis(20),
        ..HarnessConfig::default()
    };

    let run = run_concurrent_harness(Arc::clone(&factory), queries, &config).expect("harness");
    assert!(run.errors.is_empty(), "{:#?}", run.errors);
    assert!(run.stragglers.is_empty());
    assert!(run.cancel_attempts + run.cancel_skipped <= 20);
    assert!(run.succeeded > 0);
    assert!(run.cancelled <= run.cancel_attempts);
    assert!(scripted.stats().max_open_connections <= 5);
    assert_eq!(factory.status().leased, 0);

    registry.shutdown();
    assert_eq!(scripted.stats().open_connections, 0);
}

#[test]
fn sqlite_storm_with_round_robin_queries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = fixture_db(dir.path());
    let driver: Arc<dyn Driver> = Arc::new(SqliteDriver);
    let registry = registry();
    let factory = registry.per_call(&driver, &url).expect("per-call factory");

    let queries: Arc<[Expectation]> = vec![
        Expectation::sql("select sum(unit_sales) sum_sales from sales_fact_1997")
            .columns(["sum_sales"])
            .rows(["266,773"])
            .build(),
        Expectation::sql(COUNT_TO_2M).rows(["2,000,000"]).build(),
    ]
    .into();
    let config = HarnessConfig {
        workers: 4,
        limit: RunLimit::Runs(4),
        order: QueryOrder::RoundRobin,
        cancellations: 6,
        cancel_interval: Duration::from_millis(30),
        seed: 11,
        ..HarnessConfig::default()
    };
    let run = run_concurrent_harness(factory, queries, &config).expect("harness");
    assert!(run.is_clean(), "{:#?}", run.errors);
    assert_eq!(run.succeeded + run.cancelled, 16);
    registry.shutdown();
}

#[test]
fn harness_config_from_toml_drives_a_run() {
    let scripted = ScriptedDriver::new();
    scripted.script_fallback(ScriptedResponse::rows(
        RowSet::new(vec![ColumnMeta::new("n", SqlType::Integer)]).with_row([Value::Integer(3)]),
    ));
    let driver: Arc<dyn Driver> = Arc::new(scripted);
    let config = TckConfig::from_toml_str(
        r#"
        [compliance]
        level = 3

        [harness]
        workers = 3
        runs = 2
        cancellations = 0
        connection_source = { kind = "single" }
        "#,
    )
    .expect("config");
    let registry = registry();
    let factory = registry
        .factory(&driver, "scripted:toml", config.harness.connection_source)
        .expect("factory");
    let queries: Arc<[Expectation]> = vec![
        Expectation::sql("q")
            .types([SqlType::Integer])
            .rows(["3"])
            .build(),
    ]
    .into();
    let run = run_concurrent_harness(factory, queries, &config.harness_config()).expect("harness");
    assert!(run.is_clean(), "{:#?}", run.errors);
    assert_eq!(run.succeeded, 6);
    let json = run.to_json().expect("json");
    let parsed: tck_harness::HarnessRun = serde_json::from_str(&json).expect("round trip");
    assert_eq!(parsed, run);
}

#[test]
fn sqlite_connection_survives_cancel_and_close() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = fixture_db(dir.path());
    let driver: Arc<dyn Driver> = Arc::new(SqliteDriver);
    let registry = registry();
    let queries = vec![COUNT_TO_2M.to_owned()];

    let same = registry.single(&driver, &url).expect("single");
    let outcome = probe_cancel_and_reuse(&same, &queries, false, 5).expect("probe");
    assert!(outcome.passed(), "{:?}", outcome.errors);

    let fresh = registry.per_call(&driver, &url).expect("per-call");
    let outcome = probe_cancel_and_reuse(&fresh, &queries, true, 6).expect("probe");
    assert!(outcome.passed(), "{:?}", outcome.errors);
    assert_eq!(registry.factory_count(), 2);
    registry.shutdown();
    assert!(same.acquire().is_err());
}
