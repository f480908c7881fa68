use config::shared::LoaderConfig;
use postgres::types::{DataType, TableSchema};
use telemetry::tracing::init_test_tracing;
use warehouse::error::ErrorKind;
use warehouse::failpoints::LOAD_TABLE_BEFORE_DEDUP;
use warehouse::test_utils::database::{TEST_NAMESPACE, TestWarehouseDatabase};
use warehouse::test_utils::failpoints::FailpointScenario;
use warehouse::test_utils::source::MemoryLoadFileSource;

fn tracks_schema() -> TableSchema {
    TableSchema::from([
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
        ("val".to_string(), DataType::String),
    ])
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_before_merge_rolls_back_and_drops_staging_table() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(LOAD_TABLE_BEFORE_DEDUP, "return")]);

    let database = TestWarehouseDatabase::new().await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.tracks (id text, received_at timestamptz, val text)"
        ))
        .await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.tracks values ('1', '2024-01-01 00:00:00+00', 'old')"
        ))
        .await;

    let mut source = MemoryLoadFileSource::new().with_table("tracks", tracks_schema());
    source.add_load_file("tracks", &[&["1", "2024-01-02 00:00:00+00", "new"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let err = warehouse.load_table("tracks").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectedFault);

    let rows: Vec<(String, String)> = sqlx::query_as(&format!(
        "select id, val from {TEST_NAMESPACE}.tracks"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap();
    assert_eq!(rows, vec![("1".to_string(), "old".to_string())]);
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn load_succeeds_once_failpoint_is_off() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(LOAD_TABLE_BEFORE_DEDUP, "off")]);

    let database = TestWarehouseDatabase::new().await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.tracks (id text, received_at timestamptz, val text)"
        ))
        .await;

    let mut source = MemoryLoadFileSource::new().with_table("tracks", tracks_schema());
    source.add_load_file("tracks", &[&["1", "2024-01-02 00:00:00+00", "new"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table("tracks").await.unwrap();
    assert_eq!(warehouse.total_count_in_table("tracks").await.unwrap(), 1);
}
