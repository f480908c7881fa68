use chrono::{TimeZone, Utc};
use config::shared::LoaderConfig;
use postgres::types::{DataType, TableSchema};
use telemetry::tracing::init_test_tracing;
use warehouse::management::DeleteByParams;
use warehouse::test_utils::database::{TEST_NAMESPACE, TestWarehouseDatabase};
use warehouse::test_utils::source::MemoryLoadFileSource;

fn tracks_schema() -> TableSchema {
    TableSchema::from([
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
        ("properties".to_string(), DataType::Json),
        ("amount".to_string(), DataType::Float),
    ])
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_is_created_once() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    database
        .execute(&format!("drop schema {TEST_NAMESPACE} cascade"))
        .await;
    let warehouse = database.warehouse(LoaderConfig::default(), MemoryLoadFileSource::new());

    warehouse.create_schema().await.unwrap();
    warehouse.create_schema().await.unwrap();

    let exists: bool = sqlx::query_scalar(
        "select exists (select 1 from pg_catalog.pg_namespace where nspname = $1)",
    )
    .bind(TEST_NAMESPACE)
    .fetch_one(&database.pool)
    .await
    .unwrap();
    assert!(exists);
}

#[tokio::test(flavor = "multi_thread")]
async fn fetched_schema_reflects_created_tables_and_added_columns() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    let warehouse = database.warehouse(LoaderConfig::default(), MemoryLoadFileSource::new());

    warehouse.create_table("tracks", &tracks_schema()).await.unwrap();
    warehouse
        .add_columns(
            "tracks",
            &TableSchema::from([
                ("tier".to_string(), DataType::String),
                ("active".to_string(), DataType::Boolean),
            ]),
        )
        .await
        .unwrap();
    // Adding an existing column again is a no-op.
    warehouse
        .add_columns(
            "tracks",
            &TableSchema::from([("tier".to_string(), DataType::String)]),
        )
        .await
        .unwrap();
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.devices (id text, token uuid)"
        ))
        .await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.wh_staging_postgres_tracks_abc (id text)"
        ))
        .await;

    let (schema, unrecognized) = warehouse.fetch_schema().await.unwrap();

    let mut expected_tracks = tracks_schema();
    expected_tracks.insert("tier".to_string(), DataType::String);
    expected_tracks.insert("active".to_string(), DataType::Boolean);
    assert_eq!(schema["tracks"], expected_tracks);
    assert_eq!(
        schema["devices"],
        TableSchema::from([("id".to_string(), DataType::String)])
    );
    assert!(!schema.contains_key("wh_staging_postgres_tracks_abc"));
    assert_eq!(unrecognized["devices"]["token"], "uuid");
    assert_eq!(unrecognized.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_are_counted_and_dropped() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    let warehouse = database.warehouse(LoaderConfig::default(), MemoryLoadFileSource::new());

    warehouse.create_table("tracks", &tracks_schema()).await.unwrap();
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.tracks (id) values ('1'), ('2'), ('3')"
        ))
        .await;

    assert_eq!(warehouse.total_count_in_table("tracks").await.unwrap(), 3);

    warehouse.drop_table("tracks").await.unwrap();
    assert!(database.tables().await.is_empty());
    assert!(warehouse.total_count_in_table("tracks").await.is_err());
}

async fn create_sourced_table(database: &TestWarehouseDatabase) {
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.sourced (id text, context_sources_job_run_id text, context_sources_task_run_id text, context_source_id text, received_at timestamptz)"
        ))
        .await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.sourced values \
             ('stale', 'job-1', 'task-1', 'src', '2024-01-01 00:00:00+00'), \
             ('current-run', 'job-2', 'task-2', 'src', '2024-01-01 00:00:00+00'), \
             ('other-source', 'job-1', 'task-1', 'other', '2024-01-01 00:00:00+00'), \
             ('recent', 'job-1', 'task-1', 'src', '2024-03-01 00:00:00+00')"
        ))
        .await;
}

fn delete_by_params() -> DeleteByParams {
    DeleteByParams {
        job_run_id: "job-2".to_string(),
        task_run_id: "task-2".to_string(),
        source_id: "src".to_string(),
        start_time: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    }
}

async fn sourced_ids(database: &TestWarehouseDatabase) -> Vec<String> {
    sqlx::query_scalar(&format!(
        "select id from {TEST_NAMESPACE}.sourced order by id"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_by_removes_stale_rows_of_the_source() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_sourced_table(&database).await;
    let loader = LoaderConfig {
        enable_delete_by_jobs: true,
        ..Default::default()
    };
    let warehouse = database.warehouse(loader, MemoryLoadFileSource::new());

    warehouse
        .delete_by(&["sourced"], &delete_by_params())
        .await
        .unwrap();

    assert_eq!(
        sourced_ids(&database).await,
        vec!["current-run", "other-source", "recent"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_by_is_a_no_op_when_disabled() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_sourced_table(&database).await;
    let warehouse = database.warehouse(LoaderConfig::default(), MemoryLoadFileSource::new());

    warehouse
        .delete_by(&["sourced"], &delete_by_params())
        .await
        .unwrap();

    assert_eq!(sourced_ids(&database).await.len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_test_pings_the_warehouse() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    let loader = LoaderConfig {
        connect_timeout_ms: Some(5_000),
        ..Default::default()
    };
    let warehouse = database.warehouse(loader, MemoryLoadFileSource::new());

    warehouse.test_connection().await.unwrap();
}
