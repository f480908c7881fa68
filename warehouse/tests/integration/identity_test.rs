use std::collections::BTreeMap;

use config::shared::{DedupKey, LoaderConfig};
use postgres::types::{DataType, TableSchema};
use telemetry::tracing::init_test_tracing;
use warehouse::error::{ErrorKind, LoadStage};
use warehouse::test_utils::database::{TEST_NAMESPACE, TestWarehouseDatabase};
use warehouse::test_utils::source::MemoryLoadFileSource;
use warehouse::{IDENTIFIES_TABLE, USERS_TABLE};

const T0: &str = "2023-12-31 00:00:00+00";
const T1: &str = "2024-01-01 00:00:00+00";
const T2: &str = "2024-01-02 00:00:00+00";

/// Columns sort as `attr`, `id`, `received_at`, `user_id`.
fn identifies_schema() -> TableSchema {
    TableSchema::from([
        ("attr".to_string(), DataType::String),
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
        ("user_id".to_string(), DataType::String),
    ])
}

/// Columns sort as `attr`, `id`, `received_at`.
fn users_schema() -> TableSchema {
    TableSchema::from([
        ("attr".to_string(), DataType::String),
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
    ])
}

async fn create_user_tables(database: &TestWarehouseDatabase) {
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.{IDENTIFIES_TABLE} (attr text, id text, received_at timestamptz, user_id text)"
        ))
        .await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.{USERS_TABLE} (attr text, id text, received_at timestamptz)"
        ))
        .await;
}

fn user_tables_source() -> MemoryLoadFileSource {
    MemoryLoadFileSource::new()
        .with_table(IDENTIFIES_TABLE, identifies_schema())
        .with_table(USERS_TABLE, users_schema())
}

async fn users(database: &TestWarehouseDatabase) -> Vec<(String, Option<String>)> {
    sqlx::query_as(&format!(
        "select id, attr from {TEST_NAMESPACE}.{USERS_TABLE} order by id"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn most_recent_non_null_attribute_wins() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_user_tables(&database).await;

    let mut source = user_tables_source();
    source.add_load_file(
        IDENTIFIES_TABLE,
        &[&["x", "e1", T1, "U"], &["", "e2", T2, "U"]],
    );
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let load = warehouse.load_user_tables().await;
    assert!(load.identifies.is_ok());
    assert!(matches!(load.users, Some(Ok(()))));

    assert_eq!(users(&database).await, vec![("U".to_string(), Some("x".to_string()))]);
    let received_at: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(&format!(
        "select received_at from {TEST_NAMESPACE}.{USERS_TABLE} where id = 'U'"
    ))
    .fetch_one(&database.pool)
    .await
    .unwrap();
    assert_eq!(received_at.to_rfc3339(), "2024-01-02T00:00:00+00:00");

    assert_eq!(warehouse.total_count_in_table(IDENTIFIES_TABLE).await.unwrap(), 2);
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn only_touched_users_are_recomputed() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_user_tables(&database).await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.{USERS_TABLE} values ('old', 'U', '{T0}'), ('kept', 'V', '{T0}'), ('prior', 'W', '{T0}')"
        ))
        .await;

    let mut source = user_tables_source();
    source.add_load_file(
        IDENTIFIES_TABLE,
        &[
            &["new", "e1", T1, "U"],
            &["", "e2", T1, "W"],
            &["anonymous", "e3", T2, ""],
        ],
    );
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_user_tables().await.into_result().unwrap();

    assert_eq!(
        users(&database).await,
        vec![
            ("U".to_string(), Some("new".to_string())),
            ("V".to_string(), Some("kept".to_string())),
            ("W".to_string(), Some("prior".to_string())),
        ]
    );
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn users_are_loaded_directly_when_traits_are_skipped() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_user_tables(&database).await;

    let mut source = user_tables_source();
    source.add_load_file(IDENTIFIES_TABLE, &[&["x", "e1", T1, "U"]]);
    source.add_load_file(USERS_TABLE, &[&["", "U", T2]]);
    let loader = LoaderConfig {
        skip_computing_user_latest_traits_workspace_ids: vec![
            database.warehouse_config().workspace_id,
        ],
        ..Default::default()
    };
    let warehouse = database.warehouse(loader, source);

    warehouse.load_user_tables().await.into_result().unwrap();

    // The users load file is taken as is, so the null attribute is not resolved.
    assert_eq!(users(&database).await, vec![("U".to_string(), None)]);
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn users_are_skipped_without_users_columns_in_upload() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_user_tables(&database).await;

    let mut source = MemoryLoadFileSource::new().with_table(IDENTIFIES_TABLE, identifies_schema());
    source.set_warehouse_schema(USERS_TABLE, users_schema());
    source.add_load_file(IDENTIFIES_TABLE, &[&["x", "e1", T1, "U"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let load = warehouse.load_user_tables().await;

    assert!(load.identifies.is_ok());
    assert!(load.users.is_none());
    assert!(users(&database).await.is_empty());
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn identifies_failure_skips_users() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_user_tables(&database).await;

    let mut source = user_tables_source();
    source.add_load_file(IDENTIFIES_TABLE, &[&["x", "e1", T1]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let load = warehouse.load_user_tables().await;

    assert!(load.users.is_none());
    let err = load.identifies.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ColumnCountMismatch);
    assert_eq!(err.stage(), Some(LoadStage::CsvColumnCountMismatch));
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn users_merge_failure_drops_intermediate_tables() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_user_tables(&database).await;

    let mut source = user_tables_source();
    // The warehouse schema claims a users column that exists nowhere.
    let mut warehouse_users = users_schema();
    warehouse_users.insert("plan_name".to_string(), DataType::String);
    source.set_warehouse_schema(USERS_TABLE, warehouse_users);
    source.add_load_file(IDENTIFIES_TABLE, &[&["x", "e1", T1, "U"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let load = warehouse.load_user_tables().await;

    assert!(load.identifies.is_ok());
    assert!(matches!(load.users, Some(Err(_))));
    assert!(users(&database).await.is_empty());
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn users_merge_honors_dedup_key_override() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_user_tables(&database).await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.{USERS_TABLE} values ('free', 'U', '{T0}')"
        ))
        .await;

    let mut source = user_tables_source();
    source.add_load_file(IDENTIFIES_TABLE, &[&["team", "e1", T1, "U"]]);
    let loader = LoaderConfig {
        dedup_keys: BTreeMap::from([(
            USERS_TABLE.to_string(),
            DedupKey::new("id", &["id", "attr"]),
        )]),
        ..Default::default()
    };
    let warehouse = database.warehouse(loader, source);

    warehouse.load_user_tables().await.into_result().unwrap();

    // The old row differs on `attr`, so the override keeps it next to the merged row.
    let users: Vec<(String, Option<String>)> = sqlx::query_as(&format!(
        "select id, attr from {TEST_NAMESPACE}.{USERS_TABLE} order by id, attr"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap();
    assert_eq!(
        users,
        vec![
            ("U".to_string(), Some("free".to_string())),
            ("U".to_string(), Some("team".to_string())),
        ]
    );
}
