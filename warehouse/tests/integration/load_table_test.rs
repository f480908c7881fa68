use config::shared::LoaderConfig;
use postgres::types::{DataType, TableSchema};
use telemetry::tracing::init_test_tracing;
use warehouse::classifier::{JobErrorKind, classify};
use warehouse::error::{ErrorKind, LoadStage};
use warehouse::staging::{StagingCleanup, staging_table_name};
use warehouse::test_utils::database::{TEST_NAMESPACE, TEST_WORKSPACE_ID, TestWarehouseDatabase};
use warehouse::test_utils::source::MemoryLoadFileSource;
use warehouse::{DISCARDS_TABLE, IDENTIFIES_TABLE, PROVIDER, USERS_TABLE};

const TRACKS: &str = "tracks";

const T1: &str = "2024-01-01 00:00:00+00";
const T2: &str = "2024-01-02 00:00:00+00";
const T3: &str = "2024-01-03 00:00:00+00";

/// Columns sort as `id`, `received_at`, `val`.
fn tracks_schema() -> TableSchema {
    TableSchema::from([
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
        ("val".to_string(), DataType::String),
    ])
}

async fn tracks(database: &TestWarehouseDatabase) -> Vec<(String, Option<String>)> {
    sqlx::query_as(&format!(
        "select id, val from {TEST_NAMESPACE}.{TRACKS} order by id"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap()
}

async fn create_tracks(database: &TestWarehouseDatabase) {
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.{TRACKS} (id text, received_at timestamptz, val text)"
        ))
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn most_recent_file_row_wins_for_a_key() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, "a"]]);
    source.add_load_file(TRACKS, &[&["1", T2, "b"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table(TRACKS).await.unwrap();

    assert_eq!(tracks(&database).await, vec![("1".to_string(), Some("b".to_string()))]);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_row_per_key_with_maximum_recency() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    // `a_val` sorts before the key, so load file columns are `a_val`, `id`, `received_at`.
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.pages (a_val text, id text, received_at timestamptz)"
        ))
        .await;
    let schema = TableSchema::from([
        ("a_val".to_string(), DataType::String),
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
    ]);

    let mut source = MemoryLoadFileSource::new().with_table("pages", schema);
    source.add_load_file("pages", &[&["x1", "1", T1], &["x3", "1", T3], &["y2", "2", T2]]);
    source.add_load_file("pages", &[&["x2", "1", T2], &["y1", "2", T1]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table("pages").await.unwrap();

    let rows: Vec<(String, String)> = sqlx::query_as(&format!(
        "select id, a_val from {TEST_NAMESPACE}.pages order by id"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap();
    assert_eq!(
        rows,
        vec![
            ("1".to_string(), "x3".to_string()),
            ("2".to_string(), "y2".to_string()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_row_is_replaced_by_staged_row() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.{TRACKS} values ('1', '{T1}', 'old'), ('2', '{T1}', 'other')"
        ))
        .await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T2, "new"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table(TRACKS).await.unwrap();

    assert_eq!(
        tracks(&database).await,
        vec![
            ("1".to_string(), Some("new".to_string())),
            ("2".to_string(), Some("other".to_string())),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn blank_fields_are_loaded_as_null() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, ""], &["2", T1, "  "], &["3", T1, "c"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table(TRACKS).await.unwrap();

    assert_eq!(
        tracks(&database).await,
        vec![
            ("1".to_string(), None),
            ("2".to_string(), None),
            ("3".to_string(), Some("c".to_string())),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn values_needing_escapes_are_loaded_verbatim() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, "tab\there\nnew line \\N, comma"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table(TRACKS).await.unwrap();

    assert_eq!(
        tracks(&database).await,
        vec![(
            "1".to_string(),
            Some("tab\there\nnew line \\N, comma".to_string())
        )]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn column_count_mismatch_aborts_without_mutating_destination() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.{TRACKS} values ('1', '{T1}', 'keep')"
        ))
        .await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T2, "replaced"]]);
    source.add_load_file(TRACKS, &[&["2", T1, "a"], &["3", T1, "b"], &["4", T1]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let err = warehouse.load_table(TRACKS).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ColumnCountMismatch);
    assert_eq!(err.stage(), Some(LoadStage::CsvColumnCountMismatch));
    let detail = err.detail().unwrap();
    assert!(detail.contains("columns in csv row: 2"), "{detail}");
    assert!(
        detail.contains("rows processed in csv file until mismatch: 2"),
        "{detail}"
    );

    assert_eq!(
        tracks(&database).await,
        vec![("1".to_string(), Some("keep".to_string()))]
    );
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_load_file_fails_at_gzip_reading() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_corrupt_load_file(TRACKS, b"definitely not gzip");
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let err = warehouse.load_table(TRACKS).await.unwrap_err();

    assert_eq!(err.stage(), Some(LoadStage::LoadFilesGzipReading));
    assert!(tracks(&database).await.is_empty());
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_destination_fails_at_staging_table_creation() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, "a"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let err = warehouse.load_table(TRACKS).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DestinationTableMissing);
    assert_eq!(err.stage(), Some(LoadStage::StagingTableCreation));
    assert_eq!(
        classify(&err.classification_text()),
        JobErrorKind::ResourceNotFound
    );
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_destination_column_is_not_classified_as_missing_relation() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.{TRACKS} (id text, received_at timestamptz)"
        ))
        .await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, "a"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let err = warehouse.load_table(TRACKS).await.unwrap_err();

    assert_eq!(err.stage(), Some(LoadStage::CopyInSchema));
    let text = err.classification_text();
    assert!(text.starts_with("column \"val\" of relation"), "{text}");
    assert_eq!(classify(&text), JobErrorKind::Unknown);
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_upload_schema_is_rejected() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;

    let warehouse = database.warehouse(LoaderConfig::default(), MemoryLoadFileSource::new());

    let err = warehouse.load_table(TRACKS).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test(flavor = "multi_thread")]
async fn staging_table_is_dropped_after_success() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, "a"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table(TRACKS).await.unwrap();

    assert!(database.staging_tables().await.is_empty());
    assert_eq!(database.tables().await, vec![TRACKS.to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_staging_table_is_kept_for_the_caller() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;

    let mut source = MemoryLoadFileSource::new().with_table(TRACKS, tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, "a"], &["1", T2, "b"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);
    let staging_table = staging_table_name(PROVIDER, TRACKS);

    let rows = warehouse
        .load_table_with_staging(
            TRACKS,
            &tracks_schema(),
            &staging_table,
            StagingCleanup::Defer,
        )
        .await
        .unwrap();

    assert_eq!(rows, 2);
    assert_eq!(database.staging_tables().await, vec![staging_table.clone()]);
    assert_eq!(warehouse.total_count_in_table(&staging_table).await.unwrap(), 2);

    warehouse.drop_staging_table(&staging_table).await;
    assert!(database.staging_tables().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn discards_are_deduplicated_on_every_partition_column() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.{DISCARDS_TABLE} (column_name text, column_value text, received_at timestamptz, row_id text, table_name text)"
        ))
        .await;
    let schema = TableSchema::from([
        ("column_name".to_string(), DataType::String),
        ("column_value".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
        ("row_id".to_string(), DataType::String),
        ("table_name".to_string(), DataType::String),
    ]);

    let mut source = MemoryLoadFileSource::new().with_table(DISCARDS_TABLE, schema);
    source.add_load_file(
        DISCARDS_TABLE,
        &[
            &["email", "a@example.com", T1, "r1", "users"],
            &["plan_name", "pro", T1, "r1", "users"],
            &["email", "b@example.com", T2, "r1", "users"],
        ],
    );
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    warehouse.load_table(DISCARDS_TABLE).await.unwrap();

    let rows: Vec<(String, String)> = sqlx::query_as(&format!(
        "select column_name, column_value from {TEST_NAMESPACE}.{DISCARDS_TABLE} order by column_name"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap();
    assert_eq!(
        rows,
        vec![
            ("email".to_string(), "b@example.com".to_string()),
            ("plan_name".to_string(), "pro".to_string()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_load_concurrently_with_distinct_staging_tables() {
    init_test_tracing();
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.screens (id text, received_at timestamptz, val text)"
        ))
        .await;

    let mut source = MemoryLoadFileSource::new()
        .with_table(TRACKS, tracks_schema())
        .with_table("screens", tracks_schema());
    source.add_load_file(TRACKS, &[&["1", T1, "track"]]);
    source.add_load_file("screens", &[&["1", T1, "screen"]]);
    let warehouse = database.warehouse(LoaderConfig::default(), source);

    let (tracks_result, screens_result) =
        tokio::join!(warehouse.load_table(TRACKS), warehouse.load_table("screens"));
    tracks_result.unwrap();
    screens_result.unwrap();

    assert_eq!(warehouse.total_count_in_table(TRACKS).await.unwrap(), 1);
    assert_eq!(warehouse.total_count_in_table("screens").await.unwrap(), 1);
    assert!(database.staging_tables().await.is_empty());
}

type LoadedRows = Vec<(String, Option<String>)>;

/// Loads tracks and the user tables over existing rows and returns `(tracks, users)`.
async fn load_tracks_and_users(loader: LoaderConfig) -> (LoadedRows, LoadedRows) {
    let database = TestWarehouseDatabase::new().await;
    create_tracks(&database).await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.{IDENTIFIES_TABLE} (id text, received_at timestamptz, tier text, user_id text)"
        ))
        .await;
    database
        .execute(&format!(
            "create table {TEST_NAMESPACE}.{USERS_TABLE} (id text, received_at timestamptz, tier text)"
        ))
        .await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.{TRACKS} values ('1', '{T1}', 'old'), ('2', '{T1}', 'kept')"
        ))
        .await;
    database
        .execute(&format!(
            "insert into {TEST_NAMESPACE}.{USERS_TABLE} values ('U', '{T1}', 'free'), ('V', '{T1}', 'pro')"
        ))
        .await;

    let identifies_schema = TableSchema::from([
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
        ("tier".to_string(), DataType::String),
        ("user_id".to_string(), DataType::String),
    ]);
    let users_schema = TableSchema::from([
        ("id".to_string(), DataType::String),
        ("received_at".to_string(), DataType::Datetime),
        ("tier".to_string(), DataType::String),
    ]);
    let mut source = MemoryLoadFileSource::new()
        .with_table(TRACKS, tracks_schema())
        .with_table(IDENTIFIES_TABLE, identifies_schema)
        .with_table(USERS_TABLE, users_schema);
    source.add_load_file(TRACKS, &[&["1", T2, "new"], &["3", T3, "added"]]);
    source.add_load_file(IDENTIFIES_TABLE, &[&["e1", T2, "team", "U"]]);
    let warehouse = database.warehouse(loader, source);

    warehouse.load_table(TRACKS).await.unwrap();
    warehouse.load_user_tables().await.into_result().unwrap();

    let users = sqlx::query_as(&format!(
        "select id, tier from {TEST_NAMESPACE}.{USERS_TABLE} order by id"
    ))
    .fetch_all(&database.pool)
    .await
    .unwrap();
    assert!(database.staging_tables().await.is_empty());

    (tracks(&database).await, users)
}

#[tokio::test(flavor = "multi_thread")]
async fn execution_plan_mode_loads_the_same_rows() {
    init_test_tracing();

    let plain = load_tracks_and_users(LoaderConfig::default()).await;
    assert_eq!(
        plain,
        (
            vec![
                ("1".to_string(), Some("new".to_string())),
                ("2".to_string(), Some("kept".to_string())),
                ("3".to_string(), Some("added".to_string())),
            ],
            vec![
                ("U".to_string(), Some("team".to_string())),
                ("V".to_string(), Some("pro".to_string())),
            ],
        )
    );

    let global = load_tracks_and_users(LoaderConfig {
        enable_sql_statement_execution_plan: true,
        ..Default::default()
    })
    .await;
    assert_eq!(global, plain);

    let per_workspace = load_tracks_and_users(LoaderConfig {
        enable_sql_statement_execution_plan_workspace_ids: vec![TEST_WORKSPACE_ID.to_string()],
        ..Default::default()
    })
    .await;
    assert_eq!(per_workspace, plain);
}
