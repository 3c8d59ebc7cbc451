// Runs against a live Postgres when POSTGRES_USER / POSTGRES_PASSWORD / POSTGRES_DB are set;
// otherwise each database test returns early.

use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tabsync_core::Record;
use tabsync_sync::{sync_records, DatabaseConfig, DatabaseError};
use uuid::Uuid;

fn live_config() -> Option<DatabaseConfig> {
    let configured = ["POSTGRES_USER", "POSTGRES_PASSWORD", "POSTGRES_DB"]
        .iter()
        .all(|key| std::env::var(key).is_ok());
    if !configured {
        eprintln!("skipping: postgres settings not present");
        return None;
    }
    let table = format!("tabsync_test_{}", Uuid::new_v4().simple());
    DatabaseConfig::from_lookup(|key| match key {
        "TABLE_NAME" => Some(table.clone()),
        _ => std::env::var(key).ok(),
    })
    .ok()
}

async fn create_table(config: &DatabaseConfig) {
    let mut conn = PgConnection::connect_with(&config.connect_options())
        .await
        .expect("connect");
    sqlx::query(&format!(
        "CREATE TABLE {} (id TEXT PRIMARY KEY, name TEXT NOT NULL, description TEXT)",
        config.table_name
    ))
    .execute(&mut conn)
    .await
    .expect("create table");
    conn.close().await.expect("close");
}

async fn drop_table(config: &DatabaseConfig) {
    let mut conn = PgConnection::connect_with(&config.connect_options())
        .await
        .expect("connect");
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", config.table_name))
        .execute(&mut conn)
        .await
        .expect("drop table");
    conn.close().await.expect("close");
}

fn sorted(mut rows: Vec<Record>) -> Vec<Record> {
    rows.sort_by(|a, b| a.id.cmp(&b.id));
    rows
}

#[tokio::test]
async fn later_upsert_overwrites_name_and_description() {
    let Some(config) = live_config() else { return };
    create_table(&config).await;

    sync_records(&config, &[Record::new("001", "Alice", Some("desc1"))])
        .await
        .expect("first sync");
    let synced = sync_records(&config, &[Record::new("001", "Alice2", Some("desc2"))])
        .await
        .expect("second sync");

    assert_eq!(synced.upserted_rows, 1);
    assert_eq!(synced.table, vec![Record::new("001", "Alice2", Some("desc2"))]);
    drop_table(&config).await;
}

#[tokio::test]
async fn applying_the_same_batch_twice_matches_applying_it_once() {
    let Some(config) = live_config() else { return };
    create_table(&config).await;
    let batch = vec![
        Record::new("001", "Alice", Some("desc1")),
        Record::new("002", "Bob", None::<String>),
        Record::new("0003", "Чебурашка", Some("ушастый")),
    ];

    let first = sync_records(&config, &batch).await.expect("first sync");
    let second = sync_records(&config, &batch).await.expect("second sync");
    assert_eq!(first.upserted_rows, batch.len());
    assert_eq!(second.upserted_rows, batch.len());

    let once = sorted(first.table);
    let twice = sorted(second.table);
    assert_eq!(once, twice);
    assert_eq!(once, sorted(batch));
    drop_table(&config).await;
}

#[tokio::test]
async fn duplicate_ids_in_one_batch_keep_the_last_row() {
    let Some(config) = live_config() else { return };
    create_table(&config).await;

    let synced = sync_records(
        &config,
        &[
            Record::new("001", "First", Some("a")),
            Record::new("001", "Second", None::<String>),
        ],
    )
    .await
    .expect("sync");

    assert_eq!(synced.upserted_rows, 2);
    assert_eq!(synced.table, vec![Record::new("001", "Second", None::<String>)]);
    drop_table(&config).await;
}

#[tokio::test]
async fn missing_table_reports_the_failing_id() {
    let Some(config) = live_config() else { return };

    let err = sync_records(&config, &[Record::new("042", "Nobody", None::<String>)])
        .await
        .expect_err("table does not exist");

    assert!(matches!(err, DatabaseError::Upsert { ref id, .. } if id == "042"));
}

#[tokio::test]
async fn unreachable_server_is_a_connect_error() {
    let config = DatabaseConfig {
        user: "nobody".to_string(),
        password: "nothing".to_string(),
        database: "none".to_string(),
        host: "127.0.0.1".to_string(),
        port: 1,
        table_name: "people".to_string(),
    };

    let err = sync_records(&config, &[Record::new("1", "a", None::<String>)])
        .await
        .expect_err("nothing listens on port 1");

    assert!(matches!(err, DatabaseError::Connect(_)));
}

#[tokio::test]
async fn invalid_table_name_is_rejected_before_connecting() {
    let config = DatabaseConfig {
        user: "nobody".to_string(),
        password: "nothing".to_string(),
        database: "none".to_string(),
        host: "127.0.0.1".to_string(),
        port: 1,
        table_name: "people; DROP TABLE people".to_string(),
    };

    let err = sync_records(&config, &[]).await.expect_err("bad name");
    assert!(matches!(err, DatabaseError::InvalidTableName(_)));
}
