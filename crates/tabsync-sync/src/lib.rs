//! Pipeline orchestration: load both sources, merge, snapshot, upsert into Postgres.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};
use tabsync_core::{merge_tables, Record};
use tabsync_storage::{
    load_source, ParseError, ReadError, SnapshotReceipt, SnapshotStore, SourceLayout, SourceSpec,
    WriteError,
};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tabsync-sync";

pub const SOURCE_A_FILE: &str = "io_files/Тестовый файл1.txt";
pub const SOURCE_B_FILE: &str = "io_files/Тестовый файл2.txt";
pub const SNAPSHOT_FILE: &str = "io_files/combined_table.json";
pub const SOURCE_A_ENCODING: &str = "utf-8";
pub const SOURCE_B_ENCODING: &str = "cp1251";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{0}`")]
    Missing(&'static str),
    #[error("invalid value `{value}` for `{var}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("invalid table name `{0}`: expected an identifier, optionally schema-qualified")]
    InvalidTableName(String),
    #[error("connecting to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("upserting record with id `{id}`: {source}")]
    Upsert {
        id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("reading back table `{table}`: {source}")]
    Select {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("closing postgres connection: {0}")]
    Close(#[source] sqlx::Error),
}

/// Any failure that aborts a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Input files and snapshot location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoConfig {
    pub source_a: SourceSpec,
    pub source_b: SourceSpec,
    pub snapshot_path: PathBuf,
}

impl IoConfig {
    /// Default file layout relative to `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            source_a: SourceSpec::new(
                root.join(SOURCE_A_FILE),
                SOURCE_A_ENCODING,
                b',',
                SourceLayout::IdNameDescription,
            ),
            source_b: SourceSpec::new(
                root.join(SOURCE_B_FILE),
                SOURCE_B_ENCODING,
                b';',
                SourceLayout::NameId,
            ),
            snapshot_path: root.join(SNAPSHOT_FILE),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let root = lookup("TABSYNC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::under(root)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub table_name: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| lookup(var).ok_or(ConfigError::Missing(var));

        let port = match lookup("POSTGRES_PORT") {
            Some(value) => value.parse::<u16>().map_err(|err| ConfigError::Invalid {
                var: "POSTGRES_PORT",
                value: value.clone(),
                reason: err.to_string(),
            })?,
            None => 5432,
        };

        let table_name = required("TABLE_NAME")?;
        if validate_table_name(&table_name).is_err() {
            return Err(ConfigError::Invalid {
                var: "TABLE_NAME",
                value: table_name,
                reason: "expected an identifier, optionally schema-qualified".to_string(),
            });
        }

        Ok(Self {
            user: required("POSTGRES_USER")?,
            password: required("POSTGRES_PASSWORD")?,
            database: required("POSTGRES_DB")?,
            host: lookup("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            table_name,
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub io: IoConfig,
    pub database: DatabaseConfig,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            io: IoConfig::from_lookup(&lookup),
            database: DatabaseConfig::from_lookup(&lookup)?,
        })
    }
}

/// Accepts `table` or `schema.table`, each part `[A-Za-z_][A-Za-z0-9_]*` up to 63 bytes.
pub fn validate_table_name(name: &str) -> Result<(), DatabaseError> {
    let is_identifier = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && part.len() <= 63
    };

    let parts = name.split('.').collect::<Vec<_>>();
    if (1..=2).contains(&parts.len()) && parts.iter().all(|part| is_identifier(*part)) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidTableName(name.to_string()))
    }
}

pub fn upsert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (id, name, description) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE SET \
         name = EXCLUDED.name, \
         description = EXCLUDED.description"
    )
}

pub fn select_statement(table: &str) -> String {
    format!("SELECT id, name, description FROM {table}")
}

/// Insert-or-update every row in order; a later row with the same id wins.
pub async fn upsert_records(
    conn: &mut PgConnection,
    table: &str,
    rows: &[Record],
) -> Result<usize, DatabaseError> {
    validate_table_name(table)?;
    let sql = upsert_statement(table);
    for record in rows {
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.name)
            .bind(record.description.as_deref())
            .execute(&mut *conn)
            .await
            .map_err(|source| DatabaseError::Upsert {
                id: record.id.clone(),
                source,
            })?;
        debug!(id = %record.id, "upserted record");
    }
    Ok(rows.len())
}

/// Full-table read with no ordering guarantee.
pub async fn fetch_records(
    conn: &mut PgConnection,
    table: &str,
) -> Result<Vec<Record>, DatabaseError> {
    validate_table_name(table)?;
    let select_err = |source: sqlx::Error| DatabaseError::Select {
        table: table.to_string(),
        source,
    };

    let rows = sqlx::query(&select_statement(table))
        .fetch_all(&mut *conn)
        .await
        .map_err(select_err)?;

    rows.into_iter()
        .map(|row| {
            Ok(Record {
                id: row.try_get::<String, _>("id")?,
                name: row.try_get::<String, _>("name")?,
                description: row.try_get::<Option<String>, _>("description")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(select_err)
}

/// What one database pass did: rows written and the table as read back afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseSync {
    pub upserted_rows: usize,
    pub table: Vec<Record>,
}

/// Open one connection, upsert `rows`, read the table back, then close the connection.
///
/// The connection is closed on every path. When an earlier step failed, that error is
/// returned and a close failure is only logged.
pub async fn sync_records(
    config: &DatabaseConfig,
    rows: &[Record],
) -> Result<DatabaseSync, DatabaseError> {
    validate_table_name(&config.table_name)?;
    let mut conn = PgConnection::connect_with(&config.connect_options())
        .await
        .map_err(DatabaseError::Connect)?;
    info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        "connected to postgres"
    );

    let outcome = async {
        let upserted_rows = upsert_records(&mut conn, &config.table_name, rows).await?;
        info!(table = %config.table_name, upserted_rows, "upsert complete");
        let table = fetch_records(&mut conn, &config.table_name).await?;
        Ok(DatabaseSync {
            upserted_rows,
            table,
        })
    }
    .await;

    let closed = conn.close().await;
    match (outcome, closed) {
        (Ok(synced), Ok(())) => Ok(synced),
        (Ok(_), Err(err)) => Err(DatabaseError::Close(err)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "closing postgres connection after failure");
            Err(err)
        }
    }
}

/// Result of the file stages: load, merge, snapshot write and reload.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedSnapshot {
    pub source_a_rows: usize,
    pub source_b_rows: usize,
    pub merged_rows: usize,
    pub snapshot: SnapshotReceipt,
    pub reloaded: Vec<Record>,
}

pub async fn prepare_snapshot(
    io: &IoConfig,
    run_id: Uuid,
) -> Result<PreparedSnapshot, PipelineError> {
    let (source_a, source_b) = async {
        let a = load_source(&io.source_a).await?;
        let b = load_source(&io.source_b).await?;
        Ok::<_, ReadError>((a, b))
    }
    .instrument(info_span!("load", %run_id))
    .await?;
    let (source_a_rows, source_b_rows) = (source_a.len(), source_b.len());

    let merged = merge_tables(source_a, source_b);
    info!(%run_id, rows = merged.len(), "merged sources");

    let store = SnapshotStore::new(io.snapshot_path.clone());
    let snapshot = store
        .write(&merged)
        .instrument(info_span!("snapshot_write", %run_id))
        .await?;
    let reloaded = store
        .read()
        .instrument(info_span!("snapshot_read", %run_id))
        .await?;

    Ok(PreparedSnapshot {
        source_a_rows,
        source_b_rows,
        merged_rows: merged.len(),
        snapshot,
        reloaded,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_a_rows: usize,
    pub source_b_rows: usize,
    pub merged_rows: usize,
    pub snapshot: SnapshotReceipt,
    pub upserted_rows: usize,
    pub table: Vec<Record>,
}

pub struct SyncPipeline {
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, PipelineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "sync run started");

        let prepared = prepare_snapshot(&self.config.io, run_id).await?;
        let span = info_span!(
            "database_sync",
            %run_id,
            table = %self.config.database.table_name
        );
        let synced = sync_records(&self.config.database, &prepared.reloaded)
            .instrument(span)
            .await?;

        let finished_at = Utc::now();
        info!(%run_id, rows = synced.table.len(), "sync run finished");

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            source_a_rows: prepared.source_a_rows,
            source_b_rows: prepared.source_b_rows,
            merged_rows: prepared.merged_rows,
            upserted_rows: synced.upserted_rows,
            snapshot: prepared.snapshot,
            table: synced.table,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, PipelineError> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(config).run_once().await
}
