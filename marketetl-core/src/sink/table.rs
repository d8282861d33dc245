//! Relational table sink.
//!
//! Layout: one table per dataset, `datetime` as primary key plus `price`,
//! `market_cap`, `total_volume`.
//!
//! - `Append` inserts the whole batch in one transaction. A primary-key
//!   collision rolls the batch back and reports the first conflicting row.
//! - `ReplaceAll` drops and recreates the table inside one transaction, so
//!   readers see either the old contents or the new ones.
//!
//! PostgreSQL is the production backend; SQLite serves local runs and tests.
//! A connection is opened per call and closed on every exit path.

use super::{PersistenceError, Sink, StagedWrite, WriteReceipt};
use crate::data::schema::{
    parse_datetime_text, NormalizedRecord, DATETIME, MARKET_CAP, PRICE, TOTAL_VOLUME,
};
use serde::Deserialize;
use sqlx::any::install_default_drivers;
use sqlx::{AnyConnection, Connection, Row};
use tracing::{debug, warn};

/// How new rows interact with rows already in the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Insert only; an existing timestamp fails the whole batch.
    #[default]
    Append,
    /// Discard the table's prior contents and write the batch in their place.
    #[serde(alias = "replace")]
    ReplaceAll,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "append" => Ok(ConflictPolicy::Append),
            "replace" | "replace_all" => Ok(ConflictPolicy::ReplaceAll),
            other => Err(format!("unknown conflict policy '{other}' (expected append or replace)")),
        }
    }
}

/// The only SQL that differs between backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn from_url(url: &str) -> Result<Self, PersistenceError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Dialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(PersistenceError::UnsupportedDatabase(redact(url)))
        }
    }

    fn timestamp_type(self) -> &'static str {
        match self {
            Dialect::Postgres => "TIMESTAMP",
            Dialect::Sqlite => "TEXT",
        }
    }

    fn timestamp_param(self) -> &'static str {
        match self {
            Dialect::Postgres => "CAST($1 AS TIMESTAMP)",
            Dialect::Sqlite => "$1",
        }
    }

    fn create_table(self, table: &str, if_not_exists: bool) -> String {
        format!(
            "CREATE TABLE {exists}{table} (\
             {DATETIME} {ts} PRIMARY KEY, \
             {PRICE} DOUBLE PRECISION NOT NULL, \
             {MARKET_CAP} DOUBLE PRECISION NOT NULL, \
             {TOTAL_VOLUME} DOUBLE PRECISION NOT NULL)",
            exists = if if_not_exists { "IF NOT EXISTS " } else { "" },
            ts = self.timestamp_type(),
        )
    }

    fn insert(self, table: &str) -> String {
        format!(
            "INSERT INTO {table} ({DATETIME}, {PRICE}, {MARKET_CAP}, {TOTAL_VOLUME}) \
             VALUES ({}, $2, $3, $4)",
            self.timestamp_param()
        )
    }
}

/// Plain SQL identifier: letters, digits, underscore, not starting with a digit.
pub fn validate_table_name(name: &str) -> Result<(), PersistenceError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidTableName(name.to_string()))
    }
}

/// Strip credentials from a connection string before it reaches a log or error.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Persists records to a SQL table.
#[derive(Debug, Clone)]
pub struct TableSink {
    database_url: String,
    dialect: Dialect,
    table: String,
    policy: ConflictPolicy,
}

impl TableSink {
    pub fn new(
        database_url: impl Into<String>,
        table: impl Into<String>,
        policy: ConflictPolicy,
    ) -> Result<Self, PersistenceError> {
        let database_url = database_url.into();
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            dialect: Dialect::from_url(&database_url)?,
            database_url,
            table,
            policy,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Write `records` to `table_name` under `policy`.
    pub fn write(
        &self,
        records: &[NormalizedRecord],
        table_name: &str,
        policy: ConflictPolicy,
    ) -> Result<WriteReceipt, PersistenceError> {
        validate_table_name(table_name)?;
        if records.is_empty() {
            return Err(PersistenceError::EmptyRecordSet);
        }

        let rows = block_on(self.write_async(records, table_name, policy))??;
        Ok(WriteReceipt {
            destination: format!("table {table_name}"),
            rows_written: rows,
        })
    }

    /// All rows of `table_name`, ascending by `datetime`.
    pub fn read(&self, table_name: &str) -> Result<Vec<NormalizedRecord>, PersistenceError> {
        validate_table_name(table_name)?;
        block_on(self.read_async(table_name))?
    }

    async fn connect(&self) -> Result<AnyConnection, PersistenceError> {
        install_default_drivers();
        AnyConnection::connect(&self.database_url)
            .await
            .map_err(|e| PersistenceError::Database(format!("connect {}: {e}", redact(&self.database_url))))
    }

    async fn write_async(
        &self,
        records: &[NormalizedRecord],
        table: &str,
        policy: ConflictPolicy,
    ) -> Result<usize, PersistenceError> {
        let mut conn = self.connect().await?;
        let outcome = self.write_in_transaction(&mut conn, records, table, policy).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "closing database connection failed");
        }
        outcome
    }

    async fn write_in_transaction(
        &self,
        conn: &mut AnyConnection,
        records: &[NormalizedRecord],
        table: &str,
        policy: ConflictPolicy,
    ) -> Result<usize, PersistenceError> {
        let mut tx = conn.begin().await.map_err(db_error)?;

        if let Err(e) = self.apply_batch(&mut *tx, records, table, policy).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(table, error = %rollback, "rollback failed, dropping transaction");
            }
            return Err(e);
        }

        tx.commit().await.map_err(db_error)?;
        debug!(table, rows = records.len(), ?policy, "batch committed");
        Ok(records.len())
    }

    async fn apply_batch(
        &self,
        conn: &mut AnyConnection,
        records: &[NormalizedRecord],
        table: &str,
        policy: ConflictPolicy,
    ) -> Result<(), PersistenceError> {
        let ddl = match policy {
            ConflictPolicy::Append => vec![self.dialect.create_table(table, true)],
            ConflictPolicy::ReplaceAll => vec![
                format!("DROP TABLE IF EXISTS {table}"),
                self.dialect.create_table(table, false),
            ],
        };
        for statement in &ddl {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(db_error)?;
        }

        let insert = self.dialect.insert(table);
        for record in records {
            let result = sqlx::query(&insert)
                .bind(record.datetime_text())
                .bind(record.price)
                .bind(record.market_cap)
                .bind(record.total_volume)
                .execute(&mut *conn)
                .await;

            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    return Err(PersistenceError::Conflict {
                        table: table.to_string(),
                        timestamp: record.datetime_text(),
                    });
                }
                Err(e) => return Err(db_error(e)),
            }
        }
        Ok(())
    }

    async fn read_async(&self, table: &str) -> Result<Vec<NormalizedRecord>, PersistenceError> {
        let mut conn = self.connect().await?;
        let sql = format!(
            "SELECT CAST({DATETIME} AS TEXT) AS ts, {PRICE}, {MARKET_CAP}, {TOTAL_VOLUME} \
             FROM {table} ORDER BY {DATETIME}"
        );
        let rows = sqlx::query(&sql).fetch_all(&mut conn).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "closing database connection failed");
        }

        rows.map_err(db_error)?
            .iter()
            .map(|row| {
                let ts: String = row.try_get("ts").map_err(db_error)?;
                let timestamp = parse_datetime_text(&ts).ok_or_else(|| {
                    PersistenceError::Database(format!("unparseable {DATETIME} value '{ts}'"))
                })?;
                Ok(NormalizedRecord::new(
                    timestamp,
                    row.try_get(PRICE).map_err(db_error)?,
                    row.try_get(MARKET_CAP).map_err(db_error)?,
                    row.try_get(TOTAL_VOLUME).map_err(db_error)?,
                ))
            })
            .collect()
    }
}

impl Sink for TableSink {
    fn describe(&self) -> String {
        format!("table {} ({:?})", self.table, self.policy)
    }

    fn stage<'a>(
        &'a self,
        records: &'a [NormalizedRecord],
    ) -> Result<Box<dyn StagedWrite + 'a>, PersistenceError> {
        if records.is_empty() {
            return Err(PersistenceError::EmptyRecordSet);
        }
        Ok(Box::new(StagedTable {
            sink: self,
            records,
        }))
    }
}

/// The transaction itself is the publish step, so staging only validates.
struct StagedTable<'a> {
    sink: &'a TableSink,
    records: &'a [NormalizedRecord],
}

impl StagedWrite for StagedTable<'_> {
    fn commit(&mut self) -> Result<WriteReceipt, PersistenceError> {
        self.sink
            .write(self.records, &self.sink.table, self.sink.policy)
    }

    fn reversible(&self) -> bool {
        false
    }

    fn revert(&mut self) -> Result<(), PersistenceError> {
        Err(PersistenceError::Irreversible(self.sink.describe()))
    }
}

fn db_error(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Database(e.to_string())
}

/// Drive one async database call to completion on a scoped runtime.
fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, PersistenceError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| PersistenceError::Database(format!("runtime: {e}")))?;
    Ok(runtime.block_on(future))
}
