//! SQLite-backed store connection

use std::str::FromStr;

use async_trait::async_trait;
use plughost_kernel::{Row, SqlValue, StoreConnection, StoreError};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow, SqliteValueRef,
};
use sqlx::{Column, ConnectOptions, Row as _, Sqlite, TypeInfo, ValueRef};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{Connector, redact};
use crate::error::ConnectionError;
use crate::settings::DatabaseSettings;

/// Opens [`SqliteStore`]s from `sqlite:` connection strings.
#[derive(Debug, Clone, Default)]
pub struct SqliteConnector;

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(
        &self,
        settings: &DatabaseSettings,
    ) -> Result<Box<dyn StoreConnection>, ConnectionError> {
        let target = redact(&settings.connection_string);
        let open_error = |e: sqlx::Error| ConnectionError::Open {
            target: target.clone(),
            reason: e.to_string(),
        };

        let options = SqliteConnectOptions::from_str(&settings.connection_string)
            .map_err(open_error)?
            .create_if_missing(true);
        let conn = options.connect().await.map_err(open_error)?;

        Ok(Box::new(SqliteStore::new(conn, Handle::current(), target)))
    }
}

/// A single SQLite connection behind the synchronous store contract.
///
/// Statements are driven with [`Handle::block_on`], so methods must be
/// called from a blocking thread (`spawn_blocking`), never from an async
/// task.
pub struct SqliteStore {
    conn: Option<SqliteConnection>,
    runtime: Handle,
    target: String,
}

impl SqliteStore {
    pub fn new(conn: SqliteConnection, runtime: Handle, target: impl Into<String>) -> Self {
        Self {
            conn: Some(conn),
            runtime,
            target: target.into(),
        }
    }

    fn fail(&mut self, err: sqlx::Error) -> StoreError {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                warn!("Connection to {} lost: {}", self.target, err);
                self.conn = None;
                StoreError::Closed
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl StoreConnection for SqliteStore {
    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let conn = self.conn.as_mut().ok_or(StoreError::Closed)?;
        let result = self
            .runtime
            .block_on(bind(sqlx::query(sql), params).execute(&mut *conn));
        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.as_mut().ok_or(StoreError::Closed)?;
        let result = self
            .runtime
            .block_on(bind(sqlx::query(sql), params).fetch_all(&mut *conn));
        match result {
            Ok(rows) => rows.iter().map(convert_row).collect(),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn close(&mut self) {
        // dropping the connection shuts its worker down
        if self.conn.take().is_some() {
            debug!("Closed connection to {}", self.target);
        }
    }
}

fn bind<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

fn convert_row(row: &SqliteRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row
            .try_get_raw(index)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let value = convert_value(row, index, &raw).ok_or_else(|| StoreError::UnsupportedType {
            column: column.name().to_string(),
            column_type: raw.type_info().name().to_string(),
        })?;
        out.push(column.name(), value);
    }
    Ok(out)
}

fn convert_value(row: &SqliteRow, index: usize, raw: &SqliteValueRef<'_>) -> Option<SqlValue> {
    if raw.is_null() {
        return Some(SqlValue::Null);
    }
    // storage class of the value, not the declared column type
    match raw.type_info().name() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(index).ok().map(SqlValue::Integer),
        "REAL" => row.try_get_unchecked::<f64, _>(index).ok().map(SqlValue::Real),
        "TEXT" | "DATETIME" | "DATE" | "TIME" => row
            .try_get_unchecked::<String, _>(index)
            .ok()
            .map(SqlValue::Text),
        _ => None,
    }
}
