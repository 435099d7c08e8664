//! Opening a fresh handle inside a worker and running statements on it.
//!
//! Handles are never shared: each unit of work opens one here and closes it
//! when done.

use crate::config::ConnectSettings;
use crate::db::credentials::{Credentials, DatabaseKind};
use crate::db::value::{Row, Value};
use crate::error::{DatabaseError, IsRetryable};
use crate::types::unit::Statement;
use backon::{ExponentialBuilder, Retryable};
use sqlx::AnyConnection;
use sqlx::any::{Any, AnyArguments, AnyQueryResult, AnyRow};
use sqlx::query::Query;
use sqlx::{Column as _, Connection as _, Row as _, TypeInfo as _, ValueRef as _};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, warn};

static DRIVERS: Once = Once::new();

fn retry_policy(settings: &ConnectSettings) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(settings.min_delay_ms))
        .with_max_delay(Duration::from_millis(settings.max_delay_ms))
        .with_max_times(settings.max_retries)
        .with_jitter()
}

pub(crate) async fn open(
    credentials: &Credentials,
    settings: &ConnectSettings,
) -> Result<AnyConnection, DatabaseError> {
    DRIVERS.call_once(sqlx::any::install_default_drivers);

    let url = credentials
        .connection_url()
        .map_err(|e| DatabaseError::new(e.to_string()))?;

    if let Credentials::Sqlite { path } = credentials
        && let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DatabaseError::new(format!(
                "failed to create data directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    (|| async { AnyConnection::connect(&url).await })
        .retry(retry_policy(settings))
        .when(|e: &sqlx::Error| e.is_retryable())
        .notify(|err, dur: Duration| {
            warn!(kind = %credentials.kind(), "connect retrying after error {}, sleeping {:?}", err, dur);
        })
        .await
        .map_err(DatabaseError::from)
}

pub(crate) async fn close(conn: AnyConnection) {
    if let Err(e) = conn.close().await {
        debug!(error = %e, "closing handle failed");
    }
}

fn bind<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Blob(b) => query.bind(b.clone()),
            Value::Json(j) => query.bind(j.to_string()),
        };
    }
    query
}

pub(crate) async fn execute(
    conn: &mut AnyConnection,
    stmt: &Statement,
) -> Result<AnyQueryResult, DatabaseError> {
    bind(sqlx::query(&stmt.sql), &stmt.params)
        .execute(&mut *conn)
        .await
        .map_err(|e| DatabaseError::from_sqlx(&e, Some(&stmt.sql)))
}

pub(crate) async fn fetch(
    conn: &mut AnyConnection,
    stmt: &Statement,
) -> Result<Vec<Row>, DatabaseError> {
    let rows = bind(sqlx::query(&stmt.sql), &stmt.params)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| DatabaseError::from_sqlx(&e, Some(&stmt.sql)))?;
    rows.iter()
        .map(decode_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DatabaseError::from_sqlx(&e, Some(&stmt.sql)))
}

fn decode_row(row: &AnyRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name(), decode_value(row, idx)?);
    }
    Ok(out)
}

fn decode_value(row: &AnyRow, idx: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get(idx)?),
        "SMALLINT" => Value::Int(row.try_get::<i16, _>(idx)?.into()),
        "INTEGER" => Value::Int(row.try_get::<i32, _>(idx)?.into()),
        "BIGINT" => Value::Int(row.try_get(idx)?),
        "REAL" => Value::Float(row.try_get::<f32, _>(idx)?.into()),
        "DOUBLE" => Value::Float(row.try_get(idx)?),
        "BLOB" => Value::Blob(row.try_get(idx)?),
        "TEXT" => Value::Text(row.try_get(idx)?),
        _ => row
            .try_get::<String, _>(idx)
            .map(Value::Text)
            .or_else(|_| row.try_get::<i64, _>(idx).map(Value::Int))
            .or_else(|_| row.try_get::<f64, _>(idx).map(Value::Float))
            .or_else(|_| row.try_get::<Vec<u8>, _>(idx).map(Value::Blob))?,
    };
    Ok(value)
}

/// Key generated by the last insert on this handle. Used when the driver
/// does not report it with the insert's result.
pub(crate) async fn generated_key(
    conn: &mut AnyConnection,
    kind: DatabaseKind,
) -> Result<Option<i64>, DatabaseError> {
    let sql = match kind {
        DatabaseKind::Sqlite => "SELECT last_insert_rowid() AS id",
        DatabaseKind::MySql => "SELECT LAST_INSERT_ID() AS id",
    };
    let rows = fetch(conn, &Statement::raw(sql)).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("id"))
        .and_then(|id| id.as_i64())
        .filter(|id| *id != 0))
}

/// Statement listing the live column names of `table` in a `name` column.
pub(crate) fn introspection_sql(kind: DatabaseKind, table: &str) -> Statement {
    match kind {
        DatabaseKind::Sqlite => Statement::with_params(
            "SELECT name FROM pragma_table_info(?) ORDER BY cid",
            vec![Value::from(table)],
        ),
        DatabaseKind::MySql => Statement::with_params(
            "SELECT COLUMN_NAME AS name FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            vec![Value::from(table)],
        ),
    }
}
