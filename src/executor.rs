//! Query Executor
//!
//! Runs a `ValidatedQuery` inside a read-only transaction with a server-side
//! statement timeout and a hard row cap. Raw database error text never
//! leaves the process; the API layer surfaces only the sanitized code and
//! summary from `NlqError`.

use crate::error::{NlqError, Result};
use crate::validator::ValidatedQuery;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, query: &ValidatedQuery, timeout: Duration) -> Result<QueryResult>;
}

pub struct PgQueryExecutor {
    pool: PgPool,
    max_rows: u64,
}

impl PgQueryExecutor {
    pub fn new(pool: PgPool, max_rows: u64) -> Self {
        Self { pool, max_rows }
    }
}

#[async_trait]
impl SqlExecutor for PgQueryExecutor {
    async fn execute(&self, query: &ValidatedQuery, timeout: Duration) -> Result<QueryResult> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| NlqError::Execution(e.to_string()))?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| NlqError::Execution(e.to_string()))?;

        // SET does not take bind parameters; the value is a formatted integer.
        let timeout_ms = timeout.as_millis().max(1);
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(|e| NlqError::Execution(e.to_string()))?;

        // The server cancels at statement_timeout; the outer timeout only
        // guards against an unresponsive connection, after which the
        // transaction is dropped and the connection discarded.
        let fetch = sqlx::query(query.sql.as_str()).fetch_all(&mut *tx);
        let rows = match tokio::time::timeout(timeout + Duration::from_secs(2), fetch).await {
            Err(_) => {
                drop(tx);
                return Err(NlqError::QueryTimeout(timeout));
            }
            Ok(Err(e)) => {
                let _ = tx.rollback().await;
                return Err(classify_db_error(e, timeout));
            }
            Ok(Ok(rows)) => rows,
        };

        let _ = tx.rollback().await;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len().min(self.max_rows as usize));
        for row in rows.iter().take(self.max_rows as usize) {
            out.push(decode_row(row));
        }

        info!(
            rows = out.len(),
            tables = ?query.referenced_tables,
            "query executed"
        );
        Ok(QueryResult { columns, rows: out })
    }
}

fn classify_db_error(err: sqlx::Error, timeout: Duration) -> NlqError {
    if let sqlx::Error::Database(ref db_err) = err {
        // 57014: query_canceled, raised when statement_timeout fires.
        if db_err.code().as_deref() == Some("57014") {
            return NlqError::QueryTimeout(timeout);
        }
    }
    error!(error = %err, "query execution failed");
    NlqError::Execution(err.to_string())
}

fn decode_row(row: &PgRow) -> Vec<JsonValue> {
    (0..row.columns().len())
        .map(|i| decode_cell(row, i))
        .collect()
}

fn decode_cell(row: &PgRow, i: usize) -> JsonValue {
    let type_name = row.columns()[i].type_info().name().to_uppercase();
    match type_name.as_str() {
        "INT2" => opt_json(row.try_get::<Option<i16>, _>(i).map(|v| v.map(JsonValue::from))),
        "INT4" => opt_json(row.try_get::<Option<i32>, _>(i).map(|v| v.map(JsonValue::from))),
        "INT8" => opt_json(row.try_get::<Option<i64>, _>(i).map(|v| v.map(JsonValue::from))),
        "FLOAT4" => opt_json(
            row.try_get::<Option<f32>, _>(i)
                .map(|v| v.map(|f| float_json(f as f64))),
        ),
        "FLOAT8" => opt_json(
            row.try_get::<Option<f64>, _>(i)
                .map(|v| v.map(float_json)),
        ),
        "NUMERIC" => opt_json(
            row.try_get::<Option<sqlx::types::BigDecimal>, _>(i)
                .map(|v| v.map(|d| numeric_json(&d.to_string()))),
        ),
        "BOOL" => opt_json(row.try_get::<Option<bool>, _>(i).map(|v| v.map(JsonValue::from))),
        "TIMESTAMP" => opt_json(
            row.try_get::<Option<chrono::NaiveDateTime>, _>(i)
                .map(|v| v.map(|t| JsonValue::String(t.to_string()))),
        ),
        "TIMESTAMPTZ" => opt_json(
            row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                .map(|v| v.map(|t| JsonValue::String(t.to_rfc3339()))),
        ),
        "DATE" => opt_json(
            row.try_get::<Option<chrono::NaiveDate>, _>(i)
                .map(|v| v.map(|t| JsonValue::String(t.to_string()))),
        ),
        "TIME" => opt_json(
            row.try_get::<Option<chrono::NaiveTime>, _>(i)
                .map(|v| v.map(|t| JsonValue::String(t.to_string()))),
        ),
        "UUID" => opt_json(
            row.try_get::<Option<uuid::Uuid>, _>(i)
                .map(|v| v.map(|u| JsonValue::String(u.to_string()))),
        ),
        "JSON" | "JSONB" => opt_json(row.try_get::<Option<JsonValue>, _>(i)),
        _ => opt_json(
            row.try_get::<Option<String>, _>(i)
                .map(|v| v.map(JsonValue::String)),
        ),
    }
}

fn opt_json(value: std::result::Result<Option<JsonValue>, sqlx::Error>) -> JsonValue {
    match value {
        Ok(Some(v)) => v,
        Ok(None) => JsonValue::Null,
        Err(_) => JsonValue::Null,
    }
}

fn float_json(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn numeric_json(repr: &str) -> JsonValue {
    repr.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(repr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_repr_prefers_number() {
        assert_eq!(numeric_json("12.5"), serde_json::json!(12.5));
        // Values that do not fit f64 fall back to their exact text form.
        assert_eq!(
            numeric_json("not-a-number"),
            JsonValue::String("not-a-number".into())
        );
    }

    #[test]
    fn float_json_drops_nan() {
        assert_eq!(float_json(f64::NAN), JsonValue::Null);
        assert_eq!(float_json(2.0), serde_json::json!(2.0));
    }
}
