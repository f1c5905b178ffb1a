//! Embedded in-process SQL engine adapter. Each executor opens a private
//! in-memory database that dies with the process — isolation is automatic
//! because no state is shared across connections.

use super::{split_statements_quote_aware, Executor};
use crate::error::{Error, Result};
use crate::types::{QueryResult, ScalarValue};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::sync::Mutex;
use std::time::Instant;
use tokio::task;

pub struct EmbeddedExecutor {
    conn: Mutex<Option<Connection>>,
}

impl EmbeddedExecutor {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }
}

impl Default for EmbeddedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn value_from_ref(v: ValueRef<'_>) -> ScalarValue {
    match v {
        ValueRef::Null => ScalarValue::Null,
        ValueRef::Integer(i) => ScalarValue::Int(i),
        ValueRef::Real(f) => ScalarValue::Float(f),
        ValueRef::Text(t) => ScalarValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => ScalarValue::Text(format!("<{} bytes>", b.len())),
    }
}

fn run_statement(conn: &Connection, statement: &str) -> rusqlite::Result<QueryResult> {
    let start = Instant::now();
    let mut stmt = conn.prepare(statement)?;
    if stmt.column_count() == 0 {
        let affected = stmt.execute([])?;
        return Ok(QueryResult::affected(
            affected,
            start.elapsed().as_millis() as u64,
        ));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows_out = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(value_from_ref(row.get_ref(i)?));
        }
        rows_out.push(values);
    }
    Ok(QueryResult::ok(
        columns,
        rows_out,
        start.elapsed().as_millis() as u64,
    ))
}

#[async_trait]
impl Executor for EmbeddedExecutor {
    async fn connect(&mut self) -> Result<()> {
        let conn = task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        *self.conn.lock().unwrap() = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) {
        *self.conn.lock().unwrap() = None;
    }

    async fn is_connected(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }

    async fn execute(&mut self, query: &str, _timeout_secs: u64) -> Result<QueryResult> {
        let Some(conn) = self.conn.lock().unwrap().take() else {
            return Err(Error::ConnectionFailed("not connected".into()));
        };
        let query = query.to_string();
        let (conn, result) = task::spawn_blocking(move || {
            let result = run_statement(&conn, &query);
            (conn, result)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;
        *self.conn.lock().unwrap() = Some(conn);

        match result {
            Ok(r) => Ok(r),
            Err(rusqlite::Error::SqliteFailure(_, Some(msg))) => {
                Ok(QueryResult::failure(msg))
            }
            Err(e) => Ok(QueryResult::failure(e.to_string())),
        }
    }

    async fn init_schema(&mut self, schema_text: &str) -> Result<QueryResult> {
        self.run_batch(schema_text).await
    }

    async fn load_seed(&mut self, seed_text: &str) -> Result<QueryResult> {
        self.run_batch(seed_text).await
    }

    async fn reset(&mut self) -> Result<()> {
        // A fresh in-memory database is cheaper and safer than dropping
        // every user object individually.
        self.connect().await
    }
}

impl EmbeddedExecutor {
    async fn run_batch(&mut self, text: &str) -> Result<QueryResult> {
        if text.trim().is_empty() {
            return Ok(QueryResult {
                success: true,
                ..Default::default()
            });
        }
        for statement in split_statements_quote_aware(text) {
            let result = self.execute(&statement, 30).await?;
            if !result.success {
                return Ok(QueryResult::failure(format!(
                    "batch failed on `{statement}`: {}",
                    result.error_message
                )));
            }
        }
        Ok(QueryResult {
            success: true,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inserts_are_isolated_per_executor() {
        let mut a = EmbeddedExecutor::new();
        a.connect().await.unwrap();
        a.init_schema("CREATE TABLE t(x INT);").await.unwrap();
        a.load_seed("INSERT INTO t VALUES (1);").await.unwrap();

        let mut b = EmbeddedExecutor::new();
        b.connect().await.unwrap();
        b.init_schema("CREATE TABLE t(x INT);").await.unwrap();
        b.load_seed("INSERT INTO t VALUES (99);").await.unwrap();

        let sum_a = a.execute("SELECT SUM(x) FROM t", 5).await.unwrap();
        let sum_b = b.execute("SELECT SUM(x) FROM t", 5).await.unwrap();

        assert_eq!(sum_a.rows[0][0], ScalarValue::Int(1));
        assert_eq!(sum_b.rows[0][0], ScalarValue::Int(99));
    }

    #[tokio::test]
    async fn syntax_error_surfaces_as_failed_result_not_propagated() {
        let mut e = EmbeddedExecutor::new();
        e.connect().await.unwrap();
        let result = e.execute("SELEKT 1", 5).await.unwrap();
        assert!(!result.success);
    }
}
