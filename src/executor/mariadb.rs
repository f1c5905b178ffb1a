//! MariaDB-family adapter. Autocommit, per-statement `max_execution_time`,
//! and a dedicated database per session (rather than a schema, since MySQL
//! has no cross-database search path).

use super::{split_statements_quote_aware, Executor};
use crate::config::ServerBackendConfig;
use crate::error::{Error, Result};
use crate::types::{QueryResult, ScalarValue};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, Value};
use std::time::Instant;

pub struct MariaDbExecutor {
    config: ServerBackendConfig,
    database: String,
    as_student: bool,
    pool: Option<Pool>,
}

impl MariaDbExecutor {
    pub fn new(config: ServerBackendConfig, database: String) -> Self {
        Self {
            config,
            database,
            as_student: true,
            pool: None,
        }
    }

    pub fn as_admin(mut self) -> Self {
        self.as_student = false;
        self
    }

    fn opts(&self) -> Opts {
        let (user, password) = if self.as_student {
            (self.config.student_user.clone(), self.config.student_password.clone())
        } else {
            (self.config.admin_user.clone(), self.config.admin_password.clone())
        };
        OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(user))
            .pass(Some(password))
            .db_name(Some(self.database.clone()))
            .into()
    }

    fn value_to_scalar(v: &Value) -> ScalarValue {
        match v {
            Value::NULL => ScalarValue::Null,
            Value::Bytes(b) => ScalarValue::Text(String::from_utf8_lossy(b).into_owned()),
            Value::Int(i) => ScalarValue::Int(*i),
            Value::UInt(u) => ScalarValue::Int(*u as i64),
            Value::Float(f) => ScalarValue::Float(*f as f64),
            Value::Double(d) => ScalarValue::Float(*d),
            Value::Date(..) | Value::Time(..) => ScalarValue::Text(v.as_sql(true)),
        }
    }
}

#[async_trait]
impl Executor for MariaDbExecutor {
    async fn connect(&mut self) -> Result<()> {
        let pool = Pool::new(self.opts());
        // Force a connection to surface auth/network failures immediately.
        pool.get_conn()
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(pool) = self.pool.take() {
            let _ = pool.disconnect().await;
        }
    }

    async fn is_connected(&self) -> bool {
        match &self.pool {
            Some(pool) => pool.get_conn().await.is_ok(),
            None => false,
        }
    }

    async fn execute(&mut self, query: &str, timeout_secs: u64) -> Result<QueryResult> {
        if !self.is_connected().await {
            self.connect().await?;
        }
        let Some(pool) = &self.pool else {
            return Err(Error::ConnectionFailed("not connected".into()));
        };
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let _ = conn
            .query_drop(format!("SET max_execution_time = {}", timeout_secs * 1000))
            .await;

        let start = Instant::now();
        let outcome: std::result::Result<Vec<mysql_async::Row>, mysql_async::Error> =
            conn.query(query).await;
        let elapsed = start.elapsed().as_millis() as u64;

        let rows = match outcome {
            Ok(rows) => rows,
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("max_execution_time") || msg.contains("1317") {
                    return Err(Error::Timeout(timeout_secs));
                }
                if msg.contains("syntax") {
                    return Err(Error::SyntaxError(msg));
                }
                return Ok(QueryResult::failure(msg));
            }
        };

        if rows.is_empty() {
            let affected = conn.affected_rows() as usize;
            return Ok(QueryResult::affected(affected, elapsed));
        }

        let columns: Vec<String> = rows[0]
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        let data: Vec<Vec<ScalarValue>> = rows
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| row.as_ref(i).map(Self::value_to_scalar).unwrap_or(ScalarValue::Null))
                    .collect()
            })
            .collect();
        Ok(QueryResult::ok(columns, data, elapsed))
    }

    async fn init_schema(&mut self, schema_text: &str) -> Result<QueryResult> {
        self.run_batch(schema_text).await
    }

    async fn load_seed(&mut self, seed_text: &str) -> Result<QueryResult> {
        self.run_batch(seed_text).await
    }

    async fn reset(&mut self) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        let mut conn = match pool.get_conn().await {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        let _ = conn.query_drop("SET FOREIGN_KEY_CHECKS = 0").await;
        if let Ok(tables) = conn.query::<String, _>("SHOW TABLES").await {
            for table in tables {
                let _ = conn.query_drop(format!("DROP TABLE IF EXISTS `{table}`")).await;
            }
        }
        let _ = conn.query_drop("SET FOREIGN_KEY_CHECKS = 1").await;
        Ok(())
    }
}

impl MariaDbExecutor {
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

/// Creates the per-session database and grants it to both the application
/// admin user and the restricted student user, using the root credential.
pub async fn provision_database(config: &ServerBackendConfig, isolation_id: &str) -> Result<()> {
    let opts: Opts = OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.admin_user.clone()))
        .pass(Some(config.admin_password.clone()))
        .into();
    let pool = Pool::new(opts);
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|e| Error::CreationFailed(e.to_string()))?;
    conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS `{isolation_id}`"))
        .await
        .map_err(|e| Error::CreationFailed(e.to_string()))?;
    for user in [&config.admin_user, &config.student_user] {
        let _ = conn
            .query_drop(format!("GRANT ALL PRIVILEGES ON `{isolation_id}`.* TO '{user}'@'%'"))
            .await;
    }
    let _ = conn.query_drop("FLUSH PRIVILEGES").await;
    let _ = pool.disconnect().await;
    Ok(())
}

pub async fn drop_database(config: &ServerBackendConfig, isolation_id: &str) {
    let opts: Opts = OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.admin_user.clone()))
        .pass(Some(config.admin_password.clone()))
        .into();
    let pool = Pool::new(opts);
    if let Ok(mut conn) = pool.get_conn().await {
        if let Err(e) = conn.query_drop(format!("DROP DATABASE IF EXISTS `{isolation_id}`")).await {
            log::warn!("failed to drop database {isolation_id}: {e}");
        }
    }
    let _ = pool.disconnect().await;
}
