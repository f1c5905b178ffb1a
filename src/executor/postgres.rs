//! PostgreSQL-family adapter. Autocommit isolation, statement-timeout
//! fallback, and schema-per-session isolation via `search_path`.

use super::{split_statements_quote_aware, Executor};
use crate::config::ServerBackendConfig;
use crate::error::{Error, Result};
use crate::types::{QueryResult, ScalarValue};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls};

pub struct PostgresExecutor {
    config: ServerBackendConfig,
    database: String,
    /// Schema this session is isolated to; `SET search_path` is re-applied
    /// on every reconnect.
    isolation_id: Option<String>,
    as_student: bool,
    client: Option<Client>,
}

impl PostgresExecutor {
    pub fn new(config: ServerBackendConfig, database: String) -> Self {
        Self {
            config,
            database,
            isolation_id: None,
            as_student: true,
            client: None,
        }
    }

    /// Same executor, but connecting with the administrative role (used
    /// only during session setup to create the schema and grant privileges).
    pub fn as_admin(mut self) -> Self {
        self.as_student = false;
        self
    }

    pub fn with_isolation(mut self, isolation_id: impl Into<String>) -> Self {
        self.isolation_id = Some(isolation_id.into());
        self
    }

    fn connection_string(&self) -> String {
        let (user, password) = if self.as_student {
            (&self.config.student_user, &self.config.student_password)
        } else {
            (&self.config.admin_user, &self.config.admin_password)
        };
        format!(
            "host={} port={} user={} password={} dbname={} connect_timeout={}",
            self.config.host,
            self.config.port,
            user,
            password,
            self.database,
            self.config.connect_timeout_seconds,
        )
    }

    async fn apply_search_path(&self) -> Result<()> {
        if let (Some(client), Some(isolation_id)) = (&self.client, &self.isolation_id) {
            client
                .batch_execute(&format!("SET search_path TO \"{isolation_id}\""))
                .await
                .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn row_to_scalars(row: &tokio_postgres::Row) -> Vec<ScalarValue> {
        row.columns()
            .iter()
            .enumerate()
            .map(|(i, col)| match *col.type_() {
                Type::INT2 | Type::INT4 | Type::INT8 => row
                    .try_get::<_, Option<i64>>(i)
                    .ok()
                    .flatten()
                    .map(ScalarValue::Int)
                    .unwrap_or(ScalarValue::Null),
                Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => row
                    .try_get::<_, Option<f64>>(i)
                    .ok()
                    .flatten()
                    .map(ScalarValue::Float)
                    .unwrap_or(ScalarValue::Null),
                Type::BOOL => row
                    .try_get::<_, Option<bool>>(i)
                    .ok()
                    .flatten()
                    .map(ScalarValue::Bool)
                    .unwrap_or(ScalarValue::Null),
                Type::TIMESTAMP | Type::TIMESTAMPTZ => row
                    .try_get::<_, Option<chrono::NaiveDateTime>>(i)
                    .ok()
                    .flatten()
                    .map(|t| ScalarValue::Text(t.to_string()))
                    .unwrap_or(ScalarValue::Null),
                _ => row
                    .try_get::<_, Option<String>>(i)
                    .ok()
                    .flatten()
                    .map(ScalarValue::Text)
                    .unwrap_or(ScalarValue::Null),
            })
            .collect()
    }
}

#[async_trait]
impl Executor for PostgresExecutor {
    async fn connect(&mut self) -> Result<()> {
        let (client, connection) = tokio_postgres::connect(&self.connection_string(), NoTls)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::warn!("postgres connection task ended: {e}");
            }
        });
        self.client = Some(client);
        self.apply_search_path().await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    async fn is_connected(&self) -> bool {
        match &self.client {
            Some(client) => client.simple_query("SELECT 1").await.is_ok(),
            None => false,
        }
    }

    async fn execute(&mut self, query: &str, timeout_secs: u64) -> Result<QueryResult> {
        if !self.is_connected().await {
            // One reconnect attempt, re-applying search_path per the
            // session execute protocol.
            self.connect().await?;
        }
        let Some(client) = &self.client else {
            return Err(Error::ConnectionFailed("not connected".into()));
        };

        // Role-level statement_timeout takes precedence; this per-connection
        // fallback only matters when the restricted role wasn't configured
        // with one.
        let _ = client
            .batch_execute(&format!("SET statement_timeout = {}", timeout_secs * 1000))
            .await;

        let start = Instant::now();
        let fut = client.query(query, &[]);
        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await;

        let rows = match outcome {
            Err(_) => return Err(Error::Timeout(timeout_secs)),
            Ok(Err(e)) => {
                let msg = e.to_string();
                if msg.contains("syntax error") {
                    return Err(Error::SyntaxError(msg));
                }
                return Ok(QueryResult::failure(msg));
            }
            Ok(Ok(rows)) => rows,
        };

        let elapsed = start.elapsed().as_millis() as u64;
        if rows.is_empty() {
            return Ok(QueryResult::affected(0, elapsed));
        }
        let columns: Vec<String> = rows[0].columns().iter().map(|c| c.name().to_string()).collect();
        let data: Vec<Vec<ScalarValue>> = rows.iter().map(Self::row_to_scalars).collect();
        Ok(QueryResult::ok(columns, data, elapsed))
    }

    async fn init_schema(&mut self, schema_text: &str) -> Result<QueryResult> {
        self.run_batch(schema_text).await
    }

    async fn load_seed(&mut self, seed_text: &str) -> Result<QueryResult> {
        self.run_batch(seed_text).await
    }

    async fn reset(&mut self) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let _ = client
            .batch_execute(
                "DO $$ DECLARE r RECORD; BEGIN \
                 FOR r IN (SELECT tablename FROM pg_tables WHERE schemaname = current_schema()) LOOP \
                   EXECUTE 'DROP TABLE IF EXISTS ' || quote_ident(r.tablename) || ' CASCADE'; \
                 END LOOP; END $$;",
            )
            .await;
        Ok(())
    }
}

impl PostgresExecutor {
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

/// Creates the per-session schema and grants it to the restricted student
/// role, using an administrative connection.
pub async fn provision_schema(
    config: &ServerBackendConfig,
    database: &str,
    isolation_id: &str,
) -> Result<()> {
    let mut admin = PostgresExecutor::new(config.clone(), database.to_string()).as_admin();
    admin.connect().await?;
    let client = admin.client.as_ref().expect("just connected");
    client
        .batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS \"{isolation_id}\"; \
             GRANT ALL ON SCHEMA \"{isolation_id}\" TO \"{student}\"; \
             ALTER DEFAULT PRIVILEGES IN SCHEMA \"{isolation_id}\" GRANT ALL ON TABLES TO \"{student}\"; \
             ALTER DEFAULT PRIVILEGES IN SCHEMA \"{isolation_id}\" GRANT ALL ON SEQUENCES TO \"{student}\";",
            isolation_id = isolation_id,
            student = config.student_user,
        ))
        .await
        .map_err(|e| Error::CreationFailed(e.to_string()))?;
    admin.disconnect().await;
    Ok(())
}

/// Drops the per-session schema, cascading everything it owns. Best-effort.
pub async fn drop_schema(config: &ServerBackendConfig, database: &str, isolation_id: &str) {
    let mut admin = PostgresExecutor::new(config.clone(), database.to_string()).as_admin();
    if admin.connect().await.is_ok() {
        if let Some(client) = &admin.client {
            if let Err(e) = client
                .batch_execute(&format!("DROP SCHEMA IF EXISTS \"{isolation_id}\" CASCADE"))
                .await
            {
                log::warn!("failed to drop schema {isolation_id}: {e}");
            }
        }
        admin.disconnect().await;
    }
}
