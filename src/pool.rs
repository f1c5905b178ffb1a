//! Sandbox Pool (C3): a thin façade that multiplexes callers onto the
//! Session Manager for session-mode execution, and opens fresh executors
//! for one-shot stateless requests. Tracks per-backend health with a
//! periodic background probe; holds no per-user state itself.

use crate::config::Config;
use crate::error::Result;
use crate::executor::embedded::EmbeddedExecutor;
use crate::executor::mariadb::MariaDbExecutor;
use crate::executor::mongodb::MongoExecutor;
use crate::executor::postgres::PostgresExecutor;
use crate::executor::redis_kv::RedisExecutor;
use crate::executor::Executor;
use crate::session::SessionManager;
use crate::types::{BackendKind, QueryRequest, QueryResult};
use crate::validator;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// `Arc<AtomicBool>` per backend: last known health. The embedded engine
/// is always reported available without probing (it has no network I/O).
pub struct SandboxPool {
    config: Config,
    health: DashMap<BackendKind, Arc<AtomicBool>>,
    pub sessions: Arc<SessionManager>,
}

const PROBED_BACKENDS: [BackendKind; 4] = [
    BackendKind::PostgreSql,
    BackendKind::MariaDb,
    BackendKind::MongoDb,
    BackendKind::Redis,
];

impl SandboxPool {
    pub fn new(config: Config, sessions: Arc<SessionManager>) -> Arc<Self> {
        let health = DashMap::new();
        for kind in PROBED_BACKENDS {
            health.insert(kind, Arc::new(AtomicBool::new(true)));
        }
        Arc::new(Self {
            config,
            health,
            sessions,
        })
    }

    /// Spawns the 60-second health-check loop described in the component
    /// design: attempt a connect+disconnect per backend, record the result.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let interval = Duration::from_secs(pool.config.pool.cleanup_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.run_health_checks().await;
            }
        });
    }

    async fn run_health_checks(&self) {
        for kind in PROBED_BACKENDS {
            let healthy = self.probe(kind).await;
            if let Some(flag) = self.health.get(&kind) {
                let was_healthy = flag.swap(healthy, Ordering::SeqCst);
                if was_healthy != healthy {
                    log::warn!("backend {kind} health changed: now {healthy}");
                }
            }
        }
    }

    async fn probe(&self, kind: BackendKind) -> bool {
        let mut executor = match self.fresh_executor(kind, "sandbox_probe") {
            Ok(e) => e,
            Err(_) => return false,
        };
        let ok = executor.connect().await.is_ok();
        executor.disconnect().await;
        ok
    }

    /// True without probing for the embedded engine; otherwise last known health.
    pub fn is_available(&self, kind: BackendKind) -> bool {
        if kind.is_embedded() {
            return true;
        }
        self.health
            .get(&kind)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn fresh_executor(&self, kind: BackendKind, database: &str) -> Result<Box<dyn Executor>> {
        Ok(match kind {
            BackendKind::Sqlite => Box::new(EmbeddedExecutor::new()),
            BackendKind::PostgreSql => Box::new(PostgresExecutor::new(
                self.config.backends.postgresql.clone(),
                database.to_string(),
            )),
            BackendKind::MariaDb => Box::new(MariaDbExecutor::new(
                self.config.backends.mariadb.clone(),
                database.to_string(),
            )),
            BackendKind::MongoDb => Box::new(MongoExecutor::new(
                self.config.backends.mongodb.clone(),
                database.to_string(),
            )),
            BackendKind::Redis => Box::new(RedisExecutor::new(self.config.backends.redis.clone())),
        })
    }

    /// Validates, then acquires a fresh executor, applies reset + schema +
    /// seed, executes, and releases. Used by the free-form sandbox endpoint
    /// where the caller supplies its own schema/seed on every call.
    pub async fn execute_stateless(&self, request: QueryRequest) -> QueryResult {
        if let Err(blocked) = validator::validate(request.backend_kind, &request.query_text) {
            return QueryResult::failure(blocked.message);
        }

        let timeout = request
            .timeout_seconds
            .min(self.config.pool.max_query_time_seconds);

        let mut executor = match self.fresh_executor(request.backend_kind, "sandbox") {
            Ok(e) => e,
            Err(e) => return QueryResult::failure(e.to_string()),
        };

        if executor.connect().await.is_err() {
            return QueryResult::failure("backend unreachable");
        }

        let _ = executor.reset().await;
        if let Some(schema) = &request.schema_text {
            if let Ok(result) = executor.init_schema(schema).await {
                if !result.success {
                    executor.disconnect().await;
                    return result;
                }
            }
        }
        if let Some(seed) = &request.seed_text {
            if let Ok(result) = executor.load_seed(seed).await {
                if !result.success {
                    executor.disconnect().await;
                    return result;
                }
            }
        }

        let mut result = match executor.execute(&request.query_text, timeout).await {
            Ok(r) => r,
            Err(e) => QueryResult::failure(e.to_string()),
        };
        result.truncate_to(self.config.pool.max_result_rows);
        executor.disconnect().await;
        result
    }

    /// Validates, establishes the session (get-or-create, §4.4.2) and then
    /// runs the §4.4.5 execute protocol against it.
    pub async fn execute_in_session(&self, request: QueryRequest) -> QueryResult {
        if let Err(blocked) = validator::validate(request.backend_kind, &request.query_text) {
            return QueryResult::failure(blocked.message);
        }

        let owning_user_id = request.owning_user_id.clone().unwrap_or_default();
        let Some(session_id) = request.session_id.clone() else {
            return QueryResult::failure("session_id is required for session execution");
        };

        if let Err(e) = self
            .sessions
            .get_or_create(
                &session_id,
                request.backend_kind,
                request.schema_text.as_deref().unwrap_or(""),
                request.seed_text.as_deref().unwrap_or(""),
                &owning_user_id,
            )
            .await
        {
            return QueryResult::failure(match e {
                crate::error::Error::NotOwner => "not the session owner".to_string(),
                crate::error::Error::TooManySessions => "too many sessions".to_string(),
                other => other.to_string(),
            });
        }

        self.sessions.execute(request).await
    }

    pub async fn reset_session(&self, session_id: &str) {
        self.sessions.reset_session(session_id).await;
    }

    pub async fn destroy_session(&self, session_id: &str) {
        self.sessions.destroy(session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemoryMetadataStore;

    fn test_config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn embedded_is_always_available() {
        let config = test_config();
        let store = Arc::new(InMemoryMetadataStore::default());
        let sessions = SessionManager::new(config.clone(), store);
        let pool = SandboxPool::new(config, sessions);
        assert!(pool.is_available(BackendKind::Sqlite));
    }

    #[tokio::test]
    async fn unprobed_backend_defaults_to_last_known_healthy() {
        let config = test_config();
        let store = Arc::new(InMemoryMetadataStore::default());
        let sessions = SessionManager::new(config.clone(), store);
        let pool = SandboxPool::new(config, sessions);
        assert!(pool.is_available(BackendKind::PostgreSql));
    }

    #[tokio::test]
    async fn stateless_execution_runs_schema_seed_and_query() {
        let config = test_config();
        let store = Arc::new(InMemoryMetadataStore::default());
        let sessions = SessionManager::new(config.clone(), store);
        let pool = SandboxPool::new(config, sessions);

        let request = QueryRequest {
            backend_kind: BackendKind::Sqlite,
            query_text: "SELECT SUM(x) FROM t".into(),
            schema_text: Some("CREATE TABLE t(x INT);".into()),
            seed_text: Some("INSERT INTO t VALUES (1), (2);".into()),
            timeout_seconds: 5,
            session_id: None,
            owning_user_id: None,
        };
        let result = pool.execute_stateless(request).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn session_writes_are_isolated_across_two_sessions() {
        let config = test_config();
        let store = Arc::new(InMemoryMetadataStore::default());
        let sessions = SessionManager::new(config.clone(), store);
        let pool = SandboxPool::new(config, sessions);

        let schema = "CREATE TABLE t(x INT);";
        let s1 = QueryRequest {
            backend_kind: BackendKind::Sqlite,
            query_text: "SELECT SUM(x) FROM t".into(),
            schema_text: Some(schema.into()),
            seed_text: Some("INSERT INTO t VALUES (1);".into()),
            timeout_seconds: 5,
            session_id: Some("s1".into()),
            owning_user_id: Some("u1".into()),
        };
        let s2 = QueryRequest {
            backend_kind: BackendKind::Sqlite,
            query_text: "SELECT SUM(x) FROM t".into(),
            schema_text: Some(schema.into()),
            seed_text: Some("INSERT INTO t VALUES (99);".into()),
            timeout_seconds: 5,
            session_id: Some("s2".into()),
            owning_user_id: Some("u2".into()),
        };

        let r1 = pool.execute_in_session(s1).await;
        let r2 = pool.execute_in_session(s2).await;
        assert!(r1.success);
        assert!(r2.success);
        assert_eq!(r1.rows[0][0], crate::types::ScalarValue::Int(1));
        assert_eq!(r2.rows[0][0], crate::types::ScalarValue::Int(99));
    }

    #[tokio::test]
    async fn execute_in_session_rejects_wrong_owner() {
        let config = test_config();
        let store = Arc::new(InMemoryMetadataStore::default());
        let sessions = SessionManager::new(config.clone(), store);
        let pool = SandboxPool::new(config, sessions);

        let create = QueryRequest {
            backend_kind: BackendKind::Sqlite,
            query_text: "SELECT 1".into(),
            schema_text: None,
            seed_text: None,
            timeout_seconds: 5,
            session_id: Some("owned".into()),
            owning_user_id: Some("u1".into()),
        };
        assert!(pool.execute_in_session(create).await.success);

        let intrude = QueryRequest {
            backend_kind: BackendKind::Sqlite,
            query_text: "SELECT 1".into(),
            schema_text: None,
            seed_text: None,
            timeout_seconds: 5,
            session_id: Some("owned".into()),
            owning_user_id: Some("u2".into()),
        };
        let result = pool.execute_in_session(intrude).await;
        assert!(!result.success);
        assert_eq!(result.error_message, "not the session owner");
    }

    #[tokio::test]
    async fn stateless_result_is_truncated_to_max_rows() {
        let mut config = test_config();
        config.pool.max_result_rows = 3;
        let store = Arc::new(InMemoryMetadataStore::default());
        let sessions = SessionManager::new(config.clone(), store);
        let pool = SandboxPool::new(config, sessions);

        let request = QueryRequest {
            backend_kind: BackendKind::Sqlite,
            query_text: "SELECT x FROM t ORDER BY x".into(),
            schema_text: Some("CREATE TABLE t(x INT);".into()),
            seed_text: Some(
                "INSERT INTO t VALUES (1),(2),(3),(4),(5);".into(),
            ),
            timeout_seconds: 5,
            session_id: None,
            owning_user_id: None,
        };
        let result = pool.execute_stateless(request).await;
        assert!(result.success);
        assert_eq!(result.rows.len(), 3);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn stateless_execution_blocks_dangerous_query_without_connecting() {
        let config = test_config();
        let store = Arc::new(InMemoryMetadataStore::default());
        let sessions = SessionManager::new(config.clone(), store);
        let pool = SandboxPool::new(config, sessions);

        let request = QueryRequest {
            backend_kind: BackendKind::PostgreSql,
            query_text: "SELECT pg_read_file('/etc/passwd')".into(),
            schema_text: None,
            seed_text: None,
            timeout_seconds: 5,
            session_id: None,
            owning_user_id: None,
        };
        let result = pool.execute_stateless(request).await;
        assert!(!result.success);
        assert!(result.error_message.contains("Reading server files"));
    }
}
