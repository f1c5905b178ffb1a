//! Session Manager (C4) — the hardest component. Owns the set of live,
//! user-owned sessions: creates them with backend-specific isolation,
//! serializes concurrent queries against the same session without
//! blocking queries on other sessions, enforces ownership and the global
//! concurrency cap, expires idle sessions, and rebuilds them from durable
//! metadata after a process restart.
//!
//! Exactly two lock classes exist: one manager-wide lock over the session
//! table (never held across I/O), and one per-session lock serializing
//! `execute` calls on that session. Collapsing these into a single lock,
//! or using a read-write lock on the table, is wrong — every lookup
//! mutates `last_used_at`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::embedded::EmbeddedExecutor;
use crate::executor::mariadb::{self, MariaDbExecutor};
use crate::executor::mongodb::MongoExecutor;
use crate::executor::postgres::{self, PostgresExecutor};
use crate::executor::redis_kv::RedisExecutor;
use crate::executor::Executor;
use crate::types::{BackendKind, QueryRequest, QueryResult, SessionMetadata};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn fresh_isolation_id() -> String {
    let mut bytes = [0u8; 6];
    for b in bytes.iter_mut() {
        *b = fastrand::u8(..);
    }
    format!("s_{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Durable projection of the session table, external to this process.
/// Keys `session:<id>`, TTL = `SESSION_TTL`, refreshed on every activity.
/// Never stores query history — only what's needed to rebuild.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn save(&self, metadata: &SessionMetadata, ttl: Duration) -> Result<()>;
    async fn load(&self, session_id: &str) -> Result<Option<SessionMetadata>>;
    async fn touch(&self, session_id: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// In-process stand-in for the external KV store, used in tests and as a
/// fallback when no external store is configured.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    entries: Mutex<HashMap<String, (SessionMetadata, SystemTime)>>,
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn save(&self, metadata: &SessionMetadata, ttl: Duration) -> Result<()> {
        let expires_at = SystemTime::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(metadata.session_id.clone(), (metadata.clone(), expires_at));
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(session_id).and_then(|(meta, expires_at)| {
            if *expires_at > SystemTime::now() {
                Some(meta.clone())
            } else {
                None
            }
        }))
    }

    async fn touch(&self, session_id: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(session_id) {
            entry.1 = SystemTime::now() + ttl;
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.entries.lock().await.remove(session_id);
        Ok(())
    }
}

pub(crate) struct Session {
    session_id: String,
    owning_user_id: String,
    backend_kind: BackendKind,
    schema_text: String,
    seed_text: String,
    isolation_id: String,
    executor: Mutex<Box<dyn Executor>>,
    created_at: i64,
    last_used_at: Mutex<i64>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("owning_user_id", &self.owning_user_id)
            .field("backend_kind", &self.backend_kind)
            .field("isolation_id", &self.isolation_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

pub struct SessionManager {
    config: Config,
    table: Mutex<HashMap<String, Arc<Session>>>,
    metadata: Arc<dyn MetadataStore>,
}

impl SessionManager {
    pub fn new(config: Config, metadata: Arc<dyn MetadataStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            table: Mutex::new(HashMap::new()),
            metadata,
        })
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.pool.session_ttl_seconds)
    }

    /// Spawns the expiry ticker: every `CLEANUP_INTERVAL`, collect and
    /// evict sessions idle past `SESSION_TTL`, tearing down resources
    /// outside the manager lock.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(manager.config.pool.cleanup_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        });
    }

    async fn sweep_expired(&self) {
        let ttl_secs = self.config.pool.session_ttl_seconds as i64;
        let expired: Vec<Arc<Session>> = {
            let mut table = self.table.lock().await;
            let now = now_unix();
            let mut expired = Vec::new();
            let ids: Vec<String> = table.keys().cloned().collect();
            for id in ids {
                if let Some(session) = table.get(&id) {
                    let last_used = *session.last_used_at.lock().await;
                    if now - last_used > ttl_secs {
                        if let Some(session) = table.remove(&id) {
                            expired.push(session);
                        }
                    }
                }
            }
            expired
        };

        for session in expired {
            self.teardown(&session).await;
            let _ = self.metadata.delete(&session.session_id).await;
        }
    }

    /// §4.4.2 get-or-create protocol.
    pub(crate) async fn get_or_create(
        &self,
        session_id: &str,
        backend_kind: BackendKind,
        schema_text: &str,
        seed_text: &str,
        owning_user_id: &str,
    ) -> Result<Arc<Session>> {
        let mut stale: Option<Arc<Session>> = None;

        // Step 1: under the manager lock.
        {
            let mut table = self.table.lock().await;
            if let Some(session) = table.get(session_id) {
                if session.backend_kind == backend_kind {
                    if session.owning_user_id != owning_user_id {
                        return Err(Error::NotOwner);
                    }
                    *session.last_used_at.lock().await = now_unix();
                    let session = Arc::clone(session);
                    drop(table);
                    let _ = self.metadata.touch(session_id, self.ttl()).await;
                    return Ok(session);
                }
                stale = table.remove(session_id);
            } else if table.len() >= self.config.pool.max_sessions {
                return Err(Error::TooManySessions);
            }
        }

        // Step 2: outside the lock, tear down any stale entry.
        if let Some(stale) = stale {
            self.teardown(&stale).await;
            let _ = self.metadata.delete(session_id).await;
        }

        // Step 3: attempt rebuild from durable metadata.
        if let Some(metadata) = self.metadata.load(session_id).await? {
            if metadata.backend_kind == backend_kind {
                match self.build_session(session_id, backend_kind, &metadata.schema_text, &metadata.seed_text, &metadata.owning_user_id, Some(metadata.isolation_id.clone())).await {
                    Ok(rebuilt) => {
                        let mut table = self.table.lock().await;
                        if let Some(winner) = table.get(session_id) {
                            let winner = Arc::clone(winner);
                            drop(table);
                            self.teardown(&rebuilt).await;
                            return Ok(winner);
                        }
                        table.insert(session_id.to_string(), Arc::clone(&rebuilt));
                        return Ok(rebuilt);
                    }
                    Err(e) => {
                        log::warn!("rebuild of session {session_id} failed: {e}");
                    }
                }
            }
        }

        // Step 4: outside the lock, create a brand-new session.
        let created = self
            .build_session(session_id, backend_kind, schema_text, seed_text, owning_user_id, None)
            .await?;

        let mut table = self.table.lock().await;
        if table.len() >= self.config.pool.max_sessions && !table.contains_key(session_id) {
            drop(table);
            self.teardown(&created).await;
            return Err(Error::TooManySessions);
        }
        if let Some(winner) = table.get(session_id) {
            let winner = Arc::clone(winner);
            drop(table);
            self.teardown(&created).await;
            return Ok(winner);
        }
        table.insert(session_id.to_string(), Arc::clone(&created));
        drop(table);

        let metadata = SessionMetadata {
            session_id: session_id.to_string(),
            backend_kind,
            schema_text: schema_text.to_string(),
            seed_text: seed_text.to_string(),
            isolation_id: created.isolation_id.clone(),
            created_at_unix: created.created_at,
            owning_user_id: owning_user_id.to_string(),
        };
        let _ = self.metadata.save(&metadata, self.ttl()).await;

        Ok(created)
    }

    /// Backend-specific isolation setup (§4.4.3). `reuse_isolation_id` is
    /// set only during rebuild, where the original isolation id is reused
    /// rather than regenerated.
    async fn build_session(
        &self,
        session_id: &str,
        backend_kind: BackendKind,
        schema_text: &str,
        seed_text: &str,
        owning_user_id: &str,
        reuse_isolation_id: Option<String>,
    ) -> Result<Arc<Session>> {
        let isolation_id = reuse_isolation_id.unwrap_or_else(fresh_isolation_id);
        let executor = self
            .create_isolated_executor(backend_kind, &isolation_id, schema_text, seed_text)
            .await?;

        Ok(Arc::new(Session {
            session_id: session_id.to_string(),
            owning_user_id: owning_user_id.to_string(),
            backend_kind,
            schema_text: schema_text.to_string(),
            seed_text: seed_text.to_string(),
            isolation_id,
            executor: Mutex::new(executor),
            created_at: now_unix(),
            last_used_at: Mutex::new(now_unix()),
        }))
    }

    async fn create_isolated_executor(
        &self,
        backend_kind: BackendKind,
        isolation_id: &str,
        schema_text: &str,
        seed_text: &str,
    ) -> Result<Box<dyn Executor>> {
        // MariaDB applies schema/seed over a short-lived admin connection
        // before handing the session a student connection (§4.4.3); every
        // other backend applies schema/seed directly on the returned
        // executor, so it follows the shared `initialize` path below.
        if backend_kind == BackendKind::MariaDb {
            mariadb::provision_database(&self.config.backends.mariadb, isolation_id).await?;
            if let Err(e) = self.apply_mariadb_as_admin(isolation_id, schema_text, seed_text).await {
                self.drop_isolation_object(backend_kind, isolation_id).await;
                return Err(e);
            }
            let mut executor: Box<dyn Executor> = Box::new(MariaDbExecutor::new(
                self.config.backends.mariadb.clone(),
                isolation_id.to_string(),
            ));
            if let Err(e) = executor.connect().await {
                self.drop_isolation_object(backend_kind, isolation_id).await;
                return Err(Error::CreationFailed(e.to_string()));
            }
            return Ok(executor);
        }

        let mut executor: Box<dyn Executor> = match backend_kind {
            BackendKind::Sqlite => Box::new(EmbeddedExecutor::new()),
            BackendKind::PostgreSql => {
                postgres::provision_schema(&self.config.backends.postgresql, "sandbox", isolation_id).await?;
                Box::new(
                    PostgresExecutor::new(self.config.backends.postgresql.clone(), "sandbox".to_string())
                        .with_isolation(isolation_id),
                )
            }
            BackendKind::MariaDb => unreachable!("handled above"),
            BackendKind::MongoDb => Box::new(MongoExecutor::new(
                self.config.backends.mongodb.clone(),
                isolation_id.to_string(),
            )),
            BackendKind::Redis => Box::new(
                RedisExecutor::new(self.config.backends.redis.clone()).with_key_prefix(isolation_id),
            ),
        };

        if let Err(e) = self.initialize(executor.as_mut(), backend_kind, isolation_id, schema_text, seed_text).await {
            executor.disconnect().await;
            self.drop_isolation_object(backend_kind, isolation_id).await;
            return Err(e);
        }

        Ok(executor)
    }

    /// Opens an admin connection into the freshly created database, applies
    /// schema and seed, and closes it. The session itself only ever holds
    /// the restricted student connection.
    async fn apply_mariadb_as_admin(&self, isolation_id: &str, schema_text: &str, seed_text: &str) -> Result<()> {
        let mut admin: Box<dyn Executor> = Box::new(
            MariaDbExecutor::new(self.config.backends.mariadb.clone(), isolation_id.to_string()).as_admin(),
        );
        admin.connect().await.map_err(|e| Error::CreationFailed(e.to_string()))?;

        if !schema_text.trim().is_empty() {
            let result = admin.init_schema(schema_text).await?;
            if !result.success {
                admin.disconnect().await;
                return Err(Error::CreationFailed(result.error_message));
            }
        }
        if !seed_text.trim().is_empty() {
            let result = admin.load_seed(seed_text).await?;
            if !result.success {
                admin.disconnect().await;
                return Err(Error::CreationFailed(result.error_message));
            }
        }
        admin.disconnect().await;
        Ok(())
    }

    async fn initialize(
        &self,
        executor: &mut dyn Executor,
        _backend_kind: BackendKind,
        _isolation_id: &str,
        schema_text: &str,
        seed_text: &str,
    ) -> Result<()> {
        executor
            .connect()
            .await
            .map_err(|e| Error::CreationFailed(e.to_string()))?;
        if !schema_text.trim().is_empty() {
            let result = executor.init_schema(schema_text).await?;
            if !result.success {
                return Err(Error::CreationFailed(result.error_message));
            }
        }
        if !seed_text.trim().is_empty() {
            let result = executor.load_seed(seed_text).await?;
            if !result.success {
                return Err(Error::CreationFailed(result.error_message));
            }
        }
        Ok(())
    }

    async fn drop_isolation_object(&self, backend_kind: BackendKind, isolation_id: &str) {
        match backend_kind {
            BackendKind::Sqlite => {}
            BackendKind::PostgreSql => {
                postgres::drop_schema(&self.config.backends.postgresql, "sandbox", isolation_id).await
            }
            BackendKind::MariaDb => mariadb::drop_database(&self.config.backends.mariadb, isolation_id).await,
            BackendKind::MongoDb => {
                let mut executor = MongoExecutor::new(self.config.backends.mongodb.clone(), isolation_id.to_string());
                if executor.connect().await.is_ok() {
                    let _ = executor.reset().await;
                }
            }
            BackendKind::Redis => {
                let mut executor =
                    RedisExecutor::new(self.config.backends.redis.clone()).with_key_prefix(isolation_id);
                if executor.connect().await.is_ok() {
                    let _ = executor.reset().await;
                }
            }
        }
    }

    async fn teardown(&self, session: &Session) {
        {
            let mut executor = session.executor.lock().await;
            executor.disconnect().await;
        }
        self.drop_isolation_object(session.backend_kind, &session.isolation_id).await;
    }

    /// §4.4.5 execute protocol. Assumes the session already exists — the
    /// pool facade calls `get_or_create` first on every session-mode
    /// request, so this only has to handle the lookup-vanished race.
    pub async fn execute(&self, request: QueryRequest) -> QueryResult {
        let Some(session_id) = &request.session_id else {
            return QueryResult::failure("session_id is required for session execution");
        };
        let owning_user_id = request.owning_user_id.clone().unwrap_or_default();

        let session = {
            let table = self.table.lock().await;
            match table.get(session_id) {
                None => return QueryResult::failure("SESSION_EXPIRED"),
                Some(session) => {
                    if session.owning_user_id != owning_user_id {
                        return QueryResult::failure("SESSION_EXPIRED");
                    }
                    Arc::clone(session)
                }
            }
        };
        *session.last_used_at.lock().await = now_unix();
        let _ = self.metadata.touch(session_id, self.ttl()).await;

        let timeout = request
            .timeout_seconds
            .min(self.config.pool.max_query_time_seconds);

        let mut executor = session.executor.lock().await;
        if !executor.is_connected().await {
            if executor.connect().await.is_err() {
                return QueryResult::failure("failed to reconnect to session backend");
            }
        }

        match executor.execute(&request.query_text, timeout).await {
            Ok(mut result) => {
                result.truncate_to(self.config.pool.max_result_rows);
                result
            }
            Err(e) => QueryResult::failure(e.to_string()),
        }
    }

    /// No-op success if the session does not exist.
    pub async fn reset_session(&self, session_id: &str) {
        let session = {
            let table = self.table.lock().await;
            table.get(session_id).cloned()
        };
        let Some(session) = session else {
            return;
        };
        let mut executor = session.executor.lock().await;
        let _ = executor.reset().await;
        if !session.schema_text.trim().is_empty() {
            let _ = executor.init_schema(&session.schema_text).await;
        }
        if !session.seed_text.trim().is_empty() {
            let _ = executor.load_seed(&session.seed_text).await;
        }
    }

    pub async fn destroy(&self, session_id: &str) {
        let session = {
            let mut table = self.table.lock().await;
            table.remove(session_id)
        };
        if let Some(session) = session {
            self.teardown(&session).await;
            let _ = self.metadata.delete(session_id).await;
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut c = Config::default();
        c.pool.max_sessions = 2;
        c.pool.session_ttl_seconds = 1;
        c
    }

    #[tokio::test]
    async fn first_owner_wins_on_racing_create() {
        let manager = SessionManager::new(config(), Arc::new(InMemoryMetadataStore::default()));
        let a = manager
            .get_or_create("s1", BackendKind::Sqlite, "CREATE TABLE t(x INT);", "", "u1")
            .await
            .unwrap();
        let err = manager
            .get_or_create("s1", BackendKind::Sqlite, "", "", "u2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotOwner));
        assert_eq!(a.owning_user_id, "u1");
    }

    #[tokio::test]
    async fn same_owner_reuses_existing_session() {
        let manager = SessionManager::new(config(), Arc::new(InMemoryMetadataStore::default()));
        let a = manager
            .get_or_create("s1", BackendKind::Sqlite, "CREATE TABLE t(x INT);", "", "u1")
            .await
            .unwrap();
        let b = manager
            .get_or_create("s1", BackendKind::Sqlite, "CREATE TABLE t(x INT);", "", "u1")
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn too_many_sessions_is_rejected() {
        let manager = SessionManager::new(config(), Arc::new(InMemoryMetadataStore::default()));
        manager
            .get_or_create("s1", BackendKind::Sqlite, "", "", "u1")
            .await
            .unwrap();
        manager
            .get_or_create("s2", BackendKind::Sqlite, "", "", "u1")
            .await
            .unwrap();
        let err = manager
            .get_or_create("s3", BackendKind::Sqlite, "", "", "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManySessions));
    }

    #[tokio::test]
    async fn execute_reports_session_expired_for_unknown_id() {
        let manager = SessionManager::new(config(), Arc::new(InMemoryMetadataStore::default()));
        let request = QueryRequest {
            backend_kind: BackendKind::Sqlite,
            query_text: "SELECT 1".into(),
            schema_text: None,
            seed_text: None,
            timeout_seconds: 5,
            session_id: Some("missing".into()),
            owning_user_id: Some("u1".into()),
        };
        let result = manager.execute(request).await;
        assert!(!result.success);
        assert_eq!(result.error_message, "SESSION_EXPIRED");
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_frees_capacity() {
        let manager = SessionManager::new(config(), Arc::new(InMemoryMetadataStore::default()));
        manager
            .get_or_create("s1", BackendKind::Sqlite, "", "", "u1")
            .await
            .unwrap();
        manager.destroy("s1").await;
        manager.destroy("s1").await;
        assert_eq!(manager.len().await, 0);
    }

    #[tokio::test]
    async fn reset_on_missing_session_is_a_no_op_success() {
        let manager = SessionManager::new(config(), Arc::new(InMemoryMetadataStore::default()));
        manager.reset_session("does-not-exist").await;
    }

    #[tokio::test]
    async fn rebuild_recreates_session_from_durable_metadata() {
        let store = Arc::new(InMemoryMetadataStore::default());
        let manager = SessionManager::new(config(), store.clone());
        manager
            .get_or_create(
                "s1",
                BackendKind::Sqlite,
                "CREATE TABLE t(x INT);",
                "INSERT INTO t VALUES (1), (2), (3);",
                "u1",
            )
            .await
            .unwrap();

        // Simulate a process crash: drop the in-memory table but keep
        // durable metadata.
        manager.table.lock().await.clear();

        let rebuilt = manager
            .get_or_create("s1", BackendKind::Sqlite, "", "", "u1")
            .await
            .unwrap();
        let mut executor = rebuilt.executor.lock().await;
        let result = executor.execute("SELECT COUNT(*) FROM t", 5).await.unwrap();
        assert!(result.success);
    }
}
