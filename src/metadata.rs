//! External durable metadata store: a Redis-backed `MetadataStore`
//! implementation. Used only for rebuild after a crash — never as the
//! source of truth for user data, and never stores query history.

use crate::error::{Error, Result};
use crate::session::MetadataStore;
use crate::types::SessionMetadata;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;

fn key_for(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub struct RedisMetadataStore {
    conn: Mutex<MultiplexedConnection>,
}

impl RedisMetadataStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Metadata(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Metadata(e.to_string()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    async fn save(&self, metadata: &SessionMetadata, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(metadata)?;
        let mut conn = self.conn.lock().await;
        conn.set_ex(key_for(&metadata.session_id), payload, ttl.as_secs())
            .await
            .map_err(|e| Error::Metadata(e.to_string()))
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        let mut conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .get(key_for(session_id))
            .await
            .map_err(|e| Error::Metadata(e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn touch(&self, session_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: std::result::Result<bool, _> = conn.expire(key_for(session_id), ttl.as_secs() as i64).await;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: std::result::Result<i64, _> = conn.del(key_for(session_id)).await;
        Ok(())
    }
}
