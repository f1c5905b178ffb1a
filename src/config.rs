use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Top-level configuration for the sandbox execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub backends: BackendsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard cap on the number of live sessions.
    pub max_sessions: usize,
    /// Seconds of inactivity after which a session is reclaimed.
    pub session_ttl_seconds: u64,
    /// How often the expiry ticker and pool health-check run.
    pub cleanup_interval_seconds: u64,
    /// Upper bound a per-request timeout is clamped to.
    pub max_query_time_seconds: u64,
    /// Hard cap on rows returned from a single query.
    pub max_result_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    pub postgresql: ServerBackendConfig,
    pub mariadb: ServerBackendConfig,
    pub mongodb: ServerBackendConfig,
    pub redis: ServerBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBackendConfig {
    pub host: String,
    pub port: u16,
    /// Administrative/root credential used to create per-session isolation objects.
    pub admin_user: String,
    pub admin_password: String,
    /// Restricted credential sessions actually connect as.
    pub student_user: String,
    pub student_password: String,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub structured: bool,
    pub file_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig {
                max_sessions: 500,
                session_ttl_seconds: 15 * 60,
                cleanup_interval_seconds: 60,
                max_query_time_seconds: 10,
                max_result_rows: 1000,
            },
            backends: BackendsConfig {
                postgresql: ServerBackendConfig {
                    host: "127.0.0.1".into(),
                    port: 5432,
                    admin_user: "sandbox_admin".into(),
                    admin_password: "sandbox_admin".into(),
                    student_user: "sandbox_student".into(),
                    student_password: "sandbox_student".into(),
                    connect_timeout_seconds: 10,
                },
                mariadb: ServerBackendConfig {
                    host: "127.0.0.1".into(),
                    port: 3306,
                    admin_user: "root".into(),
                    admin_password: "root".into(),
                    student_user: "sandbox_student".into(),
                    student_password: "sandbox_student".into(),
                    connect_timeout_seconds: 10,
                },
                mongodb: ServerBackendConfig {
                    host: "127.0.0.1".into(),
                    port: 27017,
                    admin_user: String::new(),
                    admin_password: String::new(),
                    student_user: String::new(),
                    student_password: String::new(),
                    connect_timeout_seconds: 10,
                },
                redis: ServerBackendConfig {
                    host: "127.0.0.1".into(),
                    port: 6379,
                    admin_user: String::new(),
                    admin_password: String::new(),
                    student_user: String::new(),
                    student_password: String::new(),
                    connect_timeout_seconds: 10,
                },
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                structured: false,
                file_path: None,
            },
        }
    }
}

impl Config {
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_sessions == 0 {
            return Err(anyhow::anyhow!("pool.max_sessions must be greater than zero"));
        }
        if self.pool.session_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("pool.session_ttl_seconds must be greater than zero"));
        }
        if self.pool.max_query_time_seconds == 0 {
            return Err(anyhow::anyhow!(
                "pool.max_query_time_seconds must be greater than zero"
            ));
        }
        if self.pool.max_result_rows == 0 {
            return Err(anyhow::anyhow!("pool.max_result_rows must be greater than zero"));
        }
        Ok(())
    }

    pub fn as_env_vars(&self) -> Vec<(String, String)> {
        vec![
            (
                "SANDBOX_MAX_SESSIONS".to_string(),
                self.pool.max_sessions.to_string(),
            ),
            (
                "SANDBOX_SESSION_TTL_SECONDS".to_string(),
                self.pool.session_ttl_seconds.to_string(),
            ),
            (
                "SANDBOX_MAX_QUERY_TIME_SECONDS".to_string(),
                self.pool.max_query_time_seconds.to_string(),
            ),
            ("LOG_LEVEL".to_string(), self.logging.level.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_sessions, 500);
        assert_eq!(config.pool.session_ttl_seconds, 900);
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() -> Result<()> {
        let config = Config::default();
        let dir = tempdir()?;
        let path = dir.path().join("config.toml");

        config.save_to_file(&path).await?;
        let loaded = Config::load_from_file(&path).await?;

        assert_eq!(config.pool.max_sessions, loaded.pool.max_sessions);
        assert_eq!(config.backends.postgresql.host, loaded.backends.postgresql.host);
        Ok(())
    }

    #[test]
    fn rejects_zero_caps() {
        let mut config = Config::default();
        config.pool.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_vars_cover_pool_settings() {
        let config = Config::default();
        let env_vars = config.as_env_vars();
        assert!(env_vars.iter().any(|(k, _)| k == "SANDBOX_MAX_SESSIONS"));
    }
}
