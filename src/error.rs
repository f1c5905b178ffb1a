use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("query blocked: {0}")]
    Blocked(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("query timed out after {0}s")]
    Timeout(u64),

    #[error("syntax error: {0}")]
    SyntaxError(String),

    #[error("isolation setup failed: {0}")]
    CreationFailed(String),

    #[error("too many sessions")]
    TooManySessions,

    #[error("session does not belong to this user")]
    NotOwner,

    #[error("session expired or not found")]
    SessionExpired,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
