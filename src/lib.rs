//! Multi-tenant sandbox execution core for an interactive SQL/NoSQL
//! learning platform.
//!
//! ## Architecture
//!
//! ```text
//! validator   (C1)  pre-execution query validation, backend-agnostic
//! executor    (C2)  one adapter per backend: sqlite, postgresql, mariadb, mongodb, redis
//! pool        (C3)  facade + periodic health-check, multiplexes onto the session manager
//! session     (C4)  owns the live session table: creation, ownership, expiry, rebuild
//! metadata          external durable metadata store backing rebuild
//! grading     (C5)  weighted-check scoring of a student result against an expected one
//! ```
//!
//! The HTTP surface, authentication, and the relational metadata store for
//! users/courses/assignments are external collaborators and are not part
//! of this crate.

pub mod config;
pub mod error;
pub mod executor;
pub mod grading;
pub mod metadata;
pub mod pool;
pub mod session;
pub mod types;
pub mod validator;

pub use config::Config;
pub use error::{Error, Result};
pub use pool::SandboxPool;
pub use session::{InMemoryMetadataStore, MetadataStore, SessionManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// MAX_RESULT_ROWS from the component design: the hard cap every executor
/// truncates result rows to.
pub const MAX_RESULT_ROWS: usize = 1000;
