use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the five storage engines a query can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    PostgreSql,
    MariaDb,
    MongoDb,
    Redis,
}

impl BackendKind {
    pub fn is_embedded(self) -> bool {
        matches!(self, BackendKind::Sqlite)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::PostgreSql => "postgresql",
            BackendKind::MariaDb => "mariadb",
            BackendKind::MongoDb => "mongodb",
            BackendKind::Redis => "redis",
        };
        f.write_str(s)
    }
}

/// A single normalized table cell. All backends normalize their native
/// result types down to this set before they cross the Executor boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, ""),
            ScalarValue::Bool(b) => write!(f, "{b}"),
            ScalarValue::Int(i) => write!(f, "{i}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A query submitted for execution. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub backend_kind: BackendKind,
    pub query_text: String,
    pub schema_text: Option<String>,
    pub seed_text: Option<String>,
    pub timeout_seconds: u64,
    pub session_id: Option<String>,
    pub owning_user_id: Option<String>,
}

/// The normalized, tabular shape every backend's result is reduced to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<ScalarValue>>,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub affected_rows: usize,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub truncated: bool,
}

impl QueryResult {
    pub fn ok(columns: Vec<String>, rows: Vec<Vec<ScalarValue>>, execution_time_ms: u64) -> Self {
        let row_count = rows.len();
        Self {
            success: true,
            columns,
            rows,
            row_count,
            affected_rows: 0,
            execution_time_ms,
            error_message: String::new(),
            truncated: false,
        }
    }

    pub fn affected(affected_rows: usize, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            affected_rows,
            execution_time_ms,
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            ..Default::default()
        }
    }

    /// Applies the MAX_RESULT_ROWS cap in place.
    pub fn truncate_to(&mut self, max_rows: usize) {
        if self.rows.len() > max_rows {
            self.rows.truncate(max_rows);
            self.row_count = self.rows.len();
            self.truncated = true;
        }
    }
}

/// Durable projection of a Session, sufficient to rebuild it after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub backend_kind: BackendKind,
    pub schema_text: String,
    pub seed_text: String,
    pub isolation_id: String,
    pub created_at_unix: i64,
    pub owning_user_id: String,
}

/// Inputs to the Grading Engine.
#[derive(Debug, Clone, Default)]
pub struct GradingContext {
    pub student_result: QueryResult,
    pub expected_result: Option<QueryResult>,
    pub expected_query_text: Option<String>,
    pub required_keywords: Vec<String>,
    pub forbidden_keywords: Vec<String>,
    pub order_matters: bool,
    pub partial_match: bool,
    pub max_score: f64,
    pub student_query_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingOutcome {
    pub score: f64,
    pub max_score: f64,
    pub is_correct: bool,
    pub checks: Vec<CheckOutcome>,
    pub hints: Vec<String>,
}
