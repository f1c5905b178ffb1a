//! Backend adapters (C2): one executor implementation per storage engine,
//! all speaking the same uniform operation set.

pub mod embedded;
pub mod mariadb;
pub mod mongodb;
pub mod postgres;
pub mod redis_kv;

use crate::error::Result;
use crate::types::QueryResult;
use async_trait::async_trait;

/// Uniform contract every backend adapter implements. The five adapters
/// share no base state; dynamic dispatch happens entirely through this
/// trait object.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Establishes the connection. Fails with `Error::ConnectionFailed`.
    async fn connect(&mut self) -> Result<()>;

    /// Idempotent; must never propagate an error.
    async fn disconnect(&mut self);

    /// Cheap health probe.
    async fn is_connected(&self) -> bool;

    /// Executes a single query/command against an already-open connection.
    async fn execute(&mut self, query: &str, timeout_secs: u64) -> Result<QueryResult>;

    /// Applies a multi-statement schema script. `success` reflects the batch.
    async fn init_schema(&mut self, schema_text: &str) -> Result<QueryResult>;

    /// Applies multi-statement seed data, same batching semantics as `init_schema`.
    async fn load_seed(&mut self, seed_text: &str) -> Result<QueryResult>;

    /// Drops every object visible to the current connection. Best-effort.
    async fn reset(&mut self) -> Result<()>;
}

/// Quote-aware statement splitter: tracks single/double-quote state so a
/// `;` inside a string literal does not split the statement. Required for
/// the MariaDB family; a naive `split(';')` is wrong here.
pub fn split_statements_quote_aware(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut string_char = '\0';
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            current.push(c);
            if c == string_char {
                in_string = false;
            } else if c == '\\' {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
        } else if c == '\'' || c == '"' {
            in_string = true;
            string_char = c;
            current.push(c);
        } else if c == ';' {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                statements.push(trimmed.to_string());
            }
            current.clear();
        } else {
            current.push(c);
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    statements
}

/// Newline-joined, `;`-terminated statement splitting used by the document
/// backend so a multi-line `insertMany([...])` call is preserved as one
/// statement. Skips blank lines and `//` comments.
pub fn split_statements_line_joined(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.trim().lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with("//") {
            continue;
        }
        current.push(stripped);
        if stripped.ends_with(';') {
            statements.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        statements.push(current.join(" "));
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_aware_split_ignores_semicolon_in_string() {
        let stmts = split_statements_quote_aware("INSERT INTO t VALUES ('a;b'); SELECT 1;");
        assert_eq!(stmts, vec!["INSERT INTO t VALUES ('a;b')", "SELECT 1"]);
    }

    #[test]
    fn line_joined_split_preserves_multiline_call() {
        let text = "db.users.insertMany([\n  {name: \"a\"},\n  {name: \"b\"}\n]);\ndb.users.find({});";
        let stmts = split_statements_line_joined(text);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("insertMany"));
        assert!(stmts[0].contains("{name: \"b\"}"));
    }
}
