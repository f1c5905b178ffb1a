//! Key-value backend adapter. Key-prefix rewriting is the isolation
//! mechanism: every session gets a short prefix and every command is
//! rewritten so its keys are scoped to that prefix, instead of relying on
//! the legacy 15-numbered-database cap.

use super::Executor;
use crate::config::ServerBackendConfig;
use crate::error::{Error, Result};
use crate::types::{QueryResult, ScalarValue};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Value};
use std::time::Instant;

/// How a command's positional arguments relate to keys, driving the
/// prefix-rewriting rule applied before the command is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyShape {
    None,
    AllArgsAreKeys,
    Glob,
    EvenIndexedAreKeys,
    FirstTwoAreKeys,
    FirstArgIsKey,
}

fn key_shape(command: &str) -> KeyShape {
    match command {
        "PING" | "MULTI" | "EXEC" | "DISCARD" | "ECHO" | "DBSIZE" | "SELECT" | "SUBSCRIBE"
        | "UNSUBSCRIBE" | "PUBLISH" => KeyShape::None,
        "DEL" | "EXISTS" | "UNLINK" | "MGET" | "SDIFF" | "SINTER" | "SUNION" | "WATCH" => {
            KeyShape::AllArgsAreKeys
        }
        "KEYS" => KeyShape::Glob,
        "MSET" | "MSETNX" => KeyShape::EvenIndexedAreKeys,
        "RENAME" | "RENAMENX" | "RPOPLPUSH" | "LMOVE" | "SMOVE" | "SDIFFSTORE" | "SINTERSTORE"
        | "SUNIONSTORE" => KeyShape::FirstTwoAreKeys,
        _ => KeyShape::FirstArgIsKey,
    }
}

/// Prefixes every key-shaped argument in `tokens` (tokens[0] is the command).
fn prefix_command(tokens: &[String], prefix: &str) -> Vec<String> {
    if tokens.is_empty() {
        return tokens.to_vec();
    }
    let command = tokens[0].to_uppercase();
    let shape = key_shape(&command);
    let mut out = tokens.to_vec();

    match shape {
        KeyShape::None => {}
        KeyShape::AllArgsAreKeys => {
            for arg in out.iter_mut().skip(1) {
                *arg = format!("{prefix}:{arg}");
            }
        }
        KeyShape::Glob => {
            if let Some(pattern) = out.get_mut(1) {
                *pattern = format!("{prefix}:{pattern}");
            }
        }
        KeyShape::EvenIndexedAreKeys => {
            for (i, arg) in out.iter_mut().enumerate().skip(1) {
                if (i - 1) % 2 == 0 {
                    *arg = format!("{prefix}:{arg}");
                }
            }
        }
        KeyShape::FirstTwoAreKeys => {
            for arg in out.iter_mut().skip(1).take(2) {
                *arg = format!("{prefix}:{arg}");
            }
        }
        KeyShape::FirstArgIsKey => {
            if let Some(key) = out.get_mut(1) {
                *key = format!("{prefix}:{key}");
            }
        }
    }
    out
}

/// Strips the prefix back off `KEYS` results so the caller sees clean names.
fn strip_prefix(value: &str, prefix: &str) -> String {
    value
        .strip_prefix(&format!("{prefix}:"))
        .unwrap_or(value)
        .to_string()
}

/// Commands whose Bulk reply is a flat, alternating key/value sequence
/// rather than a plain list. The `redis` crate has no distinct "map" reply
/// variant in RESP2, so this has to be driven by the command name rather
/// than the reply shape.
fn is_map_shaped(command: &str) -> bool {
    command.eq_ignore_ascii_case("HGETALL") || command.eq_ignore_ascii_case("CONFIG")
}

fn bulk_item_to_text(item: Value) -> String {
    match item {
        Value::Data(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Int(i) => i.to_string(),
        Value::Nil => String::new(),
        other => format!("{other:?}"),
    }
}

fn value_to_rows(value: Value, command: &str, prefix: &str) -> (Vec<String>, Vec<Vec<ScalarValue>>) {
    match value {
        Value::Nil => (vec!["result".into()], vec![vec![ScalarValue::Null]]),
        Value::Okay => (vec!["result".into()], vec![vec![ScalarValue::Text("OK".into())]]),
        Value::Int(i) => (vec!["result".into()], vec![vec![ScalarValue::Int(i)]]),
        Value::Data(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (vec!["result".into()], vec![vec![ScalarValue::Text(text)]])
        }
        Value::Bulk(items) if is_map_shaped(command) => {
            let mut rows = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(key), Some(val)) = (iter.next(), iter.next()) {
                rows.push(vec![
                    ScalarValue::Text(bulk_item_to_text(key)),
                    ScalarValue::Text(bulk_item_to_text(val)),
                ]);
            }
            (vec!["key".into(), "value".into()], rows)
        }
        Value::Bulk(items) => {
            let strip = command.eq_ignore_ascii_case("KEYS");
            let rows = items
                .into_iter()
                .map(|item| match item {
                    Value::Data(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        let text = if strip { strip_prefix(&text, prefix) } else { text };
                        vec![ScalarValue::Text(text)]
                    }
                    Value::Int(i) => vec![ScalarValue::Int(i)],
                    Value::Nil => vec![ScalarValue::Null],
                    other => vec![ScalarValue::Text(format!("{other:?}"))],
                })
                .collect();
            (vec!["result".into()], rows)
        }
        other => (vec!["result".into()], vec![vec![ScalarValue::Text(format!("{other:?}"))]]),
    }
}

pub struct RedisExecutor {
    config: ServerBackendConfig,
    /// `None` means the legacy shared-database mode (no isolation).
    key_prefix: Option<String>,
    client: Option<Client>,
    conn: Option<MultiplexedConnection>,
}

impl RedisExecutor {
    pub fn new(config: ServerBackendConfig) -> Self {
        Self {
            config,
            key_prefix: None,
            client: None,
            conn: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
}

#[async_trait]
impl Executor for RedisExecutor {
    async fn connect(&mut self) -> Result<()> {
        let url = format!("redis://{}:{}/0", self.config.host, self.config.port);
        let client = Client::open(url).map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        self.client = Some(client);
        self.conn = Some(conn);
        if let Some(prefix) = self.key_prefix.clone() {
            let _ = Executor::reset(self).await;
            let _ = prefix;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.conn = None;
        self.client = None;
    }

    async fn is_connected(&self) -> bool {
        let Some(conn) = self.conn.clone() else {
            return false;
        };
        let mut conn = conn;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
    }

    async fn execute(&mut self, query: &str, timeout_secs: u64) -> Result<QueryResult> {
        let Some(conn) = &mut self.conn else {
            return Err(Error::ConnectionFailed("not connected".into()));
        };
        let tokens = shell_words::split(query)
            .unwrap_or_else(|_| query.split_whitespace().map(str::to_string).collect());
        if tokens.is_empty() {
            return Ok(QueryResult::failure("empty command"));
        }

        let tokens = match &self.key_prefix {
            Some(prefix) => prefix_command(&tokens, prefix),
            None => tokens,
        };

        let mut cmd = redis::cmd(&tokens[0]);
        for arg in &tokens[1..] {
            cmd.arg(arg);
        }

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            cmd.query_async::<_, Value>(conn),
        )
        .await;
        let elapsed = start.elapsed().as_millis() as u64;

        let value = match outcome {
            Err(_) => return Err(Error::Timeout(timeout_secs)),
            Ok(Err(e)) => return Ok(QueryResult::failure(e.to_string())),
            Ok(Ok(v)) => v,
        };

        let prefix = self.key_prefix.as_deref().unwrap_or("");
        let (columns, rows) = value_to_rows(value, &tokens[0], prefix);
        let row_count = rows.len();
        Ok(QueryResult {
            success: true,
            columns,
            rows,
            row_count,
            affected_rows: 0,
            execution_time_ms: elapsed,
            error_message: String::new(),
            truncated: false,
        })
    }

    async fn init_schema(&mut self, schema_text: &str) -> Result<QueryResult> {
        self.run_batch(schema_text).await
    }

    async fn load_seed(&mut self, seed_text: &str) -> Result<QueryResult> {
        self.run_batch(seed_text).await
    }

    async fn reset(&mut self) -> Result<()> {
        let Some(conn) = &mut self.conn else {
            return Ok(());
        };
        match &self.key_prefix {
            Some(prefix) => {
                let pattern = format!("{prefix}:*");
                let keys: Vec<String> = redis::cmd("KEYS")
                    .arg(&pattern)
                    .query_async(conn)
                    .await
                    .unwrap_or_default();
                if !keys.is_empty() {
                    let mut del = redis::cmd("DEL");
                    for key in &keys {
                        del.arg(key);
                    }
                    let _: std::result::Result<i64, _> = del.query_async(conn).await;
                }
            }
            None => {
                let _: std::result::Result<String, _> =
                    redis::cmd("FLUSHDB").query_async(conn).await;
            }
        }
        Ok(())
    }
}

impl RedisExecutor {
    async fn run_batch(&mut self, text: &str) -> Result<QueryResult> {
        if text.trim().is_empty() {
            return Ok(QueryResult {
                success: true,
                ..Default::default()
            });
        }
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let result = self.execute(line, 30).await?;
            if !result.success {
                return Ok(QueryResult::failure(format!(
                    "batch failed on `{line}`: {}",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shape_prefixes_first_arg() {
        let out = prefix_command(&["SET".into(), "k".into(), "42".into()], "s_abc");
        assert_eq!(out, vec!["SET", "s_abc:k", "42"]);
    }

    #[test]
    fn keys_prefixes_the_glob() {
        let out = prefix_command(&["KEYS".into(), "*".into()], "s_abc");
        assert_eq!(out, vec!["KEYS", "s_abc:*"]);
    }

    #[test]
    fn mset_prefixes_even_indexed_args_only() {
        let out = prefix_command(
            &["MSET".into(), "a".into(), "1".into(), "b".into(), "2".into()],
            "p",
        );
        assert_eq!(out, vec!["MSET", "p:a", "1", "p:b", "2"]);
    }

    #[test]
    fn no_key_commands_are_untouched() {
        let out = prefix_command(&["PING".into()], "p");
        assert_eq!(out, vec!["PING"]);
    }

    #[test]
    fn strips_prefix_from_keys_output() {
        assert_eq!(strip_prefix("s_abc:k", "s_abc"), "k");
    }

    #[test]
    fn hgetall_is_mapped_to_key_value_columns() {
        let value = Value::Bulk(vec![
            Value::Data(b"a".to_vec()),
            Value::Data(b"1".to_vec()),
            Value::Data(b"b".to_vec()),
            Value::Data(b"2".to_vec()),
        ]);
        let (columns, rows) = value_to_rows(value, "HGETALL", "p");
        assert_eq!(columns, vec!["key", "value"]);
        assert_eq!(
            rows,
            vec![
                vec![ScalarValue::Text("a".into()), ScalarValue::Text("1".into())],
                vec![ScalarValue::Text("b".into()), ScalarValue::Text("2".into())],
            ]
        );
    }
}
