//! Document backend adapter: a small, explicit `db.<collection>.<op>(...)`
//! parser with shell-compatibility relaxations, not a full shell.

use super::{split_statements_line_joined, Executor};
use crate::config::ServerBackendConfig;
use crate::error::{Error, Result};
use crate::types::{QueryResult, ScalarValue};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, FindOptions};
use mongodb::{Client, Database};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Instant;

pub struct MongoExecutor {
    config: ServerBackendConfig,
    database_name: String,
    client: Option<Client>,
    db: Option<Database>,
}

impl MongoExecutor {
    pub fn new(config: ServerBackendConfig, database_name: String) -> Self {
        Self {
            config,
            database_name,
            client: None,
            db: None,
        }
    }

    fn connection_uri(&self) -> String {
        format!("mongodb://{}:{}/", self.config.host, self.config.port)
    }
}

struct ParsedQuery {
    collection: String,
    operation: String,
    args: Vec<serde_json::Value>,
}

/// Strips the `db.` prefix, the trailing `;`, and splits into
/// `collection.operation(args)`.
fn parse_query(query_text: &str) -> std::result::Result<ParsedQuery, String> {
    let trimmed = query_text.trim().trim_end_matches(';').trim();
    let trimmed = trimmed.strip_prefix("db.").unwrap_or(trimmed);

    let dot = trimmed
        .find('.')
        .ok_or_else(|| "expected db.<collection>.<operation>(...)".to_string())?;
    let collection = trimmed[..dot].to_string();
    let rest = &trimmed[dot + 1..];

    let open = rest.find('(').ok_or_else(|| "missing opening parenthesis".to_string())?;
    let operation = rest[..open].to_string();
    let close = rest.rfind(')').ok_or_else(|| "missing closing parenthesis".to_string())?;
    let args_str = &rest[open + 1..close];

    let args = if args_str.trim().is_empty() {
        Vec::new()
    } else {
        parse_args(args_str)?
    };

    Ok(ParsedQuery {
        collection,
        operation,
        args,
    })
}

/// Parses MongoDB shell-style arguments into a JSON array of positional
/// arguments, applying the three documented relaxations.
fn parse_args(args_str: &str) -> std::result::Result<Vec<serde_json::Value>, String> {
    static NEW_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"new\s+Date\(([^)]*)\)").unwrap());
    static OBJECT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"ObjectId\(([^)]*)\)").unwrap());
    static NUMBER_WRAPPER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?:NumberInt|NumberLong)\(([^)]*)\)").unwrap());
    static SINGLE_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"'([^']*)'").unwrap());
    static UNQUOTED_KEY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"(?P<pre>[{,]\s*)(?P<key>[$\w]+)\s*:"#).unwrap());

    let rewritten = NEW_DATE.replace_all(args_str, "$1");
    let rewritten = OBJECT_ID.replace_all(&rewritten, "$1");
    let rewritten = NUMBER_WRAPPER.replace_all(&rewritten, "$1");
    let wrapped = format!("[{rewritten}]");

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&wrapped) {
        return Ok(value.as_array().cloned().unwrap_or_default());
    }

    let relaxed = SINGLE_QUOTED.replace_all(&wrapped, "\"$1\"");
    let relaxed = UNQUOTED_KEY.replace_all(&relaxed, "$pre\"$key\":");

    serde_json::from_str::<serde_json::Value>(&relaxed)
        .map(|v| v.as_array().cloned().unwrap_or_default())
        .map_err(|_| format!("failed to parse arguments: {args_str}"))
}

fn json_to_bson(value: &serde_json::Value) -> std::result::Result<Bson, String> {
    mongodb::bson::to_bson(value).map_err(|e| e.to_string())
}

fn json_to_document(value: &serde_json::Value) -> std::result::Result<Document, String> {
    match json_to_bson(value)? {
        Bson::Document(d) => Ok(d),
        Bson::Null => Ok(doc! {}),
        other => Err(format!("expected a document argument, got {other:?}")),
    }
}

async fn execute_operation(
    db: &Database,
    collection_name: &str,
    operation: &str,
    args: &[serde_json::Value],
    timeout_ms: u64,
) -> std::result::Result<Vec<Document>, String> {
    let collection = db.collection::<Document>(collection_name);
    match operation {
        "find" => {
            let filter = args.first().map(json_to_document).transpose()?.unwrap_or_default();
            let opts = FindOptions::builder()
                .max_time(std::time::Duration::from_millis(timeout_ms))
                .build();
            let mut cursor = collection
                .find(filter, opts)
                .await
                .map_err(|e| e.to_string())?;
            let mut docs = Vec::new();
            use futures::stream::StreamExt;
            while let Some(doc) = cursor.next().await {
                docs.push(doc.map_err(|e| e.to_string())?);
            }
            Ok(docs)
        }
        "findOne" => {
            let filter = args.first().map(json_to_document).transpose()?.unwrap_or_default();
            let doc = collection.find_one(filter, None).await.map_err(|e| e.to_string())?;
            Ok(doc.into_iter().collect())
        }
        "insertOne" => {
            let document = json_to_document(args.first().ok_or("insertOne requires a document")?)?;
            let result = collection.insert_one(document, None).await.map_err(|e| e.to_string())?;
            Ok(vec![doc! { "insertedId": result.inserted_id }])
        }
        "insertMany" => {
            let array = args.first().ok_or("insertMany requires an array")?;
            let docs: Vec<Document> = array
                .as_array()
                .ok_or("insertMany expects an array argument")?
                .iter()
                .map(json_to_document)
                .collect::<std::result::Result<_, _>>()?;
            let result = collection.insert_many(docs, None).await.map_err(|e| e.to_string())?;
            Ok(vec![doc! { "insertedCount": result.inserted_ids.len() as i64 }])
        }
        "updateOne" | "updateMany" => {
            let filter = json_to_document(args.first().ok_or("missing filter")?)?;
            let update = json_to_document(args.get(1).ok_or("missing update")?)?;
            let result = if operation == "updateOne" {
                collection.update_one(filter, update, None).await
            } else {
                collection.update_many(filter, update, None).await
            }
            .map_err(|e| e.to_string())?;
            Ok(vec![doc! {
                "matchedCount": result.matched_count as i64,
                "modifiedCount": result.modified_count as i64,
            }])
        }
        "deleteOne" | "deleteMany" => {
            let filter = args.first().map(json_to_document).transpose()?.unwrap_or_default();
            let result = if operation == "deleteOne" {
                collection.delete_one(filter, None).await
            } else {
                collection.delete_many(filter, None).await
            }
            .map_err(|e| e.to_string())?;
            Ok(vec![doc! { "deletedCount": result.deleted_count as i64 }])
        }
        "countDocuments" => {
            let filter = args.first().map(json_to_document).transpose()?.unwrap_or_default();
            let count = collection.count_documents(filter, None).await.map_err(|e| e.to_string())?;
            Ok(vec![doc! { "count": count as i64 }])
        }
        "distinct" => {
            let field = args.first().and_then(|v| v.as_str()).ok_or("distinct requires a field name")?;
            let filter = args.get(1).map(json_to_document).transpose()?.unwrap_or_default();
            let values = collection.distinct(field, filter, None).await.map_err(|e| e.to_string())?;
            Ok(vec![doc! { "values": values }])
        }
        "aggregate" => {
            let pipeline: Vec<Document> = args
                .first()
                .and_then(|v| v.as_array())
                .ok_or("aggregate requires a pipeline array")?
                .iter()
                .map(json_to_document)
                .collect::<std::result::Result<_, _>>()?;
            let mut cursor = collection.aggregate(pipeline, None).await.map_err(|e| e.to_string())?;
            let mut docs = Vec::new();
            use futures::stream::StreamExt;
            while let Some(doc) = cursor.next().await {
                docs.push(doc.map_err(|e| e.to_string())?);
            }
            Ok(docs)
        }
        other => Err(format!("unsupported operation: {other}")),
    }
}

#[async_trait]
impl Executor for MongoExecutor {
    async fn connect(&mut self) -> Result<()> {
        let options = ClientOptions::parse(self.connection_uri())
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let client = Client::with_options(options).map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        self.db = Some(client.database(&self.database_name));
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
        self.db = None;
    }

    async fn is_connected(&self) -> bool {
        match &self.client {
            Some(client) => client.database("admin").run_command(doc! { "ping": 1 }, None).await.is_ok(),
            None => false,
        }
    }

    async fn execute(&mut self, query: &str, timeout_secs: u64) -> Result<QueryResult> {
        let Some(db) = &self.db else {
            return Err(Error::ConnectionFailed("not connected".into()));
        };
        let parsed = match parse_query(query) {
            Ok(p) => p,
            Err(e) => return Err(Error::SyntaxError(e)),
        };

        let start = Instant::now();
        let docs = execute_operation(
            db,
            &parsed.collection,
            &parsed.operation,
            &parsed.args,
            timeout_secs * 1000,
        )
        .await;
        let elapsed = start.elapsed().as_millis() as u64;

        match docs {
            Ok(docs) => {
                let rows: Vec<Vec<ScalarValue>> = docs
                    .iter()
                    .map(|d| vec![ScalarValue::Text(d.to_string())])
                    .collect();
                Ok(QueryResult::ok(vec!["result".to_string()], rows, elapsed))
            }
            Err(message) => Ok(QueryResult::failure(message)),
        }
    }

    async fn init_schema(&mut self, schema_text: &str) -> Result<QueryResult> {
        self.run_batch(schema_text).await
    }

    async fn load_seed(&mut self, seed_text: &str) -> Result<QueryResult> {
        self.run_batch(seed_text).await
    }

    async fn reset(&mut self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        if let Ok(names) = db.list_collection_names(None).await {
            for name in names {
                let _ = db.collection::<Document>(&name).drop(None).await;
            }
        }
        Ok(())
    }
}

impl MongoExecutor {
    async fn run_batch(&mut self, text: &str) -> Result<QueryResult> {
        if text.trim().is_empty() {
            return Ok(QueryResult {
                success: true,
                ..Default::default()
            });
        }
        for statement in split_statements_line_joined(text) {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_find() {
        let parsed = parse_query("db.users.find({})").unwrap();
        assert_eq!(parsed.collection, "users");
        assert_eq!(parsed.operation, "find");
        assert!(parsed.args.is_empty() || parsed.args[0].is_object());
    }

    #[test]
    fn relaxes_unquoted_keys_and_single_quotes() {
        let args = parse_args("{name: 'Ann', age: 9}").unwrap();
        let obj = args[0].as_object().unwrap();
        assert_eq!(obj.get("name").unwrap(), "Ann");
        assert_eq!(obj.get("age").unwrap(), 9);
    }

    #[test]
    fn strips_wrapper_functions() {
        let args = parse_args("{createdAt: new Date(\"2024-01-01\")}").unwrap();
        let obj = args[0].as_object().unwrap();
        assert_eq!(obj.get("createdAt").unwrap(), "2024-01-01");
    }

    #[test]
    fn two_arg_update_parses_as_two_positional_args() {
        let args = parse_args("{_id: 1}, {$set: {done: true}}").unwrap();
        assert_eq!(args.len(), 2);
    }
}
