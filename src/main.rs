use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;

use sandbox_core::session::InMemoryMetadataStore;
use sandbox_core::types::{BackendKind, QueryRequest};
use sandbox_core::{Config, SandboxPool, SessionManager};

#[derive(Parser)]
#[command(name = "sandbox-cli")]
#[command(about = "Drives the sandbox execution core without the HTTP layer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stateless query against a fresh executor.
    Run {
        #[arg(long, default_value = "sqlite")]
        backend: String,
        #[arg(long)]
        query: String,
        #[arg(long)]
        schema: Option<String>,
        #[arg(long)]
        seed: Option<String>,
    },
    /// Run a query inside a named, owned session, creating it on first use.
    Exec {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "sqlite")]
        backend: String,
        #[arg(long)]
        query: String,
        #[arg(long)]
        schema: Option<String>,
        #[arg(long)]
        seed: Option<String>,
    },
    /// Validate a query without executing it.
    Validate {
        #[arg(long, default_value = "sqlite")]
        backend: String,
        #[arg(long)]
        query: String,
    },
}

fn parse_backend(name: &str) -> Result<BackendKind> {
    Ok(match name {
        "sqlite" => BackendKind::Sqlite,
        "postgresql" => BackendKind::PostgreSql,
        "mariadb" => BackendKind::MariaDb,
        "mongodb" => BackendKind::MongoDb,
        "redis" => BackendKind::Redis,
        other => anyhow::bail!("unknown backend kind: {other}"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::default();

    match cli.command {
        Commands::Run { backend, query, schema, seed } => {
            let backend_kind = parse_backend(&backend)?;
            let metadata = Arc::new(InMemoryMetadataStore::default());
            let sessions = SessionManager::new(config.clone(), metadata);
            let pool = SandboxPool::new(config, sessions);

            let request = QueryRequest {
                backend_kind,
                query_text: query,
                schema_text: schema,
                seed_text: seed,
                timeout_seconds: 10,
                session_id: None,
                owning_user_id: None,
            };
            let result = pool.execute_stateless(request).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Exec { session_id, user, backend, query, schema, seed } => {
            let backend_kind = parse_backend(&backend)?;
            let metadata = Arc::new(InMemoryMetadataStore::default());
            let sessions = SessionManager::new(config.clone(), metadata);
            let pool = SandboxPool::new(config, sessions);
            pool.sessions.start_background_tasks();

            let request = QueryRequest {
                backend_kind,
                query_text: query,
                schema_text: schema,
                seed_text: seed,
                timeout_seconds: 10,
                session_id: Some(session_id),
                owning_user_id: Some(user),
            };
            let result = pool.execute_in_session(request).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Validate { backend, query } => {
            let backend_kind = parse_backend(&backend)?;
            match sandbox_core::validator::validate(backend_kind, &query) {
                Ok(()) => info!("query allowed"),
                Err(blocked) => println!("{}", blocked.message),
            }
        }
    }

    Ok(())
}
