//! airdb-query - run joined queries against a project store

use airdb_join::engine::{
    adapter::{sqlite::SqliteAdapter, DatabaseAdapter},
    cli::{formatter::CliFormatter, Cli, Commands, OutputFormat, QueryFile},
    config::{Config, DatabaseType},
    hybrid::{Backend, DocumentStore, RelationalStore, Repository},
};
use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("airdb_join=debug,airdb_query=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let project_dir = cli.get_project_dir();
    let json_output = cli.format == OutputFormat::Json;
    let config = Config::load(&project_dir)?;
    let db_path = config.database_path(&project_dir);
    info!(project = %config.project.name, database = %config.database.db_type, path = %db_path.display(), "Opening store");

    match config.database.db_type {
        DatabaseType::Nosql => {
            let store = DocumentStore::open(&db_path)
                .with_context(|| format!("Failed to open document store at {}", db_path.display()))?;
            let collections = if matches!(cli.command, Commands::Status) {
                store.engine().list_collections()?
            } else {
                Vec::new()
            };
            dispatch(Arc::new(store), &config, &db_path, collections, cli.command, json_output).await
        }
        DatabaseType::Sqlite => {
            let adapter = SqliteAdapter::new(&db_path)
                .with_context(|| format!("Failed to open SQLite database at {}", db_path.display()))?;
            let tables = if matches!(cli.command, Commands::Status) {
                adapter.get_tables()?
            } else {
                Vec::new()
            };
            let store = RelationalStore::new(Arc::new(adapter));
            dispatch(Arc::new(store), &config, &db_path, tables, cli.command, json_output).await
        }
    }
}

async fn dispatch<B: Backend>(
    backend: Arc<B>,
    config: &Config,
    db_path: &Path,
    collections: Vec<String>,
    command: Commands,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Query { collection, file, page, page_size } => {
            let mut query = QueryFile::load(&file)?;
            query.override_page(page, page_size);
            cmd_query(repository(backend, config, &collection, &query), query, json).await
        }
        Commands::Explain { collection, file } => {
            let query = QueryFile::load(&file)?;
            cmd_explain(repository(backend, config, &collection, &query), query, json).await
        }
        Commands::Status => cmd_status(backend.as_ref(), config, db_path, &collections, json),
    }
}

fn repository<B: Backend>(backend: Arc<B>, config: &Config, collection: &str, query: &QueryFile) -> Repository<B> {
    let repo = Repository::new(backend, collection).with_schema(query.schema.clone());
    match config.query.max_page_size {
        Some(max) => repo.with_max_page_size(max as u64),
        None => repo,
    }
}

async fn cmd_query<B: Backend>(repo: Repository<B>, query: QueryFile, json: bool) -> anyhow::Result<()> {
    if let Some(id) = &query.id {
        let entity = repo.get_by_id(&query.operations, id).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&entity)?);
        } else {
            CliFormatter::entity(repo.collection(), id, entity.as_ref());
        }
        return Ok(());
    }

    let result = repo.get(&query.operations, &query.options).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        CliFormatter::page(repo.collection(), &result);
    }
    Ok(())
}

async fn cmd_explain<B: Backend>(repo: Repository<B>, query: QueryFile, json: bool) -> anyhow::Result<()> {
    let native = repo.explain(&query.operations, &query.options).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&native)?);
        return Ok(());
    }

    CliFormatter::header(&format!("{} on {}", repo.collection(), repo.backend().name()));
    if let Some(sql) = native.get("sql").and_then(|v| v.as_str()) {
        CliFormatter::code_block(sql, "sql");
        CliFormatter::kv("params", &native["params"].to_string());
        if let Some(count) = native.get("countSql").and_then(|v| v.as_str()) {
            CliFormatter::kv("count", count);
        }
    } else {
        CliFormatter::code_block(&serde_json::to_string_pretty(&native["pipeline"])?, "json");
    }
    Ok(())
}

fn cmd_status<B: Backend>(
    backend: &B,
    config: &Config,
    db_path: &Path,
    collections: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let connection = backend.ping();

    if json {
        println!("{}", serde_json::to_string_pretty(&json!({
            "project": config.project.name,
            "database": config.database.db_type,
            "path": db_path,
            "maxPageSize": config.query.max_page_size,
            "connected": connection.is_ok(),
            "collections": collections,
        }))?);
    } else {
        CliFormatter::header("AirDB Project Status");
        CliFormatter::kv("Project", &config.project.name);
        CliFormatter::kv("Database", &format!("{} ({})", config.database.db_type, db_path.display()));
        CliFormatter::kv(
            "Max page size",
            &config.query.max_page_size.map_or("unlimited".to_string(), |m| m.to_string()),
        );
        match &connection {
            Ok(()) => CliFormatter::success(&format!("Connected to {}", backend.name())),
            Err(e) => CliFormatter::error(&format!("Connection failed: {}", e)),
        }
        if collections.is_empty() {
            CliFormatter::item("(no collections)");
        }
        for name in collections {
            CliFormatter::item(name);
        }
    }

    connection.context("Store connection failed")
}
