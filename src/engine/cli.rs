//! Command-line interface for running joined queries against a project store

pub mod formatter;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::engine::hybrid::{EntitySchema, Operation, QueryOptions};

#[derive(Parser, Debug)]
#[command(name = "airdb-query")]
#[command(author = "AirDB Team")]
#[command(version)]
#[command(about = "Run joined queries against a document or relational project store", long_about = None)]
pub struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log compiled queries to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a query file against a root collection
    Query {
        /// Root collection or table
        #[arg(short, long)]
        collection: String,

        /// Query file: { operations, options, schema, id }
        #[arg(long)]
        file: PathBuf,

        /// Page number, overrides the file
        #[arg(long)]
        page: Option<i64>,

        /// Page size, overrides the file
        #[arg(long)]
        page_size: Option<i64>,
    },

    /// Print the native query a query file compiles to
    Explain {
        /// Root collection or table
        #[arg(short, long)]
        collection: String,

        /// Query file: { operations, options, schema, id }
        #[arg(long)]
        file: PathBuf,
    },

    /// Show project status and test the store connection
    Status,
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

/// Contents of a `--file` argument
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryFile {
    pub operations: Vec<Operation>,
    pub options: QueryOptions,
    pub schema: EntitySchema,
    /// Fetch a single root entity by id instead of a page
    pub id: Option<String>,
}

impl QueryFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read query file {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid query file {}", path.display()))
    }

    /// Command-line paging wins over the file's own
    pub fn override_page(&mut self, page: Option<i64>, page_size: Option<i64>) {
        if page.is_some() {
            self.options.page = page;
        }
        if page_size.is_some() {
            self.options.page_size = page_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hybrid::{FieldKind, FilterOp, JoinKind};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_query_command() {
        let cli = Cli::parse_from([
            "airdb-query",
            "--format",
            "json",
            "query",
            "--collection",
            "orders",
            "--file",
            "q.json",
            "--page-size",
            "10",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Query { collection, page, page_size, .. } => {
                assert_eq!(collection, "orders");
                assert_eq!(page, None);
                assert_eq!(page_size, Some(10));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_load_query_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");
        let body = json!({
            "operations": [
                {"type": "join-one-left", "source": "customers", "localField": "customerId", "foreignField": "id", "alias": "customer"},
                {"type": "join-many-through", "junction": "agentPolicies", "junctionLocalField": "policyId",
                 "junctionForeignField": "agentId", "source": "agents", "localField": "id", "foreignField": "id",
                 "alias": "agents", "kind": "inner"}
            ],
            "options": {"filters": {"status": {"eq": "open"}}, "page": 2, "pageSize": 5},
            "schema": {"customerId": "id"}
        });
        std::fs::write(&path, body.to_string()).unwrap();

        let mut file = QueryFile::load(&path).unwrap();
        assert_eq!(file.operations.len(), 2);
        assert_eq!(file.operations[1].kind(), JoinKind::Inner);
        assert_eq!(file.options.filters["status"][&FilterOp::Eq], json!("open"));
        assert!(matches!(file.schema.kind_of("customerId"), Some(FieldKind::Id)));
        assert!(file.id.is_none());

        file.override_page(None, Some(20));
        assert_eq!(file.options.page, Some(2));
        assert_eq!(file.options.page_size, Some(20));
    }

    #[test]
    fn test_missing_query_file() {
        assert!(QueryFile::load(Path::new("/nonexistent/q.json")).is_err());
    }
}
