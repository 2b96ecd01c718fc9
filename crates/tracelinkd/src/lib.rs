pub mod cli;
mod ingest;
mod query;
mod trace;
mod workflows;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracelink_config::{TracelinkConfig, config_path, ensure_workspace_config, validate_config};
use tracelink_store::SqliteGraphStore;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::{Cli, Commands, LogFormat};

/// Installs the stderr subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Human => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("failed to install tracing subscriber")
}

/// An opened `.tracelink` workspace: resolved root, loaded config and store.
pub struct Workspace {
    pub root: PathBuf,
    pub config: TracelinkConfig,
    pub store: SqliteGraphStore,
}

impl Workspace {
    pub fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve workspace path {}", root.display()))?;

        let config = ensure_workspace_config(&root).with_context(|| {
            format!(
                "failed to load or create workspace config at {}",
                config_path(&root).display()
            )
        })?;
        for warning in validate_config(&config) {
            warn!(code = warning.code, "config warning: {}", warning.message);
        }

        let store = SqliteGraphStore::open(&root, &config.storage)
            .with_context(|| format!("failed to open graph store under {}", root.display()))?;

        Ok(Self {
            root,
            config,
            store,
        })
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let workspace = Workspace::open(&cli.workspace)?;
    let response = execute(&workspace, cli.command)?;
    write_json_to_stdout(&response)
}

/// Runs one subcommand and returns its JSON response.
pub fn execute(workspace: &Workspace, command: Commands) -> Result<Value> {
    match command {
        Commands::IngestCode(args) => ingest::ingest_code(workspace, args),
        Commands::IngestLogs(args) => ingest::ingest_logs(workspace, args),
        Commands::Link(args) => ingest::link(workspace, args),
        Commands::Forward(args) => query::forward(workspace, args),
        Commands::Backward(args) => query::backward(workspace, args),
        Commands::Roots => query::roots(workspace),
        Commands::Leaves => query::leaves(workspace),
        Commands::Classify => query::classify(workspace),
        Commands::RootsOf(args) => query::roots_of(workspace, args),
        Commands::LongestChains(args) => query::longest_chains(workspace, args),
        Commands::Cycles => query::cycles(workspace),
        Commands::Materialize => workflows::materialize(workspace),
        Commands::Workflows(args) => workflows::workflows(workspace, args),
        Commands::Trace(args) => trace::trace(workspace, args),
        Commands::Traces => trace::traces(workspace),
        Commands::CheckTrace(args) => trace::check_trace(workspace, args),
    }
}

fn write_json_to_stdout(value: &Value) -> Result<()> {
    let mut out = std::io::stdout();
    serde_json::to_writer_pretty(&mut out, value).context("failed to serialize JSON output")?;
    writeln!(&mut out).context("failed to write trailing newline")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::cli::{
        IngestArgs, IngestCodeArgs, LinkArgs, RootsOfArgs, TraceArgs, TraverseArgs,
        WorkflowsArgs,
    };

    fn write(path: &Path, value: &Value) {
        fs::write(path, serde_json::to_string_pretty(value).expect("serialize fixture"))
            .expect("write fixture");
    }

    fn code_batch() -> Value {
        json!({
            "batch_id": "code-1",
            "nodes": [
                {
                    "key": "orchestrator::place_order",
                    "name": "place_order",
                    "kind": "function",
                    "service": "orchestrator",
                    "api": { "method": "POST", "path": "/orders" },
                    "summary": "Accepts a retail order"
                },
                {
                    "key": "trade_service::validate_trade",
                    "name": "validate_trade",
                    "kind": "function",
                    "service": "trade_service",
                    "snippet": "def validate_trade(self, order) -> bool:\n    qty = order.get('quantity')"
                },
                {
                    "key": "trade_service::validate_quantity",
                    "name": "validate_quantity",
                    "kind": "function",
                    "service": "trade_service"
                }
            ],
            "edges": [
                {
                    "from_key": "orchestrator::place_order",
                    "to_key": "trade_service::validate_trade",
                    "kind": "CALLS",
                    "line": 12
                },
                {
                    "from_key": "trade_service::validate_trade",
                    "to_key": "trade_service::validate_quantity",
                    "kind": "CALLS",
                    "line": 30
                }
            ]
        })
    }

    fn log_batch() -> Value {
        json!({
            "batch_id": "logs-1",
            "events": [
                {
                    "key": "e1",
                    "timestamp": "2024-01-15T10:30:00Z",
                    "service": "orchestrator",
                    "level": "INFO",
                    "trace_id": "t-1",
                    "message": "[place_order] received"
                },
                {
                    "key": "e2",
                    "timestamp": "2024-01-15T10:30:01Z",
                    "service": "trade_service",
                    "level": "ERROR",
                    "trace_id": "t-1",
                    "message": "Invalid quantity: -50",
                    "fields": { "function": "validate_quantity", "error_code": "E_QTY" }
                }
            ]
        })
    }

    #[test]
    fn commands_run_end_to_end_against_a_workspace() {
        let temp = tempdir().expect("tempdir");
        let workspace = Workspace::open(temp.path()).expect("open workspace");
        assert!(config_path(&workspace.root).exists());

        let code = temp.path().join("code.json");
        write(&code, &code_batch());
        let ingested = execute(
            &workspace,
            Commands::IngestCode(IngestCodeArgs {
                file: code,
                assign_call_orders: true,
            }),
        )
        .expect("ingest code");
        assert_eq!(ingested["nodes_written"], 3);

        let logs = temp.path().join("logs.json");
        write(&logs, &log_batch());
        let ingested = execute(&workspace, Commands::IngestLogs(IngestArgs { file: logs }))
            .expect("ingest logs");
        assert_eq!(ingested["next_log_written"], 1);

        let linked = execute(
            &workspace,
            Commands::Link(LinkArgs {
                batch_id: "link-1".to_owned(),
            }),
        )
        .expect("link");
        assert_eq!(linked["executed_in"], 2);
        assert_eq!(linked["logged_error"], 1);

        let forward = execute(
            &workspace,
            Commands::Forward(TraverseArgs {
                reference: "POST /orders".to_owned(),
                service: None,
                depth: None,
            }),
        )
        .expect("forward");
        let keys = forward["steps"]
            .as_array()
            .expect("steps array")
            .iter()
            .map(|step| step["sort_key"].as_str().unwrap_or_default().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["1", "1.001", "1.001.001"]);

        let roots = execute(
            &workspace,
            Commands::RootsOf(RootsOfArgs {
                reference: "validate_quantity".to_owned(),
                service: Some("trade_service".to_owned()),
            }),
        )
        .expect("roots-of");
        assert_eq!(roots["roots"][0]["name"], "place_order");

        let materialized = execute(&workspace, Commands::Materialize).expect("materialize");
        assert_eq!(materialized["workflow_count"], 1);

        let details = execute(
            &workspace,
            Commands::Workflows(WorkflowsArgs {
                function: None,
                service: None,
                details: Some("validate_trade".to_owned()),
                verify: None,
            }),
        )
        .expect("workflow details");
        assert_eq!(details["workflows"][0]["highlighted"], json!([2]));
        assert_eq!(
            details["workflows"][0]["steps"][1]["contract"]["fields_accessed"],
            json!(["quantity"])
        );

        let report = execute(
            &workspace,
            Commands::Trace(TraceArgs {
                trace_id: "t-1".to_owned(),
                failures: true,
            }),
        )
        .expect("trace failures");
        assert_eq!(
            report["failure_paths"][0]["route"],
            json!(["place_order", "validate_trade", "validate_quantity"])
        );
    }

    #[test]
    fn unknown_references_surface_as_errors() {
        let temp = tempdir().expect("tempdir");
        let workspace = Workspace::open(temp.path()).expect("open workspace");

        let err = execute(
            &workspace,
            Commands::Backward(TraverseArgs {
                reference: "missing".to_owned(),
                service: None,
                depth: Some(2),
            }),
        )
        .expect_err("missing node");
        assert!(format!("{err:#}").contains("no code node matches 'missing'"));
    }
}
