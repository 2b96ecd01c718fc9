use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracelink_analysis::Linker;
use tracelink_store::{CodeBatch, GraphStore, LogBatch};
use tracing::info;

use crate::Workspace;
use crate::cli::{IngestArgs, IngestCodeArgs, LinkArgs};

pub(crate) fn ingest_code(workspace: &Workspace, args: IngestCodeArgs) -> Result<Value> {
    let mut batch: CodeBatch = read_batch(&args.file)?;
    if args.assign_call_orders {
        batch.assign_call_orders();
    }

    let outcome = workspace
        .store
        .ingest_code_batch(&batch)
        .with_context(|| format!("failed to ingest code batch '{}'", batch.batch_id))?;
    serde_json::to_value(outcome).context("failed to serialize ingest output")
}

pub(crate) fn ingest_logs(workspace: &Workspace, args: IngestArgs) -> Result<Value> {
    let batch: LogBatch = read_batch(&args.file)?;
    let outcome = workspace
        .store
        .ingest_log_batch(&batch)
        .with_context(|| format!("failed to ingest log batch '{}'", batch.batch_id))?;
    serde_json::to_value(outcome).context("failed to serialize ingest output")
}

pub(crate) fn link(workspace: &Workspace, args: LinkArgs) -> Result<Value> {
    let outcome = Linker::new(&workspace.config.linker)
        .link(&workspace.store, args.batch_id.trim())
        .context("linking failed")?;
    info!(total = outcome.total(), "linker finished");
    serde_json::to_value(outcome).context("failed to serialize link output")
}

fn read_batch<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read batch file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse batch file {}", path.display()))
}
