use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracelink_analysis::TraceAnalyzer;
use tracelink_store::GraphStore;
use tracing::warn;

use crate::Workspace;
use crate::cli::{CheckTraceArgs, TraceArgs};

pub(crate) fn trace(workspace: &Workspace, args: TraceArgs) -> Result<Value> {
    let analyzer = TraceAnalyzer::new(&workspace.config.traversal);
    let trace_id = args.trace_id.trim();

    if args.failures {
        let paths = analyzer
            .failure_paths(&workspace.store, trace_id)
            .with_context(|| format!("failure path query for trace '{trace_id}' failed"))?;
        return Ok(json!({
            "trace_id": trace_id,
            "result_count": paths.len(),
            "failure_paths": paths,
        }));
    }

    let report = analyzer
        .analyze(&workspace.store, trace_id)
        .with_context(|| format!("failed to analyze trace '{trace_id}'"))?;
    serde_json::to_value(report).context("failed to serialize trace report")
}

pub(crate) fn traces(workspace: &Workspace) -> Result<Value> {
    let traces = TraceAnalyzer::new(&workspace.config.traversal)
        .list_traces(&workspace.store)
        .context("trace listing failed")?;
    Ok(json!({
        "result_count": traces.len(),
        "traces": traces,
    }))
}

pub(crate) fn check_trace(workspace: &Workspace, args: CheckTraceArgs) -> Result<Value> {
    let trace_id = args.trace_id.trim();
    let report = workspace
        .store
        .check_trace_chain(trace_id)
        .with_context(|| format!("failed to check trace '{trace_id}'"))?;
    if report.events == 0 {
        bail!("trace '{trace_id}' has no stored events");
    }
    if !report.is_valid() {
        warn!(trace_id, problems = report.problems.len(), "next_log chain is broken");
    }

    let mut response =
        serde_json::to_value(&report).context("failed to serialize trace chain report")?;
    response["valid"] = json!(report.is_valid());
    Ok(response)
}
