use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracelink_analysis::WorkflowMaterializer;

use crate::Workspace;
use crate::cli::WorkflowsArgs;

pub(crate) fn materialize(workspace: &Workspace) -> Result<Value> {
    let outcome = WorkflowMaterializer::new(&workspace.config)
        .materialize(&workspace.store)
        .context("workflow materialization failed")?;
    Ok(json!({
        "workflow_count": outcome.workflows.len(),
        "fingerprint": outcome.fingerprint,
        "workflows": outcome
            .workflows
            .iter()
            .map(|workflow| json!({
                "workflow_id": workflow.workflow_id,
                "entry_point": workflow.entry_point,
                "endpoint": workflow.endpoint,
                "workflow_type": workflow.workflow_type,
                "total_steps": workflow.total_steps,
            }))
            .collect::<Vec<_>>(),
        "skipped": outcome.skipped,
    }))
}

pub(crate) fn workflows(workspace: &Workspace, args: WorkflowsArgs) -> Result<Value> {
    let materializer = WorkflowMaterializer::new(&workspace.config);
    let store = &workspace.store;

    if let Some(workflow_id) = args.verify {
        let freshness = materializer
            .verify(store, workflow_id)
            .with_context(|| format!("failed to verify workflow {workflow_id}"))?;
        return Ok(json!({
            "workflow_id": workflow_id,
            "freshness": freshness,
        }));
    }

    if let Some(function) = args.details {
        let details = materializer
            .workflow_details(store, &function)
            .context("workflow details query failed")?;
        return serde_json::to_value(details).context("failed to serialize workflow details");
    }

    if let Some(function) = args.function {
        let memberships = materializer
            .workflows_for_function(store, function.trim())
            .context("workflow membership query failed")?;
        return Ok(json!({
            "function": function,
            "result_count": memberships.len(),
            "workflows": memberships,
        }));
    }

    if let Some(service) = args.service {
        let workflows = materializer
            .workflows_for_service(store, service.trim())
            .context("service workflow query failed")?;
        return Ok(json!({
            "service": service,
            "result_count": workflows.len(),
            "workflows": workflows,
        }));
    }

    let workflows = materializer
        .list_workflows(store)
        .context("workflow listing failed")?;
    Ok(json!({
        "result_count": workflows.len(),
        "workflows": workflows,
    }))
}
