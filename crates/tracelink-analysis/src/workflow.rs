use std::collections::BTreeSet;

use serde::Serialize;
use tracelink_config::{TracelinkConfig, TraversalConfig, WorkflowConfig};
use tracelink_core::extract_data_contract;
use tracelink_store::{
    GraphStore, NewWorkflow, NewWorkflowStep, WorkflowMembership, WorkflowRecord,
    WorkflowStepRecord, WorkflowStore,
};
use tracing::{debug, info, warn};

use crate::AnalysisError;
use crate::traversal::{TraversalEngine, TraversalStep};

/// Result of rebuilding the workflow catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeOutcome {
    pub workflows: Vec<WorkflowRecord>,
    pub skipped: Vec<SkippedRoot>,
    pub fingerprint: String,
}

/// A root left out of the catalog because its traversal failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRoot {
    pub entry_point: String,
    pub service: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowFreshness {
    Fresh,
    Stale { reason: String },
}

impl WorkflowFreshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// A stored workflow with its steps. `highlighted` lists the step orders
/// at which a queried function appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowView {
    pub workflow: WorkflowRecord,
    pub steps: Vec<WorkflowStepRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub highlighted: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowDetails {
    pub function: String,
    /// True when `function` starts one of the returned workflows.
    pub entry_point: bool,
    pub workflows: Vec<WorkflowView>,
}

/// Coarse business category of a workflow, derived from its entry point.
pub fn workflow_type_for(entry_point: &str) -> &'static str {
    let name = entry_point.to_lowercase();
    if name.contains("institutional") {
        "institutional"
    } else if name.contains("algo") {
        "algo"
    } else if name.contains("retail") || name == "place_order" {
        "retail"
    } else {
        "common"
    }
}

/// Precomputes root-to-leaf routes so RCA lookups need no traversal.
pub struct WorkflowMaterializer {
    traversal: TraversalConfig,
    workflows: WorkflowConfig,
}

impl WorkflowMaterializer {
    pub fn new(config: &TracelinkConfig) -> Self {
        Self {
            traversal: config.traversal.clone(),
            workflows: config.workflows.clone(),
        }
    }

    /// Drops the catalog and rebuilds one workflow per root.
    pub fn materialize<S>(&self, store: &S) -> Result<MaterializeOutcome, AnalysisError>
    where
        S: GraphStore + WorkflowStore + ?Sized,
    {
        let engine = TraversalEngine::load(store, &self.traversal)?;
        let fingerprint = engine.fingerprint().to_owned();

        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for root in engine.roots() {
            if !self.workflows.entry_services.is_empty()
                && !self.workflows.entry_services.contains(&root.service)
            {
                debug!(root = %root.qualified_name(), "root outside entry services");
                continue;
            }

            match engine.unbounded_forward(root.id) {
                Ok(steps) => pending.extend(self.build(&steps, &fingerprint)),
                Err(AnalysisError::CycleDetected { path }) => {
                    warn!(root = %root.qualified_name(), %path, "skipping cyclic workflow root");
                    skipped.push(SkippedRoot {
                        entry_point: root.name.clone(),
                        service: root.service.clone(),
                        reason: format!("call cycle detected: {path}"),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let ids = store.replace_workflows(&pending)?;
        let mut workflows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = store.workflow(id)? {
                workflows.push(record);
            }
        }

        info!(
            workflows = workflows.len(),
            skipped = skipped.len(),
            fingerprint = %fingerprint,
            "materialized workflows"
        );
        Ok(MaterializeOutcome {
            workflows,
            skipped,
            fingerprint,
        })
    }

    /// Checks a stored workflow against the live call graph.
    pub fn verify<S>(&self, store: &S, workflow_id: i64) -> Result<WorkflowFreshness, AnalysisError>
    where
        S: GraphStore + WorkflowStore + ?Sized,
    {
        let record = store
            .workflow(workflow_id)?
            .ok_or_else(|| AnalysisError::NotFound(format!("workflow {workflow_id}")))?;
        let engine = TraversalEngine::load(store, &self.traversal)?;

        if engine.fingerprint() != record.graph_fingerprint {
            return Ok(WorkflowFreshness::Stale {
                reason: "call graph changed since materialization".to_owned(),
            });
        }
        if engine
            .node(record.entry_node_id)
            .is_none_or(|node| node.name != record.entry_point)
        {
            return Ok(WorkflowFreshness::Stale {
                reason: format!("entry point {} no longer exists", record.entry_point),
            });
        }

        let live = match engine.unbounded_forward(record.entry_node_id) {
            Ok(steps) => steps
                .into_iter()
                .map(|step| step.node.name)
                .collect::<Vec<_>>(),
            Err(AnalysisError::CycleDetected { path }) => {
                return Ok(WorkflowFreshness::Stale {
                    reason: format!("call cycle detected: {path}"),
                });
            }
            Err(err) => return Err(err),
        };
        if live != record.route {
            return Ok(WorkflowFreshness::Stale {
                reason: format!(
                    "route has {} steps, live traversal has {}",
                    record.route.len(),
                    live.len()
                ),
            });
        }

        Ok(WorkflowFreshness::Fresh)
    }

    pub fn list_workflows<S: WorkflowStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<Vec<WorkflowRecord>, AnalysisError> {
        store.workflows().map_err(Into::into)
    }

    pub fn workflows_for_function<S: WorkflowStore + ?Sized>(
        &self,
        store: &S,
        function: &str,
    ) -> Result<Vec<WorkflowMembership>, AnalysisError> {
        store.workflows_containing(function).map_err(Into::into)
    }

    /// Workflows touching `service`, longest first.
    pub fn workflows_for_service<S: WorkflowStore + ?Sized>(
        &self,
        store: &S,
        service: &str,
    ) -> Result<Vec<WorkflowRecord>, AnalysisError> {
        store.workflows_involving_service(service).map_err(Into::into)
    }

    /// The workflow `function` starts, or every workflow that passes through it.
    pub fn workflow_details<S: WorkflowStore + ?Sized>(
        &self,
        store: &S,
        function: &str,
    ) -> Result<WorkflowDetails, AnalysisError> {
        let function = function.trim();
        let entries = store.workflows_by_entry(function)?;
        let entry_point = !entries.is_empty();

        let records = if entry_point {
            entries
        } else {
            let mut seen = BTreeSet::new();
            store
                .workflows_containing(function)?
                .into_iter()
                .map(|membership| membership.workflow)
                .filter(|workflow| seen.insert(workflow.workflow_id))
                .collect()
        };
        if records.is_empty() {
            return Err(AnalysisError::NotFound(format!(
                "no workflow contains '{function}'"
            )));
        }

        let mut workflows = Vec::with_capacity(records.len());
        for workflow in records {
            let steps = store.workflow_steps(workflow.workflow_id)?;
            let highlighted = steps
                .iter()
                .filter(|step| step.function_name == function)
                .map(|step| step.step_order)
                .collect();
            workflows.push(WorkflowView {
                workflow,
                steps,
                highlighted,
            });
        }

        Ok(WorkflowDetails {
            function: function.to_owned(),
            entry_point,
            workflows,
        })
    }

    fn build(&self, traversal: &[TraversalStep], fingerprint: &str) -> Option<NewWorkflow> {
        let root = traversal.first()?.node.clone();

        let steps = traversal
            .iter()
            .map(|step| NewWorkflowStep {
                function_name: step.node.name.clone(),
                node_id: step.node.id,
                service: step.node.service.clone(),
                depth: step.depth.unsigned_abs(),
                sort_key: step.sort_key.clone(),
                summary: step.node.summary.trim().to_owned(),
                contract: extract_data_contract(&step.node),
            })
            .collect::<Vec<_>>();
        let services = steps
            .iter()
            .map(|step| step.service.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let summary = summarize(
            &root.name,
            &steps,
            &services,
            self.workflows.summary_steps as usize,
        );

        Some(NewWorkflow {
            entry_point: root.name.clone(),
            entry_node_id: root.id,
            endpoint: root.endpoint(),
            workflow_type: workflow_type_for(&root.name).to_owned(),
            route: steps.iter().map(|step| step.function_name.clone()).collect(),
            summary,
            services,
            graph_fingerprint: fingerprint.to_owned(),
            steps,
        })
    }
}

fn summarize(entry: &str, steps: &[NewWorkflowStep], services: &[String], limit: usize) -> String {
    let summaries = steps
        .iter()
        .map(|step| step.summary.trim())
        .filter(|summary| !summary.is_empty())
        .collect::<Vec<_>>();
    if summaries.is_empty() {
        return format!("Workflow with {} steps", steps.len());
    }

    let mut summary = format!(
        "Workflow '{entry}': {}",
        summaries
            .iter()
            .take(limit)
            .copied()
            .collect::<Vec<_>>()
            .join(" → ")
    );
    if summaries.len() > limit {
        summary.push_str(&format!(" ... and {} more steps", summaries.len() - limit));
    }
    summary.push_str(&format!(
        ". Involves {} service(s): {}",
        services.len(),
        services.join(", ")
    ));
    summary
}
