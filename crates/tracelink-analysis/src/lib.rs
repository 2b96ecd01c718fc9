mod linker;
mod trace;
mod traversal;
mod workflow;

use thiserror::Error;
use tracelink_store::StoreError;

pub use linker::{LinkOutcome, Linker};
pub use trace::{
    ErrorLink, ExecutedFunction, FailurePath, ServiceTransition, TraceAnalyzer, TraceReport,
    TraceSummary,
};
pub use traversal::{
    CallChain, CallCycle, ClassifiedNode, NodeClass, NodeSelector, RootAncestor, TraversalEngine,
    TraversalStep,
};
pub use workflow::{
    MaterializeOutcome, SkippedRoot, WorkflowDetails, WorkflowFreshness, WorkflowMaterializer,
    WorkflowView, workflow_type_for,
};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no code node matches '{0}'")]
    NotFound(String),
    #[error("'{reference}' matches several code nodes: {}", .candidates.join(", "))]
    Ambiguous {
        reference: String,
        candidates: Vec<String>,
    },
    #[error("call cycle detected: {path}")]
    CycleDetected { path: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
