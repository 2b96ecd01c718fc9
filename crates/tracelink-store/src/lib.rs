use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracelink_core::{
    ApiExposure, CodeAttributes, CodeKind, CodeNode, CodeNodeId, DataContract, Direction, LogEvent,
    LogEventId, LogFields, ModelError, NodeRef, Relationship, RelationshipType, Severity,
    graph_fingerprint,
};

mod batch;
mod graph_sqlite;
mod workflow_sqlite;

pub use graph_sqlite::SqliteGraphStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Model(#[from] ModelError),
    #[error("store write lock poisoned")]
    LockPoisoned,
}

/// A code node as produced by a parser, addressed by its stable `key`
/// (usually `service::file::qualified_name`) until the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeNodeRecord {
    pub key: String,
    pub name: String,
    pub kind: CodeKind,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiExposure>,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "CodeAttributes::is_empty")]
    pub attributes: CodeAttributes,
}

/// Structural edge between two code nodes of the same batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEdgeRecord {
    pub from_key: String,
    pub to_key: String,
    pub kind: RelationshipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub description: String,
}

/// One complete code-parser run. Ingesting it replaces every stored code node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBatch {
    pub batch_id: String,
    #[serde(default)]
    pub nodes: Vec<CodeNodeRecord>,
    #[serde(default)]
    pub edges: Vec<CodeEdgeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEventRecord {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: Severity,
    pub trace_id: String,
    pub message: String,
    #[serde(default)]
    pub fields: LogFields,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NextLogRecord {
    pub from_key: String,
    pub to_key: String,
}

/// One log-parser run. `next_log` may be left empty, in which case the
/// temporal chain of every trace is derived from event timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    pub batch_id: String,
    #[serde(default)]
    pub events: Vec<LogEventRecord>,
    #[serde(default)]
    pub next_log: Vec<NextLogRecord>,
}

/// Edge between already stored nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRelationship {
    pub kind: RelationshipType,
    pub from: NodeRef,
    pub to: NodeRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl NewRelationship {
    pub fn new(kind: RelationshipType, from: NodeRef, to: NodeRef) -> Self {
        Self {
            kind,
            from,
            to,
            call_order: None,
            line: None,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeIngestOutcome {
    pub batch_id: String,
    pub nodes_written: usize,
    pub edges_written: usize,
    pub duplicate_edges: usize,
    pub replaced_nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogIngestOutcome {
    pub batch_id: String,
    pub events_written: usize,
    pub next_log_written: usize,
    pub traces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeNodeFilter {
    pub name: Option<String>,
    pub service: Option<String>,
    pub kind: Option<CodeKind>,
    pub api_exposed: Option<bool>,
    pub endpoint: Option<ApiExposure>,
}

impl CodeNodeFilter {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn in_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEventFilter {
    pub trace_id: Option<String>,
    pub service: Option<String>,
    pub batch_id: Option<String>,
    pub min_level: Option<Severity>,
}

impl LogEventFilter {
    pub fn trace(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeFilter {
    pub kinds: Vec<RelationshipType>,
    pub batch_id: Option<String>,
    pub node: Option<NodeRef>,
}

/// Result of checking that a trace's `next_log` edges form one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceChainReport {
    pub trace_id: String,
    pub events: usize,
    pub edges: usize,
    pub head: Option<LogEventId>,
    pub tail: Option<LogEventId>,
    pub problems: Vec<String>,
}

impl TraceChainReport {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: i64,
    pub entry_point: String,
    pub entry_node_id: CodeNodeId,
    pub endpoint: Option<String>,
    pub workflow_type: String,
    pub route: Vec<String>,
    pub summary: String,
    pub total_steps: u32,
    pub services: Vec<String>,
    pub graph_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStepRecord {
    pub workflow_id: i64,
    pub step_order: u32,
    pub function_name: String,
    pub node_id: CodeNodeId,
    pub service: String,
    pub depth: u32,
    pub sort_key: String,
    pub summary: String,
    pub contract: DataContract,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkflowStep {
    pub function_name: String,
    pub node_id: CodeNodeId,
    pub service: String,
    pub depth: u32,
    pub sort_key: String,
    pub summary: String,
    pub contract: DataContract,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkflow {
    pub entry_point: String,
    pub entry_node_id: CodeNodeId,
    pub endpoint: Option<String>,
    pub workflow_type: String,
    pub route: Vec<String>,
    pub summary: String,
    pub services: Vec<String>,
    pub graph_fingerprint: String,
    pub steps: Vec<NewWorkflowStep>,
}

/// A workflow together with the step at which a queried function appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowMembership {
    pub workflow: WorkflowRecord,
    pub step: WorkflowStepRecord,
}

pub trait GraphStore {
    fn ingest_code_batch(&self, batch: &CodeBatch) -> Result<CodeIngestOutcome, StoreError>;
    fn ingest_log_batch(&self, batch: &LogBatch) -> Result<LogIngestOutcome, StoreError>;

    /// Adds edges between stored nodes. `next_log` edges are rejected; they
    /// only come from log ingestion.
    fn create_edges(&self, batch_id: &str, edges: &[NewRelationship])
    -> Result<usize, StoreError>;

    /// Atomically swaps every linker-produced edge for `edges`.
    fn replace_link_edges(
        &self,
        batch_id: &str,
        edges: &[NewRelationship],
    ) -> Result<usize, StoreError>;

    fn delete_edges(&self, filter: &EdgeFilter) -> Result<usize, StoreError>;

    fn code_node(&self, id: CodeNodeId) -> Result<Option<CodeNode>, StoreError>;
    fn code_nodes(&self, filter: &CodeNodeFilter) -> Result<Vec<CodeNode>, StoreError>;
    fn log_event(&self, id: LogEventId) -> Result<Option<LogEvent>, StoreError>;

    /// Events ordered by timestamp, then insertion order.
    fn log_events(&self, filter: &LogEventFilter) -> Result<Vec<LogEvent>, StoreError>;

    /// Edges touching `node`. An empty `kinds` slice means every type.
    /// Ordered by call_order with unordered edges last, then by id.
    fn edges(
        &self,
        node: NodeRef,
        direction: Direction,
        kinds: &[RelationshipType],
    ) -> Result<Vec<Relationship>, StoreError>;

    fn edges_of_types(&self, kinds: &[RelationshipType]) -> Result<Vec<Relationship>, StoreError>;
    fn trace_ids(&self) -> Result<Vec<String>, StoreError>;
    fn clear(&self) -> Result<(), StoreError>;

    fn check_trace_chain(&self, trace_id: &str) -> Result<TraceChainReport, StoreError> {
        let events = self.log_events(&LogEventFilter::trace(trace_id))?;
        let ids = events.iter().map(|event| event.id).collect::<BTreeSet<_>>();

        let mut successors = BTreeMap::<LogEventId, Vec<LogEventId>>::new();
        let mut predecessors = BTreeMap::<LogEventId, Vec<LogEventId>>::new();
        let mut problems = Vec::new();
        let mut edge_count = 0usize;
        for event in &events {
            for edge in self.edges(
                event.node_ref(),
                Direction::Outgoing,
                &[RelationshipType::NextLog],
            )? {
                edge_count += 1;
                if !ids.contains(&edge.to.id) {
                    problems.push(format!(
                        "next_log {} -> {} leaves trace {trace_id}",
                        edge.from, edge.to
                    ));
                    continue;
                }
                successors.entry(edge.from.id).or_default().push(edge.to.id);
                predecessors.entry(edge.to.id).or_default().push(edge.from.id);
            }
        }

        for (id, next) in &successors {
            if next.len() > 1 {
                problems.push(format!("log:{id} has {} successors", next.len()));
            }
        }
        for (id, prev) in &predecessors {
            if prev.len() > 1 {
                problems.push(format!("log:{id} has {} predecessors", prev.len()));
            }
        }

        let heads = events
            .iter()
            .filter(|event| !predecessors.contains_key(&event.id))
            .map(|event| event.id)
            .collect::<Vec<_>>();
        let tails = events
            .iter()
            .filter(|event| !successors.contains_key(&event.id))
            .map(|event| event.id)
            .collect::<Vec<_>>();
        if !events.is_empty() && heads.len() != 1 {
            problems.push(format!("expected one chain head, found {}", heads.len()));
        }
        if !events.is_empty() && tails.len() != 1 {
            problems.push(format!("expected one chain tail, found {}", tails.len()));
        }
        if !events.is_empty() && edge_count + 1 != events.len() {
            problems.push(format!(
                "{} events joined by {edge_count} next_log edges",
                events.len()
            ));
        }

        let by_id = events
            .iter()
            .map(|event| (event.id, event))
            .collect::<BTreeMap<_, _>>();
        for (from, next) in &successors {
            for to in next {
                if let (Some(a), Some(b)) = (by_id.get(from), by_id.get(to))
                    && a.chronological_key() > b.chronological_key()
                {
                    problems.push(format!("next_log log:{from} -> log:{to} runs backwards in time"));
                }
            }
        }

        Ok(TraceChainReport {
            trace_id: trace_id.to_owned(),
            events: events.len(),
            edges: edge_count,
            head: heads.first().copied(),
            tail: tails.first().copied(),
            problems,
        })
    }

    /// Fingerprint of the current code structure, see [`graph_fingerprint`].
    fn call_graph_fingerprint(&self) -> Result<String, StoreError> {
        let nodes = self.code_nodes(&CodeNodeFilter::default())?;
        let edges = self.edges_of_types(&RelationshipType::CALL_TYPES)?;
        Ok(graph_fingerprint(&nodes, &edges))
    }
}

pub trait WorkflowStore {
    /// Clears the catalog and writes `workflows`, returning their new ids.
    fn replace_workflows(&self, workflows: &[NewWorkflow]) -> Result<Vec<i64>, StoreError>;
    fn workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError>;
    fn workflow(&self, workflow_id: i64) -> Result<Option<WorkflowRecord>, StoreError>;
    fn workflows_by_entry(&self, entry_point: &str) -> Result<Vec<WorkflowRecord>, StoreError>;
    fn workflow_steps(&self, workflow_id: i64) -> Result<Vec<WorkflowStepRecord>, StoreError>;
    fn workflows_containing(&self, function: &str)
    -> Result<Vec<WorkflowMembership>, StoreError>;
    fn workflows_involving_service(&self, service: &str)
    -> Result<Vec<WorkflowRecord>, StoreError>;
}

pub(crate) fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS code_nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            service TEXT NOT NULL,
            http_method TEXT,
            http_path TEXT,
            parameters TEXT NOT NULL DEFAULT '[]',
            summary TEXT NOT NULL DEFAULT '',
            snippet TEXT NOT NULL DEFAULT '',
            file_path TEXT NOT NULL DEFAULT '',
            attributes TEXT NOT NULL DEFAULT '{}',
            batch_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_code_nodes_name
            ON code_nodes(name);

        CREATE INDEX IF NOT EXISTS idx_code_nodes_service
            ON code_nodes(service, name);

        CREATE TABLE IF NOT EXISTS log_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_key TEXT NOT NULL UNIQUE,
            timestamp_us INTEGER NOT NULL,
            service TEXT NOT NULL,
            level TEXT NOT NULL,
            trace_id TEXT NOT NULL,
            message TEXT NOT NULL,
            error_code TEXT,
            error_type TEXT,
            duration_ms REAL,
            function_name TEXT,
            order_id TEXT,
            exception TEXT,
            batch_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_log_events_trace
            ON log_events(trace_id, timestamp_us, id);

        CREATE INDEX IF NOT EXISTS idx_log_events_service
            ON log_events(service, timestamp_us, id);

        CREATE TABLE IF NOT EXISTS relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rel_type TEXT NOT NULL,
            from_kind TEXT NOT NULL,
            from_id INTEGER NOT NULL,
            to_kind TEXT NOT NULL,
            to_id INTEGER NOT NULL,
            call_order INTEGER,
            line INTEGER,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            UNIQUE(from_kind, from_id, to_kind, to_id, rel_type)
        );

        CREATE INDEX IF NOT EXISTS idx_relationships_from
            ON relationships(from_kind, from_id, rel_type);

        CREATE INDEX IF NOT EXISTS idx_relationships_to
            ON relationships(to_kind, to_id, rel_type);

        CREATE TABLE IF NOT EXISTS workflow_catalog (
            workflow_id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_point_name TEXT NOT NULL,
            entry_node_id INTEGER NOT NULL,
            endpoint TEXT,
            workflow_type TEXT NOT NULL,
            full_route TEXT NOT NULL,
            workflow_summary TEXT NOT NULL,
            total_steps INTEGER NOT NULL,
            services_involved TEXT NOT NULL,
            graph_fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_functions (
            workflow_id INTEGER NOT NULL,
            step_order INTEGER NOT NULL,
            function_name TEXT NOT NULL,
            node_id INTEGER NOT NULL,
            service_name TEXT NOT NULL,
            depth INTEGER NOT NULL,
            sort_key TEXT NOT NULL,
            function_summary TEXT NOT NULL,
            data_contracts TEXT NOT NULL,
            PRIMARY KEY (workflow_id, step_order)
        );

        CREATE INDEX IF NOT EXISTS idx_workflow_functions_name
            ON workflow_functions(function_name);
        "#,
    )?;

    Ok(())
}
