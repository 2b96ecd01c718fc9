use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracelink_config::TraversalConfig;
use tracelink_core::{
    CodeKind, CodeNode, CodeNodeId, Direction, LogEvent, LogEventId, RelationshipType, Severity,
};
use tracelink_store::{GraphStore, LogEventFilter, TraceChainReport};
use tracing::{debug, warn};

use crate::AnalysisError;
use crate::traversal::{NodeSelector, TraversalEngine};

/// A function linked to a trace through `executed_in`, with the number of
/// trace events it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedFunction {
    pub name: String,
    pub service: String,
    pub kind: CodeKind,
    pub log_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorLink {
    pub function: String,
    pub service: String,
    pub event_id: LogEventId,
    pub timestamp: DateTime<Utc>,
    pub level: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceTransition {
    pub from: String,
    pub to: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceReport {
    pub trace_id: String,
    pub events: Vec<LogEvent>,
    pub functions: Vec<ExecutedFunction>,
    pub errors: Vec<ErrorLink>,
    pub executed_in: usize,
    pub logged_error: usize,
    pub next_log: usize,
    pub unique_functions: usize,
    /// Share of trace events carrying an `executed_in` edge, in percent.
    pub coverage: f64,
    pub transitions: Vec<ServiceTransition>,
    pub chain: TraceChainReport,
}

/// Call path from an API entry point down to a function blamed for a
/// failing event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailurePath {
    pub event_id: LogEventId,
    pub message: String,
    pub function: String,
    pub service: String,
    pub via: RelationshipType,
    pub root: Option<String>,
    pub endpoint: Option<String>,
    pub route: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub events: usize,
    pub errors: usize,
    pub services: Vec<String>,
}

/// Read-only RCA views over one trace and its linked code.
pub struct TraceAnalyzer {
    traversal: TraversalConfig,
}

impl TraceAnalyzer {
    pub fn new(traversal: &TraversalConfig) -> Self {
        Self {
            traversal: traversal.clone(),
        }
    }

    pub fn analyze<S: GraphStore + ?Sized>(
        &self,
        store: &S,
        trace_id: &str,
    ) -> Result<TraceReport, AnalysisError> {
        let trace_id = trace_id.trim();
        let events = trace_events(store, trace_id)?;
        let mut nodes = NodeCache::default();

        let mut executed = BTreeMap::<CodeNodeId, usize>::new();
        let mut errors = Vec::new();
        let mut executed_in = 0usize;
        let mut logged_error = 0usize;
        let mut next_log = 0usize;
        let mut transitions = BTreeMap::<(String, String), usize>::new();
        let services = events
            .iter()
            .map(|event| (event.id, event.service.as_str()))
            .collect::<BTreeMap<_, _>>();

        for event in &events {
            for edge in store.edges(
                event.node_ref(),
                Direction::Incoming,
                &[RelationshipType::ExecutedIn, RelationshipType::LoggedError],
            )? {
                let Some(node) = nodes.get(store, edge.from.id)? else {
                    continue;
                };
                match edge.kind {
                    RelationshipType::ExecutedIn => {
                        executed_in += 1;
                        *executed.entry(node.id).or_default() += 1;
                    }
                    _ => {
                        logged_error += 1;
                        errors.push(ErrorLink {
                            function: node.name.clone(),
                            service: node.service.clone(),
                            event_id: event.id,
                            timestamp: event.timestamp,
                            level: event.level,
                            message: event.message.clone(),
                            error_code: event.error_code().map(str::to_owned),
                        });
                    }
                }
            }

            for edge in store.edges(
                event.node_ref(),
                Direction::Incoming,
                &[RelationshipType::NextLog],
            )? {
                next_log += 1;
                if let Some(from) = services.get(&edge.from.id)
                    && *from != event.service
                {
                    *transitions
                        .entry(((*from).to_owned(), event.service.clone()))
                        .or_default() += 1;
                }
            }
        }

        let mut functions = executed
            .into_iter()
            .filter_map(|(id, log_count)| {
                nodes.cached(id).map(|node| ExecutedFunction {
                    name: node.name.clone(),
                    service: node.service.clone(),
                    kind: node.kind,
                    log_count,
                })
            })
            .collect::<Vec<_>>();
        functions.sort_by(|left, right| {
            left.service
                .cmp(&right.service)
                .then_with(|| left.name.cmp(&right.name))
        });
        let unique_functions = functions
            .iter()
            .map(|function| function.name.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        let mut transitions = transitions
            .into_iter()
            .map(|((from, to), count)| ServiceTransition { from, to, count })
            .collect::<Vec<_>>();
        transitions.sort_by(|left, right| right.count.cmp(&left.count));

        let coverage = if events.is_empty() {
            0.0
        } else {
            executed_in as f64 / events.len() as f64 * 100.0
        };
        let chain = store.check_trace_chain(trace_id)?;
        if !chain.is_valid() {
            warn!(trace_id, problems = chain.problems.len(), "trace chain is broken");
        }

        Ok(TraceReport {
            trace_id: trace_id.to_owned(),
            events,
            functions,
            errors,
            executed_in,
            logged_error,
            next_log,
            unique_functions,
            coverage,
            transitions,
            chain,
        })
    }

    /// Root-to-failure call paths for every function blamed by the trace.
    /// `logged_error` evidence wins; `executed_in` on error events is the
    /// fallback when no pattern matched.
    pub fn failure_paths<S: GraphStore + ?Sized>(
        &self,
        store: &S,
        trace_id: &str,
    ) -> Result<Vec<FailurePath>, AnalysisError> {
        let events = trace_events(store, trace_id)?;

        let mut blamed = Vec::<(&LogEvent, CodeNodeId, RelationshipType)>::new();
        for event in &events {
            let edges = store.edges(
                event.node_ref(),
                Direction::Incoming,
                &[RelationshipType::LoggedError],
            )?;
            blamed.extend(
                edges
                    .iter()
                    .map(|edge| (event, edge.from.id, RelationshipType::LoggedError)),
            );
        }
        if blamed.is_empty() {
            for event in events.iter().filter(|event| event.has_error_signal()) {
                let edges = store.edges(
                    event.node_ref(),
                    Direction::Incoming,
                    &[RelationshipType::ExecutedIn],
                )?;
                blamed.extend(
                    edges
                        .iter()
                        .map(|edge| (event, edge.from.id, RelationshipType::ExecutedIn)),
                );
            }
        }
        if blamed.is_empty() {
            debug!(trace_id, "no failing function linked to trace");
            return Ok(Vec::new());
        }

        let engine = TraversalEngine::load(store, &self.traversal)?;
        let mut paths = Vec::new();
        for (event, node_id, via) in blamed {
            let Some(node) = engine.node(node_id) else {
                continue;
            };
            let ancestors = match engine.roots_of(&NodeSelector::Id(node_id)) {
                Ok(ancestors) => ancestors,
                Err(AnalysisError::CycleDetected { path }) => {
                    warn!(function = %node.qualified_name(), %path, "cycle above failing function");
                    Vec::new()
                }
                Err(err) => return Err(err),
            };

            let failure = |root: Option<String>, endpoint: Option<String>, route: Vec<String>| {
                FailurePath {
                    event_id: event.id,
                    message: event.message.clone(),
                    function: node.name.clone(),
                    service: node.service.clone(),
                    via,
                    root,
                    endpoint,
                    route,
                }
            };
            if ancestors.is_empty() {
                paths.push(failure(None, None, vec![node.name.clone()]));
            }
            for ancestor in ancestors {
                paths.push(failure(
                    Some(ancestor.node.name),
                    ancestor.endpoint,
                    ancestor.route,
                ));
            }
        }

        Ok(paths)
    }

    /// Every stored trace, most recent first.
    pub fn list_traces<S: GraphStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<Vec<TraceSummary>, AnalysisError> {
        let mut traces = BTreeMap::<String, TraceSummary>::new();
        let mut services = BTreeMap::<String, BTreeSet<String>>::new();
        for event in store.log_events(&LogEventFilter::default())? {
            services
                .entry(event.trace_id.clone())
                .or_default()
                .insert(event.service.clone());
            let summary = traces
                .entry(event.trace_id.clone())
                .or_insert_with(|| TraceSummary {
                    trace_id: event.trace_id.clone(),
                    first: event.timestamp,
                    last: event.timestamp,
                    events: 0,
                    errors: 0,
                    services: Vec::new(),
                });
            summary.first = summary.first.min(event.timestamp);
            summary.last = summary.last.max(event.timestamp);
            summary.events += 1;
            if event.has_error_signal() {
                summary.errors += 1;
            }
        }

        let mut summaries = traces
            .into_values()
            .map(|mut summary| {
                summary.services = services
                    .remove(&summary.trace_id)
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                summary
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|left, right| {
            right
                .first
                .cmp(&left.first)
                .then_with(|| left.trace_id.cmp(&right.trace_id))
        });
        Ok(summaries)
    }
}

fn trace_events<S: GraphStore + ?Sized>(
    store: &S,
    trace_id: &str,
) -> Result<Vec<LogEvent>, AnalysisError> {
    let trace_id = trace_id.trim();
    let events = store.log_events(&LogEventFilter::trace(trace_id))?;
    if events.is_empty() {
        return Err(AnalysisError::NotFound(format!("trace {trace_id}")));
    }
    Ok(events)
}

#[derive(Default)]
struct NodeCache {
    nodes: BTreeMap<CodeNodeId, Option<CodeNode>>,
}

impl NodeCache {
    fn get<S: GraphStore + ?Sized>(
        &mut self,
        store: &S,
        id: CodeNodeId,
    ) -> Result<Option<&CodeNode>, AnalysisError> {
        if !self.nodes.contains_key(&id) {
            let node = store.code_node(id)?;
            self.nodes.insert(id, node);
        }
        Ok(self.cached(id))
    }

    fn cached(&self, id: CodeNodeId) -> Option<&CodeNode> {
        self.nodes.get(&id).and_then(Option::as_ref)
    }
}
