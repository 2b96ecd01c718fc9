use std::collections::{BTreeMap, BTreeSet, HashSet};

use regex::Regex;
use serde::Serialize;
use tracelink_config::{ErrorPattern, LinkerConfig, ServiceContextScope};
use tracelink_core::{CodeNode, CodeNodeId, LogEvent, LogEventId, NodeRef, RelationshipType};
use tracelink_store::{CodeNodeFilter, GraphStore, LogEventFilter, NewRelationship};
use tracing::{debug, info, warn};

use crate::AnalysisError;

/// Counts produced by one linker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub batch_id: String,
    pub executed_in: usize,
    pub logged_error: usize,
    pub service_context: usize,
    /// Events where several code names matched and the tie-break picked one.
    pub tie_breaks: usize,
    pub unmatched_events: usize,
    pub service_context_ran: bool,
}

impl LinkOutcome {
    pub fn total(&self) -> usize {
        self.executed_in + self.logged_error + self.service_context
    }
}

enum Matcher {
    Substring(String),
    Regex(Regex),
}

struct CompiledPattern {
    matcher: Matcher,
    function: String,
}

impl CompiledPattern {
    fn compile(pattern: &ErrorPattern) -> Option<Self> {
        let text = pattern.pattern.trim();
        let function = pattern.function.trim();
        if text.is_empty() || function.is_empty() {
            warn!(pattern = %pattern.pattern, "ignoring empty error pattern");
            return None;
        }

        let matcher = if pattern.regex {
            match Regex::new(text) {
                Ok(regex) => Matcher::Regex(regex),
                Err(err) => {
                    warn!(pattern = text, error = %err, "ignoring invalid error pattern regex");
                    return None;
                }
            }
        } else {
            Matcher::Substring(text.to_owned())
        };

        Some(Self {
            matcher,
            function: function.to_owned(),
        })
    }

    fn matches(&self, message: &str) -> bool {
        match &self.matcher {
            Matcher::Substring(text) => message.contains(text.as_str()),
            Matcher::Regex(regex) => regex.is_match(message),
        }
    }
}

/// Attaches runtime log events to the code nodes believed to have emitted
/// them. Every run replaces all link edges in the store.
pub struct Linker {
    config: LinkerConfig,
    patterns: Vec<CompiledPattern>,
}

impl Linker {
    pub fn new(config: &LinkerConfig) -> Self {
        let patterns = if config.error_matching {
            config
                .error_patterns
                .iter()
                .filter_map(CompiledPattern::compile)
                .collect()
        } else {
            Vec::new()
        };
        Self {
            config: config.clone(),
            patterns,
        }
    }

    pub fn link<S: GraphStore + ?Sized>(
        &self,
        store: &S,
        batch_id: &str,
    ) -> Result<LinkOutcome, AnalysisError> {
        let nodes = store
            .code_nodes(&CodeNodeFilter::default())?
            .into_iter()
            .filter(|node| node.kind.is_executable())
            .collect::<Vec<_>>();
        let events = store.log_events(&LogEventFilter::default())?;

        let mut outcome = LinkOutcome {
            batch_id: batch_id.to_owned(),
            ..LinkOutcome::default()
        };
        let mut links = BTreeSet::<(RelationshipType, CodeNodeId, LogEventId)>::new();

        if self.config.name_matching {
            for event in &events {
                let candidates = name_candidates(&nodes, event);
                if candidates.len() > 1 {
                    outcome.tie_breaks += 1;
                }
                match candidates.first() {
                    Some(node) => {
                        if candidates.len() > 1 {
                            debug!(
                                event = event.id,
                                chosen = %node.qualified_name(),
                                candidates = candidates.len(),
                                "resolved ambiguous name match"
                            );
                        }
                        links.insert((RelationshipType::ExecutedIn, node.id, event.id));
                    }
                    None => outcome.unmatched_events += 1,
                }
            }
        }

        for event in events.iter().filter(|event| event.has_error_signal()) {
            for pattern in self.patterns.iter().filter(|pattern| pattern.matches(&event.message)) {
                if let Some(node) = pattern_target(&nodes, &pattern.function, &event.service) {
                    links.insert((RelationshipType::LoggedError, node.id, event.id));
                }
            }
        }

        if self.config.service_context.enabled {
            outcome.service_context_ran = true;
            for (node_id, event_id) in self.service_context(&nodes, &events, &links) {
                links.insert((RelationshipType::ServiceContext, node_id, event_id));
            }
        }

        let edges = links
            .iter()
            .map(|(kind, node_id, event_id)| {
                match kind {
                    RelationshipType::ExecutedIn => outcome.executed_in += 1,
                    RelationshipType::LoggedError => outcome.logged_error += 1,
                    _ => outcome.service_context += 1,
                }
                NewRelationship::new(*kind, NodeRef::code(*node_id), NodeRef::log(*event_id))
                    .with_description(describe_link(*kind))
            })
            .collect::<Vec<_>>();
        store.replace_link_edges(batch_id, &edges)?;

        info!(
            batch_id,
            executed_in = outcome.executed_in,
            logged_error = outcome.logged_error,
            service_context = outcome.service_context,
            tie_breaks = outcome.tie_breaks,
            "linked code to logs"
        );
        Ok(outcome)
    }

    /// Nodes without direct evidence in their own service get advisory
    /// edges to that service's earliest events. In trace scope both the
    /// evidence test and the event window are per trace.
    fn service_context(
        &self,
        nodes: &[CodeNode],
        events: &[LogEvent],
        links: &BTreeSet<(RelationshipType, CodeNodeId, LogEventId)>,
    ) -> Vec<(CodeNodeId, LogEventId)> {
        let scope = self.config.service_context.scope;
        let group_of = |event: &LogEvent| -> String {
            match scope {
                ServiceContextScope::Batch => String::new(),
                ServiceContextScope::Trace => event.trace_id.clone(),
            }
        };

        let event_index = events
            .iter()
            .map(|event| (event.id, event))
            .collect::<BTreeMap<_, _>>();
        let node_services = nodes
            .iter()
            .map(|node| (node.id, node.service.as_str()))
            .collect::<BTreeMap<_, _>>();
        let evidenced = links
            .iter()
            .filter_map(|(_, node_id, event_id)| {
                let event = event_index.get(event_id)?;
                let service = node_services.get(node_id)?;
                (event.service == *service).then(|| (*node_id, group_of(event)))
            })
            .collect::<HashSet<_>>();

        let limit = match self.config.service_context.max_events_per_node {
            0 => usize::MAX,
            limit => limit as usize,
        };

        // Events arrive ordered by timestamp, then insertion order.
        let mut windows = BTreeMap::<(&str, String), Vec<LogEventId>>::new();
        for event in events {
            let window = windows
                .entry((event.service.as_str(), group_of(event)))
                .or_default();
            if window.len() < limit {
                window.push(event.id);
            }
        }

        let mut pairs = Vec::new();
        for node in nodes {
            for ((service, group), window) in &windows {
                if *service != node.service || evidenced.contains(&(node.id, group.clone())) {
                    continue;
                }
                pairs.extend(window.iter().map(|event_id| (node.id, *event_id)));
            }
        }
        pairs
    }
}

/// Code nodes mentioned by `event`, best candidate first: same service,
/// longest name, shorter service name, lexical name, lowest id.
fn name_candidates<'a>(nodes: &'a [CodeNode], event: &LogEvent) -> Vec<&'a CodeNode> {
    let function_field = event
        .fields
        .function
        .as_deref()
        .map(str::trim)
        .filter(|function| !function.is_empty());

    let mut candidates = nodes
        .iter()
        .filter(|node| {
            function_field.is_some_and(|function| {
                function == node.name || function == node.short_name()
            }) || mentions(&event.message, node)
        })
        .collect::<Vec<_>>();

    if candidates.iter().any(|node| node.service == event.service) {
        candidates.retain(|node| node.service == event.service);
    }

    candidates.sort_by(|left, right| {
        right
            .name
            .len()
            .cmp(&left.name.len())
            .then_with(|| left.service.len().cmp(&right.service.len()))
            .then_with(|| left.name.cmp(&right.name))
            .then_with(|| left.id.cmp(&right.id))
    });
    candidates
}

/// Whole-token occurrence of the node name; dotted names fall back to their
/// final segment.
fn mentions(message: &str, node: &CodeNode) -> bool {
    contains_token(message, &node.name)
        || (node.name.contains('.') && contains_token(message, node.short_name()))
}

fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_identifier_char) && !after.is_some_and(is_identifier_char)
    })
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn pattern_target<'a>(nodes: &'a [CodeNode], function: &str, service: &str) -> Option<&'a CodeNode> {
    let mut named = nodes
        .iter()
        .filter(|node| node.name == function || node.short_name() == function)
        .collect::<Vec<_>>();
    named.sort_by(|left, right| {
        (left.service != service)
            .cmp(&(right.service != service))
            .then_with(|| left.service.len().cmp(&right.service.len()))
            .then_with(|| left.id.cmp(&right.id))
    });
    named.into_iter().next()
}

fn describe_link(kind: RelationshipType) -> &'static str {
    match kind {
        RelationshipType::ExecutedIn => "function named in log event",
        RelationshipType::LoggedError => "error pattern attributed to function",
        _ => "function in service context",
    }
}
